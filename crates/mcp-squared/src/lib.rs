//! Core types for the mcp-squared meta-broker.
//!
//! mcp-squared sits between agentic clients and a fleet of upstream MCP
//! servers. Instead of advertising every upstream tool, it exposes a compact
//! set of meta-tools backed by a searchable catalog. This crate holds the
//! protocol-agnostic pieces: the configuration model, qualified tool naming,
//! the security policy engine, and the sanitizer applied to upstream text.
//! The runtime (cataloger, index, sessions, daemon) lives in the broker
//! crate.

/// Configuration model, discovery and schema migration.
pub mod config;

/// Typed errors with stable codes.
pub mod error;

/// Qualified `upstream:tool` naming rules.
pub mod naming;

/// Allow/block/confirm policy and confirmation tokens.
pub mod policy;

/// Hardening of upstream-supplied tool text.
pub mod sanitize;

pub use config::Config;
pub use error::CoreError;
