//! Security policy engine.
//!
//! Every `execute` call is scored against three ordered pattern lists:
//! block wins over a valid confirmation token, which wins over the confirm
//! list, which wins over allow. Anything unmatched is blocked.

mod confirmation;
mod pattern;

pub use confirmation::{Clock, ConfirmationStore, DEFAULT_TOKEN_TTL, SystemClock};
pub use pattern::CompiledPattern;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Raw pattern lists as they appear in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub confirm: Vec<String>,
}

impl SecurityPolicy {
    /// The default posture when no security section is configured:
    /// everything requires confirmation.
    pub fn hardened() -> Self {
        Self {
            allow: vec![],
            block: vec![],
            confirm: vec!["*:*".to_string()],
        }
    }

    /// Opt-in posture: everything is allowed outright.
    pub fn permissive() -> Self {
        Self {
            allow: vec!["*:*".to_string()],
            block: vec![],
            confirm: vec![],
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block { reason: String },
    Confirm { token: String, reason: String },
}

/// Cheap visibility answer used by `find_tools` filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub visible: bool,
    pub requires_confirmation: bool,
}

/// Compiled policy plus the live confirmation records.
#[derive(Debug)]
pub struct PolicyEngine {
    allow: Vec<CompiledPattern>,
    block: Vec<CompiledPattern>,
    confirm: Vec<CompiledPattern>,
    confirmations: Arc<ConfirmationStore>,
}

impl PolicyEngine {
    pub fn compile(policy: &SecurityPolicy, token_ttl: Duration) -> Result<Self, CoreError> {
        Self::compile_with_store(policy, Arc::new(ConfirmationStore::new(token_ttl)))
    }

    pub fn compile_with_store(
        policy: &SecurityPolicy,
        confirmations: Arc<ConfirmationStore>,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            allow: pattern::compile_list("allow", &policy.allow)?,
            block: pattern::compile_list("block", &policy.block)?,
            confirm: pattern::compile_list("confirm", &policy.confirm)?,
            confirmations,
        })
    }

    /// Decide whether `(upstream, tool)` may execute.
    ///
    /// `tool` may arrive bare or qualified; a qualifier is stripped before
    /// matching so the decision is identical either way.
    pub fn evaluate(&self, upstream: &str, tool: &str, token: Option<&str>) -> Decision {
        let bare = normalize(upstream, tool);

        if matches_any(&self.block, upstream, bare) {
            return Decision::Block {
                reason: "blocked by security policy".to_string(),
            };
        }

        if let Some(token) = token
            && self.confirmations.validate(token, upstream, bare)
        {
            return Decision::Allow;
        }

        if matches_any(&self.confirm, upstream, bare) {
            return Decision::Confirm {
                token: self.confirmations.mint(upstream, bare),
                reason: "requires confirmation".to_string(),
            };
        }

        if matches_any(&self.allow, upstream, bare) {
            return Decision::Allow;
        }

        Decision::Block {
            reason: "not in allow list".to_string(),
        }
    }

    /// Visibility for catalog listings: blocked and unmatched tools are
    /// hidden, confirm-listed tools are flagged.
    pub fn visibility(&self, upstream: &str, tool: &str) -> Visibility {
        let bare = normalize(upstream, tool);
        if matches_any(&self.block, upstream, bare) {
            return Visibility {
                visible: false,
                requires_confirmation: false,
            };
        }
        if matches_any(&self.confirm, upstream, bare) {
            return Visibility {
                visible: true,
                requires_confirmation: true,
            };
        }
        if matches_any(&self.allow, upstream, bare) {
            return Visibility {
                visible: true,
                requires_confirmation: false,
            };
        }
        Visibility {
            visible: false,
            requires_confirmation: false,
        }
    }

    /// Shared handle to the confirmation records (for TTL sweeps and
    /// `clear_selection_cache`-style resets).
    pub fn confirmations(&self) -> Arc<ConfirmationStore> {
        self.confirmations.clone()
    }
}

/// Strip a matching upstream qualifier so `fs:read` and `read` score alike.
/// A qualifier naming a *different* upstream is left intact: it will simply
/// never match and falls through to the default block.
fn normalize<'a>(upstream: &str, tool: &'a str) -> &'a str {
    match tool.split_once(':') {
        Some((prefix, rest)) if prefix == upstream => rest,
        _ => tool,
    }
}

fn matches_any(patterns: &[CompiledPattern], upstream: &str, tool: &str) -> bool {
    patterns.iter().any(|p| p.matches(upstream, tool))
}
