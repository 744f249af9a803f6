//! Qualified tool names.
//!
//! A tool is identified by the pair `(upstream key, tool name)`. The display
//! form is `upstream:tool`; parsing splits on the *first* colon so tool names
//! may themselves contain colons.

use std::fmt;

/// A tool name that may or may not carry an upstream qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ToolName {
    /// `tool` with no upstream qualifier.
    Bare(String),
    /// `upstream:tool`.
    Qualified { upstream: String, tool: String },
}

impl ToolName {
    /// Parse a name, splitting on the first colon.
    ///
    /// An empty upstream half (`":read"`) is treated as bare to avoid
    /// manufacturing an unusable qualifier.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((upstream, tool)) if !upstream.is_empty() => ToolName::Qualified {
                upstream: upstream.to_string(),
                tool: tool.to_string(),
            },
            _ => ToolName::Bare(name.trim_start_matches(':').to_string()),
        }
    }

    /// The tool half, regardless of qualification.
    pub fn bare(&self) -> &str {
        match self {
            ToolName::Bare(t) => t,
            ToolName::Qualified { tool, .. } => tool,
        }
    }

    /// The upstream half, when present.
    pub fn upstream(&self) -> Option<&str> {
        match self {
            ToolName::Bare(_) => None,
            ToolName::Qualified { upstream, .. } => Some(upstream),
        }
    }
}

/// Format the canonical qualified display form.
pub fn qualified(upstream: &str, tool: &str) -> String {
    format!("{upstream}:{tool}")
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolName::Bare(t) => write!(f, "{t}"),
            ToolName::Qualified { upstream, tool } => write!(f, "{upstream}:{tool}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare() {
        assert_eq!(ToolName::parse("read_file"), ToolName::Bare("read_file".into()));
    }

    #[test]
    fn parse_qualified_splits_on_first_colon() {
        let name = ToolName::parse("fs:read:ranged");
        assert_eq!(
            name,
            ToolName::Qualified {
                upstream: "fs".into(),
                tool: "read:ranged".into()
            }
        );
        assert_eq!(name.bare(), "read:ranged");
        assert_eq!(name.upstream(), Some("fs"));
    }

    #[test]
    fn leading_colon_is_bare() {
        assert_eq!(ToolName::parse(":read"), ToolName::Bare("read".into()));
    }

    #[test]
    fn display_round_trips() {
        let name = ToolName::parse("fs:read_file");
        assert_eq!(name.to_string(), "fs:read_file");
        assert_eq!(qualified("fs", "read_file"), "fs:read_file");
    }
}
