//! Security-policy pattern compilation.
//!
//! A pattern is `<serverGlob>:<toolGlob>` where each glob is a literal with
//! `*` matching any run of characters and `?` matching exactly one. Patterns
//! compile once into anchored, case-insensitive matchers.

use regex::Regex;

use crate::error::CoreError;

/// One compiled `server:tool` pattern.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    server: Regex,
    tool: Regex,
}

impl CompiledPattern {
    /// Compile a single pattern, naming `list` in the error on rejection.
    pub fn compile(list: &'static str, pattern: &str) -> Result<Self, CoreError> {
        let (server_glob, tool_glob) = pattern.split_once(':').ok_or_else(|| {
            CoreError::PolicyPattern {
                list,
                pattern: pattern.to_string(),
                reason: "expected '<server>:<tool>'".to_string(),
            }
        })?;
        if server_glob.is_empty() || tool_glob.is_empty() {
            return Err(CoreError::PolicyPattern {
                list,
                pattern: pattern.to_string(),
                reason: "both the server and tool halves are required".to_string(),
            });
        }
        Ok(Self {
            source: pattern.to_string(),
            server: glob_to_regex(server_glob),
            tool: glob_to_regex(tool_glob),
        })
    }

    pub fn matches(&self, upstream: &str, tool: &str) -> bool {
        self.server.is_match(upstream) && self.tool.is_match(tool)
    }

    /// The original pattern text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(glob: &str) -> Regex {
    let mut out = String::with_capacity(glob.len() + 8);
    out.push_str("(?i)^");
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    // Every metacharacter is escaped above, so this cannot fail.
    Regex::new(&out).unwrap()
}

/// Compile a whole list, stopping at the first bad pattern.
pub fn compile_list(
    list: &'static str,
    patterns: &[String],
) -> Result<Vec<CompiledPattern>, CoreError> {
    patterns
        .iter()
        .map(|p| CompiledPattern::compile(list, p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_case_insensitively() {
        let p = CompiledPattern::compile("allow", "fs:read_file").unwrap();
        assert!(p.matches("fs", "read_file"));
        assert!(p.matches("FS", "Read_File"));
        assert!(!p.matches("fs", "read_files"));
        assert!(!p.matches("fsx", "read_file"));
    }

    #[test]
    fn star_matches_any_run() {
        let p = CompiledPattern::compile("allow", "*:*").unwrap();
        assert!(p.matches("anything", "at_all"));
        assert!(p.matches("", ""));

        let p = CompiledPattern::compile("block", "fs:delete_*").unwrap();
        assert!(p.matches("fs", "delete_file"));
        assert!(p.matches("fs", "delete_"));
        assert!(!p.matches("fs", "remove_file"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let p = CompiledPattern::compile("allow", "db?:query").unwrap();
        assert!(p.matches("db1", "query"));
        assert!(!p.matches("db", "query"));
        assert!(!p.matches("db12", "query"));
    }

    #[test]
    fn regex_metachars_are_literal() {
        let p = CompiledPattern::compile("allow", "a.b:c+d").unwrap();
        assert!(p.matches("a.b", "c+d"));
        assert!(!p.matches("axb", "ccd"));
    }

    #[test]
    fn missing_half_is_rejected_naming_list_and_pattern() {
        let err = CompiledPattern::compile("confirm", "just_a_tool").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("confirm"));
        assert!(msg.contains("just_a_tool"));

        assert!(CompiledPattern::compile("allow", ":tool").is_err());
        assert!(CompiledPattern::compile("allow", "server:").is_err());
    }

    #[test]
    fn compile_recognize_identity_on_accepted_patterns() {
        for src in ["*:*", "fs:read_?", "a-b:c_d", "x*:y*z"] {
            let p = CompiledPattern::compile("allow", src).unwrap();
            assert_eq!(p.source(), src);
        }
    }
}
