//! Hardening for upstream-supplied tool text.
//!
//! Tool names and descriptions arrive from arbitrary MCP servers and end up
//! inside a model prompt. Everything passes through here before it is indexed
//! or advertised.

use once_cell::sync::Lazy;
use regex::Regex;

/// Default cap applied to descriptions.
pub const DEFAULT_DESCRIPTION_CAP: usize = 2000;

/// Hard cap on tool name length.
pub const TOOL_NAME_CAP: usize = 256;

static INJECTION_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Role manipulation / instruction override
        r"(?i)ignore\s+(all\s+)?previous\s+instructions",
        r"(?i)disregard\s+(all\s+)?prior\s+instructions",
        r"(?i)you\s+are\s+now\s+(a|an|the)\s",
        // Fake conversation structure
        r"(?i)</?\s*system\s*>",
        r"(?i)</?\s*assistant\s*>",
        r"(?i)\[\s*system\s*\]",
        r"(?i)\bsystem\s*prompt\s*:",
        // Jailbreak personas
        r"(?i)\bdeveloper\s+mode\b",
        r"(?i)\bDAN\s+mode\b",
        // Encoded payload markers
        r"(?i)\bbase64\s*:",
        r"(?i)decode\s+the\s+following\s+base64",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Sanitize a tool description for indexing and display.
///
/// Control characters are dropped, whitespace is normalized to single spaces,
/// known prompt-injection markers become `[REDACTED]`, and the result is
/// truncated at `cap` with a `...` suffix.
pub fn sanitize_description(raw: &str, cap: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    let mut text = WHITESPACE_RUN.replace_all(&cleaned, " ").trim().to_string();
    for marker in INJECTION_MARKERS.iter() {
        if marker.is_match(&text) {
            text = marker.replace_all(&text, "[REDACTED]").into_owned();
        }
    }
    if text.chars().count() > cap {
        let truncated: String = text.chars().take(cap).collect();
        text = format!("{truncated}...");
    }
    text
}

/// Coerce a tool name to `[A-Za-z0-9_-]+`, truncated at [`TOOL_NAME_CAP`].
pub fn sanitize_tool_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(TOOL_NAME_CAP)
        .collect()
}
