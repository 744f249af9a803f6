//! Shared catalog records.

use serde::{Deserialize, Serialize};

use mcp_squared::naming::qualified;

/// The normalized record for one tool from one upstream.
///
/// Identity is the pair `(upstream_key, name)`; the display form is
/// `upstream_key:name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogedTool {
    pub upstream_key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque JSON schema for the tool's input.
    pub input_schema: serde_json::Value,
}

impl CatalogedTool {
    pub fn qualified_name(&self) -> String {
        qualified(&self.upstream_key, &self.name)
    }
}

/// A [`CatalogedTool`] as persisted in the index, plus derived columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedTool {
    pub tool: CatalogedTool,
    /// SHA-256 of the canonical-JSON input schema.
    pub schema_hash: String,
    pub embedding: Option<Vec<f32>>,
}

/// One full-text search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub tool: IndexedTool,
    /// Higher is better (negated bm25).
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn qualified_name_uses_colon() {
        let tool = CatalogedTool {
            upstream_key: "fs".into(),
            name: "read_file".into(),
            description: None,
            input_schema: json!({"type": "object"}),
        };
        assert_eq!(tool.qualified_name(), "fs:read_file");
    }
}
