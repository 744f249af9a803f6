//! Point-in-time tool snapshots and change detection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::util::now_ms;

/// Qualified tool name → schema hash at an instant in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSnapshot {
    pub hashes: BTreeMap<String, String>,
    /// Milliseconds since the unix epoch.
    pub taken_at: i64,
}

impl ToolSnapshot {
    pub fn new(hashes: BTreeMap<String, String>) -> Self {
        Self {
            hashes,
            taken_at: now_ms(),
        }
    }
}

/// The diff between two snapshots, scoped to one upstream or the aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub detected_at: i64,
}

impl ToolChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Diff `before` against `after`.
///
/// With `upstream = Some(key)` only that upstream's entries are considered
/// and the result carries bare tool names; with `None` the aggregate is
/// diffed and names stay qualified (bare names from different upstreams are
/// not comparable).
pub fn detect_changes(
    upstream: Option<&str>,
    before: &ToolSnapshot,
    after: &ToolSnapshot,
) -> ToolChanges {
    let scope = |name: &str| -> Option<String> {
        match upstream {
            Some(key) => name
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
                .map(str::to_string),
            None => Some(name.to_string()),
        }
    };

    let mut changes = ToolChanges {
        detected_at: now_ms(),
        ..Default::default()
    };

    for (name, hash) in &after.hashes {
        let Some(scoped) = scope(name) else { continue };
        match before.hashes.get(name) {
            None => changes.added.push(scoped),
            Some(old) if old != hash => changes.modified.push(scoped),
            Some(_) => {}
        }
    }
    for name in before.hashes.keys() {
        if let Some(scoped) = scope(name)
            && !after.hashes.contains_key(name)
        {
            changes.removed.push(scoped);
        }
    }

    changes
}
