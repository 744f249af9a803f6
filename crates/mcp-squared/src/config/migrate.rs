//! Stepwise schema migration over the raw TOML table.
//!
//! Migration runs before typed deserialization so legacy keys never reach the
//! model. A missing `schemaVersion` is treated as 0, which routes the file
//! through the v0 migration instead of skipping it.

use toml::Table;
use toml::Value;

use crate::config::model::SCHEMA_VERSION;
use crate::error::CoreError;

/// Migrate `table` in place up to [`SCHEMA_VERSION`].
///
/// Returns the version the table started at.
pub fn migrate(table: &mut Table) -> Result<u32, CoreError> {
    let found = read_version(table);
    if found > SCHEMA_VERSION {
        return Err(CoreError::UnknownSchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    let mut version = found;
    while version < SCHEMA_VERSION {
        match version {
            0 => migrate_v0_to_v1(table),
            // Unreachable while SCHEMA_VERSION == 1; each future version adds
            // an arm here so migrations chain one step at a time.
            _ => break,
        }
        version += 1;
        table.insert(
            "schemaVersion".to_string(),
            Value::Integer(i64::from(version)),
        );
    }

    Ok(found)
}

fn read_version(table: &Table) -> u32 {
    table
        .get("schemaVersion")
        .and_then(Value::as_integer)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// v0 files used a top-level `servers` map and flat pattern lists.
fn migrate_v0_to_v1(table: &mut Table) {
    if let Some(servers) = table.remove("servers")
        && !table.contains_key("upstreams")
    {
        table.insert("upstreams".to_string(), servers);
    }

    let mut tools = Table::new();
    for list in ["allow", "block", "confirm"] {
        if let Some(patterns) = table.remove(list) {
            tools.insert(list.to_string(), patterns);
        }
    }
    if !tools.is_empty() {
        let security = table
            .entry("security".to_string())
            .or_insert_with(|| Value::Table(Table::new()));
        if let Value::Table(security) = security {
            security
                .entry("tools".to_string())
                .or_insert(Value::Table(tools));
        }
    }
}
