//! SQLite-backed tool index.
//!
//! One row per `(upstream_key, tool_name)`, an FTS5 shadow table for
//! full-text lookup, optional embedding vectors, and the co-occurrence
//! counters behind bundle suggestions. The connection is shared behind a
//! mutex and every operation runs on the blocking pool, so writers are
//! serialized and readers always observe a committed row set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::BrokerError;
use crate::index::embedding::cosine_similarity;
use crate::index::hash::schema_hash;
use crate::index::snapshot::ToolSnapshot;
use crate::model::{CatalogedTool, IndexedTool, SearchHit};

/// A related-tool suggestion derived from co-occurrence counts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BundleSuggestion {
    pub name: String,
    pub count: u32,
}

#[derive(Clone)]
pub struct IndexStore {
    conn: Arc<Mutex<Connection>>,
}

impl IndexStore {
    /// Open (or create) the index at `path`.
    pub async fn open(path: PathBuf) -> Result<Self, BrokerError> {
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(join_err)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests and `--dry-run` paths.
    pub async fn open_in_memory() -> Result<Self, BrokerError> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(join_err)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, BrokerError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(join_err)?
        .map_err(BrokerError::from)
    }

    /// Insert-or-replace one tool. A changed schema hash clears any stored
    /// embedding; an unchanged one preserves it.
    pub async fn index_tool(&self, tool: CatalogedTool) -> Result<(), BrokerError> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            upsert_tool(&tx, &tool)?;
            tx.commit()
        })
        .await
    }

    /// Index a batch atomically: observers see all rows or none.
    pub async fn index_tools(&self, batch: Vec<CatalogedTool>) -> Result<(), BrokerError> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            for tool in &batch {
                upsert_tool(&tx, tool)?;
            }
            tx.commit()
        })
        .await
    }

    /// Delete one row (and its FTS shadow). Returns true when it existed.
    pub async fn remove_tool(
        &self,
        upstream_key: &str,
        tool_name: &str,
    ) -> Result<bool, BrokerError> {
        let (key, name) = (upstream_key.to_string(), tool_name.to_string());
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM tools_fts WHERE upstream_key = ?1 AND tool_name = ?2",
                params![key, name],
            )?;
            let removed = tx.execute(
                "DELETE FROM tools WHERE upstream_key = ?1 AND tool_name = ?2",
                params![key, name],
            )?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    /// Delete every row for `upstream_key`; returns the removed count.
    pub async fn remove_tools_for_upstream(&self, upstream_key: &str) -> Result<usize, BrokerError> {
        let key = upstream_key.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM tools_fts WHERE upstream_key = ?1", params![key])?;
            let removed = tx.execute("DELETE FROM tools WHERE upstream_key = ?1", params![key])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    pub async fn get_tool(
        &self,
        upstream_key: &str,
        tool_name: &str,
    ) -> Result<Option<IndexedTool>, BrokerError> {
        let (key, name) = (upstream_key.to_string(), tool_name.to_string());
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT upstream_key, tool_name, description, input_schema, schema_hash, embedding
                 FROM tools WHERE upstream_key = ?1 AND tool_name = ?2",
                params![key, name],
                row_to_tool,
            )
            .optional()
        })
        .await
    }

    pub async fn get_tools_for_upstream(
        &self,
        upstream_key: &str,
    ) -> Result<Vec<IndexedTool>, BrokerError> {
        let key = upstream_key.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT upstream_key, tool_name, description, input_schema, schema_hash, embedding
                 FROM tools WHERE upstream_key = ?1 ORDER BY tool_name",
            )?;
            let rows = stmt.query_map(params![key], row_to_tool)?;
            rows.collect()
        })
        .await
    }

    /// Every row with this bare tool name, across upstreams.
    pub async fn get_tools_named(&self, tool_name: &str) -> Result<Vec<IndexedTool>, BrokerError> {
        let name = tool_name.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT upstream_key, tool_name, description, input_schema, schema_hash, embedding
                 FROM tools WHERE tool_name = ?1 ORDER BY upstream_key",
            )?;
            let rows = stmt.query_map(params![name], row_to_tool)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_all_tools(&self) -> Result<Vec<IndexedTool>, BrokerError> {
        self.run_blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT upstream_key, tool_name, description, input_schema, schema_hash, embedding
                 FROM tools ORDER BY upstream_key, tool_name",
            )?;
            let rows = stmt.query_map([], row_to_tool)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_tool_count(&self) -> Result<usize, BrokerError> {
        self.run_blocking(|conn| {
            conn.query_row("SELECT COUNT(*) FROM tools", [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        })
        .await
    }

    /// Full-text search ranked by bm25; deterministic tie-break by upstream
    /// key then tool name. Empty or whitespace-only queries match nothing.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, BrokerError> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.upstream_key, t.tool_name, t.description, t.input_schema,
                        t.schema_hash, t.embedding, bm25(tools_fts) AS rank
                 FROM tools_fts
                 JOIN tools t
                   ON t.upstream_key = tools_fts.upstream_key
                  AND t.tool_name = tools_fts.tool_name
                 WHERE tools_fts MATCH ?1
                 ORDER BY rank, t.upstream_key, t.tool_name
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
                let tool = row_to_tool(row)?;
                let rank: f64 = row.get(6)?;
                Ok(SearchHit { tool, score: -rank })
            })?;
            rows.collect()
        })
        .await
    }

    /// Total number of rows matching `query`, independent of any limit.
    pub async fn search_count(&self, query: &str) -> Result<usize, BrokerError> {
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(0);
        };
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM tools_fts WHERE tools_fts MATCH ?1",
                params![match_expr],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
        .await
    }

    /// Cosine nearest neighbors among rows that carry an embedding.
    pub async fn search_semantic(
        &self,
        query_vec: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<(IndexedTool, f32)>, BrokerError> {
        let embedded = self
            .run_blocking(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT upstream_key, tool_name, description, input_schema, schema_hash, embedding
                     FROM tools WHERE embedding IS NOT NULL",
                )?;
                let rows = stmt.query_map([], row_to_tool)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut scored: Vec<(IndexedTool, f32)> = embedded
            .into_iter()
            .filter_map(|tool| {
                let vector = tool.embedding.as_deref()?;
                let score = cosine_similarity(vector, &query_vec);
                Some((tool, score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.tool.qualified_name().cmp(&b.0.tool.qualified_name()))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Attach vectors to existing rows. A dimension mismatch (within the
    /// batch or against already-stored vectors) fails the whole batch.
    pub async fn update_embeddings(
        &self,
        batch: Vec<(String, String, Vec<f32>)>,
    ) -> Result<(), BrokerError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let dimension = first.2.len();
        if dimension == 0 {
            return Err(BrokerError::IndexSchemaMismatch {
                expected: 1,
                actual: 0,
            });
        }
        if let Some(bad) = batch.iter().find(|(_, _, v)| v.len() != dimension) {
            return Err(BrokerError::IndexSchemaMismatch {
                expected: dimension,
                actual: bad.2.len(),
            });
        }

        let mismatch = self
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT embedding FROM tools WHERE embedding IS NOT NULL LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(blob) = existing {
                    let stored_dim = blob.len() / 4;
                    if stored_dim != dimension {
                        return Ok(Some(stored_dim));
                    }
                }
                for (key, name, vector) in &batch {
                    tx.execute(
                        "UPDATE tools SET embedding = ?1
                         WHERE upstream_key = ?2 AND tool_name = ?3",
                        params![encode_embedding(vector), key, name],
                    )?;
                }
                tx.commit()?;
                Ok(None)
            })
            .await?;

        match mismatch {
            Some(expected) => Err(BrokerError::IndexSchemaMismatch {
                expected,
                actual: dimension,
            }),
            None => Ok(()),
        }
    }

    /// Increment the unordered pair `(a, b)`. `a == b` is a no-op.
    pub async fn record_cooccurrence(&self, a: &str, b: &str) -> Result<(), BrokerError> {
        self.record_cooccurrences(vec![a.to_string(), b.to_string()])
            .await
    }

    /// Increment every unordered pair in `names` (N names → N·(N-1)/2 pairs)
    /// in one transaction. Lists with fewer than two distinct names are
    /// no-ops.
    pub async fn record_cooccurrences(&self, names: Vec<String>) -> Result<(), BrokerError> {
        let distinct: BTreeSet<String> = names.into_iter().collect();
        if distinct.len() < 2 {
            return Ok(());
        }
        let ordered: Vec<String> = distinct.into_iter().collect();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            for (i, a) in ordered.iter().enumerate() {
                for b in &ordered[i + 1..] {
                    tx.execute(
                        "INSERT INTO cooccurrence (key_a, key_b, count) VALUES (?1, ?2, 1)
                         ON CONFLICT(key_a, key_b) DO UPDATE SET count = count + 1",
                        params![a, b],
                    )?;
                }
            }
            tx.commit()
        })
        .await
    }

    /// Tools co-occurring with `key` at least `min_count` times, most
    /// frequent first.
    pub async fn get_related_tools(
        &self,
        key: &str,
        min_count: u32,
        limit: usize,
    ) -> Result<Vec<BundleSuggestion>, BrokerError> {
        let key = key.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT CASE WHEN key_a = ?1 THEN key_b ELSE key_a END AS partner, count
                 FROM cooccurrence
                 WHERE (key_a = ?1 OR key_b = ?1) AND count >= ?2
                 ORDER BY count DESC, partner
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![key, min_count, limit as i64], |row| {
                Ok(BundleSuggestion {
                    name: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u32,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Suggestions for a result set: tools related to any of `keys` (but not
    /// in it), scored by the summed pair counts, strongest first.
    pub async fn get_suggested_bundles(
        &self,
        keys: &[String],
        min_count: u32,
        limit: usize,
    ) -> Result<Vec<BundleSuggestion>, BrokerError> {
        if keys.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let keys: BTreeSet<String> = keys.iter().cloned().collect();
        let rows = self
            .run_blocking(|conn| {
                let mut stmt =
                    conn.prepare("SELECT key_a, key_b, count FROM cooccurrence WHERE count > 0")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? as u32,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut totals: BTreeMap<String, u32> = BTreeMap::new();
        for (a, b, count) in rows {
            let partner = match (keys.contains(&a), keys.contains(&b)) {
                (true, false) => b,
                (false, true) => a,
                _ => continue,
            };
            *totals.entry(partner).or_default() += count;
        }

        let mut suggestions: Vec<BundleSuggestion> = totals
            .into_iter()
            .filter(|(_, count)| *count >= min_count)
            .map(|(name, count)| BundleSuggestion { name, count })
            .collect();
        suggestions.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        suggestions.truncate(limit);
        Ok(suggestions)
    }

    /// Drop every co-occurrence pair; returns the prior pair count.
    pub async fn clear_cooccurrences(&self) -> Result<usize, BrokerError> {
        self.run_blocking(|conn| {
            let tx = conn.transaction()?;
            let prior: i64 = tx.query_row("SELECT COUNT(*) FROM cooccurrence", [], |r| r.get(0))?;
            tx.execute("DELETE FROM cooccurrence", [])?;
            tx.commit()?;
            Ok(prior as usize)
        })
        .await
    }

    pub async fn get_cooccurrence_count(&self) -> Result<usize, BrokerError> {
        self.run_blocking(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cooccurrence", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
        })
        .await
    }

    /// Stored count for one unordered pair (0 when never recorded).
    pub async fn get_pair_count(&self, a: &str, b: &str) -> Result<u32, BrokerError> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let (first, second) = (first.to_string(), second.to_string());
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT count FROM cooccurrence WHERE key_a = ?1 AND key_b = ?2",
                params![first, second],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|n| n.unwrap_or(0) as u32)
        })
        .await
    }

    /// Current qualified-name → schema-hash snapshot, optionally scoped to
    /// one upstream.
    pub async fn snapshot(&self, upstream: Option<&str>) -> Result<ToolSnapshot, BrokerError> {
        let upstream = upstream.map(str::to_string);
        let hashes = self
            .run_blocking(move |conn| {
                let mut hashes = BTreeMap::new();
                let mut stmt = match &upstream {
                    Some(_) => conn.prepare(
                        "SELECT upstream_key, tool_name, schema_hash FROM tools
                         WHERE upstream_key = ?1",
                    )?,
                    None => {
                        conn.prepare("SELECT upstream_key, tool_name, schema_hash FROM tools")?
                    }
                };
                let mut collect = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
                    let key: String = row.get(0)?;
                    let name: String = row.get(1)?;
                    let hash: String = row.get(2)?;
                    hashes.insert(format!("{key}:{name}"), hash);
                    Ok(())
                };
                match &upstream {
                    Some(key) => {
                        let mut rows = stmt.query(params![key])?;
                        while let Some(row) = rows.next()? {
                            collect(row)?;
                        }
                    }
                    None => {
                        let mut rows = stmt.query([])?;
                        while let Some(row) = rows.next()? {
                            collect(row)?;
                        }
                    }
                }
                Ok(hashes)
            })
            .await?;
        Ok(ToolSnapshot::new(hashes))
    }

    /// Erase every table.
    pub async fn clear(&self) -> Result<(), BrokerError> {
        self.run_blocking(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM tools", [])?;
            tx.execute("DELETE FROM tools_fts", [])?;
            tx.execute("DELETE FROM cooccurrence", [])?;
            tx.commit()
        })
        .await
    }

    /// Best-effort close; remaining clones keep the connection alive.
    pub async fn close(self) -> Result<(), BrokerError> {
        if let Ok(mutex) = Arc::try_unwrap(self.conn) {
            let conn = mutex.into_inner().unwrap_or_else(|e| e.into_inner());
            tokio::task::spawn_blocking(move || {
                let _ = conn.close();
            })
            .await
            .map_err(join_err)?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode returns a row, so it cannot go through execute_batch.
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tools (
            upstream_key TEXT NOT NULL,
            tool_name    TEXT NOT NULL,
            description  TEXT,
            input_schema TEXT NOT NULL,
            schema_hash  TEXT NOT NULL,
            embedding    BLOB,
            PRIMARY KEY (upstream_key, tool_name)
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS tools_fts USING fts5(
            upstream_key UNINDEXED,
            tool_name UNINDEXED,
            name,
            description
        );

        CREATE TABLE IF NOT EXISTS cooccurrence (
            key_a TEXT NOT NULL,
            key_b TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (key_a, key_b),
            CHECK (key_a < key_b),
            CHECK (count >= 0)
        );
        "#,
    )
}

fn upsert_tool(tx: &Transaction<'_>, tool: &CatalogedTool) -> rusqlite::Result<()> {
    let hash = schema_hash(&tool.input_schema);
    let prior_hash: Option<String> = tx
        .query_row(
            "SELECT schema_hash FROM tools WHERE upstream_key = ?1 AND tool_name = ?2",
            params![tool.upstream_key, tool.name],
            |row| row.get(0),
        )
        .optional()?;

    if prior_hash.as_deref() == Some(hash.as_str()) {
        // Schema unchanged: refresh the text columns, keep the embedding.
        tx.execute(
            "UPDATE tools SET description = ?3, input_schema = ?4
             WHERE upstream_key = ?1 AND tool_name = ?2",
            params![
                tool.upstream_key,
                tool.name,
                tool.description,
                tool.input_schema.to_string()
            ],
        )?;
    } else {
        tx.execute(
            "INSERT INTO tools (upstream_key, tool_name, description, input_schema, schema_hash, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)
             ON CONFLICT(upstream_key, tool_name) DO UPDATE SET
                 description = excluded.description,
                 input_schema = excluded.input_schema,
                 schema_hash = excluded.schema_hash,
                 embedding = NULL",
            params![
                tool.upstream_key,
                tool.name,
                tool.description,
                tool.input_schema.to_string(),
                hash
            ],
        )?;
    }

    tx.execute(
        "DELETE FROM tools_fts WHERE upstream_key = ?1 AND tool_name = ?2",
        params![tool.upstream_key, tool.name],
    )?;
    tx.execute(
        "INSERT INTO tools_fts (upstream_key, tool_name, name, description)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            tool.upstream_key,
            tool.name,
            tool.name,
            tool.description.as_deref().unwrap_or("")
        ],
    )?;
    Ok(())
}

fn row_to_tool(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedTool> {
    let schema_text: String = row.get(3)?;
    let input_schema = serde_json::from_str(&schema_text).unwrap_or(serde_json::Value::Null);
    let embedding: Option<Vec<u8>> = row.get(5)?;
    Ok(IndexedTool {
        tool: CatalogedTool {
            upstream_key: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            input_schema,
        },
        schema_hash: row.get(4)?,
        embedding: embedding.as_deref().map(decode_embedding),
    })
}

/// Build an FTS5 MATCH expression from free text: quoted tokens OR-ed
/// together. Returns None when no indexable token survives.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn join_err(e: tokio::task::JoinError) -> BrokerError {
    BrokerError::IndexStoreIo {
        reason: format!("blocking task failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(upstream: &str, name: &str, description: &str) -> CatalogedTool {
        CatalogedTool {
            upstream_key: upstream.into(),
            name: name.into(),
            description: Some(description.into()),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        }
    }

    #[tokio::test]
    async fn count_tracks_distinct_keys() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "read_file", "Read a file")).await.unwrap();
        store.index_tool(tool("fs", "write_file", "Write a file")).await.unwrap();
        store.index_tool(tool("db", "read_file", "Read a row")).await.unwrap();
        assert_eq!(store.get_tool_count().await.unwrap(), 3);

        // Replacing an existing key does not grow the count.
        store.index_tool(tool("fs", "read_file", "Read a file v2")).await.unwrap();
        assert_eq!(store.get_tool_count().await.unwrap(), 3);

        assert_eq!(store.remove_tools_for_upstream("fs").await.unwrap(), 2);
        assert_eq!(store.get_tool_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn search_matches_name_and_description() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "read_file", "Read file contents")).await.unwrap();
        store.index_tool(tool("db", "query", "Run a sql query against the database")).await.unwrap();

        let hits = store.search("read", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool.tool.name, "read_file");

        let hits = store.search("database", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tool.tool.name, "query");

        assert_eq!(store.search_count("file").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_query_matches_nothing() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "read_file", "Read a file")).await.unwrap();
        assert!(store.search("", 10).await.unwrap().is_empty());
        assert!(store.search("   ", 10).await.unwrap().is_empty());
        assert_eq!(store.search_count("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn search_limit_is_honored_with_stable_ties() {
        let store = IndexStore::open_in_memory().await.unwrap();
        for (upstream, name) in [("b", "file_two"), ("a", "file_one"), ("c", "file_three")] {
            store.index_tool(tool(upstream, name, "works on a file")).await.unwrap();
        }
        let hits = store.search("file", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        // Same score for all three: ties break by upstream key ascending.
        assert_eq!(hits[0].tool.tool.upstream_key, "a");
        assert_eq!(hits[1].tool.tool.upstream_key, "b");
        assert_eq!(store.search_count("file").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reindexing_same_schema_is_idempotent_and_keeps_embedding() {
        let store = IndexStore::open_in_memory().await.unwrap();
        let t = tool("fs", "read_file", "Read a file");
        store.index_tool(t.clone()).await.unwrap();
        let first = store.get_tool("fs", "read_file").await.unwrap().unwrap();

        store
            .update_embeddings(vec![("fs".into(), "read_file".into(), vec![1.0, 0.0])])
            .await
            .unwrap();

        store.index_tool(t).await.unwrap();
        let second = store.get_tool("fs", "read_file").await.unwrap().unwrap();
        assert_eq!(first.schema_hash, second.schema_hash);
        assert_eq!(second.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(store.search_count("read").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn schema_change_clears_the_embedding() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "read_file", "Read a file")).await.unwrap();
        store
            .update_embeddings(vec![("fs".into(), "read_file".into(), vec![1.0, 0.0])])
            .await
            .unwrap();

        let changed = CatalogedTool {
            input_schema: json!({"type": "object", "properties": {"offset": {"type": "number"}}}),
            ..tool("fs", "read_file", "Read a file")
        };
        store.index_tool(changed).await.unwrap();
        let row = store.get_tool("fs", "read_file").await.unwrap().unwrap();
        assert_eq!(row.embedding, None);
    }

    #[tokio::test]
    async fn embedding_dimension_mismatch_fails_whole_batch() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "a", "x")).await.unwrap();
        store.index_tool(tool("fs", "b", "y")).await.unwrap();

        let err = store
            .update_embeddings(vec![
                ("fs".into(), "a".into(), vec![1.0, 0.0]),
                ("fs".into(), "b".into(), vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::IndexSchemaMismatch { .. }));

        let row = store.get_tool("fs", "a").await.unwrap().unwrap();
        assert_eq!(row.embedding, None, "failed batch must write nothing");
    }

    #[tokio::test]
    async fn semantic_search_orders_by_cosine() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "a", "x")).await.unwrap();
        store.index_tool(tool("fs", "b", "y")).await.unwrap();
        store
            .update_embeddings(vec![
                ("fs".into(), "a".into(), vec![1.0, 0.0]),
                ("fs".into(), "b".into(), vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.search_semantic(vec![0.1, 0.9], 10).await.unwrap();
        assert_eq!(hits[0].0.tool.name, "b");
        assert_eq!(hits[1].0.tool.name, "a");
    }

    #[tokio::test]
    async fn cooccurrence_pairs_are_unordered() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.record_cooccurrence("fs:read", "db:query").await.unwrap();
        store.record_cooccurrence("db:query", "fs:read").await.unwrap();
        assert_eq!(store.get_pair_count("fs:read", "db:query").await.unwrap(), 2);
        assert_eq!(store.get_pair_count("db:query", "fs:read").await.unwrap(), 2);
        assert_eq!(store.get_cooccurrence_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_of_n_names_records_all_pairs() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store
            .record_cooccurrences(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(store.get_cooccurrence_count().await.unwrap(), 3);
        assert_eq!(store.get_pair_count("a", "b").await.unwrap(), 1);
        assert_eq!(store.get_pair_count("a", "c").await.unwrap(), 1);
        assert_eq!(store.get_pair_count("b", "c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn single_element_list_is_a_noop() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.record_cooccurrences(vec!["a".into()]).await.unwrap();
        store.record_cooccurrences(vec!["a".into(), "a".into()]).await.unwrap();
        assert_eq!(store.get_cooccurrence_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bundles_aggregate_over_the_result_set() {
        let store = IndexStore::open_in_memory().await.unwrap();
        for _ in 0..3 {
            store.record_cooccurrence("fs:read", "fs:write").await.unwrap();
        }
        for _ in 0..2 {
            store.record_cooccurrence("db:query", "fs:write").await.unwrap();
        }
        store.record_cooccurrence("fs:read", "net:fetch").await.unwrap();

        let bundles = store
            .get_suggested_bundles(&["fs:read".into(), "db:query".into()], 2, 5)
            .await
            .unwrap();
        assert_eq!(bundles[0].name, "fs:write");
        assert_eq!(bundles[0].count, 5);
        // net:fetch only co-occurred once, below the threshold.
        assert!(!bundles.iter().any(|b| b.name == "net:fetch"));

        let related = store.get_related_tools("fs:read", 1, 5).await.unwrap();
        assert_eq!(related[0].name, "fs:write");
        assert_eq!(related[0].count, 3);
    }

    #[tokio::test]
    async fn clear_cooccurrences_reports_prior_count() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store
            .record_cooccurrences(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(store.clear_cooccurrences().await.unwrap(), 3);
        assert_eq!(store.get_cooccurrence_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn snapshot_diff_detects_schema_change() {
        let store = IndexStore::open_in_memory().await.unwrap();
        store.index_tool(tool("fs", "a", "first")).await.unwrap();
        let before = store.snapshot(Some("fs")).await.unwrap();

        let changed = CatalogedTool {
            input_schema: json!({"type": "object", "required": ["path"]}),
            ..tool("fs", "a", "first")
        };
        store.index_tool(changed).await.unwrap();
        store.index_tool(tool("fs", "b", "second")).await.unwrap();
        let after = store.snapshot(Some("fs")).await.unwrap();

        let changes = crate::index::snapshot::detect_changes(Some("fs"), &before, &after);
        assert_eq!(changes.added, vec!["b"]);
        assert!(changes.removed.is_empty());
        assert_eq!(changes.modified, vec!["a"]);
    }
}
