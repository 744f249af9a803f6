//! Retriever: drives index sync from the cataloger and answers the three
//! search modes.
//!
//! The retriever owns the index store and borrows the cataloger read-only;
//! it learns about fleet changes through the cataloger's event channel, so
//! neither side holds a back-pointer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mcp_squared::config::{FindToolsConfig, SearchMode};
use mcp_squared::naming::{ToolName, qualified};

use crate::cataloger::{CatalogEvent, Cataloger};
use crate::error::BrokerError;
use crate::index::store::BundleSuggestion;
use crate::index::{EmbeddingGenerator, IndexStore, ToolChanges, detect_changes};
use crate::model::{IndexedTool, SearchHit};

/// Candidate multiplier for hybrid search, capped at [`HYBRID_CANDIDATE_CAP`].
const HYBRID_CANDIDATE_FACTOR: usize = 3;
const HYBRID_CANDIDATE_CAP: usize = 100;

/// Weights of the hybrid score.
const HYBRID_FTS_WEIGHT: f64 = 0.3;
const HYBRID_COSINE_WEIGHT: f64 = 0.7;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub mode: Option<SearchMode>,
}

#[derive(Debug)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// Total matches in the index, independent of the limit.
    pub total_matches: usize,
}

/// Outcome of a qualified-name lookup.
#[derive(Debug, Default)]
pub struct ToolLookup {
    pub tool: Option<IndexedTool>,
    pub ambiguous: bool,
    pub alternatives: Vec<String>,
}

/// A bare name that resolved to several upstreams.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AmbiguousName {
    pub name: String,
    pub alternatives: Vec<String>,
}

pub struct Retriever {
    store: IndexStore,
    cataloger: Arc<Cataloger>,
    embedder: Arc<dyn EmbeddingGenerator>,
    options: FindToolsConfig,
}

impl Retriever {
    pub fn new(
        store: IndexStore,
        cataloger: Arc<Cataloger>,
        embedder: Arc<dyn EmbeddingGenerator>,
        options: FindToolsConfig,
    ) -> Self {
        Self {
            store,
            cataloger,
            embedder,
            options,
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.options.default_limit)
            .min(self.options.max_limit)
    }

    /// Re-index one upstream from the cataloger's current view, returning
    /// what changed.
    pub async fn sync_upstream(&self, key: &str) -> Result<ToolChanges, BrokerError> {
        let before = self.store.snapshot(Some(key)).await?;

        match self.cataloger.tools_for(key) {
            Some(tools) if !tools.is_empty() => {
                let fresh: std::collections::BTreeSet<String> =
                    tools.iter().map(|t| t.name.clone()).collect();
                // Drop rows for tools the upstream no longer advertises.
                for stale in self.store.get_tools_for_upstream(key).await? {
                    if !fresh.contains(&stale.tool.name) {
                        self.store.remove_tool(key, &stale.tool.name).await?;
                    }
                }
                self.store.index_tools(tools).await?;
            }
            _ => {
                self.store.remove_tools_for_upstream(key).await?;
            }
        }

        if self.embedder.is_available() {
            self.embed_missing(key).await?;
        }

        let after = self.store.snapshot(Some(key)).await?;
        let changes = detect_changes(Some(key), &before, &after);
        if !changes.is_empty() {
            debug!(
                upstream = %key,
                added = changes.added.len(),
                removed = changes.removed.len(),
                modified = changes.modified.len(),
                "index updated"
            );
        }
        Ok(changes)
    }

    /// Full re-sync of every upstream the cataloger tracks.
    pub async fn sync_from_cataloger(&self) -> Result<ToolChanges, BrokerError> {
        let before = self.store.snapshot(None).await?;
        for key in self.cataloger.upstream_keys() {
            self.sync_upstream(&key).await?;
        }
        let after = self.store.snapshot(None).await?;
        Ok(detect_changes(None, &before, &after))
    }

    async fn embed_missing(&self, key: &str) -> Result<(), BrokerError> {
        let rows = self.store.get_tools_for_upstream(key).await?;
        let missing: Vec<&IndexedTool> = rows.iter().filter(|t| t.embedding.is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = missing
            .iter()
            .map(|t| match &t.tool.description {
                Some(d) => format!("{}: {d}", t.tool.name),
                None => t.tool.name.clone(),
            })
            .collect();
        let vectors = self.embedder.embed_batch(&texts, false).await?;
        let batch = missing
            .iter()
            .zip(vectors)
            .map(|(t, v)| (t.tool.upstream_key.clone(), t.tool.name.clone(), v))
            .collect();
        self.store.update_embeddings(batch).await
    }

    /// Subscribe to cataloger change events and keep the index current.
    pub fn spawn_sync_task(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut events = self.cataloger.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CatalogEvent::ToolsSynced { upstream }) => {
                        if let Err(e) = this.sync_upstream(&upstream).await {
                            warn!(upstream = %upstream, error = %e, "index sync failed");
                        }
                    }
                    Ok(CatalogEvent::StatusChanged { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "catalog events lagged; full resync");
                        if let Err(e) = this.sync_from_cataloger().await {
                            warn!(error = %e, "full resync failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Search in the requested mode; `semantic` and `hybrid` silently
    /// downgrade to `fast` when no embedding backend is available.
    pub async fn search(
        &self,
        query: &str,
        options: SearchOptions,
    ) -> Result<SearchResults, BrokerError> {
        let limit = self.effective_limit(options.limit);
        let mode = options.mode.unwrap_or(self.options.default_mode);
        let mode = if matches!(mode, SearchMode::Semantic | SearchMode::Hybrid)
            && !self.embedder.is_available()
        {
            SearchMode::Fast
        } else {
            mode
        };

        let total_matches = self.store.search_count(query).await?;
        let hits = match mode {
            SearchMode::Fast => self.store.search(query, limit).await?,
            SearchMode::Semantic => {
                let query_vec = self.embedder.embed(query, true).await?;
                self.store
                    .search_semantic(query_vec, limit)
                    .await?
                    .into_iter()
                    .map(|(tool, score)| SearchHit {
                        tool,
                        score: score as f64,
                    })
                    .collect()
            }
            SearchMode::Hybrid => {
                let candidates = self
                    .store
                    .search(
                        query,
                        (limit * HYBRID_CANDIDATE_FACTOR).min(HYBRID_CANDIDATE_CAP),
                    )
                    .await?;
                let query_vec = self.embedder.embed(query, true).await?;
                let mut scored: Vec<(SearchHit, f64)> = candidates
                    .into_iter()
                    .map(|hit| {
                        let cosine = hit
                            .tool
                            .embedding
                            .as_deref()
                            .map(|v| crate::index::cosine_similarity(v, &query_vec) as f64)
                            .unwrap_or(0.0);
                        let fts_norm = (hit.score / 10.0).clamp(0.0, 1.0);
                        let combined =
                            HYBRID_FTS_WEIGHT * fts_norm + HYBRID_COSINE_WEIGHT * cosine;
                        (hit, combined)
                    })
                    .collect();
                scored.sort_by(|(a, a_combined), (b, b_combined)| {
                    b_combined
                        .partial_cmp(a_combined)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| {
                            b.score
                                .partial_cmp(&a.score)
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .then_with(|| a.tool.tool.upstream_key.cmp(&b.tool.tool.upstream_key))
                });
                scored
                    .into_iter()
                    .take(limit)
                    .map(|(mut hit, combined)| {
                        hit.score = combined;
                        hit
                    })
                    .collect()
            }
        };

        Ok(SearchResults {
            hits,
            total_matches,
        })
    }

    /// Resolve one name. Qualified names look up directly; bare names search
    /// every upstream and report ambiguity instead of guessing.
    pub async fn get_tool(
        &self,
        name: &str,
        upstream_hint: Option<&str>,
    ) -> Result<ToolLookup, BrokerError> {
        if let Some(upstream) = upstream_hint {
            return Ok(ToolLookup {
                tool: self.store.get_tool(upstream, name).await?,
                ..Default::default()
            });
        }
        match ToolName::parse(name) {
            ToolName::Qualified { upstream, tool } => Ok(ToolLookup {
                tool: self.store.get_tool(&upstream, &tool).await?,
                ..Default::default()
            }),
            ToolName::Bare(bare) => {
                let mut owners = self.store.get_tools_named(&bare).await?;
                match owners.len() {
                    0 => Ok(ToolLookup::default()),
                    1 => Ok(ToolLookup {
                        tool: Some(owners.remove(0)),
                        ..Default::default()
                    }),
                    _ => Ok(ToolLookup {
                        tool: None,
                        ambiguous: true,
                        alternatives: owners
                            .iter()
                            .map(|t| qualified(&t.tool.upstream_key, &t.tool.name))
                            .collect(),
                    }),
                }
            }
        }
    }

    /// Resolve many names, partitioning resolutions from ambiguities.
    /// Unknown names are dropped silently; `get_tools(&[])` is empty.
    pub async fn get_tools(
        &self,
        names: &[String],
    ) -> Result<(Vec<IndexedTool>, Vec<AmbiguousName>), BrokerError> {
        let mut tools = Vec::new();
        let mut ambiguous = Vec::new();
        for name in names {
            let lookup = self.get_tool(name, None).await?;
            if let Some(tool) = lookup.tool {
                tools.push(tool);
            } else if lookup.ambiguous {
                ambiguous.push(AmbiguousName {
                    name: name.clone(),
                    alternatives: lookup.alternatives,
                });
            }
        }
        Ok((tools, ambiguous))
    }

    // Co-occurrence pass-throughs.

    pub async fn record_cooccurrences(&self, names: Vec<String>) -> Result<(), BrokerError> {
        self.store.record_cooccurrences(names).await
    }

    pub async fn get_suggested_bundles(
        &self,
        keys: &[String],
        min_count: u32,
        limit: usize,
    ) -> Result<Vec<BundleSuggestion>, BrokerError> {
        self.store.get_suggested_bundles(keys, min_count, limit).await
    }

    pub async fn get_related_tools(
        &self,
        key: &str,
        min_count: u32,
        limit: usize,
    ) -> Result<Vec<BundleSuggestion>, BrokerError> {
        self.store.get_related_tools(key, min_count, limit).await
    }

    pub async fn clear_cooccurrences(&self) -> Result<usize, BrokerError> {
        self.store.clear_cooccurrences().await
    }

    pub async fn get_cooccurrence_count(&self) -> Result<usize, BrokerError> {
        self.store.get_cooccurrence_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::cataloger::CatalogerOptions;
    use crate::index::NoopEmbedder;
    use crate::model::CatalogedTool;
    use crate::oauth::TokenStore;

    fn tool(upstream: &str, name: &str, description: &str) -> CatalogedTool {
        CatalogedTool {
            upstream_key: upstream.into(),
            name: name.into(),
            description: Some(description.into()),
            input_schema: json!({"type": "object"}),
        }
    }

    async fn retriever() -> (TempDir, Arc<Cataloger>, Retriever) {
        let tmp = TempDir::new().unwrap();
        let token_store = Arc::new(TokenStore::new(tmp.path().join("oauth")));
        let cataloger = Arc::new(Cataloger::new(
            &BTreeMap::new(),
            token_store,
            CatalogerOptions::default(),
        ));
        let store = IndexStore::open_in_memory().await.unwrap();
        let retriever = Retriever::new(
            store,
            cataloger.clone(),
            Arc::new(NoopEmbedder),
            FindToolsConfig::default(),
        );
        (tmp, cataloger, retriever)
    }

    #[tokio::test]
    async fn sync_mirrors_cataloger_state() {
        let (_tmp, cataloger, retriever) = retriever().await;
        cataloger.inject_tools_for_test(
            "fs",
            vec![
                tool("fs", "read_file", "Read a file"),
                tool("fs", "write_file", "Write a file"),
            ],
        );

        let changes = retriever.sync_upstream("fs").await.unwrap();
        assert_eq!(changes.added.len(), 2);
        assert_eq!(retriever.store().get_tool_count().await.unwrap(), 2);

        // Upstream drops one tool.
        cataloger.inject_tools_for_test("fs", vec![tool("fs", "read_file", "Read a file")]);
        let changes = retriever.sync_upstream("fs").await.unwrap();
        assert_eq!(changes.removed, vec!["write_file"]);
        assert_eq!(retriever.store().get_tool_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn semantic_mode_downgrades_without_backend() {
        let (_tmp, cataloger, retriever) = retriever().await;
        cataloger.inject_tools_for_test("fs", vec![tool("fs", "read_file", "Read a file")]);
        retriever.sync_upstream("fs").await.unwrap();

        let results = retriever
            .search(
                "read",
                SearchOptions {
                    limit: None,
                    mode: Some(SearchMode::Semantic),
                },
            )
            .await
            .unwrap();
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.total_matches, 1);
    }

    #[tokio::test]
    async fn limits_are_clamped_to_max() {
        let (_tmp, cataloger, retriever) = retriever().await;
        let tools: Vec<CatalogedTool> = (0..80)
            .map(|i| tool("fs", &format!("tool_{i:02}"), "works on a file"))
            .collect();
        cataloger.inject_tools_for_test("fs", tools);
        retriever.sync_upstream("fs").await.unwrap();

        let results = retriever
            .search(
                "file",
                SearchOptions {
                    limit: Some(500),
                    mode: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(results.hits.len(), FindToolsConfig::default().max_limit);
        assert_eq!(results.total_matches, 80);
    }

    #[tokio::test]
    async fn bare_lookup_reports_ambiguity() {
        let (_tmp, cataloger, retriever) = retriever().await;
        cataloger.inject_tools_for_test("fs", vec![tool("fs", "read_file", "a")]);
        cataloger.inject_tools_for_test("vault", vec![tool("vault", "read_file", "b")]);
        retriever.sync_upstream("fs").await.unwrap();
        retriever.sync_upstream("vault").await.unwrap();

        let lookup = retriever.get_tool("read_file", None).await.unwrap();
        assert!(lookup.tool.is_none());
        assert!(lookup.ambiguous);
        assert_eq!(lookup.alternatives, vec!["fs:read_file", "vault:read_file"]);

        let lookup = retriever.get_tool("fs:read_file", None).await.unwrap();
        assert!(lookup.tool.is_some());
        assert!(!lookup.ambiguous);

        let lookup = retriever.get_tool("missing_tool", None).await.unwrap();
        assert!(lookup.tool.is_none());
        assert!(!lookup.ambiguous);
    }

    #[tokio::test]
    async fn get_tools_partitions_and_handles_empty() {
        let (_tmp, cataloger, retriever) = retriever().await;
        cataloger.inject_tools_for_test("fs", vec![tool("fs", "read_file", "a")]);
        cataloger.inject_tools_for_test("vault", vec![tool("vault", "read_file", "b")]);
        retriever.sync_upstream("fs").await.unwrap();
        retriever.sync_upstream("vault").await.unwrap();

        let (tools, ambiguous) = retriever.get_tools(&[]).await.unwrap();
        assert!(tools.is_empty());
        assert!(ambiguous.is_empty());

        let (tools, ambiguous) = retriever
            .get_tools(&["fs:read_file".to_string(), "read_file".to_string()])
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(ambiguous.len(), 1);
        assert_eq!(ambiguous[0].name, "read_file");
    }
}
