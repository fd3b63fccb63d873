// src/search/mod.rs
// Search orchestration: strategy fan-out, filtering, ranking, diagnostics
//
// Strategies: FTS (BM25 over the trigger-maintained mirror), semantic (cosine
// over stored vectors, project-scoped) and a substring fallback that only
// runs when the first two produce nothing. Results merge by observation id;
// the first occurrence wins and later hits only contribute missing scores.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::db::DatabasePool;
use crate::db::fts::{FtsConstraints, build_match_query, fts_search_sync};
use crate::db::observations::{fallback_search_sync, get_observations_by_ids_sync};
use crate::db::types::Observation;
use crate::embeddings::worker::EmbeddingWorker;
use crate::error::Result;
use crate::ranker::{ComponentScores, RankCandidate, RankWeights, Ranker};
use crate::utils::now_ms;

/// Cap on semantic candidates considered per query.
const SEMANTIC_TOP_K: usize = 100;

/// Search request options.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub project: Option<String>,
    pub kind: Option<String>,
    pub date_start_ms: Option<i64>,
    pub date_end_ms: Option<i64>,
    pub limit: usize,
    pub offset: usize,
    pub use_fts: bool,
    pub use_semantic: bool,
    /// Drop results whose combined score falls below this threshold.
    pub min_relevance: Option<f64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            project: None,
            kind: None,
            date_start_ms: None,
            date_end_ms: None,
            limit: 20,
            offset: 0,
            use_fts: true,
            use_semantic: true,
            min_relevance: None,
        }
    }
}

/// One ranked search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub observation: Observation,
    pub final_score: f64,
    pub scores: ComponentScores,
}

/// Full search response.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<SearchHit>,
    /// Count after filtering, before the offset/limit slice.
    pub total: usize,
    pub strategies: Vec<String>,
    pub timing_ms: u64,
    pub diagnostics: SearchDiagnostics,
}

/// Per-call diagnostics, also kept as a last-writer-wins snapshot.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDiagnostics {
    pub query: String,
    pub started_at_epoch_ms: i64,
    pub ended_at_epoch_ms: i64,
    pub strategy_timings_ms: BTreeMap<String, u64>,
    pub strategy_input_counts: BTreeMap<String, usize>,
    pub filter_output_counts: Vec<FilterCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterCount {
    pub filter: String,
    pub output: usize,
}

pub struct SearchOrchestrator {
    pool: Arc<DatabasePool>,
    embeddings: Arc<EmbeddingWorker>,
    weights: RankWeights,
    last_diagnostics: Mutex<Option<SearchDiagnostics>>,
}

impl SearchOrchestrator {
    pub fn new(
        pool: Arc<DatabasePool>,
        embeddings: Arc<EmbeddingWorker>,
        weights: RankWeights,
    ) -> Self {
        Self {
            pool,
            embeddings,
            weights,
            last_diagnostics: Mutex::new(None),
        }
    }

    /// Advisory snapshot of the most recent call's diagnostics.
    pub fn last_diagnostics(&self) -> Option<SearchDiagnostics> {
        self.last_diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn search(&self, query: &str, options: SearchOptions) -> Result<SearchOutcome> {
        let started = Instant::now();
        let mut diagnostics = SearchDiagnostics {
            query: query.to_string(),
            started_at_epoch_ms: now_ms(),
            ..Default::default()
        };
        let mut strategies = Vec::new();

        // Merged candidates in first-seen order, with per-id semantic scores.
        let mut merged: Vec<Observation> = Vec::new();
        let mut semantic_scores: BTreeMap<i64, f64> = BTreeMap::new();
        let mut seen = std::collections::HashSet::new();

        if options.use_fts {
            let strategy_started = Instant::now();
            let hits = self.run_fts(query, &options).await?;
            diagnostics
                .strategy_input_counts
                .insert("fts".to_string(), hits.len());
            diagnostics.strategy_timings_ms.insert(
                "fts".to_string(),
                strategy_started.elapsed().as_millis() as u64,
            );
            strategies.push("fts".to_string());
            for obs in hits {
                if seen.insert(obs.id) {
                    merged.push(obs);
                }
            }
        }

        let semantic_eligible =
            options.use_semantic && self.embeddings.enabled() && options.project.is_some();
        if semantic_eligible {
            let strategy_started = Instant::now();
            let project = options.project.as_deref().unwrap_or_default();
            match self
                .embeddings
                .semantic_search(query, project, SEMANTIC_TOP_K)
                .await
            {
                Ok(similarity) => {
                    let ids: Vec<i64> = similarity.keys().copied().collect();
                    diagnostics
                        .strategy_input_counts
                        .insert("semantic".to_string(), ids.len());
                    let project_owned = options.project.clone();
                    let fetched = self
                        .pool
                        .interact_raw(move |conn| {
                            get_observations_by_ids_sync(
                                conn,
                                &ids,
                                project_owned.as_deref(),
                                false,
                            )
                        })
                        .await?;
                    for obs in fetched {
                        // Cosine is [-1, 1]; the ranker consumes [0, 1].
                        let score = similarity.get(&obs.id).copied().unwrap_or(0.0).max(0.0);
                        semantic_scores.insert(obs.id, score);
                        if seen.insert(obs.id) {
                            merged.push(obs);
                        }
                    }
                    strategies.push("semantic".to_string());
                }
                Err(e) => {
                    // Non-authoritative: degrade to lexical-only.
                    tracing::warn!("semantic strategy failed, continuing without it: {}", e);
                }
            }
            diagnostics.strategy_timings_ms.insert(
                "semantic".to_string(),
                strategy_started.elapsed().as_millis() as u64,
            );
        }

        if merged.is_empty() {
            let strategy_started = Instant::now();
            let query_owned = query.to_string();
            let project_owned = options.project.clone();
            let hits = self
                .pool
                .interact_raw(move |conn| {
                    fallback_search_sync(conn, &query_owned, project_owned.as_deref())
                })
                .await?;
            diagnostics
                .strategy_input_counts
                .insert("fallback".to_string(), hits.len());
            diagnostics.strategy_timings_ms.insert(
                "fallback".to_string(),
                strategy_started.elapsed().as_millis() as u64,
            );
            strategies.push("fallback".to_string());
            for obs in hits {
                if seen.insert(obs.id) {
                    merged.push(obs);
                }
            }
        }

        // Rank everything once, then filter in configured order. Ranking is
        // pure, so scoring before filtering does not change any outcome, and
        // the relevance filter gets real combined scores to threshold on.
        let weights = if semantic_eligible {
            self.weights
        } else {
            self.weights.without_semantic()
        };
        let candidates: Vec<RankCandidate> = merged
            .iter()
            .map(|o| RankCandidate {
                id: o.id,
                title: o.title.clone(),
                subtitle: o.subtitle.clone(),
                text: o.text.clone(),
                tags: {
                    let mut tags = vec![o.kind.clone()];
                    tags.extend(o.facts.iter().cloned());
                    tags
                },
                created_at_ms: o.created_at_ms,
                semantic: semantic_scores.get(&o.id).copied(),
            })
            .collect();
        let ranked = Ranker::new(weights).rank(query, &candidates);

        let by_id: std::collections::HashMap<i64, Observation> =
            merged.into_iter().map(|o| (o.id, o)).collect();
        let mut hits: Vec<SearchHit> = ranked
            .into_iter()
            .filter_map(|r| {
                by_id.get(&r.id).map(|obs| SearchHit {
                    observation: obs.clone(),
                    final_score: r.final_score,
                    scores: r.scores,
                })
            })
            .collect();

        // Filter chain, recording post-cardinality per stage.
        if let Some(ref project) = options.project {
            hits.retain(|h| &h.observation.project == project);
        }
        diagnostics.filter_output_counts.push(FilterCount {
            filter: "project".to_string(),
            output: hits.len(),
        });

        if let Some(ref kind) = options.kind {
            hits.retain(|h| &h.observation.kind == kind);
        }
        diagnostics.filter_output_counts.push(FilterCount {
            filter: "type".to_string(),
            output: hits.len(),
        });

        if options.date_start_ms.is_some() || options.date_end_ms.is_some() {
            hits.retain(|h| {
                options
                    .date_start_ms
                    .is_none_or(|start| h.observation.created_at_ms >= start)
                    && options
                        .date_end_ms
                        .is_none_or(|end| h.observation.created_at_ms <= end)
            });
        }
        diagnostics.filter_output_counts.push(FilterCount {
            filter: "date_range".to_string(),
            output: hits.len(),
        });

        let mut seen_titles = std::collections::HashSet::new();
        hits.retain(|h| seen_titles.insert(h.observation.title.to_lowercase()));
        diagnostics.filter_output_counts.push(FilterCount {
            filter: "dedup_title".to_string(),
            output: hits.len(),
        });

        if let Some(threshold) = options.min_relevance {
            hits.retain(|h| h.final_score >= threshold);
        }
        diagnostics.filter_output_counts.push(FilterCount {
            filter: "relevance".to_string(),
            output: hits.len(),
        });

        let total = hits.len();
        let results: Vec<SearchHit> = hits
            .into_iter()
            .skip(options.offset)
            .take(options.limit)
            .collect();

        diagnostics.ended_at_epoch_ms = now_ms();
        let timing_ms = started.elapsed().as_millis() as u64;
        *self
            .last_diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(diagnostics.clone());

        Ok(SearchOutcome {
            results,
            total,
            strategies,
            timing_ms,
            diagnostics,
        })
    }

    async fn run_fts(&self, query: &str, options: &SearchOptions) -> Result<Vec<Observation>> {
        let Some(match_query) = build_match_query(query) else {
            return Ok(Vec::new());
        };
        let project = options.project.clone();
        let kind = options.kind.clone();
        let date_start_ms = options.date_start_ms;
        let date_end_ms = options.date_end_ms;
        let hits = self
            .pool
            .interact_raw(move |conn| {
                fts_search_sync(
                    conn,
                    &match_query,
                    &FtsConstraints {
                        project: project.as_deref(),
                        kind: kind.as_deref(),
                        date_start_ms,
                        date_end_ms,
                    },
                )
            })
            .await?;
        Ok(hits.into_iter().map(|h| h.observation).collect())
    }
}
