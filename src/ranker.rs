// src/ranker.rs
// Hybrid result ranking: lexical + semantic + recency + tag signals
//
// Pure and deterministic: the same inputs always produce the same order.
// Recency uses min-max normalization of created_at_ms across the candidate
// batch; the coarse age-bucket curve is only for standalone single-item
// scoring (recency_bucket_score).

/// Signal weights. When semantic search is disabled the caller zeroes
/// `semantic`; the remaining weights are used as-is without renormalization.
#[derive(Debug, Clone, Copy)]
pub struct RankWeights {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub tag: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            lexical: 0.45,
            semantic: 0.35,
            recency: 0.15,
            tag: 0.05,
        }
    }
}

impl RankWeights {
    pub fn without_semantic(mut self) -> Self {
        self.semantic = 0.0;
        self
    }
}

/// One candidate entering the ranking pass.
#[derive(Debug, Clone)]
pub struct RankCandidate {
    pub id: i64,
    pub title: String,
    pub subtitle: Option<String>,
    pub text: String,
    pub tags: Vec<String>,
    pub created_at_ms: i64,
    /// Cosine similarity clamped to [0,1], when the semantic strategy ran.
    pub semantic: Option<f64>,
}

/// Per-signal scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ComponentScores {
    pub lexical: f64,
    pub semantic: f64,
    pub recency: f64,
    pub tag_boost: f64,
}

/// A ranked candidate with its combined score.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub id: i64,
    pub created_at_ms: i64,
    pub final_score: f64,
    pub scores: ComponentScores,
}

pub struct Ranker {
    weights: RankWeights,
}

impl Ranker {
    pub fn new(weights: RankWeights) -> Self {
        Self { weights }
    }

    /// Score and sort candidates for a query, best first.
    /// Ties break toward newer `created_at_ms`, then higher id.
    pub fn rank(&self, query: &str, candidates: &[RankCandidate]) -> Vec<Ranked> {
        let (min_ts, max_ts) = match candidates.iter().map(|c| c.created_at_ms).fold(
            None::<(i64, i64)>,
            |acc, ts| match acc {
                None => Some((ts, ts)),
                Some((lo, hi)) => Some((lo.min(ts), hi.max(ts))),
            },
        ) {
            Some(bounds) => bounds,
            None => return Vec::new(),
        };

        let mut ranked: Vec<Ranked> = candidates
            .iter()
            .map(|c| {
                let scores = ComponentScores {
                    lexical: lexical_score(query, &c.title, c.subtitle.as_deref(), &c.text),
                    semantic: c.semantic.unwrap_or(0.0).clamp(0.0, 1.0),
                    recency: min_max_recency(c.created_at_ms, min_ts, max_ts),
                    tag_boost: tag_boost_score(query, &c.tags),
                };
                let final_score = self.weights.lexical * scores.lexical
                    + self.weights.semantic * scores.semantic
                    + self.weights.recency * scores.recency
                    + self.weights.tag * scores.tag_boost;
                Ranked {
                    id: c.id,
                    created_at_ms: c.created_at_ms,
                    final_score,
                    scores,
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
                .then_with(|| b.id.cmp(&a.id))
        });
        ranked
    }
}

/// Lexical overlap between a query and an observation's text fields.
///
/// Whole-query substring hits score `min(1.0, 0.5 + |query| / |text|)`;
/// otherwise the fraction of ≥2-char query words found as substrings.
pub fn lexical_score(query: &str, title: &str, subtitle: Option<&str>, text: &str) -> f64 {
    let query_lower = query.trim().to_lowercase();
    if query_lower.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {} {}", title, subtitle.unwrap_or(""), text).to_lowercase();

    if haystack.contains(&query_lower) {
        let denom = text.chars().count().max(1) as f64;
        return (0.5 + query_lower.chars().count() as f64 / denom).min(1.0);
    }

    let words: Vec<&str> = query_lower
        .split_whitespace()
        .filter(|w| w.chars().count() >= 2)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words.iter().filter(|w| haystack.contains(**w)).count();
    hits as f64 / words.len() as f64
}

/// Min-max normalized recency within a candidate batch; 0.5 when all equal.
fn min_max_recency(created_at_ms: i64, min_ts: i64, max_ts: i64) -> f64 {
    if max_ts == min_ts {
        return 0.5;
    }
    (created_at_ms - min_ts) as f64 / (max_ts - min_ts) as f64
}

/// Coarse age-bucket recency for standalone scoring of a single item.
pub fn recency_bucket_score(created_at_ms: i64, now_ms: i64) -> f64 {
    let age_ms = (now_ms - created_at_ms).max(0);
    const DAY: i64 = 86_400_000;
    match age_ms {
        a if a <= DAY => 1.0,
        a if a <= 7 * DAY => 0.8,
        a if a <= 30 * DAY => 0.5,
        a if a <= 90 * DAY => 0.3,
        _ => 0.1,
    }
}

/// Fraction of tags containing any ≥2-char query word; 0 without tags.
pub fn tag_boost_score(query: &str, tags: &[String]) -> f64 {
    if tags.is_empty() {
        return 0.0;
    }
    let words: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.chars().count() >= 2)
        .map(|w| w.to_string())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let matching = tags
        .iter()
        .filter(|tag| {
            let tag_lower = tag.to_lowercase();
            words.iter().any(|w| tag_lower.contains(w))
        })
        .count();
    matching as f64 / tags.len() as f64
}
