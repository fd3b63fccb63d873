// src/web/state.rs
// Shared application state for the HTTP layer
//
// All services are explicit constructor-injected handles (no hidden
// singletons) so tests can assemble a state from in-memory parts.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::config::{Config, RuntimeSettings};
use crate::db::DatabasePool;
use crate::embeddings::worker::EmbeddingWorker;
use crate::events::EventBroadcaster;
use crate::ingest::IngestProcessor;
use crate::replicator::Replicator;
use crate::search::SearchOrchestrator;
use crate::session_service::SessionService;
use crate::utils::now_ms;

/// Samples kept per route for percentile estimates.
const LATENCY_WINDOW: usize = 512;

#[derive(Default)]
struct RouteStat {
    latencies_ms: VecDeque<u64>,
    requests: u64,
    errors: u64,
}

/// Per-route latency summary for /api/stats.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub requests: u64,
    pub error_rate: f64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

/// Sliding-window per-route latency and error tracking.
#[derive(Default)]
pub struct RouteMetrics {
    routes: Mutex<HashMap<String, RouteStat>>,
}

impl RouteMetrics {
    pub fn record(&self, route: &str, latency_ms: u64, is_error: bool) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let stat = routes.entry(route.to_string()).or_default();
        stat.requests += 1;
        if is_error {
            stat.errors += 1;
        }
        stat.latencies_ms.push_back(latency_ms);
        while stat.latencies_ms.len() > LATENCY_WINDOW {
            stat.latencies_ms.pop_front();
        }
    }

    pub fn summary(&self) -> HashMap<String, RouteSummary> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes
            .iter()
            .map(|(route, stat)| {
                let mut sorted: Vec<u64> = stat.latencies_ms.iter().copied().collect();
                sorted.sort_unstable();
                let percentile = |p: f64| -> u64 {
                    if sorted.is_empty() {
                        return 0;
                    }
                    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
                    sorted[idx.min(sorted.len() - 1)]
                };
                (
                    route.clone(),
                    RouteSummary {
                        requests: stat.requests,
                        error_rate: if stat.requests == 0 {
                            0.0
                        } else {
                            stat.errors as f64 / stat.requests as f64
                        },
                        p50_ms: percentile(0.50),
                        p95_ms: percentile(0.95),
                    },
                )
            })
            .collect()
    }
}

/// Fixed-window request limiter for the ingest endpoint. 0 disables.
pub struct RateLimiter {
    limit_per_minute: u32,
    window: Mutex<(i64, u32)>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            window: Mutex::new((0, 0)),
        }
    }

    /// Returns false when the caller should get a 429.
    pub fn check(&self) -> bool {
        if self.limit_per_minute == 0 {
            return true;
        }
        let minute = now_ms() / 60_000;
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.0 != minute {
            *window = (minute, 0);
        }
        if window.1 >= self.limit_per_minute {
            return false;
        }
        window.1 += 1;
        true
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<DatabasePool>,
    pub sessions: Arc<SessionService>,
    pub ingest: Arc<IngestProcessor>,
    pub embeddings: Arc<EmbeddingWorker>,
    pub search: Arc<SearchOrchestrator>,
    pub replicator: Arc<Replicator>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub settings: Arc<RwLock<RuntimeSettings>>,
    pub config: Arc<Config>,
    pub metrics: Arc<RouteMetrics>,
    pub ingest_limiter: Arc<RateLimiter>,
    /// Set once the background loops have been spawned.
    pub loops_running: Arc<AtomicBool>,
}

impl AppState {
    pub fn settings_snapshot(&self) -> RuntimeSettings {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue_running(&self) -> bool {
        self.loops_running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_summarize_percentiles() {
        let metrics = RouteMetrics::default();
        for ms in [10, 20, 30, 40, 100] {
            metrics.record("/api/search", ms, false);
        }
        metrics.record("/api/search", 500, true);

        let summary = metrics.summary();
        let search = &summary["/api/search"];
        assert_eq!(search.requests, 6);
        assert!(search.error_rate > 0.0);
        assert!(search.p50_ms <= search.p95_ms);
    }

    #[test]
    fn metrics_window_is_bounded() {
        let metrics = RouteMetrics::default();
        for i in 0..(LATENCY_WINDOW as u64 + 100) {
            metrics.record("/api/x", i, false);
        }
        let summary = metrics.summary();
        assert_eq!(summary["/api/x"].requests, LATENCY_WINDOW as u64 + 100);
    }

    #[test]
    fn rate_limiter_caps_within_window() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn zero_limit_disables_limiter() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1_000 {
            assert!(limiter.check());
        }
    }
}
