// src/embeddings/mod.rs
// Pluggable embedding provider client
//
// The provider is any OpenAI-compatible `/embeddings` HTTP endpoint, selected
// by configuration. It is non-authoritative: failures here never block
// ingestion or lexical search.

pub mod worker;

use anyhow::{Context, Result, anyhow};
use std::time::Duration;

/// Max characters to embed (longer text is truncated).
pub const MAX_TEXT_CHARS: usize = 8_000;

/// Outbound HTTP timeout for embedding calls.
const TIMEOUT: Duration = Duration::from_secs(3);

/// Embedding endpoint configuration.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingSettings {
    /// Provider URL; embeddings are disabled when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
}

/// HTTP embedding provider (OpenAI-compatible request/response shape).
pub struct HttpEmbeddings {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    http_client: reqwest::Client,
}

impl HttpEmbeddings {
    fn new(endpoint: String, api_key: Option<String>, model: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            endpoint,
            api_key,
            model,
            http_client,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = truncate_for_embedding(text);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.context("embedding request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        let values = json["data"]
            .as_array()
            .and_then(|data| data.first())
            .and_then(|first| first["embedding"].as_array())
            .ok_or_else(|| anyhow!("invalid embedding response"))?;

        Ok(values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect())
    }
}

enum EmbeddingBackend {
    Http(HttpEmbeddings),
    #[cfg(test)]
    Mock(mock::MockEmbeddings),
}

/// Embedding client handed to the worker, the search path and the replicator.
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Build from settings; None when no endpoint is configured.
    pub fn from_settings(settings: &EmbeddingSettings) -> Option<Self> {
        let endpoint = settings.endpoint.as_ref()?;
        tracing::info!(model = %settings.model, "embedding provider configured");
        Some(Self {
            backend: EmbeddingBackend::Http(HttpEmbeddings::new(
                endpoint.clone(),
                settings.api_key.clone(),
                settings.model.clone(),
            )),
        })
    }

    #[cfg(test)]
    pub fn mock(mock: mock::MockEmbeddings) -> Self {
        Self {
            backend: EmbeddingBackend::Mock(mock),
        }
    }

    pub fn model_name(&self) -> &str {
        match &self.backend {
            EmbeddingBackend::Http(c) => &c.model,
            #[cfg(test)]
            EmbeddingBackend::Mock(_) => "mock-embedder",
        }
    }

    /// Embed one text, truncated to MAX_TEXT_CHARS.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::Http(c) => c.embed(text).await,
            #[cfg(test)]
            EmbeddingBackend::Mock(m) => m.embed(text),
        }
    }
}

fn truncate_for_embedding(text: &str) -> &str {
    match text.char_indices().nth(MAX_TEXT_CHARS) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Cosine similarity in [-1, 1]. Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
pub mod mock {
    //! Deterministic in-process embedder for tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct MockEmbeddings {
        /// Fail this many calls before succeeding.
        fail_first: usize,
        calls: AtomicUsize,
    }

    impl MockEmbeddings {
        pub fn new() -> Self {
            Self::failing_first(0)
        }

        pub fn failing_first(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("mock embedding failure {}", call + 1);
            }
            // Character-histogram embedding: deterministic, similar texts close.
            let mut v = [0.0f32; 8];
            for (i, c) in text.chars().enumerate() {
                v[(c as usize + i) % 8] += 1.0;
            }
            Ok(v.to_vec())
        }
    }
}
