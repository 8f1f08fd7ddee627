//! Process-wide embedding function.
//!
//! Initialized lazily on first use and shared read-only afterwards. With
//! `EMBEDDING_ENDPOINT` configured, texts are embedded by an external
//! OpenAI-shaped `/embeddings` service; without it, a deterministic
//! feature-hashing embedder keeps retrieval fully functional offline. A
//! remote failure degrades to a zero vector rather than failing the caller:
//! memory retrieval is best-effort by design.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;

/// Dimension of the local feature-hashing embedder.
pub const HASHED_EMBEDDING_DIM: usize = 256;

static EMBEDDER: OnceLock<Embedder> = OnceLock::new();

/// The shared embedding function for this process.
pub fn global(config: &Config) -> &'static Embedder {
    EMBEDDER.get_or_init(|| match &config.embedding_endpoint {
        Some(endpoint) => Embedder::Remote(RemoteEmbedder::new(
            endpoint.clone(),
            config.embedding_api_key.clone(),
        )),
        None => Embedder::Hashing,
    })
}

#[derive(Debug)]
pub enum Embedder {
    Remote(RemoteEmbedder),
    Hashing,
}

impl Embedder {
    /// Embed one text. Infallible: remote failures are logged and yield a
    /// zero vector, which simply ranks last under cosine similarity.
    pub fn embed(&self, text: &str) -> Vec<f32> {
        match self {
            Embedder::Remote(remote) => remote.embed(text),
            Embedder::Hashing => hashed_embedding(text),
        }
    }
}

#[derive(Debug)]
pub struct RemoteEmbedder {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl RemoteEmbedder {
    fn new(endpoint: String, api_key: Option<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        RemoteEmbedder {
            endpoint,
            api_key,
            client,
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.endpoint.trim_end_matches('/')))
            .json(&serde_json::json!({ "input": text, "encoding_format": "float" }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        match request.send().and_then(|r| r.error_for_status()) {
            Ok(response) => match response.json::<serde_json::Value>() {
                Ok(body) => {
                    let vector: Vec<f32> = body["data"][0]["embedding"]
                        .as_array()
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect()
                        })
                        .unwrap_or_default();
                    if vector.is_empty() {
                        warn!("embedding endpoint returned no vector");
                        vec![0.0; HASHED_EMBEDDING_DIM]
                    } else {
                        vector
                    }
                }
                Err(err) => {
                    warn!("embedding response was not JSON: {err}");
                    vec![0.0; HASHED_EMBEDDING_DIM]
                }
            },
            Err(err) => {
                warn!("embedding request failed: {err}");
                vec![0.0; HASHED_EMBEDDING_DIM]
            }
        }
    }
}

/// Deterministic bag-of-words feature hashing, L2-normalized. Not a
/// semantic model, but stable, offline, and good enough for nearest-turn
/// retrieval over one session's vocabulary.
fn hashed_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; HASHED_EMBEDDING_DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % HASHED_EMBEDDING_DIM;
        vector[bucket] += 1.0;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Cosine similarity; zero for mismatched dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
