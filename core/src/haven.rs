//! Proxy to Haven, the out-of-process model host.
//!
//! Haven owns the model credentials and a per-session chat history keyed by
//! session name; this side only ever sends deltas. The RPC surface is
//! JSON-over-HTTP (`POST /api/<op>`) with an optional bearer key. Calls are
//! bounded by a per-call timeout; a timeout becomes an observation the loop
//! can recover from, while an unreachable host ends the loop.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use crate::error::PhoenixErr;
use crate::error::Result;

/// One history entry in the shape Haven expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// The model-host operations the engine depends on. A trait so the
/// reasoning loop can run against a scripted host in tests.
#[async_trait]
pub trait ModelHost: Send + Sync {
    /// Returns `true` when the session already existed on the host.
    async fn get_or_create_session(&self, name: &str, history: &[HistoryEntry]) -> Result<bool>;

    /// Stateful send: Haven appends both sides to its own history.
    async fn send_message(&self, name: &str, prompt: &str) -> Result<String>;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    async fn delete_session(&self, name: &str) -> Result<()>;

    async fn has_session(&self, name: &str) -> Result<bool>;

    async fn get_trace_log(&self) -> Result<Vec<Value>>;
}

pub struct HavenClient {
    base_url: String,
    auth_key: String,
    client: reqwest::Client,
}

impl HavenClient {
    pub fn new(address: &str, auth_key: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PhoenixErr::Unknown(format!("failed to build HTTP client: {e}")))?;
        Ok(HavenClient {
            base_url: format!("http://{address}"),
            auth_key: auth_key.to_string(),
            client,
        })
    }

    async fn call(&self, op: &str, body: Value) -> Result<Value> {
        let url = format!("{}/api/{op}", self.base_url);
        debug!(op, "haven rpc");
        let mut request = self.client.post(&url).json(&body);
        if !self.auth_key.is_empty() {
            request = request.bearer_auth(&self.auth_key);
        }

        let response = request.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(PhoenixErr::ModelHostUnavailable(format!(
                "haven returned {status} for {op}"
            )));
        }
        if !status.is_success() {
            return Err(PhoenixErr::Unknown(format!(
                "haven rejected {op} with {status}"
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PhoenixErr::Parse(format!("haven sent malformed JSON for {op}: {e}")))
    }
}

fn classify_transport_error(err: reqwest::Error) -> PhoenixErr {
    if err.is_timeout() {
        PhoenixErr::ModelHostTimeout
    } else {
        PhoenixErr::ModelHostUnavailable(err.to_string())
    }
}

#[async_trait]
impl ModelHost for HavenClient {
    async fn get_or_create_session(&self, name: &str, history: &[HistoryEntry]) -> Result<bool> {
        let body = json!({ "name": name, "history": history });
        let reply = self.call("get_or_create_session", body).await?;
        Ok(reply["existed"].as_bool().unwrap_or(false))
    }

    async fn send_message(&self, name: &str, prompt: &str) -> Result<String> {
        let body = json!({ "name": name, "prompt": prompt });
        let reply = self.call("send_message", body).await?;
        reply["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PhoenixErr::Parse("haven reply had no 'text' field".to_string()))
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let reply = self.call("list_sessions", json!({})).await?;
        Ok(reply["sessions"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_session(&self, name: &str) -> Result<()> {
        self.call("delete_session", json!({ "name": name })).await?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> Result<bool> {
        let reply = self.call("has_session", json!({ "name": name })).await?;
        Ok(reply["exists"].as_bool().unwrap_or(false))
    }

    async fn get_trace_log(&self) -> Result<Vec<Value>> {
        let reply = self.call("get_trace_log", json!({})).await?;
        Ok(reply["events"].as_array().cloned().unwrap_or_default())
    }
}
