//! Environment-driven configuration.
//!
//! Every knob has a default that works for local development; the
//! environment overrides them one by one (the server binary loads `.env`
//! first, so a checked-in dotenv file behaves like configuration).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SERVER_PORT: u16 = 5001;
const DEFAULT_ABSOLUTE_MAX_ITERATIONS: usize = 10;
const DEFAULT_NOMINAL_MAX_ITERATIONS: usize = 3;
const DEFAULT_SEGMENT_THRESHOLD: usize = 20;
const DEFAULT_MODEL_CALL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SANDBOX_DIR: &str = "sandbox";
const DEFAULT_STORE_DIR: &str = "chroma_db";
const DEFAULT_HAVEN_ADDRESS: &str = "127.0.0.1:50051";

/// Server-owned files the model may inspect through `read_project_file`.
/// Relative to the working directory; nothing outside this list is readable.
const DEFAULT_PROJECT_FILE_ALLOW_LIST: &[&str] = &[
    "server/src/main.rs",
    "server/src/ws.rs",
    "core/src/reasoning.rs",
    "core/src/tools/mod.rs",
    "protocol/src/protocol.rs",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub project_id: Option<String>,
    pub location: Option<String>,

    pub server_port: u16,

    /// `host:port` of the Haven model host process.
    pub haven_address: String,
    /// Bearer key presented to Haven on every call; empty disables the header.
    pub haven_auth_key: String,

    /// Hard cap on model calls per task.
    pub absolute_max_iterations: usize,
    /// After this many iterations without a terminator the model is nudged
    /// to finalize.
    pub nominal_max_iterations: usize,

    /// Number of trailing turns re-read into the conversational buffer when
    /// a session is (re)constructed.
    pub segment_threshold: usize,

    pub debug_mode: bool,

    /// Root of all user-visible tool I/O. Created on startup if absent.
    pub sandbox_dir: PathBuf,
    /// Root of the persistent vector collections.
    pub store_dir: PathBuf,

    pub project_file_allow_list: Vec<PathBuf>,

    /// Remote embedding endpoint; when unset a deterministic local embedder
    /// is used instead.
    pub embedding_endpoint: Option<String>,
    pub embedding_api_key: Option<String>,

    pub model_call_timeout: Duration,
    /// Bound on one dispatched tool call, enforced by the reasoning loop.
    pub tool_timeout: Duration,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            tracing::warn!("ignoring unparsable value for {key}");
            default
        }
        None => default,
    }
}

impl Config {
    /// Build a config from the process environment.
    pub fn from_env() -> Self {
        let allow_list = match env_string("PROJECT_FILE_ALLOW_LIST") {
            Some(csv) => csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            None => DEFAULT_PROJECT_FILE_ALLOW_LIST
                .iter()
                .map(PathBuf::from)
                .collect(),
        };

        Config {
            project_id: env_string("PROJECT_ID"),
            location: env_string("LOCATION"),
            server_port: env_parsed("SERVER_PORT", DEFAULT_SERVER_PORT),
            haven_address: env_string("HAVEN_ADDRESS")
                .unwrap_or_else(|| DEFAULT_HAVEN_ADDRESS.to_string()),
            haven_auth_key: env_string("HAVEN_AUTH_KEY").unwrap_or_default(),
            absolute_max_iterations: env_parsed(
                "ABSOLUTE_MAX_ITERATIONS_REASONING_LOOP",
                DEFAULT_ABSOLUTE_MAX_ITERATIONS,
            ),
            nominal_max_iterations: env_parsed(
                "NOMINAL_MAX_ITERATIONS_REASONING_LOOP",
                DEFAULT_NOMINAL_MAX_ITERATIONS,
            ),
            segment_threshold: env_parsed("SEGMENT_THRESHOLD", DEFAULT_SEGMENT_THRESHOLD),
            debug_mode: env_parsed("DEBUG_MODE", false),
            sandbox_dir: PathBuf::from(
                env_string("SANDBOX_DIR").unwrap_or_else(|| DEFAULT_SANDBOX_DIR.to_string()),
            ),
            store_dir: PathBuf::from(
                env_string("VECTOR_STORE_DIR").unwrap_or_else(|| DEFAULT_STORE_DIR.to_string()),
            ),
            project_file_allow_list: allow_list,
            embedding_endpoint: env_string("EMBEDDING_ENDPOINT"),
            embedding_api_key: env_string("EMBEDDING_API_KEY"),
            model_call_timeout: Duration::from_secs(env_parsed(
                "MODEL_CALL_TIMEOUT_SECS",
                DEFAULT_MODEL_CALL_TIMEOUT_SECS,
            )),
            tool_timeout: Duration::from_secs(env_parsed(
                "TOOL_TIMEOUT_SECS",
                DEFAULT_TOOL_TIMEOUT_SECS,
            )),
        }
    }

    /// A config rooted at explicit directories; used by tests and by any
    /// embedder that wants isolation from the process environment.
    pub fn with_roots(sandbox_dir: PathBuf, store_dir: PathBuf) -> Self {
        Config {
            project_id: None,
            location: None,
            server_port: DEFAULT_SERVER_PORT,
            haven_address: DEFAULT_HAVEN_ADDRESS.to_string(),
            haven_auth_key: String::new(),
            absolute_max_iterations: DEFAULT_ABSOLUTE_MAX_ITERATIONS,
            nominal_max_iterations: DEFAULT_NOMINAL_MAX_ITERATIONS,
            segment_threshold: DEFAULT_SEGMENT_THRESHOLD,
            debug_mode: false,
            sandbox_dir,
            store_dir,
            project_file_allow_list: Vec::new(),
            embedding_endpoint: None,
            embedding_api_key: None,
            model_call_timeout: Duration::from_secs(DEFAULT_MODEL_CALL_TIMEOUT_SECS),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::with_roots(PathBuf::from("sb"), PathBuf::from("db"));
        assert_eq!(config.server_port, 5001);
        assert_eq!(config.absolute_max_iterations, 10);
        assert_eq!(config.nominal_max_iterations, 3);
        assert_eq!(config.segment_threshold, 20);
        assert_eq!(config.model_call_timeout, Duration::from_secs(120));
    }
}
