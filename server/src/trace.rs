//! Bounded in-process record of bridge activity, served to the inspection
//! UI through `request_trace_log`.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use serde_json::json;

const TRACE_CAPACITY: usize = 256;

#[derive(Default)]
pub struct TraceLog {
    entries: Mutex<VecDeque<Value>>,
}

impl TraceLog {
    /// Record one bridge event. `direction` is `"in"` or `"out"`.
    pub fn record(&self, direction: &str, session_id: &str, event_name: &str) {
        let entry = json!({
            "direction": direction,
            "session_id": session_id,
            "event": event_name,
            "timestamp": now_epoch_secs(),
        });
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == TRACE_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<Value> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
