//! Defines the event channel between the browser client and the server.
//!
//! Every frame, in both directions, is a JSON object of the shape
//! `{ "event": <name>, "payload": <object> }`. Within one connection the
//! server's events are totally ordered; across connections there are no
//! ordering guarantees.

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Inbound frame - requests from the browser client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Display)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClientEvent {
    /// Kick off a reasoning loop for the given prompt.
    StartTask(StartTaskEvent),

    /// The user's answer to an outstanding confirmation request.
    UserConfirmation(UserConfirmationEvent),

    /// Ask for the list of saved sessions.
    RequestSessionList(EmptyPayload),

    /// Ask for the current session's human-readable name.
    RequestSessionName(EmptyPayload),

    /// Client-side audit record; forwarded to the audit sink.
    LogAuditEvent(AuditEvent),

    /// Inspection: list the on-disk vector collections.
    RequestDbCollections(EmptyPayload),

    /// Inspection: dump one collection's records.
    RequestDbCollectionData(CollectionDataRequest),

    /// Inspection: recent server-side bridge activity.
    RequestTraceLog(EmptyPayload),

    /// Inspection: the model host's own trace log.
    RequestHavenTraceLog(EmptyPayload),
}

/// Outbound frame - rendering events pushed to the browser client.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Display)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServerEvent {
    /// A line for the chat transcript, typed so the client can style it.
    LogMessage(LogMessageEvent),

    /// Raw tool activity, rendered in the collapsible tool pane.
    ToolLog(ToolLogEvent),

    /// Echo of an accepted user prompt.
    DisplayUserPrompt(DisplayUserPromptEvent),

    /// Ask the user a yes/no question; the loop is suspended until
    /// `user_confirmation` arrives (or the connection drops).
    RequestUserConfirmation(RequestUserConfirmationEvent),

    SessionListUpdate(SessionListUpdateEvent),

    SessionNameUpdate(SessionNameUpdateEvent),

    /// Reset the chat view; precedes a history replay.
    ClearChatHistory(EmptyPayload),

    DbCollectionsUpdate(DbCollectionsUpdateEvent),

    DbCollectionDataUpdate(DbCollectionDataUpdateEvent),

    TraceLogUpdate(TraceLogUpdateEvent),

    HavenTraceLogUpdate(HavenTraceLogUpdateEvent),
}

/// Empty `payload` object. The wire contract always carries a payload key,
/// so parameterless events use this instead of a unit variant.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct EmptyPayload {}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct StartTaskEvent {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserConfirmationEvent {
    pub response: ConfirmationResponse,
}

/// The two legal answers to a confirmation request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfirmationResponse {
    Yes,
    No,
}

impl ConfirmationResponse {
    pub fn is_yes(self) -> bool {
        matches!(self, ConfirmationResponse::Yes)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub event: String,
    pub details: String,
    pub source: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flow: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CollectionDataRequest {
    pub collection: String,
}

/// Classifies a `log_message` so the client can style terminal messages,
/// transient notices and confirmation prompts differently.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogMessageKind {
    User,
    FinalAnswer,
    Info,
    SystemConfirm,
    SystemConfirmReplayed,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogMessageEvent {
    #[serde(rename = "type")]
    pub kind: LogMessageKind,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ToolLogEvent {
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DisplayUserPromptEvent {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RequestUserConfirmationEvent {
    pub prompt: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionListUpdateEvent {
    pub status: String,
    pub content: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionNameUpdateEvent {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DbCollectionsUpdateEvent {
    pub status: String,
    pub content: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DbCollectionDataUpdateEvent {
    pub status: String,
    pub collection: String,
    pub content: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TraceLogUpdateEvent {
    pub content: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HavenTraceLogUpdateEvent {
    pub content: Vec<serde_json::Value>,
}

impl ServerEvent {
    /// Convenience constructor for the most common outbound frame.
    pub fn log(kind: LogMessageKind, data: impl Into<String>) -> Self {
        ServerEvent::LogMessage(LogMessageEvent {
            kind,
            data: data.into(),
        })
    }

    pub fn tool_log(data: impl Into<String>) -> Self {
        ServerEvent::ToolLog(ToolLogEvent { data: data.into() })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_event_wire_shape() {
        let frame = r#"{"event":"start_task","payload":{"prompt":"hello"}}"#;
        let parsed: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(
            parsed,
            ClientEvent::StartTask(StartTaskEvent {
                prompt: "hello".to_string()
            })
        );
    }

    #[test]
    fn confirmation_response_is_lowercase() {
        let frame = r#"{"event":"user_confirmation","payload":{"response":"yes"}}"#;
        let parsed: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(
            parsed,
            ClientEvent::UserConfirmation(UserConfirmationEvent {
                response: ConfirmationResponse::Yes
            })
        );
    }

    #[test]
    fn log_message_uses_type_key() {
        let event = ServerEvent::log(LogMessageKind::FinalAnswer, "Hi.");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "log_message");
        assert_eq!(json["payload"]["type"], "final_answer");
        assert_eq!(json["payload"]["data"], "Hi.");
    }

    #[test]
    fn parameterless_events_round_trip() {
        let frame = r#"{"event":"request_session_list","payload":{}}"#;
        let parsed: ClientEvent = serde_json::from_str(frame).unwrap();
        assert_eq!(parsed, ClientEvent::RequestSessionList(EmptyPayload {}));
        let back = serde_json::to_string(&parsed).unwrap();
        assert_eq!(back, frame);
    }
}
