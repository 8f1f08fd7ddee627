//! The declarative tool command language emitted by the model.
//!
//! On the wire a command is `{ "action": <name>, "parameters": <object> }`.
//! Parameter schemas are heterogeneous per action, so the untyped wire shape
//! is validated into [`ToolCommand`] up front and handlers only ever see
//! typed parameters. An unknown action or a missing parameter is an error,
//! never a silent no-op.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

/// A validated tool invocation, one variant per registered action.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCommand {
    CreateFile { filename: String, content: String },
    ReadFile { filename: String },
    ReadProjectFile { filename: String },
    ListAllowedProjectFiles,
    ListDirectory { path: Option<String> },
    DeleteFile { filename: String },
    ExecutePythonScript { script: String },
    ApplyPatch { diff_content: String },
    ListSessions,
    LoadSession { session_name: String },
    SaveSession { session_name: String },
    DeleteSession { session_name: String },
    RequestConfirmation { prompt: String },
    TaskComplete { answer: String },
}

/// Why a `{action, parameters}` object failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("command must be a JSON object with an \"action\" key")]
    NotACommand,
    #[error("action '{action}' is missing required parameter '{name}'")]
    MissingParameter { action: String, name: String },
    #[error("parameter '{name}' of action '{action}' must be a string")]
    BadParameterType { action: String, name: String },
}

fn required_str(
    params: &serde_json::Map<String, Value>,
    action: &str,
    name: &str,
) -> Result<String, CommandError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(CommandError::BadParameterType {
            action: action.to_string(),
            name: name.to_string(),
        }),
        None => Err(CommandError::MissingParameter {
            action: action.to_string(),
            name: name.to_string(),
        }),
    }
}

fn optional_str(
    params: &serde_json::Map<String, Value>,
    action: &str,
    name: &str,
) -> Result<Option<String>, CommandError> {
    match params.get(name) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(CommandError::BadParameterType {
            action: action.to_string(),
            name: name.to_string(),
        }),
    }
}

impl ToolCommand {
    /// The wire name of this command's action.
    pub fn action(&self) -> &'static str {
        match self {
            ToolCommand::CreateFile { .. } => "create_file",
            ToolCommand::ReadFile { .. } => "read_file",
            ToolCommand::ReadProjectFile { .. } => "read_project_file",
            ToolCommand::ListAllowedProjectFiles => "list_allowed_project_files",
            ToolCommand::ListDirectory { .. } => "list_directory",
            ToolCommand::DeleteFile { .. } => "delete_file",
            ToolCommand::ExecutePythonScript { .. } => "execute_python_script",
            ToolCommand::ApplyPatch { .. } => "apply_patch",
            ToolCommand::ListSessions => "list_sessions",
            ToolCommand::LoadSession { .. } => "load_session",
            ToolCommand::SaveSession { .. } => "save_session",
            ToolCommand::DeleteSession { .. } => "delete_session",
            ToolCommand::RequestConfirmation { .. } => "request_confirmation",
            ToolCommand::TaskComplete { .. } => "task_complete",
        }
    }

    /// Validate an untyped `{action, parameters}` value into a typed command.
    pub fn from_value(value: &Value) -> Result<Self, CommandError> {
        let obj = value.as_object().ok_or(CommandError::NotACommand)?;
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or(CommandError::NotACommand)?;

        static EMPTY: std::sync::OnceLock<serde_json::Map<String, Value>> =
            std::sync::OnceLock::new();
        let params = obj
            .get("parameters")
            .and_then(Value::as_object)
            .unwrap_or_else(|| EMPTY.get_or_init(serde_json::Map::new));

        let command = match action {
            "create_file" => ToolCommand::CreateFile {
                filename: required_str(params, action, "filename")?,
                content: required_str(params, action, "content")?,
            },
            "read_file" => ToolCommand::ReadFile {
                filename: required_str(params, action, "filename")?,
            },
            "read_project_file" => ToolCommand::ReadProjectFile {
                filename: required_str(params, action, "filename")?,
            },
            "list_allowed_project_files" => ToolCommand::ListAllowedProjectFiles,
            "list_directory" => ToolCommand::ListDirectory {
                path: optional_str(params, action, "path")?,
            },
            "delete_file" => ToolCommand::DeleteFile {
                filename: required_str(params, action, "filename")?,
            },
            "execute_python_script" => ToolCommand::ExecutePythonScript {
                script: required_str(params, action, "script")?,
            },
            "apply_patch" => ToolCommand::ApplyPatch {
                diff_content: required_str(params, action, "diff_content")?,
            },
            "list_sessions" => ToolCommand::ListSessions,
            "load_session" => ToolCommand::LoadSession {
                session_name: required_str(params, action, "session_name")?,
            },
            "save_session" => ToolCommand::SaveSession {
                session_name: required_str(params, action, "session_name")?,
            },
            "delete_session" => ToolCommand::DeleteSession {
                session_name: required_str(params, action, "session_name")?,
            },
            "request_confirmation" => ToolCommand::RequestConfirmation {
                prompt: required_str(params, action, "prompt")?,
            },
            "task_complete" => ToolCommand::TaskComplete {
                answer: required_str(params, action, "answer")?,
            },
            other => return Err(CommandError::UnknownAction(other.to_string())),
        };
        Ok(command)
    }

    /// Render back to the `{action, parameters}` wire shape.
    pub fn to_value(&self) -> Value {
        let parameters = match self {
            ToolCommand::CreateFile { filename, content } => {
                json!({ "filename": filename, "content": content })
            }
            ToolCommand::ReadFile { filename }
            | ToolCommand::ReadProjectFile { filename }
            | ToolCommand::DeleteFile { filename } => json!({ "filename": filename }),
            ToolCommand::ListAllowedProjectFiles | ToolCommand::ListSessions => json!({}),
            ToolCommand::ListDirectory { path } => match path {
                Some(path) => json!({ "path": path }),
                None => json!({}),
            },
            ToolCommand::ExecutePythonScript { script } => json!({ "script": script }),
            ToolCommand::ApplyPatch { diff_content } => json!({ "diff_content": diff_content }),
            ToolCommand::LoadSession { session_name }
            | ToolCommand::SaveSession { session_name }
            | ToolCommand::DeleteSession { session_name } => {
                json!({ "session_name": session_name })
            }
            ToolCommand::RequestConfirmation { prompt } => json!({ "prompt": prompt }),
            ToolCommand::TaskComplete { answer } => json!({ "answer": answer }),
        };
        json!({ "action": self.action(), "parameters": parameters })
    }
}

/// Outcome of one tool invocation, fed back to the model as an observation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolResult {
    pub status: ToolStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>) -> Self {
        ToolResult {
            status: ToolStatus::Success,
            message: message.into(),
            content: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, content: Value) -> Self {
        ToolResult {
            status: ToolStatus::Success,
            message: message.into(),
            content: Some(content),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        ToolResult {
            status: ToolStatus::Error,
            message: message.into(),
            content: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// What the response parser extracted from one raw model reply.
///
/// `command_error` carries the validation failure when a command-shaped
/// object was found but did not validate (unknown action, bad parameters);
/// the loop reports it to the model as a tool error so it can resample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAgentResponse {
    pub prose: String,
    pub command: Option<ToolCommand>,
    pub command_error: Option<String>,
}
