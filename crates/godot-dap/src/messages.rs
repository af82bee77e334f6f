//! DAP message envelopes and the incoming-message classifier.
//!
//! Classification is a two-phase tagged decode: the `type` discriminator is
//! inspected first, then the `command`/`event` name selects a typed payload
//! decoder. An incoming response with `success: false` becomes
//! [`Incoming::ErrorResponse`], never an event, so the caller that issued
//! the request fails fast with the adapter's message instead of blocking
//! until its deadline. Unknown event names are preserved as
//! [`Event::Unknown`] with their raw body.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DapError, Result};

/// Outgoing request envelope. Also decoded by the mock peer in tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl RequestMessage {
    pub fn new(seq: u64, command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            seq,
            kind: "request".to_string(),
            command: command.into(),
            arguments,
        }
    }
}

/// Incoming response envelope (success and failure share one shape on the
/// wire; `success` discriminates).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub request_seq: u64,
    pub success: bool,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Incoming event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// One classified incoming message.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// A successful response; `body` is decoded per command by the caller.
    Response {
        request_seq: u64,
        command: String,
        body: Option<Value>,
    },
    /// A response with `success: false`, carrying the adapter's message.
    ErrorResponse {
        request_seq: u64,
        command: String,
        message: String,
    },
    Event(Event),
    /// A reverse request from the adapter (e.g. `runInTerminal`). The engine
    /// does not implement any, so the read loop logs and drops these.
    Request(RequestMessage),
}

/// Classifies one decoded frame body.
pub fn classify(bytes: &[u8]) -> Result<Incoming> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|err| DapError::Encoding(err.to_string()))?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "response" => {
            let message: ResponseMessage = serde_json::from_value(value)
                .map_err(|err| DapError::Encoding(format!("malformed response: {err}")))?;
            if message.success {
                Ok(Incoming::Response {
                    request_seq: message.request_seq,
                    command: message.command,
                    body: message.body,
                })
            } else {
                Ok(Incoming::ErrorResponse {
                    request_seq: message.request_seq,
                    command: message.command,
                    message: message
                        .message
                        .unwrap_or_else(|| "request failed".to_string()),
                })
            }
        }
        "event" => {
            let message: EventMessage = serde_json::from_value(value)
                .map_err(|err| DapError::Encoding(format!("malformed event: {err}")))?;
            Ok(Incoming::Event(Event::decode(message)?))
        }
        "request" => {
            let message: RequestMessage = serde_json::from_value(value)
                .map_err(|err| DapError::Encoding(format!("malformed request: {err}")))?;
            Ok(Incoming::Request(message))
        }
        other => Err(DapError::Encoding(format!(
            "unknown message type {other:?}"
        ))),
    }
}

/// Unsolicited adapter events.
#[derive(Debug, Clone)]
pub enum Event {
    Initialized,
    Stopped(StoppedBody),
    Continued(ContinuedBody),
    Exited(ExitedBody),
    Terminated,
    Thread(ThreadBody),
    Output(OutputBody),
    Process(ProcessBody),
    Breakpoint(BreakpointBody),
    /// An event name this engine does not model. Kept (name + raw body) so
    /// observers can still log or react to it.
    Unknown {
        event: String,
        body: Option<Value>,
    },
}

impl Event {
    fn decode(message: EventMessage) -> Result<Self> {
        let EventMessage { event, body, .. } = message;
        let decoded = match event.as_str() {
            "initialized" => Event::Initialized,
            "stopped" => Event::Stopped(decode_event_body(&event, body)?),
            "continued" => Event::Continued(decode_event_body(&event, body)?),
            "exited" => Event::Exited(decode_event_body(&event, body)?),
            "terminated" => Event::Terminated,
            "thread" => Event::Thread(decode_event_body(&event, body)?),
            "output" => Event::Output(decode_event_body(&event, body)?),
            "process" => Event::Process(decode_event_body(&event, body)?),
            "breakpoint" => Event::Breakpoint(decode_event_body(&event, body)?),
            _ => Event::Unknown { event, body },
        };
        Ok(decoded)
    }

    pub fn name(&self) -> &str {
        match self {
            Event::Initialized => "initialized",
            Event::Stopped(_) => "stopped",
            Event::Continued(_) => "continued",
            Event::Exited(_) => "exited",
            Event::Terminated => "terminated",
            Event::Thread(_) => "thread",
            Event::Output(_) => "output",
            Event::Process(_) => "process",
            Event::Breakpoint(_) => "breakpoint",
            Event::Unknown { event, .. } => event,
        }
    }
}

fn decode_event_body<T: DeserializeOwned>(event: &str, body: Option<Value>) -> Result<T> {
    serde_json::from_value(body.unwrap_or(Value::Null))
        .map_err(|err| DapError::Encoding(format!("malformed {event} event body: {err}")))
}

// ---------------------------------------------------------------------------
// Event bodies.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedBody {
    pub reason: String,
    #[serde(default)]
    pub thread_id: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub all_threads_stopped: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedBody {
    #[serde(default)]
    pub thread_id: u64,
    #[serde(default)]
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitedBody {
    pub exit_code: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadBody {
    pub reason: String,
    pub thread_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputBody {
    #[serde(default)]
    pub category: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBody {
    pub name: String,
    #[serde(default)]
    pub system_process_id: Option<i64>,
    #[serde(default)]
    pub is_local_process: bool,
    #[serde(default)]
    pub start_method: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakpointBody {
    pub reason: String,
    pub breakpoint: Breakpoint,
}

// ---------------------------------------------------------------------------
// Request arguments.

/// `initialize` request arguments. The defaults identify this client the way
/// the Godot adapter expects (1-based lines/columns, plain paths).
#[derive(Debug, Clone, Serialize)]
pub struct InitializeArguments {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "clientName")]
    pub client_name: String,
    #[serde(rename = "adapterID")]
    pub adapter_id: String,
    pub locale: String,
    #[serde(rename = "linesStartAt1")]
    pub lines_start_at1: bool,
    #[serde(rename = "columnsStartAt1")]
    pub columns_start_at1: bool,
    #[serde(rename = "pathFormat")]
    pub path_format: String,
    #[serde(rename = "supportsVariableType")]
    pub supports_variable_type: bool,
    #[serde(rename = "supportsVariablePaging")]
    pub supports_variable_paging: bool,
    #[serde(rename = "supportsRunInTerminalRequest")]
    pub supports_run_in_terminal_request: bool,
}

impl Default for InitializeArguments {
    fn default() -> Self {
        Self {
            client_id: "godot-dap".to_string(),
            client_name: "Godot DAP Client".to_string(),
            adapter_id: "godot".to_string(),
            locale: "en-US".to_string(),
            lines_start_at1: true,
            columns_start_at1: true,
            path_format: "path".to_string(),
            supports_variable_type: true,
            supports_variable_paging: false,
            supports_run_in_terminal_request: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SetBreakpointsArguments {
    pub source: Source,
    pub breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceBreakpoint {
    pub line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Shared by `continue`, `next`, `stepIn`, `stepOut`, and `pause`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadArguments {
    pub thread_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceArguments {
    pub thread_id: u64,
    pub start_frame: u64,
    pub levels: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArguments {
    pub frame_id: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesArguments {
    pub variables_reference: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateArguments {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<u64>,
    pub context: String,
}

// ---------------------------------------------------------------------------
// Response bodies and shared payload types.

/// The subset of adapter capabilities Godot reports. Unknown capability
/// fields are ignored; absent ones default to `false`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub supports_configuration_done_request: bool,
    #[serde(default)]
    pub supports_conditional_breakpoints: bool,
    #[serde(default)]
    pub supports_evaluate_for_hovers: bool,
    #[serde(default)]
    pub supports_set_variable: bool,
    #[serde(default)]
    pub supports_terminate_request: bool,
    #[serde(default)]
    pub supports_restart_request: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A breakpoint as reported by the adapter. `verified` is authoritative only
/// as reported; an unverified breakpoint may still become active once the
/// referenced script loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetBreakpointsBody {
    pub breakpoints: Vec<Breakpoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOutcome {
    #[serde(default)]
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadsBody {
    pub threads: Vec<Thread>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub source: Option<Source>,
    pub line: u64,
    #[serde(default)]
    pub column: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    pub stack_frames: Vec<StackFrame>,
    #[serde(default)]
    pub total_frames: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: u64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopesBody {
    pub scopes: Vec<Scope>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub variables_reference: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariablesBody {
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateOutcome {
    pub result: String,
    #[serde(default, rename = "type")]
    pub type_: Option<String>,
    #[serde(default)]
    pub variables_reference: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn classifies_a_successful_response() {
        let incoming = classify(&bytes(json!({
            "seq": 7,
            "type": "response",
            "request_seq": 3,
            "success": true,
            "command": "threads",
            "body": {"threads": [{"id": 1, "name": "Main"}]}
        })))
        .unwrap();

        match incoming {
            Incoming::Response {
                request_seq,
                command,
                body,
            } => {
                assert_eq!(request_seq, 3);
                assert_eq!(command, "threads");
                assert!(body.is_some());
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn error_responses_are_not_events() {
        let incoming = classify(&bytes(json!({
            "seq": 8,
            "type": "response",
            "request_seq": 5,
            "success": false,
            "command": "launch",
            "message": "wrong_path"
        })))
        .unwrap();

        match incoming {
            Incoming::ErrorResponse {
                request_seq,
                message,
                ..
            } => {
                assert_eq!(request_seq, 5);
                assert_eq!(message, "wrong_path");
            }
            other => panic!("expected an error response, got {other:?}"),
        }
    }

    #[test]
    fn decodes_a_stopped_event() {
        let incoming = classify(&bytes(json!({
            "seq": 9,
            "type": "event",
            "event": "stopped",
            "body": {"reason": "breakpoint", "threadId": 1}
        })))
        .unwrap();

        match incoming {
            Incoming::Event(Event::Stopped(body)) => {
                assert_eq!(body.reason, "breakpoint");
                assert_eq!(body.thread_id, 1);
            }
            other => panic!("expected a stopped event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_events_keep_their_name_and_body() {
        let incoming = classify(&bytes(json!({
            "seq": 10,
            "type": "event",
            "event": "godotCustomTelemetry",
            "body": {"fps": 60}
        })))
        .unwrap();

        match incoming {
            Incoming::Event(Event::Unknown { event, body }) => {
                assert_eq!(event, "godotCustomTelemetry");
                assert_eq!(body.unwrap()["fps"], 60);
            }
            other => panic!("expected an unknown event, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_an_encoding_error() {
        let err = classify(&bytes(json!({"seq": 1, "type": "telegram"}))).unwrap_err();
        assert!(matches!(err, DapError::Encoding(_)), "got {err:?}");
    }

    #[test]
    fn reverse_requests_are_classified_not_rejected() {
        let incoming = classify(&bytes(json!({
            "seq": 11,
            "type": "request",
            "command": "runInTerminal"
        })))
        .unwrap();
        assert!(matches!(incoming, Incoming::Request(_)));
    }

    #[test]
    fn initialize_arguments_use_the_adapter_field_names() {
        let value = serde_json::to_value(InitializeArguments::default()).unwrap();
        assert_eq!(value["clientID"], "godot-dap");
        assert_eq!(value["adapterID"], "godot");
        assert_eq!(value["linesStartAt1"], true);
        assert_eq!(value["pathFormat"], "path");
    }

    #[test]
    fn capabilities_tolerate_missing_and_unknown_fields() {
        let capabilities: Capabilities = serde_json::from_value(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsANewThingWeDoNotKnow": true
        }))
        .unwrap();
        assert!(capabilities.supports_configuration_done_request);
        assert!(!capabilities.supports_conditional_breakpoints);
    }
}
