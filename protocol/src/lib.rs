use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Loopback port the daemon listens on. Browser pages connect to
/// `ws://127.0.0.1:5624/` and expect exactly this port, so it is a
/// protocol constant rather than ordinary configuration.
pub const DAEMON_PORT: u16 = 5624;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Integer result codes transmitted with `succeed`/`failed` events.
///
/// `OK` and `SCHEDULED` are the two success variants; everything negative
/// is a failure. Driver implementations may surface their own negative
/// codes through the same channel, so failure checks are `code < 0`, not
/// equality against this list.
pub mod codes {
    pub const OK: i32 = 0;
    pub const SCHEDULED: i32 = 1;
    pub const QUERY_ERROR: i32 = -5;
    pub const EXTERNAL_ERROR: i32 = -7;
    pub const ACCESS_DENIED: i32 = -10;
    pub const NOT_VALIDATED: i32 = -12;
    pub const NOT_TRUSTED: i32 = -13;
    pub const USAGE_ERROR: i32 = -15;
    pub const PASSWORD_DENIED: i32 = -20;
}

/// Bit flags carried by `failure` events.
pub mod failure_flags {
    /// Hardware virtualization is unavailable; the VM cannot keep running.
    pub const NO_VIRTUALIZATION: i32 = 0x01;
}

/// Result codes a page sends back through `interactionCallback`.
pub mod ui {
    pub const OK: i32 = 1;
    pub const CANCEL: i32 = 2;
}

// ---------------------------------------------------------------------------
// Session state codes
// ---------------------------------------------------------------------------

/// Hypervisor session states as they appear in `stateChanged` events and
/// in the `state` entry of the session's local parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum SessionState {
    Missing = 0,
    Available = 1,
    PowerOff = 2,
    Saved = 3,
    Paused = 4,
    Running = 5,
}

impl SessionState {
    pub fn from_code(code: i32) -> SessionState {
        match code {
            1 => SessionState::Available,
            2 => SessionState::PowerOff,
            3 => SessionState::Saved,
            4 => SessionState::Paused,
            5 => SessionState::Running,
            _ => SessionState::Missing,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Action names, resolved at the parsing boundary so the router can match
/// exhaustively instead of comparing strings all over the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Handshake,
    InteractionCallback,
    RequestSession,
    StopService,
    EnumSessions,
    ControlSession,
    Session(SessionVerb),
    /// Unrecognized name. Kept (not rejected) for wire compatibility:
    /// unknown actions are silently ignored.
    Unknown,
}

/// Per-session commands, dispatched to the owning session's controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerb {
    Start,
    Stop,
    Pause,
    Resume,
    Hibernate,
    Reset,
    Close,
    Sync,
    Get,
    Set,
    SetProperty,
}

impl SessionVerb {
    pub fn name(self) -> &'static str {
        match self {
            SessionVerb::Start => "start",
            SessionVerb::Stop => "stop",
            SessionVerb::Pause => "pause",
            SessionVerb::Resume => "resume",
            SessionVerb::Hibernate => "hibernate",
            SessionVerb::Reset => "reset",
            SessionVerb::Close => "close",
            SessionVerb::Sync => "sync",
            SessionVerb::Get => "get",
            SessionVerb::Set => "set",
            SessionVerb::SetProperty => "setProperty",
        }
    }
}

impl Action {
    pub fn parse(name: &str) -> Action {
        match name {
            "handshake" => Action::Handshake,
            "interactionCallback" => Action::InteractionCallback,
            "requestSession" => Action::RequestSession,
            "stopService" => Action::StopService,
            "enumSessions" => Action::EnumSessions,
            "controlSession" => Action::ControlSession,
            "start" => Action::Session(SessionVerb::Start),
            "stop" => Action::Session(SessionVerb::Stop),
            "pause" => Action::Session(SessionVerb::Pause),
            "resume" => Action::Session(SessionVerb::Resume),
            "hibernate" => Action::Session(SessionVerb::Hibernate),
            "reset" => Action::Session(SessionVerb::Reset),
            "close" => Action::Session(SessionVerb::Close),
            "sync" => Action::Session(SessionVerb::Sync),
            "get" => Action::Session(SessionVerb::Get),
            "set" => Action::Session(SessionVerb::Set),
            "setProperty" => Action::Session(SessionVerb::SetProperty),
            _ => Action::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Inbound request frame. `id` is opaque and echoed back on every reply,
/// error, and request-correlated event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Why an inbound frame could not be accepted. The connection answers
/// these with a protocol error, not a disconnect.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame type {0:?} is not \"action\"")]
    NotAction(String),
}

impl ActionFrame {
    /// Parse a text frame into a well-formed `action` object.
    pub fn from_text(text: &str) -> Result<ActionFrame, FrameError> {
        let frame: ActionFrame = serde_json::from_str(text)?;
        if frame.frame_type != "action" {
            return Err(FrameError::NotAction(frame.frame_type));
        }
        Ok(frame)
    }

    pub fn action(&self) -> Action {
        Action::parse(&self.name)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Numeric parameter, accepting both JSON numbers and numeric strings
    /// (pages serialize inconsistently).
    pub fn get_num(&self, key: &str) -> Option<i64> {
        match self.data.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
}

/// Outbound frames. Events carry an optional `id`: the session uuid for
/// session-scoped events, or the originating request id for workflow
/// feedback (`succeed`, `failed`, `started`, `progress`, `completed`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    Reply {
        id: String,
        data: Value,
    },
    Event {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        data: Vec<Value>,
    },
    Error {
        id: String,
        data: ErrorData,
    },
}

impl OutboundFrame {
    pub fn reply(id: impl Into<String>, data: Value) -> OutboundFrame {
        OutboundFrame::Reply { id: id.into(), data }
    }

    pub fn event(name: impl Into<String>, data: Vec<Value>, id: Option<String>) -> OutboundFrame {
        OutboundFrame::Event { name: name.into(), id, data }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> OutboundFrame {
        OutboundFrame::Error {
            id: id.into(),
            data: ErrorData { message: message.into() },
        }
    }
}
