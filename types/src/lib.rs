use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Envelope field carrying the correlation identifier in both directions.
pub const REQUEST_ID: &str = "requestId";

/// Server -> client reply to one method call.
///
/// Serializes as `{ok: true, result, requestId}` or
/// `{ok: false, error, requestId}`. Malformed frames are answered without a
/// `requestId`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<Value>,
}

impl Reply {
    pub fn success(request_id: Value, result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
            request_id: Some(request_id),
        }
    }

    pub fn failure(request_id: Value, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
            request_id: Some(request_id),
        }
    }

    pub fn malformed(detail: impl fmt::Display) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(format!("MalformedFrame: {}", detail)),
            request_id: None,
        }
    }
}

/// Server -> client unsolicited event. Never carries a `requestId`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub update: Value,
}

/// Any frame the server may send, as seen by the client.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ServerFrame {
    #[serde(default)]
    pub ok: Option<bool>,

    #[serde(default)]
    pub result: Option<Value>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(rename = "requestId", default)]
    pub request_id: Option<Value>,

    #[serde(default)]
    pub update: Option<Value>,
}

impl ServerFrame {
    /// The numeric request identifier, if the frame carries one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.request_id.as_ref().and_then(Value::as_u64)
    }
}

/// Splits an inbound client frame into its request identifier and the method
/// payload that is forwarded to the service.
pub fn take_request_id(frame: &mut Map<String, Value>) -> Option<Value> {
    frame.remove(REQUEST_ID).filter(|id| !id.is_null())
}

/// Steps of the interactive login, each gated by one continuation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Phone,
    Code,
    Password,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Phone => write!(f, "phone"),
            Step::Code => write!(f, "code"),
            Step::Password => write!(f, "password"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    #[default]
    Idle,
    AwaitingPhone,
    AwaitingCode,
    AwaitingPassword,
    Completed,
    Failed,
}

impl LoginState {
    /// True while an attempt is underway and a new one must not start.
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            LoginState::AwaitingPhone | LoginState::AwaitingCode | LoginState::AwaitingPassword
        )
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginState::Idle => write!(f, "idle"),
            LoginState::AwaitingPhone => write!(f, "awaiting_phone"),
            LoginState::AwaitingCode => write!(f, "awaiting_code"),
            LoginState::AwaitingPassword => write!(f, "awaiting_password"),
            LoginState::Completed => write!(f, "completed"),
            LoginState::Failed => write!(f, "failed"),
        }
    }
}

/// What the client should submit next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    Phone,
    Code,
    MaybePassword,
    Password,
    Done,
}

/// Point-in-time view of the login session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginSnapshot {
    pub state: LoginState,

    /// The step whose continuation is currently waiting for input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Step>,

    /// Error code of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /auth/status`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<LoginSnapshot>,
}

/// `POST /auth/start`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub next: NextStep,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<Value>,
}

/// `POST /auth/{phone,code,password}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepResponse {
    pub fn next(next: NextStep) -> Self {
        Self {
            ok: true,
            next: Some(next),
            error: None,
            message: None,
        }
    }
}
