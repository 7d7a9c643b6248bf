//! Boundary to the external messaging service.
//!
//! The gateway never interprets method payloads or results beyond their
//! envelope; everything crossing this boundary is opaque JSON.

use crate::error::{LoginError, ServiceError};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

pub mod driver;
pub mod tdjson;

pub use tdjson::{TdJsonService, TdlibParameters};

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Performs one method call.
    async fn invoke(&self, request: Value) -> Result<Value, ServiceError>;

    /// Unsolicited events emitted from now on.
    fn subscribe(&self) -> broadcast::Receiver<Value>;

    /// Drives the service's login flow to completion, pulling each credential
    /// from `hooks` when the service asks for it. Returns once the service
    /// reports the session as authorized.
    async fn login(&self, hooks: &dyn LoginHooks) -> Result<(), LoginError>;
}

/// The three suspend points of an interactive login.
#[async_trait]
pub trait LoginHooks: Send + Sync {
    async fn phone(&self) -> Result<String, LoginError>;

    async fn code(&self) -> Result<String, LoginError>;

    async fn password(&self) -> Result<String, LoginError>;
}

/// Message of a service-side error object (`{"@type": "error", ...}`), if the
/// value is one.
pub fn error_message(value: &Value) -> Option<String> {
    if value.get("@type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    Some(
        value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown service error")
            .to_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_message_reads_error_objects_only() {
        assert_eq!(
            error_message(&json!({"@type": "error", "code": 400, "message": "PHONE_NUMBER_INVALID"})),
            Some("PHONE_NUMBER_INVALID".to_owned())
        );
        assert_eq!(
            error_message(&json!({"@type": "error"})),
            Some("unknown service error".to_owned())
        );
        assert_eq!(error_message(&json!({"@type": "ok"})), None);
    }
}
