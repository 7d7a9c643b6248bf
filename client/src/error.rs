use thiserror::Error;

/// Why a [`crate::transport::Transport::call`] did not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("no open connection")]
    NotConnected,

    #[error("no reply before the call deadline")]
    RequestTimeout,

    #[error("connection lost before the reply arrived")]
    ConnectionLost,

    #[error("call payload must be a JSON object")]
    InvalidPayload,

    /// The server relayed a service rejection.
    #[error("{0}")]
    Service(String),
}

impl CallError {
    /// Transport-level failures are worth re-issuing once reconnected.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::NotConnected | CallError::RequestTimeout | CallError::ConnectionLost
        )
    }
}
