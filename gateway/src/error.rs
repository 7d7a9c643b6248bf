use axum::response::{IntoResponse, Response};
use parley_common::response;
use thiserror::Error;

/// The external service rejected a call. The message is passed through
/// verbatim to whoever issued it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("submitted value must be a non-empty string")]
    InvalidInput,

    #[error("no login step is waiting for this input")]
    NoActiveStep,

    #[error("no input received before the step deadline")]
    StepTimeout,

    #[error("login attempt was reset")]
    Cancelled,

    #[error("service rejected login: {0}")]
    Service(#[from] ServiceError),
}

impl LoginError {
    /// Stable identifier reported in the `error` field of HTTP replies.
    pub fn code(&self) -> &'static str {
        match self {
            LoginError::InvalidInput => "InvalidInput",
            LoginError::NoActiveStep => "NoActiveStep",
            LoginError::StepTimeout => "StepTimeout",
            LoginError::Cancelled => "Cancelled",
            LoginError::Service(_) => "ServiceError",
        }
    }
}

impl IntoResponse for LoginError {
    fn into_response(self) -> Response {
        match &self {
            LoginError::InvalidInput => response::bad_request(self.code(), &self),
            LoginError::NoActiveStep | LoginError::StepTimeout | LoginError::Cancelled => {
                response::conflict(self.code(), &self)
            }
            LoginError::Service(_) => response::bad_gateway(self.code(), &self),
        }
    }
}
