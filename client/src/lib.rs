pub mod args;
pub mod auth;
pub mod backoff;
pub mod connector;
pub mod console;
pub mod error;
pub mod transport;

pub use error::CallError;
pub use transport::{LinkState, Renderer, Transport, TransportConfig};
