pub mod app;
pub mod args;
pub mod auth;
pub mod bridge;
pub mod error;
pub mod login;
pub mod registry;
pub mod server;
pub mod service;

#[cfg(test)]
mod testing;
