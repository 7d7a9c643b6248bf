use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::time::Duration;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Gateway HTTP base URL.
    #[arg(long, env = "PARLEY_ENDPOINT", default_value = "http://127.0.0.1:8090")]
    pub endpoint: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Log in interactively and exit.
    Login,
    /// Log in if needed, then open a session.
    Session(SessionArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct SessionArgs {
    /// Websocket URL; derived from the endpoint when omitted.
    #[arg(long, env = "PARLEY_WS_URL")]
    pub ws_url: Option<String>,

    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub call_timeout: Duration,

    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub reconnect_base: Duration,

    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub reconnect_max: Duration,

    #[arg(long, default_value_t = 10)]
    pub max_attempts: u32,

    /// Call replayed after every (re)connect.
    #[arg(long, default_value = r#"{"@type":"getChats","limit":50}"#)]
    pub bootstrap: String,
}

/// `http(s)://host/...` becomes `ws(s)://host/ws`.
pub fn ws_url_for(endpoint: &str) -> Result<String> {
    let mut url = Url::parse(endpoint).with_context(|| format!("Invalid endpoint {}", endpoint))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("Unsupported endpoint scheme {}", other),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("Cannot derive websocket URL from {}", endpoint);
    }
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
}
