use clap::{Parser, Subcommand};
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    Server(ServerArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[arg(long, env = "PORT", default_value_t = 8090)]
    pub port: u16,

    /// Address of the TDLib JSON sidecar.
    #[arg(long, env = "SERVICE_ADDR", default_value = "127.0.0.1:8091")]
    pub service_addr: String,

    #[arg(long, env = "API_ID")]
    pub api_id: i64,

    #[arg(long, env = "API_HASH")]
    pub api_hash: String,

    /// Answers the phone step automatically.
    #[arg(long, env = "PHONE_NUMBER")]
    pub phone_number: Option<String>,

    #[arg(long, env = "DATABASE_DIR", default_value = "/app/session_data")]
    pub database_dir: String,

    /// How long each login step waits for input.
    #[arg(long, env = "STEP_TIMEOUT", default_value = "300s", value_parser = humantime::parse_duration)]
    pub step_timeout: Duration,

    /// Deadline of a single service call.
    #[arg(long, env = "CALL_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub call_timeout: Duration,
}

impl ServerArgs {
    pub fn default_phone(&self) -> Option<String> {
        self.phone_number.clone().filter(|phone| !phone.trim().is_empty())
    }
}
