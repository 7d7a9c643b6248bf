use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use parley_common::shutdown::shutdown_signal;
use parley_gateway::{
    app::App,
    args::{self, Commands},
    login::LoginConfig,
    registry, server,
    service::{Service, TdJsonService, TdlibParameters},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    parley_common::init();
    let cli = args::Cli::parse();
    match cli.command {
        Commands::Server(args) => run_server(args).await,
    }
}

async fn run_server(args: args::ServerArgs) -> Result<()> {
    parley_common::metrics::maybe_spawn_metrics_server();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });
    let parameters = TdlibParameters::new(args.api_id, args.api_hash.clone(), &args.database_dir);
    let service: Arc<dyn Service> = TdJsonService::connect(
        &args.service_addr,
        parameters,
        args.call_timeout,
        cancel.clone(),
    )
    .await?;
    let app = App::new(
        cancel.clone(),
        service.clone(),
        LoginConfig {
            step_timeout: args.step_timeout,
            default_phone: args.default_phone(),
        },
    );
    let pump_join = tokio::spawn(registry::pump(
        cancel.clone(),
        service.subscribe(),
        app.registry.clone(),
    ));
    let result = server::run(cancel.clone(), args.port, app).await;
    cancel.cancel();
    if let Err(e) = pump_join
        .await
        .context("Failed to join update pump")
        .and_then(|res| res.context("Update pump failed"))
    {
        eprintln!(
            "{}{}",
            "Error during shutdown: ".red(),
            format!("{:?}", e).red().dimmed()
        );
    }
    result
}
