use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::OwoColorize;
use parley_client::{
    LinkState, Transport, TransportConfig,
    args::{self, Commands, SessionArgs},
    auth::LoginClient,
    backoff::Backoff,
    connector::WsConnector,
    console::ConsoleRenderer,
};
use parley_common::shutdown::shutdown_signal;
use parley_types::{LoginState, NextStep};
use serde_json::Value;
use std::{io::Write, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    select,
};
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    parley_common::init();
    let cli = args::Cli::parse();
    let login = LoginClient::new(cli.endpoint.clone());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    match cli.command {
        Commands::Login => ensure_login(&login, &mut stdin).await,
        Commands::Session(args) => {
            ensure_login(&login, &mut stdin).await?;
            run_session(&cli.endpoint, args, stdin).await
        }
    }
}

async fn prompt(stdin: &mut Lines<BufReader<Stdin>>, label: &str) -> Result<String> {
    print!("{} ", format!("{}:", label).cyan());
    std::io::stdout().flush().context("Failed to flush stdout")?;
    match stdin.next_line().await.context("Failed to read stdin")? {
        Some(line) => Ok(line.trim().to_owned()),
        None => bail!("stdin closed"),
    }
}

/// Walks the HTTP login steps, asking only for the input the gateway is
/// currently waiting on.
async fn ensure_login(client: &LoginClient, stdin: &mut Lines<BufReader<Stdin>>) -> Result<()> {
    if client.status().await?.authenticated {
        println!("{}", "✅ Already authenticated".green());
        return Ok(());
    }
    if client.start().await?.next == NextStep::Done {
        println!("{}", "✅ Already authenticated".green());
        return Ok(());
    }
    println!(
        "{}{}",
        "🔑 Login started • endpoint=".green(),
        client.endpoint().green().dimmed()
    );
    loop {
        let status = client.status().await?;
        if status.authenticated {
            println!("{}", "✅ Logged in".green());
            return Ok(());
        }
        let login = status.login.unwrap_or_default();
        match (login.pending, login.state) {
            (Some(step), _) => {
                let value = prompt(stdin, &step.to_string()).await?;
                let resp = client.submit(step, &value).await?;
                if !resp.ok {
                    eprintln!(
                        "{}{}{}{}",
                        "⚠️ Rejected • error=".yellow(),
                        resp.error.unwrap_or_default().yellow().dimmed(),
                        " • message=".yellow(),
                        resp.message.unwrap_or_default().yellow().dimmed()
                    );
                }
            }
            (None, LoginState::Failed) => bail!(
                "Login failed: {}",
                login.error.unwrap_or_else(|| "unknown".to_owned())
            ),
            (None, LoginState::Idle) => {
                client.start().await?;
            }
            (None, _) => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }
}

async fn run_session(
    endpoint: &str,
    args: SessionArgs,
    mut stdin: Lines<BufReader<Stdin>>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });
    let ws_url = match args.ws_url.clone() {
        Some(url) => url,
        None => args::ws_url_for(endpoint)?,
    };
    let bootstrap: Value =
        serde_json::from_str(&args.bootstrap).context("Invalid --bootstrap JSON")?;
    let transport = Transport::new(
        TransportConfig {
            call_timeout: args.call_timeout,
            backoff: Backoff {
                base: args.reconnect_base,
                max: args.reconnect_max,
                max_attempts: args.max_attempts,
            },
            bootstrap,
        },
        Arc::new(WsConnector::new(ws_url.clone())),
        Arc::new(ConsoleRenderer),
    );
    println!(
        "{}{}",
        "🚀 Opening session • url=".green(),
        ws_url.green().dimmed()
    );
    let supervisor = transport.spawn(cancel.clone());
    let mut state = transport.state();
    let result = loop {
        select! {
            _ = cancel.cancelled() => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == LinkState::Terminated {
                    break Err(anyhow::anyhow!("Connection to gateway terminated"));
                }
            }
            line = stdin.next_line() => match line.context("Failed to read stdin")? {
                None => break Ok(()),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<Value>(&line) {
                    Ok(payload) => {
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            match transport.call(payload).await {
                                Ok(result) => println!(
                                    "{}\n{}",
                                    "✅ Result".green(),
                                    serde_json::to_string_pretty(&result)
                                        .unwrap_or_else(|_| result.to_string())
                                ),
                                Err(e) => eprintln!(
                                    "{}{}{}",
                                    "❌ Call failed • error=".red(),
                                    e.red().dimmed(),
                                    (if e.is_retryable() { " (retry after reconnect)" } else { "" })
                                        .dimmed()
                                ),
                            }
                        });
                    }
                    Err(e) => eprintln!(
                        "{}{}",
                        "⚠️ Not valid JSON • error=".yellow(),
                        e.yellow().dimmed()
                    ),
                },
            },
        }
    };
    cancel.cancel();
    let _ = supervisor.await;
    println!("{}", "🛑 Session closed".red());
    result
}
