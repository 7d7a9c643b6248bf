use owo_colors::OwoColorize;
use tokio::signal;

/// Resolves once the process receives ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            eprintln!(
                "{}{}",
                "⚠️ Failed to install ctrl-c handler • error=".yellow(),
                format!("{:?}", e).yellow().dimmed()
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                eprintln!(
                    "{}{}",
                    "⚠️ Failed to install SIGTERM handler • error=".yellow(),
                    format!("{:?}", e).yellow().dimmed()
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    println!("{}", "🛑 Shutdown signal received".red());
}
