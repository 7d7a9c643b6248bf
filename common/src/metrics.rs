use metrics_exporter_prometheus::PrometheusBuilder;
use owo_colors::OwoColorize;
use std::net::SocketAddr;

/// Installs the Prometheus recorder when `METRICS_PORT` is set. Without it
/// every `metrics::counter!` call site is a no-op.
pub fn maybe_spawn_metrics_server() {
    let Ok(port) = std::env::var("METRICS_PORT") else {
        return;
    };
    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(e) => {
            eprintln!(
                "{}{}{}{}",
                "⚠️ Invalid METRICS_PORT • value=".yellow(),
                port.yellow().dimmed(),
                " • error=".yellow(),
                e.yellow().dimmed()
            );
            return;
        }
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => println!(
            "{}{}",
            "📈 Serving metrics • port=".green(),
            port.green().dimmed()
        ),
        Err(e) => eprintln!(
            "{}{}",
            "❌ Failed to start metrics server • error=".red(),
            format!("{:?}", e).red().dimmed()
        ),
    }
}
