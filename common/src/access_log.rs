use axum::{extract::Request, middleware::Next, response::Response};
use owo_colors::OwoColorize;
use std::time::Instant;

/// Logs every request passing through the public router.
pub async fn public(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    let elapsed = humantime::format_duration(start.elapsed()).to_string();
    if status.is_server_error() {
        eprintln!(
            "{}{}{}{}{}{}",
            "🌐 ".red(),
            method.red(),
            " ".red(),
            path.red().dimmed(),
            format!(" • status={}", status.as_u16()).red(),
            format!(" • elapsed={}", elapsed).red().dimmed(),
        );
    } else if status.is_client_error() {
        println!(
            "{}{}{}{}{}{}",
            "🌐 ".yellow(),
            method.yellow(),
            " ".yellow(),
            path.yellow().dimmed(),
            format!(" • status={}", status.as_u16()).yellow(),
            format!(" • elapsed={}", elapsed).yellow().dimmed(),
        );
    } else {
        println!(
            "{}{}{}{}{}{}",
            "🌐 ".cyan(),
            method.cyan(),
            " ".cyan(),
            path.cyan().dimmed(),
            format!(" • status={}", status.as_u16()).cyan(),
            format!(" • elapsed={}", elapsed).cyan().dimmed(),
        );
    }
    response
}
