use crate::{error::CallError, transport::Renderer};
use owo_colors::OwoColorize;
use serde_json::Value;

/// Prints transport output to the terminal.
pub struct ConsoleRenderer;

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

impl Renderer for ConsoleRenderer {
    fn bootstrap(&self, result: Result<Value, CallError>) {
        match result {
            Ok(value) => println!("{}\n{}", "📋 Initial state".green(), pretty(&value)),
            Err(e) => eprintln!(
                "{}{}",
                "⚠️ Initial state unavailable • error=".yellow(),
                e.yellow().dimmed()
            ),
        }
    }

    fn update(&self, update: Value) {
        let kind = update
            .get("@type")
            .and_then(Value::as_str)
            .unwrap_or("update")
            .to_owned();
        println!("{}{}", "📬 ".cyan(), kind.cyan().dimmed());
        println!("{}", pretty(&update).dimmed());
    }

    fn terminated(&self, attempts: u32) {
        eprintln!(
            "{}{}",
            "❌ Connection terminated • attempts=".red(),
            attempts.red().dimmed()
        );
    }
}
