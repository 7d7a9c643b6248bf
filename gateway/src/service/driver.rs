//! Walks a TDLib-style authorization state machine, asking the login hooks for
//! each credential the service requests.

use super::{LoginHooks, Service, TdlibParameters};
use crate::error::{LoginError, ServiceError};
use owo_colors::OwoColorize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// How long to wait for the service to leave a state after answering it
/// before asking it directly.
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(30);

const READY: &str = "authorizationStateReady";
const WAIT_PARAMETERS: &str = "authorizationStateWaitTdlibParameters";
const WAIT_PHONE: &str = "authorizationStateWaitPhoneNumber";
const WAIT_CODE: &str = "authorizationStateWaitCode";
const WAIT_PASSWORD: &str = "authorizationStateWaitPassword";

fn state_type(state: &Value) -> Option<&str> {
    state.get("@type").and_then(Value::as_str)
}

async fn current_state(service: &dyn Service) -> Result<Value, LoginError> {
    Ok(service
        .invoke(json!({"@type": "getAuthorizationState"}))
        .await?)
}

/// Hands the client parameters to a freshly started service. No-op once the
/// service is past that stage.
pub async fn initialize(
    service: &dyn Service,
    parameters: &TdlibParameters,
) -> Result<(), LoginError> {
    let mut events = service.subscribe();
    let state = current_state(service).await?;
    if state_type(&state) != Some(WAIT_PARAMETERS) {
        return Ok(());
    }
    service.invoke(parameters.request()).await?;
    let state = next_state(service, &mut events, WAIT_PARAMETERS).await?;
    println!(
        "{}{}",
        "🧩 Service initialized • state=".green(),
        state_type(&state).unwrap_or("unknown").green().dimmed()
    );
    Ok(())
}

/// Runs the login flow until the service reports `authorizationStateReady`.
pub async fn run(
    service: &dyn Service,
    hooks: &dyn LoginHooks,
    parameters: &TdlibParameters,
) -> Result<(), LoginError> {
    // Subscribe before the first query so no transition slips past.
    let mut events = service.subscribe();
    let mut state = current_state(service).await?;
    loop {
        let kind = state_type(&state)
            .ok_or_else(|| ServiceError::new("authorization state has no type"))?
            .to_owned();
        println!(
            "{}{}",
            "🔐 Authorization state • state=".cyan(),
            kind.cyan().dimmed()
        );
        match kind.as_str() {
            READY => return Ok(()),
            WAIT_PARAMETERS => {
                service.invoke(parameters.request()).await?;
            }
            WAIT_PHONE => {
                let phone_number = hooks.phone().await?;
                service
                    .invoke(json!({
                        "@type": "setAuthenticationPhoneNumber",
                        "phone_number": phone_number,
                    }))
                    .await?;
            }
            WAIT_CODE => {
                let code = hooks.code().await?;
                service
                    .invoke(json!({"@type": "checkAuthenticationCode", "code": code}))
                    .await?;
            }
            WAIT_PASSWORD => {
                let password = hooks.password().await?;
                service
                    .invoke(json!({
                        "@type": "checkAuthenticationPassword",
                        "password": password,
                    }))
                    .await?;
            }
            other => {
                return Err(ServiceError::new(format!(
                    "login cannot continue from {}",
                    other
                ))
                .into());
            }
        }
        state = next_state(service, &mut events, &kind).await?;
    }
}

/// Waits for an `updateAuthorizationState` that moves away from `previous`.
/// Repeats of the current state are ignored.
async fn next_state(
    service: &dyn Service,
    events: &mut broadcast::Receiver<Value>,
    previous: &str,
) -> Result<Value, LoginError> {
    let mut polled = false;
    loop {
        let event = match tokio::time::timeout(TRANSITION_TIMEOUT, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(skipped))) => {
                eprintln!(
                    "{}{}",
                    "⚠️ Missed service events while waiting for login progress • skipped=".yellow(),
                    skipped.yellow().dimmed()
                );
                let state = current_state(service).await?;
                if state_type(&state) != Some(previous) {
                    return Ok(state);
                }
                continue;
            }
            Ok(Err(RecvError::Closed)) => {
                return Err(ServiceError::new("service connection closed").into());
            }
            Err(_) => {
                let state = current_state(service).await?;
                if state_type(&state) != Some(previous) {
                    return Ok(state);
                }
                if polled {
                    return Err(ServiceError::new(format!(
                        "service did not advance past {}",
                        previous
                    ))
                    .into());
                }
                polled = true;
                continue;
            }
        };
        if event.get("@type").and_then(Value::as_str) != Some("updateAuthorizationState") {
            continue;
        }
        let Some(state) = event.get("authorization_state") else {
            continue;
        };
        if state_type(state) == Some(previous) {
            continue;
        }
        return Ok(state.clone());
    }
}
