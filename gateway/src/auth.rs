//! HTTP endpoints of the interactive login.

use crate::{app::App, login::Identity};
use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use parley_types::{AuthStatus, Step, StepResponse};
use serde_json::Value;

pub async fn status(State(app): State<App>) -> impl IntoResponse {
    let login = app.login.snapshot().await;
    let status = match app.login.status().await {
        Identity::Authenticated(me) => AuthStatus {
            authenticated: true,
            me: Some(me),
            login: Some(login),
        },
        Identity::Unauthenticated => AuthStatus {
            authenticated: false,
            me: None,
            login: Some(login),
        },
    };
    Json(status)
}

pub async fn start(State(app): State<App>) -> impl IntoResponse {
    Json(app.login.start().await)
}

pub async fn phone(State(app): State<App>, body: Bytes) -> Response {
    submit(&app, Step::Phone, &body).await
}

pub async fn code(State(app): State<App>, body: Bytes) -> Response {
    submit(&app, Step::Code, &body).await
}

pub async fn password(State(app): State<App>, body: Bytes) -> Response {
    submit(&app, Step::Password, &body).await
}

/// Reads `{<step>: value}` from the body. Anything unreadable becomes `null`
/// and is rejected by validation as invalid input.
fn field(body: &[u8], step: Step) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|mut body| body.get_mut(step.to_string()).map(Value::take))
        .unwrap_or(Value::Null)
}

async fn submit(app: &App, step: Step, body: &[u8]) -> Response {
    match app.login.submit(step, &field(body, step)).await {
        Ok(next) => Json(StepResponse::next(next)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::{app::App, login::LoginConfig, server, testing::FakeService};
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use parley_types::Step;
    use serde_json::{Value, json};
    use std::{sync::Arc, time::Duration};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app() -> App {
        App::new(
            CancellationToken::new(),
            Arc::new(FakeService::new()),
            LoginConfig::default(),
        )
    }

    async fn call(app: &App, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = server::router(app.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_pending(app: &App, step: Step) {
        for _ in 0..200 {
            if app.login.snapshot().await.pending == Some(step) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("step {} never became pending", step);
    }

    #[tokio::test]
    async fn phone_without_start_is_a_conflict() {
        let app = app();
        let (status, body) =
            call(&app, Method::POST, "/auth/phone", Some(json!({"phone": "+491234"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "NoActiveStep");
    }

    #[tokio::test]
    async fn login_over_http() {
        let app = app();
        let (_, body) = call(&app, Method::GET, "/auth/status", None).await;
        assert_eq!(body["authenticated"], false);
        assert_eq!(body["login"]["state"], "idle");

        let (status, body) = call(&app, Method::POST, "/auth/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"next": "phone"}));
        wait_pending(&app, Step::Phone).await;

        let (status, body) =
            call(&app, Method::POST, "/auth/phone", Some(json!({"phone": 491234}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidInput");

        let (_, body) =
            call(&app, Method::POST, "/auth/phone", Some(json!({"phone": "+491234"}))).await;
        assert_eq!(body, json!({"ok": true, "next": "code"}));
        wait_pending(&app, Step::Code).await;

        let (_, body) = call(&app, Method::GET, "/auth/status", None).await;
        assert_eq!(body["login"]["pending"], "code");

        let (_, body) =
            call(&app, Method::POST, "/auth/code", Some(json!({"code": "55443"}))).await;
        assert_eq!(body, json!({"ok": true, "next": "maybe_password"}));

        for _ in 0..200 {
            let (_, body) = call(&app, Method::GET, "/auth/status", None).await;
            if body["authenticated"] == true && body["login"]["state"] == "completed" {
                assert_eq!(body["login"]["pending"], Value::Null);
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("login never completed");
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let app = app();
        for uri in ["/healthz", "/readyz"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = server::router(app.clone()).oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }
}
