//! Interactive login against the external service.
//!
//! One [`LoginSession`] exists per process. The service's login driver pulls
//! credentials through [`LoginHooks`]; each hook parks a [`Continuation`] in
//! the session until the matching `submit_*` call resumes it or its deadline
//! expires.

use crate::{
    error::LoginError,
    service::{LoginHooks, Service},
};
use async_trait::async_trait;
use owo_colors::OwoColorize;
use parley_types::{LoginSnapshot, LoginState, NextStep, StartResponse, Step};
use serde_json::{Value, json};
use std::{ops::Deref, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinHandle};

mod continuation;

pub use continuation::Continuation;

#[derive(Clone, Debug)]
pub struct LoginConfig {
    pub step_timeout: Duration,
    /// Answers the phone step without waiting for input.
    pub default_phone: Option<String>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(300),
            default_phone: None,
        }
    }
}

/// Result of asking the service who we are.
#[derive(Clone, Debug, PartialEq)]
pub enum Identity {
    Authenticated(Value),
    Unauthenticated,
}

#[derive(Default)]
struct LoginSession {
    state: LoginState,
    attempt: u64,
    next_ticket: u64,
    phone: Option<Continuation>,
    code: Option<Continuation>,
    password: Option<Continuation>,
    last_error: Option<LoginError>,
    driver: Option<JoinHandle<()>>,
}

impl LoginSession {
    fn slot(&mut self, step: Step) -> &mut Option<Continuation> {
        match step {
            Step::Phone => &mut self.phone,
            Step::Code => &mut self.code,
            Step::Password => &mut self.password,
        }
    }

    fn pending(&self) -> Option<Step> {
        [&self.phone, &self.code, &self.password]
            .into_iter()
            .flatten()
            .map(Continuation::step)
            .next()
    }

    fn cancel_pending(&mut self) {
        for continuation in [self.phone.take(), self.code.take(), self.password.take()]
            .into_iter()
            .flatten()
        {
            continuation.cancel();
        }
    }

    fn fail(&mut self, error: LoginError) {
        self.state = LoginState::Failed;
        self.last_error = Some(error);
        self.cancel_pending();
    }

    fn snapshot(&self) -> LoginSnapshot {
        LoginSnapshot {
            state: self.state,
            pending: self.pending(),
            error: self.last_error.as_ref().map(|e| e.code().to_owned()),
        }
    }
}

fn awaiting(step: Step) -> LoginState {
    match step {
        Step::Phone => LoginState::AwaitingPhone,
        Step::Code => LoginState::AwaitingCode,
        Step::Password => LoginState::AwaitingPassword,
    }
}

fn current_step(state: LoginState) -> NextStep {
    match state {
        LoginState::AwaitingCode => NextStep::Code,
        LoginState::AwaitingPassword => NextStep::Password,
        _ => NextStep::Phone,
    }
}

fn validate(value: &Value) -> Result<String, LoginError> {
    match value.as_str() {
        Some(value) if !value.is_empty() => Ok(value.to_owned()),
        _ => Err(LoginError::InvalidInput),
    }
}

pub struct OrchestratorInner {
    service: Arc<dyn Service>,
    config: LoginConfig,
    session: Mutex<LoginSession>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Deref for Orchestrator {
    type Target = OrchestratorInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Orchestrator {
    pub fn new(service: Arc<dyn Service>, config: LoginConfig) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                service,
                config,
                session: Mutex::new(LoginSession::default()),
            }),
        }
    }

    /// Asks the service for the current account. Any failure counts as
    /// unauthenticated.
    pub async fn status(&self) -> Identity {
        match self.service.invoke(json!({"@type": "getMe"})).await {
            Ok(me) => Identity::Authenticated(me),
            Err(_) => Identity::Unauthenticated,
        }
    }

    pub async fn snapshot(&self) -> LoginSnapshot {
        self.session.lock().await.snapshot()
    }

    pub async fn start(&self) -> StartResponse {
        if let Identity::Authenticated(me) = self.status().await {
            return StartResponse {
                next: NextStep::Done,
                me: Some(me),
            };
        }
        // The session lock makes the in-progress test and the transition out
        // of Idle/Failed/Completed one step.
        let mut session = self.session.lock().await;
        if session.state.in_progress() {
            return StartResponse {
                next: current_step(session.state),
                me: None,
            };
        }
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        session.cancel_pending();
        session.attempt += 1;
        session.state = LoginState::AwaitingPhone;
        session.last_error = None;
        let attempt = session.attempt;
        let hooks = StepHooks {
            orchestrator: self.clone(),
            attempt,
        };
        let orchestrator = self.clone();
        session.driver = Some(tokio::spawn(async move {
            let result = orchestrator.service.login(&hooks).await;
            orchestrator.finish(attempt, result).await;
        }));
        metrics::counter!("parley_login_attempts_total").increment(1);
        println!(
            "{}{}",
            "🔑 Login attempt started • attempt=".green(),
            attempt.green().dimmed()
        );
        StartResponse {
            next: NextStep::Phone,
            me: None,
        }
    }

    pub async fn submit_phone(&self, value: &Value) -> Result<NextStep, LoginError> {
        self.submit(Step::Phone, value).await
    }

    pub async fn submit_code(&self, value: &Value) -> Result<NextStep, LoginError> {
        self.submit(Step::Code, value).await
    }

    pub async fn submit_password(&self, value: &Value) -> Result<NextStep, LoginError> {
        self.submit(Step::Password, value).await
    }

    /// Resumes the continuation waiting on `step` with `value`.
    ///
    /// Input is validated before the session is consulted, so a bad value
    /// leaves a pending continuation in place.
    pub async fn submit(&self, step: Step, value: &Value) -> Result<NextStep, LoginError> {
        let value = validate(value)?;
        let mut session = self.session.lock().await;
        let continuation = session.slot(step).take().ok_or(LoginError::NoActiveStep)?;
        if !continuation.resume(value) {
            return Err(LoginError::NoActiveStep);
        }
        println!(
            "{}{}",
            "📨 Login step submitted • step=".cyan(),
            step.cyan().dimmed()
        );
        Ok(match step {
            Step::Phone => {
                session.state = LoginState::AwaitingCode;
                NextStep::Code
            }
            Step::Code => {
                session.state = LoginState::AwaitingPassword;
                NextStep::MaybePassword
            }
            Step::Password => NextStep::Done,
        })
    }

    /// Parks a continuation for `step` and waits for it to be settled.
    async fn suspend(&self, attempt: u64, step: Step) -> Result<String, LoginError> {
        let rx = {
            let mut session = self.session.lock().await;
            if session.attempt != attempt || !session.state.in_progress() {
                return Err(LoginError::Cancelled);
            }
            if let Some(stale) = session.slot(step).take() {
                stale.cancel();
            }
            session.next_ticket += 1;
            let (continuation, rx) =
                Continuation::new(step, session.next_ticket, self.config.step_timeout);
            self.arm(&continuation);
            *session.slot(step) = Some(continuation);
            session.state = awaiting(step);
            rx
        };
        println!(
            "{}{}",
            "⏳ Waiting for login input • step=".cyan(),
            step.cyan().dimmed()
        );
        rx.await.unwrap_or(Err(LoginError::Cancelled))
    }

    fn arm(&self, continuation: &Continuation) {
        let timer = continuation.timer();
        let deadline = continuation.deadline();
        let step = continuation.step();
        let ticket = continuation.ticket();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => orchestrator.expire(step, ticket).await,
            }
        });
    }

    async fn expire(&self, step: Step, ticket: u64) {
        let mut session = self.session.lock().await;
        let slot = session.slot(step);
        if slot.as_ref().map(Continuation::ticket) != Some(ticket) {
            // Settled while the timer was waking up.
            return;
        }
        if let Some(continuation) = slot.take() {
            continuation.expire();
        }
        session.fail(LoginError::StepTimeout);
        metrics::counter!("parley_login_failures_total").increment(1);
        eprintln!(
            "{}{}",
            "⌛ Login step timed out • step=".yellow(),
            step.yellow().dimmed()
        );
    }

    async fn finish(&self, attempt: u64, result: Result<(), LoginError>) {
        let mut session = self.session.lock().await;
        if session.attempt != attempt {
            return;
        }
        match result {
            Ok(()) => {
                session.cancel_pending();
                session.state = LoginState::Completed;
                session.last_error = None;
                println!(
                    "{}{}",
                    "✅ Login completed • attempt=".green(),
                    attempt.green().dimmed()
                );
            }
            Err(e) => {
                if session.state != LoginState::Failed {
                    metrics::counter!("parley_login_failures_total").increment(1);
                    eprintln!(
                        "{}{}{}{}",
                        "❌ Login failed • attempt=".red(),
                        attempt.red().dimmed(),
                        " • error=".red(),
                        e.red().dimmed()
                    );
                    session.fail(e);
                }
            }
        }
    }

    /// Bookkeeping for a step the service answered without asking anyone.
    async fn skip(&self, attempt: u64, step: Step) -> Result<(), LoginError> {
        let mut session = self.session.lock().await;
        if session.attempt != attempt || !session.state.in_progress() {
            return Err(LoginError::Cancelled);
        }
        if step == Step::Phone {
            session.state = LoginState::AwaitingCode;
        }
        Ok(())
    }
}

/// Hooks handed to the service for one attempt.
struct StepHooks {
    orchestrator: Orchestrator,
    attempt: u64,
}

#[async_trait]
impl LoginHooks for StepHooks {
    async fn phone(&self) -> Result<String, LoginError> {
        if let Some(phone) = self.orchestrator.config.default_phone.clone() {
            self.orchestrator.skip(self.attempt, Step::Phone).await?;
            println!("{}", "📞 Using preconfigured phone number".cyan());
            return Ok(phone);
        }
        self.orchestrator.suspend(self.attempt, Step::Phone).await
    }

    async fn code(&self) -> Result<String, LoginError> {
        self.orchestrator.suspend(self.attempt, Step::Code).await
    }

    async fn password(&self) -> Result<String, LoginError> {
        self.orchestrator.suspend(self.attempt, Step::Password).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeService, REJECTED_CODE};

    fn orchestrator(service: Arc<FakeService>, config: LoginConfig) -> Orchestrator {
        Orchestrator::new(service, config)
    }

    async fn wait_for(orchestrator: &Orchestrator, check: impl Fn(&LoginSnapshot) -> bool) {
        for _ in 0..200 {
            if check(&orchestrator.snapshot().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("login never reached expected state: {:?}", orchestrator.snapshot().await);
    }

    async fn wait_pending(orchestrator: &Orchestrator, step: Step) {
        wait_for(orchestrator, |s| s.pending == Some(step)).await
    }

    #[tokio::test]
    async fn full_login_without_password() {
        let service = Arc::new(FakeService::new());
        let orch = orchestrator(service.clone(), LoginConfig::default());
        assert_eq!(orch.status().await, Identity::Unauthenticated);

        assert_eq!(orch.start().await.next, NextStep::Phone);
        wait_pending(&orch, Step::Phone).await;
        assert_eq!(orch.submit_phone(&json!("+491234")).await, Ok(NextStep::Code));
        wait_pending(&orch, Step::Code).await;
        assert_eq!(
            orch.submit_code(&json!("55443")).await,
            Ok(NextStep::MaybePassword)
        );
        wait_for(&orch, |s| s.state == LoginState::Completed).await;
        assert!(matches!(orch.status().await, Identity::Authenticated(_)));
    }

    #[tokio::test]
    async fn full_login_with_password() {
        let service = Arc::new(FakeService::with_password());
        let orch = orchestrator(service.clone(), LoginConfig::default());
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();
        wait_pending(&orch, Step::Code).await;
        orch.submit_code(&json!("55443")).await.unwrap();
        wait_pending(&orch, Step::Password).await;
        assert_eq!(orch.snapshot().await.state, LoginState::AwaitingPassword);
        assert_eq!(
            orch.submit_password(&json!("hunter2")).await,
            Ok(NextStep::Done)
        );
        wait_for(&orch, |s| s.state == LoginState::Completed).await;
        assert!(service.is_authenticated());
    }

    #[tokio::test]
    async fn start_while_in_progress_does_not_begin_a_second_attempt() {
        let service = Arc::new(FakeService::new());
        let orch = orchestrator(service.clone(), LoginConfig::default());
        let (a, b, c) = tokio::join!(orch.start(), orch.start(), orch.start());
        assert_eq!(
            [a.next, b.next, c.next],
            [NextStep::Phone, NextStep::Phone, NextStep::Phone]
        );
        wait_pending(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();
        wait_pending(&orch, Step::Code).await;
        assert_eq!(orch.start().await.next, NextStep::Code);
        assert_eq!(service.logins(), 1);
    }

    #[tokio::test]
    async fn submit_without_start_has_no_active_step() {
        let orch = orchestrator(Arc::new(FakeService::new()), LoginConfig::default());
        assert_eq!(
            orch.submit_phone(&json!("+491234")).await,
            Err(LoginError::NoActiveStep)
        );
        assert_eq!(orch.snapshot().await.state, LoginState::Idle);
    }

    #[tokio::test]
    async fn invalid_input_leaves_continuation_pending() {
        let orch = orchestrator(Arc::new(FakeService::new()), LoginConfig::default());
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        for bad in [json!(""), json!(491234), json!(null), json!({"phone": "+49"})] {
            assert_eq!(orch.submit_phone(&bad).await, Err(LoginError::InvalidInput));
        }
        assert_eq!(orch.snapshot().await.pending, Some(Step::Phone));
        assert_eq!(orch.submit_phone(&json!("+491234")).await, Ok(NextStep::Code));
    }

    #[tokio::test]
    async fn submitting_a_step_already_passed_fails() {
        let orch = orchestrator(Arc::new(FakeService::new()), LoginConfig::default());
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();
        assert_eq!(
            orch.submit_phone(&json!("+491234")).await,
            Err(LoginError::NoActiveStep)
        );
    }

    #[tokio::test]
    async fn timed_out_step_cannot_be_resumed() {
        let service = Arc::new(FakeService::new());
        let config = LoginConfig {
            step_timeout: Duration::from_millis(30),
            default_phone: None,
        };
        let orch = orchestrator(service.clone(), config);
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        wait_for(&orch, |s| s.state == LoginState::Failed).await;

        assert_eq!(
            orch.submit_phone(&json!("+491234")).await,
            Err(LoginError::NoActiveStep)
        );
        let snapshot = orch.snapshot().await;
        assert_eq!(snapshot.pending, None);
        assert_eq!(snapshot.error.as_deref(), Some("StepTimeout"));

        // A failed session may be started again.
        assert_eq!(orch.start().await.next, NextStep::Phone);
        wait_pending(&orch, Step::Phone).await;
        assert_eq!(service.logins(), 2);
    }

    async fn ticket(orchestrator: &Orchestrator, step: Step) -> u64 {
        let mut session = orchestrator.session.lock().await;
        session
            .slot(step)
            .as_ref()
            .map(Continuation::ticket)
            .unwrap()
    }

    #[tokio::test]
    async fn timer_of_a_resumed_step_fires_harmlessly() {
        let orch = orchestrator(Arc::new(FakeService::new()), LoginConfig::default());
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        let phone_ticket = ticket(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();

        orch.expire(Step::Phone, phone_ticket).await;
        wait_pending(&orch, Step::Code).await;
        let snapshot = orch.snapshot().await;
        assert_eq!(snapshot.state, LoginState::AwaitingCode);
        assert_eq!(snapshot.error, None);

        orch.submit_code(&json!("55443")).await.unwrap();
        wait_for(&orch, |s| s.state == LoginState::Completed).await;
    }

    #[tokio::test]
    async fn old_timer_cannot_expire_a_newer_wait_for_the_same_step() {
        let orch = orchestrator(
            Arc::new(FakeService::asking_code_twice()),
            LoginConfig::default(),
        );
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();
        wait_pending(&orch, Step::Code).await;
        let first = ticket(&orch, Step::Code).await;
        orch.submit_code(&json!("55443")).await.unwrap();

        wait_pending(&orch, Step::Code).await;
        let second = ticket(&orch, Step::Code).await;
        assert_ne!(first, second);

        orch.expire(Step::Code, first).await;
        let snapshot = orch.snapshot().await;
        assert_eq!(snapshot.state, LoginState::AwaitingCode);
        assert_eq!(snapshot.pending, Some(Step::Code));
        assert_eq!(snapshot.error, None);

        assert_eq!(
            orch.submit_code(&json!("55443")).await,
            Ok(NextStep::MaybePassword)
        );
        wait_for(&orch, |s| s.state == LoginState::Completed).await;
    }

    #[tokio::test]
    async fn service_rejection_fails_the_attempt() {
        let orch = orchestrator(Arc::new(FakeService::new()), LoginConfig::default());
        orch.start().await;
        wait_pending(&orch, Step::Phone).await;
        orch.submit_phone(&json!("+491234")).await.unwrap();
        wait_pending(&orch, Step::Code).await;
        orch.submit_code(&json!(REJECTED_CODE)).await.unwrap();
        wait_for(&orch, |s| s.state == LoginState::Failed).await;
        assert_eq!(
            orch.snapshot().await.error.as_deref(),
            Some("ServiceError")
        );
        assert_eq!(orch.status().await, Identity::Unauthenticated);
    }

    #[tokio::test]
    async fn default_phone_skips_the_phone_step() {
        let config = LoginConfig {
            default_phone: Some("+15550100".into()),
            ..Default::default()
        };
        let orch = orchestrator(Arc::new(FakeService::new()), config);
        assert_eq!(orch.start().await.next, NextStep::Phone);
        wait_pending(&orch, Step::Code).await;
        assert_eq!(orch.snapshot().await.state, LoginState::AwaitingCode);
        assert_eq!(
            orch.submit_phone(&json!("+491234")).await,
            Err(LoginError::NoActiveStep)
        );
    }

    #[tokio::test]
    async fn start_when_authenticated_is_done() {
        let orch = orchestrator(Arc::new(FakeService::authenticated()), LoginConfig::default());
        let response = orch.start().await;
        assert_eq!(response.next, NextStep::Done);
        assert!(response.me.is_some());
        assert_eq!(orch.snapshot().await.state, LoginState::Idle);
    }
}
