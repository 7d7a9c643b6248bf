use crate::{
    error::{LoginError, ServiceError},
    service::{LoginHooks, Service},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, broadcast};

pub const REJECTED_CODE: &str = "00000";

/// In-memory service. `getMe` succeeds once a login has completed.
///
/// Methods: `echo` returns the request, `fail` rejects with the request's
/// `message`, `slow` waits for [`FakeService::release`].
pub struct FakeService {
    events: broadcast::Sender<Value>,
    authenticated: AtomicBool,
    needs_password: AtomicBool,
    code_prompts: AtomicUsize,
    logins: AtomicUsize,
    gate: Notify,
}

impl FakeService {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            authenticated: AtomicBool::new(false),
            needs_password: AtomicBool::new(false),
            code_prompts: AtomicUsize::new(1),
            logins: AtomicUsize::new(0),
            gate: Notify::new(),
        }
    }

    pub fn authenticated() -> Self {
        let service = Self::new();
        service.authenticated.store(true, Ordering::SeqCst);
        service
    }

    pub fn with_password() -> Self {
        let service = Self::new();
        service.needs_password.store(true, Ordering::SeqCst);
        service
    }

    /// Asks for the code a second time before accepting it.
    pub fn asking_code_twice() -> Self {
        let service = Self::new();
        service.code_prompts.store(2, Ordering::SeqCst);
        service
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn emit(&self, update: Value) {
        let _ = self.events.send(update);
    }
}

#[async_trait]
impl Service for FakeService {
    async fn invoke(&self, request: Value) -> Result<Value, ServiceError> {
        match request["@type"].as_str().unwrap_or_default() {
            "getMe" if self.is_authenticated() => Ok(json!({"@type": "user", "id": 1})),
            "getMe" => Err(ServiceError::new("Unauthorized")),
            "echo" => Ok(request),
            "fail" => Err(ServiceError::new(
                request["message"].as_str().unwrap_or("boom"),
            )),
            "slow" => {
                self.gate.notified().await;
                Ok(json!({"@type": "ok", "slow": true}))
            }
            _ => Ok(json!({"@type": "ok"})),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    async fn login(&self, hooks: &dyn LoginHooks) -> Result<(), LoginError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        hooks.phone().await?;
        for _ in 0..self.code_prompts.load(Ordering::SeqCst) {
            let code = hooks.code().await?;
            if code == REJECTED_CODE {
                return Err(ServiceError::new("PHONE_CODE_INVALID").into());
            }
        }
        if self.needs_password.load(Ordering::SeqCst) {
            hooks.password().await?;
        }
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }
}
