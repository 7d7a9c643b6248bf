use crate::{
    login::{LoginConfig, Orchestrator},
    registry::Registry,
    service::Service,
};
use std::{ops::Deref, sync::Arc};
use tokio_util::sync::CancellationToken;

pub struct AppInner {
    pub cancel: CancellationToken,
    pub service: Arc<dyn Service>,
    pub login: Orchestrator,
    pub registry: Registry,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Deref for App {
    type Target = AppInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl App {
    pub fn new(cancel: CancellationToken, service: Arc<dyn Service>, login: LoginConfig) -> Self {
        Self {
            inner: Arc::new(AppInner {
                cancel,
                login: Orchestrator::new(service.clone(), login),
                service,
                registry: Registry::new(),
            }),
        }
    }
}
