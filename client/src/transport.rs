//! One logical connection to the gateway over a physically reconnecting
//! socket.
//!
//! Calls are correlated by a transport-wide numeric `requestId`. Everything
//! outstanding when the link drops is rejected with
//! [`CallError::ConnectionLost`]; nothing is re-sent automatically. After
//! every successful connect the configured bootstrap call is issued and its
//! result handed to the [`Renderer`].

use crate::{
    backoff::Backoff,
    connector::{Connector, Link},
    error::CallError,
};
use futures::{SinkExt, StreamExt};
use owo_colors::OwoColorize;
use parley_common::pending::PendingTable;
use parley_types::{REQUEST_ID, ServerFrame};
use serde_json::{Value, json};
use std::{
    ops::Deref,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

const OUTBOUND_CAPACITY: usize = 256;

/// Receives what the transport has to show.
pub trait Renderer: Send + Sync + 'static {
    /// Result of the bootstrap call made after each (re)connect.
    fn bootstrap(&self, result: Result<Value, CallError>);

    /// A pushed update.
    fn update(&self, update: Value);

    /// Reconnecting was given up after `attempts` tries.
    fn terminated(&self, _attempts: u32) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect budget spent or the transport was shut down.
    Terminated,
}

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub call_timeout: Duration,
    pub backoff: Backoff,
    pub bootstrap: Value,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            backoff: Backoff::default(),
            bootstrap: json!({"@type": "getChats", "limit": 50}),
        }
    }
}

pub struct TransportInner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    renderer: Arc<dyn Renderer>,
    next_id: AtomicU64,
    pending: PendingTable<u64, Value, CallError>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    state: watch::Sender<LinkState>,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Deref for Transport {
    type Target = TransportInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Transport {
    pub fn new(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Connecting);
        Self {
            inner: Arc::new(TransportInner {
                config,
                connector,
                renderer,
                next_id: AtomicU64::new(0),
                pending: PendingTable::new(),
                outbound: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Calls awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_sender(&self, sender: Option<mpsc::Sender<String>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    /// Sends `payload` with a fresh `requestId` and waits for the matching
    /// reply. Fails at once when no connection is open.
    pub async fn call(&self, payload: Value) -> Result<Value, CallError> {
        let Value::Object(mut payload) = payload else {
            return Err(CallError::InvalidPayload);
        };
        let outbound = self.sender().ok_or(CallError::NotConnected)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        payload.insert(REQUEST_ID.into(), id.into());
        let text = serde_json::to_string(&payload).map_err(|_| CallError::InvalidPayload)?;
        // Ids come from a counter and are never reused, so registration
        // cannot collide.
        let waiter = self
            .pending
            .register(id, self.config.call_timeout)
            .map_err(|_| CallError::InvalidPayload)?;
        if outbound.send(text).await.is_err() {
            return Err(CallError::ConnectionLost);
        }
        waiter
            .wait(|| CallError::RequestTimeout, || CallError::ConnectionLost)
            .await
    }

    /// Starts the connect/reconnect loop.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move { transport.connection_loop(cancel).await })
    }

    async fn connection_loop(&self, cancel: CancellationToken) {
        let mut attempts: u32 = 0;
        loop {
            let link = select! {
                _ = cancel.cancelled() => break,
                link = self.connector.connect() => link,
            };
            match link {
                Ok(link) => {
                    attempts = 0;
                    println!("{}", "🔗 Connected to gateway".green());
                    self.run_link(cancel.clone(), link).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    eprintln!("{}", "⚠️ Connection to gateway lost".yellow());
                }
                Err(e) => {
                    eprintln!(
                        "{}{}",
                        "⚠️ Failed to connect to gateway • error=".yellow(),
                        format!("{:#}", e).yellow().dimmed()
                    );
                }
            }
            attempts += 1;
            if self.config.backoff.exhausted(attempts) {
                eprintln!(
                    "{}{}",
                    "❌ Giving up on gateway connection • attempts=".red(),
                    attempts.red().dimmed()
                );
                self.state.send_replace(LinkState::Terminated);
                self.renderer.terminated(attempts);
                return;
            }
            let delay = self.config.backoff.delay(attempts);
            println!(
                "{}{}{}{}",
                "🔁 Reconnecting • attempt=".yellow(),
                attempts.yellow().dimmed(),
                " • delay=".yellow(),
                humantime::format_duration(delay).yellow().dimmed()
            );
            self.state
                .send_replace(LinkState::Reconnecting { attempt: attempts, delay });
            select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.state.send_replace(LinkState::Terminated);
    }

    /// Serves one physical link until it drops or `cancel` fires.
    async fn run_link(&self, cancel: CancellationToken, link: Link) {
        let Link {
            mut sink,
            mut stream,
        } = link;
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        self.set_sender(Some(tx));
        self.state.send_replace(LinkState::Open);

        let transport = self.clone();
        tokio::spawn(async move {
            let result = transport.call(transport.config.bootstrap.clone()).await;
            transport.renderer.bootstrap(result);
        });

        loop {
            select! {
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                text = rx.recv() => {
                    let Some(text) = text else { break };
                    if let Err(e) = sink.send(text).await {
                        eprintln!(
                            "{}{}",
                            "⚠️ Failed to send frame • error=".yellow(),
                            format!("{:#}", e).yellow().dimmed()
                        );
                        break;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(e)) => {
                        eprintln!(
                            "{}{}",
                            "⚠️ Connection error • error=".yellow(),
                            format!("{:#}", e).yellow().dimmed()
                        );
                        break;
                    }
                    None => break,
                },
            }
        }

        // No new call can reach this link once the sender is gone and the
        // receiver dropped; everything already registered is failed here.
        self.set_sender(None);
        drop(rx);
        if self.pending.is_empty() {
            return;
        }
        let oldest = self.pending.oldest().unwrap_or_default();
        let lost = self.pending.reject_all(|| CallError::ConnectionLost);
        eprintln!(
            "{}{}{}{}",
            "⚠️ Rejected in-flight calls • count=".yellow(),
            lost.yellow().dimmed(),
            " • oldest=".yellow(),
            humantime::format_duration(Duration::from_millis(oldest.as_millis() as u64))
                .yellow()
                .dimmed()
        );
    }

    fn handle_frame(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                eprintln!(
                    "{}{}",
                    "⚠️ Ignoring unreadable frame • error=".yellow(),
                    e.yellow().dimmed()
                );
                return;
            }
        };
        let id = frame.numeric_id();
        let ServerFrame {
            ok,
            result,
            error,
            update,
            ..
        } = frame;
        match id {
            Some(id) => {
                let outcome = if ok == Some(true) {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(CallError::Service(
                        error.unwrap_or_else(|| "unknown error".to_owned()),
                    ))
                };
                // Unknown ids belong to calls that already timed out.
                self.pending.settle(&id, outcome);
            }
            None if ok == Some(false) => {
                eprintln!(
                    "{}{}",
                    "⚠️ Gateway rejected a frame • error=".yellow(),
                    error.unwrap_or_default().yellow().dimmed()
                );
            }
            None => {}
        }
        if let Some(update) = update {
            self.renderer.update(update);
        }
    }
}
