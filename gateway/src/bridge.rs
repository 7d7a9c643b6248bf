//! Websocket side of the gateway: turns inbound JSON frames into service
//! calls and sends back one correlated reply per frame. Updates reach the
//! socket through the connection's registry queue.

use crate::{app::App, registry::Outbound, service::Service};
use anyhow::{Context, Result, bail};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{self, Utf8Bytes},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use owo_colors::OwoColorize;
use parley_types::{Reply, take_request_id};
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Connections silent for this long are dropped.
const PING_TIMEOUT: Duration = Duration::from_secs(300);

pub async fn upgrade(ws: WebSocketUpgrade, State(app): State<App>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, app))
}

async fn handle_ws(socket: ws::WebSocket, app: App) {
    let member = app.registry.join().await;
    let conn_id = member.id;
    let start = Instant::now();
    println!(
        "{}{}",
        "🔌 Client connected via WebSocket • conn_id=".cyan(),
        conn_id.to_string().cyan().dimmed()
    );
    let conn = Conn::new(conn_id, app.service.clone(), member.outbound);
    if let Err(e) = conn.run(app.cancel.child_token(), socket, member.rx).await {
        eprintln!(
            "{}{}{}{}",
            "⚠️ Error during WebSocket connection • conn_id=".yellow(),
            conn_id.to_string().yellow().dimmed(),
            " • error=".yellow(),
            format!("{:?}", e).yellow().dimmed()
        );
    }
    app.registry.leave(conn_id).await;
    println!(
        "{}{}{}{}",
        "🚫 Client disconnected • conn_id=".yellow(),
        conn_id.to_string().yellow().dimmed(),
        " • uptime=".yellow(),
        humantime::format_duration(Duration::from_secs(start.elapsed().as_secs()))
            .yellow()
            .dimmed()
    );
}

/// Splits a frame into the caller's request id, if any, and the payload
/// forwarded to the service.
pub(crate) fn parse_frame(raw: &[u8]) -> Result<(Option<Value>, Value), Reply> {
    let frame: Value = serde_json::from_slice(raw).map_err(Reply::malformed)?;
    let Value::Object(mut payload) = frame else {
        return Err(Reply::malformed("frame must be a JSON object"));
    };
    let request_id = take_request_id(&mut payload);
    Ok((request_id, Value::Object(payload)))
}

/// Request ids of the calls a connection still owes a reply for.
#[derive(Clone, Default)]
struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds a request id as outstanding until dropped.
struct Claim {
    id: Value,
    key: String,
    in_flight: InFlight,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Performs one call and builds its reply. Service errors are reported, never
/// retried.
pub(crate) async fn invoke(service: &dyn Service, request_id: Value, payload: Value) -> Reply {
    match service.invoke(payload).await {
        Ok(result) => Reply::success(request_id, result),
        Err(e) => {
            metrics::counter!("parley_service_errors_total").increment(1);
            Reply::failure(request_id, e.0)
        }
    }
}

async fn send_reply(outbound: &Outbound, reply: Reply) {
    let text = match serde_json::to_string(&reply) {
        Ok(text) => text,
        Err(e) => {
            eprintln!(
                "{}{}",
                "❌ Failed to serialize reply • error=".red(),
                e.red().dimmed()
            );
            return;
        }
    };
    // A closed queue means the socket is gone; the reply has nowhere to go.
    let _ = outbound.send(Utf8Bytes::from(text)).await;
}

struct Conn {
    id: Uuid,
    service: Arc<dyn Service>,
    outbound: Outbound,
    next_id: AtomicU64,
    in_flight: InFlight,
}

impl Conn {
    fn new(id: Uuid, service: Arc<dyn Service>, outbound: Outbound) -> Self {
        Self {
            id,
            service,
            outbound,
            next_id: AtomicU64::new(0),
            in_flight: InFlight::default(),
        }
    }

    /// Reserves the request id for one call. Caller ids already in flight are
    /// refused; assigned ids skip anything the caller has in flight.
    fn claim(&self, requested: Option<Value>) -> Result<Claim, Reply> {
        let mut ids = self.in_flight.lock();
        let id = match requested {
            Some(id) if ids.contains(&id.to_string()) => {
                let error = format!("DuplicateRequestId: {} is still in flight", id);
                return Err(Reply::failure(id, error));
            }
            Some(id) => id,
            None => loop {
                let id = Value::from(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
                if !ids.contains(&id.to_string()) {
                    break id;
                }
            },
        };
        let key = id.to_string();
        ids.insert(key.clone());
        Ok(Claim {
            id,
            key,
            in_flight: self.in_flight.clone(),
        })
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        socket: ws::WebSocket,
        send_rx: mpsc::Receiver<Utf8Bytes>,
    ) -> Result<()> {
        let epoch = Instant::now();
        let last_seen = Arc::new(AtomicU64::new(0));
        let (recv_tx, recv_rx) = mpsc::channel(100);
        let ws_join = tokio::spawn({
            let cancel = cancel.clone();
            let last_seen = last_seen.clone();
            async move {
                let result =
                    ws_handler_inner(cancel.clone(), send_rx, recv_tx, socket, epoch, last_seen)
                        .await;
                cancel.cancel();
                result
            }
        });
        let timeout_join = tokio::spawn(poll_timeout(cancel.clone(), epoch, last_seen, self.id));

        let result = self.process_frames(cancel.clone(), recv_rx).await;
        cancel.cancel();
        let _ = timeout_join.await;
        ws_join
            .await
            .context("WS handler task join failed")?
            .context("WS handler task error")?;
        result
    }

    async fn process_frames(
        &self,
        cancel: CancellationToken,
        mut rx: mpsc::Receiver<Bytes>,
    ) -> Result<()> {
        loop {
            let raw = select! {
                _ = cancel.cancelled() => return Ok(()),
                raw = rx.recv() => raw,
            };
            match raw {
                Some(raw) => self.dispatch(&raw).await,
                None => return Ok(()),
            }
        }
    }

    /// Handles one inbound frame. Ids are assigned in arrival order; the call
    /// itself runs on its own task so replies may overtake each other.
    async fn dispatch(&self, raw: &[u8]) {
        metrics::counter!("parley_frames_total").increment(1);
        let (requested, payload) = match parse_frame(raw) {
            Ok(parsed) => parsed,
            Err(reply) => {
                metrics::counter!("parley_malformed_frames_total").increment(1);
                eprintln!(
                    "{}{}",
                    "⚠️ Malformed frame • conn_id=".yellow(),
                    self.id.to_string().yellow().dimmed()
                );
                send_reply(&self.outbound, reply).await;
                return;
            }
        };
        let claim = match self.claim(requested) {
            Ok(claim) => claim,
            Err(reply) => {
                eprintln!(
                    "{}{}",
                    "⚠️ Duplicate request id • conn_id=".yellow(),
                    self.id.to_string().yellow().dimmed()
                );
                send_reply(&self.outbound, reply).await;
                return;
            }
        };
        let service = self.service.clone();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let reply = invoke(service.as_ref(), claim.id.clone(), payload).await;
            // Released before the reply leaves so the peer may reuse the id
            // as soon as it sees the answer.
            drop(claim);
            send_reply(&outbound, reply).await;
        });
    }
}

fn touch(epoch: Instant, last_seen: &AtomicU64) {
    last_seen.store(epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
}

async fn ws_handler_inner(
    cancel: CancellationToken,
    mut send_rx: mpsc::Receiver<Utf8Bytes>,
    recv_tx: mpsc::Sender<Bytes>,
    mut conn: ws::WebSocket,
    epoch: Instant,
    last_seen: Arc<AtomicU64>,
) -> Result<()> {
    let mut heartbeat = tokio::time::interval((PING_TIMEOUT / 4).max(Duration::from_secs(10)));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        select! {
            _ = cancel.cancelled() => {
                let _ = conn.send(ws::Message::Close(None)).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                conn.send(ws::Message::Ping(Bytes::new())).await
                    .context("Failed to send WebSocket ping")?;
            }
            msg = send_rx.recv() => match msg {
                Some(text) => {
                    conn.send(ws::Message::Text(text))
                        .await
                        .context("Failed to send WebSocket message")?;
                }
                None => bail!("Outbound queue closed"),
            },
            msg = conn.recv() => match msg {
                Some(Ok(msg)) => {
                    touch(epoch, &last_seen);
                    let close = handle_ws_message(msg, &recv_tx, &mut conn)
                        .await
                        .context("Failed to handle WebSocket message")?;
                    if close {
                        return Ok(());
                    }
                }
                Some(Err(e)) => bail!("WebSocket receive error: {:?}", e),
                None => return Ok(()),
            }
        }
    }
}

async fn handle_ws_message(
    msg: ws::Message,
    recv_tx: &mpsc::Sender<Bytes>,
    socket: &mut ws::WebSocket,
) -> Result<bool> {
    let payload = match msg {
        ws::Message::Ping(payload) => {
            socket.send(ws::Message::Pong(payload)).await?;
            return Ok(false);
        }
        ws::Message::Pong(_) => return Ok(false),
        ws::Message::Binary(payload) => payload,
        ws::Message::Text(payload) => payload.into(),
        ws::Message::Close(frame) => {
            println!(
                "{}",
                format!("👋 Received WebSocket close frame: {:?}", frame).yellow()
            );
            return Ok(true);
        }
    };
    recv_tx
        .send(payload)
        .await
        .context("Failed to forward WS message")?;
    Ok(false)
}

async fn poll_timeout(
    cancel: CancellationToken,
    epoch: Instant,
    last_seen: Arc<AtomicU64>,
    conn_id: Uuid,
) {
    let mut check = tokio::time::interval(PING_TIMEOUT / 10);
    loop {
        select! {
            _ = cancel.cancelled() => return,
            _ = check.tick() => {
                let now = epoch.elapsed().as_millis() as u64;
                let idle = now.saturating_sub(last_seen.load(Ordering::SeqCst));
                if idle < PING_TIMEOUT.as_millis() as u64 {
                    continue;
                }
                eprintln!(
                    "{}{}{}{}",
                    "⚠️ WebSocket connection timed out due to inactivity • uptime=".yellow(),
                    humantime::format_duration(Duration::from_secs(epoch.elapsed().as_secs()))
                        .yellow()
                        .dimmed(),
                    " • conn_id=".yellow(),
                    conn_id.to_string().yellow().dimmed()
                );
                cancel.cancel();
                return;
            }
        }
    }
}
