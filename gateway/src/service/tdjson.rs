//! TDLib JSON interface reached through a sidecar over TCP.
//!
//! The sidecar speaks newline-delimited JSON. Every request is tagged with a
//! numeric `@extra`; the sidecar echoes the tag on the matching reply. Lines
//! without `@extra` are updates and are fanned out to subscribers.

use super::{LoginHooks, Service, driver, error_message};
use crate::error::{LoginError, ServiceError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use owo_colors::OwoColorize;
use parley_common::pending::PendingTable;
use serde::Serialize;
use serde_json::Value;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::{broadcast, mpsc},
};
use tokio_util::sync::CancellationToken;

const EXTRA: &str = "@extra";
const OUTBOUND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 1024;

/// Arguments of `setTdlibParameters`.
#[derive(Clone, Debug, Serialize)]
pub struct TdlibParameters {
    pub api_id: i64,
    pub api_hash: String,
    pub database_directory: String,
    pub files_directory: String,
    pub use_file_database: bool,
    pub use_chat_info_database: bool,
    pub use_message_database: bool,
    pub system_language_code: String,
    pub device_model: String,
    pub application_version: String,
}

impl TdlibParameters {
    pub fn new(api_id: i64, api_hash: String, database_dir: &str) -> Self {
        let database_dir = database_dir.trim_end_matches('/');
        Self {
            api_id,
            api_hash,
            database_directory: database_dir.to_owned(),
            files_directory: format!("{}/files", database_dir),
            use_file_database: true,
            use_chat_info_database: true,
            use_message_database: true,
            system_language_code: "en".to_owned(),
            device_model: "parley".to_owned(),
            application_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    pub fn request(&self) -> Value {
        let mut request = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()));
        if let Some(obj) = request.as_object_mut() {
            obj.insert("@type".into(), "setTdlibParameters".into());
        }
        request
    }
}

pub struct TdJsonService {
    outbound: mpsc::Sender<String>,
    pending: PendingTable<u64, Value, ServiceError>,
    next_extra: AtomicU64,
    events: broadcast::Sender<Value>,
    closed: CancellationToken,
    call_timeout: Duration,
    parameters: TdlibParameters,
}

fn connection_closed() -> ServiceError {
    ServiceError::new("service connection closed")
}

impl TdJsonService {
    /// Connects to the sidecar and hands it the client parameters so that
    /// calls like `getMe` work for an already-authorized session.
    pub async fn connect(
        addr: &str,
        parameters: TdlibParameters,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        println!(
            "{}{}",
            "🔌 Connecting to service • addr=".green(),
            addr.green().dimmed()
        );
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to service at {}", addr))?;
        let service = Self::from_stream(stream, parameters, call_timeout, cancel);
        driver::initialize(service.as_ref(), &service.parameters)
            .await
            .context("Failed to initialize service")?;
        Ok(service)
    }

    pub fn from_stream<S>(
        stream: S,
        parameters: TdlibParameters,
        call_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pending = PendingTable::new();
        let closed = cancel.child_token();

        let write_closed = closed.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(write_closed.clone(), outbound_rx, write_half).await {
                eprintln!(
                    "{}{}",
                    "❌ Service writer failed • error=".red(),
                    format!("{:?}", e).red().dimmed()
                );
            }
            write_closed.cancel();
        });

        let read_closed = closed.clone();
        let read_pending = pending.clone();
        let read_events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = read_loop(read_closed.clone(), read_half, &read_pending, &read_events).await
            {
                eprintln!(
                    "{}{}",
                    "❌ Service reader failed • error=".red(),
                    format!("{:?}", e).red().dimmed()
                );
            }
            read_closed.cancel();
            let rejected = read_pending.reject_all(connection_closed);
            eprintln!(
                "{}{}",
                "🛑 Service connection closed • rejected=".red(),
                rejected.red().dimmed()
            );
        });

        Arc::new(Self {
            outbound,
            pending,
            next_extra: AtomicU64::new(0),
            events,
            closed,
            call_timeout,
            parameters,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of calls awaiting a reply from the sidecar.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl Service for TdJsonService {
    async fn invoke(&self, request: Value) -> Result<Value, ServiceError> {
        let Value::Object(mut request) = request else {
            return Err(ServiceError::new("request must be a JSON object"));
        };
        let extra = self.next_extra.fetch_add(1, Ordering::Relaxed) + 1;
        request.insert(EXTRA.into(), extra.into());
        let line = serde_json::to_string(&request)
            .map_err(|e| ServiceError::new(format!("Failed to encode request: {}", e)))?;
        let waiter = self
            .pending
            .register(extra, self.call_timeout)
            .map_err(|e| ServiceError::new(e.to_string()))?;
        // The reader marks the connection closed before rejecting what is
        // registered, so an entry added after that sweep is caught here.
        // Dropping the waiter removes it again.
        if self.is_closed() {
            return Err(connection_closed());
        }
        if self.outbound.send(line).await.is_err() {
            return Err(connection_closed());
        }
        waiter
            .wait(|| ServiceError::new("service call timed out"), connection_closed)
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    async fn login(&self, hooks: &dyn LoginHooks) -> Result<(), LoginError> {
        driver::run(self, hooks, &self.parameters).await
    }
}

async fn write_loop<W>(
    closed: CancellationToken,
    mut outbound: mpsc::Receiver<String>,
    mut writer: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            _ = closed.cancelled() => return Ok(()),
            line = outbound.recv() => line,
        };
        let Some(mut line) = line else {
            return Ok(());
        };
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write request to service")?;
        writer.flush().await.context("Failed to flush service stream")?;
    }
}

async fn read_loop<R>(
    closed: CancellationToken,
    reader: R,
    pending: &PendingTable<u64, Value, ServiceError>,
    events: &broadcast::Sender<Value>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = select! {
            _ = closed.cancelled() => return Ok(()),
            line = lines.next_line() => line.context("Failed to read from service")?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        route(&line, pending, events);
    }
}

fn route(line: &str, pending: &PendingTable<u64, Value, ServiceError>, events: &broadcast::Sender<Value>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            eprintln!(
                "{}{}",
                "⚠️ Discarding unparseable service line • error=".yellow(),
                e.yellow().dimmed()
            );
            return;
        }
    };
    let extra = value
        .as_object_mut()
        .and_then(|obj| obj.remove(EXTRA))
        .and_then(|extra| extra.as_u64());
    let Some(extra) = extra else {
        // No subscribers is not an error; the update is simply not wanted.
        let _ = events.send(value);
        return;
    };
    let outcome = match error_message(&value) {
        Some(message) => Err(ServiceError(message)),
        None => Ok(value),
    };
    if !pending.settle(&extra, outcome) {
        eprintln!(
            "{}{}",
            "⚠️ Reply for unknown or expired request • extra=".yellow(),
            extra.yellow().dimmed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct Sidecar {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Sidecar {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }
    }

    fn parameters() -> TdlibParameters {
        TdlibParameters::new(1234, "hash".into(), "/tmp/parley/")
    }

    fn pair(call_timeout: Duration) -> (Arc<TdJsonService>, Sidecar) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let service =
            TdJsonService::from_stream(ours, parameters(), call_timeout, CancellationToken::new());
        let (reader, writer) = tokio::io::split(theirs);
        let sidecar = Sidecar {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        (service, sidecar)
    }

    #[test]
    fn parameters_request_is_typed() {
        let request = parameters().request();
        assert_eq!(request["@type"], "setTdlibParameters");
        assert_eq!(request["api_id"], 1234);
        assert_eq!(request["database_directory"], "/tmp/parley");
        assert_eq!(request["files_directory"], "/tmp/parley/files");
    }

    #[tokio::test]
    async fn replies_are_matched_by_extra_not_order() {
        let (service, mut sidecar) = pair(Duration::from_secs(5));
        let first = tokio::spawn({
            let service = service.clone();
            async move { service.invoke(json!({"@type": "getChat", "chat_id": 1})).await }
        });
        let a = sidecar.next_request().await;
        let second = tokio::spawn({
            let service = service.clone();
            async move { service.invoke(json!({"@type": "getChat", "chat_id": 2})).await }
        });
        let b = sidecar.next_request().await;
        assert_ne!(a[EXTRA], b[EXTRA]);

        sidecar
            .send(json!({"@type": "chat", "id": 2, "@extra": b[EXTRA]}))
            .await;
        sidecar
            .send(json!({"@type": "chat", "id": 1, "@extra": a[EXTRA]}))
            .await;

        assert_eq!(
            second.await.unwrap().unwrap(),
            json!({"@type": "chat", "id": 2})
        );
        assert_eq!(
            first.await.unwrap().unwrap(),
            json!({"@type": "chat", "id": 1})
        );
        assert_eq!(service.outstanding(), 0);
    }

    #[tokio::test]
    async fn error_objects_reject_with_message() {
        let (service, mut sidecar) = pair(Duration::from_secs(5));
        let call = tokio::spawn({
            let service = service.clone();
            async move { service.invoke(json!({"@type": "getMe"})).await }
        });
        let req = sidecar.next_request().await;
        sidecar
            .send(json!({"@type": "error", "code": 401, "message": "Unauthorized", "@extra": req[EXTRA]}))
            .await;
        assert_eq!(
            call.await.unwrap(),
            Err(ServiceError::new("Unauthorized"))
        );
    }

    #[tokio::test]
    async fn lines_without_extra_are_broadcast() {
        let (service, mut sidecar) = pair(Duration::from_secs(5));
        let mut events = service.subscribe();
        sidecar
            .send(json!({"@type": "updateNewMessage", "message": {"id": 5}}))
            .await;
        let event = events.recv().await.unwrap();
        assert_eq!(event["@type"], "updateNewMessage");
    }

    #[tokio::test]
    async fn call_times_out_without_reply() {
        let (service, mut sidecar) = pair(Duration::from_millis(30));
        let call = tokio::spawn({
            let service = service.clone();
            async move { service.invoke(json!({"@type": "getMe"})).await }
        });
        let req = sidecar.next_request().await;
        assert_eq!(
            call.await.unwrap(),
            Err(ServiceError::new("service call timed out"))
        );
        assert_eq!(service.outstanding(), 0);
        // The late reply is discarded.
        sidecar
            .send(json!({"@type": "user", "@extra": req[EXTRA]}))
            .await;
    }

    #[tokio::test]
    async fn closing_the_sidecar_rejects_outstanding_calls() {
        let (service, mut sidecar) = pair(Duration::from_secs(5));
        let call = tokio::spawn({
            let service = service.clone();
            async move { service.invoke(json!({"@type": "getMe"})).await }
        });
        sidecar.next_request().await;
        drop(sidecar);
        assert_eq!(call.await.unwrap(), Err(connection_closed()));
        assert!(service.is_closed());
        assert_eq!(
            service.invoke(json!({"@type": "getMe"})).await,
            Err(connection_closed())
        );
    }

    #[tokio::test]
    async fn call_registered_after_close_sweep_fails_at_once() {
        // Closed and swept, but the writer has not dropped its queue yet.
        let (outbound, _outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closed = CancellationToken::new();
        closed.cancel();
        let service = TdJsonService {
            outbound,
            pending: PendingTable::new(),
            next_extra: AtomicU64::new(0),
            events,
            closed,
            call_timeout: Duration::from_secs(60),
            parameters: parameters(),
        };
        assert_eq!(service.pending.reject_all(connection_closed), 0);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            service.invoke(json!({"@type": "getMe"})),
        )
        .await
        .unwrap();
        assert_eq!(result, Err(connection_closed()));
        assert_eq!(service.outstanding(), 0);
    }

    #[tokio::test]
    async fn non_object_requests_are_refused() {
        let (service, _sidecar) = pair(Duration::from_secs(5));
        assert!(service.invoke(json!([1, 2, 3])).await.is_err());
    }
}
