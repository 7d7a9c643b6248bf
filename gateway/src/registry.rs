//! Live websocket connections and the fan-out of service updates to them.

use anyhow::{Result, bail};
use axum::extract::ws::Utf8Bytes;
use owo_colors::OwoColorize;
use parley_types::Push;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    select,
    sync::{
        RwLock,
        broadcast::{self, error::RecvError},
        mpsc::{self, error::TrySendError},
    },
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const MEMBER_QUEUE: usize = 256;

pub type Outbound = mpsc::Sender<Utf8Bytes>;

/// Handle returned by [`Registry::join`].
pub struct Member {
    pub id: Uuid,
    pub outbound: Outbound,
    pub rx: mpsc::Receiver<Utf8Bytes>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Members whose queue was full; they miss this update.
    pub dropped: usize,
    /// Members whose connection had already gone; they were removed.
    pub closed: usize,
}

#[derive(Clone)]
pub struct Registry {
    members: Arc<RwLock<HashMap<Uuid, Outbound>>>,
    capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(MEMBER_QUEUE)
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            members: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn join(&self) -> Member {
        let id = Uuid::new_v4();
        let (outbound, rx) = mpsc::channel(self.capacity);
        let mut members = self.members.write().await;
        members.insert(id, outbound.clone());
        metrics::gauge!("parley_connections").set(members.len() as f64);
        Member { id, outbound, rx }
    }

    pub async fn leave(&self, id: Uuid) -> bool {
        let mut members = self.members.write().await;
        let removed = members.remove(&id).is_some();
        metrics::gauge!("parley_connections").set(members.len() as f64);
        removed
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Sends `{update}` to every member. The frame is serialized once; a
    /// full or closed member never holds up the others.
    pub async fn broadcast(&self, update: Value) -> Result<Delivery> {
        let frame: Utf8Bytes = serde_json::to_string(&Push { update })?.into();
        let snapshot: Vec<(Uuid, Outbound)> = self
            .members
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        let mut delivery = Delivery::default();
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    eprintln!(
                        "{}{}",
                        "⚠️ Update dropped for slow connection • conn_id=".yellow(),
                        id.yellow().dimmed()
                    );
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            delivery.closed = gone.len();
            let mut members = self.members.write().await;
            for id in gone {
                members.remove(&id);
            }
            metrics::gauge!("parley_connections").set(members.len() as f64);
        }
        metrics::counter!("parley_updates_total").increment(1);
        if delivery.dropped > 0 {
            metrics::counter!("parley_updates_dropped_total").increment(delivery.dropped as u64);
        }
        Ok(delivery)
    }
}

/// Forwards every service event to the registry until cancelled or the
/// service stops emitting.
pub async fn pump(
    cancel: CancellationToken,
    mut events: broadcast::Receiver<Value>,
    registry: Registry,
) -> Result<()> {
    loop {
        let event = select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(update) => {
                registry.broadcast(update).await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                metrics::counter!("parley_updates_dropped_total").increment(skipped);
                eprintln!(
                    "{}{}",
                    "⚠️ Update pump fell behind • skipped=".yellow(),
                    skipped.yellow().dimmed()
                );
            }
            Err(RecvError::Closed) => bail!("Service event stream closed"),
        }
    }
}
