//! Physical links the transport runs over.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One open connection carrying text frames. The stream ending means the
/// connection is gone.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("WebSocket connect to {} failed", self.url))?;
        let (write, read) = ws.split();
        let sink = write.with(|text: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(text))));
        // Control frames are answered by tungstenite itself.
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    Some(String::from_utf8(data).context("Binary frame is not UTF-8"))
                }
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::Error::from(e).context("WebSocket receive error"))),
            })
        });
        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
