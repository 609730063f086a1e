//! A WebSocket [`Adapter`] (feature `websocket`). Each accepted or dialed
//! connection becomes one channel; framing is JSON by default, or the
//! `compat` LoroProtocol magic-byte framing when that feature is also on.

use crate::adapter::{Adapter, AdapterEvents};
use crate::channel::{ChannelKind, ChannelSink};
use crate::envelope::Envelope;
use crate::id::{AdapterId, ChannelId};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn encode(envelope: &Envelope) -> anyhow::Result<Vec<u8>> {
    #[cfg(feature = "compat")]
    {
        crate::envelope::compat::encode(envelope)
    }
    #[cfg(not(feature = "compat"))]
    {
        Ok(serde_json::to_vec(envelope)?)
    }
}

fn decode(bytes: &[u8]) -> anyhow::Result<Envelope> {
    #[cfg(feature = "compat")]
    {
        crate::envelope::compat::decode(bytes)
    }
    #[cfg(not(feature = "compat"))]
    {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Listens on `addr` and turns every accepted connection into a channel.
pub struct WebSocketAdapter {
    id: AdapterId,
    addr: std::net::SocketAddr,
}

impl WebSocketAdapter {
    pub fn new(id: impl Into<AdapterId>, addr: std::net::SocketAddr) -> Self {
        Self { id: id.into(), addr }
    }
}

#[async_trait]
impl Adapter for WebSocketAdapter {
    fn id(&self) -> AdapterId {
        self.id.clone()
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Network
    }

    async fn start(&self, events: Arc<dyn AdapterEvents>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let adapter_id = self.id.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(ok) => ok,
                    Err(err) => {
                        tracing::warn!(error = %err, "websocket accept failed");
                        continue;
                    }
                };
                let events = events.clone();
                let adapter_id = adapter_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(stream, peer_addr.to_string(), adapter_id, events).await {
                        tracing::warn!(error = %err, "websocket connection ended with error");
                    }
                });
            }
        });
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        // Listener is dropped with the spawned accept loop; individual
        // channels are torn down by the Synchronizer calling each sink's
        // `stop`, not from here.
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_hint: String,
    adapter_id: AdapterId,
    events: Arc<dyn AdapterEvents>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    run_channel(ws, peer_hint, adapter_id, events).await
}

/// Dials `addr` and registers the resulting connection as a channel, same as
/// an accepted one.
pub async fn connect(
    id: impl Into<AdapterId>,
    addr: &str,
    events: Arc<dyn AdapterEvents>,
) -> anyhow::Result<()> {
    let (ws, _) = tokio_tungstenite::connect_async(addr).await?;
    run_channel(ws, addr.to_string(), id.into(), events).await
}

async fn run_channel<S>(
    ws: WebSocketStream<S>,
    peer_hint: String,
    adapter_id: AdapterId,
    events: Arc<dyn AdapterEvents>,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();

    let sink = Arc::new(WsSink {
        outbox: outbox_tx,
        closed: Mutex::new(false),
    });
    let channel_id = events.channel_added(adapter_id, ChannelKind::Network, Some(peer_hint), sink.clone());

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbox_rx.recv().await {
            let bytes = match encode(&envelope) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode outgoing envelope");
                    continue;
                }
            };
            if write.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        if let Message::Binary(bytes) = msg {
            match decode(&bytes) {
                Ok(envelope) => events.channel_receive(channel_id, envelope),
                Err(err) => tracing::warn!(error = %err, "dropping malformed frame"),
            }
        }
    }

    writer.abort();
    events.channel_removed(channel_id);
    Ok(())
}

struct WsSink {
    outbox: mpsc::UnboundedSender<Envelope>,
    closed: Mutex<bool>,
}

impl ChannelSink for WsSink {
    fn send(&self, message: Envelope) {
        let _ = self.outbox.send(message);
    }

    fn stop(&self) {
        *self.closed.lock().unwrap() = true;
    }
}
