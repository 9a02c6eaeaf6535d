use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use shared::{Frame, InboundEvent, OutboundEvent, WireError, WireFormat};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::error::ChannelError;

/// One established connection, as a pair of frame queues. Dropping
/// `outbound` closes the connection.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, ChannelError>;
}

pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Link, ChannelError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|source| ChannelError::Connect {
                url: self.url.clone(),
                source,
            })?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if let Err(err) = sink.send(message).await {
                    debug!(%err, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(%err, "websocket read failed");
                        break;
                    }
                };
                if inbound_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(Link { outbound, inbound })
    }
}

/// In-process transport for tests and for embedding the channel next to
/// a local event source. Every successful `connect` hands the server side
/// of the new link to the paired [`MemoryServer`].
pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server side of one in-process link.
pub struct MemoryPeer {
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    pub to_client: mpsc::UnboundedSender<Frame>,
}

impl MemoryTransport {
    pub fn pair() -> (Arc<Self>, MemoryServer) {
        let (accepted, accepted_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            accepted,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (transport, MemoryServer { accepted: accepted_rx })
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<Link, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ChannelError::Refused);
        }
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.accepted
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| ChannelError::Refused)?;
        Ok(Link { outbound, inbound })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }
}

impl MemoryPeer {
    pub fn push(&self, format: WireFormat, event: &InboundEvent) -> Result<(), WireError> {
        let frame = format.encode(&event.to_envelope()?)?;
        let _ = self.to_client.send(frame);
        Ok(())
    }

    pub fn push_frame(&self, frame: Frame) {
        let _ = self.to_client.send(frame);
    }

    /// Next event the client published, skipping frames that do not decode
    /// to a known event.
    pub async fn next_published(&mut self, format: WireFormat) -> Option<OutboundEvent> {
        while let Some(frame) = self.from_client.recv().await {
            if let Some(event) = decode_outbound(format, &frame) {
                return Some(event);
            }
        }
        None
    }

    pub fn try_next_published(&mut self, format: WireFormat) -> Option<OutboundEvent> {
        while let Ok(frame) = self.from_client.try_recv() {
            if let Some(event) = decode_outbound(format, &frame) {
                return Some(event);
            }
        }
        None
    }
}

fn decode_outbound(format: WireFormat, frame: &Frame) -> Option<OutboundEvent> {
    match format.decode(frame) {
        Ok(shared::Decoded::Event(envelope)) => OutboundEvent::from_envelope(envelope).ok().flatten(),
        _ => None,
    }
}
