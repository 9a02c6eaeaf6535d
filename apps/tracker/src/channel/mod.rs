use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::Rng;
use shared::{ChatMessage, Decoded, Envelope, Frame, InboundEvent, LocationUpdate, OutboundEvent, WireFormat};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ChannelError;

pub mod transport;

pub use transport::{Link, MemoryPeer, MemoryServer, MemoryTransport, Transport, WsTransport};

static CHANNEL: OnceCell<Arc<RealtimeChannel>> = OnceCell::new();

/// Installs the process-wide channel. The first installed channel wins and
/// is returned on every later call.
pub fn install(channel: Arc<RealtimeChannel>) -> Arc<RealtimeChannel> {
    CHANNEL.get_or_init(|| channel).clone()
}

pub fn global() -> Option<Arc<RealtimeChannel>> {
    CHANNEL.get().cloned()
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub format: WireFormat,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    /// Randomization factor applied to `reconnect_delay`, in `[0, 1]`.
    /// Zero keeps the delay fixed.
    pub reconnect_jitter: f64,
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/socket.io/?EIO=4&transport=websocket".to_string(),
            format: WireFormat::SocketIo,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            reconnect_jitter: 0.0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted or shut down; only `connect()` leaves it.
    Disconnected,
}

impl ConnectionState {
    fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    UpdateLocation,
    NewMessage,
}

/// What handlers receive: wire events plus connection lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connect,
    Disconnect { reason: String },
    UpdateLocation(LocationUpdate),
    NewMessage(ChatMessage),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connect => EventKind::Connect,
            ChannelEvent::Disconnect { .. } => EventKind::Disconnect,
            ChannelEvent::UpdateLocation(_) => EventKind::UpdateLocation,
            ChannelEvent::NewMessage(_) => EventKind::NewMessage,
        }
    }
}

impl From<InboundEvent> for ChannelEvent {
    fn from(event: InboundEvent) -> Self {
        match event {
            InboundEvent::UpdateLocation(update) => ChannelEvent::UpdateLocation(update),
            InboundEvent::NewMessage(message) => ChannelEvent::NewMessage(message),
        }
    }
}

pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: Vec<(SubscriptionHandle, Handler)>,
}

impl SubscriberTable {
    fn insert(&mut self, kind: EventKind, handler: Handler) -> SubscriptionHandle {
        self.next_id += 1;
        let handle = SubscriptionHandle {
            id: self.next_id,
            kind,
        };
        self.entries.push((handle.clone(), handler));
        handle
    }

    fn remove(&mut self, handle: &SubscriptionHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| entry.id != handle.id);
        self.entries.len() != before
    }

    fn matching(&self, kind: EventKind) -> Vec<Handler> {
        self.entries
            .iter()
            .filter(|(handle, _)| handle.kind == kind)
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }
}

/// Process-wide realtime connection shared by every tracking session. It
/// owns one logical connection and a table of event handlers; sessions
/// attach and detach handlers but never own the connection.
pub struct RealtimeChannel {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    subscribers: Mutex<SubscriberTable>,
    link: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    state: watch::Sender<ConnectionState>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Arc::new(Self {
            config,
            transport,
            subscribers: Mutex::new(SubscriberTable::default()),
            link: Mutex::new(None),
            state,
            driver: Mutex::new(None),
        })
    }

    pub fn websocket(config: ChannelConfig) -> Arc<Self> {
        let transport = Arc::new(WsTransport::new(config.url.clone()));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts the connection driver. A no-op while connecting, connected or
    /// reconnecting. Must be called from within a tokio runtime.
    pub fn connect(self: &Arc<Self>) {
        let mut driver = self.driver.lock();
        let running = driver.as_ref().is_some_and(|task| !task.is_finished());
        if running && self.state().is_live() {
            debug!(state = ?self.state(), "connect ignored");
            return;
        }
        if let Some(stale) = driver.take() {
            stale.abort();
        }
        self.set_state(ConnectionState::Connecting);
        let channel = Arc::clone(self);
        *driver = Some(tokio::spawn(async move { channel.drive().await }));
    }

    /// Tears the connection down. Subscriptions are left in place.
    pub fn shutdown(&self) {
        if let Some(task) = self.driver.lock().take() {
            task.abort();
        }
        let was_attached = self.link.lock().take().is_some();
        self.set_state(ConnectionState::Disconnected);
        if was_attached {
            info!("realtime channel shut down");
            self.deliver(&ChannelEvent::Disconnect {
                reason: "shutdown".to_string(),
            });
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().insert(kind, Arc::new(handler))
    }

    /// Returns whether the handle was still registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.subscribers.lock().remove(handle)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    /// Best effort: returns `false` when the event was dropped because no
    /// link is attached or it could not be encoded.
    pub fn publish(&self, event: &OutboundEvent) -> bool {
        let frame = match event
            .to_envelope()
            .and_then(|envelope| self.config.format.encode(&envelope))
        {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = event.name(), %err, "failed to encode outbound event");
                return false;
            }
        };

        let link = self.link.lock();
        let Some(outbound) = link.as_ref() else {
            debug!(event = event.name(), "dropping publish while disconnected");
            return false;
        };
        outbound.send(frame).is_ok()
    }

    /// Fans an event out to every handler registered for its kind, in
    /// subscription order. Handlers run outside the table lock, so they may
    /// publish or (un)subscribe.
    pub fn deliver(&self, event: &ChannelEvent) {
        let handlers = self.subscribers.lock().matching(event.kind());
        for handler in handlers {
            handler(event);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(?previous, state = ?next, "realtime channel state");
        }
    }

    async fn drive(self: Arc<Self>) {
        let mut retries = 0u32;
        loop {
            match self.run_link().await {
                Ok(()) => retries = 0,
                Err(err) => warn!(%err, attempt = retries, "realtime connect attempt failed"),
            }
            if retries >= self.config.reconnect_attempts {
                self.set_state(ConnectionState::Disconnected);
                warn!(attempts = retries, "realtime channel gave up reconnecting");
                return;
            }
            retries += 1;
            self.set_state(ConnectionState::Reconnecting { attempt: retries });
            tokio::time::sleep(self.retry_delay()).await;
        }
    }

    /// Connects, serves the link until it drops, and reports whether the
    /// server ever accepted the session.
    async fn run_link(&self) -> Result<(), ChannelError> {
        let (mut link, heartbeat) = tokio::time::timeout(self.config.connect_timeout, self.establish())
            .await
            .map_err(|_| ChannelError::TimedOut)??;

        *self.link.lock() = Some(link.outbound.clone());
        self.set_state(ConnectionState::Connected);
        info!(url = %self.config.url, "realtime channel connected");
        self.deliver(&ChannelEvent::Connect);

        let reason = self.pump(&mut link, heartbeat).await;

        self.link.lock().take();
        warn!(%reason, "realtime link dropped");
        self.deliver(&ChannelEvent::Disconnect { reason });
        Ok(())
    }

    /// Returns the link once the server accepted the session, with the
    /// heartbeat deadline it announced, if any.
    async fn establish(&self) -> Result<(Link, Option<Duration>), ChannelError> {
        let mut link = self.transport.connect().await?;
        let format = self.config.format;
        if !format.requires_handshake() {
            return Ok((link, None));
        }
        let mut heartbeat = None;
        while let Some(frame) = link.inbound.recv().await {
            match format.decode(&frame)? {
                Decoded::Ready => return Ok((link, heartbeat)),
                Decoded::Open { reply, heartbeat: announced } => {
                    heartbeat = Some(announced);
                    let _ = link.outbound.send(reply);
                }
                Decoded::Reply(reply) => {
                    let _ = link.outbound.send(reply);
                }
                Decoded::Closed => return Err(ChannelError::Closed),
                Decoded::Event(_) | Decoded::Ignored => {}
            }
        }
        Err(ChannelError::Closed)
    }

    /// Serves the link until it drops. With a heartbeat, any silence longer
    /// than the deadline counts as a dead link.
    async fn pump(&self, link: &mut Link, heartbeat: Option<Duration>) -> String {
        let format = self.config.format;
        loop {
            let next = match heartbeat {
                Some(deadline) => match tokio::time::timeout(deadline, link.inbound.recv()).await {
                    Ok(next) => next,
                    Err(_) => return "ping timeout".to_string(),
                },
                None => link.inbound.recv().await,
            };
            let Some(frame) = next else {
                return "transport closed".to_string();
            };
            match format.decode(&frame) {
                Ok(Decoded::Event(envelope)) => self.route(envelope),
                Ok(Decoded::Reply(reply)) | Ok(Decoded::Open { reply, .. }) => {
                    if link.outbound.send(reply).is_err() {
                        return "transport closed".to_string();
                    }
                }
                Ok(Decoded::Closed) => return "server closed the session".to_string(),
                Ok(Decoded::Ready) | Ok(Decoded::Ignored) => {}
                Err(err) => debug!(%err, "dropping undecodable frame"),
            }
        }
    }

    fn route(&self, envelope: Envelope) {
        let name = envelope.event.clone();
        match InboundEvent::from_envelope(envelope) {
            Ok(Some(event)) => self.deliver(&event.into()),
            Ok(None) => trace!(event = %name, "ignoring unhandled event"),
            Err(err) => debug!(event = %name, %err, "dropping malformed event"),
        }
    }

    fn retry_delay(&self) -> Duration {
        let base = self.config.reconnect_delay;
        let jitter = self.config.reconnect_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(1.0 + factor)
    }
}
