use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use shared::{ChatMessage, Coordinates, LocationUpdate, OutboundEvent, ReportId, ReportRef};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelEvent, EventKind, RealtimeChannel, SubscriptionHandle};
use crate::chat::{ChatCache, ChatLog};
use crate::error::SessionError;
use crate::track::{LocationSample, Track, TrackViewModel};

const OBSERVER_CAPACITY: usize = 256;
/// Sent messages remembered for echo suppression. Older ones are forgotten,
/// so a server that never echoes cannot grow the list.
const UNECHOED_LIMIT: usize = 64;

/// How a session treats the chat messages it sends itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// Own messages appear only when the server echoes them back.
    #[default]
    AwaitEcho,
    /// Own messages are appended on send; the echo is then swallowed.
    Optimistic,
}

impl FromStr for EchoPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "echo" | "await-echo" => Ok(EchoPolicy::AwaitEcho),
            "optimistic" => Ok(EchoPolicy::Optimistic),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Role label stamped on outgoing messages.
    pub actor: String,
    pub echo: EchoPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            actor: "Officer".to_string(),
            echo: EchoPolicy::AwaitEcho,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    Joined,
    Active,
    /// Held only while a sample is recorded under the state lock, so
    /// `phase()` never reports it.
    ReceivingUpdate,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Moved { sample: LocationSample, recenter: bool },
    Message(ChatMessage),
    /// The room was joined again after the channel (re)connected.
    Rejoined,
}

/// Whether an event addressed to `event_report` belongs to the session
/// tracking `session_report`. The channel is shared, so every handler
/// filters through this.
pub fn is_for_session(session_report: &ReportId, event_report: &ReportId) -> bool {
    session_report == event_report
}

struct SessionState {
    phase: SessionPhase,
    track: Track,
    chat: ChatLog,
    /// Optimistically appended messages still waiting for their echo.
    unechoed: VecDeque<ChatMessage>,
}

struct Shared {
    report: ReportRef,
    options: SessionOptions,
    state: Mutex<SessionState>,
    observers: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn notify(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.observers.send(event);
    }

    fn on_location(&self, update: &LocationUpdate) {
        if !is_for_session(&self.report.report_id, &update.report_id) {
            return;
        }
        let coordinates = match Coordinates::new(update.latitude, update.longitude) {
            Ok(coordinates) => coordinates,
            Err(err) => {
                debug!(report_id = %self.report.report_id, %err, "dropping location update");
                return;
            }
        };

        let (sample, recenter) = {
            let mut state = self.state.lock();
            if !state.phase_accepts_events() {
                return;
            }
            state.phase = SessionPhase::ReceivingUpdate;
            let sample = state.track.record(coordinates);
            let recenter = TrackViewModel::recenters_on(&sample);
            state.phase = SessionPhase::Active;
            (sample, recenter)
        };
        debug!(report_id = %self.report.report_id, %coordinates, "location update");
        self.notify(SessionEvent::Moved { sample, recenter });
    }

    fn on_message(&self, message: &ChatMessage) {
        if !is_for_session(&self.report.report_id, &message.report_id) {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.phase_accepts_events() {
                return;
            }
            if let Some(index) = state.unechoed.iter().position(|sent| sent == message) {
                state.unechoed.remove(index);
                debug!(report_id = %self.report.report_id, "own message echoed");
                return;
            }
            state.chat.append(message.clone());
            if state.phase == SessionPhase::Joined {
                state.phase = SessionPhase::Active;
            }
        }
        self.notify(SessionEvent::Message(message.clone()));
    }

    fn on_connect(&self, channel: &RealtimeChannel) {
        if !self.state.lock().phase_accepts_events() {
            return;
        }
        channel.publish(&OutboundEvent::JoinRoom(self.report.report_id.clone()));
        info!(report_id = %self.report.report_id, "rejoined room");
        self.notify(SessionEvent::Rejoined);
    }
}

impl SessionState {
    fn phase_accepts_events(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Joined | SessionPhase::Active | SessionPhase::ReceivingUpdate
        )
    }
}

/// Live tracking context for one report: its path, its chat, and the
/// channel subscriptions feeding them.
pub struct RoomSession {
    id: Uuid,
    channel: Arc<RealtimeChannel>,
    shared: Arc<Shared>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl RoomSession {
    /// Seeds the path with the start location and restores cached chat.
    pub fn new(
        report: ReportRef,
        channel: Arc<RealtimeChannel>,
        cache: Arc<dyn ChatCache>,
        options: SessionOptions,
    ) -> Self {
        let chat = ChatLog::load(report.report_id.clone(), cache);
        let track = Track::seeded(report.start_location, report.live_location);
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            channel,
            shared: Arc::new(Shared {
                report,
                options,
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Created,
                    track,
                    chat,
                    unechoed: VecDeque::new(),
                }),
                observers,
            }),
            subscriptions: Vec::new(),
        }
    }

    /// Registers the session's handlers and joins the report's room.
    pub fn open(&mut self) -> Result<(), SessionError> {
        let report_id = self.report_id().clone();
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                SessionPhase::Created => state.phase = SessionPhase::Joined,
                SessionPhase::Closed => return Err(SessionError::Closed(report_id)),
                _ => return Err(SessionError::AlreadyOpened(report_id)),
            }
        }

        if self.shared.report.kind.streams_location() {
            let shared = Arc::clone(&self.shared);
            self.subscriptions.push(self.channel.subscribe(EventKind::UpdateLocation, move |event| {
                if let ChannelEvent::UpdateLocation(update) = event {
                    shared.on_location(update);
                }
            }));
        }

        let shared = Arc::clone(&self.shared);
        self.subscriptions.push(self.channel.subscribe(EventKind::NewMessage, move |event| {
            if let ChannelEvent::NewMessage(message) = event {
                shared.on_message(message);
            }
        }));

        let shared = Arc::clone(&self.shared);
        let channel: Weak<RealtimeChannel> = Arc::downgrade(&self.channel);
        self.subscriptions.push(self.channel.subscribe(EventKind::Connect, move |_| {
            if let Some(channel) = channel.upgrade() {
                shared.on_connect(&channel);
            }
        }));

        let joined = self.channel.publish(&OutboundEvent::JoinRoom(report_id.clone()));
        info!(
            %report_id,
            session = %self.id,
            kind = ?self.shared.report.kind,
            joined,
            "tracking session opened"
        );
        Ok(())
    }

    /// Publishes a chat message. Blank text is a no-op returning `Ok(None)`.
    pub fn send(&self, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        let report_id = self.report_id().clone();
        match self.phase() {
            SessionPhase::Created => return Err(SessionError::NotOpen(report_id)),
            SessionPhase::Closed => return Err(SessionError::Closed(report_id)),
            _ => {}
        }
        let Some(message) = ChatMessage::compose(report_id, &self.shared.options.actor, text) else {
            return Ok(None);
        };

        let published = self.channel.publish(&OutboundEvent::SendMessage(message.clone()));
        if !published {
            warn!(report_id = %message.report_id, "chat message not delivered; channel disconnected");
        }

        if self.shared.options.echo == EchoPolicy::Optimistic {
            {
                let mut state = self.shared.state.lock();
                state.chat.append(message.clone());
                if published {
                    if state.unechoed.len() == UNECHOED_LIMIT {
                        state.unechoed.pop_front();
                    }
                    state.unechoed.push_back(message.clone());
                }
            }
            self.shared.notify(SessionEvent::Message(message.clone()));
        }
        Ok(Some(message))
    }

    /// Detaches every handler this session registered. Idempotent; the
    /// shared channel stays connected.
    pub fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.phase == SessionPhase::Closed {
                return;
            }
            state.phase = SessionPhase::Closed;
        }
        for handle in self.subscriptions.drain(..) {
            self.channel.unsubscribe(&handle);
        }
        info!(report_id = %self.report_id(), session = %self.id, "tracking session closed");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.observers.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.state.lock().phase
    }

    pub fn report(&self) -> &ReportRef {
        &self.shared.report
    }

    pub fn report_id(&self) -> &ReportId {
        &self.shared.report.report_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Snapshot of the track for rendering.
    pub fn view(&self) -> TrackViewModel {
        TrackViewModel::from(self.shared.state.lock().track.clone())
    }

    pub fn current_position(&self) -> Coordinates {
        self.view().current_position()
    }

    pub fn path(&self) -> Vec<Coordinates> {
        self.view().path()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.state.lock().chat.messages().to_vec()
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ConnectionState, MemoryTransport};
    use crate::chat::MemoryCache;
    use shared::{ReportKind, WireFormat};

    fn channel() -> Arc<RealtimeChannel> {
        let (transport, _server) = MemoryTransport::pair();
        RealtimeChannel::new(ChannelConfig::default(), transport)
    }

    fn report(id: &str, kind: ReportKind) -> ReportRef {
        ReportRef::new(
            ReportId::new(id).expect("id"),
            kind,
            Coordinates::new(1.0, 2.0).expect("coords"),
        )
    }

    fn update(id: &str, latitude: f64, longitude: f64) -> ChannelEvent {
        ChannelEvent::UpdateLocation(LocationUpdate {
            report_id: ReportId::new(id).expect("id"),
            latitude,
            longitude,
        })
    }

    fn incoming(id: &str, sender: &str, text: &str) -> ChatMessage {
        ChatMessage::compose(ReportId::new(id).expect("id"), sender, text).expect("message")
    }

    fn open(id: &str, channel: &Arc<RealtimeChannel>, cache: Arc<MemoryCache>) -> RoomSession {
        let mut session = RoomSession::new(
            report(id, ReportKind::Personal),
            Arc::clone(channel),
            cache,
            SessionOptions::default(),
        );
        session.open().expect("open");
        session
    }

    #[test]
    fn filter_matches_only_the_same_report() {
        let a = ReportId::new("a").expect("id");
        let b = ReportId::new("b").expect("id");
        assert!(is_for_session(&a, &a));
        assert!(!is_for_session(&a, &b));
    }

    #[test]
    fn n_updates_give_a_path_of_n_plus_one() {
        let channel = channel();
        let session = open("r1", &channel, MemoryCache::new());
        assert_eq!(session.phase(), SessionPhase::Joined);

        let points = [(1.1, 2.1), (1.2, 2.2), (1.3, 2.3), (1.2, 2.2)];
        for (lat, lng) in points {
            channel.deliver(&update("r1", lat, lng));
        }
        let path = session.path();
        assert_eq!(path.len(), points.len() + 1);
        assert_eq!(path[0], Coordinates::new(1.0, 2.0).expect("coords"));
        for (recorded, (lat, lng)) in path[1..].iter().zip(points) {
            assert_eq!(*recorded, Coordinates::new(lat, lng).expect("coords"));
        }
        assert_eq!(session.current_position(), Coordinates::new(1.2, 2.2).expect("coords"));
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn invalid_coordinates_leave_state_untouched() {
        let channel = channel();
        let session = open("r1", &channel, MemoryCache::new());
        channel.deliver(&update("r1", 95.0, 2.0));
        channel.deliver(&update("r1", f64::NAN, 2.0));
        assert_eq!(session.path().len(), 1);
    }

    #[test]
    fn other_reports_never_leak_into_a_session() {
        let channel = channel();
        let cache = MemoryCache::new();
        let a = open("a", &channel, cache.clone());
        let b = open("b", &channel, cache);

        channel.deliver(&update("b", 5.0, 6.0));
        channel.deliver(&ChannelEvent::NewMessage(incoming("b", "Citizen", "for b")));

        assert_eq!(a.path().len(), 1);
        assert_eq!(a.current_position(), Coordinates::new(1.0, 2.0).expect("coords"));
        assert!(a.messages().is_empty());
        assert_eq!(b.path().len(), 2);
        assert_eq!(b.messages().len(), 1);
    }

    #[test]
    fn observers_see_moves_and_messages() {
        let channel = channel();
        let session = open("r1", &channel, MemoryCache::new());
        let mut events = session.subscribe();

        channel.deliver(&update("r1", 1.5, 2.5));
        channel.deliver(&ChannelEvent::NewMessage(incoming("r1", "Citizen", "help")));

        match events.try_recv().expect("moved") {
            SessionEvent::Moved { sample, recenter } => {
                assert!(recenter);
                assert_eq!(sample.coordinates, Coordinates::new(1.5, 2.5).expect("coords"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(events.try_recv().expect("message"), SessionEvent::Message(m) if m.text == "help"));
    }

    #[test]
    fn close_removes_every_handler() {
        let channel = channel();
        let mut session = open("r1", &channel, MemoryCache::new());
        assert_eq!(channel.subscriber_count(), 3);

        session.close();
        session.close();
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(session.phase(), SessionPhase::Closed);

        channel.deliver(&update("r1", 1.5, 2.5));
        channel.deliver(&ChannelEvent::NewMessage(incoming("r1", "Citizen", "late")));
        assert_eq!(session.path().len(), 1);
        assert!(session.messages().is_empty());
    }

    #[test]
    fn open_is_single_shot() {
        let channel = channel();
        let mut session = open("r1", &channel, MemoryCache::new());
        assert!(matches!(session.open(), Err(SessionError::AlreadyOpened(_))));
        session.close();
        assert!(matches!(session.open(), Err(SessionError::Closed(_))));
        assert!(matches!(session.send("hi"), Err(SessionError::Closed(_))));
    }

    #[test]
    fn send_before_open_is_refused() {
        let session = RoomSession::new(
            report("r1", ReportKind::Personal),
            channel(),
            MemoryCache::new(),
            SessionOptions::default(),
        );
        assert!(matches!(session.send("hi"), Err(SessionError::NotOpen(_))));
    }

    #[test]
    fn blank_send_is_a_no_op() {
        let channel = channel();
        let session = open("r1", &channel, MemoryCache::new());
        assert_eq!(session.send("   ").expect("ok"), None);
        assert_eq!(session.send("").expect("ok"), None);
        assert!(session.messages().is_empty());
    }

    #[test]
    fn await_echo_does_not_append_on_send() {
        let channel = channel();
        let session = open("r1", &channel, MemoryCache::new());
        let sent = session.send(" hello ").expect("ok").expect("message");
        assert_eq!(sent.text, "hello");
        assert_eq!(sent.sender, "Officer");
        assert!(session.messages().is_empty());

        channel.deliver(&ChannelEvent::NewMessage(sent.clone()));
        assert_eq!(session.messages(), vec![sent]);
    }

    #[test]
    fn crime_reports_ignore_location_streams() {
        let channel = channel();
        let mut session = RoomSession::new(
            report("c1", ReportKind::Crime),
            Arc::clone(&channel),
            MemoryCache::new(),
            SessionOptions::default(),
        );
        session.open().expect("open");
        assert_eq!(channel.subscriber_count(), 2);

        channel.deliver(&update("c1", 1.5, 2.5));
        channel.deliver(&ChannelEvent::NewMessage(incoming("c1", "Citizen", "still works")));
        assert_eq!(session.path().len(), 1);
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn dropping_a_session_detaches_it() {
        let channel = channel();
        {
            let _session = open("r1", &channel, MemoryCache::new());
            assert_eq!(channel.subscriber_count(), 3);
        }
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn optimistic_sends_without_echo_stay_bounded() {
        let (transport, mut server) = MemoryTransport::pair();
        let channel = RealtimeChannel::new(
            ChannelConfig {
                format: WireFormat::Json,
                ..ChannelConfig::default()
            },
            transport,
        );
        let mut state = channel.watch_state();
        channel.connect();
        let _peer = server.accept().await.expect("accepted");
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .expect("connected");

        let mut session = RoomSession::new(
            report("r1", ReportKind::Personal),
            Arc::clone(&channel),
            MemoryCache::new(),
            SessionOptions {
                echo: EchoPolicy::Optimistic,
                ..SessionOptions::default()
            },
        );
        session.open().expect("open");
        let sent: Vec<ChatMessage> = (0..UNECHOED_LIMIT + 8)
            .map(|n| session.send(&format!("update {n}")).expect("send").expect("message"))
            .collect();
        assert_eq!(session.shared.state.lock().unechoed.len(), UNECHOED_LIMIT);
        assert_eq!(session.messages().len(), sent.len());

        // the latest message is still recognised when its echo arrives
        channel.deliver(&ChannelEvent::NewMessage(sent.last().cloned().expect("sent")));
        assert_eq!(session.messages().len(), sent.len());
        assert_eq!(session.shared.state.lock().unechoed.len(), UNECHOED_LIMIT - 1);
    }

    #[test]
    fn echo_policy_parses() {
        assert_eq!("echo".parse::<EchoPolicy>(), Ok(EchoPolicy::AwaitEcho));
        assert_eq!("Optimistic".parse::<EchoPolicy>(), Ok(EchoPolicy::Optimistic));
        assert!("sometimes".parse::<EchoPolicy>().is_err());
    }
}
