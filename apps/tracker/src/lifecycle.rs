use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use shared::{ChatMessage, Coordinates, ReportId, ReportRef};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::channel::RealtimeChannel;
use crate::chat::ChatCache;
use crate::error::{LifecycleError, SessionError};
use crate::session::{RoomSession, SessionEvent, SessionOptions};
use crate::track::TrackViewModel;

/// Whatever paints the map. `release` must tolerate a surface whose
/// `mount` failed halfway.
pub trait MapSurface: Send {
    fn mount(&mut self, view: &TrackViewModel) -> Result<(), String>;
    fn move_marker(&mut self, position: Coordinates);
    fn draw_path(&mut self, view: &TrackViewModel);
    fn recenter(&mut self, center: Coordinates, zoom: u8);
    fn show_message(&mut self, message: &ChatMessage);
    fn release(&mut self);
}

/// Ties each [`RoomSession`] to the lifetime of the view hosting it.
pub struct SessionLifecycle {
    channel: Arc<RealtimeChannel>,
    cache: Arc<dyn ChatCache>,
    options: SessionOptions,
    active: Arc<Mutex<HashSet<ReportId>>>,
}

impl SessionLifecycle {
    pub fn new(channel: Arc<RealtimeChannel>, cache: Arc<dyn ChatCache>, options: SessionOptions) -> Self {
        Self {
            channel,
            cache,
            options,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_tracking(&self, report_id: &ReportId) -> bool {
        self.active.lock().contains(report_id)
    }

    /// Mounts `surface`, then opens a session for `report`. On any failure
    /// everything acquired so far is torn down before returning.
    pub fn mount<S: MapSurface>(
        &self,
        report: ReportRef,
        surface: S,
    ) -> Result<MountedSession<S>, LifecycleError> {
        let report_id = report.report_id.clone();
        if !self.active.lock().insert(report_id.clone()) {
            return Err(LifecycleError::AlreadyTracking(report_id));
        }

        let session = RoomSession::new(
            report,
            Arc::clone(&self.channel),
            Arc::clone(&self.cache),
            self.options.clone(),
        );
        let events = session.subscribe();
        let mut mounted = MountedSession {
            session,
            surface,
            events,
            active: Arc::clone(&self.active),
            report_id,
            torn_down: false,
        };

        let view = mounted.session.view();
        mounted.surface.mount(&view).map_err(LifecycleError::Surface)?;
        for message in mounted.session.messages() {
            mounted.surface.show_message(&message);
        }
        mounted.session.open()?;
        Ok(mounted)
    }
}

/// A mounted tracking view. Dropping it unmounts: the session is closed
/// first, then the surface is released.
pub struct MountedSession<S: MapSurface> {
    session: RoomSession,
    surface: S,
    events: broadcast::Receiver<SessionEvent>,
    active: Arc<Mutex<HashSet<ReportId>>>,
    report_id: ReportId,
    torn_down: bool,
}

impl<S: MapSurface> MountedSession<S> {
    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn send(&self, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        self.session.send(text)
    }

    /// Applies every pending session event to the surface without waiting.
    pub fn drain(&mut self) -> usize {
        let mut applied = 0;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    applied += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => self.resync(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return applied,
            }
        }
    }

    /// Waits for the next session event and applies it. `None` once
    /// unmounted.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.torn_down {
            return None;
        }
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    self.apply(&event);
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => self.resync(skipped),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unmount(mut self) {
        self.teardown();
    }

    fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Moved { sample, recenter } => {
                let view = self.session.view();
                self.surface.move_marker(sample.coordinates);
                self.surface.draw_path(&view);
                if *recenter {
                    self.surface.recenter(sample.coordinates, view.zoom());
                }
            }
            SessionEvent::Message(message) => self.surface.show_message(message),
            SessionEvent::Rejoined => debug!(report_id = %self.report_id, "room rejoined"),
        }
    }

    /// Missed events only matter for the map; repaint it from the session.
    fn resync(&mut self, skipped: u64) {
        warn!(report_id = %self.report_id, skipped, "surface lagged behind session");
        let view = self.session.view();
        self.surface.move_marker(view.current_position());
        self.surface.draw_path(&view);
        self.surface.recenter(view.current_position(), view.zoom());
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.session.close();
        self.surface.release();
        self.active.lock().remove(&self.report_id);
    }
}

impl<S: MapSurface> Drop for MountedSession<S> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelEvent, MemoryTransport};
    use crate::chat::MemoryCache;
    use crate::session::SessionPhase;
    use shared::{LocationUpdate, ReportKind};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Mount,
        Marker(Coordinates),
        Path(usize),
        Recenter(Coordinates),
        Message(String),
        Release,
    }

    #[derive(Clone, Default)]
    struct RecordingSurface {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_mount: bool,
    }

    impl MapSurface for RecordingSurface {
        fn mount(&mut self, _view: &TrackViewModel) -> Result<(), String> {
            self.calls.lock().push(Call::Mount);
            if self.fail_mount {
                return Err("no map container".to_string());
            }
            Ok(())
        }

        fn move_marker(&mut self, position: Coordinates) {
            self.calls.lock().push(Call::Marker(position));
        }

        fn draw_path(&mut self, view: &TrackViewModel) {
            self.calls.lock().push(Call::Path(view.path().len()));
        }

        fn recenter(&mut self, center: Coordinates, _zoom: u8) {
            self.calls.lock().push(Call::Recenter(center));
        }

        fn show_message(&mut self, message: &ChatMessage) {
            self.calls.lock().push(Call::Message(message.text.clone()));
        }

        fn release(&mut self) {
            self.calls.lock().push(Call::Release);
        }
    }

    fn lifecycle() -> (SessionLifecycle, Arc<RealtimeChannel>) {
        let (transport, _server) = MemoryTransport::pair();
        let channel = RealtimeChannel::new(ChannelConfig::default(), transport);
        let lifecycle = SessionLifecycle::new(Arc::clone(&channel), MemoryCache::new(), SessionOptions::default());
        (lifecycle, channel)
    }

    fn report(id: &str) -> ReportRef {
        ReportRef::new(
            ReportId::new(id).expect("id"),
            ReportKind::Personal,
            Coordinates::new(1.0, 2.0).expect("coords"),
        )
    }

    fn coords(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates::new(latitude, longitude).expect("coords")
    }

    #[test]
    fn updates_pan_and_redraw_the_surface() {
        let (lifecycle, channel) = lifecycle();
        let surface = RecordingSurface::default();
        let calls = Arc::clone(&surface.calls);
        let mut mounted = lifecycle.mount(report("r1"), surface).expect("mounted");

        channel.deliver(&ChannelEvent::UpdateLocation(LocationUpdate {
            report_id: ReportId::new("r1").expect("id"),
            latitude: 1.5,
            longitude: 2.5,
        }));
        assert_eq!(mounted.drain(), 1);
        assert_eq!(
            *calls.lock(),
            vec![
                Call::Mount,
                Call::Marker(coords(1.5, 2.5)),
                Call::Path(2),
                Call::Recenter(coords(1.5, 2.5)),
            ]
        );

        mounted.unmount();
        assert_eq!(calls.lock().last(), Some(&Call::Release));
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn one_mount_per_report_until_unmounted() {
        let (lifecycle, _channel) = lifecycle();
        let first = lifecycle.mount(report("r1"), RecordingSurface::default()).expect("first");
        assert!(lifecycle.is_tracking(&ReportId::new("r1").expect("id")));
        assert!(matches!(
            lifecycle.mount(report("r1"), RecordingSurface::default()),
            Err(LifecycleError::AlreadyTracking(_))
        ));
        let _other = lifecycle.mount(report("r2"), RecordingSurface::default()).expect("other report");

        drop(first);
        assert!(!lifecycle.is_tracking(&ReportId::new("r1").expect("id")));
        lifecycle.mount(report("r1"), RecordingSurface::default()).expect("remount");
    }

    #[test]
    fn failed_mount_still_releases_and_leaks_nothing() {
        let (lifecycle, channel) = lifecycle();
        let surface = RecordingSurface {
            fail_mount: true,
            ..RecordingSurface::default()
        };
        let calls = Arc::clone(&surface.calls);

        let result = lifecycle.mount(report("r1"), surface);
        assert!(matches!(result, Err(LifecycleError::Surface(_))));
        assert_eq!(*calls.lock(), vec![Call::Mount, Call::Release]);
        assert_eq!(channel.subscriber_count(), 0);
        assert!(!lifecycle.is_tracking(&ReportId::new("r1").expect("id")));
    }

    #[test]
    fn abrupt_unmount_via_panic_closes_the_session() {
        let (lifecycle, channel) = lifecycle();
        let surface = RecordingSurface::default();
        let calls = Arc::clone(&surface.calls);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mounted = lifecycle.mount(report("r1"), surface).expect("mounted");
            assert_eq!(mounted.session().phase(), SessionPhase::Joined);
            panic!("view crashed");
        }));
        assert!(outcome.is_err());
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(calls.lock().last(), Some(&Call::Release));
    }

    #[test]
    fn cached_history_is_shown_on_mount() {
        let (transport, _server) = MemoryTransport::pair();
        let channel = RealtimeChannel::new(ChannelConfig::default(), transport);
        let cache = MemoryCache::new();
        let lifecycle = SessionLifecycle::new(Arc::clone(&channel), cache.clone(), SessionOptions::default());

        let mut mounted = lifecycle.mount(report("r1"), RecordingSurface::default()).expect("mounted");
        let message = ChatMessage::compose(ReportId::new("r1").expect("id"), "Citizen", "hello").expect("message");
        channel.deliver(&ChannelEvent::NewMessage(message));
        mounted.drain();
        mounted.unmount();

        let surface = RecordingSurface::default();
        let calls = Arc::clone(&surface.calls);
        let _mounted = lifecycle.mount(report("r1"), surface).expect("remounted");
        assert_eq!(*calls.lock(), vec![Call::Mount, Call::Message("hello".to_string())]);
    }
}
