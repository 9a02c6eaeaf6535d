use std::path::PathBuf;
use std::sync::Arc;

use shared::{ChatMessage, Coordinates};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::channel::{self, ConnectionState, RealtimeChannel};
use crate::chat::{ChatCache, FileCache};
use crate::config::{self, Config};
use crate::lifecycle::{MapSurface, SessionLifecycle};
use crate::telemetry;
use crate::track::TrackViewModel;

/// Renders the tracking view as log lines.
#[derive(Debug, Default)]
pub struct LogSurface {
    mounted: bool,
}

impl MapSurface for LogSurface {
    fn mount(&mut self, view: &TrackViewModel) -> Result<(), String> {
        self.mounted = true;
        info!(
            start = %view.start_marker(),
            center = %view.initial_center(),
            zoom = view.zoom(),
            "map mounted"
        );
        Ok(())
    }

    fn move_marker(&mut self, position: Coordinates) {
        info!(%position, "live marker");
    }

    fn draw_path(&mut self, view: &TrackViewModel) {
        info!(
            points = view.path().len(),
            distance_m = view.distance_travelled_m().round(),
            "route"
        );
    }

    fn recenter(&mut self, center: Coordinates, zoom: u8) {
        debug!(%center, zoom, "recenter");
    }

    fn show_message(&mut self, message: &ChatMessage) {
        info!(
            sender = %message.sender,
            at = %message.timestamp.format("%H:%M:%S"),
            "{}",
            message.text
        );
    }

    fn release(&mut self) {
        if self.mounted {
            self.mounted = false;
            debug!("map released");
        }
    }
}

fn report_state(state: ConnectionState) {
    match state {
        ConnectionState::Connected => info!("realtime channel connected"),
        ConnectionState::Reconnecting { attempt } => warn!(attempt, "realtime channel reconnecting"),
        ConnectionState::Disconnected => warn!("realtime channel disconnected; live tracking is degraded"),
        ConnectionState::Idle | ConnectionState::Connecting => debug!(?state, "realtime channel"),
    }
}

/// Tracks one report from the terminal: stdin lines are sent as chat
/// messages; Ctrl-C or end of input closes the session.
pub async fn run() -> anyhow::Result<()> {
    telemetry::init(&config::log_filter(&|key: &str| std::env::var(key).ok()));
    let config = Config::from_env()?;

    let report_path = std::env::args().nth(1).map(PathBuf::from);
    let report = config::load_report(report_path.as_deref(), |key| std::env::var(key).ok())?;

    let channel = channel::install(RealtimeChannel::websocket(config.channel.clone()));
    channel.connect();

    let cache: Arc<dyn ChatCache> = Arc::new(FileCache::new(config.chat_cache_dir.clone()));
    let lifecycle = SessionLifecycle::new(Arc::clone(&channel), cache, config.session.clone());
    let mut mounted = lifecycle.mount(report, LogSurface::default())?;
    info!(report_id = %mounted.session().report_id(), "tracking; type a line to chat");

    let mut state = channel.watch_state();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match mounted.send(&line) {
                    Ok(Some(message)) => debug!(text = %message.text, "message sent"),
                    Ok(None) => {}
                    Err(err) => warn!(%err, "message not sent"),
                },
                None => break,
            },
            event = mounted.next_event() => {
                if event.is_none() {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                report_state(current);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    mounted.unmount();
    channel.shutdown();
    Ok(())
}
