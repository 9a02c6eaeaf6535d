use std::path::PathBuf;

use shared::{ReportId, WireError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket connect to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("transport refused the connection")]
    Refused,
    #[error("connect attempt timed out")]
    TimedOut,
    #[error("link closed before the server accepted the session")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session for {0} was already opened")]
    AlreadyOpened(ReportId),
    #[error("session for {0} is not open")]
    NotOpen(ReportId),
    #[error("session for {0} is closed")]
    Closed(ReportId),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("report {0} is already being tracked")]
    AlreadyTracking(ReportId),
    #[error("map surface failed to mount: {0}")]
    Surface(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed report record: {0}")]
    Report(#[from] WireError),
    #[error("report record is not valid json: {0}")]
    ReportJson(#[from] serde_json::Error),
}
