use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use shared::{ReportRecord, ReportRef, WireFormat};

use crate::channel::ChannelConfig;
use crate::error::ConfigError;
use crate::session::{EchoPolicy, SessionOptions};

pub const SERVER_URL: &str = "TRACKER_SERVER_URL";
pub const WIRE_FORMAT: &str = "TRACKER_WIRE_FORMAT";
pub const RECONNECT_ATTEMPTS: &str = "TRACKER_RECONNECT_ATTEMPTS";
pub const RECONNECT_DELAY_MS: &str = "TRACKER_RECONNECT_DELAY_MS";
pub const RECONNECT_JITTER: &str = "TRACKER_RECONNECT_JITTER";
pub const CONNECT_TIMEOUT_MS: &str = "TRACKER_CONNECT_TIMEOUT_MS";
pub const CHAT_CACHE_DIR: &str = "TRACKER_CHAT_CACHE_DIR";
pub const ACTOR: &str = "TRACKER_ACTOR";
pub const ECHO_POLICY: &str = "TRACKER_ECHO_POLICY";
pub const LOG: &str = "TRACKER_LOG";
pub const REPORT: &str = "TRACKER_REPORT";

#[derive(Debug, Clone)]
pub struct Config {
    pub channel: ChannelConfig,
    pub session: SessionOptions,
    pub chat_cache_dir: PathBuf,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ChannelConfig::default();

        let url = lookup(SERVER_URL).unwrap_or(defaults.url);
        let format = match lookup(WIRE_FORMAT) {
            Some(raw) => WireFormat::from_str(&raw).map_err(|_| ConfigError::Invalid {
                key: WIRE_FORMAT,
                value: raw,
            })?,
            None => defaults.format,
        };
        let reconnect_attempts = parsed(&lookup, RECONNECT_ATTEMPTS)?.unwrap_or(defaults.reconnect_attempts);
        let reconnect_delay = parsed::<u64>(&lookup, RECONNECT_DELAY_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.reconnect_delay);
        let reconnect_jitter = match parsed::<f64>(&lookup, RECONNECT_JITTER)? {
            Some(jitter) if !(0.0..=1.0).contains(&jitter) => {
                return Err(ConfigError::Invalid {
                    key: RECONNECT_JITTER,
                    value: jitter.to_string(),
                })
            }
            Some(jitter) => jitter,
            None => defaults.reconnect_jitter,
        };
        let connect_timeout = parsed::<u64>(&lookup, CONNECT_TIMEOUT_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        let session_defaults = SessionOptions::default();
        let actor = lookup(ACTOR)
            .map(|actor| actor.trim().to_string())
            .filter(|actor| !actor.is_empty())
            .unwrap_or(session_defaults.actor);
        let echo = match lookup(ECHO_POLICY) {
            Some(raw) => EchoPolicy::from_str(&raw).map_err(|_| ConfigError::Invalid {
                key: ECHO_POLICY,
                value: raw,
            })?,
            None => session_defaults.echo,
        };

        Ok(Self {
            channel: ChannelConfig {
                url,
                format,
                reconnect_attempts,
                reconnect_delay,
                reconnect_jitter,
                connect_timeout,
            },
            session: SessionOptions { actor, echo },
            chat_cache_dir: lookup(CHAT_CACHE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".tracker/chat")),
            log_filter: log_filter(&lookup),
        })
    }
}

/// The `TRACKER_LOG` filter alone. Readable before the rest of the
/// configuration so that configuration errors can be logged.
pub fn log_filter(lookup: &impl Fn(&str) -> Option<String>) -> String {
    lookup(LOG).unwrap_or_else(|| "info".to_string())
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(None),
    }
}

/// Reads the report to track from a JSON file when `path` is given, else
/// from the `TRACKER_REPORT` variable. Both hold the REST record shape.
pub fn load_report(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ReportRef, ConfigError> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?,
        None => lookup(REPORT).ok_or(ConfigError::Missing(REPORT))?,
    };
    let record: ReportRecord = serde_json::from_str(&raw)?;
    Ok(ReportRef::try_from(record)?)
}
