use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

pub mod wire;

pub use wire::{Decoded, Envelope, Frame, WireError, WireFormat};

pub const JOIN_ROOM: &str = "joinRoom";
pub const SEND_MESSAGE: &str = "sendMessage";
pub const UPDATE_LOCATION: &str = "updateLocation";
pub const NEW_MESSAGE: &str = "newMessage";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(String);

impl ReportId {
    pub fn new(raw: impl Into<String>) -> Result<Self, WireError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(WireError::MissingReportId);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A WGS84 position. Latitude always comes first; renderers that want
/// `[lng, lat]` ask for [`Coordinates::lng_lat`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, WireError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(WireError::InvalidCoordinates { latitude, longitude });
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(WireError::InvalidCoordinates { latitude, longitude });
        }
        Ok(Self { latitude, longitude })
    }

    /// Parses the REST `"lat,lng"` form.
    pub fn parse_pair(raw: &str) -> Result<Self, WireError> {
        let Some((lat, lng)) = raw.split_once(',') else {
            return Err(WireError::MalformedPair(raw.to_string()));
        };
        let lat = lat
            .trim()
            .parse::<f64>()
            .map_err(|_| WireError::MalformedPair(raw.to_string()))?;
        let lng = lng
            .trim()
            .parse::<f64>()
            .map_err(|_| WireError::MalformedPair(raw.to_string()))?;
        Self::new(lat, lng)
    }

    pub fn lng_lat(&self) -> [f64; 2] {
        [self.longitude, self.latitude]
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Personal,
    Crime,
}

impl ReportKind {
    /// Only personal reports carry a device that streams its position.
    pub fn streams_location(self) -> bool {
        matches!(self, ReportKind::Personal)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub report_id: ReportId,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationUpdate {
    pub fn coordinates(&self) -> Result<Coordinates, WireError> {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub report_id: ReportId,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Builds an outgoing message stamped with the local clock. Returns
    /// `None` when the text is blank.
    pub fn compose(report_id: ReportId, sender: &str, text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            report_id,
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp: Utc::now().trunc_subsecs(3),
        })
    }
}

/// Events the realtime server pushes to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    UpdateLocation(LocationUpdate),
    NewMessage(ChatMessage),
}

impl InboundEvent {
    pub fn report_id(&self) -> &ReportId {
        match self {
            InboundEvent::UpdateLocation(update) => &update.report_id,
            InboundEvent::NewMessage(message) => &message.report_id,
        }
    }

    /// Returns `Ok(None)` for event names this client does not handle.
    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, WireError> {
        match envelope.event.as_str() {
            UPDATE_LOCATION => {
                let update: LocationUpdate = decode_payload(&envelope)?;
                ReportId::new(update.report_id.as_str())?;
                update.coordinates()?;
                Ok(Some(InboundEvent::UpdateLocation(update)))
            }
            NEW_MESSAGE => {
                let message: ChatMessage = decode_payload(&envelope)?;
                ReportId::new(message.report_id.as_str())?;
                if message.text.trim().is_empty() {
                    return Err(WireError::EmptyText);
                }
                Ok(Some(InboundEvent::NewMessage(message)))
            }
            _ => Ok(None),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, WireError> {
        match self {
            InboundEvent::UpdateLocation(update) => Envelope::new(UPDATE_LOCATION, update),
            InboundEvent::NewMessage(message) => Envelope::new(NEW_MESSAGE, message),
        }
    }
}

/// Events clients publish to the realtime server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    JoinRoom(ReportId),
    SendMessage(ChatMessage),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom(_) => JOIN_ROOM,
            OutboundEvent::SendMessage(_) => SEND_MESSAGE,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, WireError> {
        match self {
            OutboundEvent::JoinRoom(report_id) => Envelope::new(JOIN_ROOM, report_id),
            OutboundEvent::SendMessage(message) => Envelope::new(SEND_MESSAGE, message),
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Option<Self>, WireError> {
        match envelope.event.as_str() {
            JOIN_ROOM => {
                let report_id: ReportId = decode_payload(&envelope)?;
                Ok(Some(OutboundEvent::JoinRoom(ReportId::new(report_id.as_str())?)))
            }
            SEND_MESSAGE => Ok(Some(OutboundEvent::SendMessage(decode_payload(&envelope)?))),
            _ => Ok(None),
        }
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(envelope: &Envelope) -> Result<T, WireError> {
    serde_json::from_value(envelope.data.clone()).map_err(|source| WireError::Payload {
        event: envelope.event.clone(),
        source,
    })
}

/// Report document as served by the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_location: Option<String>,
    #[serde(rename = "type")]
    pub kind: ReportKind,
}

/// The immutable facts a tracking session starts from.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRef {
    pub report_id: ReportId,
    pub kind: ReportKind,
    pub start_location: Coordinates,
    pub live_location: Option<Coordinates>,
}

impl ReportRef {
    pub fn new(report_id: ReportId, kind: ReportKind, start_location: Coordinates) -> Self {
        Self {
            report_id,
            kind,
            start_location,
            live_location: None,
        }
    }
}

impl TryFrom<ReportRecord> for ReportRef {
    type Error = WireError;

    fn try_from(record: ReportRecord) -> Result<Self, Self::Error> {
        let live_location = match record.live_location.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(Coordinates::parse_pair(raw)?),
            _ => None,
        };
        Ok(Self {
            report_id: ReportId::new(record.id)?,
            kind: record.kind,
            start_location: Coordinates::parse_pair(&record.location)?,
            live_location,
        })
    }
}
