pub mod channel;
pub mod chat;
pub mod config;
pub mod console;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod telemetry;
pub mod track;

pub use channel::{ChannelConfig, ConnectionState, RealtimeChannel};
pub use chat::{ChatCache, ChatLog, FileCache, MemoryCache};
pub use lifecycle::{MapSurface, MountedSession, SessionLifecycle};
pub use session::{EchoPolicy, RoomSession, SessionEvent, SessionOptions, SessionPhase};
pub use track::{LocationSample, TrackViewModel};
