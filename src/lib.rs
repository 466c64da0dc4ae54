//! voicelink: real-time voice transport for Discord-style voice servers.
//!
//! Implements the full voice connection lifecycle: the control-channel
//! handshake (identify/resume, heartbeats, encryption negotiation), UDP
//! IP discovery, sealed RTP media framing with paced sending, and an
//! optional decode pipeline for inbound audio with loss concealment.
//!
//! The crate deliberately stops at the transport boundary. Three traits
//! mark the seams to the embedding application:
//!
//! - [`registry::SignalChannel`]: voice-state intents on the main gateway
//! - [`audio::CodecFactory`]: the audio codec (an Opus implementation
//!   ships behind the `opus` feature)
//! - [`gateway::ControlConnector`] / [`gateway::MediaConnector`]: the
//!   network transports, replaceable in tests
//!
//! Typical entry point is [`registry::VoiceRegistry`]: feed it the voice
//! state/server updates from your gateway session and call
//! [`registry::VoiceRegistry::connect`].

pub mod audio;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod rtp;
pub mod types;

pub use audio::codec::CodecFactory;
pub use audio::format::{AudioFormat, QualityPreset};
pub use audio::sink::TransmitSink;
pub use error::{Result, VoiceError};
pub use gateway::{
    ConnectionConfig, ConnectionState, ReceivedAudio, VoiceConnection, VoiceEvent,
};
pub use registry::{ConnectOptions, SignalChannel, VoiceRegistry};
pub use types::{ChannelId, GuildId, SessionId, UserId};
