//! Error taxonomy for the voice transport.
//!
//! Containment policy: anything raised inside a per-packet or per-frame
//! unit of work stays in that unit (logged, packet dropped); anything
//! raised during the one-time handshake propagates to the original
//! connect caller.

use crate::types::GuildId;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Precondition failure, always raised before any I/O.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// No overlap between locally supported and server-advertised
    /// encryption modes. Fatal to the handshake.
    #[error("no mutually supported encryption mode")]
    UnsupportedEncryption,

    /// AEAD tag mismatch on decrypt. Caught per-packet in the receive path.
    #[error("packet failed authentication")]
    AuthenticationFailed,

    /// Datagram too short or header fields out of shape. Dropped silently.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Opaque codec reported a failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// The control channel closed, optionally with a close code.
    #[error("control channel closed (code {code:?})")]
    ControlClosed { code: Option<u16> },

    /// Connection establishment failed before reaching Ready.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A live connection already exists for this guild.
    #[error("voice connection already exists for guild {0}")]
    AlreadyConnected(GuildId),

    /// A connect call is already in flight for this guild.
    #[error("voice connect already in progress for guild {0}")]
    ConnectInProgress(GuildId),

    /// Operation attempted on a disposed connection.
    #[error("connection disposed")]
    Disposed,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}
