//! Central constants for the voice transport.
//!
//! Magic numbers used across `src/**` live here so they can be tuned in
//! one place and stay consistent across modules.

use std::time::Duration;

// ── Control channel ──────────────────────────────────────────────────────────

/// Voice gateway version in the WebSocket URL. The opcode set this crate
/// implements (0–9, 12, 13) belongs to this version.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Maximum reconnect attempts before giving up on a voice session.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay (ms) for the exponential backoff on reconnect.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Close codes after which a session is no longer resumable and the next
/// attempt must re-Identify from scratch. Kept as a data table so protocol
/// updates are a data change.
pub const NON_RESUMABLE_CLOSE_CODES: &[u16] = &[4_006, 4_009];

// ── Media datagrams ───────────────────────────────────────────────────────────

/// Fixed sequence-header length on every voice datagram.
pub const RTP_HEADER_LEN: usize = 12;

/// Smallest datagram that can carry a voice packet: header plus one byte.
pub const MIN_VOICE_PACKET_LEN: usize = RTP_HEADER_LEN + 1;

/// IP discovery probe/reply length.
pub const DISCOVERY_PACKET_LEN: usize = 70;

/// Bound on the single discovery-reply wait before the handshake fails.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Keepalive echo datagram length (little-endian u64 counter).
pub const KEEPALIVE_PACKET_LEN: usize = 8;

/// Interval between keepalive datagrams.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(5_000);

/// Receive buffer size for one datagram (voice packets comfortably fit).
pub const RECV_BUFFER_LEN: usize = 2_048;

// ── Pacing ────────────────────────────────────────────────────────────────────

/// Pacer resolution unit. Target inter-packet spacing is one unit per 5 ms
/// of frame duration; an idle tick advances by a quarter unit.
pub const PACER_TICK: Duration = Duration::from_millis(5);

/// Silence frames appended after a non-silent send drains the queue, so
/// listeners get a clean ramp-down instead of an abrupt stop.
pub const TRAILING_SILENCE_FRAMES: usize = 3;

// ── Audio ─────────────────────────────────────────────────────────────────────

/// Default frame duration handed to the sink and pacer.
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Default bound of the outbound frame queue (producers suspend when full).
pub const DEFAULT_QUEUE_LEN: usize = 64;

/// Upper bound for one encoded frame (fits any rate/duration this crate
/// allows).
pub const MAX_ENCODED_FRAME_LEN: usize = 4_000;

/// Longest single-packet audio duration the buffer-size math allows.
pub const MAX_PACKET_DURATION_MS: u32 = 120;
