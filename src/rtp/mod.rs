//! Fixed sequence-header codec for voice datagrams.
//!
//! 12 bytes, network byte order: version/flags, packet type, 16-bit
//! sequence, 32-bit timestamp, 32-bit source id. All parsing is
//! bounds-checked slicing over owned buffers, no in-place struct
//! mutation.

use byteorder::{BigEndian, ByteOrder};

use crate::constants::RTP_HEADER_LEN;
use crate::error::{Result, VoiceError};

/// Version/flags byte without the extension bit (RTP version 2).
pub const VERSION_BYTE: u8 = 0x80;

/// Packet-type byte carried on every voice packet.
pub const PAYLOAD_TYPE: u8 = 0x78;

/// Extension bit in the version/flags byte.
pub const EXTENSION_FLAG: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Encodes the fixed header into the first 12 bytes of `buf`.
pub fn encode_header(header: &RtpHeader, buf: &mut [u8]) {
    buf[0] = VERSION_BYTE;
    buf[1] = PAYLOAD_TYPE;
    BigEndian::write_u16(&mut buf[2..4], header.sequence);
    BigEndian::write_u32(&mut buf[4..8], header.timestamp);
    BigEndian::write_u32(&mut buf[8..12], header.ssrc);
}

/// Whether `buf` starts with a plausible sequence header.
pub fn is_voice_packet(buf: &[u8]) -> bool {
    buf.len() >= RTP_HEADER_LEN
        && (buf[0] == VERSION_BYTE || buf[0] == VERSION_BYTE | EXTENSION_FLAG)
        && buf[1] == PAYLOAD_TYPE
}

/// Decodes the fixed header, returning the fields and whether the
/// extension bit is set.
pub fn decode_header(buf: &[u8]) -> Result<(RtpHeader, bool)> {
    if buf.len() < RTP_HEADER_LEN {
        return Err(VoiceError::MalformedPacket("datagram shorter than header"));
    }
    if !is_voice_packet(buf) {
        return Err(VoiceError::MalformedPacket("not a sequence header"));
    }
    let header = RtpHeader {
        sequence: BigEndian::read_u16(&buf[2..4]),
        timestamp: BigEndian::read_u32(&buf[4..8]),
        ssrc: BigEndian::read_u32(&buf[8..12]),
    };
    Ok((header, buf[0] & EXTENSION_FLAG != 0))
}

/// Locates the real payload inside a decrypted body whose extension bit
/// was set.
///
/// One-byte-header extensions only (RFC 5285): a 4-byte preamble whose
/// last two bytes give the extension length in 32-bit words, that many
/// words of extension data, then zero padding consumed up to the first
/// non-zero byte. Two-byte extension headers are a known, unsupported
/// limitation of this parser.
pub fn extension_payload_offset(body: &[u8]) -> Result<usize> {
    if body.len() < 4 {
        return Err(VoiceError::MalformedPacket("truncated extension preamble"));
    }
    let words = BigEndian::read_u16(&body[2..4]) as usize;
    let mut offset = 4 + words * 4;
    if offset > body.len() {
        return Err(VoiceError::MalformedPacket("extension exceeds packet"));
    }
    while offset < body.len() && body[offset] == 0 {
        offset += 1;
    }
    Ok(offset)
}

/// Extends a 16-bit wire sequence to the unwrapped "true" sequence by
/// choosing the candidate nearest the last known true sequence.
pub fn extend_sequence(last_true: u64, wire: u16) -> u64 {
    let base = last_true & !0xFFFFu64;
    let same = base | wire as u64;
    let mut best = same;
    let mut best_distance = same.abs_diff(last_true);

    let up = same + 0x1_0000;
    if up.abs_diff(last_true) < best_distance {
        best_distance = up.abs_diff(last_true);
        best = up;
    }
    if let Some(down) = same.checked_sub(0x1_0000) {
        if down.abs_diff(last_true) < best_distance {
            best = down;
        }
    }
    best
}
