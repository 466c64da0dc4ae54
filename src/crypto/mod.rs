//! `SecureChannelCodec`, the AEAD envelope around voice payloads.
//!
//! One cipher, three nonce strategies. The strategy is fixed per
//! connection at handshake completion and decides both how nonces are
//! produced and what (if anything) rides after the ciphertext on the wire.

use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;
use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

use crate::constants::RTP_HEADER_LEN;
use crate::error::{Result, VoiceError};

/// AEAD nonce size.
pub const NONCE_LEN: usize = 24;

/// Fixed authentication-tag overhead appended by `encrypt`.
pub const MAC_LEN: usize = 16;

/// Trailer bytes for the counter strategy (just the 4-byte counter).
pub const LITE_TRAILER_LEN: usize = 4;

/// Secret key size delivered in the session description.
pub const KEY_LEN: usize = 32;

/// Nonce strategy negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Big-endian monotonic 32-bit counter, appended after the ciphertext.
    Lite,
    /// Cryptographically random nonce, appended in full after the
    /// ciphertext.
    Suffix,
    /// Nonce derived from the packet header (zero-padded), nothing on the
    /// wire.
    Normal,
}

impl EncryptionMode {
    /// Local preference order when the server offers several modes.
    pub const PREFERENCE: [EncryptionMode; 3] = [Self::Lite, Self::Suffix, Self::Normal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lite => "xsalsa20_poly1305_lite",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Normal => "xsalsa20_poly1305",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "xsalsa20_poly1305_lite" => Some(Self::Lite),
            "xsalsa20_poly1305_suffix" => Some(Self::Suffix),
            "xsalsa20_poly1305" => Some(Self::Normal),
            _ => None,
        }
    }

    /// Intersects the server-advertised mode names with local support,
    /// in preference order.
    pub fn negotiate<S: AsRef<str>>(advertised: &[S]) -> Result<Self> {
        for mode in Self::PREFERENCE {
            if advertised.iter().any(|m| m.as_ref() == mode.as_str()) {
                return Ok(mode);
            }
        }
        Err(VoiceError::UnsupportedEncryption)
    }

    /// Bytes this strategy appends after the ciphertext.
    pub fn trailer_len(&self) -> usize {
        match self {
            Self::Lite => LITE_TRAILER_LEN,
            Self::Suffix => NONCE_LEN,
            Self::Normal => 0,
        }
    }
}

impl std::fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct SecureChannelCodec {
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
    lite_counter: AtomicU32,
}

impl SecureChannelCodec {
    pub fn new(secret_key: &[u8; KEY_LEN], mode: EncryptionMode) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(secret_key)),
            mode,
            lite_counter: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// On-wire size of an encrypted payload: ciphertext, tag, and the
    /// strategy's trailer.
    pub fn encrypted_len(&self, plaintext_len: usize) -> usize {
        plaintext_len + MAC_LEN + self.mode.trailer_len()
    }

    /// Produces the nonce for the next outbound packet. `header` is the
    /// already-encoded sequence header of that packet.
    pub fn generate_nonce(&self, header: &[u8]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        match self.mode {
            EncryptionMode::Lite => {
                let counter = self.lite_counter.fetch_add(1, Ordering::Relaxed);
                nonce[..LITE_TRAILER_LEN].copy_from_slice(&counter.to_be_bytes());
            }
            EncryptionMode::Suffix => {
                rand::thread_rng().fill_bytes(&mut nonce);
            }
            EncryptionMode::Normal => {
                let n = header.len().min(RTP_HEADER_LEN);
                nonce[..n].copy_from_slice(&header[..n]);
            }
        }
        nonce
    }

    /// AEAD seal. The tag is appended to the returned ciphertext.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| VoiceError::Codec("encryption failure".into()))
    }

    /// AEAD open. Tag mismatch surfaces as `AuthenticationFailed`.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VoiceError::AuthenticationFailed)
    }

    /// Appends the strategy's wire trailer to a finished packet.
    pub fn append_nonce_trailer(&self, nonce: &[u8; NONCE_LEN], packet: &mut Vec<u8>) {
        match self.mode {
            EncryptionMode::Lite => packet.extend_from_slice(&nonce[..LITE_TRAILER_LEN]),
            EncryptionMode::Suffix => packet.extend_from_slice(nonce),
            EncryptionMode::Normal => {}
        }
    }

    /// Receive-side inverse: recovers the nonce and the ciphertext slice
    /// of a full datagram (sequence header included).
    pub fn locate_ciphertext<'a>(&self, packet: &'a [u8]) -> Result<([u8; NONCE_LEN], &'a [u8])> {
        let mut nonce = [0u8; NONCE_LEN];
        let trailer = self.mode.trailer_len();
        if packet.len() < RTP_HEADER_LEN + MAC_LEN + trailer {
            return Err(VoiceError::MalformedPacket("datagram shorter than envelope"));
        }
        let body_end = packet.len() - trailer;
        match self.mode {
            EncryptionMode::Lite => {
                nonce[..LITE_TRAILER_LEN].copy_from_slice(&packet[body_end..]);
            }
            EncryptionMode::Suffix => {
                nonce.copy_from_slice(&packet[body_end..]);
            }
            EncryptionMode::Normal => {
                nonce[..RTP_HEADER_LEN].copy_from_slice(&packet[..RTP_HEADER_LEN]);
            }
        }
        Ok((nonce, &packet[RTP_HEADER_LEN..body_end]))
    }
}
