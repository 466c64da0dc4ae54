//! Inbound media path: datagram → decrypt → reorder/conceal → decode →
//! event.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::audio::codec::{CodecFactory, FrameDecoder, PacketCodec};
use crate::audio::format::AudioFormat;
use crate::constants::{MIN_VOICE_PACKET_LEN, RECV_BUFFER_LEN};
use crate::crypto::SecureChannelCodec;
use crate::error::{Result, VoiceError};
use crate::gateway::events::{EventBus, ReceivedAudio, VoiceEvent};
use crate::gateway::udp::{parse_keepalive, KeepaliveTracker, MediaSocket};
use crate::rtp;
use crate::types::UserId;

/// Per-remote-speaker decode state. Each source owns its decoder; decoder
/// state is predictive and must not be shared.
pub struct RemoteSource {
    pub ssrc: u32,
    pub user: Option<UserId>,
    decoder: Box<dyn FrameDecoder>,
    last_true_sequence: u64,
    seen_any: bool,
}

/// Registry of remote sources, keyed by their 32-bit source id.
pub struct Sources {
    map: DashMap<u32, Arc<parking_lot::Mutex<RemoteSource>>>,
    codecs: Arc<dyn CodecFactory>,
    format: AudioFormat,
    events: Arc<EventBus>,
}

impl Sources {
    pub fn new(codecs: Arc<dyn CodecFactory>, format: AudioFormat, events: Arc<EventBus>) -> Self {
        Self {
            map: DashMap::new(),
            codecs,
            format,
            events,
        }
    }

    /// Looks up a source, creating it (with a fresh decoder) on first
    /// sight. Creation goes through the map's entry lock, so concurrent
    /// lookups (receiver task vs. control handlers) land on one shared
    /// source. A late identity backfills a source created from bare
    /// media packets.
    pub fn get_or_create(
        &self,
        ssrc: u32,
        user: Option<UserId>,
    ) -> Result<Arc<parking_lot::Mutex<RemoteSource>>> {
        let source = match self.map.entry(ssrc) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(parking_lot::Mutex::new(RemoteSource {
                    ssrc,
                    user,
                    decoder: self.codecs.new_decoder(&self.format)?,
                    last_true_sequence: 0,
                    seen_any: false,
                })))
            }
        };
        if let Some(user) = user {
            source.lock().user.get_or_insert(user);
        }
        Ok(source.clone())
    }

    pub fn note_speaking(&self, ssrc: u32, user: Option<UserId>, speaking: bool) -> Result<()> {
        let source = self.get_or_create(ssrc, user)?;
        let user = source.lock().user;
        self.events.emit(VoiceEvent::UserSpeaking { ssrc, user, speaking });
        Ok(())
    }

    pub fn client_connected(&self, ssrc: u32, user: UserId) -> Result<()> {
        self.get_or_create(ssrc, Some(user))?;
        self.events.emit(VoiceEvent::UserJoined { ssrc, user });
        Ok(())
    }

    pub fn client_disconnected(&self, user: UserId) {
        let ssrc = self
            .map
            .iter()
            .find(|entry| entry.value().lock().user == Some(user))
            .map(|entry| *entry.key());
        if let Some(ssrc) = ssrc {
            self.map.remove(&ssrc);
        }
        self.events.emit(VoiceEvent::UserLeft { user });
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

/// Datagram dispatch: keepalive echoes, then voice packets.
pub struct ReceivePipeline {
    cipher: Arc<SecureChannelCodec>,
    sources: Arc<Sources>,
    keepalive: Arc<KeepaliveTracker>,
}

impl ReceivePipeline {
    pub fn new(
        cipher: Arc<SecureChannelCodec>,
        sources: Arc<Sources>,
        keepalive: Arc<KeepaliveTracker>,
    ) -> Self {
        Self {
            cipher,
            sources,
            keepalive,
        }
    }

    pub fn handle_datagram(&self, datagram: &[u8]) -> Result<()> {
        if let Some(id) = parse_keepalive(datagram) {
            if let Some(rtt) = self.keepalive.acknowledge(id) {
                trace!("keepalive {id} echoed in {rtt:?}");
            }
            return Ok(());
        }
        if datagram.len() < MIN_VOICE_PACKET_LEN {
            return Err(VoiceError::MalformedPacket("datagram below minimum size"));
        }

        let (header, has_extension) = rtp::decode_header(datagram)?;
        let source = self.sources.get_or_create(header.ssrc, None)?;
        let mut source = source.lock();

        let true_sequence = if source.seen_any {
            rtp::extend_sequence(source.last_true_sequence, header.sequence)
        } else {
            header.sequence as u64
        };
        if source.seen_any && true_sequence <= source.last_true_sequence {
            trace!(
                ssrc = header.ssrc,
                sequence = header.sequence,
                "dropping reordered or duplicate packet"
            );
            return Ok(());
        }
        let gap = if source.seen_any {
            true_sequence - source.last_true_sequence - 1
        } else {
            0
        };

        let result = self.process_voice(&mut source, datagram, has_extension, gap);
        // Sequence state advances even when decode fails so a poison
        // packet cannot repeat its gap forever.
        source.last_true_sequence = true_sequence;
        source.seen_any = true;
        result
    }

    fn process_voice(
        &self,
        source: &mut RemoteSource,
        datagram: &[u8],
        has_extension: bool,
        gap: u64,
    ) -> Result<()> {
        let (nonce, ciphertext) = self.cipher.locate_ciphertext(datagram)?;
        let body = self.cipher.decrypt(ciphertext, &nonce)?;

        let mut payload = body.as_slice();
        if has_extension {
            let offset = rtp::extension_payload_offset(payload)?;
            payload = &payload[offset..];
        }
        // In-band marker prefix: two bytes ahead of the compressed frame.
        if payload.len() >= 2 && payload[0] == 0x90 {
            payload = &payload[2..];
        }
        if payload.is_empty() {
            return Err(VoiceError::MalformedPacket("empty voice payload"));
        }

        let format = self.sources.format;
        for _ in 0..gap {
            match PacketCodec::conceal_loss(&format, source.decoder.as_mut()) {
                Ok(pcm) => self.emit_audio(source, pcm, Bytes::new(), true),
                Err(e) => {
                    debug!(ssrc = source.ssrc, "loss concealment unavailable: {e}");
                    break;
                }
            }
        }

        let pcm = PacketCodec::decode_frame(&format, source.decoder.as_mut(), payload, false)?;
        self.emit_audio(source, pcm, Bytes::copy_from_slice(payload), false);
        Ok(())
    }

    fn emit_audio(&self, source: &RemoteSource, pcm: Vec<u8>, opus: Bytes, concealed: bool) {
        let format = self.sources.format;
        let duration_ms = format.bytes_to_duration_ms(pcm.len());
        self.sources.events.emit(VoiceEvent::AudioReceived(ReceivedAudio {
            ssrc: source.ssrc,
            user: source.user,
            pcm: Bytes::from(pcm),
            opus,
            format,
            duration_ms,
            concealed,
        }));
    }
}

/// Receive loop: per-datagram failures are reported as events, never
/// terminate the loop.
pub(crate) async fn run_receiver(
    socket: Arc<dyn MediaSocket>,
    pipeline: ReceivePipeline,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    warn!("media socket receive error: {e}");
                    pipeline
                        .sources
                        .events
                        .emit(VoiceEvent::SocketError { detail: e.to_string() });
                    continue;
                }
            },
        };
        if let Err(e) = pipeline.handle_datagram(&buf[..n]) {
            debug!("inbound datagram rejected: {e}");
        }
    }
}
