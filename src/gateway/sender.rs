//! Outbound media path: frame → encode → seal → paced send.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::buffer::{PooledBytes, SharedBytePool};
use crate::audio::codec::PacketCodec;
use crate::audio::sink::RawVoicePacket;
use crate::constants::{MAX_ENCODED_FRAME_LEN, PACER_TICK, RTP_HEADER_LEN, TRAILING_SILENCE_FRAMES};
use crate::crypto::SecureChannelCodec;
use crate::error::Result;
use crate::gateway::payloads::speaking_frame;
use crate::gateway::transport::ControlSender;
use crate::gateway::udp::MediaSocket;
use crate::rtp::{self, RtpHeader};

/// Pause switch shared between the connection handle and the send loop.
pub struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection outbound packet builder. Owns the sequence/timestamp
/// counters; exactly one send loop drives it at a time.
pub struct VoiceSender {
    codec: PacketCodec,
    cipher: Arc<SecureChannelCodec>,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    speaking: bool,
    control: ControlSender,
    pool: SharedBytePool,
    scratch: Vec<u8>,
}

impl VoiceSender {
    pub fn new(
        codec: PacketCodec,
        cipher: Arc<SecureChannelCodec>,
        ssrc: u32,
        control: ControlSender,
        pool: SharedBytePool,
    ) -> Self {
        Self {
            codec,
            cipher,
            ssrc,
            sequence: 0,
            timestamp: 0,
            speaking: false,
            control,
            pool,
            scratch: vec![0; MAX_ENCODED_FRAME_LEN],
        }
    }

    /// Builds one sealed datagram: header, encoded frame, tag, trailer.
    /// Counters advance only on success.
    pub fn prepare(&mut self, frame: &RawVoicePacket) -> Result<PooledBytes> {
        let mut packet = self.pool.acquire();
        packet.resize(RTP_HEADER_LEN, 0);
        rtp::encode_header(
            &RtpHeader {
                sequence: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
            },
            &mut packet[..RTP_HEADER_LEN],
        );

        let encoded = self.codec.encode_frame(&frame.data, &mut self.scratch)?;
        let nonce = self.cipher.generate_nonce(&packet[..RTP_HEADER_LEN]);
        let sealed = self.cipher.encrypt(&self.scratch[..encoded], &nonce)?;
        packet.extend_from_slice(&sealed);
        self.cipher.append_nonce_trailer(&nonce, &mut packet);

        self.sequence = self.sequence.wrapping_add(1);
        let samples = self.codec.format().samples_per_frame(frame.duration_ms) as u32;
        self.timestamp = self.timestamp.wrapping_add(samples);
        Ok(packet)
    }

    /// Announces speaking-state transitions on the control channel. A
    /// failed announcement never blocks media.
    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking == speaking {
            return;
        }
        self.speaking = speaking;
        match speaking_frame(self.ssrc, speaking) {
            Ok(frame) => {
                if self.control.send(frame).is_err() {
                    debug!("speaking update dropped: control channel closed");
                }
            }
            Err(e) => debug!("speaking frame build failed: {e}"),
        }
    }
}

/// Pushes the ramp-down silence frames onto the send queue. Queue-full is
/// benign (real audio arrived first).
pub(crate) fn enqueue_silence(
    queue: &flume::Sender<RawVoicePacket>,
    pool: &SharedBytePool,
    frame_bytes: usize,
    frame_ms: u32,
) {
    for _ in 0..TRAILING_SILENCE_FRAMES {
        let mut data = pool.acquire();
        data.resize(frame_bytes, 0);
        let packet = RawVoicePacket {
            data,
            duration_ms: frame_ms,
            silence: true,
        };
        if queue.try_send(packet).is_err() {
            break;
        }
    }
}

/// Fixed-schedule send loop. The schedule anchor always advances by the
/// frame's nominal duration (a quarter tick while idle), so jitter in one
/// iteration does not accumulate into the next; after a stall the backlog
/// drains with no inter-packet sleeps until the schedule catches up.
pub(crate) async fn run_sender(
    mut sender: VoiceSender,
    socket: Arc<dyn MediaSocket>,
    queue_rx: flume::Receiver<RawVoicePacket>,
    queue_tx: flume::Sender<RawVoicePacket>,
    mut paused: watch::Receiver<bool>,
    pool: SharedBytePool,
    cancel: CancellationToken,
) {
    let mut anchor = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = paused.wait_for(|p| !*p) => {
                if result.is_err() {
                    break;
                }
            }
        }

        // Dequeue and seal before pacing; encode cost stays out of the
        // inter-packet gap.
        let frame = queue_rx.try_recv().ok();
        let packet = match &frame {
            Some(frame) => {
                sender.set_speaking(true);
                match sender.prepare(frame) {
                    Ok(packet) => Some(packet),
                    Err(e) => {
                        warn!("frame encode failed, packet dropped: {e}");
                        None
                    }
                }
            }
            None => {
                sender.set_speaking(false);
                None
            }
        };
        let spacing = match &frame {
            Some(frame) => frame_spacing(frame.duration_ms),
            None => PACER_TICK / 4,
        };

        let target = anchor + spacing;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(target) => {}
        }
        anchor = target;

        if let Some(packet) = packet {
            if let Err(e) = socket.send(&packet).await {
                warn!("media send failed: {e}");
            }
        }
        if let Some(frame) = frame {
            if queue_rx.is_empty() && !frame.silence {
                enqueue_silence(&queue_tx, &pool, frame.data.len(), frame.duration_ms);
            }
        }
    }
}

/// Schedule spacing for a frame of `duration_ms`: one pacer tick per 5 ms
/// of audio, never less than a full tick.
pub(crate) fn frame_spacing(duration_ms: u32) -> Duration {
    PACER_TICK * (duration_ms / 5).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BytePoolInner;
    use crate::audio::codec::testing::FakeCodecFactory;
    use crate::audio::format::{AudioFormat, QualityPreset};
    use crate::crypto::{EncryptionMode, MAC_LEN};
    use crate::gateway::payloads::GatewayMessage;

    const KEY: [u8; 32] = [9u8; 32];

    fn sender_with(mode: EncryptionMode) -> (VoiceSender, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let format = AudioFormat::new(48_000, 2, QualityPreset::Music).unwrap();
        let codec = PacketCodec::new(&FakeCodecFactory, format).unwrap();
        let cipher = Arc::new(SecureChannelCodec::new(&KEY, mode));
        let (control, rx) = ControlSender::channel();
        let sender = VoiceSender::new(codec, cipher, 42, control, BytePoolInner::new(4_096));
        (sender, rx)
    }

    fn pcm_frame(format: AudioFormat, pool: &SharedBytePool) -> RawVoicePacket {
        let mut data = pool.acquire();
        data.resize(format.frame_bytes(20), 0);
        RawVoicePacket {
            data,
            duration_ms: 20,
            silence: false,
        }
    }

    #[test]
    fn prepare_advances_counters_and_sizes_packet() {
        let (mut sender, _rx) = sender_with(EncryptionMode::Lite);
        let format = sender.codec.format();
        let pool = BytePoolInner::new(4_096);
        let frame = pcm_frame(format, &pool);

        let first = sender.prepare(&frame).unwrap();
        let second = sender.prepare(&frame).unwrap();

        let (h1, _) = rtp::decode_header(&first).unwrap();
        let (h2, _) = rtp::decode_header(&second).unwrap();
        assert_eq!(h1.sequence, 0);
        assert_eq!(h2.sequence, 1);
        assert_eq!(h1.timestamp, 0);
        assert_eq!(h2.timestamp, format.samples_per_frame(20) as u32);
        assert_eq!(h1.ssrc, 42);

        // Header + ciphertext + tag + 4-byte counter trailer.
        let encoded = 32; // FakeEncoder cap
        assert_eq!(first.len(), RTP_HEADER_LEN + encoded + MAC_LEN + 4);
    }

    #[test]
    fn prepared_packet_round_trips_through_cipher() {
        let (mut sender, _rx) = sender_with(EncryptionMode::Suffix);
        let format = sender.codec.format();
        let pool = BytePoolInner::new(4_096);

        let packet = sender.prepare(&pcm_frame(format, &pool)).unwrap();
        let (nonce, ciphertext) = sender.cipher.locate_ciphertext(&packet).unwrap();
        assert!(sender.cipher.decrypt(ciphertext, &nonce).is_ok());
    }

    #[test]
    fn speaking_transitions_emit_exactly_one_frame_each() {
        let (mut sender, mut rx) = sender_with(EncryptionMode::Lite);

        sender.set_speaking(true);
        sender.set_speaking(true);
        sender.set_speaking(false);

        let up = GatewayMessage::parse(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(up.d["speaking"], 1);
        let down = GatewayMessage::parse(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(down.d["speaking"], 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn silence_ramp_down_enqueues_fixed_frame_count() {
        let format = AudioFormat::new(48_000, 2, QualityPreset::Music).unwrap();
        let pool = BytePoolInner::new(4_096);
        let (tx, rx) = flume::bounded(8);

        enqueue_silence(&tx, &pool, format.frame_bytes(20), 20);
        let frames: Vec<RawVoicePacket> = rx.try_iter().collect();
        assert_eq!(frames.len(), TRAILING_SILENCE_FRAMES);
        assert!(frames.iter().all(|f| f.silence));
        assert!(frames.iter().all(|f| f.data.iter().all(|&b| b == 0)));
    }

    #[test]
    fn pacer_spacing_follows_frame_duration() {
        assert_eq!(frame_spacing(20), PACER_TICK * 4);
        assert_eq!(frame_spacing(60), PACER_TICK * 12);
        // Sub-tick durations still advance one full tick.
        assert_eq!(frame_spacing(3), PACER_TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_schedule_drains_backlog_without_extra_sleeps() {
        use async_trait::async_trait;

        struct RecordingSocket {
            stamps: flume::Sender<tokio::time::Instant>,
        }

        #[async_trait]
        impl MediaSocket for RecordingSocket {
            async fn send(&self, buf: &[u8]) -> Result<usize> {
                let _ = self.stamps.send(tokio::time::Instant::now());
                Ok(buf.len())
            }

            async fn recv(&self, _buf: &mut [u8]) -> Result<usize> {
                futures::future::pending().await
            }
        }

        let (sender, _control_rx) = sender_with(EncryptionMode::Lite);
        let format = sender.codec.format();
        let pool = BytePoolInner::new(4_096);
        let gate = PauseGate::new();
        gate.pause();
        let (queue_tx, queue_rx) = flume::bounded(16);
        let (stamp_tx, stamp_rx) = flume::unbounded();
        let cancel = CancellationToken::new();
        tokio::spawn(run_sender(
            sender,
            Arc::new(RecordingSocket { stamps: stamp_tx }),
            queue_rx,
            queue_tx.clone(),
            gate.subscribe(),
            pool.clone(),
            cancel.clone(),
        ));
        // Let the loop anchor its schedule and park on the gate.
        tokio::task::yield_now().await;

        // A backlog builds up while the gate is closed and the clock
        // keeps running.
        for _ in 0..3 {
            queue_tx.send_async(pcm_frame(format, &pool)).await.unwrap();
        }
        tokio::time::advance(Duration::from_millis(100)).await;

        let resumed = tokio::time::Instant::now();
        gate.resume();
        let mut stamps = Vec::new();
        for _ in 0..3 {
            stamps.push(stamp_rx.recv_async().await.unwrap());
        }

        // Every scheduled target is already in the past, so the backlog
        // goes out back to back at the resume instant.
        assert!(stamps.iter().all(|&s| s == resumed));
        cancel.cancel();
    }
}
