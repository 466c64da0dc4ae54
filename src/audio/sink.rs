//! `TransmitSink`, the public buffering API on the send path.
//!
//! Accumulates caller PCM into exactly frame-sized chunks, runs the filter
//! chain and volume stage, and hands completed frames to the connection's
//! bounded send queue. Producers suspend on a full queue rather than drop.

use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::Mutex;

use crate::audio::buffer::{PooledBytes, SharedBytePool};
use crate::audio::filter::PcmFilter;
use crate::audio::format::AudioFormat;
use crate::error::{Result, VoiceError};

/// One outbound frame on the send queue.
pub struct RawVoicePacket {
    /// Interleaved little-endian PCM, exactly one frame. Returns to the
    /// connection's pool on drop.
    pub data: PooledBytes,
    /// Nominal duration used by the pacer.
    pub duration_ms: u32,
    /// Synthetic silence (priming / ramp-down), not caller audio.
    pub silence: bool,
}

/// Handle returned by [`TransmitSink::install_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

struct InstalledFilter {
    id: FilterId,
    filter: Box<dyn PcmFilter>,
}

struct FilterChain {
    filters: Vec<InstalledFilter>,
    next_id: u64,
    volume: f32,
}

struct FrameBuffer {
    buf: Vec<u8>,
    fill: usize,
}

pub struct TransmitSink {
    format: AudioFormat,
    frame_ms: u32,
    frame_bytes: usize,
    queue: flume::Sender<RawVoicePacket>,
    pool: SharedBytePool,
    /// Writer scope: only one caller fills the frame buffer at a time.
    buffer: Mutex<FrameBuffer>,
    chain: parking_lot::Mutex<FilterChain>,
}

impl TransmitSink {
    pub(crate) fn new(
        format: AudioFormat,
        frame_ms: u32,
        queue: flume::Sender<RawVoicePacket>,
        pool: SharedBytePool,
    ) -> Self {
        let frame_bytes = format.frame_bytes(frame_ms);
        Self {
            format,
            frame_ms,
            frame_bytes,
            queue,
            pool,
            buffer: Mutex::new(FrameBuffer {
                buf: vec![0; frame_bytes],
                fill: 0,
            }),
            chain: parking_lot::Mutex::new(FilterChain {
                filters: Vec::new(),
                next_id: 0,
                volume: 1.0,
            }),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn frame_duration_ms(&self) -> u32 {
        self.frame_ms
    }

    /// Copies `data` into the frame buffer, enqueueing one packet per
    /// completed frame. Suspends when the send queue is full.
    pub async fn write(&self, mut data: &[u8]) -> Result<()> {
        let mut fb = self.buffer.lock().await;
        while !data.is_empty() {
            let take = (self.frame_bytes - fb.fill).min(data.len());
            let fill = fb.fill;
            fb.buf[fill..fill + take].copy_from_slice(&data[..take]);
            fb.fill += take;
            data = &data[take..];

            if fb.fill == self.frame_bytes {
                let packet = self.finish_frame(&mut fb);
                self.queue
                    .send_async(packet)
                    .await
                    .map_err(|_| VoiceError::Disposed)?;
            }
        }
        Ok(())
    }

    /// Zero-pads and enqueues any partial frame regardless of fill level.
    pub async fn flush(&self) -> Result<()> {
        let mut fb = self.buffer.lock().await;
        if fb.fill == 0 {
            return Ok(());
        }
        let fill = fb.fill;
        fb.buf[fill..].fill(0);
        fb.fill = self.frame_bytes;
        let packet = self.finish_frame(&mut fb);
        self.queue
            .send_async(packet)
            .await
            .map_err(|_| VoiceError::Disposed)
    }

    /// Sets the volume multiplier. Valid range 0.0–2.5; samples are scaled
    /// directly with wrapping truncation, no runtime clipping.
    pub fn set_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=2.5).contains(&volume) {
            return Err(VoiceError::InvalidParameter("volume"));
        }
        self.chain.lock().volume = volume;
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.chain.lock().volume
    }

    /// Installs a filter at `order` in the chain. Out-of-range orders clamp
    /// to the end of the list.
    pub fn install_filter(&self, filter: Box<dyn PcmFilter>, order: usize) -> FilterId {
        let mut chain = self.chain.lock();
        let id = FilterId(chain.next_id);
        chain.next_id += 1;
        let at = order.min(chain.filters.len());
        chain.filters.insert(at, InstalledFilter { id, filter });
        id
    }

    /// Removes a previously installed filter. Returns `false` if the id is
    /// unknown.
    pub fn uninstall_filter(&self, id: FilterId) -> bool {
        let mut chain = self.chain.lock();
        let before = chain.filters.len();
        chain.filters.retain(|f| f.id != id);
        chain.filters.len() != before
    }

    fn finish_frame(&self, fb: &mut FrameBuffer) -> RawVoicePacket {
        let mut samples = vec![0i16; self.frame_bytes / 2];
        LittleEndian::read_i16_into(&fb.buf, &mut samples);

        {
            let mut chain = self.chain.lock();
            for installed in chain.filters.iter_mut() {
                installed.filter.process(&mut samples);
            }
            let volume = chain.volume;
            if (volume - 1.0).abs() > f32::EPSILON {
                for s in samples.iter_mut() {
                    *s = (*s as f32 * volume) as i32 as i16;
                }
            }
        }

        let mut data = self.pool.acquire();
        data.resize(self.frame_bytes, 0);
        LittleEndian::write_i16_into(&samples, &mut data);
        fb.fill = 0;

        RawVoicePacket {
            data,
            duration_ms: self.frame_ms,
            silence: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::BytePoolInner;
    use crate::audio::format::QualityPreset;

    fn sink_pair(frame_ms: u32) -> (TransmitSink, flume::Receiver<RawVoicePacket>) {
        let format = AudioFormat::new(48_000, 2, QualityPreset::Music).unwrap();
        let (tx, rx) = flume::bounded(32);
        let sink = TransmitSink::new(format, frame_ms, tx, BytePoolInner::new(4_096));
        (sink, rx)
    }

    #[tokio::test]
    async fn whole_frames_enqueue_one_packet_each() {
        let (sink, rx) = sink_pair(20);
        let frame = sink.frame_bytes;

        sink.write(&vec![1u8; frame * 3]).await.unwrap();

        for _ in 0..3 {
            let packet = rx.try_recv().unwrap();
            assert_eq!(packet.data.len(), frame);
            assert_eq!(packet.duration_ms, 20);
            assert!(!packet.silence);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn partial_frame_waits_for_flush() {
        let (sink, rx) = sink_pair(20);
        let frame = sink.frame_bytes;

        sink.write(&vec![7u8; frame / 2]).await.unwrap();
        assert!(rx.try_recv().is_err());

        sink.flush().await.unwrap();
        let packet = rx.try_recv().unwrap();
        assert_eq!(packet.data.len(), frame);
        // The padded tail is zeroed.
        assert!(packet.data[frame / 2..].iter().all(|&b| b == 0));

        // Flushing an empty buffer enqueues nothing.
        sink.flush().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn filters_run_in_installation_order() {
        let (sink, rx) = sink_pair(20);
        let frame = sink.frame_bytes;

        // (s + 1) * 2 != s * 2 + 1, so order is observable.
        sink.install_filter(
            Box::new(|samples: &mut [i16]| {
                for s in samples.iter_mut() {
                    *s += 1;
                }
            }),
            0,
        );
        // Out-of-range order clamps to the end of the list.
        sink.install_filter(
            Box::new(|samples: &mut [i16]| {
                for s in samples.iter_mut() {
                    *s *= 2;
                }
            }),
            99,
        );

        sink.write(&vec![0u8; frame]).await.unwrap();
        let packet = rx.try_recv().unwrap();
        let mut samples = vec![0i16; frame / 2];
        LittleEndian::read_i16_into(&packet.data, &mut samples);
        assert!(samples.iter().all(|&s| s == 2));
    }

    #[tokio::test]
    async fn uninstall_removes_filter() {
        let (sink, rx) = sink_pair(20);
        let frame = sink.frame_bytes;

        let id = sink.install_filter(
            Box::new(|samples: &mut [i16]| {
                for s in samples.iter_mut() {
                    *s += 5;
                }
            }),
            0,
        );
        assert!(sink.uninstall_filter(id));
        assert!(!sink.uninstall_filter(id));

        sink.write(&vec![0u8; frame]).await.unwrap();
        let packet = rx.try_recv().unwrap();
        assert!(packet.data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn full_queue_suspends_writer_without_dropping() {
        let format = AudioFormat::new(48_000, 2, QualityPreset::Music).unwrap();
        let (tx, rx) = flume::bounded(1);
        let sink =
            std::sync::Arc::new(TransmitSink::new(format, 20, tx, BytePoolInner::new(4_096)));
        let frame = sink.frame_bytes;

        let writer = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.write(&vec![9u8; frame * 3]).await })
        };

        // The single slot fills and the writer parks on the second frame.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        for _ in 0..3 {
            let packet = rx.recv_async().await.unwrap();
            assert_eq!(packet.data.len(), frame);
        }
        writer.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn volume_scales_samples() {
        let (sink, rx) = sink_pair(20);
        let frame = sink.frame_bytes;

        assert!(sink.set_volume(3.0).is_err());
        assert!(sink.set_volume(-0.1).is_err());
        sink.set_volume(2.0).unwrap();

        let mut input = vec![0u8; frame];
        let samples = vec![100i16; frame / 2];
        LittleEndian::write_i16_into(&samples, &mut input);

        sink.write(&input).await.unwrap();
        let packet = rx.try_recv().unwrap();
        let mut out = vec![0i16; frame / 2];
        LittleEndian::read_i16_into(&packet.data, &mut out);
        assert!(out.iter().all(|&s| s == 200));
    }
}
