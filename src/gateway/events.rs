//! Connection event fan-out.

use bytes::Bytes;

use crate::audio::format::AudioFormat;
use crate::types::UserId;

/// One decoded (or concealed) frame of inbound audio.
#[derive(Debug, Clone)]
pub struct ReceivedAudio {
    pub ssrc: u32,
    pub user: Option<UserId>,
    /// Interleaved little-endian 16-bit PCM.
    pub pcm: Bytes,
    /// The compressed payload as received; empty for concealed frames.
    pub opus: Bytes,
    pub format: AudioFormat,
    pub duration_ms: u32,
    pub concealed: bool,
}

#[derive(Debug, Clone)]
pub enum VoiceEvent {
    UserSpeaking {
        ssrc: u32,
        user: Option<UserId>,
        speaking: bool,
    },
    UserJoined {
        ssrc: u32,
        user: UserId,
    },
    UserLeft {
        user: UserId,
    },
    AudioReceived(ReceivedAudio),
    /// A non-fatal media-loop error; the loop keeps running.
    SocketError {
        detail: String,
    },
}

/// Multi-subscriber event bus. Dead subscribers are dropped on the next
/// emit.
pub struct EventBus {
    subscribers: parking_lot::Mutex<Vec<flume::Sender<VoiceEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<VoiceEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: VoiceEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_reaches_live_subscribers_and_prunes_dead_ones() {
        let bus = EventBus::new();
        let alive = bus.subscribe();
        let dead = bus.subscribe();
        drop(dead);

        bus.emit(VoiceEvent::UserLeft { user: UserId(1) });
        assert!(matches!(
            alive.try_recv().unwrap(),
            VoiceEvent::UserLeft { user: UserId(1) }
        ));
        assert_eq!(bus.subscribers.lock().len(), 1);
    }
}
