//! One voice connection: control-channel state machine, media task
//! lifecycle, reconnect/resume policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::buffer::{BytePoolInner, SharedBytePool};
use crate::audio::codec::{CodecFactory, PacketCodec};
use crate::audio::format::AudioFormat;
use crate::audio::sink::{RawVoicePacket, TransmitSink};
use crate::constants::{
    BACKOFF_BASE_MS, DEFAULT_FRAME_MS, DEFAULT_QUEUE_LEN, MAX_RECONNECT_ATTEMPTS, RECV_BUFFER_LEN,
};
use crate::crypto::{EncryptionMode, SecureChannelCodec, KEY_LEN};
use crate::error::{Result, VoiceError};
use crate::gateway::events::{EventBus, VoiceEvent};
use crate::gateway::opcodes;
use crate::gateway::payloads::{
    can_resume, heartbeat_ack_nonce, heartbeat_frame, identify_frame, parse_snowflake,
    resume_frame, select_protocol_frame, ClientConnectedPayload, ClientDisconnectedPayload,
    GatewayMessage, HelloPayload, ReadyPayload, SessionDescriptionPayload, SpeakingPayload,
};
use crate::gateway::receiver::{run_receiver, ReceivePipeline, Sources};
use crate::gateway::sender::{enqueue_silence, run_sender, PauseGate, VoiceSender};
use crate::gateway::transport::{ControlConnector, ControlFrame, ControlSender};
use crate::gateway::udp::{
    discover_external_address, parse_keepalive, run_keepalive, KeepaliveTracker, MediaConnector,
    MediaSocket,
};
use crate::types::{ChannelId, GuildId, SessionId, UserId};

/// Everything needed to join one voice server.
#[derive(Clone, serde::Deserialize)]
pub struct ConnectionConfig {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
    pub endpoint: String,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    #[serde(default = "default_queue_len")]
    pub queue_len: usize,
    #[serde(default)]
    pub receive_audio: bool,
}

fn default_frame_ms() -> u32 {
    DEFAULT_FRAME_MS
}

fn default_queue_len() -> usize {
    DEFAULT_QUEUE_LEN
}

impl ConnectionConfig {
    pub fn new(
        guild_id: GuildId,
        channel_id: ChannelId,
        user_id: UserId,
        session_id: SessionId,
        token: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            guild_id,
            channel_id,
            user_id,
            session_id,
            token: token.into(),
            endpoint: endpoint.into(),
            format: AudioFormat::default(),
            frame_ms: DEFAULT_FRAME_MS,
            queue_len: DEFAULT_QUEUE_LEN,
            receive_audio: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    IpDiscovery,
    EncryptionNegotiation,
    Ready,
    Resuming,
}

/// Media-plane state that survives a control-channel resume.
#[derive(Clone)]
struct MediaState {
    socket: Arc<dyn MediaSocket>,
    cipher: Arc<SecureChannelCodec>,
    ssrc: u32,
    external_address: (String, u16),
}

#[derive(Default)]
struct ControlStats {
    control_rtt: Option<Duration>,
    pending_heartbeat: Option<(u64, Instant)>,
}

struct ConnectionInner {
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: Arc<EventBus>,
    queue_tx: flume::Sender<RawVoicePacket>,
    queue_rx: flume::Receiver<RawVoicePacket>,
    pause: PauseGate,
    cancel: CancellationToken,
    disposed: AtomicBool,
    pool: SharedBytePool,
    sink: OnceLock<Arc<TransmitSink>>,
    sources: Arc<Sources>,
    keepalive: Arc<KeepaliveTracker>,
    stats: parking_lot::Mutex<ControlStats>,
    codecs: Arc<dyn CodecFactory>,
    media: parking_lot::Mutex<Option<MediaState>>,
}

impl ConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Arms the media loops for one control session. On resume the same
    /// socket/cipher come back with fresh sequence counters.
    fn spawn_media_tasks(
        self: &Arc<Self>,
        media: &MediaState,
        control: &ControlSender,
        session_cancel: &CancellationToken,
    ) -> Result<()> {
        let codec = PacketCodec::new(self.codecs.as_ref(), self.config.format)?;
        let sender = VoiceSender::new(
            codec,
            media.cipher.clone(),
            media.ssrc,
            control.clone(),
            self.pool.clone(),
        );
        tokio::spawn(run_sender(
            sender,
            media.socket.clone(),
            self.queue_rx.clone(),
            self.queue_tx.clone(),
            self.pause.subscribe(),
            self.pool.clone(),
            session_cancel.clone(),
        ));

        if self.config.receive_audio {
            let pipeline =
                ReceivePipeline::new(media.cipher.clone(), self.sources.clone(), self.keepalive.clone());
            tokio::spawn(run_receiver(
                media.socket.clone(),
                pipeline,
                session_cancel.clone(),
            ));
        } else {
            // Keepalive echoes still need draining when inbound audio is off.
            tokio::spawn(drain_keepalive_echoes(
                media.socket.clone(),
                self.keepalive.clone(),
                session_cancel.clone(),
            ));
        }

        tokio::spawn(run_keepalive(
            media.socket.clone(),
            self.keepalive.clone(),
            session_cancel.clone(),
        ));
        Ok(())
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a live voice connection. Cloning shares the connection;
/// dropping the last handle tears it down.
#[derive(Clone)]
pub struct VoiceConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for VoiceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceConnection").finish_non_exhaustive()
    }
}

impl VoiceConnection {
    /// Connects and completes the full handshake before returning. A
    /// handshake failure on the first attempt is returned to the caller;
    /// later drops are handled by the reconnect policy.
    pub async fn connect(
        config: ConnectionConfig,
        control: Arc<dyn ControlConnector>,
        media: Arc<dyn MediaConnector>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Result<Self> {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let events = Arc::new(EventBus::new());
        let (queue_tx, queue_rx) = flume::bounded(config.queue_len.max(1));
        let pool = BytePoolInner::new(config.format.max_buffer_size());
        let sources = Arc::new(Sources::new(codecs.clone(), config.format, events.clone()));

        let inner = Arc::new(ConnectionInner {
            config,
            state_tx,
            events,
            queue_tx,
            queue_rx,
            pause: PauseGate::new(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            pool,
            sink: OnceLock::new(),
            sources,
            keepalive: Arc::new(KeepaliveTracker::new()),
            stats: parking_lot::Mutex::new(ControlStats::default()),
            codecs,
            media: parking_lot::Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_driver(inner.clone(), control, media, ready_tx));

        ready_rx
            .await
            .map_err(|_| VoiceError::HandshakeFailed("connection driver exited".into()))??;
        Ok(Self { inner })
    }

    pub fn guild_id(&self) -> GuildId {
        self.inner.config.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.config.channel_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch handle for state transitions.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> flume::Receiver<VoiceEvent> {
        self.inner.events.subscribe()
    }

    /// The buffering send handle. Created lazily; all clones share one
    /// frame buffer and filter chain.
    pub fn transmit_sink(&self) -> Arc<TransmitSink> {
        self.inner
            .sink
            .get_or_init(|| {
                Arc::new(TransmitSink::new(
                    self.inner.config.format,
                    self.inner.config.frame_ms,
                    self.inner.queue_tx.clone(),
                    self.inner.pool.clone(),
                ))
            })
            .clone()
    }

    /// Halts outbound media without tearing the connection down.
    pub fn pause(&self) {
        self.inner.pause.pause();
    }

    pub fn resume(&self) {
        self.inner.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.pause.is_paused()
    }

    /// Round-trip time of the last answered control heartbeat.
    pub fn control_latency(&self) -> Option<Duration> {
        self.inner.stats.lock().control_rtt
    }

    /// Round-trip time of the last answered media keepalive.
    pub fn media_latency(&self) -> Option<Duration> {
        self.inner.keepalive.last_rtt()
    }

    /// Tears the connection down. Idempotent; all media and control tasks
    /// stop, the send queue closes, and the state settles at
    /// `Disconnected`.
    pub async fn disconnect(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.sources.clear();
        *self.inner.media.lock() = None;
        self.inner.set_state(ConnectionState::Disconnected);
        info!(guild_id = %self.inner.config.guild_id, "voice connection disposed");
    }
}

enum SessionOutcome {
    Shutdown,
    Resume,
    Reidentify,
}

fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS << attempts.saturating_sub(1).min(3))
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn run_driver(
    inner: Arc<ConnectionInner>,
    control: Arc<dyn ControlConnector>,
    media: Arc<dyn MediaConnector>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempts: u32 = 0;
    let mut resume = false;

    loop {
        if inner.is_disposed() {
            break;
        }
        inner.set_state(if resume {
            ConnectionState::Resuming
        } else {
            ConnectionState::Connecting
        });

        match run_session(&inner, &*control, &*media, resume, &mut ready_tx, &mut attempts).await {
            Ok(SessionOutcome::Shutdown) => break,
            Ok(SessionOutcome::Resume) => resume = true,
            Ok(SessionOutcome::Reidentify) => resume = false,
            Err(e) => {
                // A failure during the initial handshake is the caller's
                // problem; afterwards the reconnect policy owns it.
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                    break;
                }
                warn!(guild_id = %inner.config.guild_id, "voice session error: {e}");
                resume = false;
            }
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            warn!(
                guild_id = %inner.config.guild_id,
                "giving up after {attempts} reconnect attempts"
            );
            break;
        }
        let delay = backoff_delay(attempts);
        debug!(guild_id = %inner.config.guild_id, "reconnecting in {delay:?}");
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(VoiceError::HandshakeFailed(
            "connection closed before handshake completed".into(),
        )));
    }
}

async fn run_session(
    inner: &Arc<ConnectionInner>,
    control: &dyn ControlConnector,
    media: &dyn MediaConnector,
    resume: bool,
    ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    attempts: &mut u32,
) -> Result<SessionOutcome> {
    let config = &inner.config;
    let (sender, mut stream) = control.connect(&config.endpoint).await?;

    // Media tasks and the heartbeat live exactly as long as this session.
    let session_cancel = inner.cancel.child_token();
    let _session_guard = session_cancel.clone().drop_guard();

    let opening = if resume {
        resume_frame(config.guild_id, &config.session_id, &config.token)?
    } else {
        identify_frame(config.guild_id, config.user_id, &config.session_id, &config.token)?
    };
    sender.send(opening)?;

    // Handshake state between Ready and SessionDescription.
    let mut negotiated: Option<(Arc<dyn MediaSocket>, u32, (String, u16))> = None;

    loop {
        let frame = tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(SessionOutcome::Shutdown),
            frame = stream.next_frame() => frame,
        };

        let text = match frame {
            None => {
                return Ok(if inner.is_disposed() {
                    SessionOutcome::Shutdown
                } else {
                    SessionOutcome::Resume
                });
            }
            Some(ControlFrame::Closed(code)) => {
                if inner.is_disposed() {
                    return Ok(SessionOutcome::Shutdown);
                }
                return Ok(match code {
                    Some(code) if !can_resume(code) => {
                        warn!(code, "control channel closed; session not resumable");
                        SessionOutcome::Reidentify
                    }
                    _ => SessionOutcome::Resume,
                });
            }
            Some(ControlFrame::Text(text)) => text,
        };

        let message = match GatewayMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                debug!("unparseable control frame skipped: {e}");
                continue;
            }
        };

        match message.op {
            opcodes::HELLO => {
                let hello: HelloPayload = serde_json::from_value(message.d)?;
                spawn_heartbeat(inner, &sender, &session_cancel, hello.heartbeat_interval);
            }
            opcodes::READY => {
                let ready: ReadyPayload = serde_json::from_value(message.d)?;
                inner.set_state(ConnectionState::IpDiscovery);

                let socket = media.connect(&format!("{}:{}", ready.ip, ready.port)).await?;
                let external = discover_external_address(socket.as_ref(), ready.ssrc).await?;

                inner.set_state(ConnectionState::EncryptionNegotiation);
                let mode = EncryptionMode::negotiate(&ready.modes)?;
                sender.send(select_protocol_frame(&external.0, external.1, mode)?)?;
                negotiated = Some((socket, ready.ssrc, external));
            }
            opcodes::SESSION_DESCRIPTION => {
                let desc: SessionDescriptionPayload = serde_json::from_value(message.d)?;
                let mode = EncryptionMode::from_name(&desc.mode)
                    .ok_or(VoiceError::UnsupportedEncryption)?;
                let key: [u8; KEY_LEN] = desc.secret_key.as_slice().try_into().map_err(|_| {
                    VoiceError::HandshakeFailed("secret key has wrong length".into())
                })?;
                let (socket, ssrc, external_address) = negotiated.take().ok_or_else(|| {
                    VoiceError::HandshakeFailed("session description before ready".into())
                })?;

                let state = MediaState {
                    socket,
                    cipher: Arc::new(SecureChannelCodec::new(&key, mode)),
                    ssrc,
                    external_address,
                };
                *inner.media.lock() = Some(state.clone());
                inner.spawn_media_tasks(&state, &sender, &session_cancel)?;

                // Priming frames go out ahead of any caller audio.
                enqueue_silence(
                    &inner.queue_tx,
                    &inner.pool,
                    config.format.frame_bytes(config.frame_ms),
                    config.frame_ms,
                );

                inner.set_state(ConnectionState::Ready);
                *attempts = 0;
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                info!(
                    guild_id = %config.guild_id,
                    ssrc,
                    %mode,
                    external = %format!("{}:{}", state.external_address.0, state.external_address.1),
                    "voice connection ready"
                );
            }
            opcodes::RESUMED => {
                let media_state = inner.media.lock().clone();
                match media_state {
                    Some(state) => {
                        inner.spawn_media_tasks(&state, &sender, &session_cancel)?;
                        inner.set_state(ConnectionState::Ready);
                        *attempts = 0;
                        info!(guild_id = %config.guild_id, "voice session resumed");
                    }
                    // Nothing to resume onto; rebuild from scratch.
                    None => return Ok(SessionOutcome::Reidentify),
                }
            }
            opcodes::SPEAKING => {
                if let Ok(speaking) = serde_json::from_value::<SpeakingPayload>(message.d) {
                    let user = speaking.user();
                    let is_speaking = speaking.is_speaking();
                    if let Err(e) = inner.sources.note_speaking(speaking.ssrc, user, is_speaking) {
                        debug!("speaking update dropped: {e}");
                    }
                }
            }
            opcodes::CLIENT_CONNECTED => {
                if let Ok(connected) =
                    serde_json::from_value::<ClientConnectedPayload>(message.d)
                {
                    if let Some(user) = parse_snowflake(&connected.user_id) {
                        if let Err(e) = inner.sources.client_connected(connected.audio_ssrc, user) {
                            debug!("client-connected update dropped: {e}");
                        }
                    }
                }
            }
            opcodes::CLIENT_DISCONNECTED => {
                if let Ok(disconnected) =
                    serde_json::from_value::<ClientDisconnectedPayload>(message.d)
                {
                    if let Some(user) = parse_snowflake(&disconnected.user_id) {
                        inner.sources.client_disconnected(user);
                    }
                }
            }
            opcodes::HEARTBEAT_ACK => {
                if let Some(nonce) = heartbeat_ack_nonce(&message.d) {
                    let mut stats = inner.stats.lock();
                    if let Some((pending, sent)) = stats.pending_heartbeat {
                        if pending == nonce {
                            stats.control_rtt = Some(sent.elapsed());
                            stats.pending_heartbeat = None;
                        }
                    }
                }
            }
            other => debug!(op = other, "ignoring unknown control opcode"),
        }
    }
}

fn spawn_heartbeat(
    inner: &Arc<ConnectionInner>,
    sender: &ControlSender,
    session_cancel: &CancellationToken,
    interval_ms: f64,
) {
    let interval = Duration::from_millis(interval_ms.max(1.0) as u64);
    let inner = inner.clone();
    let sender = sender.clone();
    let cancel = session_cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so the cadence starts
        // one interval after Hello.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let nonce = unix_millis();
            inner.stats.lock().pending_heartbeat = Some((nonce, Instant::now()));
            let frame = match heartbeat_frame(nonce) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("heartbeat frame build failed: {e}");
                    break;
                }
            };
            if sender.send(frame).is_err() {
                break;
            }
        }
    });
}

/// Minimal receive loop used when inbound audio is disabled: consumes
/// keepalive echoes, discards everything else.
async fn drain_keepalive_echoes(
    socket: Arc<dyn MediaSocket>,
    keepalive: Arc<KeepaliveTracker>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(_) => continue,
            },
        };
        if let Some(id) = parse_keepalive(&buf[..n]) {
            keepalive.acknowledge(id);
        }
    }
}
