//! Per-guild connection registry and the signalling handoff.
//!
//! Joining voice is a three-party dance: this crate asks the signalling
//! layer to move the bot into a channel, the signalling layer later
//! reports back a session id and a server endpoint/token pair, and only
//! then can the voice handshake start. The registry owns that handoff.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::audio::codec::CodecFactory;
use crate::audio::format::AudioFormat;
use crate::constants::{DEFAULT_FRAME_MS, DEFAULT_QUEUE_LEN};
use crate::error::{Result, VoiceError};
use crate::gateway::connection::{ConnectionConfig, VoiceConnection};
use crate::gateway::transport::{ControlConnector, WsConnector};
use crate::gateway::udp::{MediaConnector, UdpConnector};
use crate::types::{ChannelId, GuildId, SessionId, UserId};

/// Outbound voice-state intent, sent over the main (non-voice) gateway.
/// The crate does not own that socket; the embedding application does.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()>;
}

/// Voice-state half of the handoff.
#[derive(Debug, Clone)]
pub struct VoiceStateInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
}

/// Voice-server half of the handoff.
#[derive(Debug, Clone)]
pub struct VoiceServerInfo {
    pub guild_id: GuildId,
    pub endpoint: String,
    pub token: String,
}

struct PendingHandoff {
    state_tx: Option<oneshot::Sender<VoiceStateInfo>>,
    server_tx: Option<oneshot::Sender<VoiceServerInfo>>,
}

/// Per-call connection options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub self_mute: bool,
    pub self_deaf: bool,
    pub format: AudioFormat,
    pub frame_ms: u32,
    pub queue_len: usize,
    pub receive_audio: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            self_mute: false,
            self_deaf: false,
            format: AudioFormat::default(),
            frame_ms: DEFAULT_FRAME_MS,
            queue_len: DEFAULT_QUEUE_LEN,
            receive_audio: false,
        }
    }
}

/// All live voice connections for one bot user, keyed by guild.
pub struct VoiceRegistry {
    user_id: UserId,
    signal: Arc<dyn SignalChannel>,
    control: Arc<dyn ControlConnector>,
    media: Arc<dyn MediaConnector>,
    codecs: Arc<dyn CodecFactory>,
    connections: DashMap<GuildId, Arc<VoiceConnection>>,
    pending: DashMap<GuildId, parking_lot::Mutex<PendingHandoff>>,
}

impl VoiceRegistry {
    pub fn new(
        user_id: UserId,
        signal: Arc<dyn SignalChannel>,
        control: Arc<dyn ControlConnector>,
        media: Arc<dyn MediaConnector>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            user_id,
            signal,
            control,
            media,
            codecs,
            connections: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Registry wired to the production WebSocket/UDP transports.
    pub fn with_default_transports(
        user_id: UserId,
        signal: Arc<dyn SignalChannel>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self::new(
            user_id,
            signal,
            Arc::new(WsConnector),
            Arc::new(UdpConnector),
            codecs,
        )
    }

    /// Joins `channel_id` and completes the voice handshake. At most one
    /// connection and one in-flight attempt per guild.
    pub async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: ConnectOptions,
    ) -> Result<Arc<VoiceConnection>> {
        if self.connections.contains_key(&guild_id) {
            return Err(VoiceError::AlreadyConnected(guild_id));
        }

        let (state_tx, state_rx) = oneshot::channel();
        let (server_tx, server_rx) = oneshot::channel();
        match self.pending.entry(guild_id) {
            Entry::Occupied(_) => return Err(VoiceError::ConnectInProgress(guild_id)),
            Entry::Vacant(slot) => {
                slot.insert(parking_lot::Mutex::new(PendingHandoff {
                    state_tx: Some(state_tx),
                    server_tx: Some(server_tx),
                }));
            }
        }

        let result = self
            .connect_inner(guild_id, channel_id, options, state_rx, server_rx)
            .await;
        self.pending.remove(&guild_id);
        result
    }

    async fn connect_inner(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        options: ConnectOptions,
        state_rx: oneshot::Receiver<VoiceStateInfo>,
        server_rx: oneshot::Receiver<VoiceServerInfo>,
    ) -> Result<Arc<VoiceConnection>> {
        self.signal
            .update_voice_state(guild_id, Some(channel_id), options.self_mute, options.self_deaf)
            .await?;

        // The two halves arrive in either order; each oneshot buffers its
        // value, so sequential awaits are safe.
        let state = state_rx
            .await
            .map_err(|_| VoiceError::HandshakeFailed("voice state update never arrived".into()))?;
        let server = server_rx
            .await
            .map_err(|_| VoiceError::HandshakeFailed("voice server update never arrived".into()))?;
        debug!(%guild_id, endpoint = %server.endpoint, "voice handoff complete");

        let config = ConnectionConfig {
            guild_id,
            channel_id,
            user_id: self.user_id,
            session_id: state.session_id,
            token: server.token,
            endpoint: server.endpoint,
            format: options.format,
            frame_ms: options.frame_ms,
            queue_len: options.queue_len,
            receive_audio: options.receive_audio,
        };
        let connection = Arc::new(
            VoiceConnection::connect(
                config,
                self.control.clone(),
                self.media.clone(),
                self.codecs.clone(),
            )
            .await?,
        );
        self.connections.insert(guild_id, connection.clone());
        info!(%guild_id, %channel_id, "voice connection registered");
        Ok(connection)
    }

    /// Feed for voice-state updates from the signalling layer. Updates for
    /// other users are ignored here; per-connection membership events come
    /// over the voice control channel itself.
    pub fn on_voice_state_update(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        session_id: SessionId,
        user_id: UserId,
    ) {
        if user_id != self.user_id {
            return;
        }
        if channel_id.is_none() {
            // Kicked or moved out: tear down whatever exists.
            self.pending.remove(&guild_id);
            if let Some((_, connection)) = self.connections.remove(&guild_id) {
                tokio::spawn(async move { connection.disconnect().await });
            }
            return;
        }
        if let Some(pending) = self.pending.get(&guild_id) {
            if let Some(tx) = pending.lock().state_tx.take() {
                let _ = tx.send(VoiceStateInfo { session_id, user_id });
            }
        }
    }

    /// Feed for voice-server updates from the signalling layer.
    pub fn on_voice_server_update(&self, guild_id: GuildId, endpoint: String, token: String) {
        if let Some(pending) = self.pending.get(&guild_id) {
            if let Some(tx) = pending.lock().server_tx.take() {
                let _ = tx.send(VoiceServerInfo {
                    guild_id,
                    endpoint,
                    token,
                });
            }
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<VoiceConnection>> {
        self.connections.get(&guild_id).map(|c| c.clone())
    }

    pub fn is_connected(&self, guild_id: GuildId) -> bool {
        self.connections.contains_key(&guild_id)
    }

    /// Leaves the guild's voice channel and informs the signalling layer.
    pub async fn disconnect(&self, guild_id: GuildId) -> Result<()> {
        self.pending.remove(&guild_id);
        if let Some((_, connection)) = self.connections.remove(&guild_id) {
            connection.disconnect().await;
        }
        self.signal
            .update_voice_state(guild_id, None, false, false)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::testing::FakeCodecFactory;

    struct NoopSignal;

    #[async_trait]
    impl SignalChannel for NoopSignal {
        async fn update_voice_state(
            &self,
            _guild_id: GuildId,
            _channel_id: Option<ChannelId>,
            _self_mute: bool,
            _self_deaf: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl ControlConnector for RefusingConnector {
        async fn connect(
            &self,
            _endpoint: &str,
        ) -> Result<(crate::gateway::transport::ControlSender, Box<dyn crate::gateway::transport::ControlStream>)>
        {
            Err(VoiceError::HandshakeFailed("test connector".into()))
        }
    }

    fn registry() -> VoiceRegistry {
        VoiceRegistry::new(
            UserId(1),
            Arc::new(NoopSignal),
            Arc::new(RefusingConnector),
            Arc::new(UdpConnector),
            Arc::new(FakeCodecFactory),
        )
    }

    #[tokio::test]
    async fn second_connect_attempt_is_rejected_while_first_is_pending() {
        let registry = registry();
        registry.pending.insert(
            GuildId(5),
            parking_lot::Mutex::new(PendingHandoff {
                state_tx: None,
                server_tx: None,
            }),
        );
        let err = registry
            .connect(GuildId(5), ChannelId(6), ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::ConnectInProgress(GuildId(5))));
    }

    #[tokio::test]
    async fn handoff_updates_for_other_users_are_ignored() {
        let registry = registry();
        let (state_tx, mut state_rx) = oneshot::channel();
        registry.pending.insert(
            GuildId(5),
            parking_lot::Mutex::new(PendingHandoff {
                state_tx: Some(state_tx),
                server_tx: None,
            }),
        );

        registry.on_voice_state_update(
            GuildId(5),
            Some(ChannelId(6)),
            SessionId::from("other"),
            UserId(999),
        );
        assert!(state_rx.try_recv().is_err());

        registry.on_voice_state_update(
            GuildId(5),
            Some(ChannelId(6)),
            SessionId::from("mine"),
            UserId(1),
        );
        let info = state_rx.try_recv().unwrap();
        assert_eq!(info.session_id, SessionId::from("mine"));
    }

    #[tokio::test]
    async fn server_update_delivers_endpoint_and_token() {
        let registry = registry();
        let (server_tx, mut server_rx) = oneshot::channel();
        registry.pending.insert(
            GuildId(5),
            parking_lot::Mutex::new(PendingHandoff {
                state_tx: None,
                server_tx: Some(server_tx),
            }),
        );

        registry.on_voice_server_update(GuildId(5), "voice.example.com".into(), "tok".into());
        let info = server_rx.try_recv().unwrap();
        assert_eq!(info.endpoint, "voice.example.com");
        assert_eq!(info.token, "tok");

        // Second delivery has nowhere to go and is dropped quietly.
        registry.on_voice_server_update(GuildId(5), "x".into(), "y".into());
    }

    #[tokio::test]
    async fn leaving_the_channel_clears_pending_state() {
        let registry = registry();
        registry.pending.insert(
            GuildId(5),
            parking_lot::Mutex::new(PendingHandoff {
                state_tx: None,
                server_tx: None,
            }),
        );
        registry.on_voice_state_update(GuildId(5), None, SessionId::from("s"), UserId(1));
        assert!(registry.pending.get(&GuildId(5)).is_none());
    }
}
