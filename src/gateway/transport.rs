//! Control-channel seam: a sendable handle plus a frame stream.
//!
//! The production implementation is a WebSocket (split sink/stream with a
//! dedicated write task); tests substitute scripted fakes through the same
//! traits.

use async_trait::async_trait;
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::constants::VOICE_GATEWAY_VERSION;
use crate::error::{Result, VoiceError};

/// One received control frame.
#[derive(Debug)]
pub enum ControlFrame {
    Text(String),
    /// The peer closed the channel, optionally with a close code.
    Closed(Option<u16>),
}

/// Cloneable handle for sending text control frames.
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<String>,
}

impl ControlSender {
    /// Builds a sender and the receiving end a transport's write task
    /// drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: String) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| VoiceError::ControlClosed { code: None })
    }
}

/// Inbound half of the control channel.
#[async_trait]
pub trait ControlStream: Send {
    /// Next frame, or `None` once the underlying stream is gone.
    async fn next_frame(&mut self) -> Option<ControlFrame>;
}

/// Opens control channels to a voice endpoint.
#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<(ControlSender, Box<dyn ControlStream>)>;
}

/// Production connector: `wss://{endpoint}/?v={version}`.
pub struct WsConnector;

#[async_trait]
impl ControlConnector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<(ControlSender, Box<dyn ControlStream>)> {
        let url = format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION);
        debug!("connecting voice control socket: {url}");

        let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, read) = ws.split();
        let (sender, mut rx) = ControlSender::channel();

        // Write task exits when the sender side is dropped.
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("control socket write error (expected on reconnect): {e}");
                    break;
                }
            }
        });

        Ok((sender, Box::new(WsStream { read })))
    }
}

struct WsStream {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl ControlStream for WsStream {
    async fn next_frame(&mut self) -> Option<ControlFrame> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(ControlFrame::Text(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Some(ControlFrame::Closed(frame.map(|f| u16::from(f.code))));
                }
                // Ping/pong are handled by the library; binary frames are
                // not part of this protocol version.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("control socket read error: {e}");
                    return None;
                }
                None => return None,
            }
        }
    }
}
