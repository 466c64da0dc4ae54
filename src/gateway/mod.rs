//! Voice gateway: control-channel protocol, media loops, and the
//! per-guild connection driver.

pub mod connection;
pub mod events;
pub mod opcodes;
pub mod payloads;
pub mod receiver;
pub mod sender;
pub mod transport;
pub mod udp;

pub use connection::{ConnectionConfig, ConnectionState, VoiceConnection};
pub use events::{EventBus, ReceivedAudio, VoiceEvent};
pub use receiver::{ReceivePipeline, Sources};
pub use sender::{PauseGate, VoiceSender};
pub use transport::{ControlConnector, ControlFrame, ControlSender, ControlStream, WsConnector};
pub use udp::{KeepaliveTracker, MediaConnector, MediaSocket, UdpConnector};
