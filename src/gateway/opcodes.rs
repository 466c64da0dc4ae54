//! Voice control-channel opcodes.

pub const IDENTIFY: u8 = 0;
pub const SELECT_PROTOCOL: u8 = 1;
pub const READY: u8 = 2;
pub const HEARTBEAT: u8 = 3;
pub const SESSION_DESCRIPTION: u8 = 4;
pub const SPEAKING: u8 = 5;
pub const HEARTBEAT_ACK: u8 = 6;
pub const RESUME: u8 = 7;
pub const HELLO: u8 = 8;
pub const RESUMED: u8 = 9;
pub const CLIENT_CONNECTED: u8 = 12;
pub const CLIENT_DISCONNECTED: u8 = 13;
