//! Control-channel wire frames: `{op, d}` JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::NON_RESUMABLE_CLOSE_CODES;
use crate::crypto::EncryptionMode;
use crate::error::Result;
use crate::types::{GuildId, SessionId, UserId};

#[derive(Serialize, Deserialize, Debug)]
pub struct GatewayMessage {
    pub op: u8,
    pub d: Value,
}

impl GatewayMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Whether a session that closed with `code` may be resumed, or must
/// re-Identify from scratch.
pub fn can_resume(code: u16) -> bool {
    !NON_RESUMABLE_CLOSE_CODES.contains(&code)
}

// ── Inbound payloads ─────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
pub struct HelloPayload {
    pub heartbeat_interval: f64,
}

#[derive(Deserialize, Debug)]
pub struct ReadyPayload {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Deserialize, Debug)]
pub struct SessionDescriptionPayload {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Deserialize, Debug)]
pub struct SpeakingPayload {
    pub ssrc: u32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub speaking: Value,
}

impl SpeakingPayload {
    pub fn is_speaking(&self) -> bool {
        match &self.speaking {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    pub fn user(&self) -> Option<UserId> {
        self.user_id
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .map(UserId)
    }
}

#[derive(Deserialize, Debug)]
pub struct ClientConnectedPayload {
    pub user_id: String,
    pub audio_ssrc: u32,
}

#[derive(Deserialize, Debug)]
pub struct ClientDisconnectedPayload {
    pub user_id: String,
}

/// Heartbeat acks echo the nonce back, either bare or wrapped in the
/// heartbeat object.
pub fn heartbeat_ack_nonce(d: &Value) -> Option<u64> {
    d.as_u64().or_else(|| d.get("t").and_then(Value::as_u64))
}

pub fn parse_snowflake(s: &str) -> Option<UserId> {
    s.parse::<u64>().ok().map(UserId)
}

// ── Outbound frames ───────────────────────────────────────────────────────────

pub fn identify_frame(
    guild_id: GuildId,
    user_id: UserId,
    session_id: &SessionId,
    token: &str,
) -> Result<String> {
    GatewayMessage {
        op: super::opcodes::IDENTIFY,
        d: serde_json::json!({
            "server_id": guild_id.to_string(),
            "user_id": user_id.to_string(),
            "session_id": session_id.0,
            "token": token,
        }),
    }
    .to_frame()
}

pub fn resume_frame(guild_id: GuildId, session_id: &SessionId, token: &str) -> Result<String> {
    GatewayMessage {
        op: super::opcodes::RESUME,
        d: serde_json::json!({
            "server_id": guild_id.to_string(),
            "session_id": session_id.0,
            "token": token,
        }),
    }
    .to_frame()
}

pub fn heartbeat_frame(nonce: u64) -> Result<String> {
    GatewayMessage {
        op: super::opcodes::HEARTBEAT,
        d: serde_json::json!({ "t": nonce }),
    }
    .to_frame()
}

pub fn select_protocol_frame(address: &str, port: u16, mode: EncryptionMode) -> Result<String> {
    GatewayMessage {
        op: super::opcodes::SELECT_PROTOCOL,
        d: serde_json::json!({
            "protocol": "udp",
            "data": {
                "address": address,
                "port": port,
                "mode": mode.as_str(),
            }
        }),
    }
    .to_frame()
}

pub fn speaking_frame(ssrc: u32, speaking: bool) -> Result<String> {
    GatewayMessage {
        op: super::opcodes::SPEAKING,
        d: serde_json::json!({
            "speaking": if speaking { 1 } else { 0 },
            "delay": 0,
            "ssrc": ssrc,
        }),
    }
    .to_frame()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_policy_table() {
        assert!(!can_resume(4_006));
        assert!(!can_resume(4_009));
        assert!(can_resume(1_006));
        assert!(can_resume(4_015));
    }

    #[test]
    fn speaking_payload_accepts_flags_and_bools() {
        let p: SpeakingPayload =
            serde_json::from_str(r#"{"ssrc": 9, "user_id": "42", "speaking": 5}"#).unwrap();
        assert!(p.is_speaking());
        assert_eq!(p.user(), Some(UserId(42)));

        let p: SpeakingPayload =
            serde_json::from_str(r#"{"ssrc": 9, "speaking": false}"#).unwrap();
        assert!(!p.is_speaking());
        assert_eq!(p.user(), None);
    }

    #[test]
    fn identify_frame_shape() {
        let frame = identify_frame(GuildId(1), UserId(2), &SessionId::from("abc"), "tok").unwrap();
        let msg = GatewayMessage::parse(&frame).unwrap();
        assert_eq!(msg.op, super::super::opcodes::IDENTIFY);
        assert_eq!(msg.d["server_id"], "1");
        assert_eq!(msg.d["session_id"], "abc");
    }

    #[test]
    fn heartbeat_ack_nonce_is_lenient() {
        assert_eq!(heartbeat_ack_nonce(&serde_json::json!(123)), Some(123));
        assert_eq!(heartbeat_ack_nonce(&serde_json::json!({"t": 456})), Some(456));
        assert_eq!(heartbeat_ack_nonce(&serde_json::json!("x")), None);
    }
}
