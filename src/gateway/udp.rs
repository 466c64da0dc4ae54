//! Datagram seam, NAT discovery, and keepalive bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::constants::{
    DISCOVERY_PACKET_LEN, DISCOVERY_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_PACKET_LEN,
};
use crate::error::{Result, VoiceError};

/// Connected datagram socket carrying media packets.
#[async_trait]
pub trait MediaSocket: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<usize>;
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Opens media sockets towards a `host:port` endpoint.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn MediaSocket>>;
}

/// Production connector: an ephemeral UDP socket connected to the voice
/// server.
pub struct UdpConnector;

#[async_trait]
impl MediaConnector for UdpConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn MediaSocket>> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!("voice media socket connected to {addr}");
        Ok(Arc::new(UdpMediaSocket { socket }))
    }
}

pub struct UdpMediaSocket {
    socket: tokio::net::UdpSocket,
}

#[async_trait]
impl MediaSocket for UdpMediaSocket {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send(buf).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.recv(buf).await?)
    }
}

// ── IP discovery ─────────────────────────────────────────────────────────────

/// 70-byte probe: the assigned source id up front, zero-filled tail.
pub fn encode_discovery_probe(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    BigEndian::write_u32(&mut packet[..4], ssrc);
    packet
}

/// 70-byte reply: 4 ignored bytes, a null-padded UTF-8 address in bytes
/// 4..68, a little-endian port in bytes 68..70.
pub fn parse_discovery_reply(buf: &[u8]) -> Result<(String, u16)> {
    if buf.len() < DISCOVERY_PACKET_LEN {
        return Err(VoiceError::MalformedPacket("discovery reply too short"));
    }
    let address = std::str::from_utf8(&buf[4..68])
        .map_err(|_| VoiceError::MalformedPacket("discovery address not UTF-8"))?
        .trim_matches('\0')
        .to_string();
    if address.is_empty() {
        return Err(VoiceError::MalformedPacket("empty discovery address"));
    }
    let port = LittleEndian::read_u16(&buf[68..70]);
    Ok((address, port))
}

/// Sends one probe and waits (bounded) for exactly one reply to learn
/// the externally visible address.
pub async fn discover_external_address(
    socket: &dyn MediaSocket,
    ssrc: u32,
) -> Result<(String, u16)> {
    socket.send(&encode_discovery_probe(ssrc)).await?;

    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| VoiceError::HandshakeFailed("ip discovery reply timed out".into()))??;
    parse_discovery_reply(&buf[..n])
}

// ── Keepalive ─────────────────────────────────────────────────────────────────

pub fn encode_keepalive(id: u64) -> [u8; KEEPALIVE_PACKET_LEN] {
    let mut buf = [0u8; KEEPALIVE_PACKET_LEN];
    LittleEndian::write_u64(&mut buf, id);
    buf
}

pub fn parse_keepalive(buf: &[u8]) -> Option<u64> {
    (buf.len() == KEEPALIVE_PACKET_LEN).then(|| LittleEndian::read_u64(buf))
}

/// Tracks outstanding keepalive ids. Entries removed on echo; entries
/// that never get a reply stay (informational metric, not a liveness
/// detector).
pub struct KeepaliveTracker {
    counter: AtomicU64,
    pending: DashMap<u64, Instant>,
    last_rtt: parking_lot::Mutex<Option<Duration>>,
}

impl KeepaliveTracker {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            pending: DashMap::new(),
            last_rtt: parking_lot::Mutex::new(None),
        }
    }

    /// Claims the next id and records its send time.
    pub fn begin(&self) -> u64 {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id, Instant::now());
        id
    }

    /// Matches an echoed id against its send time.
    pub fn acknowledge(&self, id: u64) -> Option<Duration> {
        let (_, sent) = self.pending.remove(&id)?;
        let rtt = sent.elapsed();
        *self.last_rtt.lock() = Some(rtt);
        Some(rtt)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock()
    }
}

impl Default for KeepaliveTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-interval keepalive sender; the receive loop consumes the echoes.
pub(crate) async fn run_keepalive(
    socket: Arc<dyn MediaSocket>,
    tracker: Arc<KeepaliveTracker>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let id = tracker.begin();
        if let Err(e) = socket.send(&encode_keepalive(id)).await {
            debug!("keepalive send failed: {e}");
        } else {
            trace!("keepalive {id} sent");
        }
    }
}
