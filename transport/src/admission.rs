use std::net::SocketAddr;

use anyhow::bail;
use bytes::{Buf, BufMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::checksum::{self, CHECKSUM_LEN};
use crate::command::CommandKind;
use crate::security::PUBLIC_KEY_LEN;

/// Version of the connect handshake. Requests with any other version are
/// dropped without a response.
pub const PROTOCOL_VERSION: u32 = 2;

/// A client's connect request.
///
/// Wire layout: `[1B connect][4B version][8B client timestamp]
/// [2B channel count][2B mtu][4B disconnect timeout][2B crc flag]
/// [1B key length][key bytes][8B checksum]`. The checksum field is always
/// present and verified only when the crc flag is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub version: u32,
    pub client_time: u64,
    pub channel_count: u16,
    pub mtu: u16,
    pub disconnect_timeout_ms: u32,
    pub crc_enabled: bool,
    pub client_public_key: Vec<u8>,
}

impl ConnectRequest {
    pub fn decode(packet: &[u8]) -> anyhow::Result<ConnectRequest> {
        let mut buf = packet;
        if buf.remaining() < 24 {
            bail!("truncated connect request");
        }
        if buf.get_u8() != u8::from(CommandKind::Connect) {
            bail!("not a connect request");
        }
        let version = buf.get_u32();
        let client_time = buf.get_u64();
        let channel_count = buf.get_u16();
        let mtu = buf.get_u16();
        let disconnect_timeout_ms = buf.get_u32();
        let crc_enabled = buf.get_u16() > 0;
        let key_len = buf.get_u8() as usize;
        if buf.remaining() < key_len + CHECKSUM_LEN {
            bail!("connect request shorter than its declared key");
        }
        let client_public_key = buf[..key_len].to_vec();

        Ok(ConnectRequest {
            version,
            client_time,
            channel_count,
            mtu,
            disconnect_timeout_ms,
            crc_enabled,
            client_public_key,
        })
    }

    /// Verifies the request checksum against the packet it was decoded from.
    /// Meaningful only when the request's crc flag is set; the admission path
    /// checks the flag first (after the version, matching the drop order).
    pub fn checksum_ok(&self, packet: &[u8]) -> bool {
        checksum::verify(packet, 24 + self.client_public_key.len())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.client_public_key.len() + CHECKSUM_LEN);
        buf.put_u8(CommandKind::Connect.into());
        buf.put_u32(self.version);
        buf.put_u64(self.client_time);
        buf.put_u16(self.channel_count);
        buf.put_u16(self.mtu);
        buf.put_u32(self.disconnect_timeout_ms);
        buf.put_u16(self.crc_enabled as u16);
        buf.put_u8(self.client_public_key.len() as u8);
        buf.put_slice(&self.client_public_key);
        let checksum_offset = buf.len();
        buf.put_u64(0);
        if self.crc_enabled {
            checksum::write(&mut buf, checksum_offset);
        }
        buf
    }
}

/// The listener's reply to an accepted connect request.
///
/// Wire layout: `[1B connect_response][4B peer id][1B key length][key bytes]
/// [4B worker port][8B echoed client timestamp][8B server timestamp]
/// [8B checksum]`. The checksum is always written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub peer_id: u32,
    pub server_public_key: Vec<u8>,
    pub worker_port: u16,
    pub client_time: u64,
    pub server_time: u64,
}

impl ConnectResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(26 + self.server_public_key.len() + CHECKSUM_LEN);
        buf.put_u8(CommandKind::ConnectResponse.into());
        buf.put_u32(self.peer_id);
        buf.put_u8(self.server_public_key.len() as u8);
        buf.put_slice(&self.server_public_key);
        buf.put_u32(self.worker_port as u32);
        buf.put_u64(self.client_time);
        buf.put_u64(self.server_time);
        let checksum_offset = buf.len();
        buf.put_u64(0);
        checksum::write(&mut buf, checksum_offset);
        buf
    }

    pub fn decode(packet: &[u8]) -> anyhow::Result<ConnectResponse> {
        let mut buf = packet;
        if buf.remaining() < 6 {
            bail!("truncated connect response");
        }
        if buf.get_u8() != u8::from(CommandKind::ConnectResponse) {
            bail!("not a connect response");
        }
        let peer_id = buf.get_u32();
        let key_len = buf.get_u8() as usize;
        if buf.remaining() < key_len + 20 + CHECKSUM_LEN {
            bail!("truncated connect response");
        }
        let server_public_key = buf[..key_len].to_vec();
        buf.advance(key_len);
        let worker_port = buf.get_u32() as u16;
        let client_time = buf.get_u64();
        let server_time = buf.get_u64();

        if !checksum::verify(packet, 26 + key_len) {
            bail!("connect response checksum mismatch");
        }

        Ok(ConnectResponse {
            peer_id,
            server_public_key,
            worker_port,
            client_time,
            server_time,
        })
    }
}

/// Handshake result kept around to answer duplicated connect requests: the
/// identity the peer was given and where it was told to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_id: u32,
    pub server_public_key: [u8; PUBLIC_KEY_LEN],
    pub worker_port: u16,
}

/// Answers repeated connect requests from the same address idempotently within
/// a timeout window, so a client retrying over a lossy link does not allocate
/// a second peer. Expired entries are purged lazily on a fixed interval.
pub struct EndpointCache {
    entries: FxHashMap<SocketAddr, (u64, ConnectionInfo)>,
    last_cleanup_at: u64,
    timeout_ms: u64,
    cleanup_interval_ms: u64,
}

impl EndpointCache {
    pub fn new(timeout_ms: u64, cleanup_interval_ms: u64) -> EndpointCache {
        EndpointCache {
            entries: FxHashMap::default(),
            last_cleanup_at: 0,
            timeout_ms,
            cleanup_interval_ms,
        }
    }

    pub fn insert(&mut self, now: u64, address: SocketAddr, info: ConnectionInfo) {
        self.entries.insert(address, (now, info));
    }

    pub fn lookup(&mut self, now: u64, address: SocketAddr) -> Option<ConnectionInfo> {
        if now >= self.last_cleanup_at + self.cleanup_interval_ms {
            self.last_cleanup_at = now;
            let threshold = now.saturating_sub(self.timeout_ms);
            let before = self.entries.len();
            self.entries.retain(|_, (cached_at, _)| *cached_at >= threshold);
            if self.entries.len() != before {
                trace!("purged {} expired connect entries", before - self.entries.len());
            }
        }

        match self.entries.get(&address) {
            Some((cached_at, info)) if now < cached_at + self.timeout_ms => Some(info.clone()),
            _ => None,
        }
    }
}

/// Free-list of reusable peer identifiers, sized at twice the connection
/// capacity. Running dry while the connection table still has room would be an
/// accounting bug, so it is logged loudly; the admission then fails closed.
pub struct PeerIdPool {
    free: std::collections::VecDeque<u32>,
}

impl PeerIdPool {
    pub fn new(max_connections: usize) -> PeerIdPool {
        PeerIdPool {
            free: (1..(max_connections * 2) as u32).collect(),
        }
    }

    pub fn acquire(&mut self) -> Option<u32> {
        let id = self.free.pop_front();
        if id.is_none() {
            debug!("peer id pool exhausted");
        }
        id
    }

    pub fn release(&mut self, peer_id: u32) {
        self.free.push_back(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn request() -> ConnectRequest {
        ConnectRequest {
            version: PROTOCOL_VERSION,
            client_time: 1234,
            channel_count: 8,
            mtu: 1350,
            disconnect_timeout_ms: 5000,
            crc_enabled: true,
            client_public_key: vec![0x11; PUBLIC_KEY_LEN],
        }
    }

    fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[rstest]
    #[case::with_crc(true)]
    #[case::without_crc(false)]
    fn test_connect_request_roundtrip(#[case] crc_enabled: bool) {
        let mut original = request();
        original.crc_enabled = crc_enabled;
        let decoded = ConnectRequest::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_connect_request_checksum_catches_corruption() {
        let mut encoded = request().encode();
        let decoded = ConnectRequest::decode(&encoded).unwrap();
        assert!(decoded.checksum_ok(&encoded));

        encoded[10] ^= 0x01; // inside the client timestamp
        let corrupted = ConnectRequest::decode(&encoded).unwrap();
        assert!(!corrupted.checksum_ok(&encoded));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::wrong_type(vec![6u8; 40])]
    #[case::truncated(request().encode()[..20].to_vec())]
    fn test_connect_request_rejects_garbage(#[case] bytes: Vec<u8>) {
        assert!(ConnectRequest::decode(&bytes).is_err());
    }

    #[test]
    fn test_connect_request_rejects_short_key() {
        let mut encoded = request().encode();
        let declared_pos = 23;
        encoded[declared_pos] = 0xff; // declares a key longer than the packet
        assert!(ConnectRequest::decode(&encoded).is_err());
    }

    #[test]
    fn test_connect_response_roundtrip() {
        let original = ConnectResponse {
            peer_id: 7,
            server_public_key: vec![0x22; PUBLIC_KEY_LEN],
            worker_port: 5057,
            client_time: 1234,
            server_time: 5678,
        };
        let decoded = ConnectResponse::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_connect_response_rejects_corruption() {
        let original = ConnectResponse {
            peer_id: 7,
            server_public_key: vec![0x22; PUBLIC_KEY_LEN],
            worker_port: 5057,
            client_time: 1234,
            server_time: 5678,
        };
        let mut encoded = original.encode();
        encoded[2] ^= 0x01;
        assert!(ConnectResponse::decode(&encoded).is_err());
    }

    fn info(peer_id: u32) -> ConnectionInfo {
        ConnectionInfo {
            peer_id,
            server_public_key: [0x33; PUBLIC_KEY_LEN],
            worker_port: 5057,
        }
    }

    #[test]
    fn test_cache_answers_within_window() {
        let mut cache = EndpointCache::new(2000, 1000);
        cache.insert(100, address(1), info(1));

        assert_eq!(cache.lookup(1500, address(1)), Some(info(1)));
        assert_eq!(cache.lookup(1500, address(2)), None);
    }

    #[test]
    fn test_cache_forgets_after_timeout() {
        let mut cache = EndpointCache::new(2000, 1000);
        cache.insert(100, address(1), info(1));
        assert_eq!(cache.lookup(2101, address(1)), None);
    }

    #[test]
    fn test_cache_purges_lazily() {
        let mut cache = EndpointCache::new(2000, 1000);
        cache.insert(100, address(1), info(1));
        cache.insert(5000, address(2), info(2));

        // the purge at t=5000 drops the stale first entry
        assert_eq!(cache.lookup(5000, address(2)), Some(info(2)));
        assert!(cache.entries.len() == 1);
    }

    #[test]
    fn test_peer_id_pool_exhaustion_and_reuse() {
        let mut pool = PeerIdPool::new(2);

        let mut ids = Vec::new();
        while let Some(id) = pool.acquire() {
            ids.push(id);
        }
        assert_eq!(ids, vec![1, 2, 3]);

        pool.release(2);
        assert_eq!(pool.acquire(), Some(2));
        assert_eq!(pool.acquire(), None);
    }
}
