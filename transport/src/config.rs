use anyhow::bail;

/// Peers negotiate their channel count at connect time; it is clamped into
/// this range.
pub const MIN_CHANNEL_COUNT: u16 = 5;
pub const MAX_CHANNEL_COUNT: u16 = 100;

/// Lower bound for the MTU a client may negotiate. Anything smaller leaves no
/// usable room next to the envelope and fragment headers.
pub const MIN_MTU: u16 = 400;

/// Lower bound for the negotiated disconnect timeout, so a bogus client value
/// cannot make its own connection flap.
pub const MIN_DISCONNECT_TIMEOUT_MS: u32 = 1000;

pub struct TransportConfig {
    /// Port of the listener socket that handles connect requests.
    pub listen_port: u16,

    /// Worker sockets bind consecutive ports starting here; accepted peers are
    /// assigned round-robin and told their worker port in the connect response.
    pub worker_start_port: u16,
    pub worker_count: usize,

    /// Hard cap on concurrently admitted connections.
    pub max_connections: usize,

    /// Pacing interval of the send tick. A peer flushes its queues at most
    /// once per interval, whatever the reactor's own cadence is.
    pub send_interval_ms: u64,

    /// How long a cached connect response keeps answering duplicate connect
    /// requests from the same address, and how often the cache is purged.
    pub endpoint_cache_timeout_ms: u64,
    pub endpoint_cache_cleanup_interval_ms: u64,

    /// Sizing of the per-lane payload pool: capacity of one pooled buffer and
    /// the number of payloads that may be outstanding before the lane starts
    /// shedding packets.
    pub payload_buffer_bytes: usize,
    pub max_outstanding_payloads: usize,

    /// Size of the datagram read buffer per lane; bounds the largest packet
    /// that can be received.
    pub receive_buffer_bytes: usize,
}

impl TransportConfig {
    pub fn default_server() -> TransportConfig {
        TransportConfig {
            listen_port: 5056,
            worker_start_port: 5057,
            worker_count: 2,
            max_connections: 2000,
            send_interval_ms: 20,
            endpoint_cache_timeout_ms: 2000,
            endpoint_cache_cleanup_interval_ms: 1000,
            payload_buffer_bytes: 2048,
            max_outstanding_payloads: 4096,
            receive_buffer_bytes: 2048,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            bail!("at least one worker lane is required");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be positive");
        }
        if self.send_interval_ms == 0 {
            bail!("send interval must be positive");
        }
        let worker_ports =
            self.worker_start_port..self.worker_start_port.saturating_add(self.worker_count as u16);
        if worker_ports.contains(&self.listen_port) {
            bail!(
                "listen port {} collides with the worker port range",
                self.listen_port
            );
        }
        if self.receive_buffer_bytes < MIN_MTU as usize {
            bail!("receive buffer must hold at least one minimum-MTU packet");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TransportConfig::default_server().validate().is_ok());
    }

    #[test]
    fn test_rejects_colliding_ports() {
        let mut config = TransportConfig::default_server();
        config.listen_port = config.worker_start_port + 1;
        config.worker_count = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = TransportConfig::default_server();
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }
}
