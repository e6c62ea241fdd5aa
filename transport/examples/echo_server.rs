//! Minimal echo server: accepts every connecting peer and sends every payload
//! straight back on the channel it arrived on.
//!
//! Run with `cargo run --example echo_server`, then point a client at UDP port
//! 5056 for the connect handshake.

use std::sync::Arc;

use tracing::info;
use transport::state::DisconnectReason;
use transport::{Application, PeerHandle, Reliability, TransportConfig, UdpTransport};

struct EchoServer;

impl Application for EchoServer {
    fn on_peer_connected(&self, peer: &Arc<PeerHandle>, initial_payload: &[u8], channel: u8) {
        info!(
            "peer {} connected with {} initial bytes",
            peer.peer_id(),
            initial_payload.len()
        );
        peer.attach();
        peer.enqueue(initial_payload, channel, false, Reliability::ReliableSequenced);
    }

    fn on_peer_disconnected(&self, peer: &Arc<PeerHandle>, reason: DisconnectReason, detail: &str) {
        info!("peer {} disconnected: {:?} ({})", peer.peer_id(), reason, detail);
    }

    fn on_payload_received(
        &self,
        peer: &Arc<PeerHandle>,
        payload: &[u8],
        channel: u8,
        encrypt: bool,
        reliability: Reliability,
    ) {
        peer.enqueue(payload, channel, encrypt, reliability);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let transport = UdpTransport::bind(TransportConfig::default_server(), Arc::new(EchoServer)).await?;
    for lane in transport.run() {
        lane.await?;
    }
    Ok(())
}
