use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::command::CommandKind;
use crate::config::TransportConfig;
use crate::endpoint::{UdpTransport, Worker, WorkerLane};
use crate::state::ConnectionState;

/// Wall-clock-free time source shared by all lanes, so the timestamps passed
/// into the core tick forward monotonically from one common epoch. The core
/// itself never reads a clock.
#[derive(Clone)]
pub(crate) struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// The listener lane: every datagram on the listen port is a connect attempt
/// and goes through the admission path.
pub(crate) async fn run_listener(transport: Arc<UdpTransport>) {
    let clock = transport.clock().clone();
    let mut buf = vec![0u8; transport.config().receive_buffer_bytes];
    info!("listener lane running");

    loop {
        match transport.listener_socket().recv_from(&mut buf).await {
            Ok((len, from)) => {
                transport.handle_connect(clock.now_ms(), from, &buf[..len]);
            }
            Err(e) => {
                error!("listener socket error: {}", e);
            }
        }
    }
}

/// A worker lane: owns its peers exclusively, alternating between dispatching
/// received datagrams and the fixed-rate send tick. All per-peer state is only
/// ever touched from here.
pub(crate) async fn run_worker(
    config: Arc<TransportConfig>,
    worker: Arc<Worker>,
    clock: MonotonicClock,
) {
    let mut tick = interval(Duration::from_millis(config.send_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; config.receive_buffer_bytes];
    info!("worker lane running on port {}", worker.port);

    loop {
        select! {
            received = worker.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        dispatch_datagram(&worker, clock.now_ms(), from, &buf[..len]);
                    }
                    Err(e) => {
                        error!("worker socket error on port {}: {}", worker.port, e);
                    }
                }
            }
            _ = tick.tick() => {
                tick_peers(&worker, clock.now_ms());
            }
        }
    }
}

fn dispatch_datagram(worker: &Worker, now: u64, from: SocketAddr, packet: &[u8]) {
    if packet.len() < 5 || packet[0] != u8::from(CommandKind::Messages) {
        trace!("ignoring stray datagram from {:?}", from);
        return;
    }
    let peer_id = u32::from_be_bytes(packet[1..5].try_into().expect("length checked"));

    let mut lane = worker.lane.lock().unwrap();
    let WorkerLane { peers, pool } = &mut *lane;
    let Some(peer) = peers.get_mut(&peer_id) else {
        trace!("datagram for unknown peer {} from {:?}", peer_id, from);
        return;
    };
    peer.on_receive(now, from, packet, pool);
}

fn tick_peers(worker: &Worker, now: u64) {
    let mut lane = worker.lane.lock().unwrap();
    let WorkerLane { peers, pool } = &mut *lane;

    pool.drain_foreign();

    for peer in peers.values_mut() {
        peer.send_tick(now, &worker.socket);
    }

    peers.retain(|peer_id, peer| {
        if peer.state() == ConnectionState::Disconnected {
            debug!("releasing peer {}", peer_id);
            peer.dispose();
            false
        } else {
            true
        }
    });
}
