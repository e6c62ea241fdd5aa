use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::admission::{
    ConnectRequest, ConnectResponse, ConnectionInfo, EndpointCache, PeerIdPool, PROTOCOL_VERSION,
};
use crate::application::Application;
use crate::config::{
    TransportConfig, MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT, MIN_DISCONNECT_TIMEOUT_MS, MIN_MTU,
};
use crate::lane::{self, MonotonicClock};
use crate::peer::{NetworkPeer, PeerHandle};
use crate::pool::PayloadPool;
use crate::security::{derive_key, KeyExchange};
use crate::sink::DatagramSink;

/// Shared admission state: the connection budget, the peer-id free-list and
/// the duplicate-connect cache. Touched by the listener lane and by teardown
/// hooks running on worker lanes, hence the locks.
pub(crate) struct AdmissionState {
    peer_ids: Mutex<PeerIdPool>,
    endpoint_cache: Mutex<EndpointCache>,
    connection_count: AtomicUsize,
    max_connections: usize,
}

/// One worker lane: its socket and the peers it owns. The lane's own task is
/// the only steady-state user of the mutex; the listener lane takes it once
/// per admission to hand a new peer over.
pub(crate) struct Worker {
    pub socket: Arc<UdpSocket>,
    pub port: u16,
    pub lane: Mutex<WorkerLane>,
}

pub(crate) struct WorkerLane {
    pub peers: FxHashMap<u32, NetworkPeer>,
    pub pool: PayloadPool,
}

/// The server transport: one listener socket running the connect handshake and
/// a fixed set of worker sockets carrying peer traffic.
pub struct UdpTransport {
    config: Arc<TransportConfig>,
    application: Arc<dyn Application>,
    listener: Arc<UdpSocket>,
    workers: Vec<Arc<Worker>>,
    next_worker: AtomicUsize,
    admission: Arc<AdmissionState>,
    clock: MonotonicClock,
}

impl UdpTransport {
    pub async fn bind(
        config: TransportConfig,
        application: Arc<dyn Application>,
    ) -> anyhow::Result<Arc<UdpTransport>> {
        config.validate()?;

        let listener = Arc::new(UdpSocket::bind(("0.0.0.0", config.listen_port)).await?);
        info!("listening for connect requests on {:?}", listener.local_addr()?);

        let mut workers = Vec::with_capacity(config.worker_count);
        for i in 0..config.worker_count {
            let port = config.worker_start_port + i as u16;
            let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
            workers.push(Arc::new(Worker {
                socket,
                port,
                lane: Mutex::new(WorkerLane {
                    peers: FxHashMap::default(),
                    pool: PayloadPool::new(
                        config.payload_buffer_bytes,
                        config.max_outstanding_payloads,
                    ),
                }),
            }));
        }
        info!("bound {} worker lanes starting at port {}", config.worker_count, config.worker_start_port);

        let admission = Arc::new(AdmissionState {
            peer_ids: Mutex::new(PeerIdPool::new(config.max_connections)),
            endpoint_cache: Mutex::new(EndpointCache::new(
                config.endpoint_cache_timeout_ms,
                config.endpoint_cache_cleanup_interval_ms,
            )),
            connection_count: AtomicUsize::new(0),
            max_connections: config.max_connections,
        });

        Ok(Arc::new(UdpTransport {
            config: Arc::new(config),
            application,
            listener,
            workers,
            next_worker: AtomicUsize::new(0),
            admission,
            clock: MonotonicClock::new(),
        }))
    }

    /// Spawns the listener and worker lane tasks.
    pub fn run(self: &Arc<UdpTransport>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(1 + self.workers.len());
        handles.push(tokio::spawn(lane::run_listener(self.clone())));
        for worker in &self.workers {
            handles.push(tokio::spawn(lane::run_worker(
                self.config.clone(),
                worker.clone(),
                self.clock.clone(),
            )));
        }
        handles
    }

    pub(crate) fn listener_socket(&self) -> &Arc<UdpSocket> {
        &self.listener
    }

    pub(crate) fn clock(&self) -> &MonotonicClock {
        &self.clock
    }

    pub(crate) fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.admission.connection_count.load(Ordering::Relaxed)
    }

    /// The listener-side admission path. Every validation failure is a silent
    /// drop: no response means no reflection surface for probes.
    pub(crate) fn handle_connect(&self, now: u64, from: SocketAddr, packet: &[u8]) {
        // a client retrying over a lossy link gets the cached answer instead
        // of a second peer
        let cached = self.admission.endpoint_cache.lock().unwrap().lookup(now, from);
        if let Some(info) = cached {
            let Ok(request) = ConnectRequest::decode(packet) else {
                return;
            };
            if request.version != PROTOCOL_VERSION {
                return;
            }
            debug!("repeating connect response for {:?}", from);
            self.send_connect_response(from, &info, request.client_time, now);
            return;
        }

        let request = match ConnectRequest::decode(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!("undecodable connect request from {:?}: {}", from, e);
                return;
            }
        };
        if request.version != PROTOCOL_VERSION {
            debug!(
                "connect request from {:?} with unsupported version {}",
                from, request.version
            );
            return;
        }
        if request.crc_enabled && !request.checksum_ok(packet) {
            debug!("connect request from {:?} failed its checksum", from);
            return;
        }
        if self.admission.connection_count.load(Ordering::Acquire) >= self.admission.max_connections
        {
            debug!("connection table full, dropping connect from {:?}", from);
            return;
        }

        let exchange = KeyExchange::generate();
        let server_public_key = exchange.public_bytes();
        let shared_secret = match exchange.derive_shared_secret(&request.client_public_key) {
            Ok(secret) => secret,
            Err(e) => {
                debug!("connect request from {:?} with unusable public key: {}", from, e);
                return;
            }
        };
        let secret_key = derive_key(&shared_secret);

        let Some(peer_id) = self.admission.peer_ids.lock().unwrap().acquire() else {
            // the pool is sized past the connection cap, so this is an
            // accounting bug rather than load
            error!("peer id pool exhausted below connection capacity - dropping connect");
            return;
        };
        self.admission.connection_count.fetch_add(1, Ordering::AcqRel);

        let channel_count = request.channel_count.clamp(MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT);
        let receive_cap = self.config.receive_buffer_bytes.min(u16::MAX as usize) as u16;
        let mtu = request.mtu.max(MIN_MTU).min(receive_cap) as usize;
        let disconnect_timeout_ms =
            request.disconnect_timeout_ms.max(MIN_DISCONNECT_TIMEOUT_MS) as u64;

        let worker = self.pick_worker();
        let handle = Arc::new(PeerHandle::new(peer_id, channel_count, mtu, secret_key));
        let mut peer = NetworkPeer::new(
            handle,
            self.application.clone(),
            from,
            request.crc_enabled,
            disconnect_timeout_ms,
            self.config.send_interval_ms,
            now,
        );

        let admission = self.admission.clone();
        peer.on_teardown(Box::new(move || {
            admission.peer_ids.lock().unwrap().release(peer_id);
            admission.connection_count.fetch_sub(1, Ordering::AcqRel);
        }));

        // the one cross-lane touch: hand the peer to its owning worker before
        // that lane ever hears about it
        worker.lane.lock().unwrap().peers.insert(peer_id, peer);

        let info = ConnectionInfo {
            peer_id,
            server_public_key,
            worker_port: worker.port,
        };
        self.admission
            .endpoint_cache
            .lock()
            .unwrap()
            .insert(now, from, info.clone());

        info!(
            "accepted peer {} from {:?} on worker port {} ({} channels, mtu {})",
            peer_id, from, worker.port, channel_count, mtu
        );
        self.send_connect_response(from, &info, request.client_time, now);
    }

    fn pick_worker(&self) -> &Arc<Worker> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[index]
    }

    fn send_connect_response(
        &self,
        to: SocketAddr,
        info: &ConnectionInfo,
        client_time: u64,
        now: u64,
    ) {
        let response = ConnectResponse {
            peer_id: info.peer_id,
            server_public_key: info.server_public_key.to_vec(),
            worker_port: info.worker_port,
            client_time,
            server_time: now,
        };
        self.listener.send_datagram(to, &response.encode());
    }
}
