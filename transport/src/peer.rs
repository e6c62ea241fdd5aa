use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut};
use tracing::{debug, error, trace};

use crate::application::Application;
use crate::channel::{Channel, ChannelLane};
use crate::checksum;
use crate::command::{
    write_envelope, CommandKind, FragmentInfo, IncomingCommand, OutgoingCommand, Reliability,
    ENVELOPE_CHECKSUM_OFFSET, ENVELOPE_LEN, FRAGMENT_HEADER_LEN, MAX_COMMANDS_PER_PACKET,
};
use crate::pool::PayloadPool;
use crate::rtt::RttEstimator;
use crate::sink::DatagramSink;
use crate::state::{ConnectionState, DisconnectReason, StateCell};

const CRC_WARNING_STEP: u64 = 100;

/// A snapshot of the peer's round-trip-time statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttStats {
    pub mean_ms: u64,
    pub deviation_ms: u64,
    pub lowest_ms: u64,
    pub highest_deviation_ms: u64,
}

/// The shared half of a peer: everything an application thread may touch.
///
/// The owning lane holds the other half ([`NetworkPeer`]); the only
/// synchronized hand-over between the two is the channels' queue swap, plus
/// the atomic state cell and RTT mirrors.
pub struct PeerHandle {
    peer_id: u32,
    state: StateCell,
    channels: Box<[Channel]>,
    mtu: usize,
    secret_key: [u8; 32],
    pending_disconnect: Mutex<Option<(DisconnectReason, String)>>,

    rtt_mean_ms: AtomicU64,
    rtt_deviation_ms: AtomicU64,
    lowest_rtt_ms: AtomicU64,
    highest_rtt_deviation_ms: AtomicU64,
}

impl PeerHandle {
    pub fn new(peer_id: u32, channel_count: u16, mtu: usize, secret_key: [u8; 32]) -> PeerHandle {
        let channels = (0..channel_count)
            .map(|index| Channel::new(index as u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let state = StateCell::new(ConnectionState::Disconnected);
        state.transition_to(ConnectionState::Connecting);

        let rtt = RttEstimator::new();
        PeerHandle {
            peer_id,
            state,
            channels,
            mtu,
            secret_key,
            pending_disconnect: Mutex::new(None),
            rtt_mean_ms: AtomicU64::new(rtt.mean_ms()),
            rtt_deviation_ms: AtomicU64::new(rtt.deviation_ms()),
            lowest_rtt_ms: AtomicU64::new(rtt.lowest_ms()),
            highest_rtt_deviation_ms: AtomicU64::new(rtt.highest_deviation_ms()),
        }
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// The symmetric key derived from the handshake, for the application's
    /// payload cipher.
    pub fn secret_key(&self) -> &[u8; 32] {
        &self.secret_key
    }

    /// Accepts a connecting peer: the application calls this from
    /// `on_peer_connected` to attach its logic to the connection.
    pub fn attach(&self) -> bool {
        self.state.transition_to(ConnectionState::Connected)
    }

    /// Queues an application payload for sending. Payloads too large for one
    /// datagram are split into a reliable fragment group. Returns false if the
    /// peer is not connected, the channel does not exist, or the channel is
    /// over its backpressure cap.
    pub fn enqueue(
        &self,
        payload: &[u8],
        channel_index: u8,
        encrypt: bool,
        reliability: Reliability,
    ) -> bool {
        if self.state.get() != ConnectionState::Connected {
            debug!(
                "peer {}: not connected ({:?}), rejecting send",
                self.peer_id,
                self.state.get()
            );
            return false;
        }
        self.enqueue_on_channel(payload, channel_index, encrypt, reliability)
    }

    fn enqueue_on_channel(
        &self,
        payload: &[u8],
        channel_index: u8,
        encrypt: bool,
        reliability: Reliability,
    ) -> bool {
        let Some(channel) = self.channels.get(channel_index as usize) else {
            debug!("peer {}: channel {} does not exist", self.peer_id, channel_index);
            return false;
        };

        let max_fragment_payload = self.max_fragment_payload();
        if payload.len() < max_fragment_payload {
            let kind = match reliability {
                Reliability::ReliableSequenced => CommandKind::Reliable,
                Reliability::UnreliableSequenced => CommandKind::Unreliable,
            };
            return channel.enqueue(OutgoingCommand::new(
                kind,
                channel_index,
                payload.to_vec(),
                encrypt,
            ));
        }

        // oversized payloads always travel as a reliable fragment group,
        // whatever reliability was asked for
        let Ok(total_len) = u32::try_from(payload.len()) else {
            debug!("peer {}: payload of {} bytes is not sendable", self.peer_id, payload.len());
            return false;
        };
        let count = payload.len().div_ceil(max_fragment_payload);
        let Ok(count) = u16::try_from(count) else {
            debug!("peer {}: payload needs {} fragments, too many", self.peer_id, count);
            return false;
        };

        let fragments = payload
            .chunks(max_fragment_payload)
            .enumerate()
            .map(|(index, chunk)| {
                OutgoingCommand::fragment(
                    channel_index,
                    chunk.to_vec(),
                    encrypt,
                    FragmentInfo {
                        start_sequence: 0, // stamped by the channel
                        count,
                        index: index as u16,
                        total_len,
                        offset: (index * max_fragment_payload) as u32,
                    },
                )
            })
            .collect();
        channel.enqueue_fragments(fragments)
    }

    /// Initiates the disconnect handshake: queues a disconnect command and
    /// moves to `Disconnecting`. The peer ends up `Disconnected` once the
    /// command has been flushed to the wire.
    pub fn disconnect(&self, reason: DisconnectReason, detail: &str) {
        let state = self.state.get();
        if state == ConnectionState::Disconnected || state == ConnectionState::Disconnecting {
            return;
        }

        let detail = if detail.is_empty() { "unknown" } else { detail };
        let mut payload = Vec::with_capacity(8 + detail.len());
        payload.put_u32(u32::from(reason));
        payload.put_u32(detail.len() as u32);
        payload.put_slice(detail.as_bytes());

        // the disconnect command travels best-effort on the last channel; if
        // it gets lost, the peer's own timeout finishes the job
        let last_channel = self.channels.len() as u8 - 1;
        if let Some(channel) = self.channels.get(last_channel as usize) {
            channel.enqueue(OutgoingCommand::new(
                CommandKind::Disconnect,
                last_channel,
                payload,
                false,
            ));
        }

        self.pending_disconnect
            .lock()
            .unwrap()
            .get_or_insert_with(|| (reason, detail.to_string()));
        self.state.transition_to(ConnectionState::Disconnecting);
    }

    pub fn rtt_stats(&self) -> RttStats {
        RttStats {
            mean_ms: self.rtt_mean_ms.load(Ordering::Relaxed),
            deviation_ms: self.rtt_deviation_ms.load(Ordering::Relaxed),
            lowest_ms: self.lowest_rtt_ms.load(Ordering::Relaxed),
            highest_deviation_ms: self.highest_rtt_deviation_ms.load(Ordering::Relaxed),
        }
    }

    fn max_fragment_payload(&self) -> usize {
        self.mtu - (ENVELOPE_LEN + FRAGMENT_HEADER_LEN)
    }

    fn store_rtt(&self, rtt: &RttEstimator) {
        self.rtt_mean_ms.store(rtt.mean_ms(), Ordering::Relaxed);
        self.rtt_deviation_ms.store(rtt.deviation_ms(), Ordering::Relaxed);
        self.lowest_rtt_ms.store(rtt.lowest_ms(), Ordering::Relaxed);
        self.highest_rtt_deviation_ms
            .store(rtt.highest_deviation_ms(), Ordering::Relaxed);
    }

    fn take_pending_disconnect(&self) -> Option<(DisconnectReason, String)> {
        self.pending_disconnect.lock().unwrap().take()
    }

    fn force_disconnected(&self) -> bool {
        self.state.transition_to(ConnectionState::Disconnected)
    }
}

/// The lane-owned half of a peer: the receive path, delivery loop, ack
/// synthesis, retransmission bookkeeping and the MTU-budgeted datagram
/// assembly. Exactly one lane ever calls into a given `NetworkPeer`.
pub struct NetworkPeer {
    handle: Arc<PeerHandle>,
    application: Arc<dyn Application>,

    address: SocketAddr,
    crc_enabled: bool,
    disconnect_timeout_ms: u64,
    send_interval_ms: u64,

    rtt: RttEstimator,
    lanes: Vec<ChannelLane>,
    reliable_standby: Vec<std::collections::VecDeque<OutgoingCommand>>,
    unreliable_standby: Vec<std::collections::VecDeque<OutgoingCommand>>,
    pending_acks: std::collections::VecDeque<OutgoingCommand>,

    last_receive_at: u64,
    last_send_at: u64,
    crc_drop_count: u64,
    shed_packet_count: u64,

    teardown: Vec<Box<dyn FnOnce() + Send>>,
    disposed: bool,
}

impl NetworkPeer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Arc<PeerHandle>,
        application: Arc<dyn Application>,
        address: SocketAddr,
        crc_enabled: bool,
        disconnect_timeout_ms: u64,
        send_interval_ms: u64,
        now: u64,
    ) -> NetworkPeer {
        let channel_count = handle.channels.len();
        NetworkPeer {
            handle,
            application,
            address,
            crc_enabled,
            disconnect_timeout_ms,
            send_interval_ms,
            rtt: RttEstimator::new(),
            lanes: (0..channel_count).map(|i| ChannelLane::new(i as u8)).collect(),
            reliable_standby: (0..channel_count).map(|_| Default::default()).collect(),
            unreliable_standby: (0..channel_count).map(|_| Default::default()).collect(),
            pending_acks: Default::default(),
            last_receive_at: now,
            last_send_at: 0,
            crc_drop_count: 0,
            shed_packet_count: 0,
            teardown: Vec::new(),
            disposed: false,
        }
    }

    pub fn handle(&self) -> &Arc<PeerHandle> {
        &self.handle
    }

    pub fn peer_id(&self) -> u32 {
        self.handle.peer_id
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Registers a cleanup hook run exactly once at teardown (peer-id release,
    /// connection accounting, removal from the lane's table).
    pub fn on_teardown(&mut self, hook: Box<dyn FnOnce() + Send>) {
        self.teardown.push(hook);
    }

    pub fn disconnect(&self, reason: DisconnectReason, detail: &str) {
        self.handle.disconnect(reason, detail);
    }

    /// Processes one incoming datagram. `packet` is the whole datagram as
    /// received, starting at the command-class byte.
    pub fn on_receive(&mut self, now: u64, from: SocketAddr, packet: &[u8], pool: &mut PayloadPool) {
        if self.handle.state() == ConnectionState::Disconnected {
            return;
        }

        // follow the peer through NAT rebinding
        if self.address != from {
            debug!("peer {}: address changed {:?} -> {:?}", self.peer_id(), self.address, from);
            self.address = from;
        }

        if packet.len() < ENVELOPE_LEN {
            self.disconnect(DisconnectReason::InvalidDataFormat, "truncated packet envelope");
            return;
        }

        let mut header = &packet[5..];
        let sender_time = header.get_u64();
        let command_count = header.get_u16();

        if self.crc_enabled && !checksum::verify(packet, ENVELOPE_CHECKSUM_OFFSET) {
            self.crc_drop_count += 1;
            if self.crc_drop_count % CRC_WARNING_STEP == 0 {
                debug!(
                    "peer {}: {} packets dropped on checksum mismatch",
                    self.peer_id(),
                    self.crc_drop_count
                );
            }
            return;
        }

        if command_count == 0 || command_count > MAX_COMMANDS_PER_PACKET {
            self.disconnect(DisconnectReason::InvalidDataFormat, "invalid command count");
            return;
        }

        self.last_receive_at = now;

        // decode the whole packet before routing anything: a single garbled
        // command poisons the packet and the connection
        let mut commands = Vec::with_capacity(command_count as usize);
        let mut cursor = &packet[ENVELOPE_LEN..];
        for _ in 0..command_count {
            match IncomingCommand::decode(now, pool, &mut cursor) {
                Err(e) => {
                    debug!("peer {}: dropping garbled packet: {}", self.peer_id(), e);
                    self.disconnect(DisconnectReason::InvalidDataFormat, "unparseable command");
                    return;
                }
                Ok(None) => {
                    self.shed_packet_count += 1;
                    debug!(
                        "peer {}: payload pool exhausted, {} packets shed so far",
                        self.peer_id(),
                        self.shed_packet_count
                    );
                    return;
                }
                Ok(Some(command)) => {
                    // acks are synthesized eagerly, before any duplicate or
                    // staleness checks, so the sender can always retire
                    if command.is_reliable() {
                        self.pending_acks.push_back(OutgoingCommand::ack(
                            command.channel,
                            command.reliable_sequence,
                            sender_time,
                        ));
                    }
                    commands.push(command);
                }
            }
        }

        let mut touched: Vec<usize> = Vec::new();
        for command in commands {
            match command.kind {
                CommandKind::Ack => self.handle_ack(command),
                CommandKind::Disconnect => {
                    self.handle_remote_disconnect(command);
                    return;
                }
                CommandKind::Ping
                | CommandKind::ServerTime
                | CommandKind::Reliable
                | CommandKind::Unreliable
                | CommandKind::Fragment => {
                    let state = self.handle.state();
                    if state == ConnectionState::Disconnected
                        || state == ConnectionState::Disconnecting
                    {
                        continue;
                    }
                    let index = command.channel as usize;
                    let Some(lane) = self.lanes.get_mut(index) else {
                        debug!("peer {}: command for unknown channel {}", self.handle.peer_id, command.channel);
                        continue;
                    };
                    if lane.insert_incoming(command) && !touched.contains(&index) {
                        touched.push(index);
                    }
                }
                CommandKind::Messages | CommandKind::Connect | CommandKind::ConnectResponse => {
                    self.disconnect(DisconnectReason::InvalidDataFormat, "unexpected command type");
                    return;
                }
            }
        }

        for index in touched {
            self.drain_channel(index, pool);
        }
    }

    fn drain_channel(&mut self, index: usize, pool: &mut PayloadPool) {
        while let Some(command) = self.lanes[index].try_deliver_next(pool) {
            match command.kind {
                CommandKind::Reliable | CommandKind::Unreliable | CommandKind::Fragment => {
                    self.forward_to_application(command);
                }
                // keep-alives advance the channel and get acked, nothing more
                CommandKind::Ping | CommandKind::ServerTime => {}
                _ => {}
            }
            if self.handle.state() == ConnectionState::Disconnected {
                return;
            }
        }
    }

    fn forward_to_application(&mut self, mut command: IncomingCommand) {
        let payload = command.payload.take();
        let bytes: &[u8] = payload.as_deref().unwrap_or(&[]);

        match self.handle.state() {
            ConnectionState::Connecting => {
                self.application
                    .on_peer_connected(&self.handle, bytes, command.channel);
                if self.handle.state() != ConnectionState::Connected {
                    debug!(
                        "peer {}: application did not attach, disconnecting",
                        self.peer_id()
                    );
                    self.disconnect(DisconnectReason::ServerDisconnect, "peer was not attached");
                }
            }
            ConnectionState::Connected => {
                let reliability = if command.is_reliable() {
                    Reliability::ReliableSequenced
                } else {
                    Reliability::UnreliableSequenced
                };
                self.application.on_payload_received(
                    &self.handle,
                    bytes,
                    command.channel,
                    command.is_encrypted(),
                    reliability,
                );
            }
            _ => {}
        }
    }

    fn handle_ack(&mut self, command: IncomingCommand) {
        let Some(lane) = self.lanes.get_mut(command.channel as usize) else {
            return;
        };
        if lane.retire_acked(command.acked_sequence).is_some() {
            let sample = command.received_at.saturating_sub(command.ack_send_time);
            trace!(
                "peer {}: ack ch[{}] seq[{}] rtt[{}]",
                self.handle.peer_id,
                command.channel,
                command.acked_sequence,
                sample
            );
            self.rtt.on_sample(sample);
            self.handle.store_rtt(&self.rtt);
        }
    }

    fn handle_remote_disconnect(&mut self, command: IncomingCommand) {
        let (reason, detail) = decode_disconnect_payload(command.payload.as_deref().unwrap_or(&[]));
        debug!(
            "peer {}: remote disconnect, reason {:?}",
            self.peer_id(),
            reason
        );
        self.handle.force_disconnected();
        self.application
            .on_peer_disconnected(&self.handle, reason, &detail);
        self.dispose();
    }

    /// The periodic send tick: timeout detection, retransmission scan, queue
    /// snapshot and MTU-budgeted datagram assembly. A single tick emits as
    /// many datagrams as the queued traffic needs.
    pub fn send_tick(&mut self, now: u64, sink: &dyn DatagramSink) {
        if self.handle.state() == ConnectionState::Disconnected {
            return;
        }

        if self.last_send_at + self.send_interval_ms > now {
            return;
        }
        self.last_send_at = now;

        if now > self.last_receive_at + self.disconnect_timeout_ms {
            debug!(
                "peer {}: nothing received for {} ms, disconnecting",
                self.peer_id(),
                now - self.last_receive_at
            );
            self.disconnect(
                DisconnectReason::TimeoutDisconnect,
                "nothing received within the disconnect timeout",
            );
        }

        // the retransmission scan runs before the snapshot, so resends join
        // this tick's queues and are interleaved with fresh traffic
        let mut resend_exhausted = false;
        for (index, lane) in self.lanes.iter_mut().enumerate() {
            let mut requeue = Vec::new();
            if !lane.resend_due(now, &mut requeue) {
                resend_exhausted = true;
                break;
            }
            self.handle.channels[index].requeue_for_resend(requeue);
        }
        if resend_exhausted {
            self.force_timeout_disconnect();
            return;
        }

        for (index, channel) in self.handle.channels.iter().enumerate() {
            channel.drain_reliable(&mut self.reliable_standby[index]);
            channel.drain_unreliable(&mut self.unreliable_standby[index]);
        }

        let mtu = self.handle.mtu;
        let mut datagram = Vec::with_capacity(mtu);
        let mut channel_index = 0;
        loop {
            datagram.clear();
            datagram.resize(ENVELOPE_LEN, 0);
            let mut command_count: u16 = 0;

            // acks ride along first, best effort; whatever does not fit waits
            // for the next datagram
            while let Some(ack) = self.pending_acks.front() {
                if datagram.len() + ack.wire_len() > mtu {
                    break;
                }
                let mut ack = self.pending_acks.pop_front().expect("peeked right above");
                datagram.extend_from_slice(ack.encoded());
                command_count += 1;
            }

            while channel_index < self.lanes.len() {
                if !self.pack_channel(channel_index, &mut datagram, &mut command_count, now, mtu) {
                    break; // datagram full, channel continues in the next one
                }
                channel_index += 1;
            }

            if command_count > 0 {
                write_envelope(
                    &mut datagram,
                    self.handle.peer_id,
                    now,
                    command_count,
                    self.crc_enabled,
                );
                sink.send_datagram(self.address, &datagram);
            }

            let drained = channel_index >= self.lanes.len() && self.pending_acks.is_empty();
            if drained {
                break;
            }
            if command_count == 0 {
                // nothing fit into an empty datagram; drop the oversized head
                // so the tick cannot spin
                self.drop_unsendable_head(channel_index);
            }
        }

        if self.handle.state() == ConnectionState::Disconnecting && self.handle.force_disconnected()
        {
            let (reason, detail) = self
                .handle
                .take_pending_disconnect()
                .unwrap_or((DisconnectReason::UnknownError, String::new()));
            self.application
                .on_peer_disconnected(&self.handle, reason, &detail);
            self.dispose();
        }
    }

    /// Packs the channel's snapshot queues into the datagram, unreliable
    /// first. Returns true once the channel is fully drained.
    fn pack_channel(
        &mut self,
        index: usize,
        datagram: &mut Vec<u8>,
        command_count: &mut u16,
        now: u64,
        mtu: usize,
    ) -> bool {
        while let Some(command) = self.unreliable_standby[index].front() {
            if datagram.len() + command.wire_len() > mtu {
                return false;
            }
            let mut command = self.unreliable_standby[index]
                .pop_front()
                .expect("peeked right above");
            datagram.extend_from_slice(command.encoded());
            *command_count += 1;
        }

        while let Some(command) = self.reliable_standby[index].front() {
            if datagram.len() + command.wire_len() > mtu {
                return false;
            }
            let mut command = self.reliable_standby[index]
                .pop_front()
                .expect("peeked right above");
            datagram.extend_from_slice(command.encoded());
            *command_count += 1;
            self.record_reliable_sent(index, command, now);
        }

        true
    }

    /// Bookkeeping for a reliable command that was just placed in a datagram:
    /// stamp, bump the send count, compute the retransmission deadline, and on
    /// the first send register it in the in-flight table.
    fn record_reliable_sent(&mut self, index: usize, mut command: OutgoingCommand, now: u64) {
        command.send_count += 1;
        command.retransmit_deadline = self.rtt.retransmit_deadline(now, command.send_count);
        if command.send_count == 1 {
            command.first_sent_at = now;
            command.timeout_deadline = now + self.disconnect_timeout_ms;
        }
        self.lanes[index].register_in_flight(command);
    }

    fn drop_unsendable_head(&mut self, channel_index: usize) {
        for queue in [
            &mut self.unreliable_standby[channel_index],
            &mut self.reliable_standby[channel_index],
        ] {
            if let Some(command) = queue.pop_front() {
                error!(
                    "peer {}: {} byte command exceeds the datagram budget, dropping",
                    self.handle.peer_id,
                    command.wire_len()
                );
                return;
            }
        }
    }

    /// Immediate teardown after resend exhaustion: no further packets go out.
    fn force_timeout_disconnect(&mut self) {
        if self.handle.state() == ConnectionState::Disconnected {
            return;
        }
        self.handle.force_disconnected();
        self.application.on_peer_disconnected(
            &self.handle,
            DisconnectReason::TimeoutDisconnect,
            "retransmission budget exhausted",
        );
        self.dispose();
    }

    /// Runs the teardown hooks exactly once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for hook in self.teardown.drain(..) {
            hook();
        }
    }
}

fn decode_disconnect_payload(payload: &[u8]) -> (DisconnectReason, String) {
    let mut buf = payload;
    if buf.remaining() < 8 {
        return (DisconnectReason::UnknownError, String::new());
    }
    let reason = DisconnectReason::from(buf.get_u32());
    let detail_len = buf.get_u32() as usize;
    let detail = if buf.remaining() >= detail_len {
        String::from_utf8_lossy(&buf[..detail_len]).into_owned()
    } else {
        String::new()
    };
    (reason, detail)
}
