use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::command::{FragmentInfo, IncomingCommand, OutgoingCommand};
use crate::pool::PayloadPool;

/// Backpressure cap: an enqueue is rejected while more reliable commands than
/// this are waiting to be sent for the first time.
pub const MAX_UNSENT_RELIABLE: usize = 1000;
/// A reliable command that has been sent this many times without an ack tears
/// the connection down.
pub const MAX_SEND_COUNT: u32 = 3;

const QUEUE_WARNING_STEP: usize = 100;

/// The outgoing half of a logical channel. This is the only part of a peer the
/// application thread touches directly, so the queues and sequence counters sit
/// behind a short-held lock; the flush path takes whole queues out with a
/// pointer swap and never holds the lock while serializing.
pub struct Channel {
    index: u8,
    outgoing: Mutex<OutgoingQueues>,
}

struct OutgoingQueues {
    reliable: VecDeque<OutgoingCommand>,
    unreliable: VecDeque<OutgoingCommand>,
    reliable_sequence: u64,
    unreliable_sequence: u64,
}

impl Channel {
    pub fn new(index: u8) -> Channel {
        Channel {
            index,
            outgoing: Mutex::new(OutgoingQueues {
                reliable: VecDeque::new(),
                unreliable: VecDeque::new(),
                reliable_sequence: 0,
                unreliable_sequence: 0,
            }),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    /// Stamps the command with its sequence numbers and queues it. Reliable
    /// commands take the next reliable sequence; unreliable commands are tied
    /// to the *current* reliable sequence (their checkpoint) and take the next
    /// unreliable sequence. Returns false on backpressure.
    pub fn enqueue(&self, mut command: OutgoingCommand) -> bool {
        let mut queues = self.outgoing.lock().unwrap();

        if command.is_reliable() {
            if queues.reliable.len() > MAX_UNSENT_RELIABLE {
                debug!(
                    "channel {}: reliable send queue over capacity - rejecting",
                    self.index
                );
                return false;
            }
            queues.reliable_sequence += 1;
            command.reliable_sequence = queues.reliable_sequence;
            queues.reliable.push_back(command);
        } else {
            command.reliable_sequence = queues.reliable_sequence;
            queues.unreliable_sequence += 1;
            command.unreliable_sequence = queues.unreliable_sequence;
            queues.unreliable.push_back(command);
        }
        true
    }

    /// Queues a whole fragment group under one lock so the group occupies
    /// consecutive reliable sequence numbers with no interleaved enqueue. The
    /// commands' `FragmentInfo::start_sequence` is filled in here.
    pub fn enqueue_fragments(&self, mut fragments: Vec<OutgoingCommand>) -> bool {
        let mut queues = self.outgoing.lock().unwrap();

        if queues.reliable.len() > MAX_UNSENT_RELIABLE {
            debug!(
                "channel {}: reliable send queue over capacity - rejecting fragment group",
                self.index
            );
            return false;
        }

        let start_sequence = queues.reliable_sequence + 1;
        for command in &mut fragments {
            queues.reliable_sequence += 1;
            command.reliable_sequence = queues.reliable_sequence;
            let info = command
                .fragment
                .as_mut()
                .expect("fragment group member carries fragment info");
            info.start_sequence = start_sequence;
        }
        queues.reliable.extend(fragments);
        true
    }

    /// Re-queues expired in-flight commands behind whatever fresh traffic is
    /// already waiting, so resends are interleaved rather than prioritized.
    pub fn requeue_for_resend(&self, commands: Vec<OutgoingCommand>) {
        if commands.is_empty() {
            return;
        }
        let mut queues = self.outgoing.lock().unwrap();
        queues.reliable.extend(commands);
    }

    /// Swaps the live reliable queue with the (empty) standby queue passed in.
    pub fn drain_reliable(&self, into: &mut VecDeque<OutgoingCommand>) {
        debug_assert!(into.is_empty());
        std::mem::swap(&mut self.outgoing.lock().unwrap().reliable, into);
    }

    pub fn drain_unreliable(&self, into: &mut VecDeque<OutgoingCommand>) {
        debug_assert!(into.is_empty());
        std::mem::swap(&mut self.outgoing.lock().unwrap().unreliable, into);
    }

    #[cfg(test)]
    pub fn unsent_reliable_len(&self) -> usize {
        self.outgoing.lock().unwrap().reliable.len()
    }
}

/// The lane-owned half of a channel: incoming buffers, delivery cursors and the
/// in-flight table. Only the peer's owning lane ever touches this, so none of
/// it is synchronized.
pub struct ChannelLane {
    index: u8,
    /// highest contiguous reliable sequence delivered to the application
    incoming_reliable_sequence: u64,
    /// highest unreliable sequence delivered
    incoming_unreliable_sequence: u64,
    incoming_reliable: BTreeMap<u64, IncomingCommand>,
    incoming_unreliable: BTreeMap<u64, IncomingCommand>,
    /// sent, not yet acknowledged reliable commands, keyed by sequence
    in_flight: FxHashMap<u64, OutgoingCommand>,
}

impl ChannelLane {
    pub fn new(index: u8) -> ChannelLane {
        ChannelLane {
            index,
            incoming_reliable_sequence: 0,
            incoming_unreliable_sequence: 0,
            incoming_reliable: BTreeMap::new(),
            incoming_unreliable: BTreeMap::new(),
            in_flight: FxHashMap::default(),
        }
    }

    /// Buffers an incoming command, or drops it as a stale duplicate. Dropped
    /// commands release their payload back to the pool; the eager ack for them
    /// has already been queued by the caller.
    pub fn insert_incoming(&mut self, command: IncomingCommand) -> bool {
        if command.is_reliable() {
            let sequence = command.reliable_sequence;
            if sequence <= self.incoming_reliable_sequence
                || self.incoming_reliable.contains_key(&sequence)
            {
                trace!(
                    "channel {}: dropping duplicate reliable command #{}",
                    self.index,
                    sequence
                );
                return false;
            }
            self.incoming_reliable.insert(sequence, command);
            let buffered = self.incoming_reliable.len();
            if buffered % QUEUE_WARNING_STEP == 0 {
                debug!(
                    "channel {}: {} reliable commands buffered out of order",
                    self.index, buffered
                );
            }
        } else {
            if command.reliable_sequence < self.incoming_reliable_sequence
                || command.unreliable_sequence <= self.incoming_unreliable_sequence
            {
                trace!(
                    "channel {}: dropping stale unreliable command #{}",
                    self.index,
                    command.unreliable_sequence
                );
                return false;
            }
            self.incoming_unreliable
                .insert(command.unreliable_sequence, command);
            let buffered = self.incoming_unreliable.len();
            if buffered % QUEUE_WARNING_STEP == 0 {
                debug!(
                    "channel {}: {} unreliable commands buffered",
                    self.index, buffered
                );
            }
        }
        true
    }

    /// The per-channel ordering algorithm. Prefers the smallest buffered
    /// unreliable command whose reliable checkpoint matches the current cursor;
    /// otherwise looks for the reliable command right after the cursor, where a
    /// fragment is deliverable only once its whole group has arrived.
    pub fn try_deliver_next(&mut self, pool: &mut PayloadPool) -> Option<IncomingCommand> {
        if let Some(command) = self.take_deliverable_unreliable() {
            self.incoming_unreliable_sequence = command.unreliable_sequence;
            return Some(command);
        }

        let next_sequence = self.incoming_reliable_sequence + 1;
        let next = self.incoming_reliable.get(&next_sequence)?;

        if let Some(info) = next.fragment {
            return self.try_deliver_fragment_group(info, pool);
        }

        let command = self
            .incoming_reliable
            .remove(&next_sequence)
            .expect("checked right above");
        self.incoming_reliable_sequence = next_sequence;
        Some(command)
    }

    fn take_deliverable_unreliable(&mut self) -> Option<IncomingCommand> {
        // purge commands that were overtaken while they sat in the buffer
        let stale: Vec<u64> = self
            .incoming_unreliable
            .iter()
            .filter(|(sequence, command)| {
                command.reliable_sequence < self.incoming_reliable_sequence
                    || **sequence <= self.incoming_unreliable_sequence
            })
            .map(|(sequence, _)| *sequence)
            .collect();
        for sequence in stale {
            trace!(
                "channel {}: purging overtaken unreliable command #{}",
                self.index,
                sequence
            );
            self.incoming_unreliable.remove(&sequence);
        }

        let deliverable = self
            .incoming_unreliable
            .iter()
            .find(|(_, command)| command.reliable_sequence == self.incoming_reliable_sequence)
            .map(|(sequence, _)| *sequence)?;
        self.incoming_unreliable.remove(&deliverable)
    }

    fn try_deliver_fragment_group(
        &mut self,
        info: FragmentInfo,
        pool: &mut PayloadPool,
    ) -> Option<IncomingCommand> {
        let sequences = info.start_sequence..info.start_sequence + info.count as u64;
        if !sequences
            .clone()
            .all(|sequence| self.incoming_reliable.contains_key(&sequence))
        {
            return None;
        }

        // acquire the assembly buffer before taking anything out of the map, so
        // an exhausted pool leaves the group buffered for a later attempt
        let mut assembled = pool.acquire()?;
        assembled.resize_zeroed(info.total_len as usize);

        let mut head = None;
        for sequence in sequences {
            let command = self
                .incoming_reliable
                .remove(&sequence)
                .expect("group completeness checked above");
            let fragment = command.fragment.expect("group member carries fragment info");
            if let Some(payload) = &command.payload {
                assembled.write_at(fragment.offset as usize, payload);
            }
            if head.is_none() {
                head = Some(command);
            }
        }

        let mut head = head.expect("group has at least one member");
        head.payload = Some(assembled);
        self.incoming_reliable_sequence += info.count as u64;
        trace!(
            "channel {}: reassembled {} fragments into {} bytes",
            self.index,
            info.count,
            info.total_len
        );
        Some(head)
    }

    /// Clears the in-flight entry for an acknowledged sequence. Returns the
    /// retired command so the caller can compute the round-trip sample; `None`
    /// for duplicate acks.
    pub fn retire_acked(&mut self, acked_sequence: u64) -> Option<OutgoingCommand> {
        self.in_flight.remove(&acked_sequence)
    }

    /// Registers a reliable command as sent (moved here from the unsent queue).
    pub fn register_in_flight(&mut self, command: OutgoingCommand) {
        self.in_flight.insert(command.reliable_sequence, command);
    }

    /// Moves commands whose retransmission deadline has passed into `requeue`.
    /// Returns false if any of them has exhausted its send budget, which must
    /// tear the peer down.
    pub fn resend_due(&mut self, now: u64, requeue: &mut Vec<OutgoingCommand>) -> bool {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, command)| now > command.retransmit_deadline)
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in expired {
            let command = &self.in_flight[&sequence];
            if command.send_count >= MAX_SEND_COUNT {
                debug!(
                    "channel {}: reliable command #{} unacknowledged after {} sends",
                    self.index, sequence, command.send_count
                );
                return false;
            }
            trace!("channel {}: re-queueing command #{} for resend", self.index, sequence);
            requeue.push(self.in_flight.remove(&sequence).expect("key from iteration"));
        }
        true
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub fn incoming_reliable_sequence(&self) -> u64 {
        self.incoming_reliable_sequence
    }
}
