//! A reliable transport protocol layered over UDP for real-time client/server
//! applications, built for game servers that want low latency first and
//! TCP-style guarantees only where the application asks for them.
//!
//! ## Design goals
//!
//! * The server listens on one UDP port for connect handshakes and carries
//!   peer traffic over a fixed set of worker ports; an accepted client is told
//!   its worker port in the connect response
//! * The abstraction is sending / receiving *payloads* on *channels*:
//!   * each connection multiplexes a fixed number of logical channels, each an
//!     independently sequenced stream
//!   * reliable payloads are delivered exactly once, in order, per channel,
//!     via acks and RTT-adaptive retransmission
//!   * unreliable payloads are best-effort and sequence-stamped; anything that
//!     arrives behind a newer reliable message or out of sequence is dropped,
//!     never delivered late
//! * Payloads larger than one datagram are fragmented and reassembled by the
//!   transport; IP-level fragmentation is never relied on
//! * Small commands are combined into MTU-budgeted datagrams on a fixed-rate
//!   send tick; one tick flushes as many datagrams as the queues need
//! * The connect handshake runs a Diffie-Hellman exchange and both sides
//!   derive a shared symmetric key, offered to the application for payload
//!   encryption
//! * Per-packet CRC is negotiated at connect time for links that corrupt data
//!   without dropping it
//! * No congestion control beyond the fixed-rate pacing: the protocol is made
//!   for game traffic with a known, small bandwidth envelope
//!
//! ## Wire format
//!
//! All integers are big-endian. Peer traffic travels in `messages` envelopes:
//!
//! ```ascii
//! 0:  command class: u8 (0 = messages)
//! 1:  peer id: u32
//! 5:  sender timestamp (millis): u64
//! 13: command count: u16
//! 15: checksum: u64 (CRC-32 widened; zero when CRC is disabled)
//! 23: commands, back to back
//! ```
//!
//! Every command starts with the same header:
//!
//! ```ascii
//! 0:  command type: u8
//! 1:  channel index: u8
//! 2:  flags: u8 (bit 0 = reliable, bit 1 = encrypted)
//! 3:  total command length: u16
//! 5:  reliable sequence number: u64
//! 13: type-specific fields and payload
//! ```
//!
//! * `unreliable` commands append their unreliable sequence number (u64)
//! * `fragment` commands append the fragment-group start sequence (u64),
//!   fragment count (u16), this fragment's index (u16), the total payload
//!   length (u32) and this fragment's byte offset (u32)
//! * `ack` commands carry a fixed 16-byte payload: the acknowledged reliable
//!   sequence and the echoed send timestamp the RTT sample is computed from
//!
//! The connect request / connect response envelopes are separate fixed
//! layouts, documented in [`admission`].
//!
//! ## Threading model
//!
//! Each worker lane owns a disjoint set of peers; all receive and send
//! processing for a peer happens on its one lane, so per-peer state is
//! unsynchronized. The two sanctioned cross-thread touches are the admission
//! path's one-time peer hand-over and the application's `enqueue`, which goes
//! through a short-held lock around the channel's double-buffered queues.

pub mod admission;
pub mod application;
pub mod channel;
pub mod checksum;
pub mod command;
pub mod config;
pub mod endpoint;
mod lane;
pub mod peer;
pub mod pool;
pub mod rtt;
pub mod security;
pub mod sink;
pub mod state;

pub use application::Application;
pub use command::Reliability;
pub use config::TransportConfig;
pub use endpoint::UdpTransport;
pub use peer::{NetworkPeer, PeerHandle, RttStats};
pub use state::{ConnectionState, DisconnectReason};

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init()
            .ok();
    }
}
