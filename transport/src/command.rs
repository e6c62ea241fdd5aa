use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::pool::{Payload, PayloadPool};

/// Fixed command header: type (u8), channel (u8), flags (u8), total command
/// length (u16), reliable sequence number (u64).
pub const COMMAND_HEADER_LEN: usize = 13;
/// Unreliable commands append their unreliable sequence number (u64).
pub const UNRELIABLE_HEADER_LEN: usize = COMMAND_HEADER_LEN + 8;
/// Fragments append start sequence (u64), fragment count (u16), fragment index
/// (u16), total payload length (u32) and byte offset (u32).
pub const FRAGMENT_HEADER_LEN: usize = COMMAND_HEADER_LEN + 20;
/// An ack payload is the acknowledged reliable sequence (u64) plus the echoed
/// send timestamp (u64).
pub const ACK_PAYLOAD_LEN: usize = 16;
/// Upper bound for a single command on the wire; a declared length above this
/// invalidates the whole surrounding packet.
pub const MAX_COMMAND_BYTES: usize = 1350;

/// Outer packet envelope: command class (u8), peer id (u32), sender timestamp
/// (u64), command count (u16), checksum (u64). The checksum field is always
/// present on the wire and zeroed when CRC is disabled.
pub const ENVELOPE_LEN: usize = 23;
/// Offset of the envelope checksum field.
pub const ENVELOPE_CHECKSUM_OFFSET: usize = 15;
/// A packet declaring more commands than this is rejected outright.
pub const MAX_COMMANDS_PER_PACKET: u16 = 100;

/// Fills in the reserved envelope header of a finished datagram. The first
/// `ENVELOPE_LEN` bytes of `datagram` must be reserved; everything after them
/// is the serialized command run.
pub fn write_envelope(
    datagram: &mut [u8],
    peer_id: u32,
    timestamp: u64,
    command_count: u16,
    with_checksum: bool,
) {
    datagram[0] = CommandKind::Messages.into();
    datagram[1..5].copy_from_slice(&peer_id.to_be_bytes());
    datagram[5..13].copy_from_slice(&timestamp.to_be_bytes());
    datagram[13..15].copy_from_slice(&command_count.to_be_bytes());
    datagram[ENVELOPE_CHECKSUM_OFFSET..ENVELOPE_LEN].fill(0);
    if with_checksum {
        crate::checksum::write(datagram, ENVELOPE_CHECKSUM_OFFSET);
    }
}

/// Wire discriminants of the command types. The values are load-bearing for
/// interoperability and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandKind {
    Messages = 0,
    Ack = 1,
    Connect = 2,
    ConnectResponse = 3,
    Disconnect = 4,
    Ping = 5,
    Reliable = 6,
    Unreliable = 7,
    Fragment = 8,
    ServerTime = 14,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u8 {
        const RELIABLE = 0x01;
        const ENCRYPTED = 0x02;
    }
}

/// Delivery guarantee requested by the application for an outgoing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    ReliableSequenced,
    UnreliableSequenced,
}

/// Fragment-group metadata: the group occupies `count` consecutive reliable
/// sequence numbers starting at `start_sequence`, and each member carries its
/// own index and byte offset into the reassembled payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub start_sequence: u64,
    pub count: u16,
    pub index: u16,
    pub total_len: u32,
    pub offset: u32,
}

fn header_len(kind: CommandKind) -> usize {
    match kind {
        CommandKind::Unreliable => UNRELIABLE_HEADER_LEN,
        CommandKind::Fragment => FRAGMENT_HEADER_LEN,
        _ => COMMAND_HEADER_LEN,
    }
}

/// A command decoded from an incoming packet, together with its receive
/// timestamp and pooled payload bytes.
pub struct IncomingCommand {
    pub kind: CommandKind,
    pub channel: u8,
    pub flags: CommandFlags,
    pub reliable_sequence: u64,
    pub unreliable_sequence: u64,
    pub fragment: Option<FragmentInfo>,
    pub acked_sequence: u64,
    pub ack_send_time: u64,
    pub received_at: u64,
    pub payload: Option<Payload>,
}

impl IncomingCommand {
    /// Decodes the next command from `buf`, advancing it past the command.
    ///
    /// `Err` means the surrounding packet is garbled and must be rejected as a
    /// whole. `Ok(None)` means the payload pool is exhausted; the caller treats
    /// the packet as dropped.
    pub fn decode(
        received_at: u64,
        pool: &mut PayloadPool,
        buf: &mut &[u8],
    ) -> anyhow::Result<Option<IncomingCommand>> {
        if buf.remaining() < COMMAND_HEADER_LEN {
            bail!("truncated command header: {} bytes left", buf.remaining());
        }

        let raw_kind = buf.get_u8();
        let kind = match CommandKind::try_from(raw_kind) {
            Ok(kind) => kind,
            Err(_) => bail!("invalid command type {}", raw_kind),
        };
        let channel = buf.get_u8();
        let flags = CommandFlags::from_bits_truncate(buf.get_u8());
        let declared_len = buf.get_u16() as usize;
        let reliable_sequence = buf.get_u64();

        if declared_len < header_len(kind) || declared_len > MAX_COMMAND_BYTES {
            bail!("invalid command length {} for {:?}", declared_len, kind);
        }

        let mut command = IncomingCommand {
            kind,
            channel,
            flags,
            reliable_sequence,
            unreliable_sequence: 0,
            fragment: None,
            acked_sequence: 0,
            ack_send_time: 0,
            received_at,
            payload: None,
        };

        match kind {
            CommandKind::Ack => {
                if declared_len != COMMAND_HEADER_LEN + ACK_PAYLOAD_LEN {
                    bail!("invalid ack length {}", declared_len);
                }
                if buf.remaining() < ACK_PAYLOAD_LEN {
                    bail!("truncated ack");
                }
                command.acked_sequence = buf.get_u64();
                command.ack_send_time = buf.get_u64();
            }
            CommandKind::Ping | CommandKind::ServerTime => {
                if declared_len != COMMAND_HEADER_LEN {
                    bail!("invalid {:?} length {}", kind, declared_len);
                }
            }
            CommandKind::Reliable | CommandKind::Disconnect => {
                let payload_len = declared_len - COMMAND_HEADER_LEN;
                match Self::read_payload(pool, buf, payload_len)? {
                    Some(payload) => command.payload = Some(payload),
                    None => return Ok(None),
                }
            }
            CommandKind::Unreliable => {
                if buf.remaining() < 8 {
                    bail!("truncated unreliable header");
                }
                command.unreliable_sequence = buf.get_u64();
                let payload_len = declared_len - UNRELIABLE_HEADER_LEN;
                match Self::read_payload(pool, buf, payload_len)? {
                    Some(payload) => command.payload = Some(payload),
                    None => return Ok(None),
                }
            }
            CommandKind::Fragment => {
                if buf.remaining() < FRAGMENT_HEADER_LEN - COMMAND_HEADER_LEN {
                    bail!("truncated fragment header");
                }
                let fragment = FragmentInfo {
                    start_sequence: buf.get_u64(),
                    count: buf.get_u16(),
                    index: buf.get_u16(),
                    total_len: buf.get_u32(),
                    offset: buf.get_u32(),
                };
                let payload_len = declared_len - FRAGMENT_HEADER_LEN;
                if fragment.count == 0
                    || fragment.index >= fragment.count
                    || fragment.offset as usize + payload_len > fragment.total_len as usize
                {
                    bail!(
                        "inconsistent fragment header: index {}/{}, offset {}, total {}",
                        fragment.index,
                        fragment.count,
                        fragment.offset,
                        fragment.total_len
                    );
                }
                command.fragment = Some(fragment);
                match Self::read_payload(pool, buf, payload_len)? {
                    Some(payload) => command.payload = Some(payload),
                    None => return Ok(None),
                }
            }
            CommandKind::Messages | CommandKind::Connect | CommandKind::ConnectResponse => {
                bail!("command type {:?} is not valid inside a packet", kind);
            }
        }

        Ok(Some(command))
    }

    fn read_payload(
        pool: &mut PayloadPool,
        buf: &mut &[u8],
        payload_len: usize,
    ) -> anyhow::Result<Option<Payload>> {
        if buf.remaining() < payload_len {
            bail!(
                "declared payload of {} bytes but only {} left in packet",
                payload_len,
                buf.remaining()
            );
        }
        let Some(mut payload) = pool.acquire() else {
            return Ok(None);
        };
        payload.extend_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);
        Ok(Some(payload))
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(CommandFlags::RELIABLE)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(CommandFlags::ENCRYPTED)
    }
}

/// An outgoing command owned by exactly one channel queue (or the in-flight
/// table) at a time. The serialized form is built lazily and cached so that
/// retransmissions reuse the same bytes.
pub struct OutgoingCommand {
    pub kind: CommandKind,
    pub channel: u8,
    pub flags: CommandFlags,
    pub reliable_sequence: u64,
    pub unreliable_sequence: u64,
    pub fragment: Option<FragmentInfo>,
    payload: Vec<u8>,
    encoded: Option<Bytes>,

    pub send_count: u32,
    pub first_sent_at: u64,
    pub retransmit_deadline: u64,
    pub timeout_deadline: u64,
}

impl OutgoingCommand {
    pub fn new(kind: CommandKind, channel: u8, payload: Vec<u8>, encrypt: bool) -> OutgoingCommand {
        let mut flags = match kind {
            CommandKind::Reliable
            | CommandKind::Fragment
            | CommandKind::Ping
            | CommandKind::ServerTime => CommandFlags::RELIABLE,
            _ => CommandFlags::empty(),
        };
        if encrypt {
            flags |= CommandFlags::ENCRYPTED;
        }

        OutgoingCommand {
            kind,
            channel,
            flags,
            reliable_sequence: 0,
            unreliable_sequence: 0,
            fragment: None,
            payload,
            encoded: None,
            send_count: 0,
            first_sent_at: 0,
            retransmit_deadline: 0,
            timeout_deadline: 0,
        }
    }

    pub fn fragment(
        channel: u8,
        payload: Vec<u8>,
        encrypt: bool,
        fragment: FragmentInfo,
    ) -> OutgoingCommand {
        let mut command = Self::new(CommandKind::Fragment, channel, payload, encrypt);
        command.fragment = Some(fragment);
        command
    }

    /// Builds the ack for a received reliable command, echoing the timestamp of
    /// the packet that carried it so the sender can compute the round trip.
    pub fn ack(channel: u8, acked_sequence: u64, sender_time: u64) -> OutgoingCommand {
        let mut payload = Vec::with_capacity(ACK_PAYLOAD_LEN);
        payload.put_u64(acked_sequence);
        payload.put_u64(sender_time);
        Self::new(CommandKind::Ack, channel, payload, false)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(CommandFlags::RELIABLE)
    }

    pub fn wire_len(&self) -> usize {
        header_len(self.kind) + self.payload.len()
    }

    /// The cached serialized form. Must not be called before the sequence
    /// numbers are stamped; the first call freezes them into the cache.
    pub fn encoded(&mut self) -> &[u8] {
        if self.encoded.is_none() {
            let mut buf = BytesMut::with_capacity(self.wire_len());
            buf.put_u8(self.kind.into());
            buf.put_u8(self.channel);
            buf.put_u8(self.flags.bits());
            buf.put_u16(self.wire_len() as u16);
            buf.put_u64(self.reliable_sequence);
            match self.kind {
                CommandKind::Unreliable => {
                    buf.put_u64(self.unreliable_sequence);
                }
                CommandKind::Fragment => {
                    let fragment = self.fragment.expect("fragment command carries its info");
                    buf.put_u64(fragment.start_sequence);
                    buf.put_u16(fragment.count);
                    buf.put_u16(fragment.index);
                    buf.put_u32(fragment.total_len);
                    buf.put_u32(fragment.offset);
                }
                _ => {}
            }
            buf.put_slice(&self.payload);
            self.encoded = Some(buf.freeze());
        }
        self.encoded.as_ref().expect("just built")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pool() -> PayloadPool {
        PayloadPool::new(2048, 64)
    }

    fn decode_one(bytes: &[u8]) -> anyhow::Result<Option<IncomingCommand>> {
        let mut pool = pool();
        let mut buf = bytes;
        let result = IncomingCommand::decode(7, &mut pool, &mut buf);
        if let Ok(Some(_)) = &result {
            assert!(buf.is_empty(), "decode must consume the whole command");
        }
        result
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::one_byte(vec![0x42])]
    #[case::mtu_sized(vec![7u8; 1294])]
    #[case::max_declared(vec![9u8; MAX_COMMAND_BYTES - COMMAND_HEADER_LEN])]
    fn test_reliable_roundtrip(#[case] payload: Vec<u8>) {
        let mut command = OutgoingCommand::new(CommandKind::Reliable, 3, payload.clone(), false);
        command.reliable_sequence = 42;

        let decoded = decode_one(command.encoded()).unwrap().unwrap();
        assert_eq!(decoded.kind, CommandKind::Reliable);
        assert_eq!(decoded.channel, 3);
        assert!(decoded.is_reliable());
        assert!(!decoded.is_encrypted());
        assert_eq!(decoded.reliable_sequence, 42);
        assert_eq!(&*decoded.payload.unwrap(), payload.as_slice());
    }

    #[test]
    fn test_unreliable_roundtrip() {
        let mut command =
            OutgoingCommand::new(CommandKind::Unreliable, 0, b"pos".to_vec(), true);
        command.reliable_sequence = 5;
        command.unreliable_sequence = 17;

        let decoded = decode_one(command.encoded()).unwrap().unwrap();
        assert_eq!(decoded.kind, CommandKind::Unreliable);
        assert!(!decoded.is_reliable());
        assert!(decoded.is_encrypted());
        assert_eq!(decoded.reliable_sequence, 5);
        assert_eq!(decoded.unreliable_sequence, 17);
        assert_eq!(&*decoded.payload.unwrap(), b"pos");
    }

    #[test]
    fn test_fragment_roundtrip() {
        let info = FragmentInfo {
            start_sequence: 100,
            count: 3,
            index: 1,
            total_len: 5000,
            offset: 2000,
        };
        let mut command = OutgoingCommand::fragment(2, vec![1u8; 1000], false, info);
        command.reliable_sequence = 101;

        let decoded = decode_one(command.encoded()).unwrap().unwrap();
        assert_eq!(decoded.kind, CommandKind::Fragment);
        assert_eq!(decoded.fragment, Some(info));
        assert_eq!(decoded.payload.unwrap().len(), 1000);
    }

    #[test]
    fn test_ack_roundtrip() {
        let mut command = OutgoingCommand::ack(1, 77, 123456);
        assert_eq!(command.wire_len(), COMMAND_HEADER_LEN + ACK_PAYLOAD_LEN);

        let decoded = decode_one(command.encoded()).unwrap().unwrap();
        assert_eq!(decoded.kind, CommandKind::Ack);
        assert_eq!(decoded.acked_sequence, 77);
        assert_eq!(decoded.ack_send_time, 123456);
        assert_eq!(decoded.received_at, 7);
    }

    #[test]
    fn test_ping_roundtrip() {
        let mut command = OutgoingCommand::new(CommandKind::Ping, 4, Vec::new(), false);
        command.reliable_sequence = 9;

        let decoded = decode_one(command.encoded()).unwrap().unwrap();
        assert_eq!(decoded.kind, CommandKind::Ping);
        assert!(decoded.is_reliable());
        assert_eq!(decoded.reliable_sequence, 9);
    }

    #[test]
    fn test_encoding_is_cached() {
        let mut command = OutgoingCommand::new(CommandKind::Reliable, 0, b"x".to_vec(), false);
        command.reliable_sequence = 1;
        let first = command.encoded().to_vec();
        command.reliable_sequence = 99; // must not affect the cached bytes
        assert_eq!(command.encoded(), first.as_slice());
    }

    #[rstest]
    #[case::unknown_type(vec![99, 0, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::truncated_header(vec![6, 0, 1])]
    #[case::length_below_minimum(vec![6, 0, 1, 0, 5, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::envelope_type_inside_packet(vec![0, 0, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::connect_inside_packet(vec![2, 0, 0, 0, 13, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::ping_with_payload(vec![5, 0, 1, 0, 14, 0, 0, 0, 0, 0, 0, 0, 1, 0xab])]
    fn test_decode_rejects_garbage(#[case] bytes: Vec<u8>) {
        assert!(decode_one(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_payload_past_end() {
        let mut command = OutgoingCommand::new(CommandKind::Reliable, 0, vec![1, 2, 3, 4], false);
        let encoded = command.encoded().to_vec();
        assert!(decode_one(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn test_decode_rejects_length_above_maximum() {
        let mut bytes = vec![6, 0, 1];
        bytes.put_u16(MAX_COMMAND_BYTES as u16 + 1);
        bytes.put_u64(1);
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(decode_one(&bytes).is_err());
    }

    #[test]
    fn test_pool_exhaustion_is_not_an_error() {
        let mut command = OutgoingCommand::new(CommandKind::Reliable, 0, b"data".to_vec(), false);
        command.reliable_sequence = 1;
        let encoded = command.encoded().to_vec();

        let mut exhausted = PayloadPool::new(2048, 0);
        let mut buf = encoded.as_slice();
        let result = IncomingCommand::decode(0, &mut exhausted, &mut buf).unwrap();
        assert!(result.is_none());
    }
}
