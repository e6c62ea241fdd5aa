use std::sync::atomic::{AtomicU8, Ordering};

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use tracing::trace;

/// The four states a peer connection moves through. `Disconnected` is both the
/// initial and the terminal state; every mutating operation on a peer checks
/// the current state before doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    /// The closed transition table. `Disconnected -> Connecting` happens when the
    /// admission path constructs a peer; `Connecting -> Connected` when the
    /// application attaches; a disconnect command queues `-> Disconnecting`; the
    /// flush of that command (or a remote disconnect, which may skip
    /// `Disconnecting` entirely) ends in `Disconnected`.
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Lock-free holder for a peer's connection state. The owning lane is the only
/// writer in steady state, but the application thread may initiate a disconnect,
/// so transitions go through compare-and-swap.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: ConnectionState) -> StateCell {
        StateCell(AtomicU8::new(initial.into()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::try_from(self.0.load(Ordering::Acquire))
            .expect("state cell holds a valid state")
    }

    /// Attempts the transition, returning false if it is not in the table.
    pub fn transition_to(&self, next: ConnectionState) -> bool {
        let mut current = self.get();
        loop {
            if current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                trace!("rejecting state transition {:?} -> {:?}", current, next);
                return false;
            }
            match self.0.compare_exchange(
                current.into(),
                next.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!("state transition {:?} -> {:?}", current, next);
                    return true;
                }
                Err(raw) => {
                    current = ConnectionState::try_from(raw)
                        .expect("state cell holds a valid state");
                }
            }
        }
    }
}

/// Reason codes carried in disconnect commands. The numeric values are part of
/// the wire format and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum DisconnectReason {
    TimeoutDisconnect = 1,
    ClientDisconnect = 2,
    ServerUserLimit = 3,
    ServerDisconnect = 4,
    QueueOverflow = 5,
    InvalidConnection = 6,
    InvalidEncryption = 7,
    InvalidDataFormat = 8,
    #[num_enum(default)]
    UnknownError = 9,
    ApplicationStop = 12,
    ConnectionFailed = 13,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ConnectionState::Disconnected, ConnectionState::Connecting, true)]
    #[case(ConnectionState::Connecting, ConnectionState::Connected, true)]
    #[case(ConnectionState::Connecting, ConnectionState::Disconnecting, true)]
    #[case(ConnectionState::Connecting, ConnectionState::Disconnected, true)]
    #[case(ConnectionState::Connected, ConnectionState::Disconnecting, true)]
    #[case(ConnectionState::Connected, ConnectionState::Disconnected, true)]
    #[case(ConnectionState::Disconnecting, ConnectionState::Disconnected, true)]
    #[case(ConnectionState::Disconnected, ConnectionState::Connected, false)]
    #[case(ConnectionState::Disconnected, ConnectionState::Disconnecting, false)]
    #[case(ConnectionState::Disconnecting, ConnectionState::Connected, false)]
    #[case(ConnectionState::Connected, ConnectionState::Connecting, false)]
    fn test_transition_table(
        #[case] from: ConnectionState,
        #[case] to: ConnectionState,
        #[case] allowed: bool,
    ) {
        let cell = StateCell::new(from);
        assert_eq!(cell.transition_to(to), allowed);
        assert_eq!(cell.get(), if allowed { to } else { from });
    }

    #[test]
    fn test_self_transition_is_rejected() {
        let cell = StateCell::new(ConnectionState::Connected);
        assert!(!cell.transition_to(ConnectionState::Connected));
    }

    #[rstest]
    #[case(1, DisconnectReason::TimeoutDisconnect)]
    #[case(8, DisconnectReason::InvalidDataFormat)]
    #[case(12, DisconnectReason::ApplicationStop)]
    #[case(999, DisconnectReason::UnknownError)]
    fn test_reason_from_wire(#[case] raw: u32, #[case] expected: DisconnectReason) {
        assert_eq!(DisconnectReason::from(raw), expected);
    }
}
