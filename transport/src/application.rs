use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

use crate::command::Reliability;
use crate::peer::PeerHandle;
use crate::state::DisconnectReason;

/// The application side of the transport. Callbacks run on the lane that owns
/// the peer; implementations that need to do real work should hand off to
/// their own logic threads and return quickly.
#[cfg_attr(test, automock)]
pub trait Application: Send + Sync + 'static {
    /// First payload from a peer still in `Connecting`. The application accepts
    /// the peer by calling [`PeerHandle::attach`]; a peer left unattached when
    /// this returns is disconnected.
    fn on_peer_connected(&self, peer: &Arc<PeerHandle>, initial_payload: &[u8], channel: u8);

    fn on_peer_disconnected(&self, peer: &Arc<PeerHandle>, reason: DisconnectReason, detail: &str);

    fn on_payload_received(
        &self,
        peer: &Arc<PeerHandle>,
        payload: &[u8],
        channel: u8,
        encrypted: bool,
        reliability: Reliability,
    );
}
