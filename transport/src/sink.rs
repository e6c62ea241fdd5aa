use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace};

/// Abstraction for pushing a finished datagram out of a lane, introduced to
/// keep the reliability engine free of socket I/O and mockable in tests.
///
/// Sends are fire-and-forget: UDP gives no delivery guarantee anyway, so a
/// full socket buffer is treated like any other packet loss.
#[cfg_attr(test, automock)]
pub trait DatagramSink: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]);
}

impl DatagramSink for Arc<UdpSocket> {
    fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) {
        trace!("sending {} byte datagram to {:?}", datagram.len(), to);
        match self.try_send_to(datagram, to) {
            Ok(sent) if sent != datagram.len() => {
                debug!("short send to {:?}: {} of {} bytes", to, sent, datagram.len());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("socket buffer full, dropping datagram to {:?}", to);
            }
            Err(e) => {
                error!("error sending datagram to {:?}: {}", to, e);
            }
        }
    }
}
