use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use transport::admission::{ConnectRequest, ConnectResponse, PROTOCOL_VERSION};
use transport::command::{
    write_envelope, CommandKind, IncomingCommand, OutgoingCommand, ENVELOPE_LEN,
};
use transport::pool::PayloadPool;
use transport::security::{derive_key, KeyExchange};
use transport::state::DisconnectReason;
use transport::{Application, PeerHandle, Reliability, TransportConfig, UdpTransport};

/// Echoes every payload back on the channel it came in on.
struct EchoApplication;

impl Application for EchoApplication {
    fn on_peer_connected(&self, peer: &Arc<PeerHandle>, initial_payload: &[u8], channel: u8) {
        peer.attach();
        peer.enqueue(initial_payload, channel, false, Reliability::ReliableSequenced);
    }

    fn on_peer_disconnected(&self, _peer: &Arc<PeerHandle>, _reason: DisconnectReason, _detail: &str) {}

    fn on_payload_received(
        &self,
        peer: &Arc<PeerHandle>,
        payload: &[u8],
        channel: u8,
        _encrypted: bool,
        _reliability: Reliability,
    ) {
        peer.enqueue(payload, channel, false, Reliability::ReliableSequenced);
    }
}

fn test_config(listen_port: u16) -> TransportConfig {
    let mut config = TransportConfig::default_server();
    config.listen_port = listen_port;
    config.worker_start_port = listen_port + 1;
    config.worker_count = 1;
    config
}

fn client_packet(peer_id: u32, sender_time: u64, mut commands: Vec<OutgoingCommand>) -> Vec<u8> {
    let mut datagram = vec![0u8; ENVELOPE_LEN];
    let command_count = commands.len() as u16;
    for command in &mut commands {
        datagram.extend_from_slice(command.encoded());
    }
    write_envelope(&mut datagram, peer_id, sender_time, command_count, false);
    datagram
}

fn parse_packet(bytes: &[u8]) -> (u64, Vec<IncomingCommand>) {
    let mut pool = PayloadPool::new(4096, 256);
    let sender_time = u64::from_be_bytes(bytes[5..13].try_into().unwrap());
    let command_count = u16::from_be_bytes(bytes[13..15].try_into().unwrap());
    let mut cursor = &bytes[ENVELOPE_LEN..];
    let commands = (0..command_count)
        .map(|_| {
            IncomingCommand::decode(0, &mut pool, &mut cursor)
                .expect("well-formed server packet")
                .expect("test pool is large enough")
        })
        .collect();
    (sender_time, commands)
}

async fn connect(
    client: &UdpSocket,
    listen_port: u16,
) -> (ConnectResponse, [u8; 32]) {
    let exchange = KeyExchange::generate();
    let request = ConnectRequest {
        version: PROTOCOL_VERSION,
        client_time: 42,
        channel_count: 5,
        mtu: 1350,
        disconnect_timeout_ms: 5000,
        crc_enabled: false,
        client_public_key: exchange.public_bytes().to_vec(),
    };
    client
        .send_to(&request.encode(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("connect response within the timeout")
        .unwrap();
    let response = ConnectResponse::decode(&buf[..len]).unwrap();
    let shared = exchange
        .derive_shared_secret(&response.server_public_key)
        .unwrap();
    (response, derive_key(&shared))
}

/// The full §handshake-to-payload path over real sockets: connect with version
/// 2, get a peer id and worker port, send "hello" as reliable sequence 1, and
/// observe both the ack for sequence 1 and the echoed payload.
#[tokio::test]
async fn test_connect_handshake_and_reliable_echo() {
    let listen_port = 21000 + (std::process::id() % 10000) as u16;
    let transport = UdpTransport::bind(test_config(listen_port), Arc::new(EchoApplication))
        .await
        .unwrap();
    let _lanes = transport.run();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (response, _key) = connect(&client, listen_port).await;
    assert_eq!(response.client_time, 42, "client timestamp must be echoed");
    assert_eq!(transport.connection_count(), 1);

    let worker_addr: SocketAddr = format!("127.0.0.1:{}", response.worker_port)
        .parse()
        .unwrap();
    let mut hello = OutgoingCommand::new(CommandKind::Reliable, 0, b"hello".to_vec(), false);
    hello.reliable_sequence = 1;
    client
        .send_to(&client_packet(response.peer_id, 7, vec![hello]), worker_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let mut got_ack = false;
    let mut echoed: Option<Vec<u8>> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (!got_ack || echoed.is_none()) && tokio::time::Instant::now() < deadline {
        let received = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
        let Ok(Ok((len, _))) = received else { continue };
        let (server_time, commands) = parse_packet(&buf[..len]);
        for command in commands {
            match command.kind {
                CommandKind::Ack if command.acked_sequence == 1 => {
                    assert_eq!(command.ack_send_time, 7, "ack echoes our timestamp");
                    got_ack = true;
                }
                CommandKind::Reliable => {
                    if echoed.is_none() {
                        echoed = Some(command.payload.as_deref().unwrap_or(&[]).to_vec());
                    }
                    // retire the echo on the server side
                    let ack = OutgoingCommand::ack(
                        command.channel,
                        command.reliable_sequence,
                        server_time,
                    );
                    client
                        .send_to(&client_packet(response.peer_id, 8, vec![ack]), worker_addr)
                        .await
                        .unwrap();
                }
                _ => {}
            }
        }
    }

    assert!(got_ack, "the reliable send must be acknowledged");
    assert_eq!(echoed.expect("echo within the timeout"), b"hello");
}

/// A retried connect request is answered from the cache: same peer id, same
/// worker port, still a single admitted connection.
#[tokio::test]
async fn test_duplicate_connect_is_idempotent() {
    let listen_port = 32000 + (std::process::id() % 10000) as u16;
    let transport = UdpTransport::bind(test_config(listen_port), Arc::new(EchoApplication))
        .await
        .unwrap();
    let _lanes = transport.run();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (first, _) = connect(&client, listen_port).await;
    let (second, _) = connect(&client, listen_port).await;

    assert_eq!(first.peer_id, second.peer_id);
    assert_eq!(first.worker_port, second.worker_port);
    assert_eq!(transport.connection_count(), 1);
}

/// Connect requests with a foreign protocol version are dropped without any
/// response.
#[tokio::test]
async fn test_unknown_version_is_silently_dropped() {
    let listen_port = 43000 + (std::process::id() % 10000) as u16;
    let transport = UdpTransport::bind(test_config(listen_port), Arc::new(EchoApplication))
        .await
        .unwrap();
    let _lanes = transport.run();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = ConnectRequest {
        version: PROTOCOL_VERSION + 1,
        client_time: 42,
        channel_count: 5,
        mtu: 1350,
        disconnect_timeout_ms: 5000,
        crc_enabled: false,
        client_public_key: KeyExchange::generate().public_bytes().to_vec(),
    };
    client
        .send_to(&request.encode(), ("127.0.0.1", listen_port))
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let received = timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await;
    assert!(received.is_err(), "no response may leak for a bad version");
    assert_eq!(transport.connection_count(), 0);
}
