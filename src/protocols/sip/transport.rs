//! SIP transport: UDP datagram and TCP stream listeners
//!
//! Each inbound datagram is one SIP message; TCP is framed by
//! Content-Length. Parse failures are dropped and logged here so they never
//! reach the transaction layer. Max-Forwards is enforced at this boundary:
//! exhausted requests are answered 483 without further processing.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::SipMessage;
use super::parser::{parse_message, StreamFramer};
use crate::config::SipConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => f.write_str("UDP"),
            Self::Tcp => f.write_str("TCP"),
        }
    }
}

/// Inbound traffic surfaced to the transaction layer.
#[derive(Debug)]
pub enum TransportEvent {
    MessageReceived {
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    },
}

enum BoundaryOutcome {
    Deliver(SipMessage),
    Bounce(SipMessage),
}

/// Reject requests no element should forward further: exhausted
/// Max-Forwards (483) and non-SIP URI schemes (416). Surviving requests
/// have Max-Forwards decremented in place.
fn boundary_check(mut message: SipMessage) -> BoundaryOutcome {
    if message.is_request() {
        if let Some(uri) = message.request_uri() {
            if !uri.starts_with("sip:") && !uri.starts_with("sips:") {
                return BoundaryOutcome::Bounce(SipMessage::response_for(
                    &message,
                    416,
                    "Unsupported URI Scheme",
                ));
            }
        }

        match message.max_forwards() {
            Some(0) => {
                return BoundaryOutcome::Bounce(SipMessage::response_for(
                    &message,
                    483,
                    "Too Many Hops",
                ));
            }
            Some(n) => {
                message.set_header("Max-Forwards", (n - 1).to_string());
            }
            None => {}
        }
    }
    BoundaryOutcome::Deliver(message)
}

pub struct SipTransportLayer {
    config: SipConfig,
    udp_socket: Arc<UdpSocket>,
    tcp_connections: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    shutdown: CancellationToken,
}

impl SipTransportLayer {
    /// Bind the configured listening sockets. A bind failure here is fatal
    /// for the process.
    pub async fn bind(config: SipConfig) -> Result<Self> {
        let udp_addr = SocketAddr::new(config.bind_address, config.listen_port);
        let udp_socket = UdpSocket::bind(udp_addr)
            .await
            .map_err(|e| Error::network(format!("Failed to bind SIP UDP {}: {}", udp_addr, e)))?;
        info!("SIP transport listening on udp://{}", udp_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            udp_socket: Arc::new(udp_socket),
            tcp_connections: Arc::new(DashMap::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_socket.local_addr()?)
    }

    pub async fn start(&mut self) -> Result<()> {
        let socket = Arc::clone(&self.udp_socket);
        let event_tx = self.event_tx.clone();
        let max_size = self.config.max_message_size;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = Self::udp_receive_loop(socket, event_tx, max_size) => {}
            }
        });

        if self.config.tcp_enabled {
            let tcp_addr = SocketAddr::new(self.config.bind_address, self.config.tcp_port);
            let listener = TcpListener::bind(tcp_addr).await.map_err(|e| {
                Error::network(format!("Failed to bind SIP TCP {}: {}", tcp_addr, e))
            })?;
            info!("SIP transport listening on tcp://{}", tcp_addr);

            let event_tx = self.event_tx.clone();
            let connections = Arc::clone(&self.tcp_connections);
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = Self::tcp_accept_loop(listener, connections, event_tx) => {}
                }
            });
        }

        Ok(())
    }

    async fn udp_receive_loop(
        socket: Arc<UdpSocket>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        max_size: usize,
    ) {
        let mut buffer = vec![0u8; 65536];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    if size > max_size {
                        warn!("Dropping oversize SIP datagram ({} bytes) from {}", size, source);
                        continue;
                    }
                    // Bare keep-alive CRLFs are normal, not malformed.
                    if buffer[..size].iter().all(|b| b"\r\n ".contains(b)) {
                        continue;
                    }
                    match parse_message(&buffer[..size]) {
                        Ok(message) => {
                            Self::deliver(message, source, TransportKind::Udp, &socket, &event_tx)
                                .await;
                        }
                        Err(e) => {
                            debug!("Dropping malformed SIP datagram from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // Port-unreachable surfaces here on some platforms; the
                    // socket itself is still usable.
                    warn!("SIP UDP receive error: {}", e);
                }
            }
        }
    }

    /// Transport-boundary checks and delivery of one parsed message.
    async fn deliver(
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
        udp_socket: &UdpSocket,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match boundary_check(message) {
            BoundaryOutcome::Deliver(message) => {
                let _ = event_tx.send(TransportEvent::MessageReceived {
                    message,
                    source,
                    transport,
                });
            }
            BoundaryOutcome::Bounce(response) => {
                let _ = udp_socket.send_to(&response.encode(), source).await;
            }
        }
    }

    async fn tcp_accept_loop(
        listener: TcpListener,
        connections: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("Accepted SIP TCP connection from {}", peer);
                    let (write_tx, write_rx) = mpsc::channel(64);
                    connections.insert(peer, write_tx);

                    let connections = Arc::clone(&connections);
                    let event_tx = event_tx.clone();
                    tokio::spawn(async move {
                        Self::tcp_connection_loop(stream, peer, write_rx, &event_tx).await;
                        connections.remove(&peer);
                        debug!("SIP TCP connection from {} closed", peer);
                    });
                }
                Err(e) => {
                    error!("SIP TCP accept error: {}", e);
                }
            }
        }
    }

    async fn tcp_connection_loop(
        mut stream: TcpStream,
        peer: SocketAddr,
        mut write_rx: mpsc::Receiver<Bytes>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let mut framer = StreamFramer::new();
        let mut buffer = vec![0u8; 8192];

        loop {
            tokio::select! {
                read = stream.read(&mut buffer) => {
                    match read {
                        Ok(0) => return,
                        Ok(size) => {
                            framer.push(&buffer[..size]);
                            loop {
                                match framer.next_message() {
                                    Ok(Some(message)) => match boundary_check(message) {
                                        BoundaryOutcome::Deliver(message) => {
                                            let _ = event_tx.send(TransportEvent::MessageReceived {
                                                message,
                                                source: peer,
                                                transport: TransportKind::Tcp,
                                            });
                                        }
                                        BoundaryOutcome::Bounce(response) => {
                                            if stream.write_all(&response.encode()).await.is_err() {
                                                return;
                                            }
                                        }
                                    },
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!("SIP TCP stream from {} unframeable: {}", peer, e);
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("SIP TCP read error from {}: {}", peer, e);
                            return;
                        }
                    }
                }
                outbound = write_rx.recv() => {
                    match outbound {
                        Some(data) => {
                            if let Err(e) = stream.write_all(&data).await {
                                debug!("SIP TCP write error to {}: {}", peer, e);
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Serialize and send a message toward `target`. TCP falls back to UDP
    /// when no connection to the peer is open; the peer's own REGISTER
    /// opened one in every case that matters.
    pub async fn send(
        &self,
        message: &SipMessage,
        target: SocketAddr,
        transport: TransportKind,
    ) -> Result<()> {
        let wire = message.encode();
        match transport {
            TransportKind::Udp => {
                self.udp_socket
                    .send_to(&wire, target)
                    .await
                    .map_err(|e| Error::network(format!("SIP UDP send to {}: {}", target, e)))?;
            }
            TransportKind::Tcp => {
                if let Some(conn) = self.tcp_connections.get(&target) {
                    conn.send(wire)
                        .await
                        .map_err(|_| Error::network(format!("SIP TCP connection to {} gone", target)))?;
                } else {
                    self.udp_socket
                        .send_to(&wire, target)
                        .await
                        .map_err(|e| Error::network(format!("SIP send to {}: {}", target, e)))?;
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.tcp_connections.clear();
        info!("SIP transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;
    use crate::protocols::sip::SipMethod;

    fn test_config(port: u16) -> SipConfig {
        let mut config = PbxConfig::default_config().sip;
        config.bind_address = "127.0.0.1".parse().unwrap();
        config.listen_port = port;
        config
    }

    #[tokio::test]
    async fn test_udp_message_delivery() {
        let mut transport = SipTransportLayer::bind(test_config(0)).await.unwrap();
        let mut events = transport.take_event_receiver().unwrap();
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = "OPTIONS sip:rivet.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKt1\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:test@rivet.local>;tag=t\r\n\
            To: <sip:rivet.local>\r\n\
            Call-ID: transport-test-1\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        client.send_to(raw.as_bytes(), addr).await.unwrap();

        let event = events.recv().await.unwrap();
        let TransportEvent::MessageReceived { message, transport: kind, .. } = event;
        assert_eq!(message.method(), Some(&SipMethod::Options));
        assert_eq!(kind, TransportKind::Udp);
        // Decremented at the transport boundary.
        assert_eq!(message.max_forwards(), Some(69));
    }

    #[tokio::test]
    async fn test_exhausted_max_forwards_bounced() {
        let mut transport = SipTransportLayer::bind(test_config(0)).await.unwrap();
        let mut events = transport.take_event_receiver().unwrap();
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = "OPTIONS sip:rivet.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKt2\r\n\
            Max-Forwards: 0\r\n\
            From: <sip:test@rivet.local>;tag=t\r\n\
            To: <sip:rivet.local>\r\n\
            Call-ID: transport-test-2\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        client.send_to(raw.as_bytes(), addr).await.unwrap();

        let mut buffer = vec![0u8; 2048];
        let (size, _) = client.recv_from(&mut buffer).await.unwrap();
        let response = parse_message(&buffer[..size]).unwrap();
        assert_eq!(response.status_code(), Some(483));

        // Nothing was surfaced upward.
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_datagram_dropped() {
        let mut transport = SipTransportLayer::bind(test_config(0)).await.unwrap();
        let mut events = transport.take_event_receiver().unwrap();
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"not sip at all", addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
