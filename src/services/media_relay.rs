//! Per-call RTP relay with symmetric endpoint learning
//!
//! One relay per active call: an A-side socket facing the caller and a
//! B-side socket facing the callee, each with the odd RTCP sibling port
//! reserved. Endpoints are learned from inbound packet sources (symmetric
//! RTP), with SDP addresses used only as initial hints. The relay never
//! waits for both endpoints: a side's packets start flowing the moment the
//! peer side is known, which is what keeps early media from going silent.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{PortRange, RtpConfig};
use crate::protocols::dtmf::{DtmfSender, Rfc2833Decoder};
use crate::protocols::rtp::{RtpHeader, RtpPacket, ToneGenerator, RTP_HEADER_LEN};
use crate::services::qos::{CallQos, Direction};
use crate::{Error, Result};

/// The two legs of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySide {
    A,
    B,
}

impl RelaySide {
    pub fn peer(&self) -> RelaySide {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Traffic arriving on a side flows toward the other.
    fn rx_direction(&self) -> Direction {
        match self {
            Self::A => Direction::AToB,
            Self::B => Direction::BToA,
        }
    }
}

/// Back-channel notifications from the relay to its owning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// No packets in either direction for the configured window.
    SilenceTimeout,
    /// Send errors in both directions for the configured number of
    /// consecutive seconds.
    SustainedIcmpErrors,
}

/// Allocates even/odd RTP/RTCP port pairs from the configured range.
/// A single free-list behind a mutex; allocations are O(1).
pub struct RtpPortAllocator {
    free: Mutex<VecDeque<u16>>,
}

impl RtpPortAllocator {
    pub fn new(range: &PortRange) -> Self {
        let free = (range.min..range.max).step_by(2).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Pop the next even RTP port; the odd sibling is implicitly reserved.
    pub fn allocate(&self) -> Result<u16> {
        self.free
            .lock()
            .expect("port allocator lock")
            .pop_front()
            .ok_or_else(|| Error::resource_exhausted("No free RTP ports"))
    }

    pub fn release(&self, port: u16) {
        self.free.lock().expect("port allocator lock").push_back(port);
    }

    pub fn available(&self) -> usize {
        self.free.lock().expect("port allocator lock").len()
    }
}

#[derive(Debug, Default)]
struct SideState {
    learned: Option<SocketAddr>,
    ssrc: Option<u32>,
    /// Extra delivery addresses for traffic leaving toward this side
    /// (paging fan-out).
    fanout: Vec<SocketAddr>,
}

struct RelayEndpoint {
    socket: Arc<UdpSocket>,
    rtp_port: u16,
    state: Mutex<SideState>,
    dtmf_decoder: Mutex<Rfc2833Decoder>,
    /// Send errors toward this side's learned endpoint.
    send_errors: AtomicU64,
}

impl RelayEndpoint {
    fn learned(&self) -> Option<SocketAddr> {
        self.state.lock().expect("relay state lock").learned
    }
}

pub struct RtpRelay {
    call_id: String,
    side_a: RelayEndpoint,
    side_b: RelayEndpoint,
    qos: Arc<CallQos>,
    dtmf: DtmfSender,
    dtmf_payload_type: u8,
    silence_timeout: Duration,
    icmp_error_threshold: u32,
    event_tx: mpsc::UnboundedSender<RelayEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Attempts before concluding the port range is unusable.
const BIND_ATTEMPTS: usize = 16;

fn bind_rtp_socket(bind_ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let domain = if bind_ip.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    // Media bursts outrun the default buffer on loaded hosts.
    let _ = socket.set_recv_buffer_size(262_144);
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::new(bind_ip, port).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

impl RtpRelay {
    /// Allocate ports and bind both sides.
    pub fn bind(
        call_id: &str,
        config: &RtpConfig,
        bind_ip: IpAddr,
        allocator: &RtpPortAllocator,
        qos: Arc<CallQos>,
        dtmf: DtmfSender,
    ) -> Result<Arc<Self>> {
        let (socket_a, port_a) = Self::bind_side(bind_ip, allocator)?;
        let (socket_b, port_b) = match Self::bind_side(bind_ip, allocator) {
            Ok(bound) => bound,
            Err(e) => {
                allocator.release(port_a);
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        info!(
            "RTP relay for call {} bound on ports {}/{} (A) and {}/{} (B)",
            call_id,
            port_a,
            port_a + 1,
            port_b,
            port_b + 1
        );

        Ok(Arc::new(Self {
            call_id: call_id.to_string(),
            side_a: RelayEndpoint {
                socket: Arc::new(socket_a),
                rtp_port: port_a,
                state: Mutex::new(SideState::default()),
                dtmf_decoder: Mutex::new(Rfc2833Decoder::new()),
                send_errors: AtomicU64::new(0),
            },
            side_b: RelayEndpoint {
                socket: Arc::new(socket_b),
                rtp_port: port_b,
                state: Mutex::new(SideState::default()),
                dtmf_decoder: Mutex::new(Rfc2833Decoder::new()),
                send_errors: AtomicU64::new(0),
            },
            qos,
            dtmf,
            dtmf_payload_type: config.dtmf_payload_type,
            silence_timeout: Duration::from_secs(config.silence_timeout as u64),
            icmp_error_threshold: config.icmp_error_threshold,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }))
    }

    fn bind_side(bind_ip: IpAddr, allocator: &RtpPortAllocator) -> Result<(UdpSocket, u16)> {
        for _ in 0..BIND_ATTEMPTS {
            let port = allocator.allocate()?;
            match bind_rtp_socket(bind_ip, port) {
                Ok(socket) => return Ok((socket, port)),
                Err(e) => {
                    // Something else squats on the port; skip the pair.
                    debug!("RTP port {} unusable: {}", port, e);
                }
            }
        }
        Err(Error::resource_exhausted("No bindable RTP port found"))
    }

    fn endpoint(&self, side: RelaySide) -> &RelayEndpoint {
        match side {
            RelaySide::A => &self.side_a,
            RelaySide::B => &self.side_b,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn rtp_port(&self, side: RelaySide) -> u16 {
        self.endpoint(side).rtp_port
    }

    pub fn local_addr(&self, side: RelaySide) -> Result<SocketAddr> {
        Ok(self.endpoint(side).socket.local_addr()?)
    }

    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.event_rx.lock().expect("relay state lock").take()
    }

    pub fn learned_endpoint(&self, side: RelaySide) -> Option<SocketAddr> {
        self.endpoint(side).learned()
    }

    /// Record an endpoint from SDP as an initial hint. Packets already
    /// seen win: the learned-from-the-wire value prevails over the
    /// advertised one.
    pub fn hint_endpoint(&self, side: RelaySide, addr: SocketAddr) {
        let mut state = self.endpoint(side).state.lock().expect("relay state lock");
        if state.learned.is_none() {
            debug!("Call {} side {:?} hinted to {}", self.call_id, side, addr);
            state.learned = Some(addr);
        }
    }

    /// Add a copy-delivery address for traffic flowing toward `side`.
    /// Used by paging to stream one caller to a whole group.
    pub fn add_fanout_target(&self, side: RelaySide, addr: SocketAddr) {
        let mut state = self.endpoint(side).state.lock().expect("relay state lock");
        if !state.fanout.contains(&addr) {
            state.fanout.push(addr);
        }
    }

    /// Replace a side's endpoint after a re-INVITE changed the SDP. SSRC
    /// validation restarts; QoS counters do not.
    pub fn update_endpoint(&self, side: RelaySide, addr: SocketAddr) {
        let mut state = self.endpoint(side).state.lock().expect("relay state lock");
        info!("Call {} side {:?} moved to {}", self.call_id, side, addr);
        state.learned = Some(addr);
        state.ssrc = None;
    }

    pub fn start(self: &Arc<Self>) {
        for side in [RelaySide::A, RelaySide::B] {
            let relay = Arc::clone(self);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = relay.receive_loop(side) => {}
                }
            });
        }

        let relay = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = relay.monitor_loop() => {}
            }
        });
    }

    async fn receive_loop(self: Arc<Self>, side: RelaySide) {
        let socket = Arc::clone(&self.endpoint(side).socket);
        let mut buffer = vec![0u8; 2048];

        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    self.handle_packet(side, &buffer[..size], source).await;
                }
                Err(e) => {
                    // On some platforms an ICMP unreachable for a prior
                    // send surfaces as a recv error; count it against the
                    // side we send toward.
                    self.endpoint(side).send_errors.fetch_add(1, Ordering::Relaxed);
                    trace!("RTP recv error on call {} side {:?}: {}", self.call_id, side, e);
                }
            }
        }
    }

    async fn handle_packet(&self, side: RelaySide, data: &[u8], source: SocketAddr) {
        if data.len() < RTP_HEADER_LEN {
            trace!("Runt packet on call {} side {:?}", self.call_id, side);
            return;
        }
        let Ok(header) = RtpHeader::peek(data) else {
            return;
        };

        // Symmetric learning with SSRC validation: first source claims the
        // side; afterwards a packet may move the endpoint only when it
        // carries the same SSRC (NAT rebind) or comes from the already
        // learned address (SSRC change via re-INVITE).
        {
            let endpoint = self.endpoint(side);
            let mut state = endpoint.state.lock().expect("relay state lock");
            match (state.ssrc, state.learned) {
                (None, _) => {
                    state.ssrc = Some(header.ssrc);
                    if state.learned != Some(source) {
                        debug!(
                            "Call {} side {:?} learned endpoint {} (ssrc {:08x})",
                            self.call_id, side, source, header.ssrc
                        );
                        state.learned = Some(source);
                    }
                }
                (Some(ssrc), learned) => {
                    if ssrc == header.ssrc {
                        if learned != Some(source) {
                            info!(
                                "Call {} side {:?} endpoint moved {} -> {} (symmetric RTP)",
                                self.call_id,
                                side,
                                learned.map(|a| a.to_string()).unwrap_or_default(),
                                source
                            );
                            state.learned = Some(source);
                        }
                    } else if learned == Some(source) {
                        state.ssrc = Some(header.ssrc);
                    } else {
                        trace!(
                            "Call {} side {:?}: ignoring packet from {} with foreign ssrc",
                            self.call_id,
                            side,
                            source
                        );
                        return;
                    }
                }
            }
        }

        // QoS tap for the direction this packet travels.
        {
            let mut stats = self
                .qos
                .direction(side.rx_direction())
                .lock()
                .expect("qos lock");
            let payload_len = RtpHeader::payload_offset(data)
                .map(|offset| data.len() - offset)
                .unwrap_or(0);
            stats.on_packet(&header, payload_len, Instant::now());
        }

        // In-band DTMF tap (RFC 2833 events on the negotiated PT).
        if header.payload_type == self.dtmf_payload_type {
            if let Ok(offset) = RtpHeader::payload_offset(data) {
                let event = self
                    .endpoint(side)
                    .dtmf_decoder
                    .lock()
                    .expect("relay state lock")
                    .feed(&data[offset..]);
                if let Some(event) = event {
                    debug!("Call {} in-band DTMF digit {}", self.call_id, event.digit);
                    self.dtmf.push(event);
                }
            }
        }

        // Forward verbatim to the peer when its endpoint is known, sending
        // from the peer-side socket so the far end sees the port it is
        // already talking to.
        let peer = self.endpoint(side.peer());
        let (target, fanout) = {
            let state = peer.state.lock().expect("relay state lock");
            (state.learned, state.fanout.clone())
        };

        for extra in fanout {
            let _ = peer.socket.send_to(data, extra).await;
        }

        let Some(target) = target else {
            trace!(
                "Call {} side {:?}: peer endpoint unknown, packet not forwarded",
                self.call_id,
                side.peer()
            );
            return;
        };
        if let Err(e) = peer.socket.send_to(data, target).await {
            peer.send_errors.fetch_add(1, Ordering::Relaxed);
            let mut stats = self
                .qos
                .direction(side.rx_direction())
                .lock()
                .expect("qos lock");
            stats.record_icmp_error();
            trace!("Call {} forward to {} failed: {}", self.call_id, target, e);
        }
    }

    /// Watch for silence and for sustained delivery failures.
    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        let mut silence_reported = false;
        let mut error_seconds = 0u32;
        let mut last_errors = (0u64, 0u64);
        let mut last_error_check = Instant::now();

        loop {
            ticker.tick().await;
            let now = Instant::now();

            let last_a = self
                .qos
                .a_to_b
                .lock()
                .expect("qos lock")
                .last_arrival;
            let last_b = self
                .qos
                .b_to_a
                .lock()
                .expect("qos lock")
                .last_arrival;
            let idle_since = match (last_a, last_b) {
                (Some(a), Some(b)) => a.max(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => self.started_at,
            };

            if now.duration_since(idle_since) >= self.silence_timeout {
                if !silence_reported {
                    warn!(
                        "Call {}: no RTP in either direction for {:?}",
                        self.call_id, self.silence_timeout
                    );
                    silence_reported = true;
                    let _ = self.event_tx.send(RelayEvent::SilenceTimeout);
                }
            } else {
                silence_reported = false;
            }

            if now.duration_since(last_error_check) >= Duration::from_secs(1) {
                last_error_check = now;
                let errors = (
                    self.side_a.send_errors.load(Ordering::Relaxed),
                    self.side_b.send_errors.load(Ordering::Relaxed),
                );
                if errors.0 > last_errors.0 && errors.1 > last_errors.1 {
                    error_seconds += 1;
                    if error_seconds == self.icmp_error_threshold {
                        let _ = self.event_tx.send(RelayEvent::SustainedIcmpErrors);
                    }
                } else {
                    error_seconds = 0;
                }
                last_errors = errors;
            }
        }
    }

    /// Inject a locally generated tone toward one side (the pre-voicemail
    /// beep). Sent from that side's socket with its own SSRC.
    pub async fn play_tone(&self, side: RelaySide, frequency: f64, duration_ms: u32) -> Result<()> {
        let endpoint = self.endpoint(side);
        let Some(target) = endpoint.learned() else {
            return Err(Error::rtp("Cannot play tone: endpoint not learned"));
        };

        let mut tone = ToneGenerator::new(frequency);
        let ssrc = rand::random::<u32>();
        let mut sequence = rand::random::<u16>();
        let mut timestamp = rand::random::<u32>();
        let mut ticker = tokio::time::interval(Duration::from_millis(20));

        for frame_index in 0..ToneGenerator::frames_for(duration_ms) {
            ticker.tick().await;
            let mut packet = RtpPacket::new(0, sequence, timestamp, ssrc);
            packet.marker = frame_index == 0;
            packet.payload = tone.next_frame().into();
            endpoint.socket.send_to(&packet.encode(), target).await?;
            sequence = sequence.wrapping_add(1);
            timestamp = timestamp.wrapping_add(160);
        }
        Ok(())
    }

    /// Stop the relay tasks and release the ports back to the allocator.
    pub fn shutdown(&self, allocator: &RtpPortAllocator) {
        self.cancel.cancel();
        allocator.release(self.side_a.rtp_port);
        allocator.release(self.side_b.rtp_port);
        info!("RTP relay for call {} stopped", self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;
    use crate::protocols::dtmf::dtmf_queue;
    use crate::services::qos::QosRegistry;

    struct Fixture {
        relay: Arc<RtpRelay>,
        allocator: Arc<RtpPortAllocator>,
        registry: Arc<QosRegistry>,
        dtmf_rx: mpsc::Receiver<crate::protocols::dtmf::DtmfEvent>,
    }

    fn rtp_config() -> RtpConfig {
        let mut config = PbxConfig::default_config().rtp;
        config.port_range = PortRange {
            min: 40000,
            max: 40100,
        };
        config.silence_timeout = 1;
        config
    }

    fn fixture() -> Fixture {
        let config = rtp_config();
        let allocator = Arc::new(RtpPortAllocator::new(&config.port_range));
        let registry = Arc::new(QosRegistry::new(PbxConfig::default_config().qos));
        let qos = registry.register("test-call");
        let (dtmf_tx, dtmf_rx) = dtmf_queue();
        let relay = RtpRelay::bind(
            "test-call",
            &config,
            "127.0.0.1".parse().unwrap(),
            &allocator,
            qos,
            dtmf_tx,
        )
        .unwrap();
        relay.start();
        Fixture {
            relay,
            allocator,
            registry,
            dtmf_rx,
        }
    }

    fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut packet = RtpPacket::new(0, seq, seq as u32 * 160, ssrc);
        packet.payload = bytes::Bytes::copy_from_slice(payload);
        packet.encode().to_vec()
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_forwarding_and_symmetric_learning() {
        let f = fixture();
        let addr_a = f.relay.local_addr(RelaySide::A).unwrap();
        let addr_b = f.relay.local_addr(RelaySide::B).unwrap();

        let caller = client().await;
        let callee = client().await;

        // Caller speaks first; callee is unknown, so nothing forwards yet,
        // but the caller endpoint is learned.
        caller
            .send_to(&rtp_packet(1, 0xAAAA, b"early"), addr_a)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.relay.learned_endpoint(RelaySide::A),
            Some(caller.local_addr().unwrap())
        );

        // Callee's first packet is both learned and forwarded to the
        // already-known caller.
        callee
            .send_to(&rtp_packet(1, 0xBBBB, b"hello"), addr_b)
            .await
            .unwrap();

        let mut buffer = vec![0u8; 2048];
        let (size, from) =
            tokio::time::timeout(Duration::from_secs(1), caller.recv_from(&mut buffer))
                .await
                .expect("caller should receive forwarded packet")
                .unwrap();
        assert_eq!(from, addr_a);
        let forwarded = RtpPacket::decode(bytes::Bytes::copy_from_slice(&buffer[..size])).unwrap();
        assert_eq!(forwarded.payload.as_ref(), b"hello");
        assert_eq!(forwarded.ssrc, 0xBBBB);

        // And now caller → callee flows too.
        caller
            .send_to(&rtp_packet(2, 0xAAAA, b"voice"), addr_a)
            .await
            .unwrap();
        let (size, _) =
            tokio::time::timeout(Duration::from_secs(1), callee.recv_from(&mut buffer))
                .await
                .expect("callee should receive forwarded packet")
                .unwrap();
        let forwarded = RtpPacket::decode(bytes::Bytes::copy_from_slice(&buffer[..size])).unwrap();
        assert_eq!(forwarded.payload.as_ref(), b"voice");

        let report = f.registry.report("test-call").unwrap();
        assert_eq!(report.a_to_b.packets_received, 2);
        assert_eq!(report.b_to_a.packets_received, 1);
    }

    #[tokio::test]
    async fn test_sdp_hint_enables_forwarding_before_first_packet() {
        let f = fixture();
        let addr_b = f.relay.local_addr(RelaySide::B).unwrap();

        let caller = client().await;
        let callee = client().await;

        // The INVITE SDP told us where the caller listens; no caller
        // packet has been seen.
        f.relay
            .hint_endpoint(RelaySide::A, caller.local_addr().unwrap());

        callee
            .send_to(&rtp_packet(1, 0xCCCC, b"ring"), addr_b)
            .await
            .unwrap();

        let mut buffer = vec![0u8; 2048];
        let result =
            tokio::time::timeout(Duration::from_secs(1), caller.recv_from(&mut buffer)).await;
        assert!(result.is_ok(), "early media must reach the hinted caller");
    }

    #[tokio::test]
    async fn test_nat_rebind_follows_new_port() {
        let f = fixture();
        let addr_a = f.relay.local_addr(RelaySide::A).unwrap();
        let addr_b = f.relay.local_addr(RelaySide::B).unwrap();

        let caller = client().await;
        let callee = client().await;

        caller
            .send_to(&rtp_packet(1, 0xAAAA, b"a"), addr_a)
            .await
            .unwrap();
        callee
            .send_to(&rtp_packet(1, 0xBBBB, b"b"), addr_b)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // NAT rebind: same SSRC from a new source port.
        let rebound = client().await;
        rebound
            .send_to(&rtp_packet(2, 0xAAAA, b"rebound"), addr_a)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.relay.learned_endpoint(RelaySide::A),
            Some(rebound.local_addr().unwrap())
        );

        // Return traffic goes to the new port within one packet.
        callee
            .send_to(&rtp_packet(2, 0xBBBB, b"to-new"), addr_b)
            .await
            .unwrap();
        let mut buffer = vec![0u8; 2048];
        let result =
            tokio::time::timeout(Duration::from_secs(1), rebound.recv_from(&mut buffer)).await;
        assert!(result.is_ok(), "forwarding must follow the rebind");
    }

    #[tokio::test]
    async fn test_foreign_ssrc_from_unknown_source_ignored() {
        let f = fixture();
        let addr_a = f.relay.local_addr(RelaySide::A).unwrap();

        let caller = client().await;
        caller
            .send_to(&rtp_packet(1, 0xAAAA, b"a"), addr_a)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // An interloper with a different SSRC must not steal the endpoint.
        let interloper = client().await;
        interloper
            .send_to(&rtp_packet(1, 0xEEEE, b"evil"), addr_a)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            f.relay.learned_endpoint(RelaySide::A),
            Some(caller.local_addr().unwrap())
        );
    }

    #[tokio::test]
    async fn test_zero_length_payload_forwarded() {
        let f = fixture();
        let addr_a = f.relay.local_addr(RelaySide::A).unwrap();
        let addr_b = f.relay.local_addr(RelaySide::B).unwrap();

        let caller = client().await;
        let callee = client().await;
        callee
            .send_to(&rtp_packet(1, 0xBBBB, b"b"), addr_b)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        caller
            .send_to(&rtp_packet(1, 0xAAAA, b""), addr_a)
            .await
            .unwrap();
        let mut buffer = vec![0u8; 2048];
        let (size, _) =
            tokio::time::timeout(Duration::from_secs(1), callee.recv_from(&mut buffer))
                .await
                .expect("header-only packet is still forwarded")
                .unwrap();
        assert_eq!(size, RTP_HEADER_LEN);
    }

    #[tokio::test]
    async fn test_inband_dtmf_reaches_queue() {
        let mut f = fixture();
        let addr_a = f.relay.local_addr(RelaySide::A).unwrap();
        let caller = client().await;

        // RFC 2833 event for digit 7 on payload type 101.
        let mut packet = RtpPacket::new(101, 5, 800, 0xAAAA);
        packet.payload = bytes::Bytes::from_static(&[7, 0x0A, 0x00, 0x50]);
        caller.send_to(&packet.encode(), addr_a).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), f.dtmf_rx.recv())
            .await
            .expect("dtmf event")
            .unwrap();
        assert_eq!(event.digit, '7');
    }

    #[tokio::test]
    async fn test_silence_timeout_event() {
        let f = fixture();
        let mut events = f.relay.take_event_receiver().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("silence event within timeout")
            .unwrap();
        assert_eq!(event, RelayEvent::SilenceTimeout);
    }

    #[tokio::test]
    async fn test_shutdown_returns_ports() {
        let f = fixture();
        let before = f.allocator.available();
        f.relay.shutdown(&f.allocator);
        assert_eq!(f.allocator.available(), before + 2);
    }

    #[test]
    fn test_allocator_exhaustion() {
        let allocator = RtpPortAllocator::new(&PortRange {
            min: 50000,
            max: 50004,
        });
        assert_eq!(allocator.available(), 2);
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert!(allocator.allocate().is_err());
        allocator.release(50000);
        assert_eq!(allocator.allocate().unwrap(), 50000);
    }
}
