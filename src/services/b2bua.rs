//! B2BUA call state machine
//!
//! Each call couples two SIP dialogs (caller leg, callee leg) around one
//! RTP relay. Every call runs as its own task: all inputs — SIP messages,
//! transaction timeouts, relay back-channel events, DTMF digits, admin
//! requests — arrive as tagged events on one channel and feed a single
//! handler, so a call never takes a lock around its own state and one
//! call's failure never touches another.
//!
//! State progression for a routed call:
//! Idle → AwaitingCalleeRing → CalleeAlerting → Connecting → Established
//! → Releasing → Terminated, with Cancelling and RoutingToVoicemail as
//! side exits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CallConfig, RtpConfig};
use crate::protocols::dtmf::{dtmf_queue, parse_info_body, DtmfEvent};
use crate::protocols::sdp::SessionDescription;
use crate::protocols::sip::message::{uri_from_name_addr, uri_host_port, uri_user};
use crate::protocols::sip::{generate_call_id, generate_tag, SipMessage, SipMethod, TransportKind};
use crate::signaling::{Dialog, SipSender, TransactionKey};
use crate::services::cdr::{CallRecord, CdrSink, Disposition};
use crate::services::codecs::CodecNegotiator;
use crate::services::features::{
    CallerContext, FeatureAction, FeatureRouter, LocalFlow, VoicemailBridge,
};
use crate::services::alarms::{AlarmManager, AlarmSeverity, AlarmType};
use crate::services::media_relay::{RelayEvent, RelaySide, RtpPortAllocator, RtpRelay};
use crate::services::qos::QosRegistry;
use crate::services::registrar::Registrar;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    AwaitingCalleeRing,
    CalleeAlerting,
    Connecting,
    Established,
    Cancelling,
    RoutingToVoicemail,
    Releasing,
    Terminated,
}

/// Inputs to a call task.
#[derive(Debug)]
pub enum CallEvent {
    Request {
        key: TransactionKey,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    },
    Response {
        message: SipMessage,
    },
    TransactionTimeout {
        method: SipMethod,
    },
    Relay(RelayEvent),
    AdminHangup,
}

/// Read-only view of a call for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub id: String,
    pub caller: String,
    pub callee: String,
    pub state: CallState,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub negotiated_payload_type: Option<u8>,
}

pub struct CallHandle {
    pub snapshot: Arc<RwLock<CallSnapshot>>,
    event_tx: mpsc::UnboundedSender<CallEvent>,
}

/// How the PBX names itself on the wire.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub server_ip: std::net::IpAddr,
    pub sip_port: u16,
    pub domain: String,
    pub user_agent: String,
}

impl LocalIdentity {
    pub fn contact(&self) -> String {
        format!("sip:pbx@{}:{}", self.server_ip, self.sip_port)
    }

    pub fn uri_for(&self, user: &str) -> String {
        format!("sip:{}@{}", user, self.domain)
    }
}

pub struct B2buaService {
    call_config: CallConfig,
    rtp_config: RtpConfig,
    identity: LocalIdentity,
    registrar: Arc<Registrar>,
    negotiator: Arc<CodecNegotiator>,
    allocator: Arc<RtpPortAllocator>,
    qos: Arc<QosRegistry>,
    features: Arc<FeatureRouter>,
    voicemail: Arc<VoicemailBridge>,
    cdr: Arc<dyn CdrSink>,
    alarms: Arc<AlarmManager>,
    sip: SipSender,
    calls: DashMap<String, CallHandle>,
    /// SIP Call-ID (either leg) → internal call id.
    leg_index: DashMap<String, String>,
}

impl B2buaService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_config: CallConfig,
        rtp_config: RtpConfig,
        identity: LocalIdentity,
        registrar: Arc<Registrar>,
        negotiator: Arc<CodecNegotiator>,
        allocator: Arc<RtpPortAllocator>,
        qos: Arc<QosRegistry>,
        features: Arc<FeatureRouter>,
        voicemail: Arc<VoicemailBridge>,
        cdr: Arc<dyn CdrSink>,
        alarms: Arc<AlarmManager>,
        sip: SipSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_config,
            rtp_config,
            identity,
            registrar,
            negotiator,
            allocator,
            qos,
            features,
            voicemail,
            cdr,
            alarms,
            sip,
            calls: DashMap::new(),
            leg_index: DashMap::new(),
        })
    }

    pub fn active_call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn active_calls(&self) -> Vec<CallSnapshot> {
        self.calls
            .iter()
            .map(|entry| entry.value().snapshot.read().expect("call snapshot lock").clone())
            .collect()
    }

    pub fn call_snapshot(&self, id: &str) -> Option<CallSnapshot> {
        self.calls
            .get(id)
            .map(|handle| handle.snapshot.read().expect("call snapshot lock").clone())
    }

    /// Deliver an event to the call owning this SIP Call-ID. Returns false
    /// when no call claims it.
    pub fn deliver(&self, sip_call_id: &str, event: CallEvent) -> bool {
        let Some(internal) = self.leg_index.get(sip_call_id).map(|id| id.clone()) else {
            return false;
        };
        match self.calls.get(&internal) {
            Some(handle) => handle.event_tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn hangup(&self, internal_id: &str) -> bool {
        match self.calls.get(internal_id) {
            Some(handle) => handle.event_tx.send(CallEvent::AdminHangup).is_ok(),
            None => false,
        }
    }

    /// Tear down every active call (process shutdown).
    pub fn hangup_all(&self) {
        for entry in self.calls.iter() {
            let _ = entry.value().event_tx.send(CallEvent::AdminHangup);
        }
    }

    /// Entry point for a new INVITE (no To tag, fresh transaction).
    pub fn handle_invite(
        self: &Arc<Self>,
        key: TransactionKey,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) {
        if self.calls.len() >= self.call_config.max_concurrent_calls as usize {
            warn!("Concurrent call limit reached, rejecting INVITE");
            let mut response = SipMessage::response_for(&message, 503, "Service Unavailable");
            response.add_header("Retry-After", "30");
            self.sip.respond(key, response);
            return;
        }

        let internal_id = Uuid::new_v4().to_string();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let caller = message
            .header("From")
            .map(uri_from_name_addr)
            .and_then(uri_user)
            .unwrap_or("anonymous")
            .to_string();
        let callee = message.request_user().unwrap_or_default().to_string();

        let snapshot = Arc::new(RwLock::new(CallSnapshot {
            id: internal_id.clone(),
            caller: caller.clone(),
            callee: callee.clone(),
            state: CallState::Idle,
            start_time: Utc::now(),
            answer_time: None,
            negotiated_payload_type: None,
        }));

        self.calls.insert(
            internal_id.clone(),
            CallHandle {
                snapshot: Arc::clone(&snapshot),
                event_tx: event_tx.clone(),
            },
        );
        if let Some(call_id) = message.call_id() {
            self.leg_index.insert(call_id.to_string(), internal_id.clone());
        }

        info!("Call {} started: {} -> {}", internal_id, caller, callee);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let task = CallTask::new(
                service,
                internal_id,
                snapshot,
                event_rx,
                key,
                message,
                source,
                transport,
            );
            task.run().await;
        });
    }

    fn unlink_call(&self, internal_id: &str, sip_call_ids: &[String]) {
        for call_id in sip_call_ids {
            self.leg_index.remove(call_id);
        }
        self.calls.remove(internal_id);
    }
}

/// The callee-side leg once an INVITE has gone out.
struct CalleeLeg {
    dialog: Dialog,
    /// Exact INVITE sent, kept so CANCEL can replicate its Via branch and
    /// CSeq. Without this snapshot CANCEL would be impossible.
    invite: SipMessage,
    target: SocketAddr,
    transport: TransportKind,
    invite_seq: u32,
    offered_payloads: Vec<u8>,
    answered: bool,
    acked: bool,
}

/// A paging destination leg (one-way audio, no relay learning).
struct MemberLeg {
    dialog: Dialog,
    invite_seq: u32,
    answered: bool,
}

struct CallTask {
    service: Arc<B2buaService>,
    id: String,
    snapshot: Arc<RwLock<CallSnapshot>>,
    events: mpsc::UnboundedReceiver<CallEvent>,

    state: CallState,
    disposition: Disposition,

    // Caller leg.
    caller_invite: SipMessage,
    caller_invite_key: TransactionKey,
    caller_source: SocketAddr,
    caller_transport: TransportKind,
    caller_dialog: Option<Dialog>,
    caller_payloads: Vec<u8>,
    caller_extension: String,
    dialed: String,
    caller_acked: bool,
    /// Pending 200 toward the caller, retransmitted until ACK.
    pending_ok: Option<SipMessage>,
    next_ok_at: Option<Instant>,
    ok_interval: Duration,
    ok_deadline: Option<Instant>,

    callee: Option<CalleeLeg>,
    members: HashMap<String, MemberLeg>,

    relay: Option<Arc<RtpRelay>>,
    dtmf_rx: Option<mpsc::Receiver<DtmfEvent>>,
    /// Producer handle for the SIP INFO path into the unified DTMF queue.
    dtmf_info_tx: Option<crate::protocols::dtmf::DtmfSender>,
    local_flow: Option<LocalFlow>,
    negotiated_payload: Option<u8>,

    no_answer_at: Option<Instant>,
    releasing_deadline: Option<Instant>,
    /// Outstanding BYE we sent and are waiting to see answered.
    bye_outstanding: bool,
    start_time: DateTime<Utc>,
    answer_time: Option<DateTime<Utc>>,
    cdr_emitted: bool,
}

enum Step {
    Continue,
    Done,
}

impl CallTask {
    #[allow(clippy::too_many_arguments)]
    fn new(
        service: Arc<B2buaService>,
        id: String,
        snapshot: Arc<RwLock<CallSnapshot>>,
        events: mpsc::UnboundedReceiver<CallEvent>,
        caller_invite_key: TransactionKey,
        caller_invite: SipMessage,
        caller_source: SocketAddr,
        caller_transport: TransportKind,
    ) -> Self {
        let caller_extension = caller_invite
            .header("From")
            .map(uri_from_name_addr)
            .and_then(uri_user)
            .unwrap_or("anonymous")
            .to_string();
        let dialed = caller_invite.request_user().unwrap_or_default().to_string();

        Self {
            service,
            id,
            snapshot,
            events,
            state: CallState::Idle,
            disposition: Disposition::Failed,
            caller_invite,
            caller_invite_key,
            caller_source,
            caller_transport,
            caller_dialog: None,
            caller_payloads: Vec::new(),
            caller_extension,
            dialed,
            caller_acked: false,
            pending_ok: None,
            next_ok_at: None,
            ok_interval: Duration::from_millis(500),
            ok_deadline: None,
            callee: None,
            members: HashMap::new(),
            relay: None,
            dtmf_rx: None,
            dtmf_info_tx: None,
            local_flow: None,
            negotiated_payload: None,
            no_answer_at: None,
            releasing_deadline: None,
            bye_outstanding: false,
            start_time: Utc::now(),
            answer_time: None,
            cdr_emitted: false,
        }
    }

    fn sip(&self) -> &SipSender {
        &self.service.sip
    }

    fn set_state(&mut self, state: CallState) {
        debug!("Call {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        let mut snapshot = self.snapshot.write().expect("call snapshot lock");
        snapshot.state = state;
        snapshot.answer_time = self.answer_time;
        snapshot.negotiated_payload_type = self.negotiated_payload;
    }

    async fn run(mut self) {
        if let Err(e) = self.setup().await {
            warn!("Call {} setup failed: {}", self.id, e);
            match e {
                Error::ResourceExhausted(ref detail) => {
                    let mut response =
                        SipMessage::response_for(&self.caller_invite, 503, "Service Unavailable");
                    response.add_header("Retry-After", "30");
                    self.sip().respond(self.caller_invite_key.clone(), response);
                    self.disposition = Disposition::Failed;
                    let _ = self
                        .service
                        .alarms
                        .raise_alarm(
                            AlarmSeverity::Critical,
                            AlarmType::Resource,
                            "rtp_ports",
                            detail.clone(),
                            None,
                        )
                        .await;
                }
                _ => {
                    self.reject_caller(500, "Server Internal Error");
                    self.disposition = Disposition::InternalError;
                }
            }
            self.cleanup().await;
            return;
        }

        let mut ticker = interval(Duration::from_millis(250));
        loop {
            let step = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => match self.on_event(event).await {
                        Ok(step) => step,
                        Err(e) => {
                            error!("Call {} internal error: {}", self.id, e);
                            self.fail_internally();
                            Step::Done
                        }
                    },
                    None => Step::Done,
                },
                digit = Self::recv_digit(&mut self.dtmf_rx) => {
                    match digit {
                        Some(event) => self.on_digit(event).await,
                        None => Step::Continue,
                    }
                }
                _ = ticker.tick() => self.on_tick().await,
            };
            if matches!(step, Step::Done) {
                break;
            }
        }

        self.cleanup().await;
    }

    /// Awaitable that never resolves while no DTMF queue exists, keeping
    /// the select arm uniform.
    async fn recv_digit(rx: &mut Option<mpsc::Receiver<DtmfEvent>>) -> Option<DtmfEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    // ------------------------------------------------------------------
    // Setup: Idle → AwaitingCalleeRing (or a local flow / rejection)
    // ------------------------------------------------------------------

    async fn setup(&mut self) -> Result<()> {
        let local_tag = generate_tag();
        let dialog = Dialog::from_incoming_request(
            &self.caller_invite,
            local_tag,
            self.service.identity.contact(),
            self.caller_source,
            self.caller_transport,
        )?;
        self.caller_dialog = Some(dialog);

        // 100 Trying to quench caller retransmissions.
        let trying = SipMessage::response_for(&self.caller_invite, 100, "Trying");
        self.sip().respond(self.caller_invite_key.clone(), trying);

        // The caller RTP endpoint is recorded from the INVITE SDP
        // immediately; waiting for the 200/ACK handshake is exactly the
        // race that clips early audio.
        let caller_sdp = self.parse_body_sdp(&self.caller_invite)?;

        let qos = self.service.qos.register(&self.id);
        let (dtmf_tx, dtmf_rx) = dtmf_queue();
        self.dtmf_info_tx = Some(dtmf_tx.clone());
        let relay = RtpRelay::bind(
            &self.id,
            &self.service.rtp_config,
            self.service.identity.server_ip,
            &self.service.allocator,
            qos,
            dtmf_tx,
        )?;
        relay.start();
        self.dtmf_rx = Some(dtmf_rx);

        if let Some(sdp) = &caller_sdp {
            if let Some(endpoint) = sdp.audio_endpoint() {
                relay.hint_endpoint(RelaySide::A, endpoint);
            }
            self.caller_payloads = sdp.audio_payload_types();
        }

        // Pump relay back-channel events into the main queue.
        if let Some(mut relay_events) = relay.take_event_receiver() {
            let event_tx = self
                .service
                .calls
                .get(&self.id)
                .map(|handle| handle.event_tx.clone());
            if let Some(event_tx) = event_tx {
                tokio::spawn(async move {
                    while let Some(event) = relay_events.recv().await {
                        if event_tx.send(CallEvent::Relay(event)).is_err() {
                            break;
                        }
                    }
                });
            }
        }
        self.relay = Some(relay);

        let context = CallerContext {
            extension: self.caller_extension.clone(),
            display_name: None,
            source_ip: self.caller_source.ip(),
        };

        match self.service.features.route(&self.dialed, &context).await? {
            None => {
                let callee = self.dialed.clone();
                self.start_callee_leg(&callee).await
            }
            Some(FeatureAction::RouteToExtension(extension)) => {
                self.start_callee_leg(&extension).await
            }
            Some(FeatureAction::RouteToTrunk {
                uri,
                caller_id_override,
            }) => self.start_trunk_leg(&uri, caller_id_override).await,
            Some(FeatureAction::AnswerLocally(flow)) => {
                self.answer_caller()?;
                self.begin_local_flow(flow).await
            }
            Some(FeatureAction::Reject { code, reason }) => {
                self.reject_caller(code, &reason);
                self.disposition = Disposition::Failed;
                self.set_state(CallState::Terminated);
                Ok(())
            }
        }
    }

    fn parse_body_sdp(&self, message: &SipMessage) -> Result<Option<SessionDescription>> {
        if message.body.is_empty() {
            return Ok(None);
        }
        let is_sdp = message
            .content_type()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim() == "application/sdp")
            .unwrap_or(false);
        if !is_sdp {
            return Ok(None);
        }
        let text = std::str::from_utf8(&message.body)
            .map_err(|_| Error::sdp("SDP body is not UTF-8"))?;
        Ok(Some(SessionDescription::parse(text)?))
    }

    /// Build and send the INVITE for the callee leg toward a registered
    /// extension.
    async fn start_callee_leg(&mut self, extension: &str) -> Result<()> {
        let Some((target, transport, registration)) = self.service.registrar.contact_addr(extension)
        else {
            info!("Call {}: callee {} not registered", self.id, extension);
            self.reject_caller(480, "Temporarily Unavailable");
            self.disposition = Disposition::Failed;
            self.set_state(CallState::Terminated);
            return Ok(());
        };

        // Offered set: the callee's device policy filtered to what the
        // caller actually offered (the relay forwards payloads, it never
        // transcodes them).
        let device_set = self
            .service
            .negotiator
            .offer_for(registration.user_agent.as_deref());
        let offered: Vec<u8> = if self.caller_payloads.is_empty() {
            device_set
        } else {
            let filtered: Vec<u8> = device_set
                .iter()
                .copied()
                .filter(|pt| self.caller_payloads.contains(pt))
                .collect();
            if filtered.is_empty() {
                self.reject_caller(488, "Not Acceptable Here");
                self.disposition = Disposition::Failed;
                self.set_state(CallState::Terminated);
                return Ok(());
            }
            filtered
        };

        self.send_callee_invite(
            registration.contact_uri.clone(),
            target,
            transport,
            offered,
            None,
        )
        .await
    }

    async fn start_trunk_leg(
        &mut self,
        uri: &str,
        caller_id_override: Option<String>,
    ) -> Result<()> {
        let (host, port) = uri_host_port(uri)?;
        let ip = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| Error::network(format!("Trunk {} unresolvable: {}", uri, e)))?
            .next()
            .ok_or_else(|| Error::network(format!("Trunk {} has no addresses", uri)))?;

        let offered = if self.caller_payloads.is_empty() {
            self.service.negotiator.offer_for(None)
        } else {
            self.caller_payloads.clone()
        };
        self.send_callee_invite(uri.to_string(), ip, TransportKind::Udp, offered, caller_id_override)
            .await
    }

    async fn send_callee_invite(
        &mut self,
        remote_uri: String,
        target: SocketAddr,
        transport: TransportKind,
        offered: Vec<u8>,
        caller_id_override: Option<String>,
    ) -> Result<()> {
        let relay = self.relay.as_ref().ok_or_else(|| Error::internal("relay missing"))?;
        let identity = &self.service.identity;

        let from_user = caller_id_override.unwrap_or_else(|| self.caller_extension.clone());
        let call_id = generate_call_id(&identity.domain);
        let mut dialog = Dialog::outgoing(
            call_id.clone(),
            identity.uri_for(&from_user),
            remote_uri,
            generate_tag(),
            identity.contact(),
            target,
            transport,
        );

        let mut invite = dialog.create_request(SipMethod::Invite);
        invite.set_header("User-Agent", identity.user_agent.clone());
        let sdp = SessionDescription::audio(
            SocketAddr::new(identity.server_ip, relay.rtp_port(RelaySide::B)),
            &offered,
            self.service.rtp_config.dtmf_payload_type,
        );
        invite.set_body("application/sdp", sdp.encode());
        let invite_seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);

        // Everything CANCEL will need later is captured now.
        self.callee = Some(CalleeLeg {
            dialog,
            invite: invite.clone(),
            target,
            transport,
            invite_seq,
            offered_payloads: offered,
            answered: false,
            acked: false,
        });
        self.service
            .leg_index
            .insert(call_id, self.id.clone());

        self.sip().request(invite, target, transport);
        self.no_answer_at = Some(
            Instant::now() + Duration::from_secs(self.service.call_config.no_answer_timeout as u64),
        );
        self.set_state(CallState::AwaitingCalleeRing);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    async fn on_event(&mut self, event: CallEvent) -> Result<Step> {
        match event {
            CallEvent::Request {
                key,
                message,
                source,
                transport,
            } => self.on_request(key, message, source, transport).await,
            CallEvent::Response { message } => self.on_response(message).await,
            CallEvent::TransactionTimeout { method } => self.on_timeout(method).await,
            CallEvent::Relay(event) => self.on_relay_event(event).await,
            CallEvent::AdminHangup => {
                info!("Call {}: admin hangup", self.id);
                self.begin_release(None).await;
                Ok(self.step())
            }
        }
    }

    fn step(&self) -> Step {
        if self.state == CallState::Terminated {
            Step::Done
        } else {
            Step::Continue
        }
    }

    async fn on_request(
        &mut self,
        key: TransactionKey,
        message: SipMessage,
        _source: SocketAddr,
        _transport: TransportKind,
    ) -> Result<Step> {
        let method = message.method().cloned().unwrap_or(SipMethod::Other(String::new()));
        match method {
            SipMethod::Ack => self.on_caller_ack(message).await?,
            SipMethod::Cancel => self.on_caller_cancel(key, message).await?,
            SipMethod::Bye => self.on_bye(key, message).await?,
            SipMethod::Info => self.on_info(key, message)?,
            SipMethod::Invite => self.on_reinvite(key, message)?,
            other => {
                debug!("Call {}: {} not handled in-dialog", self.id, other);
                self.sip()
                    .respond(key, SipMessage::response_for(&message, 501, "Not Implemented"));
            }
        }
        Ok(self.step())
    }

    async fn on_caller_ack(&mut self, message: SipMessage) -> Result<()> {
        if message.call_id() != self.caller_invite.call_id() {
            return Ok(());
        }
        self.caller_acked = true;
        self.pending_ok = None;
        self.next_ok_at = None;

        if self.state == CallState::Connecting {
            // Forward the ACK to the callee leg: our own ACK on that
            // dialog, carrying the answer when the offer was delayed.
            self.ack_callee().await?;
            self.answer_time.get_or_insert_with(Utc::now);
            self.disposition = Disposition::Answered;
            self.set_state(CallState::Established);
            info!("Call {} established", self.id);
        }
        Ok(())
    }

    async fn ack_callee(&mut self) -> Result<()> {
        let delayed_offer = self.caller_payloads.is_empty();
        let Some(callee) = self.callee.as_mut() else {
            return Ok(());
        };
        if callee.acked || !callee.answered {
            return Ok(());
        }
        let mut ack = callee.dialog.create_ack(callee.invite_seq);
        if delayed_offer {
            // Delayed offer: the callee's 200 carried the offer, so the
            // ACK carries our answer.
            if let (Some(relay), Some(pt)) = (self.relay.as_ref(), self.negotiated_payload) {
                let sdp = SessionDescription::audio(
                    SocketAddr::new(
                        self.service.identity.server_ip,
                        relay.rtp_port(RelaySide::B),
                    ),
                    &[pt, self.service.rtp_config.dtmf_payload_type],
                    self.service.rtp_config.dtmf_payload_type,
                );
                ack.set_body("application/sdp", sdp.encode());
            }
        }
        callee.acked = true;
        self.service.sip.stateless(ack, callee.target, callee.transport);
        Ok(())
    }

    async fn on_caller_cancel(&mut self, key: TransactionKey, message: SipMessage) -> Result<()> {
        // CANCEL gets its own 200 regardless of what it achieves.
        self.sip()
            .respond(key, SipMessage::response_for(&message, 200, "OK"));

        match self.state {
            CallState::AwaitingCalleeRing | CallState::CalleeAlerting => {
                info!("Call {}: caller cancelled", self.id);
                self.cancel_callee();
                self.respond_caller_invite(487, "Request Terminated");
                self.disposition = Disposition::Cancelled;
                self.set_state(CallState::Cancelling);
            }
            CallState::Connecting | CallState::Established => {
                // Too late to cancel; RFC treats this as a no-op.
                debug!("Call {}: CANCEL after answer ignored", self.id);
            }
            _ => {
                self.respond_caller_invite(487, "Request Terminated");
                self.disposition = Disposition::Cancelled;
                self.set_state(CallState::Terminated);
            }
        }
        Ok(())
    }

    /// CANCEL toward the callee, built from the stored INVITE snapshot:
    /// same Request-URI, same Via branch, same CSeq number.
    fn cancel_callee(&mut self) {
        let Some(callee) = self.callee.as_ref() else {
            return;
        };
        if callee.answered {
            return;
        }
        let invite = &callee.invite;
        let mut cancel = SipMessage::request(
            SipMethod::Cancel,
            invite.request_uri().unwrap_or_default().to_string(),
        );
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = invite.header(name) {
                cancel.add_header(name, value);
            }
        }
        if let Some((seq, _)) = invite.cseq() {
            cancel.add_header("CSeq", format!("{} CANCEL", seq));
        }
        cancel.add_header("Max-Forwards", "70");
        self.sip().request(cancel, callee.target, callee.transport);
    }

    async fn on_bye(&mut self, key: TransactionKey, message: SipMessage) -> Result<()> {
        self.sip()
            .respond(key, SipMessage::response_for(&message, 200, "OK"));

        let from_caller = message.call_id() == self.caller_invite.call_id();
        info!(
            "Call {}: BYE from {}",
            self.id,
            if from_caller { "caller" } else { "callee" }
        );

        match self.state {
            CallState::Established | CallState::Connecting => {
                self.begin_release(Some(from_caller)).await;
            }
            CallState::Releasing => {
                // Simultaneous BYE: both sides get their 200; the call
                // terminates when our own BYE completes (or already has).
                if !self.bye_outstanding {
                    self.set_state(CallState::Terminated);
                }
            }
            _ => {
                self.set_state(CallState::Terminated);
            }
        }
        Ok(())
    }

    /// Send BYE toward the legs that still need one. `from_caller` is the
    /// side that already hung up (None = PBX-initiated, BYE both).
    async fn begin_release(&mut self, from_caller: Option<bool>) {
        if matches!(self.state, CallState::Releasing | CallState::Terminated) {
            return;
        }

        let bye_caller = from_caller != Some(true);
        let bye_callee = from_caller != Some(false);

        if bye_caller {
            if let Some(dialog) = self.caller_dialog.as_mut() {
                if self.caller_acked {
                    let bye = dialog.create_request(SipMethod::Bye);
                    self.service
                        .sip
                        .request(bye, dialog.remote_addr, dialog.transport);
                    self.bye_outstanding = true;
                } else if self.pending_ok.is_some() {
                    // Never answered: the caller leg dies with the INVITE.
                    self.respond_caller_invite(480, "Temporarily Unavailable");
                }
            }
        }

        if bye_callee {
            if let Some(callee) = self.callee.as_mut() {
                if callee.answered {
                    let bye = callee.dialog.create_request(SipMethod::Bye);
                    self.service.sip.request(bye, callee.target, callee.transport);
                    self.bye_outstanding = true;
                } else {
                    self.cancel_callee();
                }
            }
        }

        self.release_members();

        if self.bye_outstanding {
            self.set_state(CallState::Releasing);
            self.releasing_deadline = Some(Instant::now() + Duration::from_secs(10));
        } else {
            self.set_state(CallState::Terminated);
        }
    }

    fn release_members(&mut self) {
        let members = std::mem::take(&mut self.members);
        for (_, mut member) in members {
            if member.answered {
                let bye = member.dialog.create_request(SipMethod::Bye);
                self.service
                    .sip
                    .request(bye, member.dialog.remote_addr, member.dialog.transport);
            }
        }
    }

    fn on_info(&mut self, key: TransactionKey, message: SipMessage) -> Result<()> {
        // SIP INFO DTMF works no matter which codec is on the wire; that
        // is the point of the unifier. The INFO producer shares the same
        // FIFO as the in-band decoder.
        if let Some(content_type) = message.content_type() {
            match parse_info_body(content_type, &message.body) {
                Ok(event) => {
                    debug!("Call {}: INFO DTMF digit {}", self.id, event.digit);
                    if let Some(sender) = &self.dtmf_info_tx {
                        sender.push(event);
                    }
                }
                Err(e) => {
                    debug!("Call {}: INFO body ignored: {}", self.id, e);
                }
            }
        }
        // INFO is always answered 200; the digit was either consumed or
        // it was not DTMF at all.
        self.sip()
            .respond(key, SipMessage::response_for(&message, 200, "OK"));
        Ok(())
    }

    fn on_reinvite(&mut self, key: TransactionKey, message: SipMessage) -> Result<()> {
        let from_caller = message.call_id() == self.caller_invite.call_id();
        let side = if from_caller { RelaySide::A } else { RelaySide::B };

        // Enforce monotonic CSeq on the affected dialog.
        if let Some((seq, _)) = message.cseq() {
            let dialog = if from_caller {
                self.caller_dialog.as_mut()
            } else {
                self.callee.as_mut().map(|c| &mut c.dialog)
            };
            if let Some(dialog) = dialog {
                if dialog.check_remote_seq(seq).is_err() {
                    self.sip().respond(
                        key,
                        SipMessage::response_for(&message, 500, "Server Internal Error"),
                    );
                    return Ok(());
                }
            }
        }

        let sdp = self.parse_body_sdp(&message)?;
        if let (Some(sdp), Some(relay)) = (&sdp, &self.relay) {
            if let Some(endpoint) = sdp.audio_endpoint() {
                // Endpoint moves; QoS counters intentionally keep their
                // sequence base.
                relay.update_endpoint(side, endpoint);
            }
        }

        let relay = self.relay.as_ref();
        let (port, payloads) = match (relay, side) {
            (Some(relay), RelaySide::A) => (
                relay.rtp_port(RelaySide::A),
                self.answer_payloads(),
            ),
            (Some(relay), RelaySide::B) => (
                relay.rtp_port(RelaySide::B),
                self.callee
                    .as_ref()
                    .map(|c| c.offered_payloads.clone())
                    .unwrap_or_else(|| self.answer_payloads()),
            ),
            (None, _) => {
                self.sip().respond(
                    key,
                    SipMessage::response_for(&message, 500, "Server Internal Error"),
                );
                return Ok(());
            }
        };

        let our_sdp = SessionDescription::audio(
            SocketAddr::new(self.service.identity.server_ip, port),
            &payloads,
            self.service.rtp_config.dtmf_payload_type,
        );
        let dialog = if from_caller {
            self.caller_dialog.as_ref()
        } else {
            self.callee.as_ref().map(|c| &c.dialog)
        };
        let mut response = match dialog {
            Some(dialog) => dialog.create_response(&message, 200, "OK"),
            None => SipMessage::response_for(&message, 200, "OK"),
        };
        response.set_body("application/sdp", our_sdp.encode());
        self.sip().respond(key, response);
        Ok(())
    }

    fn answer_payloads(&self) -> Vec<u8> {
        let dtmf = self.service.rtp_config.dtmf_payload_type;
        match self.negotiated_payload {
            Some(pt) if self.caller_payloads.contains(&dtmf) => vec![pt, dtmf],
            Some(pt) => vec![pt],
            None if !self.caller_payloads.is_empty() => {
                let allowed = self.service.negotiator.offer_for(None);
                let common: Vec<u8> = allowed
                    .iter()
                    .copied()
                    .filter(|pt| self.caller_payloads.contains(pt))
                    .collect();
                if common.is_empty() {
                    allowed
                } else {
                    common
                }
            }
            None => self.service.negotiator.offer_for(None),
        }
    }

    // ------------------------------------------------------------------
    // Responses on our client transactions (callee / members / BYEs)
    // ------------------------------------------------------------------

    async fn on_response(&mut self, message: SipMessage) -> Result<Step> {
        let code = message.status_code().unwrap_or(0);
        let (_, method) = message
            .cseq()
            .ok_or_else(|| Error::sip("Response without CSeq"))?;
        let call_id = message.call_id().unwrap_or_default().to_string();

        if self.members.contains_key(&call_id) {
            self.on_member_response(&call_id, code, &message).await?;
            return Ok(self.step());
        }

        match method {
            SipMethod::Invite => self.on_callee_invite_response(code, message).await?,
            SipMethod::Bye => {
                if code >= 200 {
                    self.bye_outstanding = false;
                    if self.state == CallState::Releasing {
                        self.set_state(CallState::Terminated);
                    }
                }
            }
            SipMethod::Cancel => {
                debug!("Call {}: CANCEL answered {}", self.id, code);
            }
            other => {
                debug!("Call {}: response {} for {} ignored", self.id, code, other);
            }
        }
        Ok(self.step())
    }

    async fn on_callee_invite_response(&mut self, code: u16, message: SipMessage) -> Result<()> {
        match (self.state, code) {
            (CallState::AwaitingCalleeRing | CallState::CalleeAlerting, 100..=199) => {
                if code == 100 {
                    return Ok(());
                }
                if let Some(callee) = self.callee.as_mut() {
                    callee.dialog.on_response(&message);
                }
                // 183 with SDP configures the relay for early media.
                if let Some(sdp) = self.parse_body_sdp(&message)? {
                    if let (Some(endpoint), Some(relay)) = (sdp.audio_endpoint(), &self.relay) {
                        relay.hint_endpoint(RelaySide::B, endpoint);
                    }
                }
                self.forward_provisional(code, &message)?;
                self.set_state(CallState::CalleeAlerting);
            }
            (
                CallState::AwaitingCalleeRing
                | CallState::CalleeAlerting
                | CallState::Connecting,
                200..=299,
            ) => {
                self.no_answer_at = None;
                self.on_callee_answered(message).await?;
            }
            (CallState::Cancelling | CallState::RoutingToVoicemail, 200..=299) => {
                // Glare: the callee answered after our CANCEL was already
                // in flight. Accept the dialog, then end it cleanly.
                warn!("Call {}: late 200 after CANCEL, answering then releasing", self.id);
                if let Some(callee) = self.callee.as_mut() {
                    callee.dialog.on_response(&message);
                    callee.answered = true;
                    let ack = callee.dialog.create_ack(callee.invite_seq);
                    self.service.sip.stateless(ack, callee.target, callee.transport);
                    let bye = callee.dialog.create_request(SipMethod::Bye);
                    self.service.sip.request(bye, callee.target, callee.transport);
                }
                if self.state == CallState::Cancelling {
                    self.set_state(CallState::Terminated);
                }
            }
            (CallState::Cancelling, 400..=699) => {
                // 487 confirms the CANCEL took effect.
                self.set_state(CallState::Terminated);
            }
            (CallState::RoutingToVoicemail, 400..=699) => {
                self.enter_voicemail().await?;
            }
            (CallState::Established, 200..=299) => {
                // Retransmitted 200 from the callee: our ACK got lost.
                if let Some(callee) = self.callee.as_mut() {
                    callee.acked = false;
                }
                self.ack_callee().await?;
            }
            (_, 300..=699) => {
                info!("Call {}: callee leg failed with {}", self.id, code);
                self.no_answer_at = None;
                self.disposition = match code {
                    486 | 600 => Disposition::Busy,
                    _ => Disposition::Failed,
                };
                self.respond_caller_invite(code, reason_for(code));
                self.set_state(CallState::Terminated);
            }
            (state, code) => {
                debug!("Call {}: response {} ignored in {:?}", self.id, code, state);
            }
        }
        Ok(())
    }

    async fn on_callee_answered(&mut self, message: SipMessage) -> Result<()> {
        let sdp = self.parse_body_sdp(&message)?;
        let answered_payloads = sdp
            .as_ref()
            .map(|s| s.audio_payload_types())
            .unwrap_or_default();

        {
            let Some(callee) = self.callee.as_mut() else {
                return Err(Error::invalid_state("200 OK with no callee leg"));
            };
            callee.dialog.on_response(&message);
            callee.answered = true;

            if let Some(sdp) = &sdp {
                if let (Some(endpoint), Some(relay)) = (sdp.audio_endpoint(), &self.relay) {
                    // The 200's SDP wins over any 183 hint, but a learned
                    // wire address still wins over both.
                    relay.hint_endpoint(RelaySide::B, endpoint);
                }
            }

            let negotiated = if answered_payloads.is_empty() {
                callee.offered_payloads.first().copied()
            } else {
                match self
                    .service
                    .negotiator
                    .select(&callee.offered_payloads, &answered_payloads)
                {
                    Ok(pt) => Some(pt),
                    Err(_) if self.caller_payloads.is_empty() => {
                        // Delayed offer: the 200 carried the offer; pick
                        // from it directly.
                        answered_payloads.first().copied()
                    }
                    Err(e) => {
                        warn!("Call {}: {}", self.id, e);
                        None
                    }
                }
            };

            let Some(negotiated) = negotiated else {
                // No codec in common: reject both legs.
                let ack = callee.dialog.create_ack(callee.invite_seq);
                self.service.sip.stateless(ack, callee.target, callee.transport);
                let bye = callee.dialog.create_request(SipMethod::Bye);
                self.service.sip.request(bye, callee.target, callee.transport);
                self.respond_caller_invite(488, "Not Acceptable Here");
                self.disposition = Disposition::Failed;
                self.set_state(CallState::Terminated);
                return Ok(());
            };
            self.negotiated_payload = Some(negotiated);
        }

        if self.local_flow.is_some() || self.caller_acked {
            // Transfer case (auto-attendant) or caller already answered:
            // no 200 to send toward the caller, just complete the callee
            // handshake and bridge.
            self.ack_callee().await?;
            self.answer_time.get_or_insert_with(Utc::now);
            self.disposition = Disposition::Answered;
            self.set_state(CallState::Established);
            return Ok(());
        }

        self.answer_caller()?;
        self.set_state(CallState::Connecting);
        Ok(())
    }

    /// Send 200 OK with our relay SDP on the caller's INVITE transaction
    /// and start retransmitting it until the ACK lands.
    fn answer_caller(&mut self) -> Result<()> {
        let relay = self.relay.as_ref().ok_or_else(|| Error::internal("relay missing"))?;
        let dialog = self
            .caller_dialog
            .as_ref()
            .ok_or_else(|| Error::internal("caller dialog missing"))?;

        let sdp = SessionDescription::audio(
            SocketAddr::new(self.service.identity.server_ip, relay.rtp_port(RelaySide::A)),
            &self.answer_payloads(),
            self.service.rtp_config.dtmf_payload_type,
        );
        let mut ok = dialog.create_response(&self.caller_invite, 200, "OK");
        ok.set_body("application/sdp", sdp.encode());

        self.sip().respond(self.caller_invite_key.clone(), ok.clone());

        // The INVITE server transaction is gone the moment a 2xx passes
        // through it; retransmissions until ACK are on us.
        self.pending_ok = Some(ok);
        self.ok_interval = Duration::from_millis(500);
        self.next_ok_at = Some(Instant::now() + self.ok_interval);
        self.ok_deadline = Some(Instant::now() + Duration::from_secs(32));
        if self.answer_time.is_none() {
            self.answer_time = Some(Utc::now());
        }
        Ok(())
    }

    fn forward_provisional(&mut self, code: u16, callee_response: &SipMessage) -> Result<()> {
        let dialog = self
            .caller_dialog
            .as_ref()
            .ok_or_else(|| Error::internal("caller dialog missing"))?;
        let mut response =
            dialog.create_response(&self.caller_invite, code, reason_for(code));

        // When the callee supplied early-media SDP, the caller gets our
        // relay endpoint instead; media still flows through us.
        if !callee_response.body.is_empty() {
            if let Some(relay) = &self.relay {
                let sdp = SessionDescription::audio(
                    SocketAddr::new(
                        self.service.identity.server_ip,
                        relay.rtp_port(RelaySide::A),
                    ),
                    &self.answer_payloads(),
                    self.service.rtp_config.dtmf_payload_type,
                );
                response.set_body("application/sdp", sdp.encode());
            }
        }
        self.sip().respond(self.caller_invite_key.clone(), response);
        Ok(())
    }

    fn respond_caller_invite(&self, code: u16, reason: &str) {
        let response = match self.caller_dialog.as_ref() {
            Some(dialog) => dialog.create_response(&self.caller_invite, code, reason),
            None => SipMessage::response_for(&self.caller_invite, code, reason),
        };
        self.sip().respond(self.caller_invite_key.clone(), response);
    }

    fn reject_caller(&self, code: u16, reason: &str) {
        self.respond_caller_invite(code, reason);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn on_tick(&mut self) -> Step {
        let now = Instant::now();

        if let Some(at) = self.no_answer_at {
            if now >= at {
                self.no_answer_at = None;
                if let Err(e) = self.on_no_answer().await {
                    error!("Call {}: voicemail routing failed: {}", self.id, e);
                    self.fail_internally();
                    return Step::Done;
                }
            }
        }

        if let (Some(at), Some(ok)) = (self.next_ok_at, self.pending_ok.clone()) {
            if now >= at && !self.caller_acked {
                self.sip()
                    .stateless(ok, self.caller_source, self.caller_transport);
                self.ok_interval = (self.ok_interval * 2).min(Duration::from_secs(4));
                self.next_ok_at = Some(now + self.ok_interval);
            }
        }
        if let Some(deadline) = self.ok_deadline {
            if now >= deadline && !self.caller_acked && self.pending_ok.is_some() {
                warn!("Call {}: caller never ACKed, tearing down", self.id);
                self.begin_release(None).await;
                self.ok_deadline = None;
            }
        }

        if let Some(deadline) = self.releasing_deadline {
            if now >= deadline && self.state == CallState::Releasing {
                debug!("Call {}: release timed out, forcing terminate", self.id);
                self.set_state(CallState::Terminated);
            }
        }

        self.step()
    }

    /// CalleeAlerting timed out: cancel the callee and head to voicemail.
    async fn on_no_answer(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            CallState::AwaitingCalleeRing | CallState::CalleeAlerting
        ) {
            return Ok(());
        }
        info!("Call {}: no answer from {}", self.id, self.dialed);
        self.cancel_callee();

        if self.service.voicemail.enabled() && self.callee.is_some() {
            // Wait for the 487 before answering the caller; the callee
            // INVITE response handler completes the hand-off.
            self.set_state(CallState::RoutingToVoicemail);
        } else {
            self.respond_caller_invite(480, "Temporarily Unavailable");
            self.disposition = Disposition::NoAnswer;
            self.set_state(CallState::Cancelling);
        }
        Ok(())
    }

    async fn enter_voicemail(&mut self) -> Result<()> {
        info!("Call {}: routing to voicemail for {}", self.id, self.dialed);
        self.answer_caller()?;
        self.disposition = Disposition::Voicemail;
        self.answer_time.get_or_insert_with(Utc::now);

        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| Error::internal("relay missing"))?;
        self.service
            .voicemail
            .bridge(relay, &self.dialed, &self.caller_extension)
            .await?;
        self.set_state(CallState::Established);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relay events, DTMF, local flows
    // ------------------------------------------------------------------

    async fn on_relay_event(&mut self, event: RelayEvent) -> Result<Step> {
        match event {
            RelayEvent::SilenceTimeout => {
                if self.state == CallState::Established {
                    info!("Call {}: RTP silence timeout, releasing", self.id);
                    self.begin_release(None).await;
                }
            }
            RelayEvent::SustainedIcmpErrors => {
                // Could be a transient outage; alarm, do not tear down.
                warn!("Call {}: sustained RTP delivery errors", self.id);
                let mut info = HashMap::new();
                info.insert("call_id".to_string(), self.id.clone());
                let _ = self
                    .service
                    .alarms
                    .raise_alarm(
                        AlarmSeverity::Minor,
                        AlarmType::Media,
                        "media_relay",
                        "Sustained ICMP errors in both directions".to_string(),
                        Some(info),
                    )
                    .await;
            }
        }
        Ok(self.step())
    }

    async fn on_digit(&mut self, event: DtmfEvent) -> Step {
        debug!("Call {}: digit {} from {:?}", self.id, event.digit, event.source);
        if let Some(LocalFlow::AutoAttendant { menu }) = self.local_flow.clone() {
            if let Some((_, target)) = menu.iter().find(|(digit, _)| *digit == event.digit) {
                info!("Call {}: attendant transfer to {}", self.id, target);
                self.local_flow = None;
                let target = target.clone();
                if let Err(e) = self.start_callee_leg(&target).await {
                    error!("Call {}: transfer failed: {}", self.id, e);
                    self.begin_release(None).await;
                }
            }
        }
        self.step()
    }

    async fn begin_local_flow(&mut self, flow: LocalFlow) -> Result<()> {
        self.disposition = Disposition::Answered;
        self.set_state(CallState::Connecting);

        match &flow {
            LocalFlow::AutoAttendant { .. } => {
                info!("Call {}: auto-attendant answered", self.id);
            }
            LocalFlow::Paging { extensions } => {
                info!("Call {}: paging {} extensions", self.id, extensions.len());
                for extension in extensions {
                    if let Err(e) = self.invite_member(extension).await {
                        warn!("Call {}: page to {} failed: {}", self.id, extension, e);
                    }
                }
            }
        }

        self.local_flow = Some(flow);
        Ok(())
    }

    /// One-way paging leg: INVITE a group member with sendonly SDP.
    async fn invite_member(&mut self, extension: &str) -> Result<()> {
        let Some((target, transport, _)) = self.service.registrar.contact_addr(extension) else {
            return Err(Error::call(format!("{} not registered", extension)));
        };
        let relay = self
            .relay
            .as_ref()
            .ok_or_else(|| Error::internal("relay missing"))?;
        let identity = &self.service.identity;

        let call_id = generate_call_id(&identity.domain);
        let mut dialog = Dialog::outgoing(
            call_id.clone(),
            identity.uri_for(&self.caller_extension),
            format!("sip:{}@{}:{}", extension, target.ip(), target.port()),
            generate_tag(),
            identity.contact(),
            target,
            transport,
        );

        let mut invite = dialog.create_request(SipMethod::Invite);
        invite.set_header("User-Agent", identity.user_agent.clone());
        let mut sdp = SessionDescription::audio(
            SocketAddr::new(identity.server_ip, relay.rtp_port(RelaySide::B)),
            &self.answer_payloads(),
            self.service.rtp_config.dtmf_payload_type,
        );
        // One-way: we send, they listen.
        if let Some(media) = sdp.media.first_mut() {
            media.attributes.retain(|(name, _)| name != "sendrecv");
            media.attributes.push(("sendonly".to_string(), None));
        }
        invite.set_body("application/sdp", sdp.encode());
        let invite_seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);

        self.service.leg_index.insert(call_id.clone(), self.id.clone());
        self.members.insert(
            call_id,
            MemberLeg {
                dialog,
                invite_seq,
                answered: false,
            },
        );
        self.sip().request(invite, target, transport);
        Ok(())
    }

    async fn on_member_response(
        &mut self,
        call_id: &str,
        code: u16,
        message: &SipMessage,
    ) -> Result<()> {
        let sdp = self.parse_body_sdp(message)?;
        let Some(member) = self.members.get_mut(call_id) else {
            return Ok(());
        };
        match code {
            100..=199 => {}
            200..=299 => {
                member.dialog.on_response(message);
                member.answered = true;
                let ack = member.dialog.create_ack(member.invite_seq);
                self.service
                    .sip
                    .stateless(ack, member.dialog.remote_addr, member.dialog.transport);
                if let (Some(sdp), Some(relay)) = (sdp, &self.relay) {
                    if let Some(endpoint) = sdp.audio_endpoint() {
                        relay.add_fanout_target(RelaySide::B, endpoint);
                    }
                }
            }
            _ => {
                debug!("Call {}: page member failed with {}", self.id, code);
                self.members.remove(call_id);
            }
        }
        Ok(())
    }

    async fn on_timeout(&mut self, method: SipMethod) -> Result<Step> {
        warn!("Call {}: transaction timeout on {}", self.id, method);
        match method {
            SipMethod::Invite => match self.state {
                CallState::AwaitingCalleeRing | CallState::CalleeAlerting => {
                    self.respond_caller_invite(408, "Request Timeout");
                    self.disposition = Disposition::Failed;
                    self.set_state(CallState::Terminated);
                }
                // The 487 we were waiting for will never come.
                CallState::RoutingToVoicemail => {
                    self.enter_voicemail().await?;
                }
                CallState::Cancelling => {
                    self.set_state(CallState::Terminated);
                }
                _ => {}
            },
            SipMethod::Bye => {
                self.bye_outstanding = false;
                if self.state == CallState::Releasing {
                    self.set_state(CallState::Terminated);
                }
            }
            _ => {}
        }
        Ok(self.step())
    }

    /// Invariant violation: end the call on both legs, record the CDR with
    /// an internal_error disposition, never take the process down.
    fn fail_internally(&mut self) {
        self.disposition = Disposition::InternalError;
        if self.caller_acked {
            if let Some(dialog) = self.caller_dialog.as_mut() {
                let bye = dialog.create_request(SipMethod::Bye);
                self.service
                    .sip
                    .request(bye, dialog.remote_addr, dialog.transport);
            }
        } else {
            self.respond_caller_invite(500, "Server Internal Error");
        }
        if let Some(callee) = self.callee.as_mut() {
            if callee.answered {
                let bye = callee.dialog.create_request(SipMethod::Bye);
                self.service.sip.request(bye, callee.target, callee.transport);
            } else {
                self.cancel_callee();
            }
        }
        self.set_state(CallState::Terminated);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn cleanup(mut self) {
        self.set_state(CallState::Terminated);

        let mut leg_ids = vec![self
            .caller_invite
            .call_id()
            .unwrap_or_default()
            .to_string()];
        if let Some(callee) = &self.callee {
            leg_ids.push(callee.dialog.call_id.clone());
        }
        leg_ids.extend(self.members.keys().cloned());
        self.release_members();

        let end_time = Utc::now();
        let quality = self.service.qos.report(&self.id);

        if let Some(relay) = self.relay.take() {
            relay.shutdown(&self.service.allocator);
        }
        self.service.qos.unregister(&self.id);

        if !self.cdr_emitted {
            self.cdr_emitted = true;
            let duration = (end_time - self.start_time).num_seconds().max(0) as u64;
            let billable = self
                .answer_time
                .map(|answer| (end_time - answer).num_seconds().max(0) as u64)
                .unwrap_or(0);
            let record = CallRecord {
                id: Uuid::new_v4().to_string(),
                call_id: self.id.clone(),
                caller_leg_call_id: self
                    .caller_invite
                    .call_id()
                    .unwrap_or_default()
                    .to_string(),
                callee_leg_call_id: self.callee.as_ref().map(|c| c.dialog.call_id.clone()),
                caller: self.caller_extension.clone(),
                callee: self.dialed.clone(),
                start_time: self.start_time,
                answer_time: self.answer_time,
                end_time,
                duration_seconds: duration,
                billable_seconds: billable,
                disposition: self.disposition,
                negotiated_payload_type: self.negotiated_payload,
                quality_a_to_b: quality.as_ref().map(|q| summary_of(&q.a_to_b)),
                quality_b_to_a: quality.as_ref().map(|q| summary_of(&q.b_to_a)),
            };
            self.service.cdr.record(record).await;
        }

        self.service.unlink_call(&self.id, &leg_ids);
        info!("Call {} finished ({:?})", self.id, self.disposition);
    }
}

fn summary_of(report: &crate::services::qos::DirectionReport) -> crate::services::cdr::QualitySummary {
    crate::services::cdr::QualitySummary {
        packets_received: report.packets_received,
        packets_lost: report.packets_lost,
        loss_percent: report.loss_percent,
        jitter_ms: report.jitter_ms,
        mos: report.mos,
    }
}

fn reason_for(code: u16) -> &'static str {
    match code {
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    use crate::config::{PbxConfig, PortRange};
    use crate::services::cdr::LoggingCdrSink;
    use crate::services::features::DiscardingVoicemailRecorder;
    use crate::signaling::{DigestAuthenticator, SipCommand};
    use crate::store::{
        Capability, Extension, InMemoryExtensionStore, InMemoryRegistrationStore, Registration,
    };

    static NEXT_RANGE: AtomicU16 = AtomicU16::new(42000);

    struct Fixture {
        service: Arc<B2buaService>,
        commands: mpsc::UnboundedReceiver<SipCommand>,
    }

    async fn fixture(no_answer_timeout: u32, voicemail_enabled: bool) -> Fixture {
        let defaults = PbxConfig::default_config();

        let extensions = Arc::new(InMemoryExtensionStore::new());
        for id in ["1001", "1002"] {
            extensions.insert(Extension {
                id: id.to_string(),
                display_name: format!("Ext {}", id),
                sip_password: "secret".to_string(),
                credential_hash: String::new(),
                capabilities: vec![Capability::ExternalCall],
                voicemail_pin_hash: None,
                email: None,
            });
        }

        let registration_store = Arc::new(InMemoryRegistrationStore::new());
        let now = Utc::now();
        registration_store.seed(Registration {
            extension: "1002".to_string(),
            contact_uri: "sip:1002@127.0.0.1:5062".to_string(),
            contact_host: "127.0.0.1".to_string(),
            contact_port: 5062,
            transport: "udp".to_string(),
            mac: Some("001565123456".to_string()),
            user_agent: Some("Zultys ZIP37G 1.04".to_string()),
            first_registered: now,
            last_registered: now,
            expires_at: now + chrono::Duration::seconds(3600),
        });

        let auth = DigestAuthenticator::new(
            "rivet.local".to_string(),
            b"0123456789abcdef0123456789abcdef".to_vec(),
            &defaults.registrar,
        );
        let registrar = Arc::new(Registrar::new(
            defaults.registrar.clone(),
            auth,
            extensions.clone(),
            registration_store,
        ));
        registrar.startup().await.unwrap();

        let range_base = NEXT_RANGE.fetch_add(200, Ordering::Relaxed);
        let mut rtp_config = defaults.rtp.clone();
        rtp_config.port_range = PortRange {
            min: range_base,
            max: range_base + 198,
        };
        let allocator = Arc::new(RtpPortAllocator::new(&rtp_config.port_range));
        let qos = Arc::new(QosRegistry::new(defaults.qos.clone()));
        let negotiator = Arc::new(CodecNegotiator::new(defaults.codecs.clone()));
        let features = Arc::new(FeatureRouter::new(vec![]));
        let mut voicemail_config = defaults.features.voicemail.clone();
        voicemail_config.enabled = voicemail_enabled;
        voicemail_config.beep_duration_ms = 40;
        let voicemail = Arc::new(VoicemailBridge::new(
            voicemail_config,
            Arc::new(DiscardingVoicemailRecorder::new("127.0.0.1".parse().unwrap())),
        ));

        let mut call_config = defaults.call.clone();
        call_config.no_answer_timeout = no_answer_timeout;

        let identity = LocalIdentity {
            server_ip: "127.0.0.1".parse().unwrap(),
            sip_port: 5060,
            domain: "rivet.local".to_string(),
            user_agent: "Rivet-PBX/test".to_string(),
        };

        let (sip, commands) = SipSender::channel();
        let service = B2buaService::new(
            call_config,
            rtp_config,
            identity,
            registrar,
            negotiator,
            allocator,
            qos,
            features,
            voicemail,
            Arc::new(LoggingCdrSink),
            Arc::new(AlarmManager::new(crate::services::alarms::AlarmConfig::default())),
            sip,
        );
        Fixture { service, commands }
    }

    fn caller_invite(with_sdp: bool) -> (TransactionKey, SipMessage) {
        let mut invite = SipMessage::request(SipMethod::Invite, "sip:1002@rivet.local");
        invite.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bKcall1");
        invite.add_header("Max-Forwards", "69");
        invite.add_header("From", "\"Alice\" <sip:1001@rivet.local>;tag=alice");
        invite.add_header("To", "<sip:1002@rivet.local>");
        invite.add_header("Call-ID", "caller-leg-1");
        invite.add_header("CSeq", "1 INVITE");
        invite.add_header("Contact", "<sip:1001@127.0.0.1:5061>");
        if with_sdp {
            let sdp = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
                       m=audio 40090 RTP/AVP 0 8 101\r\n";
            invite.set_body("application/sdp", sdp);
        }
        let key = TransactionKey {
            branch: "z9hG4bKcall1".to_string(),
            method: SipMethod::Invite,
            is_server: true,
        };
        (key, invite)
    }

    fn caller_source() -> SocketAddr {
        "127.0.0.1:5061".parse().unwrap()
    }

    async fn next_command(commands: &mut mpsc::UnboundedReceiver<SipCommand>) -> SipCommand {
        tokio::time::timeout(Duration::from_secs(2), commands.recv())
            .await
            .expect("timed out waiting for SIP command")
            .expect("command channel closed")
    }

    fn callee_response(invite: &SipMessage, code: u16, reason: &str, sdp: bool) -> SipMessage {
        let mut response = SipMessage::response_for(invite, code, reason);
        response.set_header(
            "To",
            format!("{};tag=bob", invite.header("To").unwrap_or_default()),
        );
        response.add_header("Contact", "<sip:1002@127.0.0.1:5062>");
        if sdp {
            let body = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
                        m=audio 40092 RTP/AVP 0 101\r\n";
            response.set_body("application/sdp", body);
        }
        response
    }

    fn deliver_ack(service: &Arc<B2buaService>) {
        let mut ack = SipMessage::request(SipMethod::Ack, "sip:pbx@127.0.0.1:5060");
        ack.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bKack1");
        ack.add_header("From", "\"Alice\" <sip:1001@rivet.local>;tag=alice");
        ack.add_header("To", "<sip:1002@rivet.local>;tag=pbx");
        ack.add_header("Call-ID", "caller-leg-1");
        ack.add_header("CSeq", "1 ACK");
        let key = TransactionKey {
            branch: "z9hG4bKack1".to_string(),
            method: SipMethod::Ack,
            is_server: true,
        };
        service.deliver(
            "caller-leg-1",
            CallEvent::Request {
                key,
                message: ack,
                source: caller_source(),
                transport: TransportKind::Udp,
            },
        );
    }

    async fn wait_for_no_calls(service: &Arc<B2buaService>) {
        for _ in 0..40 {
            if service.active_call_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("call never cleaned up");
    }

    #[tokio::test]
    async fn test_two_party_call_flow() {
        let mut f = fixture(30, false).await;
        let (key, invite) = caller_invite(true);
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        // 100 Trying to the caller first.
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 100 Trying response");
        };
        assert_eq!(response.status_code(), Some(100));

        // INVITE toward the registered callee, SDP rewritten to the PBX
        // relay address, codec set narrowed by the device policy.
        let SipCommand::Request { message: callee_invite, target, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected INVITE request to callee");
        };
        assert_eq!(callee_invite.method(), Some(&SipMethod::Invite));
        assert_eq!(target, "127.0.0.1:5062".parse().unwrap());
        let offer =
            SessionDescription::parse(std::str::from_utf8(&callee_invite.body).unwrap()).unwrap();
        assert_eq!(offer.audio_endpoint().unwrap().ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_eq!(offer.audio_payload_types(), vec![0, 8, 101]);

        // 180 from the callee is forwarded.
        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 180, "Ringing", false),
            },
        );
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected forwarded 180");
        };
        assert_eq!(response.status_code(), Some(180));

        // 200 with SDP: caller gets our 200 with the PBX answer SDP.
        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 200, "OK", true),
            },
        );
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 200 to caller");
        };
        assert_eq!(response.status_code(), Some(200));
        let answer =
            SessionDescription::parse(std::str::from_utf8(&response.body).unwrap()).unwrap();
        assert_eq!(answer.audio_payload_types(), vec![0, 101]);

        let calls = f.service.active_calls();
        assert_eq!(calls[0].state, CallState::Connecting);
        assert_eq!(calls[0].negotiated_payload_type, Some(0));

        // Caller ACK completes the bridge: our ACK goes to the callee.
        deliver_ack(&f.service);
        let SipCommand::Stateless { message: ack, .. } = next_command(&mut f.commands).await else {
            panic!("expected ACK to callee");
        };
        assert_eq!(ack.method(), Some(&SipMethod::Ack));
        assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.service.active_calls()[0].state, CallState::Established);

        // BYE from the caller: 200 back, BYE forward, teardown on its 200.
        let mut bye = SipMessage::request(SipMethod::Bye, "sip:pbx@127.0.0.1:5060");
        bye.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bKbye1");
        bye.add_header("From", "<sip:1001@rivet.local>;tag=alice");
        bye.add_header("To", "<sip:1002@rivet.local>;tag=pbx");
        bye.add_header("Call-ID", "caller-leg-1");
        bye.add_header("CSeq", "2 BYE");
        let bye_key = TransactionKey {
            branch: "z9hG4bKbye1".to_string(),
            method: SipMethod::Bye,
            is_server: true,
        };
        f.service.deliver(
            "caller-leg-1",
            CallEvent::Request {
                key: bye_key,
                message: bye,
                source: caller_source(),
                transport: TransportKind::Udp,
            },
        );

        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 200 for BYE");
        };
        assert_eq!(response.status_code(), Some(200));
        let SipCommand::Request { message: forwarded_bye, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected BYE to callee");
        };
        assert_eq!(forwarded_bye.method(), Some(&SipMethod::Bye));

        f.service.deliver(
            forwarded_bye.call_id().unwrap(),
            CallEvent::Response {
                message: SipMessage::response_for(&forwarded_bye, 200, "OK"),
            },
        );
        wait_for_no_calls(&f.service).await;
    }

    #[tokio::test]
    async fn test_unregistered_callee_rejected() {
        let mut f = fixture(30, false).await;
        let (key, mut invite) = caller_invite(true);
        invite.start = crate::protocols::sip::StartLine::Request {
            method: SipMethod::Invite,
            uri: "sip:1009@rivet.local".to_string(),
        };
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 100 Trying");
        };
        assert_eq!(response.status_code(), Some(100));
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 480");
        };
        assert_eq!(response.status_code(), Some(480));
        wait_for_no_calls(&f.service).await;
    }

    #[tokio::test]
    async fn test_cancel_before_answer() {
        let mut f = fixture(30, false).await;
        let (key, invite) = caller_invite(true);
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        let _trying = next_command(&mut f.commands).await;
        let SipCommand::Request { message: callee_invite, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected callee INVITE");
        };

        let mut cancel = SipMessage::request(SipMethod::Cancel, "sip:1002@rivet.local");
        cancel.add_header("Via", "SIP/2.0/UDP 127.0.0.1:5061;branch=z9hG4bKcall1");
        cancel.add_header("From", "<sip:1001@rivet.local>;tag=alice");
        cancel.add_header("To", "<sip:1002@rivet.local>");
        cancel.add_header("Call-ID", "caller-leg-1");
        cancel.add_header("CSeq", "1 CANCEL");
        let cancel_key = TransactionKey {
            branch: "z9hG4bKcall1".to_string(),
            method: SipMethod::Cancel,
            is_server: true,
        };
        f.service.deliver(
            "caller-leg-1",
            CallEvent::Request {
                key: cancel_key,
                message: cancel,
                source: caller_source(),
                transport: TransportKind::Udp,
            },
        );

        // 200 for the CANCEL itself.
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 200 for CANCEL");
        };
        assert_eq!(response.status_code(), Some(200));

        // CANCEL toward the callee reuses the INVITE's branch and CSeq.
        let SipCommand::Request { message: callee_cancel, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected CANCEL to callee");
        };
        assert_eq!(callee_cancel.method(), Some(&SipMethod::Cancel));
        assert_eq!(callee_cancel.via_branch(), callee_invite.via_branch());
        assert_eq!(
            callee_cancel.cseq().map(|(seq, _)| seq),
            callee_invite.cseq().map(|(seq, _)| seq)
        );

        // 487 toward the caller's INVITE.
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 487 to caller");
        };
        assert_eq!(response.status_code(), Some(487));

        // The callee's 487 finishes the call.
        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 487, "Request Terminated", false),
            },
        );
        wait_for_no_calls(&f.service).await;
    }

    #[tokio::test]
    async fn test_no_answer_routes_to_voicemail() {
        let mut f = fixture(1, true).await;
        let (key, invite) = caller_invite(true);
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        let _trying = next_command(&mut f.commands).await;
        let SipCommand::Request { message: callee_invite, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected callee INVITE");
        };

        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 180, "Ringing", false),
            },
        );
        let _ringing = next_command(&mut f.commands).await;

        // No answer for the (shortened) timer: CANCEL goes out.
        let SipCommand::Request { message: cancel, .. } = next_command(&mut f.commands).await
        else {
            panic!("expected CANCEL after no-answer timer");
        };
        assert_eq!(cancel.method(), Some(&SipMethod::Cancel));

        // 487 from the callee flips the call to voicemail: the caller is
        // answered with 200.
        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 487, "Request Terminated", false),
            },
        );
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 200 answering the caller");
        };
        assert_eq!(response.status_code(), Some(200));

        deliver_ack(&f.service);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = f.service.active_calls()[0].clone();
        assert_eq!(snapshot.state, CallState::Established);

        // Admin hangup sends BYE to the answered caller; completing it
        // releases the call.
        f.service.hangup(&snapshot.id);
        loop {
            match next_command(&mut f.commands).await {
                SipCommand::Request { message, .. }
                    if message.method() == Some(&SipMethod::Bye) =>
                {
                    f.service.deliver(
                        message.call_id().unwrap(),
                        CallEvent::Response {
                            message: SipMessage::response_for(&message, 200, "OK"),
                        },
                    );
                    break;
                }
                _ => continue,
            }
        }
        wait_for_no_calls(&f.service).await;
    }

    #[tokio::test]
    async fn test_busy_callee_maps_to_busy() {
        let mut f = fixture(30, false).await;
        let (key, invite) = caller_invite(true);
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        let _trying = next_command(&mut f.commands).await;
        let SipCommand::Request { message: callee_invite, .. } =
            next_command(&mut f.commands).await
        else {
            panic!("expected callee INVITE");
        };

        f.service.deliver(
            callee_invite.call_id().unwrap(),
            CallEvent::Response {
                message: callee_response(&callee_invite, 486, "Busy Here", false),
            },
        );
        let SipCommand::Respond { response, .. } = next_command(&mut f.commands).await else {
            panic!("expected 486 to caller");
        };
        assert_eq!(response.status_code(), Some(486));
        wait_for_no_calls(&f.service).await;
    }

    #[tokio::test]
    async fn test_concurrent_call_limit() {
        let f = fixture(30, false).await;
        // Fill the table with placeholder handles.
        for i in 0..500 {
            let (tx, _rx) = mpsc::unbounded_channel();
            f.service.calls.insert(
                format!("placeholder-{}", i),
                CallHandle {
                    snapshot: Arc::new(RwLock::new(CallSnapshot {
                        id: format!("placeholder-{}", i),
                        caller: String::new(),
                        callee: String::new(),
                        state: CallState::Established,
                        start_time: Utc::now(),
                        answer_time: None,
                        negotiated_payload_type: None,
                    })),
                    event_tx: tx,
                },
            );
        }

        let mut commands = f.commands;
        let (key, invite) = caller_invite(true);
        f.service
            .handle_invite(key, invite, caller_source(), TransportKind::Udp);

        let SipCommand::Respond { response, .. } = next_command(&mut commands).await else {
            panic!("expected 503");
        };
        assert_eq!(response.status_code(), Some(503));
        assert_eq!(response.header("Retry-After"), Some("30"));
    }
}
