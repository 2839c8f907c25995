//! SIP transaction layer (RFC 3261 §17)
//!
//! Pure state machine: inputs are parsed messages and clock ticks, outputs
//! are `TransactionAction`s (wire transmissions and TU deliveries). The
//! owning engine task performs the actual I/O, so every retransmission and
//! timeout path here is directly testable.
//!
//! Four FSMs are implemented:
//! - INVITE client: Calling → Proceeding → Completed → Terminated (2xx
//!   terminates immediately; the ACK for 2xx belongs to the dialog)
//! - non-INVITE client: Trying → Proceeding → Completed → Terminated
//! - INVITE server: Proceeding → Completed → Confirmed → Terminated (2xx
//!   bypasses transaction retransmission)
//! - non-INVITE server: Trying → Proceeding → Completed → Terminated

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::protocols::sip::{SipMessage, SipMethod, TransportKind};
use crate::{Error, Result};

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

/// Timer B/F/H/J: 64×T1.
const TIMEOUT_64_T1: Duration = Duration::from_secs(32);
/// Timer D: response-retransmit absorption after a non-2xx INVITE final.
const TIMER_D: Duration = Duration::from_secs(32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: SipMethod,
    pub is_server: bool,
}

impl TransactionKey {
    fn server(branch: &str, method: SipMethod) -> Self {
        Self {
            branch: branch.to_string(),
            method,
            is_server: true,
        }
    }

    fn client(branch: &str, method: SipMethod) -> Self {
        Self {
            branch: branch.to_string(),
            method,
            is_server: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Events surfaced to the transaction user (the signaling engine).
#[derive(Debug)]
pub enum TuEvent {
    /// A request that created a new server transaction, or an ACK for a
    /// 2xx (which has no transaction of its own).
    Request {
        key: TransactionKey,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    },
    /// A response matched to a client transaction. Each final response is
    /// delivered at most once.
    Response {
        key: TransactionKey,
        message: SipMessage,
    },
    /// A response with no live client transaction (late 2xx retransmits).
    StrayResponse {
        message: SipMessage,
        source: SocketAddr,
    },
    /// Timer B/F expiry or a transport-reported failure.
    Timeout {
        key: TransactionKey,
        method: SipMethod,
        call_id: Option<String>,
    },
}

#[derive(Debug)]
pub enum TransactionAction {
    Transmit {
        message: SipMessage,
        target: SocketAddr,
        transport: TransportKind,
    },
    Deliver(TuEvent),
}

struct Transaction {
    role: Role,
    state: State,
    /// Client: the request, for retransmission. Server: the request that
    /// opened the transaction (kept for Timeout context).
    request: SipMessage,
    /// Server: last response sent, replayed on request retransmits.
    last_response: Option<SipMessage>,
    remote: SocketAddr,
    transport: TransportKind,
    /// Next retransmission instant (timer A/E/G), with current interval.
    retransmit_at: Option<Instant>,
    retransmit_interval: Duration,
    /// Timer B/F (client), H (server INVITE Completed).
    expire_at: Option<Instant>,
    /// Timer D/K/I/J: absorption window ending in Terminated.
    absorb_until: Option<Instant>,
    final_delivered: bool,
}

impl Transaction {
    fn arm_retransmit(&mut self, now: Instant) {
        self.retransmit_interval = T1;
        self.retransmit_at = Some(now + T1);
    }

    fn back_off(&mut self, now: Instant) {
        // Exponential backoff capped at T2.
        self.retransmit_interval = (self.retransmit_interval * 2).min(T2);
        self.retransmit_at = Some(now + self.retransmit_interval);
    }
}

#[derive(Default)]
pub struct TransactionLayer {
    transactions: HashMap<TransactionKey, Transaction>,
}

impl TransactionLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Route one parsed message from the transport.
    pub fn on_message(
        &mut self,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
        now: Instant,
    ) -> Vec<TransactionAction> {
        if message.is_request() {
            self.on_request(message, source, transport, now)
        } else {
            self.on_response(message, source, now)
        }
    }

    fn on_request(
        &mut self,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
        now: Instant,
    ) -> Vec<TransactionAction> {
        let method = message.method().cloned().unwrap_or(SipMethod::Other(String::new()));
        let Some(branch) = message.via_branch().map(str::to_string) else {
            debug!("Request without Via branch dropped");
            return Vec::new();
        };

        // ACK never creates a transaction. It either confirms an INVITE
        // server transaction in Completed (non-2xx case) or belongs to the
        // dialog (2xx case) and is passed through.
        if method == SipMethod::Ack {
            let invite_key = TransactionKey::server(&branch, SipMethod::Invite);
            if let Some(tx) = self.transactions.get_mut(&invite_key) {
                if tx.state == State::Completed {
                    trace!("ACK confirms INVITE server transaction {}", branch);
                    tx.state = State::Confirmed;
                    tx.retransmit_at = None;
                    tx.expire_at = None;
                    tx.absorb_until = Some(now + T4);
                    return Vec::new();
                }
            }
            return vec![TransactionAction::Deliver(TuEvent::Request {
                key: TransactionKey::server(&branch, SipMethod::Ack),
                message,
                source,
                transport,
            })];
        }

        let key = TransactionKey::server(&branch, method.clone());
        if let Some(tx) = self.transactions.get(&key) {
            // Retransmission: replay the last response if one was sent,
            // otherwise absorb silently. The TU never sees duplicates.
            trace!("Absorbing retransmitted {} (branch {})", method, branch);
            if matches!(tx.state, State::Proceeding | State::Completed) {
                if let Some(response) = &tx.last_response {
                    return vec![TransactionAction::Transmit {
                        message: response.clone(),
                        target: tx.remote,
                        transport: tx.transport,
                    }];
                }
            }
            return Vec::new();
        }

        let role = if method == SipMethod::Invite {
            Role::InviteServer
        } else {
            Role::NonInviteServer
        };
        self.transactions.insert(
            key.clone(),
            Transaction {
                role,
                state: if role == Role::InviteServer {
                    State::Proceeding
                } else {
                    State::Trying
                },
                request: message.clone(),
                last_response: None,
                remote: source,
                transport,
                retransmit_at: None,
                retransmit_interval: T1,
                expire_at: None,
                absorb_until: None,
                final_delivered: false,
            },
        );

        vec![TransactionAction::Deliver(TuEvent::Request {
            key,
            message,
            source,
            transport,
        })]
    }

    fn on_response(
        &mut self,
        message: SipMessage,
        source: SocketAddr,
        now: Instant,
    ) -> Vec<TransactionAction> {
        let code = message.status_code().unwrap_or(0);
        let Some((_, method)) = message.cseq() else {
            debug!("Response without CSeq dropped");
            return Vec::new();
        };
        let Some(branch) = message.via_branch().map(str::to_string) else {
            debug!("Response without Via branch dropped");
            return Vec::new();
        };

        let key = TransactionKey::client(&branch, method.clone());
        let Some(tx) = self.transactions.get_mut(&key) else {
            return vec![TransactionAction::Deliver(TuEvent::StrayResponse {
                message,
                source,
            })];
        };

        let mut actions = Vec::new();
        let mut remove_after = false;
        match tx.role {
            Role::InviteClient => match tx.state {
                State::Calling | State::Proceeding => {
                    if code < 200 {
                        tx.state = State::Proceeding;
                        tx.retransmit_at = None;
                        actions.push(TransactionAction::Deliver(TuEvent::Response {
                            key: key.clone(),
                            message,
                        }));
                    } else if code < 300 {
                        // 2xx terminates the transaction; the dialog sends
                        // and retransmits the ACK.
                        tx.state = State::Terminated;
                        tx.final_delivered = true;
                        remove_after = true;
                        actions.push(TransactionAction::Deliver(TuEvent::Response {
                            key: key.clone(),
                            message,
                        }));
                    } else {
                        let ack = build_non_2xx_ack(&tx.request, &message);
                        actions.push(TransactionAction::Transmit {
                            message: ack,
                            target: tx.remote,
                            transport: tx.transport,
                        });
                        tx.state = State::Completed;
                        tx.retransmit_at = None;
                        tx.expire_at = None;
                        tx.absorb_until = Some(now + TIMER_D);
                        if !tx.final_delivered {
                            tx.final_delivered = true;
                            actions.push(TransactionAction::Deliver(TuEvent::Response {
                                key: key.clone(),
                                message,
                            }));
                        }
                    }
                }
                State::Completed => {
                    // Retransmitted final: re-ACK, do not re-deliver.
                    if code >= 300 {
                        let ack = build_non_2xx_ack(&tx.request, &message);
                        actions.push(TransactionAction::Transmit {
                            message: ack,
                            target: tx.remote,
                            transport: tx.transport,
                        });
                    }
                }
                _ => {}
            },
            Role::NonInviteClient => match tx.state {
                State::Trying | State::Proceeding => {
                    if code < 200 {
                        tx.state = State::Proceeding;
                        actions.push(TransactionAction::Deliver(TuEvent::Response {
                            key: key.clone(),
                            message,
                        }));
                    } else {
                        tx.state = State::Completed;
                        tx.retransmit_at = None;
                        tx.expire_at = None;
                        tx.absorb_until = Some(now + T4);
                        if !tx.final_delivered {
                            tx.final_delivered = true;
                            actions.push(TransactionAction::Deliver(TuEvent::Response {
                                key: key.clone(),
                                message,
                            }));
                        }
                    }
                }
                // Completed: absorb retransmitted finals until timer K.
                _ => {}
            },
            Role::InviteServer | Role::NonInviteServer => {
                debug!("Response matched a server transaction, dropped");
            }
        }
        if remove_after {
            self.transactions.remove(&key);
        }
        actions
    }

    /// Send a request through a new client transaction.
    pub fn send_request(
        &mut self,
        message: SipMessage,
        target: SocketAddr,
        transport: TransportKind,
        now: Instant,
    ) -> Result<(TransactionKey, Vec<TransactionAction>)> {
        let method = message
            .method()
            .cloned()
            .ok_or_else(|| Error::sip("send_request requires a request"))?;
        let branch = message
            .via_branch()
            .ok_or_else(|| Error::sip("Request is missing a Via branch"))?
            .to_string();

        if method == SipMethod::Ack {
            return Err(Error::sip("ACK is sent statelessly, not via a transaction"));
        }

        let key = TransactionKey::client(&branch, method.clone());
        let role = if method == SipMethod::Invite {
            Role::InviteClient
        } else {
            Role::NonInviteClient
        };

        let mut tx = Transaction {
            role,
            state: if role == Role::InviteClient {
                State::Calling
            } else {
                State::Trying
            },
            request: message.clone(),
            last_response: None,
            remote: target,
            transport,
            retransmit_at: None,
            retransmit_interval: T1,
            expire_at: Some(now + TIMEOUT_64_T1),
            absorb_until: None,
            final_delivered: false,
        };
        // Retransmission only applies to unreliable transports.
        if transport == TransportKind::Udp {
            tx.arm_retransmit(now);
        }
        self.transactions.insert(key.clone(), tx);

        let actions = vec![TransactionAction::Transmit {
            message,
            target,
            transport,
        }];
        Ok((key, actions))
    }

    /// Send a response from a server transaction. 2xx responses to INVITE
    /// terminate the transaction immediately; their retransmission until
    /// ACK is the dialog's job.
    pub fn send_response(
        &mut self,
        key: &TransactionKey,
        response: SipMessage,
        now: Instant,
    ) -> Result<Vec<TransactionAction>> {
        let tx = self
            .transactions
            .get_mut(key)
            .ok_or_else(|| Error::sip(format!("No server transaction for branch {}", key.branch)))?;

        let code = response
            .status_code()
            .ok_or_else(|| Error::sip("send_response requires a response"))?;

        let action = TransactionAction::Transmit {
            message: response.clone(),
            target: tx.remote,
            transport: tx.transport,
        };
        tx.last_response = Some(response);

        let mut remove = false;
        match (tx.role, code) {
            (_, 100..=199) => {
                tx.state = State::Proceeding;
            }
            (Role::InviteServer, 200..=299) => {
                tx.state = State::Terminated;
                remove = true;
            }
            (Role::InviteServer, _) => {
                tx.state = State::Completed;
                tx.expire_at = Some(now + TIMEOUT_64_T1);
                if tx.transport == TransportKind::Udp {
                    tx.arm_retransmit(now);
                }
            }
            (Role::NonInviteServer, _) => {
                tx.state = State::Completed;
                tx.retransmit_at = None;
                tx.absorb_until = Some(now + TIMEOUT_64_T1);
            }
            (Role::InviteClient | Role::NonInviteClient, _) => {
                return Err(Error::invalid_state("Cannot respond on a client transaction"));
            }
        }
        if remove {
            self.transactions.remove(key);
        }

        Ok(vec![action])
    }

    /// Mark a transaction failed after a transport error (ICMP
    /// port-unreachable surfaces as a send failure on UDP).
    pub fn fail(&mut self, key: &TransactionKey) -> Vec<TransactionAction> {
        let Some(tx) = self.transactions.remove(key) else {
            return Vec::new();
        };
        warn!("Transaction {} failed at transport level", key.branch);
        vec![TransactionAction::Deliver(TuEvent::Timeout {
            key: key.clone(),
            method: tx.request.method().cloned().unwrap_or(SipMethod::Other(String::new())),
            call_id: tx.request.call_id().map(str::to_string),
        })]
    }

    /// Drive retransmission and expiry timers.
    pub fn tick(&mut self, now: Instant) -> Vec<TransactionAction> {
        let mut actions = Vec::new();
        let mut expired = Vec::new();

        for (key, tx) in self.transactions.iter_mut() {
            if let Some(at) = tx.absorb_until {
                if now >= at {
                    expired.push((key.clone(), false));
                    continue;
                }
            }

            if let Some(at) = tx.expire_at {
                if now >= at {
                    // Timer B/F on clients surfaces a timeout; timer H on a
                    // server INVITE means the ACK never came.
                    expired.push((key.clone(), true));
                    continue;
                }
            }

            if let Some(at) = tx.retransmit_at {
                if now >= at {
                    let message = match tx.role {
                        Role::InviteClient | Role::NonInviteClient => Some(tx.request.clone()),
                        Role::InviteServer | Role::NonInviteServer => tx.last_response.clone(),
                    };
                    if let Some(message) = message {
                        trace!(
                            "Retransmitting {} (branch {})",
                            if key.is_server { "response" } else { "request" },
                            key.branch
                        );
                        actions.push(TransactionAction::Transmit {
                            message,
                            target: tx.remote,
                            transport: tx.transport,
                        });
                    }
                    tx.back_off(now);
                }
            }
        }

        for (key, is_timeout) in expired {
            if let Some(tx) = self.transactions.remove(&key) {
                if is_timeout && !tx.final_delivered {
                    actions.push(TransactionAction::Deliver(TuEvent::Timeout {
                        key: key.clone(),
                        method: tx
                            .request
                            .method()
                            .cloned()
                            .unwrap_or(SipMethod::Other(String::new())),
                        call_id: tx.request.call_id().map(str::to_string),
                    }));
                }
            }
        }

        actions
    }
}

/// The transaction-level ACK for a non-2xx final response
/// (RFC 3261 §17.1.1.3): same branch and Request-URI as the INVITE, To
/// taken from the response so its tag matches.
fn build_non_2xx_ack(invite: &SipMessage, response: &SipMessage) -> SipMessage {
    let uri = invite.request_uri().unwrap_or_default().to_string();
    let mut ack = SipMessage::request(SipMethod::Ack, uri);
    if let Some(via) = invite.header("Via") {
        ack.add_header("Via", via);
    }
    for name in ["From", "Call-ID"] {
        if let Some(value) = invite.header(name) {
            ack.add_header(name, value);
        }
    }
    if let Some(to) = response.header("To") {
        ack.add_header("To", to);
    }
    if let Some((seq, _)) = invite.cseq() {
        ack.add_header("CSeq", format!("{} ACK", seq));
    }
    ack.add_header("Max-Forwards", "70");
    ack
}
