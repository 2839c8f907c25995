//! Signaling engine: the transaction user
//!
//! One task owns the transaction layer and multiplexes three inputs:
//! parsed messages from the transport, outbound commands from the call
//! FSMs and registrar, and the timer tick. Messages are dispatched by
//! method and Call-ID — REGISTER to the registrar, call-related traffic
//! to the owning call task, housekeeping (OPTIONS, NOTIFY) answered in
//! place. No lock is held across I/O: the engine is the only writer of
//! transaction state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocols::sip::{
    SipMessage, SipMethod, SipTransportLayer, TransportEvent, TransportKind,
};
use crate::services::b2bua::{B2buaService, CallEvent};
use crate::services::registrar::Registrar;
use crate::signaling::{SipCommand, SipSender, TransactionAction, TransactionKey, TransactionLayer, TuEvent};

const METHODS_ALLOWED: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, REGISTER, INFO, NOTIFY";

pub struct SignalingEngine {
    transport: Arc<SipTransportLayer>,
    transactions: TransactionLayer,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<SipCommand>,
    sip: SipSender,
    registrar: Arc<Registrar>,
    b2bua: Arc<B2buaService>,
    user_agent: String,
    shutdown: CancellationToken,
}

impl SignalingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<SipTransportLayer>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedReceiver<SipCommand>,
        sip: SipSender,
        registrar: Arc<Registrar>,
        b2bua: Arc<B2buaService>,
        user_agent: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            transactions: TransactionLayer::new(),
            transport_events,
            commands,
            sip,
            registrar,
            b2bua,
            user_agent,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Signaling engine running");
        let mut ticker = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.transport_events.recv() => match event {
                    Some(TransportEvent::MessageReceived { message, source, transport }) => {
                        let actions =
                            self.transactions.on_message(message, source, transport, Instant::now());
                        self.apply(actions).await;
                    }
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    let actions = self.transactions.tick(Instant::now());
                    self.apply(actions).await;
                }
            }
        }
        info!("Signaling engine stopped");
    }

    async fn on_command(&mut self, command: SipCommand) {
        match command {
            SipCommand::Respond { key, response } => {
                self.respond(key, response).await;
            }
            SipCommand::Request {
                message,
                target,
                transport,
            } => match self
                .transactions
                .send_request(message, target, transport, Instant::now())
            {
                Ok((_key, actions)) => self.transmit_actions(actions).await,
                Err(e) => warn!("Failed to start client transaction: {}", e),
            },
            SipCommand::Stateless {
                message,
                target,
                transport,
            } => {
                if let Err(e) = self.transport.send(&message, target, transport).await {
                    debug!("Stateless send to {} failed: {}", target, e);
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<TransactionAction>) {
        for action in actions {
            match action {
                TransactionAction::Transmit {
                    message,
                    target,
                    transport,
                } => self.transmit(message, target, transport).await,
                TransactionAction::Deliver(event) => self.dispatch(event).await,
            }
        }
    }

    /// Actions known to contain no TU deliveries (responses and request
    /// sends produce only transmissions). Kept separate from `apply` so
    /// the dispatch path is not recursive.
    async fn transmit_actions(&mut self, actions: Vec<TransactionAction>) {
        for action in actions {
            match action {
                TransactionAction::Transmit {
                    message,
                    target,
                    transport,
                } => self.transmit(message, target, transport).await,
                TransactionAction::Deliver(event) => {
                    debug!("Unexpected TU delivery on send path: {:?}", event);
                }
            }
        }
    }

    async fn transmit(&mut self, message: SipMessage, target: SocketAddr, transport: TransportKind) {
        if let Err(e) = self.transport.send(&message, target, transport).await {
            // An unreachable peer surfaces as a send failure; the
            // transaction timer will escalate it.
            debug!("Transmit to {} failed: {}", target, e);
        }
    }

    async fn dispatch(&mut self, event: TuEvent) {
        match event {
            TuEvent::Request {
                key,
                message,
                source,
                transport,
            } => self.on_request(key, message, source, transport).await,
            TuEvent::Response { key: _, message } => {
                self.route_to_call_response(message);
            }
            TuEvent::StrayResponse { message, .. } => {
                // Late 200 retransmissions land here; the owning call
                // re-ACKs them.
                self.route_to_call_response(message);
            }
            TuEvent::Timeout {
                key: _,
                method,
                call_id,
            } => {
                if let Some(call_id) = call_id {
                    if !self
                        .b2bua
                        .deliver(&call_id, CallEvent::TransactionTimeout { method })
                    {
                        debug!("Timeout for unknown call {}", call_id);
                    }
                }
            }
        }
    }

    fn route_to_call_response(&self, message: SipMessage) {
        let Some(call_id) = message.call_id().map(str::to_string) else {
            return;
        };
        if !self.b2bua.deliver(&call_id, CallEvent::Response { message }) {
            debug!("Response for unknown call {}", call_id);
        }
    }

    async fn on_request(
        &mut self,
        key: TransactionKey,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) {
        let method = message
            .method()
            .cloned()
            .unwrap_or(SipMethod::Other(String::new()));

        match method {
            SipMethod::Register => {
                // Registrar work does DB and PBKDF2 I/O; it never blocks
                // the engine loop.
                let registrar = Arc::clone(&self.registrar);
                let sip = self.sip.clone();
                tokio::spawn(async move {
                    let response = registrar.handle_register(&message, source, transport).await;
                    sip.respond(key, response);
                });
            }
            SipMethod::Options => {
                let mut response = SipMessage::response_for(&message, 200, "OK");
                response.add_header("Allow", METHODS_ALLOWED);
                response.add_header("Server", self.user_agent.clone());
                self.respond(key, response).await;
            }
            SipMethod::Notify => {
                // Inbound NOTIFY (e.g. a phone confirming check-sync) is
                // acknowledged and dropped.
                let response = SipMessage::response_for(&message, 200, "OK");
                self.respond(key, response).await;
            }
            SipMethod::Invite => {
                if message.to_tag().is_some() {
                    // re-INVITE inside an existing dialog.
                    self.route_in_dialog(key, message, source, transport).await;
                } else {
                    self.b2bua.handle_invite(key, message, source, transport);
                }
            }
            SipMethod::Ack | SipMethod::Bye | SipMethod::Cancel | SipMethod::Info => {
                self.route_in_dialog(key, message, source, transport).await;
            }
            SipMethod::Other(name) => {
                debug!("Unimplemented method {} from {}", name, source);
                let response = SipMessage::response_for(&message, 501, "Not Implemented");
                self.respond(key, response).await;
            }
        }
    }

    async fn route_in_dialog(
        &mut self,
        key: TransactionKey,
        message: SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) {
        let method = message.method().cloned();
        let call_id = message.call_id().unwrap_or_default().to_string();
        let delivered = self.b2bua.deliver(
            &call_id,
            CallEvent::Request {
                key: key.clone(),
                message: message.clone(),
                source,
                transport,
            },
        );
        if delivered {
            return;
        }

        match method {
            // A stray ACK has nothing to answer.
            Some(SipMethod::Ack) => {}
            _ => {
                debug!("{:?} for unknown dialog {}", method, call_id);
                let response =
                    SipMessage::response_for(&message, 481, "Call/Transaction Does Not Exist");
                self.respond(key, response).await;
            }
        }
    }

    async fn respond(&mut self, key: TransactionKey, response: SipMessage) {
        match self.transactions.send_response(&key, response, Instant::now()) {
            Ok(actions) => self.transmit_actions(actions).await,
            Err(e) => debug!("Response on dead transaction {}: {}", key.branch, e),
        }
    }
}
