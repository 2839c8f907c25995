//! SIP signaling state: transactions, dialogs, digest authentication

pub mod auth;
pub mod dialog;
pub mod transaction;

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::protocols::sip::{SipMessage, TransportKind};

pub use auth::DigestAuthenticator;
pub use dialog::{Dialog, DialogId, DialogState};
pub use transaction::{TransactionAction, TransactionKey, TransactionLayer, TuEvent};

/// Outbound SIP operations, executed by the signaling engine task that
/// owns the transaction layer. Everything here is fire-and-forget from
/// the caller's side; delivery failures surface later as transaction
/// timeouts.
#[derive(Debug)]
pub enum SipCommand {
    /// Respond on an existing server transaction.
    Respond {
        key: TransactionKey,
        response: SipMessage,
    },
    /// Send a request through a new client transaction.
    Request {
        message: SipMessage,
        target: SocketAddr,
        transport: TransportKind,
    },
    /// Send without a transaction (ACK, 200-retransmissions after the
    /// INVITE server transaction is gone).
    Stateless {
        message: SipMessage,
        target: SocketAddr,
        transport: TransportKind,
    },
}

/// Clonable handle the call FSMs and registrar use to emit SIP.
#[derive(Debug, Clone)]
pub struct SipSender {
    tx: mpsc::UnboundedSender<SipCommand>,
}

impl SipSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SipCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn respond(&self, key: TransactionKey, response: SipMessage) {
        let _ = self.tx.send(SipCommand::Respond { key, response });
    }

    pub fn request(&self, message: SipMessage, target: SocketAddr, transport: TransportKind) {
        let _ = self.tx.send(SipCommand::Request {
            message,
            target,
            transport,
        });
    }

    pub fn stateless(&self, message: SipMessage, target: SocketAddr, transport: TransportKind) {
        let _ = self.tx.send(SipCommand::Stateless {
            message,
            target,
            transport,
        });
    }
}
