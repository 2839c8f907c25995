//! SIP dialogs (RFC 3261 §12)
//!
//! A dialog is identified by Call-ID plus the two tags and outlives any
//! single transaction. The B2BUA keeps two of these per call, one per leg.

use std::net::SocketAddr;

use crate::protocols::sip::message::uri_from_name_addr;
use crate::protocols::sip::{generate_branch, SipMessage, SipMethod, TransportKind};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub state: DialogState,
    /// Our address-of-record for From/To on this leg.
    pub local_uri: String,
    pub remote_uri: String,
    /// Where in-dialog requests go: the peer's Contact.
    pub remote_target: String,
    pub remote_addr: SocketAddr,
    pub transport: TransportKind,
    pub local_contact: String,
    pub route_set: Vec<String>,
    local_seq: u32,
    remote_seq: Option<u32>,
}

impl Dialog {
    /// UAS-side dialog from an incoming request. `local_tag` becomes the
    /// To tag on every response we send.
    pub fn from_incoming_request(
        request: &SipMessage,
        local_tag: String,
        local_contact: String,
        source: SocketAddr,
        transport: TransportKind,
    ) -> Result<Self> {
        let call_id = request
            .call_id()
            .ok_or_else(|| Error::sip("Request missing Call-ID"))?
            .to_string();
        let remote_tag = request.from_tag().map(str::to_string);
        let (remote_seq, _) = request
            .cseq()
            .ok_or_else(|| Error::sip("Request missing CSeq"))?;

        let remote_uri = uri_from_name_addr(
            request
                .header("From")
                .ok_or_else(|| Error::sip("Request missing From"))?,
        )
        .to_string();
        let local_uri = uri_from_name_addr(
            request
                .header("To")
                .ok_or_else(|| Error::sip("Request missing To"))?,
        )
        .to_string();
        // Symmetric signaling: requests go back to where the INVITE came
        // from, not wherever Contact claims, which survives NAT.
        let remote_target = request
            .contact_uri()
            .map(str::to_string)
            .unwrap_or_else(|| remote_uri.clone());

        let route_set = request
            .headers_named("Record-Route")
            .map(str::to_string)
            .collect();

        Ok(Self {
            call_id,
            local_tag,
            remote_tag,
            state: DialogState::Early,
            local_uri,
            remote_uri,
            remote_target,
            remote_addr: source,
            transport,
            local_contact,
            route_set,
            local_seq: 0,
            remote_seq: Some(remote_seq),
        })
    }

    /// UAC-side dialog for a request we are about to send.
    pub fn outgoing(
        call_id: String,
        local_uri: String,
        remote_uri: String,
        local_tag: String,
        local_contact: String,
        remote_addr: SocketAddr,
        transport: TransportKind,
    ) -> Self {
        Self {
            call_id,
            local_tag,
            remote_tag: None,
            state: DialogState::Early,
            local_uri,
            remote_uri: remote_uri.clone(),
            remote_target: remote_uri,
            remote_addr,
            transport,
            local_contact,
            route_set: Vec::new(),
            local_seq: 0,
            remote_seq: None,
        }
    }

    pub fn id(&self) -> Option<DialogId> {
        Some(DialogId {
            call_id: self.call_id.clone(),
            local_tag: self.local_tag.clone(),
            remote_tag: self.remote_tag.clone()?,
        })
    }

    /// Absorb the peer tag and Contact from a UAC response. 1xx with a tag
    /// makes the dialog early; 2xx confirms it.
    pub fn on_response(&mut self, response: &SipMessage) {
        if self.remote_tag.is_none() {
            if let Some(tag) = response.to_tag() {
                self.remote_tag = Some(tag.to_string());
            }
        }
        if let Some(contact) = response.contact_uri() {
            self.remote_target = contact.to_string();
        }
        if let Some(code) = response.status_code() {
            if (200..300).contains(&code) {
                self.state = DialogState::Confirmed;
            }
        }
    }

    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq += 1;
        self.local_seq
    }

    pub fn current_local_seq(&self) -> u32 {
        self.local_seq
    }

    /// Enforce monotonic remote CSeq. Out-of-order in-dialog requests are
    /// rejected with 500 per the concurrency contract.
    pub fn check_remote_seq(&mut self, seq: u32) -> Result<()> {
        if let Some(last) = self.remote_seq {
            if seq <= last {
                return Err(Error::invalid_state(format!(
                    "Out-of-order CSeq {} (last {})",
                    seq, last
                )));
            }
        }
        self.remote_seq = Some(seq);
        Ok(())
    }

    /// Build an in-dialog request (BYE, re-INVITE, INFO, NOTIFY).
    pub fn create_request(&mut self, method: SipMethod) -> SipMessage {
        let seq = self.next_local_seq();
        self.build_request(method, seq)
    }

    fn build_request(&self, method: SipMethod, seq: u32) -> SipMessage {
        let mut request = SipMessage::request(method.clone(), self.remote_target.clone());
        request.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={}",
                self.transport,
                via_host(&self.local_contact),
                generate_branch()
            ),
        );
        request.add_header("Max-Forwards", "70");
        request.add_header(
            "From",
            format!("<{}>;tag={}", self.local_uri, self.local_tag),
        );
        match &self.remote_tag {
            Some(tag) => request.add_header("To", format!("<{}>;tag={}", self.remote_uri, tag)),
            None => request.add_header("To", format!("<{}>", self.remote_uri)),
        };
        request.add_header("Call-ID", self.call_id.clone());
        request.add_header("CSeq", format!("{} {}", seq, method));
        request.add_header("Contact", format!("<{}>", self.local_contact));
        for route in &self.route_set {
            request.add_header("Route", route);
        }
        request
    }

    /// The ACK for a 2xx response reuses the INVITE's CSeq number with a
    /// fresh branch, per RFC 3261 §13.2.2.4.
    pub fn create_ack(&self, invite_seq: u32) -> SipMessage {
        self.build_request(SipMethod::Ack, invite_seq)
    }

    /// Build a response on this dialog, tagging To with our local tag.
    pub fn create_response(
        &self,
        request: &SipMessage,
        code: u16,
        reason: &str,
    ) -> SipMessage {
        let mut response = SipMessage::response_for(request, code, reason);
        if response.to_tag().is_none() {
            let to = response.header("To").unwrap_or_default().to_string();
            response.set_header("To", format!("{};tag={}", to, self.local_tag));
        }
        response.add_header("Contact", format!("<{}>", self.local_contact));
        response
    }
}

/// Host:port portion of a contact URI for Via construction.
fn via_host(contact: &str) -> &str {
    let uri = uri_from_name_addr(contact);
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .unwrap_or(uri);
    rest.split('@').last().unwrap_or(rest).split(';').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming_invite() -> SipMessage {
        let mut msg = SipMessage::request(SipMethod::Invite, "sip:1002@rivet.local");
        msg.add_header("Via", "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKd1");
        msg.add_header("Max-Forwards", "70");
        msg.add_header("From", "\"Alice\" <sip:1001@rivet.local>;tag=alice-tag");
        msg.add_header("To", "<sip:1002@rivet.local>");
        msg.add_header("Call-ID", "dlg-test-1");
        msg.add_header("CSeq", "10 INVITE");
        msg.add_header("Contact", "<sip:1001@192.168.1.100:5060>");
        msg
    }

    fn uas_dialog() -> Dialog {
        Dialog::from_incoming_request(
            &incoming_invite(),
            "pbx-tag".to_string(),
            "sip:pbx@192.168.1.14:5060".to_string(),
            "192.168.1.100:5060".parse().unwrap(),
            TransportKind::Udp,
        )
        .unwrap()
    }

    #[test]
    fn test_uas_dialog_fields() {
        let dialog = uas_dialog();
        assert_eq!(dialog.call_id, "dlg-test-1");
        assert_eq!(dialog.remote_tag.as_deref(), Some("alice-tag"));
        assert_eq!(dialog.remote_uri, "sip:1001@rivet.local");
        assert_eq!(dialog.local_uri, "sip:1002@rivet.local");
        assert_eq!(dialog.remote_target, "sip:1001@192.168.1.100:5060");
        assert_eq!(dialog.state, DialogState::Early);
    }

    #[test]
    fn test_response_carries_local_tag() {
        let dialog = uas_dialog();
        let response = dialog.create_response(&incoming_invite(), 180, "Ringing");
        assert_eq!(response.to_tag(), Some("pbx-tag"));
        assert_eq!(response.status_code(), Some(180));
    }

    #[test]
    fn test_in_dialog_request_construction() {
        let mut dialog = uas_dialog();
        let bye = dialog.create_request(SipMethod::Bye);
        assert_eq!(bye.method(), Some(&SipMethod::Bye));
        assert_eq!(bye.request_uri(), Some("sip:1001@192.168.1.100:5060"));
        assert_eq!(bye.call_id(), Some("dlg-test-1"));
        assert_eq!(bye.from_tag(), Some("pbx-tag"));
        assert_eq!(bye.to_tag(), Some("alice-tag"));
        assert_eq!(bye.cseq(), Some((1, SipMethod::Bye)));
        assert!(bye.via_branch().unwrap().starts_with("z9hG4bK"));

        // Subsequent requests advance CSeq monotonically.
        let info = dialog.create_request(SipMethod::Info);
        assert_eq!(info.cseq().unwrap().0, 2);
    }

    #[test]
    fn test_remote_cseq_monotonic() {
        let mut dialog = uas_dialog();
        // The INVITE carried CSeq 10.
        assert!(dialog.check_remote_seq(11).is_ok());
        assert!(dialog.check_remote_seq(11).is_err());
        assert!(dialog.check_remote_seq(10).is_err());
        assert!(dialog.check_remote_seq(12).is_ok());
    }

    #[test]
    fn test_uac_dialog_learns_tag_and_target() {
        let mut dialog = Dialog::outgoing(
            "out-1".to_string(),
            "sip:pbx@rivet.local".to_string(),
            "sip:1002@192.168.1.101:5060".to_string(),
            "pbx-out".to_string(),
            "sip:pbx@192.168.1.14:5060".to_string(),
            "192.168.1.101:5060".parse().unwrap(),
            TransportKind::Udp,
        );
        assert!(dialog.id().is_none());

        let mut ringing = SipMessage::response(180, "Ringing");
        ringing.add_header("To", "<sip:1002@192.168.1.101>;tag=bob-tag");
        ringing.add_header("Contact", "<sip:1002@192.168.1.101:5062>");
        dialog.on_response(&ringing);

        assert_eq!(dialog.remote_tag.as_deref(), Some("bob-tag"));
        assert_eq!(dialog.remote_target, "sip:1002@192.168.1.101:5062");
        assert_eq!(dialog.state, DialogState::Early);

        let mut ok = SipMessage::response(200, "OK");
        ok.add_header("To", "<sip:1002@192.168.1.101>;tag=bob-tag");
        dialog.on_response(&ok);
        assert_eq!(dialog.state, DialogState::Confirmed);

        let ack = dialog.create_ack(1);
        assert_eq!(ack.cseq(), Some((1, SipMethod::Ack)));
        assert_eq!(ack.to_tag(), Some("bob-tag"));
    }
}
