//! SIP message representation and serialization

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// SIP request methods understood by the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Notify,
    /// Any method the core does not implement; answered with 501.
    Other(String),
}

impl SipMethod {
    pub fn from_str(s: &str) -> Self {
        match s {
            "REGISTER" => Self::Register,
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "OPTIONS" => Self::Options,
            "INFO" => Self::Info,
            "NOTIFY" => Self::Notify,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Register => "REGISTER",
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Options => "OPTIONS",
            Self::Info => "INFO",
            Self::Notify => "NOTIFY",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for SipMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First line of a SIP message.
#[derive(Debug, Clone, PartialEq)]
pub enum StartLine {
    Request { method: SipMethod, uri: String },
    Response { code: u16, reason: String },
}

/// One header field. Name case and position are preserved from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SipMessage {
    pub start: StartLine,
    pub headers: Vec<Header>,
    pub body: Bytes,
}

/// Expand an RFC 3261 compact header name to its full form.
fn expand_compact(name: &str) -> &str {
    match name.to_ascii_lowercase().as_str() {
        "v" => "Via",
        "f" => "From",
        "t" => "To",
        "i" => "Call-ID",
        "m" => "Contact",
        "c" => "Content-Type",
        "l" => "Content-Length",
        "s" => "Subject",
        "k" => "Supported",
        _ => name,
    }
}

fn names_match(a: &str, b: &str) -> bool {
    expand_compact(a).eq_ignore_ascii_case(expand_compact(b))
}

impl SipMessage {
    pub fn request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Build a response to `request`, copying the headers a response must
    /// mirror: all Via headers in order, From, To, Call-ID, and CSeq.
    pub fn response_for(request: &SipMessage, code: u16, reason: impl Into<String>) -> Self {
        let mut response = Self::response(code, reason);
        for header in &request.headers {
            if names_match(&header.name, "Via") {
                response.add_header("Via", &header.value);
            }
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.header(name) {
                response.add_header(name, value);
            }
        }
        response
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&SipMethod> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// First header matching `name` (case-insensitive, compact-form aware).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| names_match(&h.name, name))
            .map(|h| h.value.as_str())
    }

    /// All headers matching `name`, in wire order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| names_match(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Replace the first header named `name`, or append if absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if let Some(header) = self.headers.iter_mut().find(|h| names_match(&h.name, name)) {
            header.value = value;
        } else {
            self.headers.push(Header {
                name: name.to_string(),
                value,
            });
        }
        self
    }

    pub fn remove_headers(&mut self, name: &str) {
        self.headers.retain(|h| !names_match(&h.name, name));
    }

    /// Prepend a Via header, keeping any existing Vias below it.
    pub fn push_via(&mut self, value: impl Into<String>) {
        let position = self
            .headers
            .iter()
            .position(|h| names_match(&h.name, "Via"))
            .unwrap_or(0);
        self.headers.insert(
            position,
            Header {
                name: "Via".to_string(),
                value: value.into(),
            },
        );
    }

    /// Remove the topmost Via header (used when absorbing our own hop).
    pub fn pop_via(&mut self) -> Option<String> {
        let position = self
            .headers
            .iter()
            .position(|h| names_match(&h.name, "Via"))?;
        Some(self.headers.remove(position).value)
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<Bytes>) -> &mut Self {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
        self
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq sequence number and method.
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = SipMethod::from_str(parts.next()?);
        Some((seq, method))
    }

    /// Branch parameter of the topmost Via.
    pub fn via_branch(&self) -> Option<&str> {
        let via = self.header("Via")?;
        header_param(via, "branch")
    }

    pub fn from_tag(&self) -> Option<&str> {
        header_param(self.header("From")?, "tag")
    }

    pub fn to_tag(&self) -> Option<&str> {
        header_param(self.header("To")?, "tag")
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.header("Max-Forwards")?.trim().parse().ok()
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("Expires")?.trim().parse().ok()
    }

    /// Bare URI inside the first Contact header's angle brackets, or the
    /// whole value up to any parameters when unbracketed.
    pub fn contact_uri(&self) -> Option<&str> {
        let contact = self.header("Contact")?;
        Some(uri_from_name_addr(contact))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// User part of the Request-URI (the dialed number for INVITEs).
    pub fn request_user(&self) -> Option<&str> {
        uri_user(self.request_uri()?)
    }

    /// Serialize to the canonical wire form. Content-Length is always
    /// recomputed from the body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());

        match &self.start {
            StartLine::Request { method, uri } => {
                buf.put_slice(method.as_str().as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(uri.as_bytes());
                buf.put_slice(b" SIP/2.0\r\n");
            }
            StartLine::Response { code, reason } => {
                buf.put_slice(format!("SIP/2.0 {} {}\r\n", code, reason).as_bytes());
            }
        }

        for header in &self.headers {
            if names_match(&header.name, "Content-Length") {
                continue;
            }
            buf.put_slice(expand_compact(&header.name).as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(header.value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);

        buf.freeze()
    }
}

/// Extract a `;name=value` parameter from a header value.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    for param in value.split(';').skip(1) {
        let param = param.trim();
        if let Some((key, val)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(val.trim().trim_matches('"'));
            }
        }
    }
    None
}

/// Strip the display name and angle brackets from a name-addr, leaving the
/// URI. Parameters outside the brackets are dropped.
pub fn uri_from_name_addr(value: &str) -> &str {
    if let Some(start) = value.find('<') {
        if let Some(end) = value[start..].find('>') {
            return &value[start + 1..start + end];
        }
    }
    value.split(';').next().unwrap_or(value).trim()
}

/// User part of a SIP URI (`sip:user@host` → `user`).
pub fn uri_user(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("sip:").or_else(|| uri.strip_prefix("sips:"))?;
    let user = rest.split('@').next()?;
    if user.is_empty() || user == rest {
        None
    } else {
        Some(user)
    }
}

/// Host and optional port of a SIP URI.
pub fn uri_host_port(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("sip:")
        .or_else(|| uri.strip_prefix("sips:"))
        .ok_or_else(|| Error::parse(format!("Unsupported URI scheme: {}", uri)))?;
    let host_part = rest.split('@').last().unwrap_or(rest);
    let host_part = host_part.split(';').next().unwrap_or(host_part);
    match host_part.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => {
            let port = port
                .parse()
                .map_err(|_| Error::parse(format!("Invalid port in URI: {}", uri)))?;
            Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
        }
        _ => Ok((
            host_part.trim_matches(|c| c == '[' || c == ']').to_string(),
            5060,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_conversion() {
        assert_eq!(SipMethod::from_str("INVITE"), SipMethod::Invite);
        assert_eq!(SipMethod::Invite.as_str(), "INVITE");
        assert_eq!(
            SipMethod::from_str("PUBLISH"),
            SipMethod::Other("PUBLISH".to_string())
        );
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut msg = SipMessage::request(SipMethod::Invite, "sip:1002@rivet.local");
        msg.add_header("CALL-id", "abc123");
        assert_eq!(msg.header("Call-ID"), Some("abc123"));
        assert_eq!(msg.header("i"), Some("abc123"));
    }

    #[test]
    fn test_via_order_preserved() {
        let mut msg = SipMessage::request(SipMethod::Invite, "sip:1002@rivet.local");
        msg.add_header("Via", "SIP/2.0/UDP a.example;branch=z9hG4bKa");
        msg.add_header("Via", "SIP/2.0/UDP b.example;branch=z9hG4bKb");
        msg.push_via("SIP/2.0/UDP pbx.example;branch=z9hG4bKpbx");

        let vias: Vec<&str> = msg.headers_named("Via").collect();
        assert_eq!(vias.len(), 3);
        assert!(vias[0].contains("pbx.example"));
        assert!(vias[1].contains("a.example"));

        assert_eq!(
            msg.pop_via().as_deref(),
            Some("SIP/2.0/UDP pbx.example;branch=z9hG4bKpbx")
        );
        assert_eq!(msg.via_branch(), Some("z9hG4bKa"));
    }

    #[test]
    fn test_response_for_copies_required_headers() {
        let mut request = SipMessage::request(SipMethod::Invite, "sip:1002@rivet.local");
        request.add_header("Via", "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds");
        request.add_header("From", "<sip:1001@rivet.local>;tag=1928301774");
        request.add_header("To", "<sip:1002@rivet.local>");
        request.add_header("Call-ID", "a84b4c76e66710");
        request.add_header("CSeq", "314159 INVITE");

        let response = SipMessage::response_for(&request, 180, "Ringing");
        assert_eq!(response.status_code(), Some(180));
        assert_eq!(response.header("Call-ID"), Some("a84b4c76e66710"));
        assert_eq!(response.cseq(), Some((314159, SipMethod::Invite)));
        assert_eq!(response.via_branch(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn test_encode_recomputes_content_length() {
        let mut msg = SipMessage::response(200, "OK");
        msg.add_header("Content-Length", "999");
        msg.set_body("application/sdp", "v=0\r\n");

        let wire = msg.encode();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_uri_helpers() {
        assert_eq!(uri_user("sip:1001@192.168.1.14"), Some("1001"));
        assert_eq!(uri_user("sip:192.168.1.14"), None);
        assert_eq!(
            uri_from_name_addr("\"Front Desk\" <sip:1001@rivet.local>;tag=x"),
            "sip:1001@rivet.local"
        );
        let (host, port) = uri_host_port("sip:1001@192.168.1.14:5080;transport=udp").unwrap();
        assert_eq!(host, "192.168.1.14");
        assert_eq!(port, 5080);
        let (host, port) = uri_host_port("sip:192.168.1.14").unwrap();
        assert_eq!(host, "192.168.1.14");
        assert_eq!(port, 5060);
        assert!(uri_host_port("http://example.com").is_err());
    }

    #[test]
    fn test_header_param_extraction() {
        let via = "SIP/2.0/UDP 10.0.0.1:5060;rport;branch=z9hG4bKabc;received=1.2.3.4";
        assert_eq!(header_param(via, "branch"), Some("z9hG4bKabc"));
        assert_eq!(header_param(via, "received"), Some("1.2.3.4"));
        assert_eq!(header_param(via, "ttl"), None);
    }
}
