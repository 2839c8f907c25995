//! SIP message parsing
//!
//! Permissive on header name case, ordering, compact forms, and obsolete
//! line folding; strict on the headers a request cannot be processed
//! without (Via, From, To, Call-ID, CSeq, Max-Forwards).

use bytes::{Bytes, BytesMut};

use super::message::{Header, SipMessage, SipMethod, StartLine};
use crate::{Error, Result};

const REQUIRED_REQUEST_HEADERS: &[&str] = &["Via", "From", "To", "Call-ID", "CSeq", "Max-Forwards"];

/// Parse one complete SIP message from a buffer.
pub fn parse_message(data: &[u8]) -> Result<SipMessage> {
    let text_end = find_head_end(data)
        .ok_or_else(|| Error::parse("SIP message has no header terminator"))?;
    let head = std::str::from_utf8(&data[..text_end.0])
        .map_err(|_| Error::parse("SIP head is not valid UTF-8"))?;
    let body = Bytes::copy_from_slice(&data[text_end.1..]);

    let mut lines = unfold_lines(head);
    let start_line = lines
        .next()
        .ok_or_else(|| Error::parse("Empty SIP message"))?;
    let start = parse_start_line(&start_line)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::parse(format!("Malformed header line: {}", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::parse("Header with empty name"));
        }
        headers.push(Header {
            name: name.to_string(),
            value: value.trim().to_string(),
        });
    }

    let message = SipMessage {
        start,
        headers,
        body,
    };

    if message.is_request() {
        validate_request(&message)?;
    } else if message.header("Via").is_none() {
        return Err(Error::parse("Response missing Via"));
    }

    Ok(message)
}

fn validate_request(message: &SipMessage) -> Result<()> {
    for name in REQUIRED_REQUEST_HEADERS {
        if message.header(name).is_none() {
            // ACK for a non-2xx is generated by clients without
            // Max-Forwards in the wild; tolerate it there only.
            if *name == "Max-Forwards" && message.method() == Some(&SipMethod::Ack) {
                continue;
            }
            return Err(Error::parse(format!("Request missing {} header", name)));
        }
    }
    if message.cseq().is_none() {
        return Err(Error::parse("Unparseable CSeq header"));
    }
    Ok(())
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code: u16 = parts
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| Error::parse(format!("Invalid status code in: {}", line)))?;
        if !(100..700).contains(&code) {
            return Err(Error::parse(format!("Status code out of range: {}", code)));
        }
        let reason = parts.next().unwrap_or_default().trim().to_string();
        return Ok(StartLine::Response { code, reason });
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::parse("Empty request line"))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::parse("Request line missing URI"))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::parse("Request line missing version"))?;
    if version != "SIP/2.0" {
        return Err(Error::parse(format!("Unsupported SIP version: {}", version)));
    }

    Ok(StartLine::Request {
        method: SipMethod::from_str(method),
        uri: uri.to_string(),
    })
}

/// Locate the blank line ending the head. Returns (head length, body start).
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    // Tolerate bare-LF senders.
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// Iterate logical header lines, joining obsolete folded continuations.
fn unfold_lines(head: &str) -> impl Iterator<Item = String> + '_ {
    let mut merged: Vec<String> = Vec::new();
    for raw in head.split("\r\n").flat_map(|chunk| chunk.split('\n')) {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = merged.last_mut() {
                last.push(' ');
                last.push_str(raw.trim());
                continue;
            }
        }
        merged.push(raw.trim_end().to_string());
    }
    merged.into_iter()
}

/// Accumulates a TCP byte stream and yields complete Content-Length framed
/// messages.
#[derive(Debug, Default)]
pub struct StreamFramer {
    buffer: BytesMut,
}

impl StreamFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete message, or `None` until more bytes arrive.
    /// A framing-level parse failure discards the buffer, since stream
    /// resynchronization is not possible mid-connection.
    pub fn next_message(&mut self) -> Result<Option<SipMessage>> {
        // Skip keep-alive CRLF between messages.
        while self.buffer.starts_with(b"\r\n") {
            let _ = self.buffer.split_to(2);
        }

        let Some((head_len, body_start)) = find_head_end(&self.buffer) else {
            return Ok(None);
        };

        let head_bytes = self.buffer[..head_len].to_vec();
        let head = match std::str::from_utf8(&head_bytes) {
            Ok(head) => head,
            Err(_) => return Err(self.poison("non-UTF-8 head")),
        };
        let content_length = match content_length_of(head) {
            Some(content_length) => content_length,
            None => {
                return Err(self.poison("missing or invalid Content-Length on stream transport"))
            }
        };

        let total = body_start + content_length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total);
        Ok(Some(parse_message(&frame)?))
    }

    fn poison(&mut self, reason: &str) -> Error {
        self.buffer.clear();
        Error::parse(format!("SIP stream framing error: {}", reason))
    }
}

fn content_length_of(head: &str) -> Option<usize> {
    for line in head.split("\r\n").flat_map(|chunk| chunk.split('\n')) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:1002@rivet.local SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK74bf9\r\n\
        Max-Forwards: 70\r\n\
        From: \"Alice\" <sip:1001@rivet.local>;tag=9fxced76sl\r\n\
        To: <sip:1002@rivet.local>\r\n\
        Call-ID: 3848276298220188511@192.168.1.100\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:1001@192.168.1.100:5060>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\n";

    #[test]
    fn test_parse_request() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        assert_eq!(msg.method(), Some(&SipMethod::Invite));
        assert_eq!(msg.request_uri(), Some("sip:1002@rivet.local"));
        assert_eq!(msg.via_branch(), Some("z9hG4bK74bf9"));
        assert_eq!(msg.from_tag(), Some("9fxced76sl"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.max_forwards(), Some(70));
        assert_eq!(msg.body.as_ref(), b"v=0\n");
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP 192.168.1.14;branch=z9hG4bKabc\r\n\
            From: <sip:1001@rivet.local>;tag=a\r\n\
            To: <sip:1002@rivet.local>;tag=b\r\n\
            Call-ID: xyz\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(msg.status_code(), Some(180));
        assert_eq!(msg.to_tag(), Some("b"));
    }

    #[test]
    fn test_missing_required_header_rejected() {
        let raw = "INVITE sip:1002@rivet.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.168.1.100;branch=z9hG4bKx\r\n\
            From: <sip:1001@rivet.local>;tag=a\r\n\
            To: <sip:1002@rivet.local>\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        assert!(parse_message(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_compact_headers_accepted() {
        let raw = "OPTIONS sip:rivet.local SIP/2.0\r\n\
            v: SIP/2.0/UDP 10.0.0.9;branch=z9hG4bKq\r\n\
            Max-Forwards: 70\r\n\
            f: <sip:ping@rivet.local>;tag=z\r\n\
            t: <sip:rivet.local>\r\n\
            i: ping-1\r\n\
            CSeq: 2 OPTIONS\r\n\
            l: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(msg.call_id(), Some("ping-1"));
        assert_eq!(msg.via_branch(), Some("z9hG4bKq"));
    }

    #[test]
    fn test_folded_header_unfolded() {
        let raw = "NOTIFY sip:1001@rivet.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.9;branch=z9hG4bKn\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:pbx@rivet.local>;tag=n\r\n\
            To: <sip:1001@rivet.local>\r\n\
            Call-ID: notify-1\r\n\
            CSeq: 7 NOTIFY\r\n\
            Subject: a folded\r\n\
            \tsubject value\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse_message(raw.as_bytes()).unwrap();
        assert_eq!(msg.header("Subject"), Some("a folded subject value"));
    }

    #[test]
    fn test_encode_parse_roundtrip_preserves_headers_and_body() {
        let msg = parse_message(INVITE.as_bytes()).unwrap();
        let reparsed = parse_message(&msg.encode()).unwrap();
        assert_eq!(reparsed.start, msg.start);
        assert_eq!(reparsed.body, msg.body);
        // Header set survives; ordering within duplicates is preserved.
        for header in &msg.headers {
            assert!(reparsed
                .headers_named(&header.name)
                .any(|v| v == header.value));
        }
    }

    #[test]
    fn test_stream_framer_splits_pipelined_messages() {
        let one = "OPTIONS sip:rivet.local SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.9;branch=z9hG4bK1\r\n\
            Max-Forwards: 70\r\n\
            From: <sip:a@rivet.local>;tag=1\r\n\
            To: <sip:rivet.local>\r\n\
            Call-ID: c1\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 3\r\n\r\nabc";

        let mut framer = StreamFramer::new();
        // Feed one-and-a-half messages, then the rest.
        let doubled = format!("{}{}", one, one);
        let (first_part, second_part) = doubled.split_at(one.len() + 20);
        framer.push(first_part.as_bytes());

        let msg = framer.next_message().unwrap().unwrap();
        assert_eq!(msg.call_id(), Some("c1"));
        assert!(framer.next_message().unwrap().is_none());

        framer.push(second_part.as_bytes());
        let msg2 = framer.next_message().unwrap().unwrap();
        assert_eq!(msg2.body.as_ref(), b"abc");
        assert!(framer.next_message().unwrap().is_none());
    }
}
