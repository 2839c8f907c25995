//! SDP session descriptions for SIP offer/answer
//!
//! Only the subset a media relay needs: connection addresses, audio media
//! lines, payload type lists, and rtpmap attributes. Everything else is
//! carried opaquely through parse/encode.

use std::net::{IpAddr, SocketAddr};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub origin: String,
    pub session_name: String,
    pub connection: Option<IpAddr>,
    pub media: Vec<MediaDescription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    pub kind: String,
    pub port: u16,
    pub protocol: String,
    pub payload_types: Vec<u8>,
    pub connection: Option<IpAddr>,
    pub attributes: Vec<(String, Option<String>)>,
}

impl MediaDescription {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// Canonical rtpmap entries for the static payload types phones offer.
fn rtpmap_for(payload_type: u8) -> Option<&'static str> {
    match payload_type {
        0 => Some("PCMU/8000"),
        2 => Some("G726-32/8000"),
        3 => Some("GSM/8000"),
        8 => Some("PCMA/8000"),
        9 => Some("G722/8000"),
        18 => Some("G729/8000"),
        _ => None,
    }
}

impl SessionDescription {
    pub fn parse(text: &str) -> Result<Self> {
        let mut connection = None;
        let mut origin = String::new();
        let mut session_name = String::from("-");
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw in text.lines() {
            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| Error::sdp(format!("Malformed SDP line: {}", line)))?;

            match kind {
                "o" => origin = value.to_string(),
                "s" => session_name = value.to_string(),
                "c" => {
                    let addr = parse_connection(value)?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(addr),
                        None => connection = Some(addr),
                    }
                }
                "m" => {
                    media.push(parse_media(value)?);
                }
                "a" => {
                    if let Some(m) = media.last_mut() {
                        let (name, attr_value) = match value.split_once(':') {
                            Some((n, v)) => (n.to_string(), Some(v.to_string())),
                            None => (value.to_string(), None),
                        };
                        m.attributes.push((name, attr_value));
                    }
                }
                // v=, t=, b=, and friends do not affect relaying.
                _ => {}
            }
        }

        if media.is_empty() {
            return Err(Error::sdp("SDP has no media description"));
        }

        Ok(Self {
            origin,
            session_name,
            connection,
            media,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(256);
        out.push_str("v=0\r\n");
        out.push_str(&format!("o={}\r\n", self.origin));
        out.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(addr) = self.connection {
            out.push_str(&format!("c={}\r\n", encode_connection(addr)));
        }
        out.push_str("t=0 0\r\n");
        for m in &self.media {
            let payloads: Vec<String> = m.payload_types.iter().map(|pt| pt.to_string()).collect();
            out.push_str(&format!(
                "m={} {} {} {}\r\n",
                m.kind,
                m.port,
                m.protocol,
                payloads.join(" ")
            ));
            if let Some(addr) = m.connection {
                out.push_str(&format!("c={}\r\n", encode_connection(addr)));
            }
            for (name, value) in &m.attributes {
                match value {
                    Some(value) => out.push_str(&format!("a={}:{}\r\n", name, value)),
                    None => out.push_str(&format!("a={}\r\n", name)),
                }
            }
        }
        out
    }

    /// Build a standard audio offer/answer advertising the PBX relay
    /// endpoint and the negotiated payload set.
    pub fn audio(local: SocketAddr, payload_types: &[u8], dtmf_payload_type: u8) -> Self {
        let mut attributes: Vec<(String, Option<String>)> = Vec::new();
        for &pt in payload_types {
            if let Some(map) = rtpmap_for(pt) {
                attributes.push(("rtpmap".to_string(), Some(format!("{} {}", pt, map))));
            }
        }
        if payload_types.contains(&dtmf_payload_type) {
            attributes.push((
                "rtpmap".to_string(),
                Some(format!("{} telephone-event/8000", dtmf_payload_type)),
            ));
            attributes.push((
                "fmtp".to_string(),
                Some(format!("{} 0-16", dtmf_payload_type)),
            ));
        }
        attributes.push(("sendrecv".to_string(), None));

        Self {
            origin: format!("rivet {} {} IN IP4 {}", rand::random::<u32>(), 1, local.ip()),
            session_name: "rivet".to_string(),
            connection: Some(local.ip()),
            media: vec![MediaDescription {
                kind: "audio".to_string(),
                port: local.port(),
                protocol: "RTP/AVP".to_string(),
                payload_types: payload_types.to_vec(),
                connection: None,
                attributes,
            }],
        }
    }

    /// First audio media line.
    pub fn audio_media(&self) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.kind == "audio")
    }

    /// The address and port the peer expects RTP on. The media-level
    /// connection overrides the session-level one.
    pub fn audio_endpoint(&self) -> Option<SocketAddr> {
        let media = self.audio_media()?;
        let ip = media.connection.or(self.connection)?;
        Some(SocketAddr::new(ip, media.port))
    }

    pub fn audio_payload_types(&self) -> Vec<u8> {
        self.audio_media()
            .map(|m| m.payload_types.clone())
            .unwrap_or_default()
    }
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    // c=IN IP4 192.168.1.100
    let mut parts = value.split_whitespace();
    let net_type = parts.next().unwrap_or_default();
    let addr_type = parts.next().unwrap_or_default();
    let address = parts
        .next()
        .ok_or_else(|| Error::sdp(format!("Connection line missing address: {}", value)))?;
    if net_type != "IN" || !matches!(addr_type, "IP4" | "IP6") {
        return Err(Error::sdp(format!("Unsupported connection line: {}", value)));
    }
    address
        .parse()
        .map_err(|_| Error::sdp(format!("Invalid connection address: {}", address)))
}

fn encode_connection(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => format!("IN IP4 {}", v4),
        IpAddr::V6(v6) => format!("IN IP6 {}", v6),
    }
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    // m=audio 10000 RTP/AVP 0 8 101
    let mut parts = value.split_whitespace();
    let kind = parts
        .next()
        .ok_or_else(|| Error::sdp("Media line missing type"))?
        .to_string();
    let port = parts
        .next()
        .and_then(|p| p.split('/').next())
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::sdp(format!("Media line has invalid port: {}", value)))?;
    let protocol = parts
        .next()
        .ok_or_else(|| Error::sdp("Media line missing protocol"))?
        .to_string();
    let payload_types = parts.filter_map(|pt| pt.parse().ok()).collect();

    Ok(MediaDescription {
        kind,
        port,
        protocol,
        payload_types,
        connection: None,
        attributes: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1815849 1815849 IN IP4 192.168.1.100\r\n\
        s=call\r\n\
        c=IN IP4 192.168.1.100\r\n\
        t=0 0\r\n\
        m=audio 10000 RTP/AVP 0 8 101\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:101 telephone-event/8000\r\n\
        a=fmtp:101 0-16\r\n\
        a=sendrecv\r\n";

    #[test]
    fn test_parse_offer() {
        let sdp = SessionDescription::parse(OFFER).unwrap();
        assert_eq!(
            sdp.audio_endpoint(),
            Some("192.168.1.100:10000".parse().unwrap())
        );
        assert_eq!(sdp.audio_payload_types(), vec![0, 8, 101]);
        assert_eq!(
            sdp.audio_media().unwrap().attribute("fmtp"),
            Some("101 0-16")
        );
    }

    #[test]
    fn test_media_level_connection_overrides_session() {
        let text = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\n\
            c=IN IP4 10.0.0.1\r\n\
            m=audio 12000 RTP/AVP 8\r\n\
            c=IN IP4 10.0.0.99\r\n";
        let sdp = SessionDescription::parse(text).unwrap();
        assert_eq!(sdp.audio_endpoint(), Some("10.0.0.99:12000".parse().unwrap()));
    }

    #[test]
    fn test_parse_rejects_no_media() {
        assert!(SessionDescription::parse("v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\n").is_err());
    }

    #[test]
    fn test_audio_builder_roundtrip() {
        let sdp = SessionDescription::audio("192.168.1.14:10000".parse().unwrap(), &[0, 8, 101], 101);
        let parsed = SessionDescription::parse(&sdp.encode()).unwrap();
        assert_eq!(
            parsed.audio_endpoint(),
            Some("192.168.1.14:10000".parse().unwrap())
        );
        assert_eq!(parsed.audio_payload_types(), vec![0, 8, 101]);
        let rtpmaps: Vec<&str> = parsed
            .audio_media()
            .unwrap()
            .attributes
            .iter()
            .filter(|(n, _)| n == "rtpmap")
            .filter_map(|(_, v)| v.as_deref())
            .collect();
        assert!(rtpmaps.contains(&"0 PCMU/8000"));
        assert!(rtpmaps.contains(&"101 telephone-event/8000"));
    }

    #[test]
    fn test_zero_port_media_parses() {
        let text = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\n\
            m=audio 0 RTP/AVP 0\r\n";
        let sdp = SessionDescription::parse(text).unwrap();
        assert_eq!(sdp.audio_media().unwrap().port, 0);
    }
}
