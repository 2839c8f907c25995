//! DTMF digit events from both signaling and media paths
//!
//! Two producers feed one per-call FIFO: the SIP INFO parser (works
//! regardless of codec) and the RFC 2833 telephone-event decoder on the
//! RTP path. Events are not deduplicated here; a consumer that cares can
//! debounce.

use tokio::sync::mpsc;
use tracing::warn;

use crate::{Error, Result};

/// Digits a phone can signal.
pub const VALID_DIGITS: &[char] = &[
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '*', '#', 'A', 'B', 'C', 'D',
];

/// Per-call queue bound. Excess digits are dropped with a warning; a
/// consumer that is 32 digits behind has already lost the interaction.
pub const QUEUE_BOUND: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSource {
    SipInfo,
    Rtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub digit: char,
    pub duration_ms: u32,
    pub source: DtmfSource,
}

/// Parse the body of a SIP INFO with Content-Type `application/dtmf` or
/// `application/dtmf-relay`. Returns the signaled digit.
pub fn parse_info_body(content_type: &str, body: &[u8]) -> Result<DtmfEvent> {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();
    if media_type != "application/dtmf" && media_type != "application/dtmf-relay" {
        return Err(Error::not_supported(format!(
            "Unsupported INFO content type: {}",
            content_type
        )));
    }

    let text = std::str::from_utf8(body).map_err(|_| Error::parse("INFO body is not UTF-8"))?;

    let mut digit = None;
    let mut duration_ms = 250u32;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            // Bare-digit bodies exist in the wild for application/dtmf.
            let trimmed = line.trim();
            if trimmed.len() == 1 {
                digit = validate_digit(trimmed.chars().next().unwrap());
            }
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "signal" => {
                let value = value.trim();
                if value.len() == 1 {
                    digit = validate_digit(value.chars().next().unwrap());
                }
            }
            "duration" => {
                if let Ok(parsed) = value.trim().parse() {
                    duration_ms = parsed;
                }
            }
            _ => {}
        }
    }

    let digit = digit.ok_or_else(|| Error::parse("INFO body carries no valid Signal digit"))?;
    Ok(DtmfEvent {
        digit,
        duration_ms,
        source: DtmfSource::SipInfo,
    })
}

fn validate_digit(c: char) -> Option<char> {
    let upper = c.to_ascii_uppercase();
    VALID_DIGITS.contains(&upper).then_some(upper)
}

/// RFC 2833 telephone-event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(Error::parse("telephone-event payload too short"));
        }
        Ok(Self {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3F,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn digit(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12 => Some('A'),
            13 => Some('B'),
            14 => Some('C'),
            15 => Some('D'),
            _ => None,
        }
    }
}

/// Edge-triggered decoder over the RFC 2833 packet stream. A digit is
/// reported once per key press even though the endpoint sends the event in
/// every packet until key release.
#[derive(Debug, Default)]
pub struct Rfc2833Decoder {
    active_event: Option<u8>,
}

impl Rfc2833Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one telephone-event payload; returns a digit on the leading
    /// edge only.
    pub fn feed(&mut self, payload: &[u8]) -> Option<DtmfEvent> {
        let event = TelephoneEvent::parse(payload).ok()?;

        if event.end {
            if self.active_event == Some(event.event) {
                self.active_event = None;
            }
            return None;
        }

        if self.active_event == Some(event.event) {
            return None;
        }
        self.active_event = Some(event.event);

        event.digit().map(|digit| DtmfEvent {
            digit,
            // Duration is in timestamp units (8 kHz clock).
            duration_ms: event.duration as u32 / 8,
            source: DtmfSource::Rtp,
        })
    }
}

/// Sending half of a per-call DTMF queue. Cloned into both producers.
#[derive(Debug, Clone)]
pub struct DtmfSender {
    tx: mpsc::Sender<DtmfEvent>,
}

impl DtmfSender {
    pub fn push(&self, event: DtmfEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            warn!("DTMF queue full, dropping digit {}", event.digit);
        }
    }
}

/// Create the bounded FIFO shared by the INFO parser and the in-band
/// decoder. The consumer side is a plain receiver so the feature FSM can
/// select on it.
pub fn dtmf_queue() -> (DtmfSender, mpsc::Receiver<DtmfEvent>) {
    let (tx, rx) = mpsc::channel(QUEUE_BOUND);
    (DtmfSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_relay_body() {
        let event = parse_info_body("application/dtmf-relay", b"Signal=5\r\nDuration=160\r\n").unwrap();
        assert_eq!(event.digit, '5');
        assert_eq!(event.duration_ms, 160);
        assert_eq!(event.source, DtmfSource::SipInfo);
    }

    #[test]
    fn test_parse_info_bare_digit() {
        let event = parse_info_body("application/dtmf", b"#").unwrap();
        assert_eq!(event.digit, '#');
    }

    #[test]
    fn test_parse_info_rejects_wrong_type() {
        assert!(parse_info_body("application/sdp", b"Signal=1").is_err());
    }

    #[test]
    fn test_parse_info_rejects_invalid_digit() {
        assert!(parse_info_body("application/dtmf-relay", b"Signal=Z").is_err());
    }

    #[test]
    fn test_telephone_event_parse() {
        // event=1, end bit set, volume 10, duration 1280
        let event = TelephoneEvent::parse(&[1, 0x8A, 0x05, 0x00]).unwrap();
        assert_eq!(event.event, 1);
        assert!(event.end);
        assert_eq!(event.volume, 10);
        assert_eq!(event.duration, 1280);
        assert_eq!(event.digit(), Some('1'));
    }

    #[test]
    fn test_rfc2833_edge_triggering() {
        let mut decoder = Rfc2833Decoder::new();

        // Three packets for the same press report once.
        assert_eq!(decoder.feed(&[5, 0x0A, 0x00, 0x50]).map(|e| e.digit), Some('5'));
        assert!(decoder.feed(&[5, 0x0A, 0x01, 0x40]).is_none());
        assert!(decoder.feed(&[5, 0x8A, 0x02, 0x80]).is_none());

        // Same digit pressed again after release is a new event.
        assert_eq!(decoder.feed(&[5, 0x0A, 0x00, 0x50]).map(|e| e.digit), Some('5'));

        // A different digit mid-press is a new leading edge.
        assert_eq!(decoder.feed(&[11, 0x0A, 0x00, 0x50]).map(|e| e.digit), Some('#'));
    }

    #[tokio::test]
    async fn test_queue_preserves_fifo_order_across_producers() {
        let (sender, mut rx) = dtmf_queue();
        let info_side = sender.clone();
        let rtp_side = sender;

        info_side.push(DtmfEvent { digit: '1', duration_ms: 100, source: DtmfSource::SipInfo });
        rtp_side.push(DtmfEvent { digit: '2', duration_ms: 100, source: DtmfSource::Rtp });
        info_side.push(DtmfEvent { digit: '1', duration_ms: 100, source: DtmfSource::SipInfo });

        assert_eq!(rx.recv().await.unwrap().digit, '1');
        assert_eq!(rx.recv().await.unwrap().digit, '2');
        // Duplicates are preserved, not suppressed.
        assert_eq!(rx.recv().await.unwrap().digit, '1');
    }

    #[tokio::test]
    async fn test_queue_drops_past_bound() {
        let (sender, mut rx) = dtmf_queue();
        for i in 0..QUEUE_BOUND + 8 {
            sender.push(DtmfEvent {
                digit: char::from_digit((i % 10) as u32, 10).unwrap(),
                duration_ms: 100,
                source: DtmfSource::SipInfo,
            });
        }

        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, QUEUE_BOUND);
    }
}
