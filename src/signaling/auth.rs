//! Digest authentication (RFC 3261 §22)
//!
//! Nonces are self-validating: an HMAC over the mint timestamp keyed by
//! `SIP_SECRET_KEY`, so no nonce table is kept. Expired nonces trigger a
//! stale=true re-challenge rather than a failure. Repeated bad credentials
//! from one IP lead to a temporary block.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::RegistrarConfig;
use crate::protocols::sip::SipMessage;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of checking an Authorization header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials verified for this username.
    Authorized(String),
    /// No credentials presented; send a fresh challenge.
    Challenge,
    /// Nonce expired; re-challenge with stale=true.
    Stale,
    /// Wrong credentials.
    Rejected,
    /// The source IP is in the penalty box.
    Blocked,
}

#[derive(Debug)]
struct FailureRecord {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

pub struct DigestAuthenticator {
    realm: String,
    secret: Vec<u8>,
    nonce_lifetime: Duration,
    failure_limit: u32,
    block_duration: Duration,
    failures: DashMap<IpAddr, FailureRecord>,
}

impl DigestAuthenticator {
    pub fn new(realm: String, secret: Vec<u8>, config: &RegistrarConfig) -> Self {
        Self {
            realm,
            secret,
            nonce_lifetime: Duration::from_secs(config.nonce_lifetime as u64),
            failure_limit: config.auth_failure_limit,
            block_duration: Duration::from_secs(config.auth_block_duration as u64),
            failures: DashMap::new(),
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Mint a nonce bound to the current time.
    pub fn generate_nonce(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        format!("{:x}.{}", now, self.nonce_signature(now))
    }

    fn nonce_signature(&self, timestamp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(&timestamp.to_be_bytes());
        hex::encode(&mac.finalize().into_bytes()[..16])
    }

    /// A nonce is valid when its signature checks out and it is younger
    /// than the configured lifetime.
    fn nonce_age(&self, nonce: &str) -> Option<Duration> {
        let (ts_hex, signature) = nonce.split_once('.')?;
        let timestamp = u64::from_str_radix(ts_hex, 16).ok()?;
        let expected = self.nonce_signature(timestamp);
        if expected.as_bytes().ct_eq(signature.as_bytes()).into() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Some(Duration::from_secs(now.saturating_sub(timestamp)))
        } else {
            None
        }
    }

    /// WWW-Authenticate header value for a 401.
    pub fn challenge_header(&self, stale: bool) -> String {
        let stale_param = if stale { ", stale=true" } else { "" };
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"{}",
            self.realm,
            self.generate_nonce(),
            stale_param
        )
    }

    /// Verify the Authorization header of `request` against the account
    /// password provided by `lookup_password`.
    pub fn verify<F>(&self, request: &SipMessage, source: IpAddr, lookup_password: F) -> AuthOutcome
    where
        F: FnOnce(&str) -> Option<String>,
    {
        if self.is_blocked(source) {
            return AuthOutcome::Blocked;
        }

        let Some(header) = request.header("Authorization") else {
            return AuthOutcome::Challenge;
        };
        let Some(params) = parse_digest_params(header) else {
            debug!("Malformed Authorization header from {}", source);
            return self.record_failure(source);
        };

        let (Some(username), Some(nonce), Some(uri), Some(response)) = (
            params.get("username"),
            params.get("nonce"),
            params.get("uri"),
            params.get("response"),
        ) else {
            return self.record_failure(source);
        };

        match self.nonce_age(nonce) {
            Some(age) if age <= self.nonce_lifetime => {}
            Some(_) => return AuthOutcome::Stale,
            None => return self.record_failure(source),
        }

        let Some(password) = lookup_password(username) else {
            // Unknown users burn a failure too; do not leak which part was
            // wrong.
            return self.record_failure(source);
        };

        let method = request
            .method()
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let expected = compute_digest(
            username,
            &self.realm,
            &password,
            &method,
            uri,
            nonce,
            params.get("qop").map(String::as_str),
            params.get("nc").map(String::as_str),
            params.get("cnonce").map(String::as_str),
        );

        if expected.as_bytes().ct_eq(response.as_bytes()).into() {
            self.failures.remove(&source);
            AuthOutcome::Authorized(username.clone())
        } else {
            self.record_failure(source)
        }
    }

    fn is_blocked(&self, source: IpAddr) -> bool {
        if let Some(record) = self.failures.get(&source) {
            if let Some(until) = record.blocked_until {
                if Instant::now() < until {
                    return true;
                }
            }
        }
        false
    }

    fn record_failure(&self, source: IpAddr) -> AuthOutcome {
        let now = Instant::now();
        let mut record = self.failures.entry(source).or_insert(FailureRecord {
            count: 0,
            window_start: now,
            blocked_until: None,
        });

        // Stale windows restart the count.
        if now.duration_since(record.window_start) > self.block_duration {
            record.count = 0;
            record.window_start = now;
            record.blocked_until = None;
        }

        record.count += 1;
        if record.count >= self.failure_limit {
            warn!(
                "Blocking {} after {} authentication failures",
                source, record.count
            );
            record.blocked_until = Some(now + self.block_duration);
            AuthOutcome::Blocked
        } else {
            AuthOutcome::Rejected
        }
    }
}

/// Parse `Digest key="value", key=value, ...` into a map.
pub fn parse_digest_params(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Digest")?.trim();
    let mut params = HashMap::new();

    for part in split_quoted_commas(rest) {
        let (key, value) = part.split_once('=')?;
        params.insert(
            key.trim().to_ascii_lowercase(),
            value.trim().trim_matches('"').to_string(),
        );
    }
    Some(params)
}

fn split_quoted_commas(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// RFC 2617 digest computation, with and without qop=auth.
#[allow(clippy::too_many_arguments)]
pub fn compute_digest(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match (qop, nc, cnonce) {
        (Some("auth"), Some(nc), Some(cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, nc, cnonce, ha2
        )),
        _ => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;
    use crate::protocols::sip::SipMethod;

    fn authenticator() -> DigestAuthenticator {
        let config = PbxConfig::default_config().registrar;
        DigestAuthenticator::new(
            "rivet.local".to_string(),
            b"0123456789abcdef0123456789abcdef".to_vec(),
            &config,
        )
    }

    fn register_with_auth(auth_value: Option<&str>) -> SipMessage {
        let mut msg = SipMessage::request(SipMethod::Register, "sip:rivet.local");
        msg.add_header("Via", "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKa1");
        msg.add_header("Max-Forwards", "70");
        msg.add_header("From", "<sip:1001@rivet.local>;tag=r");
        msg.add_header("To", "<sip:1001@rivet.local>");
        msg.add_header("Call-ID", "auth-test");
        msg.add_header("CSeq", "1 REGISTER");
        if let Some(value) = auth_value {
            msg.add_header("Authorization", value);
        }
        msg
    }

    fn source() -> IpAddr {
        "192.168.1.100".parse().unwrap()
    }

    #[test]
    fn test_no_credentials_challenges() {
        let auth = authenticator();
        let outcome = auth.verify(&register_with_auth(None), source(), |_| {
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Challenge);
    }

    #[test]
    fn test_valid_digest_accepted() {
        let auth = authenticator();
        let nonce = auth.generate_nonce();
        let response = compute_digest(
            "1001",
            "rivet.local",
            "secret",
            "REGISTER",
            "sip:rivet.local",
            &nonce,
            None,
            None,
            None,
        );
        let header = format!(
            "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"{}\", uri=\"sip:rivet.local\", response=\"{}\"",
            nonce, response
        );
        let outcome = auth.verify(&register_with_auth(Some(&header)), source(), |user| {
            assert_eq!(user, "1001");
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Authorized("1001".to_string()));
    }

    #[test]
    fn test_qop_auth_digest_accepted() {
        let auth = authenticator();
        let nonce = auth.generate_nonce();
        let response = compute_digest(
            "1001",
            "rivet.local",
            "secret",
            "REGISTER",
            "sip:rivet.local",
            &nonce,
            Some("auth"),
            Some("00000001"),
            Some("abcd"),
        );
        let header = format!(
            "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"{}\", uri=\"sip:rivet.local\", \
             response=\"{}\", qop=auth, nc=00000001, cnonce=\"abcd\"",
            nonce, response
        );
        let outcome = auth.verify(&register_with_auth(Some(&header)), source(), |_| {
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Authorized("1001".to_string()));
    }

    #[test]
    fn test_wrong_password_rejected() {
        let auth = authenticator();
        let nonce = auth.generate_nonce();
        let response = compute_digest(
            "1001",
            "rivet.local",
            "wrong",
            "REGISTER",
            "sip:rivet.local",
            &nonce,
            None,
            None,
            None,
        );
        let header = format!(
            "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"{}\", uri=\"sip:rivet.local\", response=\"{}\"",
            nonce, response
        );
        let outcome = auth.verify(&register_with_auth(Some(&header)), source(), |_| {
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Rejected);
    }

    #[test]
    fn test_forged_nonce_rejected() {
        let auth = authenticator();
        let header = "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"deadbeef.bogus\", \
                      uri=\"sip:rivet.local\", response=\"00000000000000000000000000000000\"";
        let outcome = auth.verify(&register_with_auth(Some(header)), source(), |_| {
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Rejected);
    }

    #[test]
    fn test_repeated_failures_block_ip() {
        let auth = authenticator();
        let header = "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"bad.bad\", \
                      uri=\"sip:rivet.local\", response=\"0\"";
        let attacker: IpAddr = "10.9.9.9".parse().unwrap();

        let mut last = AuthOutcome::Challenge;
        for _ in 0..5 {
            last = auth.verify(&register_with_auth(Some(header)), attacker, |_| {
                Some("secret".to_string())
            });
        }
        assert_eq!(last, AuthOutcome::Blocked);

        // Even valid-looking requests are refused while blocked.
        let outcome = auth.verify(&register_with_auth(None), attacker, |_| {
            Some("secret".to_string())
        });
        assert_eq!(outcome, AuthOutcome::Blocked);
    }

    #[test]
    fn test_challenge_header_shape() {
        let auth = authenticator();
        let header = auth.challenge_header(false);
        assert!(header.starts_with("Digest realm=\"rivet.local\""));
        assert!(header.contains("nonce=\""));
        assert!(!header.contains("stale"));
        assert!(auth.challenge_header(true).contains("stale=true"));
    }

    #[test]
    fn test_digest_param_parsing_with_quoted_commas() {
        let params = parse_digest_params(
            "Digest username=\"user,with,commas\", realm=\"r\", nonce=\"n\", uri=\"sip:x\", response=\"abc\"",
        )
        .unwrap();
        assert_eq!(params.get("username").unwrap(), "user,with,commas");
        assert_eq!(params.get("response").unwrap(), "abc");
    }
}
