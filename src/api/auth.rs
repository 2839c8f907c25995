//! Bearer tokens for the admin API
//!
//! HMAC-SHA256 over a JSON claims payload, keyed by `SESSION_SECRET_KEY`.
//! Verification is constant-time. Tokens expire after the configured TTL
//! (24 hours by default); admin endpoints additionally require the
//! `is_admin` claim.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub extension: String,
    pub is_admin: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenService {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: Vec<u8>, ttl_seconds: u32) -> Self {
        Self {
            secret,
            ttl: Duration::seconds(ttl_seconds as i64),
        }
    }

    pub fn issue(&self, extension: &str, is_admin: bool) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            extension: extension.to_string(),
            is_admin,
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()));
        Ok(format!("{}.{}", payload, signature))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| Error::auth("Malformed token"))?;

        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| Error::auth("Malformed token signature"))?;
        let expected = self.sign(payload.as_bytes());
        if !bool::from(expected.ct_eq(&presented)) {
            return Err(Error::auth("Invalid token signature"));
        }

        let claims: Claims = serde_json::from_slice(
            &URL_SAFE_NO_PAD
                .decode(payload)
                .map_err(|_| Error::auth("Malformed token payload"))?,
        )?;

        if claims.expires_at <= Utc::now() {
            return Err(Error::auth("Token expired"));
        }
        Ok(claims)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key size");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"0123456789abcdef0123456789abcdef".to_vec(), 86400)
    }

    #[test]
    fn test_issue_and_verify() {
        let service = service();
        let token = service.issue("1001", true).unwrap();
        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.extension, "1001");
        assert!(claims.is_admin);
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let service = service();
        let token = service.issue("1001", false).unwrap();
        let (payload, signature) = token.split_once('.').unwrap();

        // Re-encode the payload with is_admin flipped.
        let mut claims: Claims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        claims.is_admin = true;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let forged = format!("{}.{}", forged_payload, signature);

        assert!(service.verify(&forged).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = service().issue("1001", false).unwrap();
        let other = TokenService::new(b"ffffffffffffffffffffffffffffffff".to_vec(), 86400);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = TokenService::new(b"0123456789abcdef0123456789abcdef".to_vec(), 0);
        let token = service.issue("1001", false).unwrap();
        assert!(service.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let service = service();
        assert!(service.verify("not-a-token").is_err());
        assert!(service.verify("a.b").is_err());
    }
}
