//! Collaborator interfaces and persistence
//!
//! The core never talks to a database directly; it goes through these
//! traits. Production wires the Postgres implementations, tests wire the
//! in-memory ones.

pub mod memory;
pub mod postgres;

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

pub use memory::{InMemoryExtensionStore, InMemoryProvisionedDeviceStore, InMemoryRegistrationStore};
pub use postgres::{PgProvisionedDeviceStore, PgRegistrationStore};

/// Account capabilities an extension may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "external-call")]
    ExternalCall,
    #[serde(rename = "admin")]
    Admin,
    #[serde(rename = "record")]
    Record,
    #[serde(rename = "conference-host")]
    ConferenceHost,
}

/// An account record. Immutable from the core's perspective; reloaded from
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extension {
    pub id: String,
    pub display_name: String,
    /// SIP digest secret. Digest authentication needs the shared secret
    /// itself; the one-way hash below is for the admin surface.
    pub sip_password: String,
    /// PBKDF2-HMAC-SHA256 credential hash for admin/API login.
    pub credential_hash: String,
    pub capabilities: Vec<Capability>,
    pub voicemail_pin_hash: Option<String>,
    pub email: Option<String>,
}

impl Extension {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn is_admin(&self) -> bool {
        self.has_capability(Capability::Admin)
    }
}

/// A live binding of an extension to a network contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub extension: String,
    pub contact_uri: String,
    pub contact_host: String,
    pub contact_port: u16,
    pub transport: String,
    pub mac: Option<String>,
    pub user_agent: Option<String>,
    pub first_registered: DateTime<Utc>,
    pub last_registered: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Registration {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A row is dialable only when all of MAC, IP, and extension are
    /// present; anything else is inventory noise.
    pub fn is_complete(&self) -> bool {
        !self.extension.is_empty()
            && !self.contact_host.is_empty()
            && self.mac.as_deref().is_some_and(|m| !m.is_empty())
    }
}

/// A pre-declared MAC↔extension binding consumed over HTTP before the
/// phone ever registers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedDevice {
    /// Normalized: lowercase, no separators.
    pub mac: String,
    pub extension: String,
    pub vendor: String,
    pub model: String,
    pub config_url: String,
    pub created_at: DateTime<Utc>,
    pub last_provisioned: Option<DateTime<Utc>>,
}

/// A dispatchable location for emergency routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub trunk_uri: String,
    pub elin: String,
}

#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn lookup(&self, id: &str) -> Result<Option<Extension>>;
    async fn all(&self) -> Result<Vec<Extension>>;
}

#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn upsert(&self, registration: Registration) -> Result<()>;
    async fn remove(&self, extension: &str, contact_uri: &str) -> Result<()>;
    async fn list_all(&self) -> Result<Vec<Registration>>;
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Registration>>;
    /// Startup integrity pass: delete rows missing any of
    /// {MAC, IP, extension}. Returns how many were removed.
    async fn purge_incomplete(&self) -> Result<u64>;
}

#[async_trait]
pub trait ProvisionedDeviceStore: Send + Sync {
    async fn get(&self, mac: &str) -> Result<Option<ProvisionedDevice>>;
    async fn upsert(&self, device: ProvisionedDevice) -> Result<()>;
    async fn delete(&self, mac: &str) -> Result<bool>;
    async fn all(&self) -> Result<Vec<ProvisionedDevice>>;
}

#[async_trait]
pub trait EmergencyLocator: Send + Sync {
    /// Map a caller IP to its dispatchable location.
    async fn locate(&self, caller_ip: IpAddr) -> Option<Site>;
}

#[async_trait]
pub trait VoicemailRecorder: Send + Sync {
    /// Start a recording session; returns the SDP body of the media
    /// endpoint to bridge the caller to.
    async fn start(&self, extension: &str, caller_id: &str) -> Result<String>;
}

const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 32;
const HASH_LEN: usize = 32;

/// Hash a credential with PBKDF2-HMAC-SHA256 (600k iterations, 32-byte
/// salt). Encoded as `pbkdf2$<iterations>$<salt-hex>$<hash-hex>`.
pub fn hash_credential(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let mut hash = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
    format!(
        "pbkdf2${}${}${}",
        PBKDF2_ITERATIONS,
        hex::encode(salt),
        hex::encode(hash)
    )
}

/// Verify a credential against its encoded hash in constant time.
pub fn verify_credential(password: &str, encoded: &str) -> Result<bool> {
    let mut parts = encoded.split('$');
    let (Some("pbkdf2"), Some(iterations), Some(salt_hex), Some(hash_hex)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::store(format!("Unrecognized credential hash: {}", encoded)));
    };
    let iterations: u32 = iterations
        .parse()
        .map_err(|_| Error::store("Invalid iteration count in credential hash"))?;
    let salt = hex::decode(salt_hex).map_err(|_| Error::store("Invalid salt encoding"))?;
    let expected = hex::decode(hash_hex).map_err(|_| Error::store("Invalid hash encoding"))?;

    let mut hash = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut hash);
    Ok(hash.ct_eq(&expected).into())
}
