//! Registration registry
//!
//! Handles REGISTER end to end: digest challenge, MAC extraction from the
//! Contact parameters or User-Agent, expiry clamping, the live binding
//! table the call router reads on every INVITE, and the durable mirror.
//! On startup an integrity pass deletes stored rows missing any of
//! {MAC, IP, extension}; the inventory only ever lists what is dialable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::RegistrarConfig;
use crate::protocols::sip::message::{header_param, uri_user};
use crate::protocols::sip::{SipMessage, TransportKind};
use crate::signaling::auth::{AuthOutcome, DigestAuthenticator};
use crate::store::{ExtensionStore, Registration, RegistrationStore};
use crate::utils::normalize_mac;
use crate::Result;

static UA_MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b([0-9a-f]{2}[:\-\.]?){5}[0-9a-f]{2}\b").expect("static regex compiles")
});

pub struct Registrar {
    config: RegistrarConfig,
    auth: DigestAuthenticator,
    extensions: Arc<dyn ExtensionStore>,
    store: Arc<dyn RegistrationStore>,
    /// Live bindings by extension. Read on every outbound INVITE; written
    /// at registration rate.
    bindings: DashMap<String, Vec<Registration>>,
}

impl Registrar {
    pub fn new(
        config: RegistrarConfig,
        auth: DigestAuthenticator,
        extensions: Arc<dyn ExtensionStore>,
        store: Arc<dyn RegistrationStore>,
    ) -> Self {
        Self {
            config,
            auth,
            extensions,
            store,
            bindings: DashMap::new(),
        }
    }

    /// Startup pass: purge incomplete rows from the durable store, then
    /// warm the live table from what survived.
    pub async fn startup(&self) -> Result<u64> {
        let removed = self.store.purge_incomplete().await?;
        let now = Utc::now();
        let mut loaded = 0usize;
        for registration in self.store.list_all().await? {
            if registration.is_expired(now) {
                continue;
            }
            self.bindings
                .entry(registration.extension.clone())
                .or_default()
                .push(registration);
            loaded += 1;
        }
        info!(
            "Registrar warmed with {} bindings ({} incomplete rows purged)",
            loaded, removed
        );
        Ok(removed)
    }

    /// Process a REGISTER request and build the response to send.
    pub async fn handle_register(
        &self,
        request: &SipMessage,
        source: SocketAddr,
        transport: TransportKind,
    ) -> SipMessage {
        let Some(extension_id) = request
            .header("To")
            .map(crate::protocols::sip::message::uri_from_name_addr)
            .and_then(uri_user)
            .map(str::to_string)
        else {
            return SipMessage::response_for(request, 400, "Bad Request");
        };

        let extension = match self.extensions.lookup(&extension_id).await {
            Ok(Some(extension)) => extension,
            Ok(None) => {
                debug!("REGISTER for unknown extension {}", extension_id);
                return SipMessage::response_for(request, 404, "Not Found");
            }
            Err(e) => {
                warn!("Extension lookup failed: {}", e);
                return SipMessage::response_for(request, 500, "Server Internal Error");
            }
        };

        let password = extension.sip_password.clone();
        match self
            .auth
            .verify(request, source.ip(), |user| {
                (user == extension_id).then_some(password)
            }) {
            AuthOutcome::Authorized(_) => {}
            AuthOutcome::Challenge | AuthOutcome::Rejected => {
                let mut response = SipMessage::response_for(request, 401, "Unauthorized");
                response.add_header("WWW-Authenticate", self.auth.challenge_header(false));
                return response;
            }
            AuthOutcome::Stale => {
                let mut response = SipMessage::response_for(request, 401, "Unauthorized");
                response.add_header("WWW-Authenticate", self.auth.challenge_header(true));
                return response;
            }
            AuthOutcome::Blocked => {
                return SipMessage::response_for(request, 403, "Forbidden");
            }
        }

        let Some(contact) = request.header("Contact").map(str::to_string) else {
            // REGISTER without Contact is a query for current bindings.
            return self.binding_query_response(request, &extension_id);
        };

        let requested_expires = header_param(&contact, "expires")
            .and_then(|v| v.parse().ok())
            .or_else(|| request.expires())
            .unwrap_or(self.config.max_expires);

        let contact_uri = crate::protocols::sip::message::uri_from_name_addr(&contact).to_string();

        if requested_expires == 0 {
            self.remove_binding(&extension_id, &contact_uri).await;
            info!("Unregistered {} at {}", extension_id, contact_uri);
            let mut response = SipMessage::response_for(request, 200, "OK");
            response.add_header("Expires", "0");
            return response;
        }

        let granted = requested_expires
            .clamp(self.config.min_expires, self.config.max_expires);

        let user_agent = request.header("User-Agent").map(str::to_string);
        let mac = extract_mac(&contact, user_agent.as_deref());
        let now = Utc::now();
        let registration = Registration {
            extension: extension_id.clone(),
            contact_uri: contact_uri.clone(),
            contact_host: source.ip().to_string(),
            contact_port: source.port(),
            transport: transport.to_string().to_lowercase(),
            mac,
            user_agent,
            first_registered: now,
            last_registered: now,
            expires_at: now + chrono::Duration::seconds(granted as i64),
        };

        self.upsert_binding(registration).await;
        info!(
            "Registered {} at {} (expires {}s)",
            extension_id, contact_uri, granted
        );

        let mut response = SipMessage::response_for(request, 200, "OK");
        response.add_header("Contact", format!("{};expires={}", contact, granted));
        response.add_header("Expires", granted.to_string());
        response
    }

    fn binding_query_response(&self, request: &SipMessage, extension_id: &str) -> SipMessage {
        let mut response = SipMessage::response_for(request, 200, "OK");
        if let Some(bindings) = self.bindings.get(extension_id) {
            let now = Utc::now();
            for binding in bindings.iter().filter(|b| !b.is_expired(now)) {
                let remaining = (binding.expires_at - now).num_seconds().max(0);
                response.add_header(
                    "Contact",
                    format!("<{}>;expires={}", binding.contact_uri, remaining),
                );
            }
        }
        response
    }

    async fn upsert_binding(&self, registration: Registration) {
        {
            let mut bindings = self
                .bindings
                .entry(registration.extension.clone())
                .or_default();
            match bindings
                .iter_mut()
                .find(|b| b.contact_uri == registration.contact_uri)
            {
                Some(existing) => {
                    let first = existing.first_registered;
                    let known_mac = existing.mac.clone();
                    *existing = registration.clone();
                    existing.first_registered = first;
                    if existing.mac.is_none() {
                        existing.mac = known_mac;
                    }
                }
                None => bindings.push(registration.clone()),
            }
        }

        if let Err(e) = self.store.upsert(registration).await {
            warn!("Failed to mirror registration to store: {}", e);
        }
    }

    async fn remove_binding(&self, extension: &str, contact_uri: &str) {
        if let Some(mut bindings) = self.bindings.get_mut(extension) {
            bindings.retain(|b| b.contact_uri != contact_uri);
        }
        self.bindings.remove_if(extension, |_, v| v.is_empty());

        if let Err(e) = self.store.remove(extension, contact_uri).await {
            warn!("Failed to remove registration from store: {}", e);
        }
    }

    /// Freshest live binding for an extension. Expired entries found on
    /// the way are removed lazily.
    pub fn lookup(&self, extension: &str) -> Option<Registration> {
        let now = Utc::now();
        let mut bindings = self.bindings.get_mut(extension)?;
        bindings.retain(|b| !b.is_expired(now));
        bindings
            .iter()
            .max_by_key(|b| b.last_registered)
            .cloned()
    }

    /// Network target for an extension's freshest binding.
    pub fn contact_addr(&self, extension: &str) -> Option<(SocketAddr, TransportKind, Registration)> {
        let registration = self.lookup(extension)?;
        let ip = registration.contact_host.parse().ok()?;
        let transport = match registration.transport.as_str() {
            "tcp" => TransportKind::Tcp,
            _ => TransportKind::Udp,
        };
        Some((
            SocketAddr::new(ip, registration.contact_port),
            transport,
            registration,
        ))
    }

    pub fn all_active(&self) -> Vec<Registration> {
        let now = Utc::now();
        self.bindings
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|b| !b.is_expired(now))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Periodic sweep of expired bindings, mirrored to the store.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = Vec::new();
        for mut entry in self.bindings.iter_mut() {
            entry.value_mut().retain(|b| {
                if b.is_expired(now) {
                    removed.push((b.extension.clone(), b.contact_uri.clone()));
                    false
                } else {
                    true
                }
            });
        }
        let count = removed.len();
        for (extension, contact_uri) in removed {
            debug!("Expired registration {} at {}", extension, contact_uri);
            if let Err(e) = self.store.remove(&extension, &contact_uri).await {
                warn!("Failed to remove expired registration: {}", e);
            }
        }
        count
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let registrar = Arc::clone(self);
        let period = Duration::from_secs(self.config.expiry_sweep_interval.max(1) as u64);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                let swept = registrar.sweep_expired().await;
                if swept > 0 {
                    info!("Swept {} expired registrations", swept);
                }
            }
        });
    }
}

/// MAC discovery order: `+sip.instance` URN suffix, then a `mac=` contact
/// parameter, then a MAC-shaped token in the User-Agent. Normalized to
/// lowercase hex, no separators.
pub fn extract_mac(contact: &str, user_agent: Option<&str>) -> Option<String> {
    if let Some(instance) = header_param(contact, "+sip.instance") {
        // "<urn:uuid:00000000-0000-0000-0000-001565123456>"
        let trimmed = instance.trim_matches(|c| c == '<' || c == '>' || c == '"');
        if let Some(tail) = trimmed.rsplit(['-', ':']).next() {
            if let Some(mac) = normalize_mac(tail) {
                return Some(mac);
            }
        }
    }

    if let Some(mac_param) = header_param(contact, "mac") {
        if let Some(mac) = normalize_mac(mac_param) {
            return Some(mac);
        }
    }

    if let Some(ua) = user_agent {
        if let Some(found) = UA_MAC_RE.find(ua) {
            if let Some(mac) = normalize_mac(found.as_str()) {
                return Some(mac);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PbxConfig;
    use crate::protocols::sip::SipMethod;
    use crate::signaling::auth::compute_digest;
    use crate::store::{
        Capability, Extension, InMemoryExtensionStore, InMemoryRegistrationStore,
    };

    fn extension(id: &str) -> Extension {
        Extension {
            id: id.to_string(),
            display_name: format!("Extension {}", id),
            sip_password: "secret".to_string(),
            credential_hash: String::new(),
            capabilities: vec![Capability::ExternalCall],
            voicemail_pin_hash: None,
            email: None,
        }
    }

    fn registrar() -> (Arc<Registrar>, Arc<InMemoryRegistrationStore>) {
        let config = PbxConfig::default_config().registrar;
        let auth = DigestAuthenticator::new(
            "rivet.local".to_string(),
            b"0123456789abcdef0123456789abcdef".to_vec(),
            &config,
        );
        let extensions = Arc::new(InMemoryExtensionStore::new());
        extensions.insert(extension("1001"));
        let store = Arc::new(InMemoryRegistrationStore::new());
        (
            Arc::new(Registrar::new(config, auth, extensions, store.clone())),
            store,
        )
    }

    fn register_request(contact: &str, expires: Option<u32>, auth_header: Option<String>) -> SipMessage {
        let mut msg = SipMessage::request(SipMethod::Register, "sip:rivet.local");
        msg.add_header("Via", "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKreg");
        msg.add_header("Max-Forwards", "70");
        msg.add_header("From", "<sip:1001@rivet.local>;tag=reg");
        msg.add_header("To", "<sip:1001@rivet.local>");
        msg.add_header("Call-ID", "reg-call");
        msg.add_header("CSeq", "1 REGISTER");
        msg.add_header("Contact", contact);
        msg.add_header("User-Agent", "Zultys ZIP37G 1.04");
        if let Some(expires) = expires {
            msg.add_header("Expires", expires.to_string());
        }
        if let Some(auth) = auth_header {
            msg.add_header("Authorization", auth);
        }
        msg
    }

    fn source() -> SocketAddr {
        "192.168.1.100:5060".parse().unwrap()
    }

    async fn authorized_register(
        registrar: &Registrar,
        contact: &str,
        expires: Option<u32>,
    ) -> SipMessage {
        // First pass earns the challenge, second passes it.
        let challenge = registrar
            .handle_register(&register_request(contact, expires, None), source(), TransportKind::Udp)
            .await;
        assert_eq!(challenge.status_code(), Some(401));
        let www = challenge.header("WWW-Authenticate").unwrap();
        let params = crate::signaling::auth::parse_digest_params(www).unwrap();
        let nonce = params.get("nonce").unwrap();

        let response = compute_digest(
            "1001",
            "rivet.local",
            "secret",
            "REGISTER",
            "sip:rivet.local",
            nonce,
            None,
            None,
            None,
        );
        let auth_header = format!(
            "Digest username=\"1001\", realm=\"rivet.local\", nonce=\"{}\", uri=\"sip:rivet.local\", response=\"{}\"",
            nonce, response
        );
        registrar
            .handle_register(
                &register_request(contact, expires, Some(auth_header)),
                source(),
                TransportKind::Udp,
            )
            .await
    }

    #[tokio::test]
    async fn test_register_challenge_then_success() {
        let (registrar, store) = registrar();
        let ok = authorized_register(&registrar, "<sip:1001@192.168.1.100:5060>", Some(3600)).await;
        assert_eq!(ok.status_code(), Some(200));

        let binding = registrar.lookup("1001").unwrap();
        assert_eq!(binding.contact_host, "192.168.1.100");
        assert_eq!(binding.contact_port, 5060);

        // Mirrored durably.
        let rows = store.list_all().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_register_unknown_extension_404() {
        let (registrar, _) = registrar();
        let mut msg = register_request("<sip:9999@192.168.1.100>", Some(3600), None);
        msg.set_header("To", "<sip:9999@rivet.local>");
        let response = registrar
            .handle_register(&msg, source(), TransportKind::Udp)
            .await;
        assert_eq!(response.status_code(), Some(404));
    }

    #[tokio::test]
    async fn test_expires_zero_unregisters() {
        let (registrar, store) = registrar();
        authorized_register(&registrar, "<sip:1001@192.168.1.100:5060>", Some(3600)).await;
        assert!(registrar.lookup("1001").is_some());

        let bye = authorized_register(&registrar, "<sip:1001@192.168.1.100:5060>", Some(0)).await;
        assert_eq!(bye.status_code(), Some(200));
        assert_eq!(bye.header("Expires"), Some("0"));
        assert!(registrar.lookup("1001").is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_clamped_to_server_max() {
        let (registrar, _) = registrar();
        let ok = authorized_register(&registrar, "<sip:1001@192.168.1.100:5060>", Some(86400)).await;
        assert_eq!(ok.header("Expires"), Some("3600"));
    }

    #[tokio::test]
    async fn test_startup_purges_and_warms() {
        let (registrar, store) = registrar();
        let now = Utc::now();
        let complete = Registration {
            extension: "1001".to_string(),
            contact_uri: "sip:1001@192.168.1.100:5060".to_string(),
            contact_host: "192.168.1.100".to_string(),
            contact_port: 5060,
            transport: "udp".to_string(),
            mac: Some("001565123456".to_string()),
            user_agent: None,
            first_registered: now,
            last_registered: now,
            expires_at: now + chrono::Duration::seconds(600),
        };
        let mut incomplete = complete.clone();
        incomplete.extension = "1002".to_string();
        incomplete.contact_uri = "sip:1002@192.168.1.101:5060".to_string();
        incomplete.mac = None;

        store.seed(complete);
        store.seed(incomplete);

        let removed = registrar.startup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(registrar.lookup("1001").is_some());
        assert!(registrar.lookup("1002").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let (registrar, store) = registrar();
        authorized_register(&registrar, "<sip:1001@192.168.1.100:5060>", Some(3600)).await;

        // Force the binding into the past.
        {
            let mut bindings = registrar.bindings.get_mut("1001").unwrap();
            bindings[0].expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
        let swept = registrar.sweep_expired().await;
        assert_eq!(swept, 1);
        assert!(registrar.lookup("1001").is_none());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_mac_from_sip_instance() {
        let contact = "<sip:1001@192.168.1.100>;+sip.instance=\"<urn:uuid:00000000-0000-0000-0000-001565123456>\"";
        assert_eq!(extract_mac(contact, None), Some("001565123456".to_string()));
    }

    #[test]
    fn test_mac_from_contact_param() {
        let contact = "<sip:1001@192.168.1.100>;mac=00-15-65-AB-CD-EF";
        assert_eq!(extract_mac(contact, None), Some("001565abcdef".to_string()));
    }

    #[test]
    fn test_mac_from_user_agent_fallback() {
        let contact = "<sip:1001@192.168.1.100>";
        assert_eq!(
            extract_mac(contact, Some("Zultys ZIP37G 00:15:65:12:34:56 fw1.04")),
            Some("001565123456".to_string())
        );
        assert_eq!(extract_mac(contact, Some("Generic Phone")), None);
        assert_eq!(extract_mac(contact, None), None);
    }
}
