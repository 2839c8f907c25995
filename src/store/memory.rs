//! In-memory store implementations
//!
//! Used by the test suite and by deployments that run without a database
//! (registrations then simply do not survive a restart).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{
    Extension, ExtensionStore, ProvisionedDevice, ProvisionedDeviceStore, Registration,
    RegistrationStore,
};
use crate::Result;

#[derive(Default)]
pub struct InMemoryExtensionStore {
    extensions: DashMap<String, Extension>,
}

impl InMemoryExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, extension: Extension) {
        self.extensions.insert(extension.id.clone(), extension);
    }

    /// Swap the whole snapshot (configuration reload).
    pub fn replace_all(&self, extensions: impl Iterator<Item = Extension>) {
        self.extensions.clear();
        for extension in extensions {
            self.insert(extension);
        }
    }
}

#[async_trait]
impl ExtensionStore for InMemoryExtensionStore {
    async fn lookup(&self, id: &str) -> Result<Option<Extension>> {
        Ok(self.extensions.get(id).map(|e| e.clone()))
    }

    async fn all(&self) -> Result<Vec<Extension>> {
        Ok(self.extensions.iter().map(|e| e.clone()).collect())
    }
}

#[derive(Default)]
pub struct InMemoryRegistrationStore {
    // Keyed by (extension, contact URI): at most one active registration
    // per tuple.
    rows: DashMap<(String, String), Registration>,
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a raw row, complete or not. Exists so tests can model the
    /// inconsistent tables the startup pass has to clean.
    pub fn seed(&self, registration: Registration) {
        self.rows.insert(
            (registration.extension.clone(), registration.contact_uri.clone()),
            registration,
        );
    }
}

#[async_trait]
impl RegistrationStore for InMemoryRegistrationStore {
    async fn upsert(&self, registration: Registration) -> Result<()> {
        let key = (registration.extension.clone(), registration.contact_uri.clone());
        self.rows
            .entry(key)
            .and_modify(|existing| {
                let first = existing.first_registered;
                *existing = registration.clone();
                existing.first_registered = first;
            })
            .or_insert(registration);
        Ok(())
    }

    async fn remove(&self, extension: &str, contact_uri: &str) -> Result<()> {
        self.rows
            .remove(&(extension.to_string(), contact_uri.to_string()));
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Registration>> {
        Ok(self.rows.iter().map(|r| r.clone()).collect())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Registration>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.clone())
            .collect())
    }

    async fn purge_incomplete(&self) -> Result<u64> {
        let before = self.rows.len();
        self.rows.retain(|_, row| row.is_complete());
        Ok((before - self.rows.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryProvisionedDeviceStore {
    devices: DashMap<String, ProvisionedDevice>,
}

impl InMemoryProvisionedDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvisionedDeviceStore for InMemoryProvisionedDeviceStore {
    async fn get(&self, mac: &str) -> Result<Option<ProvisionedDevice>> {
        Ok(self.devices.get(mac).map(|d| d.clone()))
    }

    async fn upsert(&self, device: ProvisionedDevice) -> Result<()> {
        self.devices
            .entry(device.mac.clone())
            .and_modify(|existing| {
                let created = existing.created_at;
                *existing = device.clone();
                existing.created_at = created;
            })
            .or_insert(device);
        Ok(())
    }

    async fn delete(&self, mac: &str) -> Result<bool> {
        Ok(self.devices.remove(mac).is_some())
    }

    async fn all(&self) -> Result<Vec<ProvisionedDevice>> {
        Ok(self.devices.iter().map(|d| d.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(ext: &str, host: &str, mac: Option<&str>) -> Registration {
        let now = Utc::now();
        Registration {
            extension: ext.to_string(),
            contact_uri: format!("sip:{}@{}:5060", ext, host),
            contact_host: host.to_string(),
            contact_port: 5060,
            transport: "udp".to_string(),
            mac: mac.map(str::to_string),
            user_agent: Some("Test UA".to_string()),
            first_registered: now,
            last_registered: now,
            expires_at: now + chrono::Duration::seconds(3600),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_tuple() {
        let store = InMemoryRegistrationStore::new();
        let first = registration("1001", "192.168.1.100", Some("001565123456"));
        store.upsert(first.clone()).await.unwrap();

        let mut refresh = first.clone();
        refresh.last_registered = first.last_registered + chrono::Duration::seconds(60);
        store.upsert(refresh).await.unwrap();

        let rows = store.list_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        // first_registered survives the refresh.
        assert_eq!(rows[0].first_registered, first.first_registered);
        assert!(rows[0].last_registered > first.last_registered);
    }

    #[tokio::test]
    async fn test_registered_row_visible_until_expiry() {
        let store = InMemoryRegistrationStore::new();
        store
            .upsert(registration("1001", "192.168.1.100", Some("001565123456")))
            .await
            .unwrap();

        let rows = store.list_all().await.unwrap();
        assert!(rows.iter().any(|r| r.extension == "1001"));

        let expired = store
            .list_expired(Utc::now() + chrono::Duration::seconds(7200))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn test_startup_cleanup_removes_exactly_incomplete_rows() {
        let store = InMemoryRegistrationStore::new();
        // Complete row.
        store.seed(registration("1001", "192.168.1.100", Some("001565123456")));
        // Missing MAC.
        store.seed(registration("1002", "192.168.1.101", None));
        // Missing IP.
        store.seed(registration("1003", "", Some("001565aaaaaa")));
        // Missing extension.
        store.seed(registration("", "192.168.1.103", Some("001565bbbbbb")));
        // Second complete row.
        store.seed(registration("1005", "192.168.1.105", Some("001565cccccc")));

        let removed = store.purge_incomplete().await.unwrap();
        assert_eq!(removed, 3);

        let mut remaining: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.extension)
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["1001", "1005"]);
    }

    #[tokio::test]
    async fn test_device_upsert_keeps_one_row() {
        let store = InMemoryProvisionedDeviceStore::new();
        let now = Utc::now();
        let device = ProvisionedDevice {
            mac: "001565123456".to_string(),
            extension: "1001".to_string(),
            vendor: "zultys".to_string(),
            model: "zip37g".to_string(),
            config_url: "http://pbx/provision/001565123456.cfg".to_string(),
            created_at: now,
            last_provisioned: None,
        };
        store.upsert(device.clone()).await.unwrap();

        let mut again = device.clone();
        again.last_provisioned = Some(now + chrono::Duration::seconds(5));
        store.upsert(again).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].last_provisioned.is_some());
        assert_eq!(all[0].created_at, now);
    }
}
