//! Device provisioning: template rendering for phone config files
//!
//! Phones fetch `/provision/{mac}.cfg` over HTTP before they ever
//! register. The rendered body comes from a vendor template with
//! `{{PLACEHOLDER}}` substitution plus the vendor-specific MAC variable
//! (`$MA` on Cisco, `$mac` elsewhere). Config URLs are always regenerated
//! from the live configuration so an `api.port` change survives a restart.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::{ProvisioningConfig, VendorProfile};
use crate::store::{ExtensionStore, ProvisionedDevice, ProvisionedDeviceStore};
use crate::utils::normalize_mac;
use crate::{Error, Result};

/// Fallback template for vendors without a configured profile.
const GENERIC_TEMPLATE: &str = "\
# Auto-generated configuration for {{VENDOR}} {{MODEL}}
# Device: {{MAC_ADDRESS}}
sip.server={{SERVER_IP}}:{{SIP_PORT}}
sip.user={{EXTENSION}}
sip.password={{PASSWORD}}
sip.displayname={{DISPLAY_NAME}}
";

pub struct RenderedConfig {
    pub body: String,
    pub content_type: String,
}

pub struct ProvisioningService {
    config: ProvisioningConfig,
    devices: Arc<dyn ProvisionedDeviceStore>,
    extensions: Arc<dyn ExtensionStore>,
    server_ip: IpAddr,
    sip_port: u16,
    api_port: u16,
}

impl ProvisioningService {
    pub fn new(
        config: ProvisioningConfig,
        devices: Arc<dyn ProvisionedDeviceStore>,
        extensions: Arc<dyn ExtensionStore>,
        server_ip: IpAddr,
        sip_port: u16,
        api_port: u16,
    ) -> Self {
        Self {
            config,
            devices,
            extensions,
            server_ip,
            sip_port,
            api_port,
        }
    }

    /// The URL a phone should fetch its config from, derived from the
    /// current listener configuration rather than any stored value.
    pub fn config_url_for(&self, mac: &str) -> String {
        format!(
            "http://{}:{}/provision/{}.cfg",
            self.server_ip, self.api_port, mac
        )
    }

    fn vendor_profile(&self, vendor: &str) -> Option<&VendorProfile> {
        self.config
            .vendors
            .iter()
            .find(|v| v.vendor.eq_ignore_ascii_case(vendor))
    }

    /// Render the config body for a device, updating `last_provisioned`.
    pub async fn render(&self, raw_mac: &str) -> Result<RenderedConfig> {
        let mac = normalize_mac(raw_mac)
            .ok_or_else(|| Error::provisioning(format!("Invalid MAC address: {}", raw_mac)))?;

        let mut device = self
            .devices
            .get(&mac)
            .await?
            .ok_or_else(|| Error::provisioning(format!("No provisioned device for {}", mac)))?;

        let extension = self
            .extensions
            .lookup(&device.extension)
            .await?
            .ok_or_else(|| {
                Error::provisioning(format!(
                    "Device {} references unknown extension {}",
                    mac, device.extension
                ))
            })?;

        let profile = self.vendor_profile(&device.vendor);
        let template = profile.map(|p| p.template.as_str()).unwrap_or(GENERIC_TEMPLATE);
        let content_type = profile
            .map(|p| p.content_type.clone())
            .unwrap_or_else(|| "text/plain".to_string());
        // Cisco templates reference the MAC as $MA; everyone else as $mac.
        let mac_variable = profile.map(|p| p.mac_variable.as_str()).unwrap_or("$mac");

        let body = template
            .replace("{{SERVER_IP}}", &self.server_ip.to_string())
            .replace("{{SIP_PORT}}", &self.sip_port.to_string())
            .replace("{{EXTENSION}}", &extension.id)
            .replace("{{PASSWORD}}", &extension.sip_password)
            .replace("{{DISPLAY_NAME}}", &extension.display_name)
            .replace("{{MAC_ADDRESS}}", &mac)
            .replace("{{VENDOR}}", &device.vendor)
            .replace("{{MODEL}}", &device.model)
            .replace(mac_variable, &mac);

        device.last_provisioned = Some(Utc::now());
        device.config_url = self.config_url_for(&mac);
        self.devices.upsert(device).await?;
        debug!("Rendered provisioning config for {}", mac);

        Ok(RenderedConfig { body, content_type })
    }

    /// Declare (or redeclare) a device. The MAC is normalized and the
    /// config URL regenerated here, never taken from the caller.
    pub async fn declare_device(
        &self,
        raw_mac: &str,
        extension: &str,
        vendor: &str,
        model: &str,
    ) -> Result<ProvisionedDevice> {
        let mac = normalize_mac(raw_mac)
            .ok_or_else(|| Error::provisioning(format!("Invalid MAC address: {}", raw_mac)))?;

        if self.extensions.lookup(extension).await?.is_none() {
            return Err(Error::provisioning(format!(
                "Cannot provision {}: unknown extension {}",
                mac, extension
            )));
        }

        let existing = self.devices.get(&mac).await?;
        let device = ProvisionedDevice {
            mac: mac.clone(),
            extension: extension.to_string(),
            vendor: vendor.to_lowercase(),
            model: model.to_lowercase(),
            config_url: self.config_url_for(&mac),
            created_at: existing
                .as_ref()
                .map(|d| d.created_at)
                .unwrap_or_else(Utc::now),
            last_provisioned: existing.and_then(|d| d.last_provisioned),
        };

        self.devices.upsert(device.clone()).await?;
        info!("Provisioned device {} -> extension {}", mac, extension);
        Ok(device)
    }

    pub async fn get_device(&self, raw_mac: &str) -> Result<Option<ProvisionedDevice>> {
        match normalize_mac(raw_mac) {
            Some(mac) => self.devices.get(&mac).await,
            None => Ok(None),
        }
    }

    pub async fn remove_device(&self, raw_mac: &str) -> Result<bool> {
        match normalize_mac(raw_mac) {
            Some(mac) => self.devices.delete(&mac).await,
            None => Ok(false),
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<ProvisionedDevice>> {
        self.devices.all().await
    }
}
