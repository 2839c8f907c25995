//! Emergency call routing
//!
//! Dial patterns like 9911 and 9-911 normalize to the emergency number.
//! The caller's dispatchable location comes from an IP-range → site
//! lookup; the call routes out the site's trunk presenting the site ELIN,
//! and configured contacts are notified. Emergency calls bypass every
//! access-control deny rule by construction: this hook runs before any of
//! them and its decision is final.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info};

use super::{CallerContext, FeatureAction, FeatureHook};
use crate::config::EmergencyConfig;
use crate::services::notifications::{NotificationDispatcher, NotificationEvent};
use crate::store::{EmergencyLocator, Site};
use crate::utils::IpNetwork;
use crate::{Error, Result};

/// Locator backed by the configured site table.
pub struct ConfigEmergencyLocator {
    sites: Vec<(IpNetwork, Site)>,
}

impl ConfigEmergencyLocator {
    pub fn new(config: &EmergencyConfig) -> Result<Self> {
        let mut sites = Vec::new();
        for site in &config.sites {
            let network: IpNetwork = site.network.parse()?;
            sites.push((
                network,
                Site {
                    name: site.name.clone(),
                    trunk_uri: site.trunk_uri.clone(),
                    elin: site.elin.clone(),
                },
            ));
        }
        Ok(Self { sites })
    }
}

#[async_trait]
impl EmergencyLocator for ConfigEmergencyLocator {
    async fn locate(&self, caller_ip: IpAddr) -> Option<Site> {
        self.sites
            .iter()
            .find(|(network, _)| network.contains(caller_ip))
            .map(|(_, site)| site.clone())
    }
}

pub struct EmergencyHook {
    config: EmergencyConfig,
    locator: Arc<dyn EmergencyLocator>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl EmergencyHook {
    pub fn new(
        config: EmergencyConfig,
        locator: Arc<dyn EmergencyLocator>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            config,
            locator,
            notifier,
        }
    }

    fn normalize(&self, dialed: &str) -> String {
        // Strip separators so 9-911 and 9911 compare equal.
        let compact: String = dialed.chars().filter(|c| c.is_ascii_digit()).collect();
        for pattern in &self.config.dial_patterns {
            let pattern_compact: String =
                pattern.chars().filter(|c| c.is_ascii_digit()).collect();
            if compact == pattern_compact {
                return self.config.emergency_number.clone();
            }
        }
        dialed.to_string()
    }
}

#[async_trait]
impl FeatureHook for EmergencyHook {
    fn name(&self) -> &'static str {
        "emergency"
    }

    fn matches(&self, dialed: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let compact: String = dialed.chars().filter(|c| c.is_ascii_digit()).collect();
        self.config
            .dial_patterns
            .iter()
            .any(|p| p.chars().filter(|c| c.is_ascii_digit()).collect::<String>() == compact)
    }

    async fn handle(&self, dialed: &str, context: &CallerContext) -> Result<FeatureAction> {
        let number = self.normalize(dialed);
        let site = self.locator.locate(context.source_ip).await;

        error!(
            "EMERGENCY call to {} from extension {} at {} (site: {})",
            number,
            context.extension,
            context.source_ip,
            site.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown")
        );

        self.notifier.fire(NotificationEvent::EmergencyCall {
            caller: context.extension.clone(),
            caller_ip: context.source_ip.to_string(),
            site: site.as_ref().map(|s| s.name.clone()),
            elin: site.as_ref().map(|s| s.elin.clone()),
            at: Utc::now(),
        });

        let site = site.ok_or_else(|| {
            Error::feature(format!(
                "No dispatchable location for caller IP {}",
                context.source_ip
            ))
        })?;

        info!(
            "Routing emergency call via {} with ELIN {}",
            site.trunk_uri, site.elin
        );
        Ok(FeatureAction::RouteToTrunk {
            uri: format!("sip:{}@{}", number, trunk_host(&site.trunk_uri)),
            caller_id_override: Some(site.elin),
        })
    }
}

/// Accept both a bare host and a full sip: URI in the trunk config.
fn trunk_host(trunk_uri: &str) -> &str {
    trunk_uri
        .strip_prefix("sip:")
        .map(|rest| rest.split('@').last().unwrap_or(rest))
        .unwrap_or(trunk_uri)
}
