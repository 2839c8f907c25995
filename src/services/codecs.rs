//! Per-device codec negotiation
//!
//! The phone-model → codec-set mapping is configuration data, not code:
//! a policy row matches a substring of the registered User-Agent and
//! overrides which payload types the PBX offers that device.

use tracing::debug;

use crate::config::CodecConfig;
use crate::{Error, Result};

pub struct CodecNegotiator {
    config: CodecConfig,
}

impl CodecNegotiator {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Payload types to offer a device, by its registered User-Agent.
    /// The device override is intersected with the global allow list,
    /// preserving the override's preference order. No match, or an
    /// intersection that comes up empty, falls back to the full
    /// configured list.
    pub fn offer_for(&self, user_agent: Option<&str>) -> Vec<u8> {
        let Some(user_agent) = user_agent else {
            return self.config.allowed_payload_types.clone();
        };

        for policy in &self.config.device_policies {
            if user_agent.contains(&policy.user_agent_pattern) {
                let offered: Vec<u8> = policy
                    .payload_types
                    .iter()
                    .copied()
                    .filter(|pt| self.config.allowed_payload_types.contains(pt))
                    .collect();
                if offered.is_empty() {
                    debug!(
                        "Codec policy '{}' intersects to nothing, using global list",
                        policy.user_agent_pattern
                    );
                    return self.config.allowed_payload_types.clone();
                }
                return offered;
            }
        }

        self.config.allowed_payload_types.clone()
    }

    /// Offer/answer resolution: the first payload type in the answer that
    /// also appears in the offer wins. No overlap is a 488.
    pub fn select(&self, offer: &[u8], answer: &[u8]) -> Result<u8> {
        answer
            .iter()
            .copied()
            .find(|pt| offer.contains(pt))
            .ok_or_else(|| Error::codec("No codec in common between offer and answer"))
    }
}
