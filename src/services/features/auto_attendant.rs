//! Auto-attendant entry point
//!
//! A configured extension (typically "0") that the PBX answers itself.
//! Menu prompt playback belongs to a collaborator; the core answers,
//! consumes digits from the unified DTMF queue, and transfers on a menu
//! match.

use async_trait::async_trait;

use super::{CallerContext, FeatureAction, FeatureHook, LocalFlow};
use crate::config::AutoAttendantConfig;
use crate::Result;

pub struct AutoAttendantHook {
    config: AutoAttendantConfig,
}

impl AutoAttendantHook {
    pub fn new(config: AutoAttendantConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FeatureHook for AutoAttendantHook {
    fn name(&self) -> &'static str {
        "auto_attendant"
    }

    fn matches(&self, dialed: &str) -> bool {
        self.config.enabled && dialed == self.config.extension
    }

    async fn handle(&self, _dialed: &str, _context: &CallerContext) -> Result<FeatureAction> {
        let menu = self
            .config
            .menu
            .iter()
            .map(|entry| (entry.digit, entry.extension.clone()))
            .collect();
        Ok(FeatureAction::AnswerLocally(LocalFlow::AutoAttendant { menu }))
    }
}
