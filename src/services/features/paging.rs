//! Group paging
//!
//! Dialing a configured paging number (e.g. 701 with prefix "7") answers
//! immediately and streams the caller's audio one-way to every extension
//! in the group.

use async_trait::async_trait;

use super::{CallerContext, FeatureAction, FeatureHook, LocalFlow};
use crate::config::PagingConfig;
use crate::{Error, Result};

pub struct PagingHook {
    config: PagingConfig,
}

impl PagingHook {
    pub fn new(config: PagingConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FeatureHook for PagingHook {
    fn name(&self) -> &'static str {
        "paging"
    }

    fn matches(&self, dialed: &str) -> bool {
        self.config.enabled
            && dialed.starts_with(&self.config.prefix)
            && self.config.groups.iter().any(|g| g.number == dialed)
    }

    async fn handle(&self, dialed: &str, _context: &CallerContext) -> Result<FeatureAction> {
        let group = self
            .config
            .groups
            .iter()
            .find(|g| g.number == dialed)
            .ok_or_else(|| Error::feature(format!("No paging group {}", dialed)))?;

        if group.extensions.is_empty() {
            return Ok(FeatureAction::Reject {
                code: 404,
                reason: "Not Found".to_string(),
            });
        }

        Ok(FeatureAction::AnswerLocally(LocalFlow::Paging {
            extensions: group.extensions.clone(),
        }))
    }
}
