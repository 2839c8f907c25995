//! Feature routing hooks
//!
//! Dispatchers that intercept call routing for special destinations.
//! Every hook answers the same question: given the dialed number and the
//! caller's context, should this call route normally to an extension, be
//! diverted to a trunk, or be answered and handled by the PBX itself?

pub mod auto_attendant;
pub mod emergency;
pub mod paging;
pub mod voicemail;

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;

pub use auto_attendant::AutoAttendantHook;
pub use emergency::{ConfigEmergencyLocator, EmergencyHook};
pub use paging::PagingHook;
pub use voicemail::{DiscardingVoicemailRecorder, VoicemailBridge};

/// Who is calling, as the hooks see it.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub extension: String,
    pub display_name: Option<String>,
    pub source_ip: IpAddr,
}

/// Flows the PBX itself runs after answering a call.
#[derive(Debug, Clone)]
pub enum LocalFlow {
    /// Play the menu, collect digits, transfer on match.
    AutoAttendant { menu: Vec<(char, String)> },
    /// One-way audio fan-out to a group.
    Paging { extensions: Vec<String> },
}

/// What a hook decided.
#[derive(Debug, Clone)]
pub enum FeatureAction {
    /// Not special: route to this extension like any other call.
    RouteToExtension(String),
    /// Divert to a trunk URI, optionally presenting a different caller
    /// number (the ELIN for emergency calls).
    RouteToTrunk {
        uri: String,
        caller_id_override: Option<String>,
    },
    /// Answer the call ourselves and run a local flow.
    AnswerLocally(LocalFlow),
    /// Refuse the call.
    Reject { code: u16, reason: String },
}

#[async_trait]
pub trait FeatureHook: Send + Sync {
    fn name(&self) -> &'static str;
    /// Cheap pattern test against the dialed number.
    fn matches(&self, dialed: &str) -> bool;
    /// Full decision. Only called when `matches` returned true.
    async fn handle(&self, dialed: &str, context: &CallerContext) -> Result<FeatureAction>;
}

/// Ordered hook chain; the first matching hook decides.
pub struct FeatureRouter {
    hooks: Vec<Arc<dyn FeatureHook>>,
}

impl FeatureRouter {
    pub fn new(hooks: Vec<Arc<dyn FeatureHook>>) -> Self {
        Self { hooks }
    }

    /// Resolve the dialed number. `None` means no hook claimed the call
    /// and it routes to an extension as usual.
    pub async fn route(
        &self,
        dialed: &str,
        context: &CallerContext,
    ) -> Result<Option<FeatureAction>> {
        for hook in &self.hooks {
            if hook.matches(dialed) {
                tracing::debug!("Feature hook '{}' claimed dialed number {}", hook.name(), dialed);
                return self.run_hook(hook, dialed, context).await.map(Some);
            }
        }
        Ok(None)
    }

    async fn run_hook(
        &self,
        hook: &Arc<dyn FeatureHook>,
        dialed: &str,
        context: &CallerContext,
    ) -> Result<FeatureAction> {
        hook.handle(dialed, context).await
    }
}
