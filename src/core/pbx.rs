//! Main PBX orchestrator
//!
//! Builds every subsystem in dependency order, wires the event channels
//! between them, and supervises startup/shutdown. Stores are Postgres
//! when a database is configured, in-memory otherwise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{ApiState, Metrics, TokenService};
use crate::config::{PbxConfig, Secrets};
use crate::protocols::sip::SipTransportLayer;
use crate::services::alarms::{AlarmConfig, AlarmManager, AlarmSeverity, AlarmType};
use crate::services::b2bua::{B2buaService, LocalIdentity};
use crate::services::cdr::{CdrSink, LoggingCdrSink};
use crate::services::codecs::CodecNegotiator;
use crate::services::features::{
    AutoAttendantHook, ConfigEmergencyLocator, DiscardingVoicemailRecorder, EmergencyHook,
    FeatureHook, FeatureRouter, PagingHook, VoicemailBridge,
};
use crate::services::media_relay::RtpPortAllocator;
use crate::services::notifications::{NotificationDispatcher, NotificationEvent, QueueNotifier};
use crate::services::qos::QosRegistry;
use crate::services::registrar::Registrar;
use crate::signaling::{DigestAuthenticator, SipSender};
use crate::store::{
    self, Capability, Extension, ExtensionStore, InMemoryExtensionStore,
    InMemoryProvisionedDeviceStore, InMemoryRegistrationStore, ProvisionedDeviceStore,
    RegistrationStore,
};
use crate::services::provisioning::ProvisioningService;
use crate::{Error, Result};

/// Lifecycle events surfaced to the main binary.
#[derive(Debug, Clone)]
pub enum PbxEvent {
    Started,
    Stopped,
    Error { message: String },
}

pub struct PbxCore {
    config: PbxConfig,
    secrets: Secrets,

    extensions: Option<Arc<InMemoryExtensionStore>>,
    registrar: Option<Arc<Registrar>>,
    b2bua: Option<Arc<B2buaService>>,
    transport: Option<Arc<SipTransportLayer>>,

    event_tx: mpsc::UnboundedSender<PbxEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<PbxEvent>>,

    is_running: Arc<RwLock<bool>>,
    start_time: Option<std::time::Instant>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PbxCore {
    pub fn new(config: PbxConfig, secrets: Secrets) -> Result<Self> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            secrets,
            extensions: None,
            registrar: None,
            b2bua: None,
            transport: None,
            event_tx,
            event_rx: Some(event_rx),
            is_running: Arc::new(RwLock::new(false)),
            start_time: None,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<PbxEvent>> {
        self.event_rx.take()
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Rivet PBX core");

        // Accounts come from configuration; the snapshot is swapped whole
        // on reload.
        let extensions = Arc::new(InMemoryExtensionStore::new());
        for entry in &self.config.extensions {
            extensions.insert(extension_from_entry(entry));
        }
        info!("Loaded {} extensions", self.config.extensions.len());
        self.extensions = Some(Arc::clone(&extensions));
        let extensions_dyn: Arc<dyn ExtensionStore> = extensions;

        // Durable stores.
        let (registration_store, device_store, cdr_sink): (
            Arc<dyn RegistrationStore>,
            Arc<dyn ProvisionedDeviceStore>,
            Arc<dyn CdrSink>,
        ) = if self.config.database.password.is_empty() {
            warn!("No database password configured; registrations will not survive a restart");
            (
                Arc::new(InMemoryRegistrationStore::new()),
                Arc::new(InMemoryProvisionedDeviceStore::new()),
                Arc::new(LoggingCdrSink),
            )
        } else {
            let pool = store::postgres::connect(&self.config.database).await?;
            store::postgres::init_schema(&pool).await?;
            (
                Arc::new(store::postgres::PgRegistrationStore::new(pool.clone())),
                Arc::new(store::postgres::PgProvisionedDeviceStore::new(pool.clone())),
                Arc::new(store::postgres::PgCdrSink::new(pool)),
            )
        };

        // Registrar, with the startup integrity pass.
        let auth = DigestAuthenticator::new(
            self.config.sip.domain.clone(),
            self.secrets.sip_secret_key.clone(),
            &self.config.registrar,
        );
        let registrar = Arc::new(Registrar::new(
            self.config.registrar.clone(),
            auth,
            Arc::clone(&extensions_dyn),
            registration_store,
        ));
        registrar.startup().await?;
        registrar.start_sweeper();
        self.registrar = Some(Arc::clone(&registrar));

        // Media plane scaffolding.
        let allocator = Arc::new(RtpPortAllocator::new(&self.config.rtp.port_range));
        let qos = Arc::new(QosRegistry::new(self.config.qos.clone()));
        qos.start_sampler();

        let alarms = Arc::new(AlarmManager::new(AlarmConfig::default()));
        let notifier = QueueNotifier::new(1024);
        notifier.start();
        let notifier_dyn: Arc<dyn NotificationDispatcher> = notifier;

        // QoS alerts become alarms and notifications without touching any
        // call task.
        if let Some(mut alert_rx) = qos.take_alert_receiver() {
            let alarms_for_alerts = Arc::clone(&alarms);
            let notifier_for_alerts = Arc::clone(&notifier_dyn);
            self.tasks.push(tokio::spawn(async move {
                while let Some(alert) = alert_rx.recv().await {
                    let mut info = HashMap::new();
                    info.insert("call_id".to_string(), alert.call_id.clone());
                    info.insert("direction".to_string(), format!("{:?}", alert.direction));
                    let _ = alarms_for_alerts
                        .raise_alarm(
                            AlarmSeverity::Major,
                            AlarmType::Quality,
                            "qos",
                            format!("{:?} on call {}", alert.kind, alert.call_id),
                            Some(info),
                        )
                        .await;
                    notifier_for_alerts.fire(NotificationEvent::QosAlert(alert));
                }
            }));
        }

        // Feature hooks, in priority order: emergency always wins.
        let locator = Arc::new(ConfigEmergencyLocator::new(&self.config.features.emergency)?);
        let mut hooks: Vec<Arc<dyn FeatureHook>> = vec![Arc::new(EmergencyHook::new(
            self.config.features.emergency.clone(),
            locator,
            Arc::clone(&notifier_dyn),
        ))];
        hooks.push(Arc::new(AutoAttendantHook::new(
            self.config.features.auto_attendant.clone(),
        )));
        hooks.push(Arc::new(PagingHook::new(self.config.features.paging.clone())));
        let features = Arc::new(FeatureRouter::new(hooks));

        let voicemail = Arc::new(VoicemailBridge::new(
            self.config.features.voicemail.clone(),
            Arc::new(DiscardingVoicemailRecorder::new(self.config.general.server_ip)),
        ));

        // SIP transport and the signaling engine.
        let mut transport = SipTransportLayer::bind(self.config.sip.clone()).await?;
        let transport_events = transport
            .take_event_receiver()
            .ok_or_else(|| Error::internal("transport events already taken"))?;
        transport.start().await?;
        let transport = Arc::new(transport);
        self.transport = Some(Arc::clone(&transport));

        let (sip, commands) = SipSender::channel();
        let identity = LocalIdentity {
            server_ip: self.config.general.server_ip,
            sip_port: self.config.sip.listen_port,
            domain: self.config.sip.domain.clone(),
            user_agent: self.config.sip.user_agent.clone(),
        };

        let negotiator = Arc::new(CodecNegotiator::new(self.config.codecs.clone()));
        let b2bua = B2buaService::new(
            self.config.call.clone(),
            self.config.rtp.clone(),
            identity.clone(),
            Arc::clone(&registrar),
            negotiator,
            Arc::clone(&allocator),
            Arc::clone(&qos),
            features,
            voicemail,
            cdr_sink,
            Arc::clone(&alarms),
            sip.clone(),
        );
        self.b2bua = Some(Arc::clone(&b2bua));

        let engine = crate::core::SignalingEngine::new(
            Arc::clone(&transport),
            transport_events,
            commands,
            sip.clone(),
            Arc::clone(&registrar),
            Arc::clone(&b2bua),
            self.config.sip.user_agent.clone(),
            self.shutdown.clone(),
        );
        self.tasks.push(tokio::spawn(engine.run()));

        // HTTP surface.
        let provisioning = Arc::new(ProvisioningService::new(
            self.config.provisioning.clone(),
            device_store,
            Arc::clone(&extensions_dyn),
            self.config.general.server_ip,
            self.config.sip.listen_port,
            self.config.api.port,
        ));
        let api_state = Arc::new(ApiState {
            registrar,
            provisioning,
            qos,
            b2bua,
            alarms,
            extensions: extensions_dyn,
            notifier: notifier_dyn,
            tokens: TokenService::new(
                self.secrets.session_secret_key.clone(),
                self.config.api.token_ttl,
            ),
            sip,
            identity,
            metrics: Metrics::new()?,
            allocator,
        });
        let api_config = self.config.api.clone();
        let event_tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = crate::api::serve(api_state, api_config).await {
                error!("API server exited: {}", e);
                let _ = event_tx.send(PbxEvent::Error {
                    message: format!("API server: {}", e),
                });
            }
        }));

        *self.is_running.write().await = true;
        self.start_time = Some(std::time::Instant::now());
        let _ = self.event_tx.send(PbxEvent::Started);
        info!("Rivet PBX core started");
        Ok(())
    }

    /// Swap the extension snapshot from a freshly loaded configuration.
    pub fn reload_extensions(&self, config: &PbxConfig) -> Result<()> {
        let extensions = self
            .extensions
            .as_ref()
            .ok_or_else(|| Error::invalid_state("PBX not started"))?;
        extensions.replace_all(config.extensions.iter().map(extension_from_entry));
        info!("Reloaded {} extensions", config.extensions.len());
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn active_call_count(&self) -> usize {
        self.b2bua
            .as_ref()
            .map(|b| b.active_call_count())
            .unwrap_or(0)
    }

    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping Rivet PBX core");
        *self.is_running.write().await = false;

        // Hang up active calls and give their BYEs a moment to flush.
        if let Some(b2bua) = &self.b2bua {
            b2bua.hangup_all();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.shutdown.cancel();
        if let Some(transport) = &self.transport {
            transport.stop();
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }

        let _ = self.event_tx.send(PbxEvent::Stopped);
        info!("Rivet PBX core stopped");
        Ok(())
    }
}

impl Drop for PbxCore {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn extension_from_entry(entry: &crate::config::ExtensionEntry) -> Extension {
    let capabilities = entry
        .capabilities
        .iter()
        .filter_map(|name| match name.as_str() {
            "external-call" => Some(Capability::ExternalCall),
            "admin" => Some(Capability::Admin),
            "record" => Some(Capability::Record),
            "conference-host" => Some(Capability::ConferenceHost),
            other => {
                warn!("Unknown capability '{}' ignored", other);
                None
            }
        })
        .collect();
    Extension {
        id: entry.id.clone(),
        display_name: entry.display_name.clone(),
        sip_password: entry.sip_password.clone(),
        credential_hash: entry.credential_hash.clone(),
        capabilities,
        voicemail_pin_hash: entry.voicemail_pin_hash.clone(),
        email: entry.email.clone(),
    }
}
