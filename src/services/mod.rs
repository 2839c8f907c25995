//! Services module for the Rivet PBX

pub mod alarms;
pub mod b2bua;
pub mod cdr;
pub mod codecs;
pub mod features;
pub mod media_relay;
pub mod notifications;
pub mod provisioning;
pub mod qos;
pub mod registrar;

pub use alarms::{Alarm, AlarmEvent, AlarmManager, AlarmSeverity, AlarmType};
pub use b2bua::{B2buaService, CallEvent, CallHandle, CallState};
pub use cdr::{CallRecord, CdrSink, Disposition};
pub use codecs::CodecNegotiator;
pub use media_relay::{RelaySide, RtpPortAllocator, RtpRelay};
pub use notifications::{NotificationDispatcher, NotificationEvent, QueueNotifier};
pub use provisioning::ProvisioningService;
pub use qos::{DirectionStats, QosRegistry};
pub use registrar::Registrar;
