//! Alarm management for the PBX
//!
//! QoS threshold crossings, sustained ICMP errors, RTP port exhaustion,
//! and store write failures all land here. Alarms are kept active until
//! cleared and a bounded history is retained for the admin surface.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::Result;

/// Alarm severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmSeverity {
    Critical,
    Major,
    Minor,
    Warning,
}

/// Alarm categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmType {
    Quality,
    Media,
    Signaling,
    Resource,
    Storage,
    Security,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AlarmState {
    Active,
    Cleared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub sequence_number: u64,
    pub severity: AlarmSeverity,
    pub alarm_type: AlarmType,
    pub state: AlarmState,
    /// Component that raised it, e.g. "media_relay" or "registrar".
    pub component: String,
    pub description: String,
    pub additional_info: HashMap<String, String>,
    pub raised_time: DateTime<Utc>,
    pub cleared_time: Option<DateTime<Utc>>,
    /// Repeats of the same (component, description) bump this instead of
    /// creating a new alarm.
    pub event_count: u32,
    pub last_event_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AlarmEvent {
    AlarmRaised(Alarm),
    AlarmCleared { id: String },
}

#[derive(Debug, Clone)]
pub struct AlarmConfig {
    pub max_history_size: usize,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            max_history_size: 10000,
        }
    }
}

/// Alarm management system
pub struct AlarmManager {
    config: AlarmConfig,
    active_alarms: Arc<RwLock<HashMap<String, Alarm>>>,
    alarm_history: Arc<RwLock<VecDeque<Alarm>>>,
    sequence_counter: Arc<RwLock<u64>>,
    event_tx: mpsc::UnboundedSender<AlarmEvent>,
    event_rx: RwLock<Option<mpsc::UnboundedReceiver<AlarmEvent>>>,
}

impl AlarmManager {
    pub fn new(config: AlarmConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            config,
            active_alarms: Arc::new(RwLock::new(HashMap::new())),
            alarm_history: Arc::new(RwLock::new(VecDeque::new())),
            sequence_counter: Arc::new(RwLock::new(1)),
            event_tx,
            event_rx: RwLock::new(Some(event_rx)),
        }
    }

    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<AlarmEvent>> {
        self.event_rx.write().await.take()
    }

    /// Raise a new alarm, or bump the repeat count of a matching active
    /// one.
    pub async fn raise_alarm(
        &self,
        severity: AlarmSeverity,
        alarm_type: AlarmType,
        component: &str,
        description: String,
        additional_info: Option<HashMap<String, String>>,
    ) -> Result<String> {
        let now = Utc::now();

        {
            let mut active = self.active_alarms.write().await;
            if let Some(existing) = active
                .values_mut()
                .find(|a| a.component == component && a.description == description)
            {
                existing.event_count += 1;
                existing.last_event_time = now;
                return Ok(existing.id.clone());
            }
        }

        let sequence = {
            let mut counter = self.sequence_counter.write().await;
            let seq = *counter;
            *counter += 1;
            seq
        };

        let alarm = Alarm {
            id: uuid::Uuid::new_v4().to_string(),
            sequence_number: sequence,
            severity,
            alarm_type,
            state: AlarmState::Active,
            component: component.to_string(),
            description: description.clone(),
            additional_info: additional_info.unwrap_or_default(),
            raised_time: now,
            cleared_time: None,
            event_count: 1,
            last_event_time: now,
        };

        warn!(
            "ALARM [{:?}/{:?}] {}: {}",
            severity, alarm_type, component, description
        );

        let id = alarm.id.clone();
        self.active_alarms
            .write()
            .await
            .insert(id.clone(), alarm.clone());
        let _ = self.event_tx.send(AlarmEvent::AlarmRaised(alarm));
        Ok(id)
    }

    pub async fn clear_alarm(&self, id: &str) -> Result<bool> {
        let alarm = self.active_alarms.write().await.remove(id);
        let Some(mut alarm) = alarm else {
            return Ok(false);
        };

        alarm.state = AlarmState::Cleared;
        alarm.cleared_time = Some(Utc::now());
        info!("Alarm cleared: {} ({})", alarm.description, id);

        let mut history = self.alarm_history.write().await;
        if history.len() >= self.config.max_history_size {
            history.pop_front();
        }
        history.push_back(alarm);
        drop(history);

        let _ = self.event_tx.send(AlarmEvent::AlarmCleared { id: id.to_string() });
        Ok(true)
    }

    pub async fn active_alarms(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self.active_alarms.read().await.values().cloned().collect();
        alarms.sort_by_key(|a| a.sequence_number);
        alarms
    }

    pub async fn history(&self) -> Vec<Alarm> {
        self.alarm_history.read().await.iter().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active_alarms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raise_and_clear() {
        let manager = AlarmManager::new(AlarmConfig::default());
        let id = manager
            .raise_alarm(
                AlarmSeverity::Major,
                AlarmType::Quality,
                "qos",
                "MOS below threshold".to_string(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(manager.active_count().await, 1);
        assert!(manager.clear_alarm(&id).await.unwrap());
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(manager.history().await.len(), 1);
        assert!(!manager.clear_alarm(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_raise_bumps_count() {
        let manager = AlarmManager::new(AlarmConfig::default());
        let first = manager
            .raise_alarm(
                AlarmSeverity::Minor,
                AlarmType::Media,
                "media_relay",
                "ICMP errors".to_string(),
                None,
            )
            .await
            .unwrap();
        let second = manager
            .raise_alarm(
                AlarmSeverity::Minor,
                AlarmType::Media,
                "media_relay",
                "ICMP errors".to_string(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        let active = manager.active_alarms().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].event_count, 2);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let manager = AlarmManager::new(AlarmConfig::default());
        let mut rx = manager.take_event_receiver().await.unwrap();

        manager
            .raise_alarm(
                AlarmSeverity::Critical,
                AlarmType::Resource,
                "rtp_ports",
                "Port range exhausted".to_string(),
                None,
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            AlarmEvent::AlarmRaised(alarm) => {
                assert_eq!(alarm.component, "rtp_ports");
                assert_eq!(alarm.severity, AlarmSeverity::Critical);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
