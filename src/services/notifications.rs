//! Asynchronous notification dispatch
//!
//! Feature hooks fire notifications (emergency calls, quality alerts,
//! voicemail events) without ever blocking a call FSM: events go into a
//! bounded queue with drop-oldest-on-overflow and a worker drains them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::services::qos::QosAlert;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NotificationEvent {
    EmergencyCall {
        caller: String,
        caller_ip: String,
        site: Option<String>,
        elin: Option<String>,
        at: DateTime<Utc>,
    },
    QosAlert(QosAlert),
    VoicemailLeft {
        extension: String,
        caller: String,
        at: DateTime<Utc>,
    },
    PhoneRebootRequested {
        extension: String,
        at: DateTime<Utc>,
    },
    CallInternalError {
        call_id: String,
        detail: String,
        at: DateTime<Utc>,
    },
}

pub trait NotificationDispatcher: Send + Sync {
    /// Enqueue an event. Never blocks, never fails; overflow drops the
    /// oldest pending event.
    fn fire(&self, event: NotificationEvent);
}

/// Default dispatcher: bounded queue drained by a worker task. Delivery
/// here is the structured log; a deployment-specific collaborator can
/// replace the whole trait object.
pub struct QueueNotifier {
    queue: Mutex<VecDeque<NotificationEvent>>,
    notify: Notify,
    capacity: usize,
}

impl QueueNotifier {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                notifier.notify.notified().await;
                while let Some(event) = notifier.pop() {
                    notifier.deliver(event).await;
                }
            }
        });
    }

    fn pop(&self) -> Option<NotificationEvent> {
        self.queue.lock().expect("notify queue lock").pop_front()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("notify queue lock").len()
    }

    async fn deliver(&self, event: NotificationEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "notify", "{}", json),
            Err(e) => warn!("Undeliverable notification: {}", e),
        }
    }
}

impl NotificationDispatcher for QueueNotifier {
    fn fire(&self, event: NotificationEvent) {
        {
            let mut queue = self.queue.lock().expect("notify queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                warn!("Notification queue overflow, dropped oldest event");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}
