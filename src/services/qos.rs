//! Per-call, per-direction media quality collection
//!
//! Each relay owns two collectors because the two network paths are
//! asymmetric; a healthy A→B next to a dead B→A is the canonical
//! one-way-audio signature. Loss derives from extended sequence numbers,
//! jitter follows RFC 3550, and MOS comes from the E-model R-factor.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::QosConfig;
use crate::protocols::rtp::RtpHeader;
use crate::services::cdr::QualitySummary;

/// Direction labels used in metric names and API payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "a_to_b")]
    AToB,
    #[serde(rename = "b_to_a")]
    BToA,
}

impl Direction {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::AToB => "_a_to_b",
            Self::BToA => "_b_to_a",
        }
    }
}

/// Running state for one direction of one call.
#[derive(Debug, Default)]
pub struct DirectionStats {
    ssrc: Option<u32>,
    base_seq: Option<u16>,
    max_seq: u16,
    cycles: u32,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub out_of_order: u64,
    pub icmp_errors: u64,
    /// RFC 3550 interarrival jitter in RTP timestamp units (8 kHz).
    jitter_units: f64,
    last_timestamp: u32,
    pub last_arrival: Option<Instant>,
    /// From RTCP when available; zero otherwise.
    pub latency_ms: f64,
}

impl DirectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one received packet.
    pub fn on_packet(&mut self, header: &RtpHeader, payload_len: usize, now: Instant) {
        // A new SSRC resets the sequence tracking but not the counters:
        // a re-INVITE changing the source must not zero the call history.
        if self.ssrc != Some(header.ssrc) {
            self.ssrc = Some(header.ssrc);
            self.base_seq = Some(header.sequence_number);
            self.max_seq = header.sequence_number;
            self.cycles = 0;
        } else {
            let seq = header.sequence_number;
            let delta = seq.wrapping_sub(self.max_seq);
            if delta != 0 && delta < 0x8000 {
                // Forward movement, possibly wrapping.
                if seq < self.max_seq {
                    self.cycles += 1;
                }
                self.max_seq = seq;
            } else if delta != 0 {
                self.out_of_order += 1;
            }
        }

        self.update_jitter(header.timestamp, now);

        self.packets_received += 1;
        self.bytes_received += payload_len as u64;
        self.last_arrival = Some(now);
        self.last_timestamp = header.timestamp;
    }

    fn update_jitter(&mut self, timestamp: u32, now: Instant) {
        // Interarrival deviation D in timestamp units (8 kHz clock),
        // smoothed per RFC 3550: J += (|D| − J) / 16.
        if let Some(last_arrival) = self.last_arrival {
            let arrival_delta = now.duration_since(last_arrival).as_secs_f64() * 8000.0;
            let timestamp_delta = timestamp.wrapping_sub(self.last_timestamp) as f64;
            let d = (arrival_delta - timestamp_delta).abs();
            self.jitter_units += (d - self.jitter_units) / 16.0;
        }
    }

    pub fn record_icmp_error(&mut self) {
        self.icmp_errors += 1;
    }

    /// Packets the sender put on the wire, judged by sequence numbers.
    pub fn expected(&self) -> u64 {
        match self.base_seq {
            Some(base) => {
                let extended = (self.cycles as u64) << 16 | self.max_seq as u64;
                extended.saturating_sub(base as u64) + 1
            }
            None => 0,
        }
    }

    pub fn packets_lost(&self) -> u64 {
        self.expected()
            .saturating_sub(self.packets_received)
            .saturating_sub(self.out_of_order)
    }

    pub fn loss_percent(&self) -> f64 {
        let expected = self.expected();
        if expected == 0 {
            return 0.0;
        }
        self.packets_lost() as f64 / expected as f64 * 100.0
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_units / 8.0
    }

    /// E-model R-factor: 93.2 − loss and delay/jitter penalties.
    pub fn r_factor(&self) -> f64 {
        let loss_penalty = self.loss_percent() * 2.5;
        let delay_penalty = (self.latency_ms - 150.0).max(0.0) * 0.1;
        let jitter_penalty = (self.jitter_ms() * 0.3).min(20.0);
        93.2 - loss_penalty - delay_penalty - jitter_penalty
    }

    /// MOS via the E-model mapping, clamped to [1.0, 5.0]. A direction
    /// that never received a packet reports the 0.00 sentinel.
    pub fn mos(&self) -> f64 {
        if self.packets_received == 0 {
            return 0.0;
        }
        let r = self.r_factor();
        let mos = 1.0 + 0.035 * r + 7.0e-6 * r * (r - 60.0) * (100.0 - r);
        mos.clamp(1.0, 5.0)
    }

    pub fn report(&self, direction: Direction) -> DirectionReport {
        DirectionReport {
            direction,
            packets_received: self.packets_received,
            bytes_received: self.bytes_received,
            packets_lost: self.packets_lost(),
            out_of_order: self.out_of_order,
            loss_percent: self.loss_percent(),
            jitter_ms: self.jitter_ms(),
            latency_ms: self.latency_ms,
            icmp_errors: self.icmp_errors,
            r_factor: self.r_factor(),
            mos: self.mos(),
        }
    }

    pub fn summary(&self) -> QualitySummary {
        QualitySummary {
            packets_received: self.packets_received,
            packets_lost: self.packets_lost(),
            loss_percent: self.loss_percent(),
            jitter_ms: self.jitter_ms(),
            mos: self.mos(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionReport {
    pub direction: Direction,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub out_of_order: u64,
    pub loss_percent: f64,
    pub jitter_ms: f64,
    pub latency_ms: f64,
    pub icmp_errors: u64,
    pub r_factor: f64,
    pub mos: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosReport {
    pub call_id: String,
    pub sampled_at: DateTime<Utc>,
    pub a_to_b: DirectionReport,
    pub b_to_a: DirectionReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosAlertKind {
    LowMos,
    HighLoss,
    HighJitter,
    OneWayAudio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosAlert {
    pub call_id: String,
    pub kind: QosAlertKind,
    pub direction: Direction,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Both directions of one call, shared between the relay (writer) and the
/// sampler/API (readers).
pub struct CallQos {
    pub a_to_b: Mutex<DirectionStats>,
    pub b_to_a: Mutex<DirectionStats>,
    started: Instant,
}

impl CallQos {
    fn new() -> Self {
        Self {
            a_to_b: Mutex::new(DirectionStats::new()),
            b_to_a: Mutex::new(DirectionStats::new()),
            started: Instant::now(),
        }
    }

    pub fn direction(&self, direction: Direction) -> &Mutex<DirectionStats> {
        match direction {
            Direction::AToB => &self.a_to_b,
            Direction::BToA => &self.b_to_a,
        }
    }

    pub fn report(&self, call_id: &str) -> QosReport {
        QosReport {
            call_id: call_id.to_string(),
            sampled_at: Utc::now(),
            a_to_b: self.a_to_b.lock().expect("qos lock").report(Direction::AToB),
            b_to_a: self.b_to_a.lock().expect("qos lock").report(Direction::BToA),
        }
    }
}

/// All live collectors plus rolling history and fired alerts.
pub struct QosRegistry {
    config: QosConfig,
    calls: DashMap<String, Arc<CallQos>>,
    history: Mutex<VecDeque<QosReport>>,
    alerts: Mutex<VecDeque<QosAlert>>,
    fired: Mutex<HashSet<(String, QosAlertKind, Direction)>>,
    alert_tx: mpsc::UnboundedSender<QosAlert>,
    alert_rx: Mutex<Option<mpsc::UnboundedReceiver<QosAlert>>>,
}

/// One-way-audio detection waits this long for media to arrive at all.
const ONE_WAY_GRACE: Duration = Duration::from_secs(5);
const MAX_ALERTS_KEPT: usize = 1000;

impl QosRegistry {
    pub fn new(config: QosConfig) -> Self {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        Self {
            config,
            calls: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            alerts: Mutex::new(VecDeque::new()),
            fired: Mutex::new(HashSet::new()),
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
        }
    }

    pub fn take_alert_receiver(&self) -> Option<mpsc::UnboundedReceiver<QosAlert>> {
        self.alert_rx.lock().expect("qos lock").take()
    }

    pub fn register(&self, call_id: &str) -> Arc<CallQos> {
        let qos = Arc::new(CallQos::new());
        self.calls.insert(call_id.to_string(), Arc::clone(&qos));
        qos
    }

    /// Drop a finished call, pushing its final report into history.
    pub fn unregister(&self, call_id: &str) {
        if let Some((_, qos)) = self.calls.remove(call_id) {
            self.push_history(qos.report(call_id));
        }
        self.fired
            .lock()
            .expect("qos lock")
            .retain(|(id, _, _)| id != call_id);
    }

    pub fn report(&self, call_id: &str) -> Option<QosReport> {
        self.calls.get(call_id).map(|qos| qos.report(call_id))
    }

    pub fn all_reports(&self) -> Vec<QosReport> {
        self.calls
            .iter()
            .map(|entry| entry.value().report(entry.key()))
            .collect()
    }

    pub fn history(&self) -> Vec<QosReport> {
        self.history.lock().expect("qos lock").iter().cloned().collect()
    }

    pub fn alerts(&self) -> Vec<QosAlert> {
        self.alerts.lock().expect("qos lock").iter().cloned().collect()
    }

    fn push_history(&self, report: QosReport) {
        let mut history = self.history.lock().expect("qos lock");
        if history.len() >= self.config.history_size {
            history.pop_front();
        }
        history.push_back(report);
    }

    /// Periodic sampler: snapshots every call into history and evaluates
    /// alert thresholds.
    pub fn start_sampler(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let period = Duration::from_secs(registry.config.sample_interval.max(1) as u64);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                registry.sample_once();
            }
        });
    }

    /// One sampling pass. Split out so tests can drive it directly.
    pub fn sample_once(&self) {
        for entry in self.calls.iter() {
            let call_id = entry.key().clone();
            let qos = entry.value();
            let report = qos.report(&call_id);
            self.evaluate_alerts(&call_id, qos, &report);
            self.push_history(report);
        }
    }

    fn evaluate_alerts(&self, call_id: &str, qos: &CallQos, report: &QosReport) {
        let age = qos.started.elapsed();

        for direction_report in [&report.a_to_b, &report.b_to_a] {
            let direction = direction_report.direction;
            if direction_report.packets_received > 0 {
                if direction_report.mos < self.config.mos_alert_threshold {
                    self.fire(
                        call_id,
                        QosAlertKind::LowMos,
                        direction,
                        direction_report.mos,
                        self.config.mos_alert_threshold,
                    );
                }
                if direction_report.loss_percent > self.config.loss_alert_percent {
                    self.fire(
                        call_id,
                        QosAlertKind::HighLoss,
                        direction,
                        direction_report.loss_percent,
                        self.config.loss_alert_percent,
                    );
                }
                if direction_report.jitter_ms > self.config.jitter_alert_ms {
                    self.fire(
                        call_id,
                        QosAlertKind::HighJitter,
                        direction,
                        direction_report.jitter_ms,
                        self.config.jitter_alert_ms,
                    );
                }
            }
        }

        if age >= ONE_WAY_GRACE {
            let (healthy, dead) = (&report.a_to_b, &report.b_to_a);
            if healthy.packets_received > 0 && dead.packets_received == 0 {
                self.fire(call_id, QosAlertKind::OneWayAudio, Direction::BToA, 0.0, 0.0);
            }
            let (healthy, dead) = (&report.b_to_a, &report.a_to_b);
            if healthy.packets_received > 0 && dead.packets_received == 0 {
                self.fire(call_id, QosAlertKind::OneWayAudio, Direction::AToB, 0.0, 0.0);
            }
        }
    }

    fn fire(
        &self,
        call_id: &str,
        kind: QosAlertKind,
        direction: Direction,
        value: f64,
        threshold: f64,
    ) {
        // One alert per (call, kind, direction); the sampler re-evaluates
        // every second and would otherwise spam.
        let key = (call_id.to_string(), kind, direction);
        if !self.fired.lock().expect("qos lock").insert(key) {
            return;
        }

        let alert = QosAlert {
            call_id: call_id.to_string(),
            kind,
            direction,
            value,
            threshold,
            raised_at: Utc::now(),
        };
        warn!(
            "QoS alert {:?}{} on call {}: value {:.2} (threshold {:.2})",
            kind,
            direction.suffix(),
            call_id,
            value,
            threshold
        );

        let mut alerts = self.alerts.lock().expect("qos lock");
        if alerts.len() >= MAX_ALERTS_KEPT {
            alerts.pop_front();
        }
        alerts.push_back(alert.clone());
        drop(alerts);

        if self.alert_tx.send(alert).is_err() {
            debug!("No QoS alert consumer attached");
        }
    }
}
