//! Call Detail Record emission
//!
//! Exactly one CDR is produced per call when it reaches Terminated. The
//! sink is a collaborator interface: the core fires and forgets, and a
//! failing sink never affects call processing.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// How the call ended, from the PBX's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    #[serde(rename = "answered")]
    Answered,
    #[serde(rename = "no_answer")]
    NoAnswer,
    #[serde(rename = "busy")]
    Busy,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "voicemail")]
    Voicemail,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "internal_error")]
    InternalError,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "answered",
            Self::NoAnswer => "no_answer",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::Voicemail => "voicemail",
            Self::Failed => "failed",
            Self::InternalError => "internal_error",
        }
    }
}

/// Final per-direction quality snapshot carried in the CDR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySummary {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub loss_percent: f64,
    pub jitter_ms: f64,
    pub mos: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    /// Internal call id, distinct from either leg's SIP Call-ID.
    pub call_id: String,
    pub caller_leg_call_id: String,
    pub callee_leg_call_id: Option<String>,
    pub caller: String,
    pub callee: String,
    pub start_time: DateTime<Utc>,
    pub answer_time: Option<DateTime<Utc>>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
    /// Seconds between answer and end; zero for unanswered calls.
    pub billable_seconds: u64,
    pub disposition: Disposition,
    pub negotiated_payload_type: Option<u8>,
    pub quality_a_to_b: Option<QualitySummary>,
    pub quality_b_to_a: Option<QualitySummary>,
}

#[async_trait]
pub trait CdrSink: Send + Sync {
    async fn record(&self, record: CallRecord);
}

/// Sink that emits CDRs to the structured log. Always available.
pub struct LoggingCdrSink;

#[async_trait]
impl CdrSink for LoggingCdrSink {
    async fn record(&self, record: CallRecord) {
        match serde_json::to_string(&record) {
            Ok(json) => info!(target: "cdr", "{}", json),
            Err(e) => warn!("CDR for call {} not serializable: {}", record.call_id, e),
        }
    }
}

/// Sink appending one JSON line per call to a spool file.
pub struct JsonlCdrSink {
    path: PathBuf,
}

impl JsonlCdrSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CdrSink for JsonlCdrSink {
    async fn record(&self, record: CallRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!("CDR for call {} not serializable: {}", record.call_id, e);
                return;
            }
        };
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to spool CDR for call {}: {}", record.call_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> CallRecord {
        let start = Utc::now();
        CallRecord {
            id: "cdr-1".to_string(),
            call_id: "call-1".to_string(),
            caller_leg_call_id: "leg-a".to_string(),
            callee_leg_call_id: Some("leg-b".to_string()),
            caller: "1001".to_string(),
            callee: "1002".to_string(),
            start_time: start,
            answer_time: Some(start + chrono::Duration::seconds(4)),
            end_time: start + chrono::Duration::seconds(64),
            duration_seconds: 64,
            billable_seconds: 60,
            disposition: Disposition::Answered,
            negotiated_payload_type: Some(0),
            quality_a_to_b: None,
            quality_b_to_a: None,
        }
    }

    #[test]
    fn test_timestamps_are_ordered() {
        let record = sample_record();
        assert!(record.start_time <= record.answer_time.unwrap());
        assert!(record.answer_time.unwrap() <= record.end_time);
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cdr.jsonl");
        let sink = JsonlCdrSink::new(path.clone());

        sink.record(sample_record()).await;
        sink.record(sample_record()).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: CallRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.disposition, Disposition::Answered);
    }

    #[test]
    fn test_disposition_serialization() {
        assert_eq!(
            serde_json::to_string(&Disposition::InternalError).unwrap(),
            "\"internal_error\""
        );
        assert_eq!(Disposition::NoAnswer.as_str(), "no_answer");
    }
}
