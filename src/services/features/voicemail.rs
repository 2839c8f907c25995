//! Voicemail bridging on no-answer
//!
//! When the callee alerting timer expires, the call FSM cancels the callee
//! leg, answers the caller, and bridges audio to the voicemail recorder
//! collaborator. A short 1 kHz beep is played to the caller before
//! recording starts so people know when to speak.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::VoicemailConfig;
use crate::protocols::sdp::SessionDescription;
use crate::services::media_relay::{RelaySide, RtpRelay};
use crate::store::VoicemailRecorder;
use crate::{Error, Result};

/// Frequency of the pre-recording beep.
const BEEP_FREQUENCY_HZ: f64 = 1000.0;

pub struct VoicemailBridge {
    config: VoicemailConfig,
    recorder: Arc<dyn VoicemailRecorder>,
}

impl VoicemailBridge {
    pub fn new(config: VoicemailConfig, recorder: Arc<dyn VoicemailRecorder>) -> Self {
        Self { config, recorder }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Point the relay's B side at the recorder's media endpoint, beep the
    /// caller, and let audio flow. The caller leg must already be
    /// answered.
    pub async fn bridge(
        &self,
        relay: &RtpRelay,
        extension: &str,
        caller_id: &str,
    ) -> Result<SocketAddr> {
        let sdp_text = self.recorder.start(extension, caller_id).await?;
        let sdp = SessionDescription::parse(&sdp_text)?;
        let endpoint = sdp
            .audio_endpoint()
            .ok_or_else(|| Error::feature("Voicemail recorder SDP has no audio endpoint"))?;

        info!(
            "Bridging caller {} to voicemail for {} at {}",
            caller_id, extension, endpoint
        );

        // Beep first so the caller hears it before any recording happens.
        if let Err(e) = relay
            .play_tone(RelaySide::A, BEEP_FREQUENCY_HZ, self.config.beep_duration_ms)
            .await
        {
            warn!("Voicemail beep not played: {}", e);
        }

        relay.update_endpoint(RelaySide::B, endpoint);
        Ok(endpoint)
    }
}

/// Fallback recorder for deployments without a voicemail collaborator:
/// accepts the media stream and discards it. Keeps the wire behavior of a
/// real recorder so the call flow is identical.
pub struct DiscardingVoicemailRecorder {
    advertise_ip: IpAddr,
    /// Recordings are capped; the drain task exits afterwards.
    max_duration: Duration,
}

impl DiscardingVoicemailRecorder {
    pub fn new(advertise_ip: IpAddr) -> Self {
        Self {
            advertise_ip,
            max_duration: Duration::from_secs(300),
        }
    }
}

#[async_trait]
impl VoicemailRecorder for DiscardingVoicemailRecorder {
    async fn start(&self, extension: &str, caller_id: &str) -> Result<String> {
        let socket = UdpSocket::bind(SocketAddr::new(self.advertise_ip, 0)).await?;
        let local = socket.local_addr()?;
        debug!(
            "Discarding voicemail sink for {} (from {}) on {}",
            extension, caller_id, local
        );

        let max_duration = self.max_duration;
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 2048];
            let _ = tokio::time::timeout(max_duration, async {
                loop {
                    if socket.recv_from(&mut buffer).await.is_err() {
                        break;
                    }
                }
            })
            .await;
        });

        let sdp = SessionDescription::audio(local, &[0, 8, 101], 101);
        Ok(sdp.encode())
    }
}
