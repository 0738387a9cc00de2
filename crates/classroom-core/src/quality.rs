//! Connection quality monitor
//!
//! Every sample interval the monitor pulls transport statistics from a
//! [`StatsSource`], derives packet loss, round-trip latency and jitter, and
//! classifies them into a [`QualityTier`]. Only the latest sample is kept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::QualityConfig;
use crate::error::{ClassroomError, ClassroomResult};
use crate::events::{ClassroomEvent, EventEmitter};
use crate::peer::{TransportError, TransportStats};
use crate::session::SessionId;

/// Upper bounds (exclusive) a sample must stay under to reach a tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub packet_loss_percent: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
}

impl TierLimits {
    pub const fn new(packet_loss_percent: f64, latency_ms: f64, jitter_ms: f64) -> Self {
        Self {
            packet_loss_percent,
            latency_ms,
            jitter_ms,
        }
    }

    fn admits(&self, loss: f64, latency: f64, jitter: f64) -> bool {
        loss < self.packet_loss_percent && latency < self.latency_ms && jitter < self.jitter_ms
    }

    fn within(&self, other: &TierLimits) -> bool {
        self.packet_loss_percent <= other.packet_loss_percent
            && self.latency_ms <= other.latency_ms
            && self.jitter_ms <= other.jitter_ms
    }
}

/// Classification thresholds; anything outside `fair` is poor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent: TierLimits,
    pub good: TierLimits,
    pub fair: TierLimits,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent: TierLimits::new(1.0, 100.0, 30.0),
            good: TierLimits::new(3.0, 200.0, 50.0),
            fair: TierLimits::new(5.0, 300.0, 100.0),
        }
    }
}

impl QualityThresholds {
    /// Limits must be positive and loosen from `excellent` to `fair`
    pub fn validate(&self) -> ClassroomResult<()> {
        for (name, limits) in [("excellent", &self.excellent), ("good", &self.good), ("fair", &self.fair)] {
            let values = [limits.packet_loss_percent, limits.latency_ms, limits.jitter_ms];
            if values.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                return Err(ClassroomError::InvalidConfiguration {
                    field: format!("quality.thresholds.{}", name),
                    reason: "limits must be positive".to_string(),
                });
            }
        }
        if !self.excellent.within(&self.good) || !self.good.within(&self.fair) {
            return Err(ClassroomError::InvalidConfiguration {
                field: "quality.thresholds".to_string(),
                reason: "tiers must loosen from excellent to fair".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Excellent => "excellent",
            QualityTier::Good => "good",
            QualityTier::Fair => "fair",
            QualityTier::Poor => "poor",
        };
        f.write_str(name)
    }
}

/// First tier whose limits all three measurements stay under
pub fn classify(packet_loss_percent: f64, latency_ms: f64, jitter_ms: f64, thresholds: &QualityThresholds) -> QualityTier {
    let tiers = [
        (QualityTier::Excellent, &thresholds.excellent),
        (QualityTier::Good, &thresholds.good),
        (QualityTier::Fair, &thresholds.fair),
    ];
    tiers
        .iter()
        .find(|(_, limits)| limits.admits(packet_loss_percent, latency_ms, jitter_ms))
        .map(|(tier, _)| *tier)
        .unwrap_or(QualityTier::Poor)
}

/// One point-in-time measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub packet_loss_percent: f64,
    pub round_trip_latency_ms: f64,
    pub jitter_ms: f64,
    pub tier: QualityTier,
    pub sampled_at: DateTime<Utc>,
}

impl QualitySample {
    /// Derive a sample from inbound video and candidate pair statistics
    ///
    /// Missing sections count as zero.
    pub fn from_stats(stats: &TransportStats, thresholds: &QualityThresholds) -> Self {
        let (loss, jitter) = match &stats.inbound_video {
            Some(video) => {
                let total = video.packets_received + video.packets_lost;
                let loss = if total == 0 {
                    0.0
                } else {
                    video.packets_lost as f64 * 100.0 / total as f64
                };
                (loss, video.jitter_seconds * 1000.0)
            }
            None => (0.0, 0.0),
        };
        let latency = stats
            .candidate_pair
            .as_ref()
            .and_then(|pair| pair.current_round_trip_time_seconds)
            .map(|rtt| rtt * 1000.0)
            .unwrap_or(0.0);

        Self {
            packet_loss_percent: loss,
            round_trip_latency_ms: latency,
            jitter_ms: jitter,
            tier: classify(loss, latency, jitter, thresholds),
            sampled_at: Utc::now(),
        }
    }
}

/// Anything that can report transport statistics for the active link
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn stats(&self) -> Result<TransportStats, TransportError>;
}

/// Periodic sampler for one session
pub struct QualityMonitor {
    latest: Arc<RwLock<Option<QualitySample>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QualityMonitor {
    /// Start sampling; the first sample is taken one interval from now
    pub fn start(
        session_id: SessionId,
        source: Arc<dyn StatsSource>,
        config: &QualityConfig,
        emitter: Arc<EventEmitter>,
    ) -> Self {
        let latest = Arc::new(RwLock::new(None));
        let thresholds = config.thresholds.clone();
        let period = config.sample_interval();

        let task_latest = latest.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                match source.stats().await {
                    Ok(stats) => {
                        let sample = QualitySample::from_stats(&stats, &thresholds);
                        debug!(
                            "Quality for {}: {} (loss {:.2}%, rtt {:.0} ms, jitter {:.0} ms)",
                            session_id, sample.tier, sample.packet_loss_percent, sample.round_trip_latency_ms,
                            sample.jitter_ms
                        );
                        *task_latest.write() = Some(sample.clone());
                        emitter
                            .emit(ClassroomEvent::QualityChanged {
                                session_id: session_id.clone(),
                                sample,
                            })
                            .await;
                    }
                    Err(TransportError::Closed) => {
                        info!("Peer link for {} closed, quality sampling stopped", session_id);
                        break;
                    }
                    Err(e) => warn!("Quality sample failed for {}: {}", session_id, e),
                }
            }
        });

        Self {
            latest,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn latest(&self) -> Option<QualitySample> {
        self.latest.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Cancel sampling; returns `false` if already stopped
    pub fn stop(&self) -> bool {
        match self.task.lock().take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
