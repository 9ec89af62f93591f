use std::sync::Arc;
use std::time::Duration;

use outpost_proto::{AgentMessage, HeartbeatSnapshot};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::session::Outbound;
use crate::stats::{round2, StatsSampler};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically samples host load and pushes it to the server.
pub struct HeartbeatEmitter {
    outbound: Arc<Outbound>,
    sampler: Arc<dyn StatsSampler>,
    period: Duration,
}

impl HeartbeatEmitter {
    pub fn new(outbound: Arc<Outbound>, sampler: Arc<dyn StatsSampler>, period: Duration) -> Self {
        Self {
            outbound,
            sampler,
            period,
        }
    }

    /// Starts ticking on a background task. The first beat goes out one
    /// period after this call.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.beat().await;
            }
        })
    }

    async fn beat(&self) {
        let sampler = self.sampler.clone();
        let sample = match tokio::task::spawn_blocking(move || sampler.sample()).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(err)) => {
                warn!(error = %err, "stats sample failed");
                return;
            }
            Err(err) => {
                warn!(error = %err, "stats sampler task failed");
                return;
            }
        };

        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let message = AgentMessage::Heartbeat(HeartbeatSnapshot {
            cpu_usage: round2(sample.cpu_percent),
            memory_usage: round2(sample.memory_percent),
            timestamp,
        });
        if let Err(err) = self.outbound.send(&message).await {
            // Expected while the session engine is between connections.
            debug!(error = %err, "heartbeat not sent");
        }
    }
}
