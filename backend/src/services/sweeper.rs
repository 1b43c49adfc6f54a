//! Periodic recovery of ghost sessions.
//!
//! Connections that vanish without a disconnect or teardown signal are retired
//! once their row has not been refreshed for the stale window. Every tick also
//! republishes the shared count so instances converge without local events.

use chrono::Duration;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::presence::PresenceService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: std::time::Duration,
    pub stale_after: Duration,
    pub purge_after: Option<Duration>,
}

impl SweepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.presence_sweep_interval(),
            stale_after: config.presence_stale_after(),
            purge_after: config.presence_purge_after(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub retired: u64,
    pub purged: u64,
    pub active_count: Option<i64>,
}

/// Runs one sweep pass: retire stale rows, purge old retired rows, republish.
pub async fn run_sweep(service: &PresenceService, settings: &SweepSettings) -> SweepOutcome {
    let retired = service.sweep_stale(settings.stale_after).await;
    let purged = match settings.purge_after {
        Some(retention) => service.purge_inactive(retention).await,
        None => 0,
    };
    let active_count = service.broadcast_active_count().await;
    SweepOutcome {
        retired,
        purged,
        active_count,
    }
}

pub fn spawn_presence_sweeper(service: PresenceService, settings: SweepSettings) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = settings.interval.as_secs(),
            stale_after_mins = settings.stale_after.num_minutes(),
            purge_after_days = settings.purge_after.map(|d| d.num_days()),
            "Presence sweeper started"
        );

        loop {
            interval.tick().await;
            let outcome = run_sweep(&service, &settings).await;
            tracing::debug!(
                retired = outcome.retired,
                purged = outcome.purged,
                active_count = outcome.active_count,
                "Presence sweep tick"
            );
        }
    })
}
