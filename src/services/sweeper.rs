use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    models::session::{CloseReason, Session},
    state::AppState,
};

/// Thresholds the sweeper applies to every open session.
#[derive(Clone, Copy, Debug)]
pub struct LivenessPolicy {
    pub sender_gone_after: Duration,
    pub receiver_gone_after: Duration,
    pub tombstone_retention: Duration,
}

impl LivenessPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sender_gone_after: to_chrono(config.sender_gone_after),
            receiver_gone_after: to_chrono(config.receiver_gone_after),
            tombstone_retention: to_chrono(config.tombstone_retention),
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or_else(|_| Duration::days(365 * 100))
}

/// Counts of what one sweeper pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub ttl: usize,
    pub sender_gone: usize,
    pub receiver_gone: usize,
    pub files_deleted: usize,
    pub purged: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Decides whether an open session must be closed, and why.
///
/// TTL is checked first, then the sender, then the receiver. A role that was
/// never seen is never considered gone.
pub fn liveness_verdict(
    session: &Session,
    now: DateTime<Utc>,
    policy: &LivenessPolicy,
) -> Option<CloseReason> {
    if session.is_expired(now) {
        return Some(CloseReason::Ttl);
    }
    if session
        .last_seen_sender
        .is_some_and(|seen| now - seen > policy.sender_gone_after)
    {
        return Some(CloseReason::SenderGone);
    }
    if session
        .last_seen_receiver
        .is_some_and(|seen| now - seen > policy.receiver_gone_after)
    {
        return Some(CloseReason::ReceiverGone);
    }
    None
}

/// Runs one pass: closes stale sessions, deletes their blobs, purges tombstones.
pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> SweepReport {
    let policy = LivenessPolicy::from_config(&state.config);

    let outcome = state
        .sessions
        .sweep(now, policy.tombstone_retention, |session| {
            liveness_verdict(session, now, &policy)
        })
        .await;

    let mut report = SweepReport::default();
    for (id, reason) in &outcome.closed {
        match reason {
            CloseReason::Ttl => report.ttl += 1,
            CloseReason::SenderGone => report.sender_gone += 1,
            CloseReason::ReceiverGone => report.receiver_gone += 1,
            CloseReason::Sender | CloseReason::Receiver => {}
        }
        tracing::info!("⏱️ Session {} closed by sweeper ({:?})", id, reason);
    }

    // Registry guard is released here; disk work never blocks requests.
    for file in &outcome.detached {
        state.blobs.delete(&file.storage_path).await;
        report.files_deleted += 1;
    }
    for id in &outcome.purged {
        state.blobs.remove_location(id).await;
        report.purged += 1;
    }

    report
}

/// Spawns the periodic sweeper. It stops when `shutdown` is cancelled.
pub fn spawn(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = state.config.sweep_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("✅ Sweeper started (every {}s)", period.as_secs());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("🧹 Sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = sweep_once(&state, Utc::now()).await;
                    if !report.is_empty() {
                        tracing::debug!("🧹 Sweep: {:?}", report);
                    }
                }
            }
        }
    })
}
