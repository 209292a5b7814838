//! The periodic reaper: expired, idle and failed environments every pass,
//! a forced reap of anything too old on every tenth pass, and an orphaned
//! storage sweep.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::manager::ManagerInner;
use crate::models::EphemeralStatus;

/// Every Nth pass also reaps by age regardless of state.
const FORCED_PASS_EVERY: u64 = 10;

#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub expired: u64,
    pub idle: u64,
    pub failed: u64,
    pub forced: u64,
    pub orphaned: u64,
    pub errors: u64,
}

pub(crate) fn spawn_scheduler(inner: Arc<ManagerInner>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut pass: u64 = 0;
        loop {
            ticker.tick().await;
            pass += 1;
            run_pass(&inner, pass).await;
        }
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ReapReason {
    Expired,
    Idle,
    Failed,
    Forced,
}

pub(crate) async fn run_pass(inner: &Arc<ManagerInner>, pass: u64) {
    let forced_pass = pass % FORCED_PASS_EVERY == 0;
    let mut victims = Vec::new();

    for (id, shared) in inner.snapshot().await {
        let env = shared.lock().await;
        let reason = if env.status == EphemeralStatus::Failed {
            Some(ReapReason::Failed)
        } else if env.is_expired() {
            Some(ReapReason::Expired)
        } else if env.is_active() && env.is_idle_expired() {
            Some(ReapReason::Idle)
        } else if forced_pass && env.age() > inner.config.force_cleanup_after {
            Some(ReapReason::Forced)
        } else {
            None
        };
        if let Some(reason) = reason {
            victims.push((id, reason));
        }
    }

    for (id, reason) in victims {
        info!("reaping {id}: {reason:?}");
        let outcome = inner.cleanup(&id, true).await;
        let mut stats = inner.cleanup_stats.lock().expect("cleanup stats poisoned");
        match outcome {
            Ok(()) => match reason {
                ReapReason::Expired => stats.expired += 1,
                ReapReason::Idle => stats.idle += 1,
                ReapReason::Failed => stats.failed += 1,
                ReapReason::Forced => stats.forced += 1,
            },
            Err(err) => {
                warn!("reap of {id} failed: {err}");
                stats.errors += 1;
            }
        }
    }

    // Storage directories nothing owns anymore.
    let live = inner.live_ids().await;
    let orphaned = inner.lifecycle.storage.cleanup_orphaned(&live).await;
    if orphaned > 0 {
        let mut stats = inner.cleanup_stats.lock().expect("cleanup stats poisoned");
        stats.orphaned += orphaned as u64;
    }
    debug!("cleanup pass {pass} complete");
}
