//! Per-environment resource sampling: cgroup counters plus storage-root
//! disk usage, with bounded history and peak tracking.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use jiff::Timestamp;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cgroups::CgroupHandle;
use crate::manager::ManagerInner;
use crate::models::ResourceUsage;

/// Samples retained per environment.
const HISTORY_LIMIT: usize = 120;

pub(crate) fn spawn_monitor(inner: Arc<ManagerInner>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.monitoring_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sample_all(&inner).await;
        }
    })
}

pub(crate) async fn sample_all(inner: &Arc<ManagerInner>) {
    for (id, shared) in inner.snapshot().await {
        let (cgroup_path, storage_path, memory_limit) = {
            let env = shared.lock().await;
            if !env.is_active() {
                continue;
            }
            (
                env.cgroup_path.clone(),
                env.storage_path.clone(),
                env.limits.max_memory_mb,
            )
        };

        let stats = cgroup_path.map(|path| {
            inner
                .lifecycle
                .cgroups
                .stats(&CgroupHandle { path })
        });
        let disk_mb = match storage_path {
            Some(path) => directory_size_mb(path).await,
            None => 0.0,
        };

        let usage = ResourceUsage {
            memory_mb: stats
                .as_ref()
                .map(|stats| stats.memory_current as f64 / (1024.0 * 1024.0))
                .unwrap_or(0.0),
            disk_mb,
            cpu_usage_usec: stats.as_ref().map(|stats| stats.cpu_usage_usec).unwrap_or(0),
            active_pids: stats.as_ref().map(|stats| stats.pids_current).unwrap_or(0),
            sampled_at: Timestamp::now(),
        };

        if let Some(limit) = memory_limit {
            if usage.memory_mb > limit as f64 {
                warn!(
                    "environment {id} is over its memory limit: {:.1} MB > {limit} MB",
                    usage.memory_mb
                );
            }
        }

        {
            let mut env = shared.lock().await;
            if usage.memory_mb > env.peak_memory_mb {
                env.peak_memory_mb = usage.memory_mb;
            }
            if usage.disk_mb > env.peak_disk_mb {
                env.peak_disk_mb = usage.disk_mb;
            }
        }

        let mut history = inner.history.lock().expect("history lock poisoned");
        let entries = history.entry(id).or_insert_with(VecDeque::new);
        entries.push_back(usage);
        while entries.len() > HISTORY_LIMIT {
            entries.pop_front();
        }
    }
    debug!("monitoring sample complete");
}

async fn directory_size_mb(path: PathBuf) -> f64 {
    let bytes = tokio::task::spawn_blocking(move || {
        WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|metadata| metadata.len())
            .sum::<u64>()
    })
    .await
    .unwrap_or(0);
    bytes as f64 / (1024.0 * 1024.0)
}
