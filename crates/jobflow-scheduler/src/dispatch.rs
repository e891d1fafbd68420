//! Job dispatcher — startup recovery and the periodic sweep that feeds due
//! jobs from the store into the delay queue. In fast-path mode a slower
//! rescan catches jobs that other processes wrote to the shared store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobflow_core::Result;
use tokio::task::JoinHandle;

use crate::engine::JobScheduler;

/// Run once at startup, before anything is queued.
///
/// Clears running flags left behind by a crashed process. With the sweep
/// disabled this is also the only chance to reload persisted jobs, so every
/// live job is queued here. Returns the number of jobs queued.
pub fn recover(scheduler: &Arc<JobScheduler>) -> Result<usize> {
    let reset = scheduler.store().reset_running_flags()?;
    if reset > 0 {
        tracing::warn!("♻️ Reset {} job(s) left running by a previous process", reset);
    }
    if scheduler.config().dispatcher_enabled {
        return Ok(0);
    }
    let mut queued = 0;
    for job in scheduler.store().list()? {
        if job.abandoned {
            continue;
        }
        scheduler.enqueue(job.id, job.next_fire_at);
        queued += 1;
    }
    tracing::info!("📥 Queued {} persisted job(s) on startup", queued);
    Ok(queued)
}

/// Queue every idle job firing within the look-ahead window of `now`.
pub fn sweep(scheduler: &Arc<JobScheduler>, now: DateTime<Utc>) -> Result<usize> {
    let look_ahead = chrono::Duration::seconds(scheduler.config().look_ahead_secs as i64);
    let due = scheduler.store().find_due(now + look_ahead)?;
    for job in &due {
        scheduler.enqueue(job.id, job.next_fire_at);
    }
    Ok(due.len())
}

/// Queue every idle job that is already overdue.
///
/// In fast-path mode this process only learns about jobs it created itself,
/// so a job another process wrote shows up here once its time has passed.
/// Jobs this process already queued are claimed once, whichever entry fires
/// first.
pub fn rescan(scheduler: &Arc<JobScheduler>, now: DateTime<Utc>) -> Result<usize> {
    let due = scheduler.store().find_due(now)?;
    for job in &due {
        scheduler.enqueue(job.id, job.next_fire_at);
    }
    Ok(due.len())
}

type Pass = fn(&Arc<JobScheduler>, DateTime<Utc>) -> Result<usize>;

/// Spawn the sweep loop. It holds only a weak handle and exits once the
/// scheduler is dropped.
pub fn spawn_dispatcher(scheduler: &Arc<JobScheduler>) -> JoinHandle<()> {
    let weak = Arc::downgrade(scheduler);
    let initial = Duration::from_secs(scheduler.config().dispatcher_initial_delay_secs);
    let every = Duration::from_secs(scheduler.config().dispatcher_interval_secs.max(1));
    tokio::spawn(dispatch_loop(weak, "Sweep", sweep, initial, every))
}

/// Spawn the fast-path rescan loop, or nothing when it is turned off.
pub fn spawn_rescanner(scheduler: &Arc<JobScheduler>) -> Option<JoinHandle<()>> {
    let secs = scheduler.config().rescan_interval_secs;
    if secs == 0 {
        return None;
    }
    let weak = Arc::downgrade(scheduler);
    let every = Duration::from_secs(secs);
    Some(tokio::spawn(dispatch_loop(weak, "Rescan", rescan, every, every)))
}

async fn dispatch_loop(weak: Weak<JobScheduler>, label: &'static str, pass: Pass, initial: Duration, every: Duration) {
    tracing::info!(
        "⏰ {} started (first pass in {}s, then every {}s)",
        label,
        initial.as_secs(),
        every.as_secs()
    );
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + initial, every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(scheduler) = weak.upgrade() else {
            break;
        };
        match pass(&scheduler, Utc::now()) {
            Ok(0) => tracing::debug!("{} found no due jobs", label),
            Ok(n) => tracing::info!("📤 {} queued {} job(s)", label, n),
            Err(e) => tracing::warn!("⚠️ {} abandoned, retrying next interval: {e}", label),
        }
    }
    tracing::debug!("{} loop exiting", label);
}
