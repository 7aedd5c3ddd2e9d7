//! Job book and its JSON persistence.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

use crate::rpc::Job;
use crate::types::{Error, JobId, Result};

/// Jobs plus their timer tasks. Lives behind the scheduler's mutex.
#[derive(Debug, Default)]
pub(super) struct JobBook {
    pub jobs: HashMap<JobId, Job>,
    pub timers: HashMap<JobId, JoinHandle<()>>,
    /// Scheduler-wide pause: timers that come due are held here.
    pub paused: bool,
    pub held: HashSet<JobId>,
    pub file: Option<PathBuf>,
}

impl JobBook {
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            file,
            ..Default::default()
        }
    }

    pub fn get_mut(&mut self, id: &JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("job {}", id)))
    }

    /// Abort the timer of `id`, if any.
    pub fn disarm(&mut self, id: &JobId) {
        if let Some(timer) = self.timers.remove(id) {
            timer.abort();
        }
        self.held.remove(id);
    }

    pub fn sorted(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.spec.run_at.cmp(&b.spec.run_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Write every job to the jobs file, if configured.
    pub async fn persist(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let raw = serde_json::to_vec_pretty(&self.sorted())?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Read persisted jobs. A missing file is an empty book.
pub(super) async fn load(path: &Path) -> Result<Vec<Job>> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
            Error::validation(format!("invalid jobs file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// First occurrence of a repeating job strictly after `now`.
pub(super) fn next_after(
    run_at: DateTime<Utc>,
    interval: std::time::Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let Ok(step) = chrono::Duration::from_std(interval) else {
        return now;
    };
    if step <= chrono::Duration::zero() {
        return now;
    }
    if run_at > now {
        return run_at;
    }
    let behind = (now - run_at).num_milliseconds();
    let periods = behind / step.num_milliseconds().max(1) + 1;
    run_at + step * i32::try_from(periods).unwrap_or(i32::MAX)
}
