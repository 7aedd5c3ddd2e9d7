//! Scheduler delegation channel.
//!
//! Time-based triggers are handed to the scheduler service instead of being
//! kept as local timers, so schedules survive orchestrator restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::client::RpcClient;
use super::messages::EventMessage;
use crate::types::{Error, JobId, Result};

/// Fixed action vocabulary of the scheduler queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAction {
    AddJob,
    AddRepeatingJob,
    RescheduleJob,
    PauseJob,
    ResumeJob,
    RemoveJob,
    GetJobs,
    PauseScheduler,
    ResumeScheduler,
}

impl SchedulerAction {
    pub const ALL: [SchedulerAction; 9] = [
        SchedulerAction::AddJob,
        SchedulerAction::AddRepeatingJob,
        SchedulerAction::RescheduleJob,
        SchedulerAction::PauseJob,
        SchedulerAction::ResumeJob,
        SchedulerAction::RemoveJob,
        SchedulerAction::GetJobs,
        SchedulerAction::PauseScheduler,
        SchedulerAction::ResumeScheduler,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerAction::AddJob => "add_job",
            SchedulerAction::AddRepeatingJob => "add_repeating_job",
            SchedulerAction::RescheduleJob => "reschedule_job",
            SchedulerAction::PauseJob => "pause_job",
            SchedulerAction::ResumeJob => "resume_job",
            SchedulerAction::RemoveJob => "remove_job",
            SchedulerAction::GetJobs => "get_jobs",
            SchedulerAction::PauseScheduler => "pause_scheduler",
            SchedulerAction::ResumeScheduler => "resume_scheduler",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == raw)
    }
}

/// What to publish, where and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub run_at: DateTime<Utc>,
    /// Repeat period; `None` for one-shot jobs.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    pub queue: String,
    pub body: Value,
}

impl JobSpec {
    pub fn once(run_at: DateTime<Utc>, queue: impl Into<String>, body: Value) -> Self {
        Self {
            run_at,
            interval: None,
            queue: queue.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Enabled,
    Paused,
}

/// A job as held by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default)]
    pub state: JobState,
}

/// Typed client of the scheduler queue. Every action returns its value or
/// [`Error::Scheduler`] carrying the reported failure.
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    rpc: RpcClient,
    queue: String,
    timeout: Duration,
}

impl SchedulerClient {
    pub fn new(rpc: RpcClient, queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            rpc,
            queue: queue.into(),
            timeout,
        }
    }

    async fn request(&self, action: SchedulerAction, args: Value) -> Result<Value> {
        let event = EventMessage::new(action.as_str(), args);
        self.rpc
            .call_control(&self.queue, &event, self.timeout, |message| {
                Error::scheduler(format!("{}: {}", action.as_str(), message))
            })
            .await
    }

    fn job_id(result: Value) -> Result<JobId> {
        result
            .get("job_id")
            .and_then(Value::as_str)
            .map(|id| JobId::from_string(id.to_string()))
            .transpose()
            .map_err(Error::scheduler)?
            .ok_or_else(|| Error::scheduler("reply carries no job_id"))
    }

    pub async fn add_job(&self, spec: JobSpec) -> Result<JobId> {
        let result = self.request(SchedulerAction::AddJob, serde_json::to_value(&spec)?).await?;
        Self::job_id(result)
    }

    pub async fn add_repeating_job(&self, spec: JobSpec, interval: Duration) -> Result<JobId> {
        let spec = JobSpec {
            interval: Some(interval),
            ..spec
        };
        let result = self
            .request(SchedulerAction::AddRepeatingJob, serde_json::to_value(&spec)?)
            .await?;
        Self::job_id(result)
    }

    pub async fn reschedule_job(&self, job_id: &JobId, run_at: DateTime<Utc>) -> Result<()> {
        self.request(
            SchedulerAction::RescheduleJob,
            json!({"job_id": job_id, "run_at": run_at}),
        )
        .await
        .map(|_| ())
    }

    pub async fn pause_job(&self, job_id: &JobId) -> Result<()> {
        self.request(SchedulerAction::PauseJob, json!({"job_id": job_id}))
            .await
            .map(|_| ())
    }

    pub async fn resume_job(&self, job_id: &JobId) -> Result<()> {
        self.request(SchedulerAction::ResumeJob, json!({"job_id": job_id}))
            .await
            .map(|_| ())
    }

    pub async fn remove_job(&self, job_id: &JobId) -> Result<()> {
        self.request(SchedulerAction::RemoveJob, json!({"job_id": job_id}))
            .await
            .map(|_| ())
    }

    pub async fn get_jobs(&self) -> Result<Vec<Job>> {
        let result = self.request(SchedulerAction::GetJobs, json!({})).await?;
        serde_json::from_value(result).map_err(|e| Error::scheduler(format!("get_jobs: {}", e)))
    }

    pub async fn pause_scheduler(&self) -> Result<()> {
        self.request(SchedulerAction::PauseScheduler, json!({}))
            .await
            .map(|_| ())
    }

    pub async fn resume_scheduler(&self) -> Result<()> {
        self.request(SchedulerAction::ResumeScheduler, json!({}))
            .await
            .map(|_| ())
    }
}
