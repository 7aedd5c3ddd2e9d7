//! Time-based scheduler service.
//!
//! Consumes the scheduler control queue and publishes each job's body to
//! its target queue when the job comes due. One tokio timer per enabled job;
//! pausing the scheduler holds due jobs until resume, where each fires once.
//! With a jobs file configured the book survives restarts and overdue jobs
//! fire once on recovery.

mod jobs;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerHandle, Message};
use crate::rpc::{ControlReply, EventMessage, Job, JobSpec, JobState, Outbox, SchedulerAction};
use crate::types::{Error, JobId, Result, SchedulerConfig};
use jobs::JobBook;

/// Scheduler core. Clones share the same book.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    outbox: Outbox,
    book: Mutex<JobBook>,
}

impl Scheduler {
    pub fn new(outbox: Outbox, config: &SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                outbox,
                book: Mutex::new(JobBook::new(config.jobs_file.clone())),
            }),
        }
    }

    /// Load persisted jobs and arm the enabled ones.
    pub async fn recover(&self) -> Result<usize> {
        let mut book = self.inner.book.lock().await;
        let Some(path) = book.file.clone() else {
            return Ok(0);
        };
        let loaded = jobs::load(&path).await?;
        let count = loaded.len();
        for job in loaded {
            let id = job.id.clone();
            let enabled = job.state == JobState::Enabled;
            book.jobs.insert(id.clone(), job);
            if enabled {
                arm(&self.inner, &mut book, &id);
            }
        }
        tracing::info!(jobs = count, path = %path.display(), "scheduler jobs recovered");
        Ok(count)
    }

    pub async fn add_job(&self, spec: JobSpec) -> Result<JobId> {
        let id = JobId::new();
        let mut book = self.inner.book.lock().await;
        book.jobs.insert(
            id.clone(),
            Job {
                id: id.clone(),
                spec,
                state: JobState::Enabled,
            },
        );
        arm(&self.inner, &mut book, &id);
        book.persist().await?;
        tracing::info!(job_id = %id, "job added");
        Ok(id)
    }

    pub async fn add_repeating_job(&self, spec: JobSpec) -> Result<JobId> {
        match spec.interval {
            Some(interval) if !interval.is_zero() => self.add_job(spec).await,
            _ => Err(Error::validation("repeating job requires a non-zero interval")),
        }
    }

    pub async fn reschedule_job(&self, id: &JobId, run_at: DateTime<Utc>) -> Result<()> {
        let mut book = self.inner.book.lock().await;
        let job = book.get_mut(id)?;
        job.spec.run_at = run_at;
        let enabled = job.state == JobState::Enabled;
        book.disarm(id);
        if enabled {
            arm(&self.inner, &mut book, id);
        }
        book.persist().await
    }

    pub async fn pause_job(&self, id: &JobId) -> Result<()> {
        let mut book = self.inner.book.lock().await;
        book.get_mut(id)?.state = JobState::Paused;
        book.disarm(id);
        book.persist().await
    }

    pub async fn resume_job(&self, id: &JobId) -> Result<()> {
        let mut book = self.inner.book.lock().await;
        let job = book.get_mut(id)?;
        if job.state == JobState::Enabled {
            return Ok(());
        }
        job.state = JobState::Enabled;
        arm(&self.inner, &mut book, id);
        book.persist().await
    }

    pub async fn remove_job(&self, id: &JobId) -> Result<()> {
        let mut book = self.inner.book.lock().await;
        book.disarm(id);
        book.jobs
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;
        book.persist().await
    }

    pub async fn get_jobs(&self) -> Vec<Job> {
        self.inner.book.lock().await.sorted()
    }

    pub async fn pause_scheduler(&self) {
        self.inner.book.lock().await.paused = true;
        tracing::info!("scheduler paused");
    }

    /// Resume and fire every job that came due while paused, once.
    pub async fn resume_scheduler(&self) {
        let held: Vec<JobId> = {
            let mut book = self.inner.book.lock().await;
            book.paused = false;
            book.held.drain().collect()
        };
        tracing::info!(held = held.len(), "scheduler resumed");
        for id in held {
            fire(Arc::clone(&self.inner), id).await;
        }
    }

    /// Execute one control action.
    pub async fn handle(&self, event: &EventMessage) -> Result<Value> {
        let action = SchedulerAction::parse(&event.event_type)
            .ok_or_else(|| Error::validation(format!("unknown scheduler action '{}'", event.event_type)))?;
        match action {
            SchedulerAction::AddJob => {
                let id = self.add_job(event.payload()?).await?;
                Ok(json!({"job_id": id}))
            }
            SchedulerAction::AddRepeatingJob => {
                let id = self.add_repeating_job(event.payload()?).await?;
                Ok(json!({"job_id": id}))
            }
            SchedulerAction::RescheduleJob => {
                let args: RescheduleArgs = event.payload()?;
                self.reschedule_job(&args.job_id, args.run_at).await?;
                Ok(Value::Null)
            }
            SchedulerAction::PauseJob => {
                self.pause_job(&event.payload::<JobArgs>()?.job_id).await?;
                Ok(Value::Null)
            }
            SchedulerAction::ResumeJob => {
                self.resume_job(&event.payload::<JobArgs>()?.job_id).await?;
                Ok(Value::Null)
            }
            SchedulerAction::RemoveJob => {
                self.remove_job(&event.payload::<JobArgs>()?.job_id).await?;
                Ok(Value::Null)
            }
            SchedulerAction::GetJobs => Ok(serde_json::to_value(self.get_jobs().await)?),
            SchedulerAction::PauseScheduler => {
                self.pause_scheduler().await;
                Ok(Value::Null)
            }
            SchedulerAction::ResumeScheduler => {
                self.resume_scheduler().await;
                Ok(Value::Null)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobArgs {
    job_id: JobId,
}

#[derive(Debug, Deserialize)]
struct RescheduleArgs {
    job_id: JobId,
    run_at: DateTime<Utc>,
}

/// Spawn the timer task of `id`, replacing any previous one.
fn arm(inner: &Arc<Inner>, book: &mut JobBook, id: &JobId) {
    let Some(job) = book.jobs.get(id) else {
        return;
    };
    let delay = (job.spec.run_at - Utc::now()).to_std().unwrap_or_default();
    let task_inner = Arc::clone(inner);
    let task_id = id.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire(task_inner, task_id).await;
    });
    if let Some(previous) = book.timers.insert(id.clone(), handle) {
        previous.abort();
    }
}

async fn fire(inner: Arc<Inner>, id: JobId) {
    let (queue, body) = {
        let mut book = inner.book.lock().await;
        if book.paused {
            book.held.insert(id);
            return;
        }
        // Our own handle: drop it without aborting.
        book.timers.remove(&id);
        let Some(job) = book.jobs.get_mut(&id) else {
            return;
        };
        if job.state != JobState::Enabled {
            return;
        }
        let fired = (job.spec.queue.clone(), job.spec.body.clone());
        match job.spec.interval {
            Some(interval) => {
                job.spec.run_at = jobs::next_after(job.spec.run_at, interval, Utc::now());
                arm(&inner, &mut book, &id);
            }
            None => {
                book.jobs.remove(&id);
            }
        }
        if let Err(e) = book.persist().await {
            tracing::error!(job_id = %id, error = %e, "failed to persist jobs");
        }
        fired
    };

    tracing::info!(job_id = %id, queue = %queue, "job fired");
    if let Err(e) = inner.outbox.publish(&queue, Message::new(body)).await {
        tracing::error!(job_id = %id, queue = %queue, error = %e, "job publish failed");
    }
}

/// Scheduler bound to its control queue.
#[derive(Debug)]
pub struct SchedulerService {
    scheduler: Scheduler,
    broker: BrokerHandle,
    queue: String,
    cancel: CancellationToken,
}

impl SchedulerService {
    pub fn new(broker: BrokerHandle, outbox: Outbox, config: &SchedulerConfig) -> Self {
        Self {
            scheduler: Scheduler::new(outbox, config),
            broker,
            queue: config.queue.clone(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Recover persisted jobs, then serve the control queue until cancelled.
    pub async fn run(&self) -> Result<()> {
        self.scheduler.recover().await?;
        self.broker.declare_queue(&self.queue).await?;
        let mut consumer = self.broker.consume(&self.queue).await?;
        tracing::info!(queue = %self.queue, "scheduler service started");

        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break,
                message = consumer.next() => match message {
                    Some(message) => message,
                    None => {
                        tracing::warn!(queue = %self.queue, "scheduler queue closed");
                        break;
                    }
                },
            };
            self.respond(message).await;
        }
        Ok(())
    }

    async fn respond(&self, message: Message) {
        let outcome = match EventMessage::from_body(&message.body) {
            Ok(event) => self.scheduler.handle(&event).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!(error = %e, "scheduler action failed");
        }

        let (Some(reply_to), Some(correlation_id)) = (message.reply_to, message.correlation_id) else {
            return;
        };
        let body = match serde_json::to_value(ControlReply::from_outcome(outcome)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode scheduler reply");
                return;
            }
        };
        let reply = Message::new(body).with_correlation(correlation_id);
        if let Err(e) = self.broker.publish(&reply_to, reply).await {
            tracing::warn!(reply_to = %reply_to, error = %e, "scheduler reply not delivered");
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
