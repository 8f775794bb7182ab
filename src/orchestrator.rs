//! Job execution and continuation scheduling.
//!
//! `perform` is the entry point the external worker pool calls for each
//! delivered job: it runs the job's handler, persists the resulting
//! state, and then drives the continuation step - the lock-guarded
//! recomputation of the ready set that enqueues each newly-eligible
//! job exactly once no matter how many workers complete siblings
//! simultaneously.
//!
//! The orchestrator is purely reactive: each call runs to completion on
//! one worker, with no internal suspension besides the bounded
//! poll-wait inside the store's lock acquisition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, JobEvent};
use crate::registry::{JobContext, Outcome, Registry};
use crate::store::Store;
use crate::workflow::Workflow;

/// The external worker pool's enqueue contract.
///
/// No ordering or exactly-once delivery is assumed from the queue:
/// `perform` checks the job's persisted state on entry, so a duplicate
/// delivery is harmless.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Schedule a future `perform(workflow_id, job_id)` call, after
    /// `delay` if one is given.
    async fn enqueue(
        &self,
        kind: &str,
        workflow_id: &str,
        job_id: &str,
        delay: Option<Duration>,
    ) -> Result<()>;
}

/// Executes jobs and drives workflow scheduling.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    registry: Registry,
    queue: Arc<dyn Queue>,
    events: Option<EventBus>,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(store: Store, registry: Registry, queue: Arc<dyn Queue>) -> Self {
        Self {
            store,
            registry,
            queue,
            events: None,
        }
    }

    /// Attach an event bus for job lifecycle telemetry.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Build a workflow from its registered recipe and persist it.
    pub async fn create_workflow(&self, kind: &str, args: Value) -> Result<Workflow> {
        let mut workflow = self.registry.build_workflow(kind, args)?;
        self.store.persist_workflow(&mut workflow).await?;
        info!(
            "Created workflow {} ({}, {} jobs)",
            workflow.id.as_deref().unwrap_or("?"),
            kind,
            workflow.jobs.len()
        );
        Ok(workflow)
    }

    /// Start (or resume) scheduling: clear the stopped flag and
    /// dispatch the current ready set.
    ///
    /// On a fresh workflow the ready set is exactly the jobs with no
    /// incoming edges; on a stopped one it is whatever became eligible
    /// while scheduling was paused, so resumption continues from where
    /// things stood rather than from the beginning.
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<()> {
        let sync_batch = self
            .store
            .with_lock(workflow_id, || async move {
                let mut workflow = self.store.find_workflow(workflow_id).await?;
                workflow.mark_as_started();
                if workflow.started_at.is_none() {
                    workflow.started_at = Some(Utc::now());
                }
                self.store.persist_workflow_record(&mut workflow).await?;
                info!("Workflow {} started", workflow_id);
                self.dispatch_ready(&mut workflow).await
            })
            .await?;

        self.perform_inline(workflow_id, sync_batch).await
    }

    /// Alias for `start_workflow` on a previously stopped workflow.
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        self.start_workflow(workflow_id).await
    }

    /// Pause scheduling. In-flight jobs run to completion but the
    /// continuation step enqueues nothing further until the workflow is
    /// started again.
    pub async fn stop_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut workflow = self.store.find_workflow(workflow_id).await?;
        workflow.mark_as_stopped();
        self.store.persist_workflow_record(&mut workflow).await?;
        info!("Workflow {} stopped", workflow_id);
        Ok(())
    }

    /// Re-enqueue a Failed job. The core performs no automatic retry;
    /// this is the operator's lever.
    pub async fn retry_job(&self, workflow_id: &str, job_id: &str) -> Result<()> {
        let mut workflow = self.store.find_workflow(workflow_id).await?;
        let Some(job) = workflow.job_mut(job_id) else {
            return Err(Error::JobNotFound {
                workflow_id: workflow_id.to_string(),
                job_id: job_id.to_string(),
            });
        };
        if !job.failed() {
            return Err(Error::Validation(format!(
                "Job '{}' is not failed (state: {})",
                job_id,
                job.state()
            )));
        }

        job.enqueue();
        let kind = job.kind.clone();
        let sync = job.sync;
        self.store.persist_job(workflow_id, job).await?;
        info!("Retrying job {} [{}] in workflow {}", job_id, kind, workflow_id);

        if sync {
            self.perform_inline(workflow_id, vec![job_id.to_string()])
                .await
        } else {
            self.queue.enqueue(&kind, workflow_id, job_id, None).await
        }
    }

    /// Delete the workflow and all of its job state.
    pub async fn destroy_workflow(&self, workflow_id: &str) -> Result<()> {
        self.store.destroy_workflow(workflow_id).await
    }

    /// Time-bound the workflow and all of its job state.
    pub async fn expire_workflow(&self, workflow_id: &str, ttl_secs: u64) -> Result<()> {
        self.store.expire_workflow(workflow_id, ttl_secs).await
    }

    /// Execute one delivered job, then drive the continuation step.
    ///
    /// Handler failures are absorbed here: they mark the job Failed and
    /// never crash the worker. Errors that do propagate (store
    /// unreachable, unknown workflow) are the queue's to retry.
    pub async fn perform(&self, workflow_id: &str, job_id: &str) -> Result<()> {
        let mut workflow = self.store.find_workflow(workflow_id).await?;
        let Some(job) = workflow.job_mut(job_id) else {
            return Err(Error::JobNotFound {
                workflow_id: workflow_id.to_string(),
                job_id: job_id.to_string(),
            });
        };

        // Accept Enqueued deliveries and redeliveries of a Running job
        // whose worker died; anything else is a duplicate of an attempt
        // that already reached a terminal state.
        if !(job.enqueued() || job.running()) {
            debug!(
                "Ignoring delivery of job {} in workflow {} (state: {})",
                job_id,
                workflow_id,
                job.state()
            );
            return Ok(());
        }

        let kind = job.kind.clone();
        let handler = self.registry.handler(&kind)?;

        info!("Starting job {} [{}] in workflow {}", job_id, kind, workflow_id);
        self.emit(JobEvent::started(workflow_id, job_id, &kind));
        job.start();
        self.store.persist_job(workflow_id, job).await?;

        let ctx = JobContext {
            workflow_id: workflow_id.to_string(),
            job_id: job_id.to_string(),
            params: job.params.clone(),
        };
        let clock = Instant::now();
        let outcome = handler.perform(&ctx).await;
        let duration_ms = clock.elapsed().as_millis() as u64;

        match outcome {
            Ok(Outcome::Complete(output)) => {
                job.finish();
                job.output = Some(output);
                self.store.persist_job(workflow_id, job).await?;
                info!("Job {} finished in {}ms", job_id, duration_ms);
                self.emit(JobEvent::finished(workflow_id, job_id, &kind, duration_ms));
            }
            Ok(Outcome::Skip) => {
                job.skip();
                self.store.persist_job(workflow_id, job).await?;
                info!("Job {} skipped after {}ms", job_id, duration_ms);
                self.emit(JobEvent::finished(workflow_id, job_id, &kind, duration_ms));
            }
            Err(err) => {
                warn!("Job {} [{}] failed: {}", job_id, kind, err);
                job.fail();
                self.store.persist_job(workflow_id, job).await?;
                self.emit(JobEvent::failed(
                    workflow_id,
                    job_id,
                    &kind,
                    duration_ms,
                    &err.to_string(),
                ));
            }
        }

        self.enqueue_outgoing_jobs(workflow_id).await
    }

    /// The continuation step: under the per-workflow lock, recompute
    /// the ready set against fresh state and enqueue each newly-ready
    /// job.
    ///
    /// Only state observed under the lock drives scheduling, so two
    /// workers completing siblings that share a dependent cannot both
    /// enqueue it: whichever continuation runs second sees the job
    /// already Enqueued and leaves it alone. A lock timeout drops this
    /// attempt; every completion independently re-attempts, so one of
    /// the concurrent completers makes the progress this one did not.
    async fn enqueue_outgoing_jobs(&self, workflow_id: &str) -> Result<()> {
        // Fresh read to observe sibling updates from concurrent workers.
        let workflow = self.store.find_workflow(workflow_id).await?;
        if workflow.stopped {
            debug!(
                "Workflow {} is stopped; leaving scheduling to a later start",
                workflow_id
            );
            return Ok(());
        }

        let locked = self
            .store
            .with_lock(workflow_id, || async move {
                let mut workflow = self.store.find_workflow(workflow_id).await?;
                if workflow.stopped {
                    return Ok(Vec::new());
                }
                let sync_batch = self.dispatch_ready(&mut workflow).await?;
                if workflow.finished() && workflow.finished_at.is_none() {
                    workflow.finished_at = Some(Utc::now());
                    self.store.persist_workflow_record(&mut workflow).await?;
                    info!("Workflow {} finished", workflow_id);
                }
                Ok(sync_batch)
            })
            .await;

        let sync_batch = match locked {
            Ok(batch) => batch,
            Err(err) if err.is_recoverable() => {
                debug!(
                    "Continuation for workflow {} dropped: {} (a sibling completion retries)",
                    workflow_id, err
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.perform_inline(workflow_id, sync_batch).await
    }

    /// Mark every ready job Enqueued, persist it, and hand it to the
    /// queue. Sync-flagged jobs are returned instead so the caller can
    /// run them inline after the lock is released.
    async fn dispatch_ready(&self, workflow: &mut Workflow) -> Result<Vec<String>> {
        let workflow_id = workflow
            .id
            .clone()
            .ok_or_else(|| Error::Internal("Dispatch on an unpersisted workflow".to_string()))?;

        let mut sync_batch = Vec::new();
        for job_id in workflow.next_ready() {
            let Some(job) = workflow.job_mut(&job_id) else {
                continue;
            };
            job.enqueue();
            self.store.persist_job(&workflow_id, job).await?;

            if job.sync {
                sync_batch.push(job_id);
            } else {
                let delay = job.wait.map(Duration::from_secs_f64);
                self.queue
                    .enqueue(&job.kind, &workflow_id, &job_id, delay)
                    .await?;
                debug!("Enqueued job {} [{}]", job_id, job.kind);
            }
        }
        Ok(sync_batch)
    }

    /// Perform sync-flagged jobs on the calling worker, in order.
    async fn perform_inline(&self, workflow_id: &str, job_ids: Vec<String>) -> Result<()> {
        for job_id in job_ids {
            debug!("Performing job {} inline", job_id);
            Box::pin(self.perform(workflow_id, &job_id)).await?;
        }
        Ok(())
    }
}
