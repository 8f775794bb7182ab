//! Durable persistence and locking for workflows.
//!
//! The store owns three kinds of keys, all under one namespace:
//!
//! - `{ns}.workflows.{id}` - the workflow record: kind, construction
//!   arguments, stopped flag, timestamps. Structural metadata only,
//!   never job state.
//! - `{ns}.jobs.{id}.{kind}` - one hash per distinct job kind, mapping
//!   job id to the full serialized job. The same kind may run many
//!   times with different params inside one workflow, so state is
//!   grouped by kind for efficient scanning while the id field
//!   disambiguates instances.
//! - `{ns}.locks.{id}` - the per-workflow continuation lock token.
//!
//! Structure is never the unit of persisted mutation - only job state
//! is. Loading re-runs the recorded kind's build recipe with the
//! recorded arguments and overlays persisted job state onto the fresh
//! structure, matched by id.

mod backend;
mod redis;

pub use backend::{Backend, MemoryBackend};
pub use self::redis::RedisBackend;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::registry::Registry;
use crate::workflow::Workflow;

/// Attempts before giving up on finding a free workflow id.
const ID_ALLOCATION_ATTEMPTS: usize = 16;

/// Persisted workflow-level record.
///
/// Carries exactly what is needed to rebuild structure on load: the
/// kind names the recipe, the args parameterize it, and the remaining
/// fields are workflow-level state that is not derivable from jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: String,
    pub args: Value,
    pub stopped: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable workflow/job persistence over a key-value backend.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
    registry: Registry,
    namespace: String,
    ttl_seconds: Option<u64>,
    locking_duration: Duration,
    polling_interval: Duration,
}

impl Store {
    /// Create a store over the given backend.
    pub fn new(backend: Arc<dyn Backend>, registry: Registry, config: &Config) -> Self {
        Self {
            backend,
            registry,
            namespace: config.store.namespace.clone(),
            ttl_seconds: config.store.ttl_seconds,
            locking_duration: config.locking.duration(),
            polling_interval: config.locking.polling_interval(),
        }
    }

    fn workflow_key(&self, workflow_id: &str) -> String {
        format!("{}.workflows.{}", self.namespace, workflow_id)
    }

    fn jobs_key(&self, workflow_id: &str, kind: &str) -> String {
        format!("{}.jobs.{}.{}", self.namespace, workflow_id, kind)
    }

    fn jobs_pattern(&self, workflow_id: &str) -> String {
        format!("{}.jobs.{}.*", self.namespace, workflow_id)
    }

    fn lock_key(&self, workflow_id: &str) -> String {
        format!("{}.locks.{}", self.namespace, workflow_id)
    }

    /// Persist the workflow record and every per-kind job bucket.
    ///
    /// Assigns a workflow id on first persist. Applies the configured
    /// record TTL when one is set.
    pub async fn persist_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        self.persist_workflow_record(workflow).await?;
        let workflow_id = workflow.id.clone().unwrap_or_default();

        for job in &workflow.jobs {
            self.persist_job(&workflow_id, job).await?;
        }

        if let Some(ttl) = self.ttl_seconds {
            self.expire_workflow(&workflow_id, ttl).await?;
        }

        debug!(
            "Persisted workflow {} ({}, {} jobs)",
            workflow_id,
            workflow.kind,
            workflow.jobs.len()
        );
        Ok(())
    }

    /// Persist only the workflow-level record, leaving job buckets
    /// untouched.
    ///
    /// Workflow-level updates (stopped flag, timestamps) go through
    /// here so they cannot clobber job state a concurrent worker is
    /// persisting at the same moment.
    pub async fn persist_workflow_record(&self, workflow: &mut Workflow) -> Result<()> {
        if workflow.id.is_none() {
            workflow.id = Some(self.allocate_id().await?);
        }
        let workflow_id = workflow.id.clone().unwrap_or_default();

        let record = WorkflowRecord {
            id: workflow_id.clone(),
            kind: workflow.kind.clone(),
            args: workflow.args.clone(),
            stopped: workflow.stopped,
            started_at: workflow.started_at,
            finished_at: workflow.finished_at,
        };
        self.backend
            .set(
                &self.workflow_key(&workflow_id),
                &serde_json::to_string(&record)?,
            )
            .await?;
        Ok(())
    }

    /// Persist one job's state into its kind bucket.
    ///
    /// The per-completion fast path: job state is the only thing that
    /// mutates after the initial persist.
    pub async fn persist_job(&self, workflow_id: &str, job: &Job) -> Result<()> {
        self.backend
            .hset(
                &self.jobs_key(workflow_id, &job.kind),
                &job.id,
                &serde_json::to_string(job)?,
            )
            .await
    }

    /// Load a workflow: rebuild structure from its recipe, then overlay
    /// persisted job state.
    pub async fn find_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let raw = self
            .backend
            .get(&self.workflow_key(workflow_id))
            .await?
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        let record: WorkflowRecord = serde_json::from_str(&raw)?;

        let mut workflow = self
            .registry
            .build_workflow(&record.kind, record.args.clone())?;
        workflow.id = Some(record.id);
        workflow.stopped = record.stopped;
        workflow.started_at = record.started_at;
        workflow.finished_at = record.finished_at;

        let kinds: BTreeSet<String> =
            workflow.jobs.iter().map(|j| j.kind.clone()).collect();
        for kind in kinds {
            for (job_id, raw_job) in self
                .backend
                .hgetall(&self.jobs_key(workflow_id, &kind))
                .await?
            {
                let persisted: Job = serde_json::from_str(&raw_job)?;
                match workflow.job_mut(&job_id) {
                    Some(job) => *job = persisted,
                    None => warn!(
                        "Workflow {} has a persisted job '{}' its recipe no longer declares; \
                         ignoring (recipes must be deterministic in their arguments)",
                        workflow_id, job_id
                    ),
                }
            }
        }

        Ok(workflow)
    }

    /// Delete the workflow record and every job bucket belonging to it.
    pub async fn destroy_workflow(&self, workflow_id: &str) -> Result<()> {
        self.backend.del(&self.workflow_key(workflow_id)).await?;
        for key in self
            .backend
            .scan_match(&self.jobs_pattern(workflow_id))
            .await?
        {
            self.backend.del(&key).await?;
        }
        debug!("Destroyed workflow {}", workflow_id);
        Ok(())
    }

    /// Time-bound the workflow record and every job bucket.
    pub async fn expire_workflow(&self, workflow_id: &str, ttl_secs: u64) -> Result<()> {
        self.backend
            .expire(&self.workflow_key(workflow_id), ttl_secs)
            .await?;
        for key in self
            .backend
            .scan_match(&self.jobs_pattern(workflow_id))
            .await?
        {
            self.backend.expire(&key, ttl_secs).await?;
        }
        Ok(())
    }

    /// Allocate a workflow id no existing record uses.
    pub async fn allocate_id(&self) -> Result<String> {
        for _ in 0..ID_ALLOCATION_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            if !self.backend.exists(&self.workflow_key(&id)).await? {
                return Ok(id);
            }
        }
        Err(Error::Storage(format!(
            "No free workflow id after {} attempts",
            ID_ALLOCATION_ATTEMPTS
        )))
    }

    /// Run `critical` while holding the workflow's mutual-exclusion
    /// lock.
    ///
    /// Acquisition retries every polling interval, bounded by the
    /// locking duration; failure to acquire within the bound raises
    /// `LockTimeout`. The same duration is the lock's TTL, so a holder
    /// that dies without releasing cannot wedge future scheduling. The
    /// lock is released on every exit path, but only by its owner: a
    /// token compare guards against deleting a successor's lock after
    /// our own TTL already expired.
    pub async fn with_lock<T, F, Fut>(&self, workflow_id: &str, critical: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = self.lock_key(workflow_id);
        let token = Uuid::new_v4().to_string();
        let ttl_ms = self.locking_duration.as_millis().max(1) as u64;
        let deadline = tokio::time::Instant::now() + self.locking_duration;

        loop {
            if self.backend.set_nx_px(&key, &token, ttl_ms).await? {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::LockTimeout(workflow_id.to_string()));
            }
            tokio::time::sleep(self.polling_interval).await;
        }

        let result = critical().await;

        if let Err(err) = self.backend.del_if_eq(&key, &token).await {
            warn!(
                "Failed to release lock for workflow {}: {} (TTL will reclaim it)",
                workflow_id, err
            );
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Recipe;
    use crate::workflow::{JobSpec, WorkflowBuilder};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct EtlRecipe;

    impl Recipe for EtlRecipe {
        fn kind(&self) -> &str {
            "etl"
        }

        fn build(&self, builder: &mut WorkflowBuilder, args: &Value) -> Result<()> {
            let first = builder.run("fetch", JobSpec::new().params(json!({"shard": 1})))?;
            let second = builder.run("fetch", JobSpec::new().params(json!({"shard": 2})))?;
            builder.run(
                "load",
                JobSpec::new().params(args.clone()).after_all([&first, &second]),
            )?;
            Ok(())
        }
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_recipe(Arc::new(EtlRecipe));
        registry
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.store.namespace = "skein-test".to_string();
        config.locking.duration_seconds = 0.25;
        config.locking.polling_interval_seconds = 0.01;
        config
    }

    fn test_store() -> Store {
        Store::new(Arc::new(MemoryBackend::new()), test_registry(), &test_config())
    }

    async fn persisted_workflow(store: &Store) -> Workflow {
        let mut w = test_registry()
            .build_workflow("etl", json!({"table": "orders"}))
            .unwrap();
        store.persist_workflow(&mut w).await.unwrap();
        w
    }

    #[tokio::test]
    async fn test_persist_assigns_id_once() {
        let store = test_store();
        let mut w = test_registry().build_workflow("etl", Value::Null).unwrap();
        assert_eq!(w.id, None);

        store.persist_workflow(&mut w).await.unwrap();
        let id = w.id.clone().unwrap();

        store.persist_workflow(&mut w).await.unwrap();
        assert_eq!(w.id, Some(id));
    }

    #[tokio::test]
    async fn test_round_trip_preserves_jobs_and_state() {
        let store = test_store();
        let mut w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        {
            let job = w.job_mut("fetch-1").unwrap();
            job.enqueue();
            job.start();
            job.output = Some(json!({"rows": 10}));
            job.finish();
        }
        w.started_at = Some(Utc::now());
        store.persist_workflow(&mut w).await.unwrap();

        let found = store.find_workflow(&id).await.unwrap();
        assert_eq!(found.id, w.id);
        assert_eq!(found.kind, "etl");
        assert_eq!(found.args, w.args);
        assert_eq!(found.started_at, w.started_at);
        assert_eq!(found.jobs.len(), w.jobs.len());

        for (expected, actual) in w.jobs.iter().zip(found.jobs.iter()) {
            assert_eq!(expected.id, actual.id);
            assert_eq!(expected.kind, actual.kind);
            assert_eq!(expected.params, actual.params);
            assert_eq!(expected.output, actual.output);
            assert_eq!(expected.enqueued_at, actual.enqueued_at);
            assert_eq!(expected.started_at, actual.started_at);
            assert_eq!(expected.finished_at, actual.finished_at);
            assert_eq!(expected.failed_at, actual.failed_at);
            assert_eq!(expected.incoming, actual.incoming);
            assert_eq!(expected.outgoing, actual.outgoing);
        }
        assert!(found.job("fetch-1").unwrap().finished());
    }

    #[tokio::test]
    async fn test_find_missing_workflow() {
        let store = test_store();
        let err = store.find_workflow("ghost").await.unwrap_err();
        assert!(matches!(err, Error::WorkflowNotFound(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_persist_job_is_a_targeted_update() {
        let store = test_store();
        let mut w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        let job = w.job_mut("load-1").unwrap();
        job.enqueue();
        store.persist_job(&id, job).await.unwrap();

        let found = store.find_workflow(&id).await.unwrap();
        assert!(found.job("load-1").unwrap().enqueued());
        assert_eq!(found.job("fetch-1").unwrap().state(), "pending");
    }

    #[tokio::test]
    async fn test_persist_workflow_record_leaves_job_state_alone() {
        let store = test_store();
        let mut w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        // a concurrent worker finishes a job between our load and save
        {
            let mut other = store.find_workflow(&id).await.unwrap();
            let job = other.job_mut("fetch-1").unwrap();
            job.enqueue();
            job.start();
            job.finish();
            store.persist_job(&id, job).await.unwrap();
        }

        // our stale copy still has fetch-1 pending; a record-only
        // persist must not roll the job back
        w.mark_as_stopped();
        store.persist_workflow_record(&mut w).await.unwrap();

        let found = store.find_workflow(&id).await.unwrap();
        assert!(found.stopped);
        assert!(found.job("fetch-1").unwrap().finished());
    }

    #[tokio::test]
    async fn test_destroy_removes_record_and_buckets() {
        let store = test_store();
        let w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        store.destroy_workflow(&id).await.unwrap();
        assert!(matches!(
            store.find_workflow(&id).await,
            Err(Error::WorkflowNotFound(_))
        ));
        let leftovers = store
            .backend
            .scan_match(&store.jobs_pattern(&id))
            .await
            .unwrap();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_expire_workflow_time_bounds_all_keys() {
        let store = test_store();
        let w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        store.expire_workflow(&id, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            store.find_workflow(&id).await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_allocate_id_yields_unused_ids() {
        let store = test_store();
        let first = store.allocate_id().await.unwrap();
        let second = store.allocate_id().await.unwrap();
        assert_ne!(first, second);
        assert!(!store
            .backend
            .exists(&store.workflow_key(&first))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_orphan_job_record_is_ignored() {
        let store = test_store();
        let w = persisted_workflow(&store).await;
        let id = w.id.clone().unwrap();

        // a record the recipe no longer declares
        let orphan = Job::new("fetch-9", "fetch", Value::Null);
        store
            .backend
            .hset(
                &store.jobs_key(&id, "fetch"),
                "fetch-9",
                &serde_json::to_string(&orphan).unwrap(),
            )
            .await
            .unwrap();

        let found = store.find_workflow(&id).await.unwrap();
        assert_eq!(found.jobs.len(), 3);
        assert!(found.job("fetch-9").is_none());
    }

    #[tokio::test]
    async fn test_with_lock_runs_critical_section() {
        let store = test_store();
        let value = store
            .with_lock("w1", || async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_with_lock_times_out_when_held_elsewhere() {
        let store = test_store();
        store
            .backend
            .set_nx_px(&store.lock_key("w1"), "someone-else", 60_000)
            .await
            .unwrap();

        let err = store
            .with_lock("w1", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(ref id) if id == "w1"));
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_both_exit_paths() {
        let store = test_store();

        let failure: Result<()> = store
            .with_lock("w1", || async { Err(Error::Execution("boom".into())) })
            .await;
        assert!(matches!(failure, Err(Error::Execution(_))));

        // released despite the error: a fresh acquisition succeeds
        store.with_lock("w1", || async { Ok(()) }).await.unwrap();
        store.with_lock("w1", || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_is_mutually_exclusive() {
        let store = test_store();
        let in_section = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let in_section = in_section.clone();
            let entries = entries.clone();
            handles.push(tokio::spawn(async move {
                store
                    .with_lock("w1", || async {
                        assert!(!in_section.swap(true, Ordering::SeqCst));
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_section.store(false, Ordering::SeqCst);
                        entries.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 4);
    }
}
