//! Job records and their state machine.
//!
//! A job moves Pending -> Enqueued -> Running -> {Finished, Failed,
//! Skipped}. State is carried entirely in timestamps plus the skipped
//! flag, so the serialized record is also the full state machine
//! snapshot. The only backward transition is an explicit retry
//! (`enqueue` from Failed).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One schedulable unit of work inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Stable id, assigned once at build time. Distinguishes multiple
    /// instances of the same kind within one workflow.
    pub id: String,

    /// Kind tag mapping to a registered handler.
    pub kind: String,

    /// Opaque parameter payload handed to the handler.
    #[serde(default)]
    pub params: Value,

    /// Opaque result recorded on finish.
    #[serde(default)]
    pub output: Option<Value>,

    /// Ids of direct predecessors.
    #[serde(default)]
    pub incoming: Vec<String>,

    /// Ids of direct successors.
    #[serde(default)]
    pub outgoing: Vec<String>,

    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    /// Set when the work signalled skip instead of finishing normally.
    #[serde(default)]
    pub skipped: bool,

    /// Minimum delay in seconds after predecessors finish before this
    /// job should be handed to the queue. A scheduling hint consumed by
    /// the orchestrator, not enforced by the graph.
    #[serde(default)]
    pub wait: Option<f64>,

    /// Execute inline on the performing worker instead of going through
    /// the external queue. Same state machine and persistence apply.
    #[serde(default)]
    pub sync: bool,
}

impl Job {
    /// Create a Pending job.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params,
            output: None,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            failed_at: None,
            skipped: false,
            wait: None,
            sync: false,
        }
    }

    /// Transition to Enqueued, from Pending or Failed.
    ///
    /// Retrying a Failed job goes through here: all terminal state is
    /// cleared so the job runs again from a clean slate.
    pub fn enqueue(&mut self) {
        self.enqueued_at = Some(Utc::now());
        self.started_at = None;
        self.finished_at = None;
        self.failed_at = None;
        self.skipped = false;
        self.output = None;
    }

    /// Transition to Running, from Enqueued.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.enqueued_at = None;
        // A redelivered retry may still carry the previous attempt's
        // failure timestamp.
        self.failed_at = None;
    }

    /// Transition to Finished, from Running.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Transition to Failed, from Running.
    pub fn fail(&mut self) {
        self.finished_at = Some(Utc::now());
        self.failed_at = Some(Utc::now());
    }

    /// Transition to Skipped, from Running.
    ///
    /// Discards any output the aborted work attempted to record.
    pub fn skip(&mut self) {
        self.finished_at = Some(Utc::now());
        self.skipped = true;
        self.output = None;
    }

    /// Whether the job reached a terminal state.
    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Whether the job failed.
    pub fn failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Whether the job is currently running.
    pub fn running(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }

    /// Whether the job is waiting in the queue.
    pub fn enqueued(&self) -> bool {
        self.enqueued_at.is_some() && self.started_at.is_none()
    }

    /// Whether the job finished without failing. Skipped counts: a skip
    /// is a successful completion as far as downstream jobs are
    /// concerned.
    pub fn succeeded(&self) -> bool {
        self.finished() && !self.failed()
    }

    /// Whether the job itself is in a state from which `enqueue` is
    /// legal: Pending (never scheduled) or Failed (operator retry).
    /// Predecessor readiness is the workflow's concern, not the job's.
    pub fn startable(&self) -> bool {
        if self.failed() {
            return true;
        }
        self.enqueued_at.is_none() && self.started_at.is_none() && self.finished_at.is_none()
    }

    /// Human-readable state name, for logs and events.
    pub fn state(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.failed() {
            "failed"
        } else if self.finished() {
            "finished"
        } else if self.running() {
            "running"
        } else if self.enqueued() {
            "enqueued"
        } else {
            "pending"
        }
    }
}
