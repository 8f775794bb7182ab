//! Declarative workflow construction.
//!
//! A build recipe receives a `WorkflowBuilder` and calls `run` once per
//! job, wiring dependencies through the returned handles. Ids are
//! assigned as `{kind}-{ordinal}` with a per-kind counter, so re-running
//! the same recipe with the same arguments yields the same ids, which is the
//! property the store relies on to overlay persisted job state after a
//! rebuild.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;
use crate::graph::Graph;
use crate::job::Job;
use crate::workflow::Workflow;

/// Reference to a declared job, usable as a dependency target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    id: String,
}

impl JobHandle {
    /// The underlying job id.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Per-job declaration: params, dependencies, and scheduling flags.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    params: Value,
    after: Vec<String>,
    before: Vec<String>,
    wait: Option<f64>,
    sync: bool,
}

impl JobSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opaque parameter payload handed to the handler at run time.
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// This job starts only after `handle` finishes.
    pub fn after(mut self, handle: &JobHandle) -> Self {
        self.after.push(handle.id.clone());
        self
    }

    /// This job starts only after every handle in the collection
    /// finishes.
    pub fn after_all<'a, I>(mut self, handles: I) -> Self
    where
        I: IntoIterator<Item = &'a JobHandle>,
    {
        self.after.extend(handles.into_iter().map(|h| h.id.clone()));
        self
    }

    /// `handle` starts only after this job finishes.
    pub fn before(mut self, handle: &JobHandle) -> Self {
        self.before.push(handle.id.clone());
        self
    }

    /// Every handle in the collection starts only after this job
    /// finishes.
    pub fn before_all<'a, I>(mut self, handles: I) -> Self
    where
        I: IntoIterator<Item = &'a JobHandle>,
    {
        self.before
            .extend(handles.into_iter().map(|h| h.id.clone()));
        self
    }

    /// Minimum delay in seconds after predecessors finish before the
    /// job is handed to the queue. A hint for the orchestrator, not a
    /// graph constraint.
    pub fn wait(mut self, seconds: f64) -> Self {
        self.wait = Some(seconds);
        self
    }

    /// Execute inline on the performing worker rather than through the
    /// external queue.
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// Accumulates jobs and edges while a recipe runs.
#[derive(Debug)]
pub struct WorkflowBuilder {
    kind: String,
    args: Value,
    jobs: Vec<Job>,
    graph: Graph,
    ordinals: HashMap<String, usize>,
}

impl WorkflowBuilder {
    /// Start building a workflow of `kind` with the given construction
    /// arguments.
    pub fn new(kind: impl Into<String>, args: Value) -> Self {
        Self {
            kind: kind.into(),
            args,
            jobs: Vec::new(),
            graph: Graph::new(),
            ordinals: HashMap::new(),
        }
    }

    /// Declare one job of `kind` and wire its dependencies.
    ///
    /// Returns a handle usable as a dependency target in later calls.
    /// Referencing a handle from a different builder fails with
    /// `DependencyNotFound`.
    pub fn run(&mut self, kind: &str, spec: JobSpec) -> Result<JobHandle> {
        let ordinal = self.ordinals.entry(kind.to_string()).or_insert(0);
        *ordinal += 1;
        let id = format!("{}-{}", kind, ordinal);

        self.graph.add_node(&id);

        let mut job = Job::new(&id, kind, spec.params);
        job.wait = spec.wait;
        job.sync = spec.sync;
        self.jobs.push(job);

        for dep in &spec.after {
            self.graph.connect(dep, &id)?;
        }
        for successor in &spec.before {
            self.graph.connect(&id, successor)?;
        }

        Ok(JobHandle { id })
    }

    /// The construction arguments this builder was created with.
    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Validate acyclicity, stamp edge lists onto the jobs, and yield
    /// the workflow.
    pub fn build(mut self) -> Result<Workflow> {
        self.graph.validate_acyclic()?;

        for job in &mut self.jobs {
            job.incoming = self
                .graph
                .incoming(&job.id)
                .into_iter()
                .map(String::from)
                .collect();
            job.outgoing = self
                .graph
                .outgoing(&job.id)
                .into_iter()
                .map(String::from)
                .collect();
        }

        Ok(Workflow {
            id: None,
            kind: self.kind,
            args: self.args,
            jobs: self.jobs,
            stopped: false,
            started_at: None,
            finished_at: None,
        })
    }
}
