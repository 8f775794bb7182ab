//! Kind registry - maps kind identifiers to handlers and recipes.
//!
//! Kinds are resolved through a static registry populated at process
//! start; an unknown kind fails with `UnknownKind` instead of any
//! dynamic symbol lookup. The registry is plain data - skein carries no
//! global mutable state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::workflow::{Workflow, WorkflowBuilder};

/// Result of a handler invocation.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The work finished normally, recording an output.
    Complete(Value),
    /// The work chose not to run to completion; any output is
    /// discarded and downstream jobs are unblocked as if it finished.
    Skip,
}

/// Context handed to a handler for one job execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub workflow_id: String,
    pub job_id: String,
    /// Opaque parameter payload from the job declaration.
    pub params: Value,
}

/// Work function for a job kind.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The kind identifier this handler serves (e.g. "fetch").
    fn kind(&self) -> &str;

    /// Execute the work.
    ///
    /// Returning `Err` marks the job Failed; the error is absorbed at
    /// the orchestrator boundary and never crashes the worker.
    async fn perform(&self, ctx: &JobContext) -> Result<Outcome>;

    /// Get a description of this job kind.
    fn description(&self) -> &str {
        "A job kind"
    }
}

/// Build recipe for a workflow kind.
///
/// Recipes MUST be deterministic given identical construction
/// arguments: the store rebuilds workflow structure by re-running the
/// recipe on every load and overlays persisted job state by id, so two
/// runs with the same arguments must declare the same jobs in the same
/// order. Derive structure only from `args`, never from ambient state
/// such as clocks or randomness.
pub trait Recipe: Send + Sync {
    /// The kind identifier this recipe serves (e.g. "nightly-etl").
    fn kind(&self) -> &str;

    /// Declare the workflow's jobs and edges on the builder.
    fn build(&self, builder: &mut WorkflowBuilder, args: &Value) -> Result<()>;
}

/// Registry of job handlers and workflow recipes.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    recipes: HashMap<String, Arc<dyn Recipe>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler.
    pub fn register_handler(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    /// Register a workflow recipe.
    pub fn register_recipe(&mut self, recipe: Arc<dyn Recipe>) {
        self.recipes.insert(recipe.kind().to_string(), recipe);
    }

    /// Get the handler for a job kind.
    pub fn handler(&self, kind: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Get the recipe for a workflow kind.
    pub fn recipe(&self, kind: &str) -> Result<Arc<dyn Recipe>> {
        self.recipes
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Check if a job kind is registered.
    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Check if a workflow kind is registered.
    pub fn has_recipe(&self, kind: &str) -> bool {
        self.recipes.contains_key(kind)
    }

    /// Run the kind's recipe through a fresh builder and validate the
    /// result.
    pub fn build_workflow(&self, kind: &str, args: Value) -> Result<Workflow> {
        let recipe = self.recipe(kind)?;
        let mut builder = WorkflowBuilder::new(kind, args.clone());
        recipe.build(&mut builder, &args)?;
        builder.build()
    }

    /// List all registered job kinds.
    pub fn job_kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }

    /// List all registered workflow kinds.
    pub fn workflow_kinds(&self) -> Vec<&str> {
        self.recipes.keys().map(|s| s.as_str()).collect()
    }
}
