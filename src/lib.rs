//! skein - durable DAG job orchestration
//!
//! skein lets an application declare units of work ("jobs") with
//! ordering dependencies as a directed acyclic graph ("workflow"),
//! execute them through an external worker pool, and durably track
//! progress in Redis so execution survives process restarts and
//! concurrent worker crashes.
//!
//! ## Key Properties
//!
//! - **Declarative graphs**: a workflow kind's recipe calls `run` once
//!   per job and wires dependencies through handles; cycles are
//!   rejected at build time
//! - **Crash-safe resumption**: structure is rebuilt from the recipe on
//!   every load, job state is rehydrated from the store
//! - **Exactly-once continuation**: after each completion a lock-guarded
//!   step recomputes the ready set and enqueues each newly-eligible job
//!   once, no matter how many workers complete siblings simultaneously
//! - **External execution**: the queue/worker pool is consumed through
//!   a one-method `enqueue` contract, never owned
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::{json, Value};
//! use skein::{JobSpec, Recipe, Registry, Result, WorkflowBuilder};
//!
//! struct NightlyEtl;
//!
//! impl Recipe for NightlyEtl {
//!     fn kind(&self) -> &str {
//!         "nightly-etl"
//!     }
//!
//!     fn build(&self, builder: &mut WorkflowBuilder, args: &Value) -> Result<()> {
//!         let fetch = builder.run("fetch", JobSpec::new().params(json!({
//!             "table": args["table"],
//!         })))?;
//!         let parse = builder.run("parse", JobSpec::new().after(&fetch))?;
//!         builder.run("load", JobSpec::new().after(&parse))?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let mut registry = Registry::new();
//! registry.register_recipe(Arc::new(NightlyEtl));
//!
//! let workflow = registry.build_workflow("nightly-etl", json!({"table": "orders"}))?;
//! assert_eq!(workflow.next_ready(), vec!["fetch-1".to_string()]);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod workflow;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{EventBus, EventStatus, JobEvent};
pub use job::Job;
pub use orchestrator::{Orchestrator, Queue};
pub use registry::{Handler, JobContext, Outcome, Recipe, Registry};
pub use store::{Backend, MemoryBackend, RedisBackend, Store};
pub use workflow::{JobHandle, JobSpec, Workflow, WorkflowBuilder};
