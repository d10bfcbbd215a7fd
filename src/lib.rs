//! FlowRunner - Workflow Orchestration Engine
//!
//! Runs workflows made of ordered, condition-gated tasks. Each workflow
//! instance is driven by its own processor that persists every state change,
//! injects standard metadata into the shared context and runs tasks either
//! in-process or through an external resource manager.
//!
//! # Architecture
//!
//! - [`workflow`]: Workflow definitions, metadata, instances and YAML parsing
//! - [`execution`]: Engine, per-instance drivers, schedulers and runners
//! - [`repository`]: Persistence of workflow instances
//! - [`monitoring`]: Per-instance execution timeline
//! - [`config`]: Engine configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flowrunner::repository::MemoryInstanceRepository;
//! use flowrunner::{load_workflow, Engine, EngineConfig, HandlerRegistry, Metadata};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("pipeline.yaml")?;
//!
//!     let engine = Engine::new(
//!         EngineConfig::default(),
//!         Arc::new(MemoryInstanceRepository::new()),
//!         Arc::new(HandlerRegistry::with_builtins()),
//!         None,
//!     )?;
//!
//!     let mut metadata = Metadata::new();
//!     metadata.add("Dataset", "run-42");
//!
//!     let started = engine.start_workflow(workflow, metadata)?;
//!     let id = started.id.unwrap_or_default();
//!     let finished = engine.wait_for_completion(&id, Duration::from_secs(600));
//!     println!("{:?}", finished.map(|inst| inst.status));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod repository;
pub mod workflow;

// Re-export commonly used types
pub use config::{EngineConfig, SchedulingStrategy};
pub use error::{EngineError, Result};
pub use execution::{Engine, HandlerRegistry};
pub use workflow::{
    load_workflow, parse_workflow, Metadata, Priority, Task, Workflow, WorkflowInstance,
    WorkflowStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";
