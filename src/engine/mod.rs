// Pipeliner Engine
// Everything that turns a scenario document into a running task

//! # Engine Module
//!
//! The engine is the layer between the domain models and the HTTP surface.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: plain data (in `models/`)
//! - **Engine Layer**: store, blocks, loader, step loop, runner (this module)
//! - **API Layer**: axum handlers calling into the runner (in `api/`)
//!
//! ## Engine Components
//!
//! ### Variable Store (`store` module)
//! - Flat `scope.key` map shared by all blocks of a task
//! - Step and error logs, debug stop points
//! - Snapshots persisted with every step record
//!
//! ### Block Protocol (`block` and `blocks` modules)
//! - The `Block` trait and the run context handed to every block
//! - One file per block kind: control blocks, integration leaves, sub-pipelines
//!
//! ### Loader (`loader` module)
//! - Validates scenario documents and constructs executable pipelines
//!
//! ### Step Loop (`pipeline` module)
//! - Runs blocks one at a time, persisting a step record per block
//! - Enforces the step budget, cancellation and the debug policy
//!
//! ### Storage (`storage` module)
//! - The persistence contract for pipelines, versions, tasks and steps
//! - In-memory implementation for development and tests
//!
//! ### Runner (`runner` module)
//! - Task creation, sync/async runs, debug sessions, version lifecycle
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for a clean API

/// Block protocol and run context
pub mod block;

/// Block kinds, one file each
pub mod blocks;

/// Scenario documents into executable pipelines
pub mod loader;

/// The step loop
pub mod pipeline;

/// Task creation, debug sessions, lifecycle
pub mod runner;

/// Storage abstraction layer
///
/// Contains:
/// - Storage trait definition
/// - In-memory storage implementation
/// - Version state machine and dense step records
pub mod storage;

/// Task-local variable store
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod scenario_tests;

// Re-export main engine types so callers can import from `engine` directly

pub use block::{Block, BlockModel, BlockUpdateData, FunctionValueModel, RunContext};
pub use loader::ScenarioLoader;
pub use pipeline::{DebugPolicy, EngineLimits, ExecutablePipeline, RunOutcome, StartPoint};
pub use runner::{CleanupHook, DebugResult, PipelineRunner, RunMode, RunResponse, TaskWithSteps};
pub use storage::{InMemoryStorage, PipelineRecord, Storage, StepUpdate};
pub use store::{StopPoints, VariableStore};
