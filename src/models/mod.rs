// Core domain models for Pipeliner
// These are the persisted, serializable data structures

//! # Domain Models Module
//!
//! Plain data: scenario documents and their versions, tasks and their step
//! records, and calendar data. Nothing in here performs I/O; the engine and
//! the integrations operate on these types.

// Scenario, PipelineBody, BlockDescriptor, FunctionValue, Version
pub mod scenario;

// Task, Step, StoreSnapshot, DebugAction
pub mod task;

// CalendarDays, CalendarDayType, TaskCompletionInterval, WorkHours
pub mod calendar;

pub use scenario::{
    BlockDescriptor, FunctionValue, PipelineBody, Scenario, ScenarioStatus, Version, VersionStatus,
    NEXT_SLOT,
};

pub use task::{DebugAction, NewStep, Step, StepStatus, StoreSnapshot, Task, TaskStatus};

pub use calendar::{Calendar, CalendarDay, CalendarDayType, CalendarDays, TaskCompletionInterval, WorkHours};
