//! Workflow execution engine
//!
//! The engine starts every step of a resolved workflow as its own task,
//! delivers end-of-stream once a step's upstream has terminated, enforces
//! the workflow-wide timeout and aggregates the outcome.

mod executor;
mod report;

pub use executor::{Engine, EngineConfig, EngineError};
pub use report::{RunReport, StepOutcome, StepStatus};
