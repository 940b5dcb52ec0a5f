// Clusterfacts Dataflow Runtime
//
// This crate wires independently authored steps into a directed graph and
// runs them concurrently, each step talking to the others only through its
// own mailbox.
//
// Key design decisions:
// - Steps are plain Rust types implementing `Step`; the catalog erases them
//   behind `AnyStep` so resolution and execution never see concrete types
// - The `TypeCatalog` is an explicit value built from a static plugin list
// - Resolution fails fast with a `ResolveError`; nothing starts until the
//   whole graph is wired
// - Every emitted item is cloned per destination mailbox
// - End-of-stream is an explicit `Received::EndOfStream`, delivered by the
//   engine once all upstream steps have terminated

pub mod catalog;
pub mod data;
pub mod engine;
pub mod representation;
pub mod step;
pub mod telemetry;
pub mod workflow;

// Re-exports for convenience
pub use catalog::{CatalogError, Plugin, TypeCatalog};
pub use data::{Data, Item, Kind, Rendered};
pub use engine::{Engine, EngineConfig, EngineError, RunReport, StepOutcome, StepStatus};
pub use representation::{RenderError, Representation, RepresentationRegistration};
pub use step::{
    AnyStep, ParamSpec, Received, Step, StepContext, StepError, StepRegistration, StepSpec,
};
pub use workflow::{
    DescriptorError, GraphResolver, ResolveError, StepDescriptor, StepInstance, Workflow,
    WorkflowDescriptor,
};

/// Everything a step implementation usually needs
pub mod prelude {
    pub use crate::data::{Data, Item, Kind, Rendered};
    pub use crate::representation::{RenderError, Representation};
    pub use crate::step::{ParamSpec, Received, Step, StepContext, StepError, StepSpec};
    pub use async_trait::async_trait;
}
