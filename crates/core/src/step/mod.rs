//! Step contract and runtime
//!
//! - [`spec`]: static contract (kinds, parameter schema, timeout hint)
//! - [`definition`]: the [`Step`] trait and its type-erased form
//! - [`context`]: mailboxes and the [`StepContext`] a step runs against

mod context;
mod definition;
mod spec;

pub use context::{
    mailbox, Envelope, MailboxReceiver, MailboxSender, Outputs, Received, Route, StepContext,
};
pub use definition::{AnyStep, Step, StepError, StepFactory, StepRegistration};
pub use spec::{ParamSpec, ParamViolation, StepSpec};
