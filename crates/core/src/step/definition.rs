//! Step trait definition and type erasure

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::context::StepContext;
use super::spec::StepSpec;
use crate::data::Kind;
use crate::representation::RenderError;

/// Error raised by a running step
///
/// Any error returned from [`Step::run`] terminates that step with a
/// failed status. Sibling steps keep running.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Parameters could not be turned into the step's configuration
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// A required input never arrived
    #[error("no {0} item received before end of stream")]
    MissingInput(Kind),

    /// Rendering a representation failed
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Create a generic failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A unit of work in a workflow
///
/// A step declares which kinds it requires and produces, is configured
/// from a typed parameter struct, and runs once per workflow run as an
/// independent task. It talks to the rest of the workflow only through
/// its [`StepContext`].
///
/// # Example
///
/// ```ignore
/// use clusterfacts_core::prelude::*;
///
/// struct CountJobs {
///     params: CountJobsParams,
/// }
///
/// #[async_trait]
/// impl Step for CountJobs {
///     const NAME: &'static str = "count_jobs";
///     type Params = CountJobsParams;
///
///     fn spec() -> StepSpec {
///         StepSpec::new(Self::NAME)
///             .requires(JobList::KIND)
///             .produces(QueueSummary::KIND)
///     }
///
///     fn new(params: Self::Params) -> Result<Self, StepError> {
///         Ok(Self { params })
///     }
///
///     async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
///         let Some(jobs) = ctx.receive_data::<JobList>().await else {
///             return Err(StepError::MissingInput(JobList::KIND));
///         };
///         ctx.emit_data(QueueSummary::from(&jobs))?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sized + 'static {
    /// Registered step name
    const NAME: &'static str;

    /// Typed configuration, deserialized from merged parameters
    type Params: DeserializeOwned + Send;

    /// Static contract of this step
    fn spec() -> StepSpec;

    /// Build a configured instance
    fn new(params: Self::Params) -> Result<Self, StepError>;

    /// Kinds this instance requires
    ///
    /// Defaults to the declared spec. Instances whose inputs depend on
    /// their parameters (e.g. generic sinks) override this.
    fn requires(&self) -> Vec<Kind> {
        Self::spec().requires
    }

    /// Kinds this instance produces
    fn produces(&self) -> Vec<Kind> {
        Self::spec().produces
    }

    /// How long this instance may legitimately run
    ///
    /// Defaults to the declared spec. Steps whose running time follows
    /// from their parameters (e.g. a follow window) override this.
    fn timeout_hint(&self) -> Option<Duration> {
        Self::spec().timeout_hint
    }

    /// Run the step to completion
    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError>;

    /// Erase the concrete type
    fn boxed(self) -> Box<dyn AnyStep> {
        Box::new(StepWrapper { inner: self })
    }
}

/// Type-erased step interface
///
/// This trait allows the resolver and engine to work with steps without
/// knowing their concrete types.
#[async_trait]
pub trait AnyStep: Send {
    /// Registered step name
    fn step_type(&self) -> &'static str;

    /// Kinds this instance requires
    fn requires(&self) -> Vec<Kind>;

    /// Kinds this instance produces
    fn produces(&self) -> Vec<Kind>;

    /// Instance timeout hint
    fn timeout_hint(&self) -> Option<Duration>;

    /// Run the step to completion
    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError>;
}

/// Wrapper to implement AnyStep for any Step
struct StepWrapper<S: Step> {
    inner: S,
}

#[async_trait]
impl<S: Step> AnyStep for StepWrapper<S> {
    fn step_type(&self) -> &'static str {
        S::NAME
    }

    fn requires(&self) -> Vec<Kind> {
        self.inner.requires()
    }

    fn produces(&self) -> Vec<Kind> {
        self.inner.produces()
    }

    fn timeout_hint(&self) -> Option<Duration> {
        self.inner.timeout_hint()
    }

    async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
        self.inner.run(ctx).await
    }
}

/// Factory function type for creating steps from merged parameters
pub type StepFactory =
    Arc<dyn Fn(Map<String, Value>) -> Result<Box<dyn AnyStep>, StepError> + Send + Sync>;

/// Catalog entry for a registered step type
#[derive(Clone)]
pub struct StepRegistration {
    /// Static contract
    pub spec: StepSpec,

    factory: StepFactory,
}

impl StepRegistration {
    /// Build the registration for a typed step
    pub fn of<S: Step>() -> Self {
        let factory: StepFactory = Arc::new(|params: Map<String, Value>| {
            let typed: S::Params = serde_json::from_value(Value::Object(params))
                .map_err(|e| StepError::InvalidParams(e.to_string()))?;
            Ok(S::new(typed)?.boxed())
        });

        Self {
            spec: S::spec(),
            factory,
        }
    }

    /// Registered step name
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Instantiate the step from already-merged parameters
    pub fn instantiate(&self, params: Map<String, Value>) -> Result<Box<dyn AnyStep>, StepError> {
        (self.factory)(params)
    }
}

impl fmt::Debug for StepRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistration")
            .field("spec", &self.spec)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct EchoParams {
        kind: String,
    }

    struct Echo {
        kind: Kind,
    }

    #[async_trait]
    impl Step for Echo {
        const NAME: &'static str = "echo";
        type Params = EchoParams;

        fn spec() -> StepSpec {
            StepSpec::new(Self::NAME).produces(Kind::new("default"))
        }

        fn new(params: Self::Params) -> Result<Self, StepError> {
            if params.kind.is_empty() {
                return Err(StepError::InvalidParams("kind must not be empty".into()));
            }
            Ok(Self {
                kind: Kind::from(params.kind),
            })
        }

        fn produces(&self) -> Vec<Kind> {
            vec![self.kind.clone()]
        }

        fn timeout_hint(&self) -> Option<Duration> {
            Some(Duration::from_secs(self.kind.as_str().len() as u64))
        }

        async fn run(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
            Ok(())
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_instantiate_uses_typed_params() {
        let registration = StepRegistration::of::<Echo>();
        assert_eq!(registration.name(), "echo");

        let step = registration
            .instantiate(params(json!({ "kind": "custom" })))
            .unwrap();
        assert_eq!(step.step_type(), "echo");
        assert_eq!(step.produces(), vec![Kind::new("custom")]);
        assert!(step.requires().is_empty());
    }

    #[test]
    fn test_instance_timeout_hint_overrides_spec() {
        let registration = StepRegistration::of::<Echo>();
        assert_eq!(registration.spec.timeout_hint, None);

        let step = registration
            .instantiate(params(json!({ "kind": "sixsix" })))
            .unwrap();
        assert_eq!(step.timeout_hint(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_instantiate_rejects_bad_params() {
        let registration = StepRegistration::of::<Echo>();

        let wrong_type = registration.instantiate(params(json!({ "kind": 7 })));
        assert!(matches!(wrong_type, Err(StepError::InvalidParams(_))));

        let rejected = registration.instantiate(params(json!({ "kind": "" })));
        assert!(matches!(rejected, Err(StepError::InvalidParams(_))));
    }
}
