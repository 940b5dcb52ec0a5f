//! Static step contract: declared kinds, parameter schema and hints

use std::time::Duration;

use serde_json::{Map, Value};

use crate::data::Kind;

/// One accepted parameter of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Parameter name
    pub name: &'static str,

    /// Whether the parameter must be present after merging
    pub required: bool,

    /// Human description
    pub description: &'static str,
}

impl ParamSpec {
    /// A parameter that must be provided
    pub fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: true,
            description,
        }
    }

    /// A parameter that may be omitted
    pub fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            required: false,
            description,
        }
    }
}

/// Why a parameter set does not match a step's schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamViolation {
    /// A required key is absent
    Missing(String),

    /// A step-level key is not part of the schema
    Unknown(String),
}

/// A step's static contract
///
/// # Example
///
/// ```
/// use clusterfacts_core::{Kind, ParamSpec, StepSpec};
///
/// let spec = StepSpec::new("count_jobs")
///     .with_description("Count jobs per queue")
///     .requires(Kind::new("job_list"))
///     .produces(Kind::new("queue_summary"))
///     .with_param(ParamSpec::optional("queues", "Queues to include"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    /// Registered step name
    pub name: &'static str,

    /// Human description
    pub description: &'static str,

    /// Kinds this step consumes
    pub requires: Vec<Kind>,

    /// Kinds this step emits
    pub produces: Vec<Kind>,

    /// Accepted parameters
    pub params: Vec<ParamSpec>,

    /// How long the step is expected to run at most
    pub timeout_hint: Option<Duration>,
}

impl StepSpec {
    /// Create a spec with no inputs, outputs or parameters
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            description: "",
            requires: Vec::new(),
            produces: Vec::new(),
            params: Vec::new(),
            timeout_hint: None,
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Declare a required kind
    pub fn requires(mut self, kind: Kind) -> Self {
        self.requires.push(kind);
        self
    }

    /// Declare a produced kind
    pub fn produces(mut self, kind: Kind) -> Self {
        self.produces.push(kind);
        self
    }

    /// Declare an accepted parameter
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Set the timeout hint
    pub fn with_timeout_hint(mut self, timeout: Duration) -> Self {
        self.timeout_hint = Some(timeout);
        self
    }

    /// Look up a parameter by name
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Merge workflow-level defaults with step-level overrides
    ///
    /// Only defaults the step declares are taken from the workflow level.
    /// Step-level keys must all be declared. Every required parameter must
    /// be present afterwards.
    pub fn merge_params(
        &self,
        defaults: &Map<String, Value>,
        overrides: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ParamViolation> {
        if let Some(unknown) = overrides.keys().find(|k| self.param(k).is_none()) {
            return Err(ParamViolation::Unknown(unknown.clone()));
        }

        let mut merged: Map<String, Value> = defaults
            .iter()
            .filter(|(k, _)| self.param(k).is_some())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in overrides {
            merged.insert(k.clone(), v.clone());
        }

        if let Some(missing) = self
            .params
            .iter()
            .find(|p| p.required && !merged.contains_key(p.name))
        {
            return Err(ParamViolation::Missing(missing.name.to_string()));
        }

        Ok(merged)
    }
}
