//! Workflow descriptor: the JSON document a run starts from

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors reading a workflow descriptor
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid descriptor
    #[error("invalid workflow descriptor: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A requested step inside a descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDescriptor {
    /// Registered step name
    pub name: String,

    /// Explicit instance id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Explicit destination ids for every produced kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,

    /// Step-level parameter overrides
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl StepDescriptor {
    /// Request a step by name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the instance id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Wire every produced kind to exactly these ids
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = Some(outputs.into_iter().map(Into::into).collect());
        self
    }

    /// Set a step-level parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Partially specified workflow, as read from JSON
///
/// ```json
/// { "name": "nightly", "timeout": 600,
///   "params": { "cluster": "alpha" },
///   "steps": [ { "name": "publish_file", "params": { "path": "/tmp/out" } } ] }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDescriptor {
    /// Workflow name
    pub name: String,

    /// Overall timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Workflow-level parameter defaults
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Requested steps, in order
    #[serde(default)]
    pub steps: Vec<StepDescriptor>,
}

impl WorkflowDescriptor {
    /// Create an empty descriptor
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the overall timeout in seconds
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Set a workflow-level parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Append a requested step
    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a descriptor from JSON text
    pub fn from_json(text: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a descriptor file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DescriptorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }
}
