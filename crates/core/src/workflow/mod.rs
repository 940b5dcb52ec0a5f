//! Resolved workflows
//!
//! A [`Workflow`] is the fully wired, acyclic graph of [`StepInstance`]s
//! the engine runs. It is normally produced by [`GraphResolver`] from a
//! [`WorkflowDescriptor`], but can be assembled by hand as well.

mod descriptor;
mod resolver;

pub use descriptor::{DescriptorError, StepDescriptor, WorkflowDescriptor};
pub use resolver::{GraphResolver, ResolveError};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::data::Kind;
use crate::representation::RepresentationRegistration;
use crate::step::AnyStep;

/// A configured, wired step
pub struct StepInstance {
    pub(crate) id: String,
    pub(crate) step_type: &'static str,
    pub(crate) description: &'static str,
    pub(crate) timeout_hint: Option<Duration>,
    pub(crate) requires: BTreeSet<Kind>,
    pub(crate) produces: BTreeSet<Kind>,
    pub(crate) outputs: BTreeMap<Kind, Vec<String>>,
    pub(crate) upstream: BTreeSet<String>,
    pub(crate) renderers: Vec<RepresentationRegistration>,
    pub(crate) step: Box<dyn AnyStep>,
}

impl StepInstance {
    /// Wrap a step under an id, with no wiring yet
    pub fn new(id: impl Into<String>, step: Box<dyn AnyStep>) -> Self {
        Self {
            id: id.into(),
            step_type: step.step_type(),
            description: "",
            timeout_hint: step.timeout_hint(),
            requires: step.requires().into_iter().collect(),
            produces: step.produces().into_iter().collect(),
            outputs: BTreeMap::new(),
            upstream: BTreeSet::new(),
            renderers: Vec::new(),
            step,
        }
    }

    /// Set the human description
    pub fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Set the timeout hint
    pub fn with_timeout_hint(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_hint = timeout;
        self
    }

    /// Instance id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registered step type
    pub fn step_type(&self) -> &'static str {
        self.step_type
    }

    /// Human description
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Timeout hint of the step type
    pub fn timeout_hint(&self) -> Option<Duration> {
        self.timeout_hint
    }

    /// Kinds this instance requires
    pub fn requires(&self) -> &BTreeSet<Kind> {
        &self.requires
    }

    /// Kinds this instance produces
    pub fn produces(&self) -> &BTreeSet<Kind> {
        &self.produces
    }

    /// Destination ids per wired kind
    pub fn outputs(&self) -> &BTreeMap<Kind, Vec<String>> {
        &self.outputs
    }

    /// Ids of the instances this one receives from
    pub fn upstream(&self) -> &BTreeSet<String> {
        &self.upstream
    }

    /// Representations rendered on emit
    pub fn renderers(&self) -> &[RepresentationRegistration] {
        &self.renderers
    }
}

impl fmt::Debug for StepInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInstance")
            .field("id", &self.id)
            .field("step_type", &self.step_type)
            .field("requires", &self.requires)
            .field("produces", &self.produces)
            .field("outputs", &self.outputs)
            .field("upstream", &self.upstream)
            .finish()
    }
}

/// A named, wired set of step instances
#[derive(Debug)]
pub struct Workflow {
    name: String,
    timeout: Option<Duration>,
    steps: Vec<StepInstance>,
}

impl Workflow {
    /// Create an empty workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            steps: Vec::new(),
        }
    }

    /// Set the overall timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Workflow name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overall timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Step instances in resolution order
    pub fn steps(&self) -> &[StepInstance] {
        &self.steps
    }

    /// Look up an instance by id
    pub fn step(&self, id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Largest timeout hint declared by any step
    pub fn max_timeout_hint(&self) -> Option<Duration> {
        self.steps.iter().filter_map(|s| s.timeout_hint).max()
    }

    /// Add an instance
    pub fn add_step(&mut self, step: StepInstance) -> Result<(), ResolveError> {
        if self.step(&step.id).is_some() {
            return Err(ResolveError::DuplicateId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Route `kind` from one instance to another
    pub fn connect(&mut self, from: &str, kind: Kind, to: &str) -> Result<(), ResolveError> {
        let to_index = self.index_of(to).ok_or_else(|| ResolveError::UnknownOutput {
            step: from.to_string(),
            target: to.to_string(),
        })?;
        let from_index = self
            .index_of(from)
            .ok_or_else(|| ResolveError::UnknownStep(from.to_string()))?;

        let targets = self.steps[from_index].outputs.entry(kind).or_default();
        if !targets.iter().any(|t| t == to) {
            targets.push(to.to_string());
        }
        self.steps[to_index].upstream.insert(from.to_string());
        Ok(())
    }

    /// Reject wiring that loops back on itself
    pub fn check_acyclic(&self) -> Result<(), ResolveError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, _> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        for step in &self.steps {
            for upstream in &step.upstream {
                if let (Some(&from), Some(&to)) =
                    (nodes.get(upstream.as_str()), nodes.get(step.id.as_str()))
                {
                    graph.add_edge(from, to, ());
                }
            }
        }

        toposort(&graph, None).map(|_| ()).map_err(|cycle| {
            ResolveError::Cycle(graph[cycle.node_id()].to_string())
        })
    }

    /// Make `to` wait for `from` without routing any kind
    pub(crate) fn add_dependency(&mut self, from: &str, to: &str) {
        if let Some(index) = self.index_of(to) {
            self.steps[index].upstream.insert(from.to_string());
        }
    }

    pub(crate) fn into_steps(self) -> Vec<StepInstance> {
        self.steps
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "workflow {}", self.name)?;
        for step in &self.steps {
            write!(f, "  {} ({})", step.id, step.step_type)?;
            for (kind, targets) in &step.outputs {
                write!(f, " {} -> [{}]", kind, targets.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
