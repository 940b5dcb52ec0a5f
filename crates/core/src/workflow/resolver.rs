//! Graph resolution: descriptor + catalog -> wired workflow
//!
//! Resolution instantiates the requested steps, adds the producers that
//! are missing for any required kind, assigns ids and wires producers to
//! consumers. Every failure here is a configuration error raised before
//! any step starts.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use super::descriptor::{StepDescriptor, WorkflowDescriptor};
use super::{StepInstance, Workflow};
use crate::catalog::TypeCatalog;
use crate::data::Kind;
use crate::step::{AnyStep, ParamViolation, StepError, StepRegistration};

/// Configuration errors detected while resolving a workflow
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A required parameter is missing after merging
    #[error("step {step}: missing required parameter '{param}'")]
    MissingParam { step: String, param: String },

    /// A step-level parameter is not accepted by the step
    #[error("step {step}: unknown parameter '{param}'")]
    UnknownParam { step: String, param: String },

    /// Parameters could not be turned into the step's configuration
    #[error("step {step}: invalid parameters: {reason}")]
    InvalidParams { step: String, reason: String },

    /// No step with this name is registered
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// Nothing can produce a required kind
    #[error("no known producer for kind {0}")]
    NoProducer(Kind),

    /// More than one step could produce a required kind
    #[error("ambiguous producer for kind {kind}: {}", candidates.join(", "))]
    AmbiguousProducer { kind: Kind, candidates: Vec<String> },

    /// Two instances share an id
    #[error("duplicate step id: {0}")]
    DuplicateId(String),

    /// An explicit output names an id that does not exist
    #[error("step {step}: output target '{target}' does not exist")]
    UnknownOutput { step: String, target: String },

    /// The wiring contains a cycle
    #[error("workflow wiring contains a cycle through step {0}")]
    Cycle(String),
}

/// Step instantiated but not yet wired
struct Pending<'c> {
    registration: &'c StepRegistration,
    id: Option<String>,
    outputs: Option<Vec<String>>,
    step: Box<dyn AnyStep>,
    auto: bool,
}

/// Turns workflow descriptors into wired workflows
#[derive(Debug, Clone, Copy)]
pub struct GraphResolver<'c> {
    catalog: &'c TypeCatalog,
}

impl<'c> GraphResolver<'c> {
    /// Create a resolver over a catalog
    pub fn new(catalog: &'c TypeCatalog) -> Self {
        Self { catalog }
    }

    /// Resolve a descriptor into a wired, acyclic workflow
    #[instrument(skip_all, fields(workflow = %descriptor.name))]
    pub fn resolve(&self, descriptor: &WorkflowDescriptor) -> Result<Workflow, ResolveError> {
        let mut pending = descriptor
            .steps
            .iter()
            .map(|requested| self.instantiate_requested(requested, &descriptor.params))
            .collect::<Result<Vec<_>, _>>()?;

        self.add_missing_producers(&mut pending, &descriptor.params)?;

        let ids = assign_ids(&pending)?;
        let mut workflow =
            Workflow::new(&descriptor.name).with_timeout(descriptor.timeout.map(Duration::from_secs));

        let explicit: Vec<(String, Vec<String>)> = pending
            .iter()
            .zip(&ids)
            .filter_map(|(p, id)| p.outputs.clone().map(|targets| (id.clone(), targets)))
            .collect();

        for (p, id) in pending.into_iter().zip(ids) {
            if p.auto {
                info!(step_id = %id, step_type = p.registration.name(), "Auto-inserted producer");
            }
            let instance =
                StepInstance::new(id, p.step).with_description(p.registration.spec.description);
            workflow.add_step(instance)?;
        }

        self.wire(&mut workflow, &explicit)?;
        self.attach_renderers(&mut workflow);
        workflow.check_acyclic()?;

        debug!(plan = %workflow, "Resolved workflow");
        Ok(workflow)
    }

    fn instantiate_requested(
        &self,
        requested: &StepDescriptor,
        defaults: &Map<String, Value>,
    ) -> Result<Pending<'c>, ResolveError> {
        let registration = self
            .catalog
            .step(&requested.name)
            .ok_or_else(|| ResolveError::UnknownStep(requested.name.clone()))?;
        let label = requested.id.as_deref().unwrap_or(&requested.name);
        let step = instantiate(registration, label, defaults, &requested.params)?;

        Ok(Pending {
            registration,
            id: requested.id.clone(),
            outputs: requested.outputs.clone(),
            step,
            auto: false,
        })
    }

    /// Close the instance set over required kinds
    ///
    /// Each round picks the smallest missing kind and adds its single
    /// catalog producer. Auto-added producers only see workflow-level
    /// defaults for the parameters they declare.
    fn add_missing_producers(
        &self,
        pending: &mut Vec<Pending<'c>>,
        defaults: &Map<String, Value>,
    ) -> Result<(), ResolveError> {
        loop {
            let produced: BTreeSet<Kind> = pending
                .iter()
                .flat_map(|p| self.satisfiable_kinds(&p.step.produces()))
                .collect();
            let missing = pending
                .iter()
                .flat_map(|p| p.step.requires())
                .filter(|kind| !produced.contains(kind))
                .min();

            let Some(kind) = missing else {
                return Ok(());
            };

            let candidates = self.catalog.producers_of(&kind);
            let registration = match candidates.as_slice() {
                [] => return Err(ResolveError::NoProducer(kind)),
                [only] => *only,
                _ => {
                    return Err(ResolveError::AmbiguousProducer {
                        kind,
                        candidates: candidates.iter().map(|c| c.name().to_string()).collect(),
                    })
                }
            };

            let step = instantiate(registration, registration.name(), defaults, &Map::new())?;
            // The instance may not produce what its declared contract promised
            if !self.satisfiable_kinds(&step.produces()).contains(&kind) {
                return Err(ResolveError::NoProducer(kind));
            }

            debug!(%kind, step_type = registration.name(), "Adding producer for missing kind");
            pending.push(Pending {
                registration,
                id: None,
                outputs: None,
                step,
                auto: true,
            });
        }
    }

    /// Produced kinds plus every representation of them
    fn satisfiable_kinds(&self, produced: &[Kind]) -> BTreeSet<Kind> {
        let mut kinds: BTreeSet<Kind> = produced.iter().cloned().collect();
        for kind in produced {
            kinds.extend(
                self.catalog
                    .representations_of(kind)
                    .into_iter()
                    .map(|r| r.kind.clone()),
            );
        }
        kinds
    }

    /// Connect producers to consumers
    ///
    /// Explicit outputs are wired first and take the kinds they deliver out
    /// of the target's remaining set. Every remaining required kind must
    /// then have exactly one producer among the instances without explicit
    /// outputs. Kinds nobody consumes stay unwired.
    fn wire(
        &self,
        workflow: &mut Workflow,
        explicit: &[(String, Vec<String>)],
    ) -> Result<(), ResolveError> {
        let offered: BTreeMap<String, BTreeSet<Kind>> = workflow
            .steps()
            .iter()
            .map(|s| {
                let produced: Vec<Kind> = s.produces().iter().cloned().collect();
                (s.id().to_string(), self.satisfiable_kinds(&produced))
            })
            .collect();
        let mut remaining: BTreeMap<String, BTreeSet<Kind>> = workflow
            .steps()
            .iter()
            .map(|s| (s.id().to_string(), s.requires().clone()))
            .collect();

        let explicit_ids: HashSet<&str> = explicit.iter().map(|(id, _)| id.as_str()).collect();
        for (from, targets) in explicit {
            for target in targets {
                let Some(wanted) = remaining.get_mut(target) else {
                    return Err(ResolveError::UnknownOutput {
                        step: from.clone(),
                        target: target.clone(),
                    });
                };
                let delivered: Vec<Kind> = offered[from].intersection(wanted).cloned().collect();
                for kind in &delivered {
                    wanted.remove(kind);
                }
                if delivered.is_empty() {
                    // Still an ordering dependency: the target waits for it
                    debug!(step_id = %from, target = %target, "Explicit output delivers no required kind");
                    workflow.add_dependency(from, target);
                    continue;
                }
                for kind in delivered {
                    workflow.connect(from, kind, target)?;
                }
            }
        }

        for (consumer, kinds) in remaining {
            for kind in kinds {
                let producers: Vec<&String> = offered
                    .iter()
                    .filter(|(id, offers)| {
                        **id != consumer && !explicit_ids.contains(id.as_str()) && offers.contains(&kind)
                    })
                    .map(|(id, _)| id)
                    .collect();

                match producers.as_slice() {
                    [] => return Err(ResolveError::NoProducer(kind)),
                    [producer] => workflow.connect(producer, kind, &consumer)?,
                    _ => {
                        return Err(ResolveError::AmbiguousProducer {
                            kind,
                            candidates: producers.iter().map(|p| p.to_string()).collect(),
                        })
                    }
                }
            }
        }

        Ok(())
    }

    /// Give each instance the representations its consumers are wired for
    fn attach_renderers(&self, workflow: &mut Workflow) {
        for step in &mut workflow.steps {
            let renderers: Vec<_> = step
                .outputs
                .keys()
                .filter_map(|kind| self.catalog.representation(kind))
                .filter(|r| step.produces.contains(&r.data_kind))
                .cloned()
                .collect();
            step.renderers = renderers;
        }
    }
}

fn instantiate(
    registration: &StepRegistration,
    label: &str,
    defaults: &Map<String, Value>,
    overrides: &Map<String, Value>,
) -> Result<Box<dyn AnyStep>, ResolveError> {
    let merged = registration
        .spec
        .merge_params(defaults, overrides)
        .map_err(|violation| match violation {
            ParamViolation::Missing(param) => ResolveError::MissingParam {
                step: label.to_string(),
                param,
            },
            ParamViolation::Unknown(param) => ResolveError::UnknownParam {
                step: label.to_string(),
                param,
            },
        })?;

    registration.instantiate(merged).map_err(|e| {
        let reason = match e {
            StepError::InvalidParams(reason) => reason,
            other => other.to_string(),
        };
        ResolveError::InvalidParams {
            step: label.to_string(),
            reason,
        }
    })
}

/// Keep explicit ids, number the rest `step-<n>` by position
fn assign_ids(pending: &[Pending<'_>]) -> Result<Vec<String>, ResolveError> {
    let mut seen = HashSet::new();
    pending
        .iter()
        .enumerate()
        .map(|(n, p)| {
            let id = p.id.clone().unwrap_or_else(|| format!("step-{}", n + 1));
            if !seen.insert(id.clone()) {
                return Err(ResolveError::DuplicateId(id));
            }
            Ok(id)
        })
        .collect()
}
