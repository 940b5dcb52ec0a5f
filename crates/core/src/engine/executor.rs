//! Supervising engine
//!
//! The `Engine` is responsible for:
//! - Starting every step as an independent task with its own mailbox
//! - Delivering end-of-stream exactly once per step, after all of its
//!   upstream steps have terminated
//! - Force-terminating live steps when the workflow deadline passes
//! - Collecting one outcome per step

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::report::{RunReport, StepOutcome, StepStatus};
use crate::step::{mailbox, Envelope, MailboxSender, Outputs, StepContext, StepError};
use crate::workflow::{ResolveError, Workflow};

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often liveness is checked and end-of-stream delivered
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Errors that prevent a workflow from starting
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The workflow's wiring is inconsistent
    #[error("invalid workflow: {0}")]
    Invalid(#[from] ResolveError),
}

/// Bookkeeping for one spawned step
struct Running {
    id: String,
    step_type: &'static str,
    upstream: BTreeSet<String>,
    mailbox: MailboxSender,
    handle: Option<JoinHandle<Result<(), StepError>>>,
    notified: bool,
    status: Option<StepStatus>,
}

impl Running {
    fn is_live(&self) -> bool {
        self.status.is_none()
    }
}

/// Runs resolved workflows
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Create an engine
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run a workflow to completion or timeout
    ///
    /// A failing step never stops its siblings; its consumers still receive
    /// end-of-stream once it has terminated. When the workflow has no
    /// timeout of its own, the largest step timeout hint is used.
    #[instrument(skip_all, fields(workflow = %workflow.name()))]
    pub async fn run(&self, workflow: Workflow) -> Result<RunReport, EngineError> {
        workflow.check_acyclic()?;

        let name = workflow.name().to_string();
        let timeout = workflow.timeout().or_else(|| workflow.max_timeout_hint());
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let mut running = spawn_all(workflow)?;
        info!(steps = running.len(), timeout_secs = ?timeout.map(|t| t.as_secs_f64()), "Workflow started");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut timed_out = false;

        loop {
            ticker.tick().await;

            for step in running.iter_mut().filter(|s| s.is_live()) {
                if step.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                    if let Some(handle) = step.handle.take() {
                        step.status = Some(completion_status(handle.await));
                    }
                }
            }

            let terminated: HashSet<String> = running
                .iter()
                .filter(|s| !s.is_live())
                .map(|s| s.id.clone())
                .collect();

            for step in running.iter_mut().filter(|s| s.is_live() && !s.notified) {
                if step.upstream.iter().all(|u| terminated.contains(u)) {
                    debug!(step_id = %step.id, "Upstream exhausted, sending end of stream");
                    // Send only fails if the step already dropped its mailbox
                    let _ = step.mailbox.send(Envelope::EndOfStream);
                    step.notified = true;
                }
            }

            if running.iter().all(|s| !s.is_live()) {
                break;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
                for step in running.iter_mut().filter(|s| s.is_live()) {
                    if let Some(handle) = step.handle.take() {
                        handle.abort();
                    }
                    step.status = Some(StepStatus::TimedOut);
                }
                break;
            }
        }

        let outcomes: Vec<StepOutcome> = running
            .into_iter()
            .map(|step| StepOutcome {
                id: step.id,
                step_type: step.step_type.to_string(),
                status: step.status.unwrap_or(StepStatus::TimedOut),
            })
            .collect();

        let report = RunReport {
            workflow: name,
            outcomes,
            timed_out,
            elapsed: started.elapsed(),
        };
        log_report(&report);
        Ok(report)
    }
}

/// Create mailboxes, wire outputs and spawn one task per step
fn spawn_all(workflow: Workflow) -> Result<Vec<Running>, EngineError> {
    let steps = workflow.into_steps();

    let mut receivers = HashMap::new();
    let mut senders = HashMap::new();
    for step in &steps {
        let (tx, rx) = mailbox();
        senders.insert(step.id.clone(), tx);
        receivers.insert(step.id.clone(), rx);
    }

    let mut running = Vec::with_capacity(steps.len());
    for instance in steps {
        let mut outputs = Outputs::new();
        for (kind, targets) in &instance.outputs {
            for target in targets {
                let sender = senders.get(target).ok_or_else(|| ResolveError::UnknownOutput {
                    step: instance.id.clone(),
                    target: target.clone(),
                })?;
                outputs.route(kind.clone(), target.clone(), sender.clone());
            }
        }
        for renderer in instance.renderers {
            outputs.render_with(renderer);
        }

        let (Some(inbox), Some(own_mailbox)) = (
            receivers.remove(&instance.id),
            senders.get(&instance.id).cloned(),
        ) else {
            return Err(ResolveError::DuplicateId(instance.id).into());
        };

        let mut ctx = StepContext::new(instance.id.clone(), inbox, outputs);
        let mut step = instance.step;
        let span = info_span!("step", step_id = %instance.id, step_type = instance.step_type);
        let handle = tokio::spawn(async move { step.run(&mut ctx).await }.instrument(span));

        running.push(Running {
            id: instance.id,
            step_type: instance.step_type,
            upstream: instance.upstream,
            mailbox: own_mailbox,
            handle: Some(handle),
            notified: false,
            status: None,
        });
    }

    Ok(running)
}

fn completion_status(result: Result<Result<(), StepError>, JoinError>) -> StepStatus {
    match result {
        Ok(Ok(())) => StepStatus::Succeeded,
        Ok(Err(e)) => StepStatus::Failed(e.to_string()),
        Err(e) if e.is_panic() => StepStatus::Failed("step panicked".to_string()),
        Err(e) => StepStatus::Failed(e.to_string()),
    }
}

fn log_report(report: &RunReport) {
    for outcome in &report.outcomes {
        match &outcome.status {
            StepStatus::Succeeded => {
                info!(step_id = %outcome.id, step_type = %outcome.step_type, "Step succeeded")
            }
            StepStatus::Failed(reason) => {
                error!(step_id = %outcome.id, step_type = %outcome.step_type, %reason, "Step failed")
            }
            StepStatus::TimedOut => {
                warn!(step_id = %outcome.id, step_type = %outcome.step_type, "Step terminated by workflow timeout")
            }
        }
    }

    let elapsed_ms = report.elapsed.as_millis() as u64;
    if report.succeeded() {
        info!(workflow = %report.workflow, elapsed_ms, "Workflow succeeded");
    } else {
        error!(
            workflow = %report.workflow,
            elapsed_ms,
            timed_out = report.timed_out,
            failed = report.failures().count(),
            "Workflow failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Data, Kind};
    use crate::step::{Step, StepSpec};
    use crate::workflow::StepInstance;
    use async_trait::async_trait;
    use serde::Serialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, Serialize)]
    struct Tick(u32);

    impl Data for Tick {
        const KIND: Kind = Kind::new("tick");

        fn id(&self) -> String {
            self.0.to_string()
        }
    }

    /// Terminates once released, optionally failing
    struct Gate {
        release: Option<oneshot::Receiver<()>>,
        fail: bool,
    }

    #[async_trait]
    impl Step for Gate {
        const NAME: &'static str = "gate";
        type Params = ();

        fn spec() -> StepSpec {
            StepSpec::new(Self::NAME).produces(Tick::KIND)
        }

        fn new(_params: ()) -> Result<Self, StepError> {
            Ok(Self {
                release: None,
                fail: false,
            })
        }

        async fn run(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
            if let Some(release) = self.release.take() {
                let _ = release.await;
            }
            if self.fail {
                return Err(StepError::failed("gate failed"));
            }
            Ok(())
        }
    }

    /// Emits one tick
    struct Emit;

    #[async_trait]
    impl Step for Emit {
        const NAME: &'static str = "emit";
        type Params = ();

        fn spec() -> StepSpec {
            StepSpec::new(Self::NAME).produces(Tick::KIND)
        }

        fn new(_params: ()) -> Result<Self, StepError> {
            Ok(Self)
        }

        async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
            ctx.emit_data(Tick(1))?;
            Ok(())
        }
    }

    /// Drains ticks until end-of-stream
    struct Drain {
        received: Arc<AtomicUsize>,
        done: Option<oneshot::Sender<()>>,
    }

    #[async_trait]
    impl Step for Drain {
        const NAME: &'static str = "drain";
        type Params = ();

        fn spec() -> StepSpec {
            StepSpec::new(Self::NAME).requires(Tick::KIND)
        }

        fn new(_params: ()) -> Result<Self, StepError> {
            Ok(Self {
                received: Arc::default(),
                done: None,
            })
        }

        async fn run(&mut self, ctx: &mut StepContext) -> Result<(), StepError> {
            while ctx.receive_data::<Tick>().await.is_some() {
                self.received.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
            Ok(())
        }
    }

    /// Never finishes on its own
    struct Hang;

    #[async_trait]
    impl Step for Hang {
        const NAME: &'static str = "hang";
        type Params = ();

        fn spec() -> StepSpec {
            StepSpec::new(Self::NAME).with_timeout_hint(Duration::from_secs(2))
        }

        fn new(_params: ()) -> Result<Self, StepError> {
            Ok(Self)
        }

        async fn run(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn gate(id: &str, release: oneshot::Receiver<()>, fail: bool) -> StepInstance {
        StepInstance::new(
            id,
            Gate {
                release: Some(release),
                fail,
            }
            .boxed(),
        )
    }

    fn drain(id: &str, received: Arc<AtomicUsize>, done: oneshot::Sender<()>) -> StepInstance {
        StepInstance::new(
            id,
            Drain {
                received,
                done: Some(done),
            }
            .boxed(),
        )
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().with_poll_interval(Duration::from_millis(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_waits_for_every_upstream() {
        let (release_a, gate_a) = oneshot::channel();
        let (release_b, gate_b) = oneshot::channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let mut workflow = Workflow::new("liveness");
        workflow.add_step(gate("u1", gate_a, false)).unwrap();
        workflow.add_step(gate("u2", gate_b, false)).unwrap();
        workflow
            .add_step(drain("s", Arc::default(), done_tx))
            .unwrap();
        workflow.connect("u1", Tick::KIND, "s").unwrap();
        workflow.connect("u2", Tick::KIND, "s").unwrap();

        let run = tokio::spawn(async move { engine().run(workflow).await });

        // Terminate upstreams in reverse order
        release_b.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(done_rx.try_recv().is_err(), "consumer unblocked before last upstream ended");

        release_a.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(done_rx.try_recv().is_ok());

        let report = run.await.unwrap().unwrap();
        assert!(report.succeeded());
        assert!(!report.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_still_releases_consumers() {
        let (release, gate_rx) = oneshot::channel();
        let (done_tx, _done_rx) = oneshot::channel();
        let received = Arc::new(AtomicUsize::new(0));

        let mut workflow = Workflow::new("failure");
        workflow.add_step(gate("producer", gate_rx, true)).unwrap();
        workflow
            .add_step(drain("consumer", received.clone(), done_tx))
            .unwrap();
        workflow.connect("producer", Tick::KIND, "consumer").unwrap();
        release.send(()).unwrap();

        let report = engine().run(workflow).await.unwrap();

        assert!(!report.succeeded());
        assert_eq!(
            report.outcome("producer").unwrap().status,
            StepStatus::Failed("gate failed".to_string())
        );
        assert_eq!(report.outcome("consumer").unwrap().status, StepStatus::Succeeded);
        assert_eq!(received.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_delivers_to_each_consumer() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut workflow = Workflow::new("fan-out");
        workflow.add_step(StepInstance::new("p", Emit.boxed())).unwrap();
        workflow
            .add_step(drain("c1", first.clone(), oneshot::channel().0))
            .unwrap();
        workflow
            .add_step(drain("c2", second.clone(), oneshot::channel().0))
            .unwrap();
        workflow.connect("p", Tick::KIND, "c1").unwrap();
        workflow.connect("p", Tick::KIND, "c2").unwrap();

        let report = engine().run(workflow).await.unwrap();

        assert!(report.succeeded());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_terminates_live_steps() {
        let mut workflow = Workflow::new("timeout").with_timeout(Some(Duration::from_secs(1)));
        workflow.add_step(StepInstance::new("stuck", Hang.boxed())).unwrap();
        workflow.add_step(StepInstance::new("quick", Emit.boxed())).unwrap();

        let started = Instant::now();
        let report = engine().run(workflow).await.unwrap();

        assert!(report.timed_out);
        assert!(!report.succeeded());
        assert_eq!(report.outcome("stuck").unwrap().status, StepStatus::TimedOut);
        assert_eq!(report.outcome("quick").unwrap().status, StepStatus::Succeeded);
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_hint_used_without_workflow_timeout() {
        let mut workflow = Workflow::new("hinted");
        workflow
            .add_step(StepInstance::new("stuck", Hang.boxed()).with_timeout_hint(Hang::spec().timeout_hint))
            .unwrap();

        let started = Instant::now();
        let report = engine().run(workflow).await.unwrap();

        assert!(report.timed_out);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2100));
    }

    #[tokio::test]
    async fn test_panicking_step_is_a_failure() {
        struct Panics;

        #[async_trait]
        impl Step for Panics {
            const NAME: &'static str = "panics";
            type Params = ();

            fn spec() -> StepSpec {
                StepSpec::new(Self::NAME)
            }

            fn new(_params: ()) -> Result<Self, StepError> {
                Ok(Self)
            }

            async fn run(&mut self, _ctx: &mut StepContext) -> Result<(), StepError> {
                panic!("scanner crashed");
            }
        }

        let mut workflow = Workflow::new("panic");
        workflow.add_step(StepInstance::new("p", Panics.boxed())).unwrap();

        let report = engine().run(workflow).await.unwrap();
        assert!(matches!(
            report.outcome("p").unwrap().status,
            StepStatus::Failed(_)
        ));
    }
}
