// src/runtime.rs
//
// =============================================================================
// LABCOMPILE: RUNTIME (v 0.3)
// =============================================================================
//
// The Hardware Port.
//
// Responsibilities:
// 1. Define the `DeviceBackend` trait (the contract with the platform).
// 2. Play a compiled procedure against a backend, strictly in order.
// 3. Drive dynamic steps through their phase state machine.
// 4. Spawn async wrappers as independent tasks; rendezvous on AwaitAsync.
//
// Every base step that the backend accepts is appended to the trace.

use crate::artifact::CompiledProcedure;
use crate::step::dynamic::{owner_for, Feedback, SensorQuery};
use crate::step::{Step, StepKind, Variant};
use crate::trace::{describe, TraceBuffer};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod dynamic;
pub mod simulated;

pub use dynamic::{DynamicRunner, Phase};
pub use simulated::SimulatedBackend;

// ============================================================================
// 1. THE BACKEND TRAIT
// ============================================================================

#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Performs one base step on the hardware. Nodes named by the step are
    /// concrete graph nodes.
    async fn execute(&self, step: &Step) -> Result<()>;

    /// Live value of a sensor, if the node has one.
    async fn read_sensor(&self, query: &SensorQuery) -> Result<Option<f64>>;
}

// ============================================================================
// 2. THE RUNTIME
// ============================================================================

type CompletionHook = Arc<dyn Fn(&str) + Send + Sync>;
type SequenceFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

#[derive(Clone)]
pub struct Runtime {
    backend: Arc<dyn DeviceBackend>,
    trace: TraceBuffer,
    on_complete: Option<CompletionHook>,
}

impl Runtime {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            backend,
            trace: TraceBuffer::new(),
            on_complete: None,
        }
    }

    /// Called with the pid of every async wrapper once its body has finished.
    pub fn with_completion_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn trace(&self) -> &TraceBuffer {
        &self.trace
    }

    /// Runs a compiled procedure to completion. Async wrappers that were never
    /// awaited are joined before returning.
    pub async fn execute(&self, procedure: &CompiledProcedure) -> Result<()> {
        let steps: Vec<Step> = procedure.steps.iter().map(|e| e.step.clone()).collect();
        log::info!("Executing {} compiled steps", steps.len());
        let mut tasks = TaskTable::default();
        self.run_sequence(&steps, &mut tasks).await?;
        tasks.join_all().await
    }

    /// Boxed so that async bodies can be spawned from inside a sequence.
    fn run_sequence<'a>(&'a self, steps: &'a [Step], tasks: &'a mut TaskTable) -> SequenceFuture<'a> {
        Box::pin(async move {
            for step in steps {
                self.run_step(step, tasks).await?;
            }
            Ok(())
        })
    }

    async fn run_step(&self, step: &Step, tasks: &mut TaskTable) -> Result<()> {
        match step.variant() {
            Variant::Base if step.kind == StepKind::AwaitAsync => {
                let pid = step.req_text("pid")?;
                tasks.join(pid).await?;
                self.trace.record(step);
                Ok(())
            }
            Variant::Base | Variant::Dynamic => self.run_operation(step).await,
            Variant::Async => {
                let pid = step.req_text("pid")?.to_string();
                let handle = self.spawn(pid.clone(), step.body().to_vec());
                tasks.insert(pid, handle)
            }
            Variant::Composite => bail!("{} reached the runtime unexpanded", step.name()),
        }
    }

    fn spawn(&self, pid: String, body: Vec<Step>) -> JoinHandle<Result<()>> {
        log::debug!("Async '{}': spawning {} steps", pid, body.len());
        let rt = self.clone();
        tokio::spawn(async move {
            let mut nested = TaskTable::default();
            rt.run_sequence(&body, &mut nested).await?;
            nested.join_all().await?;
            log::debug!("Async '{}': finished", pid);
            if let Some(hook) = &rt.on_complete {
                hook(&pid);
            }
            Ok(())
        })
    }

    /// Runs one schedulable operation: a base step or a whole dynamic step.
    pub async fn run_operation(&self, step: &Step) -> Result<()> {
        match step.variant() {
            Variant::Base if step.kind != StepKind::AwaitAsync => self.issue(step).await,
            Variant::Dynamic => {
                let mut runner = DynamicRunner::new(owner_for(step)?);
                runner
                    .run(self)
                    .await
                    .with_context(|| format!("in dynamic step {}", step.name()))
            }
            _ => bail!("{} is not a standalone operation", step.name()),
        }
    }

    pub(crate) async fn issue(&self, step: &Step) -> Result<()> {
        self.backend
            .execute(step)
            .await
            .with_context(|| format!("Backend rejected {}", describe(step)))?;
        self.trace.record(step);
        Ok(())
    }

    pub(crate) async fn sample(&self, watched: &[SensorQuery], cycle: usize) -> Result<Feedback> {
        let mut feedback = Feedback::new(cycle);
        for query in watched {
            if let Some(value) = self.backend.read_sensor(query).await? {
                feedback.record(query.clone(), value);
            }
        }
        Ok(feedback)
    }
}

// ============================================================================
// 3. ASYNC TASK TABLE
// ============================================================================

#[derive(Default)]
struct TaskTable {
    running: BTreeMap<String, JoinHandle<Result<()>>>,
}

impl TaskTable {
    fn insert(&mut self, pid: String, handle: JoinHandle<Result<()>>) -> Result<()> {
        if self.running.contains_key(&pid) {
            handle.abort();
            bail!("Async pid '{}' is already running", pid);
        }
        self.running.insert(pid, handle);
        Ok(())
    }

    async fn join(&mut self, pid: &str) -> Result<()> {
        let handle = self
            .running
            .remove(pid)
            .ok_or_else(|| anyhow!("AwaitAsync: no running async step with pid '{}'", pid))?;
        handle
            .await
            .map_err(|e| anyhow!("Async '{}' did not complete: {}", pid, e))?
    }

    async fn join_all(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.running);
        for (pid, handle) in pending {
            handle
                .await
                .map_err(|e| anyhow!("Async '{}' did not complete: {}", pid, e))??;
        }
        Ok(())
    }
}
