mod common;

use common::platform;
use labcompile::error::PropertyError;
use labcompile::resolver::BindingTable;
use async_trait::async_trait;
use labcompile::runtime::{DynamicRunner, Phase};
use labcompile::step::dynamic::{DynamicOwner, Feedback, SensorQuery};
use labcompile::{
    compile, step, ApparatusKind, CompiledProcedure, CompiledStep, CompilerConfig, DeviceBackend, Procedure,
    Runtime, SimulatedBackend, Step, StepKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Owner whose running phase produces `remaining` waits, then stops.
struct Countdown {
    remaining: usize,
    calls: Arc<AtomicUsize>,
}

impl DynamicOwner for Countdown {
    fn on_start(&mut self) -> Result<Vec<Step>, PropertyError> {
        Ok(vec![step!(StartPurge { "vessel" => "reactor" })?])
    }

    fn on_continue(&mut self, _feedback: &Feedback) -> Result<Vec<Step>, PropertyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.remaining == 0 {
            return Ok(Vec::new());
        }
        self.remaining -= 1;
        Ok(vec![step!(Wait { "time" => 1.0 })?])
    }

    fn on_finish(&mut self) -> Result<Vec<Step>, PropertyError> {
        Ok(vec![step!(StopPurge { "vessel" => "reactor" })?])
    }
}

/// Backend whose waits only finish once some stirrer has been started.
#[derive(Default)]
struct StirGate {
    stirring: Notify,
}

#[async_trait]
impl DeviceBackend for StirGate {
    async fn execute(&self, step: &Step) -> anyhow::Result<()> {
        match step.kind {
            StepKind::StartStir => self.stirring.notify_one(),
            StepKind::Wait => self.stirring.notified().await,
            _ => {}
        }
        Ok(())
    }

    async fn read_sensor(&self, _query: &SensorQuery) -> anyhow::Result<Option<f64>> {
        Ok(None)
    }
}

fn procedure_of(steps: Vec<Step>) -> CompiledProcedure {
    let steps = steps
        .into_iter()
        .map(|step| CompiledStep { origin: 0, step })
        .collect();
    CompiledProcedure::new(BindingTable::default(), steps)
}

#[tokio::test]
async fn test_dynamic_runner_terminates_after_empty_phase() {
    let calls = Arc::new(AtomicUsize::new(0));
    let owner = Countdown {
        remaining: 3,
        calls: calls.clone(),
    };
    let runtime = Runtime::new(Arc::new(SimulatedBackend::new()));
    let mut runner = DynamicRunner::new(Box::new(owner));
    runner.run(&runtime).await.expect("Runner should finish");

    use Phase::*;
    assert_eq!(runner.history(), &[Start, Running, Running, Running, Finishing, Done]);
    assert_eq!(runner.phase(), Done);
    // Three non-empty phases plus the empty one, never more.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        runtime.trace().operations(),
        vec!["StartPurge", "Wait", "Wait", "Wait", "StopPurge"]
    );
}

#[tokio::test]
async fn test_purge_stops_when_pressure_settles() {
    let graph = platform();
    let procedure = Procedure::new()
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(PurgeUntilStable { "vessel" => "reactor", "tolerance" => 0.5 }).unwrap());
    let compiled = compile(&procedure, &graph, &CompilerConfig::default()).unwrap();

    let backend = SimulatedBackend::new().with_readings("reactor", "pressure", [10.0, 5.0, 5.2]);
    let runtime = Runtime::new(Arc::new(backend.clone()));
    runtime.execute(&compiled).await.expect("Purge should finish");

    assert_eq!(
        runtime.trace().operations(),
        vec!["StartPurge", "Wait", "Wait", "StopPurge"]
    );
    assert_eq!(backend.calls().len(), 4);
}

#[tokio::test]
async fn test_async_body_runs_alongside_main_sequence() {
    let background = step!(Async { "pid" => "bg" })
        .unwrap()
        .with_body(vec![step!(Wait { "time" => 1.0 }).unwrap()])
        .unwrap();
    let procedure = procedure_of(vec![
        background,
        step!(StartStir { "vessel" => "reactor" }).unwrap(),
        step!(AwaitAsync { "pid" => "bg" }).unwrap(),
        step!(StopStir { "vessel" => "reactor" }).unwrap(),
    ]);

    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();
    let runtime = Runtime::new(Arc::new(StirGate::default()))
        .with_completion_hook(move |pid| sink.lock().unwrap().push(pid.to_string()));
    runtime.execute(&procedure).await.expect("Procedure should run");

    // The async wait cannot finish before the main line starts the stirrer,
    // and the main line only passes the rendezvous afterwards.
    assert_eq!(
        runtime.trace().operations(),
        vec!["StartStir", "Wait", "AwaitAsync", "StopStir"]
    );
    assert_eq!(*finished.lock().unwrap(), vec!["bg".to_string()]);
}

#[tokio::test]
async fn test_unawaited_async_is_joined_at_the_end() {
    let background = step!(Async { "pid" => "bg" })
        .unwrap()
        .with_body(vec![step!(Wait { "time" => 1.0 }).unwrap()])
        .unwrap();
    let procedure = procedure_of(vec![background, step!(StartStir { "vessel" => "reactor" }).unwrap()]);

    let runtime = Runtime::new(Arc::new(SimulatedBackend::new().with_wait_scale(0.01)));
    runtime.execute(&procedure).await.unwrap();
    assert_eq!(runtime.trace().len(), 2);
}

#[tokio::test]
async fn test_awaiting_unknown_pid_fails() {
    let procedure = procedure_of(vec![step!(AwaitAsync { "pid" => "ghost" }).unwrap()]);
    let runtime = Runtime::new(Arc::new(SimulatedBackend::new()));
    let err = runtime.execute(&procedure).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_composite_steps_are_refused_at_runtime() {
    let procedure = procedure_of(vec![step!(Stir { "vessel" => "reactor", "time" => 5.0 }).unwrap()]);
    let runtime = Runtime::new(Arc::new(SimulatedBackend::new()));
    assert!(runtime.execute(&procedure).await.is_err());
    assert!(runtime.trace().is_empty());
}
