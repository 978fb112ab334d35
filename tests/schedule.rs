mod common;

use common::platform;
use labcompile::parallelizer::ScheduledStep;
use labcompile::{
    compile, step, ApparatusKind, BindingTable, CompiledProcedure, CompiledStep, CompilerConfig, Parallelizer,
    Procedure, Runtime, Schedule, ScheduleError, ScheduleRunner, SimulatedBackend, StepKind,
};
use std::sync::Arc;

fn add_water() -> Procedure {
    Procedure::new()
        .reagent("water")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "water", "volume" => 10.0 }).unwrap())
}

fn heat() -> Procedure {
    Procedure::new().vessel("reactor", ApparatusKind::Reactor).step(
        step!(HeatChill {
            "vessel" => "reactor",
            "temp" => 60.0,
            "time" => 60.0,
            "stir" => false,
        })
        .unwrap(),
    )
}

fn first_of(schedule: &Schedule, procedure: usize, kind: StepKind) -> &ScheduledStep {
    schedule
        .steps_of(procedure)
        .find(|s| s.step.kind == kind)
        .expect("Procedure should contain the step")
}

/// Brute-force version of the lock-safety property.
fn assert_disjoint(schedule: &Schedule) {
    for a in &schedule.steps {
        for b in &schedule.steps {
            if a.procedure == b.procedure || a.start >= b.end() || b.start >= a.end() {
                continue;
            }
            assert!(
                a.held.is_disjoint(&b.held),
                "procedures {} and {} share {:?}",
                a.procedure,
                b.procedure,
                a.held.intersection(&b.held).collect::<Vec<_>>()
            );
        }
    }
}

#[test]
fn test_conflicting_procedure_is_deferred() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[add_water(), add_water()])
        .expect("Should schedule");

    let first = first_of(&schedule, 0, StepKind::Move);
    let second = first_of(&schedule, 1, StepKind::Move);
    // 10 mL drawn at 10 mL/min, pushed at 40 mL/min, plus command overhead:
    // 80 s, eight 10 s ticks.
    assert_eq!((first.start, first.ticks), (0, 8));
    assert_eq!(second.start, first.end());
    assert!(first.held.contains("reactor") && first.held.contains("valve"));

    schedule.verify_lock_safety().expect("Schedule should be lock-safe");
    assert_disjoint(&schedule);
}

#[test]
fn test_ongoing_hold_blocks_other_procedures() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[heat(), add_water()])
        .unwrap();

    // SetTemp [0,1), StartHeatChill [1,2), Wait [2,8), StopHeatChill [8,9).
    // The heater hold runs from StartHeatChill, the HeatChill scope from SetTemp.
    let spans: Vec<(u64, u64)> = schedule
        .holds
        .iter()
        .filter(|h| h.procedure == 0)
        .map(|h| (h.start, h.end))
        .collect();
    assert_eq!(spans, vec![(1, 9), (0, 9)]);
    assert_eq!(first_of(&schedule, 1, StepKind::Move).start, 9);

    let matrix = schedule.lock_matrix().unwrap();
    assert_eq!(matrix[4].get("reactor"), Some(&0));
    assert_eq!(matrix[9].get("reactor"), Some(&1));
    assert_disjoint(&schedule);
}

#[test]
fn test_composite_step_keeps_its_vessel_through_internal_wait() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let slow_add = Procedure::new()
        .reagent("water")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "water", "volume" => 10.0, "time" => 60.0 }).unwrap());
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[slow_add, add_water()])
        .unwrap();

    // Move [0,8) then the Add's own Wait [8,14): the reactor stays taken.
    let wait = first_of(&schedule, 0, StepKind::Wait);
    assert_eq!((wait.start, wait.end()), (8, 14));
    assert!(wait.held.is_empty());
    assert_eq!(first_of(&schedule, 1, StepKind::Move).start, 14);

    let matrix = schedule.lock_matrix().unwrap();
    assert_eq!(matrix[10].get("reactor"), Some(&0));
    assert_disjoint(&schedule);
}

#[test]
fn test_lower_index_always_goes_first() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[add_water(), heat()])
        .unwrap();

    assert_eq!(first_of(&schedule, 0, StepKind::Move).start, 0);
    assert_eq!(first_of(&schedule, 1, StepKind::SetTemp).start, 8);
    schedule.verify_lock_safety().unwrap();
}

#[test]
fn test_scheduling_is_repeatable() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let parallelizer = Parallelizer::new(&graph, &cfg);
    let procedures = [heat(), add_water(), add_water()];
    let (_, a) = parallelizer.compile_and_schedule(&procedures).unwrap();
    let (_, b) = parallelizer.compile_and_schedule(&procedures).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_dynamic_step_is_budgeted_at_worst_case() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let purge = Procedure::new()
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(PurgeUntilStable { "vessel" => "reactor", "interval" => 30.0, "max_cycles" => 4usize }).unwrap());
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[purge, add_water()])
        .unwrap();

    // 4 x 30 s waits plus StartPurge and StopPurge overheads.
    let op = first_of(&schedule, 0, StepKind::PurgeUntilStable);
    assert_eq!(op.ticks, 13);
    assert_eq!(first_of(&schedule, 1, StepKind::Move).start, 13);
}

#[test]
fn test_running_devices_are_stopped_before_the_procedure_ends() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let procedure = Procedure::new()
        .reagent("water")
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "water", "volume" => 10.0, "stir" => true }).unwrap())
        .step(step!(HeatChillToTemp { "vessel" => "reactor", "temp" => 40.0, "stir" => false }).unwrap());
    let compiled = compile(&procedure, &graph, &cfg).unwrap();

    let tail: Vec<StepKind> = compiled.steps.iter().rev().take(2).map(|e| e.step.kind).collect();
    assert_eq!(tail, vec![StepKind::StopHeatChill, StepKind::StopStir]);
    let schedule = Parallelizer::new(&graph, &cfg)
        .schedule(&[compiled])
        .expect("Every hold should be released");
    schedule.verify_lock_safety().unwrap();
}

#[test]
fn test_unreleased_hold_is_rejected() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let leaky = CompiledProcedure::new(
        BindingTable::default(),
        vec![CompiledStep {
            origin: 0,
            step: step!(StartHeatChill { "vessel" => "reactor" }).unwrap(),
        }],
    );

    let err = Parallelizer::new(&graph, &cfg).schedule(&[leaky]).unwrap_err();
    assert_eq!(
        err,
        ScheduleError::LockLeak {
            procedure: 0,
            node: "reactor".into()
        }
    );
}

#[test]
fn test_compile_errors_name_their_procedure() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let broken = Procedure::new()
        .vessel("reactor", ApparatusKind::Reactor)
        .step(step!(Add { "vessel" => "reactor", "reagent" => "acid", "volume" => 1.0 }).unwrap());
    let err = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[add_water(), broken])
        .unwrap_err();
    assert!(matches!(err, ScheduleError::Compile { procedure: 1, .. }));
}

#[tokio::test]
async fn test_schedule_plays_against_backend() {
    let graph = platform();
    let cfg = CompilerConfig::default();
    let (_, schedule) = Parallelizer::new(&graph, &cfg)
        .compile_and_schedule(&[heat(), add_water()])
        .unwrap();

    let backend = SimulatedBackend::new();
    let runner = ScheduleRunner::new(Runtime::new(Arc::new(backend.clone())));
    runner.run(&schedule).await.expect("Schedule should run");

    assert_eq!(
        runner.runtime().trace().operations(),
        vec!["SetTemp", "StartHeatChill", "Wait", "StopHeatChill", "Move"]
    );
    assert_eq!(backend.calls().len(), 5);
}
