// src/parallelizer.rs
//
// =============================================================================
// LABCOMPILE: PARALLELIZER (v 0.3)
// =============================================================================
//
// The Lock Scheduler.
//
// Responsibilities:
// 1. Turn each compiled procedure into timed operations (duration model).
// 2. Place procedures on a shared tick grid so that no node is ever held by
//    two procedures in the same tick.
// 3. Expose the resulting lock matrix and re-verify it.
// 4. Play a schedule against a runtime.
//
// Placement is greedy and deterministic: procedures are placed in index order
// against everything placed before them. Lower index always wins; a later
// procedure's conflicting operation (and everything after it) is deferred,
// never reordered.

use crate::artifact::CompiledProcedure;
use crate::config::CompilerConfig;
use crate::error::{CompileError, PropertyError, ScheduleError};
use crate::executor::Executor;
use crate::graph::ResourceGraph;
use crate::procedure::Procedure;
use crate::runtime::Runtime;
use crate::step::dynamic::{owner_for, static_phases};
use crate::step::{Amount, LockDeclaration, Step, StepKind, Variant};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::task::JoinSet;

// ============================================================================
// 1. SCHEDULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledStep {
    pub procedure: usize,
    /// Index among the procedure's schedulable operations.
    pub position: usize,
    pub start: u64,
    pub ticks: u64,
    pub step: Step,
    /// Nodes held while the step runs.
    pub held: BTreeSet<String>,
}

impl ScheduledStep {
    pub fn end(&self) -> u64 {
        self.start + self.ticks
    }
}

/// A node kept between a Start* operation and the Stop* that ends it, or
/// across every operation compiled from one composite or dynamic source step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub procedure: usize,
    pub node: String,
    pub start: u64,
    pub end: u64,
}

/// Per tick: node -> procedure holding it.
pub type LockMatrix = Vec<BTreeMap<String, usize>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub time_step_s: f64,
    pub steps: Vec<ScheduledStep>,
    pub holds: Vec<Hold>,
}

impl Schedule {
    pub fn makespan(&self) -> u64 {
        let steps = self.steps.iter().map(ScheduledStep::end);
        let holds = self.holds.iter().map(|h| h.end);
        steps.chain(holds).max().unwrap_or(0)
    }

    pub fn steps_of(&self, procedure: usize) -> impl Iterator<Item = &ScheduledStep> {
        self.steps.iter().filter(move |s| s.procedure == procedure)
    }

    pub fn lock_matrix(&self) -> Result<LockMatrix, ScheduleError> {
        let mut matrix: LockMatrix = vec![BTreeMap::new(); self.makespan() as usize];
        let spans = self
            .steps
            .iter()
            .flat_map(|s| s.held.iter().map(move |n| (n.as_str(), s.procedure, s.start, s.end())))
            .chain(self.holds.iter().map(|h| (h.node.as_str(), h.procedure, h.start, h.end)));

        for (node, procedure, start, end) in spans {
            for tick in start..end {
                let owner = *matrix[tick as usize].entry(node.to_string()).or_insert(procedure);
                if owner != procedure {
                    return Err(ScheduleError::LockConflict {
                        node: node.to_string(),
                        tick,
                        first: owner.min(procedure),
                        second: owner.max(procedure),
                    });
                }
            }
        }
        Ok(matrix)
    }

    /// Every pair of operations running in the same tick holds disjoint nodes.
    pub fn verify_lock_safety(&self) -> Result<(), ScheduleError> {
        self.lock_matrix().map(|_| ())
    }
}

// ============================================================================
// 2. OCCUPANCY
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: u64,
    end: u64,
}

#[derive(Default)]
struct Occupancy {
    by_node: BTreeMap<String, Vec<Interval>>,
}

impl Occupancy {
    /// End of the latest interval on `nodes` overlapping [start, end), if any.
    /// Nothing starting before that tick can avoid the overlap.
    fn conflict<'n>(&self, nodes: impl IntoIterator<Item = &'n String>, start: u64, end: u64) -> Option<u64> {
        nodes
            .into_iter()
            .filter_map(|n| self.by_node.get(n))
            .flatten()
            .filter(|i| i.start < end && start < i.end)
            .map(|i| i.end)
            .max()
    }

    fn occupy(&mut self, node: &str, start: u64, end: u64) {
        self.by_node
            .entry(node.to_string())
            .or_default()
            .push(Interval { start, end });
    }
}

struct Operation {
    position: usize,
    /// Source step this operation was compiled from.
    origin: usize,
    step: Step,
    ticks: u64,
    locks: LockDeclaration,
}

impl Operation {
    fn held(&self) -> BTreeSet<String> {
        self.locks.locked.union(&self.locks.ongoing).cloned().collect()
    }
}

// ============================================================================
// 3. THE PARALLELIZER
// ============================================================================

pub struct Parallelizer<'a> {
    graph: &'a ResourceGraph,
    config: &'a CompilerConfig,
}

impl<'a> Parallelizer<'a> {
    pub fn new(graph: &'a ResourceGraph, config: &'a CompilerConfig) -> Self {
        Self { graph, config }
    }

    /// Compiles every procedure against the shared graph, then schedules them.
    pub fn compile_and_schedule(
        &self,
        procedures: &[Procedure],
    ) -> Result<(Vec<CompiledProcedure>, Schedule), ScheduleError> {
        let executor = Executor::new(self.graph, self.config);
        let compiled = procedures
            .iter()
            .enumerate()
            .map(|(procedure, p)| {
                executor
                    .compile(p)
                    .map_err(|source| ScheduleError::Compile { procedure, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let schedule = self.schedule(&compiled)?;
        Ok((compiled, schedule))
    }

    pub fn schedule(&self, procedures: &[CompiledProcedure]) -> Result<Schedule, ScheduleError> {
        let mut occupancy = Occupancy::default();
        let mut steps = Vec::new();
        let mut holds = Vec::new();

        for (procedure, compiled) in procedures.iter().enumerate() {
            let ops = self.operations(procedure, compiled)?;
            let (starts, mut placed_holds) = place(procedure, &ops, &compiled.scopes, &occupancy)?;

            for (op, start) in ops.into_iter().zip(starts) {
                let held = op.held();
                for node in &held {
                    occupancy.occupy(node, start, start + op.ticks);
                }
                steps.push(ScheduledStep {
                    procedure,
                    position: op.position,
                    start,
                    ticks: op.ticks,
                    step: op.step,
                    held,
                });
            }
            for hold in &placed_holds {
                occupancy.occupy(&hold.node, hold.start, hold.end);
            }
            holds.append(&mut placed_holds);
        }

        steps.sort_by_key(|s| (s.start, s.procedure, s.position));
        let schedule = Schedule {
            time_step_s: self.config.scheduling.time_step_s,
            steps,
            holds,
        };
        log::info!(
            "Scheduled {} procedures: {} operations over {} ticks",
            procedures.len(),
            schedule.steps.len(),
            schedule.makespan()
        );
        Ok(schedule)
    }

    /// Schedulable operations of one procedure: base steps (async bodies
    /// inline) and whole dynamic steps. Rendezvous steps take no time.
    fn operations(&self, procedure: usize, compiled: &CompiledProcedure) -> Result<Vec<Operation>, ScheduleError> {
        fn collect<'s>(origin: usize, step: &'s Step, out: &mut Vec<(usize, &'s Step)>) {
            match step.variant() {
                Variant::Base if step.kind == StepKind::AwaitAsync => {}
                Variant::Base | Variant::Dynamic => out.push((origin, step)),
                Variant::Async | Variant::Composite => {
                    step.body().iter().for_each(|child| collect(origin, child, out))
                }
            }
        }
        let mut flat = Vec::new();
        for entry in &compiled.steps {
            collect(entry.origin, &entry.step, &mut flat);
        }

        let unknown_scope = compiled
            .scopes
            .iter()
            .find_map(|(&origin, nodes)| nodes.iter().find(|n| !self.graph.contains(n)).map(|n| (origin, n)));
        if let Some((origin, node)) = unknown_scope {
            return Err(ScheduleError::UnknownNode {
                procedure,
                step: origin,
                node: node.clone(),
            });
        }

        flat.into_iter()
            .enumerate()
            .map(|(position, (origin, step))| {
                let prop = |e: PropertyError| ScheduleError::Compile {
                    procedure,
                    source: CompileError::property(position, e),
                };
                let locks = step.locks(Some(self.graph));
                let unknown = locks
                    .locked
                    .iter()
                    .chain(&locks.ongoing)
                    .chain(&locks.released)
                    .find(|n| !self.graph.contains(n));
                if let Some(node) = unknown {
                    return Err(ScheduleError::UnknownNode {
                        procedure,
                        step: position,
                        node: node.clone(),
                    });
                }
                Ok(Operation {
                    position,
                    origin,
                    step: step.clone(),
                    ticks: self.ticks(self.duration_s(step).map_err(prop)?),
                    locks,
                })
            })
            .collect()
    }

    fn duration_s(&self, step: &Step) -> Result<f64, PropertyError> {
        let transfer = &self.config.transfer;
        match step.kind {
            StepKind::Move => {
                let volume = match step.amount("volume")? {
                    Some(Amount::Ml(v)) => Some(v),
                    _ => step.number("estimated_volume")?,
                };
                let dispense = step.number("move_speed")?.unwrap_or(transfer.move_speed_ml_min);
                let aspirate = step
                    .number("aspiration_speed")?
                    .unwrap_or(transfer.aspiration_speed_ml_min);
                Ok(match volume {
                    Some(v) if dispense > 0.0 && aspirate > 0.0 => {
                        (v / aspirate + v / dispense) * 60.0 + transfer.command_overhead_s
                    }
                    _ => transfer.unmetered_move_s,
                })
            }
            StepKind::Wait => step.req_number("time"),
            StepKind::SeparatePhases => Ok(transfer.separate_phases_s),
            StepKind::PurgeUntilStable => {
                let mut total = owner_for(step)?.worst_case_s();
                for phase in static_phases(step)? {
                    total += self.duration_s(&phase)?;
                }
                Ok(total)
            }
            _ => Ok(transfer.command_overhead_s),
        }
    }

    fn ticks(&self, seconds: f64) -> u64 {
        let step = self.config.scheduling.time_step_s;
        if step <= 0.0 {
            return 1;
        }
        ((seconds / step).ceil() as u64).max(1)
    }
}

/// Earliest start of every operation of one procedure against the occupancy
/// of the procedures placed before it.
///
/// A node held by an ongoing lock must stay free from the opening operation
/// to the closing one; so must a source step's scope, from its first operation
/// to its last. When a later operation finds such a span blocked, the opening
/// operation is pushed past the blocking interval and placement restarts; each
/// restart moves some start strictly later, so this ends.
fn place(
    procedure: usize,
    ops: &[Operation],
    scopes: &BTreeMap<usize, BTreeSet<String>>,
    occupancy: &Occupancy,
) -> Result<(Vec<u64>, Vec<Hold>), ScheduleError> {
    let mut floors = vec![0u64; ops.len()];

    'restart: loop {
        let mut starts = Vec::with_capacity(ops.len());
        let mut open: BTreeMap<&String, (usize, u64)> = BTreeMap::new();
        let mut scoped: BTreeMap<&String, (usize, u64)> = BTreeMap::new();
        let mut holds = Vec::new();
        let mut cursor = 0;

        for (i, op) in ops.iter().enumerate() {
            let opens_scope = i == 0 || ops[i - 1].origin != op.origin;
            let closes_scope = ops.get(i + 1).map_or(true, |next| next.origin != op.origin);
            let earliest = cursor.max(floors[i]);
            let mut start = earliest;
            let held = op.held();
            while let Some(clear) = occupancy.conflict(&held, start, start + op.ticks) {
                start = clear;
            }
            let end = start + op.ticks;
            if start > earliest {
                log::debug!(
                    "Procedure {}: {} (op {}) deferred from tick {} to {}",
                    procedure,
                    op.step.name(),
                    op.position,
                    earliest,
                    start
                );
            }

            if opens_scope {
                for node in scopes.get(&op.origin).into_iter().flatten() {
                    scoped.insert(node, (i, start));
                }
            }
            for (node, &(opener, since)) in open.iter().chain(&scoped) {
                if let Some(clear) = occupancy.conflict(std::iter::once(*node), since, end) {
                    floors[opener] = floors[opener].max(clear);
                    continue 'restart;
                }
            }

            for node in &op.locks.ongoing {
                open.entry(node).or_insert((i, start));
            }
            for node in &op.locks.released {
                if let Some((_, since)) = open.remove(node) {
                    holds.push(Hold {
                        procedure,
                        node: node.clone(),
                        start: since,
                        end,
                    });
                }
            }
            if closes_scope {
                for (node, (_, since)) in std::mem::take(&mut scoped) {
                    holds.push(Hold {
                        procedure,
                        node: node.clone(),
                        start: since,
                        end,
                    });
                }
            }
            starts.push(start);
            cursor = end;
        }

        if let Some(node) = open.keys().next() {
            return Err(ScheduleError::LockLeak {
                procedure,
                node: node.to_string(),
            });
        }
        return Ok((starts, holds));
    }
}

// ============================================================================
// 4. PLAYBACK
// ============================================================================

/// Plays a schedule tick group by tick group. Operations that start in the
/// same tick run concurrently; the next group starts once they all finish.
pub struct ScheduleRunner {
    runtime: Runtime,
}

impl ScheduleRunner {
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub async fn run(&self, schedule: &Schedule) -> Result<()> {
        let mut groups: BTreeMap<u64, Vec<&ScheduledStep>> = BTreeMap::new();
        for step in &schedule.steps {
            groups.entry(step.start).or_default().push(step);
        }

        for (tick, group) in groups {
            log::debug!("Tick {}: {} operation(s)", tick, group.len());
            let mut set = JoinSet::new();
            for scheduled in group {
                let rt = self.runtime.clone();
                let step = scheduled.step.clone();
                let procedure = scheduled.procedure;
                set.spawn(async move {
                    rt.run_operation(&step)
                        .await
                        .map_err(|e| e.context(format!("procedure {}", procedure)))
                });
            }
            while let Some(joined) = set.join_next().await {
                joined.map_err(|e| anyhow!("Scheduled operation did not complete: {}", e))??;
            }
        }
        Ok(())
    }
}
