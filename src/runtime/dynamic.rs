// src/runtime/dynamic.rs
//
// Phase state machine for dynamic steps.
//
//   Start --on_start--> Running --on_continue (non-empty)--> Running
//                       Running --on_continue (empty)------> Finishing
//                       Finishing --on_finish--> Done
//
// Each phase's sequence runs to completion before the next is requested.

use super::Runtime;
use crate::step::dynamic::DynamicOwner;
use crate::step::{Step, StepKind, Variant};
use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Running,
    Finishing,
    Done,
}

pub struct DynamicRunner {
    owner: Box<dyn DynamicOwner>,
    phase: Phase,
    cycles: usize,
    history: Vec<Phase>,
}

impl DynamicRunner {
    pub fn new(owner: Box<dyn DynamicOwner>) -> Self {
        Self {
            owner,
            phase: Phase::Start,
            cycles: 0,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases entered so far; `Running` appears once per non-empty cycle.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub async fn run(&mut self, runtime: &Runtime) -> Result<()> {
        loop {
            match self.phase {
                Phase::Start => {
                    self.history.push(Phase::Start);
                    let seq = self.owner.on_start()?;
                    play(runtime, &seq).await?;
                    self.phase = Phase::Running;
                }
                Phase::Running => {
                    let feedback = runtime.sample(&self.owner.watched(), self.cycles).await?;
                    let seq = self.owner.on_continue(&feedback)?;
                    if seq.is_empty() {
                        self.phase = Phase::Finishing;
                        continue;
                    }
                    self.history.push(Phase::Running);
                    self.cycles += 1;
                    play(runtime, &seq).await?;
                }
                Phase::Finishing => {
                    self.history.push(Phase::Finishing);
                    let seq = self.owner.on_finish()?;
                    play(runtime, &seq).await?;
                    self.phase = Phase::Done;
                }
                Phase::Done => {
                    self.history.push(Phase::Done);
                    log::debug!("Dynamic step done after {} cycles", self.cycles);
                    return Ok(());
                }
            }
        }
    }
}

async fn play(runtime: &Runtime, seq: &[Step]) -> Result<()> {
    for step in seq {
        if step.variant() != Variant::Base || step.kind == StepKind::AwaitAsync {
            bail!("Dynamic owners may only emit device steps, got {}", step.name());
        }
        runtime.issue(step).await?;
    }
    Ok(())
}
