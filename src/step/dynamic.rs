// src/step/dynamic.rs
//
// =============================================================================
// LABCOMPILE: DYNAMIC STEP OWNERS
// =============================================================================
//
// A dynamic step does not know its children in advance. It hands the runtime
// an owner object that produces one finite primitive sequence per phase:
//
//   on_start     -> executed once, on entry
//   on_continue  -> executed repeatedly; an empty sequence ends the loop
//   on_finish    -> executed once, after the loop
//
// The state machine that drives an owner lives in `runtime::dynamic`.

use super::{Step, StepKind};
use crate::error::PropertyError;
use crate::step;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One live value an owner wants read between phases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorQuery {
    pub node: String,
    pub quantity: String,
}

/// Device state sampled after the previous phase finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feedback {
    /// Number of `on_continue` calls made before this one.
    pub cycle: usize,
    readings: BTreeMap<SensorQuery, f64>,
}

impl Feedback {
    pub fn new(cycle: usize) -> Self {
        Self {
            cycle,
            readings: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, query: SensorQuery, value: f64) {
        self.readings.insert(query, value);
    }

    pub fn reading(&self, node: &str, quantity: &str) -> Option<f64> {
        self.readings
            .iter()
            .find(|(q, _)| q.node == node && q.quantity == quantity)
            .map(|(_, v)| *v)
    }
}

pub trait DynamicOwner: Send {
    fn on_start(&mut self) -> Result<Vec<Step>, PropertyError>;

    fn on_continue(&mut self, feedback: &Feedback) -> Result<Vec<Step>, PropertyError>;

    fn on_finish(&mut self) -> Result<Vec<Step>, PropertyError>;

    /// Sensors to sample before each `on_continue`.
    fn watched(&self) -> Vec<SensorQuery> {
        Vec::new()
    }

    /// Upper bound on the time spent in the running phase, s. Used for
    /// scheduling, where the loop length cannot be known in advance.
    fn worst_case_s(&self) -> f64 {
        0.0
    }
}

// ============================================================================
// PURGE UNTIL STABLE
// ============================================================================

/// Purges a vessel with inert gas until two consecutive sensor readings agree
/// within `tolerance`, or `max_cycles` waits have elapsed.
#[derive(Debug, Clone)]
pub struct PurgeUntilStable {
    vessel: String,
    sensor: String,
    tolerance: f64,
    interval: f64,
    max_cycles: usize,
    cycles: usize,
    last: Option<f64>,
}

impl PurgeUntilStable {
    pub fn from_step(step: &Step) -> Result<Self, PropertyError> {
        Ok(Self {
            vessel: step.req_text("vessel")?.to_string(),
            sensor: step.req_text("sensor")?.to_string(),
            tolerance: step.req_number("tolerance")?,
            interval: step.req_number("interval")?,
            max_cycles: step.count("max_cycles")?,
            cycles: 0,
            last: None,
        })
    }
}

impl DynamicOwner for PurgeUntilStable {
    fn on_start(&mut self) -> Result<Vec<Step>, PropertyError> {
        self.cycles = 0;
        self.last = None;
        Ok(vec![step!(StartPurge { "vessel" => self.vessel.as_str() })?])
    }

    fn on_continue(&mut self, feedback: &Feedback) -> Result<Vec<Step>, PropertyError> {
        let current = feedback.reading(&self.vessel, &self.sensor);
        let stable = matches!(
            (self.last, current),
            (Some(prev), Some(now)) if (now - prev).abs() <= self.tolerance
        );
        self.last = current.or(self.last);

        if stable || self.cycles >= self.max_cycles {
            log::debug!(
                "PurgeUntilStable({}): done after {} cycles (stable: {})",
                self.vessel,
                self.cycles,
                stable
            );
            return Ok(Vec::new());
        }
        self.cycles += 1;
        Ok(vec![step!(Wait { "time" => self.interval })?])
    }

    fn on_finish(&mut self) -> Result<Vec<Step>, PropertyError> {
        Ok(vec![step!(StopPurge { "vessel" => self.vessel.as_str() })?])
    }

    fn watched(&self) -> Vec<SensorQuery> {
        vec![SensorQuery {
            node: self.vessel.clone(),
            quantity: self.sensor.clone(),
        }]
    }

    fn worst_case_s(&self) -> f64 {
        self.interval * self.max_cycles as f64
    }
}

/// Fresh owner for a dynamic step.
pub fn owner_for(step: &Step) -> Result<Box<dyn DynamicOwner>, PropertyError> {
    match step.kind {
        StepKind::PurgeUntilStable => Ok(Box::new(PurgeUntilStable::from_step(step)?)),
        _ => Err(PropertyError::InvalidValue {
            step: step.name().to_string(),
            property: "kind".into(),
            reason: "not a dynamic step".into(),
        }),
    }
}

/// Static view of a dynamic step (start + finish phases), used wherever the
/// step has to be expanded before it runs: binding, locks and scheduling.
pub(crate) fn static_phases(step: &Step) -> Result<Vec<Step>, PropertyError> {
    let mut owner = owner_for(step)?;
    let mut phases = owner.on_start()?;
    phases.extend(owner.on_finish()?);
    Ok(phases)
}
