// src/error.rs
//
// =============================================================================
// LABCOMPILE: ERROR TAXONOMY
// =============================================================================
//
// Declaration errors   -> abort before any housekeeping insertion.
// Graph mismatches     -> fatal, reported with the offending step and node.
// Resource shortages   -> `NoSolvents`, a separately catchable class.
// Scheduling errors    -> raised while building a schedule, never mid-run.

use crate::units::UnitError;
use thiserror::Error;

/// Property access / construction failures on a single step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PropertyError {
    #[error("{step}: unknown property '{property}'")]
    UnknownProperty { step: String, property: String },

    #[error("{step}: property '{property}' = {value} is outside [{min}, {max}]")]
    Range {
        step: String,
        property: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{step}: invalid value for '{property}': {reason}")]
    InvalidValue {
        step: String,
        property: String,
        reason: String,
    },

    #[error("{step}: required property '{property}' is missing")]
    Missing { step: String, property: String },

    #[error("{step}: property '{property}' is internal and cannot be supplied")]
    Internal { step: String, property: String },

    #[error("{step}: {reason}")]
    Unit {
        step: String,
        reason: UnitError,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("duplicate node id '{0}' in graph description")]
    DuplicateNode(String),
    #[error("link references unknown node '{0}'")]
    UnknownNode(String),
    #[error("node '{node}' has invalid attribute: {reason}")]
    InvalidAttribute { node: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("step {index}: {source}")]
    Property {
        index: usize,
        #[source]
        source: PropertyError,
    },

    #[error("step {index} ({step}): reagent '{reagent}' is not declared")]
    ReagentNotDeclared {
        index: usize,
        step: String,
        reagent: String,
    },

    #[error("step {index} ({step}): vessel '{vessel}' is not declared")]
    VesselNotDeclared {
        index: usize,
        step: String,
        vessel: String,
    },

    #[error("step {index} ({step}): port '{port}' does not exist on '{vessel}' (ports: {available:?})")]
    InvalidPort {
        index: usize,
        step: String,
        vessel: String,
        port: String,
        available: Vec<String>,
    },

    #[error("step {index} ({step}): moving {volume:.2} mL into '{vessel}' exceeds its capacity of {capacity:.2} mL")]
    CapacityOverflow {
        index: usize,
        step: String,
        vessel: String,
        volume: f64,
        capacity: f64,
    },

    #[error("missing apparatus: {requirement}")]
    MissingApparatus {
        index: Option<usize>,
        requirement: String,
    },

    #[error("step {index} ({step}): no route from '{from}' to '{to}'")]
    NoRoute {
        index: usize,
        step: String,
        from: String,
        to: String,
    },

    #[error("vessel '{vessel}' cannot reach {temp:.1} °C (allowed {min:.1} to {max:.1} °C)")]
    TemperatureOutOfRange {
        vessel: String,
        temp: f64,
        min: f64,
        max: f64,
    },

    #[error("step {index}: no compatible cleaning solvent available after adding '{reagent}'")]
    NoSolvents { index: usize, reagent: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl CompileError {
    pub fn property(index: usize, source: PropertyError) -> Self {
        CompileError::Property { index, source }
    }

    /// Unresolved reagent/vessel names.
    pub fn is_declaration(&self) -> bool {
        matches!(
            self,
            CompileError::ReagentNotDeclared { .. } | CompileError::VesselNotDeclared { .. }
        )
    }

    /// Ports, capacities, routes and apparatus the graph cannot provide.
    pub fn is_graph_mismatch(&self) -> bool {
        matches!(
            self,
            CompileError::InvalidPort { .. }
                | CompileError::CapacityOverflow { .. }
                | CompileError::MissingApparatus { .. }
                | CompileError::NoRoute { .. }
                | CompileError::TemperatureOutOfRange { .. }
                | CompileError::Graph(_)
        )
    }

    /// The one warning-class error: a mandatory clean had no usable solvent.
    pub fn is_resource_shortage(&self) -> bool {
        matches!(self, CompileError::NoSolvents { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleError {
    #[error("procedure {procedure}: lock on '{node}' is never released")]
    LockLeak { procedure: usize, node: String },

    #[error("procedure {procedure}: step {step} locks unknown node '{node}'")]
    UnknownNode {
        procedure: usize,
        step: usize,
        node: String,
    },

    #[error("tick {tick}: '{node}' held by procedures {first} and {second}")]
    LockConflict {
        node: String,
        tick: u64,
        first: usize,
        second: usize,
    },

    #[error("procedure {procedure}: {source}")]
    Compile {
        procedure: usize,
        #[source]
        source: CompileError,
    },
}
