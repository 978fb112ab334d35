// src/lib.rs
//
// =============================================================================
// LABCOMPILE: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

// 1. Declare Modules
pub mod artifact;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod parallelizer;
pub mod procedure;
pub mod resolver;
pub mod runtime;
pub mod step;
pub mod trace;
pub mod units;

// 2. Re-exports (The Public API)

pub use artifact::{CompiledProcedure, CompiledStep};
pub use config::CompilerConfig;
pub use error::{CompileError, GraphError, PropertyError, ScheduleError};
pub use executor::{compile, Executor};
pub use graph::{Apparatus, ApparatusKind, GraphDescription, ResourceGraph};
pub use parallelizer::{Parallelizer, Schedule, ScheduleRunner};
pub use procedure::Procedure;
pub use resolver::{BindingTable, Requirements, Resolver};
pub use runtime::{DeviceBackend, Runtime, SimulatedBackend};
pub use step::{Step, StepKind, Variant};
pub use trace::TraceBuffer;
