// src/executor.rs
//
// =============================================================================
// LABCOMPILE: EXECUTOR (v 0.3)
// =============================================================================
//
// The Compiler Pipeline.
//
// Stages, strictly ordered:
// 1. Bind:        declarations -> resolver -> every vessel/reagent rewritten
//                 to a node, internal properties filled, ports validated.
// 2. Expand:      composite steps flattened to base steps. Dynamic steps stay
//                 whole; async steps keep a flattened body.
// 3. Housekeep:   backbone cleans, dead-volume removal, stir bracketing.
// 4. Volumes:     destination capacity, routes, estimated move volumes.
// 5. Scopes:      nodes each composite or dynamic source step keeps for its
//                 whole span, for the Parallelizer.
//
// Stage 1-2 failures abort before any housekeeping is inserted.

use crate::artifact::{CompiledProcedure, CompiledStep};
use crate::config::CompilerConfig;
use crate::error::{CompileError, PropertyError};
use crate::graph::ResourceGraph;
use crate::procedure::Procedure;
use crate::resolver::{check_declarations, BindingTable, Resolver};
use crate::step::{ExpandCtx, Step, StepKind, Variant};
use std::collections::{BTreeMap, BTreeSet};

mod housekeeping;
mod volumes;

use housekeeping::Group;

pub struct Executor<'a> {
    graph: &'a ResourceGraph,
    config: &'a CompilerConfig,
}

impl<'a> Executor<'a> {
    pub fn new(graph: &'a ResourceGraph, config: &'a CompilerConfig) -> Self {
        Self { graph, config }
    }

    pub fn compile(&self, procedure: &Procedure) -> Result<CompiledProcedure, CompileError> {
        // 1. Bind
        check_declarations(procedure)?;
        let resolution = Resolver::new(self.graph, self.config).resolve(procedure)?;
        let table = resolution.bindings;
        let bound = procedure
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| self.bind(step, index, &table))
            .collect::<Result<Vec<_>, _>>()?;

        let scopes = self.scopes(&bound);

        // 2. Expand
        let ctx = self.ctx();
        let groups = bound
            .into_iter()
            .enumerate()
            .map(|(origin, source)| {
                let ops = flatten(&source, ctx).map_err(|e| CompileError::property(origin, e))?;
                Ok(Group { origin, source, ops })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;

        // 3. Housekeeping
        let steps = housekeeping::Housekeeper::new(self.graph, self.config, &table).run(&groups)?;

        // 4. Volumes & routes
        let steps = volumes::VolumeTracker::new(self.graph).check(steps)?;

        log::info!(
            "Compiled {} source steps into {} operations",
            procedure.steps.len(),
            steps.len()
        );
        Ok(CompiledProcedure::new(table, steps).with_scopes(scopes))
    }

    // ------------------------------------------------------------------------
    // Stage 5
    // ------------------------------------------------------------------------

    /// Async wrappers run off the main line and get no scope.
    fn scopes(&self, bound: &[Step]) -> BTreeMap<usize, BTreeSet<String>> {
        bound
            .iter()
            .enumerate()
            .filter(|(_, step)| matches!(step.variant(), Variant::Composite | Variant::Dynamic))
            .filter_map(|(origin, step)| {
                let locks = step.locks(Some(self.graph));
                let nodes: BTreeSet<String> = locks.locked.union(&locks.ongoing).cloned().collect();
                (!nodes.is_empty()).then_some((origin, nodes))
            })
            .collect()
    }

    fn ctx(&self) -> ExpandCtx<'a> {
        ExpandCtx::new(Some(self.graph), self.config)
    }

    // ------------------------------------------------------------------------
    // Stage 1
    // ------------------------------------------------------------------------

    fn bind(&self, step: &Step, index: usize, table: &BindingTable) -> Result<Step, CompileError> {
        let mut bound = table.bind_step(step, index)?;
        self.fill_internals(&mut bound, index, table)?;
        Ok(bound)
    }

    fn fill_internals(&self, step: &mut Step, index: usize, table: &BindingTable) -> Result<(), CompileError> {
        let prop = |e: PropertyError| CompileError::property(index, e);
        self.validate_ports(step, index)?;

        match step.kind {
            StepKind::Add => {
                let reagent = step.req_text("reagent").map_err(prop)?.to_string();
                let flask = self.flask(table, &reagent, index)?;
                step.set_internal("reagent_vessel", flask).map_err(prop)?;
            }
            StepKind::Transfer => {
                if let Some(chemical) = step.text("through").map_err(prop)?.map(str::to_string) {
                    let cartridge = self.cartridge(table, &chemical, index)?;
                    step.set_internal("cartridge", cartridge).map_err(prop)?;
                }
            }
            StepKind::Filter => {
                if step.text("filtrate_vessel").map_err(prop)?.is_none() {
                    let filter = step.req_text("filter_vessel").map_err(prop)?.to_string();
                    step.set_internal("waste_vessel", self.waste(&filter, index)?).map_err(prop)?;
                }
            }
            StepKind::WashSolid => {
                let vessel = step.req_text("vessel").map_err(prop)?.to_string();
                let solvent = step.req_text("solvent").map_err(prop)?.to_string();
                step.set_internal("solvent_vessel", self.flask(table, &solvent, index)?).map_err(prop)?;
                step.set_internal("waste_vessel", self.waste(&vessel, index)?).map_err(prop)?;
                if let Some(cap) = self.graph.node(&vessel).and_then(|n| n.capacity) {
                    step.set_internal("vessel_capacity", cap).map_err(prop)?;
                }
            }
            StepKind::FilterThrough => {
                let from = step.req_text("from_vessel").map_err(prop)?.to_string();
                let to = step.req_text("to_vessel").map_err(prop)?.to_string();
                let chemical = step.req_text("through").map_err(prop)?.to_string();
                step.set_internal("cartridge", self.cartridge(table, &chemical, index)?).map_err(prop)?;
                if let Some(solvent) = step.text("eluting_solvent").map_err(prop)?.map(str::to_string) {
                    step.set_internal("solvent_vessel", self.flask(table, &solvent, index)?).map_err(prop)?;
                }
                if from == to {
                    step.set_internal("buffer_flasks", table.buffer_flasks.clone()).map_err(prop)?;
                }
                if let Some(cap) = self.graph.node(&from).and_then(|n| n.capacity) {
                    step.set_internal("from_capacity", cap).map_err(prop)?;
                }
            }
            StepKind::Separate => {
                let separator = step.req_text("separation_vessel").map_err(prop)?.to_string();
                if let Some(solvent) = step.text("solvent").map_err(prop)?.map(str::to_string) {
                    step.set_internal("solvent_vessel", self.flask(table, &solvent, index)?).map_err(prop)?;
                }
                if step.text("waste_phase_to_vessel").map_err(prop)?.is_none() {
                    step.set_internal("waste_vessel", self.waste(&separator, index)?).map_err(prop)?;
                }
                if !table.buffer_flasks.is_empty() {
                    step.set_internal("buffer_flasks", table.buffer_flasks.clone()).map_err(prop)?;
                }
                if let Some(cap) = self.graph.node(&separator).and_then(|n| n.capacity) {
                    step.set_internal("separator_capacity", cap).map_err(prop)?;
                }
            }
            _ => {}
        }

        if step.kind.takes_body() {
            for child in step.body_mut() {
                self.fill_internals(child, index, table)?;
            }
        }
        Ok(())
    }

    /// Explicit ports must exist on the bound node.
    fn validate_ports(&self, step: &Step, index: usize) -> Result<(), CompileError> {
        const PAIRS: &[(&str, &str)] = &[
            ("port", "vessel"),
            ("from_port", "from_vessel"),
            ("to_port", "to_vessel"),
        ];
        for (port_prop, vessel_prop) in PAIRS {
            let (Ok(Some(port)), Ok(Some(vessel))) = (step.text(port_prop), step.text(vessel_prop)) else {
                continue;
            };
            let Some(node) = self.graph.node(vessel) else {
                continue;
            };
            if !node.ports.iter().any(|p| p == port) {
                return Err(CompileError::InvalidPort {
                    index,
                    step: step.name().to_string(),
                    vessel: vessel.to_string(),
                    port: port.to_string(),
                    available: node.ports.clone(),
                });
            }
        }
        Ok(())
    }

    fn flask(&self, table: &BindingTable, reagent: &str, index: usize) -> Result<String, CompileError> {
        table
            .reagent_flask(reagent)
            .map(str::to_string)
            .ok_or_else(|| CompileError::MissingApparatus {
                index: Some(index),
                requirement: format!("flask of '{}'", reagent),
            })
    }

    fn cartridge(&self, table: &BindingTable, chemical: &str, index: usize) -> Result<String, CompileError> {
        table
            .cartridge(chemical)
            .map(str::to_string)
            .ok_or_else(|| CompileError::MissingApparatus {
                index: Some(index),
                requirement: format!("cartridge of '{}'", chemical),
            })
    }

    fn waste(&self, from: &str, index: usize) -> Result<String, CompileError> {
        self.graph
            .nearest_waste(from)
            .map(|w| w.id.clone())
            .ok_or_else(|| CompileError::MissingApparatus {
                index: Some(index),
                requirement: format!("waste reachable from '{}'", from),
            })
    }
}

/// One-call compilation.
pub fn compile(
    procedure: &Procedure,
    graph: &ResourceGraph,
    config: &CompilerConfig,
) -> Result<CompiledProcedure, CompileError> {
    Executor::new(graph, config).compile(procedure)
}

// ============================================================================
// Stage 2: flattening
// ============================================================================

pub(crate) fn flatten(step: &Step, ctx: ExpandCtx<'_>) -> Result<Vec<Step>, PropertyError> {
    match step.variant() {
        Variant::Base | Variant::Dynamic => Ok(vec![step.clone()]),
        Variant::Async => {
            let mut body = Vec::new();
            for child in step.body() {
                body.extend(flatten(child, ctx)?);
            }
            Ok(vec![step.clone().with_body(body)?])
        }
        Variant::Composite => {
            let mut out = Vec::new();
            for child in step.substeps(ctx)? {
                out.extend(flatten(child, ctx)?);
            }
            Ok(out)
        }
    }
}

pub(crate) fn entries(origin: usize, steps: Vec<Step>) -> impl Iterator<Item = CompiledStep> {
    steps.into_iter().map(move |step| CompiledStep { origin, step })
}

/// Reads a text property that a compiled step is known to carry.
pub(crate) fn text_of(step: &Step, name: &str, origin: usize) -> Result<Option<String>, CompileError> {
    step.text(name)
        .map(|v| v.map(str::to_string))
        .map_err(|e| CompileError::property(origin, e))
}
