// src/executor/housekeeping.rs
//
// Compiler-generated steps. Runs on the expanded top-level groups, in source
// order, then once more over the flat sequence for stir bracketing.

use super::{entries, flatten, text_of};
use crate::artifact::CompiledStep;
use crate::config::CompilerConfig;
use crate::error::{CompileError, PropertyError};
use crate::graph::ResourceGraph;
use crate::resolver::BindingTable;
use crate::step;
use crate::step::{ExpandCtx, Step, StepKind};
use std::collections::BTreeSet;

/// A bound top-level step together with its expansion.
pub(crate) struct Group {
    pub origin: usize,
    pub source: Step,
    pub ops: Vec<Step>,
}

pub(crate) struct Housekeeper<'a> {
    graph: &'a ResourceGraph,
    config: &'a CompilerConfig,
    table: &'a BindingTable,
}

impl<'a> Housekeeper<'a> {
    pub fn new(graph: &'a ResourceGraph, config: &'a CompilerConfig, table: &'a BindingTable) -> Self {
        Self { graph, config, table }
    }

    pub fn run(&self, groups: &[Group]) -> Result<Vec<CompiledStep>, CompileError> {
        let mut out = Vec::new();
        let mut last_solvent: Option<String> = None;
        // Chemicals pushed through the backbone since its last clean.
        let mut residue: BTreeSet<String> = BTreeSet::new();
        let mut previous: Option<&Group> = None;

        for group in groups {
            if let Some(removal) = self.dead_volume_removal(group, previous)? {
                out.extend(entries(group.origin, removal));
            }
            out.extend(entries(group.origin, group.ops.clone()));

            let mut added = Vec::new();
            collect_chemicals(&group.source, &mut |kind, prop, reagent| {
                let chemical = self.chemical_of(reagent);
                if self.config.cleaning.is_solvent(&chemical) {
                    last_solvent = Some(chemical);
                } else if kind == StepKind::Add && prop == "reagent" {
                    added.push(chemical);
                }
            });

            for chemical in added {
                residue.insert(chemical.clone());
                let required = self.config.cleaning.required_cleans(&chemical);
                match self.choose_solvent(&residue, last_solvent.as_deref()) {
                    Some((solvent, flask)) => {
                        let cleans = required.max(1);
                        log::debug!(
                            "Step {}: {} backbone clean(s) with '{}' after '{}'",
                            group.origin,
                            cleans,
                            solvent,
                            chemical
                        );
                        for _ in 0..cleans {
                            out.extend(entries(group.origin, self.clean(&solvent, &flask, group.origin)?));
                        }
                        last_solvent = Some(solvent);
                        residue.clear();
                    }
                    None if required > 0 => {
                        return Err(CompileError::NoSolvents {
                            index: group.origin,
                            reagent: chemical,
                        })
                    }
                    None => log::warn!(
                        "Step {}: no compatible cleaning solvent after '{}'; clean skipped",
                        group.origin,
                        chemical
                    ),
                }
            }
            previous = Some(group);
        }

        self.bracket_stirring(out)
    }

    fn ctx(&self) -> ExpandCtx<'a> {
        ExpandCtx::new(Some(self.graph), self.config)
    }

    fn chemical_of(&self, reagent: &str) -> String {
        self.table
            .reagent_flask(reagent)
            .and_then(|flask| self.graph.node(flask))
            .and_then(|node| node.chemical.clone())
            .unwrap_or_else(|| reagent.to_string())
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

    // ------------------------------------------------------------------------
    // Backbone cleaning
    // ------------------------------------------------------------------------

    /// The last solvent used if it is still usable, else the first usable one
    /// in policy order. Usable: has a flask and is compatible with everything
    /// left in the line.
    fn choose_solvent(&self, residue: &BTreeSet<String>, last: Option<&str>) -> Option<(String, String)> {
        let policy = &self.config.cleaning;
        let usable = |solvent: &str| -> Option<(String, String)> {
            if residue.iter().any(|r| policy.incompatible(r, solvent)) {
                return None;
            }
            self.graph
                .flask_for(solvent)
                .map(|flask| (solvent.to_string(), flask.id.clone()))
        };
        last.and_then(usable)
            .or_else(|| policy.solvents.iter().find_map(|s| usable(s.as_str())))
    }

    fn clean(&self, solvent: &str, flask: &str, index: usize) -> Result<Vec<Step>, CompileError> {
        let prop = |e: PropertyError| CompileError::property(index, e);
        let mut step = step!(CleanBackbone {
            "solvent" => solvent,
            "volume" => self.config.cleaning.clean_volume_ml,
        })
        .map_err(prop)?;
        step.set_internal("solvent_vessel", flask).map_err(prop)?;
        step.set_internal("waste_vessel", self.waste(flask, index)?).map_err(prop)?;
        flatten(&step, self.ctx()).map_err(prop)
    }

    // ------------------------------------------------------------------------
    // Dead volume
    // ------------------------------------------------------------------------

    fn dead_volume_removal(
        &self,
        group: &Group,
        previous: Option<&Group>,
    ) -> Result<Option<Vec<Step>>, CompileError> {
        let Some(filter) = filter_vessel(&group.source, group.origin)? else {
            return Ok(None);
        };
        if let Some(prev) = previous {
            if filter_vessel(&prev.source, prev.origin)?.as_deref() == Some(filter.as_str()) {
                return Ok(None);
            }
        }
        let dead_volume = match self.graph.node(&filter) {
            Some(node) if node.dead_volume > 0.0 => node.dead_volume,
            _ => return Ok(None),
        };

        let prop = |e: PropertyError| CompileError::property(group.origin, e);
        let mut step = step!(RemoveFilterDeadVolume {
            "filter_vessel" => filter.as_str(),
            "dead_volume" => dead_volume,
        })
        .map_err(prop)?;
        step.set_internal("waste_vessel", self.waste(&filter, group.origin)?)
            .map_err(prop)?;
        log::debug!(
            "Step {}: removing {} mL dead volume from '{}'",
            group.origin,
            dead_volume,
            filter
        );
        Ok(Some(flatten(&step, self.ctx()).map_err(prop)?))
    }

    // ------------------------------------------------------------------------
    // Stir bracketing
    // ------------------------------------------------------------------------

    /// Before a transfer of a vessel's entire contents, stop stirring it; after,
    /// stop its temperature control if that was running. Stirrers and heaters
    /// still on at the end of the procedure are stopped there.
    fn bracket_stirring(&self, seq: Vec<CompiledStep>) -> Result<Vec<CompiledStep>, CompileError> {
        let mut stirring = BTreeSet::new();
        let mut heating = BTreeSet::new();
        let mut out = Vec::with_capacity(seq.len());

        for entry in seq {
            let origin = entry.origin;
            let prop = |e: PropertyError| CompileError::property(origin, e);
            let drains = entry.step.kind == StepKind::Move
                && entry.step.amount("volume").map_err(prop)?.map_or(false, |a| a.is_all());
            match entry.step.kind {
                StepKind::StartStir | StepKind::StopStir | StepKind::StartHeatChill | StepKind::StopHeatChill => {
                    let vessel = entry.step.req_text("vessel").map_err(prop)?.to_string();
                    match entry.step.kind {
                        StepKind::StartStir => stirring.insert(vessel),
                        StepKind::StopStir => stirring.remove(&vessel),
                        StepKind::StartHeatChill => heating.insert(vessel),
                        _ => heating.remove(&vessel),
                    };
                }
                StepKind::Move if drains => {
                    let from = entry.step.req_text("from_vessel").map_err(prop)?.to_string();
                    if stirring.remove(&from) {
                        let stop = step!(StopStir { "vessel" => from.as_str() }).map_err(prop)?;
                        out.push(CompiledStep { origin, step: stop });
                    }
                    let stop_heating = heating.remove(&from);
                    out.push(entry);
                    if stop_heating {
                        let stop = step!(StopHeatChill { "vessel" => from.as_str() }).map_err(prop)?;
                        out.push(CompiledStep { origin, step: stop });
                    }
                    continue;
                }
                _ => {}
            }
            out.push(entry);
        }

        // Nothing keeps running once the procedure ends.
        if let Some(origin) = out.last().map(|e| e.origin) {
            let prop = |e: PropertyError| CompileError::property(origin, e);
            for vessel in &stirring {
                let stop = step!(StopStir { "vessel" => vessel.as_str() }).map_err(prop)?;
                out.push(CompiledStep { origin, step: stop });
            }
            for vessel in &heating {
                let stop = step!(StopHeatChill { "vessel" => vessel.as_str() }).map_err(prop)?;
                out.push(CompiledStep { origin, step: stop });
            }
            if !stirring.is_empty() || !heating.is_empty() {
                log::debug!(
                    "Step {}: stopping {} stirrer(s) and {} heater(s) left running",
                    origin,
                    stirring.len(),
                    heating.len()
                );
            }
        }
        Ok(out)
    }
}

/// Vessel drained through a frit by a filtration step.
fn filter_vessel(step: &Step, origin: usize) -> Result<Option<String>, CompileError> {
    match step.kind {
        StepKind::Filter => text_of(step, "filter_vessel", origin),
        StepKind::WashSolid => text_of(step, "vessel", origin),
        _ => Ok(None),
    }
}

/// Visits every reagent-typed property (kind, property, reagent id) of a
/// top-level step and its repeated body. Async bodies run off the main line
/// and are not visited.
fn collect_chemicals(step: &Step, f: &mut dyn FnMut(StepKind, &str, &str)) {
    for spec in crate::step::schema::schema(step.kind) {
        if spec.ty != crate::step::PropType::Reagent || spec.name == "through" {
            continue;
        }
        if let Ok(Some(reagent)) = step.text(spec.name) {
            f(step.kind, spec.name, reagent);
        }
    }
    if step.kind == StepKind::Repeat {
        for child in step.body() {
            collect_chemicals(child, f);
        }
    }
}
