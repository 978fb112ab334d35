// src/resolver.rs
//
// =============================================================================
// LABCOMPILE: GRAPH RESOLVER (v 0.3)
// =============================================================================
//
// Responsibilities:
// 1. Derive what a procedure needs from the platform (reagent flasks, buffer
//    flasks, cartridges, temperature control), with or without a graph.
// 2. Bind every abstract name (vessel role, reagent) to a concrete node.
// 3. Emit a template graph description when no platform exists yet.
//
// The resolver only reads the graph. Speculative sizing runs on clones.

use crate::config::{normalise, CompilerConfig};
use crate::error::{CompileError, PropertyError};
use crate::graph::{Apparatus, ApparatusKind, GraphDescription, ResourceGraph};
use crate::procedure::Procedure;
use crate::step::expand::buffer_flasks_needed;
use crate::step::{ExpandCtx, PropType, PropValue, Step, StepKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// 1. REQUIREMENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferFlaskRequirement {
    pub count: usize,
    /// Vessel the flasks should sit next to.
    pub anchor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartridgeRequirement {
    pub chemical: String,
    pub from_vessel: String,
    pub to_vessel: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPoint {
    pub temp: f64,
    /// False when the vessel is only left to reach the temperature on its own.
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    /// Reagent ids in order of first use.
    pub reagents: Vec<String>,
    pub buffer_flasks: Option<BufferFlaskRequirement>,
    pub cartridges: Vec<CartridgeRequirement>,
    pub temperatures: BTreeMap<String, Vec<SetPoint>>,
}

impl Requirements {
    /// Graph-independent worst case, for template generation.
    pub fn template(procedure: &Procedure, config: &CompilerConfig) -> Result<Self, CompileError> {
        derive(procedure, None, config)
    }

    /// Requirements against a concrete graph. Hardware roles must already be
    /// bound in `table` so split counts can see real capacities.
    pub fn against(
        procedure: &Procedure,
        graph: &ResourceGraph,
        table: &BindingTable,
        config: &CompilerConfig,
    ) -> Result<Self, CompileError> {
        derive(procedure, Some((graph, table)), config)
    }

    /// Skeleton platform that satisfies these requirements: one node per
    /// hardware role, one flask per reagent, empty buffer flasks, one
    /// cartridge per chemical and a waste, all on a shared backbone valve.
    pub fn template_graph(&self, procedure: &Procedure, config: &CompilerConfig) -> GraphDescription {
        const BACKBONE: &str = "backbone_valve";
        let mut desc = GraphDescription::default().node(Apparatus::new(BACKBONE, ApparatusKind::Valve));
        let mut attach = |desc: GraphDescription, node: Apparatus| {
            let id = node.id.clone();
            desc.node(node).connect(BACKBONE, &id)
        };

        for hw in &procedure.hardware {
            let mut node = Apparatus::new(hw.id.clone(), hw.kind);
            if hw.kind == ApparatusKind::Separator {
                node = node.capacity(config.separation.template_separator_capacity_ml);
            }
            if hw.kind == ApparatusKind::Filter {
                node = node.ports(&["top", "bottom"]);
            }
            if let Some(points) = self.temperatures.get(&hw.id) {
                if points.iter().any(|p| p.active) {
                    node = node.heater().chiller();
                }
            }
            if matches!(hw.kind, ApparatusKind::Reactor | ApparatusKind::Separator) {
                node = node.stirrer();
            }
            desc = attach(desc, node);
        }
        for reagent in &self.reagents {
            let chemical = procedure
                .reagent_decl(reagent)
                .map(|r| r.chemical().to_string())
                .unwrap_or_else(|| reagent.clone());
            desc = attach(
                desc,
                Apparatus::new(format!("flask_{}", reagent), ApparatusKind::Flask).chemical(chemical),
            );
        }
        if let Some(buffers) = &self.buffer_flasks {
            for i in 1..=buffers.count {
                desc = attach(desc, Apparatus::new(format!("buffer_flask_{}", i), ApparatusKind::Flask));
            }
        }
        for cartridge in &self.cartridges {
            desc = attach(
                desc,
                Apparatus::new(format!("cartridge_{}", cartridge.chemical), ApparatusKind::Cartridge)
                    .chemical(cartridge.chemical.clone()),
            );
        }
        attach(desc, Apparatus::new("waste", ApparatusKind::Waste))
    }
}

/// Buffer flasks `step` needs, found by expanding a private copy of it
/// against `graph` and counting the sub-separations it produces.
pub fn simulate_requirement(
    step: &Step,
    graph: Option<&ResourceGraph>,
    config: &CompilerConfig,
) -> Result<usize, PropertyError> {
    let trial = step.clone();
    match trial.kind {
        StepKind::FilterThrough => buffer_flasks_needed(&trial, 1),
        StepKind::Separate => {
            let children = trial.expand(ExpandCtx::new(graph, config))?;
            let splits = children
                .iter()
                .filter(|s| s.kind == StepKind::SeparatePhases)
                .count();
            buffer_flasks_needed(&trial, splits)
        }
        _ => Ok(0),
    }
}

/// Calls `f` on every user-written step, bodies included, with the index of
/// the top-level step it belongs to.
fn walk<'s>(steps: &'s [Step], f: &mut dyn FnMut(usize, &'s Step) -> Result<(), CompileError>) -> Result<(), CompileError> {
    fn inner<'s>(
        index: usize,
        step: &'s Step,
        f: &mut dyn FnMut(usize, &'s Step) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        f(index, step)?;
        for child in step.body() {
            inner(index, child, f)?;
        }
        Ok(())
    }
    for (index, step) in steps.iter().enumerate() {
        inner(index, step, f)?;
    }
    Ok(())
}

fn reagent_props(step: &Step) -> impl Iterator<Item = &str> {
    crate::step::schema::schema(step.kind)
        .iter()
        .filter(|spec| spec.ty == PropType::Reagent && spec.name != "through")
        .filter_map(move |spec| step.text(spec.name).ok().flatten())
}

fn derive(
    procedure: &Procedure,
    bound: Option<(&ResourceGraph, &BindingTable)>,
    config: &CompilerConfig,
) -> Result<Requirements, CompileError> {
    let mut req = Requirements::default();
    let mut seen_cartridges = BTreeSet::new();

    walk(&procedure.steps, &mut |index, step| {
        for reagent in reagent_props(step) {
            if !req.reagents.iter().any(|r| r == reagent) {
                req.reagents.push(reagent.to_string());
            }
        }

        let count = match bound {
            Some((graph, table)) => {
                // Unbindable names surface later as declaration errors.
                let trial = table.bind_step(step, index).unwrap_or_else(|_| step.clone());
                simulate_requirement(&trial, Some(graph), config)
            }
            None => simulate_requirement(step, None, config),
        }
        .map_err(|e| CompileError::property(index, e))?;

        if count > 0 {
            let anchor = step.req_text("from_vessel").map_err(|e| CompileError::property(index, e))?;
            let larger = req.buffer_flasks.as_ref().map_or(true, |b| count > b.count);
            if larger {
                req.buffer_flasks = Some(BufferFlaskRequirement {
                    count,
                    anchor: anchor.to_string(),
                });
            }
        }

        if matches!(step.kind, StepKind::FilterThrough | StepKind::Transfer) {
            if let Some(chemical) = step.text("through").map_err(|e| CompileError::property(index, e))? {
                if seen_cartridges.insert(normalise(chemical)) {
                    req.cartridges.push(CartridgeRequirement {
                        chemical: chemical.to_string(),
                        from_vessel: step.req_text("from_vessel").map_err(|e| CompileError::property(index, e))?.to_string(),
                        to_vessel: step.req_text("to_vessel").map_err(|e| CompileError::property(index, e))?.to_string(),
                    });
                }
            }
        }

        if matches!(step.kind, StepKind::HeatChill | StepKind::HeatChillToTemp | StepKind::SetTemp) {
            let vessel = step.req_text("vessel").map_err(|e| CompileError::property(index, e))?;
            let point = SetPoint {
                temp: step.req_number("temp").map_err(|e| CompileError::property(index, e))?,
                active: step.kind == StepKind::SetTemp
                    || step.flag("active").map_err(|e| CompileError::property(index, e))?,
            };
            req.temperatures.entry(vessel.to_string()).or_default().push(point);
        }
        Ok(())
    })?;

    Ok(req)
}

// ============================================================================
// 2. DECLARATIONS
// ============================================================================

/// Every reagent and vessel name used by the steps must be declared.
pub fn check_declarations(procedure: &Procedure) -> Result<(), CompileError> {
    walk(&procedure.steps, &mut |index, step| {
        for spec in crate::step::schema::schema(step.kind) {
            if spec.internal {
                continue;
            }
            let Some(name) = step.text(spec.name).ok().flatten() else {
                continue;
            };
            match spec.ty {
                PropType::Reagent if spec.name != "through" => {
                    if procedure.reagent_decl(name).is_none() {
                        return Err(CompileError::ReagentNotDeclared {
                            index,
                            step: step.name().to_string(),
                            reagent: name.to_string(),
                        });
                    }
                }
                PropType::Vessel => {
                    if procedure.hardware_decl(name).is_none() && procedure.reagent_decl(name).is_none() {
                        return Err(CompileError::VesselNotDeclared {
                            index,
                            step: step.name().to_string(),
                            vessel: name.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        Ok(())
    })
}

// ============================================================================
// 3. BINDING TABLE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingTable {
    /// Vessel role -> node.
    pub vessels: BTreeMap<String, String>,
    /// Reagent id -> flask node.
    pub reagents: BTreeMap<String, String>,
    /// Normalised cartridge chemical -> cartridge node.
    pub cartridges: BTreeMap<String, String>,
    pub buffer_flasks: Vec<String>,
}

impl BindingTable {
    pub fn vessel(&self, name: &str) -> Option<&str> {
        self.vessels
            .get(name)
            .or_else(|| self.reagents.get(name))
            .map(String::as_str)
    }

    pub fn reagent_flask(&self, reagent: &str) -> Option<&str> {
        self.reagents.get(reagent).map(String::as_str)
    }

    pub fn cartridge(&self, chemical: &str) -> Option<&str> {
        self.cartridges.get(&normalise(chemical)).map(String::as_str)
    }

    /// Every node the table hands out.
    pub fn bound_nodes(&self) -> BTreeSet<&str> {
        self.vessels
            .values()
            .chain(self.reagents.values())
            .chain(self.cartridges.values())
            .chain(self.buffer_flasks.iter())
            .map(String::as_str)
            .collect()
    }

    /// Copy of `step` (and its user body) with every vessel role rewritten
    /// to its node.
    pub fn bind_step(&self, step: &Step, index: usize) -> Result<Step, CompileError> {
        let mut bound = step.clone();
        for spec in crate::step::schema::schema(step.kind) {
            if spec.ty != PropType::Vessel || spec.internal {
                continue;
            }
            let Some(name) = step.text(spec.name).map_err(|e| CompileError::property(index, e))? else {
                continue;
            };
            let node = self.vessel(name).ok_or_else(|| CompileError::VesselNotDeclared {
                index,
                step: step.name().to_string(),
                vessel: name.to_string(),
            })?;
            bound
                .set(spec.name, PropValue::from(node))
                .map_err(|e| CompileError::property(index, e))?;
        }
        let body = step
            .body()
            .iter()
            .map(|child| self.bind_step(child, index))
            .collect::<Result<Vec<_>, _>>()?;
        if !body.is_empty() {
            *bound.body_mut() = body;
        }
        Ok(bound)
    }
}

// ============================================================================
// 4. RESOLUTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub requirements: Requirements,
    pub bindings: BindingTable,
}

pub struct Resolver<'a> {
    graph: &'a ResourceGraph,
    config: &'a CompilerConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(graph: &'a ResourceGraph, config: &'a CompilerConfig) -> Self {
        Self { graph, config }
    }

    pub fn resolve(&self, procedure: &Procedure) -> Result<Resolution, CompileError> {
        let mut table = BindingTable::default();
        self.bind_hardware(procedure, &mut table)?;

        let requirements = Requirements::against(procedure, self.graph, &table, self.config)?;
        self.bind_reagents(procedure, &requirements, &mut table)?;
        self.bind_buffer_flasks(&requirements, &mut table)?;
        self.bind_cartridges(&requirements, &mut table)?;
        self.check_temperatures(&requirements, &table)?;

        log::info!(
            "Resolved {} vessels, {} reagent flasks, {} buffer flasks, {} cartridges",
            table.vessels.len(),
            table.reagents.len(),
            table.buffer_flasks.len(),
            table.cartridges.len()
        );
        Ok(Resolution {
            requirements,
            bindings: table,
        })
    }

    fn missing(requirement: String) -> CompileError {
        CompileError::MissingApparatus {
            index: None,
            requirement,
        }
    }

    fn bind_hardware(&self, procedure: &Procedure, table: &mut BindingTable) -> Result<(), CompileError> {
        for hw in &procedure.hardware {
            let taken: BTreeSet<&str> = table.vessels.values().map(String::as_str).collect();
            let node = match &hw.node {
                Some(explicit) => {
                    if !self.graph.contains(explicit) {
                        return Err(Self::missing(format!("node '{}' for vessel '{}'", explicit, hw.id)));
                    }
                    explicit.clone()
                }
                None if self.graph.contains(&hw.id) && !taken.contains(hw.id.as_str()) => hw.id.clone(),
                None => self
                    .graph
                    .nodes_of_kind(hw.kind)
                    .into_iter()
                    .find(|n| !taken.contains(n.id.as_str()))
                    .map(|n| n.id.clone())
                    .ok_or_else(|| Self::missing(format!("{:?} for vessel '{}'", hw.kind, hw.id)))?,
            };
            log::debug!("Vessel '{}' -> node '{}'", hw.id, node);
            table.vessels.insert(hw.id.clone(), node);
        }
        Ok(())
    }

    fn bind_reagents(
        &self,
        procedure: &Procedure,
        requirements: &Requirements,
        table: &mut BindingTable,
    ) -> Result<(), CompileError> {
        for decl in &procedure.reagents {
            match self.graph.flask_for(decl.chemical()) {
                Some(flask) => {
                    table.reagents.insert(decl.id.clone(), flask.id.clone());
                }
                None if requirements.reagents.contains(&decl.id) => {
                    return Err(Self::missing(format!("flask of '{}'", decl.chemical())));
                }
                None => log::debug!("Reagent '{}' unused and has no flask", decl.id),
            }
        }
        Ok(())
    }

    fn bind_buffer_flasks(&self, requirements: &Requirements, table: &mut BindingTable) -> Result<(), CompileError> {
        let Some(req) = &requirements.buffer_flasks else {
            return Ok(());
        };
        let anchor = table.vessel(&req.anchor).unwrap_or(&req.anchor).to_string();
        let taken: Vec<String> = table.bound_nodes().into_iter().map(str::to_string).collect();
        let flasks = self.graph.nearest_empty_flasks(&anchor, req.count, &taken);
        if flasks.len() < req.count {
            return Err(Self::missing(format!(
                "{} empty buffer flask(s) near '{}' (found {})",
                req.count,
                anchor,
                flasks.len()
            )));
        }
        table.buffer_flasks = flasks;
        Ok(())
    }

    fn bind_cartridges(&self, requirements: &Requirements, table: &mut BindingTable) -> Result<(), CompileError> {
        for req in &requirements.cartridges {
            let from = table.vessel(&req.from_vessel).unwrap_or(&req.from_vessel).to_string();
            let to = table.vessel(&req.to_vessel).unwrap_or(&req.to_vessel).to_string();
            let cartridge = self
                .graph
                .cartridges_for(&req.chemical)
                .into_iter()
                .find(|c| self.graph.route_via(&from, &c.id, &to).is_some())
                .ok_or_else(|| {
                    Self::missing(format!("cartridge of '{}' between '{}' and '{}'", req.chemical, from, to))
                })?;
            table.cartridges.insert(normalise(&req.chemical), cartridge.id.clone());
        }
        Ok(())
    }

    fn check_temperatures(&self, requirements: &Requirements, table: &BindingTable) -> Result<(), CompileError> {
        for (role, points) in &requirements.temperatures {
            let Some(node) = table.vessel(role).and_then(|id| self.graph.node(id)) else {
                continue;
            };
            for point in points.iter().filter(|p| p.active) {
                if !node.has_temperature_control() {
                    return Err(Self::missing(format!("temperature control on '{}'", node.id)));
                }
                let min = node.min_temp.unwrap_or(f64::NEG_INFINITY);
                let max = node.max_temp.unwrap_or(f64::INFINITY);
                if point.temp < min || point.temp > max {
                    return Err(CompileError::TemperatureOutOfRange {
                        vessel: node.id.clone(),
                        temp: point.temp,
                        min,
                        max,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step;

    fn pass_through() -> Procedure {
        Procedure::new()
            .vessel("reactor", ApparatusKind::Reactor)
            .step(
                step!(FilterThrough {
                    "from_vessel" => "reactor",
                    "to_vessel" => "reactor",
                    "through" => "celite",
                })
                .unwrap(),
            )
    }

    #[test]
    fn pass_through_needs_one_buffer_at_its_vessel() {
        let req = Requirements::template(&pass_through(), &CompilerConfig::default()).unwrap();
        assert_eq!(
            req.buffer_flasks,
            Some(BufferFlaskRequirement {
                count: 1,
                anchor: "reactor".into()
            })
        );
        assert_eq!(req.cartridges.len(), 1);
    }

    #[test]
    fn cartridges_deduplicate_by_chemical() {
        let procedure = pass_through().step(
            step!(Transfer {
                "from_vessel" => "reactor",
                "to_vessel" => "reactor",
                "volume" => 5.0,
                "through" => "Celite",
            })
            .unwrap(),
        );
        let req = Requirements::template(&procedure, &CompilerConfig::default()).unwrap();
        assert_eq!(req.cartridges.len(), 1);
        assert_eq!(req.cartridges[0].chemical, "celite");
    }

    #[test]
    fn template_graph_resolves_against_itself() {
        let cfg = CompilerConfig::default();
        let procedure = pass_through();
        let req = Requirements::template(&procedure, &cfg).unwrap();
        let graph = ResourceGraph::from_description(&req.template_graph(&procedure, &cfg)).unwrap();
        let resolution = Resolver::new(&graph, &cfg).resolve(&procedure).unwrap();
        assert_eq!(resolution.bindings.buffer_flasks, vec!["buffer_flask_1".to_string()]);
        assert_eq!(resolution.bindings.cartridge("celite"), Some("cartridge_celite"));
    }
}
