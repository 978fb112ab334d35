// src/executor/volumes.rs
//
// Stage 4: walks the compiled sequence once, tracking how much liquid each
// node holds. Destination overflow is fatal; source overflow was already
// split away during expansion. A level becomes unknown after a phase
// separation and stays unknown until the vessel is drained.

use crate::artifact::CompiledStep;
use crate::error::{CompileError, PropertyError};
use crate::graph::ResourceGraph;
use crate::step::schema::schema;
use crate::step::{Amount, PropType, Step, StepKind, Variant};
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

pub(crate) struct VolumeTracker<'a> {
    graph: &'a ResourceGraph,
    levels: BTreeMap<String, Option<f64>>,
}

impl<'a> VolumeTracker<'a> {
    pub fn new(graph: &'a ResourceGraph) -> Self {
        Self {
            graph,
            levels: BTreeMap::new(),
        }
    }

    fn level(&self, node: &str) -> Option<f64> {
        match self.levels.get(node) {
            Some(level) => *level,
            None => self.graph.node(node).map(|n| n.current_volume),
        }
    }

    pub fn check(mut self, mut steps: Vec<CompiledStep>) -> Result<Vec<CompiledStep>, CompileError> {
        for entry in steps.iter_mut() {
            self.visit(&mut entry.step, entry.origin)?;
        }
        Ok(steps)
    }

    fn visit(&mut self, step: &mut Step, origin: usize) -> Result<(), CompileError> {
        self.check_nodes(step, origin)?;
        match step.kind {
            StepKind::Move => self.transfer(step, origin),
            StepKind::SeparatePhases => {
                let prop = |e: PropertyError| CompileError::property(origin, e);
                let separator = step.req_text("separation_vessel").map_err(prop)?;
                self.levels.insert(separator.to_string(), Some(0.0));
                for phase in ["lower_phase_vessel", "upper_phase_vessel"] {
                    let node = step.req_text(phase).map_err(prop)?;
                    self.levels.insert(node.to_string(), None);
                }
                Ok(())
            }
            // Async bodies are tracked inline: they touch the same liquid.
            _ if step.variant() == Variant::Async => {
                for child in step.body_mut() {
                    self.visit(child, origin)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Every vessel a compiled step names must be a graph node.
    fn check_nodes(&self, step: &Step, origin: usize) -> Result<(), CompileError> {
        for spec in schema(step.kind).iter().filter(|s| s.ty == PropType::Vessel) {
            if let Ok(Some(node)) = step.text(spec.name) {
                if !self.graph.contains(node) {
                    return Err(CompileError::VesselNotDeclared {
                        index: origin,
                        step: step.name().to_string(),
                        vessel: node.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn transfer(&mut self, step: &mut Step, origin: usize) -> Result<(), CompileError> {
        let prop = |e: PropertyError| CompileError::property(origin, e);
        let from = step.req_text("from_vessel").map_err(prop)?.to_string();
        let to = step.req_text("to_vessel").map_err(prop)?.to_string();
        let through = step.text("through").map_err(prop)?.map(str::to_string);

        let routed = match &through {
            Some(via) => self.graph.route_via(&from, via, &to),
            None => self.graph.route(&from, &to),
        };
        if routed.is_none() {
            return Err(CompileError::NoRoute {
                index: origin,
                step: step.name().to_string(),
                from,
                to,
            });
        }

        let source = self.level(&from);
        let (moved, remaining) = match step.amount("volume").map_err(prop)? {
            Some(Amount::Ml(v)) => (Some(v), source.map(|s| (s - v).max(0.0))),
            Some(Amount::All) => (source, Some(0.0)),
            Some(Amount::Fraction(f)) => (source.map(|s| s * f), source.map(|s| s * (1.0 - f))),
            None => (None, None),
        };
        self.levels.insert(from, remaining);

        let level = match (self.level(&to), moved) {
            (Some(current), Some(moved)) => Some(current + moved),
            _ => None,
        };
        if let (Some(level), Some(capacity)) = (level, self.graph.node(&to).and_then(|n| n.capacity)) {
            if level > capacity + EPSILON {
                return Err(CompileError::CapacityOverflow {
                    index: origin,
                    step: step.name().to_string(),
                    vessel: to,
                    volume: level,
                    capacity,
                });
            }
        }
        self.levels.insert(to, level);

        if let Some(moved) = moved {
            step.set_internal("estimated_volume", moved).map_err(prop)?;
        }
        Ok(())
    }
}
