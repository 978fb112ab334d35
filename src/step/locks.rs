// src/step/locks.rs
//
// Exclusive-lock declarations. Only exclusive locks exist: a node is either
// held by one operation or free.
//
//   locked   -> held before and while the step runs, freed when it completes
//   ongoing  -> stays held after the step, until some later step releases it
//   released -> ongoing holds (from earlier steps) this step ends

use super::schema::{schema, PropType};
use super::{Step, StepKind, Variant};
use crate::graph::ResourceGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDeclaration {
    pub locked: BTreeSet<String>,
    pub ongoing: BTreeSet<String>,
    pub released: BTreeSet<String>,
}

impl LockDeclaration {
    fn transient<I: IntoIterator<Item = String>>(nodes: I) -> Self {
        Self {
            locked: nodes.into_iter().collect(),
            ..Self::default()
        }
    }

    fn release(node: String) -> Self {
        Self {
            locked: BTreeSet::from([node.clone()]),
            ongoing: BTreeSet::new(),
            released: BTreeSet::from([node]),
        }
    }

    fn hold(node: String) -> Self {
        Self {
            locked: BTreeSet::from([node.clone()]),
            ongoing: BTreeSet::from([node]),
            released: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.locked.is_empty() && self.ongoing.is_empty() && self.released.is_empty()
    }
}

pub(crate) fn declare(step: &Step, graph: Option<&ResourceGraph>) -> LockDeclaration {
    use StepKind::*;

    let text = |name: &str| step.text(name).ok().flatten().map(str::to_string);

    match step.kind {
        Move => {
            let (Some(from), Some(to)) = (text("from_vessel"), text("to_vessel")) else {
                return LockDeclaration::default();
            };
            let through = text("through");
            let nodes = match graph {
                Some(g) => g.transfer_nodes(&from, &to, through.as_deref()),
                None => [Some(from), Some(to), through].into_iter().flatten().collect(),
            };
            LockDeclaration::transient(nodes)
        }
        SeparatePhases => {
            let names = ["separation_vessel", "lower_phase_vessel", "upper_phase_vessel"];
            let vessels: Vec<String> = names.iter().filter_map(|n| text(n)).collect();
            let mut nodes: Vec<String> = vessels.clone();
            if let (Some(g), Some(sep)) = (graph, vessels.first()) {
                for dest in vessels.iter().skip(1) {
                    nodes.extend(g.transfer_nodes(sep, dest, None));
                }
            }
            LockDeclaration::transient(nodes)
        }
        StartStir | StartHeatChill | StartVacuum | StartPurge => match text("vessel") {
            Some(v) => LockDeclaration::hold(v),
            None => LockDeclaration::default(),
        },
        StopStir | StopHeatChill | StopVacuum | StopPurge => match text("vessel") {
            Some(v) => LockDeclaration::release(v),
            None => LockDeclaration::default(),
        },
        SetTemp => LockDeclaration::transient(text("vessel")),
        Wait | AwaitAsync => LockDeclaration::default(),
        _ => {
            debug_assert_ne!(step.variant(), Variant::Base);
            // Non-base steps declare every vessel they name; the precise
            // timeline comes from their base operations.
            let nodes = schema(step.kind)
                .iter()
                .filter(|spec| spec.ty == PropType::Vessel)
                .filter_map(|spec| text(spec.name));
            LockDeclaration::transient(nodes)
        }
    }
}
