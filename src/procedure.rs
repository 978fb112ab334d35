// src/procedure.rs
//
// =============================================================================
// LABCOMPILE: PROCEDURE SOURCE (v 0.3)
// =============================================================================
//
// The declarative input of the compiler: a reagent list, a hardware list and
// an ordered step list. The canonical on-disk form is YAML:
//
//   reagents:
//     - id: benzaldehyde
//     - id: base
//       chemical: naoh
//   hardware:
//     - id: reactor
//       type: reactor
//   steps:
//     - kind: Add
//       vessel: reactor
//       reagent: benzaldehyde
//       volume: 10 mL
//     - kind: Repeat
//       repeats: 2
//       children:
//         - kind: Stir
//           vessel: reactor
//           time: 5 min
//
// Loading converts every step into a typed `Step` (units, ranges, defaults),
// so nothing downstream ever sees the raw source.

use crate::error::PropertyError;
use crate::graph::ApparatusKind;
use crate::step::{Step, StepKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// 1. ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error while reading {path}: {message}")]
    Io { path: String, message: String },

    #[error("Failed to parse procedure YAML: {0}")]
    Parse(String),

    #[error("step {index}: unknown step kind '{kind}'")]
    UnknownKind { index: usize, kind: String },

    #[error("step {index}: {source}")]
    Property {
        index: usize,
        #[source]
        source: PropertyError,
    },

    #[error("duplicate declaration: '{0}'")]
    Duplicate(String),
}

// ============================================================================
// 2. SOURCE TYPES (as written)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReagentDecl {
    pub id: String,
    /// Chemical held by the reagent flask; defaults to `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chemical: Option<String>,
}

impl ReagentDecl {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chemical: None,
        }
    }

    pub fn chemical(&self) -> &str {
        self.chemical.as_deref().unwrap_or(&self.id)
    }
}

/// A logical vessel role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ApparatusKind,
    /// Explicit graph node for this role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSource {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepSource>,
    #[serde(flatten)]
    pub props: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureSource {
    #[serde(default)]
    pub reagents: Vec<ReagentDecl>,
    #[serde(default)]
    pub hardware: Vec<HardwareDecl>,
    pub steps: Vec<StepSource>,
}

// ============================================================================
// 3. THE TYPED PROCEDURE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Procedure {
    pub reagents: Vec<ReagentDecl>,
    pub hardware: Vec<HardwareDecl>,
    pub steps: Vec<Step>,
}

impl Procedure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| SourceError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, SourceError> {
        let source: ProcedureSource =
            serde_yaml::from_str(raw).map_err(|e| SourceError::Parse(e.to_string()))?;
        Self::from_source(source)
    }

    pub fn from_source(source: ProcedureSource) -> Result<Self, SourceError> {
        let mut seen = BTreeSet::new();
        for id in source
            .reagents
            .iter()
            .map(|r| &r.id)
            .chain(source.hardware.iter().map(|h| &h.id))
        {
            if !seen.insert(id.clone()) {
                return Err(SourceError::Duplicate(id.clone()));
            }
        }

        let steps = source
            .steps
            .iter()
            .enumerate()
            .map(|(index, s)| build_step(index, s))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "Procedure loaded: {} reagents, {} vessels, {} steps",
            source.reagents.len(),
            source.hardware.len(),
            steps.len()
        );

        Ok(Self {
            reagents: source.reagents,
            hardware: source.hardware,
            steps,
        })
    }

    // Builder, for procedures assembled in code.

    pub fn reagent(mut self, id: &str) -> Self {
        self.reagents.push(ReagentDecl::new(id));
        self
    }

    pub fn vessel(mut self, id: &str, kind: ApparatusKind) -> Self {
        self.hardware.push(HardwareDecl {
            id: id.to_string(),
            kind,
            node: None,
        });
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn reagent_decl(&self, id: &str) -> Option<&ReagentDecl> {
        self.reagents.iter().find(|r| r.id == id)
    }

    pub fn hardware_decl(&self, id: &str) -> Option<&HardwareDecl> {
        self.hardware.iter().find(|h| h.id == id)
    }
}

fn build_step(index: usize, source: &StepSource) -> Result<Step, SourceError> {
    let kind = StepKind::from_name(&source.kind).ok_or_else(|| SourceError::UnknownKind {
        index,
        kind: source.kind.clone(),
    })?;
    let property = |source| SourceError::Property { index, source };

    let step = Step::new(kind, source.props.iter().map(|(k, v)| (k, v.clone()))).map_err(property)?;
    let body = source
        .children
        .iter()
        .map(|c| build_step(index, c))
        .collect::<Result<Vec<_>, _>>()?;
    step.with_body(body).map_err(property)
}
