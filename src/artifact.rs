// src/artifact.rs
//
// =============================================================================
// LABCOMPILE: COMPILED PROCEDURE ARTIFACT (v 0.3)
// =============================================================================
//
// The Executable Form.
//
// Responsibilities:
// 1. Hold the flattened, bound, housekeeping-augmented step sequence.
// 2. Persist it as canonical JSON so it can be re-run without recompiling.
// 3. Fingerprint it (SHA-256 of the canonical JSON). The same source and
//    graph always produce the same fingerprint.

use crate::resolver::BindingTable;
use crate::step::{Step, Variant};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

// ============================================================================
// 1. HASHING
// ============================================================================

pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// 2. THE ARTIFACT
// ============================================================================

/// One compiled entry: a base, dynamic or async step, plus the index of the
/// source step it came from (for error reports).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStep {
    pub origin: usize,
    pub step: Step,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledProcedure {
    pub bindings: BindingTable,
    pub steps: Vec<CompiledStep>,
    /// Nodes a source step keeps from its first compiled step to its last,
    /// keyed by origin. Base source steps have no entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scopes: BTreeMap<usize, BTreeSet<String>>,
}

impl CompiledProcedure {
    pub fn new(bindings: BindingTable, steps: Vec<CompiledStep>) -> Self {
        Self {
            bindings,
            steps,
            scopes: BTreeMap::new(),
        }
    }

    pub fn with_scopes(mut self, scopes: BTreeMap<usize, BTreeSet<String>>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every base step in execution order, async bodies inlined. Dynamic
    /// steps are skipped: their base steps only exist at runtime.
    pub fn base_steps(&self) -> Vec<&Step> {
        fn collect<'a>(step: &'a Step, out: &mut Vec<&'a Step>) {
            match step.variant() {
                Variant::Base => out.push(step),
                Variant::Async | Variant::Composite => {
                    step.body().iter().for_each(|child| collect(child, out))
                }
                Variant::Dynamic => {}
            }
        }
        let mut out = Vec::new();
        for entry in &self.steps {
            collect(&entry.step, &mut out);
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialise compiled procedure")
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Failed to parse compiled procedure JSON")
    }

    pub fn fingerprint(&self) -> Result<String> {
        Ok(sha256_bytes(self.to_json()?.as_bytes()))
    }

    /// Writes the artifact next to its final path, then renames it into place
    /// so readers never see a partial file. Returns the fingerprint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json).with_context(|| format!("Failed to write artifact: {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("Failed to move artifact into place: {:?}", path))?;
        Ok(sha256_bytes(json.as_bytes()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiled procedure: {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("in artifact {:?}", path))
    }

    /// Loads an artifact and checks its bytes against a known fingerprint.
    pub fn load_verified(path: impl AsRef<Path>, expected: &str) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).with_context(|| format!("Failed to read compiled procedure: {:?}", path))?;
        let actual = sha256_bytes(&raw);
        if actual != expected {
            return Err(anyhow!(
                "Artifact integrity violation! Path: {:?}\nExpected: {}\nActual:   {}",
                path,
                expected,
                actual
            ));
        }
        let raw = String::from_utf8(raw).with_context(|| format!("Artifact is not UTF-8: {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("in artifact {:?}", path))
    }
}
