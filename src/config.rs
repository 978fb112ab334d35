// src/config.rs
//
// =============================================================================
// LABCOMPILE: COMPILER CONFIGURATION
// =============================================================================
//
// One immutable object, built once (defaults or YAML) and passed by reference
// to the resolver, executor and parallelizer. Nothing here is process-global.
//
// The cleaning heuristics (incompatibility table, extra cleans for bases) are
// policy data, not logic: override them per platform in the YAML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// 1. TOP LEVEL
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub cleaning: CleaningPolicy,
    pub transfer: TransferDefaults,
    pub separation: SeparationDefaults,
    pub scheduling: SchedulingConfig,
}

impl CompilerConfig {
    /// Loads a YAML config. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read compiler config: {:?}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("in config file {:?}", path))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: CompilerConfig =
            serde_yaml::from_str(raw).context("Failed to parse compiler config YAML")?;
        Ok(cfg)
    }
}

// ============================================================================
// 2. CLEANING POLICY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningPolicy {
    /// Chemicals usable for backbone cleaning, in preference order.
    pub solvents: Vec<String>,
    /// Reagent -> solvents that must never share a line with it.
    pub incompatible: BTreeMap<String, Vec<String>>,
    /// Reagents that leave basic residue in the backbone.
    pub basic_reagents: Vec<String>,
    /// Cleans added on top of the regular one after a basic reagent.
    pub extra_base_cleans: usize,
    /// Reagents whose follow-up clean is mandatory (missing solvent is an error).
    pub mandatory_clean: Vec<String>,
    /// Volume pushed through the backbone per clean, mL.
    pub clean_volume_ml: f64,
}

impl Default for CleaningPolicy {
    fn default() -> Self {
        let mut incompatible = BTreeMap::new();
        for reactive in ["nah", "lialh4", "nbuli", "buli", "sodium hydride"] {
            incompatible.insert(
                reactive.to_string(),
                vec!["water".to_string(), "methanol".to_string(), "ethanol".to_string()],
            );
        }
        incompatible.insert("water".into(), vec!["dcm".into(), "hexane".into()]);

        Self {
            solvents: ["water", "acetone", "ethanol", "methanol", "thf", "dcm", "ether", "hexane"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            incompatible,
            basic_reagents: ["naoh", "koh", "triethylamine", "piperidine", "dbu", "ammonia"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_base_cleans: 3,
            mandatory_clean: Vec::new(),
            clean_volume_ml: 5.0,
        }
    }
}

impl CleaningPolicy {
    pub fn is_solvent(&self, chemical: &str) -> bool {
        let key = normalise(chemical);
        self.solvents.iter().any(|s| normalise(s) == key)
    }

    pub fn is_basic(&self, chemical: &str) -> bool {
        let key = normalise(chemical);
        self.basic_reagents.iter().any(|s| normalise(s) == key)
    }

    /// True if `solvent` may not follow `reagent` through a shared line.
    pub fn incompatible(&self, reagent: &str, solvent: &str) -> bool {
        let (r, s) = (normalise(reagent), normalise(solvent));
        self.incompatible
            .iter()
            .filter(|(k, _)| normalise(k) == r)
            .any(|(_, banned)| banned.iter().any(|b| normalise(b) == s))
    }

    /// Cleans structurally required after `reagent` (0 = optional clean).
    pub fn required_cleans(&self, reagent: &str) -> usize {
        let key = normalise(reagent);
        if self.is_basic(reagent) {
            1 + self.extra_base_cleans
        } else if self.mandatory_clean.iter().any(|m| normalise(m) == key) {
            1
        } else {
            0
        }
    }
}

/// Case/whitespace-insensitive chemical identity.
pub fn normalise(chemical: &str) -> String {
    chemical.trim().to_lowercase()
}

// ============================================================================
// 3. TRANSFER / SEPARATION / SCHEDULING DEFAULTS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferDefaults {
    /// Dispense speed of the pump, mL/min.
    pub move_speed_ml_min: f64,
    /// Draw speed of the pump, mL/min. A metered move aspirates then dispenses.
    pub aspiration_speed_ml_min: f64,
    /// Fixed cost of issuing any device command, s.
    pub command_overhead_s: f64,
    /// Duration assumed for a move whose volume is not known statically, s.
    pub unmetered_move_s: f64,
    pub separate_phases_s: f64,
    /// Stir speed for `Add { stir: true }` when the step gives none, RPM.
    pub add_stir_speed_rpm: f64,
}

impl Default for TransferDefaults {
    fn default() -> Self {
        Self {
            move_speed_ml_min: 40.0,
            aspiration_speed_ml_min: 10.0,
            command_overhead_s: 5.0,
            unmetered_move_s: 120.0,
            separate_phases_s: 300.0,
            add_stir_speed_rpm: 250.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationDefaults {
    pub stir_time_s: f64,
    pub settle_time_s: f64,
    pub stir_speed_rpm: f64,
    /// Separator capacity assumed when no graph exists yet.
    pub template_separator_capacity_ml: f64,
}

impl Default for SeparationDefaults {
    fn default() -> Self {
        Self {
            stir_time_s: 60.0,
            settle_time_s: 60.0,
            stir_speed_rpm: 600.0,
            template_separator_capacity_ml: 200.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub time_step_s: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self { time_step_s: 10.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let cfg = CompilerConfig::from_yaml_str(
            "cleaning:\n  extra_base_cleans: 1\nscheduling:\n  time_step_s: 30\n",
        )
        .unwrap();
        assert_eq!(cfg.cleaning.extra_base_cleans, 1);
        assert_eq!(cfg.scheduling.time_step_s, 30.0);
        assert_eq!(cfg.transfer.move_speed_ml_min, 40.0);
        assert!(cfg.cleaning.is_solvent("Water"));
    }

    #[test]
    fn basic_reagents_need_extra_cleans() {
        let policy = CleaningPolicy::default();
        assert_eq!(policy.required_cleans("NaOH"), 4);
        assert_eq!(policy.required_cleans("benzaldehyde"), 0);
        assert!(policy.incompatible("NaH", "water"));
        assert!(!policy.incompatible("NaH", "thf"));
    }
}
