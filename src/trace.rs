// src/trace.rs
//
// =============================================================================
// LABCOMPILE: EXECUTION TRACE (v 0.3)
// =============================================================================
//
// A thread-safe record of every base operation issued to the hardware, in the
// order the backend accepted them. Shared between the runtime, its spawned
// async tasks, and whoever inspects the run afterwards (CLI, tests).

use crate::step::{PropValue, Step};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub operation: String,
    pub props: BTreeMap<String, PropValue>,
}

#[derive(Clone, Default)]
pub struct TraceBuffer {
    entries: Arc<Mutex<Vec<TraceEntry>>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking task must not take the trace down with it.
    fn lock(&self) -> MutexGuard<'_, Vec<TraceEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, step: &Step) {
        let entry = TraceEntry {
            at: Utc::now(),
            operation: step.name().to_string(),
            props: step.resolved_props(),
        };
        log::info!("[{}] {}", entry.at.format("%H:%M:%S%.3f"), describe(step));
        self.lock().push(entry);
    }

    /// Snapshot of the trace so far.
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.lock().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.operation.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// One-line human summary: `Move(from_vessel=flask_water, to_vessel=reactor, ...)`.
pub fn describe(step: &Step) -> String {
    let args: Vec<String> = step
        .props()
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    format!("{}({})", step.name(), args.join(", "))
}
