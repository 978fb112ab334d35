// src/runtime/simulated.rs
//
// In-memory backend. Accepts every step, remembers the calls, and answers
// sensor reads from scripted queues (the last scripted value repeats).

use super::DeviceBackend;
use crate::step::dynamic::SensorQuery;
use crate::step::{Step, StepKind};
use crate::trace::describe;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct SimulatedBackend {
    calls: Arc<Mutex<Vec<String>>>,
    sensors: Arc<Mutex<BTreeMap<SensorQuery, VecDeque<f64>>>>,
    /// Real seconds slept per simulated Wait second. None: waits are instant.
    wait_scale: Option<f64>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(self, node: &str, quantity: &str, values: impl IntoIterator<Item = f64>) -> Self {
        let query = SensorQuery {
            node: node.to_string(),
            quantity: quantity.to_string(),
        };
        self.sensors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(query, values.into_iter().collect());
        self
    }

    pub fn with_wait_scale(mut self, scale: f64) -> Self {
        self.wait_scale = Some(scale);
        self
    }

    /// Every accepted call, formatted as `Kind(prop=value, ...)`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl DeviceBackend for SimulatedBackend {
    async fn execute(&self, step: &Step) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(describe(step));

        if let (StepKind::Wait, Some(scale)) = (step.kind, self.wait_scale) {
            let seconds = step.number("time")?.unwrap_or(0.0) * scale;
            tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
        }
        Ok(())
    }

    async fn read_sensor(&self, query: &SensorQuery) -> Result<Option<f64>> {
        let mut sensors = self.sensors.lock().unwrap_or_else(|p| p.into_inner());
        let Some(queue) = sensors.get_mut(query) else {
            return Ok(None);
        };
        let value = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        Ok(value)
    }
}
