use log::debug;
use nalgebra::Vector3;
use serde::Serialize;

use crate::{error::InfuseError, mesh::Mesh};

/// Fill factor at which a sensor reports resin arrival
pub const TRIGGER_FILL: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SensorId(usize);

/// Virtual sensor bound to the mesh node closest to its position. Keeps the
/// history of every probed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: SensorId,
    pub position: [f64; 3],
    pub node: Option<usize>,
    pub time: Vec<f64>,
    pub pressure: Vec<f64>,
    pub velocity: Vec<[f64; 3]>,
    pub fill_factor: Vec<f64>,
    pub triggered: bool,
}

impl Sensor {
    fn reset(&mut self) {
        self.time.clear();
        self.pressure.clear();
        self.velocity.clear();
        self.fill_factor.clear();
        self.triggered = false;
    }

    pub fn latest_time(&self) -> Option<f64> {
        self.time.last().copied()
    }

    pub fn latest_pressure(&self) -> Option<f64> {
        self.pressure.last().copied()
    }

    pub fn latest_velocity(&self) -> Option<[f64; 3]> {
        self.velocity.last().copied()
    }

    pub fn latest_fill_factor(&self) -> Option<f64> {
        self.fill_factor.last().copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SensorManager {
    sensors: Vec<Sensor>,
    /// Trigger states seen by the last `check_for_new_triggered`
    trigger_states: Vec<bool>,
}

impl SensorManager {
    pub fn new() -> SensorManager {
        SensorManager::default()
    }

    pub fn create_sensor(&mut self, x: f64, y: f64, z: f64) -> SensorId {
        let id = SensorId(self.sensors.len());
        self.sensors.push(Sensor {
            id,
            position: [x, y, z],
            node: None,
            time: Vec::new(),
            pressure: Vec::new(),
            velocity: Vec::new(),
            fill_factor: Vec::new(),
            triggered: false,
        });
        self.trigger_states.push(false);
        id
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn sensor(&self, id: SensorId) -> Result<&Sensor, InfuseError> {
        self.sensors
            .get(id.0)
            .ok_or_else(|| InfuseError::Lookup(format!("sensor id {} does not exist", id.0)))
    }

    /// Binds every sensor to its nearest mesh node
    pub fn initialise(&mut self, mesh: &Mesh) -> Result<(), InfuseError> {
        for sensor in self.sensors.iter_mut() {
            let node = mesh
                .nearest_node(&Vector3::from(sensor.position))
                .ok_or_else(|| InfuseError::State("cannot place sensors on an empty mesh".into()))?;
            debug!(
                "sensor {} at {:?} bound to node {node}",
                sensor.id.0, sensor.position
            );
            sensor.node = Some(node);
        }
        Ok(())
    }

    /// Clears every history and trigger state
    pub fn reset_sensors(&mut self) {
        for sensor in self.sensors.iter_mut() {
            sensor.reset();
        }
        self.trigger_states.iter_mut().for_each(|s| *s = false);
    }

    /// Appends the current state at each sensor node to its history
    ///
    /// # Arguments
    /// * `time` - The current simulation time
    /// * `pressure` - Nodal pressures
    /// * `nodal_velocity` - Nodal velocities
    /// * `fill` - Nodal fill factors
    pub fn probe(
        &mut self,
        time: f64,
        pressure: &[f64],
        nodal_velocity: &[Vector3<f64>],
        fill: &[f64],
    ) {
        for sensor in self.sensors.iter_mut() {
            let Some(node) = sensor.node else {
                continue;
            };
            let v = nodal_velocity[node];
            sensor.time.push(time);
            sensor.pressure.push(pressure[node]);
            sensor.velocity.push([v.x, v.y, v.z]);
            sensor.fill_factor.push(fill[node]);
            if fill[node] >= TRIGGER_FILL {
                sensor.triggered = true;
            }
        }
    }

    /// Whether any sensor changed its trigger state since the last call,
    /// evaluated against the given nodal fill factors
    pub fn check_for_new_triggered(&mut self, fill: &[f64]) -> bool {
        let mut changed = false;
        for (sensor, seen) in self.sensors.iter_mut().zip(self.trigger_states.iter_mut()) {
            if let Some(node) = sensor.node {
                sensor.triggered |= fill[node] >= TRIGGER_FILL;
            }
            if sensor.triggered != *seen {
                *seen = sensor.triggered;
                changed = true;
            }
        }
        changed
    }

    pub fn trigger_states(&self) -> Vec<bool> {
        self.sensors.iter().map(|s| s.triggered).collect()
    }
}
