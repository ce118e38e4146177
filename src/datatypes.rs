use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::InfuseError;

/// A mesh node. Adjacency is stored as indices into the owning mesh.
#[derive(Debug, Clone)]
pub struct Node {
    pub coords: Vector3<f64>,
    /// Indices of the elements that contain this node
    pub elements: Vec<usize>,
    /// Indices of the nodes sharing an edge with this node, sorted
    pub neighbours: Vec<usize>,
}

/// A linear triangle. Geometry is set when the mesh is built; material
/// properties are resolved during preprocessing.
#[derive(Debug, Clone)]
pub struct Element {
    pub nodes: [usize; 3],
    pub tag: Option<String>,
    pub area: f64,
    pub normal: Vector3<f64>,
    /// Shape function gradients in global coordinates. Column `i` is the
    /// gradient of the shape function of `nodes[i]`.
    pub grad_n: Matrix3<f64>,
    pub permeability: Matrix3<f64>,
    pub thickness: f64,
    pub porosity: f64,
}

/// Dual cell centred on a node.
#[derive(Debug, Clone)]
pub struct ControlVolume {
    pub node: usize,
    /// Pore volume (geometric volume times porosity)
    pub volume: f64,
    pub support_elements: Vec<usize>,
    /// One inward, length and thickness weighted normal per support element.
    /// The volumetric inflow rate from element `e` is `v_e . flux_term`.
    pub flux_terms: Vec<Vector3<f64>>,
    pub neighbours: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

/// Simulation-wide parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationParameters {
    /// Resin viscosity [Pa s]
    pub mu: f64,
    /// Simulated time between write-outs [s]. Non-positive writes out every step.
    pub wo_delta_time: f64,
    pub fill_tolerance: f64,
    pub end_step_when_sensor_triggered: bool,
    #[serde(skip)]
    pub has_been_assigned: bool,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        SimulationParameters {
            mu: 0.1,
            wo_delta_time: -1.0,
            fill_tolerance: 0.01,
            end_step_when_sensor_triggered: false,
            has_been_assigned: false,
        }
    }
}

impl SimulationParameters {
    /// Assigns one parameter by name. The value is validated before it is
    /// stored, and a rejected value leaves every parameter unchanged.
    ///
    /// # Arguments
    /// * `key` - One of `mu`, `wo_delta_time`, `fill_tolerance`,
    ///     `end_step_when_sensor_triggered`
    /// * `value` - The new value
    pub fn assign(&mut self, key: &str, value: impl Into<ParamValue>) -> Result<(), InfuseError> {
        let mut updated = self.clone();
        match (key, value.into()) {
            ("mu", ParamValue::Number(v)) => updated.mu = v,
            ("wo_delta_time", ParamValue::Number(v)) => updated.wo_delta_time = v,
            ("fill_tolerance", ParamValue::Number(v)) => updated.fill_tolerance = v,
            ("end_step_when_sensor_triggered", ParamValue::Flag(v)) => {
                updated.end_step_when_sensor_triggered = v
            }
            ("mu" | "wo_delta_time" | "fill_tolerance", ParamValue::Flag(_)) => {
                return Err(InfuseError::Config(format!(
                    "simulation parameter '{key}' expects a number"
                )))
            }
            ("end_step_when_sensor_triggered", ParamValue::Number(_)) => {
                return Err(InfuseError::Config(format!(
                    "simulation parameter '{key}' expects a boolean"
                )))
            }
            _ => {
                return Err(InfuseError::Config(format!(
                    "unknown simulation parameter '{key}'"
                )))
            }
        }
        updated.validate()?;
        updated.has_been_assigned = true;
        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), InfuseError> {
        if !(self.mu > 0.0) {
            return Err(InfuseError::Config(format!(
                "viscosity must be positive, got {}",
                self.mu
            )));
        }
        if !(0.0..1.0).contains(&self.fill_tolerance) {
            return Err(InfuseError::Config(format!(
                "fill tolerance must lie in [0, 1), got {}",
                self.fill_tolerance
            )));
        }
        Ok(())
    }
}

/// Dirichlet set for one pressure solve. Rebuilt from scratch every step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolverBcs {
    /// Inlet nodes
    pub dirichlet_idx: Vec<usize>,
    pub dirichlet_vals: Vec<f64>,
    /// Empty nodes, held at p = 0
    pub p0_idx: Vec<usize>,
}

impl SolverBcs {
    /// Concatenation of the inlet constraints and the empty-node constraints
    pub fn full(&self) -> (Vec<usize>, Vec<f64>) {
        let mut idx = Vec::with_capacity(self.dirichlet_idx.len() + self.p0_idx.len());
        let mut vals = Vec::with_capacity(idx.capacity());
        idx.extend_from_slice(&self.dirichlet_idx);
        vals.extend_from_slice(&self.dirichlet_vals);
        idx.extend_from_slice(&self.p0_idx);
        vals.resize(idx.len(), 0.0);
        (idx, vals)
    }

    pub fn len(&self) -> usize {
        self.dirichlet_idx.len() + self.p0_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
