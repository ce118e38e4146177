use nalgebra::Vector3;
use serde::Serialize;

/// Fields of one converged step, borrowed from the solver state
pub struct StepRecord<'a> {
    pub time: f64,
    pub dt: f64,
    pub pressure: &'a [f64],
    pub velocity: &'a [Vector3<f64>],
    pub nodal_velocity: &'a [Vector3<f64>],
    pub fill_factor: &'a [f64],
    pub free_surface: &'a [bool],
    pub inlet_flow_rate: f64,
    pub write_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StepHeader {
    time: f64,
    dt: f64,
    inlet_flow_rate: f64,
    write_out: bool,
}

/// Read-only view of one stored step
#[derive(Debug, Clone, Copy)]
pub struct TimeStepView<'a> {
    pub index: usize,
    pub time: f64,
    pub dt: f64,
    pub inlet_flow_rate: f64,
    pub write_out: bool,
    pub pressure: &'a [f64],
    /// Element velocities, `[vx, vy, vz]` per element
    pub velocity: &'a [f64],
    /// Nodal velocities, `[vx, vy, vz]` per node
    pub nodal_velocity: &'a [f64],
    pub fill_factor: &'a [f64],
    /// 1.0 on the flow front, 0.0 elsewhere
    pub free_surface: &'a [f64],
}

/// Append-only history of every step of the current solution. Fields are
/// stored back to back in flat buffers that keep their capacity across
/// resets.
#[derive(Debug, Clone, Default)]
pub struct TimeStepManager {
    n_nodes: usize,
    n_elements: usize,
    headers: Vec<StepHeader>,
    pressure: Vec<f64>,
    velocity: Vec<f64>,
    nodal_velocity: Vec<f64>,
    fill_factor: Vec<f64>,
    free_surface: Vec<f64>,
}

fn extend_vectors(buffer: &mut Vec<f64>, vectors: &[Vector3<f64>]) {
    buffer.extend(vectors.iter().flat_map(|v| [v.x, v.y, v.z]));
}

impl TimeStepManager {
    pub fn new(n_nodes: usize, n_elements: usize) -> TimeStepManager {
        TimeStepManager {
            n_nodes,
            n_elements,
            ..Default::default()
        }
    }

    /// Forgets every stored step
    pub fn reset(&mut self) {
        self.headers.clear();
        self.pressure.clear();
        self.velocity.clear();
        self.nodal_velocity.clear();
        self.fill_factor.clear();
        self.free_surface.clear();
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Appends a step. Fill factors are stored clipped to `[0, 1]`.
    ///
    /// # Returns
    /// The index of the new step
    pub fn save_timestep(&mut self, record: StepRecord) -> usize {
        debug_assert_eq!(record.pressure.len(), self.n_nodes);
        debug_assert_eq!(record.velocity.len(), self.n_elements);

        self.headers.push(StepHeader {
            time: record.time,
            dt: record.dt,
            inlet_flow_rate: record.inlet_flow_rate,
            write_out: record.write_out,
        });
        self.pressure.extend_from_slice(record.pressure);
        extend_vectors(&mut self.velocity, record.velocity);
        extend_vectors(&mut self.nodal_velocity, record.nodal_velocity);
        self.fill_factor
            .extend(record.fill_factor.iter().map(|f| f.clamp(0.0, 1.0)));
        self.free_surface
            .extend(record.free_surface.iter().map(|s| if *s { 1.0 } else { 0.0 }));
        self.headers.len() - 1
    }

    pub fn step(&self, index: usize) -> Option<TimeStepView<'_>> {
        let header = self.headers.get(index)?;
        let nodes = index * self.n_nodes..(index + 1) * self.n_nodes;
        let nodes3 = 3 * nodes.start..3 * nodes.end;
        let elements3 = 3 * index * self.n_elements..3 * (index + 1) * self.n_elements;
        Some(TimeStepView {
            index,
            time: header.time,
            dt: header.dt,
            inlet_flow_rate: header.inlet_flow_rate,
            write_out: header.write_out,
            pressure: &self.pressure[nodes.clone()],
            velocity: &self.velocity[elements3],
            nodal_velocity: &self.nodal_velocity[nodes3],
            fill_factor: &self.fill_factor[nodes.clone()],
            free_surface: &self.free_surface[nodes],
        })
    }

    pub fn last(&self) -> Option<TimeStepView<'_>> {
        self.len().checked_sub(1).and_then(|i| self.step(i))
    }

    pub fn steps(&self) -> impl Iterator<Item = TimeStepView<'_>> {
        (0..self.len()).filter_map(|i| self.step(i))
    }

    /// Flags the last step as written out and copies every written-out step
    /// into a packed solution
    pub fn pack_solution(&mut self) -> Solution {
        if let Some(last) = self.headers.last_mut() {
            last.write_out = true;
        }
        Solution {
            steps: self
                .steps()
                .filter(|s| s.write_out)
                .map(SolutionStep::from)
                .collect(),
        }
    }
}

/// One written-out step of a packed solution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolutionStep {
    pub index: usize,
    pub time: f64,
    pub dt: f64,
    pub pressure: Vec<f64>,
    pub velocity: Vec<[f64; 3]>,
    pub nodal_velocity: Vec<[f64; 3]>,
    pub fill_factor: Vec<f64>,
    pub free_surface: Vec<f64>,
    /// Net volumetric inflow through the open inlets [m^3/s]
    pub inlet_flow_rate: f64,
}

fn to_triplets(flat: &[f64]) -> Vec<[f64; 3]> {
    flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

impl From<TimeStepView<'_>> for SolutionStep {
    fn from(view: TimeStepView<'_>) -> Self {
        SolutionStep {
            index: view.index,
            time: view.time,
            dt: view.dt,
            pressure: view.pressure.to_vec(),
            velocity: to_triplets(view.velocity),
            nodal_velocity: to_triplets(view.nodal_velocity),
            fill_factor: view.fill_factor.to_vec(),
            free_surface: view.free_surface.to_vec(),
            inlet_flow_rate: view.inlet_flow_rate,
        }
    }
}

/// Packed, immutable record of the written-out steps of a solution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Solution {
    pub steps: Vec<SolutionStep>,
}

impl Solution {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn time(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.time).collect()
    }

    pub fn last(&self) -> Option<&SolutionStep> {
        self.steps.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn save(manager: &mut TimeStepManager, time: f64, fill: f64, write_out: bool) -> usize {
        let pressure = [time; 3];
        let velocity = [Vector3::new(time, 1.0, 2.0)];
        let nodal = [Vector3::new(0.0, time, 0.0); 3];
        let fill = [1.0, fill, -0.1];
        let front = [false, true, false];
        manager.save_timestep(StepRecord {
            time,
            dt: 1.0,
            pressure: &pressure,
            velocity: &velocity,
            nodal_velocity: &nodal,
            fill_factor: &fill,
            free_surface: &front,
            inlet_flow_rate: 0.5,
            write_out,
        })
    }

    #[test]
    fn views_slice_the_flat_buffers() {
        let mut manager = TimeStepManager::new(3, 1);
        save(&mut manager, 0.0, 0.0, true);
        let idx = save(&mut manager, 2.0, 1.3, false);
        assert_eq!(idx, 1);

        let step = manager.step(1).unwrap();
        assert_eq!(step.time, 2.0);
        assert_eq!(step.pressure, &[2.0, 2.0, 2.0]);
        assert_eq!(step.velocity, &[2.0, 1.0, 2.0]);
        assert_eq!(step.nodal_velocity[1], 2.0);
        assert_eq!(step.fill_factor, &[1.0, 1.0, 0.0]);
        assert_eq!(step.free_surface, &[0.0, 1.0, 0.0]);
        assert!(manager.step(2).is_none());
    }

    #[test]
    fn packing_keeps_write_out_steps_and_the_last_one() {
        let mut manager = TimeStepManager::new(3, 1);
        save(&mut manager, 0.0, 0.0, true);
        save(&mut manager, 1.0, 0.2, false);
        save(&mut manager, 2.0, 0.4, true);
        save(&mut manager, 3.0, 0.6, false);

        let solution = manager.pack_solution();
        assert_eq!(solution.time(), vec![0.0, 2.0, 3.0]);
        assert_eq!(solution.last().unwrap().index, 3);
        assert_eq!(solution.steps[1].velocity, vec![[2.0, 1.0, 2.0]]);
        assert!(manager.last().unwrap().write_out);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut manager = TimeStepManager::new(3, 1);
        for i in 0..10 {
            save(&mut manager, i as f64, 0.0, true);
        }
        let capacity = manager.pressure.capacity();
        manager.reset();
        assert!(manager.is_empty());
        assert!(manager.pack_solution().is_empty());
        assert_eq!(manager.pressure.capacity(), capacity);
    }
}
