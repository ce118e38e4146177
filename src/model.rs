use std::path::{Path, PathBuf};

use log::info;

use crate::{
    bcond::{BcManager, Inlet, InletId, InletSelector, PressureMode},
    datatypes::{Node, ParamValue, SimulationParameters},
    error::InfuseError,
    materials::{MaterialId, MaterialManager, MaterialSelector, RosetteId, RosetteSelector},
    mesh::Mesh,
    mesher::{parse_msh, read_mesh_file, MeshData},
    post_processor::{save_results, OutputOptions},
    psolver::SolverOptions,
    sensors::{Sensor, SensorId, SensorManager},
    solver::{Solver, SolverContext, StepEnd},
    timestep::Solution,
};

/// A resin infusion model: mesh, materials, inlets, sensors and the solver
/// that fills the part.
///
/// Typical use reads a mesh, assigns materials and inlets, initialises the
/// solver and calls [`Model::solve`] or repeatedly
/// [`Model::solve_time_interval`].
#[derive(Default)]
pub struct Model {
    mesh: Option<Mesh>,
    mesh_summary: Option<String>,
    materials: MaterialManager,
    bcs: BcManager,
    sensors: SensorManager,
    params: SimulationParameters,
    solver: Option<Solver>,
    latest_solution: Option<Solution>,
    lightweight: bool,
    hide_progress: bool,
}

fn no_mesh() -> InfuseError {
    InfuseError::State("no mesh has been read, call read_mesh_file first".into())
}

fn no_solver() -> InfuseError {
    InfuseError::State("the solver is not initialised, call initialise_solver first".into())
}

impl Model {
    pub fn new() -> Model {
        Model::default()
    }

    fn load_mesh(&mut self, data: MeshData) -> Result<(), InfuseError> {
        let summary = data.summary();
        let mesh = Mesh::from_mesh_data(data)?;
        info!(
            "read mesh '{}': {} nodes, {} elements",
            mesh.case_name,
            mesh.n_nodes(),
            mesh.n_elements()
        );
        self.mesh = Some(mesh);
        self.mesh_summary = Some(summary);
        self.solver = None;
        self.latest_solution = None;
        Ok(())
    }

    /// Reads a Gmsh MSH 4.1 ASCII mesh file. Any existing solver is dropped.
    pub fn read_mesh_file(&mut self, path: impl AsRef<Path>) -> Result<(), InfuseError> {
        let data = read_mesh_file(path)?;
        self.load_mesh(data)
    }

    /// Reads a mesh from MSH 4.1 ASCII text
    pub fn read_mesh_str(&mut self, contents: &str, case_name: &str) -> Result<(), InfuseError> {
        let data = parse_msh(contents, case_name)?;
        self.load_mesh(data)
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }

    /// Counts and physical group names of the loaded mesh
    pub fn mesh_info(&self) -> Result<&str, InfuseError> {
        self.mesh_summary.as_deref().ok_or_else(no_mesh)
    }

    pub fn print_mesh_info(&self) -> Result<(), InfuseError> {
        info!("{}", self.mesh_info()?);
        Ok(())
    }

    pub fn node(&self, id: usize) -> Option<&Node> {
        self.mesh.as_ref().and_then(|m| m.nodes.get(id))
    }

    // materials

    /// Creates a porous material
    ///
    /// # Arguments
    /// * `k` - Principal permeabilities [m^2], the first one along the rosette
    /// * `porosity` - Pore volume fraction, in `(0, 1]`
    /// * `thickness` - Part thickness [m]
    /// * `name` - Unique name, `Material_{n}` when omitted
    pub fn create_material(
        &mut self,
        k: [f64; 3],
        porosity: f64,
        thickness: f64,
        name: Option<&str>,
    ) -> Result<MaterialId, InfuseError> {
        self.materials.create_material(k, porosity, thickness, name)
    }

    /// Creates a rosette with its first axis along `p1 - p0`
    pub fn create_rosette(
        &mut self,
        p1: [f64; 3],
        p0: [f64; 3],
        name: Option<&str>,
    ) -> Result<RosetteId, InfuseError> {
        self.materials.create_rosette(p1, p0, name)
    }

    /// Binds a material to a mesh region. Without a rosette the first
    /// principal direction follows global X.
    pub fn assign_material(
        &mut self,
        material: impl Into<MaterialSelector>,
        mesh_tag: &str,
        rosette: Option<RosetteSelector>,
    ) -> Result<(), InfuseError> {
        if let Some(mesh) = &self.mesh {
            if !mesh.domains.contains_key(mesh_tag) {
                return Err(InfuseError::Config(format!(
                    "region tag '{mesh_tag}' does not exist in the mesh (available: {:?})",
                    mesh.domains.keys().collect::<Vec<_>>()
                )));
            }
        }
        self.materials.assign_material(material, mesh_tag, rosette)
    }

    pub fn materials(&self) -> &MaterialManager {
        &self.materials
    }

    // inlets

    pub fn create_inlet(&mut self, pressure: f64, name: Option<&str>) -> Result<InletId, InfuseError> {
        self.bcs.create_inlet(pressure, name)
    }

    /// Binds an inlet to a boundary tag of the mesh
    pub fn assign_inlet(
        &mut self,
        inlet: impl Into<InletSelector>,
        boundary_tag: &str,
    ) -> Result<(), InfuseError> {
        if let Some(mesh) = &self.mesh {
            mesh.boundary_nodes(boundary_tag)?;
        }
        self.bcs.assign_inlet(inlet, boundary_tag)
    }

    pub fn fetch_inlet(&self, inlet: impl Into<InletSelector>) -> Result<&Inlet, InfuseError> {
        let id = self.bcs.fetch_inlet(inlet)?;
        Ok(self.bcs.inlet(id))
    }

    /// Changes an inlet pressure. The new value applies from the next step.
    pub fn change_inlet_pressure(
        &mut self,
        inlet: impl Into<InletSelector>,
        value: f64,
        mode: PressureMode,
    ) -> Result<(), InfuseError> {
        self.bcs.change_inlet_pressure(inlet, value, mode)
    }

    pub fn open_inlet(&mut self, inlet: impl Into<InletSelector>) -> Result<(), InfuseError> {
        self.bcs.open_inlet(inlet)
    }

    pub fn close_inlet(&mut self, inlet: impl Into<InletSelector>) -> Result<(), InfuseError> {
        self.bcs.close_inlet(inlet)
    }

    // sensors

    /// Places a sensor. It is bound to the nearest node when the solver is
    /// initialised.
    pub fn create_sensor(&mut self, x: f64, y: f64, z: f64) -> SensorId {
        self.sensors.create_sensor(x, y, z)
    }

    pub fn sensor(&self, id: SensorId) -> Result<&Sensor, InfuseError> {
        self.sensors.sensor(id)
    }

    pub fn sensors(&self) -> &[Sensor] {
        self.sensors.sensors()
    }

    pub fn sensor_trigger_states(&self) -> Vec<bool> {
        self.sensors.trigger_states()
    }

    pub fn print_sensor_readings(&self) {
        for sensor in self.sensors.sensors() {
            info!(
                "sensor {:?} at {:?}: t={:?}, p={:?}, fill={:?}, v={:?}",
                sensor.id,
                sensor.position,
                sensor.latest_time(),
                sensor.latest_pressure(),
                sensor.latest_fill_factor(),
                sensor.latest_velocity()
            );
        }
    }

    // simulation parameters

    /// Sets one simulation parameter by name. Takes effect for the running
    /// solution from the next step, and for the viscosity from the next
    /// `initialise_new_solution`. Invalid values are rejected here.
    pub fn assign_simulation_parameter(
        &mut self,
        key: &str,
        value: impl Into<ParamValue>,
    ) -> Result<(), InfuseError> {
        self.params.assign(key, value)?;
        let Some(solver) = self.solver.as_mut() else {
            return Ok(());
        };
        match key {
            "wo_delta_time" => solver.reschedule_write_out(self.params.wo_delta_time),
            // arrivals seen while the flag was off must not end the next interval
            "end_step_when_sensor_triggered" => {
                self.sensors.check_for_new_triggered(solver.fill_factor());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn simulation_parameters(&self) -> &SimulationParameters {
        &self.params
    }

    pub fn print_simulation_parameters(&self) {
        info!("simulation parameters: {:?}", self.params);
    }

    // solving

    /// Preprocesses the mesh with the current material assignments,
    /// assembles the system and initialises a new solution
    pub fn initialise_solver(&mut self, options: SolverOptions) -> Result<(), InfuseError> {
        let mesh = self.mesh.as_mut().ok_or_else(no_mesh)?;
        mesh.preprocess(&self.materials)?;
        let solver = Solver::new(
            SolverContext {
                mesh,
                bcs: &mut self.bcs,
                sensors: &mut self.sensors,
                params: &self.params,
            },
            options,
        )?;
        self.solver = Some(solver);
        self.latest_solution = None;
        Ok(())
    }

    fn parts(&mut self) -> Result<(&mut Solver, SolverContext<'_>), InfuseError> {
        let mesh = self.mesh.as_ref().ok_or_else(no_mesh)?;
        let solver = self.solver.as_mut().ok_or_else(no_solver)?;
        Ok((
            solver,
            SolverContext {
                mesh,
                bcs: &mut self.bcs,
                sensors: &mut self.sensors,
                params: &self.params,
            },
        ))
    }

    /// Empties the part and restores the initial inlet state, keeping the
    /// mesh and the assembled system
    pub fn initialise_new_solution(&mut self) -> Result<(), InfuseError> {
        let (solver, ctx) = self.parts()?;
        solver.initialise_new_solution(ctx)?;
        self.latest_solution = None;
        Ok(())
    }

    fn finish(&mut self) {
        if self.lightweight {
            return;
        }
        if let Some(solver) = self.solver.as_mut() {
            self.latest_solution = Some(solver.pack_solution());
        }
    }

    /// Fills the part from the current state. The packed solution is
    /// available from [`Model::latest_solution`] unless the model is
    /// lightweight.
    pub fn solve(&mut self) -> Result<(), InfuseError> {
        let show_progress = !self.hide_progress;
        let (solver, ctx) = self.parts()?;
        solver.solve(ctx, show_progress)?;
        self.finish();
        Ok(())
    }

    /// Advances the simulation by `interval` seconds of simulated time, or
    /// less if the part fills or a sensor ends the interval
    pub fn solve_time_interval(&mut self, interval: f64) -> Result<StepEnd, InfuseError> {
        let (solver, ctx) = self.parts()?;
        let end = solver.solve_time_interval(ctx, interval, false)?;
        self.finish();
        Ok(end)
    }

    pub fn latest_solution(&self) -> Option<&Solution> {
        self.latest_solution.as_ref()
    }

    /// Packs the history of the current solution regardless of the
    /// lightweight setting
    pub fn pack_solution(&mut self) -> Result<&Solution, InfuseError> {
        let solver = self.solver.as_mut().ok_or_else(no_solver)?;
        Ok(self.latest_solution.insert(solver.pack_solution()))
    }

    pub fn current_time(&self) -> Result<f64, InfuseError> {
        Ok(self.solver.as_ref().ok_or_else(no_solver)?.current_time())
    }

    pub fn n_empty_cvs(&self) -> Result<usize, InfuseError> {
        Ok(self.solver.as_ref().ok_or_else(no_solver)?.n_empty_cvs())
    }

    pub fn fill_factor(&self) -> Result<&[f64], InfuseError> {
        Ok(self.solver.as_ref().ok_or_else(no_solver)?.fill_factor())
    }

    pub fn solver_options(&self) -> Option<&SolverOptions> {
        self.solver.as_ref().map(|s| s.options())
    }

    /// In lightweight mode solves keep their history but do not pack a
    /// solution
    pub fn set_lightweight(&mut self, lightweight: bool) {
        self.lightweight = lightweight;
    }

    pub fn is_lightweight(&self) -> bool {
        self.lightweight
    }

    /// Whether `solve` draws a progress bar
    pub fn set_show_progress(&mut self, show: bool) {
        self.hide_progress = !show;
    }

    /// Writes a solution, and the sensor histories, to
    /// `<directory>/<result_name>/`
    ///
    /// # Returns
    /// The result directory
    pub fn save_results(
        &self,
        solution: &Solution,
        result_name: &str,
        options: &OutputOptions,
    ) -> Result<PathBuf, InfuseError> {
        let mesh = self.mesh.as_ref().ok_or_else(no_mesh)?;
        save_results(mesh, solution, self.sensors.sensors(), result_name, options)
    }
}
