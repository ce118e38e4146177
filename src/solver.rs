use std::time::Instant;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use nalgebra::{DVector, Vector3};
use nalgebra_sparse::CsrMatrix;

use crate::{
    assembler::{assemble_conductivity, assemble_rhs, compute_local_matrices, CompressedLocal},
    bcond::BcManager,
    datatypes::{SimulationParameters, SolverBcs},
    error::InfuseError,
    fill::{advance, find_free_surface, time_step, volumetric_fluxes},
    mesh::Mesh,
    psolver::{solve_pressure, SolveOutcome, SolverOptions},
    sensors::SensorManager,
    timestep::{Solution, StepRecord, TimeStepManager},
    velocity::VelocitySolver,
};

/// Everything a solver step reads or updates besides its own state
pub struct SolverContext<'a> {
    pub mesh: &'a Mesh,
    pub bcs: &'a mut BcManager,
    pub sensors: &'a mut SensorManager,
    pub params: &'a SimulationParameters,
}

/// What ended a call to `solve_time_interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEnd {
    /// Every control volume is full
    Filled,
    /// The requested interval elapsed
    IntervalElapsed,
    /// A sensor changed its trigger state
    SensorTriggered,
}

/// Outcome of the write-out criteria for one step
struct WriteOut {
    dt: f64,
    /// Exact time reached by a step cut at an interval or write-out boundary
    end_time: Option<f64>,
    write_out: bool,
    interval_end: bool,
}

/// Explicit fill simulation. Owns the assembled system and the mutable
/// simulation state; the mesh and the managers are borrowed per call.
pub struct Solver {
    options: SolverOptions,
    mu: f64,
    k_local: Vec<CompressedLocal>,
    k_sing: CsrMatrix<f64>,
    f_orig: DVector<f64>,
    velocity: VelocitySolver,
    history: TimeStepManager,

    bcs: SolverBcs,
    fill: Vec<f64>,
    pressure: DVector<f64>,
    v_elements: Vec<Vector3<f64>>,
    v_nodal: Vec<Vector3<f64>>,
    free_surface: Vec<bool>,
    current_time: f64,
    next_wo_time: f64,
    step_end_time: f64,
    n_empty: usize,
}

impl Solver {
    /// Assembles the system of a preprocessed mesh and initialises a new
    /// solution
    pub fn new(ctx: SolverContext, options: SolverOptions) -> Result<Solver, InfuseError> {
        let mesh = ctx.mesh;
        if !mesh.is_preprocessed() {
            return Err(InfuseError::State(
                "the mesh must be preprocessed before a solver is created".into(),
            ));
        }
        options.validate()?;
        if !ctx.params.has_been_assigned {
            warn!(
                "simulation parameters were not assigned, running with defaults: mu={}, wo_delta_time={}",
                ctx.params.mu, ctx.params.wo_delta_time
            );
        }
        ctx.params.validate()?;

        let start = Instant::now();
        let k_local = compute_local_matrices(&mesh.elements, ctx.params.mu);
        let k_sing = assemble_conductivity(&mesh.elements, mesh.n_nodes(), &k_local);
        info!(
            "built {} element conductivity matrices in {:.3} seconds",
            k_local.len(),
            start.elapsed().as_secs_f32()
        );

        let n_nodes = mesh.n_nodes();
        let n_elements = mesh.n_elements();
        let mut solver = Solver {
            options,
            mu: ctx.params.mu,
            k_local,
            k_sing,
            f_orig: assemble_rhs(n_nodes),
            velocity: VelocitySolver::new(mesh),
            history: TimeStepManager::new(n_nodes, n_elements),
            bcs: SolverBcs::default(),
            fill: vec![0.0; n_nodes],
            pressure: DVector::zeros(n_nodes),
            v_elements: vec![Vector3::zeros(); n_elements],
            v_nodal: vec![Vector3::zeros(); n_nodes],
            free_surface: vec![false; n_nodes],
            current_time: 0.0,
            next_wo_time: ctx.params.wo_delta_time,
            step_end_time: f64::INFINITY,
            n_empty: n_nodes,
        };
        solver.initialise_new_solution(ctx)?;
        Ok(solver)
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn n_empty_cvs(&self) -> usize {
        self.n_empty
    }

    pub fn fill_factor(&self) -> &[f64] {
        &self.fill
    }

    pub fn pressure(&self) -> &DVector<f64> {
        &self.pressure
    }

    pub fn history(&self) -> &TimeStepManager {
        &self.history
    }

    /// Schedules the next periodic write-out one interval after the current
    /// time
    pub fn reschedule_write_out(&mut self, wo_delta_time: f64) {
        self.next_wo_time = self.current_time + wo_delta_time;
    }

    /// Empties the part and restores the initial boundary conditions. The
    /// assembled system is reused unless the viscosity changed.
    pub fn initialise_new_solution(&mut self, ctx: SolverContext) -> Result<(), InfuseError> {
        let SolverContext {
            mesh,
            bcs,
            sensors,
            params,
        } = ctx;
        params.validate()?;
        if params.mu != self.mu {
            info!("viscosity changed to {}, reassembling", params.mu);
            self.k_local = compute_local_matrices(&mesh.elements, params.mu);
            self.k_sing = assemble_conductivity(&mesh.elements, mesh.n_nodes(), &self.k_local);
            self.mu = params.mu;
        }

        bcs.reset_inlets();
        self.fill.iter_mut().for_each(|f| *f = 0.0);
        self.v_elements.iter_mut().for_each(|v| *v = Vector3::zeros());
        self.v_nodal.iter_mut().for_each(|v| *v = Vector3::zeros());
        self.pressure.fill(0.0);
        self.current_time = 0.0;
        self.next_wo_time = params.wo_delta_time;
        self.step_end_time = f64::INFINITY;

        self.bcs = bcs.dirichlet_bcs(mesh, &self.fill)?;
        for (i, p) in self.bcs.dirichlet_idx.iter().zip(&self.bcs.dirichlet_vals) {
            self.fill[*i] = 1.0;
            self.pressure[*i] = *p;
        }
        self.free_surface.iter_mut().for_each(|s| *s = false);
        for i in &self.bcs.dirichlet_idx {
            self.free_surface[*i] = true;
        }
        self.n_empty = self.bcs.p0_idx.len();

        self.history.reset();
        self.history.save_timestep(StepRecord {
            time: 0.0,
            dt: 0.0,
            pressure: self.pressure.as_slice(),
            velocity: &self.v_elements,
            nodal_velocity: &self.v_nodal,
            fill_factor: &self.fill,
            free_surface: &self.free_surface,
            inlet_flow_rate: 0.0,
            write_out: true,
        });

        sensors.initialise(mesh)?;
        sensors.reset_sensors();
        sensors.probe(0.0, self.pressure.as_slice(), &self.v_nodal, &self.fill);
        sensors.check_for_new_triggered(&self.fill);

        debug!(
            "new solution initialised: {} inlet nodes, {} empty control volumes",
            self.bcs.dirichlet_idx.len(),
            self.n_empty
        );
        Ok(())
    }

    /// Pressure solve following the retry policy: a solve that does not
    /// converge is repeated with relaxed options up to `max_retries` times
    fn solve_pressure_with_retries(&self, bcs: &SolverBcs) -> Result<DVector<f64>, InfuseError> {
        let mut options = self.options.clone();
        let mut attempt = 0;
        loop {
            match solve_pressure(&self.k_sing, &self.f_orig, bcs, &options) {
                SolveOutcome::Converged { pressure, .. } => return Ok(pressure),
                SolveOutcome::Failed { reason } => return Err(InfuseError::SolverBreakdown(reason)),
                SolveOutcome::NotConverged {
                    iterations,
                    residual,
                    ..
                } => {
                    if attempt >= self.options.max_retries {
                        return Err(InfuseError::NotConverged {
                            iterations,
                            residual,
                        });
                    }
                    attempt += 1;
                    options = options.relaxed();
                    warn!(
                        "pressure solve did not converge after {iterations} iterations (residual {residual:.3e}), retrying with tol={:e}, max_iter={}",
                        options.tol, options.max_iter
                    );
                }
            }
        }
    }

    /// Applies the interval end and the periodic write-out to a candidate
    /// time step
    fn handle_wo_criterion(&mut self, dt: f64, wo_delta_time: f64) -> WriteOut {
        let next_time = self.current_time + dt;
        if next_time >= self.step_end_time {
            if wo_delta_time > 0.0 {
                while self.next_wo_time <= self.step_end_time {
                    self.next_wo_time += wo_delta_time;
                }
            }
            return WriteOut {
                dt: self.step_end_time - self.current_time,
                end_time: Some(self.step_end_time),
                write_out: true,
                interval_end: true,
            };
        }
        if wo_delta_time <= 0.0 {
            return WriteOut {
                dt,
                end_time: None,
                write_out: true,
                interval_end: false,
            };
        }
        if next_time >= self.next_wo_time {
            let end_time = self.next_wo_time;
            self.next_wo_time += wo_delta_time;
            return WriteOut {
                dt: end_time - self.current_time,
                end_time: Some(end_time),
                write_out: true,
                interval_end: false,
            };
        }
        WriteOut {
            dt,
            end_time: None,
            write_out: false,
            interval_end: false,
        }
    }

    /// Advances the simulation by one explicit step
    ///
    /// # Returns
    /// Why the step ended the current solve, if it did
    pub fn solve_time_step(&mut self, ctx: SolverContext) -> Result<Option<StepEnd>, InfuseError> {
        let SolverContext {
            mesh,
            bcs,
            sensors,
            params,
        } = ctx;
        let cvs = &mesh.control_volumes;

        let step_bcs = bcs.dirichlet_bcs(mesh, &self.fill)?;
        let pressure = self.solve_pressure_with_retries(&step_bcs)?;

        let v_elements = self.velocity.element_velocities(&pressure, self.mu);
        let (active, free_surface) = find_free_surface(&self.fill, cvs);
        let fluxes = volumetric_fluxes(&active, cvs, &v_elements);
        let dt = time_step(&self.fill, &active, &fluxes, cvs).ok_or(InfuseError::Stalled {
            time: self.current_time,
            empty_cvs: self.n_empty,
        })?;

        // The step is committed from here on
        let v_nodal = self.velocity.nodal_velocities(&v_elements);
        let inlet_flow_rate =
            self.velocity
                .inlet_flow_rate(&self.k_local, &pressure, &step_bcs.dirichlet_idx);
        let mut criterion = self.handle_wo_criterion(dt, params.wo_delta_time);
        let newly_full = advance(
            &mut self.fill,
            &active,
            &fluxes,
            cvs,
            criterion.dt,
            params.fill_tolerance,
        );
        self.current_time = match criterion.end_time {
            Some(t) => t,
            None => self.current_time + criterion.dt,
        };
        self.bcs = step_bcs;
        self.pressure = pressure;
        self.v_elements = v_elements;
        self.v_nodal = v_nodal;
        self.free_surface = free_surface;

        self.n_empty = self.fill.iter().filter(|f| **f < 1.0).count();
        if self.n_empty == 0 {
            criterion.write_out = true;
        }
        let sensor_triggered = params.end_step_when_sensor_triggered
            && sensors.check_for_new_triggered(&self.fill);
        if sensor_triggered {
            info!("sensor triggered at t = {:.5}", self.current_time);
            criterion.write_out = true;
        }

        self.history.save_timestep(StepRecord {
            time: self.current_time,
            dt: criterion.dt,
            pressure: self.pressure.as_slice(),
            velocity: &self.v_elements,
            nodal_velocity: &self.v_nodal,
            fill_factor: &self.fill,
            free_surface: &self.free_surface,
            inlet_flow_rate,
            write_out: criterion.write_out,
        });
        if criterion.write_out {
            sensors.probe(
                self.current_time,
                self.pressure.as_slice(),
                &self.v_nodal,
                &self.fill,
            );
        }

        debug!(
            "t = {:.5}, dt = {:.3e}, {} active, {} newly full, {} empty",
            self.current_time,
            criterion.dt,
            active.len(),
            newly_full,
            self.n_empty
        );
        Ok(if self.n_empty == 0 {
            Some(StepEnd::Filled)
        } else if sensor_triggered {
            Some(StepEnd::SensorTriggered)
        } else if criterion.interval_end {
            Some(StepEnd::IntervalElapsed)
        } else {
            None
        })
    }

    fn progress_bar(&self, n_cvs: usize, show_progress: bool) -> ProgressBar {
        let bar = if show_progress {
            ProgressBar::new(n_cvs as u64)
        } else {
            ProgressBar::hidden()
        };
        bar.set_position((n_cvs - self.n_empty) as u64);
        bar
    }

    /// Runs until every control volume is full
    pub fn solve(&mut self, ctx: SolverContext, show_progress: bool) -> Result<(), InfuseError> {
        let SolverContext {
            mesh,
            bcs,
            sensors,
            params,
        } = ctx;
        let start = Instant::now();
        info!("solve started for mesh with {} elements", mesh.n_elements());

        self.step_end_time = f64::INFINITY;
        let bar = self.progress_bar(mesh.n_nodes(), show_progress);
        while self.n_empty > 0 {
            self.solve_time_step(SolverContext {
                mesh,
                bcs: &mut *bcs,
                sensors: &mut *sensors,
                params,
            })?;
            bar.set_position((mesh.n_nodes() - self.n_empty) as u64);
        }
        bar.finish_and_clear();

        info!(
            "solve completed in {:.2} seconds: fill time {:.5} s after {} steps",
            start.elapsed().as_secs_f32(),
            self.current_time,
            self.history.len() - 1
        );
        Ok(())
    }

    /// Runs until the part is full, `interval` has elapsed or, if enabled, a
    /// sensor triggers
    pub fn solve_time_interval(
        &mut self,
        ctx: SolverContext,
        interval: f64,
        show_progress: bool,
    ) -> Result<StepEnd, InfuseError> {
        if !(interval > 0.0) {
            return Err(InfuseError::Config(format!(
                "time interval must be positive, got {interval}"
            )));
        }
        let SolverContext {
            mesh,
            bcs,
            sensors,
            params,
        } = ctx;
        let start = Instant::now();

        self.step_end_time = self.current_time + interval;
        let bar = self.progress_bar(mesh.n_nodes(), show_progress);
        let mut end = None;
        while end.is_none() && self.n_empty > 0 {
            end = self.solve_time_step(SolverContext {
                mesh,
                bcs: &mut *bcs,
                sensors: &mut *sensors,
                params,
            })?;
            bar.set_position((mesh.n_nodes() - self.n_empty) as u64);
        }
        bar.finish_and_clear();
        self.step_end_time = f64::INFINITY;

        debug!(
            "interval solve finished at t = {:.5} in {:.3} seconds",
            self.current_time,
            start.elapsed().as_secs_f32()
        );
        Ok(end.unwrap_or(StepEnd::Filled))
    }

    /// Flags the last step as written out and packs every written-out step
    pub fn pack_solution(&mut self) -> Solution {
        self.history.pack_solution()
    }
}
