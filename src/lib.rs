//! Resin infusion filling simulation.
//!
//! A finite element Darcy pressure solve on linear triangles is coupled to a
//! node centred control volume scheme that tracks the advancing resin front.
//! [`Model`] is the entry point.

pub mod assembler;
pub mod bcond;
pub mod case;
pub mod cvolume;
pub mod datatypes;
pub mod error;
pub mod fill;
pub mod krylov;
pub mod materials;
pub mod mesh;
pub mod mesher;
pub mod model;
pub mod post_processor;
pub mod psolver;
pub mod sensors;
pub mod solver;
pub mod timestep;
pub mod velocity;

pub use case::{load_case, Case};
pub use bcond::{InletId, InletSelector, PressureMode};
pub use datatypes::{ParamValue, SimulationParameters};
pub use error::InfuseError;
pub use materials::{MaterialId, MaterialSelector, RosetteId, RosetteSelector};
pub use model::Model;
pub use post_processor::{OutputFormat, OutputOptions};
pub use psolver::{KrylovMethod, PreconditionerKind, SolverOptions, SolverType};
pub use sensors::SensorId;
pub use solver::StepEnd;
pub use timestep::{Solution, SolutionStep};
