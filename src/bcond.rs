use std::collections::BTreeMap;
use std::str::FromStr;

use log::debug;

use crate::{datatypes::SolverBcs, error::InfuseError, mesh::Mesh};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InletId(usize);

/// Selects an inlet either by handle or by name
#[derive(Debug, Clone, PartialEq)]
pub enum InletSelector {
    Id(InletId),
    Name(String),
}

impl From<InletId> for InletSelector {
    fn from(id: InletId) -> Self {
        InletSelector::Id(id)
    }
}

impl From<&str> for InletSelector {
    fn from(name: &str) -> Self {
        InletSelector::Name(name.to_owned())
    }
}

impl From<String> for InletSelector {
    fn from(name: String) -> Self {
        InletSelector::Name(name)
    }
}

/// How `change_inlet_pressure` applies its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureMode {
    #[default]
    Set,
    Delta,
}

impl FromStr for PressureMode {
    type Err = InfuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(PressureMode::Set),
            "delta" => Ok(PressureMode::Delta),
            other => Err(InfuseError::Config(format!(
                "unknown pressure mode '{other}', expected 'set' or 'delta'"
            ))),
        }
    }
}

/// Pressure inlet. Closed inlets act as no-flux walls and keep their
/// pressure value.
#[derive(Debug, Clone, PartialEq)]
pub struct Inlet {
    pub name: String,
    p_value: f64,
    p0: f64,
    open: bool,
}

impl Inlet {
    fn new(name: String, pressure: f64) -> Result<Inlet, InfuseError> {
        check_pressure(&name, pressure)?;
        Ok(Inlet {
            name,
            p_value: pressure,
            p0: pressure,
            open: true,
        })
    }

    /// Current pressure [Pa]
    pub fn pressure(&self) -> f64 {
        self.p_value
    }

    /// Pressure at creation time [Pa]
    pub fn initial_pressure(&self) -> f64 {
        self.p0
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn set_pressure(&mut self, value: f64) -> Result<(), InfuseError> {
        check_pressure(&self.name, value)?;
        self.p_value = value;
        Ok(())
    }

    fn reset(&mut self) {
        self.p_value = self.p0;
        self.open = true;
    }
}

fn check_pressure(name: &str, value: f64) -> Result<(), InfuseError> {
    if value >= 0.0 {
        Ok(())
    } else {
        Err(InfuseError::Config(format!(
            "inlet '{name}': pressure must be non-negative, got {value}"
        )))
    }
}

/// Registry of existing inlets and of their assignment to mesh boundaries
#[derive(Debug, Clone, Default)]
pub struct BcManager {
    inlets: Vec<Inlet>,
    /// boundary tag -> inlet, iterated in tag order
    assigned: BTreeMap<String, InletId>,
}

impl BcManager {
    pub fn new() -> BcManager {
        BcManager::default()
    }

    /// Registers a new inlet. Unnamed inlets are called `Inlet_{n}`.
    pub fn create_inlet(&mut self, pressure: f64, name: Option<&str>) -> Result<InletId, InfuseError> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => format!("Inlet_{}", self.inlets.len()),
        };
        if self.inlets.iter().any(|i| i.name == name) {
            return Err(InfuseError::Config(format!(
                "the inlet name '{name}' is not unique"
            )));
        }

        self.inlets.push(Inlet::new(name, pressure)?);
        Ok(InletId(self.inlets.len() - 1))
    }

    pub fn fetch_inlet(&self, selector: impl Into<InletSelector>) -> Result<InletId, InfuseError> {
        match selector.into() {
            InletSelector::Id(id) if id.0 < self.inlets.len() => Ok(id),
            InletSelector::Id(id) => Err(InfuseError::Lookup(format!(
                "inlet id {} does not exist",
                id.0
            ))),
            InletSelector::Name(name) => self
                .inlets
                .iter()
                .position(|i| i.name == name)
                .map(InletId)
                .ok_or_else(|| {
                    InfuseError::Lookup(format!(
                        "inlet '{name}' is not found in existing inlets"
                    ))
                }),
        }
    }

    pub fn inlet(&self, id: InletId) -> &Inlet {
        &self.inlets[id.0]
    }

    /// Binds an inlet to a boundary tag. An inlet that is already assigned
    /// keeps its first boundary.
    pub fn assign_inlet(
        &mut self,
        selector: impl Into<InletSelector>,
        boundary_tag: &str,
    ) -> Result<(), InfuseError> {
        let id = self.fetch_inlet(selector)?;
        if self.assigned.values().any(|assigned| *assigned == id) {
            debug!(
                "inlet '{}' is already assigned, ignoring boundary '{boundary_tag}'",
                self.inlets[id.0].name
            );
            return Ok(());
        }
        self.assigned.insert(boundary_tag.to_owned(), id);
        Ok(())
    }

    pub fn change_inlet_pressure(
        &mut self,
        selector: impl Into<InletSelector>,
        value: f64,
        mode: PressureMode,
    ) -> Result<(), InfuseError> {
        let id = self.fetch_inlet(selector)?;
        let inlet = &mut self.inlets[id.0];
        match mode {
            PressureMode::Set => inlet.set_pressure(value),
            PressureMode::Delta => inlet.set_pressure(inlet.p_value + value),
        }
    }

    pub fn open_inlet(&mut self, selector: impl Into<InletSelector>) -> Result<(), InfuseError> {
        let id = self.fetch_inlet(selector)?;
        self.inlets[id.0].open = true;
        Ok(())
    }

    pub fn close_inlet(&mut self, selector: impl Into<InletSelector>) -> Result<(), InfuseError> {
        let id = self.fetch_inlet(selector)?;
        self.inlets[id.0].open = false;
        Ok(())
    }

    /// Restores every assigned inlet to its creation pressure and reopens it
    pub fn reset_inlets(&mut self) {
        for id in self.assigned.values() {
            self.inlets[id.0].reset();
        }
    }

    pub fn assigned_inlets(&self) -> impl Iterator<Item = (&str, &Inlet)> {
        self.assigned
            .iter()
            .map(|(tag, id)| (tag.as_str(), &self.inlets[id.0]))
    }

    /// Builds the Dirichlet set of the next pressure solve
    ///
    /// Open inlets prescribe their pressure on their boundary nodes; a node
    /// shared by several open inlets keeps the first one in tag order. Every
    /// other node that is not full is held at zero pressure.
    ///
    /// # Arguments
    /// * `mesh` - The mesh the boundary tags refer to
    /// * `fill` - Current fill factor of every control volume
    pub fn dirichlet_bcs(&self, mesh: &Mesh, fill: &[f64]) -> Result<SolverBcs, InfuseError> {
        let mut bcs = SolverBcs::default();
        let mut is_inlet = vec![false; mesh.n_nodes()];

        for (tag, id) in &self.assigned {
            let nodes = mesh.boundary_nodes(tag)?;
            let inlet = &self.inlets[id.0];
            if !inlet.open {
                continue;
            }
            for &n in nodes {
                if !is_inlet[n] {
                    is_inlet[n] = true;
                    bcs.dirichlet_idx.push(n);
                    bcs.dirichlet_vals.push(inlet.p_value);
                }
            }
        }

        bcs.p0_idx = (0..mesh.n_nodes())
            .filter(|&n| !is_inlet[n] && fill[n] < 1.0)
            .collect();

        Ok(bcs)
    }
}
