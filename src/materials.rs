use std::collections::BTreeMap;

use log::debug;
use nalgebra::{Matrix3, Vector3};

use crate::error::InfuseError;

/// Absolute tolerance under which principal permeabilities count as equal
const ISOTROPY_TOL: f64 = 1e-14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RosetteId(usize);

/// Selects a material either by handle or by name
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialSelector {
    Id(MaterialId),
    Name(String),
}

impl From<MaterialId> for MaterialSelector {
    fn from(id: MaterialId) -> Self {
        MaterialSelector::Id(id)
    }
}

impl From<&str> for MaterialSelector {
    fn from(name: &str) -> Self {
        MaterialSelector::Name(name.to_owned())
    }
}

impl From<String> for MaterialSelector {
    fn from(name: String) -> Self {
        MaterialSelector::Name(name)
    }
}

/// Selects a rosette either by handle or by name
#[derive(Debug, Clone, PartialEq)]
pub enum RosetteSelector {
    Id(RosetteId),
    Name(String),
}

impl From<RosetteId> for RosetteSelector {
    fn from(id: RosetteId) -> Self {
        RosetteSelector::Id(id)
    }
}

impl From<&str> for RosetteSelector {
    fn from(name: &str) -> Self {
        RosetteSelector::Name(name.to_owned())
    }
}

impl From<String> for RosetteSelector {
    fn from(name: String) -> Self {
        RosetteSelector::Name(name)
    }
}

/// Porous reinforcement defined by its principal permeabilities, porosity
/// and thickness
#[derive(Debug, Clone, PartialEq)]
pub struct PorousMaterial {
    pub name: String,
    /// Principal permeabilities along the rosette axes [m^2]
    pub k_principal: Vector3<f64>,
    pub porosity: f64,
    pub thickness: f64,
    pub is_isotropic: bool,
}

impl PorousMaterial {
    pub fn new(
        name: &str,
        k: [f64; 3],
        porosity: f64,
        thickness: f64,
    ) -> Result<PorousMaterial, InfuseError> {
        if k.iter().any(|v| !(*v > 0.0)) {
            return Err(InfuseError::Config(format!(
                "material '{name}': permeabilities must be positive, got {k:?}"
            )));
        }
        if !(porosity > 0.0 && porosity <= 1.0) {
            return Err(InfuseError::Config(format!(
                "material '{name}': porosity must lie in (0, 1], got {porosity}"
            )));
        }
        if !(thickness > 0.0) {
            return Err(InfuseError::Config(format!(
                "material '{name}': thickness must be positive, got {thickness}"
            )));
        }

        let is_isotropic = k.iter().all(|v| (v - k[0]).abs() <= ISOTROPY_TOL);

        Ok(PorousMaterial {
            name: name.to_owned(),
            k_principal: Vector3::from(k),
            porosity,
            thickness,
            is_isotropic,
        })
    }

    pub fn k_diag(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&self.k_principal)
    }
}

/// Orientation of the first principal permeability direction
#[derive(Debug, Clone, PartialEq)]
pub struct Rosette {
    pub name: String,
    pub u: Vector3<f64>,
}

impl Rosette {
    /// Creates a rosette whose first axis is `p1 - p0`
    pub fn from_points(name: &str, p1: [f64; 3], p0: [f64; 3]) -> Result<Rosette, InfuseError> {
        let u = Vector3::from(p1) - Vector3::from(p0);
        if !(u.norm() > 0.0) {
            return Err(InfuseError::Config(format!(
                "rosette '{name}': axis points coincide"
            )));
        }
        Ok(Rosette {
            name: name.to_owned(),
            u,
        })
    }

    /// Builds the local to global rotation of an element with unit normal
    /// `normal`. The columns are the projected rosette axis, the second
    /// in-plane axis and the normal.
    pub fn project_along_normal(&self, normal: &Vector3<f64>) -> Result<Matrix3<f64>, InfuseError> {
        let u_project = self.u - normal * self.u.dot(normal);
        let u_norm = u_project.norm();
        if !(u_norm > 1e-12 * self.u.norm()) {
            return Err(InfuseError::Config(format!(
                "rosette '{}' is parallel to an element normal and cannot be projected",
                self.name
            )));
        }
        let u_project = u_project / u_norm;
        let v_project = u_project.cross(normal).normalize();

        Ok(Matrix3::from_columns(&[u_project, v_project, *normal]))
    }
}

/// Resolved material properties of a single element
#[derive(Debug, Clone, PartialEq)]
pub struct ElementProperties {
    pub permeability: Matrix3<f64>,
    pub porosity: f64,
    pub thickness: f64,
}

/// Registry of materials, rosettes and their assignment to mesh regions
#[derive(Debug, Clone, Default)]
pub struct MaterialManager {
    materials: Vec<PorousMaterial>,
    rosettes: Vec<Rosette>,
    /// mesh tag -> (material, rosette). No rosette means the global X axis.
    assignments: BTreeMap<String, (MaterialId, Option<RosetteId>)>,
}

impl MaterialManager {
    pub fn new() -> MaterialManager {
        MaterialManager::default()
    }

    /// Registers a new material. Unnamed materials are called `Material_{n}`.
    pub fn create_material(
        &mut self,
        k: [f64; 3],
        porosity: f64,
        thickness: f64,
        name: Option<&str>,
    ) -> Result<MaterialId, InfuseError> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => format!("Material_{}", self.materials.len()),
        };
        if self.materials.iter().any(|m| m.name == name) {
            return Err(InfuseError::Config(format!(
                "the material name '{name}' is not unique"
            )));
        }

        self.materials
            .push(PorousMaterial::new(&name, k, porosity, thickness)?);
        Ok(MaterialId(self.materials.len() - 1))
    }

    /// Registers a new rosette with axis `p1 - p0`. Unnamed rosettes are
    /// called `Rosette_{n}`.
    pub fn create_rosette(
        &mut self,
        p1: [f64; 3],
        p0: [f64; 3],
        name: Option<&str>,
    ) -> Result<RosetteId, InfuseError> {
        let name = match name {
            Some(n) => n.to_owned(),
            None => format!("Rosette_{}", self.rosettes.len()),
        };
        if self.rosettes.iter().any(|r| r.name == name) {
            return Err(InfuseError::Config(format!(
                "the rosette name '{name}' is not unique"
            )));
        }

        self.rosettes.push(Rosette::from_points(&name, p1, p0)?);
        Ok(RosetteId(self.rosettes.len() - 1))
    }

    pub fn fetch_material(
        &self,
        selector: impl Into<MaterialSelector>,
    ) -> Result<MaterialId, InfuseError> {
        match selector.into() {
            MaterialSelector::Id(id) if id.0 < self.materials.len() => Ok(id),
            MaterialSelector::Id(id) => Err(InfuseError::Lookup(format!(
                "material id {} does not exist",
                id.0
            ))),
            MaterialSelector::Name(name) => self
                .materials
                .iter()
                .position(|m| m.name == name)
                .map(MaterialId)
                .ok_or_else(|| {
                    InfuseError::Lookup(format!(
                        "material '{name}' is not found in existing materials"
                    ))
                }),
        }
    }

    pub fn fetch_rosette(
        &self,
        selector: impl Into<RosetteSelector>,
    ) -> Result<RosetteId, InfuseError> {
        match selector.into() {
            RosetteSelector::Id(id) if id.0 < self.rosettes.len() => Ok(id),
            RosetteSelector::Id(id) => Err(InfuseError::Lookup(format!(
                "rosette id {} does not exist",
                id.0
            ))),
            RosetteSelector::Name(name) => self
                .rosettes
                .iter()
                .position(|r| r.name == name)
                .map(RosetteId)
                .ok_or_else(|| {
                    InfuseError::Lookup(format!(
                        "rosette '{name}' is not found in existing rosettes"
                    ))
                }),
        }
    }

    pub fn material(&self, id: MaterialId) -> &PorousMaterial {
        &self.materials[id.0]
    }

    pub fn rosette(&self, id: RosetteId) -> &Rosette {
        &self.rosettes[id.0]
    }

    /// Binds a material, and optionally a rosette, to a mesh region tag.
    /// A later assignment to the same tag replaces the earlier one.
    pub fn assign_material(
        &mut self,
        material: impl Into<MaterialSelector>,
        mesh_tag: &str,
        rosette: Option<RosetteSelector>,
    ) -> Result<(), InfuseError> {
        let material_id = self.fetch_material(material)?;
        let rosette_id = match rosette {
            Some(sel) => Some(self.fetch_rosette(sel)?),
            None => None,
        };

        debug!(
            "assigned material '{}' to region '{mesh_tag}'",
            self.materials[material_id.0].name
        );
        self.assignments
            .insert(mesh_tag.to_owned(), (material_id, rosette_id));
        Ok(())
    }

    pub fn assigned_tags(&self) -> impl Iterator<Item = &str> {
        self.assignments.keys().map(|k| k.as_str())
    }

    /// Resolves the global permeability tensor, porosity and thickness of an
    /// element from its region tag and unit normal
    pub fn resolve(
        &self,
        tag: Option<&str>,
        normal: &Vector3<f64>,
    ) -> Result<ElementProperties, InfuseError> {
        let (material_id, rosette_id) = tag
            .and_then(|t| self.assignments.get(t))
            .ok_or_else(|| {
                InfuseError::Config(format!(
                    "mesh contains unassigned material tag: {}",
                    tag.unwrap_or("<untagged>")
                ))
            })?;
        let material = &self.materials[material_id.0];

        let permeability = if material.is_isotropic {
            material.k_diag()
        } else {
            let default_rosette;
            let rosette = match rosette_id {
                Some(id) => &self.rosettes[id.0],
                None => {
                    default_rosette = Rosette {
                        name: "global_x".to_owned(),
                        u: Vector3::x(),
                    };
                    &default_rosette
                }
            };
            let rotation = rosette.project_along_normal(normal)?;
            rotation * material.k_diag() * rotation.transpose()
        };

        Ok(ElementProperties {
            permeability,
            porosity: material.porosity,
            thickness: material.thickness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn auto_names_and_duplicates() {
        let mut manager = MaterialManager::new();
        let a = manager
            .create_material([1e-10; 3], 0.5, 1.0, None)
            .unwrap();
        assert_eq!(manager.material(a).name, "Material_0");
        assert!(manager.material(a).is_isotropic);
        assert!(matches!(
            manager.create_material([1e-10; 3], 0.5, 1.0, Some("Material_0")),
            Err(InfuseError::Config(_))
        ));
        assert_eq!(manager.fetch_material("Material_0").unwrap(), a);
        assert!(matches!(
            manager.fetch_material("glass"),
            Err(InfuseError::Lookup(_))
        ));
    }

    #[test]
    fn unassigned_tag_is_a_configuration_error() {
        let mut manager = MaterialManager::new();
        manager
            .create_material([1e-10; 3], 0.5, 1.0, Some("glass"))
            .unwrap();
        manager.assign_material("glass", "domain", None).unwrap();
        assert!(manager.resolve(Some("domain"), &Vector3::z()).is_ok());
        assert!(matches!(
            manager.resolve(Some("skin"), &Vector3::z()),
            Err(InfuseError::Config(_))
        ));
        assert!(matches!(
            manager.resolve(None, &Vector3::z()),
            Err(InfuseError::Config(_))
        ));
    }

    #[test]
    fn rosette_rotates_principal_directions() {
        let mut manager = MaterialManager::new();
        manager
            .create_material([2e-10, 1e-10, 1e-10], 0.5, 1.0, Some("ud"))
            .unwrap();
        let r = manager
            .create_rosette([0.0, 1.0, 0.0], [0.0, 0.0, 0.0], Some("along_y"))
            .unwrap();
        manager
            .assign_material("ud", "domain", Some(r.into()))
            .unwrap();

        let k = manager
            .resolve(Some("domain"), &Vector3::z())
            .unwrap()
            .permeability;
        assert!((k[(1, 1)] - 2e-10).abs() < 1e-24);
        assert!((k[(0, 0)] - 1e-10).abs() < 1e-24);
        assert!(k[(0, 1)].abs() < 1e-24);
    }

    #[test]
    fn rosette_parallel_to_normal_is_rejected() {
        let rosette = Rosette::from_points("up", [0.0, 0.0, 1.0], [0.0; 3]).unwrap();
        assert!(matches!(
            rosette.project_along_normal(&Vector3::z()),
            Err(InfuseError::Config(_))
        ));
        assert!(Rosette::from_points("none", [1.0; 3], [1.0; 3]).is_err());
    }

    proptest! {
        #[test]
        fn projected_frame_is_orthonormal(
            u in prop::array::uniform3(-1.0f64..1.0),
            n in prop::array::uniform3(-1.0f64..1.0),
        ) {
            let n = Vector3::from(n);
            prop_assume!(n.norm() > 1e-3);
            let n = n.normalize();
            let u_vec = Vector3::from(u);
            prop_assume!(u_vec.norm() > 1e-3);
            prop_assume!(u_vec.normalize().cross(&n).norm() > 1e-3);

            let rosette = Rosette::from_points("r", u, [0.0; 3]).unwrap();
            let r = rosette.project_along_normal(&n).unwrap();
            let identity = r.transpose() * r;
            prop_assert!((identity - Matrix3::identity()).abs().max() < 1e-10);
            prop_assert!(r.column(0).dot(&n).abs() < 1e-10);
        }
    }
}
