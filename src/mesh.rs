use std::collections::BTreeMap;

use log::info;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::{
    cvolume::build_control_volumes,
    datatypes::{ControlVolume, Element, Node},
    error::InfuseError,
    materials::MaterialManager,
    mesher::MeshData,
};

/// Area, unit normal and shape function gradients of a linear triangle
pub struct ElementGeometry {
    pub area: f64,
    pub normal: Vector3<f64>,
    pub grad_n: Matrix3<f64>,
}

/// Calculates the area and the unit normal of a triangle in 3D space
///
/// # Arguments
/// * `v` - The three vertices, in element order
///
/// # Returns
/// The area and the unit normal, in that order
pub fn compute_element_area(v: [&Vector3<f64>; 3]) -> (f64, Vector3<f64>) {
    let cross = (v[1] - v[0]).cross(&(v[2] - v[0]));
    let norm = cross.norm();
    if norm > 0.0 {
        (0.5 * norm, cross / norm)
    } else {
        (0.0, Vector3::zeros())
    }
}

/// Calculates the constant shape function gradients of a linear triangle
///
/// The triangle is mapped to a local in-plane frame `(e1, e2)`, the usual
/// beta/gamma coefficients are evaluated there and mapped back to global
/// coordinates.
///
/// # Arguments
/// * `v` - The three vertices, in element order
///
/// # Returns
/// The element geometry, or an error for degenerate triangles
pub fn compute_element_geometry(v: [&Vector3<f64>; 3]) -> Result<ElementGeometry, InfuseError> {
    let (area, normal) = compute_element_area(v);
    let scale = (v[1] - v[0]).norm() * (v[2] - v[0]).norm();
    if !(area > 1e-14 * scale) {
        return Err(InfuseError::MeshFormat(format!(
            "degenerate triangle with vertices {:?}, {:?}, {:?}",
            v[0].as_slice(),
            v[1].as_slice(),
            v[2].as_slice()
        )));
    }

    let e1 = (v[1] - v[0]).normalize();
    let e2 = normal.cross(&e1);

    let local: Vec<(f64, f64)> = v
        .iter()
        .map(|p| {
            let d = *p - v[0];
            (d.dot(&e1), d.dot(&e2))
        })
        .collect();
    let (x0, y0) = local[0];
    let (x1, y1) = local[1];
    let (x2, y2) = local[2];

    let beta = [y1 - y2, y2 - y0, y0 - y1];
    let gamma = [x2 - x1, x0 - x2, x1 - x0];

    let mut grad_n = Matrix3::zeros();
    for i in 0..3 {
        let g = (e1 * beta[i] + e2 * gamma[i]) / (2.0 * area);
        grad_n.set_column(i, &g);
    }

    Ok(ElementGeometry {
        area,
        normal,
        grad_n,
    })
}

/// Triangular FE mesh with its dual control volumes. All cross references
/// are indices into the arenas owned here.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub case_name: String,
    pub nodes: Vec<Node>,
    pub elements: Vec<Element>,
    /// Unique element edges, lower node index first
    pub edges: Vec<[usize; 2]>,
    pub control_volumes: Vec<ControlVolume>,
    /// Boundary tag -> sorted node indices
    pub boundaries: BTreeMap<String, Vec<usize>>,
    /// Region tag -> element indices
    pub domains: BTreeMap<String, Vec<usize>>,
    preprocessed: bool,
}

impl Mesh {
    /// Builds nodes, elements and adjacency tables from parsed mesh data
    pub fn from_mesh_data(data: MeshData) -> Result<Mesh, InfuseError> {
        let MeshData {
            case_name,
            coords,
            triangles,
            triangle_tags,
            physical_domains,
            boundary_nodes,
            ..
        } = data;

        let geometries = triangles
            .par_iter()
            .map(|t| compute_element_geometry([&coords[t[0]], &coords[t[1]], &coords[t[2]]]))
            .collect::<Result<Vec<ElementGeometry>, InfuseError>>()?;

        let elements: Vec<Element> = triangles
            .iter()
            .zip(triangle_tags)
            .zip(geometries)
            .map(|((nodes, tag), geometry)| Element {
                nodes: *nodes,
                tag,
                area: geometry.area,
                normal: geometry.normal,
                grad_n: geometry.grad_n,
                permeability: Matrix3::zeros(),
                thickness: 0.0,
                porosity: 0.0,
            })
            .collect();

        let mut edges: Vec<[usize; 2]> = triangles
            .iter()
            .flat_map(|t| [[t[0], t[1]], [t[1], t[2]], [t[2], t[0]]])
            .map(|[a, b]| if a < b { [a, b] } else { [b, a] })
            .collect();
        edges.sort_unstable();
        edges.dedup();

        let mut nodes: Vec<Node> = coords
            .into_iter()
            .map(|coords| Node {
                coords,
                elements: Vec::new(),
                neighbours: Vec::new(),
            })
            .collect();
        for (i, element) in elements.iter().enumerate() {
            for n in element.nodes {
                nodes[n].elements.push(i);
            }
        }
        for [a, b] in &edges {
            nodes[*a].neighbours.push(*b);
            nodes[*b].neighbours.push(*a);
        }
        for node in nodes.iter_mut() {
            node.neighbours.sort_unstable();
        }

        Ok(Mesh {
            case_name,
            nodes,
            elements,
            edges,
            control_volumes: Vec::new(),
            boundaries: boundary_nodes,
            domains: physical_domains,
            preprocessed: false,
        })
    }

    /// Resolves element material properties and builds the control volumes.
    /// Can be repeated after material assignments change.
    pub fn preprocess(&mut self, materials: &MaterialManager) -> Result<(), InfuseError> {
        let properties = self
            .elements
            .par_iter()
            .map(|e| materials.resolve(e.tag.as_deref(), &e.normal))
            .collect::<Result<Vec<_>, InfuseError>>()?;

        for (element, props) in self.elements.iter_mut().zip(properties) {
            element.permeability = props.permeability;
            element.porosity = props.porosity;
            element.thickness = props.thickness;
        }

        self.control_volumes = build_control_volumes(&self.nodes, &self.elements);
        self.preprocessed = true;
        info!(
            "mesh pre-processing completed: {} control volumes",
            self.control_volumes.len()
        );
        Ok(())
    }

    pub fn is_preprocessed(&self) -> bool {
        self.preprocessed
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_elements(&self) -> usize {
        self.elements.len()
    }

    /// Node indices of a boundary tag
    pub fn boundary_nodes(&self, tag: &str) -> Result<&[usize], InfuseError> {
        self.boundaries
            .get(tag)
            .map(|nodes| nodes.as_slice())
            .ok_or_else(|| {
                InfuseError::Config(format!(
                    "boundary tag '{tag}' does not exist in the mesh (available: {:?})",
                    self.boundaries.keys().collect::<Vec<_>>()
                ))
            })
    }

    /// Index of the node closest to `point`, first index on ties
    pub fn nearest_node(&self, point: &Vector3<f64>) -> Option<usize> {
        self.nodes
            .iter()
            .map(|n| (n.coords - point).norm_squared())
            .enumerate()
            .fold(None, |best: Option<(usize, f64)>, (i, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((i, d)),
            })
            .map(|(i, _)| i)
    }

    /// Node coordinates packed as a flat `[x0, y0, z0, x1, ...]` array
    pub fn flat_coords(&self) -> Vec<f64> {
        self.nodes
            .iter()
            .flat_map(|n| n.coords.iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesher::parse_msh;

    fn unit_triangle() -> [Vector3<f64>; 3] {
        [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ]
    }

    #[test]
    fn gradients_of_reference_triangle() {
        let v = unit_triangle();
        let g = compute_element_geometry([&v[0], &v[1], &v[2]]).unwrap();
        assert!((g.area - 0.5).abs() < 1e-15);
        assert_eq!(g.normal, Vector3::z());

        let expected = Matrix3::new(
            -1.0, 1.0, 0.0, //
            -1.0, 0.0, 1.0, //
            0.0, 0.0, 0.0,
        );
        assert!((g.grad_n - expected).abs().max() < 1e-14);
    }

    #[test]
    fn gradients_are_frame_independent() {
        // The same triangle tilted into the xz plane
        let v = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let g = compute_element_geometry([&v[0], &v[1], &v[2]]).unwrap();
        assert!((g.area - 0.5).abs() < 1e-15);

        // Gradients sum to zero and reproduce a linear field exactly
        let sum: Vector3<f64> = g.grad_n.column_sum();
        assert!(sum.norm() < 1e-14);
        let field = [0.0, 2.0, 3.0];
        let grad = g.grad_n * Vector3::from(field);
        assert!((grad - Vector3::new(2.0, 0.0, 3.0)).norm() < 1e-14);
    }

    #[test]
    fn degenerate_triangle_is_rejected() {
        let v = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        ];
        assert!(matches!(
            compute_element_geometry([&v[0], &v[1], &v[2]]),
            Err(InfuseError::MeshFormat(_))
        ));
    }

    const TWO_TRIANGLES: &str = "$MeshFormat\n4.1 0 8\n$EndMeshFormat\n\
        $PhysicalNames\n2\n1 1 \"inlet\"\n2 2 \"domain\"\n$EndPhysicalNames\n\
        $Entities\n0 1 1 0\n1 0 0 0 0 1 0 1 1 0\n1 0 0 0 1 1 0 1 2 0\n$EndEntities\n\
        $Nodes\n1 4 1 4\n2 1 0 4\n1\n2\n3\n4\n0 0 0\n1 0 0\n1 1 0\n0 1 0\n$EndNodes\n\
        $Elements\n2 3 1 3\n1 1 1 1\n1 1 4\n2 1 2 2\n2 1 2 3\n3 1 3 4\n$EndElements\n";

    #[test]
    fn adjacency_tables() {
        let mesh = Mesh::from_mesh_data(parse_msh(TWO_TRIANGLES, "t").unwrap()).unwrap();
        assert_eq!(mesh.edges, vec![[0, 1], [0, 2], [0, 3], [1, 2], [2, 3]]);
        assert_eq!(mesh.nodes[0].elements, vec![0, 1]);
        assert_eq!(mesh.nodes[0].neighbours, vec![1, 2, 3]);
        assert_eq!(mesh.nodes[1].neighbours, vec![0, 2]);
        assert_eq!(mesh.boundary_nodes("inlet").unwrap(), &[0, 3]);
        assert!(matches!(
            mesh.boundary_nodes("outlet"),
            Err(InfuseError::Config(_))
        ));
        assert_eq!(mesh.nearest_node(&Vector3::new(0.9, 0.8, 0.0)), Some(2));
    }
}
