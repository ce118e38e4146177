use nalgebra::Vector3;
use rayon::prelude::*;

use crate::datatypes::{ControlVolume, Element, Node};

/// Outward normal of the CV boundary segment `a -> b` inside a triangle with
/// unit normal `n`, scaled by the segment length. `inside` is a point of the
/// control volume.
fn segment_normal(
    a: &Vector3<f64>,
    b: &Vector3<f64>,
    n: &Vector3<f64>,
    inside: &Vector3<f64>,
) -> Vector3<f64> {
    let normal = (b - a).cross(n);
    let midpoint = (a + b) * 0.5;
    if normal.dot(&(midpoint - inside)) < 0.0 {
        -normal
    } else {
        normal
    }
}

/// Builds the median dual control volume of one node
///
/// Inside each support triangle the CV is bounded by the two segments joining
/// the edge midpoints of the node to the centroid. Their outward normals,
/// weighted by length and thickness and negated, give the flux term of that
/// element: the inflow rate is `v_e . flux_term`.
pub fn build_control_volume(node_idx: usize, nodes: &[Node], elements: &[Element]) -> ControlVolume {
    let node = &nodes[node_idx];
    let x_i = node.coords;

    let mut volume = 0.0;
    let mut flux_terms = Vec::with_capacity(node.elements.len());

    for &e in &node.elements {
        let element = &elements[e];
        let others: Vec<usize> = element
            .nodes
            .iter()
            .copied()
            .filter(|n| *n != node_idx)
            .collect();
        let x_j = nodes[others[0]].coords;
        let x_l = nodes[others[1]].coords;

        let centroid = (x_i + x_j + x_l) / 3.0;
        let m_ij = (x_i + x_j) * 0.5;
        let m_il = (x_i + x_l) * 0.5;

        let n1 = segment_normal(&m_ij, &centroid, &element.normal, &x_i);
        let n2 = segment_normal(&centroid, &m_il, &element.normal, &x_i);

        volume += element.area / 3.0 * element.thickness * element.porosity;
        flux_terms.push(-(n1 + n2) * element.thickness);
    }

    ControlVolume {
        node: node_idx,
        volume,
        support_elements: node.elements.clone(),
        flux_terms,
        neighbours: node.neighbours.clone(),
    }
}

/// Builds one control volume per node, in node order
pub fn build_control_volumes(nodes: &[Node], elements: &[Element]) -> Vec<ControlVolume> {
    (0..nodes.len())
        .into_par_iter()
        .map(|i| build_control_volume(i, nodes, elements))
        .collect()
}
