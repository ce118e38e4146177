use nalgebra::{DVector, Matrix3, Vector3};
use rayon::prelude::*;

use crate::{
    assembler::{compressed_mul, CompressedLocal},
    mesh::Mesh,
};

/// Recovers Darcy velocities from a nodal pressure field. Holds the
/// per-element `B = k^T gradN` so a step only needs one small product per
/// element.
#[derive(Debug, Clone)]
pub struct VelocitySolver {
    b: Vec<Matrix3<f64>>,
    connectivity: Vec<[usize; 3]>,
    node_elements: Vec<Vec<usize>>,
}

impl VelocitySolver {
    pub fn new(mesh: &Mesh) -> VelocitySolver {
        VelocitySolver {
            b: mesh
                .elements
                .par_iter()
                .map(|e| e.permeability.transpose() * e.grad_n)
                .collect(),
            connectivity: mesh.elements.iter().map(|e| e.nodes).collect(),
            node_elements: mesh.nodes.iter().map(|n| n.elements.clone()).collect(),
        }
    }

    fn local_values(&self, element: usize, p: &DVector<f64>) -> Vector3<f64> {
        let [a, b, c] = self.connectivity[element];
        Vector3::new(p[a], p[b], p[c])
    }

    /// Element velocities `v = -(1/mu) B p_e`, in element order
    pub fn element_velocities(&self, p: &DVector<f64>, mu: f64) -> Vec<Vector3<f64>> {
        self.b
            .par_iter()
            .enumerate()
            .map(|(i, b)| -(b * self.local_values(i, p)) / mu)
            .collect()
    }

    /// Nodal velocities as the mean of the incident element velocities.
    /// Elements with an exactly zero velocity are not reached by resin yet
    /// and are left out of the mean.
    pub fn nodal_velocities(&self, v_elements: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        self.node_elements
            .par_iter()
            .map(|elements| {
                let (sum, count) = elements
                    .iter()
                    .map(|e| v_elements[*e])
                    .filter(|v| v.iter().any(|c| *c != 0.0))
                    .fold((Vector3::zeros(), 0usize), |(s, n), v| (s + v, n + 1));
                if count > 0 {
                    sum / count as f64
                } else {
                    Vector3::zeros()
                }
            })
            .collect()
    }

    /// Nodal reactions `sum_e K_e p_e`, the net volumetric flow rate leaving
    /// each node into the part
    pub fn nodal_flow_rates(&self, k_local: &[CompressedLocal], p: &DVector<f64>) -> DVector<f64> {
        let mut reactions = DVector::zeros(p.len());
        for (i, local) in k_local.iter().enumerate() {
            let r = compressed_mul(local, &self.local_values(i, p));
            for (a, node) in self.connectivity[i].iter().enumerate() {
                reactions[*node] += r[a];
            }
        }
        reactions
    }

    /// Volumetric flow rate entering the part through the given nodes
    pub fn inlet_flow_rate(
        &self,
        k_local: &[CompressedLocal],
        p: &DVector<f64>,
        inlet_nodes: &[usize],
    ) -> f64 {
        if inlet_nodes.is_empty() {
            return 0.0;
        }
        let reactions = self.nodal_flow_rates(k_local, p);
        inlet_nodes.iter().map(|n| reactions[*n]).sum()
    }
}
