use log::info;
use nalgebra::{DVector, Matrix3, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;

use crate::datatypes::Element;

/// Symmetric 3x3 element matrix stored as
/// `[k00, k11, k22, k01, k02, k12]`
pub type CompressedLocal = [f64; 6];

/// Computes the conductivity matrix of an element
///
/// # Arguments
/// * `element` - The preprocessed element
/// * `mu` - The resin viscosity
///
/// # Returns
/// The 3x3 matrix `gradN^T k gradN A h / mu`
pub fn compute_element_conductivity(element: &Element, mu: f64) -> Matrix3<f64> {
    element.grad_n.transpose() * element.permeability * element.grad_n * element.area * element.thickness
        / mu
}

pub fn compress_local(k: &Matrix3<f64>) -> CompressedLocal {
    [
        k[(0, 0)],
        k[(1, 1)],
        k[(2, 2)],
        k[(0, 1)],
        k[(0, 2)],
        k[(1, 2)],
    ]
}

pub fn expand_local(c: &CompressedLocal) -> Matrix3<f64> {
    Matrix3::new(
        c[0], c[3], c[4], //
        c[3], c[1], c[5], //
        c[4], c[5], c[2],
    )
}

/// Multiplies a compressed element matrix with the element nodal values
pub fn compressed_mul(c: &CompressedLocal, p: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(
        c[0] * p[0] + c[3] * p[1] + c[4] * p[2],
        c[3] * p[0] + c[1] * p[1] + c[5] * p[2],
        c[4] * p[0] + c[5] * p[1] + c[2] * p[2],
    )
}

/// Computes the compressed conductivity matrices of all elements, in
/// element order
pub fn compute_local_matrices(elements: &[Element], mu: f64) -> Vec<CompressedLocal> {
    elements
        .par_iter()
        .map(|e| compress_local(&compute_element_conductivity(e, mu)))
        .collect()
}

/// Scatters element matrices into the global sparse conductivity matrix. The
/// result has no boundary conditions applied and is singular.
///
/// # Arguments
/// * `elements` - A reference to the vector of elements
/// * `n_nodes` - The number of mesh nodes
/// * `k_local` - Compressed element matrices, in element order
///
/// # Returns
/// The global matrix in CSR format, duplicates summed
pub fn assemble_conductivity(
    elements: &[Element],
    n_nodes: usize,
    k_local: &[CompressedLocal],
) -> CsrMatrix<f64> {
    let mut coo = CooMatrix::new(n_nodes, n_nodes);
    for (element, local) in elements.iter().zip(k_local) {
        let k_el = expand_local(local);
        for (local_row, global_row) in element.nodes.iter().enumerate() {
            for (local_col, global_col) in element.nodes.iter().enumerate() {
                coo.push(*global_row, *global_col, k_el[(local_row, local_col)]);
            }
        }
    }

    let k_sing = CsrMatrix::from(&coo);
    info!(
        "assembled conductivity matrix: {} nodes, {} non-zeros",
        n_nodes,
        k_sing.nnz()
    );
    k_sing
}

/// Right hand side of the unconstrained system. There are no volumetric
/// sources, so it is zero.
pub fn assemble_rhs(n_nodes: usize) -> DVector<f64> {
    DVector::zeros(n_nodes)
}
