use nalgebra::Vector3;
use rayon::prelude::*;

use crate::datatypes::ControlVolume;

/// Smallest gap to a full control volume that is not rounded up
const MIN_FILL_GAP: f64 = 1e-10;

/// Finds the control volumes on the flow front: not yet full, with at least
/// one full neighbour
///
/// # Returns
/// The indices of the front CVs in node order, and a per-node flag vector
pub fn find_free_surface(fill: &[f64], cvs: &[ControlVolume]) -> (Vec<usize>, Vec<bool>) {
    let flags: Vec<bool> = cvs
        .par_iter()
        .map(|cv| fill[cv.node] < 1.0 && cv.neighbours.iter().any(|n| fill[*n] >= 1.0))
        .collect();
    let active = flags
        .iter()
        .enumerate()
        .filter_map(|(i, f)| f.then_some(i))
        .collect();
    (active, flags)
}

/// Net volumetric inflow rate of each active control volume, in the order of
/// `active`
pub fn volumetric_fluxes(
    active: &[usize],
    cvs: &[ControlVolume],
    v_elements: &[Vector3<f64>],
) -> Vec<f64> {
    active
        .par_iter()
        .map(|i| {
            let cv = &cvs[*i];
            cv.support_elements
                .iter()
                .zip(&cv.flux_terms)
                .map(|(e, f)| v_elements[*e].dot(f))
                .sum()
        })
        .collect()
}

/// Largest step that fills no active control volume beyond full
///
/// # Returns
/// `None` when no active control volume receives resin
pub fn time_step(fill: &[f64], active: &[usize], fluxes: &[f64], cvs: &[ControlVolume]) -> Option<f64> {
    active
        .iter()
        .zip(fluxes)
        .filter(|(_, q)| **q > 0.0)
        .map(|(i, q)| (1.0 - fill[*i]) * cvs[*i].volume / q)
        .fold(None, |min: Option<f64>, dt| match min {
            Some(m) if m <= dt => Some(m),
            _ => Some(dt),
        })
}

/// Advances the fill factor of the active control volumes by `dt`
///
/// Volumes with non-positive net inflow keep their fill. Fill factors within
/// `max(fill_tolerance, 1e-10)` of one are rounded up to full.
///
/// # Returns
/// The number of control volumes that became full
pub fn advance(
    fill: &mut [f64],
    active: &[usize],
    fluxes: &[f64],
    cvs: &[ControlVolume],
    dt: f64,
    fill_tolerance: f64,
) -> usize {
    let threshold = 1.0 - fill_tolerance.max(MIN_FILL_GAP);
    let mut newly_full = 0;
    for (i, q) in active.iter().zip(fluxes) {
        if *q <= 0.0 {
            continue;
        }
        let f = fill[*i] + q * dt / cvs[*i].volume;
        fill[*i] = if f >= threshold {
            newly_full += 1;
            1.0
        } else {
            f
        };
    }
    newly_full
}
