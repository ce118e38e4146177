//! Iterative solvers for the reduced pressure system.
//!
//! Plain conjugate gradient runs through `argmin`. The preconditioned
//! methods (PCG, BiCGSTAB, restarted GMRES) are implemented here on top of
//! `nalgebra-sparse` CSR matrices. Every method reports whether it converged,
//! ran out of iterations or broke down, and never returns a silent wrong
//! answer.

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, TerminationReason, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};
use log::trace;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;

#[derive(Debug, Clone, PartialEq)]
pub enum KrylovStatus {
    Converged,
    MaxIterationsReached,
    Breakdown(String),
}

#[derive(Debug, Clone)]
pub struct KrylovResult {
    pub x: DVector<f64>,
    pub status: KrylovStatus,
    pub iterations: usize,
    /// Final residual norm relative to the right hand side
    pub residual: f64,
}

impl KrylovResult {
    fn new(x: DVector<f64>, status: KrylovStatus, iterations: usize, residual: f64) -> Self {
        KrylovResult {
            x,
            status,
            iterations,
            residual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrylovConfig {
    /// Relative residual tolerance
    pub tol: f64,
    pub max_iter: usize,
    /// Krylov subspace size between GMRES restarts
    pub restart: usize,
}

impl Default for KrylovConfig {
    fn default() -> Self {
        KrylovConfig {
            tol: 1e-8,
            max_iter: 1000,
            restart: 30,
        }
    }
}

/// Sparse matrix-vector product `A x`
pub fn spmv(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        a.nrows(),
        a.row_iter().map(|row| {
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(|(j, v)| v * x[*j])
                .sum::<f64>()
        }),
    )
}

pub trait Preconditioner {
    /// Applies the approximate inverse `M^-1 r`
    fn apply(&self, r: &DVector<f64>) -> DVector<f64>;

    fn name(&self) -> &'static str;
}

pub struct IdentityPreconditioner;

impl Preconditioner for IdentityPreconditioner {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        r.clone()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

pub struct JacobiPreconditioner {
    inv_diag: DVector<f64>,
}

impl JacobiPreconditioner {
    pub fn from_matrix(a: &CsrMatrix<f64>) -> Result<Self, String> {
        let mut inv_diag = DVector::zeros(a.nrows());
        for (i, row) in a.row_iter().enumerate() {
            let d = row
                .col_indices()
                .iter()
                .zip(row.values())
                .find(|(j, _)| **j == i)
                .map(|(_, v)| *v)
                .unwrap_or(0.0);
            if d == 0.0 {
                return Err(format!("zero diagonal in row {i}"));
            }
            inv_diag[i] = 1.0 / d;
        }
        Ok(JacobiPreconditioner { inv_diag })
    }
}

impl Preconditioner for JacobiPreconditioner {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        r.component_mul(&self.inv_diag)
    }

    fn name(&self) -> &'static str {
        "jacobi"
    }
}

/// Incomplete LU factorisation with the sparsity pattern of the matrix.
/// `L` (unit diagonal) and `U` share one value array.
pub struct Ilu0Preconditioner {
    offsets: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    diag: Vec<usize>,
}

impl Ilu0Preconditioner {
    pub fn from_matrix(a: &CsrMatrix<f64>) -> Result<Self, String> {
        let n = a.nrows();
        let offsets = a.row_offsets().to_vec();
        let cols = a.col_indices().to_vec();
        let mut vals = a.values().to_vec();

        let mut diag = Vec::with_capacity(n);
        for i in 0..n {
            let row = &cols[offsets[i]..offsets[i + 1]];
            match row.binary_search(&i) {
                Ok(pos) => diag.push(offsets[i] + pos),
                Err(_) => return Err(format!("missing diagonal in row {i}")),
            }
        }

        for i in 0..n {
            for kk in offsets[i]..diag[i] {
                let k = cols[kk];
                let pivot = vals[diag[k]];
                if pivot == 0.0 {
                    return Err(format!("zero pivot in row {k}"));
                }
                vals[kk] /= pivot;
                let l_ik = vals[kk];

                let row_k = &cols[offsets[k]..offsets[k + 1]];
                for jj in (kk + 1)..offsets[i + 1] {
                    if let Ok(pos) = row_k.binary_search(&cols[jj]) {
                        let u_kj = vals[offsets[k] + pos];
                        vals[jj] -= l_ik * u_kj;
                    }
                }
            }
            if vals[diag[i]] == 0.0 {
                return Err(format!("zero pivot in row {i}"));
            }
        }

        Ok(Ilu0Preconditioner {
            offsets,
            cols,
            vals,
            diag,
        })
    }
}

impl Preconditioner for Ilu0Preconditioner {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        let n = r.len();
        let mut y = r.clone();

        for i in 0..n {
            for kk in self.offsets[i]..self.diag[i] {
                y[i] -= self.vals[kk] * y[self.cols[kk]];
            }
        }
        for i in (0..n).rev() {
            for kk in (self.diag[i] + 1)..self.offsets[i + 1] {
                y[i] -= self.vals[kk] * y[self.cols[kk]];
            }
            y[i] /= self.vals[self.diag[i]];
        }
        y
    }

    fn name(&self) -> &'static str {
        "ilu0"
    }
}

/// Preconditioned conjugate gradient for symmetric positive definite systems
pub fn pcg(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    precond: &dyn Preconditioner,
    config: &KrylovConfig,
) -> KrylovResult {
    let n = b.len();
    let b_norm = b.norm();
    let mut x = DVector::zeros(n);
    if b_norm == 0.0 {
        return KrylovResult::new(x, KrylovStatus::Converged, 0, 0.0);
    }

    let mut r = b.clone();
    let mut z = precond.apply(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    for iter in 0..config.max_iter {
        let ap = spmv(a, &p);
        let pap = p.dot(&ap);
        if !(pap > 0.0) {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("matrix is not positive definite".to_owned()),
                iter,
                r.norm() / b_norm,
            );
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, 1.0);
        r.axpy(-alpha, &ap, 1.0);

        let rel_res = r.norm() / b_norm;
        trace!("pcg iteration {}: residual {:.3e}", iter + 1, rel_res);
        if rel_res <= config.tol {
            return KrylovResult::new(x, KrylovStatus::Converged, iter + 1, rel_res);
        }

        z = precond.apply(&r);
        let rz_new = r.dot(&z);
        let beta = rz_new / rz;
        rz = rz_new;
        p = &z + &p * beta;
    }

    let rel_res = r.norm() / b_norm;
    KrylovResult::new(
        x,
        KrylovStatus::MaxIterationsReached,
        config.max_iter,
        rel_res,
    )
}

/// Right preconditioned BiCGSTAB
pub fn bicgstab(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    precond: &dyn Preconditioner,
    config: &KrylovConfig,
) -> KrylovResult {
    const BREAKDOWN_TOL: f64 = 1e-300;

    let n = b.len();
    let b_norm = b.norm();
    let mut x = DVector::zeros(n);
    if b_norm == 0.0 {
        return KrylovResult::new(x, KrylovStatus::Converged, 0, 0.0);
    }

    let mut r = b.clone();
    let r0 = r.clone();
    let mut p = DVector::zeros(n);
    let mut v = DVector::zeros(n);
    let mut rho_old = 1.0;
    let mut alpha = 1.0;
    let mut omega = 1.0;

    for iter in 0..config.max_iter {
        let rho = r0.dot(&r);
        if rho.abs() < BREAKDOWN_TOL {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("rho vanished".to_owned()),
                iter,
                r.norm() / b_norm,
            );
        }

        let beta = if iter == 0 {
            0.0
        } else {
            (rho / rho_old) * (alpha / omega)
        };
        rho_old = rho;

        // p = r + beta * (p - omega * v)
        p.axpy(-omega, &v, 1.0);
        p = &r + &p * beta;

        let p_hat = precond.apply(&p);
        v = spmv(a, &p_hat);

        let r0v = r0.dot(&v);
        if r0v.abs() < BREAKDOWN_TOL {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("(r0, v) vanished".to_owned()),
                iter,
                r.norm() / b_norm,
            );
        }
        alpha = rho / r0v;

        let s = &r - &v * alpha;
        let s_norm = s.norm();
        if s_norm / b_norm <= config.tol {
            x.axpy(alpha, &p_hat, 1.0);
            return KrylovResult::new(x, KrylovStatus::Converged, iter + 1, s_norm / b_norm);
        }

        let s_hat = precond.apply(&s);
        let t = spmv(a, &s_hat);
        let tt = t.dot(&t);
        omega = if tt > 0.0 { t.dot(&s) / tt } else { 0.0 };

        x.axpy(alpha, &p_hat, 1.0);
        x.axpy(omega, &s_hat, 1.0);
        r = &s - &t * omega;

        let rel_res = r.norm() / b_norm;
        trace!("bicgstab iteration {}: residual {:.3e}", iter + 1, rel_res);
        if rel_res <= config.tol {
            return KrylovResult::new(x, KrylovStatus::Converged, iter + 1, rel_res);
        }
        if !rel_res.is_finite() {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("residual is not finite".to_owned()),
                iter + 1,
                rel_res,
            );
        }
        if omega.abs() < BREAKDOWN_TOL {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("omega vanished".to_owned()),
                iter + 1,
                rel_res,
            );
        }
    }

    let rel_res = r.norm() / b_norm;
    KrylovResult::new(
        x,
        KrylovStatus::MaxIterationsReached,
        config.max_iter,
        rel_res,
    )
}

/// Right preconditioned restarted GMRES(m) with Givens rotations
pub fn gmres(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    precond: &dyn Preconditioner,
    config: &KrylovConfig,
) -> KrylovResult {
    let n = b.len();
    let m = config.restart.max(1);
    let b_norm = b.norm();
    let mut x = DVector::zeros(n);
    if b_norm == 0.0 {
        return KrylovResult::new(x, KrylovStatus::Converged, 0, 0.0);
    }

    let mut total_iters = 0;
    loop {
        let r = b - spmv(a, &x);
        let beta = r.norm();
        let rel_res = beta / b_norm;
        if rel_res <= config.tol {
            return KrylovResult::new(x, KrylovStatus::Converged, total_iters, rel_res);
        }
        if total_iters >= config.max_iter {
            return KrylovResult::new(
                x,
                KrylovStatus::MaxIterationsReached,
                total_iters,
                rel_res,
            );
        }

        let mut basis: Vec<DVector<f64>> = vec![r / beta];
        let mut preconditioned: Vec<DVector<f64>> = Vec::with_capacity(m);
        let mut h: DMatrix<f64> = DMatrix::zeros(m + 1, m);
        let mut cs = vec![0.0; m];
        let mut sn = vec![0.0; m];
        let mut g = DVector::zeros(m + 1);
        g[0] = beta;

        let mut used = 0;
        for j in 0..m {
            let z = precond.apply(&basis[j]);
            let mut w = spmv(a, &z);
            preconditioned.push(z);

            for (i, v_i) in basis.iter().enumerate() {
                h[(i, j)] = w.dot(v_i);
                w.axpy(-h[(i, j)], v_i, 1.0);
            }
            let h_sub = w.norm();
            h[(j + 1, j)] = h_sub;

            for i in 0..j {
                let temp = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                h[(i + 1, j)] = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                h[(i, j)] = temp;
            }
            let denom = h[(j, j)].hypot(h[(j + 1, j)]);
            if !(denom > 0.0) {
                return KrylovResult::new(
                    x,
                    KrylovStatus::Breakdown("singular Hessenberg matrix".to_owned()),
                    total_iters,
                    rel_res,
                );
            }
            cs[j] = h[(j, j)] / denom;
            sn[j] = h[(j + 1, j)] / denom;
            h[(j, j)] = denom;
            h[(j + 1, j)] = 0.0;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];

            total_iters += 1;
            used = j + 1;
            let inner_res = g[j + 1].abs() / b_norm;
            trace!("gmres iteration {total_iters}: residual {inner_res:.3e}");

            if inner_res <= config.tol || total_iters >= config.max_iter || h_sub == 0.0 {
                break;
            }
            basis.push(w / h_sub);
        }

        // Back substitution on the triangularised Hessenberg matrix
        let mut y = DVector::zeros(used);
        for i in (0..used).rev() {
            let mut acc = g[i];
            for k in (i + 1)..used {
                acc -= h[(i, k)] * y[k];
            }
            y[i] = acc / h[(i, i)];
        }
        for (i, z) in preconditioned.iter().take(used).enumerate() {
            x.axpy(y[i], z, 1.0);
        }

        if !x.iter().all(|v| v.is_finite()) {
            return KrylovResult::new(
                x,
                KrylovStatus::Breakdown("solution is not finite".to_owned()),
                total_iters,
                f64::NAN,
            );
        }
    }
}

/// Runs multiplication for the argmin conjugate gradient solver
struct ConjugateGradientOperator<'a> {
    a: &'a CsrMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        let x = DVector::from_column_slice(x);
        Ok(spmv(self.a, &x).iter().copied().collect())
    }
}

/// Logs the residual of every argmin iteration
struct ConjugateGradientTrace;

impl<I> Observe<I> for ConjugateGradientTrace
where
    I: State<Float = f64>,
{
    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
        trace!(
            "cg iteration {}: residual {:.3e}",
            state.get_iter(),
            state.get_cost()
        );
        Ok(())
    }
}

/// Solves a symmetric positive definite system with argmin's conjugate
/// gradient method
///
/// # Arguments
/// * `a` - A square positive definite matrix
/// * `b` - The right hand side
/// * `config` - Tolerance and iteration limit
pub fn argmin_cg(a: &CsrMatrix<f64>, b: &DVector<f64>, config: &KrylovConfig) -> KrylovResult {
    let b_norm = b.norm();
    if b_norm == 0.0 {
        return KrylovResult::new(DVector::zeros(b.len()), KrylovStatus::Converged, 0, 0.0);
    }

    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];
    let operator = ConjugateGradientOperator { a };

    let res = match Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(config.max_iter as u64)
                .target_cost(config.tol * b_norm)
        })
        .add_observer(ConjugateGradientTrace, ObserverMode::Always)
        .run()
    {
        Ok(r) => r,
        Err(err) => {
            return KrylovResult::new(
                DVector::zeros(b.len()),
                KrylovStatus::Breakdown(format!("conjugate gradient error: {err}")),
                0,
                f64::NAN,
            )
        }
    };

    let state = res.state();
    let iterations = state.get_iter() as usize;
    let residual = state.get_best_cost() / b_norm;

    let x = match &state.best_param {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return KrylovResult::new(
                DVector::zeros(b.len()),
                KrylovStatus::Breakdown(
                    "conjugate gradient could not produce best parameter".to_owned(),
                ),
                iterations,
                f64::NAN,
            )
        }
    };

    let status = if !residual.is_finite() {
        KrylovStatus::Breakdown("residual is not finite".to_owned())
    } else if residual <= config.tol {
        KrylovStatus::Converged
    } else if matches!(
        state.get_termination_reason(),
        Some(TerminationReason::MaxItersReached)
    ) {
        KrylovStatus::MaxIterationsReached
    } else {
        KrylovStatus::Breakdown("conjugate gradient stopped early".to_owned())
    };

    KrylovResult::new(x, status, iterations, residual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixcompare::assert_matrix_eq;
    use nalgebra_sparse::CooMatrix;

    /// Shifted 1D Laplacian, symmetric positive definite
    fn laplacian(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.5);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    fn rhs(n: usize) -> DVector<f64> {
        DVector::from_fn(n, |i, _| (i as f64 + 1.0).sin())
    }

    fn check_solution(a: &CsrMatrix<f64>, b: &DVector<f64>, result: &KrylovResult) {
        assert_eq!(result.status, KrylovStatus::Converged);
        let r = b - spmv(a, &result.x);
        assert!(r.norm() / b.norm() < 1e-8);
    }

    #[test]
    fn spmv_matches_dense_product() {
        let a = laplacian(5);
        let x = rhs(5);
        let dense = DMatrix::from(&a);
        assert_matrix_eq!(spmv(&a, &x), &dense * &x, comp = abs, tol = 1e-14);
    }

    #[test]
    fn all_methods_converge() {
        let a = laplacian(40);
        let b = rhs(40);
        let config = KrylovConfig::default();
        let jacobi = JacobiPreconditioner::from_matrix(&a).unwrap();

        check_solution(&a, &b, &pcg(&a, &b, &IdentityPreconditioner, &config));
        check_solution(&a, &b, &pcg(&a, &b, &jacobi, &config));
        check_solution(&a, &b, &bicgstab(&a, &b, &jacobi, &config));
        check_solution(&a, &b, &gmres(&a, &b, &jacobi, &config));
        check_solution(&a, &b, &argmin_cg(&a, &b, &config));
    }

    #[test]
    fn gmres_restarts() {
        let a = laplacian(60);
        let b = rhs(60);
        let config = KrylovConfig {
            restart: 5,
            ..Default::default()
        };
        let result = gmres(&a, &b, &IdentityPreconditioner, &config);
        check_solution(&a, &b, &result);
        assert!(result.iterations > 5);
    }

    #[test]
    fn ilu0_is_exact_for_tridiagonal_matrices() {
        let a = laplacian(30);
        let b = rhs(30);
        let ilu = Ilu0Preconditioner::from_matrix(&a).unwrap();
        let x = ilu.apply(&b);
        assert!((b.clone() - spmv(&a, &x)).norm() < 1e-12);

        let result = gmres(&a, &b, &ilu, &KrylovConfig::default());
        check_solution(&a, &b, &result);
        assert!(result.iterations <= 2);
    }

    #[test]
    fn iteration_limit_is_reported() {
        let a = laplacian(50);
        let b = rhs(50);
        let config = KrylovConfig {
            tol: 1e-14,
            max_iter: 2,
            restart: 30,
        };
        for result in [
            pcg(&a, &b, &IdentityPreconditioner, &config),
            bicgstab(&a, &b, &IdentityPreconditioner, &config),
            gmres(&a, &b, &IdentityPreconditioner, &config),
        ] {
            assert_eq!(result.status, KrylovStatus::MaxIterationsReached);
            assert!(result.residual > config.tol);
        }
    }

    #[test]
    fn indefinite_matrix_breaks_down_cg() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 0, 1.0);
        coo.push(1, 1, -1.0);
        let a = CsrMatrix::from(&coo);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let result = pcg(&a, &b, &IdentityPreconditioner, &KrylovConfig::default());
        assert!(matches!(result.status, KrylovStatus::Breakdown(_)));
    }

    #[test]
    fn zero_diagonal_is_rejected_by_preconditioners() {
        let mut coo = CooMatrix::new(2, 2);
        coo.push(0, 1, 1.0);
        coo.push(1, 0, 1.0);
        let a = CsrMatrix::from(&coo);
        assert!(JacobiPreconditioner::from_matrix(&a).is_err());
        assert!(Ilu0Preconditioner::from_matrix(&a).is_err());
    }
}
