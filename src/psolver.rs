use std::str::FromStr;
use std::time::Instant;

use log::debug;
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{factorization::CscCholesky, CooMatrix, CscMatrix, CsrMatrix};
use serde::{Deserialize, Serialize};

use crate::{
    datatypes::SolverBcs,
    error::InfuseError,
    krylov::{
        argmin_cg, bicgstab, gmres, pcg, IdentityPreconditioner, Ilu0Preconditioner,
        JacobiPreconditioner, KrylovConfig, KrylovResult, KrylovStatus, Preconditioner,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverType {
    DirectDense,
    #[default]
    DirectSparse,
    Iterative,
}

impl FromStr for SolverType {
    type Err = InfuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct_dense" => Ok(SolverType::DirectDense),
            "direct_sparse" => Ok(SolverType::DirectSparse),
            "iterative" => Ok(SolverType::Iterative),
            other => Err(InfuseError::Config(format!(
                "unknown solver type '{other}', expected one of direct_dense, direct_sparse, iterative"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KrylovMethod {
    #[default]
    ConjugateGradient,
    Gmres,
    BiCgStab,
}

impl FromStr for KrylovMethod {
    type Err = InfuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cg" => Ok(KrylovMethod::ConjugateGradient),
            "gmres" => Ok(KrylovMethod::Gmres),
            "bicgstab" => Ok(KrylovMethod::BiCgStab),
            other => Err(InfuseError::Config(format!(
                "unknown iterative method '{other}', expected one of cg, gmres, bicgstab"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionerKind {
    None,
    #[default]
    Jacobi,
    Ilu0,
}

impl FromStr for PreconditionerKind {
    type Err = InfuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PreconditionerKind::None),
            "jacobi" => Ok(PreconditionerKind::Jacobi),
            "ilu0" | "ilu" => Ok(PreconditionerKind::Ilu0),
            other => Err(InfuseError::Config(format!(
                "unknown preconditioner '{other}', expected one of none, jacobi, ilu0"
            ))),
        }
    }
}

/// Pressure solver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub solver_type: SolverType,
    pub method: KrylovMethod,
    pub preconditioner: PreconditionerKind,
    /// Relative residual tolerance of iterative methods
    pub tol: f64,
    pub max_iter: usize,
    pub gmres_restart: usize,
    /// Solve only for the free nodes instead of eliminating the
    /// constrained rows of the full system
    pub masked: bool,
    /// Retries with a relaxed tolerance after non-convergence
    pub max_retries: usize,
    pub retry_relaxation: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            solver_type: SolverType::default(),
            method: KrylovMethod::default(),
            preconditioner: PreconditionerKind::default(),
            tol: 1e-8,
            max_iter: 1000,
            gmres_restart: 30,
            masked: true,
            max_retries: 2,
            retry_relaxation: 10.0,
        }
    }
}

fn parse_option<T: FromStr>(key: &str, value: &str) -> Result<T, InfuseError> {
    value.parse().map_err(|_| {
        InfuseError::Config(format!("invalid value '{value}' for solver option '{key}'"))
    })
}

impl SolverOptions {
    pub fn with_type(solver_type: SolverType) -> SolverOptions {
        SolverOptions {
            solver_type,
            ..Default::default()
        }
    }

    /// Sets a backend option from its textual form
    ///
    /// # Arguments
    /// * `key` - One of `type`, `method`, `preconditioner`, `restart`, `tol`,
    ///     `max_iter`, `masked`, `max_retries`
    /// * `value` - The option value
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), InfuseError> {
        let mut updated = self.clone();
        match key {
            "type" => updated.solver_type = value.parse()?,
            "method" => updated.method = value.parse()?,
            "preconditioner" => updated.preconditioner = value.parse()?,
            "restart" => updated.gmres_restart = parse_option(key, value)?,
            "tol" => updated.tol = parse_option(key, value)?,
            "max_iter" => updated.max_iter = parse_option(key, value)?,
            "masked" => updated.masked = parse_option(key, value)?,
            "max_retries" => updated.max_retries = parse_option(key, value)?,
            _ => {
                return Err(InfuseError::Config(format!(
                    "unknown solver option '{key}'"
                )))
            }
        }
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), InfuseError> {
        if !(self.tol > 0.0) {
            return Err(InfuseError::Config(format!(
                "solver tolerance must be positive, got {}",
                self.tol
            )));
        }
        if self.max_iter == 0 || self.gmres_restart == 0 {
            return Err(InfuseError::Config(
                "solver iteration limits must be positive".to_owned(),
            ));
        }
        if !(self.retry_relaxation >= 1.0) {
            return Err(InfuseError::Config(format!(
                "retry relaxation must be at least 1, got {}",
                self.retry_relaxation
            )));
        }
        Ok(())
    }

    /// Options for a retry after non-convergence
    pub fn relaxed(&self) -> SolverOptions {
        SolverOptions {
            tol: self.tol * self.retry_relaxation,
            max_iter: self.max_iter.saturating_mul(2),
            ..self.clone()
        }
    }

    fn krylov_config(&self) -> KrylovConfig {
        KrylovConfig {
            tol: self.tol,
            max_iter: self.max_iter,
            restart: self.gmres_restart,
        }
    }
}

/// Classified result of a pressure solve
#[derive(Debug, Clone)]
pub enum SolveOutcome {
    Converged {
        pressure: DVector<f64>,
        iterations: usize,
    },
    NotConverged {
        pressure: DVector<f64>,
        iterations: usize,
        residual: f64,
    },
    Failed {
        reason: String,
    },
}

impl SolveOutcome {
    fn map_pressure(self, f: impl FnOnce(DVector<f64>) -> DVector<f64>) -> SolveOutcome {
        match self {
            SolveOutcome::Converged {
                pressure,
                iterations,
            } => SolveOutcome::Converged {
                pressure: f(pressure),
                iterations,
            },
            SolveOutcome::NotConverged {
                pressure,
                iterations,
                residual,
            } => SolveOutcome::NotConverged {
                pressure: f(pressure),
                iterations,
                residual,
            },
            failed => failed,
        }
    }
}

/// Prescribed value per node, `None` for free nodes
fn prescribed_values(n: usize, idx: &[usize], vals: &[f64]) -> Vec<Option<f64>> {
    let mut prescribed = vec![None; n];
    for (i, v) in idx.iter().zip(vals) {
        prescribed[*i] = Some(*v);
    }
    prescribed
}

/// Applies Dirichlet conditions by symmetric elimination: the contribution
/// of each constrained column moves to the right hand side, its row and
/// column are zeroed and the diagonal is set to one.
///
/// # Arguments
/// * `k` - The unconstrained global matrix
/// * `f` - The unconstrained right hand side
/// * `idx` - Constrained node indices
/// * `vals` - Prescribed values, matching `idx`
pub fn apply_bcs_symmetric(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    idx: &[usize],
    vals: &[f64],
) -> (CsrMatrix<f64>, DVector<f64>) {
    let n = k.nrows();
    let prescribed = prescribed_values(n, idx, vals);
    let mut f_sol = f.clone();
    let mut coo = CooMatrix::new(n, n);

    for (i, row) in k.row_iter().enumerate() {
        if let Some(value) = prescribed[i] {
            coo.push(i, i, 1.0);
            f_sol[i] = value;
            continue;
        }
        for (j, v) in row.col_indices().iter().zip(row.values()) {
            match prescribed[*j] {
                Some(value) => f_sol[i] -= v * value,
                None => coo.push(i, *j, *v),
            }
        }
    }

    (CsrMatrix::from(&coo), f_sol)
}

/// Free-node block of a constrained system
pub struct ReducedSystem {
    pub k_ff: CsrMatrix<f64>,
    pub rhs: DVector<f64>,
    /// Global index of every reduced unknown
    pub free: Vec<usize>,
    /// Full-length vector holding the prescribed values
    pub x_d: DVector<f64>,
}

/// Extracts `K_ff` and `f_f - K_fd x_d`
pub fn reduce_to_free(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    idx: &[usize],
    vals: &[f64],
) -> ReducedSystem {
    let n = k.nrows();
    let prescribed = prescribed_values(n, idx, vals);

    let mut x_d = DVector::zeros(n);
    let mut local: Vec<Option<usize>> = vec![None; n];
    let mut free = Vec::with_capacity(n);
    for (i, p) in prescribed.iter().enumerate() {
        match p {
            Some(value) => x_d[i] = *value,
            None => {
                local[i] = Some(free.len());
                free.push(i);
            }
        }
    }

    let n_free = free.len();
    let mut coo = CooMatrix::new(n_free, n_free);
    let mut rhs = DVector::zeros(n_free);
    for (row_local, &i) in free.iter().enumerate() {
        let row = k.row(i);
        rhs[row_local] = f[i];
        for (j, v) in row.col_indices().iter().zip(row.values()) {
            match local[*j] {
                Some(col_local) => coo.push(row_local, col_local, *v),
                None => rhs[row_local] -= v * x_d[*j],
            }
        }
    }

    ReducedSystem {
        k_ff: CsrMatrix::from(&coo),
        rhs,
        free,
        x_d,
    }
}

fn non_finite(x: &DVector<f64>) -> bool {
    x.iter().any(|v| !v.is_finite())
}

fn solve_direct_dense(a: &CsrMatrix<f64>, b: &DVector<f64>) -> SolveOutcome {
    let dense = DMatrix::from(a);
    let x = match dense.clone().cholesky() {
        Some(chol) => Some(chol.solve(b)),
        None => dense.lu().solve(b),
    };
    match x {
        Some(x) if !non_finite(&x) => SolveOutcome::Converged {
            pressure: x,
            iterations: 0,
        },
        _ => SolveOutcome::Failed {
            reason: "dense factorisation failed: singular system".to_owned(),
        },
    }
}

fn solve_direct_sparse(a: &CsrMatrix<f64>, b: &DVector<f64>) -> SolveOutcome {
    let chol = match CscCholesky::factor(&CscMatrix::from(a)) {
        Ok(c) => c,
        Err(err) => {
            return SolveOutcome::Failed {
                reason: format!("sparse Cholesky factorisation failed: {err:?}"),
            }
        }
    };
    let rhs = DMatrix::from_column_slice(b.len(), 1, b.as_slice());
    let x = DVector::from_column_slice(chol.solve(&rhs).as_slice());
    if non_finite(&x) {
        return SolveOutcome::Failed {
            reason: "sparse Cholesky produced a non-finite solution".to_owned(),
        };
    }
    SolveOutcome::Converged {
        pressure: x,
        iterations: 0,
    }
}

fn build_preconditioner(
    kind: PreconditionerKind,
    a: &CsrMatrix<f64>,
) -> Result<Box<dyn Preconditioner>, String> {
    Ok(match kind {
        PreconditionerKind::None => Box::new(IdentityPreconditioner),
        PreconditionerKind::Jacobi => Box::new(JacobiPreconditioner::from_matrix(a)?),
        PreconditionerKind::Ilu0 => Box::new(Ilu0Preconditioner::from_matrix(a)?),
    })
}

fn solve_iterative(a: &CsrMatrix<f64>, b: &DVector<f64>, options: &SolverOptions) -> SolveOutcome {
    let config = options.krylov_config();

    let result: KrylovResult = match (options.method, options.preconditioner) {
        (KrylovMethod::ConjugateGradient, PreconditionerKind::None) => argmin_cg(a, b, &config),
        (method, kind) => {
            let precond = match build_preconditioner(kind, a) {
                Ok(p) => p,
                Err(reason) => {
                    return SolveOutcome::Failed {
                        reason: format!("preconditioner setup failed: {reason}"),
                    }
                }
            };
            match method {
                KrylovMethod::ConjugateGradient => pcg(a, b, precond.as_ref(), &config),
                KrylovMethod::Gmres => gmres(a, b, precond.as_ref(), &config),
                KrylovMethod::BiCgStab => bicgstab(a, b, precond.as_ref(), &config),
            }
        }
    };

    debug!(
        "{:?} finished after {} iterations, residual {:.3e}",
        options.method, result.iterations, result.residual
    );
    match result.status {
        KrylovStatus::Converged => SolveOutcome::Converged {
            pressure: result.x,
            iterations: result.iterations,
        },
        KrylovStatus::MaxIterationsReached => SolveOutcome::NotConverged {
            pressure: result.x,
            iterations: result.iterations,
            residual: result.residual,
        },
        KrylovStatus::Breakdown(reason) => SolveOutcome::Failed {
            reason: format!("{:?} breakdown: {reason}", options.method),
        },
    }
}

/// Solves `A x = b` with the configured backend
pub fn solve_linear_system(
    a: &CsrMatrix<f64>,
    b: &DVector<f64>,
    options: &SolverOptions,
) -> SolveOutcome {
    if b.is_empty() {
        return SolveOutcome::Converged {
            pressure: DVector::zeros(0),
            iterations: 0,
        };
    }
    match options.solver_type {
        SolverType::DirectDense => solve_direct_dense(a, b),
        SolverType::DirectSparse => solve_direct_sparse(a, b),
        SolverType::Iterative => solve_iterative(a, b, options),
    }
}

/// Solves the full system after symmetric elimination of every constraint
pub fn solve_full(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    bcs: &SolverBcs,
    options: &SolverOptions,
) -> SolveOutcome {
    let (idx, vals) = bcs.full();
    let (k_sol, f_sol) = apply_bcs_symmetric(k, f, &idx, &vals);
    solve_linear_system(&k_sol, &f_sol, options).map_pressure(|mut p| {
        // Constrained entries come out of the solve only up to round-off
        for (i, v) in idx.iter().zip(&vals) {
            p[*i] = *v;
        }
        p
    })
}

/// Solves for the free nodes only and scatters the result back
pub fn solve_masked(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    bcs: &SolverBcs,
    options: &SolverOptions,
) -> SolveOutcome {
    let (idx, vals) = bcs.full();
    let reduced = reduce_to_free(k, f, &idx, &vals);
    if reduced.free.is_empty() {
        return SolveOutcome::Converged {
            pressure: reduced.x_d,
            iterations: 0,
        };
    }

    let ReducedSystem {
        k_ff,
        rhs,
        free,
        x_d,
    } = reduced;
    solve_linear_system(&k_ff, &rhs, options).map_pressure(|x_f| {
        let mut p = x_d;
        for (local, global) in free.iter().enumerate() {
            p[*global] = x_f[local];
        }
        p
    })
}

/// Pressure solve with the configured reduction strategy
pub fn solve_pressure(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    bcs: &SolverBcs,
    options: &SolverOptions,
) -> SolveOutcome {
    let start = Instant::now();
    let outcome = if options.masked {
        solve_masked(k, f, bcs, options)
    } else {
        solve_full(k, f, bcs, options)
    };
    debug!(
        "pressure solve with {} constraints took {:.3} ms",
        bcs.len(),
        start.elapsed().as_secs_f64() * 1e3
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixcompare::assert_matrix_eq;

    /// Singular 1D Laplacian over `n` nodes, like an unconstrained
    /// conductivity matrix
    fn singular_chain(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n - 1 {
            coo.push(i, i, 1.0);
            coo.push(i + 1, i + 1, 1.0);
            coo.push(i, i + 1, -1.0);
            coo.push(i + 1, i, -1.0);
        }
        CsrMatrix::from(&coo)
    }

    fn chain_bcs(n: usize) -> SolverBcs {
        SolverBcs {
            dirichlet_idx: vec![0],
            dirichlet_vals: vec![10.0],
            p0_idx: vec![n - 1],
        }
    }

    fn pressure(outcome: SolveOutcome) -> DVector<f64> {
        match outcome {
            SolveOutcome::Converged { pressure, .. } => pressure,
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn linear_pressure_drop_along_a_chain() {
        let n = 11;
        let k = singular_chain(n);
        let f = DVector::zeros(n);
        let p = pressure(solve_pressure(&k, &f, &chain_bcs(n), &SolverOptions::default()));
        let expected = DVector::from_fn(n, |i, _| 10.0 * (1.0 - i as f64 / 10.0));
        assert_matrix_eq!(p, expected, comp = abs, tol = 1e-10);
    }

    #[test]
    fn masked_and_full_solves_agree_for_every_backend() {
        let n = 25;
        let k = singular_chain(n);
        let f = DVector::zeros(n);
        let bcs = SolverBcs {
            dirichlet_idx: vec![0, 1],
            dirichlet_vals: vec![5.0, 4.5],
            p0_idx: vec![18, 19, 20, 21, 22, 23, 24],
        };

        let mut options = vec![
            SolverOptions::with_type(SolverType::DirectDense),
            SolverOptions::with_type(SolverType::DirectSparse),
        ];
        for method in [
            KrylovMethod::ConjugateGradient,
            KrylovMethod::Gmres,
            KrylovMethod::BiCgStab,
        ] {
            for preconditioner in [
                PreconditionerKind::None,
                PreconditionerKind::Jacobi,
                PreconditionerKind::Ilu0,
            ] {
                options.push(SolverOptions {
                    solver_type: SolverType::Iterative,
                    method,
                    preconditioner,
                    tol: 1e-12,
                    ..Default::default()
                });
            }
        }

        let reference = pressure(solve_masked(&k, &f, &bcs, &options[0]));
        for opts in &options {
            let masked = pressure(solve_masked(&k, &f, &bcs, opts));
            let full = pressure(solve_full(&k, &f, &bcs, opts));
            assert_matrix_eq!(masked, reference, comp = abs, tol = 1e-8);
            assert_matrix_eq!(full, reference, comp = abs, tol = 1e-8);
        }
    }

    #[test]
    fn fully_constrained_system_skips_the_solve() {
        let n = 3;
        let k = singular_chain(n);
        let f = DVector::zeros(n);
        let bcs = SolverBcs {
            dirichlet_idx: vec![0],
            dirichlet_vals: vec![2.0],
            p0_idx: vec![1, 2],
        };
        match solve_masked(&k, &f, &bcs, &SolverOptions::default()) {
            SolveOutcome::Converged {
                pressure,
                iterations,
            } => {
                assert_eq!(iterations, 0);
                assert_eq!(pressure.as_slice(), &[2.0, 0.0, 0.0]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unconstrained_singular_system_fails() {
        let n = 4;
        let k = singular_chain(n);
        let f = DVector::zeros(n);
        let mut f_nonzero = f.clone();
        f_nonzero[0] = 1.0;
        let bcs = SolverBcs::default();
        assert!(matches!(
            solve_masked(&k, &f_nonzero, &bcs, &SolverOptions::default()),
            SolveOutcome::Failed { .. }
        ));
        assert!(matches!(
            solve_masked(
                &k,
                &f_nonzero,
                &bcs,
                &SolverOptions::with_type(SolverType::DirectDense)
            ),
            SolveOutcome::Failed { .. }
        ));
    }

    #[test]
    fn iteration_limit_is_not_a_failure() {
        let n = 60;
        let k = singular_chain(n);
        let f = DVector::zeros(n);
        let options = SolverOptions {
            solver_type: SolverType::Iterative,
            preconditioner: PreconditionerKind::Jacobi,
            tol: 1e-14,
            max_iter: 3,
            ..Default::default()
        };
        assert!(matches!(
            solve_masked(&k, &f, &chain_bcs(n), &options),
            SolveOutcome::NotConverged { iterations: 3, .. }
        ));
    }

    #[test]
    fn options_from_strings() {
        let mut options = SolverOptions::default();
        options.set_option("method", "gmres").unwrap();
        options.set_option("preconditioner", "ilu0").unwrap();
        options.set_option("restart", "12").unwrap();
        options.set_option("masked", "false").unwrap();
        assert_eq!(options.method, KrylovMethod::Gmres);
        assert_eq!(options.preconditioner, PreconditionerKind::Ilu0);
        assert_eq!(options.gmres_restart, 12);
        assert!(!options.masked);

        assert!(matches!(
            options.set_option("smoother", "gauss"),
            Err(InfuseError::Config(_))
        ));
        assert!(matches!(
            options.set_option("tol", "tight"),
            Err(InfuseError::Config(_))
        ));

        let relaxed = options.relaxed();
        assert_eq!(relaxed.tol, options.tol * 10.0);
        assert_eq!(relaxed.max_iter, options.max_iter * 2);
    }

    #[test]
    fn rejected_option_keeps_previous_value() {
        let mut options = SolverOptions::default();
        assert!(matches!(
            options.set_option("tol", "-1"),
            Err(InfuseError::Config(_))
        ));
        assert!(matches!(
            options.set_option("max_iter", "0"),
            Err(InfuseError::Config(_))
        ));
        assert_eq!(options, SolverOptions::default());
    }
}
