use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum InfuseError {
    MeshNotFound(String),
    MeshFormat(String),
    Config(String),
    Lookup(String),
    NotConverged { iterations: usize, residual: f64 },
    SolverBreakdown(String),
    Stalled { time: f64, empty_cvs: usize },
    Output(String),
    State(String),
}

impl InfuseError {
    /// Whether the caller may retry the failed operation with different solver
    /// settings. Only iterative non-convergence qualifies.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, InfuseError::NotConverged { .. })
    }
}

impl Display for InfuseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (err_name, value) = match self {
            InfuseError::MeshNotFound(v) => ("Mesh not found", v.clone()),
            InfuseError::MeshFormat(v) => ("Mesh format", v.clone()),
            InfuseError::Config(v) => ("Configuration", v.clone()),
            InfuseError::Lookup(v) => ("Lookup", v.clone()),
            InfuseError::NotConverged {
                iterations,
                residual,
            } => (
                "Convergence",
                format!(
                    "iterative solver did not converge after {iterations} iterations \
                     (residual {residual:.3e})"
                ),
            ),
            InfuseError::SolverBreakdown(v) => ("Solver", v.clone()),
            InfuseError::Stalled { time, empty_cvs } => (
                "Stall",
                format!(
                    "no flow front control volume receives resin at t = {time:.5} s \
                     ({empty_cvs} control volumes still empty)"
                ),
            ),
            InfuseError::Output(v) => ("Post Processor", v.clone()),
            InfuseError::State(v) => ("State", v.clone()),
        };

        write!(f, "{} error: {}", err_name, value)
    }
}

impl std::error::Error for InfuseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_error_kind() {
        let err = InfuseError::Config("unknown pressure mode 'add'".to_owned());
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown pressure mode 'add'"
        );
    }

    #[test]
    fn only_non_convergence_is_recoverable() {
        assert!(InfuseError::NotConverged {
            iterations: 10,
            residual: 1e-3
        }
        .is_recoverable());
        assert!(!InfuseError::SolverBreakdown("breakdown".to_owned()).is_recoverable());
        assert!(!InfuseError::Stalled {
            time: 1.0,
            empty_cvs: 3
        }
        .is_recoverable());
    }
}
