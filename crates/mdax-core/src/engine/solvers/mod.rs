//! Linear solvers for the derivative systems `J x = b` (direct mode) and `J^T x = b` (adjoint).
//!
//! Solvers are built from a [`LinearSolverConfig`] and are composable: a Krylov solver may use
//! any other solver as its right preconditioner, and block Gauss-Seidel solves its diagonal
//! blocks with any other solver. A solver is first *prepared* against an operator (factorise
//! once, set up sub-solvers), then the prepared form solves any number of right-hand sides.

mod direct;
mod gauss_seidel;
mod krylov;

pub use direct::DirectSolver;
pub use gauss_seidel::GaussSeidelSolver;
pub use krylov::KrylovSolver;

pub use crate::core::jacobian::operator::SolveMode;
use super::config::{LinearSolverConfig, LinearSolverKind};
use super::distributed::collective::Collective;
use crate::core::jacobian::operator::SystemOperator;
use crate::core::jacobian::sparse::CsrMatrix;
use nalgebra::DVector;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolveFailure {
    NonConvergence,
    Singular,
    IterationLimit,
}

impl fmt::Display for LinearSolveFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LinearSolveFailure::NonConvergence => "non-convergence",
            LinearSolveFailure::Singular => "singular matrix",
            LinearSolveFailure::IterationLimit => "iteration limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{solver} linear solve failed ({reason}) after {iterations} iterations, residual norm {residual_norm:e}")]
pub struct LinearSolveError {
    pub solver: &'static str,
    pub reason: LinearSolveFailure,
    pub iterations: usize,
    pub residual_norm: f64,
}

#[derive(Debug, Clone)]
pub struct LinearSolution {
    pub x: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
}

/// A solver bound to one operator and orientation.
pub trait PreparedSolver: Send + Sync {
    fn solve(&self, rhs: &DVector<f64>) -> Result<LinearSolution, LinearSolveError>;

    /// Approximate inverse application for use as a preconditioner. Running out of iterations
    /// is not an error here; only a singular system is.
    fn precondition(&self, r: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError>;
}

pub trait LinearSolver: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn prepare(
        &self,
        op: &SystemOperator,
        mode: SolveMode,
        comm: &Arc<dyn Collective>,
    ) -> Result<Box<dyn PreparedSolver>, LinearSolveError>;

    /// Solves several right-hand sides against one preparation.
    ///
    /// With the `parallel` feature and a single-process collective the right-hand sides are
    /// solved concurrently; with several processes they run in order, since each solve may
    /// itself take part in collective operations.
    fn solve_many(
        &self,
        op: &SystemOperator,
        rhs: &[DVector<f64>],
        mode: SolveMode,
        comm: &Arc<dyn Collective>,
    ) -> Result<Vec<LinearSolution>, LinearSolveError> {
        let prepared = self.prepare(op, mode, comm)?;

        #[cfg(feature = "parallel")]
        if comm.size() == 1 {
            return rhs.par_iter().map(|b| prepared.solve(b)).collect();
        }

        rhs.iter().map(|b| prepared.solve(b)).collect()
    }
}

pub fn build_solver(config: &LinearSolverConfig) -> Box<dyn LinearSolver> {
    let inner = config.preconditioner.as_deref().map(build_solver);
    match config.kind {
        LinearSolverKind::Direct => Box::new(DirectSolver),
        LinearSolverKind::Krylov => Box::new(KrylovSolver::new(
            config.tolerance,
            config.max_iterations,
            config.restart,
            inner,
        )),
        LinearSolverKind::GaussSeidel => Box::new(GaussSeidelSolver::new(
            config.tolerance,
            config.max_iterations,
            inner.unwrap_or_else(|| Box::new(DirectSolver)),
        )),
    }
}

/// `||b - A x||_2`.
pub(crate) fn residual_norm(matrix: &CsrMatrix, x: &DVector<f64>, b: &DVector<f64>) -> f64 {
    (b - matrix.matvec(x)).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::distributed::collective::SerialComm;

    pub(super) fn serial() -> Arc<dyn Collective> {
        Arc::new(SerialComm)
    }

    /// Diagonally dominant 4x4 system split into two 2x2 blocks with coupling between them.
    pub(super) fn coupled_operator() -> SystemOperator {
        let m = CsrMatrix::from_triplets(
            4,
            4,
            vec![
                (0, 0, 4.0),
                (0, 1, 1.0),
                (1, 0, 1.0),
                (1, 1, 3.0),
                (1, 2, -0.5),
                (2, 1, 0.3),
                (2, 2, 5.0),
                (2, 3, 1.0),
                (3, 0, -0.2),
                (3, 2, 1.0),
                (3, 3, 2.0),
            ],
        );
        SystemOperator::new(m, vec![0..2, 2..4])
    }

    pub(super) fn reference(op: &SystemOperator, mode: SolveMode, b: &DVector<f64>) -> DVector<f64> {
        let dense = op.oriented(mode).to_dense();
        dense.lu().solve(b).unwrap()
    }

    fn configs() -> Vec<LinearSolverConfig> {
        vec![
            LinearSolverConfig::direct(),
            LinearSolverConfig::krylov().with_tolerance(1e-12),
            LinearSolverConfig::krylov()
                .with_tolerance(1e-12)
                .with_preconditioner(LinearSolverConfig::gauss_seidel().with_max_iterations(2)),
            LinearSolverConfig::gauss_seidel().with_tolerance(1e-12),
        ]
    }

    #[test]
    fn every_configuration_agrees_with_dense_lu_in_both_modes() {
        let op = coupled_operator();
        let rhs = vec![
            DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]),
            DVector::from_vec(vec![0.5, -1.0, 2.0, 3.0]),
        ];
        for config in configs() {
            let solver = build_solver(&config);
            for mode in [SolveMode::Direct, SolveMode::Adjoint] {
                let solutions = solver.solve_many(&op, &rhs, mode, &serial()).unwrap();
                for (b, sol) in rhs.iter().zip(&solutions) {
                    let expected = reference(&op, mode, b);
                    assert!(
                        (&sol.x - &expected).norm() < 1e-9,
                        "{} in {mode} mode: {} vs {}",
                        solver.name(),
                        sol.x,
                        expected
                    );
                }
            }
        }
    }

    #[test]
    fn error_message_names_solver_and_reason() {
        let err = LinearSolveError {
            solver: "krylov",
            reason: LinearSolveFailure::IterationLimit,
            iterations: 5,
            residual_norm: 0.5,
        };
        assert_eq!(
            err.to_string(),
            "krylov linear solve failed (iteration limit reached) after 5 iterations, residual norm 5e-1"
        );
    }
}
