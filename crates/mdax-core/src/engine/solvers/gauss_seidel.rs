use super::{LinearSolution, LinearSolveError, LinearSolveFailure, LinearSolver, PreparedSolver, SolveMode};
use crate::core::jacobian::operator::SystemOperator;
use crate::core::jacobian::sparse::CsrMatrix;
use crate::engine::distributed::collective::Collective;
use nalgebra::DVector;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

/// Residual growth past this factor of the right-hand side counts as divergence.
const DIVERGENCE_FACTOR: f64 = 1e20;

/// Block Gauss-Seidel over the operator's diagonal blocks (one per top-level subsystem).
///
/// Each sweep solves the diagonal blocks in order, moving the coupling to already-updated
/// blocks to the right-hand side. Blocks are visited in reverse in adjoint mode.
#[derive(Debug)]
pub struct GaussSeidelSolver {
    tolerance: f64,
    max_iterations: usize,
    block_solver: Box<dyn LinearSolver>,
}

impl GaussSeidelSolver {
    pub fn new(tolerance: f64, max_iterations: usize, block_solver: Box<dyn LinearSolver>) -> Self {
        Self {
            tolerance,
            max_iterations,
            block_solver,
        }
    }
}

impl LinearSolver for GaussSeidelSolver {
    fn name(&self) -> &'static str {
        "gauss_seidel"
    }

    fn prepare(
        &self,
        op: &SystemOperator,
        mode: SolveMode,
        comm: &Arc<dyn Collective>,
    ) -> Result<Box<dyn PreparedSolver>, LinearSolveError> {
        let matrix = op.oriented(mode).clone();
        let order = op.block_order(mode);
        let mut blocks = Vec::with_capacity(order.len());
        for range in order {
            let indices: Vec<usize> = range.clone().collect();
            let diagonal = SystemOperator::new(matrix.submatrix(&indices), Vec::new());
            let solver = self
                .block_solver
                .prepare(&diagonal, SolveMode::Direct, comm)
                .map_err(|e| LinearSolveError {
                    solver: "gauss_seidel",
                    ..e
                })?;
            blocks.push((range, solver));
        }
        Ok(Box::new(PreparedGaussSeidel {
            matrix,
            blocks,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }))
    }
}

struct PreparedGaussSeidel {
    matrix: CsrMatrix,
    blocks: Vec<(Range<usize>, Box<dyn PreparedSolver>)>,
    tolerance: f64,
    max_iterations: usize,
}

impl PreparedGaussSeidel {
    fn sweep(&self, b: &DVector<f64>, x: &mut DVector<f64>) -> Result<(), LinearSolveError> {
        for (range, solver) in &self.blocks {
            let local = DVector::from_iterator(
                range.len(),
                range.clone().map(|row| {
                    let coupling: f64 = self
                        .matrix
                        .row(row)
                        .filter(|(col, _)| !range.contains(col))
                        .map(|(col, v)| v * x[col])
                        .sum();
                    b[row] - coupling
                }),
            );
            let solved = solver.precondition(&local).map_err(|e| LinearSolveError {
                solver: "gauss_seidel",
                ..e
            })?;
            x.rows_mut(range.start, range.len()).copy_from(&solved);
        }
        Ok(())
    }

    /// Runs sweeps until the residual drops below tolerance or the sweep budget is spent.
    fn iterate(&self, b: &DVector<f64>) -> Result<(DVector<f64>, usize, f64), LinearSolveError> {
        let mut x = DVector::zeros(b.len());
        let b_norm = b.norm();
        if b_norm < 1e-15 {
            return Ok((x, 0, 0.0));
        }
        let mut residual = b_norm;
        for iteration in 1..=self.max_iterations {
            self.sweep(b, &mut x)?;
            residual = super::residual_norm(&self.matrix, &x, b);
            trace!(iteration, residual, "Gauss-Seidel sweep");
            if !residual.is_finite() || residual > DIVERGENCE_FACTOR * b_norm {
                return Err(LinearSolveError {
                    solver: "gauss_seidel",
                    reason: LinearSolveFailure::NonConvergence,
                    iterations: iteration,
                    residual_norm: residual,
                });
            }
            if residual <= self.tolerance {
                return Ok((x, iteration, residual));
            }
        }
        Ok((x, self.max_iterations, residual))
    }
}

impl PreparedSolver for PreparedGaussSeidel {
    fn solve(&self, rhs: &DVector<f64>) -> Result<LinearSolution, LinearSolveError> {
        let (x, iterations, residual_norm) = self.iterate(rhs)?;
        if residual_norm > self.tolerance {
            return Err(LinearSolveError {
                solver: "gauss_seidel",
                reason: LinearSolveFailure::IterationLimit,
                iterations,
                residual_norm,
            });
        }
        Ok(LinearSolution {
            x,
            iterations,
            residual_norm,
        })
    }

    fn precondition(&self, r: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError> {
        self.iterate(r).map(|(x, _, _)| x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::solvers::tests::{coupled_operator, reference, serial};
    use crate::engine::solvers::DirectSolver;

    fn solver(max_iterations: usize) -> GaussSeidelSolver {
        GaussSeidelSolver::new(1e-12, max_iterations, Box::new(DirectSolver))
    }

    #[test]
    fn feed_forward_chain_converges_in_one_sweep_each_way() {
        // Lower-triangular blocks: one forward sweep is exact, and so is one reversed sweep
        // on the transpose.
        let m = CsrMatrix::from_triplets(
            3,
            3,
            vec![(0, 0, 1.0), (1, 0, -2.0), (1, 1, 1.0), (2, 1, -3.0), (2, 2, 1.0)],
        );
        let op = SystemOperator::new(m, vec![0..1, 1..2, 2..3]);

        let forward = solver(10)
            .prepare(&op, SolveMode::Direct, &serial())
            .unwrap()
            .solve(&DVector::from_vec(vec![1.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(forward.iterations, 1);
        assert_eq!(forward.x[2], 6.0);

        let adjoint = solver(10)
            .prepare(&op, SolveMode::Adjoint, &serial())
            .unwrap()
            .solve(&DVector::from_vec(vec![0.0, 0.0, 1.0]))
            .unwrap();
        assert_eq!(adjoint.iterations, 1);
        assert_eq!(adjoint.x[0], 6.0);
    }

    #[test]
    fn coupled_blocks_need_several_sweeps() {
        let op = coupled_operator();
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let sol = solver(100)
            .prepare(&op, SolveMode::Direct, &serial())
            .unwrap()
            .solve(&b)
            .unwrap();
        assert!(sol.iterations > 1);
        assert!((&sol.x - reference(&op, SolveMode::Direct, &b)).norm() < 1e-10);
    }

    #[test]
    fn exhausted_sweeps_report_iteration_limit() {
        let op = coupled_operator();
        let err = solver(1)
            .prepare(&op, SolveMode::Direct, &serial())
            .unwrap()
            .solve(&DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap_err();
        assert_eq!(err.reason, LinearSolveFailure::IterationLimit);
        assert_eq!(err.solver, "gauss_seidel");
    }

    #[test]
    fn singular_diagonal_block_is_reported_at_preparation() {
        let m = CsrMatrix::from_triplets(2, 2, vec![(0, 0, 1.0), (1, 0, 1.0)]);
        let op = SystemOperator::new(m, vec![0..1, 1..2]);
        let err = solver(5)
            .prepare(&op, SolveMode::Direct, &serial())
            .err()
            .unwrap();
        assert_eq!(err.reason, LinearSolveFailure::Singular);
        assert_eq!(err.solver, "gauss_seidel");
    }
}
