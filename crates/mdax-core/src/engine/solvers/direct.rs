use super::{LinearSolution, LinearSolveError, LinearSolveFailure, LinearSolver, PreparedSolver, SolveMode};
use crate::core::jacobian::operator::SystemOperator;
use crate::core::jacobian::sparse::CsrMatrix;
use crate::engine::distributed::collective::Collective;
use nalgebra::linalg::LU;
use nalgebra::{DVector, Dyn};
use std::sync::Arc;
use tracing::trace;

/// Dense LU factorisation of the whole (oriented) operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

struct PreparedDirect {
    lu: LU<f64, Dyn, Dyn>,
    matrix: CsrMatrix,
}

fn singular(residual_norm: f64) -> LinearSolveError {
    LinearSolveError {
        solver: "direct",
        reason: LinearSolveFailure::Singular,
        iterations: 0,
        residual_norm,
    }
}

impl LinearSolver for DirectSolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn prepare(
        &self,
        op: &SystemOperator,
        mode: SolveMode,
        _comm: &Arc<dyn Collective>,
    ) -> Result<Box<dyn PreparedSolver>, LinearSolveError> {
        let matrix = op.oriented(mode).clone();
        let lu = matrix.to_dense().lu();
        if !lu.is_invertible() {
            return Err(singular(f64::NAN));
        }
        trace!(dim = matrix.nrows(), nnz = matrix.nnz(), "Factorised operator");
        Ok(Box::new(PreparedDirect { lu, matrix }))
    }
}

impl PreparedSolver for PreparedDirect {
    fn solve(&self, rhs: &DVector<f64>) -> Result<LinearSolution, LinearSolveError> {
        let x = self.lu.solve(rhs).ok_or_else(|| singular(rhs.norm()))?;
        let residual_norm = super::residual_norm(&self.matrix, &x, rhs);
        if !x.iter().all(|v| v.is_finite()) {
            return Err(singular(residual_norm));
        }
        Ok(LinearSolution {
            x,
            iterations: 1,
            residual_norm,
        })
    }

    fn precondition(&self, r: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError> {
        self.solve(r).map(|s| s.x)
    }
}
