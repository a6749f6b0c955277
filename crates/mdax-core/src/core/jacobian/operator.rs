use super::sparse::CsrMatrix;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Direction of a linear solve: `J x = b` for direct (forward) mode, `J^T x = b` for adjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveMode {
    Direct,
    Adjoint,
}

impl fmt::Display for SolveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveMode::Direct => write!(f, "direct"),
            SolveMode::Adjoint => write!(f, "adjoint"),
        }
    }
}

/// The assembled linear system `J` over the unknowns vector, together with its transpose and
/// the diagonal block structure (one block per top-level subsystem) used by block solvers.
#[derive(Debug, Clone)]
pub struct SystemOperator {
    matrix: CsrMatrix,
    transpose: CsrMatrix,
    blocks: Vec<Range<usize>>,
}

impl SystemOperator {
    /// Builds an operator. An empty block list means a single block covering everything.
    pub fn new(matrix: CsrMatrix, blocks: Vec<Range<usize>>) -> Self {
        let n = matrix.nrows();
        let blocks = if blocks.is_empty() && n > 0 {
            vec![0..n]
        } else {
            blocks
        };
        let transpose = matrix.transpose();
        Self {
            matrix,
            transpose,
            blocks,
        }
    }

    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    /// The matrix to solve with in the given mode.
    pub fn oriented(&self, mode: SolveMode) -> &CsrMatrix {
        match mode {
            SolveMode::Direct => &self.matrix,
            SolveMode::Adjoint => &self.transpose,
        }
    }

    pub fn blocks(&self) -> &[Range<usize>] {
        &self.blocks
    }

    /// Block visiting order for Gauss-Seidel sweeps: reversed in adjoint mode, so information
    /// flows against the data dependencies.
    pub fn block_order(&self, mode: SolveMode) -> Vec<Range<usize>> {
        let mut order = self.blocks.clone();
        if mode == SolveMode::Adjoint {
            order.reverse();
        }
        order
    }

    /// The operator restricted to a sorted subset of unknowns.
    pub fn restrict(&self, indices: &[usize]) -> SystemOperator {
        let matrix = self.matrix.submatrix(indices);
        let mut blocks: Vec<Range<usize>> = Vec::new();
        let mut current: Option<usize> = None;
        for (local, &global) in indices.iter().enumerate() {
            let owner = self.blocks.iter().position(|b| b.contains(&global));
            match blocks.last_mut() {
                Some(last) if owner == current => last.end = local + 1,
                _ => blocks.push(local..local + 1),
            }
            current = owner;
        }
        SystemOperator::new(matrix, blocks)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        self.matrix.to_dense()
    }
}
