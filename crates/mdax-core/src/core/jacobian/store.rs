use super::block::{JacobianBlock, PartialPattern};
use super::operator::SystemOperator;
use super::sparse::CsrMatrix;
use crate::core::models::ids::{SystemId, VarId};
use crate::core::models::variable::VarKind;
use crate::core::registry::VariableRegistry;
use std::collections::HashMap;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum JacobianError {
    #[error("Block d{row}/d{col} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        row: String,
        col: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Block d{row}/d{col} was not declared and is a structural zero")]
    StructuralZero { row: String, col: String },

    #[error("Block d{row}/d{col} has a nonzero at {entry:?} outside its declared sparsity pattern")]
    OutsidePattern {
        row: String,
        col: String,
        entry: (usize, usize),
    },

    #[error("Sparsity pattern of d{row}/d{col} has an entry at {entry:?} outside a {nrows}x{ncols} block")]
    PatternOutOfBounds {
        row: String,
        col: String,
        entry: (usize, usize),
        nrows: usize,
        ncols: usize,
    },
}

#[derive(Debug, Clone)]
struct StoredBlock {
    row: VarId,
    col: VarId,
    owner: SystemId,
    pattern: PartialPattern,
    value: JacobianBlock,
}

/// Declared partial derivative blocks in residual form, keyed by `(output, variable)`.
///
/// Blocks are stored as derivatives of the residual of the row output: an explicit output
/// `u = f(p)` contributes `-df/dp` here and an identity diagonal (recorded separately), while an
/// implicit output contributes `dR/dp` and `dR/du` as supplied. Pairs that were never declared
/// are structural zeros: they are never allocated and refuse writes.
#[derive(Debug, Clone, Default)]
pub struct JacobianStore {
    blocks: Vec<StoredBlock>,
    index: HashMap<(VarId, VarId), usize>,
    identity: Vec<VarId>,
}

impl JacobianStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zero block for a declared pair. A repeated declaration replaces the pattern.
    pub(crate) fn declare(
        &mut self,
        registry: &VariableRegistry,
        row: VarId,
        col: VarId,
        pattern: PartialPattern,
        owner: SystemId,
    ) -> Result<(), JacobianError> {
        let (nrows, ncols) = block_shape(registry, row, col);
        if let Some(entry) = pattern.out_of_bounds(nrows, ncols) {
            return Err(JacobianError::PatternOutOfBounds {
                row: registry.var(row).path.clone(),
                col: registry.var(col).path.clone(),
                entry,
                nrows,
                ncols,
            });
        }
        let stored = StoredBlock {
            row,
            col,
            owner,
            value: JacobianBlock::zeros(&pattern, nrows, ncols),
            pattern,
        };
        match self.index.get(&(row, col)) {
            Some(&i) => self.blocks[i] = stored,
            None => {
                self.index.insert((row, col), self.blocks.len());
                self.blocks.push(stored);
            }
        }
        Ok(())
    }

    /// Marks an explicit output: its residual row carries an identity on the diagonal.
    pub(crate) fn add_identity(&mut self, row: VarId) {
        if !self.identity.contains(&row) {
            self.identity.push(row);
        }
    }

    pub fn is_structural_zero(&self, row: VarId, col: VarId) -> bool {
        !self.index.contains_key(&(row, col))
    }

    pub fn pattern(&self, row: VarId, col: VarId) -> Option<&PartialPattern> {
        self.index.get(&(row, col)).map(|&i| &self.blocks[i].pattern)
    }

    /// Stores the values of a declared block.
    ///
    /// The block is converted to the declared representation; a dense block written to a
    /// sparse declaration must be zero outside the pattern.
    ///
    /// # Errors
    ///
    /// Returns [`JacobianError`] if the pair is a structural zero, the shape does not match the
    /// variable sizes, or nonzeros fall outside the declared pattern.
    pub fn set_block(
        &mut self,
        registry: &VariableRegistry,
        row: VarId,
        col: VarId,
        block: JacobianBlock,
    ) -> Result<(), JacobianError> {
        let names = || (registry.var(row).path.clone(), registry.var(col).path.clone());
        let Some(&i) = self.index.get(&(row, col)) else {
            let (row, col) = names();
            return Err(JacobianError::StructuralZero { row, col });
        };
        let expected = block_shape(registry, row, col);
        if block.shape() != expected {
            let (row, col) = names();
            return Err(JacobianError::ShapeMismatch {
                row,
                col,
                expected,
                actual: block.shape(),
            });
        }
        let stored = &mut self.blocks[i];
        stored.value = block.conform_to(&stored.pattern).map_err(|entry| {
            let (row, col) = names();
            JacobianError::OutsidePattern { row, col, entry }
        })?;
        Ok(())
    }

    pub fn block(&self, row: VarId, col: VarId) -> Option<&JacobianBlock> {
        self.index.get(&(row, col)).map(|&i| &self.blocks[i].value)
    }

    /// Declared blocks in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (VarId, VarId, &JacobianBlock)> {
        self.blocks.iter().map(|b| (b.row, b.col, &b.value))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Flat values of every block owned by a system accepted by `filter`, in declaration order.
    pub(crate) fn owned_values(&self, filter: impl Fn(SystemId) -> bool) -> Vec<f64> {
        self.blocks
            .iter()
            .filter(|b| filter(b.owner))
            .flat_map(|b| b.value.values())
            .collect()
    }

    /// Inverse of [`JacobianStore::owned_values`] for the same filter.
    pub(crate) fn load_owned_values(&mut self, filter: impl Fn(SystemId) -> bool, data: &[f64]) {
        let mut cursor = 0;
        for block in self.blocks.iter_mut().filter(|b| filter(b.owner)) {
            let n = block.value.value_count();
            if let Some(chunk) = data.get(cursor..cursor + n) {
                block.value.load_values(chunk);
            }
            cursor += n;
        }
    }

    /// Output-to-output dependency edges `(source, dependent)` as layout positions, with
    /// connections resolved so an input column points at the output feeding it.
    pub(crate) fn dependency_edges(&self, registry: &VariableRegistry) -> Vec<(usize, usize)> {
        let mut edges = Vec::new();
        for block in &self.blocks {
            let source = match registry.var(block.col).kind {
                VarKind::Output => Some(block.col),
                VarKind::Input => registry.source(block.col).map(|s| s.output),
            };
            if let Some(source) = source.filter(|&s| s != block.row) {
                edges.push((registry.position(source), registry.position(block.row)));
            }
        }
        edges
    }

    /// Assembles the global residual Jacobian over the unknowns vector.
    ///
    /// Input columns are folded onto the columns of their source outputs, honouring source
    /// indices, so the operator acts on unknowns only.
    pub fn get_operator(&self, registry: &VariableRegistry, blocks: Vec<Range<usize>>) -> SystemOperator {
        let n = registry.n_unknowns();
        let mut triplets = Vec::new();
        for &row in &self.identity {
            triplets.extend(registry.range(row).map(|i| (i, i, 1.0)));
        }
        for block in &self.blocks {
            let row_start = registry.range(block.row).start;
            match registry.var(block.col).kind {
                VarKind::Output => {
                    let col_start = registry.range(block.col).start;
                    triplets.extend(
                        block
                            .value
                            .triplets()
                            .into_iter()
                            .map(|(i, j, v)| (row_start + i, col_start + j, v)),
                    );
                }
                VarKind::Input => {
                    let Some(source) = registry.source(block.col) else {
                        continue;
                    };
                    let col_start = registry.range(source.output).start;
                    for (i, j, v) in block.value.triplets() {
                        let src_col = source.indices.as_ref().map_or(j, |ix| ix[j]);
                        triplets.push((row_start + i, col_start + src_col, v));
                    }
                }
            }
        }
        SystemOperator::new(CsrMatrix::from_triplets(n, n, triplets), blocks)
    }
}

fn block_shape(registry: &VariableRegistry, row: VarId, col: VarId) -> (usize, usize) {
    (registry.var(row).size(), registry.var(col).size())
}
