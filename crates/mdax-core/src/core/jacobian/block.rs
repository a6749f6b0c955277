use crate::core::models::component::ComponentError;
use nalgebra::DMatrix;

/// Declared nonzero structure of a partial block.
#[derive(Debug, Clone, PartialEq)]
pub enum PartialPattern {
    Dense,
    /// Coordinates of the nonzeros; `rows[k]` pairs with `cols[k]`.
    Sparse { rows: Vec<usize>, cols: Vec<usize> },
}

impl PartialPattern {
    /// First coordinate outside an `nrows x ncols` block, or a length mismatch reported as
    /// `(rows.len(), cols.len())`.
    pub(crate) fn out_of_bounds(&self, nrows: usize, ncols: usize) -> Option<(usize, usize)> {
        match self {
            PartialPattern::Dense => None,
            PartialPattern::Sparse { rows, cols } => {
                if rows.len() != cols.len() {
                    return Some((rows.len(), cols.len()));
                }
                rows.iter()
                    .zip(cols)
                    .find(|&(&r, &c)| r >= nrows || c >= ncols)
                    .map(|(&r, &c)| (r, c))
            }
        }
    }
}

/// Values of one partial block, either dense or in coordinate form.
#[derive(Debug, Clone, PartialEq)]
pub enum JacobianBlock {
    Dense(DMatrix<f64>),
    Sparse {
        nrows: usize,
        ncols: usize,
        rows: Vec<usize>,
        cols: Vec<usize>,
        values: Vec<f64>,
    },
}

impl JacobianBlock {
    pub fn zeros(pattern: &PartialPattern, nrows: usize, ncols: usize) -> Self {
        match pattern {
            PartialPattern::Dense => JacobianBlock::Dense(DMatrix::zeros(nrows, ncols)),
            PartialPattern::Sparse { rows, cols } => JacobianBlock::Sparse {
                nrows,
                ncols,
                rows: rows.clone(),
                cols: cols.clone(),
                values: vec![0.0; rows.len()],
            },
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            JacobianBlock::Dense(m) => m.shape(),
            JacobianBlock::Sparse { nrows, ncols, .. } => (*nrows, *ncols),
        }
    }

    /// `(row, col, value)` for every stored entry, zeros included.
    pub fn triplets(&self) -> Vec<(usize, usize, f64)> {
        match self {
            JacobianBlock::Dense(m) => {
                let (nrows, ncols) = m.shape();
                let mut out = Vec::with_capacity(nrows * ncols);
                for i in 0..nrows {
                    for j in 0..ncols {
                        out.push((i, j, m[(i, j)]));
                    }
                }
                out
            }
            JacobianBlock::Sparse {
                rows, cols, values, ..
            } => rows
                .iter()
                .zip(cols)
                .zip(values)
                .map(|((&r, &c), &v)| (r, c, v))
                .collect(),
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            JacobianBlock::Dense(m) => m.clone(),
            JacobianBlock::Sparse { nrows, ncols, .. } => {
                let mut m = DMatrix::zeros(*nrows, *ncols);
                for (r, c, v) in self.triplets() {
                    m[(r, c)] += v;
                }
                m
            }
        }
    }

    pub fn scale(&mut self, factor: f64) {
        match self {
            JacobianBlock::Dense(m) => *m *= factor,
            JacobianBlock::Sparse { values, .. } => values.iter_mut().for_each(|v| *v *= factor),
        }
    }

    /// Re-expresses the block in the representation of `pattern`.
    ///
    /// Fails with the coordinate of the first nonzero that falls outside the pattern.
    pub(crate) fn conform_to(&self, pattern: &PartialPattern) -> Result<JacobianBlock, (usize, usize)> {
        let (nrows, ncols) = self.shape();
        match pattern {
            PartialPattern::Dense => Ok(JacobianBlock::Dense(self.to_dense())),
            PartialPattern::Sparse { rows, cols } => {
                let dense = self.to_dense();
                let mut allowed = DMatrix::from_element(nrows, ncols, false);
                for (&r, &c) in rows.iter().zip(cols) {
                    allowed[(r, c)] = true;
                }
                for i in 0..nrows {
                    for j in 0..ncols {
                        if !allowed[(i, j)] && dense[(i, j)] != 0.0 {
                            return Err((i, j));
                        }
                    }
                }
                Ok(JacobianBlock::Sparse {
                    nrows,
                    ncols,
                    rows: rows.clone(),
                    cols: cols.clone(),
                    values: rows.iter().zip(cols).map(|(&r, &c)| dense[(r, c)]).collect(),
                })
            }
        }
    }

    /// Flat copy of the stored values, used to ship blocks between processes.
    pub(crate) fn values(&self) -> Vec<f64> {
        match self {
            JacobianBlock::Dense(m) => m.as_slice().to_vec(),
            JacobianBlock::Sparse { values, .. } => values.clone(),
        }
    }

    pub(crate) fn value_count(&self) -> usize {
        match self {
            JacobianBlock::Dense(m) => m.len(),
            JacobianBlock::Sparse { values, .. } => values.len(),
        }
    }

    pub(crate) fn load_values(&mut self, data: &[f64]) {
        match self {
            JacobianBlock::Dense(m) => m.as_mut_slice().copy_from_slice(data),
            JacobianBlock::Sparse { values, .. } => values.copy_from_slice(data),
        }
    }
}

/// The partial derivatives a component fills in during `linearize`, addressed by local names.
#[derive(Debug, Clone, Default)]
pub struct Partials {
    entries: Vec<(String, String, JacobianBlock)>,
}

impl Partials {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn declare(&mut self, of: &str, wrt: &str, block: JacobianBlock) {
        self.entries.push((of.to_string(), wrt.to_string(), block));
    }

    fn entry_mut(&mut self, of: &str, wrt: &str) -> Result<&mut JacobianBlock, ComponentError> {
        self.entries
            .iter_mut()
            .find(|(o, w, _)| o == of && w == wrt)
            .map(|(_, _, b)| b)
            .ok_or_else(|| ComponentError::UndeclaredPartial {
                of: of.to_string(),
                wrt: wrt.to_string(),
            })
    }

    /// Sets a declared block from flat values: row-major for dense blocks, one value per
    /// declared nonzero for sparse ones.
    pub fn set(&mut self, of: &str, wrt: &str, values: &[f64]) -> Result<(), ComponentError> {
        let block = self.entry_mut(of, wrt)?;
        let expected = block.value_count();
        if values.len() != expected {
            return Err(ComponentError::SizeMismatch {
                name: format!("d{of}/d{wrt}"),
                expected,
                actual: values.len(),
            });
        }
        match block {
            JacobianBlock::Dense(m) => {
                let ncols = m.ncols();
                for (k, &v) in values.iter().enumerate() {
                    m[(k / ncols, k % ncols)] = v;
                }
            }
            JacobianBlock::Sparse { values: stored, .. } => stored.copy_from_slice(values),
        }
        Ok(())
    }

    /// Sets a declared block from a full matrix. Entries outside a sparse pattern are ignored.
    pub fn set_matrix(&mut self, of: &str, wrt: &str, matrix: &DMatrix<f64>) -> Result<(), ComponentError> {
        let block = self.entry_mut(of, wrt)?;
        let (nrows, ncols) = block.shape();
        if matrix.shape() != (nrows, ncols) {
            return Err(ComponentError::SizeMismatch {
                name: format!("d{of}/d{wrt}"),
                expected: nrows * ncols,
                actual: matrix.len(),
            });
        }
        match block {
            JacobianBlock::Dense(m) => m.copy_from(matrix),
            JacobianBlock::Sparse {
                rows, cols, values, ..
            } => {
                for ((v, &r), &c) in values.iter_mut().zip(rows.iter()).zip(cols.iter()) {
                    *v = matrix[(r, c)];
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, of: &str, wrt: &str) -> Option<&JacobianBlock> {
        self.entries
            .iter()
            .find(|(o, w, _)| o == of && w == wrt)
            .map(|(_, _, b)| b)
    }

    pub(crate) fn into_entries(self) -> Vec<(String, String, JacobianBlock)> {
        self.entries
    }
}
