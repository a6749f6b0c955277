use nalgebra::{DMatrix, DVector};
use std::ops::Range;

/// Compressed sparse row matrix. Entries are sorted by column within each row and duplicates
/// are summed at construction. Explicitly stored zeros are kept, since they mark declared
/// structure.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    nrows: usize,
    ncols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    pub fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Self {
        let mut entries: Vec<(usize, usize, f64)> = triplets.into_iter().collect();
        entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut row_ptr = vec![0; nrows + 1];
        let mut col_idx: Vec<usize> = Vec::with_capacity(entries.len());
        let mut values: Vec<f64> = Vec::with_capacity(entries.len());
        let mut last: Option<(usize, usize)> = None;
        for (r, c, v) in entries {
            if last == Some((r, c)) {
                if let Some(tail) = values.last_mut() {
                    *tail += v;
                }
                continue;
            }
            col_idx.push(c);
            values.push(v);
            row_ptr[r + 1] += 1;
            last = Some((r, c));
        }
        for r in 0..nrows {
            row_ptr[r + 1] += row_ptr[r];
        }
        Self {
            nrows,
            ncols,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn identity(n: usize) -> Self {
        Self::from_triplets(n, n, (0..n).map(|i| (i, i, 1.0)))
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row(&self, r: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let span = self.row_ptr[r]..self.row_ptr[r + 1];
        self.col_idx[span.clone()]
            .iter()
            .copied()
            .zip(self.values[span].iter().copied())
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.row(r).find(|&(col, _)| col == c).map_or(0.0, |(_, v)| v)
    }

    pub fn matvec(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(self.matvec_rows(0..self.nrows, x))
    }

    /// Product restricted to a contiguous range of rows.
    pub fn matvec_rows(&self, rows: Range<usize>, x: &DVector<f64>) -> Vec<f64> {
        rows.map(|r| self.row(r).map(|(c, v)| v * x[c]).sum())
            .collect()
    }

    pub fn transpose(&self) -> Self {
        let mut triplets = Vec::with_capacity(self.nnz());
        for r in 0..self.nrows {
            triplets.extend(self.row(r).map(|(c, v)| (c, r, v)));
        }
        Self::from_triplets(self.ncols, self.nrows, triplets)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut m = DMatrix::zeros(self.nrows, self.ncols);
        for r in 0..self.nrows {
            for (c, v) in self.row(r) {
                m[(r, c)] = v;
            }
        }
        m
    }

    /// Principal submatrix on a sorted list of indices.
    pub fn submatrix(&self, indices: &[usize]) -> Self {
        let mut triplets = Vec::new();
        for (local_r, &r) in indices.iter().enumerate() {
            for (c, v) in self.row(r) {
                if let Ok(local_c) = indices.binary_search(&c) {
                    triplets.push((local_r, local_c, v));
                }
            }
        }
        Self::from_triplets(indices.len(), indices.len(), triplets)
    }
}
