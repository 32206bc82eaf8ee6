//! Collaborator seams for imputation and scaling, plus sparse-column
//! dropping.
//!
//! The statistical machinery behind imputation and scaling is not this
//! crate's concern; both are consumed as black boxes behind traits with a
//! narrow contract:
//!
//! - an [`Imputer`] fills NaN cells in place and preserves the matrix shape;
//! - a [`Scaler`] transforms columns in place and preserves the matrix shape,
//!   ignoring NaN cells when computing its column statistics.
//!
//! The implementations shipped here are deliberately simple stand-ins
//! (column-mean fill, z-score, min-max) used by tests and as CLI defaults;
//! heavier routines plug in at the same seams.

use ndarray::Array2;

/// Fills missing (NaN) cells of a feature matrix in place.
pub trait Imputer: Send + Sync {
    fn impute(&self, x: &mut Array2<f64>);
}

/// Column-wise feature scaling in place.
pub trait Scaler: Send + Sync {
    fn scale(&self, x: &mut Array2<f64>);
}

/// Replaces NaN cells with their column mean; all-missing columns become 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanImputer;

impl Imputer for MeanImputer {
    fn impute(&self, x: &mut Array2<f64>) {
        for mut col in x.columns_mut() {
            let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
            let fill = if finite.is_empty() {
                0.0
            } else {
                finite.iter().sum::<f64>() / finite.len() as f64
            };
            for v in col.iter_mut() {
                if !v.is_finite() {
                    *v = fill;
                }
            }
        }
    }
}

/// Zero-mean, unit-variance column scaling; constant columns become 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZScoreScaler;

impl Scaler for ZScoreScaler {
    fn scale(&self, x: &mut Array2<f64>) {
        for mut col in x.columns_mut() {
            let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                continue;
            }
            let n = finite.len() as f64;
            let mean = finite.iter().sum::<f64>() / n;
            let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            for v in col.iter_mut() {
                if v.is_finite() {
                    *v = if std > 0.0 { (*v - mean) / std } else { 0.0 };
                }
            }
        }
    }
}

/// Min-max column scaling into `[lo, hi]`; constant columns map to `lo`.
#[derive(Debug, Clone, Copy)]
pub struct MinMaxScaler {
    pub lo: f64,
    pub hi: f64,
}

impl Default for MinMaxScaler {
    fn default() -> Self {
        Self { lo: 0.0, hi: 1.0 }
    }
}

impl Scaler for MinMaxScaler {
    fn scale(&self, x: &mut Array2<f64>) {
        for mut col in x.columns_mut() {
            let finite: Vec<f64> = col.iter().copied().filter(|v| v.is_finite()).collect();
            if finite.is_empty() {
                continue;
            }
            let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
            let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let span = max - min;
            for v in col.iter_mut() {
                if v.is_finite() {
                    *v = if span > 0.0 {
                        self.lo + (*v - min) / span * (self.hi - self.lo)
                    } else {
                        self.lo
                    };
                }
            }
        }
    }
}

/// Drop columns whose finite-value fraction falls below `min_frac`.
///
/// Returns the retained matrix; `columns` is pruned in lockstep so labels
/// stay aligned with the data.
pub fn drop_sparse_columns(
    x: &Array2<f64>,
    columns: &mut Vec<String>,
    min_frac: f64,
) -> Array2<f64> {
    let n_rows = x.nrows();
    let keep: Vec<usize> = (0..x.ncols())
        .filter(|&j| {
            if n_rows == 0 {
                return true;
            }
            let finite = x.column(j).iter().filter(|v| v.is_finite()).count();
            finite as f64 / n_rows as f64 >= min_frac
        })
        .collect();

    let kept_cols: Vec<String> = keep.iter().map(|&j| columns[j].clone()).collect();
    *columns = kept_cols;

    let mut out = Array2::zeros((n_rows, keep.len()));
    for (new_j, &old_j) in keep.iter().enumerate() {
        out.column_mut(new_j).assign(&x.column(old_j));
    }
    out
}
