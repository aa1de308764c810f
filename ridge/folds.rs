//! Static assignment of samples to cross-validation folds.
//!
//! Folds are contiguous ranges of the sample ordering: fold `i` owns samples
//! in `[low_i, high_i)`. No reordering happens here; callers must have
//! grouped samples appropriately upstream.

use crate::error::RidgeError;
use ndarray::{s, Array2};
use std::ops::Range;

/// Disjoint, exhaustive partition of `0..n_samples` into folds.
#[derive(Debug, Clone)]
pub struct FoldPartition {
    bounds: Vec<Range<usize>>,
    n_samples: usize,
}

impl FoldPartition {
    /// Builds the partition from per-fold sizes. Sizes must sum to the total
    /// sample count the caller works with; that contract is the caller's.
    pub fn new(sizes: &[usize]) -> Self {
        let mut bounds = Vec::with_capacity(sizes.len());
        let mut low = 0usize;
        for &size in sizes {
            bounds.push(low..low + size);
            low += size;
        }
        Self {
            bounds,
            n_samples: low,
        }
    }

    /// The K = N limit: one fold per sample.
    pub fn loocv(n_samples: usize) -> Self {
        Self {
            bounds: (0..n_samples).map(|i| i..i + 1).collect(),
            n_samples,
        }
    }

    pub fn n_folds(&self) -> usize {
        self.bounds.len()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.bounds
    }

    pub fn size(&self, fold: usize) -> usize {
        self.bounds[fold].len()
    }

    /// Copies the per-phenotype masks into one mask matrix per fold, and
    /// rejects any fold that is fully masked for some phenotype: a
    /// zero-weight fold would zero the fold's leave-out denominator.
    pub fn fold_masks(&self, masks: &Array2<bool>) -> Result<Vec<Array2<bool>>, RidgeError> {
        if masks.nrows() != self.n_samples {
            return Err(RidgeError::Dimension(format!(
                "mask matrix has {} rows for a partition of {} samples",
                masks.nrows(),
                self.n_samples
            )));
        }
        let mut out = Vec::with_capacity(self.bounds.len());
        for (fold, range) in self.bounds.iter().enumerate() {
            let fold_mask = masks.slice(s![range.clone(), ..]).to_owned();
            for pheno in 0..fold_mask.ncols() {
                if !fold_mask.column(pheno).iter().any(|&m| m) {
                    return Err(RidgeError::EmptyFold { fold, pheno });
                }
            }
            out.push(fold_mask);
        }
        Ok(out)
    }
}
