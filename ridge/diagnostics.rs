//! Optional per-block text output of level-0 coefficient estimates.
//!
//! One line per (phenotype, penalty) pair: 1-based phenotype index, 1-based
//! penalty index, then one fold-averaged beta per marker, after a header
//! line naming each marker.

use crate::error::RidgeError;
use ndarray::{Array2, ArrayView2};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Accumulates per-penalty betas across folds for one block.
pub struct BlockBetaRecorder {
    /// Per phenotype: penalties x markers.
    sums: Vec<Array2<f64>>,
    n_folds: usize,
}

impl BlockBetaRecorder {
    pub fn new(n_pheno: usize, n_penalties: usize, n_markers: usize, n_folds: usize) -> Self {
        Self {
            sums: vec![Array2::zeros((n_penalties, n_markers)); n_pheno],
            n_folds,
        }
    }

    /// Adds one fold's solution for penalty `penalty_idx`; `beta` is
    /// markers x phenotypes.
    pub(crate) fn accumulate(&mut self, penalty_idx: usize, beta: ArrayView2<'_, f64>) {
        for (ph, sums) in self.sums.iter_mut().enumerate() {
            let mut row = sums.row_mut(penalty_idx);
            for (dst, &src) in row.iter_mut().zip(beta.column(ph).iter()) {
                *dst += src;
            }
        }
    }

    /// Scales one phenotype/penalty row by the feature's inverse standard
    /// deviation so the printed estimates match the standardized features.
    pub(crate) fn apply_scale(&mut self, pheno: usize, penalty_idx: usize, inv_sd: f64) {
        self.sums[pheno]
            .row_mut(penalty_idx)
            .mapv_inplace(|v| v * inv_sd);
    }

    /// Writes the fold-averaged estimates for the whole block.
    pub fn write(&self, path: &Path, marker_ids: &[String]) -> Result<(), RidgeError> {
        let wrap = |source: std::io::Error| RidgeError::DiagnosticsWrite {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(wrap)?;
        let mut out = BufWriter::new(file);
        write!(out, "TRAIT PARAM").map_err(wrap)?;
        for id in marker_ids {
            write!(out, " {id}").map_err(wrap)?;
        }
        writeln!(out).map_err(wrap)?;
        let k = self.n_folds as f64;
        for (ph, sums) in self.sums.iter().enumerate() {
            for (j, row) in sums.rows().into_iter().enumerate() {
                write!(out, "{} {}", ph + 1, j + 1).map_err(wrap)?;
                for &b in row.iter() {
                    write!(out, " {}", b / k).map_err(wrap)?;
                }
                writeln!(out).map_err(wrap)?;
            }
        }
        out.flush().map_err(wrap)
    }
}
