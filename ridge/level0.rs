//! Level-0 block-wise ridge regression.
//!
//! For one block of markers the solver produces out-of-fold predictions
//! across the whole lambda grid. The block's Gram matrix is built once; each
//! fold removes its own contribution and the residual is eigendecomposed, so
//! sweeping the penalty grid costs one cheap diagonal solve per lambda
//! instead of a factorization per lambda. Predictions are centered and
//! scaled with whole-sample moments after every fold has deposited, which is
//! why a block's features only become final at the end of its call.

use crate::chunks::ChunkPlan;
use crate::config::RidgeConfig;
use crate::data::{GenotypeBlock, PhenotypeData};
use crate::diagnostics::BlockBetaRecorder;
use crate::error::RidgeError;
use crate::folds::FoldPartition;
use crate::store::Level0Sink;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rayon::prelude::*;

/// Cross-products of one genotype block: the only quantities that survive
/// the block's fit. Raw genotypes are dropped with the block itself.
pub struct Level0CrossProducts {
    /// Whole-sample Gram matrix G G', markers x markers.
    pub ggt: Array2<f64>,
    /// Whole-sample G Y, markers x phenotypes.
    pub gty: Array2<f64>,
    /// Per-fold Gram contributions.
    pub ggt_folds: Vec<Array2<f64>>,
    /// Per-fold G Y contributions.
    pub gty_folds: Vec<Array2<f64>>,
}

impl Level0CrossProducts {
    /// Builds the whole-sample cross-products and each fold's contribution.
    /// Folds write disjoint outputs, so they are computed in parallel.
    pub fn compute(
        block: &GenotypeBlock,
        phenos: &PhenotypeData,
        folds: &FoldPartition,
    ) -> Result<Self, RidgeError> {
        if block.n_samples() != phenos.n_samples() {
            return Err(RidgeError::Dimension(format!(
                "block covers {} samples, phenotypes cover {}",
                block.n_samples(),
                phenos.n_samples()
            )));
        }
        let g = &block.genotypes;
        let y = &phenos.phenotypes;
        let per_fold: Vec<(Array2<f64>, Array2<f64>)> = folds
            .ranges()
            .par_iter()
            .map(|range| {
                let gf = g.slice(s![.., range.clone()]);
                let yf = y.slice(s![range.clone(), ..]);
                (gf.dot(&gf.t()), gf.dot(&yf))
            })
            .collect();
        let (ggt_folds, gty_folds): (Vec<_>, Vec<_>) = per_fold.into_iter().unzip();
        Ok(Self {
            ggt: g.dot(&g.t()),
            gty: g.dot(y),
            ggt_folds,
            gty_folds,
        })
    }

    /// Whole-sample cross-products only; the leave-one-out solver needs no
    /// per-fold contributions.
    pub fn whole_sample(
        block: &GenotypeBlock,
        phenos: &PhenotypeData,
    ) -> Result<Self, RidgeError> {
        if block.n_samples() != phenos.n_samples() {
            return Err(RidgeError::Dimension(format!(
                "block covers {} samples, phenotypes cover {}",
                block.n_samples(),
                phenos.n_samples()
            )));
        }
        let g = &block.genotypes;
        Ok(Self {
            ggt: g.dot(&g.t()),
            gty: g.dot(&phenos.phenotypes),
            ggt_folds: Vec::new(),
            gty_folds: Vec::new(),
        })
    }
}

/// K-fold level-0 ridge for one block.
///
/// Deposits the centered, scaled out-of-fold predictions for every phenotype
/// into `sink` at columns `[block_index * n_lambda, ..)`. When a recorder is
/// given, per-penalty betas averaged over folds are accumulated for the
/// diagnostic output.
pub fn ridge_level_0(
    block_index: usize,
    block: &GenotypeBlock,
    xprod: &Level0CrossProducts,
    phenos: &PhenotypeData,
    folds: &FoldPartition,
    fold_masks: &[Array2<bool>],
    cfg: &RidgeConfig,
    sink: &mut Level0Sink,
    mut recorder: Option<&mut BlockBetaRecorder>,
) -> Result<(), RidgeError> {
    let n = phenos.n_samples();
    let p = phenos.n_phenotypes();
    let nl = cfg.lambda.len();
    log::info!(
        "level 0 ridge on block {} ({} markers, {} fold(s))",
        block_index + 1,
        block.n_markers(),
        folds.n_folds()
    );

    let mut preds: Vec<Array2<f64>> = vec![Array2::zeros((n, nl)); p];
    let mut p_sum = Array2::<f64>::zeros((nl, p));
    let mut p_sum2 = Array2::<f64>::zeros((nl, p));

    for (i, range) in folds.ranges().iter().enumerate() {
        let gram = &xprod.ggt - &xprod.ggt_folds[i];
        let rhs = &xprod.gty - &xprod.gty_folds[i];
        let (evals, evecs) = gram.eigh(UPLO::Lower)?;
        let vt_rhs = evecs.t().dot(&rhs);
        let g_fold = block.genotypes.slice(s![.., range.clone()]);

        for (j, &lambda) in cfg.lambda.iter().enumerate() {
            let scaled = &vt_rhs / &(&evals + lambda).insert_axis(Axis(1));
            let beta = evecs.dot(&scaled);
            if let Some(rec) = recorder.as_deref_mut() {
                rec.accumulate(j, beta.view());
            }
            // held-out predictions for the dropped fold
            let fold_pred = beta.t().dot(&g_fold);
            for ph in 0..p {
                for (k, sample) in range.clone().enumerate() {
                    let v = fold_pred[(ph, k)];
                    preds[ph][(sample, j)] = v;
                    if fold_masks[i][(k, ph)] {
                        p_sum[(j, ph)] += v;
                        p_sum2[(j, ph)] += v * v;
                    }
                }
            }
        }
    }

    center_and_deposit(
        block_index,
        preds,
        &p_sum,
        &p_sum2,
        phenos,
        cfg,
        sink,
        recorder,
    )
}

/// Leave-one-out level-0 ridge for one block.
///
/// One eigendecomposition of the whole-sample Gram matrix serves every
/// left-out sample: sample `i`'s prediction is corrected in closed form,
/// `(z' D_inv W - g * y_i) / (1 - g)` with `g = z' D_inv z`, instead of
/// refitting N times. Samples are processed in memory-bounded chunks.
pub fn ridge_level_0_loocv(
    block_index: usize,
    block: &GenotypeBlock,
    xprod: &Level0CrossProducts,
    phenos: &PhenotypeData,
    cfg: &RidgeConfig,
    sink: &mut Level0Sink,
) -> Result<(), RidgeError> {
    let n = phenos.n_samples();
    let p = phenos.n_phenotypes();
    let nl = cfg.lambda.len();
    let bs = block.n_markers();
    log::info!(
        "level 0 leave-one-out ridge on block {} ({} markers)",
        block_index + 1,
        bs
    );

    let (evals, evecs) = xprod.ggt.eigh(UPLO::Lower)?;
    // (eigenvalue + lambda)^-1 for the whole grid at once
    let dl_inv = Array2::from_shape_fn((bs, nl), |(k, j)| 1.0 / (evals[k] + cfg.lambda[j]));
    let wmat = evecs.t().dot(&xprod.gty);

    let plan = ChunkPlan::new(n, bs * std::mem::size_of::<f64>(), cfg.chunk_bytes);
    log::debug!("processing {} chunk(s)", plan.n_chunks());

    let mut preds: Vec<Array2<f64>> = vec![Array2::zeros((n, nl)); p];
    for range in plan.iter() {
        let vtg = evecs.t().dot(&block.genotypes.slice(s![.., range.clone()]));
        for (c, sample) in range.clone().enumerate() {
            let z1 = vtg.column(c);
            let z2 = &dl_inv * &z1.view().insert_axis(Axis(1));
            let gvec: Array1<f64> = z2.t().dot(&z1);
            for &g in gvec.iter() {
                if 1.0 - g < cfg.leverage_tol {
                    return Err(RidgeError::LeverageNearOne {
                        sample,
                        leverage: g,
                        tol: cfg.leverage_tol,
                    });
                }
            }
            let base = z2.t().dot(&wmat);
            for ph in 0..p {
                let y_i = phenos.phenotypes[(sample, ph)];
                for j in 0..nl {
                    preds[ph][(sample, j)] = (base[(j, ph)] - gvec[j] * y_i) / (1.0 - gvec[j]);
                }
            }
        }
    }

    // masked whole-sample moments, computed directly
    let mut p_sum = Array2::<f64>::zeros((nl, p));
    let mut p_sum2 = Array2::<f64>::zeros((nl, p));
    for ph in 0..p {
        for (i, &m) in phenos.masks.column(ph).iter().enumerate() {
            if m {
                for j in 0..nl {
                    let v = preds[ph][(i, j)];
                    p_sum[(j, ph)] += v;
                    p_sum2[(j, ph)] += v * v;
                }
            }
        }
    }
    center_and_deposit(block_index, preds, &p_sum, &p_sum2, phenos, cfg, sink, None)
}

/// Centers and scales each phenotype's predictions with whole-sample masked
/// moments, zeroes masked entries and hands the block's columns to the sink.
#[allow(clippy::too_many_arguments)]
fn center_and_deposit(
    block_index: usize,
    mut preds: Vec<Array2<f64>>,
    p_sum: &Array2<f64>,
    p_sum2: &Array2<f64>,
    phenos: &PhenotypeData,
    cfg: &RidgeConfig,
    sink: &mut Level0Sink,
    mut recorder: Option<&mut BlockBetaRecorder>,
) -> Result<(), RidgeError> {
    let nl = cfg.lambda.len();
    for (ph, feats) in preds.iter_mut().enumerate() {
        let neff = phenos.neff[ph];
        let mask = phenos.masks.column(ph);
        for j in 0..nl {
            let mean = p_sum[(j, ph)] / neff;
            let inv_sd = ((neff - 1.0) / (p_sum2[(j, ph)] - neff * mean * mean)).sqrt();
            if let Some(rec) = recorder.as_deref_mut() {
                rec.apply_scale(ph, j, inv_sd);
            }
            for (i, &m) in mask.iter().enumerate() {
                feats[(i, j)] = if m {
                    (feats[(i, j)] - mean) * inv_sd
                } else {
                    0.0
                };
            }
        }
        sink.deposit(ph, block_index * nl, feats.view())?;
    }
    Ok(())
}
