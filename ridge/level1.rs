//! Level-1 linear ridge over the concatenated level-0 predictions.
//!
//! All blocks' level-0 outputs form one feature matrix per phenotype. The
//! K-fold solver reuses the level-0 strategy one level up: whole-sample
//! cross-products built once, each fold's contribution subtracted, one
//! eigendecomposition per fold shared by the entire tau grid. The
//! leave-one-out solver applies the same closed-form identity as level 0 to
//! the concatenated features, in memory-bounded chunks.

use crate::chunks::ChunkPlan;
use crate::config::RidgeConfig;
use crate::data::PhenotypeData;
use crate::error::RidgeError;
use crate::folds::FoldPartition;
use crate::stats::{FitStatus, RunningSums};
use crate::store::FeatureSource;
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::{Eigh, UPLO};

/// Result of a level-1 fit.
#[derive(Debug)]
pub struct Level1Fit {
    /// Running sums per (phenotype, penalty); five for the linear solvers,
    /// six for the logistic ones.
    pub sums: RunningSums,
    /// Coefficients per phenotype and fold, features x penalties. The
    /// leave-one-out solvers report one whole-sample entry per phenotype.
    pub betas: Vec<Vec<Array2<f64>>>,
    /// Per-phenotype convergence state. Linear fits either succeed or fail
    /// the whole run; only the penalized logistic fits degrade per
    /// phenotype.
    pub status: Vec<FitStatus>,
}

/// K-fold linear level-1 ridge.
pub fn ridge_level_1(
    source: &FeatureSource,
    phenos: &PhenotypeData,
    folds: &FoldPartition,
    cfg: &RidgeConfig,
) -> Result<Level1Fit, RidgeError> {
    let p = phenos.n_phenotypes();
    let nt = cfg.tau.len();
    let mut sums = RunningSums::new(p, nt, false);
    let mut betas = Vec::with_capacity(p);
    log::info!("level 1 ridge on {p} phenotype(s)");

    for ph in 0..p {
        let x = source.features(ph)?;
        let m = x.ncols();
        let y = phenos.phenotypes.column(ph);

        // per-fold cross-products and their whole-sample totals
        let mut fold_xtx = Vec::with_capacity(folds.n_folds());
        let mut fold_xty = Vec::with_capacity(folds.n_folds());
        let mut xtx_sum = Array2::<f64>::zeros((m, m));
        let mut xty_sum = Array1::<f64>::zeros(m);
        for range in folds.ranges() {
            let xf = x.slice(s![range.clone(), ..]);
            let yf = y.slice(s![range.clone()]);
            let xtx = xf.t().dot(&xf);
            let xty = xf.t().dot(&yf);
            xtx_sum += &xtx;
            xty_sum += &xty;
            fold_xtx.push(xtx);
            fold_xty.push(xty);
        }

        let mut pheno_betas = Vec::with_capacity(folds.n_folds());
        for (i, range) in folds.ranges().iter().enumerate() {
            let gram = &xtx_sum - &fold_xtx[i];
            let rhs = &xty_sum - &fold_xty[i];
            let (evals, evecs) = gram.eigh(UPLO::Lower)?;
            let vt_rhs = evecs.t().dot(&rhs);

            // every tau at once: columns of scaled are (D + tau)^-1 V' rhs
            let mut scaled = Array2::<f64>::zeros((m, nt));
            for (j, &tau) in cfg.tau.iter().enumerate() {
                scaled.column_mut(j).assign(&(&vt_rhs / &(&evals + tau)));
            }
            let beta = evecs.dot(&scaled);

            let xf = x.slice(s![range.clone(), ..]);
            let yf = y.slice(s![range.clone()]);
            let p1 = xf.dot(&beta);
            let y_sum = yf.sum();
            let y_sq_sum = yf.iter().map(|&v| v * v).sum::<f64>();
            for j in 0..nt {
                let col = p1.column(j);
                sums.sum_pred[(ph, j)] += col.sum();
                sums.sum_truth[(ph, j)] += y_sum;
                sums.sum_pred_sq[(ph, j)] += col.iter().map(|&v| v * v).sum::<f64>();
                sums.sum_truth_sq[(ph, j)] += y_sq_sum;
                sums.sum_cross[(ph, j)] += col
                    .iter()
                    .zip(yf.iter())
                    .map(|(&a, &b)| a * b)
                    .sum::<f64>();
            }
            pheno_betas.push(beta);
        }
        betas.push(pheno_betas);
    }

    Ok(Level1Fit {
        sums,
        betas,
        status: vec![FitStatus::Converged; p],
    })
}

/// Leave-one-out linear level-1 ridge.
///
/// Phenotypes are assumed centered and scaled upstream, so the response
/// sums are set analytically: `sum(truth) = 0` and
/// `sum(truth^2) = neff - n_covariates`.
pub fn ridge_level_1_loocv(
    source: &FeatureSource,
    phenos: &PhenotypeData,
    cfg: &RidgeConfig,
) -> Result<Level1Fit, RidgeError> {
    let n = phenos.n_samples();
    let p = phenos.n_phenotypes();
    let nt = cfg.tau.len();
    let mut sums = RunningSums::new(p, nt, false);
    let mut betas = Vec::with_capacity(p);
    log::info!("level 1 leave-one-out ridge on {p} phenotype(s)");

    for ph in 0..p {
        let x = source.features(ph)?;
        let m = x.ncols();
        let y = phenos.phenotypes.column(ph);

        let xtx = x.t().dot(&x);
        let (evals, evecs) = xtx.eigh(UPLO::Lower)?;
        let dl_inv = Array2::from_shape_fn((m, nt), |(k, j)| 1.0 / (evals[k] + cfg.tau[j]));
        let zvec = x.t().dot(&y);
        let wvec = evecs.t().dot(&zvec);

        let plan = ChunkPlan::new(n, m * std::mem::size_of::<f64>(), cfg.chunk_bytes);
        log::debug!("phenotype {}: {} chunk(s)", ph + 1, plan.n_chunks());
        for range in plan.iter() {
            let z1 = x.slice(s![range.clone(), ..]).dot(&evecs).reversed_axes();
            for (c, sample) in range.clone().enumerate() {
                let z1c = z1.column(c);
                let z2 = &dl_inv * &z1c.view().insert_axis(Axis(1));
                let cal: Array1<f64> = z2.t().dot(&z1c);
                for &g in cal.iter() {
                    if 1.0 - g < cfg.leverage_tol {
                        return Err(RidgeError::LeverageNearOne {
                            sample,
                            leverage: g,
                            tol: cfg.leverage_tol,
                        });
                    }
                }
                let y_i = y[sample];
                let base = z2.t().dot(&wvec);
                for j in 0..nt {
                    let pred = (base[j] - y_i * cal[j]) / (1.0 - cal[j]);
                    sums.sum_pred[(ph, j)] += pred;
                    // truth is centered, so sum(truth) stays zero
                    sums.sum_pred_sq[(ph, j)] += pred * pred;
                    sums.sum_cross[(ph, j)] += pred * y_i;
                }
            }
        }

        // whole-sample coefficients for downstream prediction
        let scaled = &dl_inv * &wvec.view().insert_axis(Axis(1));
        let beta = evecs.dot(&scaled);
        betas.push(vec![beta]);

        let sy2 = phenos.neff[ph] - phenos.n_covariates as f64;
        for j in 0..nt {
            sums.sum_truth_sq[(ph, j)] = sy2;
        }
    }

    Ok(Level1Fit {
        sums,
        betas,
        status: vec![FitStatus::Converged; p],
    })
}
