//! Null logistic regression for binary phenotypes.
//!
//! Fits one unpenalized logistic model per phenotype on the covariates
//! alone. Its linear predictor becomes the fixed offset the level-1
//! penalized logistic fits carry; in the association-testing stage the
//! fitted probabilities, square-root variance weights and the inverse
//! weighted covariate cross-product are needed instead, so both can be
//! requested. This fit has no penalty to fall back on, so a zero working
//! weight or an exhausted iteration budget terminates the run.

use crate::config::RidgeConfig;
use crate::data::PhenotypeData;
use crate::error::RidgeError;
use crate::stats::sigmoid;
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Inverse, Solve};

/// Per-phenotype artifacts of the null fit.
#[derive(Debug, Clone)]
pub struct NullModel {
    /// Linear predictors, samples x phenotypes; the offsets consumed by the
    /// level-1 logistic solvers.
    pub offsets: Array2<f64>,
    /// Association-stage quantities; populated when requested.
    pub test_quantities: Option<NullTestQuantities>,
}

/// Quantities the (external) association-testing stage consumes.
#[derive(Debug, Clone)]
pub struct NullTestQuantities {
    /// Fitted probabilities, samples x phenotypes.
    pub fitted: Array2<f64>,
    /// sqrt(p * (1 - p)), samples x phenotypes.
    pub sqrt_weights: Array2<f64>,
    /// Per phenotype, the inverse of the weighted covariate cross-product.
    pub xtwx_inv: Vec<Array2<f64>>,
}

/// Fits the per-phenotype null models.
///
/// `prior_offsets` is the fixed linear predictor added without being
/// re-estimated (the polygenic adjustment in the testing stage); pass `None`
/// during level fitting. `for_testing` additionally returns the
/// association-stage quantities.
pub fn fit_null_logistic(
    phenos: &PhenotypeData,
    covariates: &Array2<f64>,
    prior_offsets: Option<&Array2<f64>>,
    cfg: &RidgeConfig,
    for_testing: bool,
) -> Result<NullModel, RidgeError> {
    let n = phenos.n_samples();
    let p = phenos.n_phenotypes();
    if covariates.nrows() != n {
        return Err(RidgeError::Dimension(format!(
            "covariate matrix has {} rows for {n} samples",
            covariates.nrows()
        )));
    }
    log::info!("fitting null logistic regression on {p} binary phenotype(s)");

    let mut offsets = Array2::zeros((n, p));
    let mut fitted = Array2::zeros((n, p));
    let mut sqrt_weights = Array2::zeros((n, p));
    let mut xtwx_inv = Vec::with_capacity(p);

    for ph in 0..p {
        let mask = phenos.masks.column(ph);
        let y: Array1<f64> = phenos
            .phenotypes_raw
            .column(ph)
            .iter()
            .zip(mask.iter())
            .map(|(&y, &m)| if m { y } else { 0.0 })
            .collect();
        // covariate rows zeroed for masked samples
        let mut x = covariates.clone();
        for (i, &m) in mask.iter().enumerate() {
            if !m {
                x.row_mut(i).fill(0.0);
            }
        }
        let loco: Option<Array1<f64>> = prior_offsets.map(|o| {
            o.column(ph)
                .iter()
                .zip(mask.iter())
                .map(|(&v, &m)| if m { v } else { 0.0 })
                .collect()
        });

        // starting values
        let mut pi: Array1<f64> = y.mapv(|v| (0.5 + v) / 2.0);
        let mut eta: Array1<f64> = pi
            .iter()
            .zip(mask.iter())
            .map(|(&pv, &m)| if m { (pv / (1.0 - pv)).ln() } else { 0.0 })
            .collect();
        let mut beta_old = Array1::zeros(x.ncols());
        beta_old[0] =
            eta.mean().unwrap_or(0.0) - loco.as_ref().and_then(|l| l.mean()).unwrap_or(0.0);
        let mut dev_old = masked_deviance(&y, &pi, mask);
        let mut dev_new;

        let mut iter = 0;
        loop {
            iter += 1;
            if iter > cfg.niter_max {
                return Err(RidgeError::NullDidNotConverge {
                    pheno: ph,
                    max_iter: cfg.niter_max,
                });
            }

            let w: Array1<f64> = pi
                .iter()
                .zip(mask.iter())
                .map(|(&pv, &m)| if m { pv * (1.0 - pv) } else { 0.0 })
                .collect();
            // a zero weight on an unmasked sample would be inverted below
            if w.iter().zip(mask.iter()).any(|(&wv, &m)| m && wv == 0.0) {
                return Err(RidgeError::NullWeightUnderflow { pheno: ph });
            }

            // working vector z = eta + (y - p) / w, masked entries zero
            let mut z: Array1<f64> = itertools::izip!(eta.iter(), y.iter(), pi.iter(), w.iter())
                .zip(mask.iter())
                .map(|((&e, &yv, &pv, &wv), &m)| if m { e + (yv - pv) / wv } else { 0.0 })
                .collect();
            if let Some(l) = &loco {
                z -= l;
            }

            let xw = &x * &w.view().insert_axis(ndarray::Axis(1));
            let xtwx = xw.t().dot(&x);
            let rhs = xw.t().dot(&z);
            let mut beta_new = xtwx.solve(&rhs)?;

            // step-halving: reject steps that pin probabilities at 0/1 or
            // blow up the deviance
            let mut search = 0;
            loop {
                search += 1;
                eta = x.dot(&beta_new);
                if let Some(l) = &loco {
                    eta += l;
                }
                pi = eta
                    .iter()
                    .zip(mask.iter())
                    .map(|(&e, &m)| if m { sigmoid(e) } else { 0.5 })
                    .collect();
                dev_new = masked_deviance(&y, &pi, mask);
                let pmin = pi.iter().cloned().fold(f64::INFINITY, f64::min);
                let pmax = pi.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                if (pmin > 0.0 && pmax < 1.0 && dev_new.is_finite())
                    || search >= cfg.niter_max_line_search
                {
                    break;
                }
                beta_new = (&beta_old + &beta_new) / 2.0;
            }

            let score = x.t().dot(&(&y - &pi));
            let max_score = score.iter().fold(0.0f64, |acc, &s| acc.max(s.abs()));
            if max_score < cfg.tol
                || (dev_new - dev_old).abs() / (0.1 + dev_new.abs()) < cfg.tol
            {
                break;
            }
            beta_old.assign(&beta_new);
            dev_old = dev_new;
        }

        let boundary = pi
            .iter()
            .zip(mask.iter())
            .filter(|&(&pv, &m)| m && (pv < cfg.numtol_eps || pv > 1.0 - cfg.numtol_eps))
            .count();
        if boundary > 0 {
            log::warn!(
                "fitted probabilities numerically 0/1 occurred for phenotype {} ({boundary} sample(s))",
                ph + 1
            );
        }
        log::debug!("null model for phenotype {} converged in {iter} iteration(s)", ph + 1);

        offsets.column_mut(ph).assign(&eta);
        if for_testing {
            fitted.column_mut(ph).assign(&pi);
            let gs: Array1<f64> = pi.mapv(|pv| (pv * (1.0 - pv)).sqrt());
            sqrt_weights.column_mut(ph).assign(&gs);
            let xg = &x * &gs.view().insert_axis(ndarray::Axis(1));
            xtwx_inv.push(xg.t().dot(&xg).inv()?);
        }
    }

    Ok(NullModel {
        offsets,
        test_quantities: for_testing.then_some(NullTestQuantities {
            fitted,
            sqrt_weights,
            xtwx_inv,
        }),
    })
}

/// Twice the negative Bernoulli log-likelihood over unmasked samples.
fn masked_deviance(y: &Array1<f64>, pi: &Array1<f64>, mask: ArrayView1<'_, bool>) -> f64 {
    let mut dev = 0.0;
    for ((&yv, &pv), &m) in y.iter().zip(pi.iter()).zip(mask.iter()) {
        if m {
            dev += if yv == 1.0 {
                (1.0 / pv).ln()
            } else {
                (1.0 / (1.0 - pv)).ln()
            };
        }
    }
    2.0 * dev
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn binary_phenos(y: &[f64]) -> PhenotypeData {
        let n = y.len();
        let raw = Array2::from_shape_vec((n, 1), y.to_vec()).unwrap();
        let masks = Array2::from_elem((n, 1), true);
        PhenotypeData::new(raw.clone(), raw, masks, 1).unwrap()
    }

    #[test]
    fn intercept_only_fit_recovers_the_log_odds_of_the_mean() {
        let y = [1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let phenos = binary_phenos(&y);
        let covs = Array2::from_elem((y.len(), 1), 1.0);
        let cfg = RidgeConfig::with_grids(vec![1.0], vec![1.0]);
        let fit = fit_null_logistic(&phenos, &covs, None, &cfg, false).unwrap();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let expected = (mean / (1.0 - mean)).ln();
        for &eta in fit.offsets.column(0).iter() {
            assert_abs_diff_eq!(eta, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn exhausted_iteration_budget_is_fatal() {
        let y = [1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 0.0];
        let phenos = binary_phenos(&y);
        let mut covs = Array2::from_elem((y.len(), 2), 1.0);
        for (i, mut row) in covs.rows_mut().into_iter().enumerate() {
            row[1] = i as f64 - 3.5;
        }
        let mut cfg = RidgeConfig::with_grids(vec![1.0], vec![1.0]);
        cfg.niter_max = 1;
        cfg.tol = 1e-12;
        match fit_null_logistic(&phenos, &covs, None, &cfg, false) {
            Err(RidgeError::NullDidNotConverge { pheno: 0, .. }) => {}
            other => panic!("expected NullDidNotConverge, got {other:?}"),
        }
    }

    #[test]
    fn test_mode_returns_weighted_cross_product_inverse() {
        let y = [1.0, 0.0, 0.0, 1.0, 1.0, 0.0];
        let phenos = binary_phenos(&y);
        let covs = Array2::from_elem((y.len(), 1), 1.0);
        let cfg = RidgeConfig::with_grids(vec![1.0], vec![1.0]);
        let fit = fit_null_logistic(&phenos, &covs, None, &cfg, true).unwrap();
        let tq = fit.test_quantities.unwrap();
        assert_eq!(tq.xtwx_inv.len(), 1);
        // intercept-only: (sum of weights)^-1
        let wsum: f64 = tq
            .sqrt_weights
            .column(0)
            .iter()
            .map(|&g| g * g)
            .sum();
        assert_abs_diff_eq!(tq.xtwx_inv[0][(0, 0)], 1.0 / wsum, epsilon = 1e-8);
    }
}
