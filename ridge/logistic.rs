//! Level-1 penalized logistic regression for binary phenotypes.
//!
//! Ridge-penalized IRLS over the concatenated level-0 features, with the
//! null-model linear predictor carried as a fixed offset. Penalties are
//! processed with warm starts: the final beta of one tau seeds the next.
//! Unlike the null model, a fit that hits its iteration cap or degenerate
//! weights here marks only that phenotype failed; the sticky flag
//! short-circuits its remaining folds and penalties while every other
//! phenotype continues.

use crate::chunks::ChunkPlan;
use crate::config::RidgeConfig;
use crate::data::PhenotypeData;
use crate::error::RidgeError;
use crate::folds::FoldPartition;
use crate::level1::Level1Fit;
use crate::stats::{log_loss, sigmoid, FitStatus, RunningSums};
use crate::store::FeatureSource;
use itertools::izip;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{FactorizeC, InverseC, SolveC, UPLO};

struct WorkingState {
    eta: Array1<f64>,
    pi: Array1<f64>,
    w: Array1<f64>,
    /// True when some unmasked weight is exactly zero.
    unstable: bool,
}

/// Linear predictor, fitted probabilities and IRLS weights at `beta`.
///
/// Weights follow the glmnet strategy: when a probability lands within
/// `eps` of 0/1 it is snapped to the boundary and its weight floored at
/// `eps`, so a separated sample cannot zero the working variance outright.
fn working_state(
    x: ArrayView2<'_, f64>,
    offset: ArrayView1<'_, f64>,
    mask: ArrayView1<'_, bool>,
    beta: &Array1<f64>,
    eps: f64,
) -> WorkingState {
    let mut eta = x.dot(beta);
    for (e, &o, &m) in izip!(eta.iter_mut(), offset.iter(), mask.iter()) {
        *e = if m { *e + o } else { 0.0 };
    }
    let mut pi = eta.mapv(sigmoid);
    let mut w = Array1::ones(eta.len());
    for (pv, wv, &m) in izip!(pi.iter_mut(), w.iter_mut(), mask.iter()) {
        if !m {
            continue;
        }
        if *pv < eps {
            *pv = 0.0;
            *wv = eps;
        } else if *pv > 1.0 - eps {
            *pv = 1.0;
            *wv = eps;
        } else {
            *wv = *pv * (1.0 - *pv);
        }
    }
    let unstable = w.iter().cloned().fold(f64::INFINITY, f64::min) == 0.0;
    WorkingState {
        eta,
        pi,
        w,
        unstable,
    }
}

/// Working response z = (eta - offset) + (y - pi) / w, masked entries zero.
fn working_response(
    st: &WorkingState,
    offset: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    mask: ArrayView1<'_, bool>,
) -> Array1<f64> {
    izip!(
        st.eta.iter(),
        st.pi.iter(),
        st.w.iter(),
        offset.iter(),
        y.iter(),
        mask.iter()
    )
    .map(|(&e, &pv, &wv, &o, &yv, &m)| if m { (e - o) + (yv - pv) / wv } else { 0.0 })
    .collect()
}

fn max_abs(v: &Array1<f64>) -> f64 {
    v.iter().fold(0.0f64, |acc, &x| acc.max(x.abs()))
}

fn clip(p: f64, eps: f64) -> f64 {
    if p < eps {
        eps
    } else if p > 1.0 - eps {
        1.0 - eps
    } else {
        p
    }
}

/// K-fold penalized logistic level-1 ridge.
pub fn ridge_logistic_level_1(
    source: &FeatureSource,
    phenos: &PhenotypeData,
    folds: &FoldPartition,
    fold_masks: &[Array2<bool>],
    offsets: &Array2<f64>,
    cfg: &RidgeConfig,
) -> Result<Level1Fit, RidgeError> {
    let p = phenos.n_phenotypes();
    let nt = cfg.tau.len();
    let mut sums = RunningSums::new(p, nt, true);
    let mut status = vec![FitStatus::Fitting; p];
    let mut betas = Vec::with_capacity(p);
    log::info!("level 1 ridge with logistic regression on {p} phenotype(s)");

    for ph in 0..p {
        let x = source.features(ph)?;
        let m = x.ncols();
        let y_raw = phenos.phenotypes_raw.column(ph);
        let offset = offsets.column(ph);
        let mut pheno_betas = Vec::with_capacity(folds.n_folds());

        for (i, range_i) in folds.ranges().iter().enumerate() {
            if status[ph].is_failed() {
                break;
            }
            let mut beta_old = Array1::<f64>::zeros(m);
            let mut beta_new = Array1::<f64>::zeros(m);
            let mut fold_beta = Array2::<f64>::zeros((m, nt));

            for (j, &tau) in cfg.tau.iter().enumerate() {
                if status[ph].is_failed() {
                    break;
                }
                // warm start from the previous tau's solution
                beta_old.assign(&beta_new);
                let mut converged = false;
                let mut iter = 0;

                while iter < cfg.niter_max_ridge {
                    iter += 1;

                    let mut xtwx = Array2::<f64>::zeros((m, m));
                    let mut xtwz = Array1::<f64>::zeros(m);
                    let mut degenerate = false;
                    for (k, range_k) in folds.ranges().iter().enumerate() {
                        if k == i {
                            continue;
                        }
                        let xk = x.slice(s![range_k.clone(), ..]);
                        let st = working_state(
                            xk,
                            offset.slice(s![range_k.clone()]),
                            fold_masks[k].column(ph),
                            &beta_old,
                            cfg.l1_eps,
                        );
                        if st.unstable {
                            degenerate = true;
                            break;
                        }
                        let z = working_response(
                            &st,
                            offset.slice(s![range_k.clone()]),
                            y_raw.slice(s![range_k.clone()]),
                            fold_masks[k].column(ph),
                        );
                        let xw = &xk * &st.w.view().insert_axis(Axis(1));
                        xtwx += &xw.t().dot(&xk);
                        xtwz += &xw.t().dot(&z);
                    }
                    if degenerate {
                        log::warn!(
                            "zeros occurred in Var(Y) during ridge logistic regression for phenotype {}",
                            ph + 1
                        );
                        status[ph] = FitStatus::Failed;
                        break;
                    }

                    let mut h = xtwx;
                    for d in h.diag_mut() {
                        *d += tau;
                    }
                    let fac = h.factorizec(UPLO::Lower)?;
                    beta_new = fac.solvec(&xtwz)?;

                    // step-halving: retreat towards beta_old while any
                    // training fold's reweighting is degenerate
                    for _ in 0..cfg.niter_max_line_search_ridge {
                        let bad = folds.ranges().iter().enumerate().any(|(k, range_k)| {
                            k != i
                                && working_state(
                                    x.slice(s![range_k.clone(), ..]),
                                    offset.slice(s![range_k.clone()]),
                                    fold_masks[k].column(ph),
                                    &beta_new,
                                    cfg.l1_eps,
                                )
                                .unstable
                        });
                        if !bad {
                            break;
                        }
                        beta_new = (&beta_old + &beta_new) / 2.0;
                    }

                    let mut score = Array1::<f64>::zeros(m);
                    let mut degenerate = false;
                    for (k, range_k) in folds.ranges().iter().enumerate() {
                        if k == i {
                            continue;
                        }
                        let xk = x.slice(s![range_k.clone(), ..]);
                        let st = working_state(
                            xk,
                            offset.slice(s![range_k.clone()]),
                            fold_masks[k].column(ph),
                            &beta_new,
                            cfg.l1_eps,
                        );
                        if st.unstable {
                            degenerate = true;
                            break;
                        }
                        let yk = y_raw.slice(s![range_k.clone()]);
                        let mask_col = fold_masks[k].column(ph);
                        let resid: Array1<f64> = izip!(
                            yk.iter(),
                            st.pi.iter(),
                            mask_col.iter()
                        )
                        .map(|(&yv, &pv, &m)| if m { yv - pv } else { 0.0 })
                        .collect();
                        score += &xk.t().dot(&resid);
                    }
                    if degenerate {
                        log::warn!(
                            "zeros occurred in Var(Y) during ridge logistic regression for phenotype {}",
                            ph + 1
                        );
                        status[ph] = FitStatus::Failed;
                        break;
                    }
                    score -= &(&beta_new * tau);

                    if max_abs(&score) < cfg.l1_tol {
                        converged = true;
                        break;
                    }
                    beta_old.assign(&beta_new);
                }

                if status[ph].is_failed() {
                    break;
                }
                if !converged {
                    log::warn!(
                        "penalized logistic regression did not converge within {} iterations for phenotype {}",
                        cfg.niter_max_ridge,
                        ph + 1
                    );
                    status[ph] = FitStatus::Failed;
                    break;
                }

                // held-out predictions for the dropped fold
                let xi = x.slice(s![range_i.clone(), ..]);
                let mut eta_test = xi.dot(&beta_new);
                eta_test += &offset.slice(s![range_i.clone()]);
                for (l, sample) in range_i.clone().enumerate() {
                    if !fold_masks[i][(l, ph)] {
                        continue;
                    }
                    let p1 = clip(sigmoid(eta_test[l]), cfg.l1_eps);
                    let yv = phenos.phenotypes_raw[(sample, ph)];
                    sums.sum_pred[(ph, j)] += p1;
                    sums.sum_truth[(ph, j)] += yv;
                    sums.sum_pred_sq[(ph, j)] += p1 * p1;
                    sums.sum_truth_sq[(ph, j)] += yv * yv;
                    sums.sum_cross[(ph, j)] += p1 * yv;
                    if let Some(ll) = sums.sum_log_lik.as_mut() {
                        ll[(ph, j)] += log_loss(yv, p1);
                    }
                }
                fold_beta.column_mut(j).assign(&beta_new);
            }
            pheno_betas.push(fold_beta);
        }

        if status[ph] == FitStatus::Fitting {
            status[ph] = FitStatus::Converged;
        }
        betas.push(pheno_betas);
    }

    Ok(Level1Fit {
        sums,
        betas,
        status,
    })
}

/// Leave-one-out penalized logistic level-1 ridge.
///
/// The full-sample model is fitted once per tau; per-sample leave-one-out
/// estimates come from a Sherman-Morrison correction on the already
/// factored Hessian, processed in memory-bounded chunks.
pub fn ridge_logistic_level_1_loocv(
    source: &FeatureSource,
    phenos: &PhenotypeData,
    offsets: &Array2<f64>,
    cfg: &RidgeConfig,
) -> Result<Level1Fit, RidgeError> {
    let n = phenos.n_samples();
    let p = phenos.n_phenotypes();
    let nt = cfg.tau.len();
    let mut sums = RunningSums::new(p, nt, true);
    let mut status = vec![FitStatus::Fitting; p];
    let mut betas = Vec::with_capacity(p);
    log::info!("level 1 leave-one-out ridge with logistic regression on {p} phenotype(s)");

    for ph in 0..p {
        let x = source.features(ph)?;
        let m = x.ncols();
        let mask = phenos.masks.column(ph);
        let y_raw = phenos.phenotypes_raw.column(ph);
        let offset = offsets.column(ph);
        let mut beta_new = Array1::<f64>::zeros(m);
        let mut beta_old = Array1::<f64>::zeros(m);
        let mut pheno_beta = Array2::<f64>::zeros((m, nt));

        for (j, &tau) in cfg.tau.iter().enumerate() {
            if status[ph].is_failed() {
                break;
            }
            beta_old.assign(&beta_new);
            let mut converged = false;
            let mut iter = 0;

            while iter < cfg.niter_max_ridge {
                iter += 1;
                let st = working_state(x.view(), offset.view(), mask.view(), &beta_old, cfg.l1_eps);
                if st.unstable {
                    log::warn!(
                        "zeros occurred in Var(Y) during ridge logistic regression for phenotype {}",
                        ph + 1
                    );
                    status[ph] = FitStatus::Failed;
                    break;
                }
                let z = working_response(&st, offset.view(), y_raw.view(), mask.view());
                let xw = &x.view() * &st.w.view().insert_axis(Axis(1));
                let mut h = xw.t().dot(&x);
                for d in h.diag_mut() {
                    *d += tau;
                }
                let fac = h.factorizec(UPLO::Lower)?;
                beta_new = fac.solvec(&xw.t().dot(&z))?;

                let st = working_state(x.view(), offset.view(), mask.view(), &beta_new, cfg.l1_eps);
                if st.unstable {
                    log::warn!(
                        "zeros occurred in Var(Y) during ridge logistic regression for phenotype {}",
                        ph + 1
                    );
                    status[ph] = FitStatus::Failed;
                    break;
                }
                let resid: Array1<f64> = izip!(y_raw.iter(), st.pi.iter(), mask.iter())
                    .map(|(&yv, &pv, &mk)| if mk { yv - pv } else { 0.0 })
                    .collect();
                let mut score = x.t().dot(&resid);
                score -= &(&beta_new * tau);
                if max_abs(&score) < cfg.l1_tol {
                    converged = true;
                    break;
                }
                beta_old.assign(&beta_new);
            }

            if status[ph].is_failed() {
                break;
            }
            if !converged {
                log::warn!(
                    "ridge logistic regression did not converge within {} iterations for phenotype {}",
                    cfg.niter_max_ridge,
                    ph + 1
                );
                status[ph] = FitStatus::Failed;
                break;
            }

            // refactor the Hessian at the converged weights
            let st = working_state(x.view(), offset.view(), mask.view(), &beta_new, cfg.l1_eps);
            let xw = &x.view() * &st.w.view().insert_axis(Axis(1));
            let mut h = xw.t().dot(&x);
            for d in h.diag_mut() {
                *d += tau;
            }
            let hinv = h.factorizec(UPLO::Lower)?.invc()?;

            let plan = ChunkPlan::new(n, m * std::mem::size_of::<f64>(), cfg.chunk_bytes);
            log::debug!("phenotype {}: {} chunk(s)", ph + 1, plan.n_chunks());
            for range in plan.iter() {
                let v1 = hinv.dot(&x.slice(s![range.clone(), ..]).t());
                for (c, sample) in range.clone().enumerate() {
                    if !mask[sample] {
                        continue;
                    }
                    let xi = x.row(sample);
                    let v1c = v1.column(c);
                    let xv = xi.dot(&v1c);
                    let v2 = xv * st.w[sample];
                    if 1.0 - v2 < cfg.leverage_tol {
                        return Err(RidgeError::LeverageNearOne {
                            sample,
                            leverage: v2,
                            tol: cfg.leverage_tol,
                        });
                    }
                    // one-step leave-one-out coefficients, then predict the
                    // held-out sample
                    let correction = (y_raw[sample] - st.pi[sample]) / (1.0 - v2);
                    let pred = xi.dot(&beta_new) - xv * correction + offset[sample];
                    let p1 = clip(sigmoid(pred), cfg.l1_eps);
                    let yv = y_raw[sample];
                    sums.sum_pred[(ph, j)] += p1;
                    sums.sum_truth[(ph, j)] += yv;
                    sums.sum_pred_sq[(ph, j)] += p1 * p1;
                    sums.sum_truth_sq[(ph, j)] += yv * yv;
                    sums.sum_cross[(ph, j)] += p1 * yv;
                    if let Some(ll) = sums.sum_log_lik.as_mut() {
                        ll[(ph, j)] += log_loss(yv, p1);
                    }
                }
            }
            pheno_beta.column_mut(j).assign(&beta_new);
        }

        if status[ph] == FitStatus::Fitting {
            status[ph] = FitStatus::Converged;
        }
        betas.push(vec![pheno_beta]);
    }

    Ok(Level1Fit {
        sums,
        betas,
        status,
    })
}
