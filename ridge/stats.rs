//! Per-phenotype fit state and the running prediction sums.

use ndarray::{Array1, Array2};

/// Per-phenotype state of a level-1 fit.
///
/// The flag is sticky: once a phenotype transitions to `Failed`, remaining
/// folds and penalties for it are skipped and its partial sums are reported
/// as unusable rather than silently dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// Still iterating over folds/penalties.
    Fitting,
    /// Every fold and penalty finished within tolerance.
    Converged,
    /// A penalized fit hit its iteration cap or degenerate weights; the
    /// phenotype's results are unusable.
    Failed,
}

impl FitStatus {
    pub fn is_failed(self) -> bool {
        self == FitStatus::Failed
    }
}

/// Running sums per (phenotype, penalty) from which MSE, R-squared and the
/// binomial log-likelihood are derived without retaining per-sample
/// predictions.
#[derive(Debug, Clone)]
pub struct RunningSums {
    /// Sum of held-out predictions.
    pub sum_pred: Array2<f64>,
    /// Sum of observed responses.
    pub sum_truth: Array2<f64>,
    /// Sum of squared predictions.
    pub sum_pred_sq: Array2<f64>,
    /// Sum of squared responses.
    pub sum_truth_sq: Array2<f64>,
    /// Sum of prediction * response products.
    pub sum_cross: Array2<f64>,
    /// Accumulated negative binomial log-likelihood; present for the
    /// logistic solvers only.
    pub sum_log_lik: Option<Array2<f64>>,
}

impl RunningSums {
    pub fn new(n_pheno: usize, n_penalties: usize, with_log_lik: bool) -> Self {
        let zeros = || Array2::zeros((n_pheno, n_penalties));
        Self {
            sum_pred: zeros(),
            sum_truth: zeros(),
            sum_pred_sq: zeros(),
            sum_truth_sq: zeros(),
            sum_cross: zeros(),
            sum_log_lik: with_log_lik.then(zeros),
        }
    }

    /// Mean squared error of the held-out predictions.
    pub fn mse(&self, neff: &Array1<f64>) -> Array2<f64> {
        let mut out = &self.sum_pred_sq - &(&self.sum_cross * 2.0) + &self.sum_truth_sq;
        for (mut row, &n) in out.rows_mut().into_iter().zip(neff.iter()) {
            row.mapv_inplace(|v| v / n);
        }
        out
    }

    /// Squared Pearson correlation between held-out predictions and the
    /// observed response.
    pub fn r_squared(&self, neff: &Array1<f64>) -> Array2<f64> {
        let (p, t) = self.sum_pred.dim();
        let mut out = Array2::zeros((p, t));
        for ph in 0..p {
            let n = neff[ph];
            for j in 0..t {
                let sx = self.sum_pred[(ph, j)];
                let sy = self.sum_truth[(ph, j)];
                let sxx = n * self.sum_pred_sq[(ph, j)] - sx * sx;
                let syy = n * self.sum_truth_sq[(ph, j)] - sy * sy;
                let sxy = n * self.sum_cross[(ph, j)] - sx * sy;
                out[(ph, j)] = (sxy * sxy) / (sxx * syy);
            }
        }
        out
    }
}

/// Negative Bernoulli log-likelihood of one observation.
pub fn log_loss(y: f64, p: f64) -> f64 {
    -y * p.ln() - (1.0 - y) * (1.0 - p).ln()
}

/// Logistic function written the way the fits use it.
pub fn sigmoid(eta: f64) -> f64 {
    1.0 - 1.0 / (eta.exp() + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;

    #[test]
    fn perfect_predictions_give_unit_r_squared_and_zero_mse() {
        let mut sums = RunningSums::new(1, 1, false);
        // predictions identical to truth: x = y = [1, 2, 3]
        sums.sum_pred[(0, 0)] = 6.0;
        sums.sum_truth[(0, 0)] = 6.0;
        sums.sum_pred_sq[(0, 0)] = 14.0;
        sums.sum_truth_sq[(0, 0)] = 14.0;
        sums.sum_cross[(0, 0)] = 14.0;
        let neff = arr1(&[3.0]);
        assert_abs_diff_eq!(sums.r_squared(&neff)[(0, 0)], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sums.mse(&neff)[(0, 0)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn log_loss_matches_closed_form() {
        assert_abs_diff_eq!(log_loss(1.0, 0.5), (2.0f64).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_loss(0.0, 0.5), (2.0f64).ln(), epsilon = 1e-12);
    }

    #[test]
    fn sigmoid_is_symmetric_around_zero() {
        assert_abs_diff_eq!(sigmoid(0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(sigmoid(3.0) + sigmoid(-3.0), 1.0, epsilon = 1e-12);
    }
}
