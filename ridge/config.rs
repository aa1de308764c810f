//! Run configuration for the two-level ridge engine.
//!
//! A single immutable [`RidgeConfig`] value is passed by reference to every
//! solver call. There is no ambient global state; the outer driver builds one
//! config per run (typically from a TOML fragment of named numeric options)
//! and shares it across blocks and phenotypes.

use crate::error::RidgeError;
use serde::{Deserialize, Serialize};

/// Tolerances, iteration caps, penalty grids and the memory budget shared by
/// every solver in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    /// Level-0 ridge penalties (lambda), strictly positive.
    pub lambda: Vec<f64>,
    /// Level-1 ridge penalties (tau), strictly positive.
    pub tau: Vec<f64>,
    /// Byte budget for the chunked LOOCV paths. A chunk is sized so that its
    /// working matrix stays under this many bytes.
    pub chunk_bytes: usize,
    /// Iteration cap for the unpenalized null logistic fit. Exceeding it is
    /// fatal.
    pub niter_max: usize,
    /// Step-halving cap inside the null logistic fit.
    pub niter_max_line_search: usize,
    /// Iteration cap for the penalized (ridge) logistic fits. Exceeding it
    /// marks the phenotype failed, not the run.
    pub niter_max_ridge: usize,
    /// Step-halving cap inside the penalized logistic fits.
    pub niter_max_line_search_ridge: usize,
    /// Convergence tolerance for the null logistic fit (score and relative
    /// deviance criteria).
    pub tol: f64,
    /// Threshold below which a fitted probability counts as numerically 0/1
    /// in the null model (warning only).
    pub numtol_eps: f64,
    /// Convergence tolerance for the penalized logistic fits.
    pub l1_tol: f64,
    /// Epsilon used to clip held-out probabilities away from 0/1 and to
    /// floor degenerate IRLS weights.
    pub l1_eps: f64,
    /// Guard for the leave-one-out denominator: a leverage within this
    /// distance of one is treated as a fatal numerical pathology.
    pub leverage_tol: f64,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            lambda: Vec::new(),
            tau: Vec::new(),
            chunk_bytes: 1_000_000_000,
            niter_max: 30,
            niter_max_line_search: 25,
            niter_max_ridge: 500,
            niter_max_line_search_ridge: 100,
            tol: 1e-8,
            numtol_eps: 10.0 * f64::EPSILON,
            l1_tol: 1e-4,
            l1_eps: 1e-5,
            leverage_tol: 1e-8,
        }
    }
}

impl RidgeConfig {
    /// Builds a config with the given penalty grids and default tolerances.
    pub fn with_grids(lambda: Vec<f64>, tau: Vec<f64>) -> Self {
        Self {
            lambda,
            tau,
            ..Self::default()
        }
    }

    /// Checks the invariants every solver relies on. Call once per run.
    pub fn validate(&self) -> Result<(), RidgeError> {
        if self.lambda.is_empty() {
            return Err(RidgeError::Config("the lambda grid is empty".into()));
        }
        if self.tau.is_empty() {
            return Err(RidgeError::Config("the tau grid is empty".into()));
        }
        for &v in self.lambda.iter().chain(self.tau.iter()) {
            if !(v > 0.0) || !v.is_finite() {
                return Err(RidgeError::Config(format!(
                    "ridge penalties must be strictly positive and finite, got {v}"
                )));
            }
        }
        if self.chunk_bytes == 0 {
            return Err(RidgeError::Config("chunk_bytes must be positive".into()));
        }
        if self.niter_max == 0 || self.niter_max_ridge == 0 {
            return Err(RidgeError::Config("iteration caps must be positive".into()));
        }
        if !(self.leverage_tol > 0.0) {
            return Err(RidgeError::Config(
                "leverage_tol must be strictly positive".into(),
            ));
        }
        Ok(())
    }

    /// Parses a config from a TOML fragment of named numeric options.
    pub fn from_toml(text: &str) -> Result<Self, RidgeError> {
        let cfg: Self =
            toml::from_str(text).map_err(|e| RidgeError::Config(format!("bad TOML: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serializes the config back to TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string(self).expect("a flat numeric config always serializes")
    }
}

/// Default penalty grid parameterized by heritability: for `n` evenly spaced
/// heritability fractions h2 in (0, 1), the penalty is `m * (1 - h2) / h2`
/// where `m` is the number of predictors entering the fit.
pub fn penalty_grid(n: usize, n_predictors: usize) -> Vec<f64> {
    let m = n_predictors as f64;
    (0..n)
        .map(|j| {
            let h2 = (j as f64 + 0.5) / n as f64;
            m * (1.0 - h2) / h2
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grids_are_rejected_until_set() {
        assert!(RidgeConfig::default().validate().is_err());
        let cfg = RidgeConfig::with_grids(vec![0.1, 1.0], vec![2.0]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_positive_penalties_are_rejected() {
        let cfg = RidgeConfig::with_grids(vec![0.1, 0.0], vec![2.0]);
        assert!(cfg.validate().is_err());
        let cfg = RidgeConfig::with_grids(vec![0.1], vec![-3.0]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let cfg = RidgeConfig::with_grids(vec![0.5, 5.0], vec![1.0, 10.0]);
        let parsed = RidgeConfig::from_toml(&cfg.to_toml()).unwrap();
        assert_eq!(parsed.lambda, cfg.lambda);
        assert_eq!(parsed.tau, cfg.tau);
        assert_eq!(parsed.niter_max_ridge, cfg.niter_max_ridge);
    }

    #[test]
    fn heritability_grid_is_decreasing_and_positive() {
        let grid = penalty_grid(5, 1000);
        assert_eq!(grid.len(), 5);
        for w in grid.windows(2) {
            assert!(w[0] > w[1]);
            assert!(w[1] > 0.0);
        }
    }
}
