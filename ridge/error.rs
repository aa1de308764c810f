use std::path::PathBuf;
use thiserror::Error;

/// A comprehensive error type for the ridge engine.
///
/// Every variant here is fatal at the point of detection: the run stops and
/// the caller gets a descriptive message. Convergence failures inside a
/// penalized fit are deliberately NOT errors; they degrade to a per-phenotype
/// [`crate::stats::FitStatus::Failed`] so other phenotypes keep running.
#[derive(Error, Debug)]
pub enum RidgeError {
    #[error(
        "zeros occurred in Var(Y) while fitting the null logistic regression for phenotype {pheno}"
    )]
    NullWeightUnderflow { pheno: usize },

    #[error(
        "null logistic regression did not converge within {max_iter} iterations for phenotype {pheno}"
    )]
    NullDidNotConverge { pheno: usize, max_iter: usize },

    #[error("cannot write level 0 predictions to {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read level 0 predictions from {path}: {source}")]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "level 0 prediction file {path} holds {found} bytes but {expected} were expected \
         ({samples} samples x {columns} columns x 8)"
    )]
    StoreSizeMismatch {
        path: PathBuf,
        found: u64,
        expected: u64,
        samples: usize,
        columns: usize,
    },

    #[error("cannot write block beta diagnostics to {path}: {source}")]
    DiagnosticsWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "leave-one-out leverage for sample {sample} is {leverage:.17} which leaves the \
         correction denominator within {tol:e} of zero"
    )]
    LeverageNearOne {
        sample: usize,
        leverage: f64,
        tol: f64,
    },

    #[error("fold {fold} contains no unmasked samples for phenotype {pheno}")]
    EmptyFold { fold: usize, pheno: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("dimension mismatch: {0}")]
    Dimension(String),

    #[error("linear algebra backend error: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}
