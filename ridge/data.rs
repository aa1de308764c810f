//! Input containers supplied by the outer driver.
//!
//! This crate does not parse genotype, phenotype or covariate files; the
//! collaborators that do hand over normalized numeric matrices in the shapes
//! validated here. Sample order is fixed upstream and fold membership is
//! purely positional, so none of these containers reorder anything.

use crate::error::RidgeError;
use ndarray::{Array1, Array2};

/// Phenotype-side inputs shared by every solver in a run.
#[derive(Debug, Clone)]
pub struct PhenotypeData {
    /// Transformed (covariate-residualized, centered, scaled) phenotypes,
    /// samples x phenotypes. Masked entries are zero.
    pub phenotypes: Array2<f64>,
    /// Raw phenotype values, samples x phenotypes; 0/1 for binary traits.
    /// Masked entries are zero.
    pub phenotypes_raw: Array2<f64>,
    /// Per-(sample, phenotype) analysis mask. `true` means the sample
    /// contributes to that phenotype's fit.
    pub masks: Array2<bool>,
    /// Per-phenotype count of unmasked samples.
    pub neff: Array1<f64>,
    /// Number of linearly independent covariates removed upstream; enters
    /// the analytic `sum(truth^2)` of the leave-one-out linear path.
    pub n_covariates: usize,
}

impl PhenotypeData {
    pub fn new(
        phenotypes: Array2<f64>,
        phenotypes_raw: Array2<f64>,
        masks: Array2<bool>,
        n_covariates: usize,
    ) -> Result<Self, RidgeError> {
        if phenotypes.dim() != phenotypes_raw.dim() || phenotypes.dim() != masks.dim() {
            return Err(RidgeError::Dimension(format!(
                "phenotype matrices and masks disagree: {:?} vs {:?} vs {:?}",
                phenotypes.dim(),
                phenotypes_raw.dim(),
                masks.dim()
            )));
        }
        let neff = masks
            .columns()
            .into_iter()
            .map(|col| col.iter().filter(|&&m| m).count() as f64)
            .collect::<Array1<f64>>();
        Ok(Self {
            phenotypes,
            phenotypes_raw,
            masks,
            neff,
            n_covariates,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.phenotypes.nrows()
    }

    pub fn n_phenotypes(&self) -> usize {
        self.phenotypes.ncols()
    }
}

/// One block of markers, markers x samples. Owned transiently by the level-0
/// solver; only its cross-products travel further.
#[derive(Debug, Clone)]
pub struct GenotypeBlock {
    pub genotypes: Array2<f64>,
    /// Marker identifiers, used only by the diagnostic beta output.
    pub marker_ids: Vec<String>,
}

impl GenotypeBlock {
    pub fn new(genotypes: Array2<f64>, marker_ids: Vec<String>) -> Result<Self, RidgeError> {
        if marker_ids.len() != genotypes.nrows() {
            return Err(RidgeError::Dimension(format!(
                "{} marker ids for a block of {} markers",
                marker_ids.len(),
                genotypes.nrows()
            )));
        }
        Ok(Self {
            genotypes,
            marker_ids,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.genotypes.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.genotypes.ncols()
    }
}
