//! Level-0 solver checks against naive reference implementations.

use ndarray::{s, Array1, Array2};
use ndarray_linalg::Solve;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ridgeline::config::RidgeConfig;
use ridgeline::data::{GenotypeBlock, PhenotypeData};
use ridgeline::folds::FoldPartition;
use ridgeline::level0::{ridge_level_0, ridge_level_0_loocv, Level0CrossProducts};
use ridgeline::store::{FeatureSource, Level0Sink};

fn random_block(n: usize, bs: usize, rng: &mut StdRng) -> GenotypeBlock {
    let g = Array2::from_shape_fn((bs, n), |_| rng.gen_range(-1.0..1.0));
    let ids = (0..bs).map(|i| format!("rs{i}")).collect();
    GenotypeBlock::new(g, ids).unwrap()
}

fn random_phenos(n: usize, p: usize, rng: &mut StdRng) -> PhenotypeData {
    let y = Array2::from_shape_fn((n, p), |_| rng.gen_range(-1.5..1.5));
    let masks = Array2::from_elem((n, p), true);
    PhenotypeData::new(y.clone(), y, masks, 0).unwrap()
}

/// Centers and scales raw out-of-fold predictions with whole-sample masked
/// moments, mirroring the solver's documented contract.
fn center_reference(preds: &mut Array2<f64>, masks: &Array2<bool>, ph: usize) {
    let n = preds.nrows();
    let neff = masks.column(ph).iter().filter(|&&m| m).count() as f64;
    for j in 0..preds.ncols() {
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        for i in 0..n {
            if masks[(i, ph)] {
                sum += preds[(i, j)];
                sum2 += preds[(i, j)] * preds[(i, j)];
            }
        }
        let mean = sum / neff;
        let inv_sd = ((neff - 1.0) / (sum2 - neff * mean * mean)).sqrt();
        for i in 0..n {
            preds[(i, j)] = if masks[(i, ph)] {
                (preds[(i, j)] - mean) * inv_sd
            } else {
                0.0
            };
        }
    }
}

fn run_level0_kfold(
    block: &GenotypeBlock,
    phenos: &PhenotypeData,
    folds: &FoldPartition,
    cfg: &RidgeConfig,
) -> FeatureSource {
    let xprod = Level0CrossProducts::compute(block, phenos, folds).unwrap();
    let fold_masks = folds.fold_masks(&phenos.masks).unwrap();
    let mut sink = Level0Sink::in_memory(
        phenos.n_phenotypes(),
        phenos.n_samples(),
        cfg.lambda.len(),
    );
    ridge_level_0(
        0, block, &xprod, phenos, folds, &fold_masks, cfg, &mut sink, None,
    )
    .unwrap();
    sink.into_source().unwrap()
}

#[test]
fn kfold_shortcut_matches_direct_per_fold_solves() {
    let mut rng = StdRng::seed_from_u64(11);
    let (n, bs, p) = (12usize, 3usize, 2usize);
    let block = random_block(n, bs, &mut rng);
    let phenos = random_phenos(n, p, &mut rng);
    let folds = FoldPartition::new(&[4, 4, 4]);
    let cfg = RidgeConfig::with_grids(vec![0.5, 5.0], vec![1.0]);

    let source = run_level0_kfold(&block, &phenos, &folds, &cfg);

    for ph in 0..p {
        // naive reference: refit (Gram_excluding_fold + lambda I) directly
        let mut raw = Array2::zeros((n, cfg.lambda.len()));
        for range in folds.ranges() {
            for (j, &lambda) in cfg.lambda.iter().enumerate() {
                let mut gram = Array2::<f64>::zeros((bs, bs));
                let mut rhs = Array1::<f64>::zeros(bs);
                for i in 0..n {
                    if range.contains(&i) {
                        continue;
                    }
                    let gi = block.genotypes.column(i);
                    for a in 0..bs {
                        for b in 0..bs {
                            gram[(a, b)] += gi[a] * gi[b];
                        }
                        rhs[a] += gi[a] * phenos.phenotypes[(i, ph)];
                    }
                }
                for d in 0..bs {
                    gram[(d, d)] += lambda;
                }
                let beta = gram.solve(&rhs).unwrap();
                for i in range.clone() {
                    raw[(i, j)] = beta.dot(&block.genotypes.column(i));
                }
            }
        }
        center_reference(&mut raw, &phenos.masks, ph);

        let feats = source.features(ph).unwrap();
        for i in 0..n {
            for j in 0..cfg.lambda.len() {
                assert!(
                    (feats[(i, j)] - raw[(i, j)]).abs() < 1e-8,
                    "pheno {ph} sample {i} lambda {j}: {} vs {}",
                    feats[(i, j)],
                    raw[(i, j)]
                );
            }
        }
    }
}

#[test]
fn two_fold_single_marker_scenario_matches_hand_computation() {
    let g = [0.5, -1.0, 1.5, 2.0];
    let y = [0.2, -0.1, 0.3, -0.4];
    let lambdas = [0.1, 10.0];

    let block = GenotypeBlock::new(
        Array2::from_shape_vec((1, 4), g.to_vec()).unwrap(),
        vec!["rs0".into()],
    )
    .unwrap();
    let ymat = Array2::from_shape_vec((4, 1), y.to_vec()).unwrap();
    let phenos =
        PhenotypeData::new(ymat.clone(), ymat, Array2::from_elem((4, 1), true), 0).unwrap();
    let folds = FoldPartition::new(&[2, 2]);
    let cfg = RidgeConfig::with_grids(lambdas.to_vec(), vec![1.0]);

    let source = run_level0_kfold(&block, &phenos, &folds, &cfg);
    let feats = source.features(0).unwrap();

    for (j, &lambda) in lambdas.iter().enumerate() {
        // fold 0 held out: fit on samples {2, 3}
        let beta0 = (g[2] * y[2] + g[3] * y[3]) / (g[2] * g[2] + g[3] * g[3] + lambda);
        // fold 1 held out: fit on samples {0, 1}
        let beta1 = (g[0] * y[0] + g[1] * y[1]) / (g[0] * g[0] + g[1] * g[1] + lambda);
        let raw = [beta0 * g[0], beta0 * g[1], beta1 * g[2], beta1 * g[3]];

        let mean = raw.iter().sum::<f64>() / 4.0;
        let sum2 = raw.iter().map(|v| v * v).sum::<f64>();
        let inv_sd = (3.0 / (sum2 - 4.0 * mean * mean)).sqrt();
        for i in 0..4 {
            let expected = (raw[i] - mean) * inv_sd;
            assert!(
                (feats[(i, j)] - expected).abs() < 1e-10,
                "sample {i} lambda {lambda}: {} vs {expected}",
                feats[(i, j)]
            );
        }
    }
}

#[test]
fn loocv_closed_form_matches_brute_force_refits() {
    let mut rng = StdRng::seed_from_u64(23);
    let (n, bs) = (8usize, 3usize);
    let block = random_block(n, bs, &mut rng);
    let phenos = random_phenos(n, 1, &mut rng);
    let cfg = RidgeConfig::with_grids(vec![1.0, 3.0], vec![1.0]);

    let xprod = Level0CrossProducts::whole_sample(&block, &phenos).unwrap();
    let mut sink = Level0Sink::in_memory(1, n, cfg.lambda.len());
    ridge_level_0_loocv(0, &block, &xprod, &phenos, &cfg, &mut sink).unwrap();
    let source = sink.into_source().unwrap();
    let feats = source.features(0).unwrap();

    // brute force: drop sample i, refit, predict sample i
    let mut raw = Array2::zeros((n, cfg.lambda.len()));
    for i in 0..n {
        for (j, &lambda) in cfg.lambda.iter().enumerate() {
            let mut gram = Array2::<f64>::zeros((bs, bs));
            let mut rhs = Array1::<f64>::zeros(bs);
            for k in 0..n {
                if k == i {
                    continue;
                }
                let gk = block.genotypes.column(k);
                for a in 0..bs {
                    for b in 0..bs {
                        gram[(a, b)] += gk[a] * gk[b];
                    }
                    rhs[a] += gk[a] * phenos.phenotypes[(k, 0)];
                }
            }
            for d in 0..bs {
                gram[(d, d)] += lambda;
            }
            let beta = gram.solve(&rhs).unwrap();
            raw[(i, j)] = beta.dot(&block.genotypes.column(i));
        }
    }
    center_reference(&mut raw, &phenos.masks, 0);

    for i in 0..n {
        for j in 0..cfg.lambda.len() {
            assert!(
                (feats[(i, j)] - raw[(i, j)]).abs() < 1e-8,
                "sample {i} lambda {j}: {} vs {}",
                feats[(i, j)],
                raw[(i, j)]
            );
        }
    }
}

#[test]
fn centered_features_have_zero_mean_and_unit_variance_over_masked_samples() {
    let mut rng = StdRng::seed_from_u64(37);
    let (n, bs, p) = (40usize, 5usize, 2usize);
    let block = random_block(n, bs, &mut rng);
    let y = Array2::from_shape_fn((n, p), |_| rng.gen_range(-1.5..1.5));
    let mut masks = Array2::from_elem((n, p), true);
    for i in (0..n).step_by(7) {
        masks[(i, 0)] = false;
    }
    let mut yz = y.clone();
    for ((i, j), m) in masks.indexed_iter() {
        if !m {
            yz[(i, j)] = 0.0;
        }
    }
    let phenos = PhenotypeData::new(yz.clone(), yz, masks, 0).unwrap();
    let folds = FoldPartition::new(&[10, 10, 10, 10]);
    let cfg = RidgeConfig::with_grids(vec![0.2, 2.0, 20.0], vec![1.0]);

    let source = run_level0_kfold(&block, &phenos, &folds, &cfg);
    for ph in 0..p {
        let feats = source.features(ph).unwrap();
        let neff = phenos.neff[ph];
        for j in 0..cfg.lambda.len() {
            let col = feats.slice(s![.., j]);
            let sum: f64 = col
                .iter()
                .zip(phenos.masks.column(ph).iter())
                .filter(|&(_, &m)| m)
                .map(|(&v, _)| v)
                .sum();
            let sum2: f64 = col
                .iter()
                .zip(phenos.masks.column(ph).iter())
                .filter(|&(_, &m)| m)
                .map(|(&v, _)| v * v)
                .sum();
            assert!(sum.abs() < 1e-8, "pheno {ph} lambda {j}: column sum {sum}");
            let var = sum2 / (neff - 1.0);
            assert!(
                (var - 1.0).abs() < 1e-8,
                "pheno {ph} lambda {j}: column variance {var}"
            );
        }
    }
}
