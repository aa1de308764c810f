//! Out-of-core storage for level-0 predictions.
//!
//! When the concatenated level-0 feature matrix does not fit in memory, each
//! phenotype's predictions are appended to a headerless binary file as raw
//! 8-byte native-endian floats in feature-major order: feature column `c`
//! occupies bytes `[c * samples * 8, (c + 1) * samples * 8)`, samples in
//! their fixed analysis order. There is no checksum; correctness relies on
//! the exact size check performed before every read. A failed write, a
//! failed open and a size mismatch are all fatal.
//!
//! Level 0 may also have been run by independent parallel jobs, each
//! contributing a known column range in its own file. [`StorePart`] carries
//! the per-job offset and width the reader needs to reassemble the matrix.

use crate::error::RidgeError;
use ndarray::{s, Array2, ArrayView2, CowArray, Ix2};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Append-only writer for one phenotype's level-0 predictions.
pub struct PredictionWriter {
    out: BufWriter<File>,
    path: PathBuf,
    samples: usize,
    base_col: usize,
    cols_written: usize,
}

impl PredictionWriter {
    /// Creates (truncating) the file. `base_col` is this job's column offset
    /// in the combined feature matrix; a single-job run passes zero.
    pub fn create(
        path: impl AsRef<Path>,
        samples: usize,
        base_col: usize,
    ) -> Result<Self, RidgeError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| RidgeError::StoreWrite {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
            samples,
            base_col,
            cols_written: 0,
        })
    }

    /// Next column index (in combined-matrix coordinates) an append fills.
    pub fn next_col(&self) -> usize {
        self.base_col + self.cols_written
    }

    /// Appends a `samples x k` matrix as `k` feature columns.
    pub fn append(&mut self, preds: ArrayView2<'_, f64>) -> Result<(), RidgeError> {
        if preds.nrows() != self.samples {
            return Err(RidgeError::Dimension(format!(
                "appending {} rows to a store of {} samples",
                preds.nrows(),
                self.samples
            )));
        }
        for col in preds.columns() {
            for &v in col.iter() {
                self.out
                    .write_all(&v.to_ne_bytes())
                    .map_err(|source| RidgeError::StoreWrite {
                        path: self.path.clone(),
                        source,
                    })?;
            }
        }
        self.cols_written += preds.ncols();
        Ok(())
    }

    /// Flushes and closes the file, returning its part descriptor.
    pub fn finish(mut self) -> Result<StorePart, RidgeError> {
        self.out.flush().map_err(|source| RidgeError::StoreWrite {
            path: self.path.clone(),
            source,
        })?;
        Ok(StorePart {
            path: self.path,
            start_col: self.base_col,
            n_cols: self.cols_written,
        })
    }
}

/// One file's contribution to a phenotype's combined feature matrix.
#[derive(Debug, Clone)]
pub struct StorePart {
    pub path: PathBuf,
    /// First combined-matrix column this file holds.
    pub start_col: usize,
    /// Number of feature columns in the file.
    pub n_cols: usize,
}

/// Reads one part into its column range of `dest` after validating that the
/// file size is exactly `samples * n_cols * 8` bytes. The file handle lives
/// only for the duration of this call.
pub fn read_part(part: &StorePart, dest: &mut Array2<f64>) -> Result<(), RidgeError> {
    let samples = dest.nrows();
    let file = File::open(&part.path).map_err(|source| RidgeError::StoreOpen {
        path: part.path.clone(),
        source,
    })?;
    let expected = (samples * part.n_cols * 8) as u64;
    let found = file
        .metadata()
        .map_err(|source| RidgeError::StoreOpen {
            path: part.path.clone(),
            source,
        })?
        .len();
    if found != expected {
        return Err(RidgeError::StoreSizeMismatch {
            path: part.path.clone(),
            found,
            expected,
            samples,
            columns: part.n_cols,
        });
    }
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; samples * 8];
    let mut word = [0u8; 8];
    for c in 0..part.n_cols {
        reader
            .read_exact(&mut buf)
            .map_err(|source| RidgeError::StoreOpen {
                path: part.path.clone(),
                source,
            })?;
        for (i, chunk) in buf.chunks_exact(8).enumerate() {
            word.copy_from_slice(chunk);
            dest[(i, part.start_col + c)] = f64::from_ne_bytes(word);
        }
    }
    Ok(())
}

/// Destination for level-0 deposits: a resident feature matrix per phenotype,
/// or one on-disk file per phenotype.
pub enum Level0Sink {
    Memory { features: Vec<Array2<f64>> },
    Disk { writers: Vec<PredictionWriter> },
}

impl Level0Sink {
    pub fn in_memory(n_pheno: usize, samples: usize, total_cols: usize) -> Self {
        Level0Sink::Memory {
            features: vec![Array2::zeros((samples, total_cols)); n_pheno],
        }
    }

    /// One file per phenotype under `dir`, named `{prefix}_l0_Y{pheno+1}`.
    pub fn on_disk(
        dir: &Path,
        prefix: &str,
        n_pheno: usize,
        samples: usize,
    ) -> Result<Self, RidgeError> {
        let mut writers = Vec::with_capacity(n_pheno);
        for ph in 0..n_pheno {
            let path = dir.join(format!("{prefix}_l0_Y{}", ph + 1));
            writers.push(PredictionWriter::create(path, samples, 0)?);
        }
        Ok(Level0Sink::Disk { writers })
    }

    /// Deposits one block's centered predictions for one phenotype into
    /// columns `[start_col, start_col + k)`. Disk deposits must arrive in
    /// column order; the writer's position is checked against `start_col`.
    pub fn deposit(
        &mut self,
        pheno: usize,
        start_col: usize,
        preds: ArrayView2<'_, f64>,
    ) -> Result<(), RidgeError> {
        match self {
            Level0Sink::Memory { features } => {
                let dest = &mut features[pheno];
                if start_col + preds.ncols() > dest.ncols() || preds.nrows() != dest.nrows() {
                    return Err(RidgeError::Dimension(format!(
                        "deposit of {:?} at column {start_col} into a {:?} feature matrix",
                        preds.dim(),
                        dest.dim()
                    )));
                }
                dest.slice_mut(s![.., start_col..start_col + preds.ncols()])
                    .assign(&preds);
                Ok(())
            }
            Level0Sink::Disk { writers } => {
                let writer = &mut writers[pheno];
                if writer.next_col() != start_col {
                    return Err(RidgeError::Dimension(format!(
                        "out-of-order deposit at column {start_col}, writer is at {}",
                        writer.next_col()
                    )));
                }
                writer.append(preds)
            }
        }
    }

    /// Closes writers and turns the sink into the source level 1 reads from.
    pub fn into_source(self) -> Result<FeatureSource, RidgeError> {
        match self {
            Level0Sink::Memory { features } => Ok(FeatureSource::Memory { features }),
            Level0Sink::Disk { writers } => {
                let mut parts = Vec::with_capacity(writers.len());
                let mut samples = 0;
                let mut total_cols = 0;
                for writer in writers {
                    samples = writer.samples;
                    total_cols = writer.cols_written;
                    parts.push(vec![writer.finish()?]);
                }
                FeatureSource::from_parts(parts, samples, total_cols)
            }
        }
    }
}

/// Where level 1 reads each phenotype's concatenated feature matrix from.
pub enum FeatureSource {
    Memory {
        features: Vec<Array2<f64>>,
    },
    Disk {
        /// Per phenotype, the file parts covering its columns.
        parts: Vec<Vec<StorePart>>,
        samples: usize,
        total_cols: usize,
    },
}

impl FeatureSource {
    /// Assembles a source from externally produced parts (the parallel-job
    /// split path). Each phenotype's parts must cover exactly `total_cols`
    /// columns.
    pub fn from_parts(
        parts: Vec<Vec<StorePart>>,
        samples: usize,
        total_cols: usize,
    ) -> Result<Self, RidgeError> {
        for (ph, pheno_parts) in parts.iter().enumerate() {
            let covered: usize = pheno_parts.iter().map(|p| p.n_cols).sum();
            if covered != total_cols {
                return Err(RidgeError::Dimension(format!(
                    "phenotype {ph} parts cover {covered} columns, expected {total_cols}"
                )));
            }
            for part in pheno_parts {
                if part.start_col + part.n_cols > total_cols {
                    return Err(RidgeError::Dimension(format!(
                        "part {} spans columns {}..{} beyond {total_cols}",
                        part.path.display(),
                        part.start_col,
                        part.start_col + part.n_cols
                    )));
                }
            }
        }
        Ok(FeatureSource::Disk {
            parts,
            samples,
            total_cols,
        })
    }

    pub fn n_phenotypes(&self) -> usize {
        match self {
            FeatureSource::Memory { features } => features.len(),
            FeatureSource::Disk { parts, .. } => parts.len(),
        }
    }

    /// The phenotype's `samples x total_cols` feature matrix: a borrowed
    /// view for the resident variant, a freshly read matrix for the on-disk
    /// variant.
    pub fn features(&self, pheno: usize) -> Result<CowArray<'_, f64, Ix2>, RidgeError> {
        match self {
            FeatureSource::Memory { features } => Ok(CowArray::from(features[pheno].view())),
            FeatureSource::Disk {
                parts,
                samples,
                total_cols,
            } => {
                log::debug!(
                    "reading {} level 0 part file(s) for phenotype {}",
                    parts[pheno].len(),
                    pheno + 1
                );
                let mut dest = Array2::zeros((*samples, *total_cols));
                for part in &parts[pheno] {
                    read_part(part, &mut dest)?;
                }
                Ok(CowArray::from(dest))
            }
        }
    }
}
