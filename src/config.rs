// Run configuration for the analysis core. Parsing lives in `main`; this
// module only holds validated values.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ModelType;

/// Default maximum IRLS iterations per fit.
pub const DEFAULT_MAX_ITERATIONS: usize = 500;
/// Default summed-absolute-change convergence threshold.
pub const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 1e-3;
/// Default minimum contingency-cell count below which a model is skipped.
pub const DEFAULT_CELL_CUTOFF: i64 = 10;
/// Default number of markers bundled into one worker task.
pub const DEFAULT_BATCH_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
    #[error("required input file does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("output directory does not exist: {0}")]
    MissingOutputDirectory(PathBuf),
}

/// Which backend holds the genotype matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    File,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::File => write!(f, "file"),
        }
    }
}

/// Everything the core needs for one run. Built once in `main`, immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Path prefix of the PLINK binary triple (`<base>.bed/.bim/.fam`).
    pub dataset_base: PathBuf,
    pub interaction_file: PathBuf,
    /// Optional list of interaction-marker ids, one per line.
    pub marker_file: Option<PathBuf>,
    /// Optional significance-limit file (`CUTOFF_APP` / `CUTOFF_MULT`).
    pub limit_file: Option<PathBuf>,
    pub output_directory: PathBuf,
    pub permutations: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub cell_cutoff: i64,
    pub model_type: ModelType,
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub seed: u64,
    pub store_backend: StoreBackend,
    /// When false, negative AP values are excluded from permutation
    /// accumulation and the global minimum tracker.
    pub allow_negative_ap: bool,
    /// Write one raw results file per permutation index.
    pub permutation_output: bool,
    /// Write the per-permutation global-minimum table.
    pub total_permutation_output: bool,
}

impl AnalysisConfig {
    /// Fail-fast validation, run before any data is loaded or any task is
    /// scheduled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("workers", self.workers),
            ("queue capacity", self.queue_capacity),
            ("batch size", self.batch_size),
            ("max iterations", self.max_iterations),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        if self.convergence_threshold <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: "convergence threshold",
            });
        }
        let bed = self.dataset_base.with_extension("bed");
        for path in [
            &bed,
            &self.dataset_base.with_extension("bim"),
            &self.dataset_base.with_extension("fam"),
            &self.interaction_file,
        ] {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.clone()));
            }
        }
        for path in [&self.marker_file, &self.limit_file].into_iter().flatten() {
            if !path.is_file() {
                return Err(ConfigError::MissingFile(path.clone()));
            }
        }
        if !self.output_directory.is_dir() {
            return Err(ConfigError::MissingOutputDirectory(
                self.output_directory.clone(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> AnalysisConfig {
        AnalysisConfig {
            dataset_base: dir.join("panel"),
            interaction_file: dir.join("interaction.txt"),
            marker_file: None,
            limit_file: None,
            output_directory: dir.to_path_buf(),
            permutations: 0,
            workers: 2,
            queue_capacity: 8,
            batch_size: DEFAULT_BATCH_SIZE,
            cell_cutoff: DEFAULT_CELL_CUTOFF,
            model_type: ModelType::Dominant,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            convergence_threshold: DEFAULT_CONVERGENCE_THRESHOLD,
            seed: 1,
            store_backend: StoreBackend::Memory,
            allow_negative_ap: true,
            permutation_output: false,
            total_permutation_output: false,
        }
    }

    #[test]
    fn validation_requires_input_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingFile(_))
        ));
    }

    #[test]
    fn validation_rejects_zero_sized_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NotPositive { name: "workers" })
        ));
    }
}
