//! # Run Configuration
//!
//! `ModelConfig` holds every tunable of a run: the number of outer iterations, the
//! number of alternating rounds inside one estimator pass, the determinant tolerance,
//! the quality-spread constant `Mu`, an optional genome composition and the output
//! format. It can be read from a TOML file and is always checked by
//! [`ModelConfig::validate`] before any modelling starts.
//!
//! The module also owns the distortion-matrix cache, `InitialMatrices`: externally
//! supplied starting values for `M`, `N` and `P`, read once and shared read-only by
//! every block of every tile.

use crate::matrix::{self, MatrixError, ensure_shape};
use crate::nucleotide::NBASE;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Starting crosstalk matrix used when none is supplied, `M[channel, base]`.
pub const INITIAL_CROSSTALK: [[f64; NBASE]; NBASE] = [
    [2.0114300, 0.6919319, 0.2735545, 0.2896459],
    [1.7217841, 1.8022413, 0.2252802, 0.2413716],
    [0.06436576, 0.06436576, 1.39995531, 0.11264008],
    [0.1126401, 0.0804572, 0.9976693, 1.3194981],
];

pub const DEFAULT_ITERATIONS: usize = 5;
pub const DEFAULT_ESTIMATOR_ROUNDS: usize = 20;
pub const DEFAULT_MU: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("The number of iterations must be at least 1.")]
    ZeroIterations,

    #[error("The number of estimator rounds must be at least 1.")]
    ZeroEstimatorRounds,

    #[error("Mu must be a positive value; '{0}' supplied.")]
    NonPositiveMu(f64),

    #[error("Determinant tolerance must be positive and finite; '{0}' supplied.")]
    InvalidTolerance(f64),

    #[error("Invalid genome composition: GC fraction '{0}' must lie strictly between 0 and 1.")]
    InvalidComposition(f64),

    #[error("Unknown output format '{0}'; expected 'fasta' or 'fastq'.")]
    UnknownOutputFormat(String),

    #[error("Invalid block specification '{spec}': {reason}")]
    InvalidBlockSpec { spec: String, reason: String },

    #[error("Block specification '{0}' does not select any cycles to model.")]
    NoBlocks(String),

    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Format of the called sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Fasta,
    Fastq,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fasta" => Ok(OutputFormat::Fasta),
            "fastq" => Ok(OutputFormat::Fastq),
            _ => Err(ConfigError::UnknownOutputFormat(s.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Fasta => write!(f, "fasta"),
            OutputFormat::Fastq => write!(f, "fastq"),
        }
    }
}

/// Tunables of a run. Every field has a default, so a TOML file only needs to name
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Outer estimate/call iterations per block.
    pub iterations: usize,
    /// Alternating P/M rounds within one estimator pass.
    pub estimator_rounds: usize,
    pub determinant_tolerance: f64,
    /// Controls the spread of quality scores.
    pub mu: f64,
    /// Proportion of G and C in the sequenced genome; uniform when absent.
    pub composition: Option<f64>,
    pub output_format: OutputFormat,
    /// Block specification string, see [`crate::blocks`].
    pub blocks: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            estimator_rounds: DEFAULT_ESTIMATOR_ROUNDS,
            determinant_tolerance: matrix::DEFAULT_DETERMINANT_TOLERANCE,
            mu: DEFAULT_MU,
            composition: None,
            output_format: OutputFormat::Fasta,
            blocks: None,
        }
    }
}

impl ModelConfig {
    /// Reads a configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.estimator_rounds == 0 {
            return Err(ConfigError::ZeroEstimatorRounds);
        }
        if !(self.mu > 0.0 && self.mu.is_finite()) {
            return Err(ConfigError::NonPositiveMu(self.mu));
        }
        if !(self.determinant_tolerance > 0.0 && self.determinant_tolerance.is_finite()) {
            return Err(ConfigError::InvalidTolerance(self.determinant_tolerance));
        }
        if let Some(gc) = self.composition {
            if !(gc > 0.0 && gc < 1.0) {
                return Err(ConfigError::InvalidComposition(gc));
            }
        }
        Ok(())
    }

    /// Per-base prior frequencies, ordered A, C, G, T.
    pub fn base_frequencies(&self) -> [f64; NBASE] {
        match self.composition {
            Some(gc) => {
                let at = (1.0 - gc) / 2.0;
                let cg = gc / 2.0;
                [at, cg, cg, at]
            }
            None => [0.25; NBASE],
        }
    }

    /// Prior penalty added to each base's call statistic, `-2 ln(4 · freq)`.
    /// A uniform composition gives zero penalties.
    pub fn penalties(&self) -> [f64; NBASE] {
        self.base_frequencies().map(|freq| -2.0 * (4.0 * freq).ln())
    }
}

/// Externally supplied starting values for the distortion matrices.
#[derive(Debug, Clone, Default)]
pub struct InitialMatrices {
    pub crosstalk: Option<Array2<f64>>,
    pub noise: Option<Array2<f64>>,
    pub phasing: Option<Array2<f64>>,
}

/// Starting `M`, `N` and `P` for one block.
#[derive(Debug, Clone)]
pub struct BlockMatrices {
    pub crosstalk: Array2<f64>,
    pub noise: Array2<f64>,
    pub phasing: Array2<f64>,
}

/// The default crosstalk matrix as an array.
pub fn default_crosstalk() -> Array2<f64> {
    Array2::from_shape_fn((NBASE, NBASE), |(ch, base)| INITIAL_CROSSTALK[ch][base])
}

impl InitialMatrices {
    /// Produces starting matrices for a block of `ncycle` cycles, falling back to the
    /// default crosstalk, zero noise and identity phasing where nothing was supplied.
    /// A supplied matrix whose dimensions do not fit the block is an error.
    pub fn for_block(&self, ncycle: usize) -> Result<BlockMatrices, MatrixError> {
        let crosstalk = match &self.crosstalk {
            Some(m) => {
                ensure_shape(m, NBASE, NBASE, "supplied crosstalk matrix")?;
                m.clone()
            }
            None => default_crosstalk(),
        };
        let noise = match &self.noise {
            Some(n) => {
                ensure_shape(n, NBASE, ncycle, "supplied noise matrix")?;
                n.clone()
            }
            None => matrix::zeros(NBASE, ncycle),
        };
        let phasing = match &self.phasing {
            Some(p) => {
                ensure_shape(p, ncycle, ncycle, "supplied phasing matrix")?;
                p.clone()
            }
            None => matrix::identity(ncycle),
        };
        Ok(BlockMatrices {
            crosstalk,
            noise,
            phasing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.iterations, 5);
        assert_eq!(config.estimator_rounds, 20);
        assert_eq!(config.penalties(), [0.0; NBASE]);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_iterations = ModelConfig {
            iterations: 0,
            ..Default::default()
        };
        assert!(matches!(zero_iterations.validate(), Err(ConfigError::ZeroIterations)));

        let negative_mu = ModelConfig {
            mu: -1.0,
            ..Default::default()
        };
        assert!(matches!(negative_mu.validate(), Err(ConfigError::NonPositiveMu(_))));

        let bad_composition = ModelConfig {
            composition: Some(1.0),
            ..Default::default()
        };
        assert!(matches!(
            bad_composition.validate(),
            Err(ConfigError::InvalidComposition(_))
        ));
    }

    #[test]
    fn gc_rich_composition_favours_c_and_g() {
        let config = ModelConfig {
            composition: Some(0.6),
            ..Default::default()
        };
        let penalties = config.penalties();
        assert!(penalties[1] < 0.0 && penalties[2] < 0.0);
        assert!(penalties[0] > 0.0 && penalties[3] > 0.0);
        assert_abs_diff_eq!(penalties[1], -2.0 * 1.2_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn output_format_parses_case_insensitively() {
        assert_eq!("FASTQ".parse::<OutputFormat>().unwrap(), OutputFormat::Fastq);
        assert_eq!("fasta".parse::<OutputFormat>().unwrap(), OutputFormat::Fasta);
        assert!(matches!(
            "sam".parse::<OutputFormat>(),
            Err(ConfigError::UnknownOutputFormat(_))
        ));
        for format in [OutputFormat::Fasta, OutputFormat::Fastq] {
            assert_eq!(format.to_string().parse::<OutputFormat>().unwrap(), format);
        }
    }

    #[test]
    fn load_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "iterations = 3\nmu = 1e-4\noutput_format = \"fastq\"").unwrap();
        let config = ModelConfig::load(file.path()).unwrap();
        assert_eq!(config.iterations, 3);
        assert_abs_diff_eq!(config.mu, 1e-4);
        assert_eq!(config.output_format, OutputFormat::Fastq);
        assert_eq!(config.estimator_rounds, DEFAULT_ESTIMATOR_ROUNDS);
    }

    #[test]
    fn load_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "iteratons = 3").unwrap();
        assert!(matches!(
            ModelConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn initial_matrices_fall_back_to_defaults() {
        let block = InitialMatrices::default().for_block(6).unwrap();
        assert_eq!(block.crosstalk, default_crosstalk());
        assert_eq!(block.crosstalk[[2, 2]], 1.39995531);
        assert_eq!(block.noise.dim(), (NBASE, 6));
        assert_eq!(block.phasing, Array2::eye(6));
    }

    #[test]
    fn initial_matrices_reject_wrong_dimensions() {
        let supplied = InitialMatrices {
            phasing: Some(Array2::eye(5)),
            ..Default::default()
        };
        assert!(supplied.for_block(5).is_ok());
        assert!(matches!(
            supplied.for_block(6),
            Err(MatrixError::DimensionMismatch { .. })
        ));
    }
}
