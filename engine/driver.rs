//! # Outer Driver
//!
//! Runs the model over a tile: the tile is split into blocks of cycles, and every
//! block is initialised and then refined by a fixed number of estimate/call
//! iterations. Blocks are independent; a numerical fault in one is reported and the
//! remaining blocks still run.

use crate::blocks::BlockSpec;
use crate::call::{CallError, call_bases};
use crate::config::{ConfigError, InitialMatrices, ModelConfig};
use crate::diagnostics::DiagnosticsSink;
use crate::estimate::{EstimationError, estimate_parameters};
use crate::io::InputError;
use crate::matrix::MatrixError;
use crate::nucleotide::Base;
use crate::state::{ModelState, initialise};
use crate::tile::{Tile, TileError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Failures that abandon a single block.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Could not initialise the model: {0}")]
    Initialisation(#[from] MatrixError),
    #[error("Parameter estimation failed: {0}")]
    Estimation(#[from] EstimationError),
    #[error("Base calling failed: {0}")]
    Call(#[from] CallError),
    #[error("Could not extract the block's cycles: {0}")]
    Tile(#[from] TileError),
    #[error("Failed to read or write parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize parameters to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Failures of a whole run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to write '{path}': {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{failed} of {total} input files could not be called.")]
    Incomplete { failed: usize, total: usize },
}

/// The calls for one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct CalledRead {
    pub x: u32,
    pub y: u32,
    pub bases: Vec<Base>,
    pub qualities: Vec<u8>,
}

/// The fitted model of one block, in the form saved to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedParameters {
    pub crosstalk: Array2<f64>,
    pub phasing: Array2<f64>,
    pub noise: Array2<f64>,
    pub lambda: Array1<f64>,
    pub cycle_var: Array1<f64>,
}

impl From<&ModelState> for FittedParameters {
    fn from(state: &ModelState) -> Self {
        Self {
            crosstalk: state.crosstalk.clone(),
            phasing: state.phasing.clone(),
            noise: state.noise.clone(),
            lambda: state.lambda.clone(),
            cycle_var: state.cycle_var.clone(),
        }
    }
}

impl FittedParameters {
    /// Saves the parameters in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let parameters = toml::from_str(&toml_string)?;
        Ok(parameters)
    }
}

/// The result of modelling one block.
#[derive(Debug, Clone)]
pub struct CalledBlock {
    /// Zero-based position of the block in the block specification.
    pub index: usize,
    pub reads: Vec<CalledRead>,
    pub parameters: FittedParameters,
}

/// Models one block: initialisation followed by `config.iterations` rounds of
/// parameter estimation and base calling.
pub fn run_block(
    tile: &Tile,
    index: usize,
    initial: &InitialMatrices,
    config: &ModelConfig,
    sink: &dyn DiagnosticsSink,
) -> Result<CalledBlock, ModelError> {
    let mut state = initialise(tile, initial)?;

    for iteration in 0..config.iterations {
        let reduction = estimate_parameters(&mut state, tile, config)?;
        log::info!(
            "Block {}, iteration {}: weighted loss reduced by {:.6e}.",
            index + 1,
            iteration + 1,
            reduction
        );
        call_bases(&mut state, tile, config, sink)?;
    }
    sink.matrix("Crosstalk", state.crosstalk.view());
    sink.matrix("Phasing", state.phasing.view());
    sink.matrix("Noise", state.noise.view());

    let parameters = FittedParameters::from(&state);
    let reads = tile
        .clusters()
        .iter()
        .zip(state.bases.into_iter().zip(state.qualities))
        .map(|(cluster, (bases, qualities))| CalledRead {
            x: cluster.x,
            y: cluster.y,
            bases,
            qualities,
        })
        .collect();

    Ok(CalledBlock {
        index,
        reads,
        parameters,
    })
}

/// Splits `tile` into the blocks of `spec` and models each independently.
///
/// One result is returned per block, in specification order. A failed block is
/// logged and leaves an error in its slot; the others are unaffected.
pub fn analyse_tile(
    tile: &Tile,
    spec: &BlockSpec,
    initial: &InitialMatrices,
    config: &ModelConfig,
    sink: &dyn DiagnosticsSink,
) -> Vec<Result<CalledBlock, ModelError>> {
    spec.blocks()
        .into_iter()
        .enumerate()
        .map(|(index, ranges)| {
            let result = tile
                .select_cycles(&ranges)
                .map_err(ModelError::from)
                .and_then(|block| {
                    log::info!(
                        "Block {}: modelling {} clusters over {} cycles.",
                        index + 1,
                        block.ncluster(),
                        block.ncycle()
                    );
                    run_block(&block, index, initial, config, sink)
                });
            if let Err(e) = &result {
                log::error!("Block {} abandoned: {}", index + 1, e);
            }
            result
        })
        .collect()
}
