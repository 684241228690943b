#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, ValueEnum};
use phasecall::blocks::{self, BlockSpec};
use phasecall::config::{ConfigError, InitialMatrices, ModelConfig};
use phasecall::diagnostics::{DiagnosticsSink, LogDiagnostics, NoDiagnostics};
use phasecall::driver::{CalledBlock, RunError, analyse_tile};
use phasecall::io::{self, InputError};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "phasecall",
    version,
    about = "Model-based base calling for Illumina intensity files",
    long_about = "Estimates crosstalk, phasing and noise over each tile of clusters and calls \
every base with a Phred quality. Each input is an Illumina intensity file, optionally \
gzipped, and one FASTA or FASTQ file is written per block of cycles."
)]
pub struct Cli {
    /// Intensity files to call
    #[arg(value_name = "INT_TXT", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Run configuration in TOML; command-line options override its values
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Block specification such as R50I2C25: R reads, C concatenates, I ignores cycles
    #[arg(short = 'b', long = "blockstring", value_name = "SPEC")]
    pub blockstring: Option<String>,

    /// Number of estimate/call iterations per block
    #[arg(short = 'n', long = "niter", value_name = "N")]
    pub iterations: Option<usize>,

    /// Output format: fasta or fastq
    #[arg(short = 'f', long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Prior weight given to the no-signal branch of the base posterior
    #[arg(short = 'm', long, value_name = "MU")]
    pub mu: Option<f64>,

    /// Expected GC fraction of the genome, used to weight base calls
    #[arg(short = 'c', long, value_name = "GC")]
    pub composition: Option<f64>,

    /// Initial crosstalk matrix (4x4 text file)
    #[arg(short = 'M', long, value_name = "FILE")]
    pub crosstalk: Option<PathBuf>,

    /// Initial noise matrix (4 x ncycle text file)
    #[arg(short = 'N', long, value_name = "FILE")]
    pub noise: Option<PathBuf>,

    /// Initial phasing matrix (ncycle x ncycle text file)
    #[arg(short = 'P', long, value_name = "FILE")]
    pub phasing: Option<PathBuf>,

    /// Directory receiving the called sequences
    #[arg(short = 'o', long = "output", value_name = "DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Also write the fitted parameters of every block next to its sequences
    #[arg(long)]
    pub save_parameters: bool,

    /// Report intermediate matrices through the log (debug and trace levels)
    #[arg(short = 'w', long)]
    pub working: bool,

    /// Log level; when absent RUST_LOG is honoured, falling back to info
    #[arg(short = 'l', long, value_enum, value_name = "LEVEL")]
    pub loglevel: Option<LogLevel>,

    /// Write the log to this file instead of standard error
    #[arg(short = 'e', long, value_name = "FILE")]
    pub logfile: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.loglevel, cli.logfile.as_deref()) {
        eprintln!("Error: cannot open log file: {e}");
        process::exit(1);
    }

    if let Err(e) = run(&cli) {
        log::error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(level: Option<LogLevel>, logfile: Option<&Path>) -> std::io::Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level.into());
    }
    if let Some(path) = logfile {
        let file = File::create(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Merges the configuration file, if any, with the command-line overrides.
fn build_config(cli: &Cli) -> Result<ModelConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }
    if let Some(format) = &cli.format {
        config.output_format = format.parse()?;
    }
    if let Some(mu) = cli.mu {
        config.mu = mu;
    }
    if cli.composition.is_some() {
        config.composition = cli.composition;
    }
    if cli.blockstring.is_some() {
        config.blocks = cli.blockstring.clone();
    }
    config.validate()?;
    Ok(config)
}

fn load_initial_matrices(cli: &Cli) -> Result<InitialMatrices, InputError> {
    let read = |path: &Option<PathBuf>| path.as_deref().map(io::read_matrix_file).transpose();
    Ok(InitialMatrices {
        crosstalk: read(&cli.crosstalk)?,
        noise: read(&cli.noise)?,
        phasing: read(&cli.phasing)?,
    })
}

fn run(cli: &Cli) -> Result<(), RunError> {
    let config = build_config(cli)?;
    let initial = load_initial_matrices(cli)?;
    let spec = blocks::parse_optional(config.blocks.as_deref())?;
    let sink: Box<dyn DiagnosticsSink> = if cli.working {
        Box::new(LogDiagnostics)
    } else {
        Box::new(NoDiagnostics)
    };

    fs::create_dir_all(&cli.output_dir).map_err(|source| RunError::Output {
        path: cli.output_dir.display().to_string(),
        source,
    })?;

    let mut failed = 0;
    for input in &cli.inputs {
        let outcome = call_file(
            input,
            spec.as_ref(),
            &initial,
            &config,
            &cli.output_dir,
            cli.save_parameters,
            sink.as_ref(),
        );
        match outcome {
            Ok(written) => log::info!("'{}': wrote {} block(s).", input.display(), written),
            Err(e) => {
                log::error!("Skipping '{}': {}", input.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(RunError::Incomplete {
            failed,
            total: cli.inputs.len(),
        });
    }
    Ok(())
}

/// Calls one intensity file and writes every block that modelled successfully.
/// Returns the number of blocks written.
fn call_file(
    input: &Path,
    spec: Option<&BlockSpec>,
    initial: &InitialMatrices,
    config: &ModelConfig,
    output_dir: &Path,
    save_parameters: bool,
    sink: &dyn DiagnosticsSink,
) -> Result<usize, RunError> {
    let tile = io::read_tile_file(input, spec.map(BlockSpec::total_cycles))?;
    let spec = spec.cloned().unwrap_or_else(|| BlockSpec::single(tile.ncycle()));
    log::info!(
        "Lane {} tile {}: {} clusters, {} cycles.",
        tile.lane,
        tile.tile,
        tile.ncluster(),
        tile.ncycle()
    );

    let results = analyse_tile(&tile, &spec, initial, config, sink);
    let multiple = results.len() > 1;
    let input_name = input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut written = 0;
    for block in results.into_iter().flatten() {
        let name = io::output_name(&input_name, "seq", multiple.then_some(block.index));
        let path = output_dir.join(name);
        write_block(&path, &block, config)?;
        if save_parameters {
            block.parameters.save(&path.with_extension("params.toml"))?;
        }
        written += 1;
    }
    Ok(written)
}

fn write_block(path: &Path, block: &CalledBlock, config: &ModelConfig) -> Result<(), RunError> {
    let output_error = |source: std::io::Error| RunError::Output {
        path: path.display().to_string(),
        source,
    };
    let file = File::create(path).map_err(output_error)?;
    let mut out = BufWriter::new(file);
    io::write_calls(&mut out, &block.reads, config.output_format).map_err(output_error)?;
    out.flush().map_err(output_error)?;
    log::info!(
        "Wrote {} reads for block {} to '{}' as {}.",
        block.reads.len(),
        block.index + 1,
        path.display(),
        config.output_format
    );
    Ok(())
}
