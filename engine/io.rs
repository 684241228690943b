//! # Input and Output Formats
//!
//! Readers for Illumina `_int.txt` intensity files and plain-text matrices, writers
//! for FASTA and FASTQ, and the rule that derives output names from input names.
//!
//! An `_int.txt` line describes one cluster:
//!
//! ```text
//! lane<TAB>tile<TAB>x<TAB>y<TAB>a c g t<TAB>a c g t<TAB>...
//! ```
//!
//! with one tab-separated field of four whitespace-separated intensities per cycle.
//! Files ending in `.gz` are decompressed on the fly.

use crate::config::OutputFormat;
use crate::driver::CalledRead;
use crate::matrix;
use crate::nucleotide::{NBASE, quality_char};
use crate::tile::{Cluster, Tile, TileError};
use flate2::read::MultiGzDecoder;
use ndarray::Array2;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Separates the tag of a file name from its stem, as in `s_1_0001_int.txt`.
const TAG_DELIMITER: char = '_';
/// Inserted before the tag delimiter to tell blocks apart.
const FIRST_BLOCK_LETTER: u8 = b'a';
const COMPRESSION_SUFFIXES: [&str; 1] = ["gz"];

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("'{path}' contains no clusters.")]
    Empty { path: String },

    #[error("'{path}' line {line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("'{path}' line {line} has {found} cycles, but {required} are required.")]
    InsufficientCycles {
        path: String,
        line: usize,
        found: usize,
        required: usize,
    },

    #[error("Matrix file '{path}' contains no values.")]
    EmptyMatrix { path: String },

    #[error("Matrix file '{path}' is ragged: row {row} has {found} values, expected {expected}.")]
    RaggedMatrix {
        path: String,
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("Matrix file '{path}' cannot be assembled: {source}")]
    Matrix {
        path: String,
        #[source]
        source: matrix::MatrixError,
    },

    #[error("Clusters read from '{path}' do not form a tile: {source}")]
    Tile {
        path: String,
        #[source]
        source: TileError,
    },
}

/// Opens a file for buffered reading, decompressing it when the name ends in `.gz`.
pub fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>, InputError> {
    let file = File::open(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let reader: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    what: &str,
    path: &str,
    line: usize,
) -> Result<T, InputError> {
    let raw = field.ok_or_else(|| InputError::Malformed {
        path: path.to_string(),
        line,
        reason: format!("missing {what}"),
    })?;
    raw.trim().parse().map_err(|_| InputError::Malformed {
        path: path.to_string(),
        line,
        reason: format!("cannot read {what} from '{raw}'"),
    })
}

/// Reads the clusters of one tile, keeping the first `ncycle` cycles of each.
///
/// When `ncycle` is `None` the cycle count of the first cluster is used. Lines with
/// fewer cycles are an error; extra cycles are ignored. Lane and tile numbers are
/// taken from the first cluster. `path` only labels error messages.
pub fn read_tile<R: BufRead>(reader: R, ncycle: Option<usize>, path: &str) -> Result<Tile, InputError> {
    let mut clusters = Vec::new();
    let mut lane_tile = None;
    let mut required = ncycle;

    for (index, line) in reader.lines().enumerate() {
        let lineno = index + 1;
        let line = line.map_err(|source| InputError::Io {
            path: path.to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split('\t');
        let lane: u32 = parse_field(fields.next(), "lane", path, lineno)?;
        let tile: u32 = parse_field(fields.next(), "tile", path, lineno)?;
        let x: u32 = parse_field(fields.next(), "x coordinate", path, lineno)?;
        let y: u32 = parse_field(fields.next(), "y coordinate", path, lineno)?;
        lane_tile.get_or_insert((lane, tile));

        let fields: Vec<&str> = fields.collect();
        let ncycle = *required.get_or_insert(fields.len());
        if fields.len() < ncycle {
            return Err(InputError::InsufficientCycles {
                path: path.to_string(),
                line: lineno,
                found: fields.len(),
                required: ncycle,
            });
        }

        let mut signals = Array2::<f64>::zeros((NBASE, ncycle));
        for (cycle, field) in fields.into_iter().take(ncycle).enumerate() {
            let values: Vec<&str> = field.split_whitespace().collect();
            if values.len() != NBASE {
                return Err(InputError::Malformed {
                    path: path.to_string(),
                    line: lineno,
                    reason: format!(
                        "cycle {} has {} intensities, expected {}",
                        cycle + 1,
                        values.len(),
                        NBASE
                    ),
                });
            }
            for (channel, value) in values.into_iter().enumerate() {
                signals[[channel, cycle]] = parse_field(Some(value), "intensity", path, lineno)?;
            }
        }
        clusters.push(Cluster::new(x, y, signals));
    }

    let (Some((lane, tile)), Some(ncycle)) = (lane_tile, required) else {
        return Err(InputError::Empty {
            path: path.to_string(),
        });
    };
    log::info!("Read {} clusters of {} cycles from '{}'.", clusters.len(), ncycle, path);
    Tile::new(lane, tile, ncycle, clusters).map_err(|source| InputError::Tile {
        path: path.to_string(),
        source,
    })
}

/// Opens and reads an `_int.txt` file, compressed or not.
pub fn read_tile_file(path: &Path, ncycle: Option<usize>) -> Result<Tile, InputError> {
    let reader = open_input(path)?;
    read_tile(reader, ncycle, &path.display().to_string())
}

/// Reads a matrix written one row per line with whitespace-separated values.
/// Blank lines and anything after `#` are ignored.
pub fn read_matrix<R: BufRead>(reader: R, path: &str) -> Result<Array2<f64>, InputError> {
    let mut values = Vec::new();
    let mut ncol = None;
    let mut nrow = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| InputError::Io {
            path: path.to_string(),
            source,
        })?;
        let content = line.split('#').next().unwrap_or("").trim();
        if content.is_empty() {
            continue;
        }
        let row: Vec<f64> = content
            .split_whitespace()
            .map(|v| parse_field(Some(v), "matrix value", path, index + 1))
            .collect::<Result<_, _>>()?;
        let expected = *ncol.get_or_insert(row.len());
        if row.len() != expected {
            return Err(InputError::RaggedMatrix {
                path: path.to_string(),
                row: nrow + 1,
                found: row.len(),
                expected,
            });
        }
        values.extend(row);
        nrow += 1;
    }

    let ncol = ncol.unwrap_or(0);
    if nrow == 0 || ncol == 0 {
        return Err(InputError::EmptyMatrix {
            path: path.to_string(),
        });
    }
    matrix::from_row_slice(nrow, ncol, &values).map_err(|source| InputError::Matrix {
        path: path.to_string(),
        source,
    })
}

pub fn read_matrix_file(path: &Path) -> Result<Array2<f64>, InputError> {
    let reader = open_input(path)?;
    read_matrix(reader, &path.display().to_string())
}

/// Writes called reads as FASTA or FASTQ, naming them `cluster_001`, `cluster_002`, ...
pub fn write_calls<W: Write>(out: &mut W, reads: &[CalledRead], format: OutputFormat) -> io::Result<()> {
    let marker = match format {
        OutputFormat::Fasta => '>',
        OutputFormat::Fastq => '@',
    };
    for (index, read) in reads.iter().enumerate() {
        writeln!(out, "{}cluster_{:03}", marker, index + 1)?;
        let sequence: String = read.bases.iter().map(|b| b.symbol()).collect();
        writeln!(out, "{sequence}")?;
        if format == OutputFormat::Fastq {
            let qualities: String = read.qualities.iter().map(|&q| quality_char(q)).collect();
            writeln!(out, "+")?;
            writeln!(out, "{qualities}")?;
        }
    }
    Ok(())
}

/// Derives an output file name from an input file name.
///
/// The part between the last `_` and the following `.` is replaced by `tag`. When
/// `block` is given, its letter (`a` for the first block) is inserted before the `_`.
/// A trailing compression suffix is dropped. Without a `_` the whole stem is replaced.
///
/// `s_1_0001_int.txt.gz` with tag `seq` and block 1 becomes `s_1_0001b_seq.txt`.
pub fn output_name(input: &str, tag: &str, block: Option<usize>) -> String {
    let (stem, rest) = match input.rfind(TAG_DELIMITER) {
        Some(pos) => (&input[..pos], &input[pos + 1..]),
        None => ("", input),
    };
    let suffix = rest.find('.').map_or("", |dot| &rest[dot..]);

    let mut name = String::with_capacity(input.len() + tag.len() + 1);
    name.push_str(stem);
    if let Some(b) = block {
        name.push(char::from(FIRST_BLOCK_LETTER + (b % 26) as u8));
    }
    if !stem.is_empty() || block.is_some() {
        name.push(TAG_DELIMITER);
    }
    name.push_str(tag);
    name.push_str(suffix);

    for compression in COMPRESSION_SUFFIXES {
        let dotted = format!(".{compression}");
        if name.ends_with(&dotted) {
            name.truncate(name.len() - dotted.len());
        }
    }
    name
}
