//! # Cluster and Tile Data Store
//!
//! A tile is the batch of clusters the model is fitted over. Each cluster carries a
//! 4 × ncycle matrix of raw intensities (channels by rows, cycles by columns). The
//! store is built once from the input and is read-only afterwards; every pass of the
//! estimator sweeps it in order and only ever works on copies of the signal matrices.

use crate::nucleotide::NBASE;
use ndarray::{Array2, Axis, concatenate};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TileError {
    #[error("Cluster {index} has a signal matrix of {rows}x{cols}, but the tile requires 4x{ncycle}.")]
    InconsistentCluster {
        index: usize,
        rows: usize,
        cols: usize,
        ncycle: usize,
    },

    #[error("Cycle range {start}..{end} lies outside the {ncycle} cycles of the tile.")]
    CycleRangeOutOfBounds { start: usize, end: usize, ncycle: usize },

    #[error("A tile needs at least one cycle.")]
    NoCycles,
}

/// One sequenced read.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub x: u32,
    pub y: u32,
    /// Raw intensities, shape `[NBASE, ncycle]`.
    pub signals: Array2<f64>,
}

impl Cluster {
    pub fn new(x: u32, y: u32, signals: Array2<f64>) -> Self {
        Self { x, y, signals }
    }

    pub fn ncycle(&self) -> usize {
        self.signals.ncols()
    }
}

/// An ordered collection of clusters sharing one cycle count.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub lane: u32,
    pub tile: u32,
    ncycle: usize,
    clusters: Vec<Cluster>,
}

impl Tile {
    /// Builds a tile, checking that every cluster has a `NBASE × ncycle` signal matrix.
    pub fn new(lane: u32, tile: u32, ncycle: usize, clusters: Vec<Cluster>) -> Result<Self, TileError> {
        if ncycle == 0 {
            return Err(TileError::NoCycles);
        }
        for (index, cluster) in clusters.iter().enumerate() {
            if cluster.signals.dim() != (NBASE, ncycle) {
                return Err(TileError::InconsistentCluster {
                    index,
                    rows: cluster.signals.nrows(),
                    cols: cluster.signals.ncols(),
                    ncycle,
                });
            }
        }
        Ok(Self {
            lane,
            tile,
            ncycle,
            clusters,
        })
    }

    pub fn ncycle(&self) -> usize {
        self.ncycle
    }

    pub fn ncluster(&self) -> usize {
        self.clusters.len()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Builds a sub-tile from the given cycle ranges, concatenated in order.
    ///
    /// This is how a tile is split into independently modelled blocks: every cluster
    /// keeps its coordinates and receives the selected columns of its signal matrix.
    pub fn select_cycles(&self, ranges: &[Range<usize>]) -> Result<Tile, TileError> {
        for range in ranges {
            if range.start >= range.end || range.end > self.ncycle {
                return Err(TileError::CycleRangeOutOfBounds {
                    start: range.start,
                    end: range.end,
                    ncycle: self.ncycle,
                });
            }
        }
        let ncycle: usize = ranges.iter().map(|r| r.len()).sum();
        if ncycle == 0 {
            return Err(TileError::NoCycles);
        }

        let clusters = self
            .clusters
            .iter()
            .map(|cluster| {
                let pieces: Vec<_> = ranges
                    .iter()
                    .map(|r| cluster.signals.slice(ndarray::s![.., r.clone()]))
                    .collect();
                // Shapes were validated above, so concatenation along columns cannot fail.
                let signals = concatenate(Axis(1), &pieces)
                    .unwrap_or_else(|_| Array2::zeros((NBASE, ncycle)));
                Cluster::new(cluster.x, cluster.y, signals)
            })
            .collect();

        Tile::new(self.lane, self.tile, ncycle, clusters)
    }

    /// Returns a copy with every intensity multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Tile {
        let clusters = self
            .clusters
            .iter()
            .map(|c| Cluster::new(c.x, c.y, c.signals.mapv(|v| v * factor)))
            .collect();
        Tile {
            lane: self.lane,
            tile: self.tile,
            ncycle: self.ncycle,
            clusters,
        }
    }
}
