//! Model-based base calling for sequencing-by-synthesis intensity data.
//!
//! Intensities are modelled as `I = λ·M·S·P + N`: a cluster of brightness `λ`
//! carrying the bases `S` is seen through the crosstalk between dye channels `M`,
//! the phasing between cycles `P`, and additive noise `N`. The crate estimates those
//! distortions over a tile of clusters and calls every base with a quality score.

pub mod blocks;
pub mod call;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod estimate;
pub mod intensity;
pub mod io;
pub mod matrix;
pub mod nucleotide;
pub mod state;
pub mod tile;
