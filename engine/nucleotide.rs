//! Nucleotide symbols and Phred quality scores.

use serde::{Deserialize, Serialize};

/// Number of dye channels, equal to the number of unambiguous bases.
pub const NBASE: usize = 4;

/// Lowest quality a call can carry; also the quality of null calls.
pub const MIN_QUALITY: u8 = 0;

/// Highest quality reported. Posteriors indistinguishable from one saturate here.
pub const MAX_QUALITY: u8 = 60;

/// Offset used when rendering a quality as a FASTQ character.
pub const PHRED_OFFSET: u8 = 33;

/// One called position of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Base {
    #[default]
    A,
    C,
    G,
    T,
    /// No usable call for this cycle.
    N,
}

impl Base {
    pub const UNAMBIGUOUS: [Base; NBASE] = [Base::A, Base::C, Base::G, Base::T];

    /// Channel index of an unambiguous base, `None` for `N`.
    #[inline]
    pub fn index(self) -> Option<usize> {
        match self {
            Base::A => Some(0),
            Base::C => Some(1),
            Base::G => Some(2),
            Base::T => Some(3),
            Base::N => None,
        }
    }

    /// Inverse of [`Base::index`]; out-of-range indices map to `N`.
    #[inline]
    pub fn from_index(idx: usize) -> Base {
        Base::UNAMBIGUOUS.get(idx).copied().unwrap_or(Base::N)
    }

    pub fn symbol(self) -> char {
        match self {
            Base::A => 'A',
            Base::C => 'C',
            Base::G => 'G',
            Base::T => 'T',
            Base::N => 'N',
        }
    }
}

/// Maps the posterior probability of a call onto the Phred scale,
/// `-10 log10(1 - p)`, clamped to `[MIN_QUALITY, MAX_QUALITY]`.
pub fn quality_from_probability(probability: f64) -> u8 {
    if !probability.is_finite() || probability <= 0.0 {
        return MIN_QUALITY;
    }
    let error = 1.0 - probability;
    if error <= 0.0 {
        return MAX_QUALITY;
    }
    let phred = (-10.0 * error.log10()).round();
    phred.clamp(f64::from(MIN_QUALITY), f64::from(MAX_QUALITY)) as u8
}

/// Renders a quality as its Phred+33 character.
pub fn quality_char(quality: u8) -> char {
    char::from(quality.min(MAX_QUALITY) + PHRED_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trips_through_from_index() {
        for base in Base::UNAMBIGUOUS {
            assert_eq!(Base::from_index(base.index().unwrap()), base);
        }
        assert_eq!(Base::N.index(), None);
        assert_eq!(Base::from_index(7), Base::N);
    }

    #[test]
    fn quality_is_monotone_in_probability() {
        let probabilities = [0.25, 0.5, 0.9, 0.99, 0.999, 0.99999];
        let qualities: Vec<u8> = probabilities.iter().map(|&p| quality_from_probability(p)).collect();
        assert!(qualities.windows(2).all(|w| w[0] <= w[1]), "{qualities:?}");
        assert_eq!(quality_from_probability(0.9), 10);
        assert_eq!(quality_from_probability(0.999), 30);
    }

    #[test]
    fn quality_saturates_at_the_bounds() {
        assert_eq!(quality_from_probability(1.0), MAX_QUALITY);
        assert_eq!(quality_from_probability(0.0), MIN_QUALITY);
        assert_eq!(quality_from_probability(f64::NAN), MIN_QUALITY);
        assert_eq!(quality_char(MIN_QUALITY), '!');
        assert_eq!(quality_char(40), 'I');
    }
}
