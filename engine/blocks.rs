//! Block specification strings.
//!
//! A tile's cycles can be split into blocks that are modelled independently. The
//! specification is a sequence of `<letter><count>` tokens read left to right, each
//! consuming `count` consecutive cycles:
//!
//! * `R` starts a new block with those cycles,
//! * `C` appends them to the current block,
//! * `I` skips them.
//!
//! For example `R50I2C25R30` models cycles 1–50 and 53–77 together as the first block
//! and cycles 78–107 as the second. An absent or empty specification means a single
//! block holding every cycle of the tile.

use crate::config::ConfigError;
use std::ops::Range;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Concat,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    tokens: Vec<(BlockOp, usize)>,
}

/// The cycle ranges of one block, in order.
pub type Block = Vec<Range<usize>>;

impl FromStr for BlockSpec {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidBlockSpec {
            spec: spec.to_string(),
            reason,
        };

        let mut tokens = Vec::new();
        let mut total: usize = 0;
        let mut chars = spec.trim().chars().peekable();
        while let Some(letter) = chars.next() {
            let op = match letter.to_ascii_uppercase() {
                'R' => BlockOp::Read,
                'C' => BlockOp::Concat,
                'I' => BlockOp::Ignore,
                other => return Err(invalid(format!("unknown block type '{other}'"))),
            };
            let mut digits = String::new();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                digits.push(d);
                chars.next();
            }
            if digits.is_empty() {
                return Err(invalid(format!("'{letter}' is not followed by a cycle count")));
            }
            let count: usize = digits
                .parse()
                .map_err(|_| invalid(format!("cycle count '{digits}' is out of range")))?;
            if count == 0 {
                return Err(invalid(format!("'{letter}0' covers no cycles")));
            }
            total = total
                .checked_add(count)
                .ok_or_else(|| invalid("cycle counts overflow".to_string()))?;
            tokens.push((op, count));
        }

        let parsed = BlockSpec { tokens };
        if parsed.blocks().is_empty() {
            return Err(ConfigError::NoBlocks(spec.to_string()));
        }
        Ok(parsed)
    }
}

impl BlockSpec {
    /// A specification that models `ncycle` cycles as one block.
    pub fn single(ncycle: usize) -> Self {
        BlockSpec {
            tokens: vec![(BlockOp::Read, ncycle)],
        }
    }

    /// Cycles consumed by the specification, ignored ones included. The input must
    /// supply at least this many. Parsing guarantees the sum fits in `usize`.
    pub fn total_cycles(&self) -> usize {
        self.tokens.iter().map(|(_, count)| count).sum()
    }

    pub fn blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        let mut start = 0;
        for &(op, count) in &self.tokens {
            let range = start..start + count;
            start += count;
            match op {
                BlockOp::Read => blocks.push(vec![range]),
                BlockOp::Concat => match blocks.last_mut() {
                    Some(current) => match current.last_mut() {
                        Some(last) if last.end == range.start => last.end = range.end,
                        _ => current.push(range),
                    },
                    None => blocks.push(vec![range]),
                },
                BlockOp::Ignore => {}
            }
        }
        blocks
    }
}

/// Parses an optional specification string. An absent or blank string yields
/// `None`, leaving the caller to model every cycle of the tile as one block.
pub fn parse_optional(spec: Option<&str>) -> Result<Option<BlockSpec>, ConfigError> {
    match spec.map(str::trim) {
        Some(s) if !s.is_empty() => s.parse().map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_ignore_concat_sequence() {
        let spec: BlockSpec = "R50I2C25R30".parse().unwrap();
        assert_eq!(spec.total_cycles(), 107);
        assert_eq!(spec.blocks(), vec![vec![0..50, 52..77], vec![77..107]]);
    }

    #[test]
    fn adjacent_concatenation_merges_ranges() {
        let spec: BlockSpec = "r10c5".parse().unwrap();
        assert_eq!(spec.blocks(), vec![vec![0..15]]);
    }

    #[test]
    fn leading_ignore_and_concat_open_a_block() {
        let spec: BlockSpec = "I3C4R2".parse().unwrap();
        assert_eq!(spec.blocks(), vec![vec![3..7], vec![7..9]]);
    }

    #[test]
    fn malformed_strings_are_rejected() {
        for bad in [
            "X10",
            "R",
            "R10Q",
            "R0",
            "R99999999999999999999999",
            "R18446744073709551615R1",
        ] {
            assert!(
                matches!(bad.parse::<BlockSpec>(), Err(ConfigError::InvalidBlockSpec { .. })),
                "'{bad}' should be rejected"
            );
        }
        assert!(matches!("I20".parse::<BlockSpec>(), Err(ConfigError::NoBlocks(_))));
    }

    #[test]
    fn absent_specification_is_one_block() {
        assert_eq!(parse_optional(None).unwrap(), None);
        assert_eq!(parse_optional(Some("  ")).unwrap(), None);
        assert_eq!(BlockSpec::single(36).blocks(), vec![vec![0..36]]);
        let spec = parse_optional(Some("R4R4")).unwrap().unwrap();
        assert_eq!(spec.blocks().len(), 2);
        assert_eq!(spec.total_cycles(), 8);
    }
}
