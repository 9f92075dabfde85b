//! Block layout of a facility.

use std::fmt;
use std::str::FromStr;

use super::slot::{BlockId, SlotId};

/// Default facility: ten blocks, 238 slots.
const DEFAULT_BLOCKS: [(char, u32); 10] = [
    ('A', 20),
    ('B', 24),
    ('C', 24),
    ('D', 26),
    ('E', 26),
    ('F', 24),
    ('G', 24),
    ('H', 18),
    ('I', 20),
    ('J', 12),
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("layout has no blocks")]
    Empty,
    #[error("invalid block letter: {0:?}")]
    InvalidBlock(String),
    #[error("malformed layout entry: {0:?} (expected BLOCK:CAPACITY)")]
    Malformed(String),
    #[error("block {0} has zero capacity")]
    ZeroCapacity(BlockId),
    #[error("block {0} declared more than once")]
    Duplicate(BlockId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub block: BlockId,
    pub capacity: u32,
}

/// Ordered list of blocks. Declaration order is the allocation scan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotLayout {
    blocks: Vec<BlockSpec>,
}

impl LotLayout {
    pub fn new(blocks: Vec<BlockSpec>) -> Result<Self, LayoutError> {
        if blocks.is_empty() {
            return Err(LayoutError::Empty);
        }
        for (i, spec) in blocks.iter().enumerate() {
            if spec.capacity == 0 {
                return Err(LayoutError::ZeroCapacity(spec.block));
            }
            if blocks[..i].iter().any(|b| b.block == spec.block) {
                return Err(LayoutError::Duplicate(spec.block));
            }
        }
        Ok(Self { blocks })
    }

    /// Layout from an optional `A:20,B:24` setting. Unset or blank selects
    /// the default lot.
    pub fn from_setting(setting: Option<&str>) -> Result<Self, LayoutError> {
        match setting {
            Some(text) if !text.trim().is_empty() => text.parse(),
            _ => Ok(Self::default()),
        }
    }

    pub fn blocks(&self) -> &[BlockSpec] {
        &self.blocks
    }

    pub fn capacity_of(&self, block: BlockId) -> Option<u32> {
        self.blocks
            .iter()
            .find(|b| b.block == block)
            .map(|b| b.capacity)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.capacity_of(id.block)
            .is_some_and(|cap| (1..=cap).contains(&id.number))
    }

    pub fn total_slots(&self) -> usize {
        self.blocks.iter().map(|b| b.capacity as usize).sum()
    }

    /// All slot ids in scan order.
    pub fn slot_ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| (1..=b.capacity).map(move |n| SlotId::new(b.block, n)))
    }
}

impl Default for LotLayout {
    fn default() -> Self {
        let blocks = DEFAULT_BLOCKS
            .iter()
            .filter_map(|&(letter, capacity)| {
                let block = BlockId::new(letter).ok()?;
                Some(BlockSpec { block, capacity })
            })
            .collect();
        Self { blocks }
    }
}

impl FromStr for LotLayout {
    type Err = LayoutError;

    /// Parse `"A:20,B:24"`. Whitespace around entries is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut blocks = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (letter, capacity) = entry
                .split_once(':')
                .ok_or_else(|| LayoutError::Malformed(entry.to_string()))?;
            let block: BlockId = letter.trim().parse()?;
            let capacity = capacity
                .trim()
                .parse::<u32>()
                .map_err(|_| LayoutError::Malformed(entry.to_string()))?;
            blocks.push(BlockSpec { block, capacity });
        }
        Self::new(blocks)
    }
}

impl fmt::Display for LotLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, spec) in self.blocks.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", spec.block, spec.capacity)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_has_238_slots() {
        let layout = LotLayout::default();
        assert_eq!(layout.blocks().len(), 10);
        assert_eq!(layout.total_slots(), 238);
        assert_eq!(layout.to_string(), "A:20,B:24,C:24,D:26,E:26,F:24,G:24,H:18,I:20,J:12");
    }

    #[test]
    fn parse_keeps_declaration_order() {
        let layout: LotLayout = " C:2 , A:1 ".parse().unwrap();
        let ids: Vec<String> = layout.slot_ids().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["C1", "C2", "A1"]);
    }

    #[test]
    fn contains_checks_block_and_range() {
        let layout = LotLayout::default();
        let a = BlockId::new('A').unwrap();
        let j = BlockId::new('J').unwrap();
        let z = BlockId::new('Z').unwrap();
        assert!(layout.contains(SlotId::new(a, 1)));
        assert!(layout.contains(SlotId::new(a, 20)));
        assert!(!layout.contains(SlotId::new(a, 0)));
        assert!(!layout.contains(SlotId::new(a, 21)));
        assert!(!layout.contains(SlotId::new(j, 13)));
        assert!(!layout.contains(SlotId::new(z, 1)));
    }

    #[test]
    fn parse_errors() {
        assert_eq!("".parse::<LotLayout>(), Err(LayoutError::Empty));
        assert_eq!(
            "A20".parse::<LotLayout>(),
            Err(LayoutError::Malformed("A20".to_string()))
        );
        assert_eq!(
            "A:x".parse::<LotLayout>(),
            Err(LayoutError::Malformed("A:x".to_string()))
        );
        assert_eq!(
            "a:3".parse::<LotLayout>(),
            Err(LayoutError::InvalidBlock("a".to_string()))
        );
        assert!(matches!(
            "A:0".parse::<LotLayout>(),
            Err(LayoutError::ZeroCapacity(_))
        ));
        assert!(matches!(
            "A:1,B:2,A:3".parse::<LotLayout>(),
            Err(LayoutError::Duplicate(_))
        ));
    }

    #[test]
    fn setting_falls_back_to_default_when_unset_or_blank() {
        assert_eq!(LotLayout::from_setting(None), Ok(LotLayout::default()));
        assert_eq!(LotLayout::from_setting(Some("  ")), Ok(LotLayout::default()));
        assert_eq!(
            LotLayout::from_setting(Some("A:2,B:1")).map(|l| l.total_slots()),
            Ok(3)
        );
        assert!(LotLayout::from_setting(Some("A:0")).is_err());
    }
}
