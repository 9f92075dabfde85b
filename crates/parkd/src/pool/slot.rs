//! Slot identity and state.
//!
//! `SlotState` carries the hold inline, so an available slot can never have a
//! holder or a start time and an occupied slot always has both.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LayoutError;

/// Block letter (`A`..`Z`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockId(char);

impl BlockId {
    pub fn new(letter: char) -> Result<Self, LayoutError> {
        if letter.is_ascii_uppercase() {
            Ok(Self(letter))
        } else {
            Err(LayoutError::InvalidBlock(letter.to_string()))
        }
    }

    pub fn letter(&self) -> char {
        self.0
    }
}

impl FromStr for BlockId {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Self::new(c),
            _ => Err(LayoutError::InvalidBlock(s.to_string())),
        }
    }
}

impl TryFrom<String> for BlockId {
    type Error = LayoutError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockId> for String {
    fn from(block: BlockId) -> Self {
        block.0.to_string()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one physical slot. Numbers are 1-based.
///
/// Ordering is block first, then number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub block: BlockId,
    pub number: u32,
}

impl SlotId {
    pub fn new(block: BlockId, number: u32) -> Self {
        Self { block, number }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.block, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Occupied,
    Reserved,
}

impl SlotStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Occupied => "occupied",
            Self::Reserved => "reserved",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque token identifying whoever holds a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HoldToken(String);

impl HoldToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token for callers that did not identify themselves.
    pub fn anonymous() -> Self {
        Self(format!("anon-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HoldToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub holder: HoldToken,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Available,
    Occupied(Hold),
    Reserved(Hold),
}

impl SlotState {
    pub fn status(&self) -> SlotStatus {
        match self {
            Self::Available => SlotStatus::Available,
            Self::Occupied(_) => SlotStatus::Occupied,
            Self::Reserved(_) => SlotStatus::Reserved,
        }
    }

    pub fn hold(&self) -> Option<&Hold> {
        match self {
            Self::Available => None,
            Self::Occupied(hold) | Self::Reserved(hold) => Some(hold),
        }
    }
}

/// Point-in-time copy of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    pub state: SlotState,
    /// Revision of the last committed transition (0 if never touched).
    pub revision: u64,
}

impl Slot {
    pub fn status(&self) -> SlotStatus {
        self.state.status()
    }
}

/// A committed compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub slot: SlotId,
    pub previous: SlotState,
    pub current: SlotState,
    pub revision: u64,
}
