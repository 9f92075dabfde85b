//! Canonical slot state.
//!
//! - `slot`: identity (`BlockId`, `SlotId`) and state (`SlotState`, `Hold`)
//! - `layout`: which blocks exist and how many slots each has
//! - `store`: the `SlotStore` seam and the in-memory `SlotPool`

mod layout;
mod slot;
mod store;

pub use layout::{BlockSpec, LayoutError, LotLayout};
pub use slot::{BlockId, Hold, HoldToken, Slot, SlotId, SlotState, SlotStatus, Transition};
pub use store::{CasError, SlotPool, SlotStore};
