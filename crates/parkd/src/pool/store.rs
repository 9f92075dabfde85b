//! Slot storage.
//!
//! `SlotStore` is the only mutation surface for slot state. `SlotPool` keeps
//! everything in memory with one mutex per slot; a restart starts from an
//! all-available pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::layout::LotLayout;
use super::slot::{BlockId, Slot, SlotId, SlotState, SlotStatus, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CasError {
    #[error("slot not found")]
    NotFound,
    #[error("slot is {actual}")]
    Mismatch { actual: SlotStatus },
}

/// Storage seam between the engine and wherever slot state lives.
pub trait SlotStore: Send + Sync {
    fn layout(&self) -> &LotLayout;

    fn get(&self, id: SlotId) -> Option<Slot>;

    /// Highest revision assigned so far. A slot carrying a revision at or
    /// below a value read here already holds that commit's state.
    fn revision(&self) -> u64;

    /// Visit every slot in block-then-number order.
    ///
    /// Each slot is read atomically; the traversal as a whole is not a
    /// single point-in-time view.
    fn for_each(&self, visitor: &mut dyn FnMut(&Slot));

    /// Move `id` to `next` only if its status is `expected`.
    ///
    /// `on_commit` runs with the slot still locked, after the new state is
    /// written. A mismatch has no side effects.
    fn compare_and_set(
        &self,
        id: SlotId,
        expected: SlotStatus,
        next: SlotState,
        on_commit: &mut dyn FnMut(&Transition),
    ) -> Result<Transition, CasError>;

    fn available(&self) -> usize {
        let mut count = 0;
        self.for_each(&mut |slot| {
            if slot.status().is_available() {
                count += 1;
            }
        });
        count
    }
}

#[derive(Debug, Default)]
struct Cell {
    state: SlotState,
    revision: u64,
}

#[derive(Debug)]
struct BlockSlots {
    block: BlockId,
    cells: Vec<Mutex<Cell>>,
}

/// In-memory slot pool with per-slot locking.
#[derive(Debug)]
pub struct SlotPool {
    layout: LotLayout,
    blocks: Vec<BlockSlots>,
    revision: AtomicU64,
}

/// Lock a slot. A poisoned lock still holds a fully written state, so it is
/// recovered rather than propagated.
fn lock_cell(id: SlotId, cell: &Mutex<Cell>) -> MutexGuard<'_, Cell> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(slot = %id, "Slot mutex poisoned - recovering last committed state");
            cell.clear_poison();
            poisoned.into_inner()
        }
    }
}

impl SlotPool {
    /// Create a pool with every slot available.
    pub fn new(layout: LotLayout) -> Self {
        let blocks = layout
            .blocks()
            .iter()
            .map(|spec| BlockSlots {
                block: spec.block,
                cells: (0..spec.capacity).map(|_| Mutex::default()).collect(),
            })
            .collect();

        tracing::debug!(
            blocks = layout.blocks().len(),
            slots = layout.total_slots(),
            "Slot pool created"
        );

        Self {
            layout,
            blocks,
            revision: AtomicU64::new(0),
        }
    }

    fn cell(&self, id: SlotId) -> Option<&Mutex<Cell>> {
        let index = usize::try_from(id.number.checked_sub(1)?).ok()?;
        self.blocks
            .iter()
            .find(|b| b.block == id.block)?
            .cells
            .get(index)
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new(LotLayout::default())
    }
}

impl SlotStore for SlotPool {
    fn layout(&self) -> &LotLayout {
        &self.layout
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn get(&self, id: SlotId) -> Option<Slot> {
        let cell = lock_cell(id, self.cell(id)?);
        Some(Slot {
            id,
            state: cell.state.clone(),
            revision: cell.revision,
        })
    }

    fn for_each(&self, visitor: &mut dyn FnMut(&Slot)) {
        for block in &self.blocks {
            for (number, cell) in (1..).zip(&block.cells) {
                let id = SlotId::new(block.block, number);
                let slot = {
                    let cell = lock_cell(id, cell);
                    Slot {
                        id,
                        state: cell.state.clone(),
                        revision: cell.revision,
                    }
                };
                visitor(&slot);
            }
        }
    }

    fn compare_and_set(
        &self,
        id: SlotId,
        expected: SlotStatus,
        next: SlotState,
        on_commit: &mut dyn FnMut(&Transition),
    ) -> Result<Transition, CasError> {
        let cell = self.cell(id).ok_or(CasError::NotFound)?;
        let mut cell = lock_cell(id, cell);

        let actual = cell.state.status();
        if actual != expected {
            return Err(CasError::Mismatch { actual });
        }

        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = std::mem::replace(&mut cell.state, next);
        cell.revision = revision;

        let transition = Transition {
            slot: id,
            previous,
            current: cell.state.clone(),
            revision,
        };
        on_commit(&transition);
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::slot::{Hold, HoldToken};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn id(block: char, number: u32) -> SlotId {
        SlotId::new(BlockId::new(block).unwrap(), number)
    }

    fn occupied(user: &str) -> SlotState {
        SlotState::Occupied(Hold {
            holder: HoldToken::new(user),
            started_at: Utc::now(),
        })
    }

    fn small_pool() -> SlotPool {
        SlotPool::new("A:2,B:3".parse().unwrap())
    }

    #[test]
    fn new_pool_is_all_available() {
        let pool = SlotPool::default();
        assert_eq!(pool.available(), 238);
        assert_eq!(pool.revision(), 0);
        let slot = pool.get(id('J', 12)).unwrap();
        assert_eq!(slot.status(), SlotStatus::Available);
        assert_eq!(slot.revision, 0);
    }

    #[test]
    fn get_out_of_range_is_none() {
        let pool = small_pool();
        assert!(pool.get(id('A', 0)).is_none());
        assert!(pool.get(id('A', 3)).is_none());
        assert!(pool.get(id('C', 1)).is_none());
    }

    #[test]
    fn for_each_visits_in_layout_order() {
        let pool = small_pool();
        let mut seen = Vec::new();
        pool.for_each(&mut |slot| seen.push(slot.id.to_string()));
        assert_eq!(seen, vec!["A1", "A2", "B1", "B2", "B3"]);
    }

    #[test]
    fn compare_and_set_commits_on_match() {
        let pool = small_pool();
        let mut committed = Vec::new();
        let t = pool
            .compare_and_set(
                id('B', 2),
                SlotStatus::Available,
                occupied("u1"),
                &mut |t| committed.push(t.revision),
            )
            .unwrap();

        assert_eq!(t.previous, SlotState::Available);
        assert_eq!(t.current.status(), SlotStatus::Occupied);
        assert_eq!(t.revision, 1);
        assert_eq!(committed, vec![1]);

        let slot = pool.get(id('B', 2)).unwrap();
        assert_eq!(slot.status(), SlotStatus::Occupied);
        assert_eq!(slot.revision, 1);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn compare_and_set_mismatch_has_no_side_effects() {
        let pool = small_pool();
        pool.compare_and_set(id('A', 1), SlotStatus::Available, occupied("u1"), &mut |_| {})
            .unwrap();

        let mut called = false;
        let err = pool
            .compare_and_set(id('A', 1), SlotStatus::Available, occupied("u2"), &mut |_| {
                called = true
            })
            .unwrap_err();

        assert_eq!(err, CasError::Mismatch { actual: SlotStatus::Occupied });
        assert!(!called);
        assert_eq!(pool.revision(), 1);
        let slot = pool.get(id('A', 1)).unwrap();
        assert_eq!(slot.state.hold().unwrap().holder.as_str(), "u1");
    }

    #[test]
    fn compare_and_set_unknown_slot() {
        let pool = small_pool();
        let err = pool
            .compare_and_set(id('Q', 1), SlotStatus::Available, occupied("u"), &mut |_| {})
            .unwrap_err();
        assert_eq!(err, CasError::NotFound);
    }

    #[test]
    fn concurrent_compare_and_set_has_single_winner() {
        let pool = small_pool();
        let wins = AtomicUsize::new(0);
        let target = id('A', 2);

        std::thread::scope(|s| {
            for i in 0..16 {
                let pool = &pool;
                let wins = &wins;
                s.spawn(move || {
                    let user = format!("u{i}");
                    if pool
                        .compare_and_set(target, SlotStatus::Available, occupied(&user), &mut |_| {})
                        .is_ok()
                    {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(pool.revision(), 1);
    }

    #[test]
    fn revisions_increase_per_slot() {
        let pool = small_pool();
        let slot = id('A', 1);
        let r1 = pool
            .compare_and_set(slot, SlotStatus::Available, occupied("u"), &mut |_| {})
            .unwrap()
            .revision;
        let r2 = pool
            .compare_and_set(slot, SlotStatus::Occupied, SlotState::Available, &mut |_| {})
            .unwrap()
            .revision;
        assert!(r2 > r1);
        assert_eq!(pool.get(slot).unwrap().revision, r2);
    }
}
