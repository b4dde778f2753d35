//! Position ledger: the ordering rules for sibling records.
//!
//! A container (a list's tasks, or a board's lists) orders its members by an
//! integer position. Positions are unique and non-negative, but need not be
//! contiguous: deleting a member leaves a gap and positions are never reused.
//! Ties that appear after a partially applied update are broken by record id,
//! so every reader sees the same order.

use std::cmp::Ordering;

use thiserror::Error;
use uuid::Uuid;

pub type Position = i64;

/// A record ordered within a container.
pub trait Positioned {
    fn id(&self) -> Uuid;
    fn position(&self) -> Position;
    fn set_position(&mut self, position: Position);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerViolation {
    #[error("item {id} has negative position {position}")]
    Negative { id: Uuid, position: Position },

    #[error("items {first} and {second} share position {position}")]
    Duplicate {
        first: Uuid,
        second: Uuid,
        position: Position,
    },

    #[error("item {id} at position {position} follows position {previous}")]
    OutOfOrder {
        id: Uuid,
        position: Position,
        previous: Position,
    },
}

/// Read order: ascending position, then id.
pub fn read_order<T: Positioned>(a: &T, b: &T) -> Ordering {
    a.position()
        .cmp(&b.position())
        .then_with(|| a.id().cmp(&b.id()))
}

/// Sort members into read order.
pub fn sort<T: Positioned>(items: &mut [T]) {
    items.sort_by(read_order);
}

/// Position for a new member: one past the current maximum, or zero.
pub fn next_position(max: Option<Position>) -> Position {
    max.map_or(0, |p| p + 1)
}

/// [`next_position`] over a whole container.
pub fn next_position_in<T: Positioned>(items: &[T]) -> Position {
    next_position(items.iter().map(Positioned::position).max())
}

/// Check that `items`, in the given order, have unique non-negative
/// ascending positions.
pub fn validate<T: Positioned>(items: &[T]) -> Result<(), LedgerViolation> {
    let mut previous: Option<&T> = None;
    for item in items {
        if item.position() < 0 {
            return Err(LedgerViolation::Negative {
                id: item.id(),
                position: item.position(),
            });
        }
        if let Some(prev) = previous {
            match prev.position().cmp(&item.position()) {
                Ordering::Less => {}
                Ordering::Equal => {
                    return Err(LedgerViolation::Duplicate {
                        first: prev.id(),
                        second: item.id(),
                        position: item.position(),
                    })
                }
                Ordering::Greater => {
                    return Err(LedgerViolation::OutOfOrder {
                        id: item.id(),
                        position: item.position(),
                        previous: prev.position(),
                    })
                }
            }
        }
        previous = Some(item);
    }
    Ok(())
}

/// Panic if the ledger invariant does not hold. Only a defect elsewhere can
/// trigger this.
#[track_caller]
pub fn assert_valid<T: Positioned>(items: &[T]) {
    if let Err(violation) = validate(items) {
        panic!("position ledger invariant violated: {violation}");
    }
}

/// True when the members, in read order, sit at exactly `0..n`.
pub fn is_contiguous<T: Positioned>(items: &[T]) -> bool {
    items
        .iter()
        .enumerate()
        .all(|(rank, item)| item.position() == rank as Position)
}

/// Renumber members to `0..n` in their current order. Returns the ids whose
/// position changed.
pub fn compact<T: Positioned>(items: &mut [T]) -> Vec<Uuid> {
    let mut changed = Vec::new();
    for (rank, item) in items.iter_mut().enumerate() {
        let rank = rank as Position;
        if item.position() != rank {
            item.set_position(rank);
            changed.push(item.id());
        }
    }
    changed
}

/// Read-side repair. Sorts into read order; if duplicates or negative
/// positions remain, compacts to `0..n`. Idempotent. Returns the ids whose
/// position changed so the caller can persist them.
pub fn repair<T: Positioned>(items: &mut [T]) -> Vec<Uuid> {
    sort(items);
    if validate(items).is_ok() {
        return Vec::new();
    }
    compact(items)
}
