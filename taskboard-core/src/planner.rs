//! Move planner: turns "put item X at index k of container C" into the
//! position updates the store has to run.
//!
//! The planner works on a read-ordered view of the containers involved and
//! produces a [`MovePlan`]: an ordered list of [`PlanStep`]s. A step is either
//! a compaction of a container whose positions have gaps or duplicates, a
//! range shift (one `update_many` on the store), or the final placement of the
//! moved item. Shifts are expressed on compacted positions, so after a plan
//! runs every touched container sits at `0..n` again.

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{self, Position, Positioned};

/// One member of a [`ContainerView`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: Uuid,
    pub position: Position,
}

impl Positioned for Slot {
    fn id(&self) -> Uuid {
        self.id
    }

    fn position(&self) -> Position {
        self.position
    }

    fn set_position(&mut self, position: Position) {
        self.position = position;
    }
}

/// Read-ordered snapshot of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerView {
    pub id: Uuid,
    pub members: Vec<Slot>,
}

impl ContainerView {
    pub fn new(id: Uuid, mut members: Vec<Slot>) -> Self {
        ledger::sort(&mut members);
        Self { id, members }
    }

    pub fn from_items<T: Positioned>(id: Uuid, items: &[T]) -> Self {
        Self::new(
            id,
            items
                .iter()
                .map(|item| Slot {
                    id: item.id(),
                    position: item.position(),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn rank_of(&self, id: Uuid) -> Option<usize> {
        self.members.iter().position(|slot| slot.id == id)
    }

    /// Member ids in read order.
    pub fn order(&self) -> Vec<Uuid> {
        self.members.iter().map(|slot| slot.id).collect()
    }

    fn compaction(&self) -> Option<PlanStep> {
        let assignments: Vec<(Uuid, Position)> = self
            .members
            .iter()
            .enumerate()
            .filter(|(rank, slot)| slot.position != *rank as Position)
            .map(|(rank, slot)| (slot.id, rank as Position))
            .collect();
        if assignments.is_empty() {
            None
        } else {
            Some(PlanStep::Compact {
                container: self.id,
                assignments,
            })
        }
    }
}

/// Inclusive position bounds. `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PositionRange {
    pub min: Option<Position>,
    pub max: Option<Position>,
}

impl PositionRange {
    pub fn at_least(min: Position) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn greater_than(bound: Position) -> Self {
        Self::at_least(bound + 1)
    }

    pub fn between(min: Position, max: Position) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, position: Position) -> bool {
        self.min.map_or(true, |min| position >= min) && self.max.map_or(true, |max| position <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Rewrite members of `container` to their read-order rank.
    Compact {
        container: Uuid,
        assignments: Vec<(Uuid, Position)>,
    },
    /// Add `amount` to the position of every member of `container` whose
    /// position falls in `range`.
    Shift {
        container: Uuid,
        range: PositionRange,
        amount: i64,
    },
    /// Put `item` into `container` at `position`.
    Place {
        item: Uuid,
        container: Uuid,
        position: Position,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub item: Uuid,
    pub source: Uuid,
    pub destination: Uuid,
    /// Resulting zero-based index of the item in `destination`.
    pub index: usize,
    pub steps: Vec<PlanStep>,
}

impl MovePlan {
    pub fn is_noop(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_cross_container(&self) -> bool {
        self.source != self.destination
    }

    /// Run the plan against in-memory views, the way the store runs it.
    /// `destination` is `None` for a same-container move.
    pub fn apply(&self, source: &mut ContainerView, mut destination: Option<&mut ContainerView>) {
        for step in &self.steps {
            match step {
                PlanStep::Compact {
                    container,
                    assignments,
                } => {
                    let view = pick(*container, source, destination.as_deref_mut());
                    for (id, position) in assignments {
                        if let Some(slot) = view.members.iter_mut().find(|s| s.id == *id) {
                            slot.position = *position;
                        }
                    }
                }
                PlanStep::Shift {
                    container,
                    range,
                    amount,
                } => {
                    let view = pick(*container, source, destination.as_deref_mut());
                    for slot in view.members.iter_mut().filter(|s| range.contains(s.position)) {
                        slot.position += amount;
                    }
                }
                PlanStep::Place {
                    item,
                    container,
                    position,
                } => {
                    let moved = Slot {
                        id: *item,
                        position: *position,
                    };
                    source.members.retain(|s| s.id != *item);
                    let view = pick(*container, source, destination.as_deref_mut());
                    view.members.retain(|s| s.id != *item);
                    view.members.push(moved);
                }
            }
        }
        ledger::sort(&mut source.members);
        if let Some(dest) = destination {
            ledger::sort(&mut dest.members);
        }
    }
}

fn pick<'a>(
    id: Uuid,
    source: &'a mut ContainerView,
    destination: Option<&'a mut ContainerView>,
) -> &'a mut ContainerView {
    match destination {
        Some(dest) if dest.id == id => dest,
        _ => source,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("item {item} is not a member of container {container}")]
    NotInSource { item: Uuid, container: Uuid },

    #[error("item {item} is already a member of destination {container}")]
    AlreadyInDestination { item: Uuid, container: Uuid },
}

/// Plan moving `item` out of `source` to `index` of `destination`.
///
/// Pass `destination: None` to reorder within `source`. The index is clamped:
/// to `[0, len]` of the destination for a cross-container move, to
/// `[0, len - 1]` for a same-container move. Moving an item to its current
/// index yields an empty plan.
pub fn plan_move(
    source: &ContainerView,
    destination: Option<&ContainerView>,
    item: Uuid,
    index: usize,
) -> Result<MovePlan, PlanError> {
    let from = source.rank_of(item).ok_or(PlanError::NotInSource {
        item,
        container: source.id,
    })?;

    match destination.filter(|dest| dest.id != source.id) {
        None => Ok(plan_reorder(source, item, from, index)),
        Some(dest) => {
            if dest.rank_of(item).is_some() {
                return Err(PlanError::AlreadyInDestination {
                    item,
                    container: dest.id,
                });
            }
            Ok(plan_transfer(source, dest, item, from, index))
        }
    }
}

fn plan_reorder(container: &ContainerView, item: Uuid, from: usize, index: usize) -> MovePlan {
    let to = index.min(container.len() - 1);
    let mut plan = MovePlan {
        item,
        source: container.id,
        destination: container.id,
        index: to,
        steps: Vec::new(),
    };
    if to == from {
        return plan;
    }

    plan.steps.extend(container.compaction());
    let (from_pos, to_pos) = (from as Position, to as Position);
    let shift = if to > from {
        // Members between the old and new slot move up one.
        PlanStep::Shift {
            container: container.id,
            range: PositionRange::between(from_pos + 1, to_pos),
            amount: -1,
        }
    } else {
        PlanStep::Shift {
            container: container.id,
            range: PositionRange::between(to_pos, from_pos - 1),
            amount: 1,
        }
    };
    plan.steps.push(shift);
    plan.steps.push(PlanStep::Place {
        item,
        container: container.id,
        position: to_pos,
    });
    plan
}

fn plan_transfer(
    source: &ContainerView,
    dest: &ContainerView,
    item: Uuid,
    from: usize,
    index: usize,
) -> MovePlan {
    let to = index.min(dest.len());
    let mut steps = Vec::new();

    steps.extend(source.compaction());
    steps.extend(dest.compaction());

    // Close the gap left in the source.
    if from + 1 < source.len() {
        steps.push(PlanStep::Shift {
            container: source.id,
            range: PositionRange::greater_than(from as Position),
            amount: -1,
        });
    }
    // Open a slot in the destination before the item joins it.
    if to < dest.len() {
        steps.push(PlanStep::Shift {
            container: dest.id,
            range: PositionRange::at_least(to as Position),
            amount: 1,
        });
    }
    steps.push(PlanStep::Place {
        item,
        container: dest.id,
        position: to as Position,
    });

    MovePlan {
        item,
        source: source.id,
        destination: dest.id,
        index: to,
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::assert_valid;

    fn container(positions: &[Position]) -> ContainerView {
        ContainerView::new(
            Uuid::new_v4(),
            positions
                .iter()
                .map(|&position| Slot {
                    id: Uuid::new_v4(),
                    position,
                })
                .collect(),
        )
    }

    fn positions(view: &ContainerView) -> Vec<Position> {
        view.members.iter().map(|s| s.position).collect()
    }

    #[test]
    fn test_move_to_empty_list() {
        // To Do [A0, B1, C2], move C to index 0 of empty Done.
        let mut todo = container(&[0, 1, 2]);
        let mut done = container(&[]);
        let [a, b, c] = [todo.members[0].id, todo.members[1].id, todo.members[2].id];

        let plan = plan_move(&todo, Some(&done), c, 0).unwrap();
        assert_eq!(plan.index, 0);
        assert_eq!(
            plan.steps,
            vec![PlanStep::Place {
                item: c,
                container: done.id,
                position: 0
            }]
        );

        plan.apply(&mut todo, Some(&mut done));
        assert_eq!(todo.order(), vec![a, b]);
        assert_eq!(positions(&todo), vec![0, 1]);
        assert_eq!(done.order(), vec![c]);
        assert_eq!(positions(&done), vec![0]);
    }

    #[test]
    fn test_cross_container_move_closes_and_opens_gaps() {
        let mut source = container(&[0, 1, 2, 3]);
        let mut dest = container(&[0, 1, 2]);
        let moved = source.members[1].id;
        let mut expected_dest = dest.order();
        expected_dest.insert(2, moved);

        let plan = plan_move(&source, Some(&dest), moved, 2).unwrap();
        assert_eq!(plan.steps.len(), 3);
        plan.apply(&mut source, Some(&mut dest));

        assert_eq!(positions(&source), vec![0, 1, 2]);
        assert_eq!(dest.order(), expected_dest);
        assert_eq!(positions(&dest), vec![0, 1, 2, 3]);
        assert_valid(&source.members);
        assert_valid(&dest.members);
    }

    #[test]
    fn test_same_index_is_noop() {
        let list = container(&[0, 3, 7]);
        let plan = plan_move(&list, None, list.members[1].id, 1).unwrap();
        assert!(plan.is_noop());

        let plan = plan_move(&list, Some(&list), list.members[2].id, 10).unwrap();
        assert!(plan.is_noop(), "clamped to the item's own index");
    }

    #[test]
    fn test_reorder_down_and_up() {
        let mut list = container(&[0, 1, 2, 3]);
        let ids = list.order();

        let plan = plan_move(&list, None, ids[0], 2).unwrap();
        plan.apply(&mut list, None);
        assert_eq!(list.order(), vec![ids[1], ids[2], ids[0], ids[3]]);
        assert_eq!(positions(&list), vec![0, 1, 2, 3]);

        let plan = plan_move(&list, None, ids[3], 0).unwrap();
        plan.apply(&mut list, None);
        assert_eq!(list.order(), vec![ids[3], ids[1], ids[2], ids[0]]);
        assert_eq!(positions(&list), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_index_beyond_length_appends() {
        let mut source = container(&[0]);
        let mut dest = container(&[0, 1]);
        let moved = source.members[0].id;

        let plan = plan_move(&source, Some(&dest), moved, 99).unwrap();
        assert_eq!(plan.index, 2);
        plan.apply(&mut source, Some(&mut dest));
        assert!(source.is_empty());
        assert_eq!(dest.members[2].id, moved);
    }

    #[test]
    fn test_gapped_containers_are_compacted_first() {
        let mut source = container(&[2, 5, 9]);
        let mut dest = container(&[4, 4, 10]);
        let moved = source.members[0].id;

        let plan = plan_move(&source, Some(&dest), moved, 1).unwrap();
        assert!(matches!(plan.steps[0], PlanStep::Compact { .. }));
        assert!(matches!(plan.steps[1], PlanStep::Compact { .. }));
        plan.apply(&mut source, Some(&mut dest));

        assert_eq!(positions(&source), vec![0, 1]);
        assert_eq!(positions(&dest), vec![0, 1, 2, 3]);
        assert_eq!(dest.rank_of(moved), Some(1));
    }

    #[test]
    fn test_unknown_item_is_rejected() {
        let list = container(&[0, 1]);
        let err = plan_move(&list, None, Uuid::new_v4(), 0).unwrap_err();
        assert!(matches!(err, PlanError::NotInSource { .. }));
    }

    #[test]
    fn test_position_range_bounds() {
        assert!(PositionRange::at_least(2).contains(2));
        assert!(!PositionRange::greater_than(2).contains(2));
        assert!(PositionRange::between(1, 3).contains(3));
        assert!(!PositionRange::between(1, 3).contains(4));
    }
}
