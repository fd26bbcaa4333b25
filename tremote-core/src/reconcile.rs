//! Reconciliation of identity-keyed lists against fresh snapshots
//!
//! Every poll returns the complete state of a collection. `ListUpdater`
//! merges such a snapshot into the list held locally: surviving items are
//! updated in place, vanished items are removed and unseen items are
//! appended. Structural changes are reported as contiguous index ranges so
//! a list view can apply one operation per range.

use std::ops::Range;

/// Accumulates adjacent indices into one contiguous range.
#[derive(Debug, Default)]
pub struct ItemBatchProcessor {
    range: Option<Range<usize>>,
}

impl ItemBatchProcessor {
    /// Adds `index` to the current batch.
    ///
    /// When `index` does not directly follow the batch, the batch is closed
    /// and returned, and a new batch starts at `index`.
    pub fn next_index(&mut self, index: usize) -> Option<Range<usize>> {
        if let Some(range) = self.range.as_mut() {
            if range.end == index {
                range.end += 1;
                return None;
            }
        }
        let committed = self.range.take();
        self.range = Some(index..index + 1);
        committed
    }

    /// Closes and returns the current batch, if any.
    pub fn commit(&mut self) -> Option<Range<usize>> {
        self.range.take()
    }
}

/// Structural changes produced by one reconciliation.
///
/// Removed ranges refer to indices at the time of their removal: applying
/// them in order to the previous list yields the surviving list. Changed
/// ranges refer to indices after all removals. Added items are appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListDelta {
    pub removed: Vec<Range<usize>>,
    pub changed: Vec<Range<usize>>,
    pub added: usize,
}

impl ListDelta {
    /// Delta describing the removal of a whole list of `len` items.
    pub fn all_removed(len: usize) -> Self {
        Self {
            removed: if len > 0 { vec![0..len] } else { Vec::new() },
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty() && self.added == 0
    }

    pub fn removed_count(&self) -> usize {
        self.removed.iter().map(ExactSizeIterator::len).sum()
    }

    pub fn changed_count(&self) -> usize {
        self.changed.iter().map(ExactSizeIterator::len).sum()
    }
}

/// Merges snapshots of `NewItem`s into a list of `Item`s.
///
/// Implementors decide how identity is matched and how items are built and
/// refreshed; the hooks let a consumer observe each structural step as it
/// happens. Hooks default to doing nothing.
pub trait ListUpdater<Item, NewItem> {
    /// Finds the position in `new_items` of the entry with the same identity as `item`.
    fn find_new_item(&self, new_items: &[NewItem], item: &Item) -> Option<usize>;

    /// Refreshes `item` in place. Returns true if anything observable changed.
    fn update_item(&mut self, item: &mut Item, new_item: NewItem) -> bool;

    /// Builds an item for an entry that had no counterpart in the list.
    fn create_item(&mut self, new_item: NewItem) -> Item;

    fn on_about_to_remove_items(&mut self, _items: &[Item], _range: Range<usize>) {}

    fn on_removed_items(&mut self, _range: Range<usize>) {}

    fn on_changed_items(&mut self, _range: Range<usize>) {}

    fn on_about_to_add_items(&mut self, _count: usize) {}

    /// Called with the freshly appended items, after they are in the list.
    fn on_added_items(&mut self, _items: &[Item]) {}

    /// Reconciles `items` against the snapshot `new_items`.
    ///
    /// Each entry of the snapshot is consumed at most once. Survivors keep
    /// their relative order, new entries are appended in snapshot order.
    fn update(&mut self, items: &mut Vec<Item>, mut new_items: Vec<NewItem>) -> ListDelta {
        let mut delta = ListDelta::default();

        if !items.is_empty() {
            let mut removed = ItemBatchProcessor::default();
            let mut changed = ItemBatchProcessor::default();

            let mut i = 0;
            while i < items.len() {
                match self.find_new_item(&new_items, &items[i]) {
                    None => {
                        if let Some(range) = changed.commit() {
                            commit_changed::<Item, NewItem, Self>(self, range, &mut delta);
                        }
                        // Never yields a range: a surviving item always
                        // flushes the removal batch before the next removal
                        let flushed = removed.next_index(i);
                        debug_assert!(flushed.is_none());
                    }
                    Some(found) => {
                        if let Some(range) = removed.commit() {
                            let size = range.len();
                            commit_removed::<Item, NewItem, Self>(self, items, range, &mut delta);
                            i -= size;
                        }

                        let new_item = new_items.remove(found);
                        if self.update_item(&mut items[i], new_item) {
                            if let Some(range) = changed.next_index(i) {
                                commit_changed::<Item, NewItem, Self>(self, range, &mut delta);
                            }
                        } else if let Some(range) = changed.commit() {
                            commit_changed::<Item, NewItem, Self>(self, range, &mut delta);
                        }
                    }
                }
                i += 1;
            }

            if let Some(range) = removed.commit() {
                commit_removed::<Item, NewItem, Self>(self, items, range, &mut delta);
            }
            if let Some(range) = changed.commit() {
                commit_changed::<Item, NewItem, Self>(self, range, &mut delta);
            }
        }

        if !new_items.is_empty() {
            let count = new_items.len();
            self.on_about_to_add_items(count);

            let first = items.len();
            items.reserve(count);
            for new_item in new_items {
                let item = self.create_item(new_item);
                items.push(item);
            }

            self.on_added_items(&items[first..]);
            delta.added = count;
        }

        delta
    }
}

/// Lookup by equality, for `find_new_item` implementations whose snapshot
/// entries compare directly against held items.
pub fn find_equal<Item, NewItem>(new_items: &[NewItem], item: &Item) -> Option<usize>
where
    NewItem: PartialEq<Item>,
{
    new_items.iter().position(|new_item| new_item == item)
}

fn commit_removed<Item, NewItem, U>(
    updater: &mut U,
    items: &mut Vec<Item>,
    range: Range<usize>,
    delta: &mut ListDelta,
) where
    U: ListUpdater<Item, NewItem> + ?Sized,
{
    updater.on_about_to_remove_items(&items[range.clone()], range.clone());
    items.drain(range.clone());
    updater.on_removed_items(range.clone());
    delta.removed.push(range);
}

fn commit_changed<Item, NewItem, U>(updater: &mut U, range: Range<usize>, delta: &mut ListDelta)
where
    U: ListUpdater<Item, NewItem> + ?Sized,
{
    updater.on_changed_items(range.clone());
    delta.changed.push(range);
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        value: u32,
        serial: u32,
    }

    /// Snapshot entry: identity plus attribute.
    type NewItem = (u32, u32);

    #[derive(Default)]
    struct TestUpdater {
        next_serial: u32,
        events: Vec<String>,
    }

    impl ListUpdater<Item, NewItem> for TestUpdater {
        fn find_new_item(&self, new_items: &[NewItem], item: &Item) -> Option<usize> {
            new_items.iter().position(|(id, _)| *id == item.id)
        }

        fn update_item(&mut self, item: &mut Item, (_, value): NewItem) -> bool {
            if item.value == value {
                return false;
            }
            item.value = value;
            true
        }

        fn create_item(&mut self, (id, value): NewItem) -> Item {
            self.next_serial += 1;
            Item {
                id,
                value,
                serial: self.next_serial,
            }
        }

        fn on_about_to_remove_items(&mut self, items: &[Item], range: Range<usize>) {
            let ids: Vec<u32> = items.iter().map(|item| item.id).collect();
            self.events
                .push(format!("about_to_remove {range:?} {ids:?}"));
        }

        fn on_removed_items(&mut self, range: Range<usize>) {
            self.events.push(format!("removed {range:?}"));
        }

        fn on_changed_items(&mut self, range: Range<usize>) {
            self.events.push(format!("changed {range:?}"));
        }

        fn on_about_to_add_items(&mut self, count: usize) {
            self.events.push(format!("about_to_add {count}"));
        }

        fn on_added_items(&mut self, items: &[Item]) {
            self.events.push(format!("added {}", items.len()));
        }
    }

    /// Plain values whose identity is the value itself.
    struct LabelUpdater;

    impl ListUpdater<String, String> for LabelUpdater {
        fn find_new_item(&self, new_items: &[String], item: &String) -> Option<usize> {
            find_equal(new_items, item)
        }

        fn update_item(&mut self, _item: &mut String, _new_item: String) -> bool {
            false
        }

        fn create_item(&mut self, new_item: String) -> String {
            new_item
        }
    }

    fn populate(updater: &mut TestUpdater, entries: &[NewItem]) -> Vec<Item> {
        let mut items = Vec::new();
        updater.update(&mut items, entries.to_vec());
        updater.events.clear();
        items
    }

    #[test]
    fn test_equality_lookup() {
        let labels = |values: &[&str]| values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        let mut items = labels(&["movies", "music", "linux"]);

        let delta = LabelUpdater.update(&mut items, labels(&["linux", "books", "movies"]));

        assert_eq!(items, labels(&["movies", "linux", "books"]));
        assert_eq!(delta.removed, vec![1..2]);
        assert!(delta.changed.is_empty());
        assert_eq!(delta.added, 1);
    }

    #[test]
    fn test_batch_processor_coalesces_adjacent_indices() {
        let mut batch = ItemBatchProcessor::default();
        assert_eq!(batch.next_index(2), None);
        assert_eq!(batch.next_index(3), None);
        assert_eq!(batch.next_index(5), Some(2..4));
        assert_eq!(batch.commit(), Some(5..6));
        assert_eq!(batch.commit(), None);
    }

    #[test]
    fn test_adjacent_removals_form_one_range() {
        let mut updater = TestUpdater::default();
        let mut items = populate(&mut updater, &[(1, 0), (2, 0), (3, 0), (4, 0)]);

        let delta = updater.update(&mut items, vec![(1, 0), (4, 0)]);

        assert_eq!(delta.removed, vec![1..3]);
        assert!(delta.changed.is_empty());
        assert_eq!(delta.added, 0);
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(
            updater.events,
            vec!["about_to_remove 1..3 [2, 3]", "removed 1..3"]
        );
    }

    #[test]
    fn test_update_preserves_identity() {
        let mut updater = TestUpdater::default();
        let mut items = populate(&mut updater, &[(7, 1)]);
        let serial = items[0].serial;

        let delta = updater.update(&mut items, vec![(7, 2)]);

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].serial, serial, "item must be updated, not recreated");
        assert_eq!(items[0].value, 2);
        assert_eq!(delta.changed, vec![0..1]);
        assert!(delta.removed.is_empty());
        assert_eq!(delta.added, 0);
    }

    #[test]
    fn test_unchanged_items_split_changed_ranges() {
        let mut updater = TestUpdater::default();
        let mut items = populate(&mut updater, &[(1, 0), (2, 0), (3, 0), (4, 0)]);

        let delta = updater.update(&mut items, vec![(1, 1), (2, 1), (3, 0), (4, 1)]);

        assert_eq!(delta.changed, vec![0..2, 3..4]);
    }

    #[test]
    fn test_mixed_snapshot() {
        let mut updater = TestUpdater::default();
        let mut items = populate(&mut updater, &[(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)]);

        let delta = updater.update(&mut items, vec![(2, 9), (5, 0), (6, 0)]);

        assert_eq!(delta.removed, vec![0..1, 1..3]);
        assert_eq!(delta.changed, vec![0..1]);
        assert_eq!(delta.added, 1);
        assert_eq!(
            items.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![2, 5, 6]
        );
        assert_eq!(
            updater.events,
            vec![
                "about_to_remove 0..1 [1]",
                "removed 0..1",
                "changed 0..1",
                "about_to_remove 1..3 [3, 4]",
                "removed 1..3",
                "about_to_add 1",
                "added 1",
            ]
        );
    }

    #[test]
    fn test_empty_snapshot_removes_everything() {
        let mut updater = TestUpdater::default();
        let mut items = populate(&mut updater, &[(1, 0), (2, 0)]);

        let delta = updater.update(&mut items, Vec::new());

        assert_eq!(delta, ListDelta::all_removed(2));
        assert!(items.is_empty());
    }

    #[test]
    fn test_new_items_keep_snapshot_order() {
        let mut updater = TestUpdater::default();
        let mut items = Vec::new();

        let delta = updater.update(&mut items, vec![(3, 0), (1, 0), (2, 0)]);

        assert_eq!(delta.added, 3);
        assert_eq!(
            items.iter().map(|i| i.id).collect::<Vec<_>>(),
            vec![3, 1, 2]
        );
    }

    fn snapshot_strategy() -> impl Strategy<Value = (Vec<NewItem>, Vec<NewItem>)> {
        let ids = || proptest::collection::btree_set(0u32..40, 0..25);
        (ids(), ids()).prop_flat_map(|(old, new)| {
            let old: Vec<u32> = old.into_iter().collect();
            let new: Vec<u32> = new.into_iter().collect();
            let (old_len, new_len) = (old.len(), new.len());
            (
                Just(old).prop_shuffle(),
                Just(new).prop_shuffle(),
                proptest::collection::vec(0u32..3, old_len),
                proptest::collection::vec(0u32..3, new_len),
            )
                .prop_map(|(old, new, old_values, new_values)| {
                    (
                        old.into_iter().zip(old_values).collect(),
                        new.into_iter().zip(new_values).collect(),
                    )
                })
        })
    }

    proptest! {
        #[test]
        fn test_reconciliation_partitions_items((existing, incoming) in snapshot_strategy()) {
            let mut updater = TestUpdater::default();
            let mut items = populate(&mut updater, &existing);
            let serials: Vec<(u32, u32)> = items.iter().map(|i| (i.id, i.serial)).collect();

            let delta = updater.update(&mut items, incoming.clone());

            prop_assert_eq!(existing.len() - delta.removed_count() + delta.added, items.len());

            let incoming_ids: HashSet<u32> = incoming.iter().map(|(id, _)| *id).collect();
            let survivors: Vec<u32> = existing
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| incoming_ids.contains(id))
                .collect();
            let existing_ids: HashSet<u32> = existing.iter().map(|(id, _)| *id).collect();
            let added: Vec<u32> = incoming
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| !existing_ids.contains(id))
                .collect();

            let expected: Vec<u32> = survivors.iter().chain(added.iter()).copied().collect();
            prop_assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), expected);
            prop_assert_eq!(delta.added, added.len());

            for item in &items[..survivors.len()] {
                let original = serials.iter().find(|(id, _)| *id == item.id).map(|(_, s)| *s);
                prop_assert_eq!(Some(item.serial), original);
            }

            for range in &delta.changed {
                prop_assert!(range.end <= survivors.len());
            }
            let expected_changed = existing
                .iter()
                .filter(|(id, value)| incoming.iter().any(|(new_id, new_value)| new_id == id && new_value != value))
                .count();
            prop_assert_eq!(delta.changed_count(), expected_changed);
        }
    }
}
