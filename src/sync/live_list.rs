use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use super::{Keyed, SortOrder};

/// Deleted keys remembered per list; the oldest are forgotten first.
const TOMBSTONE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Default)]
struct Tombstones {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl Tombstones {
    fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: &str) {
        if !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        if self.order.len() > TOMBSTONE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn retain(&mut self, keep: impl Fn(&str) -> bool) {
        self.order.retain(|key| keep(key.as_str()));
        self.keys.retain(|key| keep(key.as_str()));
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Locally held rows of one list, kept sorted and unique by primary key.
///
/// Realtime deltas and fetched pages may arrive in any order; every merge is
/// keyed so that applying the same row twice is a no-op. Deleted keys are
/// remembered so a page fetched before the delete cannot bring the row back.
#[derive(Debug, Clone)]
pub struct LiveList<T: Keyed> {
    order: SortOrder,
    items: Vec<T>,
    tombstones: Tombstones,
}

impl<T: Keyed> LiveList<T> {
    pub fn new(order: SortOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            tombstones: Tombstones::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.items.iter().find(|item| item.key() == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn is_tombstoned(&self, key: &str) -> bool {
        self.tombstones.contains(key)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    fn compare(&self, a: &T, b: &T) -> Ordering {
        let ascending = a
            .sort_at()
            .cmp(&b.sort_at())
            .then_with(|| a.key().cmp(b.key()));
        match self.order {
            SortOrder::OldestFirst => ascending,
            SortOrder::NewestFirst => ascending.reverse(),
        }
    }

    fn place(&mut self, item: T) {
        let index = self
            .items
            .partition_point(|existing| self.compare(existing, &item) == Ordering::Less);
        self.items.insert(index, item);
    }

    /// Inserts or replaces by key. Returns whether the list changed.
    pub fn upsert(&mut self, item: T) -> bool {
        if self.tombstones.contains(item.key()) {
            return false;
        }
        match self.position(item.key()) {
            Some(index) => self.replace_at(index, item),
            None => {
                self.place(item);
                true
            }
        }
    }

    /// Replaces a row that is already held; rows not held are ignored.
    pub fn update(&mut self, item: T) -> bool {
        match self.position(item.key()) {
            Some(index) => self.replace_at(index, item),
            None => false,
        }
    }

    fn replace_at(&mut self, index: usize, mut item: T) -> bool {
        let existing = &self.items[index];
        if is_stale(existing, &item) {
            return false;
        }
        item.carry_over(existing);
        self.items.remove(index);
        self.place(item);
        true
    }

    /// Removes the row and remembers its key. Absent keys are tombstoned too.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.tombstones.insert(key);
        let index = self.position(key)?;
        Some(self.items.remove(index))
    }

    /// Merges a fetched page by key. Returns how many rows were new.
    pub fn merge_page(&mut self, page: Vec<T>) -> usize {
        let mut added = 0;
        for item in page {
            let fresh = !self.contains(item.key());
            if self.upsert(item) && fresh {
                added += 1;
            }
        }
        added
    }

    /// Replaces the held rows with `page`. Only tombstones the page still
    /// hits are kept; the others name rows the backend no longer returns.
    pub fn replace_all(&mut self, page: Vec<T>) {
        let fetched: HashSet<String> = page.iter().map(|item| item.key().to_string()).collect();
        self.items.clear();
        self.merge_page(page);
        self.tombstones.retain(|key| fetched.contains(key));
    }

    /// Edits a held row in place and returns its previous value.
    pub fn patch(&mut self, key: &str, edit: impl FnOnce(&mut T)) -> Option<T> {
        let index = self.position(key)?;
        let previous = self.items[index].clone();
        let mut next = previous.clone();
        edit(&mut next);
        self.items.remove(index);
        self.place(next);
        Some(previous)
    }

    /// Puts back a value returned by [`LiveList::patch`], if the row is still held.
    pub fn restore(&mut self, previous: T) -> bool {
        match self.position(previous.key()) {
            Some(index) => {
                self.items.remove(index);
                self.place(previous);
                true
            }
            None => false,
        }
    }

    pub fn oldest(&self) -> Option<&T> {
        match self.order {
            SortOrder::OldestFirst => self.items.first(),
            SortOrder::NewestFirst => self.items.last(),
        }
    }
}

fn is_stale<T: Keyed>(existing: &T, incoming: &T) -> bool {
    matches!(
        (existing.revision(), incoming.revision()),
        (Some(held), Some(new)) if new < held
    )
}
