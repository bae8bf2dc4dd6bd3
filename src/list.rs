//! Indexable collections of chain objects.
//!
//! [`List`] owns its elements and is either built by the client (appendable)
//! or handed out by the query engine (read-only). [`ListView`] borrows a
//! parent's elements, so it can neither append nor outlive the parent.

use std::ops::Index;

use crate::{
    error::{Error, Result},
    objects::{Block, History, StealthRecord, Transaction},
};

/// Who built a [`List`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Built by the client; appendable.
    Client,
    /// Handed out by the query engine; read-only.
    Engine,
}

/// An owned, indexable sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct List<T> {
    items: Vec<T>,
    owner: Owner,
}

/// Blocks, e.g. the two sides of a reorganization.
pub type BlockList = List<Block>;
/// Transactions.
pub type TransactionList = List<Transaction>;
/// Address history rows.
pub type HistoryList = List<History>;
/// Stealth rows.
pub type StealthList = List<StealthRecord>;

impl<T> List<T> {
    /// An empty client-owned list.
    pub fn construct_default() -> Self {
        Self::new()
    }

    /// An empty client-owned list.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            owner: Owner::Client,
        }
    }

    pub(crate) fn from_engine(items: Vec<T>) -> Self {
        Self {
            items,
            owner: Owner::Engine,
        }
    }

    /// Who built the list.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Whether [`List::push_back`] is refused.
    pub fn is_read_only(&self) -> bool {
        self.owner == Owner::Engine
    }

    /// Append an element. Engine-built lists refuse with
    /// [`Error::ReadOnlyCollection`].
    pub fn push_back(&mut self, item: T) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnlyCollection);
        }
        self.items.push(item);
        Ok(())
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The element at `index`.
    pub fn nth(&self, index: usize) -> Result<&T> {
        nth(&self.items, index)
    }

    /// Iterate in order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Borrow as a view.
    pub fn view(&self) -> ListView<'_, T> {
        ListView::new(&self.items)
    }

    /// Take the elements out.
    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for List<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
            owner: Owner::Client,
        }
    }
}

impl<T> IntoIterator for List<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a List<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Panics with the [`Error::IndexOutOfRange`] message; use [`List::nth`] to
/// get the error instead.
impl<T> Index<usize> for List<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        index_or_panic(&self.items, index)
    }
}

/// A borrowed, read-only view over a parent's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListView<'a, T> {
    items: &'a [T],
}

impl<'a, T> ListView<'a, T> {
    /// View over `items`.
    pub fn new(items: &'a [T]) -> Self {
        Self { items }
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Whether the view has no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The element at `index`, borrowed from the parent.
    pub fn nth(&self, index: usize) -> Result<&'a T> {
        nth(self.items, index)
    }

    /// The element at `index`, or `None` past the end. Unlike `view[i]` the
    /// reference borrows the parent, not the view.
    pub fn get(&self, index: usize) -> Option<&'a T> {
        self.items.get(index)
    }

    /// The first element.
    pub fn first(&self) -> Option<&'a T> {
        self.items.first()
    }

    /// Iterate in order, borrowing from the parent.
    pub fn iter(&self) -> std::slice::Iter<'a, T> {
        self.items.iter()
    }

    /// The underlying slice.
    pub fn as_slice(&self) -> &'a [T] {
        self.items
    }
}

impl<'a, T> IntoIterator for ListView<'a, T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl<T> Index<usize> for ListView<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        index_or_panic(self.items, index)
    }
}

fn nth<T>(items: &[T], index: usize) -> Result<&T> {
    items.get(index).ok_or(Error::IndexOutOfRange {
        index,
        count: items.len(),
    })
}

fn index_or_panic<T>(items: &[T], index: usize) -> &T {
    match nth(items, index) {
        Ok(item) => item,
        Err(err) => panic!("{err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nth_at_count_is_out_of_range() {
        for n in [0usize, 1, 5] {
            let list: List<u32> = (0..n as u32).collect();
            assert_eq!(
                list.nth(list.count()).unwrap_err(),
                Error::IndexOutOfRange { index: n, count: n }
            );
            let view = list.view();
            assert!(view.nth(view.count()).is_err());

            let engine = List::from_engine((0..n as u32).collect());
            assert!(engine.nth(engine.count()).is_err());
        }
    }

    #[test]
    fn engine_lists_are_read_only() {
        let mut client = List::construct_default();
        client.push_back(1u8).unwrap();
        assert_eq!(client.count(), 1);
        assert!(!client.is_read_only());

        let mut engine = List::from_engine(vec![1u8]);
        assert_eq!(engine.push_back(2), Err(Error::ReadOnlyCollection));
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn view_outlives_its_own_binding() {
        let data = vec![3u8, 4, 5];
        let item = {
            let view = ListView::new(&data);
            view.nth(2).unwrap()
        };
        assert_eq!(*item, 5);
        assert_eq!(ListView::new(&data)[0], 3);

        let first = ListView::new(&data).first();
        let last = ListView::new(&data).get(2);
        assert_eq!((first, last), (Some(&3), Some(&5)));
        assert_eq!(ListView::new(&data).get(3), None);
    }

    #[test]
    #[should_panic(expected = "index out of range")]
    fn index_operator_panics_past_the_end() {
        let list: List<u8> = List::new();
        let _ = list[0];
    }
}
