use std::cmp::Reverse;

use crate::page::PageId;

/// ID List - page numbers kept sorted in descending order, so the lowest
/// page is always at the tail and comes off first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Idl {
    ids: Vec<PageId>,
}

impl Idl {
    /// Builds a list from unsorted ids.
    pub(crate) fn from_unsorted(mut ids: Vec<PageId>) -> Self {
        ids.sort_unstable_by_key(|&id| Reverse(id));
        ids.dedup();
        Self { ids }
    }

    /// Get number of elements in the list
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    /// Merge another list into this one
    pub(crate) fn append_list(&mut self, other: &[PageId]) {
        if other.is_empty() {
            return;
        }
        self.ids.extend_from_slice(other);
        self.ids.sort_unstable_by_key(|&id| Reverse(id));
        self.ids.dedup();
    }

    /// Take the lowest id
    pub(crate) fn pop(&mut self) -> Option<PageId> {
        self.ids.pop()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = PageId> + '_ {
        self.ids.iter().copied()
    }
}
