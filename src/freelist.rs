//! Free page accounting.
//!
//! A page replaced by the write transaction `T` is still reachable from
//! every snapshot older than `T`. It is parked in `pending` under `T` and
//! moves to `reusable` once no live reader is pinned below `T`.
//!
//! The whole list is persisted at each commit as a chain of free-list
//! pages: `next u64 | ids u64...` after the page header.

use std::collections::BTreeMap;

use log::trace;

use crate::error::{Error, Result};
use crate::midl::Idl;
use crate::page::{init_header, read_u64, stamp_checksum, Page, PageId, PageKind, TxnId, PAGE_HEADER_SIZE};

const CHAIN_NEXT: usize = PAGE_HEADER_SIZE;
const CHAIN_IDS: usize = PAGE_HEADER_SIZE + 8;

#[derive(Debug, Default)]
pub(crate) struct FreeList {
    /// Pages no snapshot can reach
    reusable: Idl,
    /// Retiring txn id -> pages still visible to older snapshots
    pending: BTreeMap<TxnId, Vec<PageId>>,
}

impl FreeList {
    /// Free list loaded from disk; no snapshot survives a reopen, so every
    /// page is reusable.
    pub(crate) fn from_persisted(ids: Vec<PageId>) -> Self {
        Self { reusable: Idl::from_unsorted(ids), pending: BTreeMap::new() }
    }

    /// Lowest reusable page.
    pub(crate) fn pop_reusable(&mut self) -> Option<PageId> {
        self.reusable.pop()
    }

    /// Returns pages that were handed out but never published.
    pub(crate) fn give_back(&mut self, ids: &[PageId]) {
        self.reusable.append_list(ids);
    }

    /// Parks pages replaced by txn `txn_id`.
    pub(crate) fn retire(&mut self, txn_id: TxnId, pages: Vec<PageId>) {
        if !pages.is_empty() {
            self.pending.entry(txn_id).or_default().extend(pages);
        }
    }

    /// Moves pending pages no live reader can see into `reusable`.
    /// `oldest_reader` is the lowest pinned snapshot, if any.
    pub(crate) fn reclaim(&mut self, oldest_reader: Option<TxnId>) -> usize {
        let mut moved = 0;
        while let Some((&txn_id, _)) = self.pending.iter().next() {
            if oldest_reader.map_or(false, |r| r < txn_id) {
                break;
            }
            if let Some(pages) = self.pending.remove(&txn_id) {
                trace!("reclaiming {} page(s) retired by txn {}", pages.len(), txn_id);
                moved += pages.len();
                self.reusable.append_list(&pages);
            }
        }
        moved
    }

    pub(crate) fn reusable_count(&self) -> usize {
        self.reusable.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Every free page, reusable or pending, for persisting.
    pub(crate) fn all_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.reusable.iter().collect();
        for pages in self.pending.values() {
            ids.extend_from_slice(pages);
        }
        ids
    }
}

/// Page ids one chain page holds.
pub(crate) fn ids_per_page(page_size: usize) -> usize {
    (page_size - CHAIN_IDS) / 8
}

/// Chain pages needed for `count` ids.
pub(crate) fn chain_len(count: usize, page_size: usize) -> usize {
    count.div_ceil(ids_per_page(page_size))
}

pub(crate) fn encode_chain_page(next: PageId, ids: &[PageId], page_size: usize, txn_id: TxnId) -> Vec<u8> {
    debug_assert!(ids.len() <= ids_per_page(page_size));
    let mut buf = vec![0u8; page_size];
    init_header(&mut buf, PageKind::FreeList, 0, txn_id);
    buf[CHAIN_NEXT..CHAIN_NEXT + 8].copy_from_slice(&next.to_le_bytes());
    // the u16 header count cannot hold large page capacities; store it inline
    buf[4..8].copy_from_slice(&(ids.len() as u32).to_le_bytes());
    for (i, id) in ids.iter().enumerate() {
        let at = CHAIN_IDS + i * 8;
        buf[at..at + 8].copy_from_slice(&id.to_le_bytes());
    }
    stamp_checksum(&mut buf);
    buf
}

/// Returns `(next, ids)` of a chain page.
pub(crate) fn decode_chain_page(page: &Page<'_>) -> Result<(PageId, Vec<PageId>)> {
    let pgno = page.pgno();
    if page.kind() != PageKind::FreeList {
        return Err(Error::CorruptPage { pgno, reason: "expected a free-list page" });
    }
    if !page.verify_checksum() {
        return Err(Error::CorruptPage { pgno, reason: "free-list checksum mismatch" });
    }
    let data = page.as_bytes();
    let count = crate::page::read_u32(data, 4) as usize;
    if count > ids_per_page(data.len()) {
        return Err(Error::CorruptPage { pgno, reason: "free-list count overruns page" });
    }
    let next = read_u64(data, CHAIN_NEXT);
    let ids = (0..count).map(|i| read_u64(data, CHAIN_IDS + i * 8)).collect();
    Ok((next, ids))
}

/// Follows a persisted chain from `head`. Returns the chain pages and the
/// free ids they hold.
pub(crate) fn walk_chain<'a, F>(read: F, head: PageId, len: u64) -> Result<(Vec<PageId>, Vec<PageId>)>
where
    F: Fn(PageId) -> Result<Page<'a>>,
{
    let mut chain = Vec::new();
    let mut ids = Vec::new();
    let mut next = head;
    while next != 0 {
        if chain.len() as u64 >= len {
            return Err(Error::CorruptPage { pgno: next, reason: "free-list chain longer than recorded" });
        }
        let (following, page_ids) = decode_chain_page(&read(next)?)?;
        chain.push(next);
        ids.extend(page_ids);
        next = following;
    }
    if (chain.len() as u64) < len {
        return Err(Error::CorruptPage { pgno: head, reason: "free-list chain shorter than recorded" });
    }
    Ok((chain, ids))
}
