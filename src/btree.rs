//! Copy-on-write B-tree.
//!
//! Reads walk raw pages through a [`PageSource`]. Writes decode the pages on
//! the search path into [`Node`]s, modify them and store them back through a
//! [`NodeStore`]: a page the current transaction already owns is rewritten in
//! place, any other page is copied to a fresh page number and the original is
//! retired. Committed pages are therefore never modified.

use log::trace;

use crate::constants::{WriteFlags, FILL_THRESHOLD};
use crate::error::{Error, Result};
use crate::page::{
    leaf_entry_size, max_entry_size, max_key_size, split_point, Node, Page, PageId, TxnId,
    PAGE_HEADER_SIZE,
};
use crate::types::Stat;

/// Anything that can hand out page views.
pub trait PageSource {
    /// Zero-copy view of page `pgno`.
    fn page(&self, pgno: PageId) -> Result<Page<'_>>;
}

/// Page access for the write path.
pub(crate) trait NodeStore: PageSource {
    fn page_size(&self) -> usize;
    fn txn_id(&self) -> TxnId;
    /// Whether `pgno` was allocated by the current transaction.
    fn is_dirty(&self, pgno: PageId) -> bool;
    fn allocate(&mut self) -> Result<PageId>;
    fn write_page(&mut self, pgno: PageId, data: Vec<u8>);
    /// Releases a page the tree no longer references.
    fn free(&mut self, pgno: PageId);
}

/// Result of a tree mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeUpdate {
    pub(crate) root: PageId,
    pub(crate) depth: u32,
    /// Change in the number of entries (-1, 0 or 1)
    pub(crate) delta: i64,
}

/// Rejects keys and values the page layout cannot hold.
pub(crate) fn check_sizes(page_size: usize, key: &[u8], value: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(Error::BadValSize);
    }
    let max_key = max_key_size(page_size);
    if key.len() > max_key {
        return Err(Error::ValueTooLarge { size: key.len(), max: max_key });
    }
    let size = leaf_entry_size(key.len(), value.len());
    let max = max_entry_size(page_size);
    if size > max {
        return Err(Error::ValueTooLarge { size, max });
    }
    Ok(())
}

/// Point lookup.
pub(crate) fn search<'t, S: PageSource + ?Sized>(src: &'t S, root: PageId, key: &[u8]) -> Result<&'t [u8]> {
    let mut page = src.page(root)?;
    while !page.is_leaf() {
        let child = page.child(page.child_index(key)?)?;
        page = src.page(child)?;
    }
    match page.search(key)? {
        Ok(i) => page.value(i),
        Err(_) => Err(Error::NotFound),
    }
}

/// Page counts by traversal.
pub(crate) fn stat<S: PageSource + ?Sized>(src: &S, root: PageId, depth: u32, entries: u64) -> Result<Stat> {
    let mut stat = Stat { depth, entries: entries as usize, ..Stat::default() };
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let page = src.page(pgno)?;
        stat.psize = page.as_bytes().len() as u32;
        if page.is_leaf() {
            stat.leaf_pages += 1;
        } else {
            stat.branch_pages += 1;
            for i in 0..page.len() {
                stack.push(page.child(i)?);
            }
        }
    }
    Ok(stat)
}

fn load<S: NodeStore + ?Sized>(store: &S, pgno: PageId) -> Result<Node> {
    Node::decode(&store.page(pgno)?)
}

/// Stores `node`, reusing `old` when this transaction already owns it.
fn store_node<S: NodeStore + ?Sized>(store: &mut S, old: Option<PageId>, node: &Node) -> Result<PageId> {
    let pgno = match old {
        Some(pgno) if store.is_dirty(pgno) => pgno,
        Some(pgno) => {
            let fresh = store.allocate()?;
            store.free(pgno);
            trace!("copy-on-write page {} -> {}", pgno, fresh);
            fresh
        }
        None => store.allocate()?,
    };
    let data = node.encode(store.page_size(), store.txn_id());
    store.write_page(pgno, data);
    Ok(pgno)
}

/// Index of the child covering `key` in decoded branch entries.
fn branch_index(entries: &[(Vec<u8>, PageId)], key: &[u8]) -> usize {
    entries[1..].partition_point(|(sep, _)| sep.as_slice() <= key)
}

fn capacity(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE
}

/// Allocates the empty leaf that roots a new database.
pub(crate) fn create<S: NodeStore + ?Sized>(store: &mut S) -> Result<PageId> {
    store_node(store, None, &Node::empty_leaf())
}

/// Replacement children produced by a recursive insert: the first keeps the
/// separator its parent already has.
type Children = Vec<(Vec<u8>, PageId)>;

pub(crate) fn insert<S: NodeStore + ?Sized>(
    store: &mut S,
    root: PageId,
    depth: u32,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<TreeUpdate> {
    check_sizes(store.page_size(), key, value)?;
    let (children, added) = insert_rec(store, root, key, value, flags)?;
    let delta = i64::from(added);
    if children.len() == 1 {
        return Ok(TreeUpdate { root: children[0].1, depth, delta });
    }
    let mut entries = children;
    entries[0].0.clear();
    let new_root = store_node(store, None, &Node::Branch(entries))?;
    trace!("root split, new root {} at depth {}", new_root, depth + 1);
    Ok(TreeUpdate { root: new_root, depth: depth + 1, delta })
}

/// Stores a modified node in place of `pgno`, splitting it in two when it
/// overflows the page.
fn split_or_store<S: NodeStore + ?Sized>(store: &mut S, pgno: PageId, mut node: Node) -> Result<Children> {
    let page_size = store.page_size();
    if node.fits(page_size) {
        return Ok(vec![(Vec::new(), store_node(store, Some(pgno), &node)?)]);
    }
    let min_side = if node.is_leaf() { 1 } else { 2 };
    let cut = split_point(&node.entry_sizes(), capacity(page_size), min_side);
    let mut right = node.split_off(cut);
    let sep = right.take_separator();
    let left_pgno = store_node(store, Some(pgno), &node)?;
    let right_pgno = store_node(store, None, &right)?;
    Ok(vec![(Vec::new(), left_pgno), (sep, right_pgno)])
}

fn insert_rec<S: NodeStore + ?Sized>(
    store: &mut S,
    pgno: PageId,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<(Children, bool)> {
    match load(store, pgno)? {
        Node::Leaf(mut entries) => {
            let added = match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                Ok(i) => {
                    if flags.contains(WriteFlags::NO_OVERWRITE) {
                        return Err(Error::KeyExist);
                    }
                    if entries[i].1 == value {
                        return Ok((vec![(Vec::new(), pgno)], false));
                    }
                    entries[i].1 = value.to_vec();
                    false
                }
                Err(i) => {
                    entries.insert(i, (key.to_vec(), value.to_vec()));
                    true
                }
            };
            Ok((split_or_store(store, pgno, Node::Leaf(entries))?, added))
        }
        Node::Branch(mut entries) => {
            let idx = branch_index(&entries, key);
            let child = entries[idx].1;
            let (children, added) = insert_rec(store, child, key, value, flags)?;
            if children.len() == 1 && children[0].1 == child {
                return Ok((vec![(Vec::new(), pgno)], added));
            }
            let mut children = children.into_iter();
            if let Some((_, first)) = children.next() {
                entries[idx].1 = first;
            }
            for (offset, child) in children.enumerate() {
                entries.insert(idx + 1 + offset, child);
            }
            Ok((split_or_store(store, pgno, Node::Branch(entries))?, added))
        }
    }
}

pub(crate) fn delete<S: NodeStore + ?Sized>(store: &mut S, root: PageId, depth: u32, key: &[u8]) -> Result<TreeUpdate> {
    if key.is_empty() {
        return Err(Error::BadValSize);
    }
    let node = delete_rec(store, root, key)?.ok_or(Error::NotFound)?;

    // collapse single-child roots; the child is already stored
    let (mut pgno, mut node, mut depth) = (root, node, depth);
    let mut collapsed = false;
    while let Node::Branch(entries) = &node {
        if entries.len() != 1 {
            break;
        }
        let child = entries[0].1;
        store.free(pgno);
        trace!("root {} collapsed into {}", pgno, child);
        pgno = child;
        node = load(store, child)?;
        depth -= 1;
        collapsed = true;
    }
    let root = if collapsed { pgno } else { store_node(store, Some(pgno), &node)? };
    Ok(TreeUpdate { root, depth, delta: -1 })
}

fn underfull(node: &Node, page_size: usize) -> bool {
    if node.len() == 0 || (!node.is_leaf() && node.len() < 2) {
        return true;
    }
    node.used_bytes() * 1000 < capacity(page_size) * FILL_THRESHOLD
}

/// Deletes `key` below `pgno`. Returns the modified node, not yet stored, so
/// the parent can rebalance it; `None` when the key is absent.
fn delete_rec<S: NodeStore + ?Sized>(store: &mut S, pgno: PageId, key: &[u8]) -> Result<Option<Node>> {
    match load(store, pgno)? {
        Node::Leaf(mut entries) => match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(i) => {
                entries.remove(i);
                Ok(Some(Node::Leaf(entries)))
            }
            Err(_) => Ok(None),
        },
        Node::Branch(mut entries) => {
            let idx = branch_index(&entries, key);
            let child = entries[idx].1;
            let Some(child_node) = delete_rec(store, child, key)? else {
                return Ok(None);
            };
            let page_size = store.page_size();
            if !underfull(&child_node, page_size) || entries.len() == 1 {
                entries[idx].1 = store_node(store, Some(child), &child_node)?;
                return Ok(Some(Node::Branch(entries)));
            }
            rebalance(store, &mut entries, idx, child_node)?;
            Ok(Some(Node::Branch(entries)))
        }
    }
}

/// Merges the underfull child at `idx` with a sibling, or redistributes the
/// entries of both when the union does not fit one page.
fn rebalance<S: NodeStore + ?Sized>(
    store: &mut S,
    entries: &mut Vec<(Vec<u8>, PageId)>,
    idx: usize,
    child_node: Node,
) -> Result<()> {
    let page_size = store.page_size();
    let (li, ri) = if idx + 1 < entries.len() { (idx, idx + 1) } else { (idx - 1, idx) };
    let (left_node, right_node) = if li == idx {
        (child_node, load(store, entries[ri].1)?)
    } else {
        (load(store, entries[li].1)?, child_node)
    };
    let (left_pgno, right_pgno) = (entries[li].1, entries[ri].1);
    let separator = entries[ri].0.clone();

    let combined = match (left_node, right_node) {
        (Node::Leaf(mut l), Node::Leaf(r)) => {
            l.extend(r);
            Node::Leaf(l)
        }
        (Node::Branch(mut l), Node::Branch(mut r)) => {
            // the right node's implicit first key is the parent separator
            if let Some(first) = r.first_mut() {
                first.0 = separator;
            }
            l.extend(r);
            Node::Branch(l)
        }
        _ => return Err(Error::CorruptPage { pgno: right_pgno, reason: "siblings at different heights" }),
    };

    if combined.fits(page_size) {
        entries[li].1 = store_node(store, Some(left_pgno), &combined)?;
        entries.remove(ri);
        store.free(right_pgno);
        trace!("merged page {} into {}", right_pgno, entries[li].1);
        return Ok(());
    }

    let mut left = combined;
    let min_side = if left.is_leaf() { 1 } else { 2 };
    let cut = split_point(&left.entry_sizes(), capacity(page_size), min_side);
    let mut right = left.split_off(cut);
    let new_sep = right.take_separator();
    entries[li].1 = store_node(store, Some(left_pgno), &left)?;
    entries[ri].1 = store_node(store, Some(right_pgno), &right)?;
    entries[ri].0 = new_sep;
    Ok(())
}
