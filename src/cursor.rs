//! Ordered traversal of one database.
//!
//! The cursor keeps the path from the root to the current leaf as page
//! views borrowed from its transaction, so moving to an adjacent entry never
//! searches from the root again. Pages are immutable for the life of the
//! transaction (the borrow prevents writes through a write transaction), so
//! the cached path cannot go stale.

use crate::database::Database;
use crate::error::{Error, Result};
use crate::page::{Page, PageId};
use crate::transaction::Transaction;

/// Key and value borrowed from the transaction
pub type Entry<'txn> = (&'txn [u8], &'txn [u8]);

/// Where a cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Not positioned yet, or the last exact lookup failed
    Unset,
    /// On an entry
    Valid,
    /// Before the first entry
    Start,
    /// Past the last entry
    End,
}

/// Cursor over one database of one transaction
pub struct Cursor<'txn, T: Transaction + ?Sized> {
    txn: &'txn T,
    db: Database,
    root: PageId,
    /// Branch pages from the root down, with the child taken in each
    stack: Vec<(Page<'txn>, usize)>,
    leaf: Option<Page<'txn>>,
    index: usize,
    position: CursorPosition,
}

impl<'txn, T: Transaction + ?Sized> Cursor<'txn, T> {
    pub(crate) fn new(txn: &'txn T, db: Database) -> Result<Self> {
        let root = txn.db_info(db)?.root;
        Ok(Cursor {
            txn,
            db,
            root,
            stack: Vec::new(),
            leaf: None,
            index: 0,
            position: CursorPosition::Unset,
        })
    }

    pub fn db(&self) -> Database {
        self.db
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    /// Walks down from `pgno` along the first or last children, pushing the
    /// branches passed on the way.
    fn descend(&mut self, mut pgno: PageId, first: bool) -> Result<Page<'txn>> {
        loop {
            let page = self.txn.page(pgno)?;
            if page.is_leaf() {
                return Ok(page);
            }
            if page.is_empty() {
                return Err(Error::CorruptPage { pgno, reason: "branch without children" });
            }
            let idx = if first { 0 } else { page.len() - 1 };
            self.stack.push((page, idx));
            pgno = page.child(idx)?;
        }
    }

    fn set_leaf(&mut self, leaf: Page<'txn>, first: bool) {
        self.index = if first { 0 } else { leaf.len().saturating_sub(1) };
        self.leaf = Some(leaf);
    }

    /// Moves to the first entry of the next non-empty leaf.
    /// Returns false when there is none.
    fn next_leaf(&mut self) -> Result<bool> {
        loop {
            let (page, idx) = loop {
                match self.stack.pop() {
                    None => return Ok(false),
                    Some((page, idx)) if idx + 1 < page.len() => break (page, idx + 1),
                    Some(_) => {}
                }
            };
            self.stack.push((page, idx));
            let leaf = self.descend(page.child(idx)?, true)?;
            self.set_leaf(leaf, true);
            if !leaf.is_empty() {
                return Ok(true);
            }
        }
    }

    /// Moves to the last entry of the previous non-empty leaf.
    fn prev_leaf(&mut self) -> Result<bool> {
        loop {
            let (page, idx) = loop {
                match self.stack.pop() {
                    None => return Ok(false),
                    Some((page, idx)) if idx > 0 => break (page, idx - 1),
                    Some(_) => {}
                }
            };
            self.stack.push((page, idx));
            let leaf = self.descend(page.child(idx)?, false)?;
            self.set_leaf(leaf, false);
            if !leaf.is_empty() {
                return Ok(true);
            }
        }
    }

    fn current(&mut self) -> Result<Option<Entry<'txn>>> {
        match self.leaf {
            Some(leaf) => {
                self.position = CursorPosition::Valid;
                Ok(Some(leaf.entry(self.index)?))
            }
            None => Err(Error::NotFound),
        }
    }

    fn park(&mut self, position: CursorPosition) -> Result<Option<Entry<'txn>>> {
        self.stack.clear();
        self.leaf = None;
        self.position = position;
        Ok(None)
    }

    /// A move that failed partway leaves a half-built path behind; drop it
    /// so the next step starts from the root.
    fn settle<R>(&mut self, res: Result<R>) -> Result<R> {
        if res.is_err() {
            self.stack.clear();
            self.leaf = None;
            self.position = CursorPosition::Unset;
        }
        res
    }

    /// Position at the first key. `None` for an empty database.
    pub fn go_to_first(&mut self) -> Result<Option<Entry<'txn>>> {
        let res = self.first();
        self.settle(res)
    }

    fn first(&mut self) -> Result<Option<Entry<'txn>>> {
        self.stack.clear();
        let leaf = self.descend(self.root, true)?;
        self.set_leaf(leaf, true);
        if leaf.is_empty() && !self.next_leaf()? {
            return self.park(CursorPosition::End);
        }
        self.current()
    }

    /// Position at the last key. `None` for an empty database.
    pub fn go_to_last(&mut self) -> Result<Option<Entry<'txn>>> {
        let res = self.last();
        self.settle(res)
    }

    fn last(&mut self) -> Result<Option<Entry<'txn>>> {
        self.stack.clear();
        let leaf = self.descend(self.root, false)?;
        self.set_leaf(leaf, false);
        if leaf.is_empty() && !self.prev_leaf()? {
            return self.park(CursorPosition::Start);
        }
        self.current()
    }

    /// Descends to the leaf that would hold `key`.
    fn seek(&mut self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        self.stack.clear();
        let mut pgno = self.root;
        loop {
            let page = self.txn.page(pgno)?;
            if page.is_leaf() {
                let found = page.search(key)?;
                self.leaf = Some(page);
                return Ok(found);
            }
            let idx = page.child_index(key)?;
            self.stack.push((page, idx));
            pgno = page.child(idx)?;
        }
    }

    /// Position exactly at `key`. Fails with `NotFound` and leaves the cursor
    /// unpositioned when the key is absent.
    pub fn go_to_key(&mut self, key: &[u8]) -> Result<Entry<'txn>> {
        let res = self.exact(key);
        self.settle(res)
    }

    fn exact(&mut self, key: &[u8]) -> Result<Entry<'txn>> {
        match self.seek(key)? {
            Ok(i) => {
                self.index = i;
                self.current()?.ok_or(Error::NotFound)
            }
            Err(_) => {
                self.park(CursorPosition::Unset)?;
                Err(Error::NotFound)
            }
        }
    }

    /// Position at the first key greater than or equal to `key`.
    pub fn go_to_range(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        let res = self.lower_bound(key);
        self.settle(res)
    }

    fn lower_bound(&mut self, key: &[u8]) -> Result<Option<Entry<'txn>>> {
        let (Ok(i) | Err(i)) = self.seek(key)?;
        self.index = i;
        let past_leaf = self.leaf.map_or(true, |leaf| i >= leaf.len());
        if past_leaf && !self.next_leaf()? {
            return self.park(CursorPosition::End);
        }
        self.current()
    }

    /// Step forward. From `End` the cursor stays put and returns `None`.
    pub fn go_to_next(&mut self) -> Result<Option<Entry<'txn>>> {
        let res = self.step_forward();
        self.settle(res)
    }

    fn step_forward(&mut self) -> Result<Option<Entry<'txn>>> {
        match self.position {
            CursorPosition::Unset | CursorPosition::Start => self.first(),
            CursorPosition::End => Ok(None),
            CursorPosition::Valid => {
                let len = self.leaf.map_or(0, |leaf| leaf.len());
                if self.index + 1 < len {
                    self.index += 1;
                    return self.current();
                }
                if self.next_leaf()? {
                    return self.current();
                }
                self.park(CursorPosition::End)
            }
        }
    }

    /// Step backward. From `Start` the cursor stays put and returns `None`.
    pub fn go_to_prev(&mut self) -> Result<Option<Entry<'txn>>> {
        let res = self.step_back();
        self.settle(res)
    }

    fn step_back(&mut self) -> Result<Option<Entry<'txn>>> {
        match self.position {
            CursorPosition::Unset | CursorPosition::End => self.last(),
            CursorPosition::Start => Ok(None),
            CursorPosition::Valid => {
                if self.index > 0 {
                    self.index -= 1;
                    return self.current();
                }
                if self.prev_leaf()? {
                    return self.current();
                }
                self.park(CursorPosition::Start)
            }
        }
    }

    /// Entry under the cursor, borrowed from the transaction.
    pub fn get_current(&self) -> Result<Entry<'txn>> {
        match (self.position, self.leaf) {
            (CursorPosition::Valid, Some(leaf)) => leaf.entry(self.index),
            _ => Err(Error::NotFound),
        }
    }

    /// Owned copy of the entry under the cursor.
    pub fn get_current_copy(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let (key, value) = self.get_current()?;
        Ok((key.to_vec(), value.to_vec()))
    }

    /// Iterator over keys in `[start, end]`, or to the end of the database
    /// when `end` is `None`.
    pub fn iter_range<'c>(&'c mut self, start: &[u8], end: Option<&[u8]>) -> CursorIter<'c, 'txn, T> {
        CursorIter {
            cursor: self,
            start: Some(start.to_vec()),
            end: end.map(<[u8]>::to_vec),
            finished: false,
        }
    }

    pub fn close(self) {}
}

/// Iterator for cursor ranges
pub struct CursorIter<'c, 'txn, T: Transaction + ?Sized> {
    cursor: &'c mut Cursor<'txn, T>,
    start: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    finished: bool,
}

impl<'txn, T: Transaction + ?Sized> Iterator for CursorIter<'_, 'txn, T> {
    type Item = Result<Entry<'txn>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let step = match self.start.take() {
            Some(start) => self.cursor.go_to_range(&start),
            None => self.cursor.go_to_next(),
        };
        match step {
            Ok(Some((key, value))) => {
                if self.end.as_deref().map_or(false, |end| key > end) {
                    self.finished = true;
                    return None;
                }
                Some(Ok((key, value)))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;

    use tempfile::TempDir;

    use super::*;
    use crate::constants::{EnvFlags, WriteFlags};
    use crate::env::{Environment, EnvironmentBuilder};

    fn filled(count: u32) -> (TempDir, Environment) {
        filled_with(count, EnvFlags::empty())
    }

    fn filled_with(count: u32, flags: EnvFlags) -> (TempDir, Environment) {
        let dir = TempDir::new().unwrap();
        let env = EnvironmentBuilder::new()
            .set_page_size(512)
            .set_flags(flags)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..count {
            let key = format!("{:06}", i * 2);
            txn.put(Database::main(), key.as_bytes(), &i.to_le_bytes(), WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
        (dir, env)
    }

    #[test]
    fn test_walk_across_leaves() {
        let (_dir, env) = filled(400);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();

        let mut seen = 0;
        let mut prev: Option<Vec<u8>> = None;
        while let Some((key, _)) = cursor.go_to_next().unwrap() {
            if let Some(p) = &prev {
                assert!(p.as_slice() < key);
            }
            prev = Some(key.to_vec());
            seen += 1;
        }
        assert_eq!(seen, 400);
        assert_eq!(cursor.position(), CursorPosition::End);

        let mut back = 0;
        while cursor.go_to_prev().unwrap().is_some() {
            back += 1;
        }
        assert_eq!(back, 400);
        assert_eq!(cursor.position(), CursorPosition::Start);
    }

    #[test]
    fn test_range_between_keys() {
        let (_dir, env) = filled(400);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();

        // odd keys are absent; the next even one follows
        let (key, _) = cursor.go_to_range(b"000101").unwrap().unwrap();
        assert_eq!(key, b"000102");
        let (key, _) = cursor.go_to_range(b"000102").unwrap().unwrap();
        assert_eq!(key, b"000102");
        assert!(cursor.go_to_range(b"999999").unwrap().is_none());
        assert_eq!(cursor.position(), CursorPosition::End);

        assert!(matches!(cursor.go_to_key(b"000101"), Err(Error::NotFound)));
        assert_eq!(cursor.position(), CursorPosition::Unset);
        assert!(matches!(cursor.get_current(), Err(Error::NotFound)));
    }

    #[test]
    fn test_failed_seek_unsets_cursor() {
        let (_dir, env) = filled_with(400, EnvFlags::CHECKSUM);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();
        let (last_key, _) = cursor.go_to_last().unwrap().unwrap();
        let last_leaf = cursor.leaf.map(|leaf| leaf.pgno()).unwrap();
        let (first_key, _) = cursor.go_to_first().unwrap().unwrap();
        assert_eq!(first_key, b"000000");
        assert_ne!(cursor.leaf.map(|leaf| leaf.pgno()), Some(last_leaf));

        let file = OpenOptions::new().write(true).open(env.path()).unwrap();
        file.write_all_at(&[0xa5; 8], (last_leaf + 1) * 512 - 8).unwrap();

        assert!(matches!(cursor.go_to_key(last_key), Err(Error::CorruptPage { .. })));
        assert_eq!(cursor.position(), CursorPosition::Unset);
        assert!(cursor.stack.is_empty());
        assert!(matches!(cursor.get_current(), Err(Error::NotFound)));

        // the next step starts over from the root
        let (key, _) = cursor.go_to_next().unwrap().unwrap();
        assert_eq!(key, b"000000");
        assert_eq!(cursor.position(), CursorPosition::Valid);
    }

    #[test]
    fn test_iter_range() {
        let (_dir, env) = filled(100);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();
        let keys: Vec<_> = cursor
            .iter_range(b"000011", Some(&b"000020"[..]))
            .map(|r| r.unwrap().0.to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = ["000012", "000014", "000016", "000018", "000020"]
            .iter()
            .map(|k| k.as_bytes().to_vec())
            .collect();
        assert_eq!(keys, expected);
        assert_eq!(cursor.iter_range(b"000190", None).count(), 5);
    }

    #[test]
    fn test_empty_database() {
        let (_dir, env) = filled(0);
        let txn = env.begin_ro_txn().unwrap();
        let mut cursor = txn.open_cursor(Database::main()).unwrap();
        assert!(cursor.go_to_first().unwrap().is_none());
        assert!(cursor.go_to_next().unwrap().is_none());
        assert!(cursor.go_to_last().unwrap().is_none());
        assert!(cursor.go_to_range(b"a").unwrap().is_none());
        assert!(matches!(cursor.get_current(), Err(Error::NotFound)));
    }
}
