//! Read-only and read-write transactions.
//!
//! A read transaction pins the meta that was current when it began and reads
//! committed pages straight out of the map. The single write transaction
//! keeps its modified pages in private buffers until commit, so readers
//! never observe partial state.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::MutexGuard;

use crate::btree::{self, NodeStore, PageSource, TreeUpdate};
use crate::constants::{EnvFlags, WriteFlags, MAX_DB_NAME};
use crate::cursor::Cursor;
use crate::database::Database;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::failpoint::{self, CommitPoint};
use crate::freelist::{chain_len, encode_chain_page, ids_per_page, walk_chain, FreeList};
use crate::meta::{table_len, DbInfo, Meta};
use crate::page::{stamp_checksum, Page, PageId, TxnId};
use crate::types::Stat;

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Read transaction released by `reset`, waiting for `renew`
    Idle,
    ReadActive,
    WriteActive,
    Committing,
    Committed,
    Aborted,
}

/// Operations shared by read-only and read-write transactions.
pub trait Transaction: PageSource {
    /// Transaction ID: the snapshot a reader sees, or the id a writer will
    /// commit as.
    fn id(&self) -> TxnId;

    fn state(&self) -> TxnState;

    #[doc(hidden)]
    fn databases(&self) -> Result<&[DbInfo]>;

    #[doc(hidden)]
    fn db_info(&self, db: Database) -> Result<&DbInfo> {
        self.databases()?.get(db.index()).ok_or(Error::BadDbi)
    }

    /// Looks up a database created by an earlier commit or by this
    /// transaction.
    fn open_db(&self, name: Option<&str>) -> Result<Database> {
        self.databases()?
            .iter()
            .position(|db| db.name.as_deref() == name)
            .map(|i| Database::new(i as u32))
            .ok_or(Error::DbNotFound)
    }

    /// Get a value without copying it. The slice borrows the transaction.
    fn get(&self, db: Database, key: &[u8]) -> Result<&[u8]> {
        let root = self.db_info(db)?.root;
        btree::search(self, root, key)
    }

    /// Get an owned copy of a value.
    fn get_copy(&self, db: Database, key: &[u8]) -> Result<Vec<u8>> {
        self.get(db, key).map(<[u8]>::to_vec)
    }

    /// Get a UTF-8 value without copying it.
    fn get_str(&self, db: Database, key: &[u8]) -> Result<&str> {
        Ok(std::str::from_utf8(self.get(db, key)?)?)
    }

    fn get_string(&self, db: Database, key: &[u8]) -> Result<String> {
        self.get_str(db, key).map(str::to_owned)
    }

    fn open_cursor(&self, db: Database) -> Result<Cursor<'_, Self>> {
        Cursor::new(self, db)
    }

    /// Tree statistics for `db` as seen by this transaction.
    fn stat(&self, db: Database) -> Result<Stat> {
        let info = self.db_info(db)?;
        btree::stat(self, info.root, info.depth, info.entries)
    }
}

/// Read-only transaction over a pinned snapshot
pub struct RoTransaction<'env> {
    env: &'env Environment,
    meta: Arc<Meta>,
    state: TxnState,
}

impl<'env> RoTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let meta = env.acquire_reader()?;
        trace!("read txn began on snapshot {}", meta.txn_id);
        Ok(RoTransaction { env, meta, state: TxnState::ReadActive })
    }

    /// Ends the transaction. Reads have nothing to publish.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    pub fn abort(self) {}

    /// Meta of the pinned snapshot
    pub(crate) fn snapshot(&self) -> &Meta {
        &self.meta
    }

    /// Releases the snapshot but keeps the handle for `renew`.
    pub fn reset(&mut self) {
        if self.state == TxnState::ReadActive {
            self.env.release_reader(self.meta.txn_id);
            self.state = TxnState::Idle;
        }
    }

    /// Pins the latest committed snapshot again after `reset`.
    pub fn renew(&mut self) -> Result<()> {
        if self.state != TxnState::Idle {
            return Err(Error::TxnInvalid);
        }
        self.meta = self.env.acquire_reader()?;
        self.state = TxnState::ReadActive;
        Ok(())
    }
}

impl PageSource for RoTransaction<'_> {
    fn page(&self, pgno: PageId) -> Result<Page<'_>> {
        if self.state != TxnState::ReadActive {
            return Err(Error::TxnInvalid);
        }
        let verify = self.env.flags().contains(EnvFlags::CHECKSUM);
        self.env.store().read_page(pgno, self.meta.next_pgno, verify)
    }
}

impl Transaction for RoTransaction<'_> {
    fn id(&self) -> TxnId {
        self.meta.txn_id
    }

    fn state(&self) -> TxnState {
        self.state
    }

    fn databases(&self) -> Result<&[DbInfo]> {
        if self.state != TxnState::ReadActive {
            return Err(Error::TxnInvalid);
        }
        Ok(&self.meta.dbs)
    }
}

impl Drop for RoTransaction<'_> {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The read-write transaction
///
/// At most one exists per environment; it holds the writer lock until it
/// commits, aborts or is dropped.
pub struct RwTransaction<'env> {
    env: &'env Environment,
    /// Snapshot this transaction started from
    base: Arc<Meta>,
    txn_id: TxnId,
    /// Database table including uncommitted roots
    dbs: Vec<DbInfo>,
    /// Pages written by this transaction
    dirty: HashMap<PageId, Vec<u8>>,
    /// First page number never handed out
    next_pgno: PageId,
    /// Dirty pages freed again; reused before anything else
    loose: Vec<PageId>,
    /// Committed pages this transaction replaced
    retired: Vec<PageId>,
    /// Pages taken from the environment free list
    reused: Vec<PageId>,
    state: TxnState,
    /// Set when a failed operation may have left dirty state behind
    broken: bool,
    _writer: MutexGuard<'env, ()>,
}

impl<'env> RwTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        if env.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        let writer = env.try_lock_writer().ok_or(Error::WriterBusy)?;
        let base = env.current_meta();
        trace!("write txn {} began on snapshot {}", base.txn_id + 1, base.txn_id);
        Ok(RwTransaction {
            env,
            txn_id: base.txn_id + 1,
            dbs: base.dbs.clone(),
            next_pgno: base.next_pgno,
            base,
            dirty: HashMap::new(),
            loose: Vec::new(),
            retired: Vec::new(),
            reused: Vec::new(),
            state: TxnState::WriteActive,
            broken: false,
            _writer: writer,
        })
    }

    fn check_active(&self) -> Result<()> {
        if self.state != TxnState::WriteActive || self.broken {
            return Err(Error::TxnInvalid);
        }
        Ok(())
    }

    fn db_index(&self, db: Database) -> Result<usize> {
        if db.index() < self.dbs.len() {
            Ok(db.index())
        } else {
            Err(Error::BadDbi)
        }
    }

    /// Marks the transaction unusable unless `err` was raised before any
    /// page was touched.
    fn note_failure(&mut self, err: &Error) {
        if !matches!(
            err,
            Error::KeyExist | Error::NotFound | Error::BadValSize | Error::ValueTooLarge { .. }
        ) {
            warn!("write txn {} failed mid-operation: {}", self.txn_id, err);
            self.broken = true;
        }
    }

    fn apply(&mut self, i: usize, update: TreeUpdate) {
        let info = &mut self.dbs[i];
        info.root = update.root;
        info.depth = update.depth;
        info.entries = info.entries.saturating_add_signed(update.delta);
    }

    /// Store a key/value pair.
    ///
    /// With `WriteFlags::NO_OVERWRITE` an existing key fails with `KeyExist`.
    pub fn put(&mut self, db: Database, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check_active()?;
        let i = self.db_index(db)?;
        let (root, depth) = (self.dbs[i].root, self.dbs[i].depth);
        match btree::insert(self, root, depth, key, value, flags) {
            Ok(update) => {
                self.apply(i, update);
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Delete a key. Fails with `NotFound` when it is absent.
    pub fn del(&mut self, db: Database, key: &[u8]) -> Result<()> {
        self.check_active()?;
        let i = self.db_index(db)?;
        let (root, depth) = (self.dbs[i].root, self.dbs[i].depth);
        match btree::delete(self, root, depth, key) {
            Ok(update) => {
                self.apply(i, update);
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Opens the named database, creating it if needed.
    pub fn create_db(&mut self, name: &str) -> Result<Database> {
        self.check_active()?;
        if name.is_empty() || name.len() > MAX_DB_NAME {
            return Err(Error::BadValSize);
        }
        if let Some(i) = self.dbs.iter().position(|db| db.name.as_deref() == Some(name)) {
            return Ok(Database::new(i as u32));
        }
        if self.dbs.len() > self.env.max_dbs() as usize {
            return Err(Error::TooManyDatabases);
        }
        let mut candidate = self.dbs.clone();
        candidate.push(DbInfo::new(Some(name.to_owned()), 0));
        if table_len(&candidate) > self.env.store().page_size() {
            return Err(Error::TooManyDatabases);
        }

        let root = btree::create(self)?;
        self.dbs.push(DbInfo::new(Some(name.to_owned()), root));
        debug!("txn {} created database {:?} rooted at {}", self.txn_id, name, root);
        Ok(Database::new((self.dbs.len() - 1) as u32))
    }

    /// Commit all the operations of a transaction into the database.
    ///
    /// Data pages are made durable before the meta page that references
    /// them, so a crash at any point leaves either the old or the new
    /// snapshot on disk.
    pub fn commit(mut self) -> Result<()> {
        if self.broken {
            self.rollback();
            return Err(Error::TxnInvalid);
        }
        self.check_active()?;
        if self.dirty.is_empty() && self.dbs == self.base.dbs {
            trace!("write txn {} committed without changes", self.txn_id);
            self.state = TxnState::Committed;
            return Ok(());
        }

        self.state = TxnState::Committing;
        match self.write_commit() {
            Ok(()) => {
                self.state = TxnState::Committed;
                Ok(())
            }
            Err(e) => {
                warn!("commit of txn {} failed: {}", self.txn_id, e);
                self.rollback();
                Err(e)
            }
        }
    }

    /// Abandon all the operations of the transaction.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn write_commit(&mut self) -> Result<()> {
        let env = self.env;
        let store = env.store();
        let page_size = store.page_size();
        let mut freelist = env.freelist().lock();

        // the previous chain is superseded by the one written below
        let (old_chain, _) = walk_chain(
            |pgno| store.read_page(pgno, self.base.next_pgno, true),
            self.base.free_root,
            self.base.free_chain_len,
        )?;
        self.retired.extend(old_chain);

        // allocating chain pages can shrink the list it has to hold
        let mut chain = Vec::new();
        loop {
            let count = freelist.reusable_count()
                + freelist.pending_count()
                + self.retired.len()
                + self.loose.len();
            if chain.len() >= chain_len(count, page_size) {
                break;
            }
            let pgno = self.allocate_from(&mut freelist)?;
            chain.push(pgno);
        }
        let mut ids = freelist.all_ids();
        ids.extend_from_slice(&self.retired);
        ids.extend_from_slice(&self.loose);
        let mut chunks = ids.chunks(ids_per_page(page_size));
        for (i, &pgno) in chain.iter().enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(0);
            let buf = encode_chain_page(next, chunks.next().unwrap_or(&[]), page_size, self.txn_id);
            self.dirty.insert(pgno, buf);
        }

        store.ensure_len(self.next_pgno)?;
        let mut pages: Vec<_> = self.dirty.iter_mut().collect();
        pages.sort_unstable_by_key(|(pgno, _)| **pgno);
        for (&pgno, buf) in pages {
            stamp_checksum(buf);
            store.write_page(pgno, buf)?;
        }
        failpoint::check(CommitPoint::BeforeDataSync)?;
        let flags = env.flags();
        if !flags.contains(EnvFlags::NOSYNC) {
            store.sync_data()?;
        }
        failpoint::check(CommitPoint::AfterDataSync)?;

        let meta = Meta {
            txn_id: self.txn_id,
            page_size: page_size as u32,
            next_pgno: self.next_pgno,
            free_root: chain.first().copied().unwrap_or(0),
            free_chain_len: chain.len() as u64,
            dbs: mem::take(&mut self.dbs),
        };
        store.write_meta(&meta)?;
        if !flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            store.sync_data()?;
        }
        env.publish(Arc::new(meta));

        let written = self.dirty.len();
        let retired = self.retired.len();
        freelist.retire(self.txn_id, mem::take(&mut self.retired));
        freelist.give_back(&mem::take(&mut self.loose));
        self.reused.clear();
        self.dirty.clear();
        let reclaimed = freelist.reclaim(env.oldest_reader());
        debug!(
            "committed txn {}: {} page(s) written, {} retired, {} reclaimed, {} chain page(s)",
            self.txn_id,
            written,
            retired,
            reclaimed,
            chain.len()
        );
        Ok(())
    }

    /// Discards every change and returns borrowed free pages.
    fn rollback(&mut self) {
        if !self.reused.is_empty() {
            self.env.freelist().lock().give_back(&self.reused);
        }
        debug!("aborted txn {}: {} dirty page(s) discarded", self.txn_id, self.dirty.len());
        self.dirty.clear();
        self.reused.clear();
        self.loose.clear();
        self.retired.clear();
        self.state = TxnState::Aborted;
    }

    fn allocate_from(&mut self, freelist: &mut FreeList) -> Result<PageId> {
        if let Some(pgno) = self.loose.pop() {
            trace!("txn {} reuses loose page {}", self.txn_id, pgno);
            return Ok(pgno);
        }
        if let Some(pgno) = freelist.pop_reusable() {
            trace!("txn {} reuses free page {}", self.txn_id, pgno);
            self.reused.push(pgno);
            return Ok(pgno);
        }
        if self.next_pgno >= self.env.store().max_pages() {
            return Err(Error::OutOfSpace);
        }
        let pgno = self.next_pgno;
        self.next_pgno += 1;
        Ok(pgno)
    }
}

impl PageSource for RwTransaction<'_> {
    fn page(&self, pgno: PageId) -> Result<Page<'_>> {
        if let Some(buf) = self.dirty.get(&pgno) {
            return Page::new(pgno, buf);
        }
        let verify = self.env.flags().contains(EnvFlags::CHECKSUM);
        self.env.store().read_page(pgno, self.base.next_pgno, verify)
    }
}

impl NodeStore for RwTransaction<'_> {
    fn page_size(&self) -> usize {
        self.env.store().page_size()
    }

    fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    fn is_dirty(&self, pgno: PageId) -> bool {
        self.dirty.contains_key(&pgno)
    }

    fn allocate(&mut self) -> Result<PageId> {
        let env = self.env;
        let mut freelist = env.freelist().lock();
        self.allocate_from(&mut freelist)
    }

    fn write_page(&mut self, pgno: PageId, data: Vec<u8>) {
        self.dirty.insert(pgno, data);
    }

    fn free(&mut self, pgno: PageId) {
        if self.dirty.remove(&pgno).is_some() {
            self.loose.push(pgno);
        } else {
            self.retired.push(pgno);
        }
    }
}

impl Transaction for RwTransaction<'_> {
    fn id(&self) -> TxnId {
        self.txn_id
    }

    fn state(&self) -> TxnState {
        self.state
    }

    fn databases(&self) -> Result<&[DbInfo]> {
        self.check_active()?;
        Ok(&self.dbs)
    }
}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxnState::WriteActive | TxnState::Committing) {
            warn!("write txn {} dropped without commit or abort", self.txn_id);
            self.rollback();
        }
    }
}
