use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, trace};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::constants::{
    DbFlags, EnvFlags, CHANGEABLE, DATA_FILE_NAME, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS,
    DEFAULT_MAX_READERS, MAX_DB_NAME, MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE, VERSION_MAJOR,
    VERSION_MINOR, VERSION_PATCH,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::freelist::{walk_chain, FreeList};
use crate::meta::Meta;
use crate::page::{max_key_size, TxnId};
use crate::store::PageStore;
use crate::transaction::{RoTransaction, RwTransaction, Transaction};
use crate::types::{EnvInfo, ReaderInfo, Stat};

/// Data files open in this process. A second environment on the same file
/// would run its own writer lock and free list.
static OPEN_ENVS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Snapshots pinned by live read transactions
#[derive(Debug, Default)]
struct ReaderTable {
    pins: BTreeMap<TxnId, usize>,
    total: usize,
}

impl ReaderTable {
    fn pin(&mut self, txn_id: TxnId) {
        *self.pins.entry(txn_id).or_insert(0) += 1;
        self.total += 1;
    }

    fn unpin(&mut self, txn_id: TxnId) {
        if let Some(count) = self.pins.get_mut(&txn_id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&txn_id);
            }
            self.total -= 1;
        }
    }

    fn oldest(&self) -> Option<TxnId> {
        self.pins.keys().next().copied()
    }
}

/// Options for opening an [`Environment`]
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    flags: EnvFlags,
    max_readers: u32,
    max_dbs: u32,
    map_size: usize,
    page_size: Option<usize>,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        EnvironmentBuilder {
            flags: EnvFlags::empty(),
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
            map_size: DEFAULT_MAP_SIZE,
            page_size: None,
        }
    }
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set environment flags
    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the maximum number of concurrent read transactions
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    /// Set the size of the memory map, which bounds the data file.
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.map_size = size;
        self
    }

    /// Page size for a new data file. An existing file keeps its own.
    pub fn set_page_size(&mut self, size: usize) -> &mut Self {
        self.page_size = Some(size);
        self
    }

    /// Open the environment.
    ///
    /// `path` is a directory holding the data file, created if missing, or
    /// the data file itself with `EnvFlags::NO_SUB_DIR`.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Environment> {
        if let Some(size) = self.page_size {
            if !size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) {
                return Err(Error::EnvInvalidConfig("page size must be a power of two in 512..=65536"));
            }
        }
        if self.max_readers == 0 {
            return Err(Error::EnvInvalidConfig("max_readers must be at least 1"));
        }

        let path = path.as_ref();
        let read_only = self.flags.contains(EnvFlags::RDONLY);
        let data_path = if self.flags.contains(EnvFlags::NO_SUB_DIR) {
            path.to_path_buf()
        } else {
            if !read_only {
                fs::create_dir_all(path)?;
            }
            path.join(DATA_FILE_NAME)
        };

        let registry_key = registry_key(&data_path)?;
        if !OPEN_ENVS.lock().insert(registry_key.clone()) {
            return Err(Error::EnvAlreadyOpen);
        }
        match self.open_registered(&data_path, registry_key.clone()) {
            Ok(env) => Ok(env),
            Err(e) => {
                OPEN_ENVS.lock().remove(&registry_key);
                Err(e)
            }
        }
    }

    fn open_registered(&self, data_path: &Path, registry_key: PathBuf) -> Result<Environment> {
        let read_only = self.flags.contains(EnvFlags::RDONLY);
        let (store, meta) = PageStore::open(data_path, self.page_size, self.map_size, read_only)?;
        let (chain, ids) = walk_chain(
            |pgno| store.read_page(pgno, meta.next_pgno, true),
            meta.free_root,
            meta.free_chain_len,
        )?;
        info!(
            "opened environment {} at txn {}: {} page(s), {} free in {} chain page(s)",
            data_path.display(),
            meta.txn_id,
            meta.next_pgno,
            ids.len(),
            chain.len()
        );

        Ok(Environment {
            path: data_path.to_path_buf(),
            registry_key,
            flags: self.flags,
            max_readers: self.max_readers,
            max_dbs: self.max_dbs,
            store,
            meta: RwLock::new(Arc::new(meta)),
            writer: Mutex::new(()),
            readers: Mutex::new(ReaderTable::default()),
            freelist: Mutex::new(FreeList::from_persisted(ids)),
            closed: false,
        })
    }
}

/// Canonical name of a data file that may not exist yet.
fn registry_key(data_path: &Path) -> Result<PathBuf> {
    let file_name = data_path
        .file_name()
        .ok_or(Error::EnvInvalidConfig("path has no file name"))?;
    let dir = match data_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    Ok(fs::canonicalize(dir)?.join(file_name))
}

/// An open data file shared by one writer and many readers
pub struct Environment {
    /// Path to the data file
    path: PathBuf,
    registry_key: PathBuf,
    flags: EnvFlags,
    max_readers: u32,
    max_dbs: u32,
    store: PageStore,
    /// Latest committed meta
    meta: RwLock<Arc<Meta>>,
    /// Held by the write transaction
    writer: Mutex<()>,
    readers: Mutex<ReaderTable>,
    freelist: Mutex<FreeList>,
    closed: bool,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Open with default options
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Environment> {
        EnvironmentBuilder::new().open(path)
    }

    /// Begin a read-only transaction on the latest committed snapshot.
    /// Never blocks; fails with `ReadersFull` at `max_readers`.
    pub fn begin_ro_txn(&self) -> Result<RoTransaction<'_>> {
        RoTransaction::new(self)
    }

    /// Begin the write transaction; `WriterBusy` if one is already active.
    pub fn begin_rw_txn(&self) -> Result<RwTransaction<'_>> {
        RwTransaction::new(self)
    }

    /// Open a database by name, `None` being the main database.
    ///
    /// With `DbFlags::CREATE` a missing database is created in a write
    /// transaction of its own.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        if let Some(name) = name {
            if name.is_empty() || name.len() > MAX_DB_NAME {
                return Err(Error::BadValSize);
            }
            if self.max_dbs == 0 {
                return Err(Error::TooManyDatabases);
            }
        }
        if let Some(i) = self.current_meta().find_db(name) {
            return Ok(Database::new(i as u32));
        }
        let name = match name {
            Some(name) if flags.contains(DbFlags::CREATE) => name,
            _ => return Err(Error::DbNotFound),
        };
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        let mut txn = self.begin_rw_txn()?;
        let db = txn.create_db(name)?;
        txn.commit()?;
        info!("created database {:?} as dbi {}", name, db.dbi());
        Ok(db)
    }

    /// Flush the data file to disk.
    ///
    /// Commits already sync unless `NOSYNC` or `NOMETASYNC` is set; this is
    /// for environments that skip those syncs. With `force` false the call
    /// does nothing under `NOSYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            self.store.sync_all()?;
        }
        Ok(())
    }

    /// Set or clear `NOSYNC`/`NOMETASYNC`. Other flags are fixed at open.
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::EnvFlagsImmutable);
        }
        if onoff {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
        Ok(())
    }

    pub fn flags(&self) -> EnvFlags {
        self.flags
    }

    /// Path of the data file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Largest key `put` accepts at this page size
    pub fn max_key_size(&self) -> usize {
        max_key_size(self.store.page_size())
    }

    /// Live read transactions
    pub fn reader_count(&self) -> usize {
        self.readers.lock().total
    }

    /// Pinned snapshots, oldest first
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers
            .lock()
            .pins
            .iter()
            .map(|(&txn_id, &count)| ReaderInfo { txn_id, count })
            .collect()
    }

    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_string() -> String {
        format!("lumokv {}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Statistics of the main database
    pub fn stat(&self) -> Result<Stat> {
        self.begin_ro_txn()?.stat(Database::main())
    }

    /// Page accounting of the latest committed state.
    ///
    /// Pages handed to an active write transaction count as in use.
    pub fn info(&self) -> EnvInfo {
        // commits publish under the free-list lock
        let (meta, free, pending) = {
            let freelist = self.freelist.lock();
            (self.current_meta(), freelist.reusable_count() as u64, freelist.pending_count() as u64)
        };
        let pages_in_use = meta
            .next_pgno
            .saturating_sub(META_PAGES as u64 + meta.free_chain_len + free);
        EnvInfo {
            map_size: self.store.map_size(),
            page_size: self.store.page_size(),
            last_pgno: meta.next_pgno - 1,
            last_txnid: meta.txn_id,
            pages_in_use,
            free_pages: free,
            pending_pages: pending,
            free_chain_pages: meta.free_chain_len,
            max_readers: self.max_readers,
            num_readers: self.reader_count() as u32,
        }
    }

    /// Copy the latest committed snapshot to a new environment at `path`
    /// (a directory, or the file itself under `NO_SUB_DIR`). Writers may
    /// keep committing meanwhile.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let dest = if self.flags.contains(EnvFlags::NO_SUB_DIR) {
            path.to_path_buf()
        } else {
            fs::create_dir_all(path)?;
            path.join(DATA_FILE_NAME)
        };
        let txn = self.begin_ro_txn()?;
        self.store.copy_to(&dest, txn.snapshot())?;
        info!("copied txn {} to {}", txn.id(), dest.display());
        Ok(())
    }

    /// Close the environment.
    ///
    /// Every transaction borrows the environment, so this can only observe
    /// live ones that were leaked with `mem::forget`; those are reported as
    /// `ResourceLeak`.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let leaked = self.live_transactions();
        if leaked > 0 {
            error!("environment {} closed with {} live transaction(s)", self.path.display(), leaked);
            return Err(Error::ResourceLeak { readers: leaked });
        }
        info!("closed environment {}", self.path.display());
        Ok(())
    }

    fn live_transactions(&self) -> usize {
        self.readers.lock().total + usize::from(self.writer.is_locked())
    }

    pub(crate) fn store(&self) -> &PageStore {
        &self.store
    }

    pub(crate) fn freelist(&self) -> &Mutex<FreeList> {
        &self.freelist
    }

    pub(crate) fn current_meta(&self) -> Arc<Meta> {
        self.meta.read().clone()
    }

    pub(crate) fn publish(&self, meta: Arc<Meta>) {
        trace!("publishing txn {}", meta.txn_id);
        *self.meta.write() = meta;
    }

    pub(crate) fn try_lock_writer(&self) -> Option<MutexGuard<'_, ()>> {
        self.writer.try_lock()
    }

    /// Pins the current snapshot. The meta is read under the reader-table
    /// lock so a concurrent reclaim sees the pin.
    pub(crate) fn acquire_reader(&self) -> Result<Arc<Meta>> {
        let mut readers = self.readers.lock();
        if readers.total >= self.max_readers as usize {
            return Err(Error::ReadersFull);
        }
        let meta = self.current_meta();
        readers.pin(meta.txn_id);
        Ok(meta)
    }

    /// Unpins a snapshot and reclaims what it held back. The free-list lock
    /// is held across both steps so a commit cannot retire pages against a
    /// reader table that changed since `oldest` was read.
    pub(crate) fn release_reader(&self, txn_id: TxnId) {
        let mut freelist = self.freelist.lock();
        let oldest = {
            let mut readers = self.readers.lock();
            readers.unpin(txn_id);
            readers.oldest()
        };
        let reclaimed = freelist.reclaim(oldest);
        drop(freelist);
        if reclaimed > 0 {
            debug!("reader on txn {} ended, {} page(s) reclaimed", txn_id, reclaimed);
        }
    }

    pub(crate) fn oldest_reader(&self) -> Option<TxnId> {
        self.readers.lock().oldest()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("page_size", &self.store.page_size())
            .field("map_size", &self.store.map_size())
            .finish()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.closed && !std::thread::panicking() {
            let leaked = self.live_transactions();
            debug_assert!(leaked == 0, "environment dropped with {} live transaction(s)", leaked);
        }
        OPEN_ENVS.lock().remove(&self.registry_key);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::constants::WriteFlags;

    #[test]
    fn test_reader_table() {
        let mut table = ReaderTable::default();
        table.pin(4);
        table.pin(4);
        table.pin(6);
        assert_eq!(table.oldest(), Some(4));
        table.unpin(4);
        assert_eq!(table.oldest(), Some(4));
        table.unpin(4);
        assert_eq!(table.oldest(), Some(6));
        table.unpin(6);
        assert_eq!(table.oldest(), None);
        assert_eq!(table.total, 0);
    }

    #[test]
    fn test_reader_ending_during_commit() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        txn.put(Database::main(), b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let reusable = env.freelist.lock().reusable_count();
        let ending = env.begin_ro_txn().unwrap();
        let staying = thread::scope(|s| {
            // stands in for a commit holding the free list
            let mut freelist = env.freelist.lock();
            s.spawn(move || drop(ending));
            thread::sleep(Duration::from_millis(50));
            let staying = env.begin_ro_txn().unwrap();
            freelist.retire(staying.id() + 1, vec![900, 901, 902]);
            drop(freelist);
            staying
        });

        // the ended reader must not release pages the new one can see
        assert_eq!(env.freelist.lock().pending_count(), 3);
        assert_eq!(env.reader_list()[0].txn_id, staying.id());
        drop(staying);
        let freelist = env.freelist.lock();
        assert_eq!(freelist.pending_count(), 0);
        assert_eq!(freelist.reusable_count(), reusable + 3);
    }

    #[test]
    fn test_info_sees_commit_as_a_whole() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        let before = env.info();

        let after = thread::scope(|s| {
            // stands in for a commit that grew the file by three free pages
            let mut freelist = env.freelist.lock();
            let reader = s.spawn(|| env.info());
            thread::sleep(Duration::from_millis(50));
            let old = env.current_meta();
            let grown = old.next_pgno + 3;
            env.publish(Arc::new(Meta { txn_id: old.txn_id + 1, next_pgno: grown, ..(*old).clone() }));
            freelist.give_back(&[grown - 3, grown - 2, grown - 1]);
            drop(freelist);
            reader.join().unwrap()
        });

        assert_eq!(after.last_txnid, before.last_txnid + 1);
        assert_eq!(after.last_pgno, before.last_pgno + 3);
        assert_eq!(after.free_pages, before.free_pages + 3);
        assert_eq!(after.pages_in_use, before.pages_in_use);
    }

    #[test]
    fn test_same_file_twice() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        assert!(matches!(Environment::open(dir.path()), Err(Error::EnvAlreadyOpen)));
        env.close().unwrap();
        Environment::open(dir.path()).unwrap();
    }

    #[test]
    fn test_builder_validation() {
        let dir = TempDir::new().unwrap();
        let res = EnvironmentBuilder::new().set_page_size(1000).open(dir.path());
        assert!(matches!(res, Err(Error::EnvInvalidConfig(_))));
        let res = EnvironmentBuilder::new().set_max_readers(0).open(dir.path());
        assert!(matches!(res, Err(Error::EnvInvalidConfig(_))));
    }

    #[test]
    fn test_readers_full() {
        let dir = TempDir::new().unwrap();
        let env = EnvironmentBuilder::new().set_max_readers(2).open(dir.path()).unwrap();
        let a = env.begin_ro_txn().unwrap();
        let _b = env.begin_ro_txn().unwrap();
        assert!(matches!(env.begin_ro_txn(), Err(Error::ReadersFull)));
        drop(a);
        env.begin_ro_txn().unwrap();
    }

    #[test]
    fn test_set_flags() {
        let dir = TempDir::new().unwrap();
        let mut env = Environment::open(dir.path()).unwrap();
        env.set_flags(EnvFlags::NOSYNC, true).unwrap();
        assert!(env.flags().contains(EnvFlags::NOSYNC));
        env.set_flags(EnvFlags::NOSYNC, false).unwrap();
        assert!(!env.flags().contains(EnvFlags::NOSYNC));
        assert!(matches!(env.set_flags(EnvFlags::RDONLY, true), Err(Error::EnvFlagsImmutable)));
    }

    #[test]
    fn test_close_reports_leaked_reader() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path()).unwrap();
        std::mem::forget(env.begin_ro_txn().unwrap());
        assert_eq!(env.reader_count(), 1);
        assert!(matches!(env.close(), Err(Error::ResourceLeak { readers: 1 })));
    }

    #[test]
    fn test_copy_is_consistent() {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path().join("src")).unwrap();
        let mut txn = env.begin_rw_txn().unwrap();
        for i in 0..500u32 {
            txn.put(Database::main(), &i.to_be_bytes(), b"payload", WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();

        env.copy(dir.path().join("backup")).unwrap();
        let copy = Environment::open(dir.path().join("backup")).unwrap();
        let txn = copy.begin_ro_txn().unwrap();
        assert_eq!(txn.stat(Database::main()).unwrap().entries, 500);
        assert_eq!(txn.get(Database::main(), &42u32.to_be_bytes()).unwrap(), b"payload");
    }
}
