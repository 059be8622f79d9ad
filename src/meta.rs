//! Meta pages.
//!
//! Pages 0 and 1 are the two meta slots. A commit of txn `n` writes slot
//! `n % 2`, so the slot holding the previous commit is never touched while
//! the new one is written. On open the valid slot with the higher txn id
//! wins; a torn or corrupted slot simply loses the election.
//!
//! ```text
//! Offset  Size   Field (after the 24 byte page header)
//! ------  ----   -----
//! 24      4      Magic
//! 28      4      Format version
//! 32      4      Page size
//! 36      4      Number of databases
//! 40      8      Transaction id
//! 48      8      Next unallocated page
//! 56      8      Free-list chain head (0 = none)
//! 64      8      Free-list chain length in pages
//! 72      ..     Database records
//! ```
//!
//! Database record: `name_len u16 | root u64 | depth u32 | entries u64 | name`.

use log::warn;

use crate::constants::{FORMAT_VERSION, MDB_MAGIC};
use crate::error::{Error, Result};
use crate::page::{
    init_header, read_u16, read_u32, read_u64, stamp_checksum, Page, PageId, PageKind, TxnId,
    PAGE_HEADER_SIZE,
};

const BODY: usize = PAGE_HEADER_SIZE;
const DBS_OFFSET: usize = BODY + 48;
const DB_RECORD_FIXED: usize = 2 + 8 + 4 + 8;

/// Database info recorded in the meta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    /// Database name; `None` for the main database
    pub name: Option<String>,
    /// Root page number
    pub root: PageId,
    /// Depth of B-tree
    pub depth: u32,
    /// Number of data entries
    pub entries: u64,
}

impl DbInfo {
    pub(crate) fn new(name: Option<String>, root: PageId) -> Self {
        Self { name, root, depth: 1, entries: 0 }
    }

    fn encoded_len(&self) -> usize {
        DB_RECORD_FIXED + self.name.as_ref().map_or(0, |n| n.len())
    }
}

/// Committed state of the environment as stored in a meta slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Meta {
    /// txnid that committed this meta
    pub(crate) txn_id: TxnId,
    /// Page size for this environment
    pub(crate) page_size: u32,
    /// First page number never handed out
    pub(crate) next_pgno: PageId,
    /// First page of the persisted free list
    pub(crate) free_root: PageId,
    /// Number of pages in the free-list chain
    pub(crate) free_chain_len: u64,
    /// Main database first, named databases after it
    pub(crate) dbs: Vec<DbInfo>,
}

impl Meta {
    /// Meta of a freshly created file whose main database root is `main_root`.
    pub(crate) fn initial(page_size: usize, main_root: PageId) -> Self {
        Self {
            txn_id: 0,
            page_size: page_size as u32,
            next_pgno: main_root + 1,
            free_root: 0,
            free_chain_len: 0,
            dbs: vec![DbInfo::new(None, main_root)],
        }
    }

    /// Slot this meta lives in
    pub(crate) fn slot(&self) -> usize {
        (self.txn_id % 2) as usize
    }

    pub(crate) fn encoded_len(&self) -> usize {
        table_len(&self.dbs)
    }

    /// Index of the database with the given name.
    pub(crate) fn find_db(&self, name: Option<&str>) -> Option<usize> {
        self.dbs.iter().position(|db| db.name.as_deref() == name)
    }

    pub(crate) fn encode(&self, page_size: usize) -> Vec<u8> {
        debug_assert!(self.encoded_len() <= page_size);
        let mut buf = vec![0u8; page_size];
        init_header(&mut buf, PageKind::Meta, 0, self.txn_id);

        buf[BODY..BODY + 4].copy_from_slice(&MDB_MAGIC.to_le_bytes());
        buf[BODY + 4..BODY + 8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[BODY + 8..BODY + 12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[BODY + 12..BODY + 16].copy_from_slice(&(self.dbs.len() as u32).to_le_bytes());
        buf[BODY + 16..BODY + 24].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[BODY + 24..BODY + 32].copy_from_slice(&self.next_pgno.to_le_bytes());
        buf[BODY + 32..BODY + 40].copy_from_slice(&self.free_root.to_le_bytes());
        buf[BODY + 40..BODY + 48].copy_from_slice(&self.free_chain_len.to_le_bytes());

        let mut at = DBS_OFFSET;
        for db in &self.dbs {
            let name = db.name.as_deref().unwrap_or("").as_bytes();
            buf[at..at + 2].copy_from_slice(&(name.len() as u16).to_le_bytes());
            buf[at + 2..at + 10].copy_from_slice(&db.root.to_le_bytes());
            buf[at + 10..at + 14].copy_from_slice(&db.depth.to_le_bytes());
            buf[at + 14..at + 22].copy_from_slice(&db.entries.to_le_bytes());
            at += DB_RECORD_FIXED;
            buf[at..at + name.len()].copy_from_slice(name);
            at += name.len();
        }

        stamp_checksum(&mut buf);
        buf
    }

    /// Decodes one meta slot, validating kind, checksum and magic.
    pub(crate) fn decode(pgno: PageId, data: &[u8]) -> Result<Self> {
        let page = Page::new(pgno, data)?;
        if page.kind() != PageKind::Meta {
            return Err(Error::Invalid);
        }
        if read_u32(data, BODY) != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if !page.verify_checksum() {
            return Err(Error::CorruptPage { pgno, reason: "meta checksum mismatch" });
        }
        if read_u32(data, BODY + 4) != FORMAT_VERSION {
            return Err(Error::VersionMismatch);
        }

        let ndbs = read_u32(data, BODY + 12) as usize;
        let mut dbs = Vec::with_capacity(ndbs);
        let mut at = DBS_OFFSET;
        for i in 0..ndbs {
            if at + DB_RECORD_FIXED > data.len() {
                return Err(Error::CorruptPage { pgno, reason: "database table overruns meta" });
            }
            let name_len = read_u16(data, at) as usize;
            let root = read_u64(data, at + 2);
            let depth = read_u32(data, at + 10);
            let entries = read_u64(data, at + 14);
            at += DB_RECORD_FIXED;
            let name_bytes = data
                .get(at..at + name_len)
                .ok_or(Error::CorruptPage { pgno, reason: "database name overruns meta" })?;
            at += name_len;
            let name = if i == 0 {
                None
            } else {
                let s = std::str::from_utf8(name_bytes)
                    .map_err(|_| Error::CorruptPage { pgno, reason: "database name not UTF-8" })?;
                Some(s.to_owned())
            };
            dbs.push(DbInfo { name, root, depth, entries });
        }
        if dbs.is_empty() {
            return Err(Error::CorruptPage { pgno, reason: "meta without main database" });
        }

        Ok(Meta {
            txn_id: read_u64(data, BODY + 16),
            page_size: read_u32(data, BODY + 8),
            next_pgno: read_u64(data, BODY + 24),
            free_root: read_u64(data, BODY + 32),
            free_chain_len: read_u64(data, BODY + 40),
            dbs,
        })
    }

    /// Page size recorded in a meta slot, read before the page size is known.
    pub(crate) fn peek_page_size(data: &[u8]) -> Option<usize> {
        if data.len() < BODY + 12 || read_u32(data, BODY) != MDB_MAGIC {
            return None;
        }
        Some(read_u32(data, BODY + 8) as usize)
    }
}

/// Bytes a meta page needs to record `dbs`.
pub(crate) fn table_len(dbs: &[DbInfo]) -> usize {
    DBS_OFFSET + dbs.iter().map(DbInfo::encoded_len).sum::<usize>()
}

/// Picks the current meta out of the two slots.
///
/// A slot that fails validation is skipped with a warning; only when both
/// fail is the error of slot 0 returned.
pub(crate) fn select_meta(slot0: Result<Meta>, slot1: Result<Meta>) -> Result<Meta> {
    match (slot0, slot1) {
        (Ok(a), Ok(b)) => Ok(if b.txn_id > a.txn_id { b } else { a }),
        (Ok(a), Err(e)) => {
            warn!("meta slot 1 rejected ({}), using slot 0 at txn {}", e, a.txn_id);
            Ok(a)
        }
        (Err(e), Ok(b)) => {
            warn!("meta slot 0 rejected ({}), using slot 1 at txn {}", e, b.txn_id);
            Ok(b)
        }
        (Err(e), Err(_)) => Err(e),
    }
}
