//! Data file and its read-only memory map.
//!
//! Readers borrow page bytes straight out of the map. The writer never
//! touches the map; it writes whole pages with positioned writes, which the
//! shared page cache makes visible through the map. The map always covers
//! `map_size` bytes, while the file only grows up to the last allocated page,
//! so every page read is bounded by the snapshot's `next_pgno`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, info};
use memmap2::{Mmap, MmapOptions};

use crate::constants::{MAX_PAGE_SIZE, META_PAGES, MIN_PAGE_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::failpoint::{self, CommitPoint};
use crate::meta::{select_meta, Meta};
use crate::page::{stamp_checksum, Node, Page, PageId, PAGE_HEADER_SIZE};

/// Bytes needed to find the page size in a meta slot.
const META_PEEK: usize = PAGE_HEADER_SIZE + 16;

pub(crate) struct PageStore {
    file: File,
    map: Mmap,
    page_size: usize,
    map_size: usize,
}

impl PageStore {
    /// Opens or creates the data file and returns it with its current meta.
    ///
    /// `page_size` is only a request: an existing file keeps its own page
    /// size, and an explicit request that disagrees with it fails.
    pub(crate) fn open(path: &Path, page_size: Option<usize>, map_size: usize, read_only: bool) -> Result<(Self, Meta)> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true).create(true);
        }
        let file = options.open(path)?;

        let page_size = if file.metadata()?.len() == 0 {
            if read_only {
                return Err(Error::Invalid);
            }
            let page_size = page_size.unwrap_or(PAGE_SIZE);
            init_file(&file, page_size)?;
            info!("created data file {} with page size {}", path.display(), page_size);
            page_size
        } else {
            let found = detect_page_size(&file)?;
            if let Some(expected) = page_size {
                if expected != found {
                    return Err(Error::Incompatible { expected, found });
                }
            }
            found
        };

        let file_len = file.metadata()?.len() as usize;
        if file_len < (META_PAGES + 1) * page_size {
            return Err(Error::Invalid);
        }
        // an existing file larger than the requested map wins
        let map_size = map_size.max(file_len);
        let map = unsafe { MmapOptions::new().len(map_size).map(&file)? };
        let store = PageStore { file, map, page_size, map_size };
        let meta = store.read_meta()?;
        debug!(
            "opened {} at txn {}, {} page(s) in file",
            path.display(),
            meta.txn_id,
            file_len / page_size
        );
        Ok((store, meta))
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map_size
    }

    /// Pages the map can address.
    pub(crate) fn max_pages(&self) -> PageId {
        (self.map_size / self.page_size) as PageId
    }

    /// Raw bytes of page `pgno` out of the map.
    pub(crate) fn page_bytes(&self, pgno: PageId) -> Result<&[u8]> {
        let start = (pgno as usize)
            .checked_mul(self.page_size)
            .ok_or(Error::InvalidPageId(pgno))?;
        self.map
            .get(start..start + self.page_size)
            .ok_or(Error::InvalidPageId(pgno))
    }

    /// Page `pgno` of the snapshot whose first unallocated page is
    /// `next_pgno`. Meta slots are not tree pages and are refused.
    pub(crate) fn read_page(&self, pgno: PageId, next_pgno: PageId, verify: bool) -> Result<Page<'_>> {
        if pgno < META_PAGES as PageId || pgno >= next_pgno {
            return Err(Error::InvalidPageId(pgno));
        }
        let page = Page::new(pgno, self.page_bytes(pgno)?)?;
        if verify && !page.verify_checksum() {
            return Err(Error::CorruptPage { pgno, reason: "checksum mismatch" });
        }
        Ok(page)
    }

    pub(crate) fn read_meta(&self) -> Result<Meta> {
        let meta = select_meta(
            Meta::decode(0, self.page_bytes(0)?),
            Meta::decode(1, self.page_bytes(1)?),
        )?;
        if meta.page_size as usize != self.page_size {
            return Err(Error::Invalid);
        }
        Ok(meta)
    }

    pub(crate) fn write_page(&self, pgno: PageId, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        self.file.write_all_at(data, pgno * self.page_size as u64)?;
        Ok(())
    }

    /// Extends the file so pages below `next_pgno` exist.
    pub(crate) fn ensure_len(&self, next_pgno: PageId) -> Result<()> {
        let needed = next_pgno * self.page_size as u64;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        Ok(())
    }

    /// Writes `meta` into its slot.
    pub(crate) fn write_meta(&self, meta: &Meta) -> Result<()> {
        let buf = meta.encode(self.page_size);
        let offset = (meta.slot() * self.page_size) as u64;
        if failpoint::is_armed(CommitPoint::TornMeta) {
            // header and format fields land, txn id and roots do not
            self.file.write_all_at(&buf[..META_PEEK], offset)?;
            return Err(failpoint::injected(CommitPoint::TornMeta));
        }
        self.file.write_all_at(&buf, offset)?;
        Ok(())
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes a standalone copy of the snapshot described by `meta`.
    pub(crate) fn copy_to(&self, dest: &Path, meta: &Meta) -> Result<()> {
        let out = OpenOptions::new().write(true).create_new(true).open(dest)?;
        let slot = meta.encode(self.page_size);
        out.write_all_at(&slot, 0)?;
        out.write_all_at(&slot, self.page_size as u64)?;
        for pgno in META_PAGES as PageId..meta.next_pgno {
            out.write_all_at(self.page_bytes(pgno)?, pgno * self.page_size as u64)?;
        }
        out.sync_all()?;
        Ok(())
    }
}

/// Writes both meta slots and the empty main root of a new file.
fn init_file(file: &File, page_size: usize) -> Result<()> {
    let main_root = META_PAGES as PageId;
    let meta = Meta::initial(page_size, main_root);
    let slot = meta.encode(page_size);
    file.write_all_at(&slot, 0)?;
    file.write_all_at(&slot, page_size as u64)?;
    let mut root = Node::empty_leaf().encode(page_size, 0);
    stamp_checksum(&mut root);
    file.write_all_at(&root, main_root * page_size as u64)?;
    file.sync_all()?;
    Ok(())
}

/// Reads the page size from slot 0, or from slot 1 when slot 0 is damaged.
fn detect_page_size(file: &File) -> Result<usize> {
    let valid = |size: usize| (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two();
    let mut head = [0u8; META_PEEK];
    match file.read_exact_at(&mut head, 0) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(Error::Invalid),
        Err(e) => return Err(e.into()),
    }
    if let Some(size) = Meta::peek_page_size(&head).filter(|&s| valid(s)) {
        return Ok(size);
    }
    let mut size = MIN_PAGE_SIZE;
    while size <= MAX_PAGE_SIZE {
        if file.read_exact_at(&mut head, size as u64).is_ok()
            && Meta::peek_page_size(&head) == Some(size)
        {
            return Ok(size);
        }
        size *= 2;
    }
    Err(Error::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mdb");
        {
            let (store, meta) = PageStore::open(&path, Some(1024), 1 << 20, false).unwrap();
            assert_eq!(store.page_size(), 1024);
            assert_eq!(meta.txn_id, 0);
            assert_eq!(meta.next_pgno, 3);
            assert_eq!(meta.dbs[0].root, 2);
            assert_eq!(store.max_pages(), 1024);
        }
        let (store, meta) = PageStore::open(&path, None, 1 << 20, true).unwrap();
        assert_eq!(store.page_size(), 1024);
        assert_eq!(meta.dbs.len(), 1);
        assert!(matches!(store.page_bytes(5000), Err(Error::InvalidPageId(5000))));
        assert!(matches!(store.read_page(1, meta.next_pgno, true), Err(Error::InvalidPageId(1))));
        assert!(matches!(store.read_page(3, meta.next_pgno, true), Err(Error::InvalidPageId(3))));
        assert!(store.read_page(2, meta.next_pgno, true).unwrap().is_empty());

        let mismatch = PageStore::open(&path, Some(4096), 1 << 20, false);
        assert!(matches!(mismatch, Err(Error::Incompatible { expected: 4096, found: 1024 })));
    }

    #[test]
    fn test_damaged_slot_zero_uses_slot_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mdb");
        drop(PageStore::open(&path, Some(2048), 1 << 20, false).unwrap());

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0u8; 64], 0).unwrap();
        drop(file);

        let (store, meta) = PageStore::open(&path, None, 1 << 20, false).unwrap();
        assert_eq!(store.page_size(), 2048);
        assert_eq!(meta.txn_id, 0);
    }

    #[test]
    fn test_read_only_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let res = PageStore::open(&dir.path().join("nope.mdb"), None, 1 << 20, true);
        assert!(res.is_err());
    }
}
