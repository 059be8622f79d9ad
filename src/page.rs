//! Page layout.
//!
//! Every page starts with a 24 byte header:
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0       1      Page kind (PageKind)
//! 1       1      Reserved
//! 2       2      Entry count
//! 4       4      Reserved
//! 8       4      CRC-32 of the page with this field zeroed
//! 12      4      Reserved
//! 16      8      Transaction id that wrote the page
//! ```
//!
//! Branch and leaf pages follow the header with an array of `u16` slot
//! offsets, one per entry. Entries are packed from the end of the page
//! towards the slot array:
//!
//! ```text
//! leaf:   klen u16 | vlen u16 | key | value
//! branch: klen u16 | child u64 | key          (entry 0 has an empty key)
//! ```

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Page number within the data file.
pub type PageId = u64;
/// Transaction identifier; the committed state after txn `n` is snapshot `n`.
pub type TxnId = u64;

/// Page header size in bytes.
pub const PAGE_HEADER_SIZE: usize = 24;

const KIND_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 2;
const CHECKSUM_OFFSET: usize = 8;
const TXNID_OFFSET: usize = 16;

const SLOT_SIZE: usize = 2;
const LEAF_NODE_HEADER: usize = 4;
const BRANCH_NODE_HEADER: usize = 10;

/// Page kinds stored in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Branch = 1,
    Leaf = 2,
    Meta = 3,
    FreeList = 4,
}

impl PageKind {
    fn from_byte(pgno: PageId, byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(PageKind::Branch),
            2 => Ok(PageKind::Leaf),
            3 => Ok(PageKind::Meta),
            4 => Ok(PageKind::FreeList),
            _ => Err(Error::CorruptPage { pgno, reason: "unknown page kind" }),
        }
    }
}

/// Bytes a leaf entry occupies, slot included.
pub(crate) fn leaf_entry_size(key_len: usize, value_len: usize) -> usize {
    SLOT_SIZE + LEAF_NODE_HEADER + key_len + value_len
}

/// Bytes a branch entry occupies, slot included.
pub(crate) fn branch_entry_size(key_len: usize) -> usize {
    SLOT_SIZE + BRANCH_NODE_HEADER + key_len
}

/// Largest entry (slot included) a page of `page_size` accepts; two of them
/// always fit in one page.
pub(crate) fn max_entry_size(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE) / 2
}

/// Branch entries of maximum key size that always fit in one page. An
/// overflowing branch then splits into halves of at least two children.
const MIN_BRANCH_FANOUT: usize = 4;

/// Largest key for a page size, bounded so a branch page holds
/// `MIN_BRANCH_FANOUT` maximum-size entries.
pub(crate) fn max_key_size(page_size: usize) -> usize {
    let by_branch = (page_size - PAGE_HEADER_SIZE) / MIN_BRANCH_FANOUT - SLOT_SIZE - BRANCH_NODE_HEADER;
    by_branch.min(crate::constants::MAX_KEY_SIZE)
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// CRC-32 of a page, computed as if the checksum field were zero.
pub(crate) fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Stamps the checksum of a fully built page buffer.
pub(crate) fn stamp_checksum(data: &mut [u8]) {
    let sum = compute_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
}

/// Writes a blank header of the given kind into `data`.
pub(crate) fn init_header(data: &mut [u8], kind: PageKind, count: u16, txn_id: TxnId) {
    data[..PAGE_HEADER_SIZE].fill(0);
    data[KIND_OFFSET] = kind as u8;
    data[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&count.to_le_bytes());
    data[TXNID_OFFSET..TXNID_OFFSET + 8].copy_from_slice(&txn_id.to_le_bytes());
}

/// Zero-copy view of one page.
///
/// The slice is either a window into the memory map or a dirty buffer owned
/// by the write transaction; in both cases `'a` is bounded by the
/// transaction that produced the view.
#[derive(Clone, Copy)]
pub struct Page<'a> {
    pgno: PageId,
    data: &'a [u8],
    kind: PageKind,
    count: usize,
}

impl<'a> Page<'a> {
    /// Wraps raw page bytes after validating the header.
    pub fn new(pgno: PageId, data: &'a [u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(Error::CorruptPage { pgno, reason: "page shorter than header" });
        }
        let kind = PageKind::from_byte(pgno, data[KIND_OFFSET])?;
        let count = read_u16(data, COUNT_OFFSET) as usize;
        if matches!(kind, PageKind::Branch | PageKind::Leaf)
            && PAGE_HEADER_SIZE + count * SLOT_SIZE > data.len()
        {
            return Err(Error::CorruptPage { pgno, reason: "slot array overruns page" });
        }
        Ok(Page { pgno, data, kind, count })
    }

    /// Page number
    pub fn pgno(&self) -> PageId {
        self.pgno
    }

    /// Page kind
    pub fn kind(&self) -> PageKind {
        self.kind
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == PageKind::Leaf
    }

    /// Transaction that wrote the page
    pub fn txn_id(&self) -> TxnId {
        read_u64(self.data, TXNID_OFFSET)
    }

    /// Raw page bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn verify_checksum(&self) -> bool {
        read_u32(self.data, CHECKSUM_OFFSET) == compute_checksum(self.data)
    }

    fn corrupt(&self, reason: &'static str) -> Error {
        Error::CorruptPage { pgno: self.pgno, reason }
    }

    fn node_offset(&self, index: usize) -> Result<usize> {
        if index >= self.count {
            return Err(self.corrupt("slot index out of range"));
        }
        let off = read_u16(self.data, PAGE_HEADER_SIZE + index * SLOT_SIZE) as usize;
        if off < PAGE_HEADER_SIZE + self.count * SLOT_SIZE {
            return Err(self.corrupt("node overlaps slot array"));
        }
        Ok(off)
    }

    fn slice(&self, start: usize, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(start..start + len)
            .ok_or_else(|| self.corrupt("node runs past page end"))
    }

    /// Key of entry `index`.
    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        let off = self.node_offset(index)?;
        let header = match self.kind {
            PageKind::Leaf => LEAF_NODE_HEADER,
            PageKind::Branch => BRANCH_NODE_HEADER,
            _ => return Err(self.corrupt("keyed access on non-tree page")),
        };
        let klen = read_u16(self.slice(off, 2)?, 0) as usize;
        self.slice(off + header, klen)
    }

    /// Value of leaf entry `index`.
    pub fn value(&self, index: usize) -> Result<&'a [u8]> {
        if self.kind != PageKind::Leaf {
            return Err(self.corrupt("value read on non-leaf page"));
        }
        let off = self.node_offset(index)?;
        let lens = self.slice(off, LEAF_NODE_HEADER)?;
        let klen = read_u16(lens, 0) as usize;
        let vlen = read_u16(lens, 2) as usize;
        self.slice(off + LEAF_NODE_HEADER + klen, vlen)
    }

    /// Key and value of leaf entry `index`.
    pub fn entry(&self, index: usize) -> Result<(&'a [u8], &'a [u8])> {
        Ok((self.key(index)?, self.value(index)?))
    }

    /// Child page of branch entry `index`.
    pub fn child(&self, index: usize) -> Result<PageId> {
        if self.kind != PageKind::Branch {
            return Err(self.corrupt("child read on non-branch page"));
        }
        let off = self.node_offset(index)?;
        Ok(read_u64(self.slice(off + 2, 8)?, 0))
    }

    /// Binary search of a leaf: `Ok(i)` on an exact match, `Err(i)` with the
    /// insertion point otherwise.
    pub fn search(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        let (mut lo, mut hi) = (0, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid)?.cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the branch entry whose subtree may contain `key`.
    pub fn child_index(&self, key: &[u8]) -> Result<usize> {
        if self.count == 0 {
            return Err(self.corrupt("empty branch page"));
        }
        // separator 0 is implicit, so search 1..count
        let (mut lo, mut hi) = (1, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key(mid)? <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo - 1)
    }
}

impl std::fmt::Debug for Page<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("pgno", &self.pgno)
            .field("kind", &self.kind)
            .field("count", &self.count)
            .field("txn_id", &self.txn_id())
            .finish()
    }
}

/// Decoded, owned form of a tree page used by the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Leaf(Vec<(Vec<u8>, Vec<u8>)>),
    Branch(Vec<(Vec<u8>, PageId)>),
}

impl Node {
    pub(crate) fn empty_leaf() -> Self {
        Node::Leaf(Vec::new())
    }

    pub(crate) fn decode(page: &Page<'_>) -> Result<Self> {
        match page.kind() {
            PageKind::Leaf => {
                let mut entries = Vec::with_capacity(page.len());
                for i in 0..page.len() {
                    let (k, v) = page.entry(i)?;
                    entries.push((k.to_vec(), v.to_vec()));
                }
                Ok(Node::Leaf(entries))
            }
            PageKind::Branch => {
                let mut entries = Vec::with_capacity(page.len());
                for i in 0..page.len() {
                    entries.push((page.key(i)?.to_vec(), page.child(i)?));
                }
                Ok(Node::Branch(entries))
            }
            _ => Err(page.corrupt("expected a tree page")),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Node::Leaf(e) => e.len(),
            Node::Branch(e) => e.len(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Per-entry sizes, slot included.
    pub(crate) fn entry_sizes(&self) -> Vec<usize> {
        match self {
            Node::Leaf(e) => e.iter().map(|(k, v)| leaf_entry_size(k.len(), v.len())).collect(),
            Node::Branch(e) => e.iter().map(|(k, _)| branch_entry_size(k.len())).collect(),
        }
    }

    /// Splits off entries `at..` into a new node of the same kind.
    pub(crate) fn split_off(&mut self, at: usize) -> Node {
        match self {
            Node::Leaf(e) => Node::Leaf(e.split_off(at)),
            Node::Branch(e) => Node::Branch(e.split_off(at)),
        }
    }

    /// Separator a parent needs for this node as a right sibling. A branch
    /// gives up its first key, which becomes implicit.
    pub(crate) fn take_separator(&mut self) -> Vec<u8> {
        match self {
            Node::Leaf(e) => e.first().map(|(k, _)| k.clone()).unwrap_or_default(),
            Node::Branch(e) => e.first_mut().map(|(k, _)| std::mem::take(k)).unwrap_or_default(),
        }
    }

    /// Bytes used after the header.
    pub(crate) fn used_bytes(&self) -> usize {
        self.entry_sizes().iter().sum()
    }

    pub(crate) fn fits(&self, page_size: usize) -> bool {
        self.used_bytes() <= page_size - PAGE_HEADER_SIZE
    }

    /// Encodes into a fresh page buffer. The caller guarantees `fits`.
    pub(crate) fn encode(&self, page_size: usize, txn_id: TxnId) -> Vec<u8> {
        debug_assert!(self.fits(page_size));
        let mut data = vec![0u8; page_size];
        let kind = if self.is_leaf() { PageKind::Leaf } else { PageKind::Branch };
        init_header(&mut data, kind, self.len() as u16, txn_id);

        let mut upper = page_size;
        let put_slot = |data: &mut [u8], i: usize, off: usize| {
            let at = PAGE_HEADER_SIZE + i * SLOT_SIZE;
            data[at..at + 2].copy_from_slice(&(off as u16).to_le_bytes());
        };
        match self {
            Node::Leaf(entries) => {
                for (i, (k, v)) in entries.iter().enumerate() {
                    upper -= LEAF_NODE_HEADER + k.len() + v.len();
                    let mut at = upper;
                    data[at..at + 2].copy_from_slice(&(k.len() as u16).to_le_bytes());
                    data[at + 2..at + 4].copy_from_slice(&(v.len() as u16).to_le_bytes());
                    at += LEAF_NODE_HEADER;
                    data[at..at + k.len()].copy_from_slice(k);
                    data[at + k.len()..at + k.len() + v.len()].copy_from_slice(v);
                    put_slot(&mut data, i, upper);
                }
            }
            Node::Branch(entries) => {
                for (i, (k, child)) in entries.iter().enumerate() {
                    upper -= BRANCH_NODE_HEADER + k.len();
                    let at = upper;
                    data[at..at + 2].copy_from_slice(&(k.len() as u16).to_le_bytes());
                    data[at + 2..at + 10].copy_from_slice(&child.to_le_bytes());
                    data[at + 10..at + 10 + k.len()].copy_from_slice(k);
                    put_slot(&mut data, i, upper);
                }
            }
        }
        data
    }
}

/// Chooses where to split a run of entries: the cut minimising the byte
/// difference between halves among cuts where both halves fit `capacity`
/// and keep at least `min_side` entries.
pub(crate) fn split_point(sizes: &[usize], capacity: usize, min_side: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let n = sizes.len();
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for cut in 1..n {
        left += sizes[cut - 1];
        let right = total - left;
        if cut < min_side || n - cut < min_side || left > capacity || right > capacity {
            continue;
        }
        let diff = left.abs_diff(right);
        if best.map_or(true, |(_, d)| diff < d) {
            best = Some((cut, diff));
        }
    }
    best.map_or(n / 2, |(cut, _)| cut)
}
