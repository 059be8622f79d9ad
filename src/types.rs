use crate::page::{PageId, TxnId};

/// Statistics for a database in the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of data items
    pub entries: usize,
}

/// Information about the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the data memory map
    pub map_size: usize,
    /// Page size of the data file
    pub page_size: usize,
    /// ID of the last used page
    pub last_pgno: PageId,
    /// ID of the last committed transaction
    pub last_txnid: TxnId,
    /// Pages reachable from some database tree
    pub pages_in_use: u64,
    /// Free pages ready for reuse
    pub free_pages: u64,
    /// Free pages still visible to an older snapshot
    pub pending_pages: u64,
    /// Pages holding the persisted free list
    pub free_chain_pages: u64,
    /// Max reader slots in the environment
    pub max_readers: u32,
    /// Live read transactions
    pub num_readers: u32,
}

/// One pinned snapshot in the reader table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Snapshot the readers see
    pub txn_id: TxnId,
    /// Read transactions pinned to it
    pub count: usize,
}
