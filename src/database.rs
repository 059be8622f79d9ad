use crate::constants::WriteFlags;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::transaction::{RwTransaction, Transaction};
use crate::types::Stat;

/// Database handle
///
/// A plain index into the database table of the environment. Handles are
/// `Copy` and stay valid for the life of the environment once the
/// transaction that created them has committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    /// Database identifier
    dbi: u32,
}

impl Database {
    pub(crate) fn new(dbi: u32) -> Self {
        Database { dbi }
    }

    /// The main (unnamed) database
    pub fn main() -> Self {
        Database { dbi: 0 }
    }

    /// Database identifier
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    pub(crate) fn index(&self) -> usize {
        self.dbi as usize
    }

    /// Get database statistics
    pub fn stat<T: Transaction>(&self, txn: &T) -> Result<Stat> {
        txn.stat(*self)
    }

    /// Get a value without copying it out of the map
    pub fn get<'txn, T: Transaction>(&self, txn: &'txn T, key: &[u8]) -> Result<&'txn [u8]> {
        txn.get(*self, key)
    }

    /// Store a key/value pair
    pub fn put(&self, txn: &mut RwTransaction<'_>, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        txn.put(*self, key, value, flags)
    }

    /// Delete a key
    pub fn del(&self, txn: &mut RwTransaction<'_>, key: &[u8]) -> Result<()> {
        txn.del(*self, key)
    }

    /// Open a cursor on this database
    pub fn cursor<'txn, T: Transaction>(&self, txn: &'txn T) -> Result<Cursor<'txn, T>> {
        txn.open_cursor(*self)
    }
}
