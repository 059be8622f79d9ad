//! lumokv: an embedded, memory-mapped, copy-on-write B-tree key/value store.
//!
//! One writer and any number of readers share an [`Environment`]. Readers
//! see an immutable snapshot and never block; the writer copies every page
//! it modifies and publishes the result atomically on commit.
//!
//! ```no_run
//! use lumokv::{DbFlags, Environment, Transaction, WriteFlags};
//!
//! # fn main() -> lumokv::Result<()> {
//! let env = Environment::builder().set_max_dbs(4).open("/tmp/lumokv-demo")?;
//! let db = env.open_db(Some("users"), DbFlags::CREATE)?;
//!
//! let mut txn = env.begin_rw_txn()?;
//! txn.put(db, b"alice", b"admin", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! assert_eq!(txn.get_str(db, b"alice")?, "admin");
//! # Ok(())
//! # }
//! ```

mod btree;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
#[doc(hidden)]
pub mod failpoint;
mod freelist;
mod meta;
mod midl;
mod page;
mod store;
mod transaction;
mod types;

pub use btree::PageSource;
pub use constants::{
    DbFlags, EnvFlags, WriteFlags, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    MAX_DB_NAME, MAX_KEY_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_SIZE,
};
pub use cursor::{Cursor, CursorIter, CursorPosition, Entry};
pub use database::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use meta::DbInfo;
pub use page::{Page, PageId, PageKind, TxnId};
pub use transaction::{RoTransaction, RwTransaction, Transaction, TxnState};
pub use types::{EnvInfo, ReaderInfo, Stat};
