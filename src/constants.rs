use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Verify page checksums on every read from the map.
        const CHECKSUM = 0x01;
        /// `path` names the data file itself instead of a directory.
        const NO_SUB_DIR = 0x4000;
        /// Skip every fsync on commit.
        const NOSYNC = 0x10000;
        /// Open read-only; write transactions are refused.
        const RDONLY = 0x20000;
        /// Sync data pages on commit but not the meta page.
        const NOMETASYNC = 0x40000;
    }
}

/// Flags that may be changed on an open environment.
pub const CHANGEABLE: EnvFlags = EnvFlags::NOSYNC.union(EnvFlags::NOMETASYNC);

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of replacing an existing value.
        const NO_OVERWRITE = 0x10;
    }
}

/// Default page size
pub const PAGE_SIZE: usize = 4096;
/// Smallest page size accepted by the builder
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest page size; slot offsets are 16 bit
pub const MAX_PAGE_SIZE: usize = 65536;
/// Magic number for lumokv files
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;
/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;
/// Pages 0 and 1 hold the two meta slots
pub const META_PAGES: usize = 2;
/// Name of the data file inside the environment directory
pub const DATA_FILE_NAME: &str = "data.mdb";

/// Largest key accepted by `put`
pub const MAX_KEY_SIZE: usize = 511;
/// Longest database name
pub const MAX_DB_NAME: usize = 255;

pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 0;

/// Nodes filled below this share of the page (in 1/1000) get rebalanced
pub const FILL_THRESHOLD: usize = 250;
