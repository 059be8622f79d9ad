//! Crash injection for the commit path.
//!
//! Each [`CommitPoint`] names one step of the commit sequence where a test
//! can make the commit fail as if the process had died there. A point is
//! armed for the current thread with [`arm`], which disarms it again when
//! the returned guard drops, or for the whole process by listing its name in
//! `LUMOKV_FAILPOINTS` (comma separated).

use std::cell::Cell;
use std::io;

use log::warn;
use once_cell::sync::Lazy;

use crate::error::{Error, Result};

/// A step of the commit sequence that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPoint {
    /// Data pages written, nothing synced
    BeforeDataSync,
    /// Data pages synced, meta not written
    AfterDataSync,
    /// Only the head of the meta page reaches the file
    TornMeta,
}

impl CommitPoint {
    pub const ALL: [CommitPoint; 3] =
        [CommitPoint::BeforeDataSync, CommitPoint::AfterDataSync, CommitPoint::TornMeta];

    /// Name used in `LUMOKV_FAILPOINTS`.
    pub fn name(self) -> &'static str {
        match self {
            CommitPoint::BeforeDataSync => "commit.before_data_sync",
            CommitPoint::AfterDataSync => "commit.after_data_sync",
            CommitPoint::TornMeta => "commit.torn_meta",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

thread_local! {
    static ARMED: Cell<u8> = const { Cell::new(0) };
}

/// Points listed in the environment, read once per process.
static FROM_ENV: Lazy<u8> = Lazy::new(|| {
    let Ok(raw) = std::env::var("LUMOKV_FAILPOINTS") else {
        return 0;
    };
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .fold(0, |mask, name| match CommitPoint::from_name(name) {
            Some(point) => mask | point.bit(),
            None => {
                warn!("ignoring unknown failpoint {:?}", name);
                mask
            }
        })
});

/// Keeps a point armed on this thread until dropped.
#[must_use = "the point is disarmed when the guard drops"]
#[derive(Debug)]
pub struct Armed {
    point: CommitPoint,
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(armed.get() & !self.point.bit()));
    }
}

/// Arms `point` for commits running on the current thread.
pub fn arm(point: CommitPoint) -> Armed {
    ARMED.with(|armed| armed.set(armed.get() | point.bit()));
    Armed { point }
}

pub fn is_armed(point: CommitPoint) -> bool {
    ARMED.with(Cell::get) & point.bit() != 0 || *FROM_ENV & point.bit() != 0
}

/// The I/O error an armed point raises.
pub(crate) fn injected(point: CommitPoint) -> Error {
    Error::Io(io::Error::other(format!("injected failure at {}", point.name())))
}

/// Fails with [`injected`] when `point` is armed.
pub(crate) fn check(point: CommitPoint) -> Result<()> {
    if is_armed(point) {
        return Err(injected(point));
    }
    Ok(())
}
