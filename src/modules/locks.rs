//! In-process POSIX byte-range locks for the local backend.
//!
//! The kernel forwards `F_GETLK`/`F_SETLK` to the filesystem together with
//! an owner token. Locks are tracked per file (device, inode) so that two
//! handles on the same file see each other's locks. A blocking request
//! (`F_SETLKW`) parks the calling thread until the conflicting range is
//! unlocked or its owner flushes.

use super::backend::{FileLock, FsResult};
use libc::{EAGAIN, F_RDLCK, F_UNLCK, F_WRLCK, EINVAL};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

/// Identity of a locked file.
pub type FileKey = (u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Held {
    owner: u64,
    pid: u32,
    typ: i32,
    start: u64,
    end: u64,
}

impl Held {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start <= end && start <= self.end
    }

    fn conflicts(&self, owner: u64, lock: &FileLock) -> bool {
        self.owner != owner
            && self.overlaps(lock.start, lock.end)
            && (self.typ == F_WRLCK || lock.typ == F_WRLCK)
    }
}

/// Table of byte-range locks held through this mount.
#[derive(Debug, Default)]
pub struct LockManager {
    files: Mutex<HashMap<FileKey, Vec<Held>>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// First lock held by another owner that `lock` would conflict with.
    ///
    /// Without a conflict the request comes back with `typ == F_UNLCK`.
    pub fn test(&self, key: FileKey, owner: u64, lock: FileLock) -> FileLock {
        let files = self.files.lock();
        let conflict = files
            .get(&key)
            .and_then(|held| held.iter().find(|h| h.conflicts(owner, &lock)));

        match conflict {
            Some(h) => FileLock {
                start: h.start,
                end: h.end,
                typ: h.typ,
                pid: h.pid,
            },
            None => FileLock {
                typ: F_UNLCK,
                ..lock
            },
        }
    }

    /// Acquires, converts or releases a range for `owner`.
    ///
    /// On conflict this fails with `EAGAIN`, or with `wait` blocks until
    /// the range can be taken.
    pub fn set(&self, key: FileKey, owner: u64, lock: FileLock, wait: bool) -> FsResult<()> {
        if lock.start > lock.end {
            return Err(EINVAL);
        }
        if lock.typ != F_RDLCK && lock.typ != F_WRLCK && lock.typ != F_UNLCK {
            return Err(EINVAL);
        }

        let mut files = self.files.lock();
        while lock.typ != F_UNLCK
            && files
                .get(&key)
                .map_or(false, |held| held.iter().any(|h| h.conflicts(owner, &lock)))
        {
            if !wait {
                return Err(EAGAIN);
            }
            self.released.wait(&mut files);
        }
        let held = files.entry(key).or_default();

        let mut kept = Vec::with_capacity(held.len() + 2);
        for h in held.drain(..) {
            if h.owner != owner || !h.overlaps(lock.start, lock.end) {
                kept.push(h);
                continue;
            }
            if h.start < lock.start {
                kept.push(Held {
                    end: lock.start - 1,
                    ..h
                });
            }
            if h.end > lock.end {
                kept.push(Held {
                    start: lock.end + 1,
                    ..h
                });
            }
        }
        if lock.typ != F_UNLCK {
            kept.push(Held {
                owner,
                pid: lock.pid,
                typ: lock.typ,
                start: lock.start,
                end: lock.end,
            });
        }

        if kept.is_empty() {
            files.remove(&key);
        } else {
            *held = kept;
        }
        self.released.notify_all();
        Ok(())
    }

    /// Drops every lock `owner` holds on the file.
    pub fn release_owner(&self, key: FileKey, owner: u64) {
        let mut files = self.files.lock();
        if let Some(held) = files.get_mut(&key) {
            held.retain(|h| h.owner != owner);
            if held.is_empty() {
                files.remove(&key);
            }
            self.released.notify_all();
        }
    }
}
