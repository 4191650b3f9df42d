//! The filesystem operation set every backend implements.
//!
//! Paths are absolute below the mount root (`/` is the root itself). Each
//! method has a default answering `ENOSYS`, so an operation a backend does
//! not provide reports "not implemented" to the kernel.

use super::descriptor::BackendKind;
use super::identity::Caller;
use fuser::{FileAttr, FileType, TimeOrNow};
use libc::{c_int, ENOSYS};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result of one filesystem call; the error is a positive errno.
pub type FsResult<T> = std::result::Result<T, c_int>;

/// How the kernel interface may dispatch requests to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Any number of requests may run at once
    MultiThreaded,
    /// One request at a time
    SingleThreaded,
}

/// One directory entry produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number reported by the backend
    pub ino: u64,
    /// Coarse file type
    pub kind: FileType,
    /// Entry name
    pub name: OsString,
    /// Cookie that resumes the listing after this entry
    pub offset: i64,
}

/// Volume statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A POSIX byte-range lock as the kernel describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    /// First byte covered
    pub start: u64,
    /// Last byte covered (inclusive); `u64::MAX` means to end of file
    pub end: u64,
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    pub typ: i32,
    /// Process holding the lock
    pub pid: u32,
}

/// Callback receiving directory entries; returns true once the reply is full.
pub type DirFiller<'a> = dyn FnMut(DirEntry) -> bool + 'a;

/// Strips the leading `/` of a mount-relative path.
pub fn relative(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Joins a parent path and a child name.
pub fn child_path(parent: &Path, name: &OsStr) -> PathBuf {
    parent.join(name)
}

/// Maps an `std::io::Error` to the errno the kernel expects.
pub fn errno(err: std::io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// File type encoded in the `S_IFMT` bits of a mode.
pub fn file_kind(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

/// Converts a `(seconds, nanoseconds)` timestamp, which may predate the epoch.
pub fn system_time(secs: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(u64::from(nsec))
    }
}

/// The capability set of one backend.
#[allow(unused_variables)]
pub trait Backend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// How requests may be dispatched to this backend.
    fn dispatch(&self) -> Dispatch {
        Dispatch::SingleThreaded
    }

    fn getattr(&self, caller: &Caller, path: &Path, fh: Option<u64>) -> FsResult<FileAttr> {
        Err(ENOSYS)
    }

    fn access(&self, caller: &Caller, path: &Path, mask: i32) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn readlink(&self, caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn opendir(&self, caller: &Caller, path: &Path) -> FsResult<u64> {
        Err(ENOSYS)
    }

    fn readdir(&self, fh: u64, offset: i64, fill: &mut DirFiller<'_>) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn releasedir(&self, fh: u64) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn mknod(&self, caller: &Caller, path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn mkdir(&self, caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn unlink(&self, caller: &Caller, path: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn rmdir(&self, caller: &Caller, path: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Creates `link` pointing at `target`.
    fn symlink(&self, caller: &Caller, target: &Path, link: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn rename(&self, caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Creates the hard link `to` for the existing `from`.
    fn link(&self, caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn chmod(&self, caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn chown(
        &self,
        caller: &Caller,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn truncate(&self, caller: &Caller, path: &Path, size: u64, fh: Option<u64>) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn utimens(
        &self,
        caller: &Caller,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Creates and opens a regular file.
    fn create(&self, caller: &Caller, path: &Path, mode: u32, flags: i32) -> FsResult<u64> {
        Err(ENOSYS)
    }

    fn open(&self, caller: &Caller, path: &Path, flags: i32) -> FsResult<u64> {
        Err(ENOSYS)
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        Err(ENOSYS)
    }

    fn statfs(&self, caller: &Caller, path: &Path) -> FsResult<StatFs> {
        Err(ENOSYS)
    }

    fn flush(&self, fh: u64, lock_owner: u64) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Closes an open file; the handle is invalid afterwards.
    fn release(&self, fh: u64) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn fallocate(&self, fh: u64, offset: u64, length: u64, mode: i32) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn setxattr(
        &self,
        caller: &Caller,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> FsResult<()> {
        Err(ENOSYS)
    }

    fn getxattr(&self, caller: &Caller, path: &Path, name: &OsStr) -> FsResult<Vec<u8>> {
        Err(ENOSYS)
    }

    /// Attribute names, each terminated by a NUL byte.
    fn listxattr(&self, caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        Err(ENOSYS)
    }

    fn removexattr(&self, caller: &Caller, path: &Path, name: &OsStr) -> FsResult<()> {
        Err(ENOSYS)
    }

    /// Returns the first lock conflicting with `lock`, or `lock` with
    /// `typ == F_UNLCK` when there is none.
    fn getlk(&self, fh: u64, owner: u64, lock: FileLock) -> FsResult<FileLock> {
        Err(ENOSYS)
    }

    fn setlk(&self, fh: u64, owner: u64, lock: FileLock, sleep: bool) -> FsResult<()> {
        Err(ENOSYS)
    }
}
