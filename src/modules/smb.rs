//! SMB backend.
//!
//! Same shape as the NFS backend: one asynchronous client request per
//! operation, driven to completion by the service loop. Paths are sent
//! relative to the share. The share's ACL model is not exposed, so
//! ownership, permission and timestamp changes are accepted and dropped,
//! and everything is reported as owned by the caller.

use super::backend::{relative, Backend, DirEntry, DirFiller, Dispatch, FsResult, StatFs};
use super::completion::Completer;
use super::constants::BLOCK_SIZE;
use super::descriptor::BackendKind;
use super::driver::{issue_and_wait, EventLoop};
use super::handles::{Handle, HandleTable};
use super::identity::Caller;
use fuser::{FileAttr, FileType, TimeOrNow};
use libc::ENOTSUP;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::SystemTime;

/// SMB2 object type of a regular file.
pub const SMB2_TYPE_FILE: u32 = 0;
/// SMB2 object type of a directory.
pub const SMB2_TYPE_DIRECTORY: u32 = 1;
/// SMB2 object type of a reparse-point link.
pub const SMB2_TYPE_LINK: u32 = 2;

/// File attributes as the SMB client reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmbStat {
    pub typ: u32,
    pub nlink: u32,
    pub ino: u64,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub btime: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbDirEntry {
    pub name: OsString,
    pub ino: u64,
    pub typ: u32,
}

/// The asynchronous SMB client operations this backend drives.
///
/// Paths never start with `/`; the empty path is the share root.
pub trait SmbClient: EventLoop + Send {
    type File: Send;
    type Dir: Send;

    fn stat(&mut self, path: &Path, done: Completer<SmbStat>) -> FsResult<()>;
    fn fstat(&mut self, file: &mut Self::File, done: Completer<SmbStat>) -> FsResult<()>;
    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()>;

    fn opendir(&mut self, path: &Path, done: Completer<Self::Dir>) -> FsResult<()>;
    fn readdir(&mut self, dir: &mut Self::Dir) -> Option<SmbDirEntry>;
    fn telldir(&mut self, dir: &mut Self::Dir) -> i64;
    fn seekdir(&mut self, dir: &mut Self::Dir, offset: i64);
    fn closedir(&mut self, dir: Self::Dir);

    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()>;
    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()>;

    fn open(&mut self, path: &Path, flags: i32, done: Completer<Self::File>) -> FsResult<()>;
    fn pread(
        &mut self,
        file: &mut Self::File,
        offset: u64,
        count: u32,
        done: Completer<Vec<u8>>,
    ) -> FsResult<()>;
    fn pwrite(
        &mut self,
        file: &mut Self::File,
        offset: u64,
        data: &[u8],
        done: Completer<u32>,
    ) -> FsResult<()>;
    fn ftruncate(&mut self, file: &mut Self::File, size: u64, done: Completer<()>)
        -> FsResult<()>;
    fn fsync(&mut self, file: &mut Self::File, done: Completer<()>) -> FsResult<()>;
    fn close(&mut self, file: Self::File, done: Completer<()>) -> FsResult<()>;

    fn statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()>;
}

/// Maps an SMB2 object type to the kernel's coarse type.
pub fn smb_kind(typ: u32) -> FileType {
    match typ {
        SMB2_TYPE_LINK => FileType::Symlink,
        SMB2_TYPE_DIRECTORY => FileType::Directory,
        _ => FileType::RegularFile,
    }
}

/// Backend serving one connected SMB share.
pub struct SmbBackend<C: SmbClient> {
    client: Mutex<C>,
    handles: HandleTable<Handle<C::File, C::Dir>>,
}

impl<C: SmbClient> SmbBackend<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Mutex::new(client),
            handles: HandleTable::new(),
        }
    }

    fn call<T>(&self, issue: impl FnOnce(&mut C, Completer<T>) -> FsResult<()>) -> FsResult<T> {
        let mut client = self.client.lock();
        issue_and_wait(&mut *client, issue)
    }

    fn call_file<T>(
        &self,
        fh: u64,
        issue: impl FnOnce(&mut C, &mut C::File, Completer<T>) -> FsResult<()>,
    ) -> FsResult<T> {
        let mut client = self.client.lock();
        self.handles.with_file(fh, |file| {
            issue_and_wait(&mut *client, |c, done| issue(c, file, done))
        })
    }

    fn open_file(&self, path: &Path, flags: i32) -> FsResult<u64> {
        let path = relative(path);
        let file = self.call(|c, done| c.open(path, flags, done))?;
        Ok(self.handles.insert(Handle::File(file)))
    }
}

fn attr(caller: &Caller, st: SmbStat) -> FileAttr {
    let kind = smb_kind(st.typ);
    let perm = match kind {
        FileType::Directory => 0o755,
        FileType::Symlink => 0o777,
        _ => 0o644,
    };
    FileAttr {
        ino: st.ino,
        size: st.size,
        blocks: (st.size + BLOCK_SIZE - 1) / BLOCK_SIZE,
        atime: st.atime,
        mtime: st.mtime,
        ctime: st.ctime,
        crtime: st.btime,
        kind,
        perm,
        nlink: st.nlink.max(1),
        uid: caller.uid,
        gid: caller.gid,
        rdev: 0,
        blksize: BLOCK_SIZE as u32,
        flags: 0,
    }
}

impl<C: SmbClient> Backend for SmbBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Smb
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::SingleThreaded
    }

    fn getattr(&self, caller: &Caller, path: &Path, fh: Option<u64>) -> FsResult<FileAttr> {
        let st = match fh {
            Some(fh) => self.call_file(fh, |c, file, done| c.fstat(file, done))?,
            None => {
                let path = relative(path);
                self.call(|c, done| c.stat(path, done))?
            }
        };
        Ok(attr(caller, st))
    }

    fn access(&self, _caller: &Caller, _path: &Path, _mask: i32) -> FsResult<()> {
        Ok(())
    }

    fn readlink(&self, _caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        let path = relative(path);
        self.call(|c, done| c.readlink(path, done))
    }

    fn opendir(&self, _caller: &Caller, path: &Path) -> FsResult<u64> {
        let path = relative(path);
        let dir = self.call(|c, done| c.opendir(path, done))?;
        Ok(self.handles.insert(Handle::Dir(dir)))
    }

    fn readdir(&self, fh: u64, offset: i64, fill: &mut DirFiller<'_>) -> FsResult<()> {
        let mut client = self.client.lock();
        self.handles.with_dir(fh, |dir| {
            if offset != client.telldir(dir) {
                client.seekdir(dir, offset);
            }
            while let Some(entry) = client.readdir(dir) {
                let next = client.telldir(dir);
                let full = fill(DirEntry {
                    ino: entry.ino,
                    kind: smb_kind(entry.typ),
                    name: entry.name,
                    offset: next,
                });
                if full {
                    break;
                }
            }
            Ok(())
        })
    }

    fn releasedir(&self, fh: u64) -> FsResult<()> {
        let dir = self.handles.remove_dir(fh)?;
        self.client.lock().closedir(dir);
        Ok(())
    }

    fn mkdir(&self, _caller: &Caller, path: &Path, _mode: u32) -> FsResult<()> {
        let path = relative(path);
        self.call(|c, done| c.mkdir(path, done))
    }

    fn unlink(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        let path = relative(path);
        self.call(|c, done| c.unlink(path, done))
    }

    fn rmdir(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        let path = relative(path);
        self.call(|c, done| c.rmdir(path, done))
    }

    fn rename(&self, _caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        let (from, to) = (relative(from), relative(to));
        self.call(|c, done| c.rename(from, to, done))
    }

    fn chmod(&self, _caller: &Caller, _path: &Path, _mode: u32) -> FsResult<()> {
        Ok(())
    }

    fn chown(
        &self,
        _caller: &Caller,
        _path: &Path,
        _uid: Option<u32>,
        _gid: Option<u32>,
    ) -> FsResult<()> {
        Ok(())
    }

    fn truncate(&self, _caller: &Caller, path: &Path, size: u64, fh: Option<u64>) -> FsResult<()> {
        match fh {
            Some(fh) => self.call_file(fh, |c, file, done| c.ftruncate(file, size, done)),
            None => {
                let path = relative(path);
                self.call(|c, done| c.truncate(path, size, done))
            }
        }
    }

    fn utimens(
        &self,
        _caller: &Caller,
        _path: &Path,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
    ) -> FsResult<()> {
        Ok(())
    }

    fn create(&self, _caller: &Caller, path: &Path, _mode: u32, flags: i32) -> FsResult<u64> {
        self.open_file(path, flags | libc::O_CREAT)
    }

    fn open(&self, _caller: &Caller, path: &Path, flags: i32) -> FsResult<u64> {
        self.open_file(path, flags)
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.call_file(fh, |c, file, done| c.pread(file, offset, size, done))
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.call_file(fh, |c, file, done| c.pwrite(file, offset, data, done))
    }

    fn statfs(&self, _caller: &Caller, path: &Path) -> FsResult<StatFs> {
        let path = relative(path);
        self.call(|c, done| c.statvfs(path, done))
    }

    fn flush(&self, fh: u64, _lock_owner: u64) -> FsResult<()> {
        self.call_file(fh, |c, file, done| c.fsync(file, done))
    }

    fn release(&self, fh: u64) -> FsResult<()> {
        let file = self.handles.remove_file(fh)?;
        self.call(|c, done| c.close(file, done))
    }

    fn fsync(&self, fh: u64, _datasync: bool) -> FsResult<()> {
        self.call_file(fh, |c, file, done| c.fsync(file, done))
    }

    fn setxattr(
        &self,
        _caller: &Caller,
        _path: &Path,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
    ) -> FsResult<()> {
        Err(ENOTSUP)
    }

    fn removexattr(&self, _caller: &Caller, _path: &Path, _name: &OsStr) -> FsResult<()> {
        Err(ENOTSUP)
    }
}

impl<C: SmbClient> Drop for SmbBackend<C> {
    fn drop(&mut self) {
        let client = self.client.get_mut();
        for handle in self.handles.drain() {
            match handle {
                Handle::File(file) => {
                    let _ = issue_and_wait(client, |c, done| c.close(file, done));
                }
                Handle::Dir(dir) => client.closedir(dir),
            }
        }
    }
}
