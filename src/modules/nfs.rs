//! NFS backend.
//!
//! Every operation is one asynchronous request to the NFS client, turned
//! into a blocking call by the service-loop driver. The client is not
//! thread safe and sits behind a mutex; the mount runs single threaded.

use super::backend::{file_kind, Backend, DirEntry, DirFiller, Dispatch, FsResult, StatFs};
use super::completion::Completer;
use super::descriptor::BackendKind;
use super::driver::{issue_and_wait, EventLoop};
use super::handles::{Handle, HandleTable};
use super::identity::{Caller, IdentityMap};
use fuser::{FileAttr, FileType, TimeOrNow};
use log::debug;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// NFSv3 file type of a symbolic link.
pub const NF3LNK: u32 = 5;
/// NFSv3 file type of a directory.
pub const NF3DIR: u32 = 2;
/// NFSv3 file type of a regular file.
pub const NF3REG: u32 = 1;

/// File attributes as the NFS client reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NfsStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// One entry of a cached NFS directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfsDirEntry {
    pub name: OsString,
    pub ino: u64,
    /// NFSv3 file type (`NF3REG`, `NF3DIR`, ...)
    pub typ: u32,
}

/// The asynchronous NFS client operations this backend drives.
///
/// Each request method either rejects the request synchronously or hands
/// `done` to the client, which completes it from inside `service`.
/// Directory streams are fully fetched by `opendir` and walked locally.
pub trait NfsClient: EventLoop + Send {
    /// An open remote file
    type File: Send;
    /// A fetched directory listing with a cursor
    type Dir: Send;

    /// Sets the uid/gid presented on subsequent requests.
    fn set_credentials(&mut self, uid: u32, gid: u32);

    fn lstat(&mut self, path: &Path, done: Completer<NfsStat>) -> FsResult<()>;
    fn fstat(&mut self, file: &mut Self::File, done: Completer<NfsStat>) -> FsResult<()>;
    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()>;

    fn opendir(&mut self, path: &Path, done: Completer<Self::Dir>) -> FsResult<()>;
    fn readdir(&mut self, dir: &mut Self::Dir) -> Option<NfsDirEntry>;
    fn telldir(&mut self, dir: &mut Self::Dir) -> i64;
    fn seekdir(&mut self, dir: &mut Self::Dir, offset: i64);
    fn closedir(&mut self, dir: Self::Dir);

    fn mknod(&mut self, path: &Path, mode: u32, rdev: u32, done: Completer<()>) -> FsResult<()>;
    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()>;
    fn symlink(&mut self, target: &Path, link: &Path, done: Completer<()>) -> FsResult<()>;
    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()>;
    fn link(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()>;
    fn chmod(&mut self, path: &Path, mode: u32, done: Completer<()>) -> FsResult<()>;
    fn lchown(&mut self, path: &Path, uid: u32, gid: u32, done: Completer<()>) -> FsResult<()>;
    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()>;
    fn utimes(
        &mut self,
        path: &Path,
        atime: SystemTime,
        mtime: SystemTime,
        done: Completer<()>,
    ) -> FsResult<()>;

    fn create(
        &mut self,
        path: &Path,
        flags: i32,
        mode: u32,
        done: Completer<Self::File>,
    ) -> FsResult<()>;
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

/// Maps an NFSv3 file type to the kernel's coarse type.
pub fn nfs_kind(typ: u32) -> FileType {
    match typ {
        NF3LNK => FileType::Symlink,
        NF3DIR => FileType::Directory,
        _ => FileType::RegularFile,
    }
}

/// Backend serving one mounted NFS export.
pub struct NfsBackend<C: NfsClient> {
    client: Mutex<C>,
    identity: IdentityMap,
    handles: HandleTable<Handle<C::File, C::Dir>>,
}

impl<C: NfsClient> NfsBackend<C> {
    /// Wraps a connected client.
    pub fn new(client: C, identity: IdentityMap) -> Self {
        Self {
            client: Mutex::new(client),
            identity,
            handles: HandleTable::new(),
        }
    }

    fn call<T>(&self, issue: impl FnOnce(&mut C, Completer<T>) -> FsResult<()>) -> FsResult<T> {
        let mut client = self.client.lock();
        issue_and_wait(&mut *client, issue)
    }

    /// Like `call`, presenting the caller's (mapped) credentials to the server.
    fn call_as<T>(
        &self,
        caller: &Caller,
        issue: impl FnOnce(&mut C, Completer<T>) -> FsResult<()>,
    ) -> FsResult<T> {
        let (uid, gid) = self.identity.rpc_credentials(caller);
        let mut client = self.client.lock();
        client.set_credentials(uid, gid);
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

    fn lstat(&self, path: &Path) -> FsResult<NfsStat> {
        self.call(|c, done| c.lstat(path, done))
    }

    fn attr(&self, caller: &Caller, st: NfsStat) -> FileAttr {
        FileAttr {
            ino: st.ino,
            size: st.size,
            blocks: st.blocks,
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            crtime: UNIX_EPOCH,
            kind: file_kind(st.mode),
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink as u32,
            uid: self.identity.to_local_uid(caller, st.uid),
            gid: self.identity.to_local_gid(caller, st.gid),
            rdev: st.rdev as u32,
            blksize: st.blksize as u32,
            flags: 0,
        }
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl<C: NfsClient> Backend for NfsBackend<C> {
    fn kind(&self) -> BackendKind {
        BackendKind::Nfs
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::SingleThreaded
    }

    fn getattr(&self, caller: &Caller, path: &Path, fh: Option<u64>) -> FsResult<FileAttr> {
        let st = match fh {
            Some(fh) => self.call_file(fh, |c, file, done| c.fstat(file, done))?,
            None => self.lstat(path)?,
        };
        Ok(self.attr(caller, st))
    }

    fn readlink(&self, _caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        self.call(|c, done| c.readlink(path, done))
    }

    fn opendir(&self, _caller: &Caller, path: &Path) -> FsResult<u64> {
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
                    kind: nfs_kind(entry.typ),
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

    fn mknod(&self, caller: &Caller, path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
        self.call_as(caller, |c, done| c.mknod(path, mode, rdev, done))
    }

    fn mkdir(&self, caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        // Not atomic: a failing chmod leaves the new directory behind.
        self.call_as(caller, |c, done| c.mkdir(path, done))?;
        self.call(|c, done| c.chmod(path, mode, done))
    }

    fn unlink(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        self.call(|c, done| c.unlink(path, done))
    }

    fn rmdir(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        self.call(|c, done| c.rmdir(path, done))
    }

    fn symlink(&self, caller: &Caller, target: &Path, link: &Path) -> FsResult<()> {
        self.call_as(caller, |c, done| c.symlink(target, link, done))
    }

    fn rename(&self, _caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        self.call(|c, done| c.rename(from, to, done))
    }

    fn link(&self, caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        self.call_as(caller, |c, done| c.link(from, to, done))
    }

    fn chmod(&self, _caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        self.call(|c, done| c.chmod(path, mode, done))
    }

    fn chown(
        &self,
        caller: &Caller,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        let current = match (uid, gid) {
            (Some(_), Some(_)) => None,
            _ => Some(self.lstat(path)?),
        };
        let uid = match uid {
            Some(uid) => self.identity.to_remote_uid(caller, uid),
            None => current.map_or(u32::MAX, |st| st.uid),
        };
        let gid = match gid {
            Some(gid) => self.identity.to_remote_gid(caller, gid),
            None => current.map_or(u32::MAX, |st| st.gid),
        };
        debug!("nfs chown {} to {}:{}", path.display(), uid, gid);
        self.call_as(caller, |c, done| c.lchown(path, uid, gid, done))
    }

    fn truncate(&self, _caller: &Caller, path: &Path, size: u64, fh: Option<u64>) -> FsResult<()> {
        match fh {
            Some(fh) => self.call_file(fh, |c, file, done| c.ftruncate(file, size, done)),
            None => self.call(|c, done| c.truncate(path, size, done)),
        }
    }

    fn utimens(
        &self,
        _caller: &Caller,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<()> {
        let (atime, mtime) = match (atime, mtime) {
            (Some(a), Some(m)) => (resolve_time(a), resolve_time(m)),
            (a, m) => {
                let st = self.lstat(path)?;
                (
                    a.map_or(st.atime, resolve_time),
                    m.map_or(st.mtime, resolve_time),
                )
            }
        };
        self.call(|c, done| c.utimes(path, atime, mtime, done))
    }

    fn create(&self, caller: &Caller, path: &Path, mode: u32, flags: i32) -> FsResult<u64> {
        let file = self.call_as(caller, |c, done| {
            c.create(path, flags | libc::O_CREAT, mode, done)
        })?;
        Ok(self.handles.insert(Handle::File(file)))
    }

    fn open(&self, _caller: &Caller, path: &Path, flags: i32) -> FsResult<u64> {
        let file = self.call(|c, done| c.open(path, flags, done))?;
        Ok(self.handles.insert(Handle::File(file)))
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.call_file(fh, |c, file, done| c.pread(file, offset, size, done))
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        self.call_file(fh, |c, file, done| c.pwrite(file, offset, data, done))
    }

    fn statfs(&self, _caller: &Caller, path: &Path) -> FsResult<StatFs> {
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
}

impl<C: NfsClient> Drop for NfsBackend<C> {
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
