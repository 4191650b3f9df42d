//! Kernel call dispatcher.
//!
//! `MountedFs` receives inode-addressed requests from `fuser`, resolves
//! them to mount-relative paths through the [`InodeTable`] and forwards
//! them to the selected [`Backend`]. When the backend allows it, the data
//! path runs on a [`WorkerPool`] while the session thread keeps reading
//! requests.

use super::backend::{child_path, Backend, DirFiller, Dispatch, FileLock, FsResult};
use super::constants::{PROGRAM_NAME, ROOT_INODE, TTL};
use super::identity::Caller;
use super::inodes::InodeTable;
use super::oplog::OpLog;
use super::workers::{worker_count, WorkerPool};
use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use libc::{c_int, EINVAL, ENOENT, ERANGE};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

/// Attribute changes carried by one `setattr` request.
#[derive(Debug, Clone, Default)]
pub struct AttrChange {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

/// How an extended attribute value is returned to the kernel.
#[derive(Debug, PartialEq, Eq)]
pub enum XattrReply {
    /// The caller only asked for the length
    Size(u32),
    /// The value fits the caller's buffer
    Data(Vec<u8>),
}

/// Applies the getxattr/listxattr size protocol to `value`.
pub fn fit_xattr(value: Vec<u8>, size: u32) -> FsResult<XattrReply> {
    if size == 0 {
        Ok(XattrReply::Size(value.len() as u32))
    } else if value.len() > size as usize {
        Err(ERANGE)
    } else {
        Ok(XattrReply::Data(value))
    }
}

fn unsigned(value: i64) -> FsResult<u64> {
    u64::try_from(value).map_err(|_| EINVAL)
}

/// The FUSE filesystem for one mount.
pub struct MountedFs {
    backend: Arc<dyn Backend>,
    inodes: InodeTable,
    log: OpLog,
    workers: Option<WorkerPool>,
}

impl MountedFs {
    /// Wraps `backend`, starting worker threads unless `single_threaded`
    /// is set or the backend only takes one request at a time.
    pub fn new(backend: Box<dyn Backend>, log: OpLog, single_threaded: bool) -> Self {
        let workers = if single_threaded || backend.dispatch() == Dispatch::SingleThreaded {
            None
        } else {
            match WorkerPool::new(worker_count()) {
                Ok(pool) => Some(pool),
                Err(err) => {
                    warn!("cannot start worker threads, serving on one thread: {}", err);
                    None
                }
            }
        };
        Self {
            backend: Arc::from(backend),
            inodes: InodeTable::new(),
            log,
            workers,
        }
    }

    /// Number of worker threads; zero when requests are served inline.
    pub fn worker_threads(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerPool::size)
    }

    /// Runs `job` on a worker, or right here without workers.
    fn submit(&self, job: impl FnOnce(&dyn Backend) + Send + 'static) {
        match &self.workers {
            Some(pool) => {
                let backend = Arc::clone(&self.backend);
                pool.execute(move || job(&*backend));
            }
            None => job(&*self.backend),
        }
    }

    /// Sets a byte-range lock and hands the outcome to `done`.
    ///
    /// A sleeping request waits on a thread of its own; the session thread
    /// must stay free to serve the unlock it is waiting for.
    pub fn set_lock(
        &self,
        fh: u64,
        owner: u64,
        lock: FileLock,
        sleep: bool,
        done: impl FnOnce(FsResult<()>) + Send + 'static,
    ) {
        if !sleep {
            return done(self.backend.setlk(fh, owner, lock, false));
        }
        let backend = Arc::clone(&self.backend);
        let waiter = thread::Builder::new()
            .name(format!("{}-lock-wait", PROGRAM_NAME))
            .spawn(move || done(backend.setlk(fh, owner, lock, true)));
        if let Err(err) = waiter {
            warn!("cannot start lock waiter: {}", err);
        }
    }

    /// Lists an open directory with node ids from the inode table, the
    /// same ids `lookup` reports.
    pub fn list_dir(
        &mut self,
        ino: u64,
        fh: u64,
        offset: i64,
        fill: &mut DirFiller<'_>,
    ) -> FsResult<()> {
        let dir = self.path(ino)?;
        let inodes = &mut self.inodes;
        self.backend.readdir(fh, offset, &mut |mut entry| {
            entry.ino = if entry.name == "." {
                ino
            } else if entry.name == ".." {
                inodes.assign(dir.parent().unwrap_or(dir.as_path()))
            } else {
                inodes.assign(&child_path(&dir, &entry.name))
            };
            fill(entry)
        })
    }

    fn path(&self, ino: u64) -> FsResult<PathBuf> {
        self.inodes
            .path(ino)
            .map(Path::to_path_buf)
            .ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> FsResult<PathBuf> {
        Ok(child_path(&self.path(parent)?, name))
    }

    /// Attributes of `path`, registering it as a kernel-visible node.
    pub fn lookup_path(&mut self, caller: &Caller, path: &Path) -> FsResult<FileAttr> {
        let mut attr = self.backend.getattr(caller, path, None)?;
        attr.ino = self.inodes.remember(path);
        Ok(attr)
    }

    /// Attributes of an already known node.
    pub fn attr_of(&self, caller: &Caller, ino: u64, fh: Option<u64>) -> FsResult<FileAttr> {
        let path = self.path(ino)?;
        let mut attr = self.backend.getattr(caller, &path, fh)?;
        attr.ino = ino;
        Ok(attr)
    }

    /// Applies `change` as chmod, chown, truncate and utimens, in that
    /// order, stopping at the first failure.
    pub fn change_attr(
        &self,
        caller: &Caller,
        ino: u64,
        fh: Option<u64>,
        change: AttrChange,
    ) -> FsResult<FileAttr> {
        let path = self.path(ino)?;
        if let Some(mode) = change.mode {
            self.backend.chmod(caller, &path, mode)?;
        }
        if change.uid.is_some() || change.gid.is_some() {
            self.backend.chown(caller, &path, change.uid, change.gid)?;
        }
        if let Some(size) = change.size {
            self.backend.truncate(caller, &path, size, fh)?;
        }
        if change.atime.is_some() || change.mtime.is_some() {
            self.backend.utimens(caller, &path, change.atime, change.mtime)?;
        }
        self.attr_of(caller, ino, fh)
    }

    pub fn make_node(
        &mut self,
        caller: &Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> FsResult<FileAttr> {
        let path = self.child(parent, name)?;
        self.log.entered("mknod", Some(&path));
        self.backend.mknod(caller, &path, mode & !umask, rdev)?;
        self.lookup_path(caller, &path)
    }

    pub fn make_dir(
        &mut self,
        caller: &Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FsResult<FileAttr> {
        let path = self.child(parent, name)?;
        self.log.entered("mkdir", Some(&path));
        self.backend.mkdir(caller, &path, mode & !umask)?;
        self.lookup_path(caller, &path)
    }

    /// Creates and opens a file, returning its attributes and handle.
    pub fn create_file(
        &mut self,
        caller: &Caller,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> FsResult<(FileAttr, u64)> {
        let path = self.child(parent, name)?;
        self.log.entered("create", Some(&path));
        let fh = self.backend.create(caller, &path, mode & !umask, flags)?;
        match self.backend.getattr(caller, &path, Some(fh)) {
            Ok(mut attr) => {
                attr.ino = self.inodes.remember(&path);
                Ok((attr, fh))
            }
            Err(err) => {
                let _ = self.backend.release(fh);
                Err(err)
            }
        }
    }

    pub fn make_symlink(
        &mut self,
        caller: &Caller,
        parent: u64,
        name: &OsStr,
        target: &Path,
    ) -> FsResult<FileAttr> {
        let path = self.child(parent, name)?;
        self.log.entered("symlink", Some(&path));
        self.backend.symlink(caller, target, &path)?;
        self.lookup_path(caller, &path)
    }

    pub fn make_link(
        &mut self,
        caller: &Caller,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
    ) -> FsResult<FileAttr> {
        let from = self.path(ino)?;
        let to = self.child(newparent, newname)?;
        self.log.entered("link", Some(&from));
        self.backend.link(caller, &from, &to)?;
        self.lookup_path(caller, &to)
    }

    pub fn remove(&mut self, caller: &Caller, parent: u64, name: &OsStr, dir: bool) -> FsResult<()> {
        let path = self.child(parent, name)?;
        if dir {
            self.log.entered("rmdir", Some(&path));
            self.backend.rmdir(caller, &path)?;
        } else {
            self.log.entered("unlink", Some(&path));
            self.backend.unlink(caller, &path)?;
        }
        self.inodes.unlink(&path);
        Ok(())
    }

    pub fn move_entry(
        &mut self,
        caller: &Caller,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> FsResult<()> {
        // RENAME_NOREPLACE and RENAME_EXCHANGE have no backend counterpart
        if flags != 0 {
            return Err(EINVAL);
        }
        let from = self.child(parent, name)?;
        let to = self.child(newparent, newname)?;
        self.log.entered("rename", Some(&from));
        self.backend.rename(caller, &from, &to)?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    fn xattr_reply(result: FsResult<Vec<u8>>, size: u32, reply: ReplyXattr) {
        match result.and_then(|value| fit_xattr(value, size)) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(err) => reply.error(err),
        }
    }
}

fn reply_entry(result: FsResult<FileAttr>, reply: ReplyEntry) {
    match result {
        Ok(attr) => reply.entry(&TTL, &attr, 0),
        Err(err) => reply.error(err),
    }
}

fn reply_empty(result: FsResult<()>, reply: ReplyEmpty) {
    match result {
        Ok(()) => reply.ok(),
        Err(err) => reply.error(err),
    }
}

fn reply_open(result: FsResult<u64>, reply: ReplyOpen) {
    match result {
        Ok(fh) => reply.opened(fh, 0),
        Err(err) => reply.error(err),
    }
}

impl Filesystem for MountedFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(
            "{} filesystem ready, {} worker threads",
            self.backend.kind(),
            self.worker_threads()
        );
        self.log.session_start();
        Ok(())
    }

    fn destroy(&mut self) {
        self.log.entered("destroy", None);
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let caller = Caller::from(req);
        let result = self.child(parent, name).and_then(|path| {
            self.log.entered("lookup", Some(&path));
            self.lookup_path(&caller, &path)
        });
        reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        self.log.entered("getattr", self.inodes.path(ino));
        match self.attr_of(&Caller::from(req), ino, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.log.entered("setattr", self.inodes.path(ino));
        let change = AttrChange {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        match self.change_attr(&Caller::from(req), ino, fh, change) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(err),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        self.log.entered("readlink", self.inodes.path(ino));
        match self
            .path(ino)
            .and_then(|path| self.backend.readlink(&Caller::from(req), &path))
        {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.make_node(&Caller::from(req), parent, name, mode, umask, rdev);
        reply_entry(result, reply);
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.make_dir(&Caller::from(req), parent, name, mode, umask);
        reply_entry(result, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_empty(self.remove(&Caller::from(req), parent, name, false), reply);
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply_empty(self.remove(&Caller::from(req), parent, name, true), reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.make_symlink(&Caller::from(req), parent, link_name, target);
        reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = self.move_entry(&Caller::from(req), parent, name, newparent, newname, flags);
        reply_empty(result, reply);
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = self.make_link(&Caller::from(req), ino, newparent, newname);
        reply_entry(result, reply);
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.log.entered("open", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.open(&Caller::from(req), &path, flags));
        reply_open(result, reply);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.log.entered("read", self.inodes.path(ino));
        let offset = match unsigned(offset) {
            Ok(offset) => offset,
            Err(err) => return reply.error(err),
        };
        self.submit(move |backend| match backend.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.log.entered("write", self.inodes.path(ino));
        let offset = match unsigned(offset) {
            Ok(offset) => offset,
            Err(err) => return reply.error(err),
        };
        let data = data.to_vec();
        self.submit(move |backend| match backend.write(fh, offset, &data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(err),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, lock_owner: u64, reply: ReplyEmpty) {
        self.log.entered("flush", self.inodes.path(ino));
        self.submit(move |backend| reply_empty(backend.flush(fh, lock_owner), reply));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.log.entered("release", self.inodes.path(ino));
        self.submit(move |backend| reply_empty(backend.release(fh), reply));
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.log.entered("fsync", self.inodes.path(ino));
        self.submit(move |backend| reply_empty(backend.fsync(fh, datasync), reply));
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.log.entered("opendir", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.opendir(&Caller::from(req), &path));
        reply_open(result, reply);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.log.entered("readdir", self.inodes.path(ino));
        let result = self.list_dir(ino, fh, offset, &mut |entry| {
            reply.add(entry.ino, entry.offset, entry.kind, &entry.name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.log.entered("releasedir", self.inodes.path(ino));
        reply_empty(self.backend.releasedir(fh), reply);
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        self.log.entered("statfs", self.inodes.path(ino));
        let path = self.inodes.path(ino).unwrap_or(Path::new("/")).to_path_buf();
        match self.backend.statfs(&Caller::from(req), &path) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(err) => reply.error(err),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        self.log.entered("setxattr", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.setxattr(&Caller::from(req), &path, name, value, flags));
        reply_empty(result, reply);
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        self.log.entered("getxattr", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.getxattr(&Caller::from(req), &path, name));
        Self::xattr_reply(result, size, reply);
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        self.log.entered("listxattr", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.listxattr(&Caller::from(req), &path));
        Self::xattr_reply(result, size, reply);
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        self.log.entered("removexattr", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.removexattr(&Caller::from(req), &path, name));
        reply_empty(result, reply);
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        self.log.entered("access", self.inodes.path(ino));
        let result = self
            .path(ino)
            .and_then(|path| self.backend.access(&Caller::from(req), &path, mask));
        reply_empty(result, reply);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_file(&Caller::from(req), parent, name, mode, umask, flags) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(err) => reply.error(err),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        self.log.entered("getlk", self.inodes.path(ino));
        let lock = FileLock {
            start,
            end,
            typ,
            pid,
        };
        match self.backend.getlk(fh, lock_owner, lock) {
            Ok(found) => reply.locked(found.start, found.end, found.typ, found.pid),
            Err(err) => reply.error(err),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        self.log.entered("setlk", self.inodes.path(ino));
        let lock = FileLock {
            start,
            end,
            typ,
            pid,
        };
        self.set_lock(fh, lock_owner, lock, sleep, move |result| {
            reply_empty(result, reply)
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        self.log.entered("fallocate", self.inodes.path(ino));
        let range = match unsigned(offset).and_then(|off| Ok((off, unsigned(length)?))) {
            Ok(range) => range,
            Err(err) => return reply.error(err),
        };
        self.submit(move |backend| {
            let result = backend.fallocate(fh, range.0, range.1, mode);
            if let Err(err) = &result {
                debug!("fallocate on {} failed: {}", ino, err);
            }
            reply_empty(result, reply);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::local::LocalBackend;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::{tempdir, TempDir};

    fn mounted() -> anyhow::Result<(TempDir, MountedFs, Caller)> {
        let dir = tempdir()?;
        let backend = LocalBackend::new(dir.path())?;
        let fs = MountedFs::new(Box::new(backend), OpLog::disabled("bind"), true);
        Ok((dir, fs, Caller::current()))
    }

    #[test]
    fn test_lookup_ids_are_stable() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::write(dir.path().join("a"), b"abc")?;

        let first = fs.lookup_path(&caller, Path::new("/a")).unwrap();
        let again = fs.lookup_path(&caller, Path::new("/a")).unwrap();
        assert_eq!(first.ino, again.ino);
        assert_ne!(first.ino, ROOT_INODE);
        assert_eq!(first.size, 3);

        let root = fs.attr_of(&caller, ROOT_INODE, None).unwrap();
        assert_eq!(root.ino, ROOT_INODE);
        assert_eq!(fs.attr_of(&caller, 999, None).map(|a| a.ino), Err(ENOENT));
        Ok(())
    }

    #[test]
    fn test_setattr_applies_in_order() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::write(dir.path().join("f"), b"0123456789")?;
        let ino = fs.lookup_path(&caller, Path::new("/f")).unwrap().ino;

        let stamp = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let change = AttrChange {
            mode: Some(0o600),
            size: Some(4),
            mtime: Some(TimeOrNow::SpecificTime(stamp)),
            ..AttrChange::default()
        };
        let attr = fs.change_attr(&caller, ino, None, change).unwrap();
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.size, 4);
        assert_eq!(attr.mtime, stamp);
        assert_eq!(attr.ino, ino);
        Ok(())
    }

    #[test]
    fn test_setattr_stops_at_first_failure() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::create_dir(dir.path().join("d"))?;
        let ino = fs.lookup_path(&caller, Path::new("/d")).unwrap().ino;

        let stamp = UNIX_EPOCH + Duration::from_secs(1_000);
        let change = AttrChange {
            mode: Some(0o700),
            size: Some(0),
            mtime: Some(TimeOrNow::SpecificTime(stamp)),
            ..AttrChange::default()
        };
        assert!(fs.change_attr(&caller, ino, None, change).is_err());

        let meta = fs::metadata(dir.path().join("d"))?;
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        assert_ne!(meta.modified()?, stamp);
        Ok(())
    }

    #[test]
    fn test_creation_applies_umask() -> anyhow::Result<()> {
        let (_dir, mut fs, caller) = mounted()?;
        let name = OsStr::new("made");

        let attr = fs
            .make_dir(&caller, ROOT_INODE, name, 0o777, 0o027)
            .unwrap();
        assert_eq!(attr.perm & 0o027, 0);

        let (attr, fh) = fs
            .create_file(&caller, attr.ino, OsStr::new("f"), 0o666, 0o077, libc::O_RDWR)
            .unwrap();
        assert_eq!(attr.perm & 0o077, 0);
        fs.backend.release(fh).unwrap();
        Ok(())
    }

    #[test]
    fn test_rename_moves_known_nodes() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::create_dir(dir.path().join("d"))?;
        fs::write(dir.path().join("d/f"), b"")?;
        let d = fs.lookup_path(&caller, Path::new("/d")).unwrap().ino;
        let f = fs.lookup_path(&caller, Path::new("/d/f")).unwrap().ino;

        fs.move_entry(&caller, ROOT_INODE, OsStr::new("d"), ROOT_INODE, OsStr::new("e"), 0)
            .unwrap();
        assert_eq!(fs.attr_of(&caller, f, None).map(|a| a.ino), Ok(f));
        assert!(dir.path().join("e/f").exists());
        assert_eq!(fs.path(d), Ok(PathBuf::from("/e")));

        assert_eq!(
            fs.move_entry(&caller, ROOT_INODE, OsStr::new("e"), ROOT_INODE, OsStr::new("g"), 1),
            Err(EINVAL)
        );
        Ok(())
    }

    #[test]
    fn test_links_and_removal() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::write(dir.path().join("a"), b"x")?;
        let a = fs.lookup_path(&caller, Path::new("/a")).unwrap();

        let b = fs
            .make_link(&caller, a.ino, ROOT_INODE, OsStr::new("b"))
            .unwrap();
        assert_eq!(b.nlink, 2);
        let s = fs
            .make_symlink(&caller, ROOT_INODE, OsStr::new("s"), Path::new("a"))
            .unwrap();
        assert_eq!(s.kind, fuser::FileType::Symlink);

        fs.remove(&caller, ROOT_INODE, OsStr::new("a"), false).unwrap();
        fs::write(dir.path().join("a"), b"new")?;
        let again = fs.lookup_path(&caller, Path::new("/a")).unwrap();
        assert_ne!(again.ino, a.ino);
        assert_eq!(
            fs.remove(&caller, ROOT_INODE, OsStr::new("missing"), true),
            Err(ENOENT)
        );
        Ok(())
    }

    #[test]
    fn test_fit_xattr_size_protocol() {
        assert_eq!(fit_xattr(b"value".to_vec(), 0), Ok(XattrReply::Size(5)));
        assert_eq!(fit_xattr(b"value".to_vec(), 4), Err(ERANGE));
        assert_eq!(
            fit_xattr(b"value".to_vec(), 5),
            Ok(XattrReply::Data(b"value".to_vec()))
        );
    }

    #[test]
    fn test_readdir_reports_lookup_ids() -> anyhow::Result<()> {
        let (dir, mut fs, caller) = mounted()?;
        fs::create_dir(dir.path().join("d"))?;
        fs::write(dir.path().join("d/seen"), b"")?;
        fs::write(dir.path().join("d/listed"), b"")?;
        let d = fs.lookup_path(&caller, Path::new("/d")).unwrap().ino;
        let seen = fs.lookup_path(&caller, Path::new("/d/seen")).unwrap().ino;

        let fh = fs.backend.opendir(&caller, Path::new("/d")).unwrap();
        let mut ids = std::collections::HashMap::new();
        fs.list_dir(d, fh, 0, &mut |entry| {
            ids.insert(entry.name.into_string().unwrap(), entry.ino);
            false
        })
        .unwrap();
        fs.backend.releasedir(fh).unwrap();

        assert_eq!(ids["."], d);
        assert_eq!(ids[".."], ROOT_INODE);
        assert_eq!(ids["seen"], seen);
        let listed = fs.lookup_path(&caller, Path::new("/d/listed")).unwrap().ino;
        assert_eq!(ids["listed"], listed);
        Ok(())
    }

    #[test]
    fn test_threaded_io_runs_on_workers() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let backend = LocalBackend::new(dir.path())?;
        let mut fs = MountedFs::new(Box::new(backend), OpLog::disabled("bind"), false);
        assert!(fs.worker_threads() >= 2);
        let caller = Caller::current();

        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..8u8 {
            let name = format!("f{}", i);
            let (_, fh) = fs
                .create_file(&caller, ROOT_INODE, OsStr::new(&name), 0o644, 0, libc::O_RDWR)
                .unwrap();
            let tx = tx.clone();
            fs.submit(move |backend| {
                let data = vec![i; 4096];
                let written = backend.write(fh, 0, &data);
                let read = backend.read(fh, 0, 4096);
                let worker = std::thread::current().name().map(str::to_string);
                tx.send((written, read == Ok(data), worker, backend.release(fh)))
                    .unwrap();
            });
        }
        drop(tx);

        let results: Vec<_> = rx.iter().collect();
        assert_eq!(results.len(), 8);
        for (written, matched, worker, released) in results {
            assert_eq!(written, Ok(4096));
            assert!(matched);
            assert!(worker.unwrap().starts_with("fusenfs-worker-"));
            assert_eq!(released, Ok(()));
        }
        Ok(())
    }

    #[test]
    fn test_single_threaded_runs_inline() -> anyhow::Result<()> {
        let (_dir, fs, _caller) = mounted()?;
        assert_eq!(fs.worker_threads(), 0);
        let here = std::thread::current().id();
        let (tx, rx) = std::sync::mpsc::channel();
        fs.submit(move |_| tx.send(std::thread::current().id()).unwrap());
        assert_eq!(rx.try_recv()?, here);
        Ok(())
    }

    #[test]
    fn test_sleeping_lock_leaves_session_free() -> anyhow::Result<()> {
        let (dir, fs, caller) = mounted()?;
        fs::write(dir.path().join("l"), b"")?;
        let a = fs.backend.open(&caller, Path::new("/l"), libc::O_RDWR).unwrap();
        let b = fs.backend.open(&caller, Path::new("/l"), libc::O_RDWR).unwrap();
        let whole = FileLock {
            start: 0,
            end: u64::MAX,
            typ: libc::F_WRLCK,
            pid: caller.pid,
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let busy = tx.clone();
        fs.set_lock(a, 1, whole, false, move |r| busy.send(r).unwrap());
        assert_eq!(rx.recv()?, Ok(()));

        fs.set_lock(b, 2, whole, true, move |r| tx.send(r).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // the holder's flush arrives on the session thread
        fs.backend.flush(a, 1).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, Ok(()));
        fs.backend.release(a).unwrap();
        fs.backend.release(b).unwrap();
        Ok(())
    }
}
