//! In-process stand-in for the NFS and SMB client libraries.
//!
//! Requests run against a scratch directory when issued, but their
//! callbacks only fire from `service` after the client's socket turned
//! readable, so the real service-loop driver does the waiting. An [`Injector`]
//! shared with the test injects failures and records what was sent.

use super::backend::{errno, system_time, FsResult, StatFs};
use super::completion::Completer;
use super::driver::EventLoop;
use super::nfs::{NfsClient, NfsDirEntry, NfsStat, NF3DIR, NF3LNK, NF3REG};
use super::smb::{SmbClient, SmbDirEntry, SmbStat, SMB2_TYPE_DIRECTORY, SMB2_TYPE_FILE, SMB2_TYPE_LINK};
use libc::{c_int, ECONNRESET, O_ACCMODE, O_RDONLY, O_WRONLY};
use nix::poll::PollFlags;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Knobs and records shared between a test and its client.
#[derive(Debug, Default)]
pub struct Faults {
    /// Every `service` call fails while set
    pub fail_service: bool,
    /// The next request is rejected at issue time with this errno
    pub reject_issue: Option<c_int>,
    /// Requests of the named kind are rejected with this errno
    pub reject_op: Option<(&'static str, c_int)>,
    /// Owner reported by every stat instead of the real one
    pub owner: Option<(u32, u32)>,
    /// Credentials set before requests, in order
    pub credentials: Vec<(u32, u32)>,
    /// Ownership changes requested (not applied)
    pub chowns: Vec<(PathBuf, u32, u32)>,
    /// Names of issued requests, in order
    pub issued: Vec<&'static str>,
    /// Path arguments exactly as the backend passed them
    pub paths: Vec<PathBuf>,
    /// Number of `service` calls
    pub serviced: usize,
}

/// Test-side view of a [`Loopback`] client.
#[derive(Debug, Clone)]
pub struct Injector(Arc<Mutex<Faults>>);

impl Injector {
    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        self.0.lock()
    }
}

/// A fetched directory listing.
#[derive(Debug)]
pub struct LoopDir {
    entries: Vec<(OsString, u64, fs::FileType)>,
    pos: usize,
}

impl LoopDir {
    fn next(&mut self) -> Option<(OsString, u64, fs::FileType)> {
        let entry = self.entries.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    fn seek(&mut self, offset: i64) {
        self.pos = (offset.max(0) as usize).min(self.entries.len());
    }
}

type Reply = Box<dyn FnOnce() + Send>;

pub struct Loopback {
    root: PathBuf,
    rx: UnixStream,
    tx: UnixStream,
    pending: VecDeque<Reply>,
    faults: Arc<Mutex<Faults>>,
}

fn open_with(path: &Path, flags: i32, mode: u32) -> FsResult<File> {
    let mut options = OpenOptions::new();
    match flags & O_ACCMODE {
        O_RDONLY => options.read(true),
        O_WRONLY => options.write(true),
        _ => options.read(true).write(true),
    };
    options
        .custom_flags(flags & !O_ACCMODE)
        .mode(mode)
        .open(path)
        .map_err(errno)
}

fn nfs_stat(meta: &Metadata, owner: Option<(u32, u32)>) -> NfsStat {
    let (uid, gid) = owner.unwrap_or((meta.uid(), meta.gid()));
    NfsStat {
        dev: meta.dev(),
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid,
        gid,
        rdev: meta.rdev(),
        size: meta.size(),
        blksize: meta.blksize(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
    }
}

fn smb_type(kind: fs::FileType) -> u32 {
    if kind.is_symlink() {
        SMB2_TYPE_LINK
    } else if kind.is_dir() {
        SMB2_TYPE_DIRECTORY
    } else {
        SMB2_TYPE_FILE
    }
}

fn nfs_type(kind: fs::FileType) -> u32 {
    if kind.is_symlink() {
        NF3LNK
    } else if kind.is_dir() {
        NF3DIR
    } else {
        NF3REG
    }
}

fn smb_stat(meta: &Metadata) -> SmbStat {
    SmbStat {
        typ: smb_type(meta.file_type()),
        nlink: meta.nlink() as u32,
        ino: meta.ino(),
        size: meta.size(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime: system_time(meta.ctime(), meta.ctime_nsec()),
        btime: meta.created().unwrap_or(UNIX_EPOCH),
    }
}

fn statvfs(path: &Path) -> FsResult<StatFs> {
    let st = nix::sys::statvfs::statvfs(path).map_err(|e| e as c_int)?;
    Ok(StatFs {
        blocks: st.blocks() as u64,
        bfree: st.blocks_free() as u64,
        bavail: st.blocks_available() as u64,
        files: st.files() as u64,
        ffree: st.files_free() as u64,
        bsize: st.block_size() as u32,
        namelen: st.name_max() as u32,
        frsize: st.fragment_size() as u32,
    })
}

fn list(path: &Path) -> FsResult<LoopDir> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(errno)? {
        let entry = entry.map_err(errno)?;
        let meta = entry.metadata().map_err(errno)?;
        entries.push((entry.file_name(), meta.ino(), meta.file_type()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(LoopDir { entries, pos: 0 })
}

fn set_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
    let spec = |t: SystemTime| {
        nix::sys::time::TimeSpec::from_duration(t.duration_since(UNIX_EPOCH).unwrap_or_default())
    };
    nix::sys::stat::utimensat(
        None,
        path,
        &spec(atime),
        &spec(mtime),
        nix::sys::stat::UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|e| e as c_int)
}

impl Loopback {
    /// A client whose export or share is the directory `root`.
    pub fn new(root: &Path) -> std::io::Result<Self> {
        let (rx, tx) = UnixStream::pair()?;
        Ok(Self {
            root: root.to_path_buf(),
            rx,
            tx,
            pending: VecDeque::new(),
            faults: Arc::new(Mutex::new(Faults::default())),
        })
    }

    pub fn injector(&self) -> Injector {
        Injector(self.faults.clone())
    }

    /// Records `path` and resolves it below the root.
    fn at(&self, path: &Path) -> PathBuf {
        self.faults.lock().paths.push(path.to_path_buf());
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn owner(&self) -> Option<(u32, u32)> {
        self.faults.lock().owner
    }

    fn issue<T: Send + 'static>(
        &mut self,
        op: &'static str,
        done: Completer<T>,
        work: impl FnOnce() -> FsResult<T>,
    ) -> FsResult<()> {
        {
            let mut faults = self.faults.lock();
            faults.issued.push(op);
            if let Some(code) = faults.reject_issue.take() {
                return Err(code);
            }
            if let Some((name, code)) = faults.reject_op {
                if name == op {
                    return Err(code);
                }
            }
        }
        let result = work();
        self.pending.push_back(Box::new(move || done.complete(result)));
        self.tx.write_all(&[0]).map_err(errno)
    }

    fn do_readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("readlink", done, || {
            fs::read_link(&target)
                .map(|t| t.into_os_string().into_vec())
                .map_err(errno)
        })
    }

    fn do_opendir(&mut self, path: &Path, done: Completer<LoopDir>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("opendir", done, || list(&target))
    }

    fn do_mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("mkdir", done, || fs::create_dir(&target).map_err(errno))
    }

    fn do_unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("unlink", done, || fs::remove_file(&target).map_err(errno))
    }

    fn do_rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("rmdir", done, || fs::remove_dir(&target).map_err(errno))
    }

    fn do_rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        let (from, to) = (self.at(from), self.at(to));
        self.issue("rename", done, || fs::rename(&from, &to).map_err(errno))
    }

    fn do_truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("truncate", done, || {
            OpenOptions::new()
                .write(true)
                .open(&target)
                .and_then(|f| f.set_len(size))
                .map_err(errno)
        })
    }

    fn do_open(&mut self, path: &Path, flags: i32, mode: u32, done: Completer<File>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("open", done, || open_with(&target, flags, mode))
    }

    fn do_pread(&mut self, file: &File, offset: u64, count: u32, done: Completer<Vec<u8>>) -> FsResult<()> {
        let mut buf = vec![0u8; count as usize];
        let result = file.read_at(&mut buf, offset).map_err(errno).map(|n| {
            buf.truncate(n);
            buf
        });
        self.issue("pread", done, || result)
    }

    fn do_pwrite(&mut self, file: &File, offset: u64, data: &[u8], done: Completer<u32>) -> FsResult<()> {
        let result = file.write_at(data, offset).map(|n| n as u32).map_err(errno);
        self.issue("pwrite", done, || result)
    }

    fn do_ftruncate(&mut self, file: &File, size: u64, done: Completer<()>) -> FsResult<()> {
        let result = file.set_len(size).map_err(errno);
        self.issue("ftruncate", done, || result)
    }

    fn do_fsync(&mut self, file: &File, done: Completer<()>) -> FsResult<()> {
        let result = file.sync_all().map_err(errno);
        self.issue("fsync", done, || result)
    }

    fn do_close(&mut self, file: File, done: Completer<()>) -> FsResult<()> {
        self.issue("close", done, move || {
            drop(file);
            Ok(())
        })
    }

    fn do_statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("statvfs", done, || statvfs(&target))
    }
}

impl EventLoop for Loopback {
    fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    fn which_events(&self) -> PollFlags {
        PollFlags::POLLIN
    }

    fn service(&mut self, revents: Option<PollFlags>) -> Result<(), c_int> {
        {
            let mut faults = self.faults.lock();
            faults.serviced += 1;
            if faults.fail_service {
                return Err(ECONNRESET);
            }
        }
        if revents.map_or(false, |r| r.contains(PollFlags::POLLIN)) {
            let mut byte = [0u8; 1];
            self.rx.read_exact(&mut byte).map_err(errno)?;
            if let Some(reply) = self.pending.pop_front() {
                reply();
            }
        }
        Ok(())
    }
}

impl NfsClient for Loopback {
    type File = File;
    type Dir = LoopDir;

    fn set_credentials(&mut self, uid: u32, gid: u32) {
        self.faults.lock().credentials.push((uid, gid));
    }

    fn lstat(&mut self, path: &Path, done: Completer<NfsStat>) -> FsResult<()> {
        let (target, owner) = (self.at(path), self.owner());
        self.issue("lstat", done, || {
            fs::symlink_metadata(&target)
                .map(|m| nfs_stat(&m, owner))
                .map_err(errno)
        })
    }

    fn fstat(&mut self, file: &mut File, done: Completer<NfsStat>) -> FsResult<()> {
        let owner = self.owner();
        let result = file.metadata().map(|m| nfs_stat(&m, owner)).map_err(errno);
        self.issue("fstat", done, || result)
    }

    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()> {
        self.do_readlink(path, done)
    }

    fn opendir(&mut self, path: &Path, done: Completer<LoopDir>) -> FsResult<()> {
        self.do_opendir(path, done)
    }

    fn readdir(&mut self, dir: &mut LoopDir) -> Option<NfsDirEntry> {
        dir.next().map(|(name, ino, kind)| NfsDirEntry {
            name,
            ino,
            typ: nfs_type(kind),
        })
    }

    fn telldir(&mut self, dir: &mut LoopDir) -> i64 {
        dir.pos as i64
    }

    fn seekdir(&mut self, dir: &mut LoopDir, offset: i64) {
        dir.seek(offset)
    }

    fn closedir(&mut self, _dir: LoopDir) {}

    fn mknod(&mut self, path: &Path, mode: u32, _rdev: u32, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("mknod", done, || {
            open_with(&target, libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL, mode & 0o7777)
                .map(drop)
        })
    }

    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_mkdir(path, done)
    }

    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_unlink(path, done)
    }

    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_rmdir(path, done)
    }

    fn symlink(&mut self, target: &Path, link: &Path, done: Completer<()>) -> FsResult<()> {
        let (target, link) = (target.to_path_buf(), self.at(link));
        self.issue("symlink", done, || {
            std::os::unix::fs::symlink(&target, &link).map_err(errno)
        })
    }

    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_rename(from, to, done)
    }

    fn link(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        let (from, to) = (self.at(from), self.at(to));
        self.issue("link", done, || fs::hard_link(&from, &to).map_err(errno))
    }

    fn chmod(&mut self, path: &Path, mode: u32, done: Completer<()>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("chmod", done, || {
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777)).map_err(errno)
        })
    }

    fn lchown(&mut self, path: &Path, uid: u32, gid: u32, done: Completer<()>) -> FsResult<()> {
        self.faults.lock().chowns.push((path.to_path_buf(), uid, gid));
        self.issue("lchown", done, || Ok(()))
    }

    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()> {
        self.do_truncate(path, size, done)
    }

    fn utimes(
        &mut self,
        path: &Path,
        atime: SystemTime,
        mtime: SystemTime,
        done: Completer<()>,
    ) -> FsResult<()> {
        let target = self.at(path);
        self.issue("utimes", done, || set_times(&target, atime, mtime))
    }

    fn create(&mut self, path: &Path, flags: i32, mode: u32, done: Completer<File>) -> FsResult<()> {
        self.do_open(path, flags, mode, done)
    }

    fn open(&mut self, path: &Path, flags: i32, done: Completer<File>) -> FsResult<()> {
        self.do_open(path, flags, 0, done)
    }

    fn pread(&mut self, file: &mut File, offset: u64, count: u32, done: Completer<Vec<u8>>) -> FsResult<()> {
        self.do_pread(file, offset, count, done)
    }

    fn pwrite(&mut self, file: &mut File, offset: u64, data: &[u8], done: Completer<u32>) -> FsResult<()> {
        self.do_pwrite(file, offset, data, done)
    }

    fn ftruncate(&mut self, file: &mut File, size: u64, done: Completer<()>) -> FsResult<()> {
        self.do_ftruncate(file, size, done)
    }

    fn fsync(&mut self, file: &mut File, done: Completer<()>) -> FsResult<()> {
        self.do_fsync(file, done)
    }

    fn close(&mut self, file: File, done: Completer<()>) -> FsResult<()> {
        self.do_close(file, done)
    }

    fn statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()> {
        self.do_statvfs(path, done)
    }
}

impl SmbClient for Loopback {
    type File = File;
    type Dir = LoopDir;

    fn stat(&mut self, path: &Path, done: Completer<SmbStat>) -> FsResult<()> {
        let target = self.at(path);
        self.issue("stat", done, || {
            fs::symlink_metadata(&target)
                .map(|m| smb_stat(&m))
                .map_err(errno)
        })
    }

    fn fstat(&mut self, file: &mut File, done: Completer<SmbStat>) -> FsResult<()> {
        let result = file.metadata().map(|m| smb_stat(&m)).map_err(errno);
        self.issue("fstat", done, || result)
    }

    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()> {
        self.do_readlink(path, done)
    }

    fn opendir(&mut self, path: &Path, done: Completer<LoopDir>) -> FsResult<()> {
        self.do_opendir(path, done)
    }

    fn readdir(&mut self, dir: &mut LoopDir) -> Option<SmbDirEntry> {
        dir.next().map(|(name, ino, kind)| SmbDirEntry {
            name,
            ino,
            typ: smb_type(kind),
        })
    }

    fn telldir(&mut self, dir: &mut LoopDir) -> i64 {
        dir.pos as i64
    }

    fn seekdir(&mut self, dir: &mut LoopDir, offset: i64) {
        dir.seek(offset)
    }

    fn closedir(&mut self, _dir: LoopDir) {}

    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_mkdir(path, done)
    }

    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_unlink(path, done)
    }

    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_rmdir(path, done)
    }

    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        self.do_rename(from, to, done)
    }

    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()> {
        self.do_truncate(path, size, done)
    }

    fn open(&mut self, path: &Path, flags: i32, done: Completer<File>) -> FsResult<()> {
        self.do_open(path, flags, 0o644, done)
    }

    fn pread(&mut self, file: &mut File, offset: u64, count: u32, done: Completer<Vec<u8>>) -> FsResult<()> {
        self.do_pread(file, offset, count, done)
    }

    fn pwrite(&mut self, file: &mut File, offset: u64, data: &[u8], done: Completer<u32>) -> FsResult<()> {
        self.do_pwrite(file, offset, data, done)
    }

    fn ftruncate(&mut self, file: &mut File, size: u64, done: Completer<()>) -> FsResult<()> {
        self.do_ftruncate(file, size, done)
    }

    fn fsync(&mut self, file: &mut File, done: Completer<()>) -> FsResult<()> {
        self.do_fsync(file, done)
    }

    fn close(&mut self, file: File, done: Completer<()>) -> FsResult<()> {
        self.do_close(file, done)
    }

    fn statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()> {
        self.do_statvfs(path, done)
    }
}
