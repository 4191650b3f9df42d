//! Local directory backend.
//!
//! Every operation is the native call on the same path below the backing
//! directory, so the mount behaves like a bind mount of it.

use super::backend::{
    errno, file_kind, relative, system_time, Backend, DirEntry, DirFiller, Dispatch, FileLock,
    FsResult, StatFs,
};
use super::constants::BLOCK_SIZE;
use super::descriptor::BackendKind;
use super::handles::{Handle, HandleTable};
use super::identity::Caller;
use super::locks::{FileKey, LockManager};
use fuser::{FileAttr, FileType, TimeOrNow};
use libc::{c_int, EINVAL, EOPNOTSUPP, O_ACCMODE, O_CREAT, O_RDONLY, O_WRONLY};
use log::debug;
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use parking_lot::Mutex;
use std::ffi::{CStr, CString, OsStr};
use std::fs::{self, File, Metadata, OpenOptions, Permissions};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Builds kernel attributes from native metadata.
pub fn attr_from_metadata(metadata: &Metadata) -> FileAttr {
    FileAttr {
        ino: metadata.ino(),
        size: metadata.size(),
        blocks: metadata.blocks(),
        atime: system_time(metadata.atime(), metadata.atime_nsec()),
        mtime: system_time(metadata.mtime(), metadata.mtime_nsec()),
        ctime: system_time(metadata.ctime(), metadata.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: file_kind(metadata.mode()),
        perm: (metadata.mode() & 0o7777) as u16,
        nlink: metadata.nlink() as u32,
        uid: metadata.uid(),
        gid: metadata.gid(),
        rdev: metadata.rdev() as u32,
        blksize: if metadata.blksize() > 0 {
            metadata.blksize() as u32
        } else {
            BLOCK_SIZE as u32
        },
        flags: 0,
    }
}

fn nix_errno(err: Errno) -> c_int {
    err as c_int
}

fn cstring(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| EINVAL)
}

fn timespec(time: Option<TimeOrNow>) -> TimeSpec {
    match time {
        None => TimeSpec::new(0, libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => TimeSpec::new(0, libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(t)) => {
            TimeSpec::from_duration(t.duration_since(UNIX_EPOCH).unwrap_or_default())
        }
    }
}

fn dirent_kind(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_BLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

/// A native directory stream with resumable positions.
#[derive(Debug)]
pub struct DirStream {
    dir: NonNull<libc::DIR>,
}

// Only ever used behind its handle's mutex.
unsafe impl Send for DirStream {}

impl DirStream {
    fn open(path: &Path) -> FsResult<Self> {
        let path = cstring(path)?;
        let dir = unsafe { libc::opendir(path.as_ptr()) };
        NonNull::new(dir)
            .map(|dir| Self { dir })
            .ok_or_else(|| nix_errno(Errno::last()))
    }

    fn tell(&mut self) -> i64 {
        unsafe { libc::telldir(self.dir.as_ptr()) as i64 }
    }

    fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) }
    }

    fn next_entry(&mut self) -> FsResult<Option<DirEntry>> {
        Errno::clear();
        let ent = unsafe { libc::readdir(self.dir.as_ptr()) };
        if ent.is_null() {
            return match Errno::last() {
                Errno::UnknownErrno => Ok(None),
                err => Err(nix_errno(err)),
            };
        }

        let (ino, d_type, name) = unsafe {
            let ent = &*ent;
            let name = CStr::from_ptr(ent.d_name.as_ptr());
            (ent.d_ino, ent.d_type, OsStr::from_bytes(name.to_bytes()).to_os_string())
        };
        Ok(Some(DirEntry {
            ino: ino as u64,
            kind: dirent_kind(d_type),
            name,
            offset: self.tell(),
        }))
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.dir.as_ptr());
        }
    }
}

/// An open file and the identity its locks are filed under.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
    key: FileKey,
}

impl LocalFile {
    fn new(file: File) -> FsResult<Self> {
        let metadata = file.metadata().map_err(errno)?;
        Ok(Self {
            file,
            key: (metadata.dev(), metadata.ino()),
        })
    }
}

fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & O_ACCMODE {
        O_RDONLY => options.read(true),
        O_WRONLY => options.write(true),
        _ => options.read(true).write(true),
    };
    options.custom_flags(flags & !O_ACCMODE);
    options
}

/// Backend re-exporting a local directory.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    handles: HandleTable<Handle<Arc<LocalFile>, Arc<Mutex<DirStream>>>>,
    locks: LockManager,
}

impl LocalBackend {
    /// Serves the directory at `root`, which must exist.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        // absolute, so it survives the daemon changing directory
        let root = fs::canonicalize(root.into())?;
        let metadata = fs::metadata(&root)?;
        if !metadata.is_dir() {
            return Err(std::io::Error::from_raw_os_error(libc::ENOTDIR));
        }
        debug!("serving local directory {}", root.display());
        Ok(Self {
            root,
            handles: HandleTable::new(),
            locks: LockManager::new(),
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(relative(path))
    }

    fn file(&self, fh: u64) -> FsResult<Arc<LocalFile>> {
        self.handles.file(fh)
    }

    fn insert_file(&self, file: File) -> FsResult<u64> {
        let file = Arc::new(LocalFile::new(file)?);
        Ok(self.handles.insert(Handle::File(file)))
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::MultiThreaded
    }

    fn getattr(&self, _caller: &Caller, path: &Path, fh: Option<u64>) -> FsResult<FileAttr> {
        let metadata = match fh {
            Some(fh) => self.file(fh)?.file.metadata().map_err(errno)?,
            None => fs::symlink_metadata(self.resolve(path)).map_err(errno)?,
        };
        Ok(attr_from_metadata(&metadata))
    }

    fn access(&self, _caller: &Caller, path: &Path, mask: i32) -> FsResult<()> {
        nix::unistd::access(&self.resolve(path), AccessFlags::from_bits_truncate(mask))
            .map_err(nix_errno)
    }

    fn readlink(&self, _caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        let target = fs::read_link(self.resolve(path)).map_err(errno)?;
        Ok(target.into_os_string().into_vec())
    }

    fn opendir(&self, _caller: &Caller, path: &Path) -> FsResult<u64> {
        let dir = DirStream::open(&self.resolve(path))?;
        Ok(self.handles.insert(Handle::Dir(Arc::new(Mutex::new(dir)))))
    }

    fn readdir(&self, fh: u64, offset: i64, fill: &mut DirFiller<'_>) -> FsResult<()> {
        let dir = self.handles.dir(fh)?;
        let mut dir = dir.lock();
        if offset != dir.tell() {
            dir.seek(offset);
        }
        while let Some(entry) = dir.next_entry()? {
            if fill(entry) {
                break;
            }
        }
        Ok(())
    }

    fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.handles.remove_dir(fh).map(drop)
    }

    fn mknod(&self, _caller: &Caller, path: &Path, mode: u32, rdev: u32) -> FsResult<()> {
        let target = self.resolve(path);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        match mode & libc::S_IFMT {
            libc::S_IFREG | 0 => OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&target)
                .map(drop)
                .map_err(errno),
            libc::S_IFIFO => nix::unistd::mkfifo(&target, perm).map_err(nix_errno),
            kind => nix::sys::stat::mknod(
                &target,
                SFlag::from_bits_truncate(kind),
                perm,
                rdev as libc::dev_t,
            )
            .map_err(nix_errno),
        }
    }

    fn mkdir(&self, _caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(self.resolve(path))
            .map_err(errno)
    }

    fn unlink(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        fs::remove_file(self.resolve(path)).map_err(errno)
    }

    fn rmdir(&self, _caller: &Caller, path: &Path) -> FsResult<()> {
        fs::remove_dir(self.resolve(path)).map_err(errno)
    }

    fn symlink(&self, _caller: &Caller, target: &Path, link: &Path) -> FsResult<()> {
        std::os::unix::fs::symlink(target, self.resolve(link)).map_err(errno)
    }

    fn rename(&self, _caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(errno)
    }

    fn link(&self, _caller: &Caller, from: &Path, to: &Path) -> FsResult<()> {
        fs::hard_link(self.resolve(from), self.resolve(to)).map_err(errno)
    }

    fn chmod(&self, _caller: &Caller, path: &Path, mode: u32) -> FsResult<()> {
        fs::set_permissions(self.resolve(path), Permissions::from_mode(mode & 0o7777))
            .map_err(errno)
    }

    fn chown(
        &self,
        _caller: &Caller,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<()> {
        std::os::unix::fs::lchown(self.resolve(path), uid, gid).map_err(errno)
    }

    fn truncate(&self, _caller: &Caller, path: &Path, size: u64, fh: Option<u64>) -> FsResult<()> {
        match fh {
            Some(fh) => self.file(fh)?.file.set_len(size).map_err(errno),
            None => nix::unistd::truncate(&self.resolve(path), size as libc::off_t)
                .map_err(nix_errno),
        }
    }

    fn utimens(
        &self,
        _caller: &Caller,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> FsResult<()> {
        nix::sys::stat::utimensat(
            None,
            &self.resolve(path),
            &timespec(atime),
            &timespec(mtime),
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        )
        .map_err(nix_errno)
    }

    fn create(&self, _caller: &Caller, path: &Path, mode: u32, flags: i32) -> FsResult<u64> {
        let file = open_options(flags | O_CREAT)
            .mode(mode & 0o7777)
            .open(self.resolve(path))
            .map_err(errno)?;
        self.insert_file(file)
    }

    fn open(&self, _caller: &Caller, path: &Path, flags: i32) -> FsResult<u64> {
        let file = open_options(flags & !O_CREAT)
            .open(self.resolve(path))
            .map_err(errno)?;
        self.insert_file(file)
    }

    fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let f = self.file(fh)?;
        let mut buf = vec![0u8; size as usize];
        let n = f.file.read_at(&mut buf, offset).map_err(errno)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let n = self.file(fh)?.file.write_at(data, offset).map_err(errno)?;
        Ok(n as u32)
    }

    fn statfs(&self, _caller: &Caller, path: &Path) -> FsResult<StatFs> {
        let st = nix::sys::statvfs::statvfs(&self.resolve(path)).map_err(nix_errno)?;
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

    fn flush(&self, fh: u64, lock_owner: u64) -> FsResult<()> {
        let f = self.file(fh)?;
        // Closing a duplicate reports deferred write errors without
        // closing the handle itself.
        drop(f.file.try_clone().map_err(errno)?);
        self.locks.release_owner(f.key, lock_owner);
        Ok(())
    }

    fn release(&self, fh: u64) -> FsResult<()> {
        self.handles.remove_file(fh).map(drop)
    }

    fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let f = self.file(fh)?;
        if datasync {
            f.file.sync_data().map_err(errno)
        } else {
            f.file.sync_all().map_err(errno)
        }
    }

    fn fallocate(&self, fh: u64, offset: u64, length: u64, mode: i32) -> FsResult<()> {
        if mode != 0 {
            return Err(EOPNOTSUPP);
        }
        let f = self.file(fh)?;
        nix::fcntl::posix_fallocate(f.file.as_raw_fd(), offset as libc::off_t, length as libc::off_t)
            .map_err(nix_errno)
    }

    fn setxattr(
        &self,
        _caller: &Caller,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> FsResult<()> {
        let path = cstring(&self.resolve(path))?;
        let name = CString::new(name.as_bytes()).map_err(|_| EINVAL)?;
        let rc = unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        };
        if rc < 0 {
            return Err(nix_errno(Errno::last()));
        }
        Ok(())
    }

    fn getxattr(&self, _caller: &Caller, path: &Path, name: &OsStr) -> FsResult<Vec<u8>> {
        let path = cstring(&self.resolve(path))?;
        let name = CString::new(name.as_bytes()).map_err(|_| EINVAL)?;
        xattr_buffer(|buf, len| unsafe {
            libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.cast(), len)
        })
    }

    fn listxattr(&self, _caller: &Caller, path: &Path) -> FsResult<Vec<u8>> {
        let path = cstring(&self.resolve(path))?;
        xattr_buffer(|buf, len| unsafe { libc::llistxattr(path.as_ptr(), buf.cast(), len) })
    }

    fn removexattr(&self, _caller: &Caller, path: &Path, name: &OsStr) -> FsResult<()> {
        let path = cstring(&self.resolve(path))?;
        let name = CString::new(name.as_bytes()).map_err(|_| EINVAL)?;
        if unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) } < 0 {
            return Err(nix_errno(Errno::last()));
        }
        Ok(())
    }

    fn getlk(&self, fh: u64, owner: u64, lock: FileLock) -> FsResult<FileLock> {
        Ok(self.locks.test(self.file(fh)?.key, owner, lock))
    }

    /// With `sleep` a conflicting request blocks until the range is free.
    fn setlk(&self, fh: u64, owner: u64, lock: FileLock, sleep: bool) -> FsResult<()> {
        let key = self.file(fh)?.key;
        self.locks.set(key, owner, lock, sleep)
    }
}

/// Runs a size-probing xattr call twice: once for the length, once for the data.
fn xattr_buffer(mut call: impl FnMut(*mut u8, usize) -> isize) -> FsResult<Vec<u8>> {
    loop {
        let len = call(std::ptr::null_mut(), 0);
        if len < 0 {
            return Err(nix_errno(Errno::last()));
        }
        let mut buf = vec![0u8; len as usize];
        if buf.is_empty() {
            return Ok(buf);
        }
        let got = call(buf.as_mut_ptr(), buf.len());
        if got >= 0 {
            buf.truncate(got as usize);
            return Ok(buf);
        }
        // The attribute grew between the two calls
        if Errno::last() != Errno::ERANGE {
            return Err(nix_errno(Errno::last()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libc::{EBADF, ENOENT, F_UNLCK, F_WRLCK};
    use std::ffi::OsString;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn backend() -> anyhow::Result<(TempDir, LocalBackend)> {
        let dir = tempdir()?;
        let fs = LocalBackend::new(dir.path())?;
        Ok((dir, fs))
    }

    fn list(fs: &LocalBackend, path: &str) -> Vec<DirEntry> {
        let caller = Caller::current();
        let fh = fs.opendir(&caller, Path::new(path)).unwrap();
        let mut entries = Vec::new();
        fs.readdir(fh, 0, &mut |entry| {
            entries.push(entry);
            false
        })
        .unwrap();
        fs.releasedir(fh).unwrap();
        entries
    }

    #[test]
    fn test_root_must_be_a_directory() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("f");
        fs::write(&file, b"x")?;
        assert!(LocalBackend::new(&file).is_err());
        assert!(LocalBackend::new(dir.path().join("missing")).is_err());
        Ok(())
    }

    #[test]
    fn test_open_release_zero_byte_file() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("empty"), b"")?;
        let caller = Caller::current();

        let fh = fs.open(&caller, Path::new("/empty"), libc::O_RDONLY).unwrap();
        assert_eq!(fs.read(fh, 0, 16), Ok(Vec::new()));
        assert_eq!(fs.release(fh), Ok(()));
        assert_eq!(fs.release(fh), Err(EBADF));
        Ok(())
    }

    #[test]
    fn test_write_read_round_trip() -> anyhow::Result<()> {
        let (_dir, fs) = backend()?;
        let caller = Caller::current();
        let fh = fs
            .create(&caller, Path::new("/data"), 0o644, libc::O_RDWR)
            .unwrap();

        for (offset, len) in [(0u64, 0usize), (3, 1), (100, 8 * 1024)] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(fs.write(fh, offset, &data), Ok(len as u32));
            assert_eq!(fs.read(fh, offset, len as u32), Ok(data));
        }

        let attr = fs.getattr(&caller, Path::new("/data"), Some(fh)).unwrap();
        assert_eq!(attr.size, 100 + 8 * 1024);
        assert_eq!(attr.kind, FileType::RegularFile);
        fs.release(fh).unwrap();
        Ok(())
    }

    #[test]
    fn test_concurrent_handles_are_distinct() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("shared"), b"")?;
        let fs = Arc::new(fs);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let fs = fs.clone();
                std::thread::spawn(move || {
                    let caller = Caller::current();
                    (0..25)
                        .map(|_| fs.open(&caller, Path::new("/shared"), libc::O_RDONLY).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for worker in workers {
            ids.extend(worker.join().unwrap());
        }
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total);
        for id in ids {
            fs.release(id).unwrap();
        }
        Ok(())
    }

    #[test]
    fn test_links_and_listing() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("target"), b"hello")?;
        let caller = Caller::current();

        fs.symlink(&caller, Path::new("target"), Path::new("/sym")).unwrap();
        fs.link(&caller, Path::new("/target"), Path::new("/hard")).unwrap();
        fs.mkdir(&caller, Path::new("/sub"), 0o750).unwrap();

        assert_eq!(fs.readlink(&caller, Path::new("/sym")), Ok(b"target".to_vec()));
        let sym = fs.getattr(&caller, Path::new("/sym"), None).unwrap();
        assert_eq!(sym.kind, FileType::Symlink);
        let hard = fs.getattr(&caller, Path::new("/hard"), None).unwrap();
        assert_eq!(hard.nlink, 2);
        let sub = fs.getattr(&caller, Path::new("/sub"), None).unwrap();
        assert_eq!(sub.kind, FileType::Directory);

        let entries = list(&fs, "/");
        let names: Vec<OsString> = entries.iter().map(|e| e.name.clone()).collect();
        for expected in ["hard", "sub", "sym", "target"] {
            assert!(names.contains(&OsString::from(expected)));
        }
        let sub_entry = entries.iter().find(|e| e.name == "sub").unwrap();
        assert_eq!(sub_entry.kind, FileType::Directory);
        assert_eq!(sub_entry.ino, sub.ino);
        Ok(())
    }

    #[test]
    fn test_readdir_resumes_from_offset() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        for i in 0..20 {
            fs::write(dir.path().join(format!("f{:02}", i)), b"")?;
        }
        let caller = Caller::current();
        let fh = fs.opendir(&caller, Path::new("/")).unwrap();

        let mut first = Vec::new();
        fs.readdir(fh, 0, &mut |entry| {
            first.push(entry);
            first.len() == 5
        })
        .unwrap();
        let resume = first.last().map(|e| e.offset).unwrap();

        let mut rest = Vec::new();
        fs.readdir(fh, resume, &mut |entry| {
            rest.push(entry);
            false
        })
        .unwrap();
        fs.releasedir(fh).unwrap();

        let mut all: Vec<OsString> = first
            .iter()
            .chain(rest.iter())
            .map(|e| e.name.clone())
            .collect();
        all.sort();
        all.dedup();
        // 20 files plus "." and ".."
        assert_eq!(all.len(), 22);
        assert_eq!(first.len() + rest.len(), 22);
        Ok(())
    }

    #[test]
    fn test_mknod_and_rename() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        let caller = Caller::current();

        fs.mknod(&caller, Path::new("/plain"), libc::S_IFREG | 0o600, 0).unwrap();
        fs.mknod(&caller, Path::new("/pipe"), libc::S_IFIFO | 0o600, 0).unwrap();
        let pipe = fs.getattr(&caller, Path::new("/pipe"), None).unwrap();
        assert_eq!(pipe.kind, FileType::NamedPipe);
        assert_eq!(
            fs.mknod(&caller, Path::new("/plain"), libc::S_IFREG | 0o600, 0),
            Err(libc::EEXIST)
        );

        fs.rename(&caller, Path::new("/plain"), Path::new("/renamed")).unwrap();
        assert!(dir.path().join("renamed").exists());
        assert_eq!(
            fs.getattr(&caller, Path::new("/plain"), None).map(|a| a.ino),
            Err(ENOENT)
        );
        fs.unlink(&caller, Path::new("/renamed")).unwrap();
        fs.unlink(&caller, Path::new("/pipe")).unwrap();
        assert_eq!(fs.rmdir(&caller, Path::new("/nothing")), Err(ENOENT));
        Ok(())
    }

    #[test]
    fn test_setattr_pieces() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("f"), b"0123456789")?;
        let caller = Caller::current();
        let path = Path::new("/f");

        fs.chmod(&caller, path, 0o600).unwrap();
        assert_eq!(fs.getattr(&caller, path, None).unwrap().perm, 0o600);

        fs.truncate(&caller, path, 4, None).unwrap();
        assert_eq!(fs::read(dir.path().join("f"))?, b"0123");

        let stamp = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        fs.utimens(&caller, path, None, Some(TimeOrNow::SpecificTime(stamp)))
            .unwrap();
        assert_eq!(fs.getattr(&caller, path, None).unwrap().mtime, stamp);

        fs.chown(&caller, path, Some(caller.uid), None).unwrap();
        Ok(())
    }

    #[test]
    fn test_locks_through_handles() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("locked"), b"")?;
        let caller = Caller::current();
        let a = fs.open(&caller, Path::new("/locked"), libc::O_RDWR).unwrap();
        let b = fs.open(&caller, Path::new("/locked"), libc::O_RDWR).unwrap();

        let whole = FileLock {
            start: 0,
            end: u64::MAX,
            typ: F_WRLCK,
            pid: caller.pid,
        };
        fs.setlk(a, 1, whole, false).unwrap();
        assert_eq!(fs.getlk(b, 2, whole).unwrap().typ, F_WRLCK);
        assert_eq!(fs.setlk(b, 2, whole, false), Err(libc::EAGAIN));

        fs.flush(a, 1).unwrap();
        assert_eq!(fs.getlk(b, 2, whole).unwrap().typ, F_UNLCK);
        fs.release(a).unwrap();
        fs.release(b).unwrap();
        Ok(())
    }

    #[test]
    fn test_fallocate_and_statfs() -> anyhow::Result<()> {
        let (_dir, fs) = backend()?;
        let caller = Caller::current();
        let fh = fs
            .create(&caller, Path::new("/big"), 0o644, libc::O_WRONLY)
            .unwrap();
        assert_eq!(fs.fallocate(fh, 0, 4096, 1), Err(EOPNOTSUPP));
        fs.fallocate(fh, 0, 4096, 0).unwrap();
        let attr = fs.getattr(&caller, Path::new("/big"), Some(fh)).unwrap();
        assert_eq!(attr.size, 4096);
        fs.fsync(fh, true).unwrap();
        fs.release(fh).unwrap();

        let st = fs.statfs(&caller, Path::new("/")).unwrap();
        assert!(st.bsize > 0);
        assert!(st.namelen > 0);
        Ok(())
    }

    #[test]
    fn test_xattr_round_trip() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("x"), b"")?;
        let caller = Caller::current();
        let path = Path::new("/x");
        let name = OsStr::new("user.fusenfs.test");

        match fs.setxattr(&caller, path, name, b"value", 0) {
            Ok(()) => {}
            // scratch filesystem without user xattrs
            Err(code) if code == libc::ENOTSUP || code == EOPNOTSUPP => return Ok(()),
            Err(code) => panic!("setxattr failed with errno {}", code),
        }
        assert_eq!(fs.getxattr(&caller, path, name), Ok(b"value".to_vec()));
        let names = fs.listxattr(&caller, path).unwrap();
        assert!(names.split(|b| *b == 0).any(|n| n == b"user.fusenfs.test"));
        fs.removexattr(&caller, path, name).unwrap();
        assert_eq!(fs.getxattr(&caller, path, name), Err(libc::ENODATA));
        Ok(())
    }

    #[test]
    fn test_blocking_lock_waits_for_flush() -> anyhow::Result<()> {
        let (dir, fs) = backend()?;
        fs::write(dir.path().join("queue"), b"")?;
        let fs = Arc::new(fs);
        let caller = Caller::current();
        let a = fs.open(&caller, Path::new("/queue"), libc::O_RDWR).unwrap();
        let b = fs.open(&caller, Path::new("/queue"), libc::O_RDWR).unwrap();

        let whole = FileLock {
            start: 0,
            end: u64::MAX,
            typ: F_WRLCK,
            pid: caller.pid,
        };
        fs.setlk(a, 1, whole, false).unwrap();

        let waiter = {
            let fs = fs.clone();
            std::thread::spawn(move || fs.setlk(b, 2, whole, true))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!waiter.is_finished());

        fs.flush(a, 1).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert_eq!(fs.getlk(a, 1, whole).unwrap().typ, F_WRLCK);
        fs.release(a).unwrap();
        fs.release(b).unwrap();
        Ok(())
    }

    #[test]
    fn test_parallel_io_on_separate_handles() -> anyhow::Result<()> {
        let (_dir, fs) = backend()?;
        let fs = Arc::new(fs);

        let workers: Vec<_> = (0..4u8)
            .map(|t| {
                let fs = fs.clone();
                std::thread::spawn(move || {
                    let caller = Caller::current();
                    let path = PathBuf::from(format!("/w{}", t));
                    let fh = fs.create(&caller, &path, 0o644, libc::O_RDWR).unwrap();
                    let data = vec![t; 64 * 1024];
                    for round in 0..16u64 {
                        assert_eq!(fs.write(fh, round * 4096, &data[..4096]), Ok(4096));
                    }
                    let back = fs.read(fh, 0, 64 * 1024).unwrap();
                    fs.release(fh).unwrap();
                    back == data
                })
            })
            .collect();

        for worker in workers {
            assert!(worker.join().unwrap());
        }
        Ok(())
    }
}
