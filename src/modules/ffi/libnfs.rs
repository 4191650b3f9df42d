//! `NfsClient` over the system libnfs.

#![allow(non_camel_case_types)]

use super::{c_path, c_text, into_private, reclaim, rejected, run_private};
use crate::modules::backend::{system_time, FsResult, StatFs};
use crate::modules::completion::Completer;
use crate::modules::descriptor::ConnectionDescriptor;
use crate::modules::driver::EventLoop;
use crate::modules::mount::MountError;
use crate::modules::nfs::{NfsClient, NfsDirEntry, NfsStat};
use libc::{c_char, c_int, c_long, c_void, timeval, EIO};
use log::{debug, info};
use nix::poll::PollFlags;
use std::ffi::{CStr, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::time::{SystemTime, UNIX_EPOCH};

#[repr(C)]
struct nfs_context {
    _private: [u8; 0],
}

#[repr(C)]
struct nfsfh {
    _private: [u8; 0],
}

#[repr(C)]
struct nfsdir {
    _private: [u8; 0],
}

#[repr(C)]
struct nfs_url {
    server: *mut c_char,
    path: *mut c_char,
    file: *mut c_char,
}

#[repr(C)]
struct nfs_stat_64 {
    nfs_dev: u64,
    nfs_ino: u64,
    nfs_mode: u64,
    nfs_nlink: u64,
    nfs_uid: u64,
    nfs_gid: u64,
    nfs_rdev: u64,
    nfs_size: u64,
    nfs_blksize: u64,
    nfs_blocks: u64,
    nfs_atime: u64,
    nfs_mtime: u64,
    nfs_ctime: u64,
    nfs_atime_nsec: u64,
    nfs_mtime_nsec: u64,
    nfs_ctime_nsec: u64,
    nfs_used: u64,
}

/// Leading fields of `struct nfsdirent`; only read through a library pointer.
#[repr(C)]
struct nfsdirent {
    next: *mut nfsdirent,
    name: *mut c_char,
    inode: u64,
    typ: u32,
}

type nfs_cb = extern "C" fn(err: c_int, nfs: *mut nfs_context, data: *mut c_void, private: *mut c_void);

#[link(name = "nfs")]
extern "C" {
    fn nfs_init_context() -> *mut nfs_context;
    fn nfs_destroy_context(nfs: *mut nfs_context);
    fn nfs_get_error(nfs: *mut nfs_context) -> *mut c_char;
    fn nfs_parse_url_dir(nfs: *mut nfs_context, url: *const c_char) -> *mut nfs_url;
    fn nfs_destroy_url(url: *mut nfs_url);
    fn nfs_mount(nfs: *mut nfs_context, server: *const c_char, export: *const c_char) -> c_int;
    fn nfs_set_uid(nfs: *mut nfs_context, uid: c_int);
    fn nfs_set_gid(nfs: *mut nfs_context, gid: c_int);

    fn nfs_get_fd(nfs: *mut nfs_context) -> c_int;
    fn nfs_which_events(nfs: *mut nfs_context) -> c_int;
    fn nfs_service(nfs: *mut nfs_context, revents: c_int) -> c_int;

    fn nfs_lstat64_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_fstat64_async(nfs: *mut nfs_context, fh: *mut nfsfh, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_readlink_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_opendir_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_readdir(nfs: *mut nfs_context, dir: *mut nfsdir) -> *mut nfsdirent;
    fn nfs_telldir(nfs: *mut nfs_context, dir: *mut nfsdir) -> c_long;
    fn nfs_seekdir(nfs: *mut nfs_context, dir: *mut nfsdir, loc: c_long);
    fn nfs_closedir(nfs: *mut nfs_context, dir: *mut nfsdir);
    fn nfs_mknod_async(nfs: *mut nfs_context, path: *const c_char, mode: c_int, dev: c_int, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_mkdir_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_unlink_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_rmdir_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_symlink_async(nfs: *mut nfs_context, target: *const c_char, link: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_rename_async(nfs: *mut nfs_context, from: *const c_char, to: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_link_async(nfs: *mut nfs_context, from: *const c_char, to: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_chmod_async(nfs: *mut nfs_context, path: *const c_char, mode: c_int, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_lchown_async(nfs: *mut nfs_context, path: *const c_char, uid: c_int, gid: c_int, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_truncate_async(nfs: *mut nfs_context, path: *const c_char, length: u64, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_utimes_async(nfs: *mut nfs_context, path: *const c_char, times: *mut timeval, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_create_async(nfs: *mut nfs_context, path: *const c_char, flags: c_int, mode: c_int, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_open_async(nfs: *mut nfs_context, path: *const c_char, flags: c_int, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_pread_async(nfs: *mut nfs_context, fh: *mut nfsfh, offset: u64, count: u64, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_pwrite_async(nfs: *mut nfs_context, fh: *mut nfsfh, offset: u64, count: u64, buf: *const c_void, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_ftruncate_async(nfs: *mut nfs_context, fh: *mut nfsfh, length: u64, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_fsync_async(nfs: *mut nfs_context, fh: *mut nfsfh, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_close_async(nfs: *mut nfs_context, fh: *mut nfsfh, cb: nfs_cb, private: *mut c_void) -> c_int;
    fn nfs_statvfs_async(nfs: *mut nfs_context, path: *const c_char, cb: nfs_cb, private: *mut c_void) -> c_int;
}

extern "C" fn on_reply(err: c_int, _nfs: *mut nfs_context, data: *mut c_void, private: *mut c_void) {
    // SAFETY: every request is issued with a pointer from `into_private`
    unsafe { run_private(private, err, data) }
}

/// An open NFS file.
pub struct NfsFile(NonNull<nfsfh>);

/// An open NFS directory listing.
pub struct NfsDir(NonNull<nfsdir>);

// SAFETY: the handles are only touched through the owning context, which
// the backend keeps behind a mutex.
unsafe impl Send for NfsFile {}
unsafe impl Send for NfsDir {}

/// A mounted libnfs context.
pub struct LibNfs {
    ctx: NonNull<nfs_context>,
}

unsafe impl Send for LibNfs {}

fn stat_from(st: &nfs_stat_64) -> NfsStat {
    NfsStat {
        dev: st.nfs_dev,
        ino: st.nfs_ino,
        mode: st.nfs_mode as u32,
        nlink: st.nfs_nlink,
        uid: st.nfs_uid as u32,
        gid: st.nfs_gid as u32,
        rdev: st.nfs_rdev,
        size: st.nfs_size,
        blksize: st.nfs_blksize,
        blocks: st.nfs_blocks,
        atime: system_time(st.nfs_atime as i64, st.nfs_atime_nsec as i64),
        mtime: system_time(st.nfs_mtime as i64, st.nfs_mtime_nsec as i64),
        ctime: system_time(st.nfs_ctime as i64, st.nfs_ctime_nsec as i64),
    }
}

fn timeval_of(time: SystemTime) -> timeval {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    timeval {
        tv_sec: since.as_secs() as libc::time_t,
        tv_usec: since.subsec_micros() as libc::suseconds_t,
    }
}

/// Finishes requests whose reply carries no data.
fn status(done: Completer<()>) -> impl FnOnce(c_int, *mut c_void) + Send {
    move |err, _| done.complete_status(err, || ())
}

/// Finishes requests whose reply is a new handle.
fn handle<T: Send + 'static>(
    done: Completer<T>,
    wrap: fn(*mut c_void) -> Option<T>,
) -> impl FnOnce(c_int, *mut c_void) + Send {
    move |err, data| {
        if err < 0 {
            done.complete(Err(-err));
        } else {
            done.complete(wrap(data).ok_or(EIO));
        }
    }
}

impl LibNfs {
    /// Initializes a context and mounts the export named by `desc`.
    pub fn connect(desc: &ConnectionDescriptor) -> Result<Self, MountError> {
        // SAFETY: plain constructor
        let ctx = NonNull::new(unsafe { nfs_init_context() })
            .ok_or(MountError::ClientInit("nfs"))?;
        let client = Self { ctx };

        let url = c_path(Path::new(desc.client_url()))
            .map_err(|_| MountError::Parse(desc.display()))?;
        // SAFETY: the context is live and the url is NUL terminated
        let parsed = unsafe { nfs_parse_url_dir(client.ctx.as_ptr(), url.as_ptr()) };
        if parsed.is_null() {
            return Err(MountError::Parse(format!("{}: {}", desc.display(), client.error())));
        }

        // SAFETY: `parsed` is a live url owned by us until destroyed below
        let rc = unsafe {
            let url = &*parsed;
            if let (Some(uid), Some(gid)) = (desc.uid, desc.gid) {
                nfs_set_uid(client.ctx.as_ptr(), uid as c_int);
                nfs_set_gid(client.ctx.as_ptr(), gid as c_int);
            }
            info!("mounting nfs export {}", desc.display());
            let rc = nfs_mount(client.ctx.as_ptr(), url.server, url.path);
            nfs_destroy_url(parsed);
            rc
        };
        if rc != 0 {
            return Err(MountError::Mount {
                target: desc.display(),
                reason: client.error(),
            });
        }
        Ok(client)
    }

    fn error(&self) -> String {
        // SAFETY: the context is live; the text is copied before the next call
        unsafe { c_text(nfs_get_error(self.ctx.as_ptr())) }
    }

    fn issue(
        &mut self,
        reply: impl FnOnce(c_int, *mut c_void) + Send + 'static,
        call: impl FnOnce(*mut nfs_context, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let private = into_private(reply);
        let rc = call(self.ctx.as_ptr(), private);
        if rc < 0 {
            debug!("nfs request rejected: {}", self.error());
            // SAFETY: the library did not take the callback
            unsafe { reclaim(private) };
            return Err(rejected(rc));
        }
        Ok(())
    }

    fn path_request(
        &mut self,
        path: &Path,
        reply: impl FnOnce(c_int, *mut c_void) + Send + 'static,
        call: unsafe extern "C" fn(*mut nfs_context, *const c_char, nfs_cb, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: live context, NUL terminated path copied by the library
        self.issue(reply, |ctx, private| unsafe { call(ctx, path.as_ptr(), on_reply, private) })
    }

    fn two_path_request(
        &mut self,
        from: &Path,
        to: &Path,
        done: Completer<()>,
        call: unsafe extern "C" fn(*mut nfs_context, *const c_char, *const c_char, nfs_cb, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let (from, to) = (c_path(from)?, c_path(to)?);
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            call(ctx, from.as_ptr(), to.as_ptr(), on_reply, private)
        })
    }

    fn file_request(
        &mut self,
        file: &mut NfsFile,
        reply: impl FnOnce(c_int, *mut c_void) + Send + 'static,
        call: unsafe extern "C" fn(*mut nfs_context, *mut nfsfh, nfs_cb, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let fh = file.0.as_ptr();
        // SAFETY: the handle is open on this context
        self.issue(reply, |ctx, private| unsafe { call(ctx, fh, on_reply, private) })
    }
}

impl Drop for LibNfs {
    fn drop(&mut self) {
        // SAFETY: last use of the context
        unsafe { nfs_destroy_context(self.ctx.as_ptr()) }
    }
}

impl EventLoop for LibNfs {
    fn fd(&self) -> RawFd {
        // SAFETY: live context
        unsafe { nfs_get_fd(self.ctx.as_ptr()) }
    }

    fn which_events(&self) -> PollFlags {
        // SAFETY: live context
        PollFlags::from_bits_truncate(unsafe { nfs_which_events(self.ctx.as_ptr()) } as i16)
    }

    fn service(&mut self, revents: Option<PollFlags>) -> Result<(), c_int> {
        let revents = revents.map_or(0, |r| r.bits() as c_int);
        // SAFETY: live context; callbacks run on this thread
        if unsafe { nfs_service(self.ctx.as_ptr(), revents) } < 0 {
            debug!("nfs_service failed: {}", self.error());
            return Err(EIO);
        }
        Ok(())
    }
}

impl NfsClient for LibNfs {
    type File = NfsFile;
    type Dir = NfsDir;

    fn set_credentials(&mut self, uid: u32, gid: u32) {
        // SAFETY: live context
        unsafe {
            nfs_set_uid(self.ctx.as_ptr(), uid as c_int);
            nfs_set_gid(self.ctx.as_ptr(), gid as c_int);
        }
    }

    fn lstat(&mut self, path: &Path, done: Completer<NfsStat>) -> FsResult<()> {
        let reply = move |err: c_int, data: *mut c_void| {
            // SAFETY: on success `data` is a `struct nfs_stat_64`
            done.complete_status(err, || stat_from(unsafe { &*(data as *const nfs_stat_64) }))
        };
        self.path_request(path, reply, nfs_lstat64_async)
    }

    fn fstat(&mut self, file: &mut NfsFile, done: Completer<NfsStat>) -> FsResult<()> {
        let reply = move |err: c_int, data: *mut c_void| {
            // SAFETY: as in `lstat`
            done.complete_status(err, || stat_from(unsafe { &*(data as *const nfs_stat_64) }))
        };
        self.file_request(file, reply, nfs_fstat64_async)
    }

    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()> {
        let reply = move |err: c_int, data: *mut c_void| {
            // SAFETY: on success `data` is the NUL terminated target
            done.complete_status(err, || unsafe { CStr::from_ptr(data as *const c_char) }.to_bytes().to_vec())
        };
        self.path_request(path, reply, nfs_readlink_async)
    }

    fn opendir(&mut self, path: &Path, done: Completer<NfsDir>) -> FsResult<()> {
        let reply = handle(done, |data| NonNull::new(data as *mut nfsdir).map(NfsDir));
        self.path_request(path, reply, nfs_opendir_async)
    }

    fn readdir(&mut self, dir: &mut NfsDir) -> Option<NfsDirEntry> {
        // SAFETY: the listing is open on this context; entries live until closedir
        unsafe {
            let entry = nfs_readdir(self.ctx.as_ptr(), dir.0.as_ptr()).as_ref()?;
            Some(NfsDirEntry {
                name: OsStr::from_bytes(CStr::from_ptr(entry.name).to_bytes()).to_os_string(),
                ino: entry.inode,
                typ: entry.typ,
            })
        }
    }

    fn telldir(&mut self, dir: &mut NfsDir) -> i64 {
        // SAFETY: open listing
        match unsafe { nfs_telldir(self.ctx.as_ptr(), dir.0.as_ptr()) } {
            // past the last entry
            -1 => i64::MAX,
            pos => pos as i64,
        }
    }

    fn seekdir(&mut self, dir: &mut NfsDir, offset: i64) {
        // SAFETY: open listing; seeking past the end stops at the end
        unsafe { nfs_seekdir(self.ctx.as_ptr(), dir.0.as_ptr(), offset as c_long) }
    }

    fn closedir(&mut self, dir: NfsDir) {
        // SAFETY: the listing is not used again
        unsafe { nfs_closedir(self.ctx.as_ptr(), dir.0.as_ptr()) }
    }

    fn mknod(&mut self, path: &Path, mode: u32, rdev: u32, done: Completer<()>) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            nfs_mknod_async(ctx, path.as_ptr(), mode as c_int, rdev as c_int, on_reply, private)
        })
    }

    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), nfs_mkdir_async)
    }

    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), nfs_unlink_async)
    }

    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), nfs_rmdir_async)
    }

    fn symlink(&mut self, target: &Path, link: &Path, done: Completer<()>) -> FsResult<()> {
        self.two_path_request(target, link, done, nfs_symlink_async)
    }

    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        self.two_path_request(from, to, done, nfs_rename_async)
    }

    fn link(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        self.two_path_request(from, to, done, nfs_link_async)
    }

    fn chmod(&mut self, path: &Path, mode: u32, done: Completer<()>) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            nfs_chmod_async(ctx, path.as_ptr(), mode as c_int, on_reply, private)
        })
    }

    fn lchown(&mut self, path: &Path, uid: u32, gid: u32, done: Completer<()>) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            nfs_lchown_async(ctx, path.as_ptr(), uid as c_int, gid as c_int, on_reply, private)
        })
    }

    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            nfs_truncate_async(ctx, path.as_ptr(), size, on_reply, private)
        })
    }

    fn utimes(
        &mut self,
        path: &Path,
        atime: SystemTime,
        mtime: SystemTime,
        done: Completer<()>,
    ) -> FsResult<()> {
        let path = c_path(path)?;
        let mut times = [timeval_of(atime), timeval_of(mtime)];
        // SAFETY: the times are encoded into the request before returning
        self.issue(status(done), |ctx, private| unsafe {
            nfs_utimes_async(ctx, path.as_ptr(), times.as_mut_ptr(), on_reply, private)
        })
    }

    fn create(&mut self, path: &Path, flags: i32, mode: u32, done: Completer<NfsFile>) -> FsResult<()> {
        let path = c_path(path)?;
        let reply = handle(done, |data| NonNull::new(data as *mut nfsfh).map(NfsFile));
        // SAFETY: as in `path_request`
        self.issue(reply, |ctx, private| unsafe {
            nfs_create_async(ctx, path.as_ptr(), flags, mode as c_int, on_reply, private)
        })
    }

    fn open(&mut self, path: &Path, flags: i32, done: Completer<NfsFile>) -> FsResult<()> {
        let path = c_path(path)?;
        let reply = handle(done, |data| NonNull::new(data as *mut nfsfh).map(NfsFile));
        // SAFETY: as in `path_request`
        self.issue(reply, |ctx, private| unsafe {
            nfs_open_async(ctx, path.as_ptr(), flags, on_reply, private)
        })
    }

    fn pread(&mut self, file: &mut NfsFile, offset: u64, count: u32, done: Completer<Vec<u8>>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        let reply = move |err: c_int, data: *mut c_void| {
            // SAFETY: on success `data` holds `err` bytes
            done.complete_status(err, || unsafe {
                std::slice::from_raw_parts(data as *const u8, err as usize).to_vec()
            })
        };
        // SAFETY: open handle
        self.issue(reply, |ctx, private| unsafe {
            nfs_pread_async(ctx, fh, offset, u64::from(count), on_reply, private)
        })
    }

    fn pwrite(&mut self, file: &mut NfsFile, offset: u64, data: &[u8], done: Completer<u32>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        let payload = data.to_vec();
        let buf = payload.as_ptr() as *const c_void;
        let count = payload.len() as u64;
        let reply = move |err: c_int, _data: *mut c_void| {
            drop(payload);
            done.complete_status(err, || err as u32)
        };
        // SAFETY: open handle; the payload is owned by the reply, which lives
        // until the library calls back even if the request is abandoned
        self.issue(reply, |ctx, private| unsafe {
            nfs_pwrite_async(ctx, fh, offset, count, buf, on_reply, private)
        })
    }

    fn ftruncate(&mut self, file: &mut NfsFile, size: u64, done: Completer<()>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        // SAFETY: open handle
        self.issue(status(done), |ctx, private| unsafe {
            nfs_ftruncate_async(ctx, fh, size, on_reply, private)
        })
    }

    fn fsync(&mut self, file: &mut NfsFile, done: Completer<()>) -> FsResult<()> {
        self.file_request(file, status(done), nfs_fsync_async)
    }

    fn close(&mut self, mut file: NfsFile, done: Completer<()>) -> FsResult<()> {
        self.file_request(&mut file, status(done), nfs_close_async)
    }

    fn statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()> {
        let reply = move |err: c_int, data: *mut c_void| {
            done.complete_status(err, || {
                // SAFETY: on success `data` is a `struct statvfs`
                let st = unsafe { &*(data as *const libc::statvfs) };
                StatFs {
                    blocks: st.f_blocks as u64,
                    bfree: st.f_bfree as u64,
                    bavail: st.f_bavail as u64,
                    files: st.f_files as u64,
                    ffree: st.f_ffree as u64,
                    bsize: st.f_bsize as u32,
                    namelen: st.f_namemax as u32,
                    frsize: st.f_frsize as u32,
                }
            })
        };
        self.path_request(path, reply, nfs_statvfs_async)
    }
}
