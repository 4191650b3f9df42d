//! `SmbClient` over the system libsmb2.

#![allow(non_camel_case_types)]

use super::{c_path, c_text, into_private, reclaim, rejected, run_private};
use crate::modules::backend::{system_time, FsResult, StatFs};
use crate::modules::completion::Completer;
use crate::modules::descriptor::ConnectionDescriptor;
use crate::modules::driver::EventLoop;
use crate::modules::mount::MountError;
use crate::modules::smb::{SmbClient, SmbDirEntry, SmbStat};
use libc::{c_char, c_int, c_long, c_void, EIO};
use log::{debug, info};
use nix::poll::PollFlags;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

const SMB2_NEGOTIATE_SIGNING_ENABLED: u16 = 0x0001;

#[repr(C)]
struct smb2_context {
    _private: [u8; 0],
}

#[repr(C)]
struct smb2fh {
    _private: [u8; 0],
}

#[repr(C)]
struct smb2dir {
    _private: [u8; 0],
}

#[repr(C)]
struct smb2_url {
    domain: *const c_char,
    user: *const c_char,
    server: *const c_char,
    share: *const c_char,
    path: *const c_char,
}

#[repr(C)]
#[derive(Default)]
struct smb2_stat_64 {
    smb2_type: u32,
    smb2_nlink: u32,
    smb2_ino: u64,
    smb2_size: u64,
    smb2_atime: u64,
    smb2_atime_nsec: u64,
    smb2_mtime: u64,
    smb2_mtime_nsec: u64,
    smb2_ctime: u64,
    smb2_ctime_nsec: u64,
    smb2_btime: u64,
    smb2_btime_nsec: u64,
}

#[repr(C)]
struct smb2dirent {
    name: *const c_char,
    st: smb2_stat_64,
}

#[repr(C)]
#[derive(Default)]
struct smb2_statvfs {
    f_bsize: u32,
    f_frsize: u32,
    f_blocks: u64,
    f_bfree: u64,
    f_bavail: u64,
    f_files: u32,
    f_ffree: u32,
    f_favail: u32,
    f_fsid: u32,
    f_flag: u32,
    f_namemax: u32,
}

type smb2_command_cb = extern "C" fn(smb2: *mut smb2_context, status: c_int, data: *mut c_void, private: *mut c_void);

#[link(name = "smb2")]
extern "C" {
    fn smb2_init_context() -> *mut smb2_context;
    fn smb2_destroy_context(smb2: *mut smb2_context);
    fn smb2_get_error(smb2: *mut smb2_context) -> *const c_char;
    fn smb2_parse_url(smb2: *mut smb2_context, url: *const c_char) -> *mut smb2_url;
    fn smb2_destroy_url(url: *mut smb2_url);
    fn smb2_set_security_mode(smb2: *mut smb2_context, mode: u16);
    fn smb2_set_password(smb2: *mut smb2_context, password: *const c_char);
    fn smb2_set_domain(smb2: *mut smb2_context, domain: *const c_char);
    fn smb2_connect_share(smb2: *mut smb2_context, server: *const c_char, share: *const c_char, user: *const c_char) -> c_int;
    fn smb2_disconnect_share(smb2: *mut smb2_context) -> c_int;

    fn smb2_get_fd(smb2: *mut smb2_context) -> c_int;
    fn smb2_which_events(smb2: *mut smb2_context) -> c_int;
    fn smb2_service(smb2: *mut smb2_context, revents: c_int) -> c_int;

    fn smb2_stat_async(smb2: *mut smb2_context, path: *const c_char, st: *mut smb2_stat_64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_fstat_async(smb2: *mut smb2_context, fh: *mut smb2fh, st: *mut smb2_stat_64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_readlink_async(smb2: *mut smb2_context, path: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_opendir_async(smb2: *mut smb2_context, path: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_readdir(smb2: *mut smb2_context, dir: *mut smb2dir) -> *mut smb2dirent;
    fn smb2_telldir(smb2: *mut smb2_context, dir: *mut smb2dir) -> c_long;
    fn smb2_seekdir(smb2: *mut smb2_context, dir: *mut smb2dir, loc: c_long);
    fn smb2_closedir(smb2: *mut smb2_context, dir: *mut smb2dir);
    fn smb2_mkdir_async(smb2: *mut smb2_context, path: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_rmdir_async(smb2: *mut smb2_context, path: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_unlink_async(smb2: *mut smb2_context, path: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_rename_async(smb2: *mut smb2_context, from: *const c_char, to: *const c_char, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_truncate_async(smb2: *mut smb2_context, path: *const c_char, length: u64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_open_async(smb2: *mut smb2_context, path: *const c_char, flags: c_int, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_close_async(smb2: *mut smb2_context, fh: *mut smb2fh, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_fsync_async(smb2: *mut smb2_context, fh: *mut smb2fh, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_pread_async(smb2: *mut smb2_context, fh: *mut smb2fh, buf: *mut u8, count: u32, offset: u64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_pwrite_async(smb2: *mut smb2_context, fh: *mut smb2fh, buf: *const u8, count: u32, offset: u64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_ftruncate_async(smb2: *mut smb2_context, fh: *mut smb2fh, length: u64, cb: smb2_command_cb, private: *mut c_void) -> c_int;
    fn smb2_statvfs_async(smb2: *mut smb2_context, path: *const c_char, st: *mut smb2_statvfs, cb: smb2_command_cb, private: *mut c_void) -> c_int;
}

extern "C" fn on_reply(_smb2: *mut smb2_context, status: c_int, data: *mut c_void, private: *mut c_void) {
    // SAFETY: every request is issued with a pointer from `into_private`
    unsafe { run_private(private, status, data) }
}

/// An open SMB file.
pub struct SmbFile(NonNull<smb2fh>);

/// An open SMB directory listing.
pub struct SmbDir(NonNull<smb2dir>);

// SAFETY: only touched through the owning context, which the backend keeps
// behind a mutex.
unsafe impl Send for SmbFile {}
unsafe impl Send for SmbDir {}

/// A connected libsmb2 context.
pub struct LibSmb2 {
    ctx: NonNull<smb2_context>,
    connected: bool,
}

unsafe impl Send for LibSmb2 {}

fn stat_from(st: &smb2_stat_64) -> SmbStat {
    SmbStat {
        typ: st.smb2_type,
        nlink: st.smb2_nlink,
        ino: st.smb2_ino,
        size: st.smb2_size,
        atime: system_time(st.smb2_atime as i64, st.smb2_atime_nsec as i64),
        mtime: system_time(st.smb2_mtime as i64, st.smb2_mtime_nsec as i64),
        ctime: system_time(st.smb2_ctime as i64, st.smb2_ctime_nsec as i64),
        btime: system_time(st.smb2_btime as i64, st.smb2_btime_nsec as i64),
    }
}

fn status(done: Completer<()>) -> impl FnOnce(c_int, *mut c_void) + Send {
    move |status, _| done.complete_status(status, || ())
}

/// Finishes a request that fills a caller-provided buffer.
///
/// The buffer is owned by the reply so it outlives the request.
fn filled<B: Send + 'static, T: Send + 'static>(
    done: Completer<T>,
    buffer: Box<B>,
    convert: fn(&B) -> T,
) -> impl FnOnce(c_int, *mut c_void) + Send {
    move |status, _| done.complete_status(status, || convert(&buffer))
}

impl LibSmb2 {
    /// Initializes a context and connects to the share named by `desc`.
    pub fn connect(desc: &ConnectionDescriptor) -> Result<Self, MountError> {
        // SAFETY: plain constructor
        let ctx = NonNull::new(unsafe { smb2_init_context() })
            .ok_or(MountError::ClientInit("smb"))?;
        let mut client = Self {
            ctx,
            connected: false,
        };

        let url = CString::new(desc.client_url()).map_err(|_| MountError::Parse(desc.display()))?;
        // SAFETY: live context, NUL terminated url
        let parsed = unsafe { smb2_parse_url(client.ctx.as_ptr(), url.as_ptr()) };
        if parsed.is_null() {
            return Err(MountError::Parse(format!("{}: {}", desc.display(), client.error())));
        }

        let password = desc
            .password
            .as_ref()
            .map(|secret| CString::new(secret.expose()))
            .transpose()
            .map_err(|_| MountError::Arguments("password contains a NUL byte".into()));
        let domain = desc
            .domain
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| MountError::Arguments("domain contains a NUL byte".into()));

        // SAFETY: `parsed` stays live until destroyed at the end of the block
        let rc = unsafe {
            let rc = match (password, domain) {
                (Ok(password), Ok(domain)) => {
                    if let Some(password) = &password {
                        smb2_set_password(client.ctx.as_ptr(), password.as_ptr());
                    }
                    if let Some(domain) = &domain {
                        smb2_set_domain(client.ctx.as_ptr(), domain.as_ptr());
                    }
                    smb2_set_security_mode(client.ctx.as_ptr(), SMB2_NEGOTIATE_SIGNING_ENABLED);
                    info!("connecting to smb share {}", desc.display());
                    let url = &*parsed;
                    Ok(smb2_connect_share(client.ctx.as_ptr(), url.server, url.share, url.user))
                }
                (Err(err), _) | (_, Err(err)) => Err(err),
            };
            smb2_destroy_url(parsed);
            rc?
        };
        if rc != 0 {
            return Err(MountError::Mount {
                target: desc.display(),
                reason: client.error(),
            });
        }
        client.connected = true;
        Ok(client)
    }

    fn error(&self) -> String {
        // SAFETY: live context; the text is copied before the next call
        unsafe { c_text(smb2_get_error(self.ctx.as_ptr())) }
    }

    fn issue(
        &mut self,
        reply: impl FnOnce(c_int, *mut c_void) + Send + 'static,
        call: impl FnOnce(*mut smb2_context, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let private = into_private(reply);
        let rc = call(self.ctx.as_ptr(), private);
        if rc < 0 {
            debug!("smb request rejected: {}", self.error());
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
        call: unsafe extern "C" fn(*mut smb2_context, *const c_char, smb2_command_cb, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: live context; the path is copied into the request
        self.issue(reply, |ctx, private| unsafe { call(ctx, path.as_ptr(), on_reply, private) })
    }

    fn file_request(
        &mut self,
        file: &mut SmbFile,
        done: Completer<()>,
        call: unsafe extern "C" fn(*mut smb2_context, *mut smb2fh, smb2_command_cb, *mut c_void) -> c_int,
    ) -> FsResult<()> {
        let fh = file.0.as_ptr();
        // SAFETY: the handle is open on this context
        self.issue(status(done), |ctx, private| unsafe { call(ctx, fh, on_reply, private) })
    }
}

impl Drop for LibSmb2 {
    fn drop(&mut self) {
        // SAFETY: last use of the context
        unsafe {
            if self.connected {
                smb2_disconnect_share(self.ctx.as_ptr());
            }
            smb2_destroy_context(self.ctx.as_ptr());
        }
    }
}

impl EventLoop for LibSmb2 {
    fn fd(&self) -> RawFd {
        // SAFETY: live context
        unsafe { smb2_get_fd(self.ctx.as_ptr()) }
    }

    fn which_events(&self) -> PollFlags {
        // SAFETY: live context
        PollFlags::from_bits_truncate(unsafe { smb2_which_events(self.ctx.as_ptr()) } as i16)
    }

    fn service(&mut self, revents: Option<PollFlags>) -> Result<(), c_int> {
        let revents = revents.map_or(0, |r| r.bits() as c_int);
        // SAFETY: live context; callbacks run on this thread
        if unsafe { smb2_service(self.ctx.as_ptr(), revents) } < 0 {
            debug!("smb2_service failed: {}", self.error());
            return Err(EIO);
        }
        Ok(())
    }
}

impl SmbClient for LibSmb2 {
    type File = SmbFile;
    type Dir = SmbDir;

    fn stat(&mut self, path: &Path, done: Completer<SmbStat>) -> FsResult<()> {
        let path = c_path(path)?;
        let mut st = Box::<smb2_stat_64>::default();
        let buf: *mut smb2_stat_64 = &mut *st;
        let reply = filled(done, st, stat_from);
        // SAFETY: the stat buffer lives inside the reply until it runs
        self.issue(reply, |ctx, private| unsafe {
            smb2_stat_async(ctx, path.as_ptr(), buf, on_reply, private)
        })
    }

    fn fstat(&mut self, file: &mut SmbFile, done: Completer<SmbStat>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        let mut st = Box::<smb2_stat_64>::default();
        let buf: *mut smb2_stat_64 = &mut *st;
        let reply = filled(done, st, stat_from);
        // SAFETY: as in `stat`
        self.issue(reply, |ctx, private| unsafe { smb2_fstat_async(ctx, fh, buf, on_reply, private) })
    }

    fn readlink(&mut self, path: &Path, done: Completer<Vec<u8>>) -> FsResult<()> {
        let reply = move |status: c_int, data: *mut c_void| {
            // SAFETY: on success `data` is the NUL terminated target
            done.complete_status(status, || unsafe { CStr::from_ptr(data as *const c_char) }.to_bytes().to_vec())
        };
        self.path_request(path, reply, smb2_readlink_async)
    }

    fn opendir(&mut self, path: &Path, done: Completer<SmbDir>) -> FsResult<()> {
        let reply = move |status: c_int, data: *mut c_void| {
            if status < 0 {
                done.complete(Err(-status));
            } else {
                done.complete(NonNull::new(data as *mut smb2dir).map(SmbDir).ok_or(EIO));
            }
        };
        self.path_request(path, reply, smb2_opendir_async)
    }

    fn readdir(&mut self, dir: &mut SmbDir) -> Option<SmbDirEntry> {
        // SAFETY: open listing; entries live until closedir
        unsafe {
            let entry = smb2_readdir(self.ctx.as_ptr(), dir.0.as_ptr()).as_ref()?;
            Some(SmbDirEntry {
                name: OsStr::from_bytes(CStr::from_ptr(entry.name).to_bytes()).to_os_string(),
                ino: entry.st.smb2_ino,
                typ: entry.st.smb2_type,
            })
        }
    }

    fn telldir(&mut self, dir: &mut SmbDir) -> i64 {
        // SAFETY: open listing
        unsafe { smb2_telldir(self.ctx.as_ptr(), dir.0.as_ptr()) as i64 }
    }

    fn seekdir(&mut self, dir: &mut SmbDir, offset: i64) {
        // SAFETY: open listing
        unsafe { smb2_seekdir(self.ctx.as_ptr(), dir.0.as_ptr(), offset as c_long) }
    }

    fn closedir(&mut self, dir: SmbDir) {
        // SAFETY: the listing is not used again
        unsafe { smb2_closedir(self.ctx.as_ptr(), dir.0.as_ptr()) }
    }

    fn mkdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), smb2_mkdir_async)
    }

    fn unlink(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), smb2_unlink_async)
    }

    fn rmdir(&mut self, path: &Path, done: Completer<()>) -> FsResult<()> {
        self.path_request(path, status(done), smb2_rmdir_async)
    }

    fn rename(&mut self, from: &Path, to: &Path, done: Completer<()>) -> FsResult<()> {
        let (from, to) = (c_path(from)?, c_path(to)?);
        // SAFETY: live context; both paths are copied into the request
        self.issue(status(done), |ctx, private| unsafe {
            smb2_rename_async(ctx, from.as_ptr(), to.as_ptr(), on_reply, private)
        })
    }

    fn truncate(&mut self, path: &Path, size: u64, done: Completer<()>) -> FsResult<()> {
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(status(done), |ctx, private| unsafe {
            smb2_truncate_async(ctx, path.as_ptr(), size, on_reply, private)
        })
    }

    fn open(&mut self, path: &Path, flags: i32, done: Completer<SmbFile>) -> FsResult<()> {
        let reply = move |status: c_int, data: *mut c_void| {
            if status < 0 {
                done.complete(Err(-status));
            } else {
                done.complete(NonNull::new(data as *mut smb2fh).map(SmbFile).ok_or(EIO));
            }
        };
        let path = c_path(path)?;
        // SAFETY: as in `path_request`
        self.issue(reply, |ctx, private| unsafe {
            smb2_open_async(ctx, path.as_ptr(), flags, on_reply, private)
        })
    }

    fn pread(&mut self, file: &mut SmbFile, offset: u64, count: u32, done: Completer<Vec<u8>>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        let mut buffer = vec![0u8; count as usize];
        let buf = buffer.as_mut_ptr();
        let reply = move |status: c_int, _data: *mut c_void| {
            done.complete_status(status, || {
                buffer.truncate(status as usize);
                buffer
            })
        };
        // SAFETY: the buffer is owned by the reply, which outlives the request
        self.issue(reply, |ctx, private| unsafe {
            smb2_pread_async(ctx, fh, buf, count, offset, on_reply, private)
        })
    }

    fn pwrite(&mut self, file: &mut SmbFile, offset: u64, data: &[u8], done: Completer<u32>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        let payload = data.to_vec();
        let buf = payload.as_ptr();
        let count = payload.len() as u32;
        let reply = move |status: c_int, _data: *mut c_void| {
            drop(payload);
            done.complete_status(status, || status as u32)
        };
        // SAFETY: the payload is owned by the reply, which outlives the request
        self.issue(reply, |ctx, private| unsafe {
            smb2_pwrite_async(ctx, fh, buf, count, offset, on_reply, private)
        })
    }

    fn ftruncate(&mut self, file: &mut SmbFile, size: u64, done: Completer<()>) -> FsResult<()> {
        let fh = file.0.as_ptr();
        // SAFETY: open handle
        self.issue(status(done), |ctx, private| unsafe {
            smb2_ftruncate_async(ctx, fh, size, on_reply, private)
        })
    }

    fn fsync(&mut self, file: &mut SmbFile, done: Completer<()>) -> FsResult<()> {
        self.file_request(file, done, smb2_fsync_async)
    }

    fn close(&mut self, mut file: SmbFile, done: Completer<()>) -> FsResult<()> {
        self.file_request(&mut file, done, smb2_close_async)
    }

    fn statvfs(&mut self, path: &Path, done: Completer<StatFs>) -> FsResult<()> {
        let path = c_path(path)?;
        let mut st = Box::<smb2_statvfs>::default();
        let buf: *mut smb2_statvfs = &mut *st;
        let reply = filled(done, st, |st| StatFs {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: u64::from(st.f_files),
            ffree: u64::from(st.f_ffree),
            bsize: st.f_bsize,
            namelen: st.f_namemax,
            frsize: st.f_frsize,
        });
        // SAFETY: as in `stat`
        self.issue(reply, |ctx, private| unsafe {
            smb2_statvfs_async(ctx, path.as_ptr(), buf, on_reply, private)
        })
    }
}
