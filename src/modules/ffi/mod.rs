//! Bindings to the system NFS and SMB client libraries.
//!
//! Both libraries run every request asynchronously and report the result
//! through a C callback carrying an opaque `private_data` pointer. Here that
//! pointer is always a boxed Rust closure which converts the library's
//! result and hands it to the request's completer. Each closure runs at most
//! once: either from the callback, or it is reclaimed when the library
//! rejects the request before queueing it.

use super::backend::FsResult;
use libc::{c_char, c_int, c_void, EINVAL};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

#[cfg(feature = "libnfs")]
pub mod libnfs;
#[cfg(feature = "libsmb2")]
pub mod libsmb2;

type Callback = Box<dyn FnOnce(c_int, *mut c_void) + Send>;

/// Boxes `callback` into a `private_data` pointer.
pub(crate) fn into_private(callback: impl FnOnce(c_int, *mut c_void) + Send + 'static) -> *mut c_void {
    let callback: Callback = Box::new(callback);
    Box::into_raw(Box::new(callback)) as *mut c_void
}

/// Runs and frees the closure behind a `private_data` pointer.
///
/// # Safety
///
/// `private` must come from [`into_private`] and not have been used before.
pub(crate) unsafe fn run_private(private: *mut c_void, status: c_int, data: *mut c_void) {
    let callback = Box::from_raw(private as *mut Callback);
    callback(status, data);
}

/// Frees a closure the library never accepted.
///
/// # Safety
///
/// Same contract as [`run_private`].
pub(crate) unsafe fn reclaim(private: *mut c_void) {
    drop(Box::from_raw(private as *mut Callback));
}

pub(crate) fn c_path(path: &Path) -> FsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| EINVAL)
}

/// Copies a library-owned C string.
///
/// # Safety
///
/// `ptr` must be null or point at a NUL terminated string.
pub(crate) unsafe fn c_text(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Error of a request the library refused to queue.
///
/// Newer library versions return a negative errno, older ones `-1`.
pub(crate) fn rejected(rc: c_int) -> c_int {
    if rc < -1 {
        -rc
    } else {
        libc::EIO
    }
}
