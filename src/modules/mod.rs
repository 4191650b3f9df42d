//! Core filesystem modules.
//!
//! This module provides the main components of the filesystem:
//!
//! - `config`, `descriptor`, `credentials`: what to mount and how to show it
//! - `completion`, `driver`: waiting on asynchronous client libraries
//! - `backend`, `local`, `nfs`, `smb`: the three storage backends
//! - `filesystem`, `inodes`, `handles`, `locks`: the FUSE operation table
//! - `workers`: threads serving backends that accept concurrent requests
//! - `mount`: composing and running a mount
//! - `daemon`: detaching from the terminal

pub mod backend;
pub mod completion;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod daemon;
pub mod descriptor;
pub mod driver;
#[cfg_attr(not(any(feature = "libnfs", feature = "libsmb2")), allow(dead_code))]
pub mod ffi;
pub mod filesystem;
pub mod handles;
pub mod identity;
pub mod inodes;
pub mod local;
pub mod locks;
pub mod mount;
pub mod nfs;
pub mod oplog;
pub mod smb;
pub mod workers;

#[cfg(test)]
pub mod loopback;
