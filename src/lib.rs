#![doc(html_root_url = "https://docs.rs/fusenfs/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! fusenfs: one FUSE filesystem for local directories, NFS exports and SMB shares
//!
//! The backend is picked from the `fsname=` connection string:
//!
//! - a plain path re-exports a local directory below the mount point
//! - `nfs://[user@]server[:port]/export[/subpath][?uid=N&gid=N]` talks to an NFS server
//! - `smb://[domain;][user@]server[:port]/share[/subpath][?password=...]` talks to an SMB server
//!
//! Passwords and credential file paths never show up in the mount table or
//! in logs, see [`mask_credentials`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fusenfs::{Composer, FilesystemManager, LinkedConnector, MountConfig};
//! use std::path::PathBuf;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = MountConfig::from_options(
//!     PathBuf::from("/mnt/export"),
//!     &["fsname=/srv/data,allow_other"],
//! );
//! let composed = Composer::compose(&config, &LinkedConnector)?;
//!
//! // Blocks until SIGINT or SIGTERM, then unmounts
//! FilesystemManager::new(composed).mount()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `libnfs`: link the system libnfs for `nfs://` connection strings
//! - `libsmb2`: link the system libsmb2 for `smb://` connection strings

pub mod modules;

pub use modules::backend::Backend;
pub use modules::config::MountConfig;
pub use modules::credentials::mask_credentials;
pub use modules::descriptor::{BackendKind, ConnectionDescriptor};
pub use modules::local::LocalBackend;
pub use modules::mount::{Composer, Connector, FilesystemManager, LinkedConnector, MountError};

// Backends over pluggable client libraries
pub use modules::nfs::{NfsBackend, NfsClient};
pub use modules::smb::{SmbBackend, SmbClient};
