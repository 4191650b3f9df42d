//! Operation table composition and the mount lifecycle.
//!
//! The composer turns a [`MountConfig`] into a mounted filesystem: it
//! parses the connection string, connects the matching backend and builds
//! the kernel mount options. Every way this can fail has its own process
//! exit code.

use super::backend::Backend;
use super::config::MountConfig;
use super::constants::{
    EXIT_ARGUMENTS, EXIT_CLIENT_INIT, EXIT_MISSING_CONFIG, EXIT_MOUNT, EXIT_PARSE, EXIT_SESSION,
    EXIT_UNRECOGNIZED_SCHEME, PROGRAM_NAME,
};
use super::descriptor::{BackendKind, ConnectionDescriptor, DescriptorError};
use super::filesystem::MountedFs;
use super::local::LocalBackend;
use super::oplog::OpLog;
use fuser::MountOption;
use libc::{SIGINT, SIGTERM};
use log::{debug, info, warn};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use thiserror::Error;

/// Why a mount could not be set up or kept running.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("cannot initialize the {0} client library")]
    ClientInit(&'static str),
    #[error("cannot parse connection string {0}")]
    Parse(String),
    #[error("cannot mount {target}: {reason}")]
    Mount { target: String, reason: String },
    #[error("invalid mount arguments: {0}")]
    Arguments(String),
    #[error("unrecognized connection scheme in {0}")]
    UnrecognizedScheme(String),
    #[error("fuse session failed: {0}")]
    Session(#[source] std::io::Error),
}

impl MountError {
    /// Process exit code reported for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            MountError::MissingConfig(_) => EXIT_MISSING_CONFIG,
            MountError::ClientInit(_) => EXIT_CLIENT_INIT,
            MountError::Parse(_) => EXIT_PARSE,
            MountError::Mount { .. } => EXIT_MOUNT,
            MountError::Arguments(_) => EXIT_ARGUMENTS,
            MountError::UnrecognizedScheme(_) => EXIT_UNRECOGNIZED_SCHEME,
            MountError::Session(_) => EXIT_SESSION,
        }
    }
}

impl From<DescriptorError> for MountError {
    fn from(err: DescriptorError) -> Self {
        match err {
            DescriptorError::UnrecognizedScheme(conn) => MountError::UnrecognizedScheme(conn),
            DescriptorError::Parse { conn, reason } => {
                MountError::Parse(format!("{}: {}", conn, reason))
            }
        }
    }
}

/// Creates connected backends for parsed connection strings.
pub trait Connector {
    fn local(&self, desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError> {
        let backend = LocalBackend::new(&desc.path).map_err(|err| MountError::Mount {
            target: desc.path.clone(),
            reason: err.to_string(),
        })?;
        Ok(Box::new(backend))
    }

    fn nfs(&self, desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError>;

    fn smb(&self, desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError>;
}

/// Connects through the client libraries linked into this build.
///
/// Without the `libnfs` or `libsmb2` feature the matching scheme fails
/// with [`MountError::ClientInit`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkedConnector;

impl Connector for LinkedConnector {
    #[cfg(feature = "libnfs")]
    fn nfs(&self, desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError> {
        use super::identity::IdentityMap;
        use super::nfs::NfsBackend;

        let client = super::ffi::libnfs::LibNfs::connect(desc)?;
        let identity = IdentityMap::new(desc.uid, desc.gid);
        Ok(Box::new(NfsBackend::new(client, identity)))
    }

    #[cfg(not(feature = "libnfs"))]
    fn nfs(&self, _desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError> {
        Err(MountError::ClientInit("nfs"))
    }

    #[cfg(feature = "libsmb2")]
    fn smb(&self, desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError> {
        let client = super::ffi::libsmb2::LibSmb2::connect(desc)?;
        Ok(Box::new(super::smb::SmbBackend::new(client)))
    }

    #[cfg(not(feature = "libsmb2"))]
    fn smb(&self, _desc: &ConnectionDescriptor) -> Result<Box<dyn Backend>, MountError> {
        Err(MountError::ClientInit("smb"))
    }
}

/// Maps one pass-through `-o` option to a kernel mount option.
fn mount_option(opt: &str) -> Result<MountOption, MountError> {
    if opt.contains('\0') {
        return Err(MountError::Arguments(format!("option {:?} contains a NUL byte", opt)));
    }
    Ok(match opt {
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        "dirsync" => MountOption::DirSync,
        other => MountOption::CUSTOM(other.to_string()),
    })
}

/// Everything decided before any backend is contacted.
#[derive(Debug)]
pub struct MountPlan {
    pub descriptor: ConnectionDescriptor,
    pub mountpoint: PathBuf,
    pub options: Vec<MountOption>,
    pub logfile: Option<PathBuf>,
    pub single_threaded: bool,
}

impl MountPlan {
    pub fn kind(&self) -> BackendKind {
        self.descriptor.kind
    }
}

/// A connected backend ready to be mounted.
pub struct Composed {
    pub plan: MountPlan,
    pub fs: MountedFs,
}

/// Builds mounts from configuration.
pub struct Composer;

impl Composer {
    /// Validates `config` and derives the mount options.
    pub fn plan(config: &MountConfig) -> Result<MountPlan, MountError> {
        if config.mountpoint.as_os_str().is_empty() {
            return Err(MountError::MissingConfig("mount point"));
        }
        let conn = config
            .fsname
            .as_deref()
            .ok_or(MountError::MissingConfig("fsname=<connection string>"))?;
        let descriptor = ConnectionDescriptor::parse(conn)?;

        // the local path is shown as is, remote ones only masked
        let fsname = match descriptor.kind {
            BackendKind::Local => descriptor.path.clone(),
            BackendKind::Nfs | BackendKind::Smb => descriptor.display(),
        };
        let subtype = config
            .subtype
            .clone()
            .unwrap_or_else(|| PROGRAM_NAME.to_string());

        let mut options = vec![MountOption::FSName(fsname), MountOption::Subtype(subtype)];
        for opt in &config.options {
            options.push(mount_option(opt)?);
        }

        let single_threaded = config.single_threaded || descriptor.kind != BackendKind::Local;
        Ok(MountPlan {
            descriptor,
            mountpoint: config.mountpoint.clone(),
            options,
            logfile: config.logfile.clone(),
            single_threaded,
        })
    }

    /// Plans the mount and connects its backend.
    pub fn compose(config: &MountConfig, connector: &dyn Connector) -> Result<Composed, MountError> {
        let plan = Self::plan(config)?;
        info!("connecting {} backend for {}", plan.kind(), plan.descriptor);

        let backend = match plan.kind() {
            BackendKind::Local => connector.local(&plan.descriptor)?,
            BackendKind::Nfs => connector.nfs(&plan.descriptor)?,
            BackendKind::Smb => connector.smb(&plan.descriptor)?,
        };
        debug!(
            "backend dispatch {:?}, single threaded: {}",
            backend.dispatch(),
            plan.single_threaded
        );

        let tag = plan.kind().tag();
        let log = match OpLog::open(tag, plan.logfile.as_deref()) {
            Ok(log) => log,
            Err(err) => {
                warn!("cannot open operation log: {}", err);
                OpLog::disabled(tag)
            }
        };

        Ok(Composed {
            fs: MountedFs::new(backend, log, plan.single_threaded),
            plan,
        })
    }
}

/// Runs one composed mount until the process is told to stop.
pub struct FilesystemManager {
    composed: Composed,
}

impl FilesystemManager {
    pub fn new(composed: Composed) -> Self {
        Self { composed }
    }

    /// Mounts the filesystem and blocks until SIGINT or SIGTERM.
    ///
    /// Dropping the session on the way out unmounts it.
    pub fn mount(self) -> Result<(), MountError> {
        let Composed { plan, fs } = self.composed;
        info!(
            "mounting {} on {} with {} worker threads",
            plan.descriptor,
            plan.mountpoint.display(),
            fs.worker_threads()
        );

        let session = fuser::spawn_mount2(fs, &plan.mountpoint, &plan.options)
            .map_err(MountError::Session)?;

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(MountError::Session)?;
        for sig in signals.forever() {
            match sig {
                SIGINT | SIGTERM => {
                    info!("Received signal {}, unmounting...", sig);
                    break;
                }
                _ => {}
            }
        }

        drop(session);
        info!("unmounted {}", plan.mountpoint.display());
        Ok(())
    }
}
