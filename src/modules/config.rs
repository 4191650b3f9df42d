//! Mount configuration built from FUSE-style `-o` option lists.

use super::credentials::mask_credentials;
use std::fmt;
use std::path::PathBuf;

/// Everything the composer needs to build one mount.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MountConfig {
    /// Where the filesystem is mounted
    pub mountpoint: PathBuf,
    /// Connection string from `fsname=`
    pub fsname: Option<String>,
    /// Operation log from `logfile=`
    pub logfile: Option<PathBuf>,
    /// Filesystem subtype from `subtype=`
    pub subtype: Option<String>,
    /// Options handed to the kernel mount unchanged
    pub options: Vec<String>,
    /// `-s` was given
    pub single_threaded: bool,
}

impl MountConfig {
    /// Builds a configuration from `-o` arguments.
    ///
    /// Each argument may hold several comma separated options. `modules=`
    /// and `subdir=` belong to libfuse stacking and are discarded.
    pub fn from_options<S: AsRef<str>>(mountpoint: PathBuf, args: &[S]) -> Self {
        let mut config = Self {
            mountpoint,
            ..Self::default()
        };

        for opt in args.iter().flat_map(|arg| arg.as_ref().split(',')) {
            if opt.is_empty() {
                continue;
            }
            match opt.split_once('=') {
                Some(("fsname", value)) => config.fsname = Some(value.to_string()),
                Some(("logfile", value)) => config.logfile = Some(PathBuf::from(value)),
                Some(("subtype", value)) => config.subtype = Some(value.to_string()),
                Some(("modules", _)) | Some(("subdir", _)) => {}
                _ => config.options.push(opt.to_string()),
            }
        }

        config
    }

    /// Requests single-threaded dispatch.
    pub fn single_threaded(mut self, single: bool) -> Self {
        self.single_threaded = single;
        self
    }
}

impl fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountConfig")
            .field("mountpoint", &self.mountpoint)
            .field("fsname", &self.fsname.as_deref().map(mask_credentials))
            .field("logfile", &self.logfile)
            .field("subtype", &self.subtype)
            .field("options", &self.options)
            .field("single_threaded", &self.single_threaded)
            .finish()
    }
}
