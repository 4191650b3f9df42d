use anyhow::Result;
use log::{error, info};
use nix::sys::stat;
use nix::unistd::{self, fork, ForkResult};
use std::fs::File;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// A Unix daemon process manager.
///
/// Detaches the mount from the controlling terminal before the FUSE
/// session starts, so the shell that ran the mount returns immediately.
pub struct Daemon {
    pid_file: Option<PathBuf>,
    work_dir: PathBuf,
}

impl Daemon {
    /// Creates a new daemon instance.
    ///
    /// # Arguments
    ///
    /// * `pid_file` - Where to record the daemon's process ID, if anywhere
    /// * `work_dir` - Working directory for the daemon process
    pub fn new(pid_file: Option<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            pid_file,
            work_dir: work_dir.into(),
        }
    }

    /// Detaches the calling process.
    ///
    /// Only the grandchild returns; both parents exit with status 0.
    /// Relative paths given before this call no longer resolve the same way
    /// once the working directory has changed.
    pub fn start(&self) -> Result<()> {
        // First fork: create background process
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child: _ }) => {
                std::process::exit(0);
            }
            Ok(ForkResult::Child) => {
                // Create new session
                unistd::setsid()?;

                // Second fork: prevent reacquiring terminal
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { child: _ }) => {
                        std::process::exit(0);
                    }
                    Ok(ForkResult::Child) => {
                        stat::umask(stat::Mode::empty());
                        std::env::set_current_dir(&self.work_dir)?;

                        if let Some(pid_file) = &self.pid_file {
                            write_pid_file(pid_file, std::process::id())?;
                        }
                        info!("daemon started with pid {}", std::process::id());

                        // logging to stderr ends here
                        self.close_file_descriptors()?;
                        Ok(())
                    }
                    Err(err) => {
                        error!("Second fork failed: {}", err);
                        Err(err.into())
                    }
                }
            }
            Err(err) => {
                error!("First fork failed: {}", err);
                Err(err.into())
            }
        }
    }

    fn close_file_descriptors(&self) -> Result<()> {
        // Redirect standard file descriptors to /dev/null
        let null_file = File::options().read(true).write(true).open("/dev/null")?;
        let null_fd = null_file.as_raw_fd();

        for fd in 0..3 {
            unistd::dup2(null_fd, fd)?;
        }
        Ok(())
    }
}

fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}
