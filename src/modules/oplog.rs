//! Per-operation trace written to the `logfile=` mount option.
//!
//! Each line looks like `[nfs] 14:02:11 getattr entered [/a/b]`. Without a
//! configured file every call is a no-op.

use chrono::Local;
use log::warn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append-only operation log.
#[derive(Debug)]
pub struct OpLog {
    tag: &'static str,
    file: Option<Mutex<File>>,
}

impl OpLog {
    /// Opens `path` for appending; `None` gives a disabled log.
    pub fn open(tag: &'static str, path: Option<&Path>) -> std::io::Result<Self> {
        let file = match path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };
        Ok(Self { tag, file })
    }

    /// A log that records nothing.
    pub fn disabled(tag: &'static str) -> Self {
        Self { tag, file: None }
    }

    /// Writes one timestamped line.
    pub fn line(&self, message: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let stamp = Local::now().format("%H:%M:%S");
        let mut file = file.lock();
        if let Err(err) = writeln!(file, "[{}] {} {}", self.tag, stamp, message) {
            warn!("cannot write operation log: {}", err);
        }
    }

    /// Records entry into `op`, with the path it acts on when there is one.
    pub fn entered(&self, op: &str, path: Option<&Path>) {
        if self.file.is_none() {
            return;
        }
        match path {
            Some(path) => self.line(&format!("{} entered [{}]", op, path.display())),
            None => self.line(&format!("{} entered", op)),
        }
    }

    /// Writes the separator that opens a new session in the log.
    pub fn session_start(&self) {
        if let Some(file) = &self.file {
            let mut file = file.lock();
            if let Err(err) = writeln!(file, "=====") {
                warn!("cannot write operation log: {}", err);
                return;
            }
        }
        self.line("Starting fuse session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_lines_are_tagged_and_appended() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ops.log");
        fs::write(&path, "earlier\n")?;

        let log = OpLog::open("nfs", Some(&path))?;
        log.session_start();
        log.entered("getattr", Some(Path::new("/a/b")));
        log.entered("statfs", None);

        let text = fs::read_to_string(&path)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "earlier");
        assert_eq!(lines[1], "=====");
        assert!(lines[2].starts_with("[nfs] ") && lines[2].ends_with(" Starting fuse session"));
        assert!(lines[3].ends_with(" getattr entered [/a/b]"));
        assert!(lines[4].ends_with(" statfs entered"));
        Ok(())
    }

    #[test]
    fn test_disabled_log_is_silent() {
        let log = OpLog::disabled("smb");
        log.entered("read", None);
    }
}
