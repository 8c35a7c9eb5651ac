//! Single-run lock for the reconciler.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use snafu::prelude::*;
use tracing::{info, warn};

use crate::error::{AcquireLockSnafu, AlreadyRunningSnafu, ReconcileError};

pub const LOCK_FILE_NAME: &str = ".reconcile.lock";

/// Held while a reconcile run is in progress. Dropping it removes the file.
#[derive(Debug)]
pub struct ReconcileLock {
    path: PathBuf,
    released: bool,
}

impl ReconcileLock {
    /// Create the lock file in `root`. Fails with `AlreadyRunning` if it
    /// exists and its owner is still alive. A lock left by a dead process is
    /// replaced.
    pub fn acquire(root: &Path) -> Result<Self, ReconcileError> {
        fs::create_dir_all(root).context(AcquireLockSnafu { path: root })?;
        let path = root.join(LOCK_FILE_NAME);

        let mut file = match create_lock_file(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let Some(pid) = stale_owner(&path) else {
                    return AlreadyRunningSnafu { path }.fail();
                };
                info!(path = %path.display(), pid, "Replacing stale reconcile lock");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(source).context(AcquireLockSnafu { path }),
                }
                match create_lock_file(&path) {
                    Ok(file) => file,
                    // Someone else took it over first.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        return AlreadyRunningSnafu { path }.fail();
                    }
                    Err(source) => return Err(source).context(AcquireLockSnafu { path }),
                }
            }
            Err(source) => return Err(source).context(AcquireLockSnafu { path }),
        };

        writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())
            .context(AcquireLockSnafu { path: &path })?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        fs::remove_file(&self.path)
    }
}

fn create_lock_file(path: &Path) -> io::Result<fs::File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// The pid recorded in the lock at `path`, if that process is gone.
/// Unreadable locks are treated as live.
fn stale_owner(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;
    let pid: u32 = contents.split_whitespace().next()?.parse().ok()?;
    (pid != std::process::id() && !pid_is_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

impl Drop for ReconcileLock {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = fs::remove_file(&self.path)
        {
            warn!(path = %self.path.display(), "Failed to remove reconcile lock: {}", e);
        }
    }
}
