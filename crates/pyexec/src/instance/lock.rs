//! System-wide single-instance lock.
//!
//! The lock is an exclusively held file in a directory shared by every user
//! session. The OS drops the lock when the holder exits, even on a crash, so a
//! stale file never blocks a later start.

use crate::error::{RunnerError, RunnerResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held for as long as this process is the primary instance.
pub struct InstanceLock {
    path: PathBuf,
    #[cfg(unix)]
    file: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    file: File,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock").field("path", &self.path).finish_non_exhaustive()
    }
}

/// File name used for `lock_name` inside the lock directory.
pub fn lock_file_name(lock_name: &str) -> String {
    let sanitized: String = lock_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.lock", sanitized.trim_matches('_'))
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    // The lock directory is shared; never follow a link planted at the lock path.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(nix::libc::O_NOFOLLOW);
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0);
    }
    options.open(path)
}

impl InstanceLock {
    /// Try to become the primary instance.
    ///
    /// Returns `Ok(None)` when another process already holds the lock.
    pub fn try_acquire(lock_name: &str, dir: &Path) -> RunnerResult<Option<Self>> {
        std::fs::create_dir_all(dir)
            .map_err(|err| RunnerError::lock("failed to create lock directory", err))?;
        let path = dir.join(lock_file_name(lock_name));

        let file = match open_lock_file(&path) {
            Ok(file) => file,
            // ERROR_SHARING_VIOLATION: another process has the file open exclusively.
            #[cfg(windows)]
            Err(err) if err.raw_os_error() == Some(32) => {
                tracing::debug!(path = %path.display(), "lock held by another instance");
                return Ok(None);
            }
            Err(err) => return Err(RunnerError::lock("failed to open lock file", err)),
        };

        #[cfg(unix)]
        let file = {
            use nix::errno::Errno;
            use nix::fcntl::{Flock, FlockArg};
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                    tracing::debug!(path = %path.display(), "lock held by another instance");
                    return Ok(None);
                }
                Err((_, errno)) => {
                    return Err(RunnerError::lock("failed to lock instance file", errno));
                }
            }
        };

        let mut lock = Self { path, file };
        lock.write_pid();
        tracing::info!(path = %lock.path.display(), pid = std::process::id(), "instance lock acquired");
        Ok(Some(lock))
    }

    fn write_pid(&mut self) {
        let file: &mut File = &mut self.file;
        let written = file
            .set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .and_then(|()| file.flush());
        if let Err(err) = written {
            tracing::debug!(error = %err, "failed to record pid in lock file");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give up the lock now instead of at drop.
    pub fn release(self) {
        tracing::info!(path = %self.path.display(), "instance lock released");
        drop(self);
    }
}

/// Pid recorded by the current holder, if it can be read.
pub fn holder_pid(lock_name: &str, dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join(lock_file_name(lock_name)))
        .ok()
        .and_then(|text| text.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_names_are_sanitized() {
        assert_eq!(
            lock_file_name(r"Global\{6E3F-A1}"),
            "Global__6E3F-A1.lock"
        );
        assert_eq!(lock_file_name("pyexec-single-instance"), "pyexec-single-instance.lock");
    }

    #[cfg(unix)]
    #[test]
    #[allow(clippy::unwrap_used)]
    fn symlink_at_lock_path_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("notes.txt");
        std::fs::write(&target, "keep me").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join(lock_file_name("linked"))).unwrap();

        let err = InstanceLock::try_acquire("linked", dir.path()).unwrap_err();

        assert_eq!(err.code, crate::ErrorCode::Lock);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "keep me");
    }
}
