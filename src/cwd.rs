//! Logical working-directory tracker (spec.md §4.8).
//!
//! A shell holds an open directory handle (`O_RDONLY | O_DIRECTORY`) rather
//! than trusting the process's ambient cwd, so `cd` works via `fchdir` and
//! `$PWD` can diverge from the handle's physical path (e.g. after a `cd`
//! through a symlink) without the tracker losing its place: `get_cwd`
//! prefers `$PWD` only when it names the same `(dev, ino)` the handle does,
//! else falls back to reading the handle's own path out of `/proc/self/fd`.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One shell's logical cwd: an open directory handle plus the `$PWD` value
/// last recorded for it.
pub struct Cwd {
    handle: OwnedFd,
}

impl Cwd {
    /// Opens the process's actual current directory as the starting handle.
    pub fn open_current() -> io::Result<Self> {
        Self::open(Path::new("."))
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by a successful open(2), uniquely owned here.
        Ok(Cwd { handle: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    fn raw_fd(&self) -> RawFd {
        self.handle.as_raw_fd()
    }

    /// `relative_op`: resolve `path` relative to this handle without ever
    /// touching the process's own cwd, by opening through `/proc/self/fd/N`
    /// (spec.md §4.8) rather than `fchdir`ing first. Used by redirections
    /// and globbing so multiple `Cwd`s in one process never interfere.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        PathBuf::from(format!("/proc/self/fd/{}", self.raw_fd())).join(path)
    }

    /// `chdir(path)`: opens `path` (resolved relative to this handle if not
    /// absolute) and replaces the handle on success, leaving the old handle
    /// untouched on failure.
    pub fn chdir(&mut self, path: &Path) -> io::Result<()> {
        let resolved = self.resolve(path);
        let new_handle = Self::open(&resolved)?;
        self.handle = new_handle.handle;
        Ok(())
    }

    /// `get_cwd`: prefer `$PWD` if it names the same directory as the
    /// handle (matched by `(dev, ino)`, not by string equality — a
    /// symlinked `$PWD` still counts), else fall back to a `readlink` of
    /// `/proc/self/fd/N`.
    pub fn get_cwd(&self) -> PathBuf {
        if let Ok(pwd) = std::env::var("PWD") {
            if !pwd.is_empty() && self.same_directory(Path::new(&pwd)) {
                return PathBuf::from(pwd);
            }
        }
        self.proc_self_path()
    }

    fn same_directory(&self, path: &Path) -> bool {
        let Ok(pwd_stat) = stat(path) else { return false };
        let Ok(handle_stat) = fstat(self.raw_fd()) else { return false };
        pwd_stat.st_dev == handle_stat.st_dev && pwd_stat.st_ino == handle_stat.st_ino
    }

    fn proc_self_path(&self) -> PathBuf {
        let link = format!("/proc/self/fd/{}", self.raw_fd());
        std::fs::read_link(&link).unwrap_or_else(|_| PathBuf::from(link))
    }

    /// Sets `$PWD` to this handle's physical path, used after a successful
    /// `cd` so later `get_cwd` calls can take the fast `$PWD` path again.
    pub fn sync_pwd_env(&self) {
        let path = self.proc_self_path();
        // SAFETY: single-threaded REPL context; no concurrent env access.
        unsafe { std::env::set_var("PWD", path.as_os_str()) };
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }

    /// The handle's own directory, addressable as a filesystem path via
    /// `/proc/self/fd`, for callers (glob expansion) that need a `Path` to
    /// join a relative pattern onto without ever touching the process cwd.
    pub fn as_path(&self) -> PathBuf {
        PathBuf::from(format!("/proc/self/fd/{}", self.raw_fd()))
    }
}

#[repr(C)]
struct StatResult {
    st_dev: u64,
    st_ino: u64,
}

fn stat(path: &Path) -> io::Result<StatResult> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    let mut buf: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated; buf is a valid out-pointer.
    let rc = unsafe { libc::stat(c_path.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(StatResult { st_dev: buf.st_dev as u64, st_ino: buf.st_ino as u64 })
}

fn fstat(fd: RawFd) -> io::Result<StatResult> {
    let mut buf: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is a valid open descriptor; buf is a valid out-pointer.
    let rc = unsafe { libc::fstat(fd, &mut buf) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(StatResult { st_dev: buf.st_dev as u64, st_ino: buf.st_ino as u64 })
}

/// Process-wide singleton for the default (interactive) shell instance —
/// spec.md §4.8's closing note. Additional `Cwd` values (e.g. constructed
/// by tests) are ordinary per-instance values that never touch this one.
static SINGLETON: OnceLock<std::sync::Mutex<Cwd>> = OnceLock::new();

pub fn singleton() -> &'static std::sync::Mutex<Cwd> {
    SINGLETON.get_or_init(|| std::sync::Mutex::new(Cwd::open_current().expect("cwd: failed to open `.`")))
}

/// A directory name as it should look in a prompt or `pwd` line: tilde
/// form when it sits under `$HOME`, otherwise absolute.
pub fn display_path(path: &Path, home: Option<&OsString>) -> String {
    if let Some(home) = home {
        if let Ok(stripped) = path.strip_prefix(home) {
            return if stripped.as_os_str().is_empty() {
                "~".to_string()
            } else {
                format!("~/{}", stripped.display())
            };
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chdir_updates_resolved_path() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("child");
        std::fs::create_dir(&child).unwrap();

        let mut cwd = Cwd::open(dir.path()).unwrap();
        cwd.chdir(Path::new("child")).unwrap();
        let resolved = cwd.proc_self_path();
        assert_eq!(std::fs::canonicalize(&resolved).unwrap(), std::fs::canonicalize(&child).unwrap());
    }

    #[test]
    fn resolve_is_relative_to_the_handle_not_process_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        let resolved = cwd.resolve(Path::new("somefile"));
        assert!(resolved.starts_with("/proc/self/fd/"));
    }

    #[test]
    fn absolute_paths_pass_through_resolve_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        assert_eq!(cwd.resolve(Path::new("/etc/passwd")), PathBuf::from("/etc/passwd"));
    }

    #[test]
    fn display_path_uses_tilde_under_home() {
        let home = OsString::from("/home/person");
        assert_eq!(display_path(Path::new("/home/person/code"), Some(&home)), "~/code");
        assert_eq!(display_path(Path::new("/home/person"), Some(&home)), "~");
        assert_eq!(display_path(Path::new("/var/log"), Some(&home)), "/var/log");
    }
}
