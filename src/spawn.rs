//! Spawner (spec.md §4.4).
//!
//! Grounded in the teacher's `executor.rs` pipeline loop, generalized from
//! its ad hoc "wire stdin/stdout/stderr" dance into a spec-shaped
//! `ProcessSpec -> pid` step: build a `std::process::Command`, and inside
//! `pre_exec` reset the signals the shell ignores back to `SIG_DFL`,
//! `fchdir` to the spec's cwd handle, run the descriptor re-arranger over
//! the spec's whole fd table (the teacher only ever wired 0/1/2 directly;
//! [`crate::fds::rearrange`] generalizes that to an arbitrary table), apply
//! credentials, and join the spec's process group. `ProcessGroupPolicy`
//! already distinguishes `Simple` (the null policy, no pgid management)
//! from `ProcessGroup` (a real policy, same struct either way) per spec.md
//! §4.4 — `Session` spawns are a distinct path through
//! [`crate::session_helper`], which builds its own `ProcessSpec`s and
//! forwards them to the helper subprocess instead of spawning in-process.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::spec::{Credentials, ProcessSpec};

/// What came out of one spawn attempt.
#[derive(Debug)]
pub enum SpawnOutcome {
    Spawned(i32),
    /// `execvpe` never ran (`ENOENT` or similar) — the shell reports a
    /// diagnostic and synthesizes the job's exit code (spec.md §4.4/§7)
    /// instead of waiting on a real pid.
    Failed { message: String, code: i32 },
}

/// Spawn one process spec. Never blocks on the child; the caller registers
/// the returned pid with [`crate::job::JobController`]/the wait dispatcher.
pub fn spawn(mut spec: ProcessSpec) -> io::Result<SpawnOutcome> {
    let Some(program) = spec.argv.first().cloned() else {
        let message = "jsh: empty command".to_string();
        write_diagnostic(spec.fds.get(&2).map(AsRawFd::as_raw_fd), &message);
        return Ok(SpawnOutcome::Failed { message, code: 1 });
    };

    let mut command = Command::new(&program);
    command.args(spec.argv.iter().skip(1));

    if let Some(environ) = spec.environ.take() {
        command.env_clear();
        command.envs(environ);
    }

    // `mapping`/`fds_keepalive` move into the pre_exec closure; the fd
    // numbers are valid in the child because fork() duplicates the whole
    // descriptor table, not just the handles this process happens to hold
    // Rust-side references to.
    let mapping: Vec<(RawFd, RawFd)> =
        spec.fds.iter().map(|(&dest, owned)| (dest, owned.as_raw_fd())).collect();
    let fds_keepalive = std::mem::take(&mut spec.fds);
    let cwd_fd = spec.cwd_handle.as_ref().map(|h| h.as_raw_fd());
    let credentials = spec.credentials.clone();
    let pgroup = spec.pgroup.clone();

    // SAFETY: the closure calls only async-signal-safe functions (signal,
    // fchdir, setgroups/setgid/setuid, setpgid/tcsetpgrp via
    // `pgroup.init_process`, and `fds::rearrange`'s fcntl/dup2/close calls).
    unsafe {
        command.pre_exec(move || {
            let _keepalive = &fds_keepalive;

            for &sig in &[libc::SIGINT, libc::SIGTSTP, libc::SIGQUIT, libc::SIGPIPE] {
                if libc::signal(sig, libc::SIG_DFL) == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
            }

            if let Some(fd) = cwd_fd {
                if libc::fchdir(fd) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            if !mapping.is_empty() {
                crate::fds::rearrange(&mapping)?;
            }

            if let Some(creds) = &credentials {
                apply_credentials(creds)?;
            }

            // Race-tolerant double call (spec.md §4.4): the parent makes
            // the same call with the real pid right after spawn() returns.
            // Whichever side loses gets EACCES/ESRCH, tolerated there.
            pgroup.init_process(0)?;

            Ok(())
        });
    }

    match command.spawn() {
        Ok(child) => {
            let pid = child.id() as i32;
            pgroup.init_process(pid)?;
            // The wait dispatcher's reaper threads own the real waitpid
            // calls for this pid; std::process::Child must not also try
            // to reap it, so we stop tracking the handle here.
            std::mem::forget(child);
            Ok(SpawnOutcome::Spawned(pid))
        }
        Err(e) => {
            let (message, code) = command_error(&program.to_string_lossy(), &e);
            let fd2 = mapping.iter().find(|&&(dest, _)| dest == 2).map(|&(_, src)| src);
            write_diagnostic(fd2, &message);
            Ok(SpawnOutcome::Failed { message, code })
        }
    }
}

/// Writes `message` plus a trailing newline directly to `fd` — the process's
/// own assigned fd 2, not the shell's (spec.md §4.4/§6: a process that never
/// execs still "writes" its diagnostic to its own stderr, which may be a
/// redirect target rather than the shell's terminal). No-op if the spec had
/// no fd 2 at all.
fn write_diagnostic(fd: Option<RawFd>, message: &str) {
    let Some(fd) = fd else { return };
    let line = format!("{message}\n");
    // SAFETY: fd is a descriptor this process still holds open — either
    // `spec.fds` (early return, not yet consumed) or `mapping`'s captured
    // raw number, valid for as long as `command`/`fds_keepalive` are alive.
    unsafe { libc::write(fd, line.as_ptr() as *const libc::c_void, line.len()) };
}

fn apply_credentials(creds: &Credentials) -> io::Result<()> {
    let groups: Vec<libc::gid_t> = creds.groups.iter().map(|&g| g as libc::gid_t).collect();
    // SAFETY: groups is a valid, correctly-sized buffer for its own length.
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: plain integer syscalls.
    if unsafe { libc::setgid(creds.gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::setuid(creds.uid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn command_error(program: &str, e: &io::Error) -> (String, i32) {
    if e.kind() == io::ErrorKind::NotFound {
        // spec.md §6 / the original's `shell_spawn.py` both emit this bare,
        // with no shell-name prefix.
        (format!("{program}: command not found"), 127)
    } else {
        (format!("jsh: {program}: {e}"), 126)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn spawning_a_missing_program_reports_not_found() {
        let spec = ProcessSpec::new(vec![OsString::from("definitely-not-a-real-binary-xyz")]);
        match spawn(spec).unwrap() {
            SpawnOutcome::Failed { code, message } => {
                assert_eq!(code, 127);
                assert!(message.contains("command not found"));
            }
            SpawnOutcome::Spawned(_) => panic!("expected a not-found failure"),
        }
    }

    #[test]
    fn spawning_true_returns_a_pid() {
        let mut spec = ProcessSpec::new(vec![OsString::from("/bin/true")]);
        spec.fds.clear();
        match spawn(spec).unwrap() {
            SpawnOutcome::Spawned(pid) => {
                assert!(pid > 0);
                let mut status: libc::c_int = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
            }
            SpawnOutcome::Failed { message, .. } => panic!("unexpected failure: {message}"),
        }
    }
}
