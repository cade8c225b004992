//! Session spawner (spec.md §4.4/§4.6): the `Session` variant of the
//! spawner, alongside `Simple` ([`crate::spawn::spawn`]) and `ProcessGroup`
//! (`Simple` plus a [`crate::spec::ProcessGroupPolicy`]).
//!
//! Ported from `examples/original_source/setsid_helper.py`: a detached
//! subprocess calls `setsid()` and `ioctl(TIOCSCTTY)` to become the leader
//! of a brand new session and acquire a fresh controlling terminal, then
//! spawns the caller's job specs under that session before entering a
//! `waitpid(-1, WUNTRACED)` loop and streaming `(pid, status)` pairs back.
//! The Python original re-execs itself with the job specs pickled onto its
//! own argv — Rust has no `eval()` to unpickle them back, so this port
//! carries them over a pipe instead (see [`write_specs`]/[`read_specs`]),
//! and a hidden `--session-helper` argv flag (checked in `main` before the
//! normal CLI parser ever runs) stands in for "re-exec the same script".
//!
//! Crucially the helper process must *not* run through
//! [`crate::fds::rearrange`]'s close-everything-else step on its own way
//! up: every job spec's fds still need to be open and nameable by raw
//! number once the helper starts dup2-ing them into its own children. Only
//! after every job has been spawned does the helper close everything but
//! its status pipe (`close_fds([pipe_fd])` in the original) and enter the
//! wait loop.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::Arc;

use crate::spec::ProcessGroupPolicy;
use crate::wait::{WaitDispatcher, WaitStatus};

/// One target process, addressed the way `shell_spawn.py`'s spec dicts are:
/// fds as raw numbers, valid in the helper because `fork()` duplicates the
/// whole descriptor table rather than just this process's view of it.
pub struct JobSpec {
    pub argv: Vec<OsString>,
    pub fds: Vec<(RawFd, RawFd)>,
}

pub struct SessionHandle {
    pub helper_pid: i32,
    pub pids: Vec<i32>,
}

/// Parent side (`run` in the original): forks+execs the helper, hands it
/// `specs` over a pipe, reads back the pids it spawned, and leaves a
/// background thread forwarding every later `(pid, status)` line into
/// `dispatcher.deliver_external` — the same sink a reaper thread feeds for
/// ordinary jobs, so `crate::job::JobController` never needs to know which
/// kind of spawn produced a given pid.
pub fn spawn_session(specs: &[JobSpec], tty_fd: RawFd, dispatcher: Arc<WaitDispatcher>) -> io::Result<SessionHandle> {
    let (specs_reader, specs_writer) = os_pipe::pipe()?;
    let (status_reader, status_writer) = os_pipe::pipe()?;

    let current_exe = std::env::current_exe()?;
    let mut command = Command::new(&current_exe);
    command.arg("--session-helper");

    let specs_read_fd = specs_reader.as_raw_fd();
    let status_write_fd = status_writer.as_raw_fd();

    // SAFETY: the closure only calls dup2/close, both async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(specs_read_fd, 3) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::dup2(status_write_fd, 4) < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::dup2(tty_fd, 5) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    let helper_pid = child.id() as i32;
    std::mem::forget(child);

    // The parent's own copies of the pipe ends it handed off are no longer
    // useful on this side once written/read below; drop them explicitly so
    // EOF behaves as the helper expects.
    drop(specs_reader);
    drop(status_writer);

    {
        let mut writer = specs_writer;
        write_specs(&mut writer, specs)?;
    }

    let mut reader = BufReader::new(status_reader);
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    let pids = parse_pids_line(&first_line);

    std::thread::spawn(move || forward_status_lines(reader, &dispatcher));

    Ok(SessionHandle { helper_pid, pids })
}

fn write_specs(writer: &mut impl Write, specs: &[JobSpec]) -> io::Result<()> {
    for spec in specs {
        writeln!(writer, "ARGC {}", spec.argv.len())?;
        for arg in &spec.argv {
            writeln!(writer, "{}", arg.to_string_lossy())?;
        }
        writeln!(writer, "FDC {}", spec.fds.len())?;
        for &(dest, src) in &spec.fds {
            writeln!(writer, "{dest} {src}")?;
        }
    }
    writeln!(writer, "DONE")?;
    Ok(())
}

fn parse_pids_line(line: &str) -> Vec<i32> {
    line.trim().strip_prefix("PIDS").unwrap_or("").split_whitespace().filter_map(|s| s.parse().ok()).collect()
}

fn forward_status_lines(reader: BufReader<os_pipe::PipeReader>, dispatcher: &Arc<WaitDispatcher>) {
    for line in reader.lines() {
        let Ok(line) = line else { return };
        let mut parts = line.split_whitespace();
        if parts.next() != Some("STATUS") {
            continue;
        }
        let (Some(pid), Some(kind), Some(value)) = (parts.next(), parts.next(), parts.next()) else { continue };
        let (Ok(pid), Ok(value)) = (pid.parse::<i32>(), value.parse::<i32>()) else { continue };
        let status = match kind {
            "stopped" => WaitStatus::Stopped,
            _ => WaitStatus::Exited(value),
        };
        dispatcher.deliver_external(pid, status);
    }
}

/// The helper process's own entry point: called from `main` when argv asks
/// for `--session-helper` (fds 3/4/5 are the specs reader, status writer,
/// and tty, installed by the parent's `pre_exec` above).
pub fn helper_main() -> ! {
    // SAFETY: these numbers are exactly what `spawn_session`'s pre_exec
    // installed; this function is only ever reached by re-exec from there.
    let specs_read = unsafe { OwnedFd::from_raw_fd(3) };
    let status_write = unsafe { OwnedFd::from_raw_fd(4) };
    let tty_fd: RawFd = 5;

    // SAFETY: plain sentinel assignments and a single ioctl on our own
    // soon-to-be controlling terminal.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::setsid();
        libc::ioctl(tty_fd, libc::TIOCSCTTY as libc::c_ulong, 0);
    }

    let policy = ProcessGroupPolicy::new(true, Some(tty_fd));
    let mut status_write = std::fs::File::from(status_write);

    let specs = read_specs(specs_read);
    let mut pids = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut process_spec = crate::spec::ProcessSpec::new(spec.argv);
        process_spec.pgroup = policy.clone();
        for &(dest, src) in &spec.fds {
            // SAFETY: src is a raw number inherited unchanged from the
            // shell across two forks (this process and the target's).
            process_spec.fds.insert(dest, unsafe { OwnedFd::from_raw_fd(src) });
        }
        match crate::spawn::spawn(process_spec) {
            Ok(crate::spawn::SpawnOutcome::Spawned(pid)) => pids.push(pid),
            _ => continue,
        }
    }

    let pids_line = format!("PIDS {}\n", pids.iter().map(i32::to_string).collect::<Vec<_>>().join(" "));
    let _ = status_write.write_all(pids_line.as_bytes());

    let keep = [status_write.as_raw_fd()];
    let _ = crate::fds::close_all_except(&keep);

    loop {
        let mut raw_status: libc::c_int = 0;
        // SAFETY: waitpid(-1, ...) reaps any child of this session leader.
        let pid = unsafe { libc::waitpid(-1, &mut raw_status, libc::WUNTRACED) };
        if pid < 0 {
            break;
        }
        let line = if unsafe { libc::WIFSTOPPED(raw_status) } {
            format!("STATUS {pid} stopped 0\n")
        } else if let Some(code) = crate::status::exit_code_from_wait_status(raw_status) {
            format!("STATUS {pid} exited {code}\n")
        } else {
            continue;
        };
        if status_write.write_all(line.as_bytes()).is_err() {
            break;
        }
    }

    std::process::exit(0)
}

fn read_specs(specs_read: OwnedFd) -> Vec<JobSpec> {
    let mut reader = BufReader::new(std::fs::File::from(specs_read));
    let mut specs = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line == "DONE" {
            break;
        }
        let Some(count) = line.strip_prefix("ARGC ").and_then(|n| n.parse::<usize>().ok()) else { break };

        let mut argv = Vec::with_capacity(count);
        for _ in 0..count {
            let mut arg_line = String::new();
            reader.read_line(&mut arg_line).ok();
            argv.push(OsString::from(arg_line.trim_end_matches('\n')));
        }

        let mut fdc_line = String::new();
        reader.read_line(&mut fdc_line).ok();
        let fd_count = fdc_line.trim().strip_prefix("FDC ").and_then(|n| n.parse::<usize>().ok()).unwrap_or(0);
        let mut fds = Vec::with_capacity(fd_count);
        for _ in 0..fd_count {
            let mut fd_line = String::new();
            reader.read_line(&mut fd_line).ok();
            let mut parts = fd_line.trim().split_whitespace();
            if let (Some(dest), Some(src)) = (parts.next(), parts.next()) {
                if let (Ok(dest), Ok(src)) = (dest.parse(), src.parse()) {
                    fds.push((dest, src));
                }
            }
        }

        specs.push(JobSpec { argv, fds });
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pids_line_reads_space_separated_ints() {
        assert_eq!(parse_pids_line("PIDS 10 20 30\n"), vec![10, 20, 30]);
        assert_eq!(parse_pids_line("PIDS\n"), Vec::<i32>::new());
    }

    #[test]
    fn write_then_read_specs_round_trips() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let specs = vec![JobSpec { argv: vec![OsString::from("echo"), OsString::from("hi")], fds: vec![(0, 10), (1, 11)] }];
        write_specs(&mut writer, &specs).unwrap();
        drop(writer);

        // SAFETY: reader owns a unique descriptor; handed to OwnedFd.
        let owned = unsafe { OwnedFd::from_raw_fd(reader.into_raw_fd()) };
        let parsed = read_specs(owned);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].argv, vec![OsString::from("echo"), OsString::from("hi")]);
        assert_eq!(parsed[0].fds, vec![(0, 10), (1, 11)]);
    }
}
