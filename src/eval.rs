//! Evaluator (spec.md §4.2): walks parsed pipelines into [`ProcessSpec`]s.
//!
//! Grounded in the teacher's `executor::execute_pipeline` loop, generalized
//! from its ad hoc `InputHandle`/`OutputHandle` stdio juggling into the
//! spec's actual data model: every command in a pipeline gets a full
//! `fds: BTreeMap<RawFd, OwnedFd>` built up destination-by-destination
//! (0/1/2 default to the shell's own stdio or a pipeline pipe end, then
//! each `N<file`/`N>file`/`N>>file`/`N<<<text`/`N<&M`/`N>&M` arg overrides
//! its slot in source order — exactly spec.md §4.2's "copy inherited fd
//! map, apply each arg in order").

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::ast::{Arg, CommandExp, PipelineExp, RedirectTarget};
use crate::cwd::Cwd;
use crate::error::RedirectError;
use crate::spec::{Credentials, ProcessSpec};
use crate::word;

/// One pipeline's worth of process specs, built against `cwd` and the
/// shell's `$?` (`last_exit_code`). Every command gets its own copy of the
/// pipeline's shared process-group policy via `pgroup_for` — callers
/// install a real `ProcessGroupPolicy` for job-controlled pipelines or
/// `ProcessGroupPolicy::null()` for a `Simple` spawn (e.g. a builtin's
/// internal helper process, if any).
pub fn build_pipeline(
    pipeline: &PipelineExp,
    cwd: &Cwd,
    last_exit_code: i32,
    pgroup: crate::spec::ProcessGroupPolicy,
) -> Result<Vec<ProcessSpec>, RedirectError> {
    let mut specs = Vec::with_capacity(pipeline.commands.len());
    let mut carried_reader: Option<OwnedFd> = None;
    let last_index = pipeline.commands.len().saturating_sub(1);

    for (index, command) in pipeline.commands.iter().enumerate() {
        let stdin_src = match carried_reader.take() {
            Some(reader) => reader,
            None => dup_fd(0)?,
        };

        let (stdout_src, next_reader) = if index == last_index {
            (dup_fd(1)?, None)
        } else {
            let (reader, writer) = os_pipe::pipe().map_err(to_open_error)?;
            (owned_from_pipe_writer(writer), Some(owned_from_pipe_reader(reader)))
        };
        carried_reader = next_reader;

        let stderr_src = dup_fd(2)?;

        let mut spec = ProcessSpec::new(Vec::new());
        spec.fds.insert(0, stdin_src);
        spec.fds.insert(1, stdout_src);
        spec.fds.insert(2, stderr_src);
        spec.pgroup = pgroup.clone();

        apply_command(command, cwd, last_exit_code, &mut spec)?;
        specs.push(spec);
    }

    Ok(specs)
}

fn apply_command(
    command: &CommandExp,
    cwd: &Cwd,
    last_exit_code: i32,
    spec: &mut ProcessSpec,
) -> Result<(), RedirectError> {
    let mut argv_words = Vec::new();

    for arg in &command.args {
        match arg {
            Arg::Word(word) => argv_words.push(word.clone()),
            Arg::Redirect { fd, target } => apply_redirect(*fd, target, cwd, last_exit_code, spec)?,
        }
    }

    let expanded = word::expand_words(&argv_words, last_exit_code, Some(&cwd.as_path()));
    spec.argv = expanded.into_iter().map(OsString::from).collect();
    Ok(())
}

fn apply_redirect(
    fd: i32,
    target: &RedirectTarget,
    cwd: &Cwd,
    last_exit_code: i32,
    spec: &mut ProcessSpec,
) -> Result<(), RedirectError> {
    let owned = match target {
        RedirectTarget::ReadFile(word) => {
            let path = expand_single(word, last_exit_code, Some(&cwd.as_path()));
            open_relative(cwd, &path, libc::O_RDONLY, 0)?
        }
        RedirectTarget::WriteFile(word) => {
            let path = expand_single(word, last_exit_code, Some(&cwd.as_path()));
            open_relative(cwd, &path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC, 0o644)?
        }
        RedirectTarget::AppendFile(word) => {
            let path = expand_single(word, last_exit_code, Some(&cwd.as_path()));
            open_relative(cwd, &path, libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND, 0o644)?
        }
        RedirectTarget::HereString(word) => {
            // Here-string text is never a path, so it never globs against cwd.
            let text = expand_single(word, last_exit_code, None);
            here_string_reader(&text).map_err(|source| RedirectError::Open { path: "<<<".to_string(), source })?
        }
        RedirectTarget::DupFd(other) => {
            let source_raw = spec
                .fds
                .get(other)
                .map(|owned| owned.as_raw_fd())
                .ok_or(RedirectError::UnknownFd(*other))?;
            dup_fd(source_raw).map_err(|source| RedirectError::Open { path: format!("&{other}"), source })?
        }
    };

    spec.fds.insert(fd, owned);
    Ok(())
}

fn expand_single(word: &crate::ast::Word, last_exit_code: i32, cwd: Option<&Path>) -> String {
    word::expand_words(std::slice::from_ref(word), last_exit_code, cwd)
        .into_iter()
        .next()
        .unwrap_or_default()
}

fn open_relative(cwd: &Cwd, path: &str, flags: libc::c_int, mode: libc::mode_t) -> Result<OwnedFd, RedirectError> {
    let resolved = cwd.resolve(std::path::Path::new(path));
    let c_path = std::ffi::CString::new(resolved.as_os_str().as_encoded_bytes())
        .map_err(|_| RedirectError::Open {
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"),
        })?;
    // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(RedirectError::Open { path: path.to_string(), source: io::Error::last_os_error() });
    }
    // SAFETY: fd was just returned by a successful open(2), uniquely owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// A pipe whose write end gets the text (plus a trailing newline, matching
/// the teacher's `<<<` handling) written by a detached thread, so the
/// spawn path never blocks on pipe-buffer backpressure.
fn here_string_reader(text: &str) -> io::Result<OwnedFd> {
    use std::io::Write;
    let (reader, mut writer) = os_pipe::pipe()?;
    let text = text.to_string();
    std::thread::spawn(move || {
        let _ = writer.write_all(text.as_bytes());
        let _ = writer.write_all(b"\n");
    });
    Ok(owned_from_pipe_reader(reader))
}

fn dup_fd(fd: RawFd) -> Result<OwnedFd, RedirectError> {
    // SAFETY: fd is a descriptor this process currently has open.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(RedirectError::Open { path: format!("fd {fd}"), source: io::Error::last_os_error() });
    }
    // SAFETY: dup was just returned by a successful dup(2), uniquely owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn to_open_error(e: io::Error) -> RedirectError {
    RedirectError::Open { path: "pipe".to_string(), source: e }
}

fn owned_from_pipe_reader(reader: os_pipe::PipeReader) -> OwnedFd {
    use std::os::fd::IntoRawFd;
    // SAFETY: reader owns a unique, open descriptor; IntoRawFd releases it
    // to us without closing, and OwnedFd takes over that same ownership.
    unsafe { OwnedFd::from_raw_fd(reader.into_raw_fd()) }
}

fn owned_from_pipe_writer(writer: os_pipe::PipeWriter) -> OwnedFd {
    use std::os::fd::IntoRawFd;
    // SAFETY: see `owned_from_pipe_reader`.
    unsafe { OwnedFd::from_raw_fd(writer.into_raw_fd()) }
}

/// Applies `Credentials` to an already-built spec, used by the `sudo`
/// builtin to wrap a single command's spec after the normal pipeline build
/// (spec.md §6: `sudo <cmd>` "wraps the launcher to apply target
/// credentials").
pub fn with_credentials(mut spec: ProcessSpec, credentials: Credentials) -> ProcessSpec {
    spec.credentials = Some(credentials);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::WordSegment;
    use crate::parser::parse_line;
    use crate::spec::ProcessGroupPolicy;

    fn pipeline_from(line: &str) -> PipelineExp {
        let chain = parse_line(line).unwrap();
        chain.into_iter().next().unwrap().job.pipeline
    }

    #[test]
    fn single_command_inherits_shell_stdio() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        let pipeline = pipeline_from("echo hi");
        let specs = build_pipeline(&pipeline, &cwd, 0, ProcessGroupPolicy::null()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].argv, vec![OsString::from("echo"), OsString::from("hi")]);
        assert!(specs[0].fds.contains_key(&0));
        assert!(specs[0].fds.contains_key(&1));
        assert!(specs[0].fds.contains_key(&2));
    }

    #[test]
    fn pipeline_links_stdout_to_next_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        let pipeline = pipeline_from("echo hi | wc -l");
        let specs = build_pipeline(&pipeline, &cwd, 0, ProcessGroupPolicy::null()).unwrap();
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn write_redirect_opens_relative_to_cwd_handle() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        let pipeline = pipeline_from("echo hi > out.txt");
        let specs = build_pipeline(&pipeline, &cwd, 0, ProcessGroupPolicy::null()).unwrap();
        assert_eq!(specs.len(), 1);
        assert!(dir.path().join("out.txt").exists());
    }

    #[test]
    fn dup_fd_redirect_errors_on_unknown_source() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = Cwd::open(dir.path()).unwrap();
        let mut spec = ProcessSpec::new(vec![OsString::from("x")]);
        let target = RedirectTarget::DupFd(9);
        let err = apply_redirect(2, &target, &cwd, 0, &mut spec).unwrap_err();
        assert!(matches!(err, RedirectError::UnknownFd(9)));
    }

    #[test]
    fn expand_single_substitutes_exit_code() {
        let word: crate::ast::Word = vec![WordSegment::Unquoted("$?".to_string())];
        assert_eq!(expand_single(&word, 7, None), "7");
    }
}
