//! Wait dispatcher (spec.md §4.5).
//!
//! Grounded in `examples/original_source/jobcontrol.py`'s `WaitDispatcher`,
//! but that original calls a blocking `os.waitpid(-1, ...)` directly from
//! the event loop because Python's single-threaded `gobject` loop is the
//! only consumer of child statuses. spec.md's own §4.5/§5 explain why the
//! Rust port can't do the same: some event loops disable `WUNTRACED`
//! delivery once they install their own `SIGCHLD` handler, so here one
//! reaper thread per registered pid blocks on `waitpid(pid, WUNTRACED)` and
//! forwards statuses through an MPSC channel; a self-pipe wakes `once()`
//! so the shell's loop only ever polls, never calls `waitpid` itself.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// A status delivered for one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Stopped,
    Exited(i32),
}

type Handler = Box<dyn FnMut(WaitStatus) + Send>;

struct Message {
    pid: i32,
    status: WaitStatus,
}

/// Single-threaded-consumer dispatcher: `add_handler`/`once`/`read_pending`
/// are meant to be called only from the shell's main/event-loop thread;
/// reaper threads only ever push onto `tx` and write to the wake pipe.
pub struct WaitDispatcher {
    handlers: Mutex<HashMap<i32, Handler>>,
    tx: Sender<Message>,
    rx: Mutex<Receiver<Message>>,
    wake_read: Mutex<std::fs::File>,
    wake_write: Arc<Mutex<std::fs::File>>,
}

impl WaitDispatcher {
    pub fn new() -> io::Result<Self> {
        let mut fds: [RawFd; 2] = [0, 0];
        // SAFETY: pipe() with a valid 2-slot buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fds[0]/fds[1] are freshly created, uniquely owned descriptors.
        let wake_read = unsafe { std::fs::File::from_raw_fd(fds[0]) };
        let wake_write = unsafe { std::fs::File::from_raw_fd(fds[1]) };
        set_nonblocking(&wake_read)?;

        let (tx, rx) = mpsc::channel();

        Ok(WaitDispatcher {
            handlers: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(rx),
            wake_read: Mutex::new(wake_read),
            wake_write: Arc::new(Mutex::new(wake_write)),
        })
    }

    /// Register `cb` for `pid` and spin up its reaper thread. Per spec.md
    /// §4.5: called at most once per terminal status, zero or more times
    /// for stopped statuses (each followed eventually by a continued
    /// status once the caller sends `SIGCONT` — this dispatcher doesn't
    /// itself observe the continue; the job controller drives that).
    pub fn add_handler(&self, pid: i32, cb: impl FnMut(WaitStatus) + Send + 'static) {
        self.handlers.lock().unwrap().insert(pid, Box::new(cb));

        let tx = self.tx.clone();
        let wake_write = Arc::clone(&self.wake_write);
        std::thread::spawn(move || {
            reap_loop(pid, &tx, &wake_write);
        });
    }

    /// Run one iteration: optionally block until the wake pipe has data,
    /// then drain and dispatch every pending message.
    pub fn once(&self, may_block: bool) -> io::Result<()> {
        if may_block {
            self.block_for_wake()?;
        }
        self.drain()
    }

    /// Non-blocking: dispatch every message currently queued, without
    /// waiting for more to arrive.
    pub fn read_pending(&self) {
        let _ = self.drain();
    }

    /// Register `cb` for `pid` without spawning a reaper thread. Used for
    /// session-helper-spawned children (spec.md §4.6): the shell is not
    /// their parent, so it cannot `waitpid` them directly — statuses
    /// arrive over the helper's own pipe instead, fed in through
    /// [`Self::deliver_external`].
    pub fn add_external_handler(&self, pid: i32, cb: impl FnMut(WaitStatus) + Send + 'static) {
        self.handlers.lock().unwrap().insert(pid, Box::new(cb));
    }

    /// Inject a status observed out-of-band, as if a reaper thread had
    /// observed it. Safe to call from any thread.
    pub fn deliver_external(&self, pid: i32, status: WaitStatus) {
        let _ = self.tx.send(Message { pid, status });
        let mut file = self.wake_write.lock().unwrap();
        let _ = file.write_all(&[0u8]);
    }

    fn block_for_wake(&self) -> io::Result<()> {
        let mut pfd = libc::pollfd {
            fd: {
                use std::os::fd::AsRawFd;
                self.wake_read.lock().unwrap().as_raw_fd()
            },
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            // SAFETY: pfd is a valid, single-entry pollfd array.
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }

    fn drain(&self) -> io::Result<()> {
        // Drain the self-pipe byte-for-message (best effort; a failed read
        // just means nothing was pending, not an error worth propagating).
        {
            let mut buf = [0u8; 256];
            let mut file = self.wake_read.lock().unwrap();
            while matches!(file.read(&mut buf), Ok(n) if n > 0) {}
        }

        let messages: Vec<Message> = {
            let rx = self.rx.lock().unwrap();
            rx.try_iter().collect()
        };

        for message in messages {
            let mut handlers = self.handlers.lock().unwrap();
            let terminal = !matches!(message.status, WaitStatus::Stopped);
            if let Some(handler) = handlers.get_mut(&message.pid) {
                handler(message.status);
            }
            if terminal {
                handlers.remove(&message.pid);
            }
        }

        Ok(())
    }
}

fn set_nonblocking(file: &std::fs::File) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    // SAFETY: fd is a valid, open descriptor for the lifetime of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same fd, adding a flag bit.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Runs on its own OS thread: blocks on `waitpid(pid, WUNTRACED)` until a
/// terminal status is observed, forwarding every status (stopped or
/// terminal) to the dispatcher's channel and waking its poll loop.
fn reap_loop(pid: i32, tx: &Sender<Message>, wake_write: &Arc<Mutex<std::fs::File>>) {
    loop {
        let mut raw_status: libc::c_int = 0;
        // SAFETY: pid is the reaper's own target; WUNTRACED is a plain flag.
        let rc = unsafe { libc::waitpid(pid, &mut raw_status, libc::WUNTRACED) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            // ECHILD or similar: nothing more to reap for this pid.
            return;
        }

        // SAFETY: raw_status was just filled in by the successful waitpid above.
        let status = if unsafe { libc::WIFSTOPPED(raw_status) } {
            WaitStatus::Stopped
        } else {
            match crate::status::exit_code_from_wait_status(raw_status) {
                Some(code) => WaitStatus::Exited(code),
                None => continue,
            }
        };

        let terminal = !matches!(status, WaitStatus::Stopped);
        let _ = tx.send(Message { pid, status });
        {
            let mut file = wake_write.lock().unwrap();
            let _ = file.write_all(&[0u8]);
        }

        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_handler_reports_exit_status() {
        let dispatcher = WaitDispatcher::new().unwrap();

        // SAFETY: fork is acceptable here — the child immediately exits and
        // does not touch any shared state (no threads existed before fork
        // besides the reaper threads spun up after, which this test doesn't
        // race with).
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            std::process::exit(42);
        }

        let observed = Arc::new(AtomicI32::new(-1));
        let observed_clone = Arc::clone(&observed);
        dispatcher.add_handler(pid, move |status| {
            if let WaitStatus::Exited(code) = status {
                observed_clone.store(code, Ordering::SeqCst);
            }
        });

        for _ in 0..200 {
            dispatcher.once(true).unwrap();
            if observed.load(Ordering::SeqCst) != -1 {
                break;
            }
        }

        assert_eq!(observed.load(Ordering::SeqCst), 42);
    }
}
