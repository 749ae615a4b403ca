//! Pseudo-terminal allocation and agent spawn.
//!
//! The agent's `docker exec -it` invocation runs as a child of the daemon
//! with its stdio attached to the slave side of a host-allocated PTY. The
//! master side is owned here and shared between the instance's reader
//! thread (draining output) and attach handlers (injecting keystrokes,
//! resizing).
//!
//! The child is made a session leader (`setsid` + `TIOCSCTTY`) so the whole
//! process group can be signalled as one unit on destroy.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::error::{GroveError, Result};

/// The master side of an instance PTY.
///
/// Reads are blocking; the instance reader thread is the only reader. The
/// fd closes when the last holder drops its handle, so an attach writer
/// racing a process exit sees a short-lived valid fd instead of EBADF.
pub struct PtyMaster {
    fd: OwnedFd,
}

impl PtyMaster {
    /// Blocking read. Returns `Ok(0)` on EOF, including the EIO the master
    /// reports once the child has closed the slave side.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match unistd::read(self.fd.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(nix::errno::Errno::EINTR) => self.read(buf),
            Err(e) => Err(GroveError::Pty(format!("read: {e}"))),
        }
    }

    /// Write all bytes into the child's terminal input.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.fd, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(GroveError::Pty(format!("write: {e}"))),
            }
        }
        Ok(())
    }

    /// Set the terminal window size.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // Safety: TIOCSWINSZ reads a winsize struct from a valid pointer.
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(GroveError::Pty(format!(
                "TIOCSWINSZ: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A child process running in a new PTY.
pub struct PtySession {
    pub master: Arc<PtyMaster>,
    child_pid: Pid,
}

impl PtySession {
    /// Spawn `command` in a fresh PTY.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal, inherits the daemon's environment plus `env`, and chdirs
    /// into `working_dir`.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Self> {
        let pty = openpty(None, None).map_err(|e| GroveError::Pty(format!("openpty: {e}")))?;

        // Safety: fork is standard Unix practice for PTY management. The
        // child immediately sets up stdio and exec's.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);

                // New session; the slave becomes the controlling terminal.
                unistd::setsid().map_err(|e| GroveError::Pty(format!("setsid: {e}")))?;
                unsafe {
                    if libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                        let err = std::io::Error::last_os_error();
                        eprintln!("groved: TIOCSCTTY failed: {err}");
                    }
                }

                unistd::dup2(pty.slave.as_raw_fd(), libc::STDIN_FILENO)
                    .map_err(|e| GroveError::Pty(format!("dup2 stdin: {e}")))?;
                unistd::dup2(pty.slave.as_raw_fd(), libc::STDOUT_FILENO)
                    .map_err(|e| GroveError::Pty(format!("dup2 stdout: {e}")))?;
                unistd::dup2(pty.slave.as_raw_fd(), libc::STDERR_FILENO)
                    .map_err(|e| GroveError::Pty(format!("dup2 stderr: {e}")))?;
                drop(pty.slave);

                unistd::chdir(working_dir).map_err(|e| GroveError::Pty(format!("chdir: {e}")))?;

                for (key, value) in env {
                    std::env::set_var(key, value);
                }

                let c_command = CString::new(command.to_string())
                    .map_err(|e| GroveError::Pty(format!("invalid command: {e}")))?;
                let mut c_args: Vec<CString> = vec![c_command.clone()];
                for arg in args {
                    c_args.push(
                        CString::new(arg.as_str())
                            .map_err(|e| GroveError::Pty(format!("invalid arg: {e}")))?,
                    );
                }

                unistd::execvp(&c_command, &c_args)
                    .map_err(|e| GroveError::Pty(format!("exec {command}: {e}")))?;
                unreachable!("execvp returned Ok");
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);
                Ok(Self {
                    master: Arc::new(PtyMaster { fd: pty.master }),
                    child_pid: child,
                })
            }
            Err(e) => Err(GroveError::Pty(format!("fork: {e}"))),
        }
    }

    /// The child's process ID.
    pub fn pid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// Signal termination is reported as `-signum`.
    pub fn wait(&self) -> Result<i32> {
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(-(sig as i32)),
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => return Ok(0), // already reaped
                Err(e) => return Err(GroveError::Pty(format!("waitpid: {e}"))),
            }
        }
    }
}

/// SIGKILL the process group led by `pid`.
///
/// After `spawn`, the child is its own session leader so PGID == PID, but
/// looking the group up keeps this explicit. Falls back to killing just the
/// process; already-dead targets (ESRCH) are fine.
pub fn kill_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    let target = Pid::from_raw(pid);
    match unistd::getpgid(Some(target)) {
        Ok(pgid) if pgid.as_raw() > 0 => {
            let _ = signal::kill(Pid::from_raw(-pgid.as_raw()), Signal::SIGKILL);
        }
        _ => {
            let _ = signal::kill(target, Signal::SIGKILL);
        }
    }
}
