//! PTY supervision: forkpty spawn, window sizing, and teardown.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::daemon::paths::{ENV_GROUP, ENV_SESSION};

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for Winsize {
    fn from(size: TermSize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// Window size of the terminal behind `fd`, if it is one.
pub fn fd_term_size(fd: RawFd) -> Option<TermSize> {
    let mut ws: Winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc < 0 || ws.ws_col == 0 || ws.ws_row == 0 {
        return None;
    }
    Some(TermSize {
        cols: ws.ws_col,
        rows: ws.ws_row,
    })
}

/// Push a new window size to the PTY; the kernel raises SIGWINCH in the
/// foreground process group. Failure is logged and swallowed so a dying
/// slave cannot take the daemon down before its EOF is read.
pub fn set_pty_size(fd: RawFd, size: TermSize) {
    let ws: Winsize = size.into();
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc < 0 {
        warn!(
            "TIOCSWINSZ to {}x{} failed: {}",
            size.cols,
            size.rows,
            std::io::Error::last_os_error()
        );
    }
}

/// A running shell behind a PTY master.
pub struct PtySession {
    master: OwnedFd,
    /// Shell pid; equal to its process-group id since forkpty's child
    /// leads a fresh session.
    shell: Pid,
    cmd: Vec<String>,
    cwd: PathBuf,
}

impl PtySession {
    /// Fork a shell onto a fresh PTY at the given size.
    ///
    /// An empty `cmd` spawns a login shell (`$SHELL`, argv\[0\] prefixed
    /// with `-`). The child gets `ZMX_SESSION`/`ZMX_GROUP` in its
    /// environment and runs in `cwd`. exec failure in the child calls
    /// `_exit(1)` and never returns into daemon code.
    pub fn spawn(
        cmd: &[String],
        cwd: Option<&Path>,
        size: TermSize,
        session: &str,
        group: &str,
    ) -> Result<Self> {
        let cwd = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir().context("cannot resolve working directory")?,
        };
        let ws: Winsize = size.into();
        match unsafe { forkpty(Some(&ws), None) }.context("forkpty failed")? {
            ForkptyResult::Parent { master, child } => {
                set_nonblocking(master.as_raw_fd())?;
                debug!("shell pid {} on master fd {}", child, master.as_raw_fd());
                Ok(Self {
                    master,
                    shell: child,
                    cmd: cmd.to_vec(),
                    cwd,
                })
            }
            ForkptyResult::Child => {
                exec_child(cmd, &cwd, session, group);
            }
        }
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn shell_pid(&self) -> Pid {
        self.shell
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Tear the shell down: SIGHUP to its process group, a 500 ms grace
    /// period, SIGKILL, then reap. The master closes on drop.
    pub fn teardown(self) {
        if let Err(e) = killpg(self.shell, Signal::SIGHUP) {
            debug!("SIGHUP to shell group {}: {}", self.shell, e);
        }
        std::thread::sleep(Duration::from_millis(500));
        if let Err(e) = killpg(self.shell, Signal::SIGKILL) {
            debug!("SIGKILL to shell group {}: {}", self.shell, e);
        }
        match waitpid(self.shell, None) {
            Ok(status) => debug!("shell reaped: {:?}", status),
            Err(e) => warn!("waitpid({}): {}", self.shell, e),
        }
    }
}

/// Child half of `forkpty`: set up the environment and exec. Never
/// returns; any failure is `_exit(1)`.
fn exec_child(cmd: &[String], cwd: &Path, session: &str, group: &str) -> ! {
    std::env::set_var(ENV_SESSION, session);
    std::env::set_var(ENV_GROUP, group);
    let _ = std::env::set_current_dir(cwd);

    let (prog, argv) = if cmd.is_empty() {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let base = Path::new(&shell)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sh".to_string());
        // Leading dash makes the shell run as a login shell.
        (shell.clone(), vec![format!("-{}", base)])
    } else {
        (cmd[0].clone(), cmd.to_vec())
    };

    let prog_c = match CString::new(prog) {
        Ok(c) => c,
        Err(_) => unsafe { libc::_exit(1) },
    };
    let argv_c: Vec<CString> = match argv.into_iter().map(CString::new).collect() {
        Ok(v) => v,
        Err(_) => unsafe { libc::_exit(1) },
    };
    let _ = nix::unistd::execvp(&prog_c, &argv_c);
    unsafe { libc::_exit(1) }
}

/// Mark an fd non-blocking.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error()).context("F_GETFL");
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("F_SETFL O_NONBLOCK");
    }
    Ok(())
}

/// Write a full buffer to a non-blocking fd, briefly polling for
/// writability when the kernel buffer is full. The PTY drains as the
/// shell reads, so the wait is bounded in practice.
pub fn write_all_fd(fd: RawFd, mut bytes: &[u8]) -> std::io::Result<()> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::unix::io::BorrowedFd;

    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n >= 0 {
            bytes = &bytes[n as usize..];
            continue;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLOUT)];
                let _ = poll(&mut fds, PollTimeout::from(100u8));
            }
            _ => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_echo_and_read_output() {
        let session = PtySession::spawn(
            &["echo".to_string(), "hello".to_string()],
            None,
            TermSize::default(),
            "t",
            "default",
        )
        .expect("spawn echo");

        // Master is non-blocking; poll until the output lands.
        let mut collected = Vec::new();
        let mut buf = [0u8; 512];
        for _ in 0..100 {
            let n = unsafe {
                libc::read(
                    session.master_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                collected.extend_from_slice(&buf[..n as usize]);
                if String::from_utf8_lossy(&collected).contains("hello") {
                    break;
                }
            } else {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        assert!(
            String::from_utf8_lossy(&collected).contains("hello"),
            "expected 'hello' in {:?}",
            String::from_utf8_lossy(&collected)
        );
        session.teardown();
    }

    #[test]
    fn write_reaches_the_shell() {
        let session = PtySession::spawn(
            &["cat".to_string()],
            None,
            TermSize::default(),
            "t",
            "default",
        )
        .expect("spawn cat");

        write_all_fd(session.master_fd(), b"ping\n").expect("write");

        let mut collected = Vec::new();
        let mut buf = [0u8; 512];
        for _ in 0..100 {
            let n = unsafe {
                libc::read(
                    session.master_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                collected.extend_from_slice(&buf[..n as usize]);
                if String::from_utf8_lossy(&collected).contains("ping") {
                    break;
                }
            } else {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("ping"));
        session.teardown();
    }

    #[test]
    fn teardown_reaps_the_shell() {
        let session = PtySession::spawn(
            &["sleep".to_string(), "30".to_string()],
            None,
            TermSize::default(),
            "t",
            "default",
        )
        .expect("spawn sleep");
        let pid = session.shell_pid();
        session.teardown();
        // After teardown the pid no longer exists (or is at least no
        // longer our child).
        let gone = nix::sys::signal::kill(pid, None).is_err();
        assert!(gone, "shell {pid} still signallable after teardown");
    }

    #[test]
    fn resize_on_non_tty_is_nonfatal() {
        // TIOCSWINSZ against a pipe fails inside the kernel; the helper
        // must swallow it.
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        set_pty_size(r.as_raw_fd(), TermSize { cols: 10, rows: 5 });
        assert!(fd_term_size(r.as_raw_fd()).is_none());
    }
}
