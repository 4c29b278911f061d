//! The attach client.
//!
//! Puts the controlling terminal into raw mode, forwards keystrokes to
//! the daemon, prints daemon output, and watches for the detach key.
//! Everything runs under one poll over stdin, the session socket, and
//! (while output is pending) stdout.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{
    self, cfmakeraw, SetArg, SpecialCharacterIndices, Termios,
};
use tracing::debug;

use zmx_core::buffer::{SocketBuffer, WriteBuffer};
use zmx_core::frame::{encode_winsize, Tag};

use crate::daemon::pty::fd_term_size;

/// Detach key: Ctrl+\ arrives as this byte once ISIG is off.
const DETACH_BYTE: u8 = 0x1C;

/// Ctrl+\ as reported by terminals speaking the Kitty keyboard protocol.
const KITTY_DETACH: [&[u8]; 2] = [b"\x1b[92;5u", b"\x1b[92;5:1u"];

/// Written once on exit: mouse reporting, bracketed paste, focus
/// events, and the alternate screen off; cursor visible. The screen is
/// deliberately not cleared — wiping it here would destroy what the
/// snapshot protocol just restored for the next attach.
const RESTORE_MODES: &[u8] =
    b"\x1b[?1000l\x1b[?1002l\x1b[?1003l\x1b[?1006l\x1b[?2004l\x1b[?1004l\x1b[?1049l\x1b[?25h";

/// Bytes read from stdin per wakeup.
const STDIN_CHUNK: usize = 4096;

/// True when a stdin chunk is the detach gesture rather than input.
fn wants_detach(input: &[u8]) -> bool {
    if input.first() == Some(&DETACH_BYTE) {
        return true;
    }
    KITTY_DETACH
        .iter()
        .any(|seq| input.windows(seq.len()).any(|window| window == *seq))
}

/// Raw-mode guard for the controlling terminal.
///
/// Canonical mode, echo, signal generation, and flow control go off so
/// every byte reaches the daemon verbatim — including Ctrl+\, which is
/// the detach key. The literal-next key is disabled explicitly. Restored
/// with `TCSAFLUSH` (unread input discarded) plus the mode-reset
/// sequence on drop.
struct RawGuard {
    orig: Termios,
    orig_flags: libc::c_int,
}

impl RawGuard {
    fn new() -> Result<Self> {
        let fd = stdin_fd();
        let orig = termios::tcgetattr(fd).context("tcgetattr on stdin")?;
        let mut raw = orig.clone();
        cfmakeraw(&mut raw);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VLNEXT as usize] = 0;
        termios::tcsetattr(fd, SetArg::TCSANOW, &raw).context("tcsetattr raw")?;

        let orig_flags = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_GETFL) };
        unsafe {
            libc::fcntl(
                libc::STDIN_FILENO,
                libc::F_SETFL,
                orig_flags | libc::O_NONBLOCK,
            )
        };
        Ok(Self { orig, orig_flags })
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(stdin_fd(), SetArg::TCSAFLUSH, &self.orig);
        unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_SETFL, self.orig_flags) };
        let _ = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                RESTORE_MODES.as_ptr() as *const libc::c_void,
                RESTORE_MODES.len(),
            )
        };
    }
}

fn stdin_fd() -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }
}

/// Attach to a connected session socket and run until detach, stdin
/// EOF, or the daemon going away.
pub fn run_attached(stream: UnixStream) -> Result<()> {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        bail!("attaching requires a terminal on stdin");
    }
    stream
        .set_nonblocking(true)
        .context("socket non-blocking")?;

    let winch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGWINCH, Arc::clone(&winch))
        .context("register SIGWINCH")?;

    let _guard = RawGuard::new()?;

    let mut sock_in = SocketBuffer::new();
    let mut sock_out = WriteBuffer::new();
    let mut stdout_buf = WriteBuffer::new();
    let mut detaching = false;

    // Fresh canvas, then announce our window size. The daemon answers a
    // re-attach Init with a snapshot that repaints everything.
    stdout_buf.push_bytes(b"\x1b[2J\x1b[H");
    let size = fd_term_size(libc::STDIN_FILENO).unwrap_or_default();
    sock_out.push_frame(Tag::Init, &encode_winsize(size.rows, size.cols));

    loop {
        if winch.swap(false, Ordering::AcqRel) {
            if let Some(size) = fd_term_size(libc::STDIN_FILENO) {
                sock_out.push_frame(Tag::Resize, &encode_winsize(size.rows, size.cols));
            }
        }

        let mut stdin_interest = PollFlags::empty();
        if !detaching {
            stdin_interest |= PollFlags::POLLIN;
        }
        let mut sock_interest = PollFlags::POLLIN;
        if !sock_out.is_empty() {
            sock_interest |= PollFlags::POLLOUT;
        }
        let mut stdout_interest = PollFlags::empty();
        if !stdout_buf.is_empty() {
            stdout_interest |= PollFlags::POLLOUT;
        }

        let stdout_borrowed = unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) };
        let mut fds = [
            PollFd::new(stdin_fd(), stdin_interest),
            PollFd::new(stream.as_fd(), sock_interest),
            PollFd::new(stdout_borrowed, stdout_interest),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => bail!("poll: {}", e),
        }
        let stdin_ev = fds[0].revents().unwrap_or(PollFlags::empty());
        let sock_ev = fds[1].revents().unwrap_or(PollFlags::empty());
        let stdout_ev = fds[2].revents().unwrap_or(PollFlags::empty());

        if stdin_ev.contains(PollFlags::POLLIN) {
            let mut buf = [0u8; STDIN_CHUNK];
            let n = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n == 0 {
                debug!("stdin EOF");
                break;
            }
            if n > 0 {
                let input = &buf[..n as usize];
                if wants_detach(input) {
                    sock_out.push_frame(Tag::Detach, b"");
                    detaching = true;
                } else {
                    sock_out.push_frame(Tag::Input, input);
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock
                    && err.kind() != io::ErrorKind::Interrupted
                {
                    bail!("reading stdin: {}", err);
                }
            }
        }

        if sock_ev.contains(PollFlags::POLLIN) {
            let mut closed = false;
            loop {
                match sock_in.read_fd(stream.as_raw_fd()) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
            loop {
                match sock_in.next() {
                    Ok(Some((Tag::Output, payload))) => stdout_buf.push_bytes(payload),
                    // Everything else on this socket is daemon-bound
                    // traffic echoed by mistake.
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!("dropping garbled daemon stream: {}", e);
                        closed = true;
                        break;
                    }
                }
            }
            if closed {
                // Flush whatever output we already hold, then leave.
                let _ = stdout_buf.flush_fd(libc::STDOUT_FILENO);
                debug!("session socket closed");
                break;
            }
        }

        if sock_ev.contains(PollFlags::POLLOUT) && !sock_out.is_empty() {
            if let Err(e) = sock_out.flush_fd(stream.as_raw_fd()) {
                debug!("socket write: {}", e);
                break;
            }
        }
        if detaching && sock_out.is_empty() {
            break;
        }

        if stdout_ev.contains(PollFlags::POLLOUT) && !stdout_buf.is_empty() {
            stdout_buf
                .flush_fd(libc::STDOUT_FILENO)
                .context("writing stdout")?;
        }

        if sock_ev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            debug!("session socket hung up");
            break;
        }
    }

    // RawGuard's drop restores the terminal and resets modes.
    Ok(())
}
