//! Session lifecycle: probing, discovery, and create-or-connect.
//!
//! A session is live exactly when its socket accepts a connection and
//! answers `Info` within the probe deadline. Anything else at that path
//! is stale and gets unlinked by whoever notices — unlink after a failed
//! probe is idempotent, so racing cleaners are harmless.

use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::unistd::{fork, setsid, ForkResult};
use tracing::{debug, error, info, warn};

use zmx_core::buffer::SocketBuffer;
use zmx_core::error::ZmxError;
use zmx_core::frame::{self, InfoPayload, Tag, INFO_PAYLOAD_LEN};
use zmx_core::name::decode_name;

use crate::daemon::paths;
use crate::daemon::pty::{fd_term_size, PtySession, TermSize};
use crate::daemon::server::DaemonServer;

/// How long a probe waits for the `Info` reply.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long supervisor commands wait for a reply frame.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(5000);

/// A live session found by probing.
#[derive(Debug)]
pub struct LiveSession {
    /// Still-open connection; callers reuse it or drop it.
    pub stream: UnixStream,
    pub info: InfoPayload,
}

/// Probe one session by name.
pub fn probe(name: &str, group: &str) -> Result<LiveSession, ZmxError> {
    probe_path(&paths::socket_path(name, group), name)
}

/// Probe a socket path: connect, send `Info`, require a well-formed
/// reply of the expected size within [`PROBE_TIMEOUT`].
pub fn probe_path(path: &Path, name: &str) -> Result<LiveSession, ZmxError> {
    let stream = match UnixStream::connect(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ZmxError::NotFound(name.to_string()));
        }
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return Err(ZmxError::StaleSocket(name.to_string()));
        }
        Err(e) => return Err(ZmxError::IoFatal(e)),
    };
    stream
        .set_nonblocking(true)
        .map_err(ZmxError::IoFatal)?;

    if send_frame(&stream, Tag::Info, b"", PROBE_TIMEOUT).is_err() {
        return Err(ZmxError::StaleSocket(name.to_string()));
    }
    match recv_frame(&stream, &mut SocketBuffer::new(), PROBE_TIMEOUT) {
        Ok((Tag::Info, payload)) if payload.len() == INFO_PAYLOAD_LEN => {
            let info = InfoPayload::decode(&payload)
                .map_err(|_| ZmxError::StaleSocket(name.to_string()))?;
            Ok(LiveSession { stream, info })
        }
        // Wrong tag, wrong size, malformed, timeout, peer gone: all of
        // them mean nobody trustworthy owns this socket.
        _ => Err(ZmxError::StaleSocket(name.to_string())),
    }
}

/// Probe and unlink the socket if it turns out stale.
pub fn probe_or_cleanup(name: &str, group: &str) -> Result<LiveSession, ZmxError> {
    let path = paths::socket_path(name, group);
    match probe_path(&path, name) {
        Err(ZmxError::StaleSocket(n)) => {
            debug!("unlinking stale socket {:?}", path);
            let _ = std::fs::remove_file(&path);
            Err(ZmxError::StaleSocket(n))
        }
        other => other,
    }
}

/// One live session in a group listing.
pub struct Discovered {
    pub name: String,
    pub info: InfoPayload,
}

/// Enumerate and probe every session in a group, opportunistically
/// unlinking the stale ones.
pub fn discover(group: &str) -> Vec<Discovered> {
    discover_in(&paths::socket_root().join(group))
}

fn discover_in(dir: &Path) -> Vec<Discovered> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_socket = std::fs::symlink_metadata(&path)
            .map(|m| {
                use std::os::unix::fs::FileTypeExt;
                m.file_type().is_socket()
            })
            .unwrap_or(false);
        if !is_socket {
            continue;
        }
        let name = decode_name(&entry.file_name().to_string_lossy());
        match probe_path(&path, &name) {
            Ok(live) => found.push(Discovered {
                name,
                info: live.info,
            }),
            Err(ZmxError::StaleSocket(_)) => {
                debug!("cleaning stale socket {:?}", path);
                let _ = std::fs::remove_file(&path);
            }
            Err(e) => warn!("probing {:?}: {}", path, e),
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

/// Outcome of [`ensure_session`]: either way the caller can now connect
/// as a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// A live daemon already answers at the socket.
    Existing,
    /// A daemon was forked off and is now listening.
    Created,
}

/// Connect-or-create. Probes first; a stale socket is unlinked and
/// replaced. Creation binds the listener in the calling process, forks,
/// and lets the child become the daemon while the caller goes on to
/// connect.
pub fn ensure_session(
    name: &str,
    group: &str,
    cmd: &[String],
    cwd: Option<&Path>,
) -> Result<Ensured> {
    match probe_or_cleanup(name, group) {
        Ok(_) => return Ok(Ensured::Existing),
        Err(ZmxError::NotFound(_)) | Err(ZmxError::StaleSocket(_)) => {}
        Err(e) => return Err(e).context("probing session"),
    }
    create_session(name, group, cmd, cwd)?;
    Ok(Ensured::Created)
}

/// Fork a daemon for a new session. Returns in the parent once the
/// child has had a moment to start accepting.
fn create_session(name: &str, group: &str, cmd: &[String], cwd: Option<&Path>) -> Result<()> {
    paths::ensure_dirs(group).context("creating socket/log directories")?;
    let socket_path = paths::socket_path(name, group);

    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        // Lost a creation race; the winner's daemon owns the socket.
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            debug!("socket {:?} appeared concurrently", socket_path);
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("binding {:?}", socket_path));
        }
    };

    // The daemon inherits the window size of the terminal the user is
    // sitting at, so the shell starts life at the right dimensions.
    let size = fd_term_size(libc::STDIN_FILENO).unwrap_or_default();

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            debug!("daemon forked as pid {}", child);
            drop(listener);
            // Give the child a beat to enter its accept loop.
            std::thread::sleep(Duration::from_millis(100));
            Ok(())
        }
        ForkResult::Child => daemon_child(listener, name, group, cmd, cwd, size),
    }
}

/// The forked child: detach from the terminal, point output at the
/// session log, spawn the shell, run the loop, exit. Never returns into
/// CLI code.
fn daemon_child(
    listener: UnixListener,
    name: &str,
    group: &str,
    cmd: &[String],
    cwd: Option<&Path>,
    size: TermSize,
) -> ! {
    if let Err(e) = setsid() {
        error!("setsid: {}", e);
    }
    redirect_stdio(&paths::log_path(name, group));

    let pty = match PtySession::spawn(cmd, cwd, size, name, group) {
        Ok(pty) => pty,
        Err(e) => {
            error!("spawning shell for '{}': {:#}", name, e);
            std::process::exit(1);
        }
    };
    let server = match DaemonServer::new(listener, pty, name.to_string(), group.to_string(), size)
    {
        Ok(server) => server,
        Err(e) => {
            error!("assembling daemon for '{}': {:#}", name, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run() {
        error!("daemon loop for '{}': {:#}", name, e);
        std::process::exit(1);
    }
    info!("daemon for '{}' exiting", name);
    std::process::exit(0)
}

/// Re-point fds 0/1/2 at /dev/null and the session log. The tracing
/// subscriber writes to stderr, so after this every log line lands in
/// the file.
fn redirect_stdio(log_path: &Path) {
    use std::fs::OpenOptions;
    use std::os::unix::io::IntoRawFd;

    if let Ok(devnull) = OpenOptions::new().read(true).open("/dev/null") {
        let fd = devnull.into_raw_fd();
        unsafe { libc::dup2(fd, libc::STDIN_FILENO) };
        if fd > libc::STDERR_FILENO {
            unsafe { libc::close(fd) };
        }
    }
    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(log) => {
            let fd = log.into_raw_fd();
            unsafe {
                libc::dup2(fd, libc::STDOUT_FILENO);
                libc::dup2(fd, libc::STDERR_FILENO);
            }
            if fd > libc::STDERR_FILENO {
                unsafe { libc::close(fd) };
            }
        }
        Err(e) => {
            // Keep running; logs just go wherever stderr still points.
            warn!("opening log {:?}: {}", log_path, e);
        }
    }
}

/// Pick `{source}-{N}` for the smallest free N below 1000.
pub fn fork_name(source: &str, taken: impl Fn(&str) -> bool) -> Result<String, ZmxError> {
    for n in 1..1000 {
        let candidate = format!("{}-{}", source, n);
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ZmxError::AlreadyExists(format!("{}-1..999", source)))
}

/// Write one frame to a non-blocking stream, polling for writability
/// until `deadline` elapses.
pub fn send_frame(
    stream: &UnixStream,
    tag: Tag,
    payload: &[u8],
    deadline: Duration,
) -> Result<(), ZmxError> {
    let wire = frame::encode(tag, payload);
    let mut written = 0;
    let start = Instant::now();
    while written < wire.len() {
        match (&*stream).write(&wire[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= deadline {
                    return Err(ZmxError::Timeout("send"));
                }
                wait_fd(stream.as_raw_fd(), false, Duration::from_millis(50));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ZmxError::classify(e)),
        }
    }
    Ok(())
}

/// Read the next complete frame from a non-blocking stream, waiting up
/// to `deadline`. The payload is copied out; supervisor traffic is
/// small.
pub fn recv_frame(
    stream: &UnixStream,
    buf: &mut SocketBuffer,
    deadline: Duration,
) -> Result<(Tag, Vec<u8>), ZmxError> {
    let start = Instant::now();
    loop {
        if let Some((tag, payload)) = buf.next()? {
            return Ok((tag, payload.to_vec()));
        }
        let remaining = deadline
            .checked_sub(start.elapsed())
            .ok_or(ZmxError::Timeout("reply"))?;
        wait_fd(stream.as_raw_fd(), true, remaining.min(Duration::from_millis(100)));
        match buf.read_fd(stream.as_raw_fd()) {
            Ok(0) => return Err(ZmxError::PeerGone),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(ZmxError::classify(e)),
        }
    }
}

/// Poll one fd for readability or writability.
fn wait_fd(fd: RawFd, readable: bool, timeout: Duration) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::unix::io::BorrowedFd;

    let interest = if readable {
        PollFlags::POLLIN
    } else {
        PollFlags::POLLOUT
    };
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, interest)];
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    let _ = poll(&mut fds, PollTimeout::from(millis));
}
