//! The daemon event loop.
//!
//! Single-threaded and cooperative: one `poll` per iteration over the
//! listening socket, the PTY master, and every attached client. PTY
//! output is fed to the VT model and broadcast; client frames are
//! dispatched by tag. SIGTERM is observed through an atomic flag at the
//! top of each iteration, never mid-frame.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, info, warn};

use zmx_core::buffer::{SocketBuffer, WriteBuffer};
use zmx_core::error::ZmxError;
use zmx_core::frame::{self, InfoPayload, SerializeFormat, Tag};

use crate::daemon::paths;
use crate::daemon::pty::{set_pty_size, write_all_fd, PtySession, TermSize};
use crate::daemon::terminal::{new_terminal, Backend, Terminal, DEFAULT_SCROLLBACK_CELLS};

/// Bytes pulled from the PTY per wakeup.
const PTY_READ_CHUNK: usize = 4096;

/// One attached client.
struct Client {
    stream: UnixStream,
    recv: SocketBuffer,
    send: WriteBuffer,
}

impl Client {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            recv: SocketBuffer::new(),
            send: WriteBuffer::new(),
        }
    }
}

/// What a dispatched frame asks of the main loop.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Close the dispatching client; session keeps running.
    CloseClient,
    /// Close every client; session keeps running.
    DetachAll,
    /// Break the main loop and tear the session down.
    Shutdown,
}

/// Shared pieces a frame dispatch may touch, split off from the client
/// list so a borrowed payload and the rest of the daemon can coexist.
struct DispatchCtx<'a> {
    term: &'a mut Box<dyn Terminal>,
    pty_fd: RawFd,
    shell_pid: i32,
    cmd: &'a [String],
    cwd: &'a str,
    has_pty_output: &'a mut bool,
    has_had_client: &'a mut bool,
    /// Client count sampled when the poll set was built; `Info` replies
    /// exclude the requester from it.
    live_clients: usize,
}

pub struct DaemonServer {
    name: String,
    group: String,
    listener: UnixListener,
    socket_path: PathBuf,
    pty: PtySession,
    term: Box<dyn Terminal>,
    clients: Vec<Client>,
    has_pty_output: bool,
    has_had_client: bool,
}

impl DaemonServer {
    /// Assemble a daemon around an already-bound listener and a spawned
    /// shell.
    pub fn new(
        listener: UnixListener,
        pty: PtySession,
        name: String,
        group: String,
        size: TermSize,
    ) -> Result<Self> {
        listener
            .set_nonblocking(true)
            .context("listener non-blocking")?;
        let socket_path = paths::socket_path(&name, &group);
        let term = new_terminal(Backend::from_env(), size, DEFAULT_SCROLLBACK_CELLS);
        Ok(Self {
            name,
            group,
            listener,
            socket_path,
            pty,
            term,
            clients: Vec::new(),
            has_pty_output: false,
            has_had_client: false,
        })
    }

    /// Run until the shell exits, a `Kill` arrives, or SIGTERM lands,
    /// then tear everything down.
    pub fn run(mut self) -> Result<()> {
        let sigterm = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&sigterm))
            .context("register SIGTERM")?;

        info!(
            "session '{}' (group '{}') up: shell pid {}, socket {:?}",
            self.name,
            self.group,
            self.pty.shell_pid(),
            self.socket_path
        );
        breadcrumb(&format!(
            "session '{}' started, shell pid {}",
            self.name,
            self.pty.shell_pid()
        ));

        loop {
            // Honored at loop boundaries only, never mid-frame.
            if sigterm.swap(false, Ordering::AcqRel) {
                info!("SIGTERM, shutting down");
                break;
            }

            let sampled = self.clients.len();
            let pty_fd = self.pty.master_fd();
            let pty_borrowed = unsafe { BorrowedFd::borrow_raw(pty_fd) };

            let mut fds = Vec::with_capacity(2 + sampled);
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            fds.push(PollFd::new(pty_borrowed, PollFlags::POLLIN));
            for client in &self.clients {
                let mut interest = PollFlags::POLLIN;
                if !client.send.is_empty() {
                    interest |= PollFlags::POLLOUT;
                }
                fds.push(PollFd::new(client.stream.as_fd(), interest));
            }

            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(anyhow::anyhow!("poll: {}", e)),
            }
            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect();
            drop(fds);

            if revents[0].intersects(PollFlags::POLLIN) {
                self.accept_clients();
            }

            if revents[1]
                .intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                && !self.pump_pty()
            {
                info!("shell exited");
                break;
            }

            // Dispatch is capped at the sampled count: clients accepted
            // this iteration wait for the next poll.
            let mut dead = vec![false; self.clients.len()];
            let mut shutdown = false;
            let mut detach_all = false;

            let live = self.clients.len();
            let Self {
                clients,
                term,
                pty,
                has_pty_output,
                has_had_client,
                ..
            } = &mut self;
            let cmd = pty.cmd().to_vec();
            let cwd = pty.cwd().to_string_lossy().into_owned();
            let mut ctx = DispatchCtx {
                term,
                pty_fd,
                shell_pid: pty.shell_pid().as_raw(),
                cmd: &cmd,
                cwd: &cwd,
                has_pty_output,
                has_had_client,
                live_clients: live,
            };

            'clients: for idx in 0..sampled {
                let ev = revents[2 + idx];
                if ev.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    dead[idx] = true;
                    continue;
                }
                if ev.contains(PollFlags::POLLIN) {
                    match drain_client(&mut clients[idx], &mut ctx) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::CloseClient) => dead[idx] = true,
                        Ok(Flow::DetachAll) => detach_all = true,
                        Ok(Flow::Shutdown) => {
                            shutdown = true;
                            break 'clients;
                        }
                        Err(e) if e.closes_client_only() => {
                            debug!("client {}: {}", idx, e);
                            dead[idx] = true;
                        }
                        Err(ZmxError::IoTransient) => {}
                        Err(e) => {
                            error!("fatal during dispatch: {}", e);
                            shutdown = true;
                            break 'clients;
                        }
                    }
                }
                if !dead[idx] && ev.contains(PollFlags::POLLOUT) {
                    let fd = clients[idx].stream.as_raw_fd();
                    if let Err(e) = clients[idx].send.flush_fd(fd) {
                        debug!("client {} write: {}", idx, e);
                        dead[idx] = true;
                    }
                }
            }

            if shutdown {
                break;
            }
            if detach_all {
                info!("detaching all clients");
                self.clients.clear();
            } else {
                for idx in (0..dead.len()).rev() {
                    if dead[idx] {
                        self.clients.remove(idx);
                        debug!("client removed, {} attached", self.clients.len());
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Accept every pending connection; new clients join the set but are
    /// not dispatched until the next iteration.
    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("accepted client unusable: {}", e);
                        continue;
                    }
                    self.clients.push(Client::new(stream));
                    debug!("client attached, {} total", self.clients.len());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept: {}", e);
                    break;
                }
            }
        }
    }

    /// One PTY read: feed the VT model and queue an `Output` frame for
    /// every client. Returns false once the shell is gone.
    fn pump_pty(&mut self) -> bool {
        let mut buf = [0u8; PTY_READ_CHUNK];
        let n = unsafe {
            libc::read(
                self.pty.master_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n == 0 {
            return false;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => true,
                // Linux reports EIO on the master once the slave side is
                // fully closed; that is the shell exiting.
                Some(libc::EIO) => false,
                _ => {
                    error!("PTY read: {}", err);
                    false
                }
            };
        }
        let bytes = &buf[..n as usize];
        self.term.feed(bytes);
        self.has_pty_output = true;
        for client in &mut self.clients {
            client.send.push_frame(Tag::Output, bytes);
        }
        true
    }

    /// Teardown: drop the clients, walk the shell's process group from
    /// SIGHUP to SIGKILL, reap it, close the PTY and listener, unlink
    /// the socket.
    fn shutdown(self) {
        info!("session '{}' shutting down", self.name);
        drop(self.clients);
        self.pty.teardown();
        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("unlink {:?}: {}", self.socket_path, e);
            }
        }
        breadcrumb(&format!("session '{}' ended", self.name));
        info!("session '{}' down", self.name);
    }
}

/// Drain a readable client socket, then dispatch every complete frame.
fn drain_client(client: &mut Client, ctx: &mut DispatchCtx<'_>) -> Result<Flow, ZmxError> {
    let fd = client.stream.as_raw_fd();
    let mut peer_closed = false;
    loop {
        match client.recv.read_fd(fd) {
            Ok(0) => {
                peer_closed = true;
                break;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ZmxError::classify(e)),
        }
    }

    let Client { recv, send, .. } = client;
    let mut flow = Flow::Continue;
    while let Some((tag, payload)) = recv.next()? {
        match dispatch_frame(tag, payload, send, ctx)? {
            Flow::Continue => {}
            other => {
                flow = other;
                break;
            }
        }
    }
    if peer_closed && flow == Flow::Continue {
        flow = Flow::CloseClient;
    }
    Ok(flow)
}

/// Apply one frame. Payload stays borrowed from the client's read
/// buffer; only snapshots and replies materialize new bytes.
fn dispatch_frame(
    tag: Tag,
    payload: &[u8],
    send: &mut WriteBuffer,
    ctx: &mut DispatchCtx<'_>,
) -> Result<Flow, ZmxError> {
    match tag {
        Tag::Input => {
            write_all_fd(ctx.pty_fd, payload).map_err(ZmxError::classify)?;
        }
        Tag::Init => {
            let (rows, cols) = frame::decode_winsize(payload)
                .ok_or_else(|| ZmxError::Malformed("init payload size".into()))?;
            let size = TermSize { cols, rows };
            set_pty_size(ctx.pty_fd, size);
            ctx.term.resize(size);
            // The first-ever attach gets no snapshot: replaying state
            // into a shell still negotiating its terminal corrupts
            // startup. Snapshot after the resize, so the cursor lands
            // where the post-SIGWINCH redraw expects it.
            if *ctx.has_pty_output && *ctx.has_had_client {
                if let Some(snapshot) = ctx.term.serialize_state() {
                    send.push_frame(Tag::Output, &snapshot);
                }
            }
            *ctx.has_had_client = true;
        }
        Tag::Resize => {
            let (rows, cols) = frame::decode_winsize(payload)
                .ok_or_else(|| ZmxError::Malformed("resize payload size".into()))?;
            let size = TermSize { cols, rows };
            set_pty_size(ctx.pty_fd, size);
            ctx.term.resize(size);
        }
        Tag::Detach => return Ok(Flow::CloseClient),
        Tag::DetachAll => return Ok(Flow::DetachAll),
        Tag::Kill => return Ok(Flow::Shutdown),
        Tag::Info => {
            let reply = InfoPayload {
                clients: ctx.live_clients.saturating_sub(1) as u64,
                pid: ctx.shell_pid,
                cmd: ctx.cmd.to_vec(),
                cwd: ctx.cwd.to_string(),
            };
            send.push_frame(Tag::Info, &reply.encode());
        }
        Tag::History => {
            let format = payload
                .first()
                .copied()
                .and_then(SerializeFormat::from_byte)
                .ok_or_else(|| ZmxError::Malformed("history format byte".into()))?;
            let rendered = ctx.term.serialize(format).unwrap_or_default();
            send.push_frame(Tag::History, &rendered);
        }
        Tag::Run => {
            write_all_fd(ctx.pty_fd, payload).map_err(ZmxError::classify)?;
            send.push_frame(Tag::Ack, b"");
            // Future attachers should see what the command drew.
            *ctx.has_had_client = true;
        }
        // Server-to-client tags are ignored if a peer echoes them back.
        Tag::Output | Tag::Ack => {}
    }
    Ok(Flow::Continue)
}

/// One-line lifecycle note in the global log; failures are irrelevant.
fn breadcrumb(line: &str) {
    use std::io::Write;
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths::global_log_path())
    {
        let _ = writeln!(file, "{} {}", ts, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::io::OwnedFd;

    /// A pipe standing in for the PTY master, plus the dispatch state
    /// the frames touch.
    struct Rig {
        term: Box<dyn Terminal>,
        pty_rx: std::fs::File,
        _pty_tx_keepalive: OwnedFd,
        pty_fd: RawFd,
        cmd: Vec<String>,
        has_pty_output: bool,
        has_had_client: bool,
        send: WriteBuffer,
    }

    impl Rig {
        fn new() -> Self {
            let (rx, tx) = nix::unistd::pipe().expect("pipe");
            let pty_fd = tx.as_raw_fd();
            Self {
                term: new_terminal(Backend::Full, TermSize::default(), 0),
                pty_rx: std::fs::File::from(rx),
                pty_fd,
                _pty_tx_keepalive: tx,
                cmd: vec!["htop".into()],
                has_pty_output: false,
                has_had_client: false,
                send: WriteBuffer::new(),
            }
        }

        fn dispatch(&mut self, tag: Tag, payload: &[u8]) -> Result<Flow, ZmxError> {
            let mut ctx = DispatchCtx {
                term: &mut self.term,
                pty_fd: self.pty_fd,
                shell_pid: 4242,
                cmd: &self.cmd,
                cwd: "/work",
                has_pty_output: &mut self.has_pty_output,
                has_had_client: &mut self.has_had_client,
                live_clients: 3,
            };
            dispatch_frame(tag, payload, &mut self.send, &mut ctx)
        }

        fn sent_frames(&mut self) -> Vec<(Tag, Vec<u8>)> {
            let (tx, rx) = UnixStream::pair().unwrap();
            tx.set_nonblocking(true).unwrap();
            rx.set_nonblocking(true).unwrap();
            self.send.flush_fd(tx.as_raw_fd()).unwrap();
            let mut buf = SocketBuffer::new();
            let mut frames = Vec::new();
            while buf.read_fd(rx.as_raw_fd()).unwrap_or(0) > 0 {}
            while let Some((tag, payload)) = buf.next().unwrap() {
                frames.push((tag, payload.to_vec()));
            }
            frames
        }
    }

    #[test]
    fn input_reaches_the_pty() {
        let mut rig = Rig::new();
        assert_eq!(rig.dispatch(Tag::Input, b"ls -la\n").unwrap(), Flow::Continue);
        let mut got = [0u8; 16];
        let n = rig.pty_rx.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"ls -la\n");
    }

    #[test]
    fn run_writes_and_acks_and_arms_snapshots() {
        let mut rig = Rig::new();
        assert_eq!(rig.dispatch(Tag::Run, b"make test\n").unwrap(), Flow::Continue);
        assert!(rig.has_had_client, "Run must arm re-attach snapshots");

        let mut got = [0u8; 16];
        let n = rig.pty_rx.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"make test\n");

        let frames = rig.sent_frames();
        assert_eq!(frames, vec![(Tag::Ack, vec![])]);
    }

    #[test]
    fn kill_and_detach_flow_control() {
        let mut rig = Rig::new();
        assert_eq!(rig.dispatch(Tag::Kill, b"").unwrap(), Flow::Shutdown);
        assert_eq!(rig.dispatch(Tag::Detach, b"").unwrap(), Flow::CloseClient);
        assert_eq!(rig.dispatch(Tag::DetachAll, b"").unwrap(), Flow::DetachAll);
    }

    #[test]
    fn first_init_gets_no_snapshot() {
        let mut rig = Rig::new();
        rig.term.feed(b"shell output");
        rig.has_pty_output = true;

        rig.dispatch(Tag::Init, &frame::encode_winsize(24, 80)).unwrap();
        assert!(rig.has_had_client);
        assert!(
            rig.sent_frames().is_empty(),
            "first attach must not receive a snapshot"
        );
    }

    #[test]
    fn reattach_init_gets_snapshot_after_resize() {
        let mut rig = Rig::new();
        rig.term.feed(b"prompt$ ");
        rig.has_pty_output = true;
        rig.has_had_client = true;

        rig.dispatch(Tag::Init, &frame::encode_winsize(30, 100)).unwrap();
        let frames = rig.sent_frames();
        assert_eq!(frames.len(), 1);
        let (tag, snapshot) = &frames[0];
        assert_eq!(*tag, Tag::Output);
        assert!(snapshot.starts_with(b"\x1b[2J\x1b[H"));
    }

    #[test]
    fn reattach_with_empty_screen_sends_nothing() {
        let mut rig = Rig::new();
        rig.has_pty_output = true;
        rig.has_had_client = true;
        rig.dispatch(Tag::Init, &frame::encode_winsize(24, 80)).unwrap();
        assert!(rig.sent_frames().is_empty());
    }

    #[test]
    fn info_reply_excludes_requester() {
        let mut rig = Rig::new();
        rig.dispatch(Tag::Info, b"").unwrap();
        let frames = rig.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, Tag::Info);
        let info = InfoPayload::decode(&frames[0].1).unwrap();
        assert_eq!(info.clients, 2, "three live clients minus the requester");
        assert_eq!(info.pid, 4242);
        assert_eq!(info.cmd, vec!["htop".to_string()]);
        assert_eq!(info.cwd, "/work");
    }

    #[test]
    fn history_honors_format_and_tolerates_empty() {
        let mut rig = Rig::new();
        rig.dispatch(Tag::History, &[0]).unwrap();
        let frames = rig.sent_frames();
        assert_eq!(frames[0].0, Tag::History);
        assert!(frames[0].1.is_empty(), "nothing fed yet, empty payload");

        rig.term.feed(b"remembered");
        rig.dispatch(Tag::History, &[0]).unwrap();
        let frames = rig.sent_frames();
        let text = String::from_utf8(frames[0].1.clone()).unwrap();
        assert!(text.contains("remembered"));
    }

    #[test]
    fn malformed_payloads_fail_without_panicking() {
        let mut rig = Rig::new();
        assert!(rig.dispatch(Tag::Init, b"xy").is_err());
        assert!(rig.dispatch(Tag::Resize, b"toolongpayload").is_err());
        assert!(rig.dispatch(Tag::History, b"").is_err());
        assert!(rig.dispatch(Tag::History, &[9]).is_err());
    }

    #[test]
    fn server_tags_from_peers_are_ignored() {
        let mut rig = Rig::new();
        assert_eq!(rig.dispatch(Tag::Output, b"echoed").unwrap(), Flow::Continue);
        assert_eq!(rig.dispatch(Tag::Ack, b"").unwrap(), Flow::Continue);
        assert!(rig.sent_frames().is_empty());
    }

    #[test]
    fn drain_dispatches_all_buffered_frames() {
        let mut rig = Rig::new();
        let (daemon_side, client_side) = UnixStream::pair().unwrap();
        daemon_side.set_nonblocking(true).unwrap();

        use std::io::Write;
        let mut peer = client_side;
        peer.write_all(&frame::encode(Tag::Input, b"a")).unwrap();
        peer.write_all(&frame::encode(Tag::Input, b"b")).unwrap();
        peer.write_all(&frame::encode(Tag::Info, b"")).unwrap();

        let mut client = Client::new(daemon_side);
        let mut ctx = DispatchCtx {
            term: &mut rig.term,
            pty_fd: rig.pty_fd,
            shell_pid: 1,
            cmd: &rig.cmd,
            cwd: "/",
            has_pty_output: &mut rig.has_pty_output,
            has_had_client: &mut rig.has_had_client,
            live_clients: 1,
        };
        let flow = drain_client(&mut client, &mut ctx).unwrap();
        assert_eq!(flow, Flow::Continue);

        // Both Input frames hit the PTY in order, and the Info reply is
        // queued for this client.
        let mut got = [0u8; 8];
        let n = rig.pty_rx.read(&mut got).unwrap();
        assert_eq!(&got[..n], b"ab");
        assert!(!client.send.is_empty());
    }

    #[test]
    fn drain_reports_peer_close() {
        let mut rig = Rig::new();
        let (daemon_side, client_side) = UnixStream::pair().unwrap();
        daemon_side.set_nonblocking(true).unwrap();
        drop(client_side);

        let mut client = Client::new(daemon_side);
        let mut ctx = DispatchCtx {
            term: &mut rig.term,
            pty_fd: rig.pty_fd,
            shell_pid: 1,
            cmd: &rig.cmd,
            cwd: "/",
            has_pty_output: &mut rig.has_pty_output,
            has_had_client: &mut rig.has_had_client,
            live_clients: 1,
        };
        assert_eq!(drain_client(&mut client, &mut ctx).unwrap(), Flow::CloseClient);
    }
}
