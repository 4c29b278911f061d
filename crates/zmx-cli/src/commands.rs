//! Supervisor commands, each a short-lived client of one or more
//! session daemons.

use std::io::{IsTerminal, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::debug;

use zmx_core::buffer::SocketBuffer;
use zmx_core::error::ZmxError;
use zmx_core::frame::{SerializeFormat, Tag};

use crate::client;
use crate::daemon::paths;
use crate::daemon::session::{
    self, ensure_session, fork_name, probe, probe_or_cleanup, Ensured, REPLY_TIMEOUT,
};

/// How long `attach` keeps retrying the connect after creating a
/// session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// `attach NAME [cmd…]` — connect or create-then-connect, then run the
/// interactive client until detach.
pub fn attach(name: &str, cmd: &[String]) -> Result<()> {
    if std::env::var(paths::ENV_SESSION).is_ok() {
        bail!("already inside session '{}'; detach first",
              std::env::var(paths::ENV_SESSION).unwrap_or_default());
    }
    let group = paths::group();
    let ensured = ensure_session(name, &group, cmd, None)
        .with_context(|| format!("ensuring session '{}'", name))?;
    debug!("session '{}' {:?}", name, ensured);

    let stream = connect_with_retry(name, &group)?;
    client::run_attached(stream)
}

/// `run NAME [cmd…]` — create-if-missing, inject the command through
/// `Run`, exit on `Ack`.
pub fn run(name: &str, cmd: &[String]) -> Result<()> {
    let mut line = if cmd.is_empty() {
        if std::io::stdin().is_terminal() {
            bail!("no command given and stdin is a terminal");
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading command from stdin")?;
        buf
    } else {
        cmd.join(" ")
    };
    if line.trim().is_empty() {
        bail!("empty command");
    }
    if !line.ends_with('\n') {
        line.push('\n');
    }

    let group = paths::group();
    if ensure_session(name, &group, &[], None)? == Ensured::Created {
        debug!("created session '{}' for run", name);
    }

    let live = probe(name, &group)?;
    session::send_frame(&live.stream, Tag::Run, line.as_bytes(), REPLY_TIMEOUT)?;
    expect_reply(&live.stream, Tag::Ack, REPLY_TIMEOUT)?;
    Ok(())
}

/// `detach [NAME]` — ask one session to drop every attached client.
pub fn detach(name: Option<&str>) -> Result<()> {
    let current = std::env::var(paths::ENV_SESSION).ok();
    let name = match name.or(current.as_deref()) {
        Some(n) => n,
        None => bail!("no session named and ZMX_SESSION is unset"),
    };
    let live = probe(name, &paths::group())?;
    session::send_frame(&live.stream, Tag::DetachAll, b"", REPLY_TIMEOUT)?;
    Ok(())
}

/// `detach-all` — drop every client of every live session in the group.
pub fn detach_all() -> Result<()> {
    let group = paths::group();
    for found in session::discover(&group) {
        match probe(&found.name, &group) {
            Ok(live) => {
                session::send_frame(&live.stream, Tag::DetachAll, b"", REPLY_TIMEOUT)?;
            }
            Err(e) => debug!("skipping '{}': {}", found.name, e),
        }
    }
    Ok(())
}

/// `list [--short]` — one row per live session; stale sockets are
/// cleaned up as a side effect of probing.
pub fn list(short: bool) -> Result<()> {
    let sessions = session::discover(&paths::group());
    let mut out = std::io::stdout().lock();
    for found in &sessions {
        if short {
            writeln!(out, "{}", found.name)?;
        } else {
            writeln!(
                out,
                "{:<24} pid {:<8} clients {:<4} {}",
                found.name,
                found.info.pid,
                found.info.clients,
                display_cmd(&found.info.cmd),
            )?;
        }
    }
    Ok(())
}

/// `kill NAME` — terminate the session daemon and its shell.
pub fn kill(name: &str) -> Result<()> {
    let live = probe(name, &paths::group())?;
    session::send_frame(&live.stream, Tag::Kill, b"", REPLY_TIMEOUT)?;
    Ok(())
}

/// `history NAME [--vt|--html]` — fetch the serialized scrollback and
/// write it to stdout.
pub fn history(name: &str, format: SerializeFormat) -> Result<()> {
    let live = probe(name, &paths::group())?;
    session::send_frame(&live.stream, Tag::History, &[format as u8], REPLY_TIMEOUT)?;
    let payload = expect_reply(&live.stream, Tag::History, REPLY_TIMEOUT)?;
    let mut out = std::io::stdout().lock();
    out.write_all(&payload)?;
    if !payload.is_empty() && !payload.ends_with(b"\n") {
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// `info NAME` — print one session's vitals.
pub fn info(name: &str) -> Result<()> {
    let live = probe(name, &paths::group())?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "name:    {}", name)?;
    writeln!(out, "pid:     {}", live.info.pid)?;
    writeln!(out, "clients: {}", live.info.clients)?;
    writeln!(out, "cmd:     {}", display_cmd(&live.info.cmd))?;
    writeln!(out, "cwd:     {}", live.info.cwd)?;
    Ok(())
}

/// `fork [NAME] [--name NEW]` — start a sibling of a running session
/// with the same command and working directory, without attaching.
pub fn fork(source: Option<&str>, new_name: Option<&str>) -> Result<()> {
    let group = paths::group();
    let current = std::env::var(paths::ENV_SESSION).ok();
    let source = match source.or(current.as_deref()) {
        Some(s) => s,
        None => bail!("no source session named and ZMX_SESSION is unset"),
    };
    let live = probe(source, &group)
        .with_context(|| format!("source session '{}'", source))?;

    let new_name = match new_name {
        Some(explicit) => {
            if probe_or_cleanup(explicit, &group).is_ok() {
                return Err(ZmxError::AlreadyExists(explicit.to_string()).into());
            }
            explicit.to_string()
        }
        None => fork_name(source, |candidate| {
            probe_or_cleanup(candidate, &group).is_ok()
        })?,
    };

    let cwd = Path::new(&live.info.cwd);
    let cwd = cwd.is_dir().then_some(cwd);
    ensure_session(&new_name, &group, &live.info.cmd, cwd)
        .with_context(|| format!("creating forked session '{}'", new_name))?;
    println!("{}", new_name);
    Ok(())
}

fn display_cmd(cmd: &[String]) -> String {
    if cmd.is_empty() {
        "(login shell)".to_string()
    } else {
        cmd.join(" ")
    }
}

/// Connect to a session socket, retrying while a freshly forked daemon
/// finishes binding its accept loop.
fn connect_with_retry(name: &str, group: &str) -> Result<UnixStream> {
    let path = paths::socket_path(name, group);
    let start = Instant::now();
    loop {
        match UnixStream::connect(&path) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if start.elapsed() >= CONNECT_TIMEOUT {
                    return Err(e).with_context(|| format!("connecting to session '{}'", name));
                }
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    }
}

/// Wait for a reply frame of the given tag, skipping broadcast traffic
/// (a `Run` client also receives `Output` frames) until the deadline.
fn expect_reply(stream: &UnixStream, want: Tag, deadline: Duration) -> Result<Vec<u8>> {
    let mut buf = SocketBuffer::new();
    let start = Instant::now();
    loop {
        let remaining = deadline
            .checked_sub(start.elapsed())
            .ok_or(ZmxError::Timeout("reply"))?;
        let (tag, payload) = session::recv_frame(stream, &mut buf, remaining)?;
        if tag == want {
            return Ok(payload);
        }
        debug!("skipping {:?} frame while waiting for {:?}", tag, want);
    }
}
