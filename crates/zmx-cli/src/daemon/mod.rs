//! Daemon-side machinery: paths, PTY supervision, the VT model, the
//! event loop, and session lifecycle.

pub mod paths;
pub mod pty;
pub mod server;
pub mod session;
pub mod terminal;
