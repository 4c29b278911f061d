//! Socket and log path resolution.
//!
//! Priority for the socket root:
//! 1. `ZMX_DIR` (explicit override)
//! 2. `XDG_STATE_HOME/zmx`
//! 3. `~/.local/state/zmx`
//!
//! Priority for the log root:
//! 1. `ZMX_LOG_DIR`
//! 2. `XDG_LOG_HOME/zmx`
//! 3. `~/.local/logs/zmx`
//!
//! Sessions are grouped under `{root}/{group}`; the group comes from
//! `ZMX_GROUP` (default `"default"`). Each live session is one socket
//! file `{socket_root}/{group}/{encoded_name}` and one log file
//! `{log_root}/{group}/{encoded_name}.log`.

use std::env;
use std::path::PathBuf;

use zmx_core::name::{encode_name, valid_group};

/// Environment variable the daemon sets in the spawned shell.
pub const ENV_SESSION: &str = "ZMX_SESSION";
/// Environment variable naming the session group.
pub const ENV_GROUP: &str = "ZMX_GROUP";

fn env_dir(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => None,
    }
}

/// Root directory holding per-group socket directories.
pub fn socket_root() -> PathBuf {
    if let Some(dir) = env_dir("ZMX_DIR") {
        return dir;
    }
    if let Some(state) = env_dir("XDG_STATE_HOME") {
        return state.join("zmx");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local/state/zmx");
    }
    env::temp_dir().join("zmx")
}

/// Root directory holding per-group log directories.
pub fn log_root() -> PathBuf {
    if let Some(dir) = env_dir("ZMX_LOG_DIR") {
        return dir;
    }
    if let Some(logs) = env_dir("XDG_LOG_HOME") {
        return logs.join("zmx");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".local/logs/zmx");
    }
    env::temp_dir().join("zmx-logs")
}

/// Current group from `ZMX_GROUP`, falling back to `"default"` when the
/// variable is unset or names something unusable as a path component.
pub fn group() -> String {
    match env::var(ENV_GROUP) {
        Ok(g) if valid_group(&g) => g,
        Ok(g) if !g.is_empty() => {
            tracing::warn!("ignoring invalid group name {:?}, using 'default'", g);
            "default".to_string()
        }
        _ => "default".to_string(),
    }
}

/// Socket path for one session.
pub fn socket_path(name: &str, group: &str) -> PathBuf {
    socket_root().join(group).join(encode_name(name))
}

/// Per-session log path.
pub fn log_path(name: &str, group: &str) -> PathBuf {
    log_root().join(group).join(format!("{}.log", encode_name(name)))
}

/// Global daemon breadcrumb log.
pub fn global_log_path() -> PathBuf {
    log_root().join("zmx.log")
}

/// Create the socket and log trees for a group.
pub fn ensure_dirs(group: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(socket_root().join(group))?;
    std::fs::create_dir_all(log_root().join(group))?;
    Ok(())
}
