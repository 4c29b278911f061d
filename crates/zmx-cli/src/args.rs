//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

use zmx_core::frame::SerializeFormat;

/// Terminal session persistence.
///
/// Each session is a background daemon owning a shell on a PTY. Clients
/// attach and detach at will; the shell keeps running in between, and a
/// re-attach repaints the live screen.
#[derive(Debug, Parser)]
#[command(name = "zmx", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Attach to a session, creating it first if needed
    #[command(after_help = "\
Examples:
  zmx attach main                  # Login shell session named 'main'
  zmx attach build cargo watch     # Session running a command
  zmx attach main                  # Later: re-attach, screen restored

Detach with Ctrl+\\; the shell keeps running.")]
    Attach(AttachArgs),

    /// Inject a command into a session without attaching
    #[command(after_help = "\
Examples:
  zmx run build -- cargo build --release
  echo 'make deploy' | zmx run ops")]
    Run(RunArgs),

    /// Detach every client from one session
    Detach(DetachArgs),

    /// Detach every client from every session in the group
    DetachAll,

    /// List live sessions, cleaning up stale sockets on the way
    List(ListArgs),

    /// Terminate a session and its shell
    Kill(KillArgs),

    /// Print a session's scrollback
    History(HistoryArgs),

    /// Show one session's pid, clients, command, and directory
    Info(InfoArgs),

    /// Clone a running session's command and directory into a new one
    #[command(after_help = "\
Examples:
  zmx fork                         # Inside a session: sibling of $ZMX_SESSION
  zmx fork build                   # Sibling of 'build', named build-1, build-2, ...
  zmx fork build --name build-hot  # Explicit name for the new session")]
    Fork(ForkArgs),
}

#[derive(Debug, clap::Args)]
pub struct AttachArgs {
    /// Session name
    pub name: String,

    /// Command to run instead of the login shell
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Session name
    pub name: String,

    /// Command line to inject; read from stdin when omitted and stdin
    /// is not a terminal
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, clap::Args)]
pub struct DetachArgs {
    /// Session name [default: $ZMX_SESSION]
    pub name: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct ListArgs {
    /// Print names only
    #[arg(long)]
    pub short: bool,
}

#[derive(Debug, clap::Args)]
pub struct KillArgs {
    /// Session name
    pub name: String,
}

#[derive(Debug, clap::Args)]
pub struct HistoryArgs {
    /// Session name
    pub name: String,

    /// Emit a terminal escape stream instead of plain text
    #[arg(long, conflicts_with = "html")]
    pub vt: bool,

    /// Emit styled HTML instead of plain text
    #[arg(long)]
    pub html: bool,
}

impl HistoryArgs {
    pub fn format(&self) -> SerializeFormat {
        if self.vt {
            SerializeFormat::Vt
        } else if self.html {
            SerializeFormat::Html
        } else {
            SerializeFormat::Plain
        }
    }
}

#[derive(Debug, clap::Args)]
pub struct InfoArgs {
    /// Session name
    pub name: String,
}

#[derive(Debug, clap::Args)]
pub struct ForkArgs {
    /// Source session [default: $ZMX_SESSION]
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,

    /// Name for the new session [default: SOURCE-N]
    #[arg(long = "name", value_name = "NEW")]
    pub new_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn attach_parses_trailing_command() {
        let cli = Cli::parse_from(["zmx", "attach", "build", "cargo", "watch", "-x", "check"]);
        match cli.command {
            Commands::Attach(args) => {
                assert_eq!(args.name, "build");
                assert_eq!(args.command, vec!["cargo", "watch", "-x", "check"]);
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn attach_without_command_is_login_shell() {
        let cli = Cli::parse_from(["zmx", "attach", "main"]);
        match cli.command {
            Commands::Attach(args) => assert!(args.command.is_empty()),
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn history_format_flags() {
        let cli = Cli::parse_from(["zmx", "history", "main"]);
        let Commands::History(args) = cli.command else {
            panic!("expected history");
        };
        assert_eq!(args.format(), SerializeFormat::Plain);

        let cli = Cli::parse_from(["zmx", "history", "main", "--vt"]);
        let Commands::History(args) = cli.command else {
            panic!("expected history");
        };
        assert_eq!(args.format(), SerializeFormat::Vt);

        let cli = Cli::parse_from(["zmx", "history", "main", "--html"]);
        let Commands::History(args) = cli.command else {
            panic!("expected history");
        };
        assert_eq!(args.format(), SerializeFormat::Html);

        assert!(Cli::try_parse_from(["zmx", "history", "main", "--vt", "--html"]).is_err());
    }

    #[test]
    fn fork_source_and_new_name() {
        let cli = Cli::parse_from(["zmx", "fork", "build", "--name", "build-hot"]);
        let Commands::Fork(args) = cli.command else {
            panic!("expected fork");
        };
        assert_eq!(args.source.as_deref(), Some("build"));
        assert_eq!(args.new_name.as_deref(), Some("build-hot"));

        let cli = Cli::parse_from(["zmx", "fork"]);
        let Commands::Fork(args) = cli.command else {
            panic!("expected fork");
        };
        assert!(args.source.is_none());
        assert!(args.new_name.is_none());
    }

    #[test]
    fn list_short_flag() {
        let cli = Cli::parse_from(["zmx", "list", "--short"]);
        let Commands::List(args) = cli.command else {
            panic!("expected list");
        };
        assert!(args.short);
    }
}
