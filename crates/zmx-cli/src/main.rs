//! zmx CLI and daemon entry point.
//!
//! Every subcommand starts life as a CLI process; `attach` and `run`
//! may fork a session daemon along the way, and the forked child never
//! returns here.

mod args;
mod client;
mod commands;
mod daemon;

use clap::Parser;
use tracing::error;

use crate::args::{Cli, Commands};

fn main() {
    // One subscriber for both roles: the CLI writes to stderr, and a
    // forked daemon re-points stderr at its session log before it says
    // anything interesting. ANSI stays off so the log files are clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Attach(args) => commands::attach(&args.name, &args.command),
        Commands::Run(args) => commands::run(&args.name, &args.command),
        Commands::Detach(args) => commands::detach(args.name.as_deref()),
        Commands::DetachAll => commands::detach_all(),
        Commands::List(args) => commands::list(args.short),
        Commands::Kill(args) => commands::kill(&args.name),
        Commands::History(args) => commands::history(&args.name, args.format()),
        Commands::Info(args) => commands::info(&args.name),
        Commands::Fork(args) => {
            commands::fork(args.source.as_deref(), args.new_name.as_deref())
        }
    }
}
