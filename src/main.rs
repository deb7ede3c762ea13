//! Binary entry point for the `zvle` command-line tool.

use clap::Parser;

use zvle::cli::args::Cli;
use zvle::cli::commands;
use zvle::cli::logging::{init_subscriber, Verbosity};

fn main() {
    let cli = Cli::parse();
    init_subscriber(Verbosity::from_flags(cli.verbose, cli.quiet));
    if let Err(error) = commands::run(cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}
