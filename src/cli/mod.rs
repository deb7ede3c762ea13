//! Command-line interface for the `zvle` binary.
//!
//! | Submodule    | Responsibility |
//! |--------------|---------------|
//! | [`args`]     | `clap` definitions of the global flags and the `map` / `cat` subcommands. |
//! | [`logging`]  | `tracing-subscriber` setup from `-v` / `-q`, `ZVLE_LOG` and `RUST_LOG`. |
//! | [`commands`] | Opening an image and running each subcommand. |
//!
//! Typical call sequence: `Cli::parse` → `logging::init_subscriber` → `commands::run`.

pub mod args;
pub mod commands;
pub mod logging;
