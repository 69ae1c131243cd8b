// Library target exists to expose internal modules for integration tests.
// The binary entry point is in main.rs.

mod cli;

pub mod cdp;
pub mod chrome;
pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod paths;
pub mod readiness;
pub mod rpc;
pub mod telemetry;
pub mod timefmt;
pub mod worker;

/// Returns the clap `Command` definition for man page and completion
/// generation.
#[must_use]
pub fn command() -> clap::Command {
    <cli::Cli as clap::CommandFactory>::command()
}
