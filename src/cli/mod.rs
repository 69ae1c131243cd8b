#![allow(clippy::doc_markdown)]

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bdg",
    version,
    about = "Browser telemetry via the Chrome DevTools Protocol",
    long_about = "bdg drives a local Chrome instance via the Chrome DevTools Protocol and makes \
        its activity available to command-line callers and automated agents: network requests, \
        console events, DOM snapshots, and raw CDP. Short-lived commands talk over a unix socket \
        to a background daemon that keeps Chrome and the CDP connection alive between \
        invocations.\n\n\
        Every subcommand produces JSON on stdout and a JSON error envelope on stderr.",
    term_width = 100
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Verbose logging on stderr
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a telemetry session on a URL (launches Chrome and the daemon
    /// as needed)
    Start(StartArgs),

    /// Stop the active session (and the daemon)
    Stop,

    /// Show daemon and session status
    Status,

    /// Peek at the session's recent network and console activity
    Peek(PeekArgs),

    /// Fetch one collected item with bodies and arguments
    Details(DetailsArgs),

    /// Send a raw CDP command through the session
    Cdp(CdpArgs),

    /// DOM snapshot operations
    Dom(DomArgs),

    /// Remove leftover session files and reap a cached Chrome process
    Cleanup,

    /// Run the daemon supervisor (normally started automatically)
    #[command(hide = true)]
    Daemon(DaemonArgs),

    /// Worker entry point (spawned by the daemon)
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),

    /// Render a man page
    Man(ManArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// The URL to navigate to
    pub url: String,

    /// Launch Chrome headless
    #[arg(long)]
    pub headless: bool,

    /// Telemetry to activate (comma-separated: network,console,dom)
    #[arg(long, value_delimiter = ',')]
    pub telemetry: Vec<String>,

    /// Session timeout in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Attach to an externally-managed Chrome via its WebSocket URL
    /// instead of launching one
    #[arg(long)]
    pub attach_ws: Option<String>,

    /// Capture all console output, including dev-server noise
    #[arg(long)]
    pub include_all_console: bool,

    /// Explicit CDP port (an ephemeral port is picked by default)
    #[arg(long)]
    pub cdp_port: Option<u16>,
}

#[derive(Args)]
pub struct PeekArgs {
    /// How many recent items of each kind to return
    #[arg(long)]
    pub last: Option<String>,
}

#[derive(Args)]
pub struct DetailsArgs {
    /// Item kind: network or console
    pub item_type: String,

    /// Item id: the CDP request id for network, the buffer index for
    /// console
    pub id: String,
}

#[derive(Args)]
pub struct CdpArgs {
    /// CDP method, e.g. Page.captureScreenshot
    pub method: String,

    /// Method parameters as a JSON object
    #[arg(long)]
    pub params: Option<String>,
}

#[derive(Args)]
pub struct DomArgs {
    #[command(subcommand)]
    pub command: DomCommand,
}

#[derive(Subcommand)]
pub enum DomCommand {
    /// Capture the current DOM (url, title, outerHTML)
    Snapshot,

    /// Show the most recent cached snapshot (5-minute TTL)
    Last,
}

#[derive(Args)]
pub struct DaemonArgs {
    /// Stay in the foreground (the only supported mode; the CLI detaches
    /// by spawning)
    #[arg(long)]
    pub foreground: bool,
}

#[derive(Args)]
pub struct WorkerArgs {
    /// Worker configuration as a single JSON argument
    pub config: String,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Target shell
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}

#[derive(Args)]
pub struct ManArgs {
    /// Subcommand to render (the top-level page by default)
    pub command: Option<String>,
}
