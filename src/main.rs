mod cli;

use clap::{Parser, error::ErrorKind};
use serde::Serialize;
use serde_json::{Value, json};

use bdg::chrome::terminate_process;
use bdg::config::{
    DAEMON_QUERY_TIMEOUT, ENV_WORKER_PROCESS, LAST_QUERY_TTL, START_SESSION_TIMEOUT,
    parse_positive_int,
};
use bdg::daemon::{DaemonClient, run_daemon};
use bdg::error::{AppError, ExitCode};
use bdg::paths::{BdgPaths, atomic_write_json, read_chrome_pid, read_json, remove_file};
use bdg::timefmt::now_epoch_ms;
use bdg::worker::{WorkerConfig, run_worker};

use cli::{
    CdpArgs, Cli, Command, CompletionsArgs, DetailsArgs, DomArgs, DomCommand, ManArgs, PeekArgs,
    StartArgs, WorkerArgs,
};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are informational, not errors
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print().expect("failed to write to stdout");
                std::process::exit(0);
            }
            let app_err = AppError::invalid_arguments(e.kind().to_string());
            app_err.print_json_stderr();
            std::process::exit(app_err.code as i32);
        }
    };

    if let Err(e) = run(&cli).await {
        e.print_json_stderr();
        std::process::exit(e.code as i32);
    }
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    let paths = BdgPaths::resolve()?;

    // Daemon and worker processes additionally log to a file; short-lived
    // commands log to stderr only.
    let process_name = match &cli.command {
        Command::Daemon(_) => Some("daemon"),
        Command::Worker(_) => Some("worker"),
        _ => None,
    };
    bdg::logging::init(paths.root(), process_name, cli.global.verbose);

    match &cli.command {
        Command::Start(args) => execute_start(&paths, cli, args).await,
        Command::Stop => execute_stop(&paths, cli).await,
        Command::Status => execute_status(&paths, cli).await,
        Command::Peek(args) => execute_peek(&paths, cli, args).await,
        Command::Details(args) => execute_details(&paths, cli, args).await,
        Command::Cdp(args) => execute_cdp(&paths, cli, args).await,
        Command::Dom(args) => execute_dom(&paths, cli, args).await,
        Command::Cleanup => execute_cleanup(&paths, cli).await,
        Command::Daemon(_) => run_daemon(paths).await,
        Command::Worker(args) => execute_worker(args).await,
        Command::Completions(args) => execute_completions(args),
        Command::Man(args) => execute_man(args),
    }
}

fn print_json(value: &impl Serialize, pretty: bool) -> Result<(), AppError> {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    let json = json
        .map_err(|e| AppError::new(format!("serialization error: {e}"), ExitCode::GeneralError))?;
    println!("{json}");
    Ok(())
}

/// Strip the RPC envelope fields so only the payload is printed.
fn strip_envelope(mut response: Value) -> Value {
    if let Some(obj) = response.as_object_mut() {
        obj.remove("type");
        obj.remove("sessionId");
        obj.remove("status");
    }
    response
}

// =============================================================================
// Session commands
// =============================================================================

async fn execute_start(paths: &BdgPaths, cli: &Cli, args: &StartArgs) -> Result<(), AppError> {
    url::Url::parse(&args.url).map_err(|e| AppError::invalid_url(&args.url, &e.to_string()))?;

    // Launch-loop guard: a worker process never spawns daemons.
    if std::env::var(ENV_WORKER_PROCESS).is_ok() {
        return Err(AppError::invalid_arguments(
            "refusing to start a session from inside a worker process",
        ));
    }

    let client = DaemonClient::new(paths.clone());
    client.ensure_running().await?;

    let mut extra = json!({"url": args.url});
    if !args.telemetry.is_empty() {
        extra["telemetry"] = json!(args.telemetry);
    }
    if args.headless {
        extra["headless"] = json!(true);
    }
    if let Some(timeout_secs) = args.timeout_secs {
        extra["timeoutSecs"] = json!(timeout_secs);
    }
    if let Some(attach_ws) = &args.attach_ws {
        extra["attachWsUrl"] = json!(attach_ws);
    }
    if args.include_all_console {
        extra["includeAllConsole"] = json!(true);
    }
    if let Some(port) = args.cdp_port {
        extra["cdpPort"] = json!(port);
    }

    let response = client
        .request("start_session_request", extra, START_SESSION_TIMEOUT)
        .await?;
    print_json(&strip_envelope(response), cli.global.pretty)
}

async fn execute_stop(paths: &BdgPaths, cli: &Cli) -> Result<(), AppError> {
    let client = DaemonClient::new(paths.clone());
    let response = client
        .request("stop_session_request", Value::Null, DAEMON_QUERY_TIMEOUT)
        .await?;
    let mut output = strip_envelope(response);
    output["stopped"] = json!(true);
    print_json(&output, cli.global.pretty)
}

async fn execute_status(paths: &BdgPaths, cli: &Cli) -> Result<(), AppError> {
    let client = DaemonClient::new(paths.clone());
    let response = client
        .request("status_request", Value::Null, DAEMON_QUERY_TIMEOUT)
        .await?;
    print_json(&strip_envelope(response), cli.global.pretty)
}

async fn execute_peek(paths: &BdgPaths, cli: &Cli, args: &PeekArgs) -> Result<(), AppError> {
    let mut extra = json!({});
    if let Some(last) = &args.last {
        let last_n = parse_positive_int(last, 1, 10_000)?;
        extra["lastN"] = json!(last_n);
    }

    let client = DaemonClient::new(paths.clone());
    let response = client
        .request("peek_request", extra, DAEMON_QUERY_TIMEOUT)
        .await?;
    print_json(&strip_envelope(response), cli.global.pretty)
}

async fn execute_details(paths: &BdgPaths, cli: &Cli, args: &DetailsArgs) -> Result<(), AppError> {
    if args.item_type != "network" && args.item_type != "console" {
        return Err(AppError::invalid_arguments(format!(
            "item type must be network or console, got {}",
            args.item_type
        )));
    }

    let client = DaemonClient::new(paths.clone());
    let response = client
        .request(
            "worker_details_request",
            json!({"itemType": args.item_type, "id": args.id}),
            DAEMON_QUERY_TIMEOUT,
        )
        .await?;
    print_json(&strip_envelope(response), cli.global.pretty)
}

async fn execute_cdp(paths: &BdgPaths, cli: &Cli, args: &CdpArgs) -> Result<(), AppError> {
    let params: Value = match &args.params {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| AppError::invalid_arguments(format!("bad --params JSON: {e}")))?,
        None => Value::Null,
    };

    let client = DaemonClient::new(paths.clone());
    let response = client
        .request(
            "cdp_call_request",
            json!({"method": args.method, "params": params}),
            DAEMON_QUERY_TIMEOUT,
        )
        .await?;
    print_json(&strip_envelope(response), cli.global.pretty)
}

// =============================================================================
// DOM commands
// =============================================================================

/// Shape of the `last-query.json` cache.
#[derive(Serialize, serde::Deserialize)]
struct LastQueryCache {
    cached_at_ms: u64,
    snapshot: Value,
}

async fn execute_dom(paths: &BdgPaths, cli: &Cli, args: &DomArgs) -> Result<(), AppError> {
    match args.command {
        DomCommand::Snapshot => {
            let client = DaemonClient::new(paths.clone());
            let response = client
                .request("dom_snapshot_request", Value::Null, DAEMON_QUERY_TIMEOUT)
                .await?;
            let snapshot = strip_envelope(response);

            // Cache for follow-up `dom last` calls; non-fatal on failure.
            let cache = LastQueryCache {
                cached_at_ms: now_epoch_ms(),
                snapshot: snapshot.clone(),
            };
            if let Err(e) = atomic_write_json(&paths.last_query(), &cache) {
                tracing::warn!("could not write last-query cache: {e}");
            }

            print_json(&snapshot, cli.global.pretty)
        }
        DomCommand::Last => {
            let cache: LastQueryCache = read_json(&paths.last_query())?
                .ok_or_else(|| AppError::new("no cached snapshot", ExitCode::NotFound))?;
            let age_ms = now_epoch_ms().saturating_sub(cache.cached_at_ms);
            if age_ms > u64::try_from(LAST_QUERY_TTL.as_millis()).unwrap_or(u64::MAX) {
                let _ = remove_file(&paths.last_query());
                return Err(AppError::new(
                    "cached snapshot has expired",
                    ExitCode::NotFound,
                ));
            }
            print_json(&cache.snapshot, cli.global.pretty)
        }
    }
}

// =============================================================================
// Cleanup
// =============================================================================

#[derive(Serialize)]
struct CleanupOutput {
    removed: Vec<String>,
    chrome_killed: Option<u32>,
}

/// Offline artefact reaping: removes files whose owning processes are dead
/// and reaps a cached Chrome instance.
async fn execute_cleanup(paths: &BdgPaths, cli: &Cli) -> Result<(), AppError> {
    use bdg::paths::{pid_alive, read_pid};

    let mut removed = Vec::new();

    let session_alive = read_pid(&paths.session_pid()).is_some_and(pid_alive);
    if !session_alive {
        for path in [
            paths.session_pid(),
            paths.session_meta(),
            paths.session_preview(),
            paths.session_full(),
            paths.session_lock(),
        ] {
            if path.exists() && remove_file(&path).is_ok() {
                removed.push(path.display().to_string());
            }
        }
    }

    let daemon_alive = read_pid(&paths.daemon_pid()).is_some_and(pid_alive);
    if !daemon_alive {
        for path in [paths.daemon_pid(), paths.daemon_lock(), paths.daemon_sock()] {
            if path.exists() && remove_file(&path).is_ok() {
                removed.push(path.display().to_string());
            }
        }
    }

    // The Chrome pid cache survives session teardown exactly for this:
    // reading it yields a live pid or cleans itself up.
    let chrome_killed = match read_chrome_pid(paths) {
        Some(pid) if !session_alive => {
            terminate_process(pid).await;
            let _ = remove_file(&paths.chrome_pid());
            Some(pid)
        }
        _ => None,
    };

    print_json(
        &CleanupOutput {
            removed,
            chrome_killed,
        },
        cli.global.pretty,
    )
}

// =============================================================================
// Hidden entries and docs
// =============================================================================

async fn execute_worker(args: &WorkerArgs) -> Result<(), AppError> {
    let config = WorkerConfig::from_arg(&args.config)?;
    run_worker(config).await
}

#[allow(clippy::unnecessary_wraps)]
fn execute_completions(args: &CompletionsArgs) -> Result<(), AppError> {
    let mut cmd = bdg::command();
    clap_complete::generate(args.shell, &mut cmd, "bdg", &mut std::io::stdout());
    Ok(())
}

fn execute_man(args: &ManArgs) -> Result<(), AppError> {
    let cmd = bdg::command();

    let target = match &args.command {
        None => cmd,
        Some(name) => find_subcommand(&cmd, name)
            .ok_or_else(|| AppError::invalid_arguments(format!("unknown command: {name}")))?,
    };

    let man = clap_mangen::Man::new(target);
    man.render(&mut std::io::stdout()).map_err(|e| {
        AppError::new(
            format!("failed to render man page: {e}"),
            ExitCode::GeneralError,
        )
    })?;
    Ok(())
}

fn find_subcommand(cmd: &clap::Command, name: &str) -> Option<clap::Command> {
    let parent_name = cmd.get_name().to_string();
    for sub in cmd.get_subcommands() {
        if sub.get_name() == name {
            let full_name = format!("{parent_name}-{name}");
            let leaked: &'static str = Box::leak(full_name.into_boxed_str());
            return Some(sub.clone().name(leaked));
        }
    }
    None
}
