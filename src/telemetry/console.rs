use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use super::navigation::NavigationHandle;
use super::store::{ConsoleMessage, SharedStore};
use super::{CollectorCleanup, push_with_limit};
use crate::cdp::{CdpClient, CdpError};
use crate::config::MAX_CONSOLE_MESSAGES;
use crate::timefmt::now_epoch_ms;

/// Well-known dev-server chatter suppressed unless `include_all` is set.
const NOISE_PATTERNS: &[&str] = &[
    "\\[webpack-dev-server\\]*",
    "\\[HMR\\]*",
    "\\[vite\\]*",
    "webpack compiled*",
    "Download the React DevTools*",
];

/// Build the noise-pattern matcher.
fn noise_filter() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in NOISE_PATTERNS {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Flatten CDP `RemoteObject` args into a single text line: primitives
/// stringified, objects via their `description`.
fn format_console_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| {
            if arg["type"].as_str() == Some("string") {
                return arg["value"].as_str().unwrap_or_default().to_string();
            }
            if arg["type"].as_str() == Some("undefined") {
                return "undefined".to_string();
            }
            if let Some(value) = arg.get("value") {
                if !value.is_null() {
                    return serde_json::to_string(value).unwrap_or_default();
                }
            }
            arg["description"]
                .as_str()
                .map_or_else(|| "null".to_string(), String::from)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a console message from `Runtime.consoleAPICalled` params.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn message_from_console_event(params: &Value, navigation_id: u32) -> ConsoleMessage {
    let args: Vec<Value> = params["args"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    ConsoleMessage {
        msg_type: params["type"].as_str().unwrap_or("log").to_string(),
        text: format_console_args(&args),
        timestamp: params["timestamp"]
            .as_f64()
            .map_or_else(now_epoch_ms, |ts| ts as u64),
        args: (!args.is_empty()).then_some(args),
        navigation_id,
    }
}

/// Build an error message from `Runtime.exceptionThrown` params.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn message_from_exception(params: &Value, navigation_id: u32) -> ConsoleMessage {
    let details = &params["exceptionDetails"];
    let text = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("uncaught exception")
        .to_string();
    ConsoleMessage {
        msg_type: "error".to_string(),
        text,
        timestamp: params["timestamp"]
            .as_f64()
            .map_or_else(now_epoch_ms, |ts| ts as u64),
        args: None,
        navigation_id,
    }
}

/// Start the console collector: enables the Runtime domain and captures
/// `consoleAPICalled` plus `exceptionThrown` into the store's bounded
/// buffer, noise-filtered unless `include_all`.
///
/// # Errors
///
/// Returns `CdpError` if the domain cannot be enabled or a subscription
/// fails.
pub async fn start_console_collector(
    client: &Arc<CdpClient>,
    store: SharedStore,
    nav: NavigationHandle,
    include_all: bool,
) -> Result<CollectorCleanup, CdpError> {
    client.send_command("Runtime.enable", None).await?;

    let mut console_rx = client.subscribe("Runtime.consoleAPICalled").await?;
    let mut exception_rx = client.subscribe("Runtime.exceptionThrown").await?;

    let noise = noise_filter();
    let handle = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                event = console_rx.recv() => {
                    let Some(event) = event else { break };
                    let message = message_from_console_event(&event.params, nav.current());
                    if !include_all && noise.is_match(&message.text) {
                        continue;
                    }
                    message
                }
                event = exception_rx.recv() => {
                    let Some(event) = event else { break };
                    message_from_exception(&event.params, nav.current())
                }
            };
            record_message(&store, message);
        }
    });

    Ok(CollectorCleanup::aborting("console", vec![handle]))
}

fn record_message(store: &SharedStore, message: ConsoleMessage) {
    let mut store = store.lock().expect("telemetry store poisoned");
    let now = now_epoch_ms();
    let mut warned = store.console_limit_warned;
    let stored = push_with_limit(
        &mut store.console,
        message,
        MAX_CONSOLE_MESSAGES,
        &mut warned,
        || {
            tracing::warn!(
                "console buffer reached its limit of {MAX_CONSOLE_MESSAGES}; further messages are dropped"
            );
        },
    );
    store.console_limit_warned = warned;
    if stored {
        store.last_console_at = Some(now);
    }
}
