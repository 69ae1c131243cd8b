//! Telemetry collection: bounded buffers fed by CDP event subscriptions,
//! plus the in-process store that snapshots are emitted from.

mod console;
mod dom;
mod navigation;
mod network;
mod store;

pub use console::start_console_collector;
pub use dom::{capture_dom_snapshot, dom_page_title};
pub use navigation::{NavigationHandle, start_navigation_tracker};
pub use network::start_network_collector;
pub use store::{
    ActivitySummary, ConsoleMessage, DomSnapshot, NavigationEvent, NetworkRequest, SharedStore,
    SnapshotMode, TargetSummary, TelemetryStore, emit_snapshot,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// The telemetry kinds a session can activate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryKind {
    Network,
    Console,
    Dom,
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Console => write!(f, "console"),
            Self::Dom => write!(f, "dom"),
        }
    }
}

impl FromStr for TelemetryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Ok(Self::Network),
            "console" => Ok(Self::Console),
            "dom" => Ok(Self::Dom),
            other => Err(format!("unknown telemetry kind: {other}")),
        }
    }
}

/// Append `item` while the buffer is under `max`. Returns whether the item
/// was stored. `on_first_limit` fires exactly once per buffer, the first
/// time an item is refused (`warned` carries that state).
pub fn push_with_limit<T>(
    buf: &mut Vec<T>,
    item: T,
    max: usize,
    warned: &mut bool,
    on_first_limit: impl FnOnce(),
) -> bool {
    if buf.len() < max {
        buf.push(item);
        true
    } else {
        if !*warned {
            *warned = true;
            on_first_limit();
        }
        false
    }
}

/// Handle to a running collector: the cleanup function it registered plus a
/// label for logs.
pub struct CollectorCleanup {
    label: &'static str,
    cleanup_fn: Box<dyn FnOnce() + Send>,
}

impl CollectorCleanup {
    /// Cleanup that aborts the collector's dispatch tasks. Dropping the
    /// tasks also drops their event receivers, which unsubscribes them from
    /// the transport.
    #[must_use]
    pub fn aborting(label: &'static str, handles: Vec<JoinHandle<()>>) -> Self {
        Self::from_fn(label, move || {
            for handle in handles {
                handle.abort();
            }
        })
    }

    /// Cleanup from an arbitrary function.
    #[must_use]
    pub fn from_fn(label: &'static str, f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            cleanup_fn: Box::new(f),
        }
    }

    /// Run the cleanup.
    pub fn cleanup(self) {
        (self.cleanup_fn)();
        tracing::debug!("collector cleaned up: {}", self.label);
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

/// Registry of collector cleanups, run in reverse registration order. Each
/// cleanup is isolated so one failure cannot block the rest.
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Vec<CollectorCleanup>,
}

impl CleanupRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cleanup: CollectorCleanup) {
        self.entries.push(cleanup);
    }

    pub fn run_all(&mut self) {
        while let Some(entry) = self.entries.pop() {
            let label = entry.label();
            // One failing cleanup must not prevent the rest.
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry.cleanup()));
            if result.is_err() {
                tracing::warn!("collector cleanup panicked: {label}");
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
