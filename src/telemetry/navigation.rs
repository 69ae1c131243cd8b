use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::store::{NavigationEvent, SharedStore};
use super::CollectorCleanup;
use crate::cdp::{CdpClient, CdpError};
use crate::timefmt::now_epoch_ms;

/// Shared view of the current navigation id. Collectors read it to tag
/// their items; only the navigation tracker advances it.
#[derive(Debug, Clone, Default)]
pub struct NavigationHandle {
    current: Arc<AtomicU32>,
}

impl NavigationHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The id items observed now should be tagged with.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    fn store(&self, id: u32) {
        self.current.store(id, Ordering::Relaxed);
    }
}

/// Start the navigation tracker: enables the Page domain and records every
/// main-frame (`parentId`-less) `frameNavigated`.
///
/// The id starts at 0 and the worker's own initial navigation keeps it: the
/// first main-frame event fills in navigation 0's URL, and each subsequent
/// one increments the counter. Items tagged `navigationId == n` were
/// therefore observed no earlier than navigation `n`.
///
/// # Errors
///
/// Returns `CdpError` if the Page domain cannot be enabled or the
/// subscription fails.
pub async fn start_navigation_tracker(
    client: &Arc<CdpClient>,
    store: SharedStore,
    nav: NavigationHandle,
) -> Result<CollectorCleanup, CdpError> {
    client.send_command("Page.enable", None).await?;
    let mut nav_rx = client.subscribe("Page.frameNavigated").await?;

    let handle = tokio::spawn(async move {
        let mut first_seen = false;
        while let Some(event) = nav_rx.recv().await {
            let frame = &event.params["frame"];
            if frame.get("parentId").is_some_and(|p| !p.is_null()) {
                continue; // sub-frame navigation
            }
            let url = frame["url"].as_str().unwrap_or_default().to_string();
            let navigation_id = if first_seen {
                nav.current() + 1
            } else {
                first_seen = true;
                nav.current()
            };
            nav.store(navigation_id);

            let mut guard = store.lock().expect("telemetry store poisoned");
            guard.navigations.push(NavigationEvent {
                url,
                timestamp: now_epoch_ms(),
                navigation_id,
            });
        }
    });

    Ok(CollectorCleanup::aborting("navigation", vec![handle]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_starts_at_zero() {
        let nav = NavigationHandle::new();
        assert_eq!(nav.current(), 0);
    }

    #[test]
    fn handle_is_shared_between_clones() {
        let nav = NavigationHandle::new();
        let clone = nav.clone();
        nav.store(5);
        assert_eq!(clone.current(), 5);
    }
}
