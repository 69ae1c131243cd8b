use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::navigation::NavigationHandle;
use super::store::{NetworkRequest, SharedStore};
use super::{CollectorCleanup, push_with_limit};
use crate::cdp::{CdpClient, CdpError};
use crate::config::{
    MAX_NETWORK_REQUESTS, MAX_RESPONSE_BODY_BYTES, STALE_REQUEST_AGE, STALE_SWEEP_INTERVAL,
};
use crate::timefmt::{cdp_seconds_to_epoch_ms, now_epoch_ms};

/// MIME classes whose response bodies are captured. Images and fonts are
/// deliberately excluded.
const TEXT_LIKE_MIME: &[&str] = &["json", "javascript", "text", "xml", "html"];

fn is_text_like(mime: &str) -> bool {
    let lower = mime.to_ascii_lowercase();
    TEXT_LIKE_MIME.iter().any(|kind| lower.contains(kind))
}

/// Truncate a body to the per-resource cap at a char boundary.
fn cap_body(mut body: String) -> String {
    if body.len() > MAX_RESPONSE_BODY_BYTES {
        let mut cut = MAX_RESPONSE_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

/// Build the initial request record from `Network.requestWillBeSent` params.
fn request_from_params(params: &Value, navigation_id: u32) -> Option<NetworkRequest> {
    let request_id = params["requestId"].as_str()?.to_string();
    let request = &params["request"];
    Some(NetworkRequest {
        request_id,
        url: request["url"].as_str().unwrap_or_default().to_string(),
        method: request["method"].as_str().unwrap_or("GET").to_string(),
        timestamp: params["wallTime"]
            .as_f64()
            .map_or_else(now_epoch_ms, cdp_seconds_to_epoch_ms),
        status: None,
        mime_type: None,
        request_headers: request.get("headers").cloned(),
        response_headers: None,
        request_body: request["postData"].as_str().map(String::from),
        response_body: None,
        navigation_id,
        failed: false,
    })
}

/// Start the network collector: enables the Network domain, subscribes to
/// the request lifecycle events, and spawns the dispatch task that
/// correlates them into the store's bounded buffer.
///
/// # Errors
///
/// Returns `CdpError` if the domain cannot be enabled or a subscription
/// fails; nothing is left running in that case.
pub async fn start_network_collector(
    client: Arc<CdpClient>,
    store: SharedStore,
    nav: NavigationHandle,
) -> Result<CollectorCleanup, CdpError> {
    client.send_command("Network.enable", None).await?;

    let mut sent_rx = client.subscribe("Network.requestWillBeSent").await?;
    let mut resp_rx = client.subscribe("Network.responseReceived").await?;
    let mut fin_rx = client.subscribe("Network.loadingFinished").await?;
    let mut fail_rx = client.subscribe("Network.loadingFailed").await?;

    let handle = tokio::spawn(async move {
        // In-flight requests by CDP id, with arrival instants for the sweeper.
        let mut in_flight: HashMap<String, (NetworkRequest, Instant)> = HashMap::new();
        let mut sweeper = tokio::time::interval(STALE_SWEEP_INTERVAL);
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweeper.tick().await;

        loop {
            tokio::select! {
                event = sent_rx.recv() => {
                    let Some(event) = event else { break };
                    if let Some(request) = request_from_params(&event.params, nav.current()) {
                        in_flight.insert(
                            request.request_id.clone(),
                            (request, Instant::now()),
                        );
                    }
                }
                event = resp_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(id) = event.params["requestId"].as_str() else { continue };
                    if let Some((request, _)) = in_flight.get_mut(id) {
                        let response = &event.params["response"];
                        request.status = response["status"]
                            .as_u64()
                            .and_then(|s| u16::try_from(s).ok());
                        request.mime_type =
                            response["mimeType"].as_str().map(String::from);
                        request.response_headers = response.get("headers").cloned();
                    }
                }
                event = fin_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(id) = event.params["requestId"].as_str() else { continue };
                    let Some((mut request, _)) = in_flight.remove(id) else { continue };
                    if request
                        .mime_type
                        .as_deref()
                        .is_some_and(is_text_like)
                    {
                        request.response_body =
                            fetch_body(&client, &request.request_id).await;
                    }
                    finish_request(&store, request);
                }
                event = fail_rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(id) = event.params["requestId"].as_str() else { continue };
                    let Some((mut request, _)) = in_flight.remove(id) else { continue };
                    request.status = Some(0);
                    request.failed = true;
                    finish_request(&store, request);
                }
                _ = sweeper.tick() => {
                    let before = in_flight.len();
                    in_flight.retain(|_, (_, arrived)| arrived.elapsed() < STALE_REQUEST_AGE);
                    let evicted = before - in_flight.len();
                    if evicted > 0 {
                        tracing::debug!("evicted {evicted} stale in-flight requests");
                    }
                }
            }
        }
    });

    Ok(CollectorCleanup::aborting("network", vec![handle]))
}

/// Fetch a response body via `Network.getResponseBody`, decoding base64
/// payloads and applying the per-resource cap. Failures yield `None` — one
/// bad body never disturbs the event stream.
async fn fetch_body(client: &CdpClient, request_id: &str) -> Option<String> {
    let result = client
        .send_command(
            "Network.getResponseBody",
            Some(json!({"requestId": request_id})),
        )
        .await
        .ok()?;
    let body = result["body"].as_str()?;
    let decoded = if result["base64Encoded"].as_bool().unwrap_or(false) {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .ok()?;
        String::from_utf8(bytes).ok()?
    } else {
        body.to_string()
    };
    Some(cap_body(decoded))
}

fn finish_request(store: &SharedStore, request: NetworkRequest) {
    let mut store = store.lock().expect("telemetry store poisoned");
    let now = now_epoch_ms();
    let mut warned = store.network_limit_warned;
    let stored = push_with_limit(
        &mut store.network,
        request,
        MAX_NETWORK_REQUESTS,
        &mut warned,
        || {
            tracing::warn!(
                "network buffer reached its limit of {MAX_NETWORK_REQUESTS}; further requests are dropped"
            );
        },
    );
    store.network_limit_warned = warned;
    if stored {
        store.last_network_at = Some(now);
    }
}
