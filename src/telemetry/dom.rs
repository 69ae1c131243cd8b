use serde_json::json;

use super::store::DomSnapshot;
use crate::cdp::{CdpClient, CdpError};
use crate::config::DOM_SUBCALL_TIMEOUT;

/// Capture a DOM snapshot: document root → outer HTML → title, each
/// sub-call under its own 5-second timeout.
///
/// The title is best-effort and falls back to `"Untitled"`; the URL comes
/// from the page itself so it reflects client-side navigation.
///
/// # Errors
///
/// Returns `CdpError` when the document or its HTML cannot be fetched.
pub async fn capture_dom_snapshot(client: &CdpClient) -> Result<DomSnapshot, CdpError> {
    for domain in ["Page.enable", "DOM.enable", "Runtime.enable"] {
        client
            .send_command_with_timeout(domain, None, DOM_SUBCALL_TIMEOUT)
            .await?;
    }

    let document = client
        .send_command_with_timeout("DOM.getDocument", None, DOM_SUBCALL_TIMEOUT)
        .await?;
    let node_id = document["root"]["nodeId"]
        .as_u64()
        .ok_or_else(|| CdpError::InvalidResponse("DOM.getDocument missing root nodeId".into()))?;

    let outer = client
        .send_command_with_timeout(
            "DOM.getOuterHTML",
            Some(json!({"nodeId": node_id})),
            DOM_SUBCALL_TIMEOUT,
        )
        .await?;
    let outer_html = outer["outerHTML"]
        .as_str()
        .ok_or_else(|| CdpError::InvalidResponse("DOM.getOuterHTML missing outerHTML".into()))?
        .to_string();

    let title = evaluate_string(client, "document.title")
        .await
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let url = evaluate_string(client, "window.location.href")
        .await
        .unwrap_or_default();

    Ok(DomSnapshot {
        url,
        title,
        outer_html,
    })
}

/// The page title, best-effort, with the standard fallback.
pub async fn dom_page_title(client: &CdpClient) -> String {
    evaluate_string(client, "document.title")
        .await
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Evaluate an expression expected to yield a string. Best-effort.
pub(crate) async fn evaluate_string(client: &CdpClient, expression: &str) -> Option<String> {
    let result = client
        .send_command_with_timeout(
            "Runtime.evaluate",
            Some(json!({"expression": expression, "returnByValue": true})),
            DOM_SUBCALL_TIMEOUT,
        )
        .await
        .ok()?;
    result["result"]["value"].as_str().map(String::from)
}
