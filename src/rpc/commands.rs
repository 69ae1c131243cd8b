/// Worker commands the daemon will forward, declared centrally by name.
///
/// Each `<name>` binds `<name>_request` to `<name>_response` on the wire.
pub const WORKER_COMMANDS: &[&str] = &[
    "worker_peek",
    "worker_status",
    "worker_details",
    "cdp_call",
    "dom_snapshot",
];

/// Extract the registered command name from a `<cmd>_request` or
/// `<cmd>_response` type string. Yields `None` for unregistered commands
/// and for types carrying neither suffix.
#[must_use]
pub fn get_command_name(msg_type: &str) -> Option<&str> {
    let prefix = msg_type
        .strip_suffix("_request")
        .or_else(|| msg_type.strip_suffix("_response"))?;
    WORKER_COMMANDS.contains(&prefix).then_some(prefix)
}

/// Whether this type string is a registered command request.
#[must_use]
pub fn is_command_request(msg_type: &str) -> bool {
    msg_type
        .strip_suffix("_request")
        .is_some_and(|prefix| WORKER_COMMANDS.contains(&prefix))
}

/// Whether this type string is a registered command response.
#[must_use]
pub fn is_command_response(msg_type: &str) -> bool {
    msg_type
        .strip_suffix("_response")
        .is_some_and(|prefix| WORKER_COMMANDS.contains(&prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_request_types_resolve() {
        assert_eq!(get_command_name("worker_peek_request"), Some("worker_peek"));
        assert_eq!(get_command_name("cdp_call_request"), Some("cdp_call"));
        assert_eq!(
            get_command_name("dom_snapshot_response"),
            Some("dom_snapshot")
        );
    }

    #[test]
    fn unregistered_types_yield_none() {
        assert_eq!(get_command_name("status_request"), None);
        assert_eq!(get_command_name("worker_peek"), None);
        assert_eq!(get_command_name("made_up_request"), None);
        assert_eq!(get_command_name(""), None);
    }

    #[test]
    fn suffix_guards_are_exact() {
        assert!(is_command_request("worker_status_request"));
        assert!(!is_command_request("worker_status_response"));
        assert!(is_command_response("worker_status_response"));
        assert!(!is_command_response("worker_status_request"));
        // A registered name with extra trailing text does not match.
        assert!(!is_command_request("worker_status_requests"));
    }
}
