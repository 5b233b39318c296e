//! Values of `Message::msg_type`.

pub const APPLY_REQUEST: &str = "apply_request";
pub const APPLY_REPLY: &str = "apply_reply";

pub const BROADCAST_REPLY: &str = "broadcast_reply";

pub const REGISTRATION_REQUEST: &str = "registration_request";
pub const REGISTRATION_REPLY: &str = "registration_reply";
pub const UNREGISTRATION_REQUEST: &str = "unregistration_request";
pub const UNREGISTRATION_REPLY: &str = "unregistration_reply";

pub const CONNECTION_REQUEST: &str = "connection_request";
pub const CONNECTION_REPLY: &str = "connection_reply";
pub const QUEUE_REQUEST: &str = "queue_request";
pub const QUEUE_REPLY: &str = "queue_reply";
pub const RESULT_REQUEST: &str = "result_request";
pub const RESULT_REPLY: &str = "result_reply";
pub const HISTORY_REQUEST: &str = "history_request";
pub const HISTORY_REPLY: &str = "history_reply";
pub const PURGE_REQUEST: &str = "purge_request";
pub const PURGE_REPLY: &str = "purge_reply";
pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
pub const SHUTDOWN_REPLY: &str = "shutdown_reply";

pub const ENGINE_NOTIFICATION: &str = "engine_notification";

/// Reply `msg_type` for a request `msg_type` (`x_request` -> `x_reply`).
pub fn reply_type(request_type: &str) -> String {
    match request_type.strip_suffix("_request") {
        Some(stem) => format!("{stem}_reply"),
        None => format!("{request_type}_reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_type_swaps_suffix() {
        assert_eq!(reply_type(APPLY_REQUEST), APPLY_REPLY);
        assert_eq!(reply_type(QUEUE_REQUEST), QUEUE_REPLY);
        assert_eq!(reply_type("ping"), "ping_reply");
    }
}
