//! Metric names recorded through the `metrics` facade.
//!
//! No recorder is installed by this crate; an embedding application that
//! installs one gets these series for free.

/// Connections accepted by a transport (counter, labels: transport).
pub const CONNECTIONS_ACCEPTED_TOTAL: &str = "tavern_connections_accepted_total";
/// Connections admitted to the registry (counter).
pub const CONNECTIONS_ADMITTED_TOTAL: &str = "tavern_connections_admitted_total";
/// Registered connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "tavern_connections_active";
/// Connections removed from the registry (counter, labels: reason).
pub const CONNECTIONS_REMOVED_TOTAL: &str = "tavern_connections_removed_total";
/// Handshakes that did not admit their connection (counter).
pub const HANDSHAKE_FAILURES_TOTAL: &str = "tavern_handshake_failures_total";
/// Broadcast payloads a recipient refused (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "tavern_broadcast_drops_total";
/// Inbound payloads handed to the message handler (counter).
pub const MESSAGES_DISPATCHED_TOTAL: &str = "tavern_messages_dispatched_total";
/// Message handler errors and panics (counter).
pub const HANDLER_FAILURES_TOTAL: &str = "tavern_handler_failures_total";
/// Signaling reconnect attempts (counter).
pub const SIGNALING_RECONNECTS_TOTAL: &str = "tavern_signaling_reconnects_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_ACCEPTED_TOTAL,
            CONNECTIONS_ADMITTED_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTIONS_REMOVED_TOTAL,
            HANDSHAKE_FAILURES_TOTAL,
            BROADCAST_DROPS_TOTAL,
            MESSAGES_DISPATCHED_TOTAL,
            HANDLER_FAILURES_TOTAL,
            SIGNALING_RECONNECTS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tavern_"));
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
