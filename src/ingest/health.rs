use std::time::Duration;

/// Inputs to one periodic health check.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub since_last_message: Duration,
    pub connected: bool,
    pub paused: bool,
    pub memory_pressure: bool,
    pub publisher_enabled: bool,
    pub publisher_connected: bool,
    pub shutting_down: bool,
}

/// Corrective actions decided by a health check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthActions {
    /// Force-close the silent connection so it reconnects.
    pub force_reconnect: bool,
    /// Flush all buffers regardless of size.
    pub force_flush: bool,
    /// Attempt to reconnect the publisher.
    pub reconnect_publisher: bool,
}

/// Decides the corrective actions for one health check.
pub fn evaluate(inputs: &HealthInputs, stale_after: Duration) -> HealthActions {
    HealthActions {
        force_reconnect: inputs.since_last_message > stale_after
            && inputs.connected
            && !inputs.paused
            && !inputs.shutting_down,
        force_flush: inputs.memory_pressure,
        reconnect_publisher: inputs.publisher_enabled
            && !inputs.publisher_connected
            && !inputs.shutting_down,
    }
}
