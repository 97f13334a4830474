use std::time::{Duration, Instant};

use tracing::info;

use crate::endpoint::EndpointState;

use super::EndpointStatus;

/// Running counters, only ever observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Bytes read from the device and broadcast.
    pub bytes_from_device: u64,

    /// Bytes read from virtual ports and written to the device.
    pub bytes_to_device: u64,

    /// How many times the device had to be reopened.
    pub device_reconnects: u64,

    /// How many times a virtual port had to be rebuilt.
    pub endpoint_rebuilds: u64,
}

/// Logs [`Stats`] at a fixed wall-clock interval.
#[derive(Debug)]
pub(crate) struct Reporter {
    interval: Duration,
    last: Instant,
}

impl Reporter {
    pub(crate) fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    /// Log if at least one interval passed since the last time.
    /// Returns whether anything was logged.
    pub(crate) fn report_if_due(
        &mut self,
        now: Instant,
        stats: &Stats,
        endpoints: &[EndpointStatus],
    ) -> bool {
        if now.saturating_duration_since(self.last) < self.interval {
            return false;
        }

        let alive = endpoints.iter().filter(|e| e.state.is_alive()).count();
        let idle = endpoints
            .iter()
            .filter(|e| e.state == EndpointState::Idle)
            .count();

        info!(
            bytes_in = stats.bytes_from_device,
            bytes_out = stats.bytes_to_device,
            alive,
            total = endpoints.len(),
            idle,
            reconnects = stats.device_reconnects,
            rebuilds = stats.endpoint_rebuilds,
            "Stats: {} bytes in, {} bytes out, {alive}/{} alive, {idle} idle",
            stats.bytes_from_device,
            stats.bytes_to_device,
            endpoints.len(),
        );

        self.last = now;
        true
    }
}
