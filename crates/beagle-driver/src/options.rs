//! Driver construction options.
//!
//! All tuning knobs live in one explicit struct passed to constructors.
//! [`DriverOptions::from_env`] computes values from `BEAGLE_USB_*` variables
//! once at startup; nothing reads the environment after construction.

use std::time::Duration;

/// How the driver routes data streams onto USB endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingMode {
    /// One endpoint per stream; the device hardware describes where each
    /// transfer belongs.
    MultipleEndpointsHardwareControl,
    /// One endpoint per stream; the host prepends software hints.
    MultipleEndpointsSoftwareQuery,
    /// Everything multiplexed over a single bulk-out/bulk-in pair with
    /// software hints.
    SingleEndpoint,
}

impl OperatingMode {
    /// Parse the numeric encoding used by the environment variable.
    #[must_use]
    pub const fn from_env_value(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::MultipleEndpointsHardwareControl),
            1 => Some(Self::MultipleEndpointsSoftwareQuery),
            2 => Some(Self::SingleEndpoint),
            _ => None,
        }
    }

    /// Whether transfers in this mode carry software hint headers.
    #[must_use]
    pub const fn uses_software_hints(self) -> bool {
        matches!(
            self,
            Self::MultipleEndpointsSoftwareQuery | Self::SingleEndpoint
        )
    }
}

/// Options controlling transfer sizing, queuing, and overlap.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Endpoint routing mode.
    pub mode: OperatingMode,
    /// Largest single bulk-out chunk, in bytes. Larger payloads are split.
    pub max_bulk_out_chunk_size: usize,
    /// Maximum in-flight async transfers per device; submissions beyond this
    /// fail with resource exhaustion.
    pub max_async_transfers: usize,
    /// Allow a bulk-in transfer to be in flight while bulk-out is active.
    /// Overlap is opt-in; the default serializes.
    pub enable_overlapping_bulk_in_and_out: bool,
    /// Allow multiple outstanding requests on the same direction.
    pub enable_overlapping_requests: bool,
    /// Completed-but-unconsumed bulk-in buffers to hold before backpressure.
    pub bulk_in_queue_capacity: usize,
    /// Default timeout substituted by the command layers.
    pub default_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            mode: OperatingMode::SingleEndpoint,
            max_bulk_out_chunk_size: 1024 * 1024,
            max_async_transfers: 3,
            enable_overlapping_bulk_in_and_out: false,
            enable_overlapping_requests: false,
            bulk_in_queue_capacity: 32,
            default_timeout: Duration::from_millis(6000),
        }
    }
}

impl DriverOptions {
    /// Build options from `BEAGLE_USB_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    ///
    /// Recognized variables:
    /// - `BEAGLE_USB_OPERATING_MODE` (0, 1, 2)
    /// - `BEAGLE_USB_MAX_BULK_OUT_CHUNK_SIZE` (bytes)
    /// - `BEAGLE_USB_MAX_ASYNC_TRANSFERS`
    /// - `BEAGLE_USB_ENABLE_OVERLAPPING_BULK_IN_AND_OUT` (0/1)
    /// - `BEAGLE_USB_ENABLE_OVERLAPPING_REQUESTS` (0/1)
    /// - `BEAGLE_USB_BULK_IN_QUEUE_CAPACITY`
    /// - `BEAGLE_USB_TIMEOUT_MS`
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mode = env_u64("BEAGLE_USB_OPERATING_MODE")
            .and_then(OperatingMode::from_env_value)
            .unwrap_or(defaults.mode);

        let max_bulk_out_chunk_size = env_u64("BEAGLE_USB_MAX_BULK_OUT_CHUNK_SIZE")
            .map_or(defaults.max_bulk_out_chunk_size, |v| v as usize);

        let max_async_transfers = env_u64("BEAGLE_USB_MAX_ASYNC_TRANSFERS")
            .map_or(defaults.max_async_transfers, |v| (v as usize).max(1));

        let enable_overlapping_bulk_in_and_out =
            env_bool("BEAGLE_USB_ENABLE_OVERLAPPING_BULK_IN_AND_OUT")
                .unwrap_or(defaults.enable_overlapping_bulk_in_and_out);

        let enable_overlapping_requests = env_bool("BEAGLE_USB_ENABLE_OVERLAPPING_REQUESTS")
            .unwrap_or(defaults.enable_overlapping_requests);

        let bulk_in_queue_capacity = env_u64("BEAGLE_USB_BULK_IN_QUEUE_CAPACITY")
            .map_or(defaults.bulk_in_queue_capacity, |v| (v as usize).max(1));

        let default_timeout = env_u64("BEAGLE_USB_TIMEOUT_MS")
            .map_or(defaults.default_timeout, Duration::from_millis);

        let options = Self {
            mode,
            max_bulk_out_chunk_size,
            max_async_transfers,
            enable_overlapping_bulk_in_and_out,
            enable_overlapping_requests,
            bulk_in_queue_capacity,
            default_timeout,
        };

        tracing::debug!("Driver options: {options:?}");
        options
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {name}={raw:?}");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env_u64(name).map(|v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let options = DriverOptions::default();
        assert_eq!(options.mode, OperatingMode::SingleEndpoint);
        assert!(!options.enable_overlapping_bulk_in_and_out);
        assert!(!options.enable_overlapping_requests);
        assert_eq!(options.default_timeout, Duration::from_millis(6000));
    }

    #[test]
    fn mode_encoding() {
        assert_eq!(
            OperatingMode::from_env_value(0),
            Some(OperatingMode::MultipleEndpointsHardwareControl)
        );
        assert_eq!(
            OperatingMode::from_env_value(2),
            Some(OperatingMode::SingleEndpoint)
        );
        assert_eq!(OperatingMode::from_env_value(7), None);
    }

    #[test]
    fn software_hint_modes() {
        assert!(OperatingMode::SingleEndpoint.uses_software_hints());
        assert!(OperatingMode::MultipleEndpointsSoftwareQuery.uses_software_hints());
        assert!(!OperatingMode::MultipleEndpointsHardwareControl.uses_software_hints());
    }
}
