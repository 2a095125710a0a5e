// ── Core error types ──
//
// User-facing errors from aerlink-core. Consumers never see raw reqwest or
// serde failures; the `From<aerlink_api::Error>` impl translates wire-layer
// errors into domain-appropriate variants.

use std::time::Duration;

use thiserror::Error;

use crate::model::{DeviceId, Feature};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Session / connection ─────────────────────────────────────────
    /// The account service or the command server rejected our credentials.
    /// Terminal for the current connect attempt; never auto-retried.
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// The account service could not be reached. Transient.
    #[error("Account service unreachable: {reason}")]
    Unreachable { reason: String },

    /// The account service answered with something we cannot parse.
    #[error("Malformed service response: {message}")]
    ServiceProtocol { message: String },

    /// Socket-level failure (refused, reset, stale link). Transient;
    /// drives the reconnect path when auto-reconnect is enabled.
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// A bounded connect/handshake phase ran out of time.
    #[error("{phase} timed out after {}s", .timeout.as_secs())]
    Timeout {
        phase: &'static str,
        timeout: Duration,
    },

    /// A command was attempted with no live connection.
    #[error("Not connected to the command server")]
    NotConnected,

    /// `disconnect()` interrupted a suspended operation.
    #[error("Operation cancelled")]
    Cancelled,

    // ── Data ─────────────────────────────────────────────────────────
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    /// The device has never reported this datapoint (or reported the null
    /// sentinel).
    #[error("No value for {feature} on device {device_id}")]
    ValueUnavailable {
        device_id: DeviceId,
        feature: Feature,
    },

    /// Caller-supplied value outside the feature's legal domain. Surfaced
    /// synchronously, before any byte reaches the wire.
    #[error("Value {value} is outside the legal domain for {feature} (allowed: {allowed})")]
    Domain {
        feature: Feature,
        value: String,
        allowed: String,
    },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Terminal errors stop the reconnect loop and surface to the caller;
    /// everything else is transient and retried under backoff.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. } | Self::ServiceProtocol { .. } | Self::Cancelled
        )
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<aerlink_api::Error> for CoreError {
    fn from(err: aerlink_api::Error) -> Self {
        match err {
            aerlink_api::Error::InvalidCredentials { message } => {
                CoreError::AuthenticationFailed { message }
            }
            aerlink_api::Error::Unreachable(e) => CoreError::Unreachable {
                reason: e.to_string(),
            },
            aerlink_api::Error::MalformedResponse { message } => {
                CoreError::ServiceProtocol { message }
            }
        }
    }
}
