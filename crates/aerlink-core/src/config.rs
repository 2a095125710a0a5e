// ── Runtime connection configuration ──
//
// Describes *how* to reach the cloud service and how the connection should
// behave. Carries credential data and tuning, never touches disk — the
// embedding application builds one and hands it in.

use std::time::Duration;

use secrecy::SecretString;

use aerlink_api::AccountService;

use crate::connection::ReconnectConfig;

/// Configuration for one controller session.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Which account service to authenticate against.
    pub service: AccountService,
    /// Account username.
    pub username: String,
    /// Account password.
    pub password: SecretString,
    /// Bound on the TCP connect to the command server.
    pub connect_timeout: Duration,
    /// Bound on the socket token handshake.
    pub auth_timeout: Duration,
    /// How often to nudge the command server when the link is quiet.
    /// The service answers every query, refreshing the idle clock.
    pub keepalive_interval: Duration,
    /// No frame for this long declares the link stale and reconnects.
    pub idle_timeout: Duration,
    /// Backoff policy between reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Reconnect automatically on transient failures. When disabled, any
    /// drop lands in `Disconnected` and stays there.
    pub auto_reconnect: bool,
    /// Commands issued while the link is down are rejected with
    /// `NotConnected` by default. Enabling this queues them instead and
    /// replays the queue once the link is back — opt-in, since replaying
    /// stale commands against fresh device state can surprise.
    pub queue_while_reconnecting: bool,
    /// How long a sent command waits for its echo before the pending
    /// record is dropped.
    pub pending_command_timeout: Duration,
    /// Capacity of the observer dispatch queue. The read loop blocks once
    /// this many updates are waiting on a slow observer.
    pub update_queue_capacity: usize,
}

impl ControllerConfig {
    /// Config for the given service and credentials, default tuning.
    pub fn new(
        service: AccountService,
        username: impl Into<String>,
        password: impl Into<SecretString>,
    ) -> Self {
        Self {
            service,
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            service: AccountService::intesis_home(),
            username: String::new(),
            password: SecretString::from(String::new()),
            connect_timeout: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(240),
            idle_timeout: Duration::from_secs(300),
            reconnect: ReconnectConfig::default(),
            auto_reconnect: true,
            queue_while_reconnecting: false,
            pending_command_timeout: Duration::from_secs(30),
            update_queue_capacity: 256,
        }
    }
}
