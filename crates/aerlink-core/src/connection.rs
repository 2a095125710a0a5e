//! Connection supervisor: owns the socket lifecycle.
//!
//! One task per session runs the state machine
//! `Connecting → Authenticating → Connected → (Reconnecting | Disconnected)`:
//! resolve a fresh session over HTTP (tokens are one-shot), open the TCP
//! socket, run the token handshake, then hold a single `select!` loop over
//! inbound frames, the outbound command queue, the keepalive tick, and the
//! idle watchdog. Transient failures loop back through exponential backoff
//! with jitter; auth failures and cancellation stop the task.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aerlink_api::codec::{self, Event};
use aerlink_api::{AccountClient, FrameCodec, Session};

use crate::error::CoreError;
use crate::model::Feature;
use crate::reconcile::Reconciler;
use crate::store::StateStore;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
///
/// `Reconnecting` is deliberately distinct from `Disconnected` so
/// consumers can suppress "offline" alarms during transient drops;
/// `Failed` means retries are exhausted (or disabled) and action is
/// required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread reconnection storms from many clients after
/// a service outage. Deterministically seeded from the attempt number so
/// tests can drive the schedule without real randomness.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(63) as i32);
    let capped = base.min(config.max_delay.as_secs_f64());

    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3).sin());
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Shared task context ──────────────────────────────────────────────

/// Everything the supervisor task needs, shared with the controller.
pub(crate) struct LinkShared {
    pub account: AccountClient,
    pub username: String,
    pub password: SecretString,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub auto_reconnect: bool,
    pub queue_while_reconnecting: bool,
    pub state: watch::Sender<ConnectionState>,
    pub reconciler: Arc<Reconciler>,
    pub store: Arc<StateStore>,
}

impl LinkShared {
    /// Publish a state transition to both the watch channel and the
    /// ordered observer queue.
    async fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        debug!(?state, "connection state");
        self.state.send_replace(state.clone());
        self.reconciler.connection_changed(state).await;
    }
}

/// How a single socket session ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Cancelled,
    /// The server closed the stream cleanly.
    Closed,
}

type FirstResult = Option<oneshot::Sender<Result<(), CoreError>>>;

// ── Supervisor ───────────────────────────────────────────────────────

/// Main loop: connect → run → on transient error, backoff → reconnect.
///
/// `first` resolves the initial `connect()` call: with `Ok` on the first
/// successful handshake, or with the terminal error that stopped the loop.
pub(crate) async fn connection_task(
    shared: Arc<LinkShared>,
    mut commands: mpsc::Receiver<String>,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<(), CoreError>>,
) {
    let mut first: FirstResult = Some(first);
    let mut attempt: u32 = 0;

    loop {
        shared.set_state(ConnectionState::Connecting).await;

        let end = run_session(&shared, &mut commands, &cancel, &mut first, &mut attempt).await;

        if !shared.queue_while_reconnecting {
            discard_queued(&mut commands);
        }

        match end {
            Ok(SessionEnd::Cancelled) => {
                shared.set_state(ConnectionState::Disconnected).await;
                resolve_first(&mut first, Err(CoreError::Cancelled));
                break;
            }
            Ok(SessionEnd::Closed) => {
                if !shared.auto_reconnect {
                    shared.set_state(ConnectionState::Disconnected).await;
                    resolve_first(
                        &mut first,
                        Err(CoreError::ConnectionFailed {
                            reason: "server closed the connection".into(),
                        }),
                    );
                    break;
                }
                info!("server closed the connection, reconnecting");
                attempt = 0;
            }
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "connection stopped");
                shared.set_state(ConnectionState::Disconnected).await;
                resolve_first(&mut first, Err(e));
                break;
            }
            Err(e) => {
                warn!(error = %e, attempt, "connection lost");

                if !shared.auto_reconnect {
                    shared.set_state(ConnectionState::Disconnected).await;
                    resolve_first(&mut first, Err(e));
                    break;
                }

                if let Some(max) = shared.reconnect.max_retries {
                    if attempt >= max {
                        warn!(max_retries = max, "reconnection limit reached, giving up");
                        shared.set_state(ConnectionState::Failed).await;
                        resolve_first(
                            &mut first,
                            Err(CoreError::ConnectionFailed {
                                reason: format!("gave up after {max} reconnect attempts: {e}"),
                            }),
                        );
                        break;
                    }
                }

                let delay = calculate_backoff(attempt, &shared.reconnect);
                shared
                    .set_state(ConnectionState::Reconnecting { attempt })
                    .await;
                info!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        shared.set_state(ConnectionState::Disconnected).await;
                        resolve_first(&mut first, Err(CoreError::Cancelled));
                        break;
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
            }
        }
    }

    debug!("connection supervisor exiting");
}

fn resolve_first(first: &mut FirstResult, result: Result<(), CoreError>) {
    if let Some(tx) = first.take() {
        let _ = tx.send(result);
    }
}

/// Commands are rejected while disconnected, so anything still queued
/// belongs to the session that just died. Drop it rather than replay it
/// against state the device may no longer be in.
fn discard_queued(commands: &mut mpsc::Receiver<String>) {
    let mut dropped = 0_usize;
    while commands.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(dropped, "discarded queued commands from ended session");
    }
}

// ── Single session ───────────────────────────────────────────────────

/// Establish one socket session and run it until it ends.
async fn run_session(
    shared: &LinkShared,
    commands: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
    first: &mut FirstResult,
    attempt: &mut u32,
) -> Result<SessionEnd, CoreError> {
    // Fresh session every time: the token is consumed by the handshake.
    let session: Session = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        resolved = shared
            .account
            .resolve(&shared.username, shared.password.expose_secret()) => resolved?,
    };

    info!(
        host = %session.server_host,
        port = session.server_port,
        "connecting to command server"
    );

    let connect = TcpStream::connect((session.server_host.as_str(), session.server_port));
    let stream = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        connected = tokio::time::timeout(shared.connect_timeout, connect) => match connected {
            Err(_) => {
                return Err(CoreError::Timeout {
                    phase: "connect",
                    timeout: shared.connect_timeout,
                });
            }
            Ok(Err(e)) => {
                return Err(CoreError::ConnectionFailed {
                    reason: format!("connect to {}:{} failed: {e}", session.server_host, session.server_port),
                });
            }
            Ok(Ok(stream)) => stream,
        },
    };

    shared.set_state(ConnectionState::Authenticating).await;

    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec);

    write_half
        .write_all(codec::connect_req(session.token).as_bytes())
        .await
        .map_err(|e| CoreError::ConnectionFailed {
            reason: format!("handshake write failed: {e}"),
        })?;

    tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
        accepted = tokio::time::timeout(shared.auth_timeout, wait_for_acceptance(&mut frames)) => {
            match accepted {
                Err(_) => {
                    return Err(CoreError::Timeout {
                        phase: "authenticate",
                        timeout: shared.auth_timeout,
                    });
                }
                Ok(result) => result?,
            }
        }
    }

    info!("command server accepted the session token");

    // Server acceptance triggers the initial full-state load: the catalog
    // and snapshot that arrived with this session's account exchange.
    shared
        .reconciler
        .apply_session(session.devices, session.snapshot)
        .await;

    shared.set_state(ConnectionState::Connected).await;
    *attempt = 0;
    resolve_first(first, Ok(()));

    steady_loop(shared, &mut frames, &mut write_half, commands, cancel).await
}

/// Consume handshake-phase frames until the server accepts or rejects the
/// token.
async fn wait_for_acceptance(
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
) -> Result<(), CoreError> {
    loop {
        match frames.next().await {
            Some(Ok(frame)) => match codec::decode(&frame) {
                Event::AuthAccepted => return Ok(()),
                Event::AuthRejected { reason } => {
                    return Err(CoreError::AuthenticationFailed {
                        message: format!("command server rejected token: {reason}"),
                    });
                }
                other => debug!(?other, "frame before handshake completed, ignoring"),
            },
            Some(Err(e)) => {
                return Err(CoreError::ConnectionFailed {
                    reason: format!("read failed during handshake: {e}"),
                });
            }
            None => {
                return Err(CoreError::ConnectionFailed {
                    reason: "server closed the connection during handshake".into(),
                });
            }
        }
    }
}

/// The connected steady state: reads, writes, keepalive, idle watchdog.
async fn steady_loop(
    shared: &LinkShared,
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    commands: &mut mpsc::Receiver<String>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, CoreError> {
    let mut last_frame = Instant::now();
    let mut keepalive = tokio::time::interval_at(
        Instant::now() + shared.keepalive_interval,
        shared.keepalive_interval,
    );

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(SessionEnd::Cancelled),

            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    last_frame = Instant::now();
                    match codec::decode(&frame) {
                        Event::Unrecognized => {
                            // Frame-level corruption is isolated to the
                            // frame; the connection stays up.
                            warn!(len = frame.len(), "dropping undecodable frame");
                        }
                        Event::AuthRejected { reason } => {
                            warn!(%reason, "unexpected auth rejection mid-session, ignoring");
                        }
                        event => shared.reconciler.apply_frame(event).await,
                    }
                }
                Some(Err(e)) => {
                    return Err(CoreError::ConnectionFailed {
                        reason: format!("read failed: {e}"),
                    });
                }
                None => return Ok(SessionEnd::Closed),
            },

            command = commands.recv() => match command {
                Some(line) => {
                    write_half
                        .write_all(line.as_bytes())
                        .await
                        .map_err(|e| CoreError::ConnectionFailed {
                            reason: format!("write failed: {e}"),
                        })?;
                    debug!(frame = %line, "sent command");
                }
                // Controller dropped; treat like a disconnect.
                None => return Ok(SessionEnd::Cancelled),
            },

            _ = keepalive.tick() => {
                if let Some(device_id) = shared.store.first_device_id() {
                    let query = codec::status_query(
                        &device_id,
                        Feature::AmbientTemperature.uid(),
                    );
                    write_half
                        .write_all(query.as_bytes())
                        .await
                        .map_err(|e| CoreError::ConnectionFailed {
                            reason: format!("keepalive write failed: {e}"),
                        })?;
                    debug!("sent keepalive query");
                }
            }

            () = tokio::time::sleep_until(last_frame + shared.idle_timeout) => {
                return Err(CoreError::ConnectionFailed {
                    reason: format!(
                        "no traffic for {}s, declaring link stale",
                        shared.idle_timeout.as_secs()
                    ),
                });
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_is_nondecreasing_below_the_ceiling() {
        let config = ReconnectConfig::default();

        let mut previous = Duration::ZERO;
        for attempt in 0..5 {
            let delay = calculate_backoff(attempt, &config);
            assert!(
                delay > previous,
                "delay at attempt {attempt} ({delay:?}) should exceed {previous:?}"
            );
            previous = delay;
        }
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        for attempt in 10..20 {
            let delay = calculate_backoff(attempt, &config);
            // Jitter may add up to 25% above the ceiling, never more.
            assert!(
                delay <= Duration::from_secs_f64(12.5),
                "delay at attempt {attempt} ({delay:?}) should sit near max_delay"
            );
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let config = ReconnectConfig::default();
        let delay = calculate_backoff(u32::MAX, &config);
        assert!(delay <= Duration::from_secs_f64(37.5));
    }
}
