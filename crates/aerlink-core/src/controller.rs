// ── Controller abstraction ──
//
// Full lifecycle management for one cloud climate session: connect,
// command routing with domain validation, reactive state access, and
// observer registration. Cheaply cloneable via `Arc`.

use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use aerlink_api::{AccountClient, codec};

use crate::config::ControllerConfig;
use crate::connection::{ConnectionState, LinkShared, connection_task};
use crate::error::CoreError;
use crate::model::{
    Device, DeviceId, Feature, Mode, Value, decode_value, fan_command_value, fan_map, labels,
    power_command_value, power_labels, preset_command_value, preset_labels, vane_command_value,
    vane_labels, wire_u16,
};
use crate::observer::{CallbackId, Observers, Update, UpdateStream, dispatcher_task};
use crate::reconcile::Reconciler;
use crate::store::StateStore;

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Vane positions beyond this capability value mean the hardware swings.
const SWING_CAPABILITY_THRESHOLD: i64 = 1024;

// ── Controller ───────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Owns the session lifecycle. `connect()` starts the connection
/// supervisor and suspends until the first session is up (or terminally
/// failed); after that the supervisor reconnects on its own and state
/// queries keep answering from last-known-good data.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    shared: Arc<LinkShared>,
    store: Arc<StateStore>,
    reconciler: Arc<Reconciler>,
    observers: Arc<Observers>,
    /// Taken by the first operation that needs the dispatcher running.
    dispatcher_rx: Mutex<Option<mpsc::Receiver<Update>>>,
    link: Mutex<Option<ActiveLink>>,
}

struct ActiveLink {
    cancel: CancellationToken,
    commands: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

impl Controller {
    /// Create a controller from configuration. Does NOT connect — call
    /// [`connect()`](Self::connect) to authenticate and open the socket.
    pub fn new(config: ControllerConfig) -> Result<Self, CoreError> {
        let account = AccountClient::new(config.service.clone())?;
        Ok(Self::with_account(config, account))
    }

    /// Create a controller with a pre-built [`AccountClient`] (custom
    /// transport, shared HTTP pool).
    pub fn with_account(config: ControllerConfig, account: AccountClient) -> Self {
        let store = Arc::new(StateStore::new());
        let (updates_tx, updates_rx) = mpsc::channel(config.update_queue_capacity);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            updates_tx,
            config.pending_command_timeout,
        ));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(LinkShared {
            account,
            username: config.username.clone(),
            password: config.password.clone(),
            connect_timeout: config.connect_timeout,
            auth_timeout: config.auth_timeout,
            keepalive_interval: config.keepalive_interval,
            idle_timeout: config.idle_timeout,
            reconnect: config.reconnect.clone(),
            auto_reconnect: config.auto_reconnect,
            queue_while_reconnecting: config.queue_while_reconnecting,
            state,
            reconciler: Arc::clone(&reconciler),
            store: Arc::clone(&store),
        });

        Self {
            inner: Arc::new(ControllerInner {
                config,
                shared,
                store,
                reconciler,
                observers: Arc::new(Observers::new()),
                dispatcher_rx: Mutex::new(Some(updates_rx)),
                link: Mutex::new(None),
            }),
        }
    }

    /// Access the controller configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Connect to the service.
    ///
    /// Resolves a session, opens the socket, runs the token handshake, and
    /// applies the initial full-state snapshot. Suspends until the first
    /// session is `Connected` or a terminal error stops the supervisor;
    /// transient failures retry under backoff without returning. A second
    /// call while a supervisor is alive is a no-op.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.ensure_dispatcher().await;

        let first_rx = {
            let mut link = self.inner.link.lock().await;
            if let Some(active) = link.as_ref() {
                if active.task.is_finished() {
                    *link = None;
                } else {
                    return Ok(());
                }
            }

            let cancel = CancellationToken::new();
            let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
            let (first_tx, first_rx) = oneshot::channel();

            let task = tokio::spawn(connection_task(
                Arc::clone(&self.inner.shared),
                command_rx,
                cancel.clone(),
                first_tx,
            ));

            *link = Some(ActiveLink {
                cancel,
                commands,
                task,
            });
            first_rx
        };

        match first_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            // Supervisor died without reporting: treat as cancellation.
            Err(_) => Err(CoreError::Cancelled),
        }
    }

    /// Disconnect from the service.
    ///
    /// Cancels the supervisor (including any pending backoff sleep),
    /// unblocks a suspended `connect()` caller with
    /// [`CoreError::Cancelled`], and lands in `Disconnected`. Idempotent.
    pub async fn disconnect(&self) {
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            link.cancel.cancel();
            let _ = link.task.await;
        }

        // Normally the supervisor publishes `Disconnected` on its way out;
        // cover the no-supervisor and `Failed` cases.
        if *self.inner.shared.state.borrow() != ConnectionState::Disconnected {
            self.inner
                .shared
                .state
                .send_replace(ConnectionState::Disconnected);
            self.inner
                .reconciler
                .connection_changed(ConnectionState::Disconnected)
                .await;
        }
        debug!("disconnected");
    }

    /// `true` while the socket session is fully established.
    pub fn is_connected(&self) -> bool {
        *self.inner.shared.state.borrow() == ConnectionState::Connected
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Re-run the account exchange and apply a fresh full snapshot.
    ///
    /// Works with or without a live socket; the socket keeps pushing
    /// deltas either way. The service asks integrators to poll at most
    /// once every five minutes — that convention is documented, not
    /// enforced here.
    pub async fn poll_status(&self) -> Result<(), CoreError> {
        self.ensure_dispatcher().await;

        let session = self
            .inner
            .shared
            .account
            .resolve(
                &self.inner.config.username,
                self.inner.config.password.expose_secret(),
            )
            .await?;
        self.inner
            .reconciler
            .apply_session(session.devices, session.snapshot)
            .await;
        Ok(())
    }

    async fn ensure_dispatcher(&self) {
        if let Some(rx) = self.inner.dispatcher_rx.lock().await.take() {
            tokio::spawn(dispatcher_task(Arc::clone(&self.inner.observers), rx));
        }
    }

    // ── Catalog access ───────────────────────────────────────────────

    /// All devices from the current session's catalog, in account order.
    pub fn devices(&self) -> Arc<Vec<Arc<Device>>> {
        self.inner.store.devices_snapshot()
    }

    /// Look up one device.
    pub fn device(&self, device: &DeviceId) -> Result<Arc<Device>, CoreError> {
        self.inner
            .store
            .device(device.as_str())
            .ok_or_else(|| CoreError::DeviceNotFound {
                device_id: device.clone(),
            })
    }

    pub fn device_count(&self) -> usize {
        self.inner.store.device_count()
    }

    // ── Generic value access ─────────────────────────────────────────

    /// The decoded current value of one feature.
    ///
    /// Answers from the in-memory table, which survives reconnects:
    /// during a connection gap this returns the last value seen before
    /// the drop, never a reset.
    pub fn feature_value(&self, device: &DeviceId, feature: Feature) -> Result<Value, CoreError> {
        self.device(device)?;
        let raw = self
            .raw(device, feature)
            .ok_or_else(|| CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature,
            })?;
        Ok(decode_value(feature, raw, self.raw(device, Feature::ConfigFanMap)))
    }

    /// Write one feature after validating the value against its domain.
    ///
    /// Validation happens before encoding: an out-of-domain value fails
    /// with [`CoreError::Domain`] and puts zero bytes on the wire.
    pub async fn set_feature_value(
        &self,
        device: &DeviceId,
        feature: Feature,
        value: &Value,
    ) -> Result<(), CoreError> {
        self.device(device)?;
        let raw = self.raw_for_command(device, feature, value)?;
        self.send_set(device, feature.uid(), raw).await
    }

    fn raw(&self, device: &DeviceId, feature: Feature) -> Option<i64> {
        self.inner.store.raw_value(device.as_str(), feature.uid())
    }

    // ── Typed getters ────────────────────────────────────────────────

    /// `true` if the device is powered on.
    pub fn is_on(&self, device: &DeviceId) -> Result<bool, CoreError> {
        Ok(self.feature_value(device, Feature::Power)? == Value::Keyword("on"))
    }

    /// Current operating mode.
    pub fn mode(&self, device: &DeviceId) -> Result<Mode, CoreError> {
        let raw = self.required_raw(device, Feature::Mode)?;
        Mode::from_wire(raw).ok_or_else(|| CoreError::ValueUnavailable {
            device_id: device.clone(),
            feature: Feature::Mode,
        })
    }

    /// Modes this device advertises, from its capability word. Devices
    /// that don't report the capability get the full set.
    pub fn mode_list(&self, device: &DeviceId) -> Result<Vec<Mode>, CoreError> {
        self.device(device)?;
        Ok(match self.raw(device, Feature::ConfigModeMap) {
            Some(bits) => Mode::from_capability(bits),
            None => Mode::from_capability(i64::MAX),
        })
    }

    /// Current fan speed label, per the device's fan map.
    pub fn fan_speed(&self, device: &DeviceId) -> Result<&'static str, CoreError> {
        match self.feature_value(device, Feature::FanSpeed)? {
            Value::Keyword(label) => Ok(label),
            _ => Err(CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature: Feature::FanSpeed,
            }),
        }
    }

    /// Fan speed labels this device accepts.
    pub fn fan_speed_list(&self, device: &DeviceId) -> Result<Vec<&'static str>, CoreError> {
        Ok(labels(self.device_fan_map(device)?))
    }

    /// Target temperature in °C.
    pub fn setpoint(&self, device: &DeviceId) -> Result<f64, CoreError> {
        self.celsius(device, Feature::Setpoint)
    }

    /// Device-reported setpoint bounds (min, max) in °C.
    pub fn setpoint_limits(&self, device: &DeviceId) -> Result<(f64, f64), CoreError> {
        Ok((
            self.celsius(device, Feature::SetpointMin)?,
            self.celsius(device, Feature::SetpointMax)?,
        ))
    }

    /// Current room temperature in °C.
    pub fn ambient_temperature(&self, device: &DeviceId) -> Result<f64, CoreError> {
        self.celsius(device, Feature::AmbientTemperature)
    }

    /// Outdoor unit temperature in °C.
    pub fn outdoor_temperature(&self, device: &DeviceId) -> Result<f64, CoreError> {
        self.celsius(device, Feature::OutdoorTemperature)
    }

    /// Current preset ("comfort", "eco", "powerful").
    pub fn preset_mode(&self, device: &DeviceId) -> Result<&'static str, CoreError> {
        self.keyword(device, Feature::PresetMode)
    }

    /// Current vertical vane position.
    pub fn vertical_vane(&self, device: &DeviceId) -> Result<&'static str, CoreError> {
        self.keyword(device, Feature::VerticalVane)
    }

    /// Current horizontal vane position.
    pub fn horizontal_vane(&self, device: &DeviceId) -> Result<&'static str, CoreError> {
        self.keyword(device, Feature::HorizontalVane)
    }

    /// Whether the hardware supports vertical swing.
    pub fn has_vertical_swing(&self, device: &DeviceId) -> bool {
        self.raw(device, Feature::ConfigVerticalVanes)
            .is_some_and(|config| config > SWING_CAPABILITY_THRESHOLD)
    }

    /// Whether the hardware supports horizontal swing.
    pub fn has_horizontal_swing(&self, device: &DeviceId) -> bool {
        self.raw(device, Feature::ConfigHorizontalVanes)
            .is_some_and(|config| config > SWING_CAPABILITY_THRESHOLD)
    }

    /// Compressor run hours.
    pub fn run_hours(&self, device: &DeviceId) -> Result<i64, CoreError> {
        self.required_raw(device, Feature::WorkingHours)
    }

    /// Wireless signal strength, if the adapter has reported it.
    pub fn signal_strength(&self, device: &DeviceId) -> Option<i64> {
        self.raw(device, Feature::SignalStrength)
    }

    /// Instantaneous power draw in watts.
    pub fn instant_power_consumption(&self, device: &DeviceId) -> Result<i64, CoreError> {
        self.required_raw(device, Feature::InstantPowerConsumption)
    }

    /// Accumulated energy consumption.
    pub fn accumulated_power_consumption(&self, device: &DeviceId) -> Result<i64, CoreError> {
        self.required_raw(device, Feature::AccumulatedPowerConsumption)
    }

    /// Current fault as "CODE: description", e.g. "H00: No abnormality
    /// detected". Unknown codes come back as "code N".
    pub fn error_description(&self, device: &DeviceId) -> Result<String, CoreError> {
        let code = self.required_raw(device, Feature::ErrorCode)?;
        Ok(match crate::model::fault_info(code) {
            Some(info) => format!("{}: {}", info.code, info.description),
            None => format!("code {code}"),
        })
    }

    /// When the last full snapshot was applied.
    pub fn last_full_refresh(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.store.last_full_refresh()
    }

    /// Age of the last full snapshot.
    pub fn data_age(&self) -> Option<chrono::Duration> {
        self.inner.store.data_age()
    }

    /// Commands sent and not yet confirmed by an echo.
    pub fn pending_commands(&self) -> usize {
        self.inner.reconciler.pending_len()
    }

    fn required_raw(&self, device: &DeviceId, feature: Feature) -> Result<i64, CoreError> {
        self.device(device)?;
        self.raw(device, feature)
            .ok_or_else(|| CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature,
            })
    }

    fn celsius(&self, device: &DeviceId, feature: Feature) -> Result<f64, CoreError> {
        match self.feature_value(device, feature)? {
            Value::Celsius(c) => Ok(c),
            _ => Err(CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature,
            }),
        }
    }

    fn keyword(&self, device: &DeviceId, feature: Feature) -> Result<&'static str, CoreError> {
        match self.feature_value(device, feature)? {
            Value::Keyword(k) => Ok(k),
            _ => Err(CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature,
            }),
        }
    }

    // ── Typed setters ────────────────────────────────────────────────

    /// Power the device on or off.
    pub async fn set_power(&self, device: &DeviceId, on: bool) -> Result<(), CoreError> {
        let keyword = if on { "on" } else { "off" };
        self.set_feature_value(device, Feature::Power, &Value::Keyword(keyword))
            .await
    }

    /// Switch the operating mode.
    pub async fn set_mode(&self, device: &DeviceId, mode: Mode) -> Result<(), CoreError> {
        self.device(device)?;
        let advertised = self.mode_list(device)?;
        if !advertised.contains(&mode) {
            return Err(CoreError::Domain {
                feature: Feature::Mode,
                value: mode.to_string(),
                allowed: keyword_list(advertised.iter().map(|m| (*m).into())),
            });
        }
        self.send_set(device, Feature::Mode.uid(), mode.wire_value())
            .await
    }

    /// Change the target temperature (°C).
    pub async fn set_setpoint(&self, device: &DeviceId, celsius: f64) -> Result<(), CoreError> {
        self.device(device)?;
        let raw = self.setpoint_raw(device, celsius)?;
        self.send_set(device, Feature::Setpoint.uid(), raw).await
    }

    /// Change the fan speed by label.
    pub async fn set_fan_speed(&self, device: &DeviceId, speed: &str) -> Result<(), CoreError> {
        self.device(device)?;
        let map = self.device_fan_map(device)?;
        let raw = fan_command_value(map, speed).ok_or_else(|| CoreError::Domain {
            feature: Feature::FanSpeed,
            value: speed.to_owned(),
            allowed: keyword_list(labels(map)),
        })?;
        self.send_set(device, Feature::FanSpeed.uid(), raw).await
    }

    /// Position the vertical vane.
    pub async fn set_vertical_vane(
        &self,
        device: &DeviceId,
        position: &str,
    ) -> Result<(), CoreError> {
        self.set_vane(device, Feature::VerticalVane, position).await
    }

    /// Position the horizontal vane.
    pub async fn set_horizontal_vane(
        &self,
        device: &DeviceId,
        position: &str,
    ) -> Result<(), CoreError> {
        self.set_vane(device, Feature::HorizontalVane, position).await
    }

    /// Change the preset ("comfort", "eco", "powerful").
    pub async fn set_preset_mode(&self, device: &DeviceId, preset: &str) -> Result<(), CoreError> {
        self.device(device)?;
        let raw = preset_command_value(preset).ok_or_else(|| CoreError::Domain {
            feature: Feature::PresetMode,
            value: preset.to_owned(),
            allowed: keyword_list(preset_labels()),
        })?;
        self.send_set(device, Feature::PresetMode.uid(), raw).await
    }

    async fn set_vane(
        &self,
        device: &DeviceId,
        feature: Feature,
        position: &str,
    ) -> Result<(), CoreError> {
        self.device(device)?;
        let raw = vane_command_value(position).ok_or_else(|| CoreError::Domain {
            feature,
            value: position.to_owned(),
            allowed: keyword_list(vane_labels()),
        })?;
        self.send_set(device, feature.uid(), raw).await
    }

    // ── Observers ────────────────────────────────────────────────────

    /// Register an observer. Callbacks run on a dedicated dispatcher
    /// task — never on the socket read loop — and see updates for a given
    /// device in frame-arrival order.
    pub fn add_callback(
        &self,
        callback: impl Fn(&Update) + Send + Sync + 'static,
    ) -> CallbackId {
        self.inner.observers.add(Box::new(callback))
    }

    /// Unregister an observer. Returns `true` if it was registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.observers.remove(id)
    }

    /// A `Stream` of updates for async consumers.
    pub fn updates(&self) -> UpdateStream {
        UpdateStream::new(self.inner.observers.subscribe())
    }

    // ── Command plumbing ─────────────────────────────────────────────

    /// Domain-validate a generic value and produce its raw wire form.
    fn raw_for_command(
        &self,
        device: &DeviceId,
        feature: Feature,
        value: &Value,
    ) -> Result<i64, CoreError> {
        let domain_error = |value: String, allowed: String| CoreError::Domain {
            feature,
            value,
            allowed,
        };

        if !feature.is_writable() {
            return Err(domain_error(value.to_string(), "read-only".into()));
        }

        match (feature, value) {
            (Feature::Power, Value::Keyword(k)) => power_command_value(k)
                .ok_or_else(|| domain_error((*k).into(), keyword_list(power_labels()))),
            (Feature::Mode, Value::Keyword(k)) => {
                let mode: Mode = k
                    .parse()
                    .map_err(|_| domain_error((*k).into(), keyword_list(mode_keywords())))?;
                let advertised = self.mode_list(device)?;
                if advertised.contains(&mode) {
                    Ok(mode.wire_value())
                } else {
                    Err(domain_error(
                        (*k).into(),
                        keyword_list(advertised.iter().map(|m| (*m).into())),
                    ))
                }
            }
            (Feature::FanSpeed, Value::Keyword(k)) => {
                let map = self.device_fan_map(device)?;
                fan_command_value(map, k)
                    .ok_or_else(|| domain_error((*k).into(), keyword_list(labels(map))))
            }
            (Feature::VerticalVane | Feature::HorizontalVane, Value::Keyword(k)) => {
                vane_command_value(k)
                    .ok_or_else(|| domain_error((*k).into(), keyword_list(vane_labels())))
            }
            (Feature::PresetMode, Value::Keyword(k)) => preset_command_value(k)
                .ok_or_else(|| domain_error((*k).into(), keyword_list(preset_labels()))),
            (Feature::Setpoint, Value::Celsius(c)) => self.setpoint_raw(device, *c),
            (feature, value) => Err(domain_error(
                value.to_string(),
                format!("a value of the kind {feature} expects"),
            )),
        }
    }

    fn setpoint_raw(&self, device: &DeviceId, celsius: f64) -> Result<i64, CoreError> {
        if !celsius.is_finite() {
            return Err(CoreError::Domain {
                feature: Feature::Setpoint,
                value: celsius.to_string(),
                allowed: "a finite temperature".into(),
            });
        }

        // Bounds come from the device itself when it has reported them.
        let min = self.raw(device, Feature::SetpointMin);
        let max = self.raw(device, Feature::SetpointMax);
        let tenths = (celsius * 10.0).round() as i64;
        if min.is_some_and(|m| tenths < m) || max.is_some_and(|m| tenths > m) {
            let low = min.map_or(f64::NEG_INFINITY, |m| m as f64 / 10.0);
            let high = max.map_or(f64::INFINITY, |m| m as f64 / 10.0);
            return Err(CoreError::Domain {
                feature: Feature::Setpoint,
                value: celsius.to_string(),
                allowed: format!("{low}..={high} °C"),
            });
        }

        Ok(wire_u16(tenths))
    }

    fn device_fan_map(
        &self,
        device: &DeviceId,
    ) -> Result<&'static [(i64, &'static str)], CoreError> {
        self.device(device)?;
        self.raw(device, Feature::ConfigFanMap)
            .and_then(fan_map)
            .ok_or_else(|| CoreError::ValueUnavailable {
                device_id: device.clone(),
                feature: Feature::ConfigFanMap,
            })
    }

    /// Enqueue an encoded `set` for the write loop and record it pending.
    ///
    /// Commands go out in call order; the queue is drained FIFO by the
    /// session's writer with no reordering or coalescing.
    async fn send_set(&self, device: &DeviceId, uid: u32, raw: i64) -> Result<(), CoreError> {
        let state = self.state();
        let sendable = state == ConnectionState::Connected
            || (self.inner.config.queue_while_reconnecting
                && !matches!(state, ConnectionState::Disconnected | ConnectionState::Failed));
        if !sendable {
            return Err(CoreError::NotConnected);
        }

        let commands = {
            let link = self.inner.link.lock().await;
            match link.as_ref() {
                Some(active) if !active.task.is_finished() => active.commands.clone(),
                _ => return Err(CoreError::NotConnected),
            }
        };

        let frame = codec::set_value(device.as_str(), uid, raw);
        commands
            .send(frame)
            .await
            .map_err(|_| CoreError::NotConnected)?;
        self.inner.reconciler.note_sent(device.as_str(), uid, raw);
        Ok(())
    }
}

fn mode_keywords() -> Vec<&'static str> {
    use strum::IntoEnumIterator;
    Mode::iter().map(Into::into).collect()
}

fn keyword_list(items: impl IntoIterator<Item = &'static str>) -> String {
    items.into_iter().collect::<Vec<_>>().join(", ")
}
