// ── Feature model ──
//
// Maps the service's numeric datapoint uids onto named features, and
// carries the value domains needed to decode reports and validate
// commands. Raw wire values are i64 throughout; decoding to keywords,
// scaled temperatures, or plain numbers happens here.

use std::fmt;

use serde::Serialize;
use strum::IntoEnumIterator;

/// Service null sentinel: a datapoint carrying this value has no reading.
pub(crate) const NULL_VALUE: i64 = 32768;

// ── Feature ──────────────────────────────────────────────────────────

/// A single controllable or reportable datapoint of a device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Power,
    Mode,
    FanSpeed,
    VerticalVane,
    HorizontalVane,
    Setpoint,
    AmbientTemperature,
    WorkingHours,
    AlarmStatus,
    ErrorCode,
    SetpointMin,
    SetpointMax,
    OutdoorTemperature,
    PresetMode,
    ConfigModeMap,
    ConfigHorizontalVanes,
    ConfigVerticalVanes,
    ConfigFanMap,
    InstantPowerConsumption,
    AccumulatedPowerConsumption,
    SignalStrength,
}

impl Feature {
    /// The wire datapoint uid for this feature.
    pub const fn uid(self) -> u32 {
        match self {
            Self::Power => 1,
            Self::Mode => 2,
            Self::FanSpeed => 4,
            Self::VerticalVane => 5,
            Self::HorizontalVane => 6,
            Self::Setpoint => 9,
            Self::AmbientTemperature => 10,
            Self::WorkingHours => 13,
            Self::AlarmStatus => 14,
            Self::ErrorCode => 15,
            Self::SetpointMin => 35,
            Self::SetpointMax => 36,
            Self::OutdoorTemperature => 37,
            Self::PresetMode => 42,
            Self::ConfigModeMap => 61,
            Self::ConfigHorizontalVanes => 63,
            Self::ConfigVerticalVanes => 64,
            Self::ConfigFanMap => 67,
            Self::InstantPowerConsumption => 68,
            Self::AccumulatedPowerConsumption => 69,
            Self::SignalStrength => 60002,
        }
    }

    /// Map a wire uid back to a known feature, if any. Devices report many
    /// more uids than this; unknown ones are stored raw and left alone.
    pub fn from_uid(uid: u32) -> Option<Self> {
        let feature = match uid {
            1 => Self::Power,
            2 => Self::Mode,
            4 => Self::FanSpeed,
            5 => Self::VerticalVane,
            6 => Self::HorizontalVane,
            9 => Self::Setpoint,
            10 => Self::AmbientTemperature,
            13 => Self::WorkingHours,
            14 => Self::AlarmStatus,
            15 => Self::ErrorCode,
            35 => Self::SetpointMin,
            36 => Self::SetpointMax,
            37 => Self::OutdoorTemperature,
            42 => Self::PresetMode,
            61 => Self::ConfigModeMap,
            63 => Self::ConfigHorizontalVanes,
            64 => Self::ConfigVerticalVanes,
            67 => Self::ConfigFanMap,
            68 => Self::InstantPowerConsumption,
            69 => Self::AccumulatedPowerConsumption,
            60002 => Self::SignalStrength,
            _ => return None,
        };
        Some(feature)
    }

    /// Whether commands may write this datapoint.
    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            Self::Power
                | Self::Mode
                | Self::FanSpeed
                | Self::VerticalVane
                | Self::HorizontalVane
                | Self::Setpoint
                | Self::PresetMode
        )
    }
}

// ── Mode ─────────────────────────────────────────────────────────────

/// Operating mode of a climate device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Heat,
    Dry,
    Fan,
    Cool,
}

impl Mode {
    pub(crate) const fn wire_value(self) -> i64 {
        match self {
            Self::Auto => 0,
            Self::Heat => 1,
            Self::Dry => 2,
            Self::Fan => 3,
            Self::Cool => 4,
        }
    }

    pub(crate) fn from_wire(value: i64) -> Option<Self> {
        Mode::iter().find(|m| m.wire_value() == value)
    }

    /// Bit in the `config_mode_map` capability value that advertises this
    /// mode.
    pub(crate) const fn capability_bit(self) -> i64 {
        match self {
            Self::Auto => 1,
            Self::Heat => 2,
            Self::Dry => 4,
            Self::Fan => 8,
            Self::Cool => 16,
        }
    }

    /// Modes advertised by a `config_mode_map` capability value.
    pub(crate) fn from_capability(bits: i64) -> Vec<Self> {
        Mode::iter().filter(|m| bits & m.capability_bit() != 0).collect()
    }
}

// ── Value ────────────────────────────────────────────────────────────

/// A decoded datapoint value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// A discrete value with a known label ("on", "cool", "quiet", ...).
    Keyword(&'static str),
    /// A temperature in degrees Celsius.
    Celsius(f64),
    /// A plain or unmapped number (hours, watts, capability words).
    Number(i64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword(k) => write!(f, "{k}"),
            Self::Celsius(c) => write!(f, "{c}°C"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

// ── Value maps ───────────────────────────────────────────────────────

const POWER_VALUES: &[(i64, &str)] = &[(0, "off"), (1, "on")];

const PRESET_VALUES: &[(i64, &str)] = &[(0, "comfort"), (1, "eco"), (2, "powerful")];

/// Vane positions a device may *report*. Commands accept a subset; see
/// [`vane_command_value`].
const VANE_POSITIONS: &[(i64, &str)] = &[
    (0, "auto/stop"),
    (1, "manual1"),
    (2, "manual2"),
    (3, "manual3"),
    (4, "manual4"),
    (5, "manual5"),
    (6, "manual6"),
    (7, "manual7"),
    (8, "manual8"),
    (9, "manual9"),
    (10, "swing"),
];

const VANE_COMMANDS: &[(i64, &str)] = &[
    (0, "auto/stop"),
    (10, "swing"),
    (1, "manual1"),
    (2, "manual2"),
    (3, "manual3"),
    (4, "manual4"),
    (5, "manual5"),
];

/// Fan-speed labels keyed by the device's `config_fan_map` capability
/// value. Each installed unit advertises exactly one of these codes.
const FAN_MAPS: &[(i64, &[(i64, &str)])] = &[
    (6, &[(1, "low"), (2, "high")]),
    (7, &[(0, "auto"), (1, "low"), (2, "high")]),
    (14, &[(1, "low"), (2, "medium"), (3, "high")]),
    (15, &[(0, "auto"), (1, "low"), (2, "medium"), (3, "high")]),
    (30, &[(1, "quiet"), (2, "low"), (3, "medium"), (4, "high")]),
    (
        31,
        &[(0, "auto"), (1, "quiet"), (2, "low"), (3, "medium"), (4, "high")],
    ),
    (
        62,
        &[(1, "quiet"), (2, "low"), (3, "medium"), (4, "high"), (5, "max")],
    ),
    (
        63,
        &[
            (0, "auto"),
            (1, "quiet"),
            (2, "low"),
            (3, "medium"),
            (4, "high"),
            (5, "max"),
        ],
    ),
    (
        126,
        &[
            (1, "speed 1"),
            (2, "speed 2"),
            (3, "speed 3"),
            (4, "speed 4"),
            (5, "speed 5"),
            (6, "speed 6"),
        ],
    ),
    (
        127,
        &[
            (0, "auto"),
            (1, "speed 1"),
            (2, "speed 2"),
            (3, "speed 3"),
            (4, "speed 4"),
            (5, "speed 5"),
            (6, "speed 6"),
        ],
    ),
];

/// The fan-speed map for a `config_fan_map` capability value.
pub(crate) fn fan_map(config: i64) -> Option<&'static [(i64, &'static str)]> {
    FAN_MAPS.iter().find(|(code, _)| *code == config).map(|(_, map)| *map)
}

fn lookup(map: &'static [(i64, &'static str)], raw: i64) -> Option<&'static str> {
    map.iter().find(|(v, _)| *v == raw).map(|(_, label)| *label)
}

fn reverse_lookup(map: &'static [(i64, &'static str)], label: &str) -> Option<i64> {
    map.iter().find(|(_, l)| *l == label).map(|(v, _)| *v)
}

pub(crate) fn labels(map: &'static [(i64, &'static str)]) -> Vec<&'static str> {
    map.iter().map(|(_, label)| *label).collect()
}

// ── Decoding ─────────────────────────────────────────────────────────

/// Negative temperatures arrive as 16-bit two's complement.
pub(crate) const fn twos_complement_16(value: i64) -> i64 {
    if value & 0x8000 != 0 { value - 0x10000 } else { value }
}

/// Encoded setpoints are truncated to the wire's unsigned 16-bit field.
pub(crate) const fn wire_u16(value: i64) -> i64 {
    value & 0xFFFF
}

/// Decode a raw wire value for a feature.
///
/// `fan_config` is the device's `config_fan_map` capability value, needed
/// only for [`Feature::FanSpeed`]. Values with no known mapping come back
/// as [`Value::Number`] rather than failing — stale-but-visible beats
/// missing.
pub(crate) fn decode_value(feature: Feature, raw: i64, fan_config: Option<i64>) -> Value {
    match feature {
        Feature::Power => keyword_or_number(POWER_VALUES, raw),
        Feature::Mode => match Mode::from_wire(raw) {
            Some(mode) => Value::Keyword(mode.into()),
            None => Value::Number(raw),
        },
        Feature::FanSpeed => fan_config
            .and_then(fan_map)
            .and_then(|map| lookup(map, raw))
            .map_or(Value::Number(raw), Value::Keyword),
        Feature::VerticalVane | Feature::HorizontalVane => {
            keyword_or_number(VANE_POSITIONS, raw)
        }
        Feature::PresetMode => keyword_or_number(PRESET_VALUES, raw),
        Feature::Setpoint | Feature::SetpointMin | Feature::SetpointMax => {
            Value::Celsius(raw as f64 / 10.0)
        }
        Feature::AmbientTemperature | Feature::OutdoorTemperature => {
            Value::Celsius(twos_complement_16(raw) as f64 / 10.0)
        }
        _ => Value::Number(raw),
    }
}

fn keyword_or_number(map: &'static [(i64, &'static str)], raw: i64) -> Value {
    lookup(map, raw).map_or(Value::Number(raw), Value::Keyword)
}

// ── Command-side lookups ─────────────────────────────────────────────
//
// These return the raw wire value for a keyword, or None when the keyword
// is outside the feature's command domain. The controller turns None into
// a DomainError before anything is encoded.

pub(crate) fn power_command_value(keyword: &str) -> Option<i64> {
    reverse_lookup(POWER_VALUES, keyword)
}

pub(crate) fn vane_command_value(keyword: &str) -> Option<i64> {
    reverse_lookup(VANE_COMMANDS, keyword)
}

pub(crate) fn preset_command_value(keyword: &str) -> Option<i64> {
    reverse_lookup(PRESET_VALUES, keyword)
}

pub(crate) fn fan_command_value(map: &'static [(i64, &'static str)], keyword: &str) -> Option<i64> {
    reverse_lookup(map, keyword)
}

pub(crate) fn power_labels() -> Vec<&'static str> {
    labels(POWER_VALUES)
}

pub(crate) fn vane_labels() -> Vec<&'static str> {
    labels(VANE_COMMANDS)
}

pub(crate) fn preset_labels() -> Vec<&'static str> {
    labels(PRESET_VALUES)
}

// ── Tests ────────────────────────────────────────────────────────────
