// ── Domain model ──

mod device;
mod errors;
mod feature;

pub use device::{Device, DeviceId};
pub use errors::{FaultInfo, fault_info};
pub use feature::{Feature, Mode, Value};

pub(crate) use feature::{
    NULL_VALUE, decode_value, fan_command_value, fan_map, labels, power_command_value,
    power_labels, preset_command_value, preset_labels, vane_command_value, vane_labels, wire_u16,
};
