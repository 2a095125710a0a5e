// ── Device identity and catalog entry ──

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use aerlink_api::CatalogDevice;

/// Opaque device identifier.
///
/// Numeric on the wire for current hardware, but some accounts carry
/// string ids; consumers never care which.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<u64> for DeviceId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// A controllable unit as described by the account catalog.
///
/// Immutable for the lifetime of a session; only the datapoint values it
/// owns change, and those live in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Vendor model number, when the catalog reports one.
    pub model_id: Option<i64>,
    /// Capability widget ids the vendor app uses to pick UI panels.
    pub widgets: Vec<u32>,
}

impl From<CatalogDevice> for Device {
    fn from(raw: CatalogDevice) -> Self {
        Self {
            id: DeviceId::from(raw.id),
            name: raw.name,
            model_id: raw.model_id,
            widgets: raw.widgets,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn device_id_from_number_and_string_compare_equal() {
        assert_eq!(DeviceId::from(12_015_601_252_591_u64), DeviceId::from("12015601252591"));
    }

    #[test]
    fn device_id_from_str() {
        let id: DeviceId = "abc".parse().unwrap();
        assert_eq!(id.as_str(), "abc");
    }
}
