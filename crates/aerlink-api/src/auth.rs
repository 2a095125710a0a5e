//! Account-service exchange: one HTTP POST that yields everything a socket
//! session needs — command-server endpoint, a one-shot token, and the
//! device/feature catalog with a full initial status dump.
//!
//! The exchange is idempotent and stateless; call it as often as a fresh
//! token is needed. Tokens are tied to a single socket handshake, so a new
//! session must be resolved for every (re)connection.

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::Error;

/// Request body the service expects in the `cmd` form field: ask for both
/// the config block (endpoint + token + catalog) and the status block.
const STATUS_COMMAND: &str = r#"{"status":{"hash":"x"},"config":{"hash":"x"}}"#;

const USER_AGENT: &str = concat!("aerlink/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// ── AccountService ───────────────────────────────────────────────────

/// Which account service to authenticate against.
///
/// Several white-label deployments share the same protocol; they differ
/// only in base URL and the API version string the login must carry.
#[derive(Debug, Clone)]
pub struct AccountService {
    pub api_url: Url,
    pub api_version: String,
}

impl AccountService {
    /// The primary IntesisHome cloud.
    pub fn intesis_home() -> Self {
        Self::preset("https://user.intesishome.com/api.php/get/control", "1.2.2")
    }

    /// The airconwithme deployment.
    pub fn aircon_with_me() -> Self {
        Self::preset("https://user.airconwithme.com/api.php/get/control", "1.6.2")
    }

    /// The anywAiR deployment.
    pub fn anywair() -> Self {
        Self::preset("https://anywair.intesishome.com/api.php/get/control", "2.9")
    }

    /// A custom deployment speaking the same protocol (e.g. a test server).
    pub fn custom(api_url: Url, api_version: impl Into<String>) -> Self {
        Self {
            api_url,
            api_version: api_version.into(),
        }
    }

    fn preset(url: &str, version: &str) -> Self {
        Self {
            api_url: Url::parse(url).expect("preset service URL is valid"),
            api_version: version.to_owned(),
        }
    }
}

// ── Session payload ──────────────────────────────────────────────────

/// Everything one successful exchange yields.
///
/// The token is single-use: it is consumed by the socket `connect_req`
/// handshake and must not be reused for a second connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Command-server host to open the push socket against.
    pub server_host: String,
    /// Command-server port.
    pub server_port: u16,
    /// One-shot numeric authentication token for the socket handshake.
    pub token: i64,
    /// Devices registered to the account.
    pub devices: Vec<CatalogDevice>,
    /// Flat full-state dump: one entry per (device, datapoint).
    pub snapshot: Vec<StatusEntry>,
}

/// A device as described by the account catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDevice {
    /// Opaque device identifier (numeric on the wire for current hardware,
    /// but treated as an opaque string throughout).
    pub id: String,
    pub name: String,
    pub model_id: Option<i64>,
    /// Capability widget ids the vendor app uses to pick UI panels.
    pub widgets: Vec<u32>,
}

/// One (device, datapoint, value) triple from the bulk status dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub device_id: String,
    pub uid: u32,
    pub value: i64,
}

// ── Raw response shapes ──────────────────────────────────────────────
//
// The schema is treated as opaque beyond the fields needed here; unknown
// fields are ignored by serde.

#[derive(Debug, Deserialize)]
struct ControlResponse {
    #[serde(rename = "errorCode", default)]
    error_code: Option<i64>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
    #[serde(default)]
    config: Option<ConfigBlock>,
    #[serde(default)]
    status: Option<StatusBlock>,
}

#[derive(Debug, Deserialize)]
struct ConfigBlock {
    #[serde(rename = "serverIP", default)]
    server_ip: Option<String>,
    #[serde(rename = "serverPort", default)]
    server_port: Option<u16>,
    #[serde(default)]
    token: Option<i64>,
    #[serde(default)]
    inst: Vec<Installation>,
}

#[derive(Debug, Deserialize)]
struct Installation {
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Debug, Deserialize)]
struct RawDevice {
    #[serde(deserialize_with = "opaque_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "modelId", default)]
    model_id: Option<i64>,
    #[serde(default)]
    widgets: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct StatusBlock {
    #[serde(default)]
    status: Vec<RawStatus>,
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(rename = "deviceId", deserialize_with = "opaque_id")]
    device_id: String,
    uid: u32,
    value: i64,
}

/// Device ids arrive as JSON numbers on current hardware and as strings on
/// some older accounts; normalize both to a string.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "device id must be a string or number, got {other}"
        ))),
    }
}

// ── AccountClient ────────────────────────────────────────────────────

/// HTTP client for the account service.
///
/// Cheaply cloneable (wraps a `reqwest::Client`); safe to share between the
/// connection supervisor and ad-hoc status polls.
#[derive(Debug, Clone)]
pub struct AccountClient {
    http: reqwest::Client,
    service: AccountService,
}

impl AccountClient {
    /// Build a client for the given service with default transport settings.
    pub fn new(service: AccountService) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::Unreachable)?;
        Ok(Self { http, service })
    }

    /// Build a client with a pre-configured `reqwest::Client`.
    pub fn with_client(service: AccountService, http: reqwest::Client) -> Self {
        Self { http, service }
    }

    /// The service this client talks to.
    pub fn service(&self) -> &AccountService {
        &self.service
    }

    /// Perform the login exchange and return a fresh [`Session`].
    ///
    /// Idempotent; no state is kept between calls. Fails with
    /// [`Error::InvalidCredentials`] on a rejected login,
    /// [`Error::Unreachable`] on transport failure, and
    /// [`Error::MalformedResponse`] if the payload cannot be parsed.
    pub async fn resolve(&self, username: &str, password: &str) -> Result<Session, Error> {
        let form = [
            ("username", username),
            ("password", password),
            ("cmd", STATUS_COMMAND),
            ("version", &self.service.api_version),
        ];

        tracing::debug!(url = %self.service.api_url, "resolving session");

        let response = self
            .http
            .post(self.service.api_url.clone())
            .form(&form)
            .send()
            .await?;

        let body = response.text().await?;
        let parsed: ControlResponse =
            serde_json::from_str(&body).map_err(|e| Error::MalformedResponse {
                message: format!("invalid JSON: {e}"),
            })?;

        if let Some(code) = parsed.error_code {
            let message = parsed
                .error_message
                .unwrap_or_else(|| format!("error code {code}"));
            tracing::warn!(code, %message, "account service rejected login");
            return Err(Error::InvalidCredentials { message });
        }

        let config = parsed.config.ok_or_else(|| malformed("missing config block"))?;
        let server_host = config.server_ip.ok_or_else(|| malformed("missing serverIP"))?;
        let server_port = config
            .server_port
            .ok_or_else(|| malformed("missing serverPort"))?;
        let token = config.token.ok_or_else(|| malformed("missing token"))?;

        let mut devices: Vec<CatalogDevice> = Vec::new();
        for installation in config.inst {
            for raw in installation.devices {
                let name = raw
                    .name
                    .unwrap_or_else(|| format!("Device {}", raw.id));
                devices.push(CatalogDevice {
                    id: raw.id,
                    name,
                    model_id: raw.model_id,
                    widgets: raw.widgets,
                });
            }
        }

        let mut snapshot = Vec::new();
        if let Some(status) = parsed.status {
            for entry in status.status {
                // Some accounts report datapoints for devices that never
                // appear in any installation; give those a placeholder
                // catalog entry so their state stays addressable.
                if !devices.iter().any(|d| d.id == entry.device_id) {
                    devices.push(CatalogDevice {
                        id: entry.device_id.clone(),
                        name: format!("Device {}", entry.device_id),
                        model_id: None,
                        widgets: vec![42],
                    });
                }
                snapshot.push(StatusEntry {
                    device_id: entry.device_id,
                    uid: entry.uid,
                    value: entry.value,
                });
            }
        }

        tracing::info!(
            host = %server_host,
            port = server_port,
            devices = devices.len(),
            datapoints = snapshot.len(),
            "session resolved"
        );

        Ok(Session {
            server_host,
            server_port,
            token,
            devices,
            snapshot,
        })
    }
}

fn malformed(message: &str) -> Error {
    Error::MalformedResponse {
        message: message.to_owned(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn presets_have_valid_urls() {
        assert_eq!(
            AccountService::intesis_home().api_url.as_str(),
            "https://user.intesishome.com/api.php/get/control"
        );
        assert_eq!(AccountService::aircon_with_me().api_version, "1.6.2");
        assert_eq!(AccountService::anywair().api_version, "2.9");
    }

    #[test]
    fn opaque_id_accepts_numbers_and_strings() {
        let raw: RawStatus =
            serde_json::from_str(r#"{"deviceId":12015601252591,"uid":1,"value":0}"#).unwrap();
        assert_eq!(raw.device_id, "12015601252591");

        let raw: RawStatus =
            serde_json::from_str(r#"{"deviceId":"abc123","uid":1,"value":0}"#).unwrap();
        assert_eq!(raw.device_id, "abc123");
    }

    #[test]
    fn opaque_id_rejects_other_shapes() {
        let result: Result<RawStatus, _> =
            serde_json::from_str(r#"{"deviceId":[1],"uid":1,"value":0}"#);
        assert!(result.is_err());
    }
}
