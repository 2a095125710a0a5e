// aerlink-core: Session, connection, and state engine between aerlink-api
// and consumers.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod model;
pub mod observer;

mod reconcile;
mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ControllerConfig;
pub use connection::{ConnectionState, ReconnectConfig};
pub use controller::Controller;
pub use error::CoreError;
pub use observer::{CallbackId, Update, UpdateStream, ValueChange};

// Re-export model types at the crate root for ergonomics.
pub use model::{Device, DeviceId, FaultInfo, Feature, Mode, Value, fault_info};

// The wire layer consumers need for configuration.
pub use aerlink_api::{AccountClient, AccountService};
