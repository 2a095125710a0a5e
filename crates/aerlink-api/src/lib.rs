// aerlink-api: Wire-level client for Aerlink-compatible cloud climate services

pub mod auth;
pub mod codec;
pub mod error;

pub use auth::{AccountClient, AccountService, CatalogDevice, Session, StatusEntry};
pub use codec::{Event, FrameCodec};
pub use error::Error;
