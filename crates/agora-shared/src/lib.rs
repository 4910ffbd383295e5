//! # agora-shared
//!
//! Types shared by the Agora store and server: identifier newtypes, the
//! permission model, the WebSocket wire protocol, and the content
//! sanitizer applied on every write path.

pub mod constants;
pub mod error;
pub mod permission;
pub mod protocol;
pub mod sanitize;
pub mod types;

pub use error::SharedError;
pub use permission::{Container, PermissionLevel};
pub use types::{utc_now, Identity, Role, UserSummary};
