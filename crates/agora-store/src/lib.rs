//! # agora-store
//!
//! Relational storage for Agora chat rooms and forum sections, backed by
//! SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model. Multi-row writes (repeat-collapse, thread deletion, user deletion)
//! run inside a single transaction so they either fully apply or not at all.

pub mod database;
pub mod forum;
pub mod last_views;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod permissions;
pub mod rooms;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
