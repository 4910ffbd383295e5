//! Per-container trust levels and the resolver that maps a caller onto one.
//!
//! Permission rows are sparse: a missing overlay row means [`PermissionLevel::None`]
//! unless the caller is an admin, who holds [`PermissionLevel::Su`] everywhere
//! without consulting the overlay at all.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SharedError;
use crate::types::{Identity, Role, RoomId, SectionId};

/// Capability level, ordered `None < ReadOnly < ReadWrite < Su`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PermissionLevel {
    None,
    /// Stored as `444`.
    ReadOnly,
    /// Stored as `777`.
    ReadWrite,
    Su,
}

impl PermissionLevel {
    /// Parse a stored or submitted token.
    ///
    /// Accepts `su`, `777`/`rw`, `444`/`ro` and `null`/`none`
    /// (case-insensitive). Anything else is rejected rather than coerced.
    pub fn parse(token: &str) -> Result<Self, SharedError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "su" => Ok(Self::Su),
            "777" | "rw" => Ok(Self::ReadWrite),
            "444" | "ro" => Ok(Self::ReadOnly),
            "null" | "none" => Ok(Self::None),
            _ => Err(SharedError::InvalidPermission(token.to_string())),
        }
    }

    /// Canonical storage token.
    pub fn as_token(&self) -> &'static str {
        match self {
            Self::Su => "su",
            Self::ReadWrite => "777",
            Self::ReadOnly => "444",
            Self::None => "Null",
        }
    }

    pub fn can_view(&self) -> bool {
        *self >= Self::ReadOnly
    }

    /// Send chat messages / post forum threads and replies.
    pub fn can_send(&self) -> bool {
        *self >= Self::ReadWrite
    }

    pub fn can_post(&self) -> bool {
        self.can_send()
    }

    /// Whether a holder of this level may delete an item; `is_own` is true
    /// when the caller authored it.
    pub fn can_delete(&self, is_own: bool) -> bool {
        match self {
            Self::Su => true,
            Self::ReadWrite => is_own,
            Self::ReadOnly | Self::None => false,
        }
    }

    /// Combine a role with the overlay row for one container.
    pub fn resolve(role: Role, overlay: Option<PermissionLevel>) -> PermissionLevel {
        if role == Role::Admin {
            return PermissionLevel::Su;
        }
        overlay.unwrap_or(PermissionLevel::None)
    }

    /// Full resolver contract: an absent caller or absent container yields
    /// `None`; admins yield `Su` without the overlay lookup running.
    pub fn resolve_for<F, E>(
        identity: Option<&Identity>,
        container: Option<Container>,
        overlay: F,
    ) -> Result<PermissionLevel, E>
    where
        F: FnOnce(&Identity, Container) -> Result<Option<PermissionLevel>, E>,
    {
        let (Some(identity), Some(container)) = (identity, container) else {
            return Ok(PermissionLevel::None);
        };
        if identity.is_admin() {
            return Ok(PermissionLevel::Su);
        }
        Ok(Self::resolve(identity.role, overlay(identity, container)?))
    }
}

impl FromStr for PermissionLevel {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PermissionLevel {
    type Error = SharedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PermissionLevel> for String {
    fn from(level: PermissionLevel) -> Self {
        level.as_token().to_string()
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

/// A permission-gated container: a chat room or a forum section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Container {
    Room(RoomId),
    Section(SectionId),
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Container::Room(id) => write!(f, "room:{id}"),
            Container::Section(id) => write!(f, "section:{id}"),
        }
    }
}
