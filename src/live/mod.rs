//! Room identity as seen by the recorder registry.
//!
//! Resolving a room's stream URL and metadata belongs to the platform layer;
//! the registry only needs a stable identifier and a place to log into.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Span;

/// Stable identifier of a monitored room. Keys the recorder registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A monitorable live room.
pub trait LiveRoom: Send + Sync {
    fn id(&self) -> RoomId;

    /// Span that recorder lifecycle events for this room are logged under.
    fn span(&self) -> Span;

    /// Upstream stream location handed to the capture process.
    fn stream_url(&self) -> &str;
}

/// A room whose stream URL is known up front, e.g. from the config file or an API request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRoom {
    pub id: RoomId,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl StaticRoom {
    pub fn new(id: impl Into<RoomId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl LiveRoom for StaticRoom {
    fn id(&self) -> RoomId {
        self.id.clone()
    }

    fn span(&self) -> Span {
        tracing::info_span!(
            "room",
            id = %self.id,
            room_name = self.name.as_deref().unwrap_or("")
        )
    }

    fn stream_url(&self) -> &str {
        &self.url
    }
}
