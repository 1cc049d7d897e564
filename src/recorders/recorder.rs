//! Recorder lifecycle contract and the factory seam used by the manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::error::RecorderError;
use crate::live::LiveRoom;

/// Lifecycle of a single recorder. No transition leaves `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Created,
    Running,
    /// Started, but the capture worker ended on its own. Still awaits a
    /// terminal call.
    Exited,
    Closed,
}

impl RecorderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Closed => "closed",
        }
    }
}

/// One capture worker bound to exactly one room.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Begin capturing. The token bounds the recorder's whole lifetime, not
    /// the request that started it. Must not be called twice.
    async fn start(&self, ctx: CancellationToken) -> Result<(), RecorderError>;

    /// Full teardown: stop capturing, finalize output, release everything.
    async fn close(&self) -> Result<(), RecorderError>;

    /// Stop capturing and finalize the current output unit; a successor
    /// recorder continues monitoring the same room right away.
    async fn close_for_restart(&self) -> Result<(), RecorderError>;

    async fn state(&self) -> RecorderState;
}

/// Builds a recorder for a room without starting it.
pub trait RecorderFactory: Send + Sync {
    fn create(
        &self,
        ctx: CancellationToken,
        room: Arc<dyn LiveRoom>,
    ) -> Result<Arc<dyn Recorder>, RecorderError>;
}

impl<F> RecorderFactory for F
where
    F: Fn(CancellationToken, Arc<dyn LiveRoom>) -> Result<Arc<dyn Recorder>, RecorderError>
        + Send
        + Sync,
{
    fn create(
        &self,
        ctx: CancellationToken,
        room: Arc<dyn LiveRoom>,
    ) -> Result<Arc<dyn Recorder>, RecorderError> {
        self(ctx, room)
    }
}
