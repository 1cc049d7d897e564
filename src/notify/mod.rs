//! Recording start/stop notifications.
//!
//! Delivery channels (push services, webhooks) plug in behind [`Notifier`];
//! the service logs notifications by default.

pub mod diskspace;

use async_trait::async_trait;
use tracing::info;

use crate::live::LiveRoom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEvent {
    /// A room began recording. Not sent for a segment hand-off.
    Started,
    /// A room stopped recording for good.
    Stopped,
}

impl RecordingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, room: &dyn LiveRoom, event: RecordingEvent) -> anyhow::Result<()>;
}

/// Writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, room: &dyn LiveRoom, event: RecordingEvent) -> anyhow::Result<()> {
        info!(room = %room.id(), "Recording {}", event.as_str());
        Ok(())
    }
}
