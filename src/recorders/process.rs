//! Recorder backed by an external capture process (ffmpeg by default).
//!
//! The process is spawned on `start` and supervised by a background task.
//! Teardown asks the process to finalize its output by writing `q` to its
//! stdin, then kills it if it does not exit within the configured timeout.
//!
//! Only a room's first recorder checks free disk space and announces the
//! start. A successor built after `close_for_restart` continues silently,
//! and only a full `close` announces the stop.

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::error::RecorderError;
use super::recorder::{Recorder, RecorderFactory, RecorderState};
use crate::config::ByteSize;
use crate::live::{LiveRoom, RoomId};
use crate::notify::{diskspace, LogNotifier, Notifier, RecordingEvent};

pub const URL_PLACEHOLDER: &str = "{url}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

const MAX_SEGMENT_SUFFIX: u32 = 1000;

#[derive(Debug, Clone)]
pub struct ProcessRecorderSettings {
    /// Recordings land in `<output_dir>/<room id>/`.
    pub output_dir: PathBuf,
    /// Argument vector; `{url}` and `{output}` are substituted per argument.
    pub command: Vec<String>,
    pub extension: String,
    pub close_timeout: Duration,
    /// Required before a room's first segment. Zero disables the check.
    pub min_free_space: ByteSize,
}

impl ProcessRecorderSettings {
    fn render(&self, url: &str, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.command
            .iter()
            .map(|arg| {
                arg.replace(URL_PLACEHOLDER, url)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

/// Everything the recorders of one factory have in common.
struct Shared {
    settings: ProcessRecorderSettings,
    notifier: Arc<dyn Notifier>,
    /// Rooms closed for a restart whose successor has not been built yet.
    handoffs: DashSet<RoomId>,
}

impl Shared {
    fn new(settings: ProcessRecorderSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            settings,
            notifier,
            handoffs: DashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Close,
    Restart,
}

#[derive(Default)]
struct Lifecycle {
    cancel: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
    output: Option<PathBuf>,
}

pub struct ProcessRecorder {
    room: Arc<dyn LiveRoom>,
    shared: Arc<Shared>,
    /// Continues a room after a hand-off rather than starting it.
    resumed: bool,
    state: Arc<watch::Sender<RecorderState>>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProcessRecorder {
    fn new(room: Arc<dyn LiveRoom>, shared: Arc<Shared>, resumed: bool) -> Self {
        let (state, _) = watch::channel(RecorderState::Created);
        Self {
            room,
            shared,
            resumed,
            state: Arc::new(state),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// File the current (or last) capture process writes to.
    pub async fn output_path(&self) -> Option<PathBuf> {
        self.lifecycle.lock().await.output.clone()
    }

    fn current_state(&self) -> RecorderState {
        *self.state.borrow()
    }

    async fn prepare_output(&self) -> Result<PathBuf, RecorderError> {
        let id = self.room.id();
        let dir = self.shared.settings.output_dir.join(id.as_str());
        let extension = self.shared.settings.extension.clone();
        let required = if self.resumed {
            ByteSize(0)
        } else {
            self.shared.settings.min_free_space
        };

        let prepared = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create recording directory {:?}", dir))?;
            diskspace::ensure_free_space(&dir, required)?;

            let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
            next_segment_path(&dir, &id, &timestamp, &extension)
        })
        .await
        .map_err(|e| anyhow!("Output preparation task failed: {}", e))?;

        Ok(prepared?)
    }

    fn spawn_process(&self, output: &Path) -> Result<Child, RecorderError> {
        let argv = self.shared.settings.render(self.room.stream_url(), output);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("Recorder command is empty"))?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn capture process `{}`", program))?;

        Ok(child)
    }

    async fn notify(&self, event: RecordingEvent) {
        if let Err(e) = self.shared.notifier.notify(self.room.as_ref(), event).await {
            warn!("Failed to send recording {} notification: {}", event.as_str(), e);
        }
    }

    async fn teardown(&self, kind: Teardown) -> Result<(), RecorderError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.current_state() {
            RecorderState::Closed => {
                return match kind {
                    Teardown::Close => Ok(()),
                    Teardown::Restart => Err(RecorderError::Closed),
                };
            }
            RecorderState::Created => {
                self.state.send_replace(RecorderState::Closed);
                return Ok(());
            }
            RecorderState::Running | RecorderState::Exited => {}
        }

        if let Some(cancel) = lifecycle.cancel.take() {
            cancel.cancel();
        }
        let joined = match lifecycle.supervisor.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        };
        self.state.send_replace(RecorderState::Closed);

        joined.map_err(|e| anyhow!("Capture supervisor task failed: {}", e))?;

        match kind {
            Teardown::Close => {
                info!("Recording stopped: {:?}", lifecycle.output);
                self.notify(RecordingEvent::Stopped).await;
            }
            Teardown::Restart => {
                self.shared.handoffs.insert(self.room.id());
                info!("Segment finalized, successor takes over: {:?}", lifecycle.output);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Recorder for ProcessRecorder {
    async fn start(&self, ctx: CancellationToken) -> Result<(), RecorderError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.current_state() {
            RecorderState::Created => {}
            RecorderState::Running | RecorderState::Exited => {
                return Err(RecorderError::AlreadyStarted)
            }
            RecorderState::Closed => return Err(RecorderError::Closed),
        }

        let spawned = match self.prepare_output().await {
            Ok(output) => self.spawn_process(&output).map(|child| (child, output)),
            Err(err) => Err(err),
        };
        let (mut child, output) = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                // A failed start consumes the recorder
                self.state.send_replace(RecorderState::Closed);
                return Err(err);
            }
        };

        // Running before the supervisor can report an early exit
        self.state.send_replace(RecorderState::Running);

        let cancel = ctx.child_token();
        let stdin = child.stdin.take();
        let supervisor = tokio::spawn(
            supervise(
                child,
                stdin,
                cancel.clone(),
                Arc::clone(&self.state),
                self.shared.settings.close_timeout,
            )
            .instrument(self.room.span()),
        );

        info!("Recording started: {:?}", output);
        lifecycle.cancel = Some(cancel);
        lifecycle.supervisor = Some(supervisor);
        lifecycle.output = Some(output);

        if !self.resumed {
            self.notify(RecordingEvent::Started).await;
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), RecorderError> {
        self.teardown(Teardown::Close).await
    }

    async fn close_for_restart(&self) -> Result<(), RecorderError> {
        self.teardown(Teardown::Restart).await
    }

    async fn state(&self) -> RecorderState {
        self.current_state()
    }
}

/// `<dir>/<id>-<timestamp>.<ext>`, suffixed `-1`, `-2`, ... when taken.
fn next_segment_path(
    dir: &Path,
    id: &RoomId,
    timestamp: &str,
    extension: &str,
) -> anyhow::Result<PathBuf> {
    let path = dir.join(format!("{}-{}.{}", id, timestamp, extension));
    if !path.exists() {
        return Ok(path);
    }

    // Restarts within the same second would otherwise overwrite the previous segment
    for i in 1..MAX_SEGMENT_SUFFIX {
        let alt_path = dir.join(format!("{}-{}-{}.{}", id, timestamp, i, extension));
        if !alt_path.exists() {
            return Ok(alt_path);
        }
    }

    bail!("No free segment name left for {:?}", path)
}

async fn supervise(
    mut child: Child,
    stdin: Option<ChildStdin>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<RecorderState>>,
    close_timeout: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => warn!("Capture process exited on its own"),
                Ok(status) => warn!("Capture process exited with {}", status),
                Err(e) => error!("Failed to wait on capture process: {}", e),
            }
            state.send_if_modified(|state| {
                if *state == RecorderState::Running {
                    *state = RecorderState::Exited;
                    true
                } else {
                    false
                }
            });
            return;
        }
        _ = cancel.cancelled() => {}
    }

    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(b"q\n").await {
            debug!("Could not signal capture process to finalize: {}", e);
        }
    }

    match tokio::time::timeout(close_timeout, child.wait()).await {
        Ok(Ok(status)) => debug!("Capture process finalized with {}", status),
        Ok(Err(e)) => warn!("Failed to wait on capture process: {}", e),
        Err(_) => {
            warn!(
                "Capture process did not exit within {}s, killing it",
                close_timeout.as_secs_f32()
            );
            if let Err(e) = child.kill().await {
                error!("Failed to kill capture process: {}", e);
            }
        }
    }
}

/// Builds a [`ProcessRecorder`] per room from shared settings.
pub struct ProcessRecorderFactory {
    shared: Arc<Shared>,
}

impl ProcessRecorderFactory {
    /// Notifications go to the log.
    pub fn new(settings: ProcessRecorderSettings) -> Self {
        Self::with_notifier(settings, Arc::new(LogNotifier))
    }

    pub fn with_notifier(settings: ProcessRecorderSettings, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            shared: Arc::new(Shared::new(settings, notifier)),
        }
    }
}

impl RecorderFactory for ProcessRecorderFactory {
    fn create(
        &self,
        _ctx: CancellationToken,
        room: Arc<dyn LiveRoom>,
    ) -> Result<Arc<dyn Recorder>, RecorderError> {
        // A pending hand-off is used up even when the build fails
        let resumed = self.shared.handoffs.remove(&room.id()).is_some();
        if room.stream_url().trim().is_empty() {
            return Err(anyhow!("Room {} has no stream url", room.id()).into());
        }
        Ok(Arc::new(ProcessRecorder::new(
            room,
            Arc::clone(&self.shared),
            resumed,
        )))
    }
}
