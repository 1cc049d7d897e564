use crate::api::ApiServer;
use crate::config::Config;
use crate::live::{LiveRoom, StaticRoom};
use crate::recorders::{Manager, ProcessRecorderFactory};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_service(config_path: Option<&Path>) -> Result<()> {
    info!("Starting liverec service");

    let config = Config::load(config_path)?;
    let settings = config.recorder.settings()?;
    info!("Recordings are written to {:?}", settings.output_dir);

    let shutdown = CancellationToken::new();
    let factory = Arc::new(ProcessRecorderFactory::new(settings));
    let manager = Arc::new(Manager::new(shutdown.child_token(), factory));

    register_rooms(&manager, &config.rooms).await;

    let api_server = ApiServer::new(Arc::clone(&manager), &config.api);
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.start(api_shutdown).await {
            error!("API server failed: {}", e);
        }
    });

    info!("liverec is ready, recording {} room(s)", manager.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    manager.shutdown().await;
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        warn!("API server task ended abnormally: {}", e);
    }

    info!("liverec stopped");
    Ok(())
}

/// Start recorders for the configured rooms concurrently.
///
/// Rooms that fail to start are logged and left unregistered; they can be
/// added again through the API.
pub async fn register_rooms(manager: &Arc<Manager>, rooms: &[StaticRoom]) {
    let mut tasks = JoinSet::new();

    for room in rooms {
        let manager = Arc::clone(manager);
        let room: Arc<dyn LiveRoom> = Arc::new(room.clone());
        tasks.spawn(async move {
            let id = room.id();
            let result = manager.add_recorder(&CancellationToken::new(), room).await;
            (id, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((id, Err(e))) if e.is_expected_state() => {
                info!("Room {} not added: {}", id, e)
            }
            Ok((id, Err(e))) => warn!("Failed to start recorder for room {}: {}", id, e),
            Err(e) => error!("Recorder registration task failed: {}", e),
        }
    }
}
