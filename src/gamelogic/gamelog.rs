//! War outcome log: the record, where it is stored, and the worker that
//! drains the `game_logs` queue into storage.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::{
    // ---
    lock_ignore_poison,
    log_info,
    log_warn,
    publish_binary,
    routing,
    subscribe_binary,
    AckVerdict,
    Durability,
    Handler,
    PerilError,
    Result,
    RoutingTarget,
    SubscribeOptions,
    SubscriptionTask,
    Transport,
    TransportPtr,
};

/// One line of game history, carried with the binary codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: DateTime<Utc>,
    pub message: String,
    pub username: String,
}

impl GameLog {
    pub fn now(username: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            current_time: Utc::now(),
            message: message.into(),
            username: username.into(),
        }
    }
}

/// Storage for received game logs.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// # Errors
    ///
    /// [`PerilError::Sink`] if the record could not be stored. The worker
    /// requeues the message so the insert is attempted again.
    async fn insert(&self, log: &GameLog) -> Result<()>;
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<GameLog>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<GameLog> {
        lock_ignore_poison(&self.records).clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn insert(&self, log: &GameLog) -> Result<()> {
        // ---
        lock_ignore_poison(&self.records).push(log.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn insert(&self, log: &GameLog) -> Result<()> {
        // ---
        let mut line = serde_json::to_vec(log).map_err(|e| PerilError::Sink(format!("encode: {e}")))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PerilError::Sink(format!("open {}: {e}", self.path.display())))?;

        file.write_all(&line)
            .await
            .map_err(|e| PerilError::Sink(format!("write {}: {e}", self.path.display())))?;
        file.flush()
            .await
            .map_err(|e| PerilError::Sink(format!("flush {}: {e}", self.path.display())))
    }
}

/// Handler storing each received log in `sink`.
pub fn game_log_handler(sink: Arc<dyn LogSink>) -> impl Handler<GameLog> {
    // ---
    move |log: GameLog| {
        let sink = sink.clone();
        async move {
            match sink.insert(&log).await {
                Ok(()) => {
                    log_info!("game log from {}: {}", log.username, log.message);
                    AckVerdict::Ack
                }
                Err(e) => {
                    log_warn!("game log from {} not stored: {e}", log.username);
                    AckVerdict::RequeueRetry
                }
            }
        }
    }
}

/// Publish `log` to `game_logs.<username>`.
pub async fn publish_game_log(transport: &dyn Transport, log: &GameLog) -> Result<()> {
    // ---
    let key = routing::dotted(routing::GAME_LOG_SLUG, &log.username);
    publish_binary(transport, routing::EXCHANGE_PERIL_TOPIC, &key, log).await
}

/// Queue and binding the worker consumes.
pub fn game_log_target() -> RoutingTarget {
    RoutingTarget::new(
        routing::EXCHANGE_PERIL_TOPIC,
        routing::GAME_LOG_SLUG,
        routing::any_player(routing::GAME_LOG_SLUG),
        Durability::Transient,
    )
}

/// Declare the `game_logs` queue and start consuming it into `sink`.
///
/// # Errors
///
/// Topology and consumer registration errors from [`subscribe_binary`].
pub async fn start_game_log_worker(
    transport: &TransportPtr,
    sink: Arc<dyn LogSink>,
    options: SubscribeOptions,
) -> Result<SubscriptionTask> {
    // ---
    let target = game_log_target();
    crate::declare_and_bind(transport.as_ref(), &target).await?;

    subscribe_binary(transport, &target, game_log_handler(sink), options.skip_declare()).await
}
