// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The log handler: level filter, buffering policy and delivery dispatch.
//!
//! In [`DeliveryMode::Batching`] the handler moves between three states:
//!
//! ```text
//!   Idle ──write──> Accumulating ──size or age trigger──> Flushing
//!    ^                                                       │
//!    └──────────────── buffer cleared ───────────────────────┘
//! ```
//!
//! Triggers are evaluated on `write` only. Stale entries wait for the next
//! write, an explicit [`LogHandler::flush`], or the optional background ticker
//! started by [`LogHandler::into_shared`].
//!
//! A handler is a single-writer resource. Share it across tasks through
//! [`SharedHandler`], whose mutex serializes writes and flushes.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{build_sender, dispatch_chunks, ChunkOutcome, LogSender};
use crate::clock::{Clock, SystemClock};
use crate::config::{
    clamp_buffer_size, clamp_flush_timeout, BatchConfig, Config, DeliveryMode,
};
use crate::error::{ConfigError, DeliveryError};
use crate::fallback::{FallbackStats, FallbackStore};
use crate::formatter::{FormattedEntry, Formatter};
use crate::record::{Level, LogRecord};
use crate::status::ServiceStatusCache;

/// Number of failed messages quoted in a flush failure summary.
const FAILURE_SAMPLE_SIZE: usize = 3;

pub type SharedHandler = Arc<Mutex<LogHandler>>;

#[derive(Debug)]
struct BufferedEntry {
    entry: FormattedEntry,
    record: LogRecord,
    enqueued_at: Instant,
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub chunks: usize,
    pub entries: usize,
    pub failed_chunks: usize,
    pub failed_entries: usize,
    /// Failed entries persisted to the fallback store.
    pub cached: usize,
}

impl FlushSummary {
    pub fn is_success(&self) -> bool {
        self.failed_chunks == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub service_available: bool,
    pub endpoint: String,
    pub last_check: Option<String>,
    pub mode: DeliveryMode,
    pub batch_enabled: bool,
    pub batch_buffer_size: usize,
    pub batch_flush_timeout_secs: u64,
    pub batch_chunk_size: usize,
    pub buffered: usize,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub fallback: Option<FallbackStats>,
}

#[derive(Debug)]
pub struct LogHandler {
    sender: Arc<dyn LogSender>,
    formatter: Formatter,
    clock: Arc<dyn Clock>,
    mode: DeliveryMode,
    min_level: Level,
    batch: BatchConfig,
    buffer: Vec<BufferedEntry>,
    last_flush: Instant,
    status_cache: ServiceStatusCache,
    last_check: Option<DateTime<Utc>>,
    /// Wall time paired with the clock reading taken at construction.
    wall_anchor: (Instant, DateTime<Utc>),
    fallback: FallbackStore,
    fallback_enabled: bool,
}

impl LogHandler {
    /// Build a handler that delivers over HTTP.
    ///
    /// # Errors
    /// See [`build_sender`].
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let sender = build_sender(config)?;
        Ok(Self::with_sender(config, sender, Arc::new(SystemClock)))
    }

    /// Build a handler around an existing sender and clock.
    pub fn with_sender(config: &Config, sender: Arc<dyn LogSender>, clock: Arc<dyn Clock>) -> Self {
        let status_cache = ServiceStatusCache::new(
            Arc::clone(&clock),
            config.status_cache.enabled,
            config.status_cache.ttl,
        );
        let now = clock.now();
        LogHandler {
            sender,
            formatter: Formatter::new(&config.format),
            last_flush: now,
            clock,
            mode: config.mode,
            min_level: config.min_level,
            batch: config.batch.clamped(),
            buffer: Vec::new(),
            status_cache,
            last_check: None,
            wall_anchor: (now, Utc::now()),
            fallback: FallbackStore::from_config(&config.fallback),
            fallback_enabled: config.fallback.enabled,
        }
    }

    /// Accept one record.
    ///
    /// Delivery failures are logged and, when the fallback store is active,
    /// persisted. They are never returned.
    pub async fn write(&mut self, record: LogRecord) {
        if record.level < self.min_level {
            return;
        }

        if !self.mode.is_batching() {
            let entry = self.formatter.format(&record);
            if let Err(e) = self.sender.send(&entry).await {
                error!("NOTIFYFREE | Failed to send log entry: {e}");
                self.persist_failed(vec![entry], &e).await;
            }
            return;
        }

        if self.is_stale() {
            debug!("NOTIFYFREE | Flush timeout elapsed, flushing before write");
            self.flush().await;
        }

        let entry = self.formatter.format(&record);
        self.buffer.push(BufferedEntry {
            entry,
            record,
            enqueued_at: self.clock.now(),
        });

        if self.buffer.len() >= self.batch.buffer_size {
            debug!(
                "NOTIFYFREE | Buffer reached {} entries, flushing",
                self.buffer.len()
            );
            self.flush().await;
        }
    }

    /// Deliver every buffered entry in concurrent chunks.
    ///
    /// The buffer is empty afterwards whatever the outcome.
    pub async fn flush(&mut self) -> FlushSummary {
        self.deliver_buffer(false).await
    }

    /// Flush only when entries are buffered and the flush timeout has elapsed
    /// since the last flush.
    pub async fn flush_if_stale(&mut self) -> Option<FlushSummary> {
        if self.is_stale() {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Final strictly sequential flush. Errors are logged, never returned.
    pub async fn shutdown(mut self) -> FlushSummary {
        let summary = self.deliver_buffer(true).await;
        debug!(
            "NOTIFYFREE | Handler shut down after delivering {} of {} buffered entries",
            summary.entries - summary.failed_entries,
            summary.entries
        );
        summary
    }

    /// Discard buffered entries without sending. Returns how many were dropped.
    pub fn clear_buffer(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    /// Values below the floor are raised to it.
    pub fn set_buffer_size(&mut self, size: usize) {
        self.batch.buffer_size = clamp_buffer_size(size);
    }

    /// Values below the floor are raised to it.
    pub fn set_flush_timeout(&mut self, timeout: Duration) {
        self.batch.flush_timeout = clamp_flush_timeout(timeout);
    }

    /// Switch between batching and immediate delivery. Turning batching off
    /// flushes the buffer first.
    pub async fn set_batch_enabled(&mut self, enabled: bool) {
        if enabled {
            self.mode = DeliveryMode::Batching;
        } else if self.mode.is_batching() {
            self.flush().await;
            self.mode = DeliveryMode::Basic;
        }
    }

    pub fn set_cache_enabled(&mut self, enabled: bool) {
        self.status_cache.set_enabled(enabled);
    }

    pub fn invalidate_service_status_cache(&mut self) {
        self.status_cache.invalidate();
    }

    /// Probe the endpoint, reusing a cached result while it is fresh.
    pub async fn test_connection(&mut self) -> bool {
        if let Some(available) = self.status_cache.get() {
            return available;
        }
        let available = self.sender.test_connection().await;
        self.last_check = Some(self.wall_now());
        self.status_cache.store(available);
        available
    }

    pub async fn service_status(&mut self) -> ServiceStatus {
        let service_available = self.test_connection().await;
        let fallback = match self.fallback_store().map(FallbackStore::stats) {
            Some(Ok(stats)) => Some(stats),
            Some(Err(e)) => {
                warn!("NOTIFYFREE | Failed to read fallback store stats: {e}");
                None
            }
            None => None,
        };

        ServiceStatus {
            service_available,
            endpoint: self.sender.endpoint().to_string(),
            last_check: self
                .last_check
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, false)),
            mode: self.mode,
            batch_enabled: self.mode.is_batching(),
            batch_buffer_size: self.batch.buffer_size,
            batch_flush_timeout_secs: self.batch.flush_timeout.as_secs(),
            batch_chunk_size: self.batch.chunk_size,
            buffered: self.buffer.len(),
            cache_enabled: self.status_cache.is_enabled(),
            cache_ttl_secs: self.status_cache.ttl().as_secs(),
            fallback,
        }
    }

    pub async fn log_service_status(&mut self) {
        let status = self.service_status().await;
        if status.service_available {
            info!(
                "NOTIFYFREE | Service available at {} (mode: {}, buffered: {})",
                status.endpoint, status.mode, status.buffered
            );
        } else {
            warn!(
                "NOTIFYFREE | Service unavailable at {} (mode: {}, buffered: {})",
                status.endpoint, status.mode, status.buffered
            );
        }
    }

    /// Wrap the handler for use from several tasks.
    ///
    /// When background flushing is configured, a ticker is started that
    /// stops once `cancel` fires.
    pub fn into_shared(self, cancel: CancellationToken) -> (SharedHandler, Option<JoinHandle<()>>) {
        let background = self.batch.background_flush;
        let shared = Arc::new(Mutex::new(self));
        let ticker = background.then(|| spawn_flush_ticker(Arc::clone(&shared), cancel));
        (shared, ticker)
    }

    fn is_stale(&self) -> bool {
        !self.buffer.is_empty()
            && self.clock.now().saturating_duration_since(self.last_flush)
                >= self.batch.flush_timeout
    }

    fn fallback_store(&self) -> Option<&FallbackStore> {
        (self.fallback_enabled || self.mode.forces_fallback()).then_some(&self.fallback)
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let (anchor, wall) = self.wall_anchor;
        let elapsed = self.clock.now().saturating_duration_since(anchor);
        TimeDelta::from_std(elapsed).map_or(wall, |delta| wall + delta)
    }

    /// Writes run on the blocking pool since the store lock may be contended.
    async fn persist_failed(&self, entries: Vec<FormattedEntry>, reason: &DeliveryError) -> usize {
        let Some(store) = self.fallback_store().cloned() else {
            return 0;
        };
        let reason = reason.to_string();
        let written = tokio::task::spawn_blocking(move || {
            entries
                .iter()
                .filter(|entry| match store.cache(entry, &reason) {
                    Ok(()) => true,
                    Err(e) => {
                        error!("NOTIFYFREE | Failed to write fallback store: {e}");
                        false
                    }
                })
                .count()
        })
        .await;
        written.unwrap_or_else(|e| {
            error!("NOTIFYFREE | Fallback write task failed: {e}");
            0
        })
    }

    async fn deliver_buffer(&mut self, sequential: bool) -> FlushSummary {
        if self.buffer.is_empty() {
            return FlushSummary::default();
        }

        let buffered = std::mem::take(&mut self.buffer);
        let oldest_wait = buffered
            .first()
            .map(|b| self.clock.now().saturating_duration_since(b.enqueued_at))
            .unwrap_or_default();
        let chunk_size = self.batch.chunk_size.max(1);
        let chunks: Vec<Vec<FormattedEntry>> = buffered
            .chunks(chunk_size)
            .map(|chunk| chunk.iter().map(|b| b.entry.clone()).collect())
            .collect();

        let mut summary = FlushSummary {
            chunks: chunks.len(),
            entries: buffered.len(),
            ..FlushSummary::default()
        };

        let outcomes = if sequential {
            let mut outcomes = Vec::with_capacity(chunks.len());
            for (index, chunk) in chunks.into_iter().enumerate() {
                outcomes.push(ChunkOutcome {
                    index,
                    size: chunk.len(),
                    result: self.sender.send_batch(&chunk).await,
                });
            }
            outcomes
        } else {
            dispatch_chunks(Arc::clone(&self.sender), chunks).await
        };

        let mut sample = Vec::new();
        for outcome in &outcomes {
            let Err(e) = &outcome.result else {
                continue;
            };
            let start = outcome.index * chunk_size;
            let failed = buffered.get(start..start + outcome.size).unwrap_or_default();

            summary.failed_chunks += 1;
            summary.failed_entries += failed.len();
            debug!(
                "NOTIFYFREE | Chunk {} of {} ({} entries) failed: {e}",
                outcome.index + 1,
                summary.chunks,
                outcome.size
            );

            let entries: Vec<FormattedEntry> = failed.iter().map(|b| b.entry.clone()).collect();
            summary.cached += self.persist_failed(entries, e).await;
            sample.extend(
                failed
                    .iter()
                    .take(FAILURE_SAMPLE_SIZE.saturating_sub(sample.len()))
                    .map(|b| b.record.message.clone()),
            );
        }

        if summary.failed_chunks > 0 {
            error!(
                "NOTIFYFREE | Failed to deliver {} of {} chunks ({} of {} entries, {} cached). First messages: {:?}",
                summary.failed_chunks,
                summary.chunks,
                summary.failed_entries,
                summary.entries,
                summary.cached,
                sample
            );
        } else {
            debug!(
                "NOTIFYFREE | Flushed {} entries in {} chunks, oldest waited {} ms",
                summary.entries,
                summary.chunks,
                oldest_wait.as_millis()
            );
        }

        self.last_flush = self.clock.now();
        summary
    }
}

impl Drop for LogHandler {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                "NOTIFYFREE | Handler dropped with {} unflushed entries, they are lost",
                self.buffer.len()
            );
        }
    }
}

/// Periodically flush stale entries until `cancel` fires.
pub fn spawn_flush_ticker(handler: SharedHandler, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = handler.lock().await.batch.flush_timeout;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("NOTIFYFREE | Flush ticker cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let mut handler = handler.lock().await;
                    if let Some(summary) = handler.flush_if_stale().await {
                        debug!("NOTIFYFREE | Background flush sent {} entries", summary.entries);
                    }
                }
            }
        }
    })
}
