// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of formatted entries to the NotifyFree ingestion endpoint.
//!
//! ```text
//!   send(entry)          send_batch(entries)
//!       │                       │
//!       v                       v
//!   POST {endpoint}       POST {endpoint}/batch
//!       │                       │
//!       │                404 ───┴──> send(entry) for each entry
//!       v
//!   ┌────────────┐
//!   │   Retry?   │  2xx: done, 401: stop, else: sleep base * 2^(n-1)
//!   └────────────┘
//! ```
//!
//! [`LogSender`] is the seam between the handler and the network. [`Client`]
//! is the HTTP implementation; [`InertSender`] stands in when configuration is
//! incomplete and the host asked for degraded operation.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::config::{Config, MissingConfigPolicy};
use crate::error::{ConfigError, DeliveryError};
use crate::formatter::FormattedEntry;
use crate::http::get_client;

const BATCH_PATH: &str = "/batch";

#[async_trait]
pub trait LogSender: Send + Sync + std::fmt::Debug {
    /// Deliver a single entry.
    async fn send(&self, entry: &FormattedEntry) -> Result<(), DeliveryError>;

    /// Deliver entries in a single request. An empty slice is a no-op.
    async fn send_batch(&self, entries: &[FormattedEntry]) -> Result<(), DeliveryError>;

    /// Probe the endpoint. Never fails, unreachable is `false`.
    async fn test_connection(&self) -> bool;

    fn endpoint(&self) -> &str;
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    app_id: &'a str,
    messages: &'a [FormattedEntry],
}

enum PostOutcome {
    Delivered,
    NotFound,
}

/// HTTP delivery client with bounded retries and exponential backoff.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    batch_endpoint: String,
    app_id: String,
    retry_attempts: u32,
    backoff_base: Duration,
}

impl Client {
    /// Build a client from validated configuration.
    ///
    /// # Errors
    /// Any [`ConfigError`] from [`Config::validate`] or from building the
    /// underlying HTTP client.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let token = config.token.as_deref().unwrap_or_default();
        let http = get_client(token, config.timeout)?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();

        Ok(Client {
            http,
            batch_endpoint: format!("{endpoint}{BATCH_PATH}"),
            endpoint,
            app_id: config.app_id.clone().unwrap_or_default(),
            retry_attempts: config.retry_attempts.max(1),
            backoff_base: config.retry_backoff_base,
        })
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: Vec<u8>,
        not_found_is_final: bool,
    ) -> Result<PostOutcome, DeliveryError> {
        let mut attempts = 0;

        loop {
            let time = Instant::now();
            attempts += 1;
            let resp = self.http.post(url).body(body.clone()).send().await;
            let elapsed = time.elapsed();

            let cause = match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(PostOutcome::Delivered);
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        error!("NOTIFYFREE | Request was rejected: invalid token. Not retrying.");
                        return Err(DeliveryError::Auth);
                    }
                    if status == StatusCode::NOT_FOUND && not_found_is_final {
                        return Ok(PostOutcome::NotFound);
                    }
                    format!("unexpected status {status}")
                }
                Err(e) => e.to_string(),
            };

            if attempts >= self.retry_attempts {
                error!(
                    "NOTIFYFREE | Failed to send request after {} ms and {} attempts: {}",
                    elapsed.as_millis(),
                    attempts,
                    cause
                );
                return Err(DeliveryError::Network { attempts, cause });
            }

            let backoff = self.backoff_for(attempts);
            debug!(
                "NOTIFYFREE | Attempt {} to {} failed ({}), retrying in {} ms",
                attempts,
                url,
                cause,
                backoff.as_millis()
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// Sends entries one by one after the batch endpoint reported 404.
    async fn send_individually(&self, entries: &[FormattedEntry]) -> Result<(), DeliveryError> {
        let total = entries.len();
        let mut delivered = 0;
        for entry in entries {
            match self.send(entry).await {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Auth) => return Err(DeliveryError::Auth),
                Err(e) => debug!("NOTIFYFREE | Individual send failed: {e}"),
            }
        }

        if delivered * 2 > total {
            debug!("NOTIFYFREE | Batch fallback delivered {delivered} of {total} entries");
            Ok(())
        } else {
            Err(DeliveryError::PartialBatch { delivered, total })
        }
    }
}

#[async_trait]
impl LogSender for Client {
    async fn send(&self, entry: &FormattedEntry) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(entry)?;
        self.post_with_retry(&self.endpoint, body, false)
            .await
            .map(|_| ())
    }

    async fn send_batch(&self, entries: &[FormattedEntry]) -> Result<(), DeliveryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(&BatchPayload {
            app_id: &self.app_id,
            messages: entries,
        })?;

        match self
            .post_with_retry(&self.batch_endpoint, body, true)
            .await?
        {
            PostOutcome::Delivered => Ok(()),
            PostOutcome::NotFound => {
                warn!("NOTIFYFREE | Batch endpoint not found, sending entries individually");
                self.send_individually(entries).await
            }
        }
    }

    async fn test_connection(&self) -> bool {
        match self.http.head(&self.endpoint).send().await {
            Ok(resp) => matches!(
                resp.status(),
                StatusCode::OK | StatusCode::METHOD_NOT_ALLOWED
            ),
            Err(e) => {
                debug!("NOTIFYFREE | Connection test failed: {e}");
                false
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Sender used when configuration is incomplete.
///
/// Accepts everything, delivers nothing, and reports the service as
/// unavailable.
#[derive(Debug, Clone)]
pub struct InertSender {
    endpoint: String,
}

impl InertSender {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        InertSender {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LogSender for InertSender {
    async fn send(&self, _entry: &FormattedEntry) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn send_batch(&self, _entries: &[FormattedEntry]) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        false
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Build the sender for `config`, honoring its missing-config policy.
///
/// An endpoint that is present but not a valid URL is always an error.
///
/// # Errors
/// [`ConfigError`] when the configuration cannot produce a working client and
/// the policy is [`MissingConfigPolicy::FailFast`], or when the endpoint is
/// malformed.
pub fn build_sender(config: &Config) -> Result<Arc<dyn LogSender>, ConfigError> {
    match config.validate() {
        Ok(()) => Ok(Arc::new(Client::new(config)?)),
        Err(e @ ConfigError::Missing(_))
            if config.on_missing_config == MissingConfigPolicy::Degrade =>
        {
            warn!("NOTIFYFREE | {e}. Log delivery is disabled.");
            Ok(Arc::new(InertSender::new(config.endpoint.clone())))
        }
        Err(e) => Err(e),
    }
}

/// Result of dispatching one chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    /// Position of the chunk in dispatch order.
    pub index: usize,
    pub size: usize,
    pub result: Result<(), DeliveryError>,
}

/// Send every chunk concurrently and wait for all of them to settle.
///
/// Outcomes are returned in chunk order regardless of completion order. A
/// chunk whose task could not be joined is reported as failed.
pub async fn dispatch_chunks(
    sender: Arc<dyn LogSender>,
    chunks: Vec<Vec<FormattedEntry>>,
) -> Vec<ChunkOutcome> {
    let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
    let mut results: Vec<Option<Result<(), DeliveryError>>> =
        std::iter::repeat_with(|| None).take(chunks.len()).collect();

    let mut set = JoinSet::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let sender = Arc::clone(&sender);
        set.spawn(async move { (index, sender.send_batch(&chunk).await) });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, result)) => {
                if let Some(slot) = results.get_mut(index) {
                    *slot = Some(result);
                }
            }
            Err(e) => debug!("NOTIFYFREE | Failed to join chunk task: {e}"),
        }
    }

    results
        .into_iter()
        .zip(sizes)
        .enumerate()
        .map(|(index, (result, size))| ChunkOutcome {
            index,
            size,
            result: result.unwrap_or_else(|| {
                Err(DeliveryError::Network {
                    attempts: 0,
                    cause: "chunk task did not complete".to_string(),
                })
            }),
        })
        .collect()
}
