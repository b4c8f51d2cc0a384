// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for configuration, delivery and the fallback store.
//!
//! Only [`ConfigError`] ever reaches the host application, and only at
//! construction time. [`DeliveryError`] is returned by the delivery client and
//! recovered inside [`crate::handler::LogHandler`]; [`FallbackError`] is
//! returned by [`crate::fallback::FallbackStore`].

/// Required settings are missing or malformed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("NotifyFree requires '{0}' configuration")]
    Missing(&'static str),

    #[error("Invalid NotifyFree endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Failure to hand one entry or one batch to the ingestion endpoint.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The endpoint rejected the bearer token. Never retried.
    #[error("Authentication failed: invalid token")]
    Auth,

    /// Transport failure or non-success status after all retries.
    #[error("Failed to send after {attempts} attempts: {cause}")]
    Network { attempts: u32, cause: String },

    /// The batch endpoint was missing and half or fewer of the individual
    /// sends succeeded.
    #[error("Batch fallback delivered only {delivered} of {total} entries")]
    PartialBatch { delivered: usize, total: usize },

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Returns true when retrying cannot succeed without operator action.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Auth | Self::Serialization(_))
    }
}

/// Failure to read or write the local fallback file.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("Fallback store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fallback store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Fallback store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
