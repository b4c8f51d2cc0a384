// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery strategy selection.
//!
//! The strategy is a closed set chosen from configuration and dispatched by
//! [`crate::handler::LogHandler`]:
//!
//! 1. **Basic** - every record is sent as soon as it is written
//! 2. **Batching** - records are buffered and flushed in concurrent chunks
//! 3. **Cached** - every record is sent immediately, failures go to the
//!    local fallback store

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One request per record, failures are only logged.
    Basic,

    /// Buffer records and flush them by count or by age.
    Batching,

    /// One request per record, failures are persisted to the fallback store.
    Cached,
}

impl DeliveryMode {
    /// Parse from an environment variable string.
    ///
    /// Accepts: "basic", "batching", "cached"
    /// Aliases: "sync", "batch", "fallback", and the legacy handler class
    /// names (with or without namespace).
    pub fn from_env_str(s: &str) -> Option<Self> {
        // Legacy values are fully qualified class names.
        let name = s.trim().rsplit('\\').next().unwrap_or_default();
        match name.to_lowercase().as_str() {
            "basic" | "sync" | "notifyfreehandler" => Some(Self::Basic),
            "batching" | "batch" | "batchnotifyfreehandler" => Some(Self::Batching),
            "cached" | "fallback" | "cachednotifyfreehandler" => Some(Self::Cached),
            _ => None,
        }
    }

    /// Returns true if records are buffered before delivery.
    pub const fn is_batching(self) -> bool {
        matches!(self, Self::Batching)
    }

    /// Returns true if failed deliveries always go to the fallback store.
    pub const fn forces_fallback(self) -> bool {
        matches!(self, Self::Cached)
    }
}

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::Batching
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Batching => write!(f, "batching"),
            Self::Cached => write!(f, "cached"),
        }
    }
}
