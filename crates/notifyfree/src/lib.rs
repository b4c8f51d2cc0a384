// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # NotifyFree
//!
//! Batching delivery of application log records to a NotifyFree ingestion
//! endpoint.
//!
//! - [`record`]: the caller's log record and severity levels
//! - [`formatter`]: wire shape, truncation and redaction
//! - [`client`]: HTTP delivery with retry and concurrent chunk dispatch
//! - [`handler`]: buffering policy and flush state machine
//! - [`fallback`]: on-disk store for entries that failed delivery
//! - [`config`]: environment-driven configuration
//!
//! Delivery problems never surface to the code that writes a record. They are
//! reported through `tracing` and, when enabled, kept in the fallback store.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod formatter;
pub mod handler;
pub mod http;
pub mod logger;
pub mod record;
pub mod status;

/// Channel name given to records built without one.
pub const DEFAULT_CHANNEL: &str = "notifyfree";

pub use client::{build_sender, Client, InertSender, LogSender};
pub use config::{Config, DeliveryMode, MissingConfigPolicy};
pub use error::{ConfigError, DeliveryError, FallbackError};
pub use fallback::{FallbackStats, FallbackStore};
pub use formatter::{FormattedEntry, Formatter};
pub use handler::{spawn_flush_ticker, FlushSummary, LogHandler, ServiceStatus, SharedHandler};
pub use record::{Level, LogRecord};
