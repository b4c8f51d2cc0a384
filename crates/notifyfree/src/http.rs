// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction.
//!
//! Every request to the ingestion endpoint carries the same headers, so they
//! are installed once as client defaults:
//!
//! - `Authorization: Bearer {token}` (marked sensitive)
//! - `Content-Type: application/json`
//! - `User-Agent: notifyfree-rs/{version}`

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use std::time::Duration;

use crate::error::ConfigError;

const USER_AGENT_VALUE: &str = concat!("notifyfree-rs/", env!("CARGO_PKG_VERSION"));

/// Creates a reqwest client that authenticates with `token` and aborts each
/// request after `timeout`.
pub fn get_client(token: &str, timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        ConfigError::InvalidValue {
            key: "token",
            value: "<contains characters not allowed in a header>".to_string(),
        }
    })?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

    reqwest::Client::builder()
        .use_rustls_tls()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}
