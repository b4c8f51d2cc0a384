// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bounded memo of the last connection probe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct CachedStatus {
    available: bool,
    checked_at: Instant,
}

#[derive(Debug)]
pub struct ServiceStatusCache {
    clock: Arc<dyn Clock>,
    enabled: bool,
    ttl: Duration,
    cached: Option<CachedStatus>,
}

impl ServiceStatusCache {
    pub fn new(clock: Arc<dyn Clock>, enabled: bool, ttl: Duration) -> Self {
        ServiceStatusCache {
            clock,
            enabled,
            ttl,
            cached: None,
        }
    }

    /// Cached availability, if caching is on and the value is younger than
    /// the TTL.
    pub fn get(&self) -> Option<bool> {
        if !self.enabled {
            return None;
        }
        let cached = self.cached?;
        let age = self.clock.now().saturating_duration_since(cached.checked_at);
        (age < self.ttl).then_some(cached.available)
    }

    pub fn store(&mut self, available: bool) {
        if self.enabled {
            self.cached = Some(CachedStatus {
                available,
                checked_at: self.clock.now(),
            });
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Turning the cache off also drops the stored value.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.cached = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
