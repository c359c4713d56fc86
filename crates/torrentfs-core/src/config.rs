// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the torrentfs driver

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Kernel cache policy. Applies to every inode alike.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long the kernel may cache attribute replies
    pub attr_ttl_ms: u32,
    /// How long the kernel may cache name → inode bindings
    pub entry_ttl_ms: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
        }
    }
}

impl CacheConfig {
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_millis(self.attr_ttl_ms as u64)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_millis(self.entry_ttl_ms as u64)
    }
}

/// Worker pool serving requests that may block on the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads; `0` picks the available parallelism
    pub threads: usize,
    /// Requested FUSE `max_background`
    pub max_background: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_background: 64,
        }
    }
}

/// Top-level driver configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub cache: CacheConfig,
    pub workers: WorkerConfig,
}

impl FsConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
