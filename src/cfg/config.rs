// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Timing knobs for both endpoints. Wire-format constants are fixed in
/// `packet::codec` and deliberately absent here.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {path:?}"))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ClientConfig {
    /// Seconds between connect attempts while disconnected.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_seconds: u64,
    /// Seconds between liveness probes while connected. 0 disables
    /// heartbeats entirely.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Initial capacity of the receive buffer.
    #[serde(default = "default_read_buffer_capacity")]
    pub read_buffer_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_seconds: default_reconnect_interval(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            read_buffer_capacity: default_read_buffer_capacity(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    /// Sessions silent for this long are evicted by the liveness sweep.
    #[serde(default = "default_max_heartbeat_interval")]
    pub max_heartbeat_interval_seconds: u64,
    /// How many times an unacknowledged push is written before giving up.
    #[serde(default = "default_resend_tries")]
    pub resend_tries: u32,
    /// Seconds between retransmissions of an unacknowledged push.
    #[serde(default = "default_resend_interval")]
    pub resend_interval_seconds: u64,
    /// Initial capacity of each session's receive buffer.
    #[serde(default = "default_read_buffer_capacity")]
    pub read_buffer_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_heartbeat_interval_seconds: default_max_heartbeat_interval(),
            resend_tries: default_resend_tries(),
            resend_interval_seconds: default_resend_interval(),
            read_buffer_capacity: default_read_buffer_capacity(),
        }
    }
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_max_heartbeat_interval() -> u64 {
    20
}

fn default_resend_tries() -> u32 {
    3
}

fn default_resend_interval() -> u64 {
    3
}

fn default_read_buffer_capacity() -> usize {
    128 * 1024
}
