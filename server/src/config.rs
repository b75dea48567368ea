// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a warden
//! server configuration.

use camino::Utf8Path;
use dropshot::ConfigDropshot;
use dropshot::ConfigLogging;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use warden_dispatch::DispatchTuning;
use warden_dispatch::Peer;
use warden_types::Error;

/// Engine tuning as it appears in the `[dispatch]` section of the config
/// file. Every knob has the engine's default.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Initial depth budget for requests arriving from API clients.
    #[serde(default = "defaults::max_depth")]
    pub max_depth: u32,
    /// Per-request cap on concurrently outstanding sub-dispatches.
    #[serde(default = "defaults::concurrency_limit")]
    pub concurrency_limit: usize,
    /// Dispatch cache budget in bytes; 0 disables admission.
    #[serde(default = "defaults::cache_max_cost_bytes")]
    pub cache_max_cost_bytes: u64,
    /// Optional cache entry TTL in seconds.
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
    /// Virtual nodes per peer on the consistent-hash ring.
    #[serde(default = "defaults::virtual_nodes_per_peer")]
    pub virtual_nodes_per_peer: usize,
    /// Chunk window per stream; also the peer page size.
    #[serde(default = "defaults::stream_window")]
    pub stream_window: usize,
    /// Deadline applied to every inbound dispatch, in seconds.
    #[serde(default = "defaults::request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

mod defaults {
    pub(super) fn max_depth() -> u32 {
        50
    }
    pub(super) fn concurrency_limit() -> usize {
        50
    }
    pub(super) fn cache_max_cost_bytes() -> u64 {
        64 * 1024 * 1024
    }
    pub(super) fn virtual_nodes_per_peer() -> usize {
        100
    }
    pub(super) fn stream_window() -> usize {
        128
    }
    pub(super) fn request_timeout_seconds() -> u64 {
        30
    }
}

impl Default for DispatchConfig {
    fn default() -> DispatchConfig {
        DispatchConfig {
            max_depth: defaults::max_depth(),
            concurrency_limit: defaults::concurrency_limit(),
            cache_max_cost_bytes: defaults::cache_max_cost_bytes(),
            cache_ttl_seconds: None,
            virtual_nodes_per_peer: defaults::virtual_nodes_per_peer(),
            stream_window: defaults::stream_window(),
            request_timeout_seconds: defaults::request_timeout_seconds(),
        }
    }
}

impl DispatchConfig {
    pub fn tuning(&self) -> DispatchTuning {
        DispatchTuning {
            max_depth: self.max_depth,
            concurrency_limit: self.concurrency_limit,
            cache_max_cost_bytes: self.cache_max_cost_bytes,
            cache_ttl: self.cache_ttl_seconds.map(Duration::from_secs),
            stream_window: self.stream_window,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Configuration for a warden server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// This node's stable peer identity; what the ring compares against
    /// when deciding whether a key is ours.
    pub peer_id: String,
    /// Engine tuning.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Initial peer membership; replaceable at runtime through the
    /// peers endpoint.
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Dropshot configuration for the peer API server.
    pub dropshot: ConfigDropshot,
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
}

impl Config {
    /// Loads a `Config` from a TOML file.
    ///
    /// Failures surface as [`warden_types::Error`], like every other
    /// fallible path in this workspace: an unreadable file is an
    /// internal error, malformed TOML an invalid argument. Both name
    /// the offending path.
    pub fn from_file(path: &Utf8Path) -> Result<Config, Error> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::internal(format!("reading config file {path}: {err}"))
        })?;
        toml::from_str(&contents).map_err(|err| {
            Error::invalid_argument(format!(
                "parsing config file {path}: {err}"
            ))
        })
    }
}
