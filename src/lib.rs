// Copyright 2021 The BDN Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared runtime of the BDN relay network: the networking, caching and
//! subscription core used by gateways, transaction relays and block relays.
//!
//! # Overview
//!
//! This crate contains the following APIs:
//!
//! - [`NodeRuntime`] implements the event-loop side of a node: connection
//!   lifecycle, alarms, buffered I/O and broadcast fan-out. It is driven by an
//!   external socket layer through the callbacks described in the module docs
//!   of [`node`].
//! - [`TransactionService`] maintains the hash ↔ short-id ↔ contents index
//!   with TTL expiry and memory-bounded eviction.
//! - The [`feed`] module implements filtered publish/subscribe fan-out of
//!   transaction notifications.
//! - Capability traits ([`NodeBehavior`], [`SdnClient`], [`StatsSink`])
//!   through which concrete node kinds, the control plane and telemetry are
//!   plugged in. Tests substitute fakes.
//!
//! The runtime is strictly single-threaded: every handler runs to completion
//! on the loop thread, and no handler blocks on I/O.
//!
//! [`NodeRuntime`]: node/struct.NodeRuntime.html
//! [`TransactionService`]: transactions/struct.TransactionService.html
//! [`NodeBehavior`]: node/trait.NodeBehavior.html
//! [`SdnClient`]: sdn/trait.SdnClient.html
//! [`StatsSink`]: stats/trait.StatsSink.html

#![warn(missing_debug_implementations, unsafe_code, bare_trait_objects)]
#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]

pub use crate::{
    alarm::{AlarmOutcome, AlarmQueue},
    connection::{Connection, ConnectionState, ConnectionType, NodeType},
    node::{NodeBehavior, NodeRuntime, TerminationError},
    pool::ConnectionPool,
    sdn::{BlockchainNetwork, NodeEvent, NodeEventType, NodeModel, OutboundPeer, SdnClient},
    stats::StatsSink,
    transactions::{Sha256Hash, TransactionService},
};

use anyhow::ensure;
use serde_derive::{Deserialize, Serialize};

use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

pub mod alarm;
pub mod buffers;
pub mod connection;
pub mod expiration;
pub mod feed;
pub mod latency;
pub mod messages;
pub mod node;
pub mod pool;
pub mod sdn;
pub mod stats;
pub mod transactions;

/// File descriptor of a peer socket, assigned by the OS socket layer.
pub type Fileno = i32;

/// Identifier of a blockchain network served by the relay network.
pub type NetworkNum = u32;

/// Compact 4-byte surrogate for a transaction hash used on the wire.
pub type ShortId = u32;

/// Time interval in milliseconds.
pub type Milliseconds = u64;

/// Sleep interval in seconds handed back to the event-loop driver. May be
/// negative when an alarm is already overdue.
pub type Seconds = f64;

/// Wildcard network number matching peers on any network.
pub const ALL_NETWORK_NUM: NetworkNum = 0;

/// Sentinel short id denoting "no short id assigned".
pub const NULL_TX_SID: ShortId = 0;

/// P2P network configuration of a BDN node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    /// Time allotted to a fresh connection to complete its application-level
    /// handshake before it is destroyed and (possibly) retried.
    pub connection_timeout: Milliseconds,
    /// Maximum number of connect retries per (ip, port) for non-SDN peers.
    /// The SDN connection is retried without limit.
    pub max_connect_retries: u64,
    /// Interval between application-level pings on established connections.
    pub ping_interval: Milliseconds,
    /// Sleep timeout returned to the event loop when no alarm is pending, and
    /// the floor used when connect/disconnect requests are queued.
    pub default_sleep_timeout: Milliseconds,
    /// Maximum time an output buffer may hold a partially filled batch before
    /// the periodic flush alarm pushes it out.
    pub output_buffer_batch_max_hold_time: Milliseconds,
    /// Schedule keep-alive pings once a connection survives its
    /// connection-timeout check.
    pub schedule_pings_on_timeout: bool,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            connection_timeout: 30_000,
            max_connect_retries: 10,
            ping_interval: 60_000,
            default_sleep_timeout: 100,
            output_buffer_batch_max_hold_time: 50,
            schedule_pings_on_timeout: false,
        }
    }
}

/// Transaction cache configuration parameters.
///
/// Network-specific values from the SDN (`BlockchainNetwork`) take precedence
/// over the defaults given here; see `TransactionService::new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxCacheConfig {
    /// Time to live of a short-id assignment.
    pub sid_expire_time: Milliseconds,
    /// Number of block-confirmation batches to hold before the oldest batch's
    /// short ids are evicted.
    pub final_tx_confirmations_count: usize,
    /// Hard cap on the total byte size of cached transaction contents.
    pub tx_cache_memory_limit_bytes: u64,
    /// When set, short ids removed from the cache are appended to a debug
    /// dump file under this directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_removed_short_ids_path: Option<PathBuf>,
}

impl Default for TxCacheConfig {
    fn default() -> Self {
        Self {
            // Three days, matching the default short-id epoch length.
            sid_expire_time: 259_200_000,
            final_tx_confirmations_count: 24,
            tx_cache_memory_limit_bytes: 200 * 1024 * 1024,
            dump_removed_short_ids_path: None,
        }
    }
}

/// Thresholds for the detailed memory usage report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReportConfig {
    /// Total memory usage at which the first detailed report is emitted.
    pub dump_detailed_report_at_memory_usage: u64,
    /// Increase over the previously reported usage that triggers the next
    /// detailed report.
    pub usage_increase_for_next_report: u64,
}

impl Default for MemoryReportConfig {
    fn default() -> Self {
        Self {
            dump_detailed_report_at_memory_usage: 1024 * 1024 * 1024,
            usage_increase_for_next_report: 100 * 1024 * 1024,
        }
    }
}

/// Configuration for the `NodeRuntime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id assigned by the control plane during registration.
    pub node_id: String,
    /// Externally visible address of this node.
    pub external_ip: String,
    /// Externally visible port of this node.
    pub external_port: u16,
    /// Blockchain network this node primarily serves.
    pub network_num: NetworkNum,
    /// Outbound peers the node connects to on start.
    pub outbound_peers: Vec<OutboundPeer>,
    /// Blockchain networks known to the control plane; transaction cache
    /// limits are resolved against these.
    pub blockchain_networks: Vec<BlockchainNetwork>,
    /// P2P network configuration.
    pub network: NetworkConfiguration,
    /// Transaction cache configuration.
    pub tx_cache: TxCacheConfig,
    /// Memory report thresholds.
    pub memory: MemoryReportConfig,
}

impl NodeConfig {
    /// Checks that the configuration is internally consistent.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.node_id.is_empty(), "`node_id` must not be empty");
        ensure!(
            self.network.connection_timeout > 0,
            "`connection_timeout` must be strictly larger than 0"
        );
        ensure!(
            self.network.default_sleep_timeout > 0,
            "`default_sleep_timeout` must be strictly larger than 0"
        );
        ensure!(
            self.tx_cache.final_tx_confirmations_count > 0,
            "`final_tx_confirmations_count` must be strictly larger than 0"
        );
        ensure!(
            self.tx_cache.tx_cache_memory_limit_bytes > 0,
            "`tx_cache_memory_limit_bytes` must be strictly larger than 0"
        );
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "unregistered".to_owned(),
            external_ip: "127.0.0.1".to_owned(),
            external_port: 9000,
            network_num: ALL_NETWORK_NUM,
            outbound_peers: vec![],
            blockchain_networks: vec![],
            network: NetworkConfiguration::default(),
            tx_cache: TxCacheConfig::default(),
            memory: MemoryReportConfig::default(),
        }
    }
}

/// A helper trait that provides the runtime with information about the state
/// of the system, such as the current time. Tests substitute a manual clock.
pub trait SystemStateProvider: fmt::Debug {
    /// Returns the current monotonic time.
    fn current_time(&self) -> Instant;
}

/// Default system state provider backed by `Instant::now`.
#[derive(Debug)]
pub struct DefaultSystemState;

impl SystemStateProvider for DefaultSystemState {
    fn current_time(&self) -> Instant {
        Instant::now()
    }
}

pub(crate) fn duration_from_millis(millis: Milliseconds) -> Duration {
    Duration::from_millis(millis)
}

pub(crate) fn duration_to_seconds(duration: Duration) -> Seconds {
    duration.as_secs_f64()
}

/// Initializes the logger from the `RUST_LOG` environment variable.
///
/// Repeated calls are no-ops, so library consumers and tests can both call
/// this safely.
pub fn init_logger() {
    env_logger::Builder::from_default_env().try_init().ok();
}
