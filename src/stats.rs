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

//! Telemetry capability of the node.
//!
//! The runtime flushes periodic reports through a [`StatsSink`] supplied at
//! construction instead of writing to a global statistics service, so tests
//! substitute a recording fake and deployments plug in their own transport.

use log::info;
use serde_derive::Serialize;

use std::fmt;

use crate::{transactions::TxServiceStats, NodeType};

/// Throughput totals since node start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputStats {
    pub connection_count: usize,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Identity and connection overview of the node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfoStats {
    pub node_id: String,
    pub node_type: NodeType,
    pub connections_by_type: Vec<(String, usize)>,
}

/// Estimated memory footprint of the node's caches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_estimated_bytes: u64,
    pub tx_cache_bytes: u64,
}

/// One report flushed by a periodic stats alarm.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum StatsReport {
    Throughput(ThroughputStats),
    NodeInfo(NodeInfoStats),
    TxCache { services: Vec<TxServiceStats> },
    Memory(MemoryStats),
}

/// Telemetry sink the node flushes its periodic reports into.
pub trait StatsSink: fmt::Debug {
    fn flush(&mut self, report: StatsReport);
}

/// Default sink writing each report to the log as one JSON line.
#[derive(Debug, Default)]
pub struct LogStats;

impl StatsSink for LogStats {
    fn flush(&mut self, report: StatsReport) {
        match serde_json::to_string(&report) {
            Ok(line) => info!("statistics: {}", line),
            Err(err) => info!("statistics unserializable ({}): {:?}", err, report),
        }
    }
}
