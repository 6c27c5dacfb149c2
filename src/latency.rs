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

//! Off-loop ping-latency probing of candidate peers.
//!
//! Probes block, so they run on worker threads outside the event loop; the
//! loop drains completed results through a thread-safe queue on one of its
//! alarms. This is the only part of the runtime that touches another thread.

use log::warn;

use std::{
    fmt,
    process::Command,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
};

use crate::sdn::OutboundPeer;

/// Latency assumed for peers that never answered.
pub const PING_TIMEOUT_MS: f64 = 2_000.0;

/// Measured (or timed out) latency of one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLatencyInfo {
    pub peer: OutboundPeer,
    pub latency_ms: f64,
}

/// Blocking measurement of one peer's latency in milliseconds; `None` means
/// the probe failed or timed out.
pub type ProbeFn = dyn Fn(&OutboundPeer) -> Option<f64> + Send + Sync;

/// Fans peer probes out to worker threads and collects their results for the
/// event loop.
pub struct LatencyProber {
    probe: Arc<ProbeFn>,
    results_tx: Sender<NodeLatencyInfo>,
    results_rx: Receiver<NodeLatencyInfo>,
}

impl fmt::Debug for LatencyProber {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.pad("LatencyProber { .. }")
    }
}

impl Default for LatencyProber {
    fn default() -> Self {
        Self::new(Arc::new(system_ping))
    }
}

impl LatencyProber {
    pub fn new(probe: Arc<ProbeFn>) -> Self {
        let (results_tx, results_rx) = mpsc::channel();
        Self {
            probe,
            results_tx,
            results_rx,
        }
    }

    /// Starts one worker thread per peer. Results arrive in completion order
    /// and are picked up by the next `drain_results` call.
    pub fn probe_peers(&self, peers: Vec<OutboundPeer>) {
        for peer in peers {
            let probe = Arc::clone(&self.probe);
            let results_tx = self.results_tx.clone();
            thread::Builder::new()
                .name(format!("ping-{}", peer.ip))
                .spawn(move || {
                    let latency_ms = probe(&peer).unwrap_or(PING_TIMEOUT_MS);
                    results_tx.send(NodeLatencyInfo { peer, latency_ms }).ok();
                })
                .map_err(|err| warn!("Unable to spawn a ping worker: {}", err))
                .ok();
        }
    }

    /// Collects every completed probe without blocking. Called from the event
    /// loop.
    pub fn drain_results(&self) -> Vec<NodeLatencyInfo> {
        let mut results = Vec::new();
        loop {
            match self.results_rx.try_recv() {
                Ok(result) => results.push(result),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        results
    }
}

/// Probes a peer with the system `ping` utility.
fn system_ping(peer: &OutboundPeer) -> Option<f64> {
    let output = Command::new("ping")
        .args(&["-c", "1", &peer.ip.to_string()])
        .output()
        .map_err(|err| warn!("Unable to run ping for {}: {}", peer.ip, err))
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let after_time = stdout.split("time=").nth(1)?;
    after_time
        .split("ms")
        .next()?
        .trim()
        .parse()
        .map_err(|_| warn!("Unparseable ping output for {}", peer.ip))
        .ok()
}
