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

//! Capability interface to the SDN, the control-plane directory service.
//!
//! The SDN owns the peer directory and node registration; the node consumes
//! it through the [`SdnClient`] trait so the HTTP transport stays outside the
//! runtime and tests substitute fakes. Registration failure at startup is
//! fatal (a node cannot operate without a node id and an initial peer set);
//! failures afterwards are logged and retried on the next poll.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use std::{fmt, net::IpAddr};

use crate::{connection::NodeType, NetworkNum};

/// Control-plane request failure.
#[derive(Debug, Error)]
pub enum SdnError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected control plane response: {0}")]
    BadResponse(String),
}

/// A node as known to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeModel {
    pub node_id: String,
    pub external_ip: String,
    pub external_port: u16,
    pub network_num: NetworkNum,
    pub node_type: NodeType,
    #[serde(default)]
    pub online: bool,
}

/// A peer the control plane tells this node to connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPeer {
    pub ip: IpAddr,
    pub port: u16,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A blockchain network registered with the control plane, with the cache
/// parameters the transaction service resolves against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainNetwork {
    pub network_num: NetworkNum,
    pub protocol: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_tx_confirmations_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_contents_memory_limit_bytes: Option<u64>,
}

/// Lifecycle and error events a node reports to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeEventType {
    Online,
    Offline,
    PeerConnErr,
    SidSpaceFull,
    TxServiceFullySynced,
    TxServiceSyncedInNetwork,
}

/// One node event submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: String,
    pub event_type: NodeEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tx_sync_networks: Vec<NetworkNum>,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    fn new(node_id: &str, event_type: NodeEventType) -> Self {
        Self {
            node_id: node_id.to_owned(),
            event_type,
            peer_ip: None,
            peer_port: None,
            tx_sync_networks: vec![],
            timestamp: Utc::now(),
        }
    }

    pub fn online(node_id: &str) -> Self {
        Self::new(node_id, NodeEventType::Online)
    }

    pub fn offline(node_id: &str) -> Self {
        Self::new(node_id, NodeEventType::Offline)
    }

    pub fn peer_connection_error(node_id: &str, peer_ip: IpAddr, peer_port: u16) -> Self {
        let mut event = Self::new(node_id, NodeEventType::PeerConnErr);
        event.peer_ip = Some(peer_ip);
        event.peer_port = Some(peer_port);
        event
    }

    pub fn sid_space_full(node_id: &str) -> Self {
        Self::new(node_id, NodeEventType::SidSpaceFull)
    }

    pub fn tx_service_fully_synced(node_id: &str) -> Self {
        Self::new(node_id, NodeEventType::TxServiceFullySynced)
    }

    pub fn tx_service_synced_in_networks(node_id: &str, networks: Vec<NetworkNum>) -> Self {
        let mut event = Self::new(node_id, NodeEventType::TxServiceSyncedInNetwork);
        event.tx_sync_networks = networks;
        event
    }
}

/// Client of the control-plane directory service.
pub trait SdnClient: fmt::Debug {
    /// Fetches the stored configuration of a node. Test networks only.
    fn fetch_node_attributes(&self, node_id: &str) -> Result<NodeModel, SdnError>;

    /// Potential relay peers for a node, optionally restricted to a network.
    fn fetch_potential_relay_peers(
        &self,
        node_id: &str,
        network_num: Option<NetworkNum>,
    ) -> Result<Vec<OutboundPeer>, SdnError>;

    fn fetch_blockchain_network(
        &self,
        protocol: &str,
        network: &str,
    ) -> Result<BlockchainNetwork, SdnError>;

    fn fetch_blockchain_networks(&self) -> Result<Vec<BlockchainNetwork>, SdnError>;

    /// Registers this node. The SDN determines peers and returns the
    /// authoritative node configuration.
    fn register_node(&self, node: &NodeModel) -> Result<NodeModel, SdnError>;

    fn submit_node_event(&self, event: NodeEvent) -> Result<(), SdnError>;

    fn submit_gateway_inbound_connection(
        &self,
        node_id: &str,
        peer_id: &str,
    ) -> Result<(), SdnError>;

    fn delete_gateway_inbound_connection(
        &self,
        node_id: &str,
        peer_id: &str,
    ) -> Result<(), SdnError>;
}

/// Stand-in client for nodes running without a control plane (tests, local
/// setups). Registration echoes the submitted model; queries return nothing.
#[derive(Debug, Default)]
pub struct NoopSdn;

impl SdnClient for NoopSdn {
    fn fetch_node_attributes(&self, _node_id: &str) -> Result<NodeModel, SdnError> {
        Err(SdnError::Unavailable("no control plane configured".into()))
    }

    fn fetch_potential_relay_peers(
        &self,
        _node_id: &str,
        _network_num: Option<NetworkNum>,
    ) -> Result<Vec<OutboundPeer>, SdnError> {
        Ok(vec![])
    }

    fn fetch_blockchain_network(
        &self,
        _protocol: &str,
        _network: &str,
    ) -> Result<BlockchainNetwork, SdnError> {
        Err(SdnError::Unavailable("no control plane configured".into()))
    }

    fn fetch_blockchain_networks(&self) -> Result<Vec<BlockchainNetwork>, SdnError> {
        Ok(vec![])
    }

    fn register_node(&self, node: &NodeModel) -> Result<NodeModel, SdnError> {
        Ok(node.clone())
    }

    fn submit_node_event(&self, _event: NodeEvent) -> Result<(), SdnError> {
        Ok(())
    }

    fn submit_gateway_inbound_connection(
        &self,
        _node_id: &str,
        _peer_id: &str,
    ) -> Result<(), SdnError> {
        Ok(())
    }

    fn delete_gateway_inbound_connection(
        &self,
        _node_id: &str,
        _peer_id: &str,
    ) -> Result<(), SdnError> {
        Ok(())
    }
}
