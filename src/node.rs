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

//! The node runtime: the event-loop side shared by gateways and relays.
//!
//! An external socket layer owns the OS sockets and drives the runtime
//! through callbacks: `on_connection_added` / `on_connection_initialized` /
//! `on_connection_closed` for lifecycle, `on_bytes_received` /
//! `on_finished_receiving` for inbound data, `get_bytes_to_send` /
//! `on_bytes_sent` for outbound data, and `get_sleep_timeout` between loop
//! iterations (which is also where ready alarms fire). Outbound connect and
//! disconnect requests flow back to the socket layer through two FIFOs.
//!
//! Everything runs on the loop thread; the only cross-thread artifact is the
//! shutdown flag written by the signal handler.

use anyhow::Context;
use bytes::Bytes;
use log::{debug, error, info, log, trace, warn};
use thiserror::Error;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    alarm::{AlarmCallback, AlarmOutcome, AlarmQueue},
    connection::{Connection, ConnectionType, NodeType},
    duration_from_millis,
    feed::NewTransactionFeed,
    messages::MessageRef,
    pool::ConnectionPool,
    sdn::{NodeEvent, NodeModel, OutboundPeer, SdnClient},
    stats::{MemoryStats, NodeInfoStats, StatsReport, StatsSink, ThroughputStats},
    transactions::{Sha256Hash, TransactionService},
    DefaultSystemState, Fileno, NetworkNum, NodeConfig, Seconds, ShortId, SystemStateProvider,
    ALL_NETWORK_NUM,
};

/// Backoff schedule of connect retries, in seconds. Retries past the end of
/// the table stay at its last entry.
const CONNECTION_RETRY_BACKOFF_S: [u64; 7] = [1, 1, 2, 3, 5, 8, 13];

const THROUGHPUT_STATS_INTERVAL: Duration = Duration::from_secs(15);
const NODE_INFO_STATS_INTERVAL: Duration = Duration::from_secs(3600);
const TX_CACHE_STATS_INTERVAL: Duration = Duration::from_secs(60);
const MEMORY_STATS_INTERVAL: Duration = Duration::from_secs(300);

/// Raised out of the event loop when a shutdown signal arrives.
#[derive(Debug, Clone, Copy, Error)]
#[error("node terminated by shutdown signal")]
pub struct TerminationError;

/// Why a destroyed connection is not being retried. Both paths report the
/// peer to the control plane; the reason keeps their logs distinguishable.
#[derive(Debug, Clone, Copy)]
enum FailedRetryReason {
    NotRetried,
    RetriesExhausted,
}

/// Node-kind capabilities the runtime cannot supply itself: what kind of
/// node this is, how its connections are built, and how it reacts to relay
/// failures. Gateways and relays provide their own implementations.
pub trait NodeBehavior: fmt::Debug {
    /// Kind of this node, reported to the control plane at registration.
    fn node_type(&self) -> NodeType;

    /// Builds the connection object for a new peer socket; `None` rejects
    /// the peer and the socket is scheduled for disconnect.
    fn build_connection(
        &mut self,
        fileno: Fileno,
        ip: IpAddr,
        port: u16,
        from_me: bool,
        config: &NodeConfig,
    ) -> Option<Connection>;

    /// Fetches a fresh relay peer set after a relay connection failure.
    fn request_relay_peers(
        &mut self,
        sdn: &dyn SdnClient,
        node_id: &str,
    ) -> Option<Vec<OutboundPeer>> {
        match sdn.fetch_potential_relay_peers(node_id, None) {
            Ok(peers) => Some(peers),
            Err(err) => {
                warn!("Unable to fetch relay peers: {}", err);
                None
            }
        }
    }
}

/// Broadcast parameters. `require_exact_network_match` disables the
/// wildcard-network match, restricting recipients to the exact network
/// number.
#[derive(Debug, Clone)]
pub struct BroadcastOptions {
    pub prepend: bool,
    pub network_num: Option<NetworkNum>,
    pub connection_types: Vec<ConnectionType>,
    pub require_exact_network_match: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            prepend: false,
            network_num: None,
            connection_types: vec![ConnectionType::RELAY_ALL],
            require_exact_network_match: false,
        }
    }
}

/// Alarm registration requested from within the core; the runtime flushes
/// these into the alarm queue after every entry point, so alarms requested
/// during a drain join the next tick.
pub(crate) struct PendingAlarm {
    delay: Duration,
    slack: Option<Duration>,
    name: &'static str,
    callback: AlarmCallback<NodeCore>,
}

impl fmt::Debug for PendingAlarm {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("PendingAlarm")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .finish()
    }
}

/// Everything the node owns apart from the alarm queue: connections,
/// request FIFOs, transaction services, feeds and the capability objects.
/// Alarm callbacks and connection protocols operate on this type.
#[derive(Debug)]
pub struct NodeCore {
    config: NodeConfig,
    behavior: Box<dyn NodeBehavior>,
    sdn: Box<dyn SdnClient>,
    stats: Box<dyn StatsSink>,
    pool: ConnectionPool,
    connection_queue: VecDeque<(IpAddr, u16)>,
    disconnect_queue: VecDeque<Fileno>,
    outbound_peers: Vec<OutboundPeer>,
    num_retries_by_ip: HashMap<(IpAddr, u16), u64>,
    tx_services: HashMap<NetworkNum, TransactionService>,
    new_tx_feeds: HashMap<NetworkNum, NewTransactionFeed>,
    pending_alarms: Vec<PendingAlarm>,
    should_force_exit: bool,
    shutdown_requested: Arc<AtomicBool>,
    bytes_received: u64,
    bytes_sent: u64,
    next_report_mem_usage_bytes: u64,
}

impl NodeCore {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Mutable access to the pool for node-kind logic that manages its own
    /// connections.
    pub fn pool_mut(&mut self) -> &mut ConnectionPool {
        &mut self.pool
    }

    /// Schedules a one-shot alarm; it is armed after the current entry point
    /// returns.
    pub fn schedule_alarm(
        &mut self,
        delay: Duration,
        name: &'static str,
        callback: impl FnMut(&mut NodeCore, Instant) -> AlarmOutcome + 'static,
    ) {
        self.pending_alarms.push(PendingAlarm {
            delay,
            slack: None,
            name,
            callback: Box::new(callback),
        });
    }

    /// The transaction service of a network, created on first use. `None`
    /// selects this node's own network.
    pub fn get_tx_service(&mut self, network_num: Option<NetworkNum>) -> &mut TransactionService {
        let network_num = network_num.unwrap_or(self.config.network_num);
        if !self.tx_services.contains_key(&network_num) {
            let service = TransactionService::new(
                network_num,
                &self.config.tx_cache,
                &self.config.blockchain_networks,
            );
            self.tx_services.insert(network_num, service);
        }
        self.tx_services.get_mut(&network_num).unwrap()
    }

    /// Assigns a short id through the network's transaction service and keeps
    /// the service's expiry alarm scheduled.
    pub fn assign_short_id(
        &mut self,
        network_num: Option<NetworkNum>,
        hash: Sha256Hash,
        short_id: ShortId,
        now: Instant,
    ) {
        let resolved = network_num.unwrap_or(self.config.network_num);
        let service = self.get_tx_service(Some(resolved));
        if service.assign_short_id(hash, short_id, now) {
            let expire_in = service.sid_expire_time();
            self.schedule_alarm(expire_in, "expire_short_ids", move |core, now| {
                core.get_tx_service(Some(resolved)).expire_old_assignments(now)
            });
        }
    }

    /// The `newTxs` feed of a network, created on first use.
    pub fn new_tx_feed(&mut self, network_num: Option<NetworkNum>) -> &mut NewTransactionFeed {
        let network_num = network_num.unwrap_or(self.config.network_num);
        self.new_tx_feeds
            .entry(network_num)
            .or_insert_with(|| NewTransactionFeed::for_network(network_num))
    }

    pub fn connection_exists(&self, ip: IpAddr, port: u16) -> bool {
        self.pool.has_connection(ip, port)
    }

    /// Notifies the core of a new peer socket. A peer already connected at
    /// the same (ip, port) keeps its old connection; the new fileno is
    /// scheduled for disconnect. Duplicate detection is by address, never by
    /// fileno.
    pub fn on_connection_added(
        &mut self,
        fileno: Fileno,
        ip: IpAddr,
        port: u16,
        from_me: bool,
        now: Instant,
    ) {
        if self.connection_exists(ip, port) {
            warn!("Duplicate connection attempted to {}:{}.", ip, port);
            self.enqueue_disconnect(fileno);
        } else {
            self.initialize_connection(fileno, ip, port, from_me, now);
        }
    }

    fn initialize_connection(
        &mut self,
        fileno: Fileno,
        ip: IpAddr,
        port: u16,
        from_me: bool,
        _now: Instant,
    ) {
        match self
            .behavior
            .build_connection(fileno, ip, port, from_me, &self.config)
        {
            Some(conn) => {
                info!("Adding connection: {}.", conn);
                let timeout = duration_from_millis(self.config.network.connection_timeout);
                self.schedule_alarm(timeout, "connection_timeout", move |core, now| {
                    core.handle_connection_timeout(fileno, now)
                });
                self.pool.add(conn);
            }
            None => self.enqueue_disconnect(fileno),
        }
    }

    /// Fires once per connection, `connection_timeout` after creation. An
    /// established connection optionally starts keep-alive pings; one still
    /// connecting is destroyed and retried.
    fn handle_connection_timeout(&mut self, fileno: Fileno, _now: Instant) -> AlarmOutcome {
        let conn = match self.pool.get_by_fileno(fileno) {
            Some(conn) => conn,
            None => return AlarmOutcome::Cancel,
        };

        if conn
            .state()
            .contains(crate::connection::ConnectionState::ESTABLISHED)
        {
            debug!("Connection is still established: {}", conn);
            if self.config.network.schedule_pings_on_timeout {
                let interval = duration_from_millis(self.config.network.ping_interval);
                self.schedule_alarm(interval, "keepalive_ping", move |core, now| {
                    core.handle_keepalive_ping(fileno, now)
                });
            }
            return AlarmOutcome::Cancel;
        }
        if conn.is_marked_for_close() {
            debug!("Connection has already been marked for close: {}", conn);
            return AlarmOutcome::Cancel;
        }

        debug!("Connection has timed out: {}", conn);
        self.destroy_connection(fileno, true);
        AlarmOutcome::Cancel
    }

    fn handle_keepalive_ping(&mut self, fileno: Fileno, now: Instant) -> AlarmOutcome {
        match self.pool.get_by_fileno_mut(fileno) {
            Some(conn) if conn.is_active() => {
                conn.send_ping(now);
                AlarmOutcome::Reschedule(duration_from_millis(self.config.network.ping_interval))
            }
            _ => AlarmOutcome::Cancel,
        }
    }

    /// The socket layer finished its transport-level setup of a connection.
    pub fn on_connection_initialized(&mut self, fileno: Fileno, now: Instant) {
        let conn = match self.pool.get_by_fileno_mut(fileno) {
            Some(conn) => conn,
            None => {
                warn!("Initialized connection not in pool. Fileno: {}.", fileno);
                return;
            }
        };
        info!("Connection state initialized: {}", conn);
        conn.handle_initialized(&self.config, now);
    }

    /// The socket layer observed the peer's socket closing.
    pub fn on_connection_closed(&mut self, fileno: Fileno) {
        let conn = match self.pool.get_by_fileno(fileno) {
            Some(conn) => conn,
            None => {
                warn!("Closed connection not in pool. Fileno: {}.", fileno);
                return;
            }
        };
        info!("Destroying connection: {}", conn);
        // Only connections we initiated are retried.
        let retry_connection = conn.from_me();
        self.destroy_connection(fileno, retry_connection);
    }

    /// Appends received bytes to the connection's input buffer. Bytes for a
    /// connection marked for close are dropped.
    pub fn on_bytes_received(&mut self, fileno: Fileno, bytes_received: Bytes) {
        self.bytes_received += bytes_received.len() as u64;
        let conn = match self.pool.get_by_fileno_mut(fileno) {
            Some(conn) => conn,
            None => {
                warn!("Received bytes for connection not in pool. Fileno: {}.", fileno);
                return;
            }
        };
        if conn.is_marked_for_close() {
            return;
        }
        conn.add_received_bytes(bytes_received);
        if conn.is_marked_for_close() {
            self.destroy_connection(fileno, false);
        }
    }

    /// The socket layer finished one read burst; parse and dispatch every
    /// complete frame buffered on the connection.
    pub fn on_finished_receiving(&mut self, fileno: Fileno, now: Instant) {
        match self.pool.get_by_fileno(fileno) {
            None => {
                warn!("Received bytes for connection not in pool. Fileno: {}.", fileno);
                return;
            }
            Some(conn) if conn.is_marked_for_close() => return,
            Some(_) => {}
        }
        self.process_messages(fileno, now);
    }

    /// Runs the connection's protocol over every buffered frame. The
    /// connection leaves the pool for the duration so handlers can reach
    /// both it and the rest of the node.
    fn process_messages(&mut self, fileno: Fileno, now: Instant) {
        let mut conn = match self.pool.delete(fileno) {
            Some(conn) => conn,
            None => return,
        };
        let mut protocol = conn.take_protocol();
        loop {
            if conn.is_marked_for_close() {
                break;
            }
            match conn.pop_next_frame() {
                Ok(Some(frame)) => protocol.process_frame(&mut conn, self, frame, now),
                Ok(None) => break,
                Err(err) => {
                    warn!("Framing error on {}: {}. Closing the connection.", conn, err);
                    conn.mark_for_close();
                    break;
                }
            }
        }
        conn.restore_protocol(protocol);

        if conn.is_marked_for_close() {
            self.destroy_conn_object(conn, false);
        } else {
            self.pool.add(conn);
        }
    }

    /// Next chunk of outbound bytes for a connection, if it may send.
    pub fn get_bytes_to_send(&self, fileno: Fileno) -> Option<Bytes> {
        match self.pool.get_by_fileno(fileno) {
            Some(conn) => conn.get_bytes_to_send(),
            None => {
                warn!("Request to get bytes for connection not in pool. Fileno: {}.", fileno);
                None
            }
        }
    }

    /// Advances a connection's output cursor by what the kernel accepted.
    pub fn on_bytes_sent(&mut self, fileno: Fileno, num_bytes: usize, now: Instant) {
        self.bytes_sent += num_bytes as u64;
        match self.pool.get_by_fileno_mut(fileno) {
            Some(conn) => conn.advance_sent_bytes(num_bytes, now),
            None => warn!("Bytes sent for connection not in pool. Fileno: {}.", fileno),
        }
    }

    /// Copies a message into the output buffer of every active connection
    /// matching the requested types and network, except the sender. Returns
    /// the recipients; delivery order across connections is unspecified.
    pub fn broadcast(
        &mut self,
        msg: &MessageRef,
        sender: Option<Fileno>,
        options: &BroadcastOptions,
        now: Instant,
    ) -> Vec<Fileno> {
        let broadcast_net_num = options.network_num.unwrap_or(self.config.network_num);
        log!(
            msg.log_level(),
            "Broadcasting {} to {:?} connections.",
            msg,
            options.connection_types
        );

        let mut targets = HashSet::new();
        for connection_type in &options.connection_types {
            targets.extend(self.pool.get_by_connection_type(*connection_type));
        }

        let mut recipients = Vec::new();
        for fileno in targets {
            if Some(fileno) == sender {
                continue;
            }
            let conn = match self.pool.get_by_fileno_mut(fileno) {
                Some(conn) => conn,
                None => continue,
            };
            let matches_network = (!options.require_exact_network_match
                && conn.network_num() == ALL_NETWORK_NUM)
                || conn.network_num() == broadcast_net_num;
            if conn.is_active() && matches_network {
                conn.enqueue_msg(msg, options.prepend, now);
                recipients.push(fileno);
            }
        }
        recipients
    }

    /// Adds an address to the outbound-connect FIFO.
    pub fn enqueue_connection(&mut self, ip: IpAddr, port: u16) {
        debug!("Enqueuing connection to {}:{}.", ip, port);
        self.connection_queue.push_back((ip, port));
    }

    /// Adds a fileno to the disconnect FIFO.
    pub fn enqueue_disconnect(&mut self, fileno: Fileno) {
        debug!("Enqueuing disconnect from fileno {}.", fileno);
        self.disconnect_queue.push_back(fileno);
    }

    pub fn pop_next_connection_address(&mut self) -> Option<(IpAddr, u16)> {
        self.connection_queue.pop_front()
    }

    pub fn pop_next_disconnect_connection(&mut self) -> Option<Fileno> {
        self.disconnect_queue.pop_front()
    }

    fn has_queued_requests(&self) -> bool {
        !self.connection_queue.is_empty() || !self.disconnect_queue.is_empty()
    }

    /// Removes a connection from the pool and tears it down, scheduling a
    /// retry when requested and the peer is eligible.
    pub fn destroy_connection(&mut self, fileno: Fileno, retry_connection: bool) {
        if let Some(conn) = self.pool.delete(fileno) {
            self.destroy_conn_object(conn, retry_connection);
        }
    }

    fn destroy_conn_object(&mut self, mut conn: Connection, retry_connection: bool) {
        info!(
            "Breaking connection to {}. Attempting retry: {}.",
            conn, retry_connection
        );
        conn.mark_for_close();

        let (peer_ip, peer_port) = (conn.peer_ip(), conn.peer_port());
        let connection_type = conn.connection_type();
        if retry_connection {
            let retriable = self.is_outbound_peer(peer_ip, peer_port)
                || connection_type.intersects(
                    ConnectionType::BLOCKCHAIN_NODE
                        | ConnectionType::REMOTE_BLOCKCHAIN_NODE
                        | ConnectionType::SDN,
                );
            if retriable {
                let delay = Duration::from_secs(self.next_retry_timeout(peer_ip, peer_port));
                self.schedule_alarm(delay, "retry_connection", move |core, _| {
                    core.retry_init_client_socket(peer_ip, peer_port, connection_type)
                });
            }
        } else {
            self.on_failed_connection_retry(
                peer_ip,
                peer_port,
                connection_type,
                FailedRetryReason::NotRetried,
            );
        }

        self.enqueue_disconnect(conn.fileno());
    }

    fn is_outbound_peer(&self, ip: IpAddr, port: u16) -> bool {
        self.outbound_peers
            .iter()
            .any(|peer| peer.ip == ip && peer.port == port)
    }

    /// Delay before the next connect attempt to a peer: 1, 1, 2, 3, 5, 8
    /// then 13 seconds, capped at 13.
    fn next_retry_timeout(&self, ip: IpAddr, port: u16) -> u64 {
        let retries = self
            .num_retries_by_ip
            .get(&(ip, port))
            .copied()
            .unwrap_or(0) as usize;
        CONNECTION_RETRY_BACKOFF_S[retries.min(CONNECTION_RETRY_BACKOFF_S.len() - 1)]
    }

    /// Retry alarm callback: re-enqueues the connect request until the retry
    /// cap is reached. SDN connections retry without limit.
    fn retry_init_client_socket(
        &mut self,
        ip: IpAddr,
        port: u16,
        connection_type: ConnectionType,
    ) -> AlarmOutcome {
        let retries = self.num_retries_by_ip.entry((ip, port)).or_insert(0);
        *retries += 1;
        let attempt = *retries;

        if self.should_retry_connection(ip, port, connection_type) {
            info!(
                "Retrying {:?} connection to {}:{}. Attempt #{}.",
                connection_type, ip, port, attempt
            );
            self.enqueue_connection(ip, port);
        } else {
            self.num_retries_by_ip.remove(&(ip, port));
            warn!(
                "Maximum retry attempts exceeded. Dropping {:?} connection to {}:{}.",
                connection_type, ip, port
            );
            self.on_failed_connection_retry(
                ip,
                port,
                connection_type,
                FailedRetryReason::RetriesExhausted,
            );
        }
        AlarmOutcome::Cancel
    }

    fn should_retry_connection(
        &self,
        ip: IpAddr,
        port: u16,
        connection_type: ConnectionType,
    ) -> bool {
        connection_type.intersects(ConnectionType::SDN)
            || self
                .num_retries_by_ip
                .get(&(ip, port))
                .copied()
                .unwrap_or(0)
                < self.config.network.max_connect_retries
    }

    /// A relay peer is gone for good: report it to the control plane and ask
    /// for a replacement peer set.
    fn on_failed_connection_retry(
        &mut self,
        ip: IpAddr,
        port: u16,
        connection_type: ConnectionType,
        reason: FailedRetryReason,
    ) {
        debug!(
            "Connection to {}:{} will not be retried ({:?}).",
            ip, port, reason
        );
        if !connection_type.intersects(ConnectionType::RELAY_ALL) {
            return;
        }

        let event = NodeEvent::peer_connection_error(&self.config.node_id, ip, port);
        if let Err(err) = self.sdn.submit_node_event(event) {
            warn!("Unable to submit a peer connection error event: {}", err);
        }
        if let Some(peers) = self
            .behavior
            .request_relay_peers(self.sdn.as_ref(), &self.config.node_id)
        {
            if !peers.is_empty() {
                self.on_updated_peers(peers);
            }
        }
    }

    /// Applies a fresh outbound peer set: connections to peers that vanished
    /// from it are destroyed, new peers are enqueued for connect. Peers fixed
    /// in the node config always survive.
    pub fn on_updated_peers(&mut self, outbound_peer_models: Vec<OutboundPeer>) {
        if outbound_peer_models.is_empty() {
            warn!("Got a peer update with no peers.");
            return;
        }
        trace!("Processing updated outbound peers: {:?}.", outbound_peer_models);

        let remove_peers: Vec<(IpAddr, u16)> = self
            .outbound_peers
            .iter()
            .filter(|old_peer| {
                let fixed = self
                    .config
                    .outbound_peers
                    .iter()
                    .any(|peer| peer.ip == old_peer.ip && peer.port == old_peer.port);
                let updated = outbound_peer_models
                    .iter()
                    .any(|peer| peer.ip == old_peer.ip && peer.port == old_peer.port);
                !fixed && !updated
            })
            .map(|peer| (peer.ip, peer.port))
            .collect();
        for (ip, port) in remove_peers {
            if let Some(conn) = self.pool.get_by_ipport(ip, port) {
                let fileno = conn.fileno();
                self.destroy_connection(fileno, false);
            }
        }

        for peer in &outbound_peer_models {
            if !self.pool.has_connection(peer.ip, peer.port) {
                self.enqueue_connection(peer.ip, peer.port);
            }
        }
        self.outbound_peers = outbound_peer_models;
    }

    /// Requests a cooperative exit of the event loop.
    pub fn request_exit(&mut self) {
        self.should_force_exit = true;
    }

    /// Whether the event loop should exit.
    pub fn force_exit(&self) -> bool {
        self.should_force_exit || self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Destroys every connection and reports the node offline.
    pub fn close(&mut self) {
        error!("Node is closing! Closing everything.");
        let event = NodeEvent::offline(&self.config.node_id);
        if let Err(err) = self.sdn.submit_node_event(event) {
            warn!("Unable to submit the offline event: {}", err);
        }
        for fileno in self.pool.filenos() {
            self.destroy_connection(fileno, false);
        }
    }

    /// Heartbeat sweep over connections still holding outbound bytes; keeps
    /// the loop from sleeping past the output batch hold time.
    fn flush_all_send_buffers(&mut self, _now: Instant) -> AlarmOutcome {
        let held_back = self
            .pool
            .iter()
            .filter(|conn| conn.outbound_bytes_pending() > 0)
            .count();
        if held_back > 0 {
            trace!("{} connections hold unsent output bytes", held_back);
        }
        AlarmOutcome::Reschedule(self.flush_send_buffers_interval())
    }

    fn flush_send_buffers_interval(&self) -> Duration {
        duration_from_millis(self.config.network.output_buffer_batch_max_hold_time * 2)
    }

    fn flush_throughput_stats(&mut self, _now: Instant) -> AlarmOutcome {
        let report = ThroughputStats {
            connection_count: self.pool.len(),
            bytes_received: self.bytes_received,
            bytes_sent: self.bytes_sent,
        };
        self.stats.flush(StatsReport::Throughput(report));
        AlarmOutcome::Reschedule(THROUGHPUT_STATS_INTERVAL)
    }

    fn flush_node_info_stats(&mut self, _now: Instant) -> AlarmOutcome {
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for conn in self.pool.iter() {
            for subtype in conn.connection_type().get_subtypes() {
                *by_type.entry(format!("{:?}", subtype)).or_insert(0) += 1;
            }
        }
        let mut connections_by_type: Vec<_> = by_type.into_iter().collect();
        connections_by_type.sort();

        let report = NodeInfoStats {
            node_id: self.config.node_id.clone(),
            node_type: self.behavior.node_type(),
            connections_by_type,
        };
        self.stats.flush(StatsReport::NodeInfo(report));
        AlarmOutcome::Reschedule(NODE_INFO_STATS_INTERVAL)
    }

    fn flush_tx_cache_stats(&mut self, now: Instant) -> AlarmOutcome {
        let services: Vec<_> = self
            .tx_services
            .values_mut()
            .map(|service| service.stats(now))
            .collect();
        if !services.is_empty() {
            self.stats.flush(StatsReport::TxCache { services });
        }
        AlarmOutcome::Reschedule(TX_CACHE_STATS_INTERVAL)
    }

    /// Estimates cache memory usage and emits a detailed report each time it
    /// grows past the next reporting threshold.
    fn dump_memory_usage(&mut self, _now: Instant) -> AlarmOutcome {
        let tx_cache_bytes: u64 = self
            .tx_services
            .values()
            .map(TransactionService::total_tx_contents_size)
            .sum();
        let buffered_bytes: u64 = self
            .pool
            .iter()
            .map(|conn| (conn.outbound_bytes_pending() + conn.inbound_bytes_pending()) as u64)
            .sum();
        let total = tx_cache_bytes + buffered_bytes;

        if total >= self.next_report_mem_usage_bytes {
            info!(
                "Node consumes {} bytes which is over the report threshold of {} bytes.",
                total, self.next_report_mem_usage_bytes
            );
            self.stats.flush(StatsReport::Memory(MemoryStats {
                total_estimated_bytes: total,
                tx_cache_bytes,
            }));
            self.next_report_mem_usage_bytes =
                total + self.config.memory.usage_increase_for_next_report;
        }
        AlarmOutcome::Reschedule(MEMORY_STATS_INTERVAL)
    }
}

/// The full node runtime: the core plus its alarm queue and time source.
#[derive(Debug)]
pub struct NodeRuntime {
    alarms: AlarmQueue<NodeCore>,
    core: NodeCore,
    system_state: Box<dyn SystemStateProvider>,
}

impl NodeRuntime {
    fn now(&self) -> Instant {
        self.system_state.current_time()
    }

    /// Moves alarm registrations requested by the core into the queue.
    fn flush_pending_alarms(&mut self, now: Instant) {
        let pending: Vec<_> = self.core.pending_alarms.drain(..).collect();
        for alarm in pending {
            match alarm.slack {
                None => {
                    self.alarms
                        .register_alarm(now, alarm.delay, alarm.name, alarm.callback);
                }
                Some(slack) => {
                    let _ = self.alarms.register_approx_alarm(
                        now,
                        alarm.delay,
                        slack,
                        alarm.name,
                        alarm.callback,
                    );
                }
            }
        }
    }

    fn register_initial_alarms(&mut self) {
        let now = self.now();
        let flush_interval = self.core.flush_send_buffers_interval();
        let flush_slack =
            duration_from_millis(self.core.config.network.output_buffer_batch_max_hold_time);
        let _ = self.alarms.register_approx_alarm(
            now,
            flush_interval,
            flush_slack,
            "flush_send_buffers",
            |core: &mut NodeCore, now| core.flush_all_send_buffers(now),
        );
        self.alarms.register_alarm(
            now,
            THROUGHPUT_STATS_INTERVAL,
            "throughput_stats",
            |core: &mut NodeCore, now| core.flush_throughput_stats(now),
        );
        self.alarms.register_alarm(
            now,
            NODE_INFO_STATS_INTERVAL,
            "node_info_stats",
            |core: &mut NodeCore, now| core.flush_node_info_stats(now),
        );
        self.alarms.register_alarm(
            now,
            TX_CACHE_STATS_INTERVAL,
            "tx_cache_stats",
            |core: &mut NodeCore, now| core.flush_tx_cache_stats(now),
        );
        self.alarms.register_alarm(
            now,
            MEMORY_STATS_INTERVAL,
            "memory_stats",
            |core: &mut NodeCore, now| core.dump_memory_usage(now),
        );
    }

    /// Read access to the core (pool, config, queues).
    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    /// Mutable access to the core for node-kind logic running off callbacks
    /// (e.g. RPC wiring). Alarms it schedules are armed on the next entry
    /// point.
    pub fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    pub fn on_connection_added(&mut self, fileno: Fileno, ip: IpAddr, port: u16, from_me: bool) {
        let now = self.now();
        self.core.on_connection_added(fileno, ip, port, from_me, now);
        self.flush_pending_alarms(now);
    }

    pub fn on_connection_initialized(&mut self, fileno: Fileno) {
        let now = self.now();
        self.core.on_connection_initialized(fileno, now);
        self.flush_pending_alarms(now);
    }

    pub fn on_connection_closed(&mut self, fileno: Fileno) {
        let now = self.now();
        self.core.on_connection_closed(fileno);
        self.flush_pending_alarms(now);
    }

    pub fn on_bytes_received(&mut self, fileno: Fileno, bytes_received: Bytes) {
        let now = self.now();
        self.core.on_bytes_received(fileno, bytes_received);
        self.flush_pending_alarms(now);
    }

    pub fn on_finished_receiving(&mut self, fileno: Fileno) {
        let now = self.now();
        self.core.on_finished_receiving(fileno, now);
        self.flush_pending_alarms(now);
    }

    pub fn get_bytes_to_send(&self, fileno: Fileno) -> Option<Bytes> {
        self.core.get_bytes_to_send(fileno)
    }

    pub fn on_bytes_sent(&mut self, fileno: Fileno, num_bytes: usize) {
        let now = self.now();
        self.core.on_bytes_sent(fileno, num_bytes, now);
        self.flush_pending_alarms(now);
    }

    pub fn broadcast(
        &mut self,
        msg: &MessageRef,
        sender: Option<Fileno>,
        options: &BroadcastOptions,
    ) -> Vec<Fileno> {
        let now = self.now();
        let recipients = self.core.broadcast(msg, sender, options, now);
        self.flush_pending_alarms(now);
        recipients
    }

    pub fn on_updated_peers(&mut self, outbound_peer_models: Vec<OutboundPeer>) {
        let now = self.now();
        self.core.on_updated_peers(outbound_peer_models);
        self.flush_pending_alarms(now);
    }

    pub fn enqueue_connection(&mut self, ip: IpAddr, port: u16) {
        self.core.enqueue_connection(ip, port);
    }

    pub fn enqueue_disconnect(&mut self, fileno: Fileno) {
        self.core.enqueue_disconnect(fileno);
    }

    pub fn pop_next_connection_address(&mut self) -> Option<(IpAddr, u16)> {
        self.core.pop_next_connection_address()
    }

    pub fn pop_next_disconnect_connection(&mut self) -> Option<Fileno> {
        self.core.pop_next_disconnect_connection()
    }

    pub fn destroy_connection(&mut self, fileno: Fileno, retry_connection: bool) {
        let now = self.now();
        self.core.destroy_connection(fileno, retry_connection);
        self.flush_pending_alarms(now);
    }

    /// Sleep interval for the event loop. The first call only reads the time
    /// to the next alarm; subsequent calls fire every ready alarm first. With
    /// queued connect/disconnect requests the interval is clamped down so the
    /// loop returns promptly.
    pub fn get_sleep_timeout(&mut self, triggered_by_timeout: bool, first_call: bool) -> Seconds {
        let now = self.now();
        let default =
            duration_from_millis(self.core.config.network.default_sleep_timeout).as_secs_f64();

        if first_call {
            return match self.alarms.time_to_next_alarm(now) {
                Some(timeout) if timeout >= 0.0 => timeout,
                _ => default,
            };
        }

        trace!(
            "Firing ready alarms (triggered_by_timeout={})",
            triggered_by_timeout
        );
        self.alarms.fire_ready_alarms(now, &mut self.core);
        self.flush_pending_alarms(now);

        let time_to_next = self.alarms.time_to_next_alarm(now).unwrap_or(default);
        if self.core.has_queued_requests() {
            time_to_next.min(default)
        } else {
            time_to_next
        }
    }

    /// Whether the event loop should exit, either cooperatively or because a
    /// shutdown signal arrived.
    pub fn force_exit(&self) -> bool {
        self.core.force_exit()
    }

    /// Propagates a received shutdown signal as an error the loop unwinds
    /// with.
    pub fn raise_if_terminated(&self) -> Result<(), TerminationError> {
        if self.core.shutdown_requested.load(Ordering::SeqCst) {
            Err(TerminationError)
        } else {
            Ok(())
        }
    }

    /// Destroys all connections; the node cannot be used afterwards.
    pub fn close(&mut self) {
        let now = self.now();
        self.core.close();
        self.flush_pending_alarms(now);
    }
}

/// Builder for [`NodeRuntime`]. Registration with the control plane happens
/// in `build`; a control plane that cannot be reached at this point is fatal.
#[derive(Debug)]
pub struct NodeBuilder {
    config: NodeConfig,
    behavior: Box<dyn NodeBehavior>,
    sdn: Box<dyn SdnClient>,
    stats: Box<dyn StatsSink>,
    system_state: Box<dyn SystemStateProvider>,
    disable_signals: bool,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig, behavior: impl NodeBehavior + 'static) -> Self {
        Self {
            config,
            behavior: Box::new(behavior),
            sdn: Box::new(crate::sdn::NoopSdn),
            stats: Box::new(crate::stats::LogStats),
            system_state: Box::new(DefaultSystemState),
            disable_signals: false,
        }
    }

    pub fn with_sdn(mut self, sdn: impl SdnClient + 'static) -> Self {
        self.sdn = Box::new(sdn);
        self
    }

    pub fn with_stats(mut self, stats: impl StatsSink + 'static) -> Self {
        self.stats = Box::new(stats);
        self
    }

    pub fn with_system_state(mut self, system_state: impl SystemStateProvider + 'static) -> Self {
        self.system_state = Box::new(system_state);
        self
    }

    /// Switches off default signal handling, e.g. for tests or embedders
    /// with their own handlers.
    pub fn disable_signals(mut self) -> Self {
        self.disable_signals = true;
        self
    }

    /// Validates the configuration, registers the node with the control
    /// plane and assembles the runtime.
    pub fn build(mut self) -> anyhow::Result<NodeRuntime> {
        self.config.validate()?;

        let model = NodeModel {
            node_id: self.config.node_id.clone(),
            external_ip: self.config.external_ip.clone(),
            external_port: self.config.external_port,
            network_num: self.config.network_num,
            node_type: self.behavior.node_type(),
            online: true,
        };
        let registered = self
            .sdn
            .register_node(&model)
            .context("unable to register the node with the control plane")?;
        info!(
            "Registered node {} of type {:?}.",
            registered.node_id,
            self.behavior.node_type()
        );
        self.config.node_id = registered.node_id;
        if let Err(err) = self
            .sdn
            .submit_node_event(NodeEvent::online(&self.config.node_id))
        {
            warn!("Unable to submit the online event: {}", err);
        }

        let shutdown_requested = Arc::new(AtomicBool::new(false));
        if !self.disable_signals {
            install_signal_handlers(Arc::clone(&shutdown_requested));
        }

        let outbound_peers = self.config.outbound_peers.clone();
        let next_report_mem_usage_bytes = self.config.memory.dump_detailed_report_at_memory_usage;
        let mut core = NodeCore {
            config: self.config,
            behavior: self.behavior,
            sdn: self.sdn,
            stats: self.stats,
            pool: ConnectionPool::new(),
            connection_queue: VecDeque::new(),
            disconnect_queue: VecDeque::new(),
            outbound_peers,
            num_retries_by_ip: HashMap::new(),
            tx_services: HashMap::new(),
            new_tx_feeds: HashMap::new(),
            pending_alarms: Vec::new(),
            should_force_exit: false,
            shutdown_requested,
            bytes_received: 0,
            bytes_sent: 0,
            next_report_mem_usage_bytes,
        };
        for peer in core.outbound_peers.clone() {
            core.enqueue_connection(peer.ip, peer.port);
        }

        let mut runtime = NodeRuntime {
            alarms: AlarmQueue::new(),
            core,
            system_state: self.system_state,
        };
        runtime.register_initial_alarms();
        Ok(runtime)
    }
}

fn install_signal_handlers(shutdown_requested: Arc<AtomicBool>) {
    let result = ctrlc::set_handler(move || shutdown_requested.store(true, Ordering::SeqCst));
    if let Err(err) = result {
        warn!("Unable to install signal handlers: {}", err);
    }
}
