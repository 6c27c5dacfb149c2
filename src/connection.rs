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

//! A single peer link and its lifecycle state machine.
//!
//! Connection state is a bitmask rather than an enum because several facets
//! coexist: a connection is `CONNECTING` from creation, gains `INITIALIZED`
//! once its socket is usable, gains `ESTABLISHED` once the application-level
//! handshake completes, and `MARK_FOR_CLOSE` can be set from any state and is
//! terminal. A marked connection accepts no further reads or writes.

use bitflags::bitflags;
use log::{debug, info, log, trace, warn};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use std::{fmt, net::IpAddr, sync::Arc, time::Instant};

use crate::{
    buffers::{InputBuffer, MessageTracker, OutputBuffer},
    messages::{
        commands, AckMessage, Framer, HelloMessage, MessageFrame, MessageRef, PingMessage,
        PongMessage,
    },
    node::NodeCore,
    Fileno, NetworkNum, NodeConfig,
};

bitflags! {
    /// Lifecycle facets of a connection.
    pub struct ConnectionState: u8 {
        const CONNECTING     = 0b0001;
        const INITIALIZED    = 0b0010;
        const ESTABLISHED    = 0b0100;
        const MARK_FOR_CLOSE = 0b1000;
    }
}

bitflags! {
    /// Kind of the peer on the other side of a connection.
    pub struct ConnectionType: u32 {
        const SDN                    = 0b00_0001;
        const RELAY_TRANSACTION      = 0b00_0010;
        const RELAY_BLOCK            = 0b00_0100;
        const RELAY_ALL              = Self::RELAY_TRANSACTION.bits | Self::RELAY_BLOCK.bits;
        const BLOCKCHAIN_NODE        = 0b00_1000;
        const REMOTE_BLOCKCHAIN_NODE = 0b01_0000;
        const GATEWAY                = 0b10_0000;
    }
}

impl ConnectionType {
    /// Iterates the individual flags set in this mask.
    pub fn get_subtypes(self) -> impl Iterator<Item = Self> {
        (0..32)
            .filter_map(Self::from_bit)
            .filter(move |flag| self.contains(*flag))
    }

    fn from_bit(bit: u32) -> Option<Self> {
        Self::from_bits(1 << bit)
    }
}

bitflags! {
    /// Kind of a node in the relay network.
    pub struct NodeType: u32 {
        const INTERNAL_GATEWAY  = 0b00_0001;
        const EXTERNAL_GATEWAY  = 0b00_0010;
        const GATEWAY           = Self::INTERNAL_GATEWAY.bits | Self::EXTERNAL_GATEWAY.bits;
        const RELAY_TRANSACTION = 0b00_0100;
        const RELAY_BLOCK       = 0b00_1000;
        const RELAY             = Self::RELAY_TRANSACTION.bits | Self::RELAY_BLOCK.bits;
        const API               = 0b01_0000;
        const API_SOCKET        = 0b10_0000;
    }
}

impl NodeType {
    /// Iterates the individual flags set in this mask.
    pub fn get_subtypes(self) -> impl Iterator<Item = Self> {
        (0..32)
            .filter_map(|bit| Self::from_bits(1 << bit))
            .filter(move |flag| self.contains(*flag))
    }
}

impl Serialize for NodeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_bits(bits)
            .ok_or_else(|| de::Error::custom(format!("invalid node type bits: {:#x}", bits)))
    }
}

/// Application protocol of a connection, supplied by the concrete node kind.
///
/// While a frame is being processed the connection is temporarily out of the
/// node's pool, so the handler gets exclusive access to both.
pub trait ConnectionProtocol: fmt::Debug {
    /// Called once the socket layer reports the connection usable for I/O.
    fn on_initialized(&mut self, _conn: &mut Connection, _config: &NodeConfig, _now: Instant) {}

    /// Handles one complete inbound frame.
    fn process_frame(
        &mut self,
        conn: &mut Connection,
        node: &mut NodeCore,
        frame: MessageFrame,
        now: Instant,
    );

    /// Enqueues this protocol's keep-alive probe.
    fn send_ping(&mut self, conn: &mut Connection, now: Instant);
}

/// State and buffers of a single peer link.
#[derive(Debug)]
pub struct Connection {
    fileno: Fileno,
    peer_ip: IpAddr,
    peer_port: u16,
    from_me: bool,
    connection_type: ConnectionType,
    network_num: NetworkNum,
    state: ConnectionState,
    inputbuf: InputBuffer,
    outputbuf: OutputBuffer,
    message_tracker: Option<MessageTracker>,
    framer: Framer,
    protocol: Option<Box<dyn ConnectionProtocol>>,
}

impl Connection {
    pub fn new(
        fileno: Fileno,
        peer_ip: IpAddr,
        peer_port: u16,
        from_me: bool,
        connection_type: ConnectionType,
        network_num: NetworkNum,
        protocol: Box<dyn ConnectionProtocol>,
    ) -> Self {
        Self {
            fileno,
            peer_ip,
            peer_port,
            from_me,
            connection_type,
            network_num,
            state: ConnectionState::CONNECTING,
            inputbuf: InputBuffer::new(),
            outputbuf: OutputBuffer::new(),
            message_tracker: None,
            framer: Framer::default(),
            protocol: Some(protocol),
        }
    }

    /// Enables per-message send timing on this connection.
    pub fn with_message_tracker(mut self) -> Self {
        self.message_tracker = Some(MessageTracker::new(format!(
            "{}:{}",
            self.peer_ip, self.peer_port
        )));
        self
    }

    pub fn fileno(&self) -> Fileno {
        self.fileno
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    pub fn peer_port(&self) -> u16 {
        self.peer_port
    }

    pub fn from_me(&self) -> bool {
        self.from_me
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn network_num(&self) -> NetworkNum {
        self.network_num
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Established and not marked for close.
    pub fn is_active(&self) -> bool {
        self.state.contains(ConnectionState::ESTABLISHED)
            && !self.state.contains(ConnectionState::MARK_FOR_CLOSE)
    }

    pub fn is_marked_for_close(&self) -> bool {
        self.state.contains(ConnectionState::MARK_FOR_CLOSE)
    }

    /// Marks the connection closed. Terminal; all further input callbacks on
    /// this connection become no-ops.
    pub fn mark_for_close(&mut self) {
        if !self.state.contains(ConnectionState::MARK_FOR_CLOSE) {
            debug!("Marking connection for close: {}", self);
            self.state.insert(ConnectionState::MARK_FOR_CLOSE);
        }
    }

    /// Transitions the connection to `INITIALIZED` and lets its protocol open
    /// the handshake.
    pub fn handle_initialized(&mut self, config: &NodeConfig, now: Instant) {
        self.state.insert(ConnectionState::INITIALIZED);
        let mut protocol = self.take_protocol();
        protocol.on_initialized(self, config, now);
        self.protocol = Some(protocol);
    }

    /// Records completion of the application-level handshake.
    pub fn set_established(&mut self) {
        if !self.state.contains(ConnectionState::ESTABLISHED) {
            self.state.insert(ConnectionState::ESTABLISHED);
            info!("Connection established: {}", self);
        }
    }

    /// Appends received bytes to the input buffer. No-op once the connection
    /// is marked for close.
    pub fn add_received_bytes(&mut self, bytes_received: bytes::Bytes) {
        if self.is_marked_for_close() {
            return;
        }
        self.inputbuf.add_bytes(bytes_received);
    }

    /// Pops the next complete inbound frame, if one is buffered.
    pub fn pop_next_frame(
        &mut self,
    ) -> Result<Option<MessageFrame>, crate::messages::FramingError> {
        self.framer.try_parse(&mut self.inputbuf)
    }

    /// Appends (or prepends) a message to the output buffer. No-op once the
    /// connection is marked for close.
    pub fn enqueue_msg(&mut self, msg: &MessageRef, prepend: bool, now: Instant) {
        if self.is_marked_for_close() {
            return;
        }
        let bytes = msg.rawbytes();
        log!(msg.log_level(), "Enqueued {} to {}", msg, self);
        if let Some(tracker) = &mut self.message_tracker {
            if prepend {
                tracker.prepend_message(bytes.len(), Some(Arc::clone(msg)), now);
            } else {
                tracker.append_message(bytes.len(), Some(Arc::clone(msg)), now);
            }
        }
        if prepend {
            self.outputbuf.prepend_msg(bytes);
        } else {
            self.outputbuf.enqueue_msgbytes(bytes);
        }
    }

    /// Next chunk of outbound bytes for the socket layer, if any.
    pub fn get_bytes_to_send(&self) -> Option<bytes::Bytes> {
        if self.is_marked_for_close() || !self.outputbuf.has_more_bytes() {
            return None;
        }
        Some(self.outputbuf.get_buffer())
    }

    /// Records bytes the socket layer handed to the kernel.
    pub fn advance_sent_bytes(&mut self, num_bytes: usize, now: Instant) {
        self.outputbuf.advance_buffer(num_bytes);
        if let Some(tracker) = &mut self.message_tracker {
            tracker.advance_bytes(num_bytes, now);
        }
    }

    /// Enqueues this connection's keep-alive probe.
    pub fn send_ping(&mut self, now: Instant) {
        let mut protocol = self.take_protocol();
        protocol.send_ping(self, now);
        self.protocol = Some(protocol);
    }

    pub(crate) fn take_protocol(&mut self) -> Box<dyn ConnectionProtocol> {
        self.protocol
            .take()
            .expect("connection protocol is missing (reentrant frame processing?)")
    }

    pub(crate) fn restore_protocol(&mut self, protocol: Box<dyn ConnectionProtocol>) {
        self.protocol = Some(protocol);
    }

    /// Total number of unsent outbound bytes.
    pub fn outbound_bytes_pending(&self) -> usize {
        self.outputbuf.len()
    }

    /// Total number of buffered inbound bytes not yet framed.
    pub fn inbound_bytes_pending(&self) -> usize {
        self.inputbuf.len()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "Connection(fd={}, addr={}:{}, type={:?})",
            self.fileno, self.peer_ip, self.peer_port, self.connection_type
        )
    }
}

/// Built-in control protocol: hello/ack handshake plus ping/pong keep-alive.
///
/// Node kinds with richer message sets embed this behavior in their own
/// `ConnectionProtocol` implementations.
#[derive(Debug, Default)]
pub struct BdnProtocol {
    ping_nonce: u64,
}

impl BdnProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnectionProtocol for BdnProtocol {
    fn on_initialized(&mut self, conn: &mut Connection, config: &NodeConfig, now: Instant) {
        if conn.from_me() {
            let hello: MessageRef =
                Arc::new(HelloMessage::new(&config.node_id, config.network_num));
            conn.enqueue_msg(&hello, false, now);
        }
    }

    fn process_frame(
        &mut self,
        conn: &mut Connection,
        _node: &mut NodeCore,
        frame: MessageFrame,
        now: Instant,
    ) {
        match frame.command() {
            commands::HELLO => match HelloMessage::from_payload(frame.payload()) {
                Ok(hello) => {
                    debug!("Received {} on {}", hello, conn);
                    let ack: MessageRef = Arc::new(AckMessage::new());
                    conn.enqueue_msg(&ack, false, now);
                    conn.set_established();
                }
                Err(err) => {
                    warn!("Bad hello payload on {}: {}", conn, err);
                    conn.mark_for_close();
                }
            },
            commands::ACK => conn.set_established(),
            commands::PING => match PingMessage::from_payload(frame.payload()) {
                Ok(ping) => {
                    let pong: MessageRef = Arc::new(PongMessage::new(ping.nonce()));
                    conn.enqueue_msg(&pong, false, now);
                }
                Err(err) => {
                    warn!("Bad ping payload on {}: {}", conn, err);
                    conn.mark_for_close();
                }
            },
            commands::PONG => trace!("Received pong on {}", conn),
            other => {
                warn!("Unexpected message `{}` on {}", other, conn);
                conn.mark_for_close();
            }
        }
    }

    fn send_ping(&mut self, conn: &mut Connection, now: Instant) {
        self.ping_nonce += 1;
        let ping: MessageRef = Arc::new(PingMessage::new(self.ping_nonce));
        conn.enqueue_msg(&ping, false, now);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn connection(state_mutator: impl FnOnce(&mut Connection)) -> Connection {
        let mut conn = Connection::new(
            5,
            "1.2.3.4".parse().unwrap(),
            9000,
            true,
            ConnectionType::RELAY_ALL,
            7,
            Box::new(BdnProtocol::new()),
        );
        state_mutator(&mut conn);
        conn
    }

    #[test]
    fn starts_in_connecting_state() {
        let conn = connection(|_| {});
        assert_eq!(conn.state(), ConnectionState::CONNECTING);
        assert!(!conn.is_active());
    }

    #[test]
    fn establishing_follows_initialization() {
        let config = NodeConfig::default();
        let mut conn = connection(|_| {});
        conn.handle_initialized(&config, Instant::now());
        assert!(conn.state().contains(ConnectionState::INITIALIZED));
        assert!(!conn.is_active());

        conn.set_established();
        assert!(conn.is_active());
    }

    #[test]
    fn outbound_connection_opens_with_hello() {
        let config = NodeConfig::default();
        let mut conn = connection(|_| {});
        conn.handle_initialized(&config, Instant::now());
        let bytes = conn.get_bytes_to_send().expect("hello must be queued");
        assert_eq!(&bytes[..5], b"hello");
    }

    #[test]
    fn inbound_connection_stays_silent_until_hello() {
        let mut conn = Connection::new(
            6,
            "1.2.3.4".parse().unwrap(),
            9000,
            false,
            ConnectionType::GATEWAY,
            7,
            Box::new(BdnProtocol::new()),
        );
        conn.handle_initialized(&NodeConfig::default(), Instant::now());
        assert!(conn.get_bytes_to_send().is_none());
    }

    #[test]
    fn marked_connection_ignores_all_io() {
        let now = Instant::now();
        let mut conn = connection(Connection::mark_for_close);
        conn.add_received_bytes(bytes::Bytes::from_static(b"data"));
        assert_eq!(conn.inbound_bytes_pending(), 0);

        let ping: MessageRef = Arc::new(PingMessage::new(1));
        conn.enqueue_msg(&ping, false, now);
        assert_eq!(conn.outbound_bytes_pending(), 0);
        assert!(conn.get_bytes_to_send().is_none());
    }

    #[test]
    fn mark_for_close_is_terminal() {
        let mut conn = connection(Connection::mark_for_close);
        conn.set_established();
        assert!(!conn.is_active());
        assert!(conn.is_marked_for_close());
    }

    #[test]
    fn connection_type_subtypes_iterate_set_bits() {
        let subtypes: Vec<_> = ConnectionType::RELAY_ALL.get_subtypes().collect();
        assert_eq!(
            subtypes,
            vec![
                ConnectionType::RELAY_TRANSACTION,
                ConnectionType::RELAY_BLOCK
            ]
        );

        let subtypes: Vec<_> = ConnectionType::SDN.get_subtypes().collect();
        assert_eq!(subtypes, vec![ConnectionType::SDN]);
    }

    #[test]
    fn node_type_serde_round_trip() {
        let node_type = NodeType::RELAY;
        let json = serde_json::to_string(&node_type).unwrap();
        let restored: NodeType = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, node_type);

        assert!(serde_json::from_str::<NodeType>("1024").is_err());
    }
}
