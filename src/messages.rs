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

//! Wire framing and the built-in control messages.
//!
//! Every message on the wire is `(type string, payload length, payload,
//! checksum)`: a NUL-padded ASCII command of [`COMMAND_LEN`] bytes, a `u32`
//! LE payload length, the payload itself and a `u32` LE checksum of the
//! payload. The runtime treats application messages as opaque buffers; only
//! the control set (hello / ack / ping / pong) is decoded here.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use log::Level;
use thiserror::Error;

use std::{fmt, sync::Arc};

use crate::{buffers::InputBuffer, NetworkNum};

/// Length of the NUL-padded command field.
pub const COMMAND_LEN: usize = 12;
/// Length of the frame header (command + payload length).
pub const HEADER_LEN: usize = COMMAND_LEN + 4;
/// Length of the payload checksum trailing the payload.
pub const CHECKSUM_LEN: usize = 4;
/// Payload size limit applied by the default framer.
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 10 * 1024 * 1024;

/// Command strings of the built-in control messages.
pub mod commands {
    pub const HELLO: &str = "hello";
    pub const ACK: &str = "ack";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// An outbound message: an opaque framed byte buffer plus logging metadata.
pub trait Message: fmt::Debug + fmt::Display {
    /// Full framed bytes of the message, as written to the wire.
    fn rawbytes(&self) -> Bytes;

    /// Level at which sends of this message are logged.
    fn log_level(&self) -> Level {
        Level::Debug
    }
}

/// Shared handle to a message, cheap to fan out to many output buffers.
pub type MessageRef = Arc<dyn Message>;

/// Framing failure on an inbound byte stream. Any of these marks the
/// offending connection for close.
#[derive(Debug, Error, PartialEq)]
pub enum FramingError {
    #[error("malformed command string in message header")]
    BadCommand,
    #[error("message payload of {got} bytes exceeds the limit of {limit}")]
    OversizedPayload { got: usize, limit: usize },
    #[error("payload checksum mismatch: expected {expected:#010x}, got {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },
    #[error("message payload is truncated")]
    TruncatedPayload,
}

fn payload_checksum(payload: &[u8]) -> u32 {
    // 32-bit FNV-1a.
    let mut hash: u32 = 0x811c_9dc5;
    for byte in payload {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Frames a command and payload into full wire bytes.
///
/// # Panics
///
/// Panics when `command` does not fit the header's command field or is not
/// ASCII.
pub fn encode_frame(command: &str, payload: &[u8]) -> Bytes {
    assert!(
        command.len() <= COMMAND_LEN && command.is_ascii(),
        "invalid message command: {:?}",
        command
    );
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    frame.put_slice(command.as_bytes());
    frame.put_bytes(0, COMMAND_LEN - command.len());
    frame.put_u32_le(payload.len() as u32);
    frame.put_slice(payload);
    frame.put_u32_le(payload_checksum(payload));
    frame.freeze()
}

/// A single framed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFrame {
    command: String,
    payload: Bytes,
    raw: Bytes,
}

impl MessageFrame {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Full frame bytes, reusable for relaying the message verbatim.
    pub fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }
}

impl fmt::Display for MessageFrame {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}<{} bytes>",
            self.command,
            self.payload.len()
        )
    }
}

/// Splits framed messages off an input buffer.
#[derive(Debug)]
pub struct Framer {
    max_payload_len: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN)
    }
}

impl Framer {
    pub fn new(max_payload_len: usize) -> Self {
        Self { max_payload_len }
    }

    /// Pops the next complete frame off `input`. `Ok(None)` means more bytes
    /// are needed.
    pub fn try_parse(&self, input: &mut InputBuffer) -> Result<Option<MessageFrame>, FramingError> {
        let header = input.peek_message(HEADER_LEN);
        if header.len() < HEADER_LEN {
            return Ok(None);
        }

        let command_field = &header[..COMMAND_LEN];
        let command_len = command_field
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(COMMAND_LEN);
        let command = std::str::from_utf8(&command_field[..command_len])
            .map_err(|_| FramingError::BadCommand)?;
        if command.is_empty()
            || !command.is_ascii()
            || command_field[command_len..].iter().any(|&byte| byte != 0)
        {
            return Err(FramingError::BadCommand);
        }
        let command = command.to_owned();

        let payload_len = LittleEndian::read_u32(&header[COMMAND_LEN..HEADER_LEN]) as usize;
        if payload_len > self.max_payload_len {
            return Err(FramingError::OversizedPayload {
                got: payload_len,
                limit: self.max_payload_len,
            });
        }

        let frame_len = HEADER_LEN + payload_len + CHECKSUM_LEN;
        if input.len() < frame_len {
            return Ok(None);
        }

        let raw = input.remove_bytes(frame_len);
        let payload = raw.slice(HEADER_LEN..HEADER_LEN + payload_len);
        let expected = LittleEndian::read_u32(&raw[frame_len - CHECKSUM_LEN..]);
        let got = payload_checksum(&payload);
        if expected != got {
            return Err(FramingError::ChecksumMismatch { expected, got });
        }

        Ok(Some(MessageFrame {
            command,
            payload,
            raw,
        }))
    }
}

/// An opaque application message relayed without interpretation.
#[derive(Debug, Clone)]
pub struct RawMessage {
    command: String,
    raw: Bytes,
    log_level: Level,
}

impl RawMessage {
    pub fn new(command: &str, payload: Bytes) -> Self {
        Self {
            command: command.to_owned(),
            raw: encode_frame(command, &payload),
            log_level: Level::Debug,
        }
    }

    /// Wraps an inbound frame for re-broadcast, reusing its framed bytes.
    pub fn from_frame(frame: &MessageFrame) -> Self {
        Self {
            command: frame.command().to_owned(),
            raw: frame.rawbytes(),
            log_level: Level::Debug,
        }
    }

    pub fn with_log_level(mut self, log_level: Level) -> Self {
        self.log_level = log_level;
        self
    }
}

impl Message for RawMessage {
    fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }

    fn log_level(&self) -> Level {
        self.log_level
    }
}

impl fmt::Display for RawMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}<{} bytes>",
            self.command,
            self.raw.len()
        )
    }
}

/// Handshake opener carrying the sender's identity.
#[derive(Debug, Clone)]
pub struct HelloMessage {
    node_id: String,
    network_num: NetworkNum,
    raw: Bytes,
}

impl HelloMessage {
    pub fn new(node_id: &str, network_num: NetworkNum) -> Self {
        let mut payload = Vec::with_capacity(4 + node_id.len());
        payload.extend_from_slice(&network_num.to_le_bytes());
        payload.extend_from_slice(node_id.as_bytes());
        Self {
            node_id: node_id.to_owned(),
            network_num,
            raw: encode_frame(commands::HELLO, &payload),
        }
    }

    pub fn from_payload(payload: &Bytes) -> Result<Self, FramingError> {
        if payload.len() < 4 {
            return Err(FramingError::TruncatedPayload);
        }
        let network_num = LittleEndian::read_u32(&payload[..4]);
        let node_id = std::str::from_utf8(&payload[4..])
            .map_err(|_| FramingError::TruncatedPayload)?
            .to_owned();
        Ok(Self::new(&node_id, network_num))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn network_num(&self) -> NetworkNum {
        self.network_num
    }
}

impl Message for HelloMessage {
    fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }
}

impl fmt::Display for HelloMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "Hello(node_id={}, network_num={})",
            self.node_id, self.network_num
        )
    }
}

/// Handshake acknowledgement.
#[derive(Debug, Clone)]
pub struct AckMessage {
    raw: Bytes,
}

impl AckMessage {
    pub fn new() -> Self {
        Self {
            raw: encode_frame(commands::ACK, &[]),
        }
    }
}

impl Default for AckMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl Message for AckMessage {
    fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }
}

impl fmt::Display for AckMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("Ack")
    }
}

/// Keep-alive probe.
#[derive(Debug, Clone)]
pub struct PingMessage {
    nonce: u64,
    raw: Bytes,
}

impl PingMessage {
    pub fn new(nonce: u64) -> Self {
        Self {
            nonce,
            raw: encode_frame(commands::PING, &nonce.to_le_bytes()),
        }
    }

    pub fn from_payload(payload: &Bytes) -> Result<Self, FramingError> {
        Ok(Self::new(read_nonce(payload)?))
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl Message for PingMessage {
    fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }

    fn log_level(&self) -> Level {
        Level::Trace
    }
}

impl fmt::Display for PingMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Ping(nonce={})", self.nonce)
    }
}

/// Keep-alive reply echoing the probe's nonce.
#[derive(Debug, Clone)]
pub struct PongMessage {
    nonce: u64,
    raw: Bytes,
}

impl PongMessage {
    pub fn new(nonce: u64) -> Self {
        Self {
            nonce,
            raw: encode_frame(commands::PONG, &nonce.to_le_bytes()),
        }
    }

    pub fn from_payload(payload: &Bytes) -> Result<Self, FramingError> {
        Ok(Self::new(read_nonce(payload)?))
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

impl Message for PongMessage {
    fn rawbytes(&self) -> Bytes {
        self.raw.clone()
    }

    fn log_level(&self) -> Level {
        Level::Trace
    }
}

impl fmt::Display for PongMessage {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Pong(nonce={})", self.nonce)
    }
}

fn read_nonce(payload: &Bytes) -> Result<u64, FramingError> {
    if payload.len() < 8 {
        return Err(FramingError::TruncatedPayload);
    }
    Ok(LittleEndian::read_u64(&payload[..8]))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn feed(input: &mut InputBuffer, bytes: &Bytes) {
        input.add_bytes(bytes.clone());
    }

    #[test]
    fn parses_a_complete_frame() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        feed(&mut input, &encode_frame("tx", b"payload"));

        let frame = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(frame.command(), "tx");
        assert_eq!(frame.payload().as_ref(), b"payload");
        assert!(input.is_empty());
    }

    #[test]
    fn waits_for_missing_bytes() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        let frame_bytes = encode_frame("tx", b"some payload");

        // Header only.
        feed(&mut input, &frame_bytes.slice(..HEADER_LEN));
        assert_eq!(framer.try_parse(&mut input).unwrap(), None);

        // Header plus part of the payload.
        feed(&mut input, &frame_bytes.slice(HEADER_LEN..HEADER_LEN + 4));
        assert_eq!(framer.try_parse(&mut input).unwrap(), None);

        // Remainder.
        feed(&mut input, &frame_bytes.slice(HEADER_LEN + 4..));
        let frame = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"some payload");
    }

    #[test]
    fn parses_back_to_back_frames() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        feed(&mut input, &encode_frame("ping", &1_u64.to_le_bytes()));
        feed(&mut input, &encode_frame("pong", &2_u64.to_le_bytes()));

        let first = framer.try_parse(&mut input).unwrap().unwrap();
        let second = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(first.command(), "ping");
        assert_eq!(second.command(), "pong");
        assert_eq!(framer.try_parse(&mut input).unwrap(), None);
    }

    #[test]
    fn rejects_corrupted_payload() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        let mut corrupted = encode_frame("tx", b"payload").to_vec();
        corrupted[HEADER_LEN] ^= 0xff;
        input.add_bytes(corrupted.into());

        match framer.try_parse(&mut input) {
            Err(FramingError::ChecksumMismatch { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_oversized_payload() {
        let framer = Framer::new(8);
        let mut input = InputBuffer::new();
        feed(&mut input, &encode_frame("tx", &[0; 16]));

        assert_eq!(
            framer.try_parse(&mut input),
            Err(FramingError::OversizedPayload { got: 16, limit: 8 })
        );
    }

    #[test]
    fn rejects_non_ascii_command() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        let mut bad = encode_frame("tx", b"").to_vec();
        bad[0] = 0xfe;
        input.add_bytes(bad.into());

        assert_eq!(framer.try_parse(&mut input), Err(FramingError::BadCommand));
    }

    #[test]
    fn hello_round_trip() {
        let hello = HelloMessage::new("node-1", 7);
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        input.add_bytes(hello.rawbytes());

        let frame = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(frame.command(), commands::HELLO);
        let decoded = HelloMessage::from_payload(frame.payload()).unwrap();
        assert_eq!(decoded.node_id(), "node-1");
        assert_eq!(decoded.network_num(), 7);
    }

    #[test]
    fn ping_pong_round_trip() {
        let framer = Framer::default();
        let mut input = InputBuffer::new();
        input.add_bytes(PingMessage::new(42).rawbytes());
        input.add_bytes(PongMessage::new(42).rawbytes());

        let ping = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(
            PingMessage::from_payload(ping.payload()).unwrap().nonce(),
            42
        );
        let pong = framer.try_parse(&mut input).unwrap().unwrap();
        assert_eq!(
            PongMessage::from_payload(pong.payload()).unwrap().nonce(),
            42
        );
    }

    #[test]
    fn truncated_control_payload_is_rejected() {
        let err = PingMessage::from_payload(&Bytes::from_static(b"abc")).unwrap_err();
        assert_eq!(err, FramingError::TruncatedPayload);
    }
}
