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

use bytes::{Bytes, BytesMut};

use std::collections::VecDeque;

/// Queue of received byte slices with a logical read cursor.
///
/// Peeking is copy-free while the requested range lies within the head slice;
/// a peek spanning slices compacts the head first and the compacted form is
/// kept, so repeated peeks stay cheap.
#[derive(Debug, Default)]
pub struct InputBuffer {
    input_list: VecDeque<Bytes>,
    length: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes to the tail.
    pub fn add_bytes(&mut self, piece: Bytes) {
        if piece.is_empty() {
            return;
        }
        self.length += piece.len();
        self.input_list.push_back(piece);
    }

    /// Returns up to `num_bytes` from the front without consuming them. The
    /// result is shorter than requested when fewer bytes are buffered.
    pub fn peek_message(&mut self, num_bytes: usize) -> Bytes {
        self.compact_front(num_bytes);
        match self.input_list.front() {
            Some(head) => head.slice(..num_bytes.min(head.len())),
            None => Bytes::new(),
        }
    }

    /// Consumes and returns exactly `num_bytes` from the front.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `num_bytes` bytes are buffered.
    pub fn remove_bytes(&mut self, num_bytes: usize) -> Bytes {
        assert!(
            num_bytes <= self.length,
            "attempt to remove {} bytes from an input buffer holding {}",
            num_bytes,
            self.length
        );
        self.compact_front(num_bytes);

        let head = self.input_list.front_mut().unwrap();
        let out = head.split_to(num_bytes);
        if head.is_empty() {
            self.input_list.pop_front();
        }
        self.length -= num_bytes;
        out
    }

    /// Total number of buffered bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Merges head slices until the front slice holds at least `num_bytes`
    /// (or everything buffered).
    fn compact_front(&mut self, num_bytes: usize) {
        let target = num_bytes.min(self.length);
        while self.input_list.len() > 1 && self.input_list.front().unwrap().len() < target {
            let first = self.input_list.pop_front().unwrap();
            let second = self.input_list.pop_front().unwrap();
            let mut merged = BytesMut::with_capacity(first.len() + second.len());
            merged.extend_from_slice(&first);
            merged.extend_from_slice(&second);
            self.input_list.push_front(merged.freeze());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn peek_within_head_is_a_plain_slice() {
        let mut in_buf = InputBuffer::new();
        in_buf.add_bytes(Bytes::from_static(b"hello world"));
        assert_eq!(in_buf.peek_message(5), Bytes::from_static(b"hello"));
        assert_eq!(in_buf.len(), 11);
    }

    #[test]
    fn peek_across_slices_compacts() {
        let mut in_buf = InputBuffer::new();
        in_buf.add_bytes(Bytes::from_static(b"he"));
        in_buf.add_bytes(Bytes::from_static(b"llo "));
        in_buf.add_bytes(Bytes::from_static(b"world"));
        assert_eq!(in_buf.peek_message(9), Bytes::from_static(b"hello wor"));
        assert_eq!(in_buf.len(), 11);
    }

    #[test]
    fn peek_beyond_buffered_returns_what_is_there() {
        let mut in_buf = InputBuffer::new();
        in_buf.add_bytes(Bytes::from_static(b"abc"));
        in_buf.add_bytes(Bytes::from_static(b"de"));
        assert_eq!(in_buf.peek_message(100), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn remove_bytes_consumes_in_order() {
        let mut in_buf = InputBuffer::new();
        in_buf.add_bytes(Bytes::from_static(b"abc"));
        in_buf.add_bytes(Bytes::from_static(b"defgh"));

        assert_eq!(in_buf.remove_bytes(2), Bytes::from_static(b"ab"));
        assert_eq!(in_buf.remove_bytes(3), Bytes::from_static(b"cde"));
        assert_eq!(in_buf.len(), 3);
        assert_eq!(in_buf.remove_bytes(3), Bytes::from_static(b"fgh"));
        assert!(in_buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "attempt to remove")]
    fn remove_more_than_buffered_panics() {
        let mut in_buf = InputBuffer::new();
        in_buf.add_bytes(Bytes::from_static(b"abc"));
        in_buf.remove_bytes(4);
    }

    #[test]
    fn empty_buffer_peeks_empty() {
        let mut in_buf = InputBuffer::new();
        assert_eq!(in_buf.peek_message(4), Bytes::new());
    }
}
