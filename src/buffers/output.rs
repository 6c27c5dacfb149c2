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

use bytes::Bytes;

use std::collections::VecDeque;

/// Append-only queue of outbound byte slices with an advance cursor into the
/// head slice.
///
/// `index` counts the bytes of the head slice already handed to the kernel;
/// the socket layer repeatedly takes `get_buffer()`, writes some prefix of it
/// and reports back through `advance_buffer`.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    output_msgs: VecDeque<Bytes>,
    index: usize,
    length: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message's bytes to the tail of the queue.
    pub fn enqueue_msgbytes(&mut self, msg_bytes: Bytes) {
        self.length += msg_bytes.len();
        self.output_msgs.push_back(msg_bytes);
    }

    /// Inserts a message ahead of every message that has not started sending.
    /// A partially sent head stays in front so its framing is preserved.
    pub fn prepend_msg(&mut self, msg_bytes: Bytes) {
        self.length += msg_bytes.len();
        if self.at_msg_boundary() {
            self.output_msgs.push_front(msg_bytes);
        } else {
            self.output_msgs.insert(1, msg_bytes);
        }
    }

    /// Returns the unsent remainder of the head slice. The caller must not
    /// mutate the returned bytes.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is empty.
    pub fn get_buffer(&self) -> Bytes {
        let head = self
            .output_msgs
            .front()
            .expect("get_buffer called on an empty output buffer");
        head.slice(self.index..)
    }

    /// Records that `advance_by` bytes of the head slice were handed to the
    /// kernel, popping the head once it is fully consumed.
    ///
    /// # Panics
    ///
    /// Panics if `advance_by` exceeds the unsent remainder of the head slice.
    pub fn advance_buffer(&mut self, advance_by: usize) {
        let head_len = self
            .output_msgs
            .front()
            .map(Bytes::len)
            .expect("advance_buffer called on an empty output buffer");
        assert!(
            self.index + advance_by <= head_len,
            "advanced past the end of the head slice: {} + {} > {}",
            self.index,
            advance_by,
            head_len
        );

        self.index += advance_by;
        self.length -= advance_by;
        if self.index == head_len {
            self.output_msgs.pop_front();
            self.index = 0;
        }
    }

    /// `true` when no bytes of the head slice have been sent yet.
    pub fn at_msg_boundary(&self) -> bool {
        self.index == 0
    }

    pub fn has_more_bytes(&self) -> bool {
        self.length > 0
    }

    /// Total number of unsent bytes across all queued slices.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}
