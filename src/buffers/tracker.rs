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

use log::{log, Level};

use std::{collections::VecDeque, fmt, time::Instant};

use crate::messages::MessageRef;

struct MessageTrackerEntry {
    message: Option<MessageRef>,
    length: usize,
    sent_bytes: usize,
    queued_at: Instant,
}

impl MessageTrackerEntry {
    fn log_level(&self) -> Level {
        self.message
            .as_ref()
            .map_or(Level::Info, |message| message.log_level())
    }

    fn describe(&self) -> String {
        match &self.message {
            Some(message) => message.to_string(),
            None => format!("<untracked message of {} bytes>", self.length),
        }
    }
}

/// Records send timing for every message enqueued on a connection's output
/// buffer, mirroring the buffer's advance cursor.
pub struct MessageTracker {
    messages: VecDeque<MessageTrackerEntry>,
    connection_label: String,
}

impl fmt::Debug for MessageTracker {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MessageTracker")
            .field("connection", &self.connection_label)
            .field("pending", &self.messages.len())
            .finish()
    }
}

impl MessageTracker {
    pub fn new(connection_label: String) -> Self {
        Self {
            messages: VecDeque::new(),
            connection_label,
        }
    }

    /// Records a message appended to the tail of the output buffer.
    ///
    /// # Panics
    ///
    /// Panics when `num_bytes` does not match the message's framed length.
    pub fn append_message(&mut self, num_bytes: usize, message: Option<MessageRef>, now: Instant) {
        Self::check_length(num_bytes, &message);
        self.messages.push_back(MessageTrackerEntry {
            message,
            length: num_bytes,
            sent_bytes: 0,
            queued_at: now,
        });
    }

    /// Records a message inserted ahead of every not-yet-started message. A
    /// partially sent head keeps its place and the new entry lands after it.
    pub fn prepend_message(&mut self, num_bytes: usize, message: Option<MessageRef>, now: Instant) {
        Self::check_length(num_bytes, &message);
        let entry = MessageTrackerEntry {
            message,
            length: num_bytes,
            sent_bytes: 0,
            queued_at: now,
        };
        let in_flight_head = self
            .messages
            .front()
            .map_or(false, |head| head.sent_bytes != 0);
        if in_flight_head {
            self.messages.insert(1, entry);
        } else {
            self.messages.push_front(entry);
        }
    }

    /// Consumes `num_bytes` from the head entries, logging the queue-to-socket
    /// latency of every message that completes.
    ///
    /// # Panics
    ///
    /// Panics when more bytes are advanced than tracked messages cover.
    pub fn advance_bytes(&mut self, num_bytes: usize, now: Instant) {
        let mut bytes_left = num_bytes;
        while bytes_left > 0 {
            let head = self
                .messages
                .front_mut()
                .expect("advanced bytes beyond tracked messages");
            let head_remaining = head.length - head.sent_bytes;
            if bytes_left >= head_remaining {
                let sent = self.messages.pop_front().unwrap();
                let elapsed_ms = now.duration_since(sent.queued_at).as_secs_f64() * 1000.0;
                log!(
                    sent.log_level(),
                    "Sent {} to socket on connection {}. Took {:.2}ms.",
                    sent.describe(),
                    self.connection_label,
                    elapsed_ms
                );
                bytes_left -= head_remaining;
            } else {
                head.sent_bytes += bytes_left;
                log!(
                    head.log_level(),
                    "Sent {} out of {} bytes of {} on connection {}.",
                    head.sent_bytes,
                    head.length,
                    head.describe(),
                    self.connection_label
                );
                bytes_left = 0;
            }
        }
    }

    /// Number of messages not yet fully handed to the kernel.
    pub fn pending_count(&self) -> usize {
        self.messages.len()
    }

    fn check_length(num_bytes: usize, message: &Option<MessageRef>) {
        if let Some(message) = message {
            assert_eq!(
                num_bytes,
                message.rawbytes().len(),
                "tracked length does not match the message's framed length"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::messages::RawMessage;

    fn tracker() -> MessageTracker {
        MessageTracker::new("test-conn".to_owned())
    }

    fn message(len: usize) -> MessageRef {
        Arc::new(RawMessage::new("test", vec![0; len].into()))
    }

    #[test]
    fn completes_messages_in_order() {
        let now = Instant::now();
        let mut tracker = tracker();
        let first = message(10);
        let first_len = first.rawbytes().len();
        let second = message(4);
        let second_len = second.rawbytes().len();
        tracker.append_message(first_len, Some(first), now);
        tracker.append_message(second_len, Some(second), now);

        tracker.advance_bytes(first_len - 3, now + Duration::from_millis(5));
        assert_eq!(tracker.pending_count(), 2);
        tracker.advance_bytes(3 + second_len, now + Duration::from_millis(9));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn prepend_lands_behind_in_flight_head() {
        let now = Instant::now();
        let mut tracker = tracker();
        let head = message(8);
        let head_len = head.rawbytes().len();
        tracker.append_message(head_len, Some(head), now);
        tracker.advance_bytes(2, now);

        let urgent = message(2);
        let urgent_len = urgent.rawbytes().len();
        tracker.prepend_message(urgent_len, Some(urgent), now);

        // Finishing the head leaves only the prepended message.
        tracker.advance_bytes(head_len - 2, now);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn prepend_on_idle_tracker_goes_first() {
        let now = Instant::now();
        let mut tracker = tracker();
        let queued = message(8);
        let queued_len = queued.rawbytes().len();
        tracker.append_message(queued_len, Some(queued), now);

        let urgent = message(2);
        let urgent_len = urgent.rawbytes().len();
        tracker.prepend_message(urgent_len, Some(urgent), now);

        tracker.advance_bytes(urgent_len, now);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn append_with_wrong_length_panics() {
        let mut tracker = tracker();
        tracker.append_message(3, Some(message(10)), Instant::now());
    }

    #[test]
    #[should_panic(expected = "beyond tracked messages")]
    fn advancing_untracked_bytes_panics() {
        let mut tracker = tracker();
        tracker.advance_bytes(1, Instant::now());
    }
}
