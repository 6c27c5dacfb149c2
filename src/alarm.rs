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

//! Priority queue of future callbacks. Drives connection timeouts, retries
//! and periodic housekeeping of the node runtime.
//!
//! Alarms fire against a caller-supplied state value of type `S`; a callback
//! cannot reach back into the queue itself, so anything it wants to schedule
//! is recorded in `S` and flushed by the owner after the drain. This keeps
//! alarms registered from within a drain out of the current tick.

use log::trace;

use std::{
    cell::Cell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{duration_to_seconds, Seconds};

/// Outcome of an alarm callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlarmOutcome {
    /// Re-arm the same alarm after the given delay. A zero delay fires on the
    /// next drain, never within the current one.
    Reschedule(Duration),
    /// Drop the alarm.
    Cancel,
}

/// Callback invoked when an alarm fires. Receives the state value owned by
/// the queue's caller and the drain's `now` instant.
pub type AlarmCallback<S> = Box<dyn FnMut(&mut S, Instant) -> AlarmOutcome>;

/// Handle to a scheduled alarm, usable to cancel it before it fires.
#[derive(Debug, Clone)]
pub struct AlarmHandle {
    alive: Rc<Cell<bool>>,
}

impl AlarmHandle {
    /// Cancels the alarm. Cancelling an already fired or cancelled alarm is
    /// a no-op.
    pub fn cancel(&self) {
        self.alive.set(false);
    }

    /// Returns `true` while the alarm is still scheduled.
    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }
}

struct ScheduledAlarm<S> {
    fire_at: Instant,
    seq: u64,
    name: &'static str,
    alive: Rc<Cell<bool>>,
    callback: AlarmCallback<S>,
}

impl<S> PartialEq for ScheduledAlarm<S> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl<S> Eq for ScheduledAlarm<S> {}

impl<S> PartialOrd for ScheduledAlarm<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for ScheduledAlarm<S> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed, so that `BinaryHeap` acts as a min-heap. Equal fire
        // times are broken by registration order.
        (other.fire_at, other.seq).cmp(&(self.fire_at, self.seq))
    }
}

struct ApproxEntry {
    fire_at: Instant,
    alive: Rc<Cell<bool>>,
}

/// Min-heap of scheduled alarms ordered by fire time, with a uniqueness
/// counter as the tiebreak for equal fire times.
pub struct AlarmQueue<S> {
    alarms: BinaryHeap<ScheduledAlarm<S>>,
    approx_alarms: HashMap<&'static str, Vec<ApproxEntry>>,
    uniq_count: u64,
}

impl<S> fmt::Debug for AlarmQueue<S> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AlarmQueue")
            .field("len", &self.alarms.len())
            .field("uniq_count", &self.uniq_count)
            .finish()
    }
}

impl<S> Default for AlarmQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> AlarmQueue<S> {
    pub fn new() -> Self {
        Self {
            alarms: BinaryHeap::new(),
            approx_alarms: HashMap::new(),
            uniq_count: 0,
        }
    }

    /// Schedules a one-shot alarm `delay` from `now`. The returned handle can
    /// cancel it; dropping the handle leaves the alarm scheduled.
    pub fn register_alarm(
        &mut self,
        now: Instant,
        delay: Duration,
        name: &'static str,
        callback: impl FnMut(&mut S, Instant) -> AlarmOutcome + 'static,
    ) -> AlarmHandle {
        let alive = Rc::new(Cell::new(true));
        let alarm = ScheduledAlarm {
            fire_at: now + delay,
            seq: self.next_seq(),
            name,
            alive: Rc::clone(&alive),
            callback: Box::new(callback),
        };
        trace!("Scheduling alarm `{}` in {:?}", name, delay);
        self.alarms.push(alarm);
        AlarmHandle { alive }
    }

    /// Schedules a one-shot alarm unless another alarm with the same `name`
    /// is already due within `slack` of the requested fire time. Used to
    /// batch periodic housekeeping.
    ///
    /// Returns `None` when the request was coalesced into an existing alarm.
    pub fn register_approx_alarm(
        &mut self,
        now: Instant,
        delay: Duration,
        slack: Duration,
        name: &'static str,
        callback: impl FnMut(&mut S, Instant) -> AlarmOutcome + 'static,
    ) -> Option<AlarmHandle> {
        let fire_at = now + delay;
        let entries = self.approx_alarms.entry(name).or_default();
        entries.retain(|entry| entry.alive.get());
        let coalesced = entries.iter().any(|entry| {
            let distance = if entry.fire_at >= fire_at {
                entry.fire_at - fire_at
            } else {
                fire_at - entry.fire_at
            };
            distance <= slack
        });
        if coalesced {
            trace!("Coalesced approx alarm `{}`", name);
            return None;
        }

        let handle = self.register_alarm(now, delay, name, callback);
        self.approx_alarms.get_mut(name).unwrap().push(ApproxEntry {
            fire_at,
            alive: handle.alive.clone(),
        });
        Some(handle)
    }

    /// Returns the signed interval until the next live alarm, negative when
    /// the head is already overdue, or `None` when the queue is empty.
    pub fn time_to_next_alarm(&mut self, now: Instant) -> Option<Seconds> {
        loop {
            let fire_at = match self.alarms.peek() {
                Some(head) if !head.alive.get() => {
                    self.alarms.pop();
                    continue;
                }
                Some(head) => head.fire_at,
                None => return None,
            };
            let seconds = if fire_at >= now {
                duration_to_seconds(fire_at - now)
            } else {
                -duration_to_seconds(now - fire_at)
            };
            return Some(seconds);
        }
    }

    /// Invokes every live callback whose fire time is at or before `now`, in
    /// fire-time order. Rescheduled alarms are re-inserted only after the
    /// drain completes, so no callback runs twice within one call.
    ///
    /// Returns the interval to the next alarm, as `time_to_next_alarm`.
    pub fn fire_ready_alarms(&mut self, now: Instant, state: &mut S) -> Option<Seconds> {
        let mut rearmed = Vec::new();
        while let Some(head) = self.alarms.peek() {
            if !head.alive.get() {
                self.alarms.pop();
                continue;
            }
            if head.fire_at > now {
                break;
            }
            let mut alarm = self.alarms.pop().unwrap();
            trace!("Firing alarm `{}`", alarm.name);
            match (alarm.callback)(state, now) {
                AlarmOutcome::Reschedule(delay) => {
                    alarm.fire_at = now + delay;
                    rearmed.push(alarm);
                }
                AlarmOutcome::Cancel => alarm.alive.set(false),
            }
        }
        for mut alarm in rearmed {
            alarm.seq = self.next_seq();
            self.alarms.push(alarm);
        }
        self.time_to_next_alarm(now)
    }

    /// Number of scheduled entries, cancelled ones included until they are
    /// lazily dropped.
    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    /// Total number of alarms ever registered.
    pub fn uniq_count(&self) -> u64 {
        self.uniq_count
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.uniq_count;
        self.uniq_count += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn fires_in_order_with_registration_tiebreak() {
        let mut queue = AlarmQueue::<Vec<&'static str>>::new();
        let now = Instant::now();
        queue.register_alarm(now, secs(2), "b", |fired: &mut Vec<&str>, _| {
            fired.push("b");
            AlarmOutcome::Cancel
        });
        queue.register_alarm(now, secs(1), "a1", |fired, _| {
            fired.push("a1");
            AlarmOutcome::Cancel
        });
        queue.register_alarm(now, secs(1), "a2", |fired, _| {
            fired.push("a2");
            AlarmOutcome::Cancel
        });

        let mut fired = vec![];
        queue.fire_ready_alarms(now + secs(3), &mut fired);
        assert_eq!(fired, vec!["a1", "a2", "b"]);
        assert!(queue.time_to_next_alarm(now).is_none());
    }

    #[test]
    fn does_not_fire_future_alarms() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        queue.register_alarm(now, secs(10), "later", |count, _| {
            *count += 1;
            AlarmOutcome::Cancel
        });

        let mut count = 0;
        let next = queue.fire_ready_alarms(now + secs(5), &mut count);
        assert_eq!(count, 0);
        assert_eq!(next.unwrap() as u64, 5);
    }

    #[test]
    fn overdue_alarm_reports_negative_interval() {
        let mut queue = AlarmQueue::<()>::new();
        let now = Instant::now();
        queue.register_alarm(now, secs(1), "overdue", |_, _| AlarmOutcome::Cancel);
        let delta = queue.time_to_next_alarm(now + secs(4)).unwrap();
        assert!(delta <= -2.9, "unexpected interval: {}", delta);
    }

    #[test]
    fn reschedule_does_not_refire_within_drain() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        queue.register_alarm(now, secs(0), "tick", |count, _| {
            *count += 1;
            AlarmOutcome::Reschedule(secs(0))
        });

        let mut count = 0;
        queue.fire_ready_alarms(now, &mut count);
        assert_eq!(count, 1);
        queue.fire_ready_alarms(now, &mut count);
        assert_eq!(count, 2);
    }

    #[test]
    fn rescheduled_alarm_fires_after_delay() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        queue.register_alarm(now, secs(1), "periodic", |count, _| {
            *count += 1;
            AlarmOutcome::Reschedule(secs(5))
        });

        let mut count = 0;
        let next = queue.fire_ready_alarms(now + secs(1), &mut count).unwrap();
        assert_eq!(count, 1);
        assert_eq!(next as u64, 5);
        queue.fire_ready_alarms(now + secs(2), &mut count);
        assert_eq!(count, 1);
        queue.fire_ready_alarms(now + secs(6), &mut count);
        assert_eq!(count, 2);
    }

    #[test]
    fn cancelled_alarm_does_not_fire() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        let handle = queue.register_alarm(now, secs(1), "cancelled", |count, _| {
            *count += 1;
            AlarmOutcome::Cancel
        });
        assert!(handle.is_alive());
        handle.cancel();

        let mut count = 0;
        let next = queue.fire_ready_alarms(now + secs(2), &mut count);
        assert_eq!(count, 0);
        assert!(next.is_none());
    }

    #[test]
    fn approx_alarm_coalesces_within_slack() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        let first =
            queue.register_approx_alarm(now, secs(10), secs(2), "housekeeping", |count, _| {
                *count += 1;
                AlarmOutcome::Cancel
            });
        assert!(first.is_some());

        // Within the slack of the first alarm: coalesced.
        let second =
            queue.register_approx_alarm(now, secs(11), secs(2), "housekeeping", |count, _| {
                *count += 1;
                AlarmOutcome::Cancel
            });
        assert!(second.is_none());

        // Outside the slack: scheduled separately.
        let third =
            queue.register_approx_alarm(now, secs(20), secs(2), "housekeeping", |count, _| {
                *count += 1;
                AlarmOutcome::Cancel
            });
        assert!(third.is_some());

        let mut count = 0;
        queue.fire_ready_alarms(now + secs(30), &mut count);
        assert_eq!(count, 2);
    }

    #[test]
    fn approx_alarms_with_different_names_do_not_coalesce() {
        let mut queue = AlarmQueue::<u32>::new();
        let now = Instant::now();
        assert!(queue
            .register_approx_alarm(now, secs(10), secs(5), "flush", |_, _| AlarmOutcome::Cancel)
            .is_some());
        assert!(queue
            .register_approx_alarm(now, secs(10), secs(5), "report", |_, _| AlarmOutcome::Cancel)
            .is_some());
    }
}
