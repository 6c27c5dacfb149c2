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

use futures::channel::mpsc;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use std::fmt;

use crate::feed::filters::{FilterExpr, FilterState};

/// Delivery failure for a single subscriber; the feed drops the subscriber.
#[derive(Debug, Error, PartialEq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    QueueFull,
    #[error("subscriber receiver is gone")]
    Disconnected,
}

/// Capacity of a subscriber's delivery queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QueueCapacity {
    Bounded(usize),
    Unbounded,
}

/// Receiving half of a subscription, handed to the RPC surface.
#[derive(Debug)]
pub enum SubscriptionReceiver {
    Bounded(mpsc::Receiver<Value>),
    Unbounded(mpsc::UnboundedReceiver<Value>),
}

#[derive(Debug)]
enum DeliverySink {
    Bounded(mpsc::Sender<Value>),
    Unbounded(mpsc::UnboundedSender<Value>),
}

impl DeliverySink {
    fn new(capacity: QueueCapacity) -> (Self, SubscriptionReceiver) {
        match capacity {
            QueueCapacity::Bounded(capacity) => {
                let (tx, rx) = mpsc::channel(capacity);
                (Self::Bounded(tx), SubscriptionReceiver::Bounded(rx))
            }
            QueueCapacity::Unbounded => {
                let (tx, rx) = mpsc::unbounded();
                (Self::Unbounded(tx), SubscriptionReceiver::Unbounded(rx))
            }
        }
    }

    fn try_send(&mut self, entry: Value) -> Result<(), DeliveryError> {
        match self {
            Self::Bounded(tx) => tx.try_send(entry).map_err(|err| {
                if err.is_full() {
                    DeliveryError::QueueFull
                } else {
                    DeliveryError::Disconnected
                }
            }),
            Self::Unbounded(tx) => tx
                .unbounded_send(entry)
                .map_err(|_| DeliveryError::Disconnected),
        }
    }
}

/// One subscription on a feed: the delivery queue plus the subscriber's
/// source gate, filter expression and field projection.
pub struct Subscriber {
    subscription_id: Uuid,
    include_from_blockchain: bool,
    fields: Option<Vec<String>>,
    filter: Option<FilterExpr>,
    sink: DeliverySink,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscriber")
            .field("subscription_id", &self.subscription_id)
            .field("include_from_blockchain", &self.include_from_blockchain)
            .field("fields", &self.fields)
            .finish()
    }
}

impl Subscriber {
    pub(crate) fn new(
        include_from_blockchain: bool,
        fields: Option<Vec<String>>,
        filter: Option<FilterExpr>,
        capacity: QueueCapacity,
    ) -> (Self, SubscriptionReceiver) {
        let (sink, receiver) = DeliverySink::new(capacity);
        let subscriber = Self {
            subscription_id: Uuid::new_v4(),
            include_from_blockchain,
            fields,
            filter,
            sink,
        };
        (subscriber, receiver)
    }

    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    pub fn include_from_blockchain(&self) -> bool {
        self.include_from_blockchain
    }

    /// Evaluates the subscriber's filter; subscribers without one accept
    /// everything.
    pub fn validate(&self, state: &FilterState) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.evaluate(state))
    }

    pub(crate) fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Projects the serialized entry to the requested fields and queues it.
    pub(crate) fn queue(&mut self, entry: &Value) -> Result<(), DeliveryError> {
        let projected = match &self.fields {
            Some(fields) => project(entry, fields),
            None => entry.clone(),
        };
        self.sink.try_send(projected)
    }
}

/// Projects a serialized entry to a field subset. Dotted names select a key
/// of a nested object, e.g. `tx_contents.value`.
fn project(entry: &Value, fields: &[String]) -> Value {
    let source = match entry.as_object() {
        Some(source) => source,
        None => return entry.clone(),
    };
    let mut projected = Map::new();
    for field in fields {
        match field.split_once('.') {
            None => {
                if let Some(value) = source.get(field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            Some((outer, inner)) => {
                if let Some(value) = source.get(outer).and_then(|nested| nested.get(inner)) {
                    let nested = projected
                        .entry(outer.to_owned())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Some(nested) = nested.as_object_mut() {
                        nested.insert(inner.to_owned(), value.clone());
                    }
                }
            }
        }
    }
    Value::Object(projected)
}
