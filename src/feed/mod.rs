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

//! Publish/subscribe fan-out of transaction notifications.
//!
//! A feed serializes each published item once and delivers it to every
//! subscriber that passes the source gate and whose filter expression
//! accepts the item; projection to the subscriber's requested fields happens
//! at delivery time. A publish with no interested subscriber performs no
//! serialization work at all.

pub use self::{
    filters::{FilterError, FilterExpr, FilterState, FilterValue},
    new_transactions::{NewTransactionFeed, NewTransactionSpec, RawTransaction, TransactionFeedEntry},
    subscriber::{DeliveryError, QueueCapacity, Subscriber, SubscriptionReceiver},
};

pub mod filters;

mod new_transactions;
mod subscriber;

use log::{trace, warn};
use serde::Serialize;
use serde_derive::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use std::{collections::HashMap, fmt};

use crate::NetworkNum;

/// Where a published item originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    /// Socket of the blockchain node attached to a gateway.
    BlockchainSocket,
    /// RPC surface of the attached blockchain node.
    BlockchainRpc,
    /// Another node of the relay network.
    BdnSocket,
    /// Generated inside this node.
    BdnInternal,
}

/// Options accepted when subscribing to a feed.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeOptions {
    /// Accept items that originated from the attached blockchain node.
    #[serde(default = "default_include_from_blockchain")]
    pub include_from_blockchain: bool,
    /// Filter expression over the feed's filterable fields.
    #[serde(default)]
    pub filters: Option<String>,
    /// Subset of the feed's publishable fields to deliver; absent means all.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn default_include_from_blockchain() -> bool {
    true
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            include_from_blockchain: true,
            filters: None,
            fields: None,
        }
    }
}

/// Subscription rejected during validation.
#[derive(Debug, Error, PartialEq)]
pub enum SubscribeError {
    #[error("unrecognized field `{0}` requested")]
    UnknownField(String),
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),
}

/// Behavior of one feed kind: its name, field vocabulary, serialization and
/// per-field normalization.
pub trait FeedSpec: fmt::Debug {
    type Raw;
    type Entry: Serialize;

    fn name(&self) -> &'static str;
    fn available_fields(&self) -> &'static [&'static str];
    fn available_filter_fields(&self) -> &'static [&'static str];
    fn source(&self, raw: &Self::Raw) -> FeedSource;
    fn serialize(&self, raw: &Self::Raw) -> Self::Entry;
    fn filter_state(&self, entry: &Self::Entry) -> FilterState;
}

/// Named publish endpoint delivering serialized entries to its subscribers.
#[derive(Debug)]
pub struct Feed<S: FeedSpec> {
    spec: S,
    network_num: NetworkNum,
    subscribers: HashMap<Uuid, Subscriber>,
}

impl<S: FeedSpec> Feed<S> {
    pub fn new(spec: S, network_num: NetworkNum) -> Self {
        Self {
            spec,
            network_num,
            subscribers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name()
    }

    pub fn network_num(&self) -> NetworkNum {
        self.network_num
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Validates `options` against this feed's vocabulary and registers a
    /// subscriber with a delivery queue of the given capacity.
    pub fn subscribe(
        &mut self,
        options: SubscribeOptions,
        capacity: QueueCapacity,
    ) -> Result<(Uuid, SubscriptionReceiver), SubscribeError> {
        if let Some(fields) = &options.fields {
            for field in fields {
                if !self.spec.available_fields().contains(&field.as_str()) {
                    return Err(SubscribeError::UnknownField(field.clone()));
                }
            }
        }
        let filter = match &options.filters {
            Some(filters) => {
                let expr = FilterExpr::parse(filters)?;
                expr.validate_fields(self.spec.available_filter_fields())?;
                Some(expr)
            }
            None => None,
        };

        let (subscriber, receiver) = Subscriber::new(
            options.include_from_blockchain,
            options.fields,
            filter,
            capacity,
        );
        let subscription_id = subscriber.subscription_id();
        trace!(
            "New subscriber {} on feed {} (network {})",
            subscription_id,
            self.name(),
            self.network_num
        );
        self.subscribers.insert(subscription_id, subscriber);
        Ok((subscription_id, receiver))
    }

    /// Drops a subscription. Returns `false` for unknown ids.
    pub fn unsubscribe(&mut self, subscription_id: &Uuid) -> bool {
        self.subscribers.remove(subscription_id).is_some()
    }

    /// `true` when at least one subscriber would accept the item's source.
    /// Publishing is skipped entirely otherwise.
    pub fn any_subscribers_want_item(&self, raw: &S::Raw) -> bool {
        if self.subscribers.is_empty() {
            return false;
        }
        if self.spec.source(raw) == FeedSource::BlockchainSocket {
            return self
                .subscribers
                .values()
                .any(Subscriber::include_from_blockchain);
        }
        true
    }

    /// Serializes `raw` once and fans it out to every matching subscriber.
    /// Subscribers whose queue is full or gone are dropped from the feed.
    pub fn publish(&mut self, raw: &S::Raw) {
        if !self.any_subscribers_want_item(raw) {
            return;
        }

        let entry = self.spec.serialize(raw);
        let serialized = match serde_json::to_value(&entry) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!("Unable to serialize an entry of feed {}: {}", self.name(), err);
                return;
            }
        };
        let state = self.spec.filter_state(&entry);
        let source = self.spec.source(raw);

        let mut dropped = Vec::new();
        for (subscription_id, subscriber) in &mut self.subscribers {
            if source == FeedSource::BlockchainSocket && !subscriber.include_from_blockchain() {
                continue;
            }
            if subscriber.has_filter() && !subscriber.validate(&state) {
                trace!(
                    "Subscriber {} filtered out an entry of feed {}",
                    subscription_id,
                    self.spec.name()
                );
                continue;
            }
            if let Err(err) = subscriber.queue(&serialized) {
                warn!(
                    "Dropping subscriber {} of feed {}: {}",
                    subscription_id,
                    self.spec.name(),
                    err
                );
                dropped.push(*subscription_id);
            }
        }
        for subscription_id in dropped {
            self.subscribers.remove(&subscription_id);
        }
    }
}
