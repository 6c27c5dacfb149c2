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

//! The `newTxs` feed: every transaction entering the node, with
//! Ethereum-style contents fields.

use serde_derive::Serialize;
use serde_json::{Map, Value};

use crate::{
    feed::{
        filters::{FilterState, FilterValue},
        Feed, FeedSource, FeedSpec,
    },
    transactions::Sha256Hash,
    NetworkNum,
};

/// A transaction as it enters the feed layer: decoded contents plus
/// provenance.
#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub tx_hash: Sha256Hash,
    pub tx_contents: Map<String, Value>,
    pub source: FeedSource,
    pub local_region: bool,
}

impl RawTransaction {
    pub fn new(
        tx_hash: Sha256Hash,
        tx_contents: Map<String, Value>,
        source: FeedSource,
        local_region: bool,
    ) -> Self {
        Self {
            tx_hash,
            tx_contents,
            source,
            local_region,
        }
    }
}

/// Serialized `newTxs` entry delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionFeedEntry {
    pub tx_hash: String,
    pub tx_contents: Map<String, Value>,
    pub local_region: bool,
}

const FIELDS: &[&str] = &[
    "tx_hash",
    "tx_contents",
    "tx_contents.nonce",
    "tx_contents.gas_price",
    "tx_contents.gas",
    "tx_contents.to",
    "tx_contents.value",
    "tx_contents.input",
    "tx_contents.v",
    "tx_contents.r",
    "tx_contents.s",
    "tx_contents.from",
    "local_region",
];

const FILTER_FIELDS: &[&str] = &["value", "from", "to", "gas_price", "method_id"];

/// Spec of the `newTxs` feed.
#[derive(Debug, Default)]
pub struct NewTransactionSpec;

impl FeedSpec for NewTransactionSpec {
    type Raw = RawTransaction;
    type Entry = TransactionFeedEntry;

    fn name(&self) -> &'static str {
        "newTxs"
    }

    fn available_fields(&self) -> &'static [&'static str] {
        FIELDS
    }

    fn available_filter_fields(&self) -> &'static [&'static str] {
        FILTER_FIELDS
    }

    fn source(&self, raw: &RawTransaction) -> FeedSource {
        raw.source
    }

    fn serialize(&self, raw: &RawTransaction) -> TransactionFeedEntry {
        TransactionFeedEntry {
            tx_hash: format!("0x{}", raw.tx_hash),
            tx_contents: raw.tx_contents.clone(),
            local_region: raw.local_region,
        }
    }

    fn filter_state(&self, entry: &TransactionFeedEntry) -> FilterState {
        let contents = &entry.tx_contents;
        let mut state = FilterState::new();
        state.insert("value", reformat_number(contents.get("value")));
        state.insert("to", reformat_address(contents.get("to")));
        state.insert("from", reformat_address(contents.get("from")));
        state.insert("gas_price", reformat_number(contents.get("gas_price")));
        state.insert(
            "method_id",
            reformat_input_to_method_id(contents.get("input")),
        );
        state
    }
}

/// Feed of every new transaction seen by the node.
pub type NewTransactionFeed = Feed<NewTransactionSpec>;

impl NewTransactionFeed {
    pub fn for_network(network_num: NetworkNum) -> Self {
        Feed::new(NewTransactionSpec, network_num)
    }
}

/// Lowercases an address and guarantees a `0x` prefix. Malformed input maps
/// to null, which fails every comparison.
fn reformat_address(value: Option<&Value>) -> FilterValue {
    match value.and_then(Value::as_str) {
        Some(address) if !address.is_empty() => {
            let address = address.to_ascii_lowercase();
            if address.starts_with("0x") {
                FilterValue::Text(address)
            } else {
                FilterValue::Text(format!("0x{}", address))
            }
        }
        _ => FilterValue::Null,
    }
}

/// Canonicalizes a numeric field given as a hex string, decimal string or
/// JSON number.
fn reformat_number(value: Option<&Value>) -> FilterValue {
    match value {
        Some(Value::String(text)) => {
            let parsed = if let Some(hex) = text.strip_prefix("0x") {
                u128::from_str_radix(hex, 16).ok()
            } else {
                text.parse().ok()
            };
            parsed.map_or(FilterValue::Null, FilterValue::Num)
        }
        Some(Value::Number(number)) => number
            .as_u64()
            .map_or(FilterValue::Null, |number| FilterValue::Num(number.into())),
        _ => FilterValue::Null,
    }
}

/// Derives the method id from the first four bytes of the input data.
fn reformat_input_to_method_id(value: Option<&Value>) -> FilterValue {
    match value.and_then(Value::as_str) {
        Some(input) => {
            let stripped = input.strip_prefix("0x").unwrap_or(input);
            if stripped.len() >= 8 && stripped.is_char_boundary(8) {
                FilterValue::Text(format!("0x{}", stripped[..8].to_ascii_lowercase()))
            } else {
                FilterValue::Null
            }
        }
        None => FilterValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::feed::{QueueCapacity, SubscribeOptions, SubscriptionReceiver};

    fn tx(value: &str, to: &str) -> RawTransaction {
        let contents = json!({
            "nonce": "0x1",
            "value": value,
            "to": to,
            "from": "0xCAFE000000000000000000000000000000000001",
            "gas_price": "0x3b9aca00",
            "input": "0xa9059cbb0000000000000000000000000000000000000000000000000000000000000001",
        });
        RawTransaction::new(
            Sha256Hash::new([0x11; 32]),
            contents.as_object().unwrap().clone(),
            FeedSource::BdnSocket,
            true,
        )
    }

    fn next_entry(rx: &mut SubscriptionReceiver) -> Option<Value> {
        match rx {
            SubscriptionReceiver::Unbounded(rx) => rx.try_next().ok().flatten(),
            SubscriptionReceiver::Bounded(rx) => rx.try_next().ok().flatten(),
        }
    }

    #[test]
    fn filters_on_value_and_recipient() {
        let mut feed = NewTransactionFeed::for_network(5);
        let options = SubscribeOptions {
            filters: Some(
                "value > 10 AND to == 0xabc0000000000000000000000000000000000002".to_owned(),
            ),
            fields: Some(vec!["tx_hash".to_owned(), "tx_contents.value".to_owned()]),
            ..SubscribeOptions::default()
        };
        let (_, mut rx) = feed.subscribe(options, QueueCapacity::Unbounded).unwrap();

        // Value too small.
        feed.publish(&tx("0x5", "0xabc0000000000000000000000000000000000002"));
        assert_eq!(next_entry(&mut rx), None);

        // Wrong recipient.
        feed.publish(&tx("0x14", "0xdef0000000000000000000000000000000000003"));
        assert_eq!(next_entry(&mut rx), None);

        // Match, delivered with the fields projection applied.
        feed.publish(&tx("0x14", "0xABC0000000000000000000000000000000000002"));
        let entry = next_entry(&mut rx).expect("matching transaction must be delivered");
        assert_eq!(
            entry,
            json!({
                "tx_hash": format!("0x{}", "11".repeat(32)),
                "tx_contents": {"value": "0x14"},
            })
        );
    }

    #[test]
    fn method_id_is_derived_from_input() {
        let mut feed = NewTransactionFeed::for_network(5);
        let options = SubscribeOptions {
            filters: Some("method_id == 0xa9059cbb".to_owned()),
            ..SubscribeOptions::default()
        };
        let (_, mut rx) = feed.subscribe(options, QueueCapacity::Unbounded).unwrap();

        feed.publish(&tx("0x1", "0xabc0000000000000000000000000000000000002"));
        assert!(next_entry(&mut rx).is_some());
    }

    #[test]
    fn malformed_fields_normalize_to_null() {
        assert_eq!(reformat_number(Some(&json!("not a number"))), FilterValue::Null);
        assert_eq!(reformat_number(None), FilterValue::Null);
        assert_eq!(reformat_address(Some(&json!(""))), FilterValue::Null);
        assert_eq!(reformat_address(Some(&json!(12))), FilterValue::Null);
        assert_eq!(
            reformat_input_to_method_id(Some(&json!("0xab"))),
            FilterValue::Null
        );

        assert_eq!(
            reformat_address(Some(&json!("ABC0"))),
            FilterValue::Text("0xabc0".to_owned())
        );
        assert_eq!(reformat_number(Some(&json!(12))), FilterValue::Num(12));
        assert_eq!(reformat_number(Some(&json!("34"))), FilterValue::Num(34));
    }

    #[test]
    fn blockchain_gate_applies_to_socket_sourced_transactions() {
        let mut feed = NewTransactionFeed::for_network(5);
        let options = SubscribeOptions {
            include_from_blockchain: false,
            ..SubscribeOptions::default()
        };
        let (_, mut rx) = feed.subscribe(options, QueueCapacity::Unbounded).unwrap();

        let mut from_blockchain = tx("0x1", "0xabc0000000000000000000000000000000000002");
        from_blockchain.source = FeedSource::BlockchainSocket;
        feed.publish(&from_blockchain);
        assert_eq!(next_entry(&mut rx), None);
    }
}
