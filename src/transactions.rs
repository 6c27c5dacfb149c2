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

//! Three-way index between transaction hashes, short ids and raw contents.
//!
//! A single hash may carry several short ids (re-assignments across epochs).
//! Short-id assignments age out of an expiration queue; the same queue is the
//! eviction order when the contents cache outgrows its memory cap, and
//! block-confirmation tracking drops whole batches of short ids once enough
//! confirmations have passed.

use bytes::Bytes;
use log::{debug, info, warn};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::Serialize;
use thiserror::Error;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    fs::{self, File, OpenOptions},
    io::Write,
    str::FromStr,
    time::{Duration, Instant},
};

use crate::{
    alarm::AlarmOutcome, duration_from_millis, expiration::ExpirationQueue, sdn::BlockchainNetwork,
    NetworkNum, ShortId, TxCacheConfig, NULL_TX_SID,
};

/// Malformed transaction hash input.
#[derive(Debug, Error, PartialEq)]
pub enum HashError {
    #[error("transaction hash must be {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
    #[error("invalid hex in transaction hash: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A transaction hash in its canonical binary form.
///
/// All entry points of the transaction service key by this type; raw byte
/// buffers and hex strings (with or without a `0x` prefix) convert at the
/// boundary via `from_slice` / `FromStr`, so equality is by content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha256Hash([u8; 32]);

impl Sha256Hash {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != Self::LEN {
            return Err(HashError::Length {
                expected: Self::LEN,
                got: slice.len(),
            });
        }
        let mut bytes = [0; Self::LEN];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "Sha256Hash({})", self)
    }
}

impl FromStr for Sha256Hash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        Self::from_slice(&hex::decode(stripped)?)
    }
}

impl Serialize for Sha256Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Sha256Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Lookup result for a single short id; each field may be absent
/// independently.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionInfo {
    pub hash: Option<Sha256Hash>,
    pub contents: Option<Bytes>,
    pub short_id: ShortId,
}

/// Batch lookup result split into found and missing entries.
#[derive(Debug, Clone, Default)]
pub struct TransactionSearchResult {
    pub found: Vec<TransactionInfo>,
    pub missing: Vec<TransactionInfo>,
}

/// What a batch of short ids is lacking: ids never seen, and hashes whose
/// contents are not cached.
#[derive(Debug, Clone, Default)]
pub struct MissingTransactions {
    pub has_missing: bool,
    pub unknown_short_ids: Vec<ShortId>,
    pub unknown_content_hashes: Vec<Sha256Hash>,
}

/// Aggregate statistics snapshot of a transaction service.
#[derive(Debug, Clone, Serialize)]
pub struct TxServiceStats {
    pub network_num: NetworkNum,
    pub short_id_mapping_count: usize,
    pub unique_transaction_contents_count: usize,
    pub oldest_assignment_age_secs: Option<f64>,
    pub oldest_transaction_hash: Option<Sha256Hash>,
    pub transactions_removed_by_memory_limit: u64,
    pub total_tx_contents_size: u64,
}

/// Service managing transaction mappings for one blockchain network.
#[derive(Debug)]
pub struct TransactionService {
    network_num: NetworkNum,
    sid_expire_time: Duration,
    final_tx_confirmations_count: usize,
    tx_content_memory_limit: u64,
    hash_to_short_ids: HashMap<Sha256Hash, HashSet<ShortId>>,
    short_id_to_hash: HashMap<ShortId, Sha256Hash>,
    hash_to_contents: HashMap<Sha256Hash, Bytes>,
    assignment_expire_queue: ExpirationQueue<ShortId>,
    short_ids_seen_in_block: VecDeque<Vec<ShortId>>,
    total_tx_contents_size: u64,
    total_tx_removed_by_memory_limit: u64,
    expire_alarm_scheduled: bool,
    removed_sids_dump: Option<File>,
}

impl TransactionService {
    /// Creates a service for `network_num`, resolving confirmation count and
    /// memory limit from the matching network model when available.
    pub fn new(
        network_num: NetworkNum,
        config: &TxCacheConfig,
        networks: &[BlockchainNetwork],
    ) -> Self {
        let network = networks
            .iter()
            .find(|network| network.network_num == network_num);

        let final_tx_confirmations_count = match network {
            Some(network) => network
                .final_tx_confirmations_count
                .unwrap_or(config.final_tx_confirmations_count),
            None => {
                warn!(
                    "No confirmation count configured for network {}; using default {}",
                    network_num, config.final_tx_confirmations_count
                );
                config.final_tx_confirmations_count
            }
        };
        let tx_content_memory_limit = network
            .and_then(|network| network.tx_contents_memory_limit_bytes)
            .unwrap_or_else(|| {
                warn!(
                    "No contents cache limit configured for network {}; using default {}",
                    network_num, config.tx_cache_memory_limit_bytes
                );
                config.tx_cache_memory_limit_bytes
            });
        info!(
            "Memory limit for the transaction service of network {} is {} bytes",
            network_num, tx_content_memory_limit
        );

        let removed_sids_dump = config
            .dump_removed_short_ids_path
            .as_ref()
            .and_then(|dir| match fs::create_dir_all(dir) {
                Ok(()) => OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(format!("removed_short_ids_{}.txt", network_num)))
                    .map_err(|err| warn!("Unable to open the removed-short-ids dump: {}", err))
                    .ok(),
                Err(err) => {
                    warn!("Unable to create the removed-short-ids dump dir: {}", err);
                    None
                }
            });

        Self {
            network_num,
            sid_expire_time: duration_from_millis(config.sid_expire_time),
            final_tx_confirmations_count,
            tx_content_memory_limit,
            hash_to_short_ids: HashMap::new(),
            short_id_to_hash: HashMap::new(),
            hash_to_contents: HashMap::new(),
            assignment_expire_queue: ExpirationQueue::new(duration_from_millis(
                config.sid_expire_time,
            )),
            short_ids_seen_in_block: VecDeque::new(),
            total_tx_contents_size: 0,
            total_tx_removed_by_memory_limit: 0,
            expire_alarm_scheduled: false,
            removed_sids_dump,
        }
    }

    pub fn network_num(&self) -> NetworkNum {
        self.network_num
    }

    /// Time to live of a short-id assignment; the owner schedules the expiry
    /// alarm with this delay.
    pub fn sid_expire_time(&self) -> Duration {
        self.sid_expire_time
    }

    pub fn final_tx_confirmations_count(&self) -> usize {
        self.final_tx_confirmations_count
    }

    pub fn total_tx_contents_size(&self) -> u64 {
        self.total_tx_contents_size
    }

    pub fn total_tx_removed_by_memory_limit(&self) -> u64 {
        self.total_tx_removed_by_memory_limit
    }

    /// Caches a transaction's raw contents, replacing any prior contents and
    /// evicting the oldest assignments while over the memory cap.
    pub fn set_transaction_contents(&mut self, hash: Sha256Hash, contents: Bytes) {
        let previous_size = self
            .hash_to_contents
            .get(&hash)
            .map_or(0, |previous| previous.len() as u64);
        self.total_tx_contents_size += contents.len() as u64;
        self.total_tx_contents_size -= previous_size;
        self.hash_to_contents.insert(hash, contents);

        self.memory_limit_clean_up();
    }

    pub fn has_transaction_contents(&self, hash: &Sha256Hash) -> bool {
        self.hash_to_contents.contains_key(hash)
    }

    pub fn has_transaction_short_id(&self, hash: &Sha256Hash) -> bool {
        self.hash_to_short_ids.contains_key(hash)
    }

    pub fn has_short_id(&self, short_id: ShortId) -> bool {
        self.short_id_to_hash.contains_key(&short_id)
    }

    /// Maps `short_id` to `hash` and enqueues the assignment for expiry.
    ///
    /// Returns `true` when the caller must schedule the expiry alarm (the
    /// service had none pending); `expire_old_assignments` is the matching
    /// callback.
    pub fn assign_short_id(&mut self, hash: Sha256Hash, short_id: ShortId, now: Instant) -> bool {
        if short_id == NULL_TX_SID {
            warn!(
                "Attempt to assign the null short id to transaction {}. Ignoring.",
                hash
            );
            return false;
        }
        debug!("Assigning short id {} to transaction {}", short_id, hash);

        self.hash_to_short_ids
            .entry(hash)
            .or_default()
            .insert(short_id);
        if let Some(previous) = self.short_id_to_hash.insert(short_id, hash) {
            if previous != hash {
                self.detach_short_id(&previous, short_id);
            }
        }
        self.assignment_expire_queue.add(short_id, now);

        if self.expire_alarm_scheduled {
            false
        } else {
            self.expire_alarm_scheduled = true;
            true
        }
    }

    /// Any short id of the hash; iteration-order dependent. Use
    /// `get_short_ids` when determinism matters.
    pub fn get_short_id(&self, hash: &Sha256Hash) -> ShortId {
        self.hash_to_short_ids
            .get(hash)
            .and_then(|short_ids| short_ids.iter().next().copied())
            .unwrap_or(NULL_TX_SID)
    }

    /// All short ids of the hash, or `[NULL_TX_SID]` when unknown.
    pub fn get_short_ids(&self, hash: &Sha256Hash) -> Vec<ShortId> {
        match self.hash_to_short_ids.get(hash) {
            Some(short_ids) => short_ids.iter().copied().collect(),
            None => vec![NULL_TX_SID],
        }
    }

    /// Resolves a short id to its hash and contents; either may be absent.
    pub fn get_transaction(&self, short_id: ShortId) -> TransactionInfo {
        match self.short_id_to_hash.get(&short_id) {
            Some(hash) => TransactionInfo {
                hash: Some(*hash),
                contents: self.hash_to_contents.get(hash).cloned(),
                short_id,
            },
            None => TransactionInfo {
                hash: None,
                contents: None,
                short_id,
            },
        }
    }

    pub fn get_transaction_by_hash(&self, hash: &Sha256Hash) -> Option<Bytes> {
        self.hash_to_contents.get(hash).cloned()
    }

    /// Resolves a batch of short ids, splitting them into entries with cached
    /// contents and entries without.
    pub fn get_transactions(&self, short_ids: &[ShortId]) -> TransactionSearchResult {
        let mut result = TransactionSearchResult::default();
        for &short_id in short_ids {
            match self.short_id_to_hash.get(&short_id) {
                Some(hash) => match self.hash_to_contents.get(hash) {
                    Some(contents) => result.found.push(TransactionInfo {
                        hash: Some(*hash),
                        contents: Some(contents.clone()),
                        short_id,
                    }),
                    None => {
                        debug!("Short id {} was requested but has no contents.", short_id);
                        result.missing.push(TransactionInfo {
                            hash: None,
                            contents: None,
                            short_id,
                        });
                    }
                },
                None => debug!("Short id {} was requested but is unknown.", short_id),
            }
        }
        result
    }

    /// Reports which of `short_ids` cannot be served: unknown ids, and known
    /// ids whose transaction contents are not cached.
    pub fn get_missing_transactions(&self, short_ids: &[ShortId]) -> MissingTransactions {
        let mut missing = MissingTransactions::default();
        for &short_id in short_ids {
            match self.short_id_to_hash.get(&short_id) {
                None => {
                    missing.unknown_short_ids.push(short_id);
                    missing.has_missing = true;
                }
                Some(hash) if !self.has_transaction_contents(hash) => {
                    missing.unknown_content_hashes.push(*hash);
                    missing.has_missing = true;
                }
                Some(_) => {}
            }
        }
        missing
    }

    /// Tracks a block's short ids. Once more than
    /// `final_tx_confirmations_count` batches are pending, the oldest batch
    /// is dropped and each of its short ids is removed from the index.
    pub fn track_seen_short_ids(&mut self, short_ids: Vec<ShortId>) {
        self.short_ids_seen_in_block.push_back(short_ids);

        if self.short_ids_seen_in_block.len() > self.final_tx_confirmations_count {
            let final_short_ids = self.short_ids_seen_in_block.pop_front().unwrap();
            for short_id in final_short_ids {
                self.remove_transaction_by_short_id(short_id);
            }
        }
    }

    /// Expires short-id assignments older than the TTL. Wired as the expiry
    /// alarm callback; keeps itself scheduled while assignments remain.
    pub fn expire_old_assignments(&mut self, now: Instant) -> AlarmOutcome {
        info!(
            "Expiring old short id assignments. Total entries: {}",
            self.assignment_expire_queue.len()
        );
        for short_id in self.assignment_expire_queue.pop_expired(now) {
            self.remove_transaction_by_short_id(short_id);
        }
        info!(
            "Finished expiring short ids. Entries remaining: {}",
            self.assignment_expire_queue.len()
        );

        if self.assignment_expire_queue.is_empty() {
            self.expire_alarm_scheduled = false;
            AlarmOutcome::Cancel
        } else {
            AlarmOutcome::Reschedule(self.sid_expire_time)
        }
    }

    /// Removes a short id mapping. Contents are dropped only with the last
    /// short id of their hash.
    pub fn remove_transaction_by_short_id(&mut self, short_id: ShortId) {
        if let Some(hash) = self.short_id_to_hash.remove(&short_id) {
            self.detach_short_id(&hash, short_id);
            if let Some(dump) = &mut self.removed_sids_dump {
                writeln!(dump, "{}", short_id).ok();
            }
        }
        self.assignment_expire_queue.remove(&short_id);
    }

    /// Statistics snapshot, flushed periodically through the stats sink.
    pub fn stats(&mut self, now: Instant) -> TxServiceStats {
        let oldest_assignment_age_secs = self
            .assignment_expire_queue
            .oldest_timestamp()
            .map(|enqueued| now.saturating_duration_since(enqueued).as_secs_f64());
        let oldest_transaction_hash = self
            .assignment_expire_queue
            .oldest()
            .and_then(|short_id| self.short_id_to_hash.get(&short_id).copied());

        TxServiceStats {
            network_num: self.network_num,
            short_id_mapping_count: self.short_id_to_hash.len(),
            unique_transaction_contents_count: self.hash_to_contents.len(),
            oldest_assignment_age_secs,
            oldest_transaction_hash,
            transactions_removed_by_memory_limit: self.total_tx_removed_by_memory_limit,
            total_tx_contents_size: self.total_tx_contents_size,
        }
    }

    /// Drops `short_id` from the hash's assignment set, deleting the set and
    /// the cached contents when it was the last assignment.
    fn detach_short_id(&mut self, hash: &Sha256Hash, short_id: ShortId) {
        if let Some(short_ids) = self.hash_to_short_ids.get_mut(hash) {
            if short_ids.len() == 1 && short_ids.contains(&short_id) {
                self.hash_to_short_ids.remove(hash);
                if let Some(contents) = self.hash_to_contents.remove(hash) {
                    self.total_tx_contents_size -= contents.len() as u64;
                }
            } else {
                short_ids.remove(&short_id);
            }
        }
    }

    /// Evicts oldest-assigned transactions until the contents cache fits the
    /// memory cap again. The newly added entry is never preferred for
    /// eviction over older ones.
    fn memory_limit_clean_up(&mut self) {
        if self.total_tx_contents_size <= self.tx_content_memory_limit {
            return;
        }

        let size_before = self.total_tx_contents_size;
        debug!(
            "Transaction service exceeds its contents memory limit. Limit: {}. Current size: {}.",
            self.tx_content_memory_limit, self.total_tx_contents_size
        );
        let mut removed_tx_count = 0;
        while self.total_tx_contents_size > self.tx_content_memory_limit {
            match self.assignment_expire_queue.pop_oldest() {
                Some(short_id) => {
                    self.remove_transaction_by_short_id(short_id);
                    removed_tx_count += 1;
                }
                None => {
                    warn!("Contents cache over its limit with no assignments left to evict");
                    break;
                }
            }
        }

        self.total_tx_removed_by_memory_limit += removed_tx_count;
        debug!(
            "Removed {} oldest transactions from the cache. Size before: {}, after: {}.",
            removed_tx_count, size_before, self.total_tx_contents_size
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn hash(tag: u8) -> Sha256Hash {
        Sha256Hash::new([tag; 32])
    }

    fn service(memory_limit: u64) -> TransactionService {
        let config = TxCacheConfig {
            sid_expire_time: 60_000,
            final_tx_confirmations_count: 3,
            tx_cache_memory_limit_bytes: memory_limit,
            dump_removed_short_ids_path: None,
        };
        TransactionService::new(7, &config, &[])
    }

    fn assert_coherent(service: &TransactionService) {
        for (short_id, hash) in &service.short_id_to_hash {
            assert!(
                service.hash_to_short_ids[hash].contains(short_id),
                "short id {} missing from its hash's set",
                short_id
            );
        }
        for (hash, short_ids) in &service.hash_to_short_ids {
            assert!(!short_ids.is_empty());
            for short_id in short_ids {
                assert_eq!(service.short_id_to_hash.get(short_id), Some(hash));
            }
        }
        let actual_size: u64 = service
            .hash_to_contents
            .values()
            .map(|contents| contents.len() as u64)
            .sum();
        assert_eq!(service.total_tx_contents_size, actual_size);
    }

    #[test]
    fn hash_parses_all_input_forms() {
        let from_bytes = Sha256Hash::from_slice(&[0xab; 32]).unwrap();
        let bare: Sha256Hash = "ab".repeat(32).parse().unwrap();
        let prefixed: Sha256Hash = format!("0x{}", "ab".repeat(32)).parse().unwrap();
        assert_eq!(from_bytes, bare);
        assert_eq!(from_bytes, prefixed);

        assert_eq!(
            "abcd".parse::<Sha256Hash>(),
            Err(HashError::Length {
                expected: 32,
                got: 2
            })
        );
        assert!("zz".repeat(32).parse::<Sha256Hash>().is_err());
    }

    #[test]
    fn assign_and_lookup_round_trip() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        assert!(service.assign_short_id(hash(1), 100, now));
        // A second assignment does not ask for another expiry alarm.
        assert!(!service.assign_short_id(hash(1), 101, now));
        service.set_transaction_contents(hash(1), Bytes::from_static(b"contents"));

        assert!(service.has_short_id(100));
        assert!(service.has_transaction_short_id(&hash(1)));
        assert!(service.has_transaction_contents(&hash(1)));
        let mut short_ids = service.get_short_ids(&hash(1));
        short_ids.sort_unstable();
        assert_eq!(short_ids, vec![100, 101]);

        let info = service.get_transaction(100);
        assert_eq!(info.hash, Some(hash(1)));
        assert_eq!(info.contents, Some(Bytes::from_static(b"contents")));
        assert_coherent(&service);
    }

    #[test]
    fn null_short_id_is_rejected() {
        let mut service = service(1_000_000);
        assert!(!service.assign_short_id(hash(1), NULL_TX_SID, Instant::now()));
        assert!(!service.has_transaction_short_id(&hash(1)));
        assert_eq!(service.get_short_id(&hash(1)), NULL_TX_SID);
    }

    #[test]
    fn unknown_lookups_return_nothing() {
        let service = service(1_000_000);
        let info = service.get_transaction(55);
        assert_eq!(
            info,
            TransactionInfo {
                hash: None,
                contents: None,
                short_id: 55
            }
        );
        assert_eq!(service.get_short_ids(&hash(9)), vec![NULL_TX_SID]);
    }

    #[test]
    fn shared_hash_keeps_contents_until_last_short_id() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, now);
        service.assign_short_id(hash(1), 101, now);
        service.set_transaction_contents(hash(1), Bytes::from_static(b"abcde"));

        service.remove_transaction_by_short_id(100);
        assert!(service.has_transaction_contents(&hash(1)));
        assert_eq!(service.total_tx_contents_size(), 5);
        assert_coherent(&service);

        service.remove_transaction_by_short_id(101);
        assert!(!service.has_transaction_contents(&hash(1)));
        assert!(!service.has_transaction_short_id(&hash(1)));
        assert_eq!(service.total_tx_contents_size(), 0);
        assert_coherent(&service);
    }

    #[test]
    fn replacing_contents_adjusts_byte_accounting() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, now);
        service.set_transaction_contents(hash(1), Bytes::from_static(b"longer contents"));
        service.set_transaction_contents(hash(1), Bytes::from_static(b"short"));
        assert_eq!(service.total_tx_contents_size(), 5);
        assert_coherent(&service);
    }

    #[test]
    fn expires_only_old_assignments_and_reschedules() {
        let start = Instant::now();
        let ttl = Duration::from_secs(60);
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, start);
        service.assign_short_id(hash(2), 200, start + Duration::from_secs(30));
        service.set_transaction_contents(hash(1), Bytes::from_static(b"one"));
        service.set_transaction_contents(hash(2), Bytes::from_static(b"two"));

        let outcome = service.expire_old_assignments(start + ttl + Duration::from_secs(1));
        assert_eq!(outcome, AlarmOutcome::Reschedule(ttl));
        assert!(!service.has_short_id(100));
        assert!(!service.has_transaction_contents(&hash(1)));
        assert!(service.has_short_id(200));
        assert_coherent(&service);

        let outcome = service.expire_old_assignments(start + ttl + Duration::from_secs(31));
        assert_eq!(outcome, AlarmOutcome::Cancel);
        assert!(!service.has_short_id(200));

        // The next assignment asks for a fresh expiry alarm.
        assert!(service.assign_short_id(hash(3), 300, start + Duration::from_secs(120)));
    }

    #[test]
    fn confirmation_window_drops_oldest_batch() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, now);
        service.set_transaction_contents(hash(1), Bytes::from(vec![0; 500]));
        assert_eq!(service.total_tx_contents_size(), 500);

        // final_tx_confirmations_count == 3; batch 100 survives 3 more blocks.
        service.track_seen_short_ids(vec![100]);
        for other in 0..3_u32 {
            service.track_seen_short_ids(vec![500 + other]);
        }

        let info = service.get_transaction(100);
        assert_eq!(info.hash, None);
        assert_eq!(info.contents, None);
        assert_eq!(service.total_tx_contents_size(), 0);
        assert_coherent(&service);
    }

    #[test]
    fn memory_cap_evicts_oldest_first() {
        let mut now = Instant::now();
        let mut service = service(1_000);
        for (tag, short_id) in &[(1_u8, 100_u32), (2, 200), (3, 300)] {
            now += Duration::from_secs(1);
            service.assign_short_id(hash(*tag), *short_id, now);
            service.set_transaction_contents(hash(*tag), Bytes::from(vec![0; 400]));
        }

        // 1200 bytes in three transactions; the oldest goes.
        assert!(!service.has_short_id(100));
        assert!(!service.has_transaction_short_id(&hash(1)));
        assert!(!service.has_transaction_contents(&hash(1)));
        assert!(service.has_short_id(200));
        assert!(service.has_short_id(300));
        assert_eq!(service.total_tx_contents_size(), 800);
        assert_eq!(service.total_tx_removed_by_memory_limit(), 1);
        assert_coherent(&service);
    }

    #[test]
    fn missing_transactions_split_by_cause() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, now);
        service.set_transaction_contents(hash(1), Bytes::from_static(b"cached"));
        service.assign_short_id(hash(2), 200, now);

        let missing = service.get_missing_transactions(&[100, 200, 300]);
        assert!(missing.has_missing);
        assert_eq!(missing.unknown_short_ids, vec![300]);
        assert_eq!(missing.unknown_content_hashes, vec![hash(2)]);

        let all_known = service.get_missing_transactions(&[100]);
        assert!(!all_known.has_missing);
    }

    #[test]
    fn batch_lookup_splits_found_and_missing() {
        let now = Instant::now();
        let mut service = service(1_000_000);
        service.assign_short_id(hash(1), 100, now);
        service.set_transaction_contents(hash(1), Bytes::from_static(b"cached"));
        service.assign_short_id(hash(2), 200, now);

        let result = service.get_transactions(&[100, 200, 300]);
        assert_eq!(result.found.len(), 1);
        assert_eq!(result.found[0].short_id, 100);
        assert_eq!(result.missing.len(), 1);
        assert_eq!(result.missing[0].short_id, 200);
    }

    proptest! {
        // Index coherence and byte accounting under random operations.
        #[test]
        fn index_stays_coherent(ops in proptest::collection::vec(
            (0_u8..4, 1_u8..6, 1_u32..8, 0_usize..600), 1..80,
        )) {
            let mut now = Instant::now();
            let mut service = service(2_000);
            for (op, tag, sid_slot, size) in ops {
                now += Duration::from_millis(10);
                let short_id = u32::from(tag) * 10 + sid_slot;
                match op {
                    0 => { service.assign_short_id(hash(tag), short_id, now); }
                    1 => service.set_transaction_contents(hash(tag), Bytes::from(vec![0; size])),
                    2 => service.remove_transaction_by_short_id(short_id),
                    _ => service.track_seen_short_ids(vec![short_id]),
                }
                assert_coherent(&service);
            }
        }
    }
}
