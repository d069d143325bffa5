//! Scan Cache (C3): sharded, content-addressed cache with at-most-one
//! in-flight computation per key and mutation-correct invalidation
//! (spec §3 `CacheEntry`, §4.3).

pub mod journal;

use crate::identity::FileIdentity;
use crate::result::ScanResult;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// At least 16 shards (spec §5 shared-resource policy).
const SHARD_COUNT: usize = 16;

#[derive(Clone)]
struct CacheEntry {
    result: ScanResult,
    identity: FileIdentity,
    inserted_at: Instant,
    last_hit_at: Instant,
    hits: u64,
    size_bytes: u64,
    definitions_fingerprint: Vec<u8>,
}

enum Slot {
    /// No entry, and nobody computing one.
    Empty,
    /// A caller is computing the value; others block on the shard's condvar.
    InFlight,
    Ready(CacheEntry),
}

struct Shard {
    entries: HashMap<String, Slot>,
    used_bytes: u64,
}

/// `cache_key` identifies a `(FileIdentity, ScanPolicy, engine definitions)`
/// tuple; callers compute it (see `key_for`) before calling `get_or_compute`.
pub struct ScanCache {
    shards: Vec<Mutex<Shard>>,
    cond: Condvar,
    ttl: Duration,
    shard_byte_budget: u64,
}

impl ScanCache {
    /// `byte_budget` is the total cache size budget in bytes, split evenly
    /// across shards; each shard evicts least-recently-used entries once its
    /// share fills (spec §4.3: LRU eviction under a configurable byte budget).
    pub fn new(ttl: Duration, byte_budget: u64) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard { entries: HashMap::new(), used_bytes: 0 })).collect();
        let shard_byte_budget = (byte_budget / SHARD_COUNT as u64).max(1);
        Self { shards, cond: Condvar::new(), ttl, shard_byte_budget }
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in key.as_bytes() {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// Computes the stable cache key for a `(FileIdentity, policy, engine
    /// definitions)` tuple (spec §3 `CacheEntry.key`).
    pub fn key_for(identity: &FileIdentity, policy_fingerprint: &str, definitions_fingerprint: &[u8]) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            identity.device_id,
            identity.inode,
            identity.mtime_ns,
            policy_fingerprint,
            crate::identity::hex(&crate::identity::sha256_bytes(definitions_fingerprint)),
        )
    }

    /// Looks up `key`; if present and the backing file is unchanged and the
    /// engine definitions match, returns the cached result without running
    /// `compute`. Otherwise exactly one caller per key runs `compute`
    /// while all others block until it completes (spec §4.3 coalescing).
    pub fn get_or_compute<F>(
        &self,
        key: &str,
        identity: &FileIdentity,
        definitions_fingerprint: &[u8],
        compute: F,
    ) -> ScanResult
    where
        F: FnOnce() -> ScanResult,
    {
        let shard = self.shard_for(key);
        let mut guard = shard.lock();
        loop {
            match guard.entries.get_mut(key) {
                Some(Slot::Ready(entry)) => {
                    if entry.inserted_at.elapsed() < self.ttl
                        && identity.still_current()
                        && entry.identity == *identity
                        && entry.definitions_fingerprint == definitions_fingerprint
                    {
                        entry.last_hit_at = Instant::now();
                        entry.hits += 1;
                        trace!(key, hits = entry.hits, "cache hit");
                        return entry.result.clone();
                    }
                    debug!(key, "cache entry stale, recomputing");
                    if let Some(Slot::Ready(stale)) = guard.entries.insert(key.to_string(), Slot::InFlight) {
                        guard.used_bytes = guard.used_bytes.saturating_sub(stale.size_bytes);
                    }
                    break;
                }
                Some(Slot::InFlight) => {
                    self.cond.wait(&mut guard);
                    continue;
                }
                Some(Slot::Empty) | None => {
                    guard.entries.insert(key.to_string(), Slot::InFlight);
                    break;
                }
            }
        }
        drop(guard);

        let result = compute();
        let size_bytes = estimate_size_bytes(&result);

        let mut guard = shard.lock();
        self.evict_if_needed(&mut guard, size_bytes);
        let now = Instant::now();
        guard.entries.insert(
            key.to_string(),
            Slot::Ready(CacheEntry {
                result: result.clone(),
                identity: identity.clone(),
                inserted_at: now,
                last_hit_at: now,
                hits: 0,
                size_bytes,
                definitions_fingerprint: definitions_fingerprint.to_vec(),
            }),
        );
        guard.used_bytes += size_bytes;
        drop(guard);
        self.cond.notify_all();
        result
    }

    /// Evicts least-recently-used ready entries until `incoming_size` fits
    /// within this shard's byte budget (spec §4.3: LRU eviction under a
    /// configurable byte budget).
    fn evict_if_needed(&self, shard: &mut Shard, incoming_size: u64) {
        while shard.used_bytes + incoming_size > self.shard_byte_budget {
            let lru = shard
                .entries
                .iter()
                .filter_map(|(k, v)| match v {
                    Slot::Ready(e) => Some((k.clone(), e.last_hit_at, e.size_bytes)),
                    _ => None,
                })
                .min_by_key(|(_, last_hit_at, _)| *last_hit_at);
            match lru {
                Some((key, _, size)) => {
                    shard.entries.remove(&key);
                    shard.used_bytes = shard.used_bytes.saturating_sub(size);
                }
                // Nothing evictable (every slot is InFlight/Empty); let this
                // insert land over budget rather than spin.
                None => break,
            }
        }
    }

    /// Invalidates every entry for `identity`'s key regardless of TTL
    /// (spec §3: mutation must invalidate the cache deterministically).
    pub fn invalidate(&self, key: &str) {
        let shard = self.shard_for(key);
        let mut guard = shard.lock();
        if let Some(Slot::Ready(entry)) = guard.entries.remove(key) {
            guard.used_bytes = guard.used_bytes.saturating_sub(entry.size_bytes);
        }
    }

    /// Invalidates every cached entry whose definitions fingerprint does
    /// not match `current` (engine upgrade; see DESIGN.md open question).
    pub fn invalidate_stale_definitions(&self, current: &[u8]) {
        for shard in &self.shards {
            let mut guard = shard.lock();
            let mut freed = 0u64;
            guard.entries.retain(|_, slot| match slot {
                Slot::Ready(e) if e.definitions_fingerprint != current => {
                    freed += e.size_bytes;
                    false
                }
                _ => true,
            });
            guard.used_bytes = guard.used_bytes.saturating_sub(freed);
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().entries.values().filter(|v| matches!(v, Slot::Ready(_))).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes currently held across every shard (spec §4.3 `size_bytes`
    /// contract).
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().used_bytes).sum()
    }
}

/// Estimates a `ScanResult`'s cache footprint from its serialized size.
/// Falls back to a conservative flat estimate if serialization fails, which
/// should not happen for a well-formed result.
fn estimate_size_bytes(result: &ScanResult) -> u64 {
    serde_json::to_vec(result).map(|bytes| bytes.len() as u64).unwrap_or(512)
}

pub type SharedScanCache = Arc<ScanCache>;
