// src/core/cache.rs

//! The per-worker parsed-statement cache.
//!
//! Maps canonical statement text to a shared, immutable parse result so
//! the CPU-heavy SQL classification becomes an O(1) lookup. The cache is
//! strictly per-worker: no locks, no cross-worker sharing. Capacity is a
//! byte budget; replacement picks a victim at a uniformly random index,
//! which tracks LRU within a few percent for SQL workloads without any
//! touch-on-read bookkeeping.

use crate::core::protocol::{ParseResult, SharedParse};
use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::debug;

/// Fixed per-entry overhead added to the accounted cost: key map slot,
/// entry struct, and the Arc allocation around the value.
const ENTRY_OVERHEAD: usize = 96;

/// Protocol-imposed absolute ceiling on a single statement's accounted
/// size; matches the largest packet the supported wire protocols can
/// frame.
const MAX_ENTRY_BYTES: usize = 0x00ff_ffff;

/// Fraction of the configured budget actually used, leaving headroom for
/// allocator fragmentation and unaccounted bytes inside parse results.
const BUDGET_SAFETY_FACTOR: f64 = 0.65;

/// Dialect mode plus parser options; a mismatch invalidates an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionTag {
    pub dialect: u32,
    pub options: u32,
}

#[derive(Debug)]
struct CacheEntry {
    parse: SharedParse,
    version: VersionTag,
    cost: usize,
    hits: u64,
}

/// Counters for one worker's cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A point-in-time view of one cache entry, for introspection.
#[derive(Debug, Clone)]
pub struct CacheEntrySnapshot {
    pub fingerprint: Box<str>,
    pub cost: usize,
    pub hits: u64,
    pub version: VersionTag,
}

/// A bounded map from canonical statement text to shared parse results.
#[derive(Debug)]
pub struct StatementCache {
    entries: IndexMap<Box<str>, CacheEntry>,
    /// Effective per-worker byte budget after the safety factor. Zero
    /// disables the cache.
    budget: usize,
    size: usize,
    version: VersionTag,
    rng: SmallRng,
    stats: CacheStats,
}

impl StatementCache {
    /// Builds a cache from this worker's share of the global budget.
    /// A zero share disables caching entirely.
    pub fn new(budget_share: usize) -> Self {
        let budget = (budget_share as f64 * BUDGET_SAFETY_FACTOR) as usize;
        Self {
            entries: IndexMap::new(),
            budget,
            size: 0,
            version: VersionTag::default(),
            rng: SmallRng::from_entropy(),
            stats: CacheStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.budget > 0
    }

    /// Accounted bytes currently held.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// The version tag stamped on new entries. Changing it invalidates
    /// existing entries lazily, on lookup.
    pub fn set_version(&mut self, version: VersionTag) {
        self.version = version;
    }

    pub fn version(&self) -> VersionTag {
        self.version
    }

    /// Looks up a fingerprint. An entry stamped with a stale version tag
    /// is evicted and reported as a miss, not a hit.
    pub fn lookup(&mut self, fingerprint: &str) -> Option<SharedParse> {
        if !self.is_enabled() {
            self.stats.misses += 1;
            return None;
        }
        match self.entries.get_full_mut(fingerprint) {
            Some((index, _, entry)) => {
                if entry.version != self.version {
                    let cost = entry.cost;
                    self.entries.swap_remove_index(index);
                    self.size -= cost;
                    self.stats.evictions += 1;
                    self.stats.misses += 1;
                    None
                } else {
                    entry.hits += 1;
                    self.stats.hits += 1;
                    Some(Arc::clone(&entry.parse))
                }
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts a freshly produced parse result. Entries individually
    /// larger than the budget (or the protocol ceiling) are rejected; if
    /// the budget would overflow, random victims are evicted until the
    /// entry fits. A failed insert is silent: correctness is unaffected,
    /// only hit rate.
    pub fn insert(&mut self, fingerprint: &str, parse: SharedParse) {
        if !self.is_enabled() {
            return;
        }
        let cost = Self::entry_cost(fingerprint, &parse);
        if cost > self.budget || cost > MAX_ENTRY_BYTES {
            debug!(
                cost,
                budget = self.budget,
                "statement too large for cache, not retained"
            );
            return;
        }
        // Re-insert over a stale or duplicate entry in place.
        if let Some(old) = self.entries.swap_remove(fingerprint) {
            self.size -= old.cost;
        }
        while self.size + cost > self.budget {
            if !self.evict_one() {
                return;
            }
        }
        self.entries.insert(
            Box::from(fingerprint),
            CacheEntry {
                parse,
                version: self.version,
                cost,
                hits: 0,
            },
        );
        self.size += cost;
        self.stats.inserts += 1;
    }

    /// The lookup-or-produce entry point exposed to routers and codecs.
    /// On a miss the producer runs and its result is inserted (subject to
    /// the budget). With the cache disabled every call reports a miss and
    /// nothing is retained.
    pub fn lookup_or_insert(
        &mut self,
        fingerprint: &str,
        producer: impl FnOnce() -> ParseResult,
    ) -> SharedParse {
        if let Some(parse) = self.lookup(fingerprint) {
            return parse;
        }
        let parse = Arc::new(producer());
        self.insert(fingerprint, Arc::clone(&parse));
        parse
    }

    /// Shrinks the effective budget at runtime, evicting until the held
    /// size fits the new one.
    pub fn shrink_to(&mut self, budget_share: usize) {
        self.budget = (budget_share as f64 * BUDGET_SAFETY_FACTOR) as usize;
        while self.size > self.budget {
            if !self.evict_one() {
                break;
            }
        }
        if self.budget == 0 {
            self.entries.clear();
            self.size = 0;
        }
    }

    /// Snapshots every entry. The result for a busy worker can be large,
    /// so aggregation across workers collects one worker at a time.
    pub fn entries_snapshot(&self) -> Vec<CacheEntrySnapshot> {
        self.entries
            .iter()
            .map(|(fingerprint, entry)| CacheEntrySnapshot {
                fingerprint: fingerprint.clone(),
                cost: entry.cost,
                hits: entry.hits,
                version: entry.version,
            })
            .collect()
    }

    /// Removes one entry at a uniformly random index. O(1) via index map
    /// swap-remove.
    fn evict_one(&mut self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let victim = self.rng.gen_range(0..self.entries.len());
        if let Some((_, entry)) = self.entries.swap_remove_index(victim) {
            self.size -= entry.cost;
            self.stats.evictions += 1;
            true
        } else {
            false
        }
    }

    fn entry_cost(fingerprint: &str, parse: &ParseResult) -> usize {
        fingerprint.len() + parse.size_hint + ENTRY_OVERHEAD
    }
}

/// Scope guard tying one statement's lookup to at most one insertion.
///
/// Constructed at the top of statement handling, it performs the lookup;
/// if the statement had to be parsed fresh, the caller stores the result
/// with [`StatementGuard::produced`]. On drop the guard inserts the fresh
/// result unless the statement was marked excluded (statements whose
/// classification depends on session state, e.g. autocommit toggles, must
/// never be cached).
pub struct StatementGuard<'a> {
    cache: &'a mut StatementCache,
    fingerprint: Box<str>,
    hit: Option<SharedParse>,
    fresh: Option<SharedParse>,
    excluded: bool,
}

impl<'a> StatementGuard<'a> {
    pub fn new(cache: &'a mut StatementCache, fingerprint: &str) -> Self {
        let hit = cache.lookup(fingerprint);
        Self {
            cache,
            fingerprint: Box::from(fingerprint),
            hit,
            fresh: None,
            excluded: false,
        }
    }

    /// The cached result, when the lookup hit.
    pub fn cached(&self) -> Option<SharedParse> {
        self.hit.clone()
    }

    /// Records a freshly parsed result for insertion at scope exit.
    pub fn produced(&mut self, parse: SharedParse) {
        self.fresh = Some(parse);
    }

    /// Marks the statement as uncacheable.
    pub fn exclude(&mut self) {
        self.excluded = true;
    }
}

impl Drop for StatementGuard<'_> {
    fn drop(&mut self) {
        if self.hit.is_some() || self.excluded {
            return;
        }
        if let Some(parse) = self.fresh.take() {
            self.cache.insert(&self.fingerprint, parse);
        }
    }
}
