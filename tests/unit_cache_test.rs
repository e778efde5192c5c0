// tests/unit_cache_test.rs

use shunt::core::cache::{StatementCache, StatementGuard, VersionTag};
use shunt::core::protocol::{ParseResult, StatementKind};
use std::sync::Arc;

fn parse_of(kind: StatementKind, size_hint: usize) -> ParseResult {
    ParseResult {
        kind,
        is_write: matches!(kind, StatementKind::Write),
        touches_session_state: false,
        size_hint,
    }
}

#[test]
fn test_insert_then_lookup_returns_shared_result() {
    let mut cache = StatementCache::new(1024 * 1024);
    let parse = Arc::new(parse_of(StatementKind::Read, 100));
    cache.insert("SELECT a FROM t", Arc::clone(&parse));

    let hit = cache.lookup("SELECT a FROM t").expect("entry must hit");
    assert!(Arc::ptr_eq(&hit, &parse), "lookup hands out a shared reference");
    assert_eq!(cache.stats().inserts, 1);
    assert_eq!(cache.stats().hits, 1);
    assert!(cache.size() > 0);
}

#[test]
fn test_lookup_miss_is_counted() {
    let mut cache = StatementCache::new(1024 * 1024);
    assert!(cache.lookup("SELECT nothing").is_none());
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.stats().hits, 0);
}

#[test]
fn test_lookup_or_insert_runs_producer_once() {
    let mut cache = StatementCache::new(1024 * 1024);
    let mut runs = 0;
    cache.lookup_or_insert("SELECT b", || {
        runs += 1;
        parse_of(StatementKind::Read, 10)
    });
    cache.lookup_or_insert("SELECT b", || {
        runs += 1;
        parse_of(StatementKind::Read, 10)
    });
    assert_eq!(runs, 1);
    assert_eq!(cache.stats().hits, 1);
    assert_eq!(cache.stats().misses, 1);
}

#[test]
fn test_version_tag_mismatch_evicts_instead_of_hitting() {
    let mut cache = StatementCache::new(1024 * 1024);
    cache.insert("SELECT x", Arc::new(parse_of(StatementKind::Read, 10)));

    cache.set_version(VersionTag {
        dialect: 1,
        options: 0,
    });
    assert!(cache.lookup("SELECT x").is_none());
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.stats().misses, 1);
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.size(), 0);
}

#[test]
fn test_budget_is_never_exceeded() {
    // Small budget; many inserts must evict to stay within it.
    let mut cache = StatementCache::new(8 * 1024);
    for i in 0..200 {
        let fp = format!("SELECT c{i} FROM t WHERE id = ?");
        cache.insert(&fp, Arc::new(parse_of(StatementKind::Read, 256)));
        assert!(cache.size() <= 8 * 1024, "size exceeded budget after insert {i}");
    }
    assert!(cache.stats().evictions > 0);
    assert!(cache.entry_count() > 0);
}

#[test]
fn test_oversized_entry_is_silently_dropped() {
    let mut cache = StatementCache::new(4 * 1024);
    cache.insert("SELECT big", Arc::new(parse_of(StatementKind::Read, 1024 * 1024)));
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.size(), 0);
    // Silent rejection: no eviction churn either.
    assert_eq!(cache.stats().evictions, 0);
}

#[test]
fn test_zero_budget_disables_the_cache() {
    let mut cache = StatementCache::new(0);
    assert!(!cache.is_enabled());
    let mut runs = 0;
    for _ in 0..5 {
        cache.lookup_or_insert("SELECT z", || {
            runs += 1;
            parse_of(StatementKind::Read, 10)
        });
    }
    assert_eq!(runs, 5, "every lookup reports a miss and the producer runs");
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.stats().misses, 5);
    assert_eq!(cache.stats().hits, 0);
}

#[test]
fn test_reinsert_replaces_in_place() {
    let mut cache = StatementCache::new(1024 * 1024);
    cache.insert("SELECT r", Arc::new(parse_of(StatementKind::Read, 10)));
    let size_small = cache.size();
    cache.insert("SELECT r", Arc::new(parse_of(StatementKind::Read, 500)));
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.size() > size_small);
    let hit = cache.lookup("SELECT r").expect("replacement entry hits");
    assert_eq!(hit.size_hint, 500);
}

#[test]
fn test_shrink_to_evicts_down_to_new_budget() {
    let mut cache = StatementCache::new(64 * 1024);
    for i in 0..50 {
        let fp = format!("SELECT s{i}");
        cache.insert(&fp, Arc::new(parse_of(StatementKind::Read, 512)));
    }
    assert!(cache.size() > 4 * 1024);
    cache.shrink_to(4 * 1024);
    assert!(cache.size() <= 4 * 1024);

    cache.shrink_to(0);
    assert_eq!(cache.entry_count(), 0);
    assert!(!cache.is_enabled());
}

#[test]
fn test_guard_inserts_fresh_parse_on_drop() {
    let mut cache = StatementCache::new(1024 * 1024);
    {
        let mut guard = StatementGuard::new(&mut cache, "SELECT g");
        assert!(guard.cached().is_none());
        guard.produced(Arc::new(parse_of(StatementKind::Read, 10)));
    }
    assert_eq!(cache.entry_count(), 1);
    assert!(cache.lookup("SELECT g").is_some());
}

#[test]
fn test_guard_excluded_statement_is_not_cached() {
    let mut cache = StatementCache::new(1024 * 1024);
    {
        let mut guard = StatementGuard::new(&mut cache, "SET autocommit=?");
        assert!(guard.cached().is_none());
        guard.produced(Arc::new(parse_of(StatementKind::SessionState, 10)));
        guard.exclude();
    }
    assert_eq!(cache.entry_count(), 0);
}

#[test]
fn test_guard_hit_does_not_insert_twice() {
    let mut cache = StatementCache::new(1024 * 1024);
    cache.insert("SELECT h", Arc::new(parse_of(StatementKind::Read, 10)));
    {
        let guard = StatementGuard::new(&mut cache, "SELECT h");
        assert!(guard.cached().is_some());
    }
    assert_eq!(cache.stats().inserts, 1);
    assert_eq!(cache.entry_count(), 1);
}
