// tests/integration/scenarios_test.rs

//! End-to-end scenarios over a running runtime: real sockets, a real
//! worker pool, and the line-framed toy protocol from the helpers.

use crate::integration::test_helpers::*;
use shunt::core::ids::TargetId;
use shunt::core::protocol::{ParseResult, StatementKind};
use shunt::server::RuntimeBuilder;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn sample_parse(size_hint: usize) -> ParseResult {
    ParseResult {
        kind: StatementKind::Read,
        is_write: false,
        touches_session_state: false,
        size_hint,
    }
}

#[test]
fn test_end_to_end_echo() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(1))
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    let mut client = TestClient::connect(addr);
    assert_eq!(client.query("SELECT hello"), "SELECT hello");
    assert_eq!(client.query("SELECT again"), "SELECT again");

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_cache_hit_path() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(4);
    config.cache_max_bytes = 4 * 1024 * 1024;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");

    let produced = Arc::new(AtomicUsize::new(0));

    // First submission to worker 0: one miss, one insert, size grows.
    let counter = Arc::clone(&produced);
    runtime
        .call_on(0, move |worker| {
            worker.cache_mut().lookup_or_insert("SELECT ?", || {
                counter.fetch_add(1, Ordering::AcqRel);
                sample_parse(64)
            });
        })
        .expect("worker 0 responds");
    let stats = runtime
        .call_on(0, |worker| worker.cache_stats())
        .expect("worker 0 responds");
    let size = runtime
        .call_on(0, |worker| worker.cache_mut().size())
        .expect("worker 0 responds");
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.inserts, 1);
    assert!(size > 0, "insert must account bytes");

    // Twenty more submissions of the same statement: twenty hits, no
    // size change, producer never runs again.
    for _ in 0..20 {
        let counter = Arc::clone(&produced);
        runtime
            .call_on(0, move |worker| {
                worker.cache_mut().lookup_or_insert("SELECT ?", || {
                    counter.fetch_add(1, Ordering::AcqRel);
                    sample_parse(64)
                });
            })
            .expect("worker 0 responds");
    }
    let stats = runtime
        .call_on(0, |worker| worker.cache_stats())
        .expect("worker 0 responds");
    let size_after = runtime
        .call_on(0, |worker| worker.cache_mut().size())
        .expect("worker 0 responds");
    assert_eq!(stats.hits, 20);
    assert_eq!(stats.misses, 1);
    assert_eq!(size_after, size);
    assert_eq!(produced.load(Ordering::Acquire), 1);

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_cache_version_tag_invalidation() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(1);
    config.cache_max_bytes = 1024 * 1024;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");

    runtime
        .call_on(0, |worker| {
            worker
                .cache_mut()
                .lookup_or_insert("SELECT x", || sample_parse(32));
        })
        .expect("worker 0 responds");

    // Switch the worker's dialect mode; the old entry must evict on the
    // next lookup instead of serving a stale parse.
    let (hit, stats) = runtime
        .call_on(0, |worker| {
            let cache = worker.cache_mut();
            let mut version = cache.version();
            version.dialect += 1;
            cache.set_version(version);
            let hit = cache.lookup("SELECT x");
            (hit.is_some(), cache.stats())
        })
        .expect("worker 0 responds");
    assert!(!hit, "stale-version entry must not hit");
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.misses, 1);

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_pool_reuse_across_statements() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(1);
    config.pool_capacity_per_target = 1;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    let mut client = TestClient::connect(addr);
    assert_eq!(client.query("SELECT 2"), "SELECT 2");
    assert_eq!(client.query("SELECT 3"), "SELECT 3");

    // The same physical backend connection serviced both statements.
    assert_eq!(backend.accept_count(), 1);
    let stats = runtime.pool_stats(TargetId(0));
    let found: u64 = stats.iter().map(|s| s.times_found).sum();
    let empty: u64 = stats.iter().map(|s| s.times_empty).sum();
    assert_eq!(empty, 1, "first acquire finds an empty pool");
    assert_eq!(found, 1, "second acquire reuses the pooled entry");

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_connection_cap_and_waiter() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(2);
    config.pool_capacity_per_target = 2;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary").max_connections(1))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    // Session A occupies the single allowed connection for a while.
    let mut a = TestClient::connect(addr);
    a.send_line("SLEEP 600");

    // Session B's statement must park as a waiter and then complete once
    // A's connection is released; no timeout fires.
    std::thread::sleep(Duration::from_millis(100));
    let mut b = TestClient::connect(addr);
    b.send_line("SELECT 4");

    assert_eq!(a.read_line(), "SLEEP 600");
    assert_eq!(b.read_line(), "SELECT 4");

    let stats = runtime.aggregate_stats();
    let enqueued: u64 = stats.per_worker.iter().map(|s| s.waiters_enqueued).sum();
    let expired: u64 = stats.per_worker.iter().map(|s| s.waiters_expired).sum();
    assert!(enqueued >= 1, "B must have parked a waiter");
    assert_eq!(expired, 0, "no waiter may time out");

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_waiter_times_out_when_capacity_never_frees() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(1);
    config.multiplex_timeout = Duration::from_millis(300);
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary").max_connections(1))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    let mut a = TestClient::connect(addr);
    a.send_line("SLEEP 2500");
    std::thread::sleep(Duration::from_millis(100));

    let mut b = TestClient::connect(addr);
    b.send_line("SELECT 9");
    let reply = b.read_line();
    assert!(
        reply.starts_with("ERR"),
        "waiter must fail with a busy error, got: {reply}"
    );

    assert_eq!(a.read_line(), "SLEEP 2500");
    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_session_migration_between_workers() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(2))
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    // Warm four sessions into ROUTING with all backends released.
    let mut clients: Vec<TestClient> = (0..4).map(|_| TestClient::connect(addr)).collect();
    for (index, client) in clients.iter_mut().enumerate() {
        let reply = client.query(&format!("SELECT warm{index}"));
        assert_eq!(reply, format!("SELECT warm{index}"));
    }

    let count_on = |worker: usize| {
        runtime
            .call_on(worker, |w| w.session_count())
            .expect("worker responds")
    };
    let (on_zero, on_one) = (count_on(0), count_on(1));
    assert_eq!(on_zero + on_one, 4);
    let (source, dest) = if on_zero >= on_one { (0, 1) } else { (1, 0) };

    // Move everything off the busier worker.
    runtime.post_to(source, move |w| w.migrate_sessions(dest, 16));
    assert!(
        wait_until(Duration::from_secs(5), || count_on(source) == 0),
        "all movable sessions must leave the source worker"
    );
    assert_eq!(count_on(dest), 4);

    // Every moved session's next statement completes correctly.
    for (index, client) in clients.iter_mut().enumerate() {
        let reply = client.query(&format!("SELECT moved{index}"));
        assert_eq!(reply, format!("SELECT moved{index}"));
    }

    let stats = runtime.aggregate_stats();
    let moved_in: u64 = stats.per_worker.iter().map(|s| s.sessions_migrated_in).sum();
    assert_eq!(moved_in, 4);

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_graceful_shutdown_drains_sessions() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(2))
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    // Two idle sessions with pooled backends behind them.
    let mut a = TestClient::connect(addr);
    let mut b = TestClient::connect(addr);
    assert_eq!(a.query("SELECT a"), "SELECT a");
    assert_eq!(b.query("SELECT b"), "SELECT b");

    runtime.start_shutdown();
    runtime.join();

    // Both clients observe the polite kill and then the close.
    let tail_a = a.read_to_eof();
    let tail_b = b.read_to_eof();
    assert!(tail_a.starts_with("ERR"), "A sees a shutdown error: {tail_a:?}");
    assert!(tail_b.starts_with("ERR"), "B sees a shutdown error: {tail_b:?}");
}

#[test]
fn test_statement_fails_when_target_down() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(1))
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    runtime.set_target_up("primary", false);
    let mut client = TestClient::connect(addr);
    let reply = client.query("SELECT x");
    assert!(
        reply.starts_with("ERR"),
        "routing to a down target must surface an error, got: {reply}"
    );

    runtime.set_target_up("primary", true);
    assert_eq!(client.query("SELECT y"), "SELECT y");

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_inbox_ordering_exactly_once() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(1))
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0..100u32 {
        let sink = Arc::clone(&seen);
        runtime.post_to(0, move |_| sink.lock().push(i));
    }
    // The barrier task lands behind the hundred submissions from this
    // thread, so by the time it runs they all have.
    runtime.call_on(0, |_| ()).expect("worker responds");
    let seen = seen.lock();
    assert_eq!(seen.len(), 100, "each submission executes exactly once");
    assert!(
        seen.windows(2).all(|w| w[0] < w[1]),
        "single-submitter tasks execute in submission order"
    );

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_live_cache_shrink_enforces_budget() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(1);
    config.cache_max_bytes = 1024 * 1024;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");

    runtime
        .call_on(0, |worker| {
            for i in 0..100 {
                let fp = format!("SELECT col{i} FROM t");
                worker
                    .cache_mut()
                    .lookup_or_insert(&fp, || sample_parse(512));
            }
        })
        .expect("worker responds");
    let before = runtime
        .call_on(0, |w| w.cache_mut().size())
        .expect("worker responds");
    assert!(before > 0);

    runtime.resize_cache(8 * 1024);
    assert!(
        wait_until(Duration::from_secs(2), || {
            runtime
                .call_on(0, |w| w.cache_mut().size())
                .expect("worker responds")
                <= 8 * 1024
        }),
        "live shrink must evict down to the new budget"
    );

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_cache_entry_snapshot_by_serial_broadcast() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(2);
    config.cache_max_bytes = 1024 * 1024;
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");

    runtime
        .call_on(0, |worker| {
            worker
                .cache_mut()
                .lookup_or_insert("SELECT snap", || sample_parse(40));
            let _ = worker.cache_mut().lookup("SELECT snap");
        })
        .expect("worker 0 responds");

    let per_worker = runtime.cache_entries();
    assert_eq!(per_worker.len(), 2);
    let entry = per_worker[0]
        .iter()
        .find(|e| &*e.fingerprint == "SELECT snap")
        .expect("worker 0 holds the entry");
    assert_eq!(entry.hits, 1);
    assert!(entry.cost > 40);
    assert!(per_worker[1].is_empty(), "caches are strictly per-worker");

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_idle_session_is_killed_by_timeout_sweep() {
    init_tracing();
    let backend = EchoBackend::start();
    let runtime = RuntimeBuilder::new(test_config(1))
        .target(backend.target_config("primary"))
        .listener(
            line_listener(TargetId(0)).session_idle_timeout(Duration::from_millis(200)),
        )
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    let mut client = TestClient::connect(addr);
    assert_eq!(client.query("SELECT live"), "SELECT live");

    // Idle past the timeout: the once-per-second sweep kills the session
    // and the client observes the close.
    let tail = client.read_to_eof();
    assert!(tail.is_empty(), "an idle kill closes without an error reply");

    assert!(
        wait_until(Duration::from_secs(5), || runtime.session_count() == 0),
        "idle session must be reaped"
    );

    runtime.start_shutdown();
    runtime.join();
}

#[test]
fn test_rebalance_disabled_with_single_worker() {
    init_tracing();
    let backend = EchoBackend::start();
    let mut config = test_config(1);
    config.rebalance_window = Duration::from_millis(50);
    let runtime = RuntimeBuilder::new(config)
        .target(backend.target_config("primary"))
        .listener(line_listener(TargetId(0)))
        .start()
        .expect("runtime starts");
    let addr = runtime.local_addrs()[0];

    // All coordination paths degenerate to local execution; traffic
    // still flows.
    let mut client = TestClient::connect(addr);
    for i in 0..10 {
        assert_eq!(client.query(&format!("SELECT {i}")), format!("SELECT {i}"));
    }
    let stats = runtime.aggregate_stats();
    let migrated: u64 = stats
        .per_worker
        .iter()
        .map(|s| s.sessions_migrated_in + s.sessions_migrated_out)
        .sum();
    assert_eq!(migrated, 0);

    runtime.start_shutdown();
    runtime.join();
}
