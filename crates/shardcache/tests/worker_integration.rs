//! Dispatch-fabric integration: handoffs and lock-mode switches under load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shardcache::{
    ConnHandler, ConnState, GlobalStats, Handoff, LockMode, Store, StoreMode, Transport,
    WorkerPool, EV_PERSIST, EV_READ,
};

fn udp_handoff() -> Handoff {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind udp");
    Handoff {
        transport: Transport::Udp(socket),
        init_state: ConnState::NewCommand,
        event_flags: EV_READ | EV_PERSIST,
        read_buffer_size: 2048,
    }
}

fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Workers keep mutating the store while the control thread flips the lock
/// mode back and forth. After the final switch returns, every worker reports
/// granular mode and no operation was lost.
#[test]
fn test_mode_switch_under_load() {
    let store = Arc::new(Store::new(4, None));
    let completed = Arc::new(AtomicU64::new(0));

    let handler: Arc<ConnHandler> = {
        let store = Arc::clone(&store);
        let completed = Arc::clone(&completed);
        Arc::new(move |_handoff, ctx| {
            for i in 0..50u32 {
                let key = format!("worker-{}-{i}", ctx.index());
                store.store(key.as_bytes(), Arc::from(&b"v"[..]), 0, 0, StoreMode::Set);
                assert!(store.get(key.as_bytes()).is_some());
            }
            completed.fetch_add(1, Ordering::Relaxed);
        })
    };

    let pool =
        WorkerPool::spawn(4, handler, Arc::new(GlobalStats::new())).expect("spawn pool");

    for round in 0..10 {
        for _ in 0..4 {
            assert!(pool.dispatch(udp_handoff()));
        }
        let mode = if round % 2 == 0 { LockMode::Global } else { LockMode::Granular };
        pool.switch_mode(mode);
        assert_eq!(pool.worker_modes(), vec![mode; 4], "switch must be fully acked");
    }
    pool.switch_mode(LockMode::Granular);

    assert!(
        wait_for(Duration::from_secs(10), || completed.load(Ordering::Relaxed) == 40),
        "all dispatched handoffs must complete"
    );
    assert_eq!(pool.worker_modes(), vec![LockMode::Granular; 4]);
    assert_eq!(store.item_count(), 4 * 50, "every worker's keys are present");
}

/// Dispatch keeps dealing evenly regardless of mode churn.
#[test]
fn test_dispatch_count_survives_mode_churn() {
    let handled = Arc::new(AtomicU64::new(0));
    let handler: Arc<ConnHandler> = {
        let handled = Arc::clone(&handled);
        Arc::new(move |_h, _ctx| {
            handled.fetch_add(1, Ordering::Relaxed);
        })
    };
    let pool =
        WorkerPool::spawn(2, handler, Arc::new(GlobalStats::new())).expect("spawn pool");

    for _ in 0..8 {
        assert!(pool.dispatch(udp_handoff()));
        pool.switch_mode(LockMode::Global);
        pool.switch_mode(LockMode::Granular);
    }
    assert!(wait_for(Duration::from_secs(5), || handled.load(Ordering::Relaxed) == 8));

    let per_worker: Vec<u64> =
        pool.stats_blocks().iter().map(|b| b.snapshot().conns_handled).collect();
    assert_eq!(per_worker, vec![4, 4], "round-robin must survive interleaved switches");
}
