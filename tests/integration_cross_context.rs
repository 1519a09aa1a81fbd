//! Cross-context integration scenarios (§8 scenarios 3, 5, 6): properties
//! that only a real multi-OS-thread run can exercise, as opposed to the
//! single-threaded unit tests living alongside each module.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mainmemory::config::RuntimeConfig;
use mainmemory::dispatch::Dispatch;

fn wait_until(max_attempts: u32, mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..max_attempts {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

/// Scenario 3: context 0 posts an async call into context 1; after context
/// 1 drains its inbox, the shared cell reflects the call's effect.
#[test]
fn cross_context_async_call_runs_on_target_context() {
    let config = RuntimeConfig {
        contexts: 2,
        ..RuntimeConfig::default()
    };
    let mut dispatch = Dispatch::new(config).unwrap();
    dispatch.spawn_all().unwrap();

    let cell = Arc::new(AtomicUsize::new(0));
    let cell2 = Arc::clone(&cell);
    dispatch.async_call(
        1,
        Box::new(move |_ctx| {
            let a = 5usize;
            let b = 7usize;
            cell2.store(a + b, Ordering::SeqCst);
        }),
    );

    assert!(
        wait_until(200, || cell.load(Ordering::SeqCst) == 12),
        "async call never ran on the target context"
    );

    dispatch.dispatch_cleanup();
}

/// Scenario 5: a one-shot timer bound to a fiber fires once, resuming it;
/// exercised here end to end through a running context (the unit-level
/// equivalent in `context.rs` drives the timer queue directly without a
/// live loop).
#[test]
fn timer_resumes_a_blocked_fiber_exactly_once() {
    let config = RuntimeConfig {
        contexts: 1,
        ..RuntimeConfig::default()
    };
    let mut dispatch = Dispatch::new(config).unwrap();
    dispatch.spawn_all().unwrap();

    let resumed = Arc::new(AtomicUsize::new(0));
    let resumed2 = Arc::clone(&resumed);
    dispatch.async_call(
        0,
        Box::new(move |ctx| {
            let id = ctx
                .fiber_create(
                    16,
                    Box::new(move |ctx| {
                        ctx.fiber_block();
                        resumed2.fetch_add(1, Ordering::SeqCst);
                        Box::new(()) as Box<dyn std::any::Any + Send>
                    }),
                )
                .unwrap();
            ctx.arm_fiber_timer(Duration::from_millis(10), id, None)
                .unwrap();
        }),
    );

    assert!(
        wait_until(200, || resumed.load(Ordering::SeqCst) == 1),
        "timer never resumed the blocked fiber"
    );
    // Give the loop a couple more passes; the count must not climb past 1.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    dispatch.dispatch_cleanup();
}

/// Scenario 6: reclamation must not free a retired resource while a peer
/// context is still inside a critical section that predates the
/// retirement. Driven directly against the shared `Reclaimer` two real
/// `Dispatch`-managed contexts would use, since the property is about the
/// reclaimer's cross-thread contract rather than anything context-loop
/// specific.
#[test]
fn reclamation_waits_for_a_busy_peer_context() {
    use mainmemory::epoch::Reclaimer;
    use std::sync::atomic::AtomicBool;

    let reclaimer = Arc::new(Reclaimer::new(2));
    let destroyed = Arc::new(AtomicBool::new(false));

    reclaimer.enter(1);

    let flag = Arc::clone(&destroyed);
    reclaimer.enter(0);
    reclaimer.retire(0, Box::new(move || flag.store(true, Ordering::SeqCst)));
    reclaimer.leave(0);

    for _ in 0..4 {
        reclaimer.enter(0);
        reclaimer.leave(0);
    }
    assert!(
        !destroyed.load(Ordering::SeqCst),
        "destructor ran while peer context 1 was still in its old critical section"
    );

    reclaimer.leave(1);
    reclaimer.enter(1);
    reclaimer.leave(1);

    for _ in 0..4 {
        reclaimer.enter(0);
        reclaimer.leave(0);
    }
    assert!(destroyed.load(Ordering::SeqCst));
}
