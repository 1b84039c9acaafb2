//! Integration tests for the turn barrier
//!
//! Real threads stand in for agents calling the move service.

use arenabox::turn::{BarrierConfig, BarrierError, BarrierOutcome, TurnBarrier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(timeout: Duration) -> BarrierConfig {
    BarrierConfig {
        enabled: true,
        timeout,
        poll_interval: Duration::from_millis(5),
    }
}

#[test]
fn test_silent_opponent_times_out_and_rolls_back() {
    let barrier = TurnBarrier::new(config(Duration::from_millis(200)), ["fast", "silent"]);

    let start = Instant::now();
    let err = barrier.complete_turn("fast").unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(err.is_retryable());
    match err {
        BarrierError::Timeout { agent, turn, .. } => {
            assert_eq!(agent, "fast");
            assert_eq!(turn, 0);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    let state = barrier.snapshot();
    assert_eq!(state.completed("fast"), Some(0));
    assert_eq!(state.completed("silent"), Some(0));
    assert_eq!(state.turn_count(), 0);
}

#[test]
fn test_unknown_agent_is_rejected_without_counting() {
    let barrier = TurnBarrier::new(config(Duration::from_millis(100)), ["a", "b"]);
    assert_eq!(
        barrier.complete_turn("intruder"),
        Err(BarrierError::UnknownAgent("intruder".into()))
    );
    assert_eq!(barrier.snapshot().completed("a"), Some(0));
}

#[test]
fn test_lockstep_rounds_advance_monotonically() {
    const ROUNDS: u64 = 5;
    let barrier = Arc::new(TurnBarrier::new(config(Duration::from_secs(10)), ["a", "b", "c"]));
    let done = Arc::new(AtomicBool::new(false));

    // Observer: the global counter never goes backwards.
    let observer = {
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = 0;
            while !done.load(Ordering::SeqCst) {
                let now = barrier.turn_count();
                assert!(now >= last, "turn counter went from {} to {}", last, now);
                last = now;
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let players: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut released = Vec::new();
                for _ in 0..ROUNDS {
                    // Uneven pacing so agents arrive in different orders.
                    thread::sleep(Duration::from_millis(3 * i as u64));
                    match barrier.complete_turn(name).unwrap() {
                        BarrierOutcome::Released { turn, .. } => released.push(turn),
                        BarrierOutcome::Disabled => panic!("barrier unexpectedly disabled"),
                    }
                }
                released
            })
        })
        .collect();

    for player in players {
        let released = player.join().unwrap();
        assert_eq!(released, (1..=ROUNDS).collect::<Vec<_>>());
    }
    done.store(true, Ordering::SeqCst);
    observer.join().unwrap();

    let state = barrier.snapshot();
    assert_eq!(state.turn_count(), ROUNDS);
    for name in ["a", "b", "c"] {
        assert_eq!(state.completed(name), Some(ROUNDS));
    }
}

#[test]
fn test_disabled_barrier_passes_everyone_through() {
    let barrier = TurnBarrier::new(
        BarrierConfig {
            enabled: false,
            ..BarrierConfig::default()
        },
        ["a", "b"],
    );
    for _ in 0..3 {
        assert_eq!(barrier.complete_turn("a").unwrap(), BarrierOutcome::Disabled);
    }
    assert_eq!(barrier.turn_count(), 0);
}
