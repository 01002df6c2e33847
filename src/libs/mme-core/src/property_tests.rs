//! Property-based tests for the timer service and the engine

use proptest::prelude::*;
use std::time::{Duration, Instant};

use crate::engine::{Dispatch, Engine, Signal, Step, PRIORITY_DIVISOR};
use crate::error::CoreResult;
use crate::timer::{TimerCallbacks, TimerHandle, TimerService};

#[derive(Default)]
struct Counts {
    expiry: u32,
    exhausted: u32,
    freed: u32,
}

fn count_expiry(_h: TimerHandle, _p: &mut (), c: &mut Counts) {
    c.expiry += 1;
}

fn count_exhausted(_h: TimerHandle, _p: &mut (), c: &mut Counts) {
    c.exhausted += 1;
}

fn count_free(_h: TimerHandle, _p: (), c: &mut Counts) {
    c.freed += 1;
}

const COUNTING: TimerCallbacks<(), Counts> = TimerCallbacks {
    on_expiry: count_expiry,
    on_max_retries: count_exhausted,
    on_free: count_free,
};

type Trace = Vec<(&'static str, u32)>;

fn gate(step: &mut Step<'_, (), u32, Trace>, signal: &mut Signal<u32>) -> CoreResult<Dispatch> {
    if signal.name == "open" {
        step.sched.transition(pass);
        return Ok(Dispatch::Consumed);
    }
    Ok(Dispatch::Deferred)
}

fn pass(step: &mut Step<'_, (), u32, Trace>, signal: &mut Signal<u32>) -> CoreResult<Dispatch> {
    let value = signal.take_payload().unwrap_or(0);
    step.env.push((signal.name, value));
    Ok(Dispatch::Consumed)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Timer bound: with max_retries = k, on_expiry runs at most k times and
    /// on_max_retries exactly once, however far the clock is driven.
    #[test]
    fn prop_timer_bound(k in 1u32..8, interval_ms in 1u64..200, extra_ticks in 0u32..10) {
        let t0 = Instant::now();
        let mut svc: TimerService<(), Counts> = TimerService::with_clock(t0);
        let mut counts = Counts::default();
        let interval = Duration::from_millis(interval_ms);
        svc.add(interval, k, COUNTING, ()).unwrap();

        for tick in 1..=(k + 1 + extra_ticks) {
            svc.expire(t0 + interval * tick, &mut counts);
        }

        prop_assert_eq!(counts.expiry, k);
        prop_assert_eq!(counts.exhausted, 1);
        prop_assert_eq!(counts.freed, 1);
        prop_assert!(svc.is_empty());
    }

    /// Stopping at any point releases the payload exactly once.
    #[test]
    fn prop_stop_frees_once(k in 1u32..5, ticks in 0u32..8, stops in 1usize..4) {
        let t0 = Instant::now();
        let interval = Duration::from_millis(10);
        let mut svc: TimerService<(), Counts> = TimerService::with_clock(t0);
        let mut counts = Counts::default();
        let h = svc.add(interval, k, COUNTING, ()).unwrap();

        for tick in 1..=ticks {
            svc.expire(t0 + interval * tick, &mut counts);
        }
        for _ in 0..stops {
            svc.stop(h, &mut counts);
        }

        prop_assert_eq!(counts.freed, 1);
        prop_assert!(counts.expiry <= k);
        prop_assert!(counts.exhausted <= 1);
    }

    /// Deferred-signal ordering: saved signals come back in send order,
    /// ahead of anything queued after the transition trigger.
    #[test]
    fn prop_deferred_order(saved in proptest::collection::vec(0u32..1000, 0..16),
                           fresh in proptest::collection::vec(0u32..1000, 0..8)) {
        let mut engine: Engine<(), u32, Trace> = Engine::new();
        let mut trace = Trace::new();
        let pid = engine.spawn("gate", gate, (), None);

        for v in &saved {
            engine.send(Signal::new(pid, "saved").with_payload(*v));
        }
        engine.run(&mut trace);
        prop_assert_eq!(engine.saved_count(pid), saved.len());

        engine.send(Signal::new(pid, "open"));
        for v in &fresh {
            engine.send(Signal::new(pid, "fresh").with_payload(*v));
        }
        engine.run(&mut trace);

        let expected: Trace = saved.iter().map(|v| ("saved", *v))
            .chain(fresh.iter().map(|v| ("fresh", *v)))
            .collect();
        prop_assert_eq!(trace, expected);
    }

    /// Signals are dispatched band by band, FIFO within each band.
    #[test]
    fn prop_band_fifo(priorities in proptest::collection::vec(0u32..(PRIORITY_DIVISOR * 3), 1..32)) {
        let mut engine: Engine<(), u32, Trace> = Engine::new();
        let mut trace = Trace::new();
        let pid = engine.spawn("pass", pass, (), None);

        for (i, p) in priorities.iter().enumerate() {
            engine.send(Signal::new(pid, "s").with_priority(*p).with_payload(i as u32));
        }
        engine.run(&mut trace);

        let mut expected: Vec<u32> = (0..priorities.len() as u32).collect();
        expected.sort_by_key(|i| crate::engine::priority_band(priorities[*i as usize]));
        let got: Vec<u32> = trace.iter().map(|(_, v)| *v).collect();
        prop_assert_eq!(got, expected);
    }
}
