//! Retransmission timer service
//!
//! One-shot timers that re-arm themselves up to a bounded number of retries.
//! Deadlines are kept in a BTreeMap ordered by (deadline, id) so the next
//! expiry is found in O(log n), and ties fire in arming order.
//!
//! Every timer carries three plain function callbacks:
//! - `on_expiry` for each expiry while the retry count is within bounds
//! - `on_max_retries` once, when the retry count exceeds the bound
//! - `on_free` exactly once, when the timer is stopped or auto-stops
//!
//! The service knows nothing about protocol state. Callbacks only see the
//! timer payload and a caller-supplied context `C`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};

/// Opaque handle to an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Callback invoked on expiry or on final expiry
pub type TimerFn<T, C> = fn(TimerHandle, &mut T, &mut C);

/// Callback invoked when the timer is released; takes ownership of the payload
pub type FreeFn<T, C> = fn(TimerHandle, T, &mut C);

/// The three callbacks bound to a timer
pub struct TimerCallbacks<T, C> {
    pub on_expiry: TimerFn<T, C>,
    pub on_max_retries: TimerFn<T, C>,
    pub on_free: FreeFn<T, C>,
}

impl<T, C> Clone for TimerCallbacks<T, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, C> Copy for TimerCallbacks<T, C> {}

/// Tree key ordering timers by deadline, tie-broken by id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: Instant,
    id: u64,
}

struct TimerEntry<T, C> {
    interval: Duration,
    max_retries: u32,
    retry_count: u32,
    deadline: Instant,
    callbacks: TimerCallbacks<T, C>,
    payload: T,
}

/// Timer service keyed by [`TimerHandle`]
pub struct TimerService<T, C> {
    timers: HashMap<TimerHandle, TimerEntry<T, C>>,
    tree: BTreeMap<TimerKey, TimerHandle>,
    next_id: u64,
    now: Instant,
}

impl<T, C> TimerService<T, C> {
    /// Create a timer service whose clock starts at the current instant
    pub fn new() -> Self {
        Self::with_clock(Instant::now())
    }

    /// Create a timer service whose clock starts at `now`
    pub fn with_clock(now: Instant) -> Self {
        TimerService {
            timers: HashMap::new(),
            tree: BTreeMap::new(),
            next_id: 1,
            now,
        }
    }

    /// Arm a timer that first fires `interval` after the service clock.
    ///
    /// Fails if `interval` is zero or `max_retries` is below one.
    pub fn add(
        &mut self,
        interval: Duration,
        max_retries: u32,
        callbacks: TimerCallbacks<T, C>,
        payload: T,
    ) -> CoreResult<TimerHandle> {
        if interval.is_zero() {
            return Err(CoreError::InvalidInterval);
        }
        if max_retries < 1 {
            return Err(CoreError::InvalidMaxRetries(max_retries));
        }

        let handle = TimerHandle(self.next_id);
        self.next_id += 1;

        let deadline = self.now + interval;
        self.tree.insert(TimerKey { deadline, id: handle.0 }, handle);
        self.timers.insert(
            handle,
            TimerEntry {
                interval,
                max_retries,
                retry_count: 0,
                deadline,
                callbacks,
                payload,
            },
        );

        log::trace!("{} armed: interval={:?} max_retries={}", handle, interval, max_retries);
        Ok(handle)
    }

    /// Stop a timer and release its payload through `on_free`.
    ///
    /// Returns `false` if the timer was already stopped, including the case
    /// where it auto-stopped after its final expiry. `on_free` is never
    /// invoked twice.
    pub fn stop(&mut self, handle: TimerHandle, ctx: &mut C) -> bool {
        let Some(entry) = self.timers.remove(&handle) else {
            log::trace!("{} already stopped", handle);
            return false;
        };
        self.tree.remove(&TimerKey {
            deadline: entry.deadline,
            id: handle.0,
        });

        (entry.callbacks.on_free)(handle, entry.payload, ctx);
        true
    }

    /// Fire every timer whose deadline is at or before `now`.
    ///
    /// Each timer fires at most once per call; a re-armed timer is scheduled
    /// one interval after `now`. Returns the number of callbacks fired.
    pub fn expire(&mut self, now: Instant, ctx: &mut C) -> usize {
        if now > self.now {
            self.now = now;
        }

        let due: Vec<(TimerKey, TimerHandle)> = self
            .tree
            .range(..=TimerKey { deadline: self.now, id: u64::MAX })
            .map(|(k, h)| (*k, *h))
            .collect();

        let mut fired = 0;
        for (key, handle) in due {
            self.tree.remove(&key);

            let Some(entry) = self.timers.get_mut(&handle) else {
                continue;
            };
            entry.retry_count += 1;
            fired += 1;

            if entry.retry_count <= entry.max_retries {
                entry.deadline = self.now + entry.interval;
                self.tree.insert(
                    TimerKey {
                        deadline: entry.deadline,
                        id: handle.0,
                    },
                    handle,
                );
                log::trace!("{} expired (retry {}/{})", handle, entry.retry_count, entry.max_retries);
                (entry.callbacks.on_expiry)(handle, &mut entry.payload, ctx);
            } else if let Some(mut entry) = self.timers.remove(&handle) {
                log::trace!("{} exhausted after {} retries", handle, entry.max_retries);
                (entry.callbacks.on_max_retries)(handle, &mut entry.payload, ctx);
                (entry.callbacks.on_free)(handle, entry.payload, ctx);
            }
        }

        fired
    }

    /// Deadline of the earliest armed timer
    pub fn next_expiry(&self) -> Option<Instant> {
        self.tree.first_key_value().map(|(k, _)| k.deadline)
    }

    /// Time until the earliest armed timer, measured from the service clock
    pub fn next_timeout(&self) -> Option<Duration> {
        self.next_expiry()
            .map(|deadline| deadline.saturating_duration_since(self.now))
    }

    /// Whether the timer is still armed
    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.timers.contains_key(&handle)
    }

    /// Number of expiries observed so far for an armed timer
    pub fn retry_count(&self, handle: TimerHandle) -> Option<u32> {
        self.timers.get(&handle).map(|e| e.retry_count)
    }

    /// Payload of an armed timer
    pub fn payload(&self, handle: TimerHandle) -> Option<&T> {
        self.timers.get(&handle).map(|e| &e.payload)
    }

    /// Mutable payload of an armed timer
    pub fn payload_mut(&mut self, handle: TimerHandle) -> Option<&mut T> {
        self.timers.get_mut(&handle).map(|e| &mut e.payload)
    }

    /// Current service clock
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl<T, C> Default for TimerService<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Trace {
        expiries: Vec<(u64, u32)>,
        exhausted: Vec<u64>,
        freed: Vec<u64>,
    }

    fn on_expiry(h: TimerHandle, payload: &mut u32, trace: &mut Trace) {
        *payload += 1;
        trace.expiries.push((h.id(), *payload));
    }

    fn on_max(h: TimerHandle, _payload: &mut u32, trace: &mut Trace) {
        trace.exhausted.push(h.id());
    }

    fn on_free(h: TimerHandle, _payload: u32, trace: &mut Trace) {
        trace.freed.push(h.id());
    }

    const CALLBACKS: TimerCallbacks<u32, Trace> = TimerCallbacks {
        on_expiry,
        on_max_retries: on_max,
        on_free,
    };

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_add_rejects_zero_interval() {
        let mut svc: TimerService<u32, Trace> = TimerService::new();
        assert_eq!(svc.add(Duration::ZERO, 1, CALLBACKS, 0), Err(CoreError::InvalidInterval));
    }

    #[test]
    fn test_add_rejects_zero_retries() {
        let mut svc: TimerService<u32, Trace> = TimerService::new();
        assert_eq!(svc.add(ms(10), 0, CALLBACKS, 0), Err(CoreError::InvalidMaxRetries(0)));
        assert!(svc.is_empty());
    }

    #[test]
    fn test_retry_then_exhaust() {
        let t0 = Instant::now();
        let mut svc = TimerService::with_clock(t0);
        let mut trace = Trace::default();
        let h = svc.add(ms(100), 2, CALLBACKS, 0).unwrap();

        assert_eq!(svc.expire(t0 + ms(50), &mut trace), 0);
        assert_eq!(svc.expire(t0 + ms(100), &mut trace), 1);
        assert_eq!(svc.expire(t0 + ms(200), &mut trace), 1);
        assert_eq!(trace.expiries, vec![(h.id(), 1), (h.id(), 2)]);
        assert!(trace.exhausted.is_empty());

        assert_eq!(svc.expire(t0 + ms(300), &mut trace), 1);
        assert_eq!(trace.exhausted, vec![h.id()]);
        assert_eq!(trace.freed, vec![h.id()]);
        assert!(!svc.is_active(h));
    }

    #[test]
    fn test_stop_frees_once() {
        let mut svc = TimerService::new();
        let mut trace = Trace::default();
        let h = svc.add(ms(100), 3, CALLBACKS, 7).unwrap();

        assert!(svc.stop(h, &mut trace));
        assert!(!svc.stop(h, &mut trace));
        assert_eq!(trace.freed, vec![h.id()]);
        assert_eq!(svc.next_expiry(), None);
    }

    #[test]
    fn test_stop_after_auto_stop_is_noop() {
        let t0 = Instant::now();
        let mut svc = TimerService::with_clock(t0);
        let mut trace = Trace::default();
        let h = svc.add(ms(10), 1, CALLBACKS, 0).unwrap();

        svc.expire(t0 + ms(10), &mut trace);
        svc.expire(t0 + ms(20), &mut trace);
        assert_eq!(trace.freed.len(), 1);

        assert!(!svc.stop(h, &mut trace));
        assert_eq!(trace.freed.len(), 1);
    }

    #[test]
    fn test_ordering_by_deadline() {
        let t0 = Instant::now();
        let mut svc = TimerService::with_clock(t0);
        let mut trace = Trace::default();
        let late = svc.add(ms(300), 1, CALLBACKS, 0).unwrap();
        let early = svc.add(ms(100), 1, CALLBACKS, 0).unwrap();

        assert_eq!(svc.next_expiry(), Some(t0 + ms(100)));
        svc.expire(t0 + ms(150), &mut trace);
        assert_eq!(trace.expiries, vec![(early.id(), 1)]);
        assert!(svc.is_active(late));
    }

    #[test]
    fn test_next_timeout_tracks_clock() {
        let t0 = Instant::now();
        let mut svc = TimerService::with_clock(t0);
        let mut trace = Trace::default();
        svc.add(ms(100), 1, CALLBACKS, 0).unwrap();
        svc.add(ms(500), 1, CALLBACKS, 0).unwrap();

        assert_eq!(svc.next_timeout(), Some(ms(100)));
        svc.expire(t0 + ms(100), &mut trace);
        // first timer re-armed at t0+200, second still at t0+500
        assert_eq!(svc.next_timeout(), Some(ms(100)));
    }
}
