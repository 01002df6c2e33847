//! Cooperative signal/process execution engine
//!
//! A single-threaded continuation engine. Work is expressed as [`Signal`]s
//! addressed to [`Process`]es; each process holds a current state function
//! that is invoked with the next signal addressed to it.
//!
//! Dispatch rules:
//! - the shared queue has two priority bands, drained band 0 first, FIFO
//!   within a band
//! - a state function returns [`Dispatch::Deferred`] to keep a signal in the
//!   process's saved list, or [`Dispatch::Consumed`] to release it
//! - when a state function calls [`Scheduler::transition`], every saved
//!   signal is put back at the head of the queue in original order
//! - a process marked stopping is released the next time a signal targets it
//!   (or when the loop goes idle), together with its saved signals and timers;
//!   if it still has a live parent, the signal goes to the parent instead and
//!   the process is released when the loop goes idle
//! - a state function returning `Err` is a fault: the process is stopped

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::{CoreError, CoreResult};
use crate::timer::{TimerCallbacks, TimerHandle, TimerService};

// ============================================================================
// Priorities
// ============================================================================

/// Number of priority bands in the shared queue
pub const PRIORITY_BANDS: usize = 2;

/// Priority values are partitioned into bands by this divisor
pub const PRIORITY_DIVISOR: u32 = 128;

/// Priority for internal control signals
pub const PRIORITY_HIGH: u32 = 0;

/// Priority for ordinary traffic
pub const PRIORITY_NORMAL: u32 = PRIORITY_DIVISOR;

/// Band a priority value falls into
pub fn priority_band(priority: u32) -> usize {
    ((priority / PRIORITY_DIVISOR) as usize).min(PRIORITY_BANDS - 1)
}

// ============================================================================
// Signal
// ============================================================================

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}

/// Why a timeout signal was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The n-th expiry within the retry budget
    Retry(u32),
    /// The retry budget is used up; the timer has stopped
    Exhausted,
}

/// An event addressed to a process.
///
/// The payload is released exactly once: either taken by a handler, or
/// passed to the free function (if any) when the signal is dropped.
pub struct Signal<P> {
    pub name: &'static str,
    pub priority: u32,
    pub sender: Option<ProcessId>,
    pub target: ProcessId,
    pub timer: Option<TimerHandle>,
    pub expiry: Option<Expiry>,
    payload: Option<P>,
    free: Option<fn(P)>,
}

impl<P> Signal<P> {
    pub fn new(target: ProcessId, name: &'static str) -> Self {
        Signal {
            name,
            priority: PRIORITY_NORMAL,
            sender: None,
            target,
            timer: None,
            expiry: None,
            payload: None,
            free: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sender(mut self, sender: ProcessId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_payload(mut self, payload: P) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Function used to release the payload if nobody takes it
    pub fn with_free(mut self, free: fn(P)) -> Self {
        self.free = Some(free);
        self
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn payload_mut(&mut self) -> Option<&mut P> {
        self.payload.as_mut()
    }

    /// Take ownership of the payload; the free function will not run
    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }

    pub fn band(&self) -> usize {
        priority_band(self.priority)
    }

    /// Copy of this signal with a cloned payload
    pub fn duplicate(&self) -> Self
    where
        P: Clone,
    {
        Signal {
            name: self.name,
            priority: self.priority,
            sender: self.sender,
            target: self.target,
            timer: self.timer,
            expiry: self.expiry,
            payload: self.payload.clone(),
            free: self.free,
        }
    }
}

impl<P> Drop for Signal<P> {
    fn drop(&mut self) {
        if let (Some(payload), Some(free)) = (self.payload.take(), self.free) {
            free(payload);
        }
    }
}

impl<P> fmt::Debug for Signal<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("timer", &self.timer)
            .field("expiry", &self.expiry)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}

// ============================================================================
// Signal queue
// ============================================================================

/// Two-band FIFO queue of signals
pub struct SignalQueue<P> {
    bands: [VecDeque<Signal<P>>; PRIORITY_BANDS],
}

impl<P> SignalQueue<P> {
    pub fn new() -> Self {
        SignalQueue {
            bands: [VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn push(&mut self, signal: Signal<P>) {
        let band = signal.band();
        self.bands[band].push_back(signal);
    }

    /// Put signals at the head of their bands, preserving their relative order
    pub fn push_front_all(&mut self, signals: Vec<Signal<P>>) {
        for signal in signals.into_iter().rev() {
            let band = signal.band();
            self.bands[band].push_front(signal);
        }
    }

    pub fn pop(&mut self) -> Option<Signal<P>> {
        self.bands.iter_mut().find_map(|band| band.pop_front())
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(|b| b.is_empty())
    }
}

impl<P> Default for SignalQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer context: where timeout signals are delivered, and which timers
/// have been released since the last sweep.
pub struct TimerSink<P> {
    queue: SignalQueue<P>,
    freed: Vec<TimerHandle>,
}

fn timeout_retry<P: Clone>(handle: TimerHandle, template: &mut Signal<P>, sink: &mut TimerSink<P>) {
    let n = match template.expiry {
        Some(Expiry::Retry(n)) => n + 1,
        _ => 1,
    };
    template.expiry = Some(Expiry::Retry(n));
    template.timer = Some(handle);
    sink.queue.push(template.duplicate());
}

fn timeout_exhausted<P: Clone>(handle: TimerHandle, template: &mut Signal<P>, sink: &mut TimerSink<P>) {
    template.expiry = Some(Expiry::Exhausted);
    template.timer = Some(handle);
    sink.queue.push(template.duplicate());
}

fn timeout_free<P>(handle: TimerHandle, _template: Signal<P>, sink: &mut TimerSink<P>) {
    sink.freed.push(handle);
}

// ============================================================================
// Process
// ============================================================================

/// Outcome of a state function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The signal has been handled and is released
    Consumed,
    /// Keep the signal in the process's saved list until the next transition
    Deferred,
}

/// A state function: what the process does with its next signal
pub type StateFn<D, P, E> = fn(&mut Step<'_, D, P, E>, &mut Signal<P>) -> CoreResult<Dispatch>;

/// Scheduling state of a process, kept apart from its data so both can be
/// borrowed during dispatch.
pub struct Control<D, P, E> {
    name: &'static str,
    state: StateFn<D, P, E>,
    parent: Option<ProcessId>,
    saved: VecDeque<Signal<P>>,
    stopping: bool,
}

/// A continuation: state function, owned data, parent link and saved signals
pub struct Process<D, P, E> {
    control: Control<D, P, E>,
    data: D,
}

// ============================================================================
// Scheduler
// ============================================================================

struct Core<D, P, E> {
    processes: HashMap<ProcessId, Process<D, P, E>>,
    timers: TimerService<Signal<P>, TimerSink<P>>,
    timer_owner: HashMap<TimerHandle, ProcessId>,
    sink: TimerSink<P>,
    next_pid: u64,
}

impl<D, P, E> Core<D, P, E> {
    fn alloc_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn spawn(
        &mut self,
        name: &'static str,
        state: StateFn<D, P, E>,
        data: D,
        parent: Option<ProcessId>,
    ) -> ProcessId {
        let pid = self.alloc_pid();
        self.processes.insert(
            pid,
            Process {
                control: Control {
                    name,
                    state,
                    parent,
                    saved: VecDeque::new(),
                    stopping: false,
                },
                data,
            },
        );
        log::debug!("{} [{}] spawned (parent {:?})", pid, name, parent);
        pid
    }

    fn stop_timer(&mut self, handle: TimerHandle) -> bool {
        self.timer_owner.remove(&handle);
        self.timers.stop(handle, &mut self.sink)
    }

    fn reap_freed_timers(&mut self) {
        for handle in self.sink.freed.drain(..) {
            self.timer_owner.remove(&handle);
        }
    }

    /// Release a process: its timers, saved signals and data
    fn release(&mut self, pid: ProcessId, process: Process<D, P, E>) {
        let owned: Vec<TimerHandle> = self
            .timer_owner
            .iter()
            .filter(|(_, owner)| **owner == pid)
            .map(|(h, _)| *h)
            .collect();
        for handle in owned {
            self.stop_timer(handle);
        }
        self.reap_freed_timers();

        log::debug!(
            "{} [{}] released ({} saved signals dropped)",
            pid,
            process.control.name,
            process.control.saved.len()
        );
        drop(process);
    }
}

/// Scheduling operations available to a running state function
pub struct Scheduler<'a, D, P, E> {
    core: &'a mut Core<D, P, E>,
    me: &'a mut Control<D, P, E>,
    pid: ProcessId,
    transitioned: bool,
}

impl<'a, D, P, E> Scheduler<'a, D, P, E> {
    /// The running process
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn parent(&self) -> Option<ProcessId> {
        self.me.parent
    }

    /// Allocate a signal addressed to `target`, sent by the running process
    pub fn new_signal(&self, target: ProcessId, name: &'static str) -> Signal<P> {
        Signal::new(target, name).with_sender(self.pid)
    }

    /// Make a signal eligible for dispatch
    pub fn send(&mut self, signal: Signal<P>) {
        self.core.sink.queue.push(signal);
    }

    /// Park a signal in its target's saved list instead of the shared queue
    pub fn save(&mut self, signal: Signal<P>) {
        if signal.target == self.pid {
            self.me.saved.push_back(signal);
        } else if let Some(process) = self.core.processes.get_mut(&signal.target) {
            process.control.saved.push_back(signal);
        } else {
            log::debug!("save: target {} gone, dropping [{}]", signal.target, signal.name);
        }
    }

    /// Change the running process's state function.
    ///
    /// Every call counts as a transition, including re-entering the current
    /// state, so saved signals are replayed after the handler returns.
    pub fn transition(&mut self, state: StateFn<D, P, E>) {
        self.me.state = state;
        self.transitioned = true;
    }

    /// Start a child process
    pub fn spawn(&mut self, name: &'static str, state: StateFn<D, P, E>, data: D) -> ProcessId {
        self.core.spawn(name, state, data, Some(self.pid))
    }

    /// Mark a process stopping; it is released when next dispatched to
    pub fn stop(&mut self, pid: ProcessId) {
        if pid == self.pid {
            self.me.stopping = true;
        } else if let Some(process) = self.core.processes.get_mut(&pid) {
            process.control.stopping = true;
        }
    }

    /// Whether a process exists and is not stopping
    pub fn is_alive(&self, pid: ProcessId) -> bool {
        if pid == self.pid {
            return !self.me.stopping;
        }
        self.core
            .processes
            .get(&pid)
            .map(|p| !p.control.stopping)
            .unwrap_or(false)
    }

    /// Finish the running process and hand control back to its parent.
    ///
    /// Signals the child saved are handed to the parent, then the parent's
    /// first saved signal is replayed. Returns the parent, or `None` if the
    /// running process has no live parent.
    pub fn run_parent(&mut self) -> Option<ProcessId> {
        let parent_pid = self.me.parent?;
        let parent = self.core.processes.get_mut(&parent_pid)?;

        for mut signal in self.me.saved.drain(..) {
            signal.target = parent_pid;
            parent.control.saved.push_back(signal);
        }
        let replay = parent.control.saved.pop_front();

        self.me.stopping = true;
        if let Some(signal) = replay {
            log::debug!("{} -> {}: replaying [{}]", self.pid, parent_pid, signal.name);
            self.core.sink.queue.push_front_all(vec![signal]);
        }
        Some(parent_pid)
    }

    /// Arm a timer that re-sends a copy of `signal` on each expiry.
    ///
    /// Copies carry [`Expiry::Retry`] while within `max_retries`, then one
    /// carries [`Expiry::Exhausted`]. The timer belongs to the signal's
    /// target and is stopped when that process is released.
    pub fn set_timeout(
        &mut self,
        interval: Duration,
        max_retries: u32,
        signal: Signal<P>,
    ) -> CoreResult<TimerHandle>
    where
        P: Clone,
    {
        let owner = signal.target;
        let handle = self.core.timers.add(
            interval,
            max_retries,
            TimerCallbacks {
                on_expiry: timeout_retry::<P>,
                on_max_retries: timeout_exhausted::<P>,
                on_free: timeout_free::<P>,
            },
            signal,
        )?;
        self.core.timer_owner.insert(handle, owner);
        Ok(handle)
    }

    /// Cancel a timeout; stopping an already-stopped timer returns `false`
    pub fn stop_timeout(&mut self, handle: TimerHandle) -> bool {
        self.core.stop_timer(handle)
    }
}

/// Context passed to a state function
pub struct Step<'a, D, P, E> {
    pub pid: ProcessId,
    pub data: &'a mut D,
    pub env: &'a mut E,
    pub sched: Scheduler<'a, D, P, E>,
}

// ============================================================================
// Engine
// ============================================================================

/// The dispatch loop
pub struct Engine<D, P, E> {
    core: Core<D, P, E>,
}

impl<D, P, E> Engine<D, P, E> {
    pub fn new() -> Self {
        Self::with_clock(Instant::now())
    }

    /// Engine whose timer clock starts at `now`
    pub fn with_clock(now: Instant) -> Self {
        Engine {
            core: Core {
                processes: HashMap::new(),
                timers: TimerService::with_clock(now),
                timer_owner: HashMap::new(),
                sink: TimerSink {
                    queue: SignalQueue::new(),
                    freed: Vec::new(),
                },
                next_pid: 1,
            },
        }
    }

    pub fn spawn(
        &mut self,
        name: &'static str,
        state: StateFn<D, P, E>,
        data: D,
        parent: Option<ProcessId>,
    ) -> ProcessId {
        self.core.spawn(name, state, data, parent)
    }

    pub fn new_signal(&self, target: ProcessId, name: &'static str) -> Signal<P> {
        Signal::new(target, name)
    }

    pub fn send(&mut self, signal: Signal<P>) {
        self.core.sink.queue.push(signal);
    }

    /// Mark a process stopping
    pub fn stop(&mut self, pid: ProcessId) {
        if let Some(process) = self.core.processes.get_mut(&pid) {
            process.control.stopping = true;
        }
    }

    /// Release a process immediately, with its saved signals and timers
    pub fn kill(&mut self, pid: ProcessId) -> CoreResult<()> {
        let process = self
            .core
            .processes
            .remove(&pid)
            .ok_or(CoreError::ProcessNotFound(pid.id()))?;
        self.core.release(pid, process);
        Ok(())
    }

    /// Fire due timers; their signals are queued for the next `run`
    pub fn advance(&mut self, now: Instant) -> usize {
        let fired = self.core.timers.expire(now, &mut self.core.sink);
        self.core.reap_freed_timers();
        fired
    }

    /// Earliest timer deadline
    pub fn next_expiry(&self) -> Option<Instant> {
        self.core.timers.next_expiry()
    }

    pub fn now(&self) -> Instant {
        self.core.timers.now()
    }

    /// Drain the queue. Returns the number of signals dispatched.
    pub fn run(&mut self, env: &mut E) -> usize {
        let mut dispatched = 0;
        while let Some(signal) = self.core.sink.queue.pop() {
            self.dispatch(signal, env);
            dispatched += 1;
        }
        self.sweep();
        dispatched
    }

    fn dispatch(&mut self, mut signal: Signal<P>, env: &mut E) {
        let pid = signal.target;
        let Some(mut process) = self.core.processes.remove(&pid) else {
            log::debug!("No process {} for [{}], dropping", pid, signal.name);
            return;
        };

        if process.control.stopping {
            // a child that returned to its parent passes on what was already
            // queued for it; timeouts stay with the process that armed them
            let heir = process
                .control
                .parent
                .filter(|parent| signal.timer.is_none() && self.is_alive(*parent));
            match heir {
                Some(parent) => {
                    log::debug!("{} finished, handing [{}] to {}", pid, signal.name, parent);
                    signal.target = parent;
                    self.core.processes.insert(pid, process);
                    self.dispatch(signal, env);
                }
                None => {
                    log::debug!("{} stopping, dropping [{}]", pid, signal.name);
                    drop(signal);
                    self.core.release(pid, process);
                }
            }
            return;
        }

        let state = process.control.state;
        let (result, transitioned) = {
            let Process { control, data } = &mut process;
            let mut step = Step {
                pid,
                data,
                env,
                sched: Scheduler {
                    core: &mut self.core,
                    me: control,
                    pid,
                    transitioned: false,
                },
            };
            let result = state(&mut step, &mut signal);
            (result, step.sched.transitioned)
        };

        match result {
            Ok(Dispatch::Consumed) => drop(signal),
            Ok(Dispatch::Deferred) => process.control.saved.push_back(signal),
            Err(e) => {
                log::warn!("{} [{}] fault on [{}]: {}", pid, process.control.name, signal.name, e);
                drop(signal);
                self.core.release(pid, process);
                return;
            }
        }

        if transitioned && !process.control.saved.is_empty() {
            let saved: Vec<Signal<P>> = process.control.saved.drain(..).collect();
            log::trace!("{} transition: re-queueing {} saved signals", pid, saved.len());
            self.core.sink.queue.push_front_all(saved);
        }

        self.core.processes.insert(pid, process);
    }

    /// Release every process marked stopping
    fn sweep(&mut self) {
        let stopping: Vec<ProcessId> = self
            .core
            .processes
            .iter()
            .filter(|(_, p)| p.control.stopping)
            .map(|(pid, _)| *pid)
            .collect();
        for pid in stopping {
            if let Some(process) = self.core.processes.remove(&pid) {
                self.core.release(pid, process);
            }
        }
    }

    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.core
            .processes
            .get(&pid)
            .map(|p| !p.control.stopping)
            .unwrap_or(false)
    }

    pub fn parent(&self, pid: ProcessId) -> Option<ProcessId> {
        self.core.processes.get(&pid).and_then(|p| p.control.parent)
    }

    pub fn data(&self, pid: ProcessId) -> Option<&D> {
        self.core.processes.get(&pid).map(|p| &p.data)
    }

    pub fn saved_count(&self, pid: ProcessId) -> usize {
        self.core
            .processes
            .get(&pid)
            .map(|p| p.control.saved.len())
            .unwrap_or(0)
    }

    pub fn process_count(&self) -> usize {
        self.core.processes.len()
    }

    pub fn timer_count(&self) -> usize {
        self.core.timers.len()
    }
}

impl<D, P, E> Default for Engine<D, P, E> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
