// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bitflags::bitflags;
use crossbeam_epoch as epoch;
use parking_lot::{Condvar, Mutex};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::event::{ArgVec, EventDescription, EventFlags};
use crate::key;
use crate::lifecycle::Lifecycle;

/// How a state-dump producer wants its pending requests serviced (`spec.md`
/// §3 "State-dump request handle").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The producer drains its own queue by calling [`StatedumpMachine::poll_pending`]
    /// / [`StatedumpMachine::run_pending`].
    Polling,
    /// A shared, process-singleton agent thread drains this handle's queue.
    AgentThread,
}

/// `extern "C" fn` invoked once per pending request with a pointer to the
/// request key, so the producer can drive its own `statedump_call[_variadic]`
/// sites for the duration of the callback (`spec.md` §4.E "Per-handle
/// pending-run").
pub type StatedumpFn = extern "C" fn(key: &u64);

struct Notification {
    key: u64,
}

struct HandleState {
    name: String,
    callback: StatedumpFn,
    mode: Mode,
    begin_event: EventDescription,
    end_event: EventDescription,
}

/// One registered state-dump producer.
#[derive(Clone)]
pub struct StatedumpHandle(Arc<HandleState>);

impl StatedumpHandle {
    /// The producer-supplied name, replayed as the synthetic `begin`/`end`
    /// bracket around each dump.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The mode this producer registered with.
    pub fn mode(&self) -> Mode {
        self.0.mode
    }

    /// Tracers attach normal callbacks here to observe the start of a replay.
    pub fn begin_event(&self) -> &EventDescription {
        &self.0.begin_event
    }

    /// Tracers attach normal callbacks here to observe the end of a replay.
    pub fn end_event(&self) -> &EventDescription {
        &self.0.end_event
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for StatedumpHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

bitflags! {
    /// The agent thread's atomic state word (`spec.md` §3 "Agent thread").
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct AgentFlags: u32 {
        /// Idle; nothing for the worker to do.
        const BLOCKED = 1 << 0;
        /// At least one handle has pending notifications.
        const HANDLE_REQUEST = 1 << 1;
        /// The worker should terminate.
        const EXIT = 1 << 2;
        /// A `fork()` prepare handler wants the worker quiesced.
        const PAUSE = 1 << 3;
        /// The worker has acknowledged `PAUSE` and is spinning.
        const PAUSE_ACK = 1 << 4;
    }
}

const PAUSE_SPIN_ITERS: u32 = 1000;

/// A wake gate pairing the atomic flags word with a condvar: the flags are
/// the source of truth (read lock-free from the pause busy-loop), the
/// `Mutex<()>` exists only to give the condvar somewhere to park against,
/// matching `spec.md`'s explicit split between condvar waits (registration,
/// idle) and busy-loop waits (pause/resume, to avoid condvar blocking while
/// locks are held across a fork).
struct Gate {
    flags: AtomicU32,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Gate {
    fn fresh() -> Arc<Self> {
        Arc::new(Self {
            flags: AtomicU32::new(AgentFlags::BLOCKED.bits()),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    fn signal(&self, bit: AgentFlags) {
        let _guard = self.lock.lock();
        self.flags.fetch_or(bit.bits(), Ordering::AcqRel);
        self.flags.fetch_and(!AgentFlags::BLOCKED.bits(), Ordering::AcqRel);
        self.cv.notify_all();
    }

    fn wait_until_runnable(&self) {
        let mut guard = self.lock.lock();
        while self.flags.load(Ordering::Acquire) == AgentFlags::BLOCKED.bits() {
            self.cv.wait(&mut guard);
        }
    }

    fn go_idle(&self) {
        self.flags.store(AgentFlags::BLOCKED.bits(), Ordering::Release);
    }

    fn snapshot(&self) -> AgentFlags {
        AgentFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
}

/// Agent-thread bookkeeping, guarded by `MachineInner::agent` (the *agent-thread
/// lock* of `spec.md` §5).
struct Agent {
    refcount: usize,
    thread: Option<JoinHandle<()>>,
    gate: Arc<Gate>,
}

impl Agent {
    fn new() -> Self {
        Self {
            refcount: 0,
            thread: None,
            gate: Gate::fresh(),
        }
    }

    fn spawn(&mut self, machine: StatedumpMachine) {
        let gate = self.gate.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("statedump-agent".into())
                .spawn(move || agent_main_loop(machine, gate))
                // spec.md §7: failure of pthread_create is a hard invariant.
                .expect("spawning the state-dump agent thread must succeed"),
        );
    }
}

struct StatedumpInner {
    handles: Vec<StatedumpHandle>,
    pending: HashMap<usize, VecDeque<Notification>>,
}

struct MachineInner {
    /// This state-dump-list domain is separate from the global default
    /// collector the callback tables publish through (`spec.md` §9 "Two RCU
    /// domains"), so a slow producer callback draining here can never stall
    /// event-registration grace periods on unrelated events.
    collector: epoch::Collector,
    published: epoch::Atomic<Vec<StatedumpHandle>>,
    /// The *state-dump lock* of `spec.md` §5.
    inner: Mutex<StatedumpInner>,
    waiter_cv: Condvar,
    /// The *agent-thread lock* of `spec.md` §5.
    agent: Mutex<Agent>,
    /// Set between a `before_fork` that actually paused the agent and the
    /// matching `after_fork_parent`/`after_fork_child` that releases it, so
    /// the two post-fork handlers know whether `before_fork` left the raw
    /// agent lock held (see `before_fork`'s doc comment).
    fork_lock_held: AtomicBool,
    lifecycle: Lifecycle,
}

/// Owns the state-dump handle list and drives replay (`spec.md` §4.E).
#[derive(Clone)]
pub struct StatedumpMachine(Arc<MachineInner>);

impl StatedumpMachine {
    pub(crate) fn new(lifecycle: Lifecycle) -> Self {
        Self(Arc::new(MachineInner {
            collector: epoch::Collector::new(),
            published: epoch::Atomic::null(),
            inner: Mutex::new(StatedumpInner {
                handles: Vec::new(),
                pending: HashMap::new(),
            }),
            waiter_cv: Condvar::new(),
            agent: Mutex::new(Agent::new()),
            fork_lock_held: AtomicBool::new(false),
            lifecycle,
        }))
    }

    fn republish(&self, handles: &[StatedumpHandle]) {
        let guard = self.0.collector.register().pin();
        let new_owned = epoch::Owned::new(handles.to_vec());
        let prev = self.0.published.swap(new_owned, Ordering::Release, &guard);
        if !prev.is_null() {
            // SAFETY: readers only ever observe `published` through a pinned
            // guard on this same collector; deferring destruction keeps this
            // array alive until every such reader has unpinned.
            unsafe { guard.defer_destroy(prev) };
        }
        guard.flush();
    }

    /// Registers a state-dump producer, then (per mode) either leaves an
    /// initial `MATCH_ALL`-keyed dump queued for the caller to drain later
    /// (polling mode), or runs it synchronously before returning
    /// (agent-thread mode, `spec.md` §4.E step 8).
    pub fn register(&self, name: impl Into<String>, callback: StatedumpFn, mode: Mode) -> Result<StatedumpHandle> {
        if self.0.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let handle = StatedumpHandle(Arc::new(HandleState {
            name: name.into(),
            callback,
            mode,
            begin_event: EventDescription::new(EventFlags::empty()),
            end_event: EventDescription::new(EventFlags::empty()),
        }));

        let mut agent_guard = if mode == Mode::AgentThread {
            Some(self.0.agent.lock())
        } else {
            None
        };

        {
            let mut inner = self.0.inner.lock();

            if let Some(agent) = agent_guard.as_mut() {
                if agent.refcount == 0 {
                    agent.spawn(self.clone());
                }
                agent.refcount += 1;
            }

            inner.handles.push(handle.clone());
            inner
                .pending
                .insert(handle.id(), VecDeque::from([Notification { key: key::MATCH_ALL }]));
            self.republish(&inner.handles);

            if let Some(agent) = agent_guard.as_mut() {
                agent.gate.signal(AgentFlags::HANDLE_REQUEST);
            }
        }
        drop(agent_guard);

        if mode == Mode::AgentThread {
            let mut inner = self.0.inner.lock();
            while inner.pending.get(&handle.id()).map_or(false, |q| !q.is_empty()) {
                self.0.waiter_cv.wait(&mut inner);
            }
        }

        log::debug!("state-dump handle '{}' registered (mode={:?})", handle.name(), mode);
        Ok(handle)
    }

    /// Unregisters a state-dump producer, discarding any queued
    /// notifications (`spec.md` §4.E "Unregistering").
    pub fn unregister(&self, handle: StatedumpHandle) -> Result<()> {
        if self.0.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let mut agent_guard = if handle.mode() == Mode::AgentThread {
            Some(self.0.agent.lock())
        } else {
            None
        };

        let mut join_needed = false;
        {
            let mut inner = self.0.inner.lock();
            inner.pending.remove(&handle.id());
            inner.handles.retain(|h| h.id() != handle.id());
            self.republish(&inner.handles);

            if let Some(agent) = agent_guard.as_mut() {
                agent.refcount -= 1;
                if agent.refcount == 0 {
                    agent.gate.signal(AgentFlags::EXIT);
                    join_needed = true;
                }
            }
        }

        if join_needed {
            if let Some(agent) = agent_guard.as_mut() {
                if let Some(thread) = agent.thread.take() {
                    thread.join().expect("state-dump agent thread must not panic");
                }
            }
        }
        drop(agent_guard);

        log::debug!("state-dump handle '{}' unregistered", handle.name());
        Ok(())
    }

    /// Reports whether `handle`'s queue is non-empty. Always `false` for
    /// agent-thread handles.
    pub fn poll_pending(&self, handle: &StatedumpHandle) -> bool {
        if handle.mode() == Mode::AgentThread {
            return false;
        }
        let inner = self.0.inner.lock();
        inner.pending.get(&handle.id()).map_or(false, |q| !q.is_empty())
    }

    /// Runs `handle`'s pending-run synchronously. `Err(Error::Inval)` for
    /// agent-thread handles, which are drained by the agent thread instead.
    pub fn run_pending(&self, handle: &StatedumpHandle) -> Result<()> {
        if handle.mode() == Mode::AgentThread {
            return Err(Error::Inval);
        }
        self.run_pending_for(handle);
        Ok(())
    }

    fn run_pending_for(&self, handle: &StatedumpHandle) {
        let local: VecDeque<Notification> = {
            let mut inner = self.0.inner.lock();
            inner.pending.get_mut(&handle.id()).map(std::mem::take).unwrap_or_default()
        };

        for notification in &local {
            let caller_addr = dispatch::capture_caller_addr();
            dispatch::dispatch_plain(handle.begin_event(), ArgVec::empty(), notification.key, caller_addr);
            (handle.0.callback)(&notification.key);
            dispatch::dispatch_plain(handle.end_event(), ArgVec::empty(), notification.key, caller_addr);
        }

        if handle.mode() == Mode::AgentThread {
            self.0.waiter_cv.notify_all();
        }
    }

    /// Queues a notification with the given key on every registered handle
    /// (`spec.md` §4.E "Request and cancel"). Rejects `MATCH_ALL`, which is
    /// reserved for the implicit initial dump.
    ///
    /// Takes the state-dump lock exactly once; the reference source takes it
    /// twice in a row with no intervening release, which this crate does not
    /// replicate (`spec.md` §9 open question).
    pub fn request(&self, request_key: u64) -> Result<()> {
        if request_key == key::MATCH_ALL {
            return Err(Error::Inval);
        }
        if self.0.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let any_agent_thread = {
            let mut inner = self.0.inner.lock();
            for queue in inner.pending.values_mut() {
                queue.push_back(Notification { key: request_key });
            }
            inner.handles.iter().any(|h| h.mode() == Mode::AgentThread)
        };

        if any_agent_thread {
            self.0.agent.lock().gate.signal(AgentFlags::HANDLE_REQUEST);
        }
        Ok(())
    }

    /// Removes every queued notification with the given key from every
    /// handle. Rejects `MATCH_ALL`.
    pub fn request_cancel(&self, request_key: u64) -> Result<()> {
        if request_key == key::MATCH_ALL {
            return Err(Error::Inval);
        }
        if self.0.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let mut inner = self.0.inner.lock();
        for queue in inner.pending.values_mut() {
            queue.retain(|n| n.key != request_key);
        }
        Ok(())
    }

    /// Signals the agent thread (if any) to exit and joins it. Called from
    /// [`crate::exit`].
    pub(crate) fn shutdown(&self) {
        let mut agent = self.0.agent.lock();
        if agent.refcount > 0 {
            agent.gate.signal(AgentFlags::EXIT);
            agent.refcount = 0;
            if let Some(thread) = agent.thread.take() {
                drop(agent);
                let _ = thread.join();
            }
        }
    }

    /// `pthread_atfork` prepare handler (`spec.md` §4.E "Fork safety").
    ///
    /// If an agent thread exists, pauses it and then *leaks* the lock guard
    /// with [`std::mem::forget`] instead of dropping it: `pthread_atfork`'s
    /// prepare/parent/child triad exists precisely so a lock can be
    /// acquired here and released in whichever of
    /// `after_fork_parent`/`after_fork_child` the same thread runs next,
    /// after the real `fork()` call (made by whatever code in the process
    /// called it) returns. A normal `MutexGuard` cannot express "acquired in
    /// this function, released in a different one", so the release side
    /// uses [`parking_lot::Mutex::force_unlock`], parking_lot's documented
    /// escape hatch for exactly this pattern.
    pub(crate) fn before_fork(&self) {
        let guard = self.0.agent.lock();
        if guard.refcount == 0 {
            return;
        }

        self.0.fork_lock_held.store(true, Ordering::Release);
        guard.gate.signal(AgentFlags::PAUSE);

        let mut spins = 0u32;
        while !guard.gate.snapshot().contains(AgentFlags::PAUSE_ACK) {
            if spins < PAUSE_SPIN_ITERS {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        std::mem::forget(guard);
    }

    /// `pthread_atfork` parent handler.
    pub(crate) fn after_fork_parent(&self) {
        if !self.0.fork_lock_held.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: `before_fork` locked `self.0.agent` and forgot the guard
        // instead of dropping it, so the mutex is still locked and
        // `data_ptr` may be dereferenced exclusively; `force_unlock` is the
        // matching release.
        unsafe {
            let agent = &*self.0.agent.data_ptr();
            agent.gate.flags.fetch_and(
                !(AgentFlags::PAUSE.bits() | AgentFlags::PAUSE_ACK.bits()),
                Ordering::AcqRel,
            );
            self.0.agent.force_unlock();
        }
    }

    /// `pthread_atfork` child handler.
    ///
    /// The forked child has exactly one thread (the one that called
    /// `fork()`); any previously-running agent thread simply does not exist
    /// here. If the handle refcount is nonzero, a fresh agent thread with
    /// fresh signaling state is spawned so the child can keep servicing
    /// state-dump requests (`spec.md` §8 property 10, "Fork survivorship").
    pub(crate) fn after_fork_child(&self) {
        if !self.0.fork_lock_held.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: see `after_fork_parent`.
        unsafe {
            let agent = &mut *self.0.agent.data_ptr();
            if agent.refcount > 0 {
                agent.thread = None;
                agent.gate = Gate::fresh();
                agent.spawn(self.clone());
            }
            self.0.agent.force_unlock();
        }
    }
}

fn agent_main_loop(machine: StatedumpMachine, gate: Arc<Gate>) {
    loop {
        gate.wait_until_runnable();
        let snapshot = gate.snapshot();

        if snapshot.contains(AgentFlags::EXIT) {
            return;
        }

        if snapshot.contains(AgentFlags::PAUSE) {
            gate.flags.fetch_or(AgentFlags::PAUSE_ACK.bits(), Ordering::AcqRel);
            let mut spins = 0u32;
            while gate.snapshot().contains(AgentFlags::PAUSE) {
                if spins < PAUSE_SPIN_ITERS {
                    std::hint::spin_loop();
                    spins += 1;
                } else {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            gate.flags.fetch_and(!AgentFlags::PAUSE_ACK.bits(), Ordering::AcqRel);
            continue;
        }

        gate.flags.fetch_and(!AgentFlags::HANDLE_REQUEST.bits(), Ordering::AcqRel);

        {
            let guard = machine.0.collector.register().pin();
            let shared = machine.0.published.load(Ordering::Acquire, &guard);
            let slice: &[StatedumpHandle] = unsafe { shared.as_ref() }.map(Vec::as_slice).unwrap_or(&[]);
            for handle in slice {
                machine.run_pending_for(handle);
            }
        }

        gate.go_idle();
    }
}
