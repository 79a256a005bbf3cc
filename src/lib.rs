// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Dispatch, registration, and state-dump core for a user-space dynamic
//! instrumentation library.
//!
//! An application declares instrumentation events (as an opaque
//! [`EventDescription`] built by some external type-system layer — out of
//! scope for this crate) and calls into them with [`call`]/[`call_variadic`].
//! One or more tracers attach callbacks to those events
//! ([`callback_register`] and friends), subscribe to registration
//! notifications ([`event_notification_register`]), and request that a
//! producer replay its current state as a burst of synthetic calls (the
//! `statedump_*` family).
//!
//! This crate implements exactly the three subsystems named in its
//! `spec.md`'s PURPOSE & SCOPE: the [`dispatch`] fast path, the
//! [`registry`] that owns event batches and tracer handles, and the
//! [`statedump`] request/replay machine. The event type system, static
//! declaration macros, and the concrete kernel `user_events`/`ptrace`
//! integrations are explicitly out of scope and represented only by opaque
//! pass-through types and stub hooks.

mod callback;
mod dispatch;
mod error;
mod event;
mod key;
mod lifecycle;
mod registry;
mod statedump;

use std::sync::OnceLock;

pub use callback::{CallbackFn, PlainFn, VariadicFn, CURRENT_VERSION};
pub use error::{Error, Result};
pub use event::{ArgVec, EventDescription, EventFlags, PrivPtr, VarStruct};
pub use key::{FIRST_DYNAMIC_KEY, MATCH_ALL, PTRACE, USER_EVENT};
pub use registry::{EventBatchHandle, NotifyFn, NotifyReason, TracerHandle};
pub use statedump::{Mode as StatedumpMode, StatedumpFn, StatedumpHandle};

use callback::CallbackEntry;
use lifecycle::Lifecycle;
use registry::EventRegistry;
use statedump::StatedumpMachine;
use std::sync::Arc;

struct Core {
    registry: EventRegistry,
    keys: key::KeyAllocator,
    statedump: StatedumpMachine,
    lifecycle: Lifecycle,
}

static CORE: OnceLock<Core> = OnceLock::new();

/// Lazily builds the process-singleton core, installing the at-fork
/// handlers exactly once (`spec.md` §5 "Lifecycle"). Every public entry
/// point routes through this, matching the spec's "called from the first
/// register or dispatch" contract; [`init`] exists for callers that want to
/// pay that cost up front.
fn core() -> &'static Core {
    CORE.get_or_init(|| {
        let lifecycle = Lifecycle::new();
        let core = Core {
            registry: EventRegistry::new(lifecycle.clone()),
            keys: key::KeyAllocator::new(),
            statedump: StatedumpMachine::new(lifecycle.clone()),
            lifecycle,
        };
        install_atfork_handlers();
        core
    })
}

#[cfg(unix)]
fn install_atfork_handlers() {
    extern "C" fn prepare() {
        if let Some(core) = CORE.get() {
            core.statedump.before_fork();
        }
    }
    extern "C" fn parent() {
        if let Some(core) = CORE.get() {
            core.statedump.after_fork_parent();
        }
    }
    extern "C" fn child() {
        if let Some(core) = CORE.get() {
            core.statedump.after_fork_child();
        }
    }

    // SAFETY: `prepare`/`parent`/`child` only ever touch `CORE`'s
    // state-dump machine through its own locks; registering them here, once,
    // inside `CORE`'s own initializer, satisfies `pthread_atfork`'s
    // requirement that handlers be installed before any thread the process
    // cares about protecting might fork.
    unsafe {
        libc::pthread_atfork(Some(prepare), Some(parent), Some(child));
    }
}

#[cfg(not(unix))]
fn install_atfork_handlers() {}

/// Explicitly initializes the library. Lazy and idempotent: every other
/// public function calls this itself on first use, so most callers never
/// need it.
pub fn init() {
    core();
}

/// Shuts the library down: unregisters every event batch (replaying
/// `REMOVE_EVENTS` to every tracer) and stops the state-dump agent thread if
/// one is running. After this call, every registration entry point returns
/// [`Error::Exiting`] and the dispatch fast path becomes a silent no-op
/// (`spec.md` §5 "Lifecycle").
pub fn exit() {
    let core = core();
    core.lifecycle.mark_exiting();
    core.registry.unregister_all();
    core.statedump.shutdown();
}

// --- Producer dispatch (`spec.md` §6) --------------------------------------

/// Calls a non-variadic event with [`MATCH_ALL`], invoking every attached
/// callback.
#[track_caller]
pub fn call(desc: &EventDescription, args: ArgVec<'_>) {
    let core = core();
    if core.lifecycle.is_exiting() {
        return;
    }
    let caller_addr = dispatch::capture_caller_addr();
    dispatch::dispatch_plain(desc, args, key::MATCH_ALL, caller_addr);
}

/// Variadic counterpart of [`call`].
#[track_caller]
pub fn call_variadic(desc: &EventDescription, args: ArgVec<'_>, var: VarStruct<'_>) {
    let core = core();
    if core.lifecycle.is_exiting() {
        return;
    }
    let caller_addr = dispatch::capture_caller_addr();
    dispatch::dispatch_variadic(desc, args, var, key::MATCH_ALL, caller_addr);
}

/// Calls a non-variadic event with a state-dump request key, as provided to
/// a [`StatedumpFn`] callback.
#[track_caller]
pub fn statedump_call(desc: &EventDescription, args: ArgVec<'_>, dump_key: &u64) {
    let core = core();
    if core.lifecycle.is_exiting() {
        return;
    }
    let caller_addr = dispatch::capture_caller_addr();
    dispatch::dispatch_plain(desc, args, *dump_key, caller_addr);
}

/// Variadic counterpart of [`statedump_call`].
#[track_caller]
pub fn statedump_call_variadic(desc: &EventDescription, args: ArgVec<'_>, var: VarStruct<'_>, dump_key: &u64) {
    let core = core();
    if core.lifecycle.is_exiting() {
        return;
    }
    let caller_addr = dispatch::capture_caller_addr();
    dispatch::dispatch_variadic(desc, args, var, *dump_key, caller_addr);
}

// --- Event batch registration (`spec.md` §6) -------------------------------

/// Registers a batch of events, replaying `INSERT_EVENTS` to every
/// currently-registered tracer.
pub fn register_events(events: Vec<Arc<EventDescription>>) -> Result<EventBatchHandle> {
    core().registry.register_events(events)
}

/// Unregisters a previously-registered batch.
pub fn unregister_events(handle: EventBatchHandle) -> Result<()> {
    core().registry.unregister_events(handle)
}

// --- Tracer callback attach/detach (`spec.md` §6) --------------------------

/// Attaches a non-variadic callback to `desc`.
///
/// Holds the registry's event lock across the whole load-copy-publish
/// sequence (`spec.md` §4.C "Register (under event lock)"): `CallbackTable`'s
/// own RCU publication only protects concurrent *readers* (dispatch), not
/// concurrent writers, so two calls racing on the same `desc` would otherwise
/// lose an update.
pub fn callback_register(desc: &EventDescription, func: PlainFn, priv_data: PrivPtr, dispatch_key: u64) -> Result<()> {
    let core = core();
    if core.lifecycle.is_exiting() {
        return Err(Error::Exiting);
    }
    let _event_lock = core.registry.event_lock();
    desc.table().register(false, CallbackEntry::plain(func, priv_data, dispatch_key))
}

/// Detaches a previously-attached non-variadic callback. See
/// [`callback_register`] for why this holds the event lock.
pub fn callback_unregister(
    desc: &EventDescription,
    func: PlainFn,
    priv_data: PrivPtr,
    dispatch_key: u64,
) -> Result<()> {
    let core = core();
    if core.lifecycle.is_exiting() {
        return Err(Error::Exiting);
    }
    let _event_lock = core.registry.event_lock();
    desc.table().unregister(false, CallbackEntry::plain(func, priv_data, dispatch_key))
}

/// Attaches a variadic callback to `desc`. See [`callback_register`] for why
/// this holds the event lock.
pub fn callback_variadic_register(
    desc: &EventDescription,
    func: VariadicFn,
    priv_data: PrivPtr,
    dispatch_key: u64,
) -> Result<()> {
    let core = core();
    if core.lifecycle.is_exiting() {
        return Err(Error::Exiting);
    }
    let _event_lock = core.registry.event_lock();
    desc.table()
        .register(true, CallbackEntry::variadic(func, priv_data, dispatch_key))
}

/// Detaches a previously-attached variadic callback. See
/// [`callback_register`] for why this holds the event lock.
pub fn callback_variadic_unregister(
    desc: &EventDescription,
    func: VariadicFn,
    priv_data: PrivPtr,
    dispatch_key: u64,
) -> Result<()> {
    let core = core();
    if core.lifecycle.is_exiting() {
        return Err(Error::Exiting);
    }
    let _event_lock = core.registry.event_lock();
    desc.table()
        .unregister(true, CallbackEntry::variadic(func, priv_data, dispatch_key))
}

// --- Tracer notification subscription (`spec.md` §6) -----------------------

/// Subscribes to `INSERT_EVENTS`/`REMOVE_EVENTS` notifications, replayed
/// immediately for every already-registered batch.
pub fn event_notification_register(callback: NotifyFn, priv_data: PrivPtr) -> Result<TracerHandle> {
    core().registry.register_tracer(callback, priv_data)
}

/// Unsubscribes a tracer notification handle.
pub fn event_notification_unregister(handle: TracerHandle) -> Result<()> {
    core().registry.unregister_tracer(handle)
}

// --- Keys (`spec.md` §6) ----------------------------------------------------

/// Issues the next dynamically-allocated tracer key.
pub fn request_key() -> Result<u64> {
    core().keys.request_key()
}

// --- State-dump producer (`spec.md` §6) ------------------------------------

/// Registers a state-dump producer under `name`, servicing pending requests
/// per `mode`.
pub fn statedump_request_notification_register(
    name: impl Into<String>,
    callback: StatedumpFn,
    mode: StatedumpMode,
) -> Result<StatedumpHandle> {
    core().statedump.register(name, callback, mode)
}

/// Unregisters a state-dump producer.
pub fn statedump_request_notification_unregister(handle: StatedumpHandle) -> Result<()> {
    core().statedump.unregister(handle)
}

/// Reports whether `handle` has a pending dump request. Always `false` for
/// agent-thread handles.
pub fn statedump_poll_pending_requests(handle: &StatedumpHandle) -> bool {
    core().statedump.poll_pending(handle)
}

/// Synchronously drains `handle`'s pending requests.
/// [`Error::Inval`] for agent-thread handles.
pub fn statedump_run_pending_requests(handle: &StatedumpHandle) -> Result<()> {
    core().statedump.run_pending(handle)
}

// --- State-dump tracer (`spec.md` §6) --------------------------------------

/// Requests a state-dump keyed by `dump_key` from every registered
/// producer. Rejects [`MATCH_ALL`].
pub fn statedump_request(dump_key: u64) -> Result<()> {
    core().statedump.request(dump_key)
}

/// Cancels every pending request keyed by `dump_key` that has not yet run.
/// Rejects [`MATCH_ALL`].
pub fn statedump_request_cancel(dump_key: u64) -> Result<()> {
    core().statedump.request_cancel(dump_key)
}
