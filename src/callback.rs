// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch as epoch;

use crate::error::{Error, Result};
use crate::event::{ArgVec, EventDescription, PrivPtr, VarStruct};

/// Event state format this crate implements. Checked on every dispatch
/// (`spec.md` §3, §4.D step 3): a table built by a forward-incompatible
/// crate version must abort dispatch rather than be silently misread.
pub const CURRENT_VERSION: u8 = 0;

/// `extern "C" fn` signature for a non-variadic callback.
pub type PlainFn =
    extern "C" fn(desc: &EventDescription, args: ArgVec<'_>, priv_data: PrivPtr, key: u64, caller_addr: usize);

/// `extern "C" fn` signature for a variadic callback.
pub type VariadicFn = extern "C" fn(
    desc: &EventDescription,
    args: ArgVec<'_>,
    var: VarStruct<'_>,
    priv_data: PrivPtr,
    key: u64,
    caller_addr: usize,
);

/// One of the two callback function shapes, tagged by the event's
/// `VARIADIC` flag. Rust's function-pointer types are never null, so the
/// "null function pointer is invalid" check from `spec.md` §4.C step 1 is
/// enforced by the type system rather than at runtime (see DESIGN.md).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CallbackFn {
    /// A plain (non-variadic) callback.
    Plain(PlainFn),
    /// A variadic callback.
    Variadic(VariadicFn),
}

impl CallbackFn {
    fn is_variadic(&self) -> bool {
        matches!(self, CallbackFn::Variadic(_))
    }
}

/// One attached callback: function, opaque private pointer, and dispatch
/// key. Entries are unique on this whole tuple (`spec.md` §3 invariant).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallbackEntry {
    func: CallbackFn,
    priv_data: PrivPtr,
    key: u64,
}

impl CallbackEntry {
    /// Creates a plain callback entry.
    pub fn plain(func: PlainFn, priv_data: PrivPtr, key: u64) -> Self {
        Self {
            func: CallbackFn::Plain(func),
            priv_data,
            key,
        }
    }

    /// Creates a variadic callback entry.
    pub fn variadic(func: VariadicFn, priv_data: PrivPtr, key: u64) -> Self {
        Self {
            func: CallbackFn::Variadic(func),
            priv_data,
            key,
        }
    }

    /// This entry's dispatch key.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub(crate) fn is_variadic(&self) -> bool {
        self.func.is_variadic()
    }

    #[inline]
    pub(crate) fn invoke_plain(&self, desc: &EventDescription, args: ArgVec<'_>, caller_addr: usize) {
        match self.func {
            CallbackFn::Plain(f) => f(desc, args, self.priv_data, self.key, caller_addr),
            CallbackFn::Variadic(_) => {
                unreachable!("dispatch filtered by EventFlags::VARIADIC before invoking")
            }
        }
    }

    #[inline]
    pub(crate) fn invoke_variadic(
        &self,
        desc: &EventDescription,
        args: ArgVec<'_>,
        var: VarStruct<'_>,
        caller_addr: usize,
    ) {
        match self.func {
            CallbackFn::Variadic(f) => f(desc, args, var, self.priv_data, self.key, caller_addr),
            CallbackFn::Plain(_) => {
                unreachable!("dispatch filtered by EventFlags::VARIADIC before invoking")
            }
        }
    }
}

/// External (kernel-side) bits in the top byte of an [`CallbackTable::enabled`]
/// word. Reserved by `spec.md` §3/§6 for out-of-scope integrations; the core
/// only reads them on the fast path and never clears the private refcount
/// bits they occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservedBit {
    /// Bit 7 of the top byte: `user_events` kernel hook.
    UserEvent,
    /// Bit 6 of the top byte: `ptrace` hook.
    Ptrace,
}

const ENABLED_BITS: u32 = u64::BITS;
const USER_EVENT_BIT: u64 = 1 << (ENABLED_BITS - 1);
const PTRACE_BIT: u64 = 1 << (ENABLED_BITS - 2);

/// Holds the RCU-published callback array for one event, plus its
/// enabled-bitmask (`spec.md` §3 "Event state", §4.C).
pub struct CallbackTable {
    version: u8,
    entries: epoch::Atomic<Vec<CallbackEntry>>,
    nr_callbacks: AtomicU32,
    enabled: AtomicU64,
}

impl CallbackTable {
    /// Creates an empty, version-`CURRENT_VERSION` table.
    pub fn new() -> Self {
        Self::with_version(CURRENT_VERSION)
    }

    /// Creates a table tagged with an arbitrary version. Used by tests to
    /// exercise the forward-incompatible-version abort path (`spec.md` §8
    /// scenario S6); production code should only ever use [`Self::new`].
    pub(crate) fn with_version(version: u8) -> Self {
        Self {
            version,
            entries: epoch::Atomic::null(),
            nr_callbacks: AtomicU32::new(0),
            enabled: AtomicU64::new(0),
        }
    }

    pub(crate) fn version(&self) -> u8 {
        self.version
    }

    /// True iff any bit of `enabled` (private or reserved) is set.
    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) != 0
    }

    #[inline(always)]
    pub(crate) fn enabled_word(&self) -> u64 {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Number of attached private callbacks.
    pub fn nr_callbacks(&self) -> u32 {
        self.nr_callbacks.load(Ordering::Relaxed)
    }

    /// Sets or clears a reserved (kernel-external) enable bit. Exposed for
    /// the stub hooks in `dispatch.rs` and for tests; the high byte is never
    /// touched by `register`/`unregister` (`spec.md` §5 ordering guarantee).
    pub(crate) fn set_reserved_bit(&self, bit: ReservedBit, on: bool) {
        let mask = match bit {
            ReservedBit::UserEvent => USER_EVENT_BIT,
            ReservedBit::Ptrace => PTRACE_BIT,
        };
        if on {
            self.enabled.fetch_or(mask, Ordering::Relaxed);
        } else {
            self.enabled.fetch_and(!mask, Ordering::Relaxed);
        }
    }

    /// True iff the given reserved (kernel-external) bit is currently set.
    #[inline(always)]
    pub(crate) fn is_reserved_bit_set(&self, bit: ReservedBit) -> bool {
        let mask = match bit {
            ReservedBit::UserEvent => USER_EVENT_BIT,
            ReservedBit::Ptrace => PTRACE_BIT,
        };
        self.enabled_word() & mask != 0
    }

    /// Registers a callback (copy-on-write, `spec.md` §4.C "Register").
    ///
    /// Callers must hold the registry's event lock across this call (see
    /// `registry::EventRegistry::event_lock`): the `epoch::pin()` below
    /// protects concurrent *readers* of `entries` against this call's
    /// publish, but does nothing to serialize this call against a second,
    /// concurrent writer — two unsynchronized callers could both load the
    /// same old slice, both pass the duplicate check, and both `swap`, with
    /// the second swap silently discarding the first writer's update and
    /// `nr_callbacks` under-counting. `callback_register`/
    /// `callback_variadic_register` in `lib.rs` are this type's only public
    /// entry points and take the event lock before calling here.
    pub(crate) fn register(&self, variadic_event: bool, entry: CallbackEntry) -> Result<()> {
        if entry.is_variadic() != variadic_event {
            return Err(Error::Inval);
        }

        let nr = self.nr_callbacks.load(Ordering::Relaxed);
        if nr == u32::MAX {
            return Err(Error::Inval);
        }

        let guard = epoch::pin();
        let old_shared = self.entries.load(Ordering::Acquire, &guard);
        let old_slice: &[CallbackEntry] = unsafe { old_shared.as_ref() }
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        if old_slice.iter().any(|e| *e == entry) {
            return Err(Error::Exist);
        }

        let mut new_vec = Vec::with_capacity(old_slice.len() + 1);
        new_vec.extend_from_slice(old_slice);
        new_vec.push(entry);

        let new_owned = epoch::Owned::new(new_vec);
        let prev = self.entries.swap(new_owned, Ordering::Release, &guard);
        if !prev.is_null() {
            // SAFETY: `prev` was just replaced; no new reader can observe it,
            // and `guard` is pinned so in-flight readers keep it alive until
            // they unpin. This is this crate's grace-period wait.
            unsafe { guard.defer_destroy(prev) };
        }
        guard.flush();

        self.nr_callbacks.store(nr + 1, Ordering::Relaxed);
        if nr == 0 {
            self.enabled.fetch_add(1, Ordering::Relaxed);
        }
        log::debug!("callback registered, key={:#x}, nr_callbacks={}", entry.key, nr + 1);
        Ok(())
    }

    /// Unregisters a callback by `(function, priv, key)` tuple (`spec.md`
    /// §4.C "Unregister"). Same locking contract as [`Self::register`]:
    /// callers must hold the event lock.
    pub(crate) fn unregister(&self, variadic_event: bool, probe: CallbackEntry) -> Result<()> {
        if probe.is_variadic() != variadic_event {
            return Err(Error::Inval);
        }

        let guard = epoch::pin();
        let old_shared = self.entries.load(Ordering::Acquire, &guard);
        let old_slice: &[CallbackEntry] = unsafe { old_shared.as_ref() }
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let idx = old_slice
            .iter()
            .position(|e| *e == probe)
            .ok_or(Error::NoEnt)?;

        let mut new_vec = Vec::with_capacity(old_slice.len() - 1);
        new_vec.extend_from_slice(&old_slice[..idx]);
        new_vec.extend_from_slice(&old_slice[idx + 1..]);

        let new_owned = epoch::Owned::new(new_vec);
        let prev = self.entries.swap(new_owned, Ordering::Release, &guard);
        debug_assert!(!prev.is_null());
        // SAFETY: see `register`.
        unsafe { guard.defer_destroy(prev) };
        guard.flush();

        let nr = self.nr_callbacks.load(Ordering::Relaxed);
        self.nr_callbacks.store(nr - 1, Ordering::Relaxed);
        if nr == 1 {
            self.enabled.fetch_sub(1, Ordering::Relaxed);
        }
        log::debug!("callback unregistered, key={:#x}, nr_callbacks={}", probe.key, nr - 1);
        Ok(())
    }

    /// Clears this table without waiting for a grace period: used by
    /// `unregister_events`, where the owning batch is already contractually
    /// unreachable (`spec.md` §4.B).
    pub(crate) fn clear_without_grace_period(&self) {
        let guard = epoch::pin();
        let prev = self
            .entries
            .swap(epoch::Shared::null(), Ordering::Release, &guard);
        if !prev.is_null() {
            // SAFETY: the batch is already removed from the registry by the
            // caller, so no reader can be in the middle of a dispatch that
            // would observe `prev`; freeing immediately is sound.
            unsafe { drop(prev.into_owned()) };
        }
        let nr = self.nr_callbacks.swap(0, Ordering::Relaxed);
        if nr > 0 {
            self.enabled.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Runs `f` with the currently published callback slice, inside one RCU
    /// read-side section (`spec.md` §4.D step 6).
    #[inline]
    pub(crate) fn with_snapshot<R>(&self, f: impl FnOnce(&[CallbackEntry]) -> R) -> R {
        let guard = epoch::pin();
        let shared = self.entries.load(Ordering::Acquire, &guard);
        let slice: &[CallbackEntry] = unsafe { shared.as_ref() }
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        f(slice)
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackTable {
    fn drop(&mut self) {
        // No outstanding readers can exist once the table itself is being
        // dropped, so this is always safe to free immediately.
        let guard = epoch::pin();
        let prev = self
            .entries
            .swap(epoch::Shared::null(), Ordering::Relaxed, &guard);
        if !prev.is_null() {
            unsafe { drop(prev.into_owned()) };
        }
    }
}

/// Shared ownership wrapper around a [`CallbackTable`], so both an
/// [`EventDescription`] and the registry's bookkeeping can hold a live
/// reference to the same table.
#[derive(Clone)]
pub struct CallbackTableHandle(Arc<CallbackTable>);

impl CallbackTableHandle {
    /// Allocates a new, empty table.
    pub fn new() -> Self {
        Self(Arc::new(CallbackTable::new()))
    }

    pub(crate) fn with_version(version: u8) -> Self {
        Self(Arc::new(CallbackTable::with_version(version)))
    }

    pub(crate) fn table(&self) -> &CallbackTable {
        &self.0
    }
}

impl Default for CallbackTableHandle {
    fn default() -> Self {
        Self::new()
    }
}
