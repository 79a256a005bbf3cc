// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::{Error, Result};
use crate::event::{EventDescription, PrivPtr};
use crate::lifecycle::Lifecycle;

/// Reason passed to a tracer's notification callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyReason {
    /// One or more events just became reachable (a batch was registered, or
    /// this tracer itself just registered and is being replayed against
    /// every already-registered batch).
    InsertEvents,
    /// One or more events are about to become unreachable.
    RemoveEvents,
}

/// `extern "C" fn` signature for an event-registration notification
/// callback.
pub type NotifyFn = extern "C" fn(reason: NotifyReason, event: &EventDescription, priv_data: PrivPtr);

/// Returned by [`EventRegistry::register_events`]; pass to
/// [`EventRegistry::unregister_events`] to undo the registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventBatchHandle(u64);

/// Returned by [`EventRegistry::register_tracer`]; pass to
/// [`EventRegistry::unregister_tracer`] to undo the registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TracerHandle(u64);

struct Batch {
    id: u64,
    events: Vec<Arc<EventDescription>>,
}

#[derive(Clone, Copy)]
struct TracerEntry {
    id: u64,
    notify: NotifyFn,
    priv_data: PrivPtr,
}

pub(crate) struct Inner {
    next_batch_id: u64,
    next_tracer_id: u64,
    batches: Vec<Batch>,
    tracers: Vec<TracerEntry>,
}

/// Owns the list of registered event batches and the list of tracer
/// notification handles; fans out insert/remove notifications (`spec.md`
/// §4.B).
///
/// Guarded by one reentrant lock (`spec.md`'s "event lock"): a tracer's
/// notification callback may legally call back into `register_tracer`,
/// `unregister_tracer`, `register_events`, or `unregister_events` from
/// inside its own notification, which a plain mutex would deadlock on.
/// Mutation of the `Inner` lists is always a short `RefCell` borrow taken
/// and dropped *before* any notification callback runs, so a reentrant call
/// never collides with an in-progress borrow from an outer frame.
pub struct EventRegistry {
    inner: ReentrantMutex<RefCell<Inner>>,
    lifecycle: Lifecycle,
}

impl EventRegistry {
    pub(crate) fn new(lifecycle: Lifecycle) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                next_batch_id: 0,
                next_tracer_id: 0,
                batches: Vec::new(),
                tracers: Vec::new(),
            })),
            lifecycle,
        }
    }

    /// Acquires the event lock without otherwise touching the list it also
    /// guards.
    ///
    /// `spec.md` §4.C requires each event's callback `register`/`unregister`
    /// to run "under the event lock" — the same recursive mutex §4.B uses to
    /// guard the batch/tracer lists — so that concurrent writers on the same
    /// (or different) events' callback tables serialize against each other
    /// instead of racing the load-copy-publish-grace-free sequence. Reentrant
    /// because a tracer's notification callback may legally call back into
    /// `callback_register`/`callback_unregister` while this thread already
    /// holds the lock.
    pub(crate) fn event_lock(&self) -> ReentrantMutexGuard<'_, RefCell<Inner>> {
        self.inner.lock()
    }

    /// Registers a batch of events. Every already-registered tracer is
    /// replayed `InsertEvents` for each event in the batch before this call
    /// returns.
    pub fn register_events(&self, events: Vec<Arc<EventDescription>>) -> Result<EventBatchHandle> {
        let guard = self.inner.lock();
        if self.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let (id, tracers) = {
            let mut inner = guard.borrow_mut();
            let id = inner.next_batch_id;
            inner.next_batch_id += 1;
            inner.batches.push(Batch {
                id,
                events: events.clone(),
            });
            (id, inner.tracers.clone())
        };

        for tracer in &tracers {
            for event in &events {
                (tracer.notify)(NotifyReason::InsertEvents, event, tracer.priv_data);
            }
        }

        log::debug!("registered event batch {id} with {} events", events.len());
        Ok(EventBatchHandle(id))
    }

    /// Unregisters a previously-registered batch. Every tracer is replayed
    /// `RemoveEvents` first; each event's callback table is then cleared
    /// without waiting for a grace period, since the batch is contractually
    /// unreachable by the time this returns.
    pub fn unregister_events(&self, handle: EventBatchHandle) -> Result<()> {
        let guard = self.inner.lock();
        if self.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let (removed, tracers) = {
            let mut inner = guard.borrow_mut();
            let pos = inner
                .batches
                .iter()
                .position(|b| b.id == handle.0)
                .ok_or(Error::NoEnt)?;
            let batch = inner.batches.remove(pos);
            (batch.events, inner.tracers.clone())
        };

        for tracer in &tracers {
            for event in &removed {
                (tracer.notify)(NotifyReason::RemoveEvents, event, tracer.priv_data);
            }
        }

        for event in &removed {
            event.table().clear_without_grace_period();
        }

        log::debug!("unregistered event batch {}", handle.0);
        Ok(())
    }

    /// Registers a tracer notification callback, then replays
    /// `InsertEvents` for every currently-registered batch.
    pub fn register_tracer(&self, notify: NotifyFn, priv_data: PrivPtr) -> Result<TracerHandle> {
        let guard = self.inner.lock();
        if self.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let (id, batches) = {
            let mut inner = guard.borrow_mut();
            let id = inner.next_tracer_id;
            inner.next_tracer_id += 1;
            inner.tracers.push(TracerEntry {
                id,
                notify,
                priv_data,
            });
            let batches: Vec<Vec<Arc<EventDescription>>> =
                inner.batches.iter().map(|b| b.events.clone()).collect();
            (id, batches)
        };

        for events in &batches {
            for event in events {
                notify(NotifyReason::InsertEvents, event, priv_data);
            }
        }

        Ok(TracerHandle(id))
    }

    /// Unregisters every currently-registered batch, replaying
    /// `RemoveEvents` to every tracer first. Used by [`crate::exit`]; unlike
    /// [`Self::unregister_events`] this takes no handle and cannot fail.
    pub(crate) fn unregister_all(&self) {
        let guard = self.inner.lock();

        let (removed, tracers) = {
            let mut inner = guard.borrow_mut();
            let removed: Vec<Arc<EventDescription>> = inner.batches.drain(..).flat_map(|b| b.events).collect();
            (removed, inner.tracers.clone())
        };

        for tracer in &tracers {
            for event in &removed {
                (tracer.notify)(NotifyReason::RemoveEvents, event, tracer.priv_data);
            }
        }

        for event in &removed {
            event.table().clear_without_grace_period();
        }
    }

    /// Unregisters a tracer, first replaying `RemoveEvents` for every
    /// currently-registered batch.
    pub fn unregister_tracer(&self, handle: TracerHandle) -> Result<()> {
        let guard = self.inner.lock();
        if self.lifecycle.is_exiting() {
            return Err(Error::Exiting);
        }

        let tracer = {
            let inner = guard.borrow();
            inner
                .tracers
                .iter()
                .find(|t| t.id == handle.0)
                .copied()
                .ok_or(Error::NoEnt)?
        };

        let batches: Vec<Vec<Arc<EventDescription>>> = {
            let inner = guard.borrow();
            inner.batches.iter().map(|b| b.events.clone()).collect()
        };

        for events in &batches {
            for event in events {
                (tracer.notify)(NotifyReason::RemoveEvents, event, tracer.priv_data);
            }
        }

        {
            let mut inner = guard.borrow_mut();
            inner.tracers.retain(|t| t.id != handle.0);
        }

        Ok(())
    }
}
