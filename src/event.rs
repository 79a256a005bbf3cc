// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use core::ffi::c_void;
use core::marker::PhantomData;

use bitflags::bitflags;

bitflags! {
    /// Flags carried by an [`EventDescription`].
    ///
    /// Only [`EventFlags::VARIADIC`] is consulted by the core; the remaining
    /// bits are reserved for the (out of scope) type-system layer.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        /// This event's callbacks take a variadic struct in addition to the
        /// argument vector, and must be registered/invoked through the
        /// `_variadic` entry points.
        const VARIADIC = 1 << 0;
    }
}

/// An opaque, type-erased view of the argument vector the external
/// type-system layer builds for one event call.
///
/// The core never inspects the bytes; it only forwards the pointer and
/// length to attached callbacks. Modeled the same way
/// [`EventDataDescriptor`](https://github.com/microsoft/LinuxTracepoints)
/// forwards opaque `(ptr, len)` pairs to the kernel write path, so that no
/// concrete argument-encoding type needs to live in this crate.
#[derive(Clone, Copy, Debug)]
pub struct ArgVec<'a> {
    ptr: *const (),
    len: usize,
    _marker: PhantomData<&'a ()>,
}

impl<'a> ArgVec<'a> {
    /// Wraps a raw `(ptr, len)` pair describing an externally-defined
    /// argument vector.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` externally-defined argument
    /// records for the lifetime `'a`, or `len` must be `0`.
    pub const unsafe fn from_raw_parts(ptr: *const (), len: usize) -> Self {
        Self {
            ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// An empty argument vector.
    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null(),
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Number of (opaque, externally-typed) argument records.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if this argument vector has no records.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The raw, externally-typed argument pointer.
    pub const fn as_ptr(&self) -> *const () {
        self.ptr
    }
}

/// An opaque view of the variadic struct passed to `call_variadic` and
/// `statedump_call_variadic`. Same shape as [`ArgVec`]; kept as a distinct
/// type so a variadic callback cannot be accidentally handed a plain
/// argument vector or vice versa.
#[derive(Clone, Copy, Debug)]
pub struct VarStruct<'a> {
    ptr: *const (),
    _marker: PhantomData<&'a ()>,
}

impl<'a> VarStruct<'a> {
    /// Wraps a raw pointer to an externally-defined variadic struct.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of one externally-defined variadic
    /// struct for the lifetime `'a`, or be null.
    pub const unsafe fn from_raw_ptr(ptr: *const ()) -> Self {
        Self {
            ptr,
            _marker: PhantomData,
        }
    }

    /// The raw, externally-typed variadic struct pointer.
    pub const fn as_ptr(&self) -> *const () {
        self.ptr
    }
}

/// An opaque pointer handed back to a callback unchanged. The core never
/// dereferences it.
///
/// # Safety
///
/// `PrivPtr` is `Send + Sync` because the core only ever copies and forwards
/// the pointer value; it is the caller's responsibility to ensure that
/// whatever the pointer refers to tolerates being read from whatever thread
/// ends up running the callback (true of every caller in this crate's own
/// tests, which box a value and leak it for the duration of the test).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PrivPtr(pub *mut c_void);

unsafe impl Send for PrivPtr {}
unsafe impl Sync for PrivPtr {}

impl PrivPtr {
    /// The null private pointer.
    pub const fn null() -> Self {
        Self(core::ptr::null_mut())
    }
}

/// Produced by the external type-system layer; the core treats this as an
/// opaque record carrying only a flags bitfield and a back-reference to its
/// callback table.
///
/// Lifetime: owned by whoever registered the containing event batch
/// (`registry::register_events`); unchanged until the batch is
/// unregistered.
pub struct EventDescription {
    pub(crate) flags: EventFlags,
    pub(crate) state: crate::callback::CallbackTableHandle,
}

impl EventDescription {
    /// Creates a new event description backed by a fresh, empty callback
    /// table.
    pub fn new(flags: EventFlags) -> Self {
        Self {
            flags,
            state: crate::callback::CallbackTableHandle::new(),
        }
    }

    /// This event's flags.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// True if any tracer (private callback or, via the reserved bits, an
    /// external kernel-side listener) is currently attached.
    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.state.table().enabled()
    }

    pub(crate) fn table(&self) -> &crate::callback::CallbackTable {
        self.state.table()
    }
}
