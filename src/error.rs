// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use thiserror::Error;

/// Stable error contract for every fallible operation in this crate.
///
/// Mirrors the `OK=0, INVAL=1, EXIST=2, NOMEM=3, NOENT=4, EXITING=5` enum of
/// the external ABI: `OK` is represented as `Result::Ok(())` rather than as a
/// variant here.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A null callback function, a `VARIADIC` mismatch, `MATCH_ALL` used
    /// where forbidden, or a counter at its maximum.
    #[error("invalid argument")]
    Inval,

    /// A callback with the same `(function, priv, key)` tuple is already
    /// registered on this event.
    #[error("entry already exists")]
    Exist,

    /// Allocation failure, or the key allocator's counter has wrapped.
    #[error("out of memory")]
    NoMem,

    /// No matching entry/handle was found to unregister.
    #[error("entry not found")]
    NoEnt,

    /// The library has been shut down via [`crate::exit`]; the operation was
    /// a no-op.
    #[error("library is exiting")]
    Exiting,
}

/// Shorthand for `core::result::Result<T, Error>`.
pub type Result<T> = core::result::Result<T, Error>;
