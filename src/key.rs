// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Matches every key: a callback registered with `MATCH_ALL` fires for any
/// dispatch key, and a dispatch with `MATCH_ALL` fires every callback
/// regardless of the callback's own key.
pub const MATCH_ALL: u64 = 0;

/// Reserved key for the kernel `user_events` hook (`spec.md` §4.D step 5).
pub const USER_EVENT: u64 = 1;

/// Reserved key for the `ptrace` hook (`spec.md` §4.D step 5).
pub const PTRACE: u64 = 2;

/// `3..=7` are reserved for future core use. Dynamically allocated keys
/// start at 8.
pub const FIRST_DYNAMIC_KEY: u64 = 8;

/// Issues unique, monotonically increasing `u64` tracer keys.
///
/// A single counter protected by a mutex, seeded at [`FIRST_DYNAMIC_KEY`].
/// Keys are never recycled: once issued, a key is never returned by a later
/// call, even after its owning tracer has unregistered.
pub struct KeyAllocator {
    next: Mutex<u64>,
}

impl KeyAllocator {
    /// Creates a fresh allocator seeded at [`FIRST_DYNAMIC_KEY`].
    pub const fn new() -> Self {
        Self {
            next: Mutex::new(FIRST_DYNAMIC_KEY),
        }
    }

    /// Returns the next key, or [`Error::NoMem`] if the counter has wrapped
    /// around to `0`.
    pub fn request_key(&self) -> Result<u64> {
        let mut next = self.next.lock();
        if *next == 0 {
            return Err(Error::NoMem);
        }
        let key = *next;
        *next = next.wrapping_add(1);
        Ok(key)
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_strictly_increasing_and_reserved_range_is_skipped() {
        let alloc = KeyAllocator::new();
        let mut prev = None;
        for _ in 0..1000 {
            let key = alloc.request_key().unwrap();
            assert!(key >= FIRST_DYNAMIC_KEY);
            if let Some(prev) = prev {
                assert!(key > prev);
            }
            prev = Some(key);
        }
    }

    #[test]
    fn wraparound_to_zero_fails_with_nomem() {
        let alloc = KeyAllocator {
            next: Mutex::new(0),
        };
        assert_eq!(alloc.request_key(), Err(Error::NoMem));
    }
}
