// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheap, cloneable "are we exiting" flag shared by the registry, the
/// state-dump machine, and the dispatch fast path.
///
/// [`crate::exit`] flips it once; every other component only ever reads it,
/// on the uncontended relaxed path, so checking it costs nothing on the
/// dispatch fast path.
#[derive(Clone)]
pub(crate) struct Lifecycle(Arc<AtomicBool>);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    #[inline(always)]
    pub(crate) fn is_exiting(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_exiting(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_is_shared_across_clones() {
        let a = Lifecycle::new();
        let b = a.clone();
        assert!(!a.is_exiting());
        assert!(!b.is_exiting());
        a.mark_exiting();
        assert!(b.is_exiting());
    }
}
