// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::HashSet;
use std::sync::{Arc, Mutex};

/// Set of canonical partial-forest strings already visited by the search.
///
/// `forget` removes an entry when an assembly is abandoned, so symmetric
/// construction orders of the same forest stay explorable later.
pub trait Encountered: Send + Sync {
    /// Whether this forest shape was seen before.
    fn already_encountered(&self, repr: &str) -> bool;

    /// Records a forest shape.
    fn remember(&self, repr: &str);

    /// Unrecords a forest shape.
    fn forget(&self, repr: &str);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Single-owner variant: the membership check inserts on miss, so a
/// follow-up `remember` is redundant (and a no-op).
#[derive(Default)]
pub struct LocalEncountered {
    inner: Mutex<HashSet<Box<str>>>,
}

impl LocalEncountered {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encountered for LocalEncountered {
    fn already_encountered(&self, repr: &str) -> bool {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut set = self.inner.lock().expect("lock is poisoned");

        if set.contains(repr) {
            true
        } else {
            set.insert(repr.into());
            false
        }
    }

    fn remember(&self, _repr: &str) {
        // already inserted by the membership check
    }

    fn forget(&self, repr: &str) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.inner.lock().expect("lock is poisoned").remove(repr);
    }

    fn len(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let set = self.inner.lock().expect("lock is poisoned");
        set.len()
    }
}

/// Variant shared between workers.
///
/// The membership check is read-only; callers `remember` only survivors of
/// all filters, keeping round trips through the shared map to a minimum.
/// Check-then-remember is not atomic: two workers may briefly explore the
/// same shape, which is benign (the duplicate is pruned downstream or
/// produces identical results).
#[derive(Clone, Default)]
pub struct SharedEncountered {
    inner: Arc<Mutex<HashSet<Box<str>>>>,
}

impl SharedEncountered {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the current contents, for writing a save archive.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Box<str>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let set = self.inner.lock().expect("lock is poisoned");
        set.iter().cloned().collect()
    }

    /// Bulk-inserts entries read back from a save archive.
    pub fn preload(&self, reprs: impl IntoIterator<Item = Box<str>>) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut set = self.inner.lock().expect("lock is poisoned");
        set.extend(reprs);
    }
}

impl Encountered for SharedEncountered {
    fn already_encountered(&self, repr: &str) -> bool {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let set = self.inner.lock().expect("lock is poisoned");
        set.contains(repr)
    }

    fn remember(&self, repr: &str) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.inner
            .lock()
            .expect("lock is poisoned")
            .insert(repr.into());
    }

    fn forget(&self, repr: &str) {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        self.inner.lock().expect("lock is poisoned").remove(repr);
    }

    fn len(&self) -> usize {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let set = self.inner.lock().expect("lock is poisoned");
        set.len()
    }
}
