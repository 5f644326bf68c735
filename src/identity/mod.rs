//! Stable integer ids for identity-less host objects.
//!
//! The host hands out fresh wrapper objects on every query and never reports
//! when a tab or page goes away. [`IdentityRegistry`] keeps an arena from
//! synthetic ids to handles, matched by host identity, and drops entries during
//! a liveness sweep against a freshly enumerated live set.
//!
//! Sweeps are two-phase. [`IdentityRegistry::begin_sweep`] takes a
//! [`SweepToken`] *before* the host is enumerated; [`IdentityRegistry::retain_live`]
//! only considers entries that existed when the token was taken. A handle
//! assigned while the enumeration is in flight is therefore never swept by
//! that pass.

mod tracker;

pub use tracker::{SweepReport, TabTracker};

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::host::HostObject;
use crate::message::TabId;

/// Generation marker captured at the start of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepToken {
    generation: u64,
}

struct Entry<T> {
    handle: T,
    generation: u64,
}

struct RegistryInner<T> {
    entries: BTreeMap<TabId, Entry<T>>,
    next_id: TabId,
    generation: u64,
}

/// Thread-safe id <-> handle table.
pub struct IdentityRegistry<T: HostObject> {
    inner: Mutex<RegistryInner<T>>,
}

impl<T: HostObject> Default for IdentityRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HostObject> IdentityRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: BTreeMap::new(),
                next_id: 1,
                generation: 0,
            }),
        }
    }

    /// Existing id of an equal handle, or a freshly allocated one.
    ///
    /// Ids are never reused, so a new id cannot collide with a live one.
    pub fn resolve_or_assign(&self, handle: &T) -> TabId {
        let mut inner = self.inner.lock();

        if let Some((&id, _)) = inner
            .entries
            .iter()
            .find(|(_, entry)| entry.handle.same_object(handle))
        {
            return id;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let generation = inner.generation;
        inner.entries.insert(
            id,
            Entry {
                handle: handle.clone(),
                generation,
            },
        );
        id
    }

    /// Id of an equal handle, without assigning one.
    pub fn find(&self, handle: &T) -> Option<TabId> {
        self.inner
            .lock()
            .entries
            .iter()
            .find(|(_, entry)| entry.handle.same_object(handle))
            .map(|(&id, _)| id)
    }

    /// Handle stored under `id`. A miss is only trustworthy right after a sweep.
    pub fn lookup(&self, id: TabId) -> Option<T> {
        self.inner.lock().entries.get(&id).map(|e| e.handle.clone())
    }

    /// Start a sweep. Enumerate the host only after taking the token.
    pub fn begin_sweep(&self) -> SweepToken {
        let mut inner = self.inner.lock();
        let token = SweepToken {
            generation: inner.generation,
        };
        inner.generation += 1;
        token
    }

    /// Remove every entry older than `token` whose handle is not in `live`.
    ///
    /// Returns the removed ids.
    pub fn retain_live(&self, token: SweepToken, live: &[T]) -> Vec<TabId> {
        let mut inner = self.inner.lock();

        let dead: Vec<TabId> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.generation <= token.generation)
            .filter(|(_, entry)| !live.iter().any(|h| h.same_object(&entry.handle)))
            .map(|(&id, _)| id)
            .collect();

        for id in &dead {
            inner.entries.remove(id);
        }
        dead
    }

    /// One-shot sweep against a live set the caller already holds.
    pub fn sweep(&self, live: &[T]) -> Vec<TabId> {
        let token = self.begin_sweep();
        self.retain_live(token, live)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All ids currently held, ascending.
    pub fn ids(&self) -> Vec<TabId> {
        self.inner.lock().entries.keys().copied().collect()
    }
}
