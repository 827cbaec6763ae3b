// Request registry
// Maps transport task identifiers to the logical requests that own them.

use crate::request::ApiRequest;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dbxkit_core::TaskId;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Weak entries are swept once the map holds this many.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 250;

#[derive(Debug, Clone)]
enum RequestBox {
    /// Kept alive by its façade.
    Weak(Weak<ApiRequest>),
    /// Rebuilt around a surviving task; nothing else owns it until the caller
    /// picks it up.
    PendingReconnection(Arc<ApiRequest>),
}

impl RequestBox {
    fn resolve(&self) -> Option<Arc<ApiRequest>> {
        match self {
            RequestBox::Weak(weak) => weak.upgrade(),
            RequestBox::PendingReconnection(strong) => Some(Arc::clone(strong)),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            RequestBox::Weak(weak) => weak.strong_count() > 0,
            RequestBox::PendingReconnection(_) => true,
        }
    }
}

#[derive(Debug)]
pub struct RequestMap {
    entries: DashMap<TaskId, RequestBox>,
    compaction_threshold: usize,
}

impl Default for RequestMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMap {
    pub fn new() -> Self {
        Self::with_compaction_threshold(DEFAULT_COMPACTION_THRESHOLD)
    }

    pub fn with_compaction_threshold(compaction_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            compaction_threshold,
        }
    }

    /// Register `request` weakly under `id`.
    pub fn set(&self, request: &Arc<ApiRequest>, id: TaskId) {
        if self.entries.len() >= self.compaction_threshold {
            self.compact();
        }
        self.entries.insert(id, RequestBox::Weak(Arc::downgrade(request)));
    }

    /// Register `request` strongly until [`RequestMap::weakify_reconnected_requests`].
    pub fn set_pending_reconnection(&self, request: Arc<ApiRequest>, id: TaskId) {
        self.entries.insert(id, RequestBox::PendingReconnection(request));
    }

    /// The live request for `id`, or a new pending entry built by `make`.
    ///
    /// A dead weak entry is replaced. The check and insert are atomic per id.
    pub fn get_or_insert_pending_reconnection(
        &self,
        id: TaskId,
        make: impl FnOnce() -> Arc<ApiRequest>,
    ) -> Arc<ApiRequest> {
        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => match occupied.get().resolve() {
                Some(request) => request,
                None => {
                    let request = make();
                    occupied.insert(RequestBox::PendingReconnection(Arc::clone(&request)));
                    request
                }
            },
            Entry::Vacant(vacant) => {
                let request = make();
                vacant.insert(RequestBox::PendingReconnection(Arc::clone(&request)));
                request
            }
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<ApiRequest>> {
        self.entries.get(&id).and_then(|entry| entry.resolve())
    }

    pub fn all_requests(&self) -> Vec<(TaskId, Arc<ApiRequest>)> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value().resolve().map(|r| (*entry.key(), r)))
            .collect()
    }

    pub fn all_pending_reconnection_requests(&self) -> Vec<(TaskId, Arc<ApiRequest>)> {
        self.entries
            .iter()
            .filter_map(|entry| match entry.value() {
                RequestBox::PendingReconnection(r) => Some((*entry.key(), Arc::clone(r))),
                RequestBox::Weak(_) => None,
            })
            .collect()
    }

    /// Hand ownership of reconnected requests back to their callers.
    pub fn weakify_reconnected_requests(&self) {
        let mut count = 0usize;
        for mut entry in self.entries.iter_mut() {
            if let RequestBox::PendingReconnection(strong) = entry.value() {
                let weak = Arc::downgrade(strong);
                *entry.value_mut() = RequestBox::Weak(weak);
                count += 1;
            }
        }
        debug!(target: "dbxkit::background", count, "Weakified reconnected requests");
    }

    /// Collect the pending entries and weakify them in the same pass.
    ///
    /// Each entry is read and downgraded under its shard lock, so an entry
    /// added concurrently is either returned here or left pending.
    pub fn take_pending_reconnection_requests(&self) -> Vec<(TaskId, Arc<ApiRequest>)> {
        let mut taken = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if let RequestBox::PendingReconnection(strong) = entry.value() {
                let strong = Arc::clone(strong);
                *entry.value_mut() = RequestBox::Weak(Arc::downgrade(&strong));
                taken.push((*entry.key(), strong));
            }
        }
        debug!(target: "dbxkit::background", count = taken.len(), "Took pending reconnection requests");
        taken
    }

    pub fn remove(&self, id: TaskId) -> Option<Arc<ApiRequest>> {
        self.entries.remove(&id).and_then(|(_, entry)| entry.resolve())
    }

    pub fn remove_all(&self) {
        self.entries.clear();
    }

    /// Number of entries, including weak ones whose request is gone.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop weak entries whose request has been released.
    pub fn compact(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live());
        trace!(before, after = self.entries.len(), "Compacted request map");
    }
}
