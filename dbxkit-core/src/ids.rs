use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier the transport assigns to a task for its whole lifetime.
///
/// Identifiers are only unique within one session; a relaunched process sees
/// the same identifiers for tasks that survived in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(value: u64) -> Self {
        TaskId(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        TaskId::new(value)
    }
}

/// Hands out task identifiers for transports that number their own tasks.
#[derive(Debug)]
pub struct TaskIdAllocator {
    next: AtomicU64,
}

impl TaskIdAllocator {
    pub fn new() -> Self {
        TaskIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    /// Start numbering at `first`, e.g. past the ids of tasks restored from a previous run.
    pub fn starting_at(first: u64) -> Self {
        TaskIdAllocator {
            next: AtomicU64::new(first),
        }
    }

    pub fn allocate(&self) -> TaskId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        TaskId::new(id)
    }

    pub fn peek_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for TaskIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
