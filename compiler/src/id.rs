// id.rs — Stable identifiers for compiler artifacts
//
// `DefId` gives each `GlobalDefinitions` instance an identity assigned when it
// is registered, so dependency deduplication never relies on pointer equality.
// `GroupId` numbers cold DSP groups in discovery order.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Stable identifier for a global definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefId(pub u32);

static NEXT_DEF: AtomicU32 = AtomicU32::new(0);

impl DefId {
    /// Allocate a process-wide unique id. Ids increase in registration order.
    pub fn fresh() -> Self {
        DefId(NEXT_DEF.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifier of a cold DSP group within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for per-compilation ids, monotonically increasing.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_group: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_group(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }
}
