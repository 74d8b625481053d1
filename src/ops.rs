use std::collections::VecDeque;
use std::path::PathBuf;

/// Arguments for a ctfile transfer operation, shared by archive and
/// extract (and by cull's interleaved fetches).
#[derive(Debug, Clone)]
pub struct CtfileOpArgs {
    pub localname: String,
    pub remotename: Option<String>,
    /// Directory the local file lives in (the cache directory for
    /// cull fetches).
    pub tdir: Option<PathBuf>,
    /// Pre-validate the local file as a ctfile before streaming.
    pub ctfile: bool,
    /// Chunk payloads are encrypted on the wire.
    pub encrypted: bool,
}

/// How list patterns are applied to remote names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Prefix,
    Substring,
}

/// A high-level session task. The engine dispatches on the variant for
/// the start, completion and cleanup behavior of each.
#[derive(Debug)]
pub enum Op {
    Archive(CtfileOpArgs),
    Extract(CtfileOpArgs),
    List {
        mode: MatchMode,
        patterns: Vec<String>,
        excludes: Vec<String>,
    },
    Delete {
        name: String,
    },
    /// List driving the cull: its completion schedules fetches of
    /// every remote ctfile missing from the cache.
    CullList,
    CullCollect,
    CullSetup,
    CullShas,
    CullComplete,
}

/// FIFO of operations. A single operation is active at a time; the
/// completer advances the queue when the active one signals done.
pub struct OpQueue {
    active: Option<Op>,
    pending: VecDeque<Op>,
    // insertion point for add_after_active, so successive splices keep
    // their call order
    splice: usize,
}

impl OpQueue {
    pub fn new() -> Self {
        OpQueue {
            active: None,
            pending: VecDeque::new(),
            splice: 0,
        }
    }

    /// Append an operation at the tail.
    pub fn add(&mut self, op: Op) {
        self.pending.push_back(op);
    }

    /// Insert an operation directly after the active one, before
    /// everything else pending. The cull engine uses this to interleave
    /// ctfile fetches between the list and the collect steps.
    pub fn add_after_active(&mut self, op: Op) {
        let at = self.splice;
        self.pending.insert(at, op);
        self.splice += 1;
    }

    /// Promote the next pending operation. Returns false when the queue
    /// is drained, which shuts the session down.
    pub fn advance(&mut self) -> bool {
        self.splice = 0;
        self.active = self.pending.pop_front();
        self.active.is_some()
    }

    pub fn take_active(&mut self) -> Option<Op> {
        self.active.take()
    }

    pub fn put_active(&mut self, op: Op) {
        self.active = Some(op);
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }
}
