use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use crate::layout::LayoutDescriptor;
use crate::memory::{DataHandle, Memory};

// Engine — Allocation and dispatch accounting for one pipeline
//
// The engine is the context every memory object and primitive is created
// against. It is a cheap cloneable handle; all clones share counters. The
// counters are the observable record of what the conversion cache actually
// did: how much was allocated, how many conversions ran, and how many
// batched dispatches it took.
//
// One engine per pipeline instance. It holds Rc state, so it is !Send.

/// Snapshot of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of storage allocations.
    pub allocations: u64,
    /// Total f32 elements allocated.
    pub allocated_elems: u64,
    /// Primitive executions of any kind.
    pub primitives_executed: u64,
    /// Executions of conversion primitives only.
    pub conversions_executed: u64,
    /// Batched stream submissions.
    pub dispatches: u64,
}

#[derive(Default)]
struct Counters {
    allocations: Cell<u64>,
    allocated_elems: Cell<u64>,
    primitives_executed: Cell<u64>,
    conversions_executed: Cell<u64>,
    dispatches: Cell<u64>,
}

fn bump(c: &Cell<u64>, by: u64) {
    c.set(c.get() + by);
}

struct EngineInner {
    name: String,
    counters: Counters,
}

/// Host compute engine.
#[derive(Clone)]
pub struct Engine(Rc<EngineInner>);

impl Engine {
    pub fn new(name: impl Into<String>) -> Self {
        Engine(Rc::new(EngineInner {
            name: name.into(),
            counters: Counters::default(),
        }))
    }

    /// Default CPU engine.
    pub fn cpu() -> Self {
        Self::new("cpu")
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn same_as(&self, other: &Engine) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Allocate zeroed f32 storage.
    pub fn alloc_data(&self, len: usize) -> DataHandle {
        bump(&self.0.counters.allocations, 1);
        bump(&self.0.counters.allocated_elems, len as u64);
        DataHandle::zeros(len)
    }

    /// Allocate memory sized for `layout` (padding included, zero-filled).
    pub fn alloc(&self, layout: &LayoutDescriptor) -> Result<Memory> {
        let data = self.alloc_data(layout.physical_len());
        Memory::new(layout.clone(), data)
    }

    pub fn stats(&self) -> EngineStats {
        let c = &self.0.counters;
        EngineStats {
            allocations: c.allocations.get(),
            allocated_elems: c.allocated_elems.get(),
            primitives_executed: c.primitives_executed.get(),
            conversions_executed: c.conversions_executed.get(),
            dispatches: c.dispatches.get(),
        }
    }

    pub(crate) fn record_primitive(&self) {
        bump(&self.0.counters.primitives_executed, 1);
    }

    pub(crate) fn record_conversion(&self) {
        bump(&self.0.counters.conversions_executed, 1);
    }

    pub(crate) fn record_dispatch(&self) {
        bump(&self.0.counters.dispatches, 1);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine({}, {:?})", self.0.name, self.stats())
    }
}
