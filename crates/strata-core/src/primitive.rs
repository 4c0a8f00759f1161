use std::rc::Rc;

use crate::engine::Engine;
use crate::error::Result;

// Primitive — A bound operation waiting in a pending list
//
// A primitive is built once, during stage configuration, against concrete
// Memory objects. Executing it reads and writes through those objects'
// current data handles, so rebinding a Memory never requires rebuilding
// the primitive.
//
// Compute primitives (the numeric kernels) and conversion primitives
// (Reorder) share this trait so a Stream can run any mix of them in one
// batched dispatch.

/// An operation bound to its memory, executed by a `Stream`.
pub trait Primitive {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the operation.
    fn execute(&self, engine: &Engine) -> Result<()>;

    /// Whether this primitive only rewrites data from one layout to another.
    fn is_conversion(&self) -> bool {
        false
    }
}

/// Shared handle to a primitive, as stored in pending lists.
pub type PrimitiveRef = Rc<dyn Primitive>;

/// A primitive backed by a closure. Used for compute kernels whose state is
/// just the memory they capture.
pub struct FnPrimitive<F> {
    name: String,
    f: F,
}

impl<F> FnPrimitive<F>
where
    F: Fn() -> Result<()> + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnPrimitive {
            name: name.into(),
            f,
        }
    }

    pub fn into_ref(self) -> PrimitiveRef {
        Rc::new(self)
    }
}

impl<F> Primitive for FnPrimitive<F>
where
    F: Fn() -> Result<()> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _engine: &Engine) -> Result<()> {
        (self.f)()
    }
}
