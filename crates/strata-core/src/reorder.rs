use std::cell::Cell;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::layout::LayoutDescriptor;
use crate::memory::Memory;
use crate::primitive::Primitive;

// Reorder — The conversion primitive
//
// Rewrites data from one layout to another of the same logical dims. It is
// stateless apart from the two Memory objects it is bound to and a shared
// counter of how often it ran. Padding positions of a blocked destination
// are written as zero, so a reorder is a pure permutation of the logical
// elements and round trips are bit-exact.

/// Copy `src` (laid out as `src_layout`) into `dst` (laid out as `dst_layout`).
pub fn reorder_into(
    src_layout: &LayoutDescriptor,
    src: &[f32],
    dst_layout: &LayoutDescriptor,
    dst: &mut [f32],
) -> Result<()> {
    if src_layout.dims() != dst_layout.dims() {
        return Err(Error::contract(format!(
            "reorder between different logical dims: {} -> {}",
            src_layout, dst_layout
        )));
    }
    if dst_layout.physical_len() != dst_layout.elem_count() {
        dst.iter_mut().for_each(|v| *v = 0.0);
    }
    for (s, d) in src_layout.offsets().zip(dst_layout.offsets()) {
        dst[d] = src[s];
    }
    Ok(())
}

/// Conversion primitive between two memories.
pub struct Reorder {
    name: String,
    src: Memory,
    dst: Memory,
    executed: Rc<Cell<u64>>,
}

impl Reorder {
    pub fn new(src: Memory, dst: Memory) -> Result<Self> {
        if src.layout().dims() != dst.layout().dims() {
            return Err(Error::contract(format!(
                "reorder between different logical dims: {} -> {}",
                src.layout(),
                dst.layout()
            )));
        }
        let name = format!("reorder({} -> {})", src.layout().format(), dst.layout().format());
        Ok(Reorder {
            name,
            src,
            dst,
            executed: Rc::new(Cell::new(0)),
        })
    }

    /// Share an execution counter with the owner of this reorder.
    pub fn with_counter(mut self, counter: Rc<Cell<u64>>) -> Self {
        self.executed = counter;
        self
    }

    pub fn src(&self) -> &Memory {
        &self.src
    }

    pub fn dst(&self) -> &Memory {
        &self.dst
    }

    pub fn executions(&self) -> u64 {
        self.executed.get()
    }
}

impl Primitive for Reorder {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _engine: &Engine) -> Result<()> {
        let src_data = self.src.data_handle();
        let dst_data = self.dst.data_handle();
        if src_data.same_as(&dst_data) {
            return Err(Error::contract(format!("{} would alias its own storage", self.name)));
        }
        src_data.with_f32(|src| {
            dst_data.with_f32_mut(|dst| {
                reorder_into(self.src.layout(), src, self.dst.layout(), dst)
            })?
        })??;
        self.executed.set(self.executed.get() + 1);
        Ok(())
    }

    fn is_conversion(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Format;
    use crate::memory::DataHandle;

    #[test]
    fn test_reorder_nchw_to_blocked_and_back() {
        let engine = Engine::cpu();
        let dims = vec![1, 3, 2, 1];
        let nchw = LayoutDescriptor::canonical(&dims).unwrap();
        let blk = LayoutDescriptor::blocked(dims, 4).unwrap();
        let vals: Vec<f32> = (1..=6).map(|v| v as f32).collect();
        let a = Memory::new(nchw.clone(), DataHandle::from_vec(vals.clone())).unwrap();
        let b = engine.alloc(&blk).unwrap();
        let c = engine.alloc(&nchw).unwrap();

        Reorder::new(a, b.clone()).unwrap().execute(&engine).unwrap();
        // blocked [c/4][h][w][c%4]: h0 -> c0 c1 c2 pad, h1 -> c0 c1 c2 pad
        assert_eq!(
            b.data_handle().to_f32_vec(),
            vec![1.0, 3.0, 5.0, 0.0, 2.0, 4.0, 6.0, 0.0]
        );
        Reorder::new(b, c.clone()).unwrap().execute(&engine).unwrap();
        assert_eq!(c.data_handle().to_f32_vec(), vals);
    }

    #[test]
    fn test_reorder_rejects_different_dims() {
        let engine = Engine::cpu();
        let a = engine.alloc(&LayoutDescriptor::canonical(&[2, 3]).unwrap()).unwrap();
        let b = engine
            .alloc(&LayoutDescriptor::plain(vec![3, 2], Format::Cn).unwrap())
            .unwrap();
        assert!(matches!(
            Reorder::new(a, b),
            Err(Error::LayoutContractViolation(_))
        ));
    }

    #[test]
    fn test_shared_counter() {
        let engine = Engine::cpu();
        let l = LayoutDescriptor::canonical(&[2, 2]).unwrap();
        let t = LayoutDescriptor::plain(vec![2, 2], Format::Cn).unwrap();
        let counter = Rc::new(Cell::new(0));
        let r = Reorder::new(engine.alloc(&l).unwrap(), engine.alloc(&t).unwrap())
            .unwrap()
            .with_counter(counter.clone());
        r.execute(&engine).unwrap();
        r.execute(&engine).unwrap();
        assert_eq!(counter.get(), 2);
        assert_eq!(r.executions(), 2);
    }
}
