use tracing::trace;

use crate::engine::Engine;
use crate::error::Result;
use crate::primitive::PrimitiveRef;

// Stream — Runs a pending list as one batched dispatch
//
// Stages collect conversions and compute primitives into a pending list
// while they submit their buffers, then hand the whole list to a stream.
// Execution is strictly in list order. Batching only saves dispatch
// overhead; it carries no ordering guarantee between sibling conversions
// beyond "in the order they were pushed".

/// Executes pending primitives against an engine.
pub struct Stream {
    engine: Engine,
}

impl Stream {
    pub fn new(engine: &Engine) -> Self {
        Stream {
            engine: engine.clone(),
        }
    }

    /// Execute every primitive in order, recording one dispatch.
    /// An empty list is not a dispatch.
    pub fn submit(&self, pending: &[PrimitiveRef]) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        self.engine.record_dispatch();
        for p in pending {
            trace!(primitive = p.name(), "execute");
            p.execute(&self.engine)?;
            self.engine.record_primitive();
            if p.is_conversion() {
                self.engine.record_conversion();
            }
        }
        Ok(())
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::primitive::FnPrimitive;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_runs_in_order_in_one_dispatch() {
        let engine = Engine::cpu();
        let log = Rc::new(RefCell::new(Vec::new()));
        let pending: Vec<PrimitiveRef> = (0..3)
            .map(|i| {
                let log = log.clone();
                FnPrimitive::new(format!("p{i}"), move || {
                    log.borrow_mut().push(i);
                    Ok(())
                })
                .into_ref()
            })
            .collect();
        Stream::new(&engine).submit(&pending).unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        let stats = engine.stats();
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.primitives_executed, 3);
        assert_eq!(stats.conversions_executed, 0);
    }

    #[test]
    fn test_empty_list_is_not_a_dispatch() {
        let engine = Engine::cpu();
        Stream::new(&engine).submit(&[]).unwrap();
        assert_eq!(engine.stats().dispatches, 0);
    }

    #[test]
    fn test_error_stops_execution() {
        let engine = Engine::cpu();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let pending = vec![
            FnPrimitive::new("fail", || Err(Error::msg("boom"))).into_ref(),
            FnPrimitive::new("after", move || {
                *ran2.borrow_mut() = true;
                Ok(())
            })
            .into_ref(),
        ];
        assert!(Stream::new(&engine).submit(&pending).is_err());
        assert!(!*ran.borrow());
    }
}
