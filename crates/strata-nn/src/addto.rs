// AddTo — Elementwise sum of N same-shape inputs
//
// Every input is converted into the first input's user layout, so the
// sum runs over one layout and the first producer's arrangement passes
// straight through. Backward hands the incoming gradient to every input
// unchanged.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::kernel::expect_some_inputs;
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};

#[derive(Debug, Clone, Copy, Default)]
pub struct AddTo;

impl AddTo {
    pub fn new() -> Self {
        AddTo
    }
}

impl StageOps for AddTo {
    fn kind(&self) -> &'static str {
        "addto"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_some_inputs(stage, self.kind(), inputs)?;
        let first = &inputs[0];
        for s in &inputs[1..] {
            if s != first {
                return Err(Error::ShapeMismatch {
                    stage: stage.to_string(),
                    expected: first.clone(),
                    got: s.clone(),
                });
            }
        }
        Ok(first.clone())
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        _output: &Shape,
    ) -> Result<ForwardLayouts> {
        let common = inputs[0].clone();
        Ok(ForwardLayouts {
            inputs: vec![common.clone(); inputs.len()],
            output: common,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let xs = ctx.inputs.to_vec();
        let y = ctx.output.clone();
        Ok(Rc::new(FnPrimitive::new(format!("{}.addto", ctx.stage), move || {
            let mut acc = vec![0.0f32; y.layout().elem_count()];
            for x in &xs {
                for (a, v) in acc.iter_mut().zip(x.read_canonical()?) {
                    *a += v;
                }
            }
            y.write_canonical(&acc)
        })))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        let dy = ctx.output_grad.clone();
        let dxs = ctx.input_grads.to_vec();
        Ok(Rc::new(FnPrimitive::new(format!("{}.addto_grad", ctx.stage), move || {
            let g = dy.read_canonical()?;
            for dx in &dxs {
                dx.write_canonical(&g)?;
            }
            Ok(())
        })))
    }
}
