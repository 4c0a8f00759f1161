// ReorderStage — An explicit conversion placed in the pipeline
//
// Converts its input to a configured target format. The input is taken in
// whatever layout it is offered; the output is the target. A target equal
// to the input layout is a configuration error: such a stage would do
// nothing. Backward converts the gradient from the target back to the
// input layout.

use std::rc::Rc;

use strata_core::{Error, Format, LayoutDescriptor, PrimitiveRef, Reorder, Result, Shape};

use crate::kernel::expect_inputs;
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderStage {
    target: Format,
    block: Option<usize>,
}

impl ReorderStage {
    pub fn new(target: Format, block: Option<usize>) -> Result<Self> {
        match (target.is_blocked(), block) {
            (true, Some(b)) if b > 0 => {}
            (true, _) => {
                return Err(Error::config(format!(
                    "reorder to {target} needs a non-zero block factor"
                )))
            }
            (false, Some(_)) => {
                return Err(Error::config(format!(
                    "reorder to {target} does not take a block factor"
                )))
            }
            (false, None) => {}
        }
        Ok(ReorderStage { target, block })
    }

    pub fn target(&self) -> Format {
        self.target
    }
}

impl StageOps for ReorderStage {
    fn kind(&self) -> &'static str {
        "reorder"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        let x = &inputs[0];
        if x.rank() != self.target.rank() {
            return Err(Error::invalid_shape(
                stage,
                x.dims(),
                format!("reorder to {} needs rank {}", self.target, self.target.rank()),
            ));
        }
        Ok(x.clone())
    }

    fn forward_layouts(
        &self,
        stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        let target = LayoutDescriptor::new(output.dims().to_vec(), self.target, self.block)?;
        if target == inputs[0] {
            return Err(Error::config(format!(
                "stage '{stage}': reorder target {target} equals its input layout"
            )));
        }
        Ok(ForwardLayouts {
            inputs: inputs.to_vec(),
            output: target,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(Rc::new(Reorder::new(ctx.inputs[0].clone(), ctx.output.clone())?))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(Rc::new(Reorder::new(
            ctx.output_grad.clone(),
            ctx.input_grads[0].clone(),
        )?))
    }
}
