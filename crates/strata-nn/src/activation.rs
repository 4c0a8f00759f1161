// Activation stages
//
//   ReLU  — max(0, x). Layout agnostic: whatever layout it is offered it
//           computes in, so it never adds a conversion of its own.
//   Tanh  — a legacy, non-participating stage. Canonical layout only; it
//           never publishes and is never offered anything but canonical.
//
// Both are elementwise, so the kernels only need the canonical value order.

use strata_core::{LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::kernel::{expect_inputs, unary, unary_grad};
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};

/// Rectified linear unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl StageOps for ReLU {
    fn kind(&self) -> &'static str {
        "relu"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        _output: &Shape,
    ) -> Result<ForwardLayouts> {
        Ok(ForwardLayouts {
            inputs: inputs.to_vec(),
            output: inputs[0].clone(),
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(unary(
            format!("{}.relu", ctx.stage),
            ctx.inputs[0].clone(),
            ctx.output.clone(),
            |x| x.max(0.0),
        ))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(unary_grad(
            format!("{}.relu_grad", ctx.stage),
            ctx.inputs[0].clone(),
            ctx.output_grad.clone(),
            ctx.input_grads[0].clone(),
            |dy, x| if x > 0.0 { dy } else { 0.0 },
        ))
    }
}

/// Hyperbolic tangent, canonical layout only.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Tanh {
    pub fn new() -> Self {
        Tanh
    }
}

impl StageOps for Tanh {
    fn kind(&self) -> &'static str {
        "tanh"
    }

    fn participates(&self) -> bool {
        false
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        Ok(inputs[0].clone())
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        Ok(ForwardLayouts {
            inputs: inputs
                .iter()
                .map(|l| LayoutDescriptor::canonical(l.dims()))
                .collect::<Result<Vec<_>>>()?,
            output: LayoutDescriptor::canonical(output.dims())?,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(unary(
            format!("{}.tanh", ctx.stage),
            ctx.inputs[0].clone(),
            ctx.output.clone(),
            f32::tanh,
        ))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        Ok(unary_grad(
            format!("{}.tanh_grad", ctx.stage),
            ctx.output.clone(),
            ctx.output_grad.clone(),
            ctx.input_grads[0].clone(),
            |dy, y| dy * (1.0 - y * y),
        ))
    }
}
