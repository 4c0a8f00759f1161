// Scale — Per-channel affine transform
//
//   y[n, c, ...] = w[c] * x[n, c, ...] + b[c]
//
// LAYOUT PREFERENCE:
//   Channel-blocked nChw8c when c >= 8 and the spatial extent is larger
//   than 1×1, canonical otherwise. The output is produced in the same
//   layout as the input, so a blocked Scale can hand its result to a
//   participating consumer with no conversion in between.
//
// Parameters w and b are [c] vectors; their canonical and internal layouts
// coincide, so they never convert.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, Format, LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::init;
use crate::kernel::{blocked_or_canonical, expect_channel_rank, expect_inputs, has_spatial, ncs};
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};
use crate::weight::{WeightFormat, WeightSlot};

/// Block factor Scale uses for channel-blocked layouts.
pub const SCALE_BLOCK: usize = 8;

pub struct Scale {
    channels: usize,
    weight: WeightSlot,
    bias: WeightSlot,
}

impl Scale {
    /// Identity scale: w = 1, b = 0.
    pub fn new(channels: usize) -> Result<Self> {
        Self::with_params(
            channels,
            init::constant(&[channels], 1.0),
            init::constant(&[channels], 0.0),
        )
    }

    pub fn with_params(channels: usize, weight: Vec<f32>, bias: Vec<f32>) -> Result<Self> {
        if channels == 0 {
            return Err(Error::config("scale needs at least one channel"));
        }
        let x = LayoutDescriptor::plain(vec![channels], Format::X)?;
        Ok(Scale {
            channels,
            weight: WeightSlot::new("w", &[channels], weight, x.clone(), WeightFormat::External)?,
            bias: WeightSlot::new("b", &[channels], bias, x, WeightFormat::External)?,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Layout Scale computes in for tensors of `dims`.
    pub fn preferred_layout(dims: &[usize]) -> Result<LayoutDescriptor> {
        if dims.len() == 4 && dims[1] >= SCALE_BLOCK && has_spatial(dims) {
            blocked_or_canonical(dims, SCALE_BLOCK)
        } else {
            LayoutDescriptor::canonical(dims)
        }
    }
}

impl StageOps for Scale {
    fn kind(&self) -> &'static str {
        "scale"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        let x = &inputs[0];
        expect_channel_rank(stage, x)?;
        if x.channels() != self.channels {
            return Err(Error::ShapeMismatch {
                stage: stage.to_string(),
                expected: x.with_channels(self.channels),
                got: x.clone(),
            });
        }
        Ok(x.clone())
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        let layout = Self::preferred_layout(output.dims())?;
        Ok(ForwardLayouts {
            inputs: vec![Self::preferred_layout(inputs[0].dims())?],
            output: layout,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let x = ctx.inputs[0].clone();
        let y = ctx.output.clone();
        let w = self.weight.internal_memory()?.clone();
        let b = self.bias.internal_memory()?.clone();
        let (n, c, s) = ncs(x.layout().dims());
        Ok(Rc::new(FnPrimitive::new(format!("{}.scale", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let wv = w.read_canonical()?;
            let bv = b.read_canonical()?;
            let mut out = vec![0.0f32; xv.len()];
            for ni in 0..n {
                for ci in 0..c {
                    let base = (ni * c + ci) * s;
                    for si in 0..s {
                        out[base + si] = wv[ci] * xv[base + si] + bv[ci];
                    }
                }
            }
            y.write_canonical(&out)
        })))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        let x = ctx.inputs[0].clone();
        let dy = ctx.output_grad.clone();
        let dx = ctx.input_grads[0].clone();
        let dw = ctx.weight_grads[0].clone();
        let db = ctx.weight_grads[1].clone();
        let w = self.weight.internal_memory()?.clone();
        let (n, c, s) = ncs(dy.layout().dims());
        Ok(Rc::new(FnPrimitive::new(format!("{}.scale_grad", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let g = dy.read_canonical()?;
            let wv = w.read_canonical()?;
            let mut out = vec![0.0f32; g.len()];
            let mut wgrad = vec![0.0f32; c];
            let mut bgrad = vec![0.0f32; c];
            for ni in 0..n {
                for ci in 0..c {
                    let base = (ni * c + ci) * s;
                    for si in 0..s {
                        out[base + si] = wv[ci] * g[base + si];
                        wgrad[ci] += g[base + si] * xv[base + si];
                        bgrad[ci] += g[base + si];
                    }
                }
            }
            dx.write_canonical(&out)?;
            dw.write_canonical(&wgrad)?;
            db.write_canonical(&bgrad)
        })))
    }

    fn weights(&self) -> Vec<&WeightSlot> {
        vec![&self.weight, &self.bias]
    }

    fn weights_mut(&mut self) -> Vec<&mut WeightSlot> {
        vec![&mut self.weight, &mut self.bias]
    }
}
