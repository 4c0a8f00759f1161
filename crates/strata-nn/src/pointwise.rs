// Pointwise — 1×1 channel-mixing convolution
//
//   y[n, o, h, w] = Σ_i W[o, i] · x[n, i, h, w]
//
// This is the stage that shows the forward/backward asymmetry:
//
//   forward   channel-last nhwc for spatial > 1×1, canonical for 1×1 and
//             for [n, c] inputs. An nhwc layout offered at 1×1 is
//             rejected; it is physically the same as nchw there, so the
//             consumer simply re-tags it.
//   backward  channel-blocked nChw8c for rank-4 gradients.
//
// The weight W is [o, i] in canonical oi; the primitive reads it as io.
// With WeightFormat::Internal the transpose happens once, at the first
// configuration, instead of on every call.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, Format, LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::init::{kaiming_uniform, FanMode};
use crate::kernel::{blocked_or_canonical, expect_channel_rank, expect_inputs, has_spatial, ncs};
use crate::stage::{BackwardContext, BackwardLayouts, ForwardContext, ForwardLayouts, StageOps};
use crate::weight::{WeightFormat, WeightSlot};

/// Block factor of the backward gradient layout.
pub const POINTWISE_GRAD_BLOCK: usize = 8;

pub struct Pointwise {
    in_channels: usize,
    out_channels: usize,
    weight: WeightSlot,
}

impl Pointwise {
    /// Kaiming-uniform initialised weights.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        policy: WeightFormat,
        seed: Option<u64>,
    ) -> Result<Self> {
        let dims = [out_channels, in_channels];
        let values = kaiming_uniform(&dims, FanMode::FanIn, seed);
        Self::with_weights(in_channels, out_channels, values, policy)
    }

    /// Explicit weights, canonical [o, i] order.
    pub fn with_weights(
        in_channels: usize,
        out_channels: usize,
        weight: Vec<f32>,
        policy: WeightFormat,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(Error::config("pointwise needs non-zero channel counts"));
        }
        let dims = [out_channels, in_channels];
        let internal = LayoutDescriptor::plain(dims.to_vec(), Format::Io)?;
        Ok(Pointwise {
            in_channels,
            out_channels,
            weight: WeightSlot::new("weight", &dims, weight, internal, policy)?,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn weight(&self) -> &WeightSlot {
        &self.weight
    }

    fn forward_layout(dims: &[usize]) -> Result<LayoutDescriptor> {
        if has_spatial(dims) {
            LayoutDescriptor::plain(dims.to_vec(), Format::Nhwc)
        } else {
            LayoutDescriptor::canonical(dims)
        }
    }
}

impl StageOps for Pointwise {
    fn kind(&self) -> &'static str {
        "pointwise"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        let x = &inputs[0];
        expect_channel_rank(stage, x)?;
        if x.channels() != self.in_channels {
            return Err(Error::ShapeMismatch {
                stage: stage.to_string(),
                expected: x.with_channels(self.in_channels),
                got: x.clone(),
            });
        }
        Ok(x.with_channels(self.out_channels))
    }

    fn accepts(&self, _index: usize, offered: &LayoutDescriptor) -> bool {
        !(offered.format() == Format::Nhwc && !has_spatial(offered.dims()))
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        Ok(ForwardLayouts {
            inputs: vec![Self::forward_layout(inputs[0].dims())?],
            output: Self::forward_layout(output.dims())?,
        })
    }

    fn backward_layouts(
        &self,
        _stage: &str,
        forward: &ForwardLayouts,
        _output_grad: &LayoutDescriptor,
    ) -> Result<BackwardLayouts> {
        Ok(BackwardLayouts {
            output_grad: blocked_or_canonical(forward.output.dims(), POINTWISE_GRAD_BLOCK)?,
            input_grads: vec![blocked_or_canonical(
                forward.inputs[0].dims(),
                POINTWISE_GRAD_BLOCK,
            )?],
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let x = ctx.inputs[0].clone();
        let y = ctx.output.clone();
        let w = self.weight.internal_memory()?.clone();
        let (n, ci, s) = ncs(x.layout().dims());
        let co = self.out_channels;
        Ok(Rc::new(FnPrimitive::new(format!("{}.pointwise", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let wv = w.read_canonical()?;
            let mut out = vec![0.0f32; n * co * s];
            for ni in 0..n {
                for o in 0..co {
                    let dst = (ni * co + o) * s;
                    for i in 0..ci {
                        let wo = wv[o * ci + i];
                        let src = (ni * ci + i) * s;
                        for si in 0..s {
                            out[dst + si] += wo * xv[src + si];
                        }
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
        let w = self.weight.internal_memory()?.clone();
        let (n, co, s) = ncs(dy.layout().dims());
        let ci = self.in_channels;
        Ok(Rc::new(FnPrimitive::new(format!("{}.pointwise_grad", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let g = dy.read_canonical()?;
            let wv = w.read_canonical()?;
            let mut out = vec![0.0f32; n * ci * s];
            let mut wgrad = vec![0.0f32; co * ci];
            for ni in 0..n {
                for o in 0..co {
                    let src = (ni * co + o) * s;
                    for i in 0..ci {
                        let wo = wv[o * ci + i];
                        let dst = (ni * ci + i) * s;
                        for si in 0..s {
                            out[dst + si] += wo * g[src + si];
                            wgrad[o * ci + i] += g[src + si] * xv[dst + si];
                        }
                    }
                }
            }
            dx.write_canonical(&out)?;
            dw.write_canonical(&wgrad)
        })))
    }

    fn weights(&self) -> Vec<&WeightSlot> {
        vec![&self.weight]
    }

    fn weights_mut(&mut self) -> Vec<&mut WeightSlot> {
        vec![&mut self.weight]
    }
}
