// Concat — Channel concatenation
//
//   [n, c0, h, w] ++ [n, c1, h, w] ++ ... → [n, c0 + c1 + ..., h, w]
//
// All inputs must agree on batch and spatial extent. When every input
// arrives in the same format (and, for blocked formats, each input's
// channel count is a multiple of the block) the output is produced in that
// format; otherwise everything is computed canonically. Backward splits the
// gradient back along the channel axis.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, LayoutDescriptor, Memory, PrimitiveRef, Result, Shape};

use crate::kernel::{expect_channel_rank, expect_some_inputs, ncs};
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};

#[derive(Debug, Clone, Copy, Default)]
pub struct Concat;

impl Concat {
    pub fn new() -> Self {
        Concat
    }

    fn shared_layout(inputs: &[LayoutDescriptor], output: &Shape) -> Result<Option<ForwardLayouts>> {
        let first = &inputs[0];
        let same_format = inputs
            .iter()
            .all(|l| l.format() == first.format() && l.block() == first.block());
        let whole_blocks = match first.block() {
            Some(b) => inputs.iter().all(|l| l.dims()[1] % b == 0),
            None => true,
        };
        if !same_format || !whole_blocks {
            return Ok(None);
        }
        let output = LayoutDescriptor::new(output.dims().to_vec(), first.format(), first.block())?;
        Ok(Some(ForwardLayouts {
            inputs: inputs.to_vec(),
            output,
        }))
    }
}

impl StageOps for Concat {
    fn kind(&self) -> &'static str {
        "concat"
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_some_inputs(stage, self.kind(), inputs)?;
        let first = &inputs[0];
        expect_channel_rank(stage, first)?;
        let mut channels = 0;
        for s in inputs {
            let expected = first.with_channels(s.channels());
            if s != &expected {
                return Err(Error::ShapeMismatch {
                    stage: stage.to_string(),
                    expected,
                    got: s.clone(),
                });
            }
            channels += s.channels();
        }
        Ok(first.with_channels(channels))
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        if let Some(shared) = Self::shared_layout(inputs, output)? {
            return Ok(shared);
        }
        Ok(ForwardLayouts {
            inputs: inputs
                .iter()
                .map(|l| LayoutDescriptor::canonical(l.dims()))
                .collect::<Result<Vec<_>>>()?,
            output: LayoutDescriptor::canonical(output.dims())?,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let xs = ctx.inputs.to_vec();
        let y = ctx.output.clone();
        Ok(Rc::new(FnPrimitive::new(format!("{}.concat", ctx.stage), move || {
            let (n, c_out, s) = ncs(y.layout().dims());
            let mut out = vec![0.0f32; n * c_out * s];
            let mut offset = 0;
            for x in &xs {
                let (_, c, _) = ncs(x.layout().dims());
                let v = x.read_canonical()?;
                for ni in 0..n {
                    let src = ni * c * s;
                    let dst = (ni * c_out + offset) * s;
                    out[dst..dst + c * s].copy_from_slice(&v[src..src + c * s]);
                }
                offset += c;
            }
            y.write_canonical(&out)
        })))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        let dy = ctx.output_grad.clone();
        let dxs: Vec<Memory> = ctx.input_grads.to_vec();
        Ok(Rc::new(FnPrimitive::new(format!("{}.concat_grad", ctx.stage), move || {
            let (n, c_out, s) = ncs(dy.layout().dims());
            let g = dy.read_canonical()?;
            let mut offset = 0;
            for dx in &dxs {
                let (_, c, _) = ncs(dx.layout().dims());
                let mut part = vec![0.0f32; n * c * s];
                for ni in 0..n {
                    let src = (ni * c_out + offset) * s;
                    let dst = ni * c * s;
                    part[dst..dst + c * s].copy_from_slice(&g[src..src + c * s]);
                }
                dx.write_canonical(&part)?;
                offset += c;
            }
            Ok(())
        })))
    }
}
