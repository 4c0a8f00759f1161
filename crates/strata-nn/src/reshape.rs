// Reshape — Reinterpret the per-sample dims of a tensor
//
//   [n, c, h, w] → [n, d1, d2, d3]   or   [n, d1]
//
// The batch dim is kept; the per-sample dims come from the configuration,
// with at most one of them left open and inferred from the element count.
// Reinterpreting dims is only meaningful on canonical data, so:
//
//   input   accepts the canonical layout. A published layout that is
//           physically the same gets re-tagged; anything else (blocked,
//           channel-last with spatial extent) is converted on the way in.
//   output  canonical, never published. The new dims have nothing to do
//           with whatever layout the producer computes in.
//
// Backward is the same reinterpretation in the other direction.

use std::rc::Rc;

use strata_core::{Error, FnPrimitive, LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::kernel::expect_inputs;
use crate::stage::{BackwardContext, BackwardLayouts, ForwardContext, ForwardLayouts, StageOps};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reshape {
    sample: Vec<Option<usize>>,
}

impl Reshape {
    /// `sample` lists the dims after the batch dim; `None` marks the one
    /// inferred from the input.
    pub fn new(sample: Vec<Option<usize>>) -> Result<Self> {
        if sample.len() != 1 && sample.len() != 3 {
            return Err(Error::config(format!(
                "reshape needs 1 or 3 per-sample dims, got {}",
                sample.len()
            )));
        }
        if sample.iter().filter(|d| d.is_none()).count() > 1 {
            return Err(Error::config("reshape may leave at most one dim open"));
        }
        if sample.contains(&Some(0)) {
            return Err(Error::config(format!(
                "reshape dims {sample:?} contain a zero"
            )));
        }
        Ok(Reshape { sample })
    }

    /// Fully specified per-sample dims.
    pub fn to(sample: &[usize]) -> Result<Self> {
        Self::new(sample.iter().copied().map(Some).collect())
    }

    pub fn sample_dims(&self) -> &[Option<usize>] {
        &self.sample
    }
}

impl StageOps for Reshape {
    fn kind(&self) -> &'static str {
        "reshape"
    }

    fn publishes(&self) -> bool {
        false
    }

    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape> {
        expect_inputs(stage, self.kind(), inputs, 1)?;
        let x = &inputs[0];
        if x.rank() < 2 {
            return Err(Error::invalid_shape(
                stage,
                x.dims(),
                "reshape needs a batch dim and at least one sample dim",
            ));
        }
        if x.dims().contains(&0) {
            return Err(Error::invalid_shape(stage, x.dims(), "zero-length dimension"));
        }
        let batch = x.dims()[0];
        let per_sample = x.elem_count() / batch;
        let known: usize = self.sample.iter().flatten().product();
        let mut dims = Vec::with_capacity(self.sample.len() + 1);
        dims.push(batch);
        for d in &self.sample {
            match d {
                Some(d) => dims.push(*d),
                None => {
                    if per_sample % known != 0 {
                        return Err(Error::invalid_shape(
                            stage,
                            x.dims(),
                            format!("{per_sample} elements per sample do not divide by {known}"),
                        ));
                    }
                    dims.push(per_sample / known);
                }
            }
        }
        let out = Shape::new(dims);
        if out.elem_count() != x.elem_count() {
            return Err(Error::ShapeMismatch {
                stage: stage.to_string(),
                expected: out,
                got: x.clone(),
            });
        }
        Ok(out)
    }

    fn accepts(&self, _index: usize, offered: &LayoutDescriptor) -> bool {
        offered.is_canonical()
    }

    fn accepts_grad(&self, offered: &LayoutDescriptor) -> bool {
        offered.is_canonical()
    }

    fn forward_layouts(
        &self,
        _stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        Ok(ForwardLayouts {
            inputs: vec![LayoutDescriptor::canonical(inputs[0].dims())?],
            output: LayoutDescriptor::canonical(output.dims())?,
        })
    }

    fn backward_layouts(
        &self,
        _stage: &str,
        forward: &ForwardLayouts,
        _output_grad: &LayoutDescriptor,
    ) -> Result<BackwardLayouts> {
        Ok(BackwardLayouts {
            output_grad: forward.output.clone(),
            input_grads: forward.inputs.clone(),
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let x = ctx.inputs[0].clone();
        let y = ctx.output.clone();
        Ok(Rc::new(FnPrimitive::new(format!("{}.reshape", ctx.stage), move || {
            y.write_canonical(&x.read_canonical()?)
        })))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        let dy = ctx.output_grad.clone();
        let dx = ctx.input_grads[0].clone();
        Ok(Rc::new(FnPrimitive::new(format!("{}.reshape_grad", ctx.stage), move || {
            dx.write_canonical(&dy.read_canonical()?)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::{Decision, PublishedLayout};
    use crate::stage::{Stage, StageEnv, StageInput};
    use strata_core::{Engine, Format};

    #[test]
    fn test_open_dim_is_inferred() {
        let r = Reshape::new(vec![Some(2), None, Some(2)]).unwrap();
        let out = r.infer_output("r", &[Shape::from((3, 8, 2, 2))]).unwrap();
        assert_eq!(out.dims(), &[3, 2, 8, 2]);
        let flat = Reshape::new(vec![None]).unwrap();
        assert_eq!(
            flat.infer_output("r", &[Shape::from((3, 8, 2, 2))]).unwrap().dims(),
            &[3, 32]
        );
    }

    #[test]
    fn test_element_count_change_is_shape_mismatch() {
        let r = Reshape::to(&[4, 2, 2]).unwrap();
        match r.infer_output("r", &[Shape::from((1, 8, 2, 2))]) {
            Err(Error::ShapeMismatch { expected, got, .. }) => {
                assert_eq!(expected.dims(), &[1, 4, 2, 2]);
                assert_eq!(got.dims(), &[1, 8, 2, 2]);
            }
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
        let r = Reshape::new(vec![Some(3), None, Some(1)]).unwrap();
        assert!(matches!(
            r.infer_output("r", &[Shape::from((1, 8, 1, 1))]),
            Err(Error::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_config_validated() {
        assert!(Reshape::new(vec![Some(1), Some(2)]).is_err());
        assert!(Reshape::new(vec![None, None, Some(2)]).is_err());
        assert!(Reshape::new(vec![Some(0)]).is_err());
    }

    #[test]
    fn test_blocked_offer_converted_and_never_published() {
        let engine = Engine::cpu();
        let env = StageEnv::new(&engine);
        let offered = LayoutDescriptor::blocked(vec![2, 8, 2, 2], 8).unwrap();
        let data = engine.alloc(&offered).unwrap().data_handle();
        let input = StageInput::new(vec![2, 8, 2, 2])
            .with_data(data)
            .with_published(Some(PublishedLayout::new("prev", offered)));
        let mut stage = Stage::new("r", Box::new(Reshape::to(&[32]).unwrap()));
        stage.configure(&[input], true, &env).unwrap();
        assert_eq!(stage.input_decision(0).unwrap().decision, Decision::Foreign);
        assert!(stage.input_buffer(0).unwrap().needs_conversion());
        assert!(stage.published_output().is_none());
        assert_eq!(
            stage.output_buffer().unwrap().user_layout().unwrap().format(),
            Format::Nc
        );
    }

    #[test]
    fn test_equivalent_offer_is_retagged() {
        let engine = Engine::cpu();
        let env = StageEnv::new(&engine);
        let offered = LayoutDescriptor::plain(vec![2, 8, 1, 1], Format::Nhwc).unwrap();
        let data = engine.alloc(&offered).unwrap().data_handle();
        let input = StageInput::new(vec![2, 8, 1, 1])
            .with_data(data)
            .with_published(Some(PublishedLayout::new("prev", offered)));
        let mut stage = Stage::new("r", Box::new(Reshape::to(&[8]).unwrap()));
        stage.configure(&[input], false, &env).unwrap();
        assert_eq!(stage.input_decision(0).unwrap().decision, Decision::Retagged);
        assert!(!stage.input_buffer(0).unwrap().needs_conversion());
    }
}
