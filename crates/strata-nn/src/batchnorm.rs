// BatchNorm — Per-channel batch normalization
//
// FORMULA:
//   x_hat = (x - mean) / sqrt(var + eps)
//   y     = gamma * x_hat + beta
//
// mean / var are computed per channel over (N, H, W) when batch statistics
// are used, or taken from the running statistics otherwise. In training
// with batch statistics the running values move by
//
//   running = maf * running + (1 - maf) * batch     (maf = moving_average_fraction)
//
// TWO SEPARATE DECISIONS:
//   select_stat_source(training, use_global_stats)  Batch or Global
//   select_layout(shape)                            internal layout
//
// Neither reads or writes state the other one depends on, and neither is
// made inside buffer construction. An explicit use_global_stats wins;
// without it, training uses batch statistics and inference uses global.

use std::cell::RefCell;
use std::rc::Rc;

use strata_core::{Error, FnPrimitive, Format, LayoutDescriptor, PrimitiveRef, Result, Shape};

use crate::init;
use crate::kernel::{blocked_or_canonical, expect_channel_rank, expect_inputs, has_spatial, ncs};
use crate::stage::{BackwardContext, ForwardContext, ForwardLayouts, StageOps};
use crate::weight::{WeightFormat, WeightSlot};

/// Where normalization statistics come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSource {
    /// Mean/variance of the current batch.
    Batch,
    /// Running (moving-average) statistics.
    Global,
}

/// Pick the statistics source.
pub fn select_stat_source(training: bool, use_global_stats: Option<bool>) -> StatSource {
    match use_global_stats {
        Some(true) => StatSource::Global,
        Some(false) => StatSource::Batch,
        None if training => StatSource::Batch,
        None => StatSource::Global,
    }
}

/// Block factor used by `select_layout`.
pub const BATCH_NORM_BLOCK: usize = 8;

/// Pick the internal layout for a tensor of `shape`.
pub fn select_layout(shape: &Shape) -> Result<LayoutDescriptor> {
    let dims = shape.dims();
    if dims.len() == 4 && dims[1] >= BATCH_NORM_BLOCK && has_spatial(dims) {
        blocked_or_canonical(dims, BATCH_NORM_BLOCK)
    } else {
        LayoutDescriptor::canonical(dims)
    }
}

#[derive(Debug)]
struct Stats {
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    /// Statistics used by the last forward call.
    used_mean: Vec<f32>,
    used_var: Vec<f32>,
    source: StatSource,
}

pub struct BatchNorm {
    channels: usize,
    eps: f32,
    moving_average_fraction: f32,
    use_global_stats: Option<bool>,
    gamma: WeightSlot,
    beta: WeightSlot,
    stats: Rc<RefCell<Stats>>,
}

impl BatchNorm {
    pub fn new(channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(Error::config("batch_norm needs at least one channel"));
        }
        let x = LayoutDescriptor::plain(vec![channels], Format::X)?;
        Ok(BatchNorm {
            channels,
            eps: 1e-5,
            moving_average_fraction: 0.9,
            use_global_stats: None,
            gamma: WeightSlot::new("gamma", &[channels], init::constant(&[channels], 1.0), x.clone(), WeightFormat::External)?,
            beta: WeightSlot::new("beta", &[channels], init::constant(&[channels], 0.0), x, WeightFormat::External)?,
            stats: Rc::new(RefCell::new(Stats {
                running_mean: vec![0.0; channels],
                running_var: vec![1.0; channels],
                used_mean: vec![0.0; channels],
                used_var: vec![1.0; channels],
                source: StatSource::Global,
            })),
        })
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_moving_average_fraction(mut self, maf: f32) -> Self {
        self.moving_average_fraction = maf;
        self
    }

    pub fn with_use_global_stats(mut self, use_global_stats: Option<bool>) -> Self {
        self.use_global_stats = use_global_stats;
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.stats.borrow().running_mean.clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.stats.borrow().running_var.clone()
    }

    /// Source used by the last forward call.
    pub fn last_stat_source(&self) -> StatSource {
        self.stats.borrow().source
    }
}

impl StageOps for BatchNorm {
    fn kind(&self) -> &'static str {
        "batch_norm"
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
        _inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts> {
        let layout = select_layout(output)?;
        Ok(ForwardLayouts {
            inputs: vec![layout.clone()],
            output: layout,
        })
    }

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef> {
        let source = select_stat_source(ctx.training, self.use_global_stats);
        let update_running = ctx.training && source == StatSource::Batch;
        let x = ctx.inputs[0].clone();
        let y = ctx.output.clone();
        let gamma = self.gamma.internal_memory()?.clone();
        let beta = self.beta.internal_memory()?.clone();
        let stats = self.stats.clone();
        let eps = self.eps;
        let maf = self.moving_average_fraction;
        let (n, c, s) = ncs(x.layout().dims());
        let count = (n * s) as f32;

        Ok(Rc::new(FnPrimitive::new(format!("{}.batch_norm", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let g = gamma.read_canonical()?;
            let b = beta.read_canonical()?;
            let mut st = stats.borrow_mut();
            let (mean, var) = match source {
                StatSource::Global => (st.running_mean.clone(), st.running_var.clone()),
                StatSource::Batch => {
                    let mut mean = vec![0.0f32; c];
                    let mut var = vec![0.0f32; c];
                    for ni in 0..n {
                        for ci in 0..c {
                            let base = (ni * c + ci) * s;
                            mean[ci] += xv[base..base + s].iter().sum::<f32>();
                        }
                    }
                    mean.iter_mut().for_each(|m| *m /= count);
                    for ni in 0..n {
                        for ci in 0..c {
                            let base = (ni * c + ci) * s;
                            var[ci] += xv[base..base + s]
                                .iter()
                                .map(|v| (v - mean[ci]) * (v - mean[ci]))
                                .sum::<f32>();
                        }
                    }
                    var.iter_mut().for_each(|v| *v /= count);
                    (mean, var)
                }
            };
            if update_running {
                let st = &mut *st;
                for ((rm, rv), (m, v)) in st
                    .running_mean
                    .iter_mut()
                    .zip(st.running_var.iter_mut())
                    .zip(mean.iter().zip(var.iter()))
                {
                    *rm = maf * *rm + (1.0 - maf) * m;
                    *rv = maf * *rv + (1.0 - maf) * v;
                }
            }
            let mut out = vec![0.0f32; xv.len()];
            for ni in 0..n {
                for ci in 0..c {
                    let inv_std = 1.0 / (var[ci] + eps).sqrt();
                    let base = (ni * c + ci) * s;
                    for si in 0..s {
                        let x_hat = (xv[base + si] - mean[ci]) * inv_std;
                        out[base + si] = g[ci] * x_hat + b[ci];
                    }
                }
            }
            st.used_mean = mean;
            st.used_var = var;
            st.source = source;
            drop(st);
            y.write_canonical(&out)
        })))
    }

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef> {
        let x = ctx.inputs[0].clone();
        let dy = ctx.output_grad.clone();
        let dx = ctx.input_grads[0].clone();
        let dgamma = ctx.weight_grads[0].clone();
        let dbeta = ctx.weight_grads[1].clone();
        let gamma = self.gamma.internal_memory()?.clone();
        let stats = self.stats.clone();
        let eps = self.eps;
        let (n, c, s) = ncs(x.layout().dims());
        let count = (n * s) as f32;

        Ok(Rc::new(FnPrimitive::new(format!("{}.batch_norm_grad", ctx.stage), move || {
            let xv = x.read_canonical()?;
            let gv = dy.read_canonical()?;
            let g = gamma.read_canonical()?;
            let st = stats.borrow();
            let mut out = vec![0.0f32; xv.len()];
            let mut sum_dy = vec![0.0f32; c];
            let mut sum_dy_xhat = vec![0.0f32; c];
            for ci in 0..c {
                let inv_std = 1.0 / (st.used_var[ci] + eps).sqrt();
                for ni in 0..n {
                    let base = (ni * c + ci) * s;
                    for si in 0..s {
                        let x_hat = (xv[base + si] - st.used_mean[ci]) * inv_std;
                        sum_dy[ci] += gv[base + si];
                        sum_dy_xhat[ci] += gv[base + si] * x_hat;
                    }
                }
                let scale = g[ci] * inv_std;
                for ni in 0..n {
                    let base = (ni * c + ci) * s;
                    for si in 0..s {
                        out[base + si] = match st.source {
                            StatSource::Global => scale * gv[base + si],
                            StatSource::Batch => {
                                let x_hat = (xv[base + si] - st.used_mean[ci]) * inv_std;
                                scale
                                    * (gv[base + si]
                                        - sum_dy[ci] / count
                                        - x_hat * sum_dy_xhat[ci] / count)
                            }
                        };
                    }
                }
            }
            drop(st);
            dx.write_canonical(&out)?;
            dgamma.write_canonical(&sum_dy_xhat)?;
            dbeta.write_canonical(&sum_dy)
        })))
    }

    fn weights(&self) -> Vec<&WeightSlot> {
        vec![&self.gamma, &self.beta]
    }

    fn weights_mut(&mut self) -> Vec<&mut WeightSlot> {
        vec![&mut self.gamma, &mut self.beta]
    }
}
