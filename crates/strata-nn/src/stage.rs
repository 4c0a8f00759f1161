// Stage — One pipeline unit with its buffers, primitives and lifecycle
//
// A Stage is a single generic struct. Everything that differs between kinds
// (what shape comes out, which layouts the primitive wants, the kernel
// itself) lives behind the small `StageOps` capability trait. The Stage
// owns the part that is the same for every kind:
//
//   configure()           Unconfigured → Configured on first call, on any
//                         change of input shapes / offered layouts / mode.
//                         Builds input buffers, the output buffer, weights
//                         and the forward primitive, all or nothing.
//   forward()             per call: submit weights and inputs, queue the
//                         primitive, submit the output.
//   configure_backward()  lazily, once per forward reconfiguration (or when
//                         the offered gradient layout changes).
//   backward()            per call: submit the output gradient, queue the
//                         primitive, submit the input and weight gradients.
//
// Forward and backward keep separate buffers because the gradient
// primitive may want a different layout than the value primitive for the
// same logical tensor.

use std::fmt;

use strata_core::{
    format_flow, Buffer, ConversionDirection, DType, DataHandle, Engine, Error, LayoutDescriptor,
    Memory, PrimitiveRef, Result, Shape,
};
use tracing::{debug, info, trace};

use crate::negotiate::{negotiate_input, Negotiated, PublishedLayout};
use crate::weight::WeightSlot;

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unconfigured,
    Configured,
}

/// Internal layouts chosen for the forward primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardLayouts {
    pub inputs: Vec<LayoutDescriptor>,
    pub output: LayoutDescriptor,
}

/// Internal layouts chosen for the backward primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackwardLayouts {
    pub output_grad: LayoutDescriptor,
    pub input_grads: Vec<LayoutDescriptor>,
}

/// Memories a forward primitive is bound to.
pub struct ForwardContext<'a> {
    pub stage: &'a str,
    /// Internal views of the inputs.
    pub inputs: &'a [Memory],
    /// Internal view of the output.
    pub output: &'a Memory,
    pub training: bool,
}

/// Memories a backward primitive is bound to.
pub struct BackwardContext<'a> {
    pub stage: &'a str,
    /// Forward internal views of the inputs (the values).
    pub inputs: &'a [Memory],
    /// Forward internal view of the output.
    pub output: &'a Memory,
    /// Internal view of the incoming gradient.
    pub output_grad: &'a Memory,
    /// Internal views of the gradients this stage produces.
    pub input_grads: &'a [Memory],
    /// Internal views of the weight gradients, in `weights()` order.
    pub weight_grads: &'a [Memory],
    pub training: bool,
}

/// Per-kind behaviour of a stage.
pub trait StageOps {
    /// Registry name of the kind ("relu", "scale", ...).
    fn kind(&self) -> &'static str;

    /// Whether the stage takes part in layout negotiation. A
    /// non-participating stage works in canonical layouts only and never
    /// publishes.
    fn participates(&self) -> bool {
        true
    }

    /// Whether the stage offers its internal output layout (and its input
    /// gradient layouts) to neighbours. Defaults to `participates()`.
    fn publishes(&self) -> bool {
        self.participates()
    }

    /// Output shape for these input shapes; fails on static constraint
    /// violations.
    fn infer_output(&self, stage: &str, inputs: &[Shape]) -> Result<Shape>;

    /// Whether input `index` may take `offered` as its user layout.
    fn accepts(&self, _index: usize, _offered: &LayoutDescriptor) -> bool {
        self.participates()
    }

    /// Whether the incoming gradient may arrive in `offered`.
    fn accepts_grad(&self, _offered: &LayoutDescriptor) -> bool {
        self.participates()
    }

    /// Internal layouts the forward primitive wants, given the negotiated
    /// user layouts of the inputs.
    fn forward_layouts(
        &self,
        stage: &str,
        inputs: &[LayoutDescriptor],
        output: &Shape,
    ) -> Result<ForwardLayouts>;

    /// Internal layouts the backward primitive wants. Defaults to the
    /// forward choice.
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

    fn build_forward(&mut self, ctx: &ForwardContext<'_>) -> Result<PrimitiveRef>;

    fn build_backward(&mut self, ctx: &BackwardContext<'_>) -> Result<PrimitiveRef>;

    fn weights(&self) -> Vec<&WeightSlot> {
        Vec::new()
    }

    fn weights_mut(&mut self) -> Vec<&mut WeightSlot> {
        Vec::new()
    }
}

/// What the driver knows about one input at configuration time.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub shape: Shape,
    /// Producer-owned storage, or `None` when the caller binds it per call.
    pub data: Option<DataHandle>,
    pub published: Option<PublishedLayout>,
}

impl StageInput {
    pub fn new(shape: impl Into<Shape>) -> Self {
        StageInput {
            shape: shape.into(),
            data: None,
            published: None,
        }
    }

    pub fn with_data(mut self, data: DataHandle) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_published(mut self, published: Option<PublishedLayout>) -> Self {
        self.published = published;
        self
    }
}

/// Environment shared by every stage of a pipeline.
#[derive(Debug, Clone)]
pub struct StageEnv {
    pub engine: Engine,
    pub training: bool,
    pub log_format_flow: bool,
}

impl StageEnv {
    pub fn new(engine: &Engine) -> Self {
        StageEnv {
            engine: engine.clone(),
            training: false,
            log_format_flow: false,
        }
    }

    pub fn with_training(mut self, training: bool) -> Self {
        self.training = training;
        self
    }

    pub fn with_log_format_flow(mut self, enabled: bool) -> Self {
        self.log_format_flow = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardKey {
    shapes: Vec<Shape>,
    offered: Vec<Option<LayoutDescriptor>>,
    publish: bool,
    training: bool,
}

struct ForwardBinding {
    inputs: Vec<Buffer>,
    decisions: Vec<Negotiated>,
    output: Buffer,
    output_shape: Shape,
    layouts: ForwardLayouts,
    primitive: PrimitiveRef,
    published: Option<LayoutDescriptor>,
}

struct BackwardBinding {
    offered: Option<LayoutDescriptor>,
    producers: Vec<bool>,
    output_grad: Buffer,
    input_grads: Vec<Buffer>,
    primitive: PrimitiveRef,
    published: Vec<Option<LayoutDescriptor>>,
}

/// A pipeline stage.
pub struct Stage {
    name: String,
    ops: Box<dyn StageOps>,
    state: StageState,
    key: Option<ForwardKey>,
    fwd: Option<ForwardBinding>,
    bwd: Option<BackwardBinding>,
    needs_backward_reset: bool,
    configure_count: u64,
    backward_configure_count: u64,
}

impl Stage {
    pub fn new(name: impl Into<String>, ops: Box<dyn StageOps>) -> Self {
        Stage {
            name: name.into(),
            ops,
            state: StageState::Unconfigured,
            key: None,
            fwd: None,
            bwd: None,
            needs_backward_reset: false,
            configure_count: 0,
            backward_configure_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.ops.kind()
    }

    pub fn participates(&self) -> bool {
        self.ops.participates()
    }

    pub fn ops(&self) -> &dyn StageOps {
        self.ops.as_ref()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    /// Number of forward (re)configurations so far.
    pub fn configure_count(&self) -> u64 {
        self.configure_count
    }

    pub fn backward_configure_count(&self) -> u64 {
        self.backward_configure_count
    }

    pub fn needs_backward_reset(&self) -> bool {
        self.needs_backward_reset
    }

    /// Bring the stage to Configured for these inputs.
    ///
    /// Returns `true` if buffers and primitive were (re)built, `false` if
    /// the existing configuration already matches. On error the stage is
    /// left Unconfigured.
    pub fn configure(
        &mut self,
        inputs: &[StageInput],
        publish_output: bool,
        env: &StageEnv,
    ) -> Result<bool> {
        let publish = publish_output && self.ops.publishes();
        let key = ForwardKey {
            shapes: inputs.iter().map(|i| i.shape.clone()).collect(),
            offered: inputs
                .iter()
                .map(|i| i.published.as_ref().map(|p| p.layout.clone()))
                .collect(),
            publish,
            training: env.training,
        };
        if self.state == StageState::Configured && self.key.as_ref() == Some(&key) {
            return Ok(false);
        }

        // all or nothing: drop the old binding before building the new one
        self.state = StageState::Unconfigured;
        self.key = None;
        self.fwd = None;
        self.bwd = None;

        let binding = self.build_forward(inputs, publish, env)?;
        info!(
            stage = %self.name,
            kind = self.ops.kind(),
            batch = binding.output_shape.batch(),
            output = %binding.output_shape,
            "reshape batch size"
        );
        for (i, buf) in binding.inputs.iter().enumerate() {
            let flow = format_flow(buf, &binding.output);
            if env.log_format_flow {
                info!(stage = %self.name, input = i, decision = %binding.decisions[i].decision, "data format flow: {}", flow);
            } else {
                debug!(stage = %self.name, input = i, decision = %binding.decisions[i].decision, "data format flow: {}", flow);
            }
        }

        self.fwd = Some(binding);
        self.key = Some(key);
        self.state = StageState::Configured;
        self.needs_backward_reset = true;
        self.configure_count += 1;
        Ok(true)
    }

    fn build_forward(
        &mut self,
        inputs: &[StageInput],
        publish: bool,
        env: &StageEnv,
    ) -> Result<ForwardBinding> {
        let shapes: Vec<Shape> = inputs.iter().map(|i| i.shape.clone()).collect();
        let output_shape = self.ops.infer_output(&self.name, &shapes)?;

        let mut decisions = Vec::with_capacity(inputs.len());
        let mut user_layouts = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let canonical = LayoutDescriptor::canonical(input.shape.dims())?;
            let ops = &self.ops;
            let negotiated =
                negotiate_input(&self.name, input.published.as_ref(), &canonical, |l| {
                    ops.accepts(i, l)
                });
            user_layouts.push(negotiated.layout.clone());
            decisions.push(negotiated);
        }

        let layouts = self
            .ops
            .forward_layouts(&self.name, &user_layouts, &output_shape)?;
        if layouts.inputs.len() != inputs.len() {
            return Err(Error::contract(format!(
                "{}: {} internal layouts for {} inputs",
                self.name,
                layouts.inputs.len(),
                inputs.len()
            )));
        }

        let mut buffers = Vec::with_capacity(inputs.len());
        for (i, input) in inputs.iter().enumerate() {
            let mut buf = Buffer::new(input.shape.dims().to_vec(), DType::F32)?
                .with_label(format!("{}.in{}", self.name, i));
            buf.init_user(input.data.clone(), user_layouts[i].clone(), &env.engine)?;
            buf.init_conversion(&layouts.inputs[i], ConversionDirection::UserToInternal)?;
            buffers.push(buf);
        }

        let out_user = if publish {
            layouts.output.clone()
        } else {
            LayoutDescriptor::canonical(output_shape.dims())?
        };
        let mut output = Buffer::new(output_shape.dims().to_vec(), DType::F32)?
            .with_label(format!("{}.out", self.name));
        output.init_user(None, out_user, &env.engine)?;
        output.init_conversion(&layouts.output, ConversionDirection::InternalToUser)?;

        for slot in self.ops.weights_mut() {
            slot.prepare(&env.engine)?;
        }

        let views = buffers
            .iter()
            .map(|b| b.require_internal().cloned())
            .collect::<Result<Vec<Memory>>>()?;
        let out_view = output.require_internal()?.clone();
        let primitive = self.ops.build_forward(&ForwardContext {
            stage: &self.name,
            inputs: &views,
            output: &out_view,
            training: env.training,
        })?;

        Ok(ForwardBinding {
            inputs: buffers,
            decisions,
            output,
            output_shape,
            published: publish.then(|| layouts.output.clone()),
            layouts,
            primitive,
        })
    }

    fn forward_binding(&self) -> Result<&ForwardBinding> {
        self.fwd
            .as_ref()
            .ok_or_else(|| Error::msg(format!("stage '{}' is not configured", self.name)))
    }

    fn forward_binding_mut(&mut self) -> Result<&mut ForwardBinding> {
        let name = &self.name;
        self.fwd
            .as_mut()
            .ok_or_else(|| Error::msg(format!("stage '{}' is not configured", name)))
    }

    /// Reset the per-invocation marker of every forward buffer and weight.
    pub fn mark_dirty(&mut self) {
        if let Some(b) = self.fwd.as_mut() {
            b.inputs.iter_mut().for_each(|buf| buf.mark_dirty());
            b.output.mark_dirty();
        }
        for slot in self.ops.weights_mut() {
            slot.mark_dirty();
        }
    }

    /// Queue this stage's forward work. `inputs[i]` is the current storage
    /// for input `i` (`None` keeps the bound storage).
    pub fn forward(
        &mut self,
        pending: &mut Vec<PrimitiveRef>,
        inputs: &[Option<&DataHandle>],
    ) -> Result<()> {
        for slot in self.ops.weights_mut() {
            slot.submit(pending)?;
        }
        let name = self.name.clone();
        let binding = self.forward_binding_mut()?;
        if inputs.len() != binding.inputs.len() {
            return Err(Error::msg(format!(
                "stage '{}': {} input handles for {} inputs",
                name,
                inputs.len(),
                binding.inputs.len()
            )));
        }
        for (buf, data) in binding.inputs.iter_mut().zip(inputs.iter()) {
            buf.submit(pending, *data)?;
        }
        trace!(stage = %name, "queue forward primitive");
        pending.push(binding.primitive.clone());
        binding.output.submit(pending, None)?;
        Ok(())
    }

    /// Internal layout of the output, if it is offered to consumers.
    pub fn published_output(&self) -> Option<PublishedLayout> {
        self.fwd
            .as_ref()
            .and_then(|b| b.published.clone())
            .map(|l| PublishedLayout::new(self.name.clone(), l))
    }

    pub fn output_shape(&self) -> Result<Shape> {
        Ok(self.forward_binding()?.output_shape.clone())
    }

    /// User view of the output (what consumers read).
    pub fn output_memory(&self) -> Result<&Memory> {
        self.forward_binding()?.output.require_user()
    }

    pub fn output_buffer(&self) -> Option<&Buffer> {
        self.fwd.as_ref().map(|b| &b.output)
    }

    pub fn input_buffer(&self, index: usize) -> Option<&Buffer> {
        self.fwd.as_ref().and_then(|b| b.inputs.get(index))
    }

    pub fn input_decision(&self, index: usize) -> Option<&Negotiated> {
        self.fwd.as_ref().and_then(|b| b.decisions.get(index))
    }

    pub fn forward_layouts(&self) -> Option<&ForwardLayouts> {
        self.fwd.as_ref().map(|b| &b.layouts)
    }

    pub fn weights(&self) -> Vec<&WeightSlot> {
        self.ops.weights()
    }

    /// Bring the backward binding up to date.
    ///
    /// `offered` is the layout the incoming gradient is published in,
    /// `data` its storage. `producers[i]` tells whether the producer of
    /// input `i` participates, in which case the gradient for it is left in
    /// the internal layout and published.
    pub fn configure_backward(
        &mut self,
        offered: Option<&PublishedLayout>,
        data: Option<DataHandle>,
        producers: &[bool],
        env: &StageEnv,
    ) -> Result<bool> {
        let offered_layout = offered.map(|p| p.layout.clone());
        if !self.needs_backward_reset {
            if let Some(b) = self.bwd.as_ref() {
                if b.offered == offered_layout && b.producers.as_slice() == producers {
                    return Ok(false);
                }
            }
        }
        self.bwd = None;
        for slot in self.ops.weights_mut() {
            slot.prepare_grad(&env.engine)?;
        }

        let fwd = self.forward_binding()?;
        if producers.len() != fwd.inputs.len() {
            return Err(Error::msg(format!(
                "stage '{}': {} producer flags for {} inputs",
                self.name,
                producers.len(),
                fwd.inputs.len()
            )));
        }
        let out_dims = fwd.output_shape.dims().to_vec();
        let canonical = LayoutDescriptor::canonical(&out_dims)?;
        let ops = &self.ops;
        let negotiated = negotiate_input(&self.name, offered, &canonical, |l| ops.accepts_grad(l));
        let layouts = self
            .ops
            .backward_layouts(&self.name, &fwd.layouts, &negotiated.layout)?;

        let mut output_grad = Buffer::new(out_dims, DType::F32)?
            .with_label(format!("{}.out_grad", self.name));
        output_grad.init_user(data, negotiated.layout.clone(), &env.engine)?;
        output_grad.init_conversion(&layouts.output_grad, ConversionDirection::UserToInternal)?;

        let mut input_grads = Vec::with_capacity(fwd.inputs.len());
        let mut published = Vec::with_capacity(fwd.inputs.len());
        for (i, buf) in fwd.inputs.iter().enumerate() {
            let intl = layouts.input_grads.get(i).cloned().ok_or_else(|| {
                Error::contract(format!("{}: no gradient layout for input {}", self.name, i))
            })?;
            let publish = producers[i] && self.ops.publishes();
            let user = if publish {
                intl.clone()
            } else {
                LayoutDescriptor::canonical(buf.dims())?
            };
            let mut grad = Buffer::new(buf.dims().to_vec(), DType::F32)?
                .with_label(format!("{}.in{}_grad", self.name, i));
            grad.init_user(None, user, &env.engine)?;
            grad.init_conversion(&intl, ConversionDirection::InternalToUser)?;
            published.push(publish.then_some(intl));
            input_grads.push(grad);
        }

        let views = fwd
            .inputs
            .iter()
            .map(|b| b.require_internal().cloned())
            .collect::<Result<Vec<Memory>>>()?;
        let out_view = fwd.output.require_internal()?.clone();
        let grad_views = input_grads
            .iter()
            .map(|b| b.require_internal().cloned())
            .collect::<Result<Vec<Memory>>>()?;
        let out_grad_view = output_grad.require_internal()?.clone();
        let weight_grad_views = self
            .ops
            .weights()
            .iter()
            .map(|w| w.grad_internal_memory().cloned())
            .collect::<Result<Vec<Memory>>>()?;
        let name = self.name.clone();
        let primitive = self.ops.build_backward(&BackwardContext {
            stage: &name,
            inputs: &views,
            output: &out_view,
            output_grad: &out_grad_view,
            input_grads: &grad_views,
            weight_grads: &weight_grad_views,
            training: env.training,
        })?;

        let flow = format_flow(&output_grad, input_grads.first().unwrap_or(&output_grad));
        if env.log_format_flow {
            info!(stage = %self.name, "backward data format flow: {}", flow);
        } else {
            debug!(stage = %self.name, "backward data format flow: {}", flow);
        }

        self.bwd = Some(BackwardBinding {
            offered: offered_layout,
            producers: producers.to_vec(),
            output_grad,
            input_grads,
            primitive,
            published,
        });
        self.needs_backward_reset = false;
        self.backward_configure_count += 1;
        Ok(true)
    }

    fn backward_binding(&self) -> Result<&BackwardBinding> {
        self.bwd.as_ref().ok_or_else(|| {
            Error::msg(format!("stage '{}': backward is not configured", self.name))
        })
    }

    pub fn mark_backward_dirty(&mut self) {
        if let Some(b) = self.bwd.as_mut() {
            b.output_grad.mark_dirty();
            b.input_grads.iter_mut().for_each(|g| g.mark_dirty());
        }
        for slot in self.ops.weights_mut() {
            slot.mark_grad_dirty();
        }
    }

    /// Queue this stage's backward work.
    pub fn backward(
        &mut self,
        pending: &mut Vec<PrimitiveRef>,
        output_grad: Option<&DataHandle>,
    ) -> Result<()> {
        let name = self.name.clone();
        let binding = self
            .bwd
            .as_mut()
            .ok_or_else(|| Error::msg(format!("stage '{}': backward is not configured", name)))?;
        binding.output_grad.submit(pending, output_grad)?;
        trace!(stage = %name, "queue backward primitive");
        pending.push(binding.primitive.clone());
        for g in binding.input_grads.iter_mut() {
            g.submit(pending, None)?;
        }
        for slot in self.ops.weights_mut() {
            slot.submit_grad(pending)?;
        }
        Ok(())
    }

    /// Layout the gradient for input `index` is published in.
    pub fn published_input_grad(&self, index: usize) -> Option<PublishedLayout> {
        self.bwd
            .as_ref()
            .and_then(|b| b.published.get(index).cloned().flatten())
            .map(|l| PublishedLayout::new(self.name.clone(), l))
    }

    /// User view of the gradient for input `index`.
    pub fn input_grad_memory(&self, index: usize) -> Result<&Memory> {
        let b = self.backward_binding()?;
        b.input_grads
            .get(index)
            .ok_or_else(|| Error::msg(format!("stage '{}': no input {}", self.name, index)))?
            .require_user()
    }

    pub fn output_grad_buffer(&self) -> Option<&Buffer> {
        self.bwd.as_ref().map(|b| &b.output_grad)
    }

    pub fn input_grad_buffer(&self, index: usize) -> Option<&Buffer> {
        self.bwd.as_ref().and_then(|b| b.input_grads.get(index))
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("kind", &self.ops.kind())
            .field("state", &self.state)
            .field("configure_count", &self.configure_count)
            .finish()
    }
}
