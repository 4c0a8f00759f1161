use std::rc::Rc;

use strata_core::{
    Buffer, ConversionDirection, DType, DataHandle, Engine, Error, HostTensor, LayoutDescriptor,
    Memory, PrimitiveRef, Reorder, Result, Stream,
};
use tracing::info;

// WeightSlot — A parameter tensor negotiated like any other input
//
// The surrounding framework owns weight values in the canonical weight
// layout (oi / oihw / x). A primitive may want them in another layout.
// Two policies:
//
//   External — the canonical storage stays authoritative. The weight buffer
//              converts it into the internal layout on every invocation.
//   Internal — at first preparation the values are converted once into the
//              internal layout and the slot's storage is rebound to that
//              copy. No per-step conversion happens afterwards;
//              export_canonical() converts back on demand.
//
// Weights do not change shape with the batch, so a slot is prepared once
// and survives stage reconfigurations.
//
// The gradient of a weight has its own buffer. The backward primitive
// writes it in the internal layout; the user view is always the canonical
// weight layout, whichever policy the values follow, and the conversion
// runs InternalToUser after the primitive.

/// Storage policy for weights whose internal layout differs from canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightFormat {
    #[default]
    External,
    Internal,
}

pub struct WeightSlot {
    name: String,
    dims: Vec<usize>,
    canonical: LayoutDescriptor,
    internal: LayoutDescriptor,
    policy: WeightFormat,
    storage: DataHandle,
    storage_layout: LayoutDescriptor,
    buffer: Option<Buffer>,
    grad: Option<Buffer>,
    persisted: u64,
}

impl WeightSlot {
    /// Slot holding `values` (canonical order) for a weight of `dims`.
    pub fn new(
        name: impl Into<String>,
        dims: &[usize],
        values: Vec<f32>,
        internal: LayoutDescriptor,
        policy: WeightFormat,
    ) -> Result<Self> {
        let name = name.into();
        let canonical = LayoutDescriptor::canonical_weight(dims)?;
        if values.len() != canonical.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: canonical.elem_count(),
                got: values.len(),
            });
        }
        if internal.dims() != dims {
            return Err(Error::contract(format!(
                "weight {name}: internal layout {internal} does not match dims {dims:?}"
            )));
        }
        Ok(WeightSlot {
            name,
            dims: dims.to_vec(),
            storage_layout: canonical.clone(),
            canonical,
            internal,
            policy,
            storage: DataHandle::from_vec(values),
            buffer: None,
            grad: None,
            persisted: 0,
        })
    }

    /// Bind the weight buffer. A no-op once prepared.
    pub fn prepare(&mut self, engine: &Engine) -> Result<()> {
        if self.buffer.is_some() {
            return Ok(());
        }
        let mut buffer = Buffer::new(self.dims.clone(), DType::F32)?
            .with_label(format!("weight.{}", self.name));
        match self.policy {
            WeightFormat::External => {
                buffer.init_user(Some(self.storage.clone()), self.storage_layout.clone(), engine)?;
                buffer.init_conversion(&self.internal, ConversionDirection::UserToInternal)?;
            }
            WeightFormat::Internal => {
                if self.storage_layout != self.internal {
                    self.persist_internal(engine)?;
                }
                buffer.init_user(Some(self.storage.clone()), self.storage_layout.clone(), engine)?;
                buffer.init_no_conversion()?;
            }
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    fn persist_internal(&mut self, engine: &Engine) -> Result<()> {
        let src = Memory::new(self.storage_layout.clone(), self.storage.clone())?;
        let dst = engine.alloc(&self.internal)?;
        let reorder: PrimitiveRef = Rc::new(Reorder::new(src, dst.clone())?);
        Stream::new(engine).submit(&[reorder])?;
        info!(
            weight = %self.name,
            from = %self.storage_layout,
            to = %self.internal,
            "weight persisted in internal layout"
        );
        self.storage = dst.data_handle();
        self.storage_layout = self.internal.clone();
        self.persisted += 1;
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        if let Some(b) = self.buffer.as_mut() {
            b.mark_dirty();
        }
    }

    pub fn submit(&mut self, pending: &mut Vec<PrimitiveRef>) -> Result<()> {
        match self.buffer.as_mut() {
            Some(b) => b.submit(pending, None),
            None => Err(Error::contract(format!(
                "weight {}: submit before prepare",
                self.name
            ))),
        }
    }

    /// Bind the gradient buffer. A no-op once prepared.
    pub fn prepare_grad(&mut self, engine: &Engine) -> Result<()> {
        if self.grad.is_some() {
            return Ok(());
        }
        let mut grad = Buffer::new(self.dims.clone(), DType::F32)?
            .with_label(format!("weight.{}_grad", self.name));
        grad.init_user(None, self.canonical.clone(), engine)?;
        grad.init_conversion(&self.internal, ConversionDirection::InternalToUser)?;
        self.grad = Some(grad);
        Ok(())
    }

    pub fn mark_grad_dirty(&mut self) {
        if let Some(g) = self.grad.as_mut() {
            g.mark_dirty();
        }
    }

    /// Queue the conversion of the gradient back to canonical. Goes after
    /// the backward primitive.
    pub fn submit_grad(&mut self, pending: &mut Vec<PrimitiveRef>) -> Result<()> {
        match self.grad.as_mut() {
            Some(g) => g.submit(pending, None),
            None => Err(Error::contract(format!(
                "weight {}: gradient submit before prepare_grad",
                self.name
            ))),
        }
    }

    /// The gradient view backward primitives write.
    pub fn grad_internal_memory(&self) -> Result<&Memory> {
        match self.grad.as_ref() {
            Some(g) => g.require_internal(),
            None => Err(Error::contract(format!(
                "weight {}: gradient not prepared",
                self.name
            ))),
        }
    }

    /// Gradient from the last backward call, canonical layout.
    pub fn export_grad(&self) -> Result<HostTensor> {
        match self.grad.as_ref() {
            Some(g) => HostTensor::from_memory(g.require_user()?),
            None => Err(Error::msg(format!(
                "weight {}: no gradient yet",
                self.name
            ))),
        }
    }

    pub fn grad_buffer(&self) -> Option<&Buffer> {
        self.grad.as_ref()
    }

    /// Per-call conversions run by the gradient buffer.
    pub fn grad_conversions_executed(&self) -> u64 {
        self.grad
            .as_ref()
            .map(|g| g.conversions_executed())
            .unwrap_or(0)
    }

    /// The view primitives read.
    pub fn internal_memory(&self) -> Result<&Memory> {
        match self.buffer.as_ref() {
            Some(b) => b.require_internal(),
            None => Err(Error::contract(format!(
                "weight {}: not prepared",
                self.name
            ))),
        }
    }

    /// Current values in canonical layout.
    pub fn export_canonical(&self) -> Result<HostTensor> {
        let mem = Memory::new(self.storage_layout.clone(), self.storage.clone())?;
        HostTensor::from_memory(&mem)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn policy(&self) -> WeightFormat {
        self.policy
    }

    pub fn canonical_layout(&self) -> &LayoutDescriptor {
        &self.canonical
    }

    pub fn internal_layout(&self) -> &LayoutDescriptor {
        &self.internal
    }

    /// Layout the slot's own storage is currently in.
    pub fn storage_layout(&self) -> &LayoutDescriptor {
        &self.storage_layout
    }

    pub fn storage(&self) -> &DataHandle {
        &self.storage
    }

    /// Per-invocation conversions run by the weight buffer.
    pub fn conversions_executed(&self) -> u64 {
        self.buffer
            .as_ref()
            .map(|b| b.conversions_executed())
            .unwrap_or(0)
    }

    /// One-time conversions into the internal layout (0 or 1).
    pub fn persisted_conversions(&self) -> u64 {
        self.persisted
    }
}
