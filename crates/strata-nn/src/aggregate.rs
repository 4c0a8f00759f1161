use std::rc::Rc;

use strata_core::{
    Buffer, ConversionDirection, DType, DataHandle, Engine, Error, FnPrimitive, LayoutDescriptor,
    Memory, PrimitiveRef, Result,
};
use tracing::{debug, info};

// DiffAggregator — Summing gradients of a fan-out point
//
// A tensor read by several consumers receives one gradient from each. Each
// contribution arrives in the layout its consumer negotiated. The
// aggregator:
//
//   1. builds one Buffer per contributor; the first contributor's layout is
//      authoritative, every other contributor converts into exactly it
//   2. sums the converted views with one fused weighted-sum primitive
//      (scale 1.0 per contributor unless configured) into a result memory
//      held in the authoritative layout
//   3. is rebuilt, not refreshed, when the contributor set or any
//      contributor's layout changes.
//
// Because every view being summed has the same layout, the sum runs over
// raw storage, padding included (padding is zero in every view).

/// One incoming gradient.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub layout: LayoutDescriptor,
    pub data: DataHandle,
}

impl Contribution {
    pub fn new(layout: LayoutDescriptor, data: DataHandle) -> Self {
        Contribution { layout, data }
    }
}

pub struct DiffAggregator {
    label: String,
    signature: Vec<LayoutDescriptor>,
    buffers: Vec<Buffer>,
    layout: LayoutDescriptor,
    result: Memory,
    scales: Vec<f32>,
    primitive: PrimitiveRef,
}

impl DiffAggregator {
    /// Build an aggregator for `contributions`.
    ///
    /// `scales` has one coefficient per contributor; `None` means 1.0 each.
    pub fn new(
        label: impl Into<String>,
        contributions: &[Contribution],
        scales: Option<&[f32]>,
        engine: &Engine,
    ) -> Result<Self> {
        let label = label.into();
        let Some(first) = contributions.first() else {
            return Err(Error::contract(format!("{label}: no gradient contributions")));
        };
        let scales = match scales {
            Some(s) if s.len() != contributions.len() => {
                return Err(Error::config(format!(
                    "{label}: {} aggregation scales for {} contributors",
                    s.len(),
                    contributions.len()
                )))
            }
            Some(s) => s.to_vec(),
            None => vec![1.0; contributions.len()],
        };

        let dims = first.layout.dims().to_vec();
        let layout = first.layout.clone();
        let mut buffers = Vec::with_capacity(contributions.len());
        for (i, c) in contributions.iter().enumerate() {
            if c.layout.dims() != dims.as_slice() {
                return Err(Error::contract(format!(
                    "{label}: contributor {i} has dims {:?}, expected {:?}",
                    c.layout.dims(),
                    dims
                )));
            }
            let mut buf = Buffer::new(dims.clone(), DType::F32)?.with_label(format!("{label}.sum{i}"));
            buf.init_user(Some(c.data.clone()), c.layout.clone(), engine)?;
            if i == 0 {
                buf.init_no_conversion()?;
            } else {
                buf.init_conversion(&layout, ConversionDirection::UserToInternal)?;
            }
            if buf.internal_layout() != Some(&layout) {
                return Err(Error::contract(format!(
                    "{label}: contributor {i} cannot be reconciled with {layout}"
                )));
            }
            buffers.push(buf);
        }

        let result = engine.alloc(&layout)?;
        let views = buffers
            .iter()
            .map(|b| b.require_internal().cloned())
            .collect::<Result<Vec<Memory>>>()?;
        let primitive = weighted_sum(&label, views, scales.clone(), result.clone());
        info!(
            aggregator = %label,
            contributors = contributions.len(),
            layout = %layout,
            "create gradient aggregator"
        );
        Ok(DiffAggregator {
            label,
            signature: contributions.iter().map(|c| c.layout.clone()).collect(),
            buffers,
            layout,
            result,
            scales,
            primitive,
        })
    }

    /// Whether this aggregator was built for exactly these contributor layouts.
    pub fn matches(&self, contributions: &[Contribution]) -> bool {
        self.signature.len() == contributions.len()
            && self
                .signature
                .iter()
                .zip(contributions.iter())
                .all(|(l, c)| l == &c.layout)
    }

    pub fn mark_dirty(&mut self) {
        self.buffers.iter_mut().for_each(|b| b.mark_dirty());
    }

    /// Queue the conversions for every contributor, then the sum.
    pub fn submit(
        &mut self,
        pending: &mut Vec<PrimitiveRef>,
        contributions: &[Contribution],
    ) -> Result<()> {
        if !self.matches(contributions) {
            return Err(Error::contract(format!(
                "{}: contributor set changed without rebuilding",
                self.label
            )));
        }
        for (buf, c) in self.buffers.iter_mut().zip(contributions.iter()) {
            buf.submit(pending, Some(&c.data))?;
        }
        debug!(aggregator = %self.label, "queue weighted sum");
        pending.push(self.primitive.clone());
        Ok(())
    }

    /// Authoritative layout of the summed gradient.
    pub fn layout(&self) -> &LayoutDescriptor {
        &self.layout
    }

    pub fn result(&self) -> &Memory {
        &self.result
    }

    pub fn result_data(&self) -> DataHandle {
        self.result.data_handle()
    }

    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    pub fn contributors(&self) -> usize {
        self.buffers.len()
    }

    /// Conversions run across all contributor buffers.
    pub fn conversions_executed(&self) -> u64 {
        self.buffers.iter().map(|b| b.conversions_executed()).sum()
    }
}

fn weighted_sum(label: &str, views: Vec<Memory>, scales: Vec<f32>, out: Memory) -> PrimitiveRef {
    let prim = FnPrimitive::new(format!("{label}.sum"), move || {
        let out_data = out.data_handle();
        let mut acc = vec![0.0f32; out.layout().physical_len()];
        for (view, &scale) in views.iter().zip(scales.iter()) {
            view.data_handle().with_f32(|src| {
                for (a, s) in acc.iter_mut().zip(src.iter()) {
                    *a += scale * s;
                }
            })?;
        }
        out_data.with_f32_mut(|dst| dst[..acc.len()].copy_from_slice(&acc))
    });
    Rc::new(prim)
}
