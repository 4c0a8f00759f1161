//! # strata-nn
//!
//! Pipeline stages with layout negotiation for strata.
//!
//! 1. **Stage** — one generic lifecycle (configure / forward / backward)
//!    around a [`StageOps`] capability object
//! 2. **Negotiation** — adopting, re-tagging or converting a published layout
//! 3. **WeightSlot** — parameters as buffers, converted per call or once
//! 4. **DiffAggregator** — summing fan-out gradients in one authoritative layout
//! 5. **Kinds** — relu, tanh, scale, pointwise, batch_norm, addto, concat, reorder, reshape
//!
//! Kernels here are reference loops; what the crate is about is which
//! layouts they are bound to and how often anything gets converted.

pub mod activation;
pub mod addto;
pub mod aggregate;
pub mod batchnorm;
pub mod concat;
pub mod init;
mod kernel;
pub mod negotiate;
pub mod pointwise;
pub mod reorder;
pub mod reshape;
pub mod scale;
pub mod stage;
pub mod weight;

pub use activation::{ReLU, Tanh};
pub use addto::AddTo;
pub use aggregate::{Contribution, DiffAggregator};
pub use batchnorm::{select_layout, select_stat_source, BatchNorm, StatSource};
pub use concat::Concat;
pub use negotiate::{negotiate_input, Decision, Negotiated, PublishedLayout};
pub use pointwise::Pointwise;
pub use reorder::ReorderStage;
pub use reshape::Reshape;
pub use scale::Scale;
pub use stage::{
    BackwardContext, BackwardLayouts, ForwardContext, ForwardLayouts, Stage, StageEnv, StageInput,
    StageOps, StageState,
};
pub use weight::{WeightFormat, WeightSlot};
