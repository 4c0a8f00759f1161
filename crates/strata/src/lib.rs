//! # strata
//!
//! Layout-negotiating compute pipelines with cached format conversion.
//!
//! A pipeline is a graph of stages. Each stage binds the tensors it
//! reads and writes to `Buffer`s, which hold a user view (what neighbours
//! see), an internal view (what the primitive wants) and at most one cached
//! conversion between them. Producers publish the layout they compute in;
//! consumers that accept it read with no conversion at all.
//!
//! ```ignore
//! use strata::prelude::*;
//!
//! let mut b = Pipeline::builder();
//! let x = b.input("x")?;
//! let s = b.stage("scale", Box::new(Scale::new(16)?), &[x])?;
//! b.stage("relu", Box::new(ReLU::new()), &[Source::Stage(s)])?;
//! let mut p = b.build()?;
//! let y = p.forward(&[Feed::from(&input)])?;
//! ```
//!
//! - `strata_core` holds layouts, buffers and primitives
//! - `strata_nn` holds the stage lifecycle and the built-in kinds
//! - this crate drives graphs, reads configs and sets up logging

pub mod config;
pub mod logging;
pub mod options;
pub mod parallel;
pub mod pipeline;
pub mod registry;

pub use strata_nn as nn;

pub use strata_core::{
    format_flow, Buffer, ConversionDirection, DType, DataHandle, Engine, EngineStats, Error,
    Format, HostTensor, LayoutDescriptor, Memory, Result, Shape, Stream,
};

pub use config::{AggregatorOptions, InputConfig, PipelineConfig, StageConfig};
pub use options::RuntimeOptions;
pub use parallel::evaluate_parallel;
pub use pipeline::{Feed, Pipeline, PipelineBuilder, Source, StageId};
pub use registry::{StageFactory, StageRegistry};

pub mod prelude {
    pub use crate::config::{PipelineConfig, StageConfig};
    pub use crate::options::RuntimeOptions;
    pub use crate::pipeline::{Feed, Pipeline, PipelineBuilder, Source, StageId};
    pub use crate::registry::StageRegistry;
    pub use strata_core::{
        DataHandle, Engine, Error, Format, HostTensor, LayoutDescriptor, Result, Shape,
    };
    pub use strata_nn::{
        AddTo, BatchNorm, Concat, Decision, Pointwise, ReLU, ReorderStage, Reshape, Scale,
        Stage, StageOps, Tanh, WeightFormat,
    };
}
