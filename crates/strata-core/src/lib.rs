//! # strata-core
//!
//! Layout descriptors, host buffers and the conversion cache for strata.
//!
//! This crate provides:
//! - [`LayoutDescriptor`] / [`Format`] — logical dims + physical element order
//! - [`DataHandle`] / [`Memory`] — shared storage with pointer identity, layout-tagged views
//! - [`Engine`] / [`Stream`] — allocation accounting and batched execution
//! - [`Reorder`] — the conversion primitive
//! - [`Buffer`] — user view, internal view and the memoized conversion between them
// - DType: element types; only f32 is accepted by buffers
// - Shape: logical dims in canonical order
// - Layout: format, block factor, offsets, physical equivalence
// - Buffer: init_user / init_conversion / submit / mark_dirty

pub mod buffer;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod layout;
pub mod memory;
pub mod primitive;
pub mod reorder;
pub mod shape;
pub mod stream;
pub mod tensor;

pub use buffer::{format_flow, Buffer, ConversionDirection};
pub use dtype::{DType, WithDType};
pub use engine::{Engine, EngineStats};
pub use error::{Error, Result};
pub use layout::{Format, LayoutDescriptor};
pub use memory::{DataHandle, HostElement, HostStorage, Memory};
pub use primitive::{FnPrimitive, Primitive, PrimitiveRef};
pub use reorder::{reorder_into, Reorder};
pub use shape::Shape;
pub use stream::Stream;
pub use tensor::HostTensor;
