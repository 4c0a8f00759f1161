use std::fmt;

use serde::{Deserialize, Serialize};

// DType — Element types a host buffer can carry
//
// Host storage can hold any of these, but the conversion subsystem works in
// exactly one numeric type at a time: f32. Every Buffer is created for a
// fixed dtype and refuses to bind storage of any other type (TypeMismatch).
//
//   F16  — 16-bit IEEE half float
//   BF16 — 16-bit brain float
//   F32  — 32-bit float, the only type a Buffer accepts
//   F64  — 64-bit float

/// Enum of all element data types host storage can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// The single element type buffers and primitives operate on.
    pub const BUFFER: DType = DType::F32;

    /// Fail with `TypeMismatch` unless this is the buffer element type.
    pub fn ensure_buffer_type(self) -> crate::Result<()> {
        if self != DType::BUFFER {
            return Err(crate::Error::TypeMismatch {
                expected: DType::BUFFER,
                got: self,
            });
        }
        Ok(())
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Trait that connects Rust types to DType enum
//
// Lets host storage be built generically:
//
//   DataHandle::from_vec(vec![0.5f32; 16])
//   DataHandle::from_vec(vec![half::f16::ONE; 16])   // binds, then fails at init_user
//
// and have the DType determined from T.

/// Trait implemented by Rust types that can be stored in host storage.
pub trait WithDType: Copy + Send + Sync + 'static + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
}
