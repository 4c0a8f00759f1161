use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::layout::LayoutDescriptor;
use crate::memory::{DataHandle, Memory};
use crate::primitive::PrimitiveRef;
use crate::reorder::Reorder;

// Buffer — A user view, an internal view, and the conversion between them
//
// The user view is the layout the neighbours of a stage see; its storage is
// usually owned by someone else (the caller, or the previous stage). The
// internal view is what the stage's primitive reads or writes. When the
// two layouts are equal the internal view *is* the user view (same Memory
// object) and no conversion exists.
//
// LIFECYCLE:
//
//   Buffer::new(dims, F32)
//     └── init_user(data?, layout, engine)      may repeat (re-tag)
//           └── init_conversion(layout, dir)    exactly once
//               or init_no_conversion()
//                 └── per invocation:
//                       mark_dirty()            once, before any submit
//                       submit(pending, data?)  any number of times
//
// The conversion, once set, is never replaced. A different internal layout
// means a new Buffer. `dirty == false` means the internal view is current
// for the data handle last submitted; handing `submit` a different handle
// forces a conversion whatever the flag says.

/// Which way a buffer's conversion copies data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionDirection {
    /// Inputs: user layout is converted to the primitive's layout.
    UserToInternal,
    /// Outputs: the primitive's result is converted back to the user layout.
    InternalToUser,
    /// Layouts are equal; the views alias.
    NoneNeeded,
}

impl fmt::Display for ConversionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversionDirection::UserToInternal => "user->internal",
            ConversionDirection::InternalToUser => "internal->user",
            ConversionDirection::NoneNeeded => "none",
        };
        write!(f, "{}", s)
    }
}

/// Memoized, pointer-identity-aware layout conversion cache.
pub struct Buffer {
    label: String,
    dims: Vec<usize>,
    dtype: DType,
    engine: Option<Engine>,
    user: Option<Memory>,
    internal: Option<Memory>,
    direction: Option<ConversionDirection>,
    conversion: Option<PrimitiveRef>,
    dirty: bool,
    conversions: Rc<Cell<u64>>,
}

impl Buffer {
    /// Create an empty buffer for tensors of logical `dims`.
    ///
    /// Only f32 is supported; any other dtype fails with `TypeMismatch`.
    pub fn new(dims: impl Into<Vec<usize>>, dtype: DType) -> Result<Self> {
        dtype.ensure_buffer_type()?;
        Ok(Buffer {
            label: String::from("buffer"),
            dims: dims.into(),
            dtype,
            engine: None,
            user: None,
            internal: None,
            direction: None,
            conversion: None,
            dirty: true,
            conversions: Rc::new(Cell::new(0)),
        })
    }

    /// Name used in log lines.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bind (or allocate, when `data` is `None`) the user view.
    ///
    /// May be called again to re-tag the user view until a conversion has
    /// been initialized; after that the user layout is fixed.
    pub fn init_user(
        &mut self,
        data: Option<DataHandle>,
        layout: LayoutDescriptor,
        engine: &Engine,
    ) -> Result<()> {
        if self.direction.is_some() {
            return Err(Error::contract(format!(
                "{}: user layout cannot change once the conversion is initialized",
                self.label
            )));
        }
        if layout.dims() != self.dims.as_slice() {
            return Err(Error::contract(format!(
                "{}: user layout {} does not match buffer dims {:?}",
                self.label, layout, self.dims
            )));
        }
        let memory = match data {
            Some(handle) => {
                if handle.dtype() != self.dtype {
                    return Err(Error::TypeMismatch {
                        expected: self.dtype,
                        got: handle.dtype(),
                    });
                }
                Memory::new(layout, handle)?
            }
            None => engine.alloc(&layout)?,
        };
        self.engine = Some(engine.clone());
        self.user = Some(memory);
        Ok(())
    }

    /// Decide whether a conversion is needed and build it if so.
    ///
    /// Returns `false` (and records `NoneNeeded`) when `internal` equals the
    /// user layout. Otherwise allocates the internal view, builds the
    /// conversion for `direction` and returns `true`.
    pub fn init_conversion(
        &mut self,
        internal: &LayoutDescriptor,
        direction: ConversionDirection,
    ) -> Result<bool> {
        let user = self.ready_for_conversion()?;
        if direction == ConversionDirection::NoneNeeded {
            return Err(Error::contract(format!(
                "{}: NoneNeeded is not a conversion direction",
                self.label
            )));
        }
        if internal.dims() != self.dims.as_slice() {
            return Err(Error::contract(format!(
                "{}: internal layout {} does not match buffer dims {:?}",
                self.label, internal, self.dims
            )));
        }
        if internal == user.layout() {
            debug!(buffer = %self.label, layout = %internal, "no reorder needed");
            self.internal = Some(user);
            self.direction = Some(ConversionDirection::NoneNeeded);
            return Ok(false);
        }

        let engine = self.engine.clone().ok_or_else(|| {
            Error::contract(format!("{}: no engine bound", self.label))
        })?;
        let intl = engine.alloc(internal)?;
        let reorder = match direction {
            ConversionDirection::UserToInternal => Reorder::new(user.clone(), intl.clone())?,
            _ => Reorder::new(intl.clone(), user.clone())?,
        };
        debug!(
            buffer = %self.label,
            from = %user.layout(),
            to = %internal,
            %direction,
            "need reorder"
        );
        self.conversion = Some(Rc::new(reorder.with_counter(self.conversions.clone())));
        self.internal = Some(intl);
        self.direction = Some(direction);
        Ok(true)
    }

    /// Use the user view directly as the internal view.
    pub fn init_no_conversion(&mut self) -> Result<()> {
        let user = self.ready_for_conversion()?;
        self.internal = Some(user);
        self.direction = Some(ConversionDirection::NoneNeeded);
        Ok(())
    }

    fn ready_for_conversion(&self) -> Result<Memory> {
        let user = self.user.clone().ok_or_else(|| {
            Error::contract(format!(
                "{}: conversion requested before user layout initialized",
                self.label
            ))
        })?;
        if self.direction.is_some() {
            return Err(Error::contract(format!(
                "{}: conversion already initialized",
                self.label
            )));
        }
        Ok(user)
    }

    /// Queue the conversion if the internal view is stale.
    ///
    /// A `data` handle different from the bound one rebinds the user view
    /// and always converts. Otherwise this is a no-op while `dirty` is
    /// false, so each invocation converts at most once.
    pub fn submit(
        &mut self,
        pending: &mut Vec<PrimitiveRef>,
        data: Option<&DataHandle>,
    ) -> Result<()> {
        let direction = self.direction.ok_or_else(|| {
            Error::contract(format!(
                "{}: submit before conversion initialized",
                self.label
            ))
        })?;
        if let (Some(handle), Some(user)) = (data, self.user.as_ref()) {
            if !handle.same_as(&user.data_handle()) {
                trace!(buffer = %self.label, "user data handle changed, rebinding");
                user.set_data_handle(handle.clone())?;
                self.dirty = true;
            }
        }
        if direction == ConversionDirection::NoneNeeded {
            self.dirty = false;
            return Ok(());
        }
        if !self.dirty {
            trace!(buffer = %self.label, "internal view current, skip");
            return Ok(());
        }
        if let Some(conversion) = &self.conversion {
            trace!(buffer = %self.label, "queue {}", conversion.name());
            pending.push(conversion.clone());
        }
        self.dirty = false;
        Ok(())
    }

    /// Mark the internal view stale so the next `submit` converts again.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn direction(&self) -> Option<ConversionDirection> {
        self.direction
    }

    /// Whether a conversion primitive exists.
    pub fn needs_conversion(&self) -> bool {
        self.conversion.is_some()
    }

    pub fn conversion(&self) -> Option<&PrimitiveRef> {
        self.conversion.as_ref()
    }

    /// Number of times this buffer's conversion has run.
    pub fn conversions_executed(&self) -> u64 {
        self.conversions.get()
    }

    pub fn user_layout(&self) -> Option<&LayoutDescriptor> {
        self.user.as_ref().map(|m| m.layout())
    }

    pub fn internal_layout(&self) -> Option<&LayoutDescriptor> {
        self.internal.as_ref().map(|m| m.layout())
    }

    pub fn user_memory(&self) -> Option<&Memory> {
        self.user.as_ref()
    }

    pub fn internal_memory(&self) -> Option<&Memory> {
        self.internal.as_ref()
    }

    pub fn user_data(&self) -> Option<DataHandle> {
        self.user.as_ref().map(|m| m.data_handle())
    }

    /// User view, or a contract violation if it was never bound.
    pub fn require_user(&self) -> Result<&Memory> {
        self.user.as_ref().ok_or_else(|| {
            Error::contract(format!("{}: user view not initialized", self.label))
        })
    }

    /// Internal view, or a contract violation before `init_conversion`.
    pub fn require_internal(&self) -> Result<&Memory> {
        self.internal.as_ref().ok_or_else(|| {
            Error::contract(format!("{}: internal view not initialized", self.label))
        })
    }

    /// Whether the internal view aliases the user view.
    pub fn is_aliased(&self) -> bool {
        match (&self.user, &self.internal) {
            (Some(u), Some(i)) => u.same_as(i),
            _ => false,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("dims", &self.dims)
            .field("user", &self.user_layout().map(|l| l.to_string()))
            .field("internal", &self.internal_layout().map(|l| l.to_string()))
            .field("direction", &self.direction)
            .field("dirty", &self.dirty)
            .finish()
    }
}

fn fmt_or_unset(layout: Option<&LayoutDescriptor>) -> String {
    match layout {
        Some(l) => match l.block() {
            Some(b) => format!("nChw{}c", b),
            None => l.format().to_string(),
        },
        None => String::from("?"),
    }
}

/// Data-format flow of one input/output pair:
/// `user >>> (internal >>> internal) >>> user`.
pub fn format_flow(input: &Buffer, output: &Buffer) -> String {
    format!(
        "{} >>> ({} >>> {}) >>> {}",
        fmt_or_unset(input.user_layout()),
        fmt_or_unset(input.internal_layout()),
        fmt_or_unset(output.internal_layout()),
        fmt_or_unset(output.user_layout()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Format;
    use crate::stream::Stream;

    fn nchw(dims: &[usize]) -> LayoutDescriptor {
        LayoutDescriptor::canonical(dims).unwrap()
    }

    fn nhwc(dims: &[usize]) -> LayoutDescriptor {
        LayoutDescriptor::plain(dims.to_vec(), Format::Nhwc).unwrap()
    }

    #[test]
    fn test_non_f32_buffer_rejected() {
        assert!(matches!(
            Buffer::new(vec![2, 2], DType::F64),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_non_f32_handle_rejected_at_init_user() {
        let engine = Engine::cpu();
        let mut buf = Buffer::new(vec![4], DType::F32).unwrap();
        let h = DataHandle::from_vec(vec![half::bf16::ZERO; 4]);
        assert!(matches!(
            buf.init_user(Some(h), nchw(&[4]), &engine),
            Err(Error::TypeMismatch { got: DType::BF16, .. })
        ));
    }

    #[test]
    fn test_conversion_before_user_is_contract_violation() {
        let mut buf = Buffer::new(vec![1, 2, 2, 2], DType::F32).unwrap();
        assert!(matches!(
            buf.init_conversion(&nhwc(&[1, 2, 2, 2]), ConversionDirection::UserToInternal),
            Err(Error::LayoutContractViolation(_))
        ));
        assert!(matches!(buf.init_no_conversion(), Err(Error::LayoutContractViolation(_))));
    }

    #[test]
    fn test_equal_layouts_short_circuit() {
        let engine = Engine::cpu();
        let dims = [2, 3, 4, 4];
        let mut buf = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        buf.init_user(None, nchw(&dims), &engine).unwrap();
        let allocs = engine.stats().allocations;
        let needed = buf
            .init_conversion(&nchw(&dims), ConversionDirection::UserToInternal)
            .unwrap();
        assert!(!needed);
        assert!(!buf.needs_conversion());
        assert!(buf.is_aliased());
        assert_eq!(buf.direction(), Some(ConversionDirection::NoneNeeded));
        assert_eq!(engine.stats().allocations, allocs);
    }

    #[test]
    fn test_conversion_is_fixed_once_set() {
        let engine = Engine::cpu();
        let dims = [1, 2, 2, 2];
        let mut buf = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        buf.init_user(None, nchw(&dims), &engine).unwrap();
        assert!(buf
            .init_conversion(&nhwc(&dims), ConversionDirection::UserToInternal)
            .unwrap());
        assert!(buf
            .init_conversion(&nhwc(&dims), ConversionDirection::UserToInternal)
            .is_err());
        assert!(buf.init_user(None, nhwc(&dims), &engine).is_err());
    }

    #[test]
    fn test_submit_converts_once_until_marked_dirty() {
        let engine = Engine::cpu();
        let dims = [1, 2, 2, 2];
        let mut buf = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        let data = DataHandle::from_vec((0..8).map(|v| v as f32).collect::<Vec<_>>());
        buf.init_user(Some(data.clone()), nchw(&dims), &engine).unwrap();
        buf.init_conversion(&nhwc(&dims), ConversionDirection::UserToInternal)
            .unwrap();
        let stream = Stream::new(&engine);

        let mut pending = Vec::new();
        buf.submit(&mut pending, Some(&data)).unwrap();
        buf.submit(&mut pending, Some(&data)).unwrap();
        assert_eq!(pending.len(), 1);
        stream.submit(&pending).unwrap();
        assert_eq!(buf.conversions_executed(), 1);

        let mut pending = Vec::new();
        buf.submit(&mut pending, None).unwrap();
        assert!(pending.is_empty());

        buf.mark_dirty();
        buf.submit(&mut pending, None).unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_pointer_change_forces_conversion() {
        let engine = Engine::cpu();
        let dims = [1, 2, 1, 2];
        let mut buf = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        let a = DataHandle::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        buf.init_user(Some(a.clone()), nchw(&dims), &engine).unwrap();
        buf.init_conversion(&nhwc(&dims), ConversionDirection::UserToInternal)
            .unwrap();
        let stream = Stream::new(&engine);

        let mut pending = Vec::new();
        buf.submit(&mut pending, Some(&a)).unwrap();
        stream.submit(&pending).unwrap();
        assert!(!buf.is_dirty());

        let b = DataHandle::from_vec(vec![5.0f32, 6.0, 7.0, 8.0]);
        let mut pending = Vec::new();
        buf.submit(&mut pending, Some(&b)).unwrap();
        assert_eq!(pending.len(), 1);
        stream.submit(&pending).unwrap();
        assert_eq!(buf.conversions_executed(), 2);
        assert!(buf.user_data().unwrap().same_as(&b));
        let intl = buf.require_internal().unwrap();
        assert_eq!(intl.read_canonical().unwrap(), vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_aliased_buffer_follows_rebinding() {
        let engine = Engine::cpu();
        let mut buf = Buffer::new(vec![3], DType::F32).unwrap();
        buf.init_user(None, nchw(&[3]), &engine).unwrap();
        buf.init_no_conversion().unwrap();
        let h = DataHandle::from_vec(vec![1.0f32, 2.0, 3.0]);
        let mut pending = Vec::new();
        buf.submit(&mut pending, Some(&h)).unwrap();
        assert!(pending.is_empty());
        assert!(buf.require_internal().unwrap().data_handle().same_as(&h));
    }

    #[test]
    fn test_output_direction_converts_back() {
        let engine = Engine::cpu();
        let dims = [1, 2, 1, 2];
        let mut buf = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        buf.init_user(None, nchw(&dims), &engine).unwrap();
        buf.init_conversion(&nhwc(&dims), ConversionDirection::InternalToUser)
            .unwrap();
        buf.require_internal()
            .unwrap()
            .write_canonical(&[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let mut pending = Vec::new();
        buf.submit(&mut pending, None).unwrap();
        Stream::new(&engine).submit(&pending).unwrap();
        assert_eq!(buf.user_data().unwrap().to_f32_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_format_flow_line() {
        let engine = Engine::cpu();
        let dims = [1, 8, 2, 2];
        let mut input = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        input.init_user(None, nchw(&dims), &engine).unwrap();
        input
            .init_conversion(
                &LayoutDescriptor::blocked(dims.to_vec(), 8).unwrap(),
                ConversionDirection::UserToInternal,
            )
            .unwrap();
        let mut output = Buffer::new(dims.to_vec(), DType::F32).unwrap();
        output.init_user(None, nhwc(&dims), &engine).unwrap();
        output.init_no_conversion().unwrap();
        assert_eq!(
            format_flow(&input, &output),
            "nchw >>> (nChw8c >>> nhwc) >>> nhwc"
        );
    }
}
