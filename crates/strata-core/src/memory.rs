use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::LayoutDescriptor;

// Memory — Host storage, data handles and layout-tagged memory views
//
// Three levels, each wrapping the previous one:
//
//   HostStorage  — a typed Vec, one variant per DType
//   DataHandle   — shared, externally owned storage, Rc<RefCell<HostStorage>>.
//                  Its identity (the Rc pointer) is what a Buffer compares to
//                  decide whether the caller handed it "the same pointer".
//   Memory       — a LayoutDescriptor plus a re-bindable DataHandle slot.
//                  Primitives hold Memory clones, so rebinding the slot
//                  redirects every primitive bound to it without rebuilding.
//
// Nothing here is Send: caching state must never cross threads.

/// Typed host storage.
#[derive(Clone)]
pub enum HostStorage {
    F16(Vec<half::f16>),
    BF16(Vec<half::bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl HostStorage {
    pub fn dtype(&self) -> DType {
        match self {
            HostStorage::F16(_) => DType::F16,
            HostStorage::BF16(_) => DType::BF16,
            HostStorage::F32(_) => DType::F32,
            HostStorage::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostStorage::F16(v) => v.len(),
            HostStorage::BF16(v) => v.len(),
            HostStorage::F32(v) => v.len(),
            HostStorage::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to f32, whatever the stored type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            HostStorage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            HostStorage::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            HostStorage::F32(v) => v.clone(),
            HostStorage::F64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }
}

impl fmt::Debug for HostStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostStorage({}, len={})", self.dtype(), self.len())
    }
}

/// Element types that can be wrapped into `HostStorage`.
pub trait HostElement: WithDType {
    fn into_storage(v: Vec<Self>) -> HostStorage;
}

impl HostElement for f32 {
    fn into_storage(v: Vec<Self>) -> HostStorage {
        HostStorage::F32(v)
    }
}

impl HostElement for f64 {
    fn into_storage(v: Vec<Self>) -> HostStorage {
        HostStorage::F64(v)
    }
}

impl HostElement for half::f16 {
    fn into_storage(v: Vec<Self>) -> HostStorage {
        HostStorage::F16(v)
    }
}

impl HostElement for half::bf16 {
    fn into_storage(v: Vec<Self>) -> HostStorage {
        HostStorage::BF16(v)
    }
}

/// Shared handle to host storage. Cloning shares the storage; two handles
/// are "the same pointer" iff they share it.
#[derive(Clone)]
pub struct DataHandle(Rc<RefCell<HostStorage>>);

impl DataHandle {
    pub fn new(storage: HostStorage) -> Self {
        DataHandle(Rc::new(RefCell::new(storage)))
    }

    pub fn from_vec<T: HostElement>(v: Vec<T>) -> Self {
        Self::new(T::into_storage(v))
    }

    /// Zero-filled f32 storage.
    pub fn zeros(len: usize) -> Self {
        Self::new(HostStorage::F32(vec![0.0; len]))
    }

    /// Pointer identity of the shared storage.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn same_as(&self, other: &DataHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn dtype(&self) -> DType {
        self.0.borrow().dtype()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn storage(&self) -> Ref<'_, HostStorage> {
        self.0.borrow()
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.0.borrow().to_f32_vec()
    }

    /// Read access to f32 storage.
    pub fn with_f32<R>(&self, f: impl FnOnce(&[f32]) -> R) -> Result<R> {
        match &*self.0.borrow() {
            HostStorage::F32(v) => Ok(f(v)),
            other => Err(Error::TypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    /// Write access to f32 storage.
    pub fn with_f32_mut<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> Result<R> {
        match &mut *self.0.borrow_mut() {
            HostStorage::F32(v) => Ok(f(v)),
            other => Err(Error::TypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    /// Overwrite the whole storage with f32 values.
    pub fn write_f32(&self, values: &[f32]) -> Result<()> {
        self.with_f32_mut(|dst| {
            if dst.len() != values.len() {
                return Err(Error::ElementCountMismatch {
                    expected: values.len(),
                    got: dst.len(),
                });
            }
            dst.copy_from_slice(values);
            Ok(())
        })?
    }
}

impl fmt::Debug for DataHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataHandle(#{:x}, {:?})", self.id(), &*self.0.borrow())
    }
}

struct MemoryInner {
    layout: LayoutDescriptor,
    data: RefCell<DataHandle>,
}

/// A layout-tagged view over a `DataHandle`.
#[derive(Clone)]
pub struct Memory(Rc<MemoryInner>);

impl Memory {
    /// Bind `data` under `layout`. The storage must be f32 and large enough
    /// for the layout's physical length.
    pub fn new(layout: LayoutDescriptor, data: DataHandle) -> Result<Self> {
        check_binding(&layout, &data)?;
        Ok(Memory(Rc::new(MemoryInner {
            layout,
            data: RefCell::new(data),
        })))
    }

    pub fn layout(&self) -> &LayoutDescriptor {
        &self.0.layout
    }

    pub fn data_handle(&self) -> DataHandle {
        self.0.data.borrow().clone()
    }

    /// Point this memory at different storage. Every primitive holding a
    /// clone of this Memory sees the new storage.
    pub fn set_data_handle(&self, data: DataHandle) -> Result<()> {
        check_binding(&self.0.layout, &data)?;
        *self.0.data.borrow_mut() = data;
        Ok(())
    }

    /// Identity of this memory object (not of its storage).
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn same_as(&self, other: &Memory) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Whether this memory and `other` currently share storage.
    pub fn aliases(&self, other: &Memory) -> bool {
        self.data_handle().same_as(&other.data_handle())
    }

    /// Logical values in canonical order.
    pub fn read_canonical(&self) -> Result<Vec<f32>> {
        let data = self.data_handle();
        data.with_f32(|src| self.0.layout.gather(src))
    }

    /// Write logical values given in canonical order.
    pub fn write_canonical(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.0.layout.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: self.0.layout.elem_count(),
                got: values.len(),
            });
        }
        let data = self.data_handle();
        data.with_f32_mut(|dst| self.0.layout.scatter(values, dst))
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory({}, {:?})", self.0.layout, self.data_handle())
    }
}

fn check_binding(layout: &LayoutDescriptor, data: &DataHandle) -> Result<()> {
    data.dtype().ensure_buffer_type()?;
    if data.len() < layout.physical_len() {
        return Err(Error::ElementCountMismatch {
            expected: layout.physical_len(),
            got: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Format;

    #[test]
    fn test_handle_identity() {
        let a = DataHandle::from_vec(vec![1.0f32, 2.0]);
        let b = a.clone();
        let c = DataHandle::from_vec(vec![1.0f32, 2.0]);
        assert!(a.same_as(&b));
        assert_eq!(a.id(), b.id());
        assert!(!a.same_as(&c));
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_non_f32_binding_rejected() {
        let layout = LayoutDescriptor::canonical(&[4]).unwrap();
        let h = DataHandle::from_vec(vec![half::f16::ONE; 4]);
        assert!(matches!(
            Memory::new(layout, h),
            Err(Error::TypeMismatch { got: DType::F16, .. })
        ));
    }

    #[test]
    fn test_short_storage_rejected() {
        let layout = LayoutDescriptor::blocked(vec![1, 3, 1, 1], 8).unwrap();
        let h = DataHandle::zeros(3);
        assert!(matches!(
            Memory::new(layout, h),
            Err(Error::ElementCountMismatch { expected: 8, got: 3 })
        ));
    }

    #[test]
    fn test_rebinding_redirects_clones() {
        let layout = LayoutDescriptor::canonical(&[3]).unwrap();
        let mem = Memory::new(layout, DataHandle::from_vec(vec![1.0f32, 2.0, 3.0])).unwrap();
        let view = mem.clone();
        mem.set_data_handle(DataHandle::from_vec(vec![7.0f32, 8.0, 9.0]))
            .unwrap();
        assert_eq!(view.read_canonical().unwrap(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_canonical_io_through_layout() {
        let layout = LayoutDescriptor::plain(vec![1, 2, 1, 2], Format::Nhwc).unwrap();
        let mem = Memory::new(layout, DataHandle::zeros(4)).unwrap();
        mem.write_canonical(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        // channel-last: (c0,x0) (c1,x0) (c0,x1) (c1,x1)
        assert_eq!(mem.data_handle().to_f32_vec(), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(mem.read_canonical().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
