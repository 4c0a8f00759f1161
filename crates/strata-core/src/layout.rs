use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shape::Shape;

// LayoutDescriptor — Logical dims + physical element order
//
// A descriptor separates *what* a tensor is (its logical dims, always in
// canonical order) from *where* each element lives in memory. Two
// descriptors are layout-equal iff dims, element order and block factor all
// match, and layout equality is exactly the "no conversion needed" test.
//
// KEY CONCEPTS:
//
// 1. **Canonical dims**: [x], [n, c], [n, c, h, w] for data and [o, i],
//    [o, i, h, w] for weights. The format never permutes the dims list, it
//    only decides the physical offset of each logical index.
//
// 2. **Plain formats** (nchw, nhwc, chwn, nc, cn, ...) are strided: every
//    logical dim has one stride. nchw [2,3,4,5] has strides [60,20,5,1],
//    nhwc of the same dims has strides [60,1,15,3].
//
// 3. **Blocked format** nChw{b}c splits channels into ceil(c/b) blocks of b
//    and makes the in-block channel the fastest dim:
//      offset = (((n*cb + c/b)*h + y)*w + x)*b + c%b
//    When c is not a multiple of b the last block is zero-padded, so the
//    physical length exceeds the logical element count.
//
// 4. **Physical equivalence**: distinct descriptors can address memory the
//    same way (nchw and nhwc when h == w == 1). Such descriptors can be
//    re-tagged without moving data, which is what lets a stage fall back to
//    the canonical layout when it rejects a published one.

/// Physical element order of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// 1-D.
    X,
    /// [n, c], row-major.
    Nc,
    /// [n, c], column-major.
    Cn,
    /// [n, c, h, w], plain.
    Nchw,
    /// [n, c, h, w], channel-last.
    Nhwc,
    /// [n, c, h, w], batch-last.
    Chwn,
    /// [n, c, h, w], channel-blocked; needs a block factor.
    #[serde(rename = "nchwc")]
    NChwc,
    /// Weight [o, i], row-major.
    Oi,
    /// Weight [o, i], transposed.
    Io,
    /// Weight [o, i, h, w], plain.
    Oihw,
    /// Weight [o, i, h, w], spatial-major.
    Hwio,
}

impl Format {
    /// Rank of the dims this format describes.
    pub fn rank(&self) -> usize {
        match self {
            Format::X => 1,
            Format::Nc | Format::Cn | Format::Oi | Format::Io => 2,
            Format::Nchw
            | Format::Nhwc
            | Format::Chwn
            | Format::NChwc
            | Format::Oihw
            | Format::Hwio => 4,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Format::NChwc)
    }

    pub fn is_weight(&self) -> bool {
        matches!(self, Format::Oi | Format::Io | Format::Oihw | Format::Hwio)
    }

    fn name(&self) -> &'static str {
        match self {
            Format::X => "x",
            Format::Nc => "nc",
            Format::Cn => "cn",
            Format::Nchw => "nchw",
            Format::Nhwc => "nhwc",
            Format::Chwn => "chwn",
            Format::NChwc => "nchwc",
            Format::Oi => "oi",
            Format::Io => "io",
            Format::Oihw => "oihw",
            Format::Hwio => "hwio",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fmt = match s.to_lowercase().as_str() {
            "x" => Format::X,
            "nc" => Format::Nc,
            "cn" => Format::Cn,
            "nchw" => Format::Nchw,
            "nhwc" => Format::Nhwc,
            "chwn" => Format::Chwn,
            "nchwc" => Format::NChwc,
            "oi" => Format::Oi,
            "io" => Format::Io,
            "oihw" => Format::Oihw,
            "hwio" => Format::Hwio,
            other => return Err(Error::config(format!("unknown layout format '{other}'"))),
        };
        Ok(fmt)
    }
}

/// Immutable description of a tensor's dims and physical arrangement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutDescriptor {
    dims: Vec<usize>,
    format: Format,
    block: Option<usize>,
}

impl LayoutDescriptor {
    /// Create a descriptor, validating rank and block factor.
    pub fn new(dims: impl Into<Vec<usize>>, format: Format, block: Option<usize>) -> Result<Self> {
        let dims = dims.into();
        if dims.len() != format.rank() {
            return Err(Error::RankMismatch {
                expected: format.rank(),
                got: dims.len(),
            });
        }
        if dims.contains(&0) {
            return Err(Error::config(format!(
                "layout {format} over {dims:?} has a zero-length dimension"
            )));
        }
        match (format.is_blocked(), block) {
            (true, Some(b)) if b > 0 => {}
            (true, _) => {
                return Err(Error::config(format!(
                    "format {} needs a non-zero block factor",
                    format
                )))
            }
            (false, Some(_)) => {
                return Err(Error::config(format!(
                    "format {} does not take a block factor",
                    format
                )))
            }
            (false, None) => {}
        }
        Ok(LayoutDescriptor {
            dims,
            format,
            block,
        })
    }

    /// Plain (unblocked) descriptor.
    pub fn plain(dims: impl Into<Vec<usize>>, format: Format) -> Result<Self> {
        Self::new(dims, format, None)
    }

    /// Channel-blocked nChw{block}c descriptor for [n, c, h, w].
    pub fn blocked(dims: impl Into<Vec<usize>>, block: usize) -> Result<Self> {
        Self::new(dims, Format::NChwc, Some(block))
    }

    /// Canonical data layout for the given dims: x / nc / nchw.
    pub fn canonical(dims: &[usize]) -> Result<Self> {
        let format = match dims.len() {
            1 => Format::X,
            2 => Format::Nc,
            4 => Format::Nchw,
            r => {
                return Err(Error::config(format!(
                    "no canonical layout for rank {r} (supported ranks: 1, 2, 4)"
                )))
            }
        };
        Self::plain(dims.to_vec(), format)
    }

    /// Canonical weight layout for the given dims: x / oi / oihw.
    pub fn canonical_weight(dims: &[usize]) -> Result<Self> {
        let format = match dims.len() {
            1 => Format::X,
            2 => Format::Oi,
            4 => Format::Oihw,
            r => {
                return Err(Error::config(format!(
                    "no canonical weight layout for rank {r}"
                )))
            }
        };
        Self::plain(dims.to_vec(), format)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.dims.clone())
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn block(&self) -> Option<usize> {
        self.block
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of logical elements.
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Whether this is the canonical data layout for its dims.
    pub fn is_canonical(&self) -> bool {
        LayoutDescriptor::canonical(&self.dims)
            .map(|c| &c == self)
            .unwrap_or(false)
    }

    /// Channels rounded up to whole blocks (blocked formats only).
    fn padded_channels(&self) -> usize {
        let c = self.dims[1];
        match self.block {
            Some(b) => c.div_ceil(b) * b,
            None => c,
        }
    }

    /// Number of elements the backing storage must hold.
    pub fn physical_len(&self) -> usize {
        if self.format.is_blocked() {
            let [n, _, h, w] = self.dims4();
            n * self.padded_channels() * h * w
        } else {
            self.elem_count()
        }
    }

    fn dims4(&self) -> [usize; 4] {
        [self.dims[0], self.dims[1], self.dims[2], self.dims[3]]
    }

    /// Per-dim strides when the layout is purely strided.
    ///
    /// Plain formats always are; a blocked layout is strided only when all
    /// channels fit in one block.
    pub fn strides(&self) -> Option<Vec<usize>> {
        let d = &self.dims;
        let s = match self.format {
            Format::X => vec![1],
            Format::Nc | Format::Oi => vec![d[1], 1],
            Format::Cn | Format::Io => vec![1, d[0]],
            Format::Nchw | Format::Oihw => vec![d[1] * d[2] * d[3], d[2] * d[3], d[3], 1],
            Format::Nhwc => vec![d[2] * d[3] * d[1], 1, d[3] * d[1], d[1]],
            Format::Chwn => vec![1, d[2] * d[3] * d[0], d[3] * d[0], d[0]],
            Format::Hwio => vec![1, d[0], d[3] * d[1] * d[0], d[1] * d[0]],
            Format::NChwc => {
                let b = self.block?;
                if d[1] > b {
                    return None;
                }
                vec![d[2] * d[3] * b, 1, d[3] * b, b]
            }
        };
        Some(s)
    }

    /// Physical offset of a logical index (canonical dim order).
    pub fn offset(&self, index: &[usize]) -> usize {
        if self.format.is_blocked() && self.strides().is_none() {
            let b = self.block.unwrap_or(1);
            let [_, c, h, w] = self.dims4();
            let cb = c.div_ceil(b);
            let (n_i, c_i, h_i, w_i) = (index[0], index[1], index[2], index[3]);
            return (((n_i * cb + c_i / b) * h + h_i) * w + w_i) * b + c_i % b;
        }
        match self.strides() {
            Some(strides) => index.iter().zip(strides.iter()).map(|(i, s)| i * s).sum(),
            None => 0,
        }
    }

    /// Iterator over physical offsets of every logical element, in canonical
    /// logical (row-major) order.
    pub fn offsets(&self) -> OffsetIter<'_> {
        OffsetIter::new(self)
    }

    /// Whether `other` addresses every logical element at the same offset,
    /// so the same storage can be re-tagged without moving data.
    pub fn is_physically_equivalent(&self, other: &LayoutDescriptor) -> bool {
        if self == other {
            return true;
        }
        if self.dims != other.dims || self.physical_len() != other.physical_len() {
            return false;
        }
        match (self.strides(), other.strides()) {
            (Some(a), Some(b)) => self
                .dims
                .iter()
                .zip(a.iter().zip(b.iter()))
                .all(|(&extent, (sa, sb))| extent <= 1 || sa == sb),
            _ => false,
        }
    }

    /// Copy the logical elements of `data` (laid out as `self`) into a
    /// canonical row-major vector.
    pub fn gather(&self, data: &[f32]) -> Vec<f32> {
        self.offsets().map(|o| data[o]).collect()
    }

    /// Write canonical row-major `values` into `data` laid out as `self`.
    pub fn scatter(&self, values: &[f32], data: &mut [f32]) {
        for (v, o) in values.iter().zip(self.offsets()) {
            data[o] = *v;
        }
    }
}

impl fmt::Display for LayoutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.format, self.block) {
            (Format::NChwc, Some(b)) => write!(f, "nChw{}c{:?}", b, self.dims),
            (fmt, _) => write!(f, "{}{:?}", fmt, self.dims),
        }
    }
}

// OffsetIter — Walks logical indices and yields physical offsets
//
// For a canonical layout this just counts 0, 1, 2, ... For any other
// layout it jumps around in storage following the format. It is the single
// primitive the conversion and reference kernels are built on.

/// Iterator yielding the physical offset of each logical element.
pub struct OffsetIter<'a> {
    layout: &'a LayoutDescriptor,
    current: Vec<usize>,
    remaining: usize,
}

impl<'a> OffsetIter<'a> {
    fn new(layout: &'a LayoutDescriptor) -> Self {
        OffsetIter {
            layout,
            current: vec![0; layout.rank()],
            remaining: layout.elem_count(),
        }
    }

    fn advance(&mut self) {
        for d in (0..self.current.len()).rev() {
            self.current[d] += 1;
            if self.current[d] < self.layout.dims[d] {
                return;
            }
            self.current[d] = 0;
        }
    }
}

impl Iterator for OffsetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let off = self.layout.offset(&self.current);
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(off)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for OffsetIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_by_rank() {
        assert_eq!(LayoutDescriptor::canonical(&[5]).unwrap().format(), Format::X);
        assert_eq!(LayoutDescriptor::canonical(&[2, 3]).unwrap().format(), Format::Nc);
        let l = LayoutDescriptor::canonical(&[2, 3, 4, 5]).unwrap();
        assert_eq!(l.format(), Format::Nchw);
        assert!(l.is_canonical());
        assert!(LayoutDescriptor::canonical(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_rank_and_block_validation() {
        assert!(matches!(
            LayoutDescriptor::plain(vec![2, 3], Format::Nchw),
            Err(Error::RankMismatch { expected: 4, got: 2 })
        ));
        assert!(LayoutDescriptor::new(vec![1, 8, 2, 2], Format::NChwc, None).is_err());
        assert!(LayoutDescriptor::new(vec![1, 8, 2, 2], Format::Nchw, Some(8)).is_err());
        assert!(LayoutDescriptor::blocked(vec![1, 8, 2, 2], 0).is_err());
    }

    #[test]
    fn test_equality_covers_all_fields() {
        let a = LayoutDescriptor::blocked(vec![2, 16, 3, 3], 8).unwrap();
        let b = LayoutDescriptor::blocked(vec![2, 16, 3, 3], 8).unwrap();
        let c = LayoutDescriptor::blocked(vec![2, 16, 3, 3], 16).unwrap();
        let d = LayoutDescriptor::plain(vec![2, 16, 3, 3], Format::Nchw).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_zero_length_dim_is_rejected() {
        let err = LayoutDescriptor::plain(vec![0, 8, 2, 2], Format::Nchw).unwrap_err();
        match err {
            Error::Config(msg) => assert!(msg.contains("[0, 8, 2, 2]"), "{msg}"),
            other => panic!("expected Config, got {:?}", other),
        }
        assert!(LayoutDescriptor::blocked(vec![2, 0, 3, 3], 8).is_err());
    }

    #[test]
    fn test_nhwc_offsets() {
        // [n=1, c=2, h=2, w=2] channel-last: element (0, c, y, x) at (y*2+x)*2 + c
        let l = LayoutDescriptor::plain(vec![1, 2, 2, 2], Format::Nhwc).unwrap();
        let offs: Vec<usize> = l.offsets().collect();
        assert_eq!(offs, vec![0, 2, 4, 6, 1, 3, 5, 7]);
    }

    #[test]
    fn test_blocked_offsets_and_padding() {
        // c=3 with block 2 → two blocks, 4 padded channels
        let l = LayoutDescriptor::blocked(vec![1, 3, 1, 2], 2).unwrap();
        assert_eq!(l.physical_len(), 8);
        assert_eq!(l.elem_count(), 6);
        assert!(l.strides().is_none());
        // c=0: x=0 → 0, x=1 → 2; c=1: 1, 3; c=2 (second block): 4, 6
        let offs: Vec<usize> = l.offsets().collect();
        assert_eq!(offs, vec![0, 2, 1, 3, 4, 6]);
    }

    #[test]
    fn test_physical_equivalence_for_unit_spatial() {
        let nchw = LayoutDescriptor::plain(vec![4, 16, 1, 1], Format::Nchw).unwrap();
        let nhwc = LayoutDescriptor::plain(vec![4, 16, 1, 1], Format::Nhwc).unwrap();
        assert_ne!(nchw, nhwc);
        assert!(nchw.is_physically_equivalent(&nhwc));

        let nchw = LayoutDescriptor::plain(vec![4, 16, 2, 2], Format::Nchw).unwrap();
        let nhwc = LayoutDescriptor::plain(vec![4, 16, 2, 2], Format::Nhwc).unwrap();
        assert!(!nchw.is_physically_equivalent(&nhwc));
    }

    #[test]
    fn test_gather_scatter_inverse() {
        let l = LayoutDescriptor::plain(vec![2, 3, 2, 1], Format::Chwn).unwrap();
        let canon: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut phys = vec![0.0; l.physical_len()];
        l.scatter(&canon, &mut phys);
        assert_ne!(phys, canon);
        assert_eq!(l.gather(&phys), canon);
    }

    #[test]
    fn test_format_parse_and_display() {
        assert_eq!("NHWC".parse::<Format>().unwrap(), Format::Nhwc);
        assert!("nchw16z".parse::<Format>().is_err());
        let l = LayoutDescriptor::blocked(vec![1, 8, 2, 2], 8).unwrap();
        assert_eq!(l.to_string(), "nChw8c[1, 8, 2, 2]");
    }
}
