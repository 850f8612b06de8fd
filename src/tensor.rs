// tensor.rs — Element types, shapes and typed element storage.
//
// These are the vocabulary types shared by the host side and the device
// side. A buffer on the device is described by a `TensorDesc` (shape +
// element type) that never changes after allocation; only the contents do.
//
// LAYOUT
// ──────
// Shapes are listed x-fastest: `[width, height, depth, ...]`. Element
// (x, y, z) of a 3D tensor lives at linear index
//
//     x + width * (y + height * z)
//
// which is the same convention the device buffers use, so a host array can
// be copied to the device without reordering.

use std::fmt;

use crate::error::{PipelineError, Result};

// ---------------------------------------------------------------------------
// ElementType
// ---------------------------------------------------------------------------

/// The fixed set of element types a buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
    U32,
    F32,
}

impl ElementType {
    pub const ALL: [ElementType; 4] =
        [ElementType::U8, ElementType::U16, ElementType::U32, ElementType::F32];

    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 | ElementType::F32 => 4,
        }
    }

    /// Stable lowercase name, also accepted by [`ElementType::parse`].
    pub fn name(self) -> &'static str {
        match self {
            ElementType::U8 => "uint8",
            ElementType::U16 => "uint16",
            ElementType::U32 => "uint32",
            ElementType::F32 => "float32",
        }
    }

    /// Parse a type name. Accepts the canonical names plus the bit-depth
    /// spellings image tools commonly use ("8-bit", "16-bit", "32-bit").
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uint8" | "u8" | "8-bit" => Some(ElementType::U8),
            "uint16" | "u16" | "16-bit" => Some(ElementType::U16),
            "uint32" | "u32" => Some(ElementType::U32),
            "float32" | "f32" | "float" | "32-bit" => Some(ElementType::F32),
            _ => None,
        }
    }

    /// Largest value representable, as f32. Floats report `f32::MAX`.
    pub fn max_value(self) -> f32 {
        match self {
            ElementType::U8 => u8::MAX as f32,
            ElementType::U16 => u16::MAX as f32,
            ElementType::U32 => u32::MAX as f32,
            ElementType::F32 => f32::MAX,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Shape
// ---------------------------------------------------------------------------

/// Ordered list of dimension sizes, x fastest.
///
/// A `Shape` built with [`Shape::new`] is not validated; call
/// [`Shape::validate`] (done by every allocation path) before trusting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Size of dimension `axis`, or 1 for axes beyond the rank.
    pub fn dim(&self, axis: usize) -> usize {
        self.0.get(axis).copied().unwrap_or(1)
    }

    /// Total number of elements. Saturates instead of overflowing; an
    /// overflowing shape is rejected by `validate`.
    pub fn element_count(&self) -> usize {
        self.0.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
    }

    /// Reject empty shapes, zero-sized dimensions and element counts that
    /// overflow `usize`.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(PipelineError::shape(
                Shape::new([1]),
                self.clone(),
                "shape must have at least one dimension",
            ));
        }
        if let Some(axis) = self.0.iter().position(|&d| d == 0) {
            return Err(PipelineError::shape(
                self.with_dim(axis, 1),
                self.clone(),
                format!("dimension {axis} is zero"),
            ));
        }
        let overflow = self
            .0
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .is_none();
        if overflow {
            return Err(PipelineError::shape(
                self.clone(),
                self.clone(),
                "element count overflows",
            ));
        }
        Ok(())
    }

    /// Copy of this shape with dimension `axis` replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> Shape {
        let mut dims = self.0.clone();
        if axis < dims.len() {
            dims[axis] = size;
        }
        Shape(dims)
    }

    /// Width × height of one 2D plane.
    pub fn plane_len(&self) -> usize {
        self.dim(0) * self.dim(1)
    }

    /// Number of 2D planes (product of all dimensions past y).
    pub fn plane_count(&self) -> usize {
        self.0.iter().skip(2).product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(v: [usize; N]) -> Self {
        Shape(v.to_vec())
    }
}

// ---------------------------------------------------------------------------
// TensorDesc
// ---------------------------------------------------------------------------

/// Immutable description of a buffer: shape + element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    pub shape: Shape,
    pub dtype: ElementType,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: ElementType) -> Self {
        TensorDesc { shape: shape.into(), dtype }
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    /// Bytes of device memory this tensor occupies (dense layout).
    pub fn size_bytes(&self) -> u64 {
        (self.element_count() as u64).saturating_mul(self.dtype.size_bytes() as u64)
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

// ---------------------------------------------------------------------------
// TensorData
// ---------------------------------------------------------------------------

/// Dense element storage, tagged with its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl TensorData {
    /// Zero-filled storage of `len` elements.
    pub fn zeros(dtype: ElementType, len: usize) -> Self {
        match dtype {
            ElementType::U8 => TensorData::U8(vec![0; len]),
            ElementType::U16 => TensorData::U16(vec![0; len]),
            ElementType::U32 => TensorData::U32(vec![0; len]),
            ElementType::F32 => TensorData::F32(vec![0.0; len]),
        }
    }

    pub fn dtype(&self) -> ElementType {
        match self {
            TensorData::U8(_) => ElementType::U8,
            TensorData::U16(_) => ElementType::U16,
            TensorData::U32(_) => ElementType::U32,
            TensorData::F32(_) => ElementType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::U8(v) => v.len(),
            TensorData::U16(v) => v.len(),
            TensorData::U32(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen every element to f32 (raw values, not normalised).
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorData::U8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U16(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::F32(v) => v.clone(),
        }
    }

    /// Narrow f32 values to `dtype`, clamping to the representable range
    /// and rounding to nearest for integer types.
    pub fn from_f32(dtype: ElementType, values: &[f32]) -> Self {
        match dtype {
            ElementType::U8 => TensorData::U8(values.iter().map(|&v| saturate(v, 255.0) as u8).collect()),
            ElementType::U16 => {
                TensorData::U16(values.iter().map(|&v| saturate(v, 65535.0) as u16).collect())
            }
            ElementType::U32 => TensorData::U32(
                values.iter().map(|&v| saturate(v, u32::MAX as f32) as u32).collect(),
            ),
            ElementType::F32 => TensorData::F32(values.to_vec()),
        }
    }

    /// Encode as dense little-endian bytes (the device layout).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::U8(v) => v.clone(),
            TensorData::U16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::U32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Decode dense little-endian bytes. Trailing bytes that do not form a
    /// whole element (device buffers are padded to 4 bytes) are ignored;
    /// `len` elements are produced.
    pub fn from_le_bytes(dtype: ElementType, bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() < len * dtype.size_bytes() {
            return None;
        }
        let data = match dtype {
            ElementType::U8 => TensorData::U8(bytes[..len].to_vec()),
            ElementType::U16 => TensorData::U16(
                bytes.chunks_exact(2).take(len).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
            ),
            ElementType::U32 => TensorData::U32(
                bytes
                    .chunks_exact(4)
                    .take(len)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            ElementType::F32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .take(len)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        Some(data)
    }
}

/// Clamp to [0, max] and round; NaN maps to 0.
#[inline]
fn saturate(v: f32, max: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, max).round()
    }
}
