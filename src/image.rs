// image.rs — Host-side image containers.
//
// Two containers live here:
//
//   Image<T>   — a 2D, row-strided image, generic over the element type.
//                This is what image loaders and display code hand us: rows
//                may carry alignment padding (stride > width).
//
//   HostImage  — an N-dimensional dense array (shape + TensorData). This is
//                the only contract the host bridge needs: it maps 1:1 onto
//                a device buffer (same shape, same element order).
//
// Converting Image<T> → HostImage compacts the stride padding away:
//
//   Image<T> (stride=5, width=4)        HostImage (dense)
//     row0: [p00 p01 p02 p03 _]    →     [p00 p01 p02 p03 p10 p11 ...]
//     row1: [p10 p11 p12 p13 _]
//
// The kernels in `ops` also use Image<f32> for per-plane work (bilinear
// sampling, separable convolution), so the 2D helpers are shared between
// the host side and the reference device.

use std::fmt;

use crate::error::{PipelineError, Result};
use crate::tensor::{ElementType, Shape, TensorData, TensorDesc};

// ---------------------------------------------------------------------------
// Element trait
// ---------------------------------------------------------------------------

/// Rust types that can be stored in an image or a device buffer.
///
/// Implemented for `u8`, `u16`, `u32` and `f32`, one per [`ElementType`].
pub trait Element: Copy + Default + Send + Sync + PartialOrd + fmt::Debug + 'static {
    /// The runtime tag for this type.
    const TYPE: ElementType;

    /// Raw conversion to f32 (42u8 → 42.0, not normalised).
    fn to_f32(self) -> f32;

    /// Construct from f32, clamping and rounding for integer types.
    fn from_f32(v: f32) -> Self;

    /// Move a vector into tagged storage.
    fn wrap(data: Vec<Self>) -> TensorData;

    /// Borrow tagged storage as a typed slice, if the tag matches.
    fn view(data: &TensorData) -> Option<&[Self]>;
}

macro_rules! impl_int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const TYPE: ElementType = ElementType::$variant;

            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }

            #[inline]
            fn from_f32(v: f32) -> Self {
                // `as` saturates and maps NaN to 0; round first so 12.6 → 13.
                v.clamp(0.0, <$t>::MAX as f32).round() as $t
            }

            fn wrap(data: Vec<Self>) -> TensorData {
                TensorData::$variant(data)
            }

            fn view(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_int_element!(u8, U8);
impl_int_element!(u16, U16);
impl_int_element!(u32, U32);

impl Element for f32 {
    const TYPE: ElementType = ElementType::F32;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    fn wrap(data: Vec<Self>) -> TensorData {
        TensorData::F32(data)
    }

    fn view(data: &TensorData) -> Option<&[Self]> {
        match data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Image<T>
// ---------------------------------------------------------------------------

/// A 2D image with runtime dimensions and an explicit row stride.
#[derive(Clone)]
pub struct Image<T: Element> {
    /// Row-major pixels. Length = height * stride.
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Row stride in elements (not bytes). stride >= width.
    stride: usize,
}

impl<T: Element> Image<T> {
    /// Zero-initialised image with stride == width.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_stride(width, height, width)
    }

    /// Zero-initialised image with an explicit stride.
    ///
    /// # Panics
    /// Panics if `stride < width`.
    pub fn new_with_stride(width: usize, height: usize, stride: usize) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        Image {
            data: vec![T::default(); height * stride],
            width,
            height,
            stride,
        }
    }

    /// Wrap a dense pixel vector (stride == width).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        assert_eq!(
            data.len(),
            width * height,
            "data length ({}) must equal width * height ({})",
            data.len(),
            width * height,
        );
        Image { data, width, height, stride: width }
    }

    /// Wrap a strided pixel vector.
    ///
    /// # Panics
    /// Panics if `data.len() != height * stride` or `stride < width`.
    pub fn from_vec_with_stride(width: usize, height: usize, stride: usize, data: Vec<T>) -> Self {
        assert!(stride >= width, "stride ({stride}) must be >= width ({width})");
        assert_eq!(
            data.len(),
            height * stride,
            "data length ({}) must equal height * stride ({})",
            data.len(),
            height * stride,
        );
        Image { data, width, height, stride }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Pixel at (x, y). Panics when out of bounds.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.bounds_check(x, y);
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        self.data[idx] = value;
    }

    /// The active pixels of row `y` (stride padding excluded).
    #[inline]
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds (height {})", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// Underlying storage, including stride padding.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Iterate over all pixels as `(x, y, value)`.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height)
            .flat_map(move |y| (0..self.width).map(move |x| (x, y, self.data[y * self.stride + x])))
    }

    /// Copy the active pixels into a dense vector (stride == width).
    pub fn to_dense(&self) -> Vec<T> {
        if self.stride == self.width {
            return self.data.clone();
        }
        let mut out = Vec::with_capacity(self.width * self.height);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    #[inline]
    fn bounds_check(&self, x: usize, y: usize) {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for image {}×{}",
            self.width,
            self.height,
        );
    }
}

impl<T: Element> fmt::Debug for Image<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Image<{}> {{ {}×{}, stride={} }}",
            T::TYPE,
            self.width,
            self.height,
            self.stride,
        )?;
        for y in 0..self.height.min(8) {
            write!(f, "  row {y}: [")?;
            for x in 0..self.width.min(16) {
                if x > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}", self.get(x, y))?;
            }
            if self.width > 16 {
                write!(f, ", ...")?;
            }
            writeln!(f, "]")?;
        }
        if self.height > 8 {
            writeln!(f, "  ...")?;
        }
        Ok(())
    }
}

impl<T: Element> std::ops::Index<(usize, usize)> for Image<T> {
    type Output = T;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &T {
        self.bounds_check(x, y);
        &self.data[y * self.stride + x]
    }
}

impl<T: Element> std::ops::IndexMut<(usize, usize)> for Image<T> {
    #[inline]
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut T {
        self.bounds_check(x, y);
        let idx = y * self.stride + x;
        &mut self.data[idx]
    }
}

// ---------------------------------------------------------------------------
// Bilinear sampling
// ---------------------------------------------------------------------------

/// Bilinear interpolation with clamp-to-edge addressing.
///
/// Coordinates outside the image are clamped to the border, so the edge
/// pixels are replicated outward.
///
/// # Panics
/// Panics if the image is empty.
pub fn interpolate_bilinear(img: &Image<f32>, x: f32, y: f32) -> f32 {
    assert!(img.width() > 0 && img.height() > 0, "cannot interpolate on an empty image");

    // Clamp the index, not the coordinate: `w - 1` is not exact in f32 for
    // very wide images and can round up to `w`.
    let (x0, fx) = clamp_axis(x, img.width());
    let (y0, fy) = clamp_axis(y, img.height());
    let x1 = (x0 + 1).min(img.width() - 1);
    let y1 = (y0 + 1).min(img.height() - 1);

    let p00 = img.get(x0, y0);
    let p10 = img.get(x1, y0);
    let p01 = img.get(x0, y1);
    let p11 = img.get(x1, y1);
    (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
}

/// Integer cell and fractional weight along one axis of length `len`.
/// NaN lands on cell 0.
fn clamp_axis(v: f32, len: usize) -> (usize, f32) {
    let last = len - 1;
    let floor = v.floor().max(0.0);
    // `as usize` saturates, so +inf and huge values clamp to `last`.
    let i = (floor as usize).min(last);
    if i == last || !(v >= 0.0) {
        return (i, 0.0);
    }
    (i, (v - i as f32).clamp(0.0, 1.0))
}

/// Bilinear interpolation that treats everything outside the image as 0.
///
/// A position whose 2×2 neighbourhood is partly outside blends with zeros,
/// so edges fade out instead of smearing. Used by geometric transforms
/// where uncovered output pixels must stay background.
pub fn interpolate_bilinear_zero(img: &Image<f32>, x: f32, y: f32) -> f32 {
    let w = img.width() as isize;
    let h = img.height() as isize;
    if !x.is_finite() || !y.is_finite() || x <= -1.0 || y <= -1.0 || x >= w as f32 || y >= h as f32 {
        return 0.0;
    }
    let x0f = x.floor();
    let y0f = y.floor();
    let fx = x - x0f;
    let fy = y - y0f;
    let x0 = x0f as isize;
    let y0 = y0f as isize;

    let at = |xi: isize, yi: isize| -> f32 {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            0.0
        } else {
            img.get(xi as usize, yi as usize)
        }
    };

    (1.0 - fx) * (1.0 - fy) * at(x0, y0)
        + fx * (1.0 - fy) * at(x0 + 1, y0)
        + (1.0 - fx) * fy * at(x0, y0 + 1)
        + fx * fy * at(x0 + 1, y0 + 1)
}

// ---------------------------------------------------------------------------
// HostImage
// ---------------------------------------------------------------------------

/// A dense N-dimensional host array: the host side of a device buffer.
///
/// Construction validates the shape and the element count, so a
/// `HostImage` is always rectangular.
#[derive(Debug, Clone, PartialEq)]
pub struct HostImage {
    shape: Shape,
    data: TensorData,
}

impl HostImage {
    /// Wrap tagged storage. Fails with `ShapeMismatch` if the shape is
    /// invalid or does not match the element count.
    pub fn new(shape: impl Into<Shape>, data: TensorData) -> Result<Self> {
        let shape = shape.into();
        shape.validate()?;
        if shape.element_count() != data.len() {
            return Err(PipelineError::shape(
                shape.clone(),
                Shape::new([data.len()]),
                "element count does not match shape",
            ));
        }
        Ok(HostImage { shape, data })
    }

    /// Zero-filled host array.
    pub fn zeros(shape: impl Into<Shape>, dtype: ElementType) -> Result<Self> {
        let shape = shape.into();
        shape.validate()?;
        let data = TensorData::zeros(dtype, shape.element_count());
        Ok(HostImage { shape, data })
    }

    pub fn from_vec<T: Element>(shape: impl Into<Shape>, data: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(data))
    }

    /// Build a 2D array from nested rows. Fails with `ShapeMismatch` if the
    /// rows are ragged or empty.
    pub fn from_rows<T: Element>(rows: Vec<Vec<T>>) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(width * height);
        for (y, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(PipelineError::shape(
                    Shape::new([width]),
                    Shape::new([row.len()]),
                    format!("row {y} has a different length than row 0"),
                ));
            }
            data.extend(row);
        }
        Self::from_vec([width, height], data)
    }

    /// Build a 3D array from a list of planes, each a list of rows. Every
    /// plane must have the same width and height.
    pub fn from_planes<T: Element>(planes: Vec<Vec<Vec<T>>>) -> Result<Self> {
        let depth = planes.len();
        let mut plane_shape: Option<Shape> = None;
        let mut data = Vec::new();
        for (z, plane) in planes.into_iter().enumerate() {
            let plane = Self::from_rows(plane)?;
            match &plane_shape {
                None => plane_shape = Some(plane.shape.clone()),
                Some(expected) if *expected != plane.shape => {
                    return Err(PipelineError::shape(
                        expected.clone(),
                        plane.shape.clone(),
                        format!("plane {z} differs from plane 0"),
                    ));
                }
                Some(_) => {}
            }
            if let Some(v) = T::view(&plane.data) {
                data.extend_from_slice(v);
            }
        }
        let plane_shape = plane_shape.unwrap_or_default();
        Self::from_vec([plane_shape.dim(0), plane_shape.dim(1), depth], data)
    }

    /// Dense copy of a strided 2D image.
    pub fn from_image<T: Element>(img: &Image<T>) -> Result<Self> {
        Self::from_vec([img.width(), img.height()], img.to_dense())
    }

    /// Convert a 2D array back into an `Image<T>`. Fails with
    /// `ShapeMismatch` if the array is not 2D (trailing dimensions of size
    /// 1 are allowed) or holds a different element type.
    pub fn to_image<T: Element>(&self) -> Result<Image<T>> {
        let (w, h) = (self.shape.dim(0), self.shape.dim(1));
        if self.shape.plane_count() != 1 {
            return Err(PipelineError::shape(
                Shape::new([w, h]),
                self.shape.clone(),
                "expected a single 2D plane",
            ));
        }
        let pixels = T::view(&self.data).ok_or_else(|| {
            PipelineError::shape(
                self.shape.clone(),
                self.shape.clone(),
                format!("element type is {}, requested {}", self.dtype(), T::TYPE),
            )
        })?;
        Ok(Image::from_vec(w, h, pixels.to_vec()))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> ElementType {
        self.data.dtype()
    }

    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.shape.clone(), self.dtype())
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn into_data(self) -> TensorData {
        self.data
    }

    /// Typed view of the elements, if `T` matches the element type.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(&self.data)
    }

    /// All elements widened to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.to_f32_vec()
    }
}
