// ops.rs — Built-in operations.
//
//   name                    in → out  params                   WGSL
//   ──────────────────────  ────────  ───────────────────────  ────
//   create                  0 → 1     shape, type
//   copy                    1 → 1                              yes
//   add_constant            1 → 1     value                    yes
//   multiply_constant       1 → 1     value                    yes
//   add_images              2 → 1                              yes
//   convert                 1 → 1     type
//   gaussian_blur_2d        1 → 1     sigma_x, sigma_y
//   affine_transform_2d     1 → 1     matrix (6, forward)      yes
//   apply_vector_field_2d   3 → 1                              yes
//   copy_slice              2 → 1     slice
//   extract_slice           1 → 1     slice
//   automatic_threshold     1 → 1     method
//
// Reference kernels compute in f32 and narrow the result to the output
// type with clamp + round (`TensorData::from_f32`). Slice operations move
// raw bytes and are exact for every type.
//
// Shape functions reject bad parameters (unknown type names, singular
// matrices, out-of-range slices, unknown threshold methods) so those
// errors surface at validation time, before any allocation.

use crate::affine::AffineTransform2D;
use crate::convolution::{convolve_separable, gaussian_kernel_for_sigma};
use crate::error::{KernelError, PipelineError, Result};
use crate::image::{interpolate_bilinear, interpolate_bilinear_zero, Image};
use crate::params::{invalid, ParamKind, ParamSpec, Params};
use crate::registry::{Arity, GpuProgram, Kernel, Operation, OperationRegistry, TensorOut};
use crate::tensor::{ElementType, Shape, TensorData, TensorDesc};

const UNARY_WGSL: &str = include_str!("shaders/unary.wgsl");
const ADD_IMAGES_WGSL: &str = include_str!("shaders/add_images.wgsl");
const AFFINE_WGSL: &str = include_str!("shaders/affine.wgsl");
const VECTOR_FIELD_WGSL: &str = include_str!("shaders/vector_field.wgsl");

/// Register every built-in operation. Names already present are left
/// alone.
pub fn register_builtins(reg: &mut OperationRegistry) {
    let builtins: Vec<(&str, Operation)> = vec![
        ("create", create()),
        ("copy", copy()),
        ("add_constant", scalar_op("add_constant", |v, c| v + c)),
        ("multiply_constant", scalar_op("multiply_constant", |v, c| v * c)),
        ("add_images", add_images()),
        ("convert", convert()),
        ("gaussian_blur_2d", gaussian_blur_2d()),
        ("affine_transform_2d", affine_transform_2d()),
        ("apply_vector_field_2d", apply_vector_field_2d()),
        ("copy_slice", copy_slice()),
        ("extract_slice", extract_slice()),
        ("automatic_threshold", automatic_threshold()),
    ];
    for (name, op) in builtins {
        if let Err(e) = reg.register(name, op) {
            log::warn!("skipping builtin: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parameter errors inside a kernel body. Parameters were bound during
/// validation, so this only fires for hand-built launches.
fn kparam<T>(r: Result<T>) -> std::result::Result<T, KernelError> {
    r.map_err(|e| KernelError::new(KernelError::BAD_INPUT, e.to_string()))
}

fn same_as_first(inputs: &[TensorDesc], _: &Params) -> Result<Vec<TensorDesc>> {
    Ok(vec![inputs[0].clone()])
}

fn write_f32(out: &mut TensorOut<'_>, values: &[f32]) {
    *out.data = TensorData::from_f32(out.desc.dtype, values);
}

fn no_uniforms(_: &Params) -> std::result::Result<[f32; 16], KernelError> {
    Ok([0.0; 16])
}

fn value_uniform(p: &Params) -> std::result::Result<[f32; 16], KernelError> {
    let mut u = [0.0; 16];
    u[0] = kparam(p.float("value"))? as f32;
    Ok(u)
}

fn parse_type(p: &Params) -> Result<ElementType> {
    let name = p.text("type")?;
    ElementType::parse(name).ok_or_else(|| invalid("", "type", &format!("unknown element type `{name}`")))
}

/// Split dense f32 data into 2D planes of a tensor's shape.
fn planes(desc: &TensorDesc, data: &[f32]) -> Vec<Image<f32>> {
    let (w, h) = (desc.shape.dim(0), desc.shape.dim(1));
    data.chunks(w * h).map(|c| Image::from_vec(w, h, c.to_vec())).collect()
}

/// Slice index parameter, checked against the stack depth.
fn slice_index(p: &Params, depth: usize) -> Result<usize> {
    let slice = p.int("slice")?;
    if slice < 0 || slice as u64 >= depth as u64 {
        return Err(invalid("", "slice", &format!("slice {slice} outside 0..{depth}")));
    }
    Ok(slice as usize)
}

fn require_stack(desc: &TensorDesc) -> Result<()> {
    if desc.shape.rank() != 3 {
        return Err(PipelineError::shape(
            Shape::new([desc.shape.dim(0), desc.shape.dim(1), desc.shape.dim(2)]),
            desc.shape.clone(),
            "expected a 3D stack",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Element-wise
// ---------------------------------------------------------------------------

fn create() -> Operation {
    Operation::new(
        Arity::new(0, 1),
        |_: &[TensorDesc], p: &Params| {
            let dims = p.dims("shape")?.to_vec();
            Ok(vec![TensorDesc::new(dims, parse_type(p)?)])
        },
        // Outputs start zero-filled.
        Kernel::reference(|_, _, _| Ok(())),
    )
    .with_param(ParamSpec::required("shape", ParamKind::Dims))
    .with_param(ParamSpec::optional("type", "float32"))
}

fn copy() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        same_as_first,
        Kernel::reference(|ins, outs, _| {
            *outs[0].data = ins[0].data.clone();
            Ok(())
        })
        .with_program(GpuProgram {
            label: "unary.wgsl",
            source: UNARY_WGSL,
            entry_point: "copy",
            uniforms: no_uniforms,
        }),
    )
}

/// `dst = f(src, value)` element-wise. `name` doubles as the WGSL entry
/// point in unary.wgsl.
fn scalar_op(name: &'static str, f: fn(f32, f32) -> f32) -> Operation {
    Operation::new(
        Arity::new(1, 1),
        same_as_first,
        Kernel::reference(move |ins, outs, p| {
            let c = kparam(p.float("value"))? as f32;
            let values: Vec<f32> = ins[0].data.to_f32_vec().into_iter().map(|v| f(v, c)).collect();
            write_f32(&mut outs[0], &values);
            Ok(())
        })
        .with_program(GpuProgram {
            label: "unary.wgsl",
            source: UNARY_WGSL,
            entry_point: name,
            uniforms: value_uniform,
        }),
    )
    .with_param(ParamSpec::required("value", ParamKind::Float))
}

fn add_images() -> Operation {
    Operation::new(
        Arity::new(2, 1),
        |inputs: &[TensorDesc], _: &Params| {
            if inputs[0] != inputs[1] {
                return Err(PipelineError::shape(
                    inputs[0].shape.clone(),
                    inputs[1].shape.clone(),
                    format!("operands are {} and {}", inputs[0], inputs[1]),
                ));
            }
            Ok(vec![inputs[0].clone()])
        },
        Kernel::reference(|ins, outs, _| {
            let a = ins[0].data.to_f32_vec();
            let b = ins[1].data.to_f32_vec();
            let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
            write_f32(&mut outs[0], &sum);
            Ok(())
        })
        .with_program(GpuProgram {
            label: "add_images.wgsl",
            source: ADD_IMAGES_WGSL,
            entry_point: "add_images",
            uniforms: no_uniforms,
        }),
    )
}

fn convert() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], p: &Params| Ok(vec![TensorDesc::new(inputs[0].shape.clone(), parse_type(p)?)]),
        Kernel::reference(|ins, outs, _| {
            write_f32(&mut outs[0], &ins[0].data.to_f32_vec());
            Ok(())
        }),
    )
    .with_param(ParamSpec::required("type", ParamKind::Text))
}

// ---------------------------------------------------------------------------
// Filters and geometric transforms
// ---------------------------------------------------------------------------

fn sigma(p: &Params, name: &str) -> Result<f32> {
    let s = p.float(name)?;
    if !s.is_finite() || s < 0.0 {
        return Err(invalid("", name, &format!("sigma must be finite and >= 0, got {s}")));
    }
    Ok(s as f32)
}

fn gaussian_blur_2d() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], p: &Params| {
            sigma(p, "sigma_x")?;
            sigma(p, "sigma_y")?;
            Ok(vec![inputs[0].clone()])
        },
        Kernel::reference(|ins, outs, p| {
            let kx = gaussian_kernel_for_sigma(kparam(sigma(p, "sigma_x"))?);
            let ky = gaussian_kernel_for_sigma(kparam(sigma(p, "sigma_y"))?);
            let src = ins[0].data.to_f32_vec();
            let mut result = Vec::with_capacity(src.len());
            for plane in planes(ins[0].desc, &src) {
                result.extend(convolve_separable(&plane, &kx, &ky).to_dense());
            }
            write_f32(&mut outs[0], &result);
            Ok(())
        }),
    )
    .with_param(ParamSpec::required("sigma_x", ParamKind::Float))
    .with_param(ParamSpec::required("sigma_y", ParamKind::Float))
}

/// Inverse (destination → source) mapping of the `matrix` parameter.
fn inverse_matrix(p: &Params) -> Result<AffineTransform2D> {
    AffineTransform2D::from_params(p.floats("matrix")?)?.inverse()
}

fn affine_uniforms(p: &Params) -> std::result::Result<[f32; 16], KernelError> {
    let [a, b, tx, c, d, ty] = kparam(inverse_matrix(p))?.matrix();
    let mut u = [0.0; 16];
    u[..3].copy_from_slice(&[a as f32, b as f32, tx as f32]);
    u[4..7].copy_from_slice(&[c as f32, d as f32, ty as f32]);
    Ok(u)
}

fn affine_transform_2d() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], p: &Params| {
            inverse_matrix(p)?;
            Ok(vec![inputs[0].clone()])
        },
        Kernel::reference(|ins, outs, p| {
            let inv = kparam(inverse_matrix(p))?;
            let desc = ins[0].desc;
            let src = ins[0].data.to_f32_vec();
            let mut result = Vec::with_capacity(src.len());
            for plane in planes(desc, &src) {
                for y in 0..plane.height() {
                    for x in 0..plane.width() {
                        let (sx, sy) = inv.apply(x as f64, y as f64);
                        result.push(interpolate_bilinear_zero(&plane, sx as f32, sy as f32));
                    }
                }
            }
            write_f32(&mut outs[0], &result);
            Ok(())
        })
        .with_program(GpuProgram {
            label: "affine.wgsl",
            source: AFFINE_WGSL,
            entry_point: "affine_transform_2d",
            uniforms: affine_uniforms,
        }),
    )
    .with_param(ParamSpec::required("matrix", ParamKind::Floats))
}

fn apply_vector_field_2d() -> Operation {
    Operation::new(
        Arity::new(3, 1),
        |inputs: &[TensorDesc], _: &Params| {
            let image = &inputs[0];
            if image.shape.plane_count() != 1 {
                return Err(PipelineError::shape(
                    Shape::new([image.shape.dim(0), image.shape.dim(1)]),
                    image.shape.clone(),
                    "vector fields apply to 2D images",
                ));
            }
            for field in &inputs[1..] {
                if field.shape != image.shape {
                    return Err(PipelineError::shape(
                        image.shape.clone(),
                        field.shape.clone(),
                        "shift field must match the image shape",
                    ));
                }
            }
            Ok(vec![image.clone()])
        },
        Kernel::reference(|ins, outs, _| {
            let desc = ins[0].desc;
            let (w, h) = (desc.shape.dim(0), desc.shape.dim(1));
            let src = Image::from_vec(w, h, ins[0].data.to_f32_vec());
            let dx = ins[1].data.to_f32_vec();
            let dy = ins[2].data.to_f32_vec();
            let mut result = Vec::with_capacity(w * h);
            for y in 0..h {
                for x in 0..w {
                    let i = y * w + x;
                    result.push(interpolate_bilinear(&src, x as f32 + dx[i], y as f32 + dy[i]));
                }
            }
            write_f32(&mut outs[0], &result);
            Ok(())
        })
        .with_program(GpuProgram {
            label: "vector_field.wgsl",
            source: VECTOR_FIELD_WGSL,
            entry_point: "apply_vector_field_2d",
            uniforms: no_uniforms,
        }),
    )
}

// ---------------------------------------------------------------------------
// Stacks
// ---------------------------------------------------------------------------

fn copy_slice() -> Operation {
    Operation::new(
        Arity::new(2, 1),
        |inputs: &[TensorDesc], p: &Params| {
            let (stack, plane) = (&inputs[0], &inputs[1]);
            require_stack(stack)?;
            let expected = Shape::new([stack.shape.dim(0), stack.shape.dim(1)]);
            if plane.shape.plane_count() != 1
                || plane.shape.dim(0) != expected.dim(0)
                || plane.shape.dim(1) != expected.dim(1)
            {
                return Err(PipelineError::shape(expected, plane.shape.clone(), "plane does not fit the stack"));
            }
            if plane.dtype != stack.dtype {
                return Err(PipelineError::shape(
                    stack.shape.clone(),
                    plane.shape.clone(),
                    format!("plane is {}, stack is {}", plane.dtype, stack.dtype),
                ));
            }
            slice_index(p, stack.shape.dim(2))?;
            Ok(vec![stack.clone()])
        },
        Kernel::reference(|ins, outs, p| {
            let (stack, plane) = (&ins[0], &ins[1]);
            let slice = kparam(slice_index(p, stack.desc.shape.dim(2)))?;
            let mut bytes = stack.data.to_le_bytes();
            let plane_bytes = plane.data.to_le_bytes();
            let offset = slice * plane_bytes.len();
            bytes[offset..offset + plane_bytes.len()].copy_from_slice(&plane_bytes);
            *outs[0].data = TensorData::from_le_bytes(stack.desc.dtype, &bytes, stack.desc.element_count())
                .ok_or_else(|| KernelError::new(KernelError::TYPE, "stack byte length changed"))?;
            Ok(())
        }),
    )
    .with_param(ParamSpec::required("slice", ParamKind::Int))
}

fn extract_slice() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], p: &Params| {
            let stack = &inputs[0];
            require_stack(stack)?;
            slice_index(p, stack.shape.dim(2))?;
            Ok(vec![TensorDesc::new([stack.shape.dim(0), stack.shape.dim(1)], stack.dtype)])
        },
        Kernel::reference(|ins, outs, p| {
            let stack = &ins[0];
            let slice = kparam(slice_index(p, stack.desc.shape.dim(2)))?;
            let plane_len = stack.desc.shape.plane_len() * stack.desc.dtype.size_bytes();
            let bytes = stack.data.to_le_bytes();
            let offset = slice * plane_len;
            *outs[0].data =
                TensorData::from_le_bytes(stack.desc.dtype, &bytes[offset..offset + plane_len], outs[0].desc.element_count())
                    .ok_or_else(|| KernelError::new(KernelError::TYPE, "plane byte length mismatch"))?;
            Ok(())
        }),
    )
    .with_param(ParamSpec::required("slice", ParamKind::Int))
}

// ---------------------------------------------------------------------------
// Automatic threshold
// ---------------------------------------------------------------------------

/// Histogram-based threshold selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMethod {
    /// Maximise between-class variance.
    Otsu,
    /// Mean intensity.
    Mean,
    /// Iterative intermeans ("Default").
    IsoData,
}

impl ThresholdMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otsu" => Some(ThresholdMethod::Otsu),
            "mean" => Some(ThresholdMethod::Mean),
            "default" | "isodata" => Some(ThresholdMethod::IsoData),
            _ => None,
        }
    }

    /// Threshold bin: values in bins `> t` are foreground.
    pub fn threshold_bin(self, hist: &[u64; HISTOGRAM_BINS]) -> usize {
        match self {
            ThresholdMethod::Otsu => otsu(hist),
            ThresholdMethod::Mean => mean_bin(hist, 0, HISTOGRAM_BINS),
            ThresholdMethod::IsoData => isodata(hist),
        }
    }
}

pub const HISTOGRAM_BINS: usize = 256;

/// Value range and 256-bin histogram. `None` for NaN input.
pub fn histogram(values: &[f32]) -> Option<(f32, f32, [u64; HISTOGRAM_BINS])> {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in values {
        if v.is_nan() {
            return None;
        }
        min = min.min(v);
        max = max.max(v);
    }
    let mut hist = [0u64; HISTOGRAM_BINS];
    for &v in values {
        hist[bin_of(v, min, max)] += 1;
    }
    Some((min, max, hist))
}

fn bin_of(v: f32, min: f32, max: f32) -> usize {
    if max <= min {
        return 0;
    }
    let t = ((v - min) / (max - min)) as f64 * HISTOGRAM_BINS as f64;
    (t.floor().max(0.0) as usize).min(HISTOGRAM_BINS - 1)
}

/// Floor of the weighted mean bin over `lo..hi`; `None` if empty.
fn mean_in(hist: &[u64; HISTOGRAM_BINS], lo: usize, hi: usize) -> Option<f64> {
    let (mut n, mut sum) = (0u64, 0f64);
    for (i, &c) in hist.iter().enumerate().take(hi).skip(lo) {
        n += c;
        sum += i as f64 * c as f64;
    }
    (n > 0).then(|| sum / n as f64)
}

fn mean_bin(hist: &[u64; HISTOGRAM_BINS], lo: usize, hi: usize) -> usize {
    mean_in(hist, lo, hi).map_or(0, |m| m.floor() as usize)
}

fn otsu(hist: &[u64; HISTOGRAM_BINS]) -> usize {
    let total: u64 = hist.iter().sum();
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();
    let (mut w_b, mut sum_b) = (0u64, 0f64);
    let (mut best, mut best_var) = (0usize, -1.0f64);
    for (t, &c) in hist.iter().enumerate() {
        w_b += c;
        if w_b == 0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0 {
            break;
        }
        sum_b += t as f64 * c as f64;
        let m_b = sum_b / w_b as f64;
        let m_f = (sum_all - sum_b) / w_f as f64;
        let between = w_b as f64 * w_f as f64 * (m_b - m_f) * (m_b - m_f);
        if between > best_var {
            best_var = between;
            best = t;
        }
    }
    best
}

fn isodata(hist: &[u64; HISTOGRAM_BINS]) -> usize {
    let mut t = mean_bin(hist, 0, HISTOGRAM_BINS);
    for _ in 0..HISTOGRAM_BINS {
        let (Some(below), Some(above)) = (mean_in(hist, 0, t + 1), mean_in(hist, t + 1, HISTOGRAM_BINS)) else {
            break;
        };
        let next = ((below + above) / 2.0).floor() as usize;
        if next == t {
            break;
        }
        t = next;
    }
    t
}

fn threshold_method(p: &Params) -> Result<ThresholdMethod> {
    let name = p.text("method")?;
    ThresholdMethod::parse(name)
        .ok_or_else(|| invalid("", "method", &format!("unknown method `{name}` (Otsu, Mean, Default, IsoData)")))
}

fn automatic_threshold() -> Operation {
    Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], p: &Params| {
            threshold_method(p)?;
            Ok(vec![inputs[0].clone()])
        },
        Kernel::reference(|ins, outs, p| {
            let method = kparam(threshold_method(p))?;
            let values = ins[0].data.to_f32_vec();
            let (min, max, hist) = histogram(&values)
                .ok_or_else(|| KernelError::new(KernelError::BAD_INPUT, "cannot threshold NaN values"))?;
            let t = method.threshold_bin(&hist);
            log::debug!("automatic_threshold {method:?}: bin {t} over [{min}, {max}]");
            let mask: Vec<f32> = values
                .iter()
                .map(|&v| if max > min && bin_of(v, min, max) > t { 1.0 } else { 0.0 })
                .collect();
            write_f32(&mut outs[0], &mask);
            Ok(())
        }),
    )
    .with_param(ParamSpec::optional("method", "Otsu"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    fn run(name: &str, inputs: Vec<(TensorDesc, TensorData)>, params: Params) -> Result<Vec<TensorData>> {
        let reg = OperationRegistry::with_builtins();
        let op = reg.resolve(name)?;
        let bound = op.bind_params(name, &params)?;
        let in_descs: Vec<TensorDesc> = inputs.iter().map(|(d, _)| d.clone()).collect();
        let out_descs = op.infer_shapes(name, &in_descs, &bound)?;
        op.kernel()
            .run_reference(&inputs, &out_descs, &bound)
            .map_err(|e| e.into_pipeline(name))
    }

    fn f32_input(shape: &[usize], values: Vec<f32>) -> (TensorDesc, TensorData) {
        (TensorDesc::new(shape.to_vec(), ElementType::F32), TensorData::F32(values))
    }

    #[test]
    fn test_add_constant_integer_saturates() {
        let input = (TensorDesc::new([3], ElementType::U8), TensorData::U8(vec![10, 200, 250]));
        let out = run("add_constant", vec![input], Params::new().with("value", 25.6)).unwrap();
        assert_eq!(out[0], TensorData::U8(vec![36, 226, 255]));
    }

    #[test]
    fn test_multiply_constant() {
        let out = run("multiply_constant", vec![f32_input(&[2], vec![1.5, -2.0])], Params::new().with("value", 2)).unwrap();
        assert_eq!(out[0], TensorData::F32(vec![3.0, -4.0]));
    }

    #[test]
    fn test_create_parses_type() {
        let out = run("create", vec![], Params::new().with("shape", [2usize, 3]).with("type", "uint16")).unwrap();
        assert_eq!(out[0], TensorData::U16(vec![0; 6]));
        let err = run("create", vec![], Params::new().with("shape", [2usize]).with("type", "int4")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref op, ref name, .. } if op == "create" && name == "type"));
    }

    #[test]
    fn test_add_images_shape_mismatch() {
        let err = run(
            "add_images",
            vec![f32_input(&[2, 2], vec![0.0; 4]), f32_input(&[4], vec![0.0; 4])],
            Params::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_convert_clamps_and_rounds() {
        let out = run(
            "convert",
            vec![f32_input(&[4], vec![-3.0, 12.5, 254.6, 300.0])],
            Params::new().with("type", "8-bit"),
        )
        .unwrap();
        assert_eq!(out[0], TensorData::U8(vec![0, 13, 255, 255]));
    }

    #[test]
    fn test_gaussian_blur_preserves_constant_and_rejects_negative_sigma() {
        let out = run(
            "gaussian_blur_2d",
            vec![f32_input(&[4, 3, 2], vec![7.0; 24])],
            Params::new().with("sigma_x", 1.5).with("sigma_y", 0.0),
        )
        .unwrap();
        let TensorData::F32(v) = &out[0] else { panic!("wrong type") };
        assert!(v.iter().all(|x| (x - 7.0).abs() < 1e-4));

        let err = run(
            "gaussian_blur_2d",
            vec![f32_input(&[4, 3], vec![0.0; 12])],
            Params::new().with("sigma_x", -1.0).with("sigma_y", 1.0),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref name, .. } if name == "sigma_x"));
    }

    #[test]
    fn test_affine_translation_shifts_pixels() {
        // Forward translation by +1 in x: output(x) = input(x - 1), 0 at x=0.
        let input = f32_input(&[3, 1], vec![10.0, 20.0, 30.0]);
        let m = AffineTransform2D::translation(1.0, 0.0).to_params();
        let out = run("affine_transform_2d", vec![input], Params::new().with("matrix", m)).unwrap();
        assert_eq!(out[0], TensorData::F32(vec![0.0, 10.0, 20.0]));
    }

    #[test]
    fn test_affine_singular_matrix_rejected() {
        let input = f32_input(&[2, 2], vec![0.0; 4]);
        let err = run(
            "affine_transform_2d",
            vec![input],
            Params::new().with("matrix", [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref op, .. } if op == "affine_transform_2d"));
    }

    #[test]
    fn test_vector_field_shift() {
        let image = f32_input(&[3, 1], vec![10.0, 20.0, 30.0]);
        let dx = f32_input(&[3, 1], vec![1.0, 0.5, 5.0]);
        let dy = f32_input(&[3, 1], vec![0.0, 0.0, 0.0]);
        let out = run("apply_vector_field_2d", vec![image, dx, dy], Params::new()).unwrap();
        // x=0 samples 1.0, x=1 samples 1.5, x=2 clamps to the edge.
        assert_eq!(out[0], TensorData::F32(vec![20.0, 25.0, 30.0]));
    }

    #[test]
    fn test_vector_field_rejects_mismatched_field() {
        let image = f32_input(&[3, 1], vec![0.0; 3]);
        let dx = f32_input(&[3, 2], vec![0.0; 6]);
        let dy = f32_input(&[3, 1], vec![0.0; 3]);
        let err = run("apply_vector_field_2d", vec![image, dx, dy], Params::new()).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_copy_and_extract_slice() {
        let stack = (TensorDesc::new([2, 1, 3], ElementType::U16), TensorData::U16(vec![1, 2, 3, 4, 5, 6]));
        let plane = (TensorDesc::new([2, 1], ElementType::U16), TensorData::U16(vec![60000, 7]));
        let out = run("copy_slice", vec![stack.clone(), plane], Params::new().with("slice", 1)).unwrap();
        assert_eq!(out[0], TensorData::U16(vec![1, 2, 60000, 7, 5, 6]));

        let out = run("extract_slice", vec![stack.clone()], Params::new().with("slice", 2)).unwrap();
        assert_eq!(out[0], TensorData::U16(vec![5, 6]));

        let err = run("extract_slice", vec![stack], Params::new().with("slice", 3)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref name, .. } if name == "slice"));
    }

    #[test]
    fn test_copy_slice_rejects_wrong_plane() {
        let stack = (TensorDesc::new([2, 2, 2], ElementType::U8), TensorData::U8(vec![0; 8]));
        let plane = (TensorDesc::new([2, 3], ElementType::U8), TensorData::U8(vec![0; 6]));
        let err = run("copy_slice", vec![stack, plane], Params::new().with("slice", 0)).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_threshold_bimodal_all_methods() {
        let values: Vec<f32> = (0..100).map(|i| if i % 3 == 0 { 200.0 } else { 20.0 + (i % 5) as f32 }).collect();
        let expected: Vec<f32> = values.iter().map(|&v| if v > 100.0 { 1.0 } else { 0.0 }).collect();
        for method in ["Otsu", "Mean", "Default", "IsoData"] {
            let out = run(
                "automatic_threshold",
                vec![f32_input(&[10, 10], values.clone())],
                Params::new().with("method", method),
            )
            .unwrap();
            assert_eq!(out[0], TensorData::F32(expected.clone()), "method {method}");
        }
    }

    #[test]
    fn test_threshold_integer_output_and_default_method() {
        let input = (TensorDesc::new([4], ElementType::U8), TensorData::U8(vec![0, 0, 255, 255]));
        let out = run("automatic_threshold", vec![input], Params::new()).unwrap();
        assert_eq!(out[0], TensorData::U8(vec![0, 0, 1, 1]));
    }

    #[test]
    fn test_threshold_constant_image_is_background() {
        let out = run("automatic_threshold", vec![f32_input(&[3], vec![5.0; 3])], Params::new()).unwrap();
        assert_eq!(out[0], TensorData::F32(vec![0.0; 3]));
    }

    #[test]
    fn test_threshold_unknown_method_and_nan() {
        let err = run(
            "automatic_threshold",
            vec![f32_input(&[2], vec![0.0, 1.0])],
            Params::new().with("method", "Triangle"),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidParameter { ref name, .. } if name == "method"));

        let err = run("automatic_threshold", vec![f32_input(&[2], vec![f32::NAN, 1.0])], Params::new()).unwrap_err();
        assert!(matches!(err, PipelineError::KernelExecution { code: KernelError::BAD_INPUT, .. }));
    }

    #[test]
    fn test_otsu_picks_valley() {
        let mut hist = [0u64; HISTOGRAM_BINS];
        hist[10] = 50;
        hist[200] = 50;
        let t = ThresholdMethod::Otsu.threshold_bin(&hist);
        assert!((10..200).contains(&t), "threshold bin {t}");
    }

    #[test]
    fn test_affine_uniforms_hold_inverse() {
        let p = Params::new().with("matrix", ParamValue::Floats(AffineTransform2D::translation(3.0, -2.0).to_params()));
        let u = affine_uniforms(&p).unwrap();
        assert_eq!(&u[..3], &[1.0, 0.0, -3.0]);
        assert_eq!(&u[4..7], &[0.0, 1.0, 2.0]);
    }
}
