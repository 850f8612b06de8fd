// convolution.rs — Separable 1D convolution for Image<T>.
//
// A 2D convolution with a separable kernel K = k_col * k_row^T decomposes
// into two 1D passes, reducing cost from O(k²) to O(2k) per pixel:
//
//   convolve_rows()       horizontal pass
//   convolve_cols()       vertical pass
//   convolve_separable()  rows then cols
//
// BORDER HANDLING: Clamp (replicate edge pixels).
// When the kernel window extends beyond the image boundary, out-of-bounds
// indices are clamped to the nearest edge pixel, the same as GPU sampling
// with clamp-to-edge addressing.
//
// `gaussian_blur_2d` runs this per plane on the reference device.

use crate::image::{Element, Image};

/// Convolve each row of `src` with a centred 1D kernel (horizontal pass).
///
/// For a kernel of length K the centre tap is at index K/2. Kernels must
/// have odd length.
pub fn convolve_rows<T: Element>(src: &Image<T>, kernel: &[f32]) -> Image<f32> {
    debug_assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
    let w = src.width();
    let h = src.height();
    let half = (kernel.len() / 2) as isize;
    let mut dst = Image::<f32>::new(w, h);
    if w == 0 {
        return dst;
    }
    let last = (w - 1) as isize;

    for y in 0..h {
        let row = src.row(y);
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sx = (x as isize + ki as isize - half).clamp(0, last) as usize;
                acc += row[sx].to_f32() * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Convolve each column of `src` with a centred 1D kernel (vertical pass).
pub fn convolve_cols(src: &Image<f32>, kernel: &[f32]) -> Image<f32> {
    debug_assert!(kernel.len() % 2 == 1, "kernel length must be odd (got {})", kernel.len());
    let w = src.width();
    let h = src.height();
    let half = (kernel.len() / 2) as isize;
    let mut dst = Image::<f32>::new(w, h);
    if h == 0 {
        return dst;
    }
    let last = (h - 1) as isize;

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (ki, &kv) in kernel.iter().enumerate() {
                let sy = (y as isize + ki as isize - half).clamp(0, last) as usize;
                acc += src.get(x, sy) * kv;
            }
            dst.set(x, y, acc);
        }
    }
    dst
}

/// Full separable 2D convolution: horizontal pass then vertical pass.
///
/// Accumulation is in f32, so the result is `Image<f32>` whatever the
/// input type.
pub fn convolve_separable<T: Element>(src: &Image<T>, kernel_row: &[f32], kernel_col: &[f32]) -> Image<f32> {
    let intermediate = convolve_rows(src, kernel_row);
    convolve_cols(&intermediate, kernel_col)
}

/// 1D Gaussian kernel of length `2 * half_size + 1`, normalised to sum 1.
///
/// ```
/// let k = gpupipe::convolution::gaussian_kernel_1d(2, 1.0);
/// assert_eq!(k.len(), 5);
/// assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-6);
/// ```
pub fn gaussian_kernel_1d(half_size: usize, sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let len = 2 * half_size + 1;
    let two_sigma_sq = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (0..len)
        .map(|i| {
            let x = i as f32 - half_size as f32;
            (-x * x / two_sigma_sq).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Gaussian kernel truncated at three sigma. `sigma == 0` is the identity
/// kernel `[1.0]`.
pub fn gaussian_kernel_for_sigma(sigma: f32) -> Vec<f32> {
    if sigma <= 0.0 {
        return vec![1.0];
    }
    let half = ((3.0 * sigma).ceil() as usize).max(1);
    gaussian_kernel_1d(half, sigma)
}
