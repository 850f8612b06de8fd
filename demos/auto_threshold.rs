// demos/auto_threshold.rs — Automatic threshold on the compute device.
//
// Pushes a grayscale image, converts it to float32, applies an automatic
// threshold and writes the binary mask as a PNG:
//
//   input (u8) ──convert──▶ float32 ──automatic_threshold──▶ mask (0/1)
//                                         ──multiply 255──▶ convert u8 ──▶ PNG
//
// USAGE
// ─────
//   cargo run --example auto_threshold                        # generated blobs
//   cargo run --example auto_threshold -- blobs.png           # any image file
//   cargo run --example auto_threshold -- blobs.png Mean out.png
//
// The device comes from the environment (GPUPIPE_BACKEND, GPUPIPE_DEVICE, …);
// by default the GPU is used when present, the host device otherwise.
// Set RUST_LOG=debug to see allocations and dispatches.

use gpupipe::{
    from_device, to_device, CancellationToken, DeviceConfig, DeviceContext, HostImage, OperationRegistry, Params,
    Pipeline,
};

fn main() {
    env_logger::init();

    // --- Parse arguments ---
    let args: Vec<String> = std::env::args().collect();
    let method = args.get(2).cloned().unwrap_or_else(|| "Otsu".to_string());
    let out_path = args.get(3).cloned().unwrap_or_else(|| "auto_threshold.png".to_string());

    // --- Load or generate source image ---
    let (w, h, pixels) = match args.get(1) {
        Some(path) => load_gray(path),
        None => {
            eprintln!("[auto_threshold] no image path given, using generated blobs");
            blobs(256, 254)
        }
    };
    eprintln!("[auto_threshold] source: {w}×{h}, method={method}");

    // --- Device ---
    let config = DeviceConfig::from_env().expect("invalid GPUPIPE_* configuration");
    let ctx = DeviceContext::open(&config).expect("failed to open a compute device");
    eprintln!("[auto_threshold] device: {}", ctx.info());

    // --- Pipeline ---
    let src = HostImage::from_vec([w, h], pixels).expect("image dimensions");
    let registry = OperationRegistry::with_builtins();
    let mut pipeline = Pipeline::new()
        .input("blobs")
        .step("convert", &["blobs"], &["blobs32"], Params::new().with("type", "float32"))
        .step("automatic_threshold", &["blobs32"], &["thresholded"], Params::new().with("method", method.as_str()))
        .step("multiply_constant", &["thresholded"], &["scaled"], Params::new().with("value", 255.0))
        .step("convert", &["scaled"], &["mask"], Params::new().with("type", "uint8"))
        .output("mask")
        .validate(&registry, &[src.desc()])
        .unwrap_or_else(|e| panic!("pipeline rejected: {e}"));

    let blobs_gpu = to_device(&ctx, &src).expect("push");
    let mut outputs = pipeline
        .execute(&ctx, &[&blobs_gpu], &CancellationToken::new())
        .unwrap_or_else(|e| panic!("pipeline failed: {e}"));
    let mask_gpu = outputs.take("mask").expect("declared output");

    // --- Pull and report ---
    let mask = from_device(&mask_gpu).expect("pull");
    let mask = mask.as_slice::<u8>().expect("uint8 mask").to_vec();
    let foreground = mask.iter().filter(|&&v| v > 0).count();
    eprintln!(
        "[auto_threshold] foreground: {foreground} of {} pixels ({:.1}%)",
        mask.len(),
        100.0 * foreground as f64 / mask.len() as f64
    );

    save_gray(&out_path, w, h, mask);
    eprintln!("[auto_threshold] wrote {out_path}");

    // --- Clean up ---
    blobs_gpu.release();
    mask_gpu.release();
    eprintln!("[auto_threshold] peak device memory: {} bytes", ctx.peak_bytes());
}

// ============================================================
// Image I/O
// ============================================================

fn load_gray(path: &str) -> (usize, usize, Vec<u8>) {
    let img = image::open(path)
        .unwrap_or_else(|e| panic!("failed to open {path}: {e}"))
        .to_luma8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    (w, h, img.into_raw())
}

fn save_gray(path: &str, w: usize, h: usize, data: Vec<u8>) {
    let img = image::GrayImage::from_raw(w as u32, h as u32, data).expect("buffer matches dimensions");
    img.save(path).unwrap_or_else(|e| panic!("failed to write {path}: {e}"));
}

/// Dark background with bright discs of varying size.
fn blobs(w: usize, h: usize) -> (usize, usize, Vec<u8>) {
    let mut data = vec![8u8; w * h];
    for i in 0..24usize {
        let cx = (i * 97 + 31) % w;
        let cy = (i * 59 + 17) % h;
        let r = 5 + (i * 7) % 11;
        for y in cy.saturating_sub(r)..(cy + r + 1).min(h) {
            for x in cx.saturating_sub(r)..(cx + r + 1).min(w) {
                let (dx, dy) = (x as isize - cx as isize, y as isize - cy as isize);
                if (dx * dx + dy * dy) as usize <= r * r {
                    data[y * w + x] = 248;
                }
            }
        }
    }
    (w, h, data)
}
