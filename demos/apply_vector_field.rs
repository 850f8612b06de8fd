// demos/apply_vector_field.rs — Non-rigid deformation with a rotating shift field.
//
// Builds a local x-shift field (a blurred oval of +25 px), then for 36
// angles rotates the field around the image centre and warps the image
// with it, collecting every result in one 3D stack:
//
//   shift_x ──affine_transform_2d(rotate i·10°)──▶ rotated
//   blobs, rotated, shift_y ──apply_vector_field_2d──▶ warped
//   stack, warped ──copy_slice(i)──▶ stack'
//
// The stack is written as a 6×6 montage PNG with an inverted gray scale.
//
// The blurred field keeps its raw values (peak a little under 25 px). A
// saturated contrast stretch would only change how the field is displayed,
// so none is applied before the rotation loop.
//
// USAGE
// ─────
//   cargo run --example apply_vector_field                 # generated blobs
//   cargo run --example apply_vector_field -- blobs.png out.png

use gpupipe::{
    from_device, to_device, AffineTransform2D, Buffer, CancellationToken, DeviceConfig, DeviceContext,
    ElementType, HostImage, OperationRegistry, Params, Pipeline,
};

const FRAMES: usize = 36;
const MONTAGE_COLS: usize = 6;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let out_path = args.get(2).cloned().unwrap_or_else(|| "vector_field_montage.png".to_string());

    // --- Source image as float32 ---
    let (w, h, pixels) = match args.get(1) {
        Some(path) => load_gray(path),
        None => {
            eprintln!("[apply_vector_field] no image path given, using generated blobs");
            blobs(256, 254)
        }
    };
    let blobs_host = HostImage::from_vec([w, h], pixels.iter().map(|&v| v as f32).collect::<Vec<f32>>())
        .expect("image dimensions");

    let config = DeviceConfig::from_env().expect("invalid GPUPIPE_* configuration");
    let ctx = DeviceContext::open(&config).expect("failed to open a compute device");
    eprintln!("[apply_vector_field] device: {}", ctx.info());
    let registry = OperationRegistry::with_builtins();
    let cancel = CancellationToken::new();

    // --- Shift fields: +25 inside an oval, blurred ---
    let oval = oval_field(w, h, (20, 98, 72, 68), 25.0);
    let oval_gpu = to_device(&ctx, &oval).expect("push shift field");
    let mut blur = Pipeline::new()
        .input("oval")
        .step("gaussian_blur_2d", &["oval"], &["shift_x"], Params::new().with("sigma_x", 15.0).with("sigma_y", 15.0))
        .output("shift_x")
        .validate(&registry, &[oval.desc()])
        .unwrap_or_else(|e| panic!("blur pipeline rejected: {e}"));
    let shift_x = blur
        .execute(&ctx, &[&oval_gpu], &cancel)
        .unwrap_or_else(|e| panic!("blur failed: {e}"))
        .take("shift_x")
        .expect("declared output");
    oval_gpu.release();

    let blobs_gpu = to_device(&ctx, &blobs_host).expect("push");
    let shift_y = Buffer::allocate_like(&ctx, &blobs_gpu).expect("allocate shift_y");
    let mut stack = Buffer::allocate(&ctx, [w, h, FRAMES], ElementType::F32).expect("allocate result stack");

    // --- One frame per angle ---
    let plane = blobs_host.desc();
    for i in 0..FRAMES {
        let at = AffineTransform2D::identity().rotate_about(
            (i as f64 * 10.0).to_radians(),
            (w / 2) as f64,
            (h / 2) as f64,
        );
        let mut frame = Pipeline::new()
            .input("blobs")
            .input("shift_x")
            .input("shift_y")
            .input("stack")
            .step("affine_transform_2d", &["shift_x"], &["rotated"], Params::new().with("matrix", at.to_params()))
            .step("apply_vector_field_2d", &["blobs", "rotated", "shift_y"], &["warped"], Params::new())
            .step("copy_slice", &["stack", "warped"], &["next"], Params::new().with("slice", i))
            .output("next")
            .validate(&registry, &[plane.clone(), plane.clone(), plane.clone(), stack.desc().clone()])
            .unwrap_or_else(|e| panic!("frame {i} rejected: {e}"));
        let next = frame
            .execute(&ctx, &[&blobs_gpu, &shift_x, &shift_y, &stack], &cancel)
            .unwrap_or_else(|e| panic!("frame {i} failed: {e}"))
            .take("next")
            .expect("declared output");
        stack.release();
        stack = next;
    }

    // --- Pull the stack and write a montage ---
    let result = from_device(&stack).expect("pull");
    let values = result.as_slice::<f32>().expect("float32 stack");
    save_montage(&out_path, w, h, values);
    eprintln!("[apply_vector_field] wrote {out_path} ({FRAMES} frames)");

    for b in [&blobs_gpu, &shift_x, &shift_y, &stack] {
        b.release();
    }
    eprintln!(
        "[apply_vector_field] live buffers: {}, peak device memory: {} bytes",
        ctx.live_buffers(),
        ctx.peak_bytes()
    );
}

/// `value` inside the ellipse inscribed in (x, y, width, height), 0 elsewhere.
fn oval_field(w: usize, h: usize, (ox, oy, ow, oh): (usize, usize, usize, usize), value: f32) -> HostImage {
    let (cx, cy) = (ox as f32 + ow as f32 / 2.0, oy as f32 + oh as f32 / 2.0);
    let (rx, ry) = (ow as f32 / 2.0, oh as f32 / 2.0);
    let mut data = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let dx = (x as f32 + 0.5 - cx) / rx;
            let dy = (y as f32 + 0.5 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                data[y * w + x] = value;
            }
        }
    }
    HostImage::from_vec([w, h], data).expect("field dimensions")
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

/// Planes laid out row by row, inverted, display range 0..256.
fn save_montage(path: &str, w: usize, h: usize, stack: &[f32]) {
    let rows = FRAMES.div_ceil(MONTAGE_COLS);
    let (mw, mh) = (w * MONTAGE_COLS, h * rows);
    let mut out = vec![255u8; mw * mh];
    for z in 0..FRAMES {
        let (tx, ty) = ((z % MONTAGE_COLS) * w, (z / MONTAGE_COLS) * h);
        let plane = &stack[z * w * h..(z + 1) * w * h];
        for y in 0..h {
            for x in 0..w {
                let v = plane[y * w + x].clamp(0.0, 255.0) as u8;
                out[(ty + y) * mw + tx + x] = 255 - v;
            }
        }
    }
    let img = image::GrayImage::from_raw(mw as u32, mh as u32, out).expect("buffer matches dimensions");
    img.save(path).unwrap_or_else(|e| panic!("failed to write {path}: {e}"));
}

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
