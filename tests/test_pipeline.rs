// tests/test_pipeline.rs — End-to-end pipeline behaviour on the host device.
//
// These run with `cargo test --test test_pipeline`. Everything here goes
// through the public API only: open a context, push host arrays, validate
// and execute pipelines, pull results back.

use gpupipe::error::KernelError;
use gpupipe::{
    from_device, to_device, Arity, Buffer, CancellationToken, DeviceConfig, DeviceContext, ElementType,
    HostImage, Kernel, Operation, OperationRegistry, Params, Pipeline, PipelineError, PipelineState,
    TensorDesc,
};

use proptest::prelude::*;

fn f32_desc(shape: &[usize]) -> TensorDesc {
    TensorDesc::new(shape.to_vec(), ElementType::F32)
}

/// Registry with the built-ins plus `fail_at`, which always errors.
fn registry_with_failing_op() -> OperationRegistry {
    let mut reg = OperationRegistry::with_builtins();
    reg.register(
        "fail_at",
        Operation::new(
            Arity::new(1, 1),
            |inputs: &[TensorDesc], _: &Params| Ok(vec![inputs[0].clone()]),
            Kernel::reference(|_, _, _| Err(KernelError::new(KernelError::DEVICE, "injected failure"))),
        ),
    )
    .unwrap();
    reg
}

// ===== Add constant on a 256×254 image =====

#[test]
fn add_constant_256x254_adds_everywhere() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();

    let src: Vec<f32> = (0..256 * 254).map(|i| (i % 1000) as f32 * 0.5).collect();
    let host = HostImage::from_vec([256, 254], src.clone()).unwrap();
    let input = to_device(&ctx, &host).unwrap();

    let mut pipeline = Pipeline::new()
        .input("blobs")
        .step("add_constant", &["blobs"], &["result"], Params::new().with("value", 25.0))
        .output("result")
        .validate(&reg, &[input.desc().clone()])
        .unwrap();
    let mut outputs = pipeline.execute(&ctx, &[&input], &CancellationToken::new()).unwrap();
    let result = outputs.take("result").unwrap();

    assert_eq!(result.shape().dims(), &[256, 254]);
    let out = from_device(&result).unwrap();
    let out = out.as_slice::<f32>().unwrap();
    for (i, (&o, &s)) in out.iter().zip(&src).enumerate() {
        assert_eq!(o, s + 25.0, "element {i}");
    }
    // Source untouched.
    assert_eq!(from_device(&input).unwrap(), host);

    result.release();
    input.release();
    assert_eq!(ctx.live_buffers(), 0);
}

// ===== Handles =====

#[test]
fn release_is_idempotent_and_later_use_is_stale() {
    let ctx = DeviceContext::open_host().unwrap();
    let buf = Buffer::allocate(&ctx, [4, 4], ElementType::U16).unwrap();
    let id = buf.id().0;
    buf.release();
    buf.release();
    assert!(!buf.is_live());
    assert_eq!(ctx.live_buffers(), 0);

    assert_eq!(buf.pull().unwrap_err(), PipelineError::StaleHandle { id });
    assert_eq!(from_device(&buf).unwrap_err(), PipelineError::StaleHandle { id });
    let host = HostImage::zeros([4, 4], ElementType::U16).unwrap();
    assert_eq!(buf.write(&host).unwrap_err(), PipelineError::StaleHandle { id });

    // Metadata survives release.
    assert_eq!(buf.shape().dims(), &[4, 4]);
    assert_eq!(buf.element_type(), ElementType::U16);

    let reg = OperationRegistry::with_builtins();
    let mut p = Pipeline::new()
        .input("a")
        .step("copy", &["a"], &["b"], Params::new())
        .output("b")
        .validate(&reg, &[buf.desc().clone()])
        .unwrap();
    assert_eq!(
        p.execute(&ctx, &[&buf], &CancellationToken::new()).unwrap_err(),
        PipelineError::StaleHandle { id }
    );
    assert_eq!(ctx.live_buffers(), 0);
}

#[test]
fn closing_the_context_releases_everything() {
    let ctx = DeviceContext::open_host().unwrap();
    let a = Buffer::allocate(&ctx, [8], ElementType::F32).unwrap();
    let b = Buffer::allocate(&ctx, [8], ElementType::U8).unwrap();
    ctx.close();
    assert_eq!(ctx.live_buffers(), 0);
    assert!(matches!(a.pull(), Err(PipelineError::StaleHandle { .. })));
    assert!(matches!(b.pull(), Err(PipelineError::StaleHandle { .. })));
    assert!(matches!(Buffer::allocate(&ctx, [1], ElementType::F32), Err(PipelineError::StaleHandle { .. })));
}

// ===== Registry =====

#[test]
fn duplicate_registration_keeps_the_first() {
    let mut reg = OperationRegistry::new();
    let first = Operation::new(
        Arity::new(1, 1),
        |inputs: &[TensorDesc], _: &Params| Ok(vec![inputs[0].clone()]),
        Kernel::reference(|_, _, _| Ok(())),
    );
    let second = Operation::new(
        Arity::new(2, 1),
        |inputs: &[TensorDesc], _: &Params| Ok(vec![inputs[0].clone()]),
        Kernel::reference(|_, _, _| Ok(())),
    );
    reg.register("blend", first).unwrap();
    assert_eq!(
        reg.register("blend", second).unwrap_err(),
        PipelineError::DuplicateOperation { name: "blend".into() }
    );
    assert_eq!(reg.resolve("blend").unwrap().arity(), Arity::new(1, 1));
    assert_eq!(reg.len(), 1);

    let mut builtins = OperationRegistry::with_builtins();
    let before = builtins.len();
    assert!(matches!(
        builtins.register("copy", Operation::new(
            Arity::new(0, 1),
            |_: &[TensorDesc], _: &Params| Ok(vec![TensorDesc::new([1], ElementType::F32)]),
            Kernel::reference(|_, _, _| Ok(())),
        )),
        Err(PipelineError::DuplicateOperation { .. })
    ));
    assert_eq!(builtins.len(), before);
    assert_eq!(builtins.resolve("copy").unwrap().arity(), Arity::new(1, 1));
}

#[test]
fn unknown_operation_fails_validate_before_allocating() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let input = Buffer::allocate(&ctx, [16, 16], ElementType::F32).unwrap();
    let bytes = ctx.bytes_in_use();
    let peak = ctx.peak_bytes();

    let err = Pipeline::new()
        .input("img")
        .step("gaussian_blur_2d", &["img"], &["blurred"], Params::new().with("sigma_x", 1.0).with("sigma_y", 1.0))
        .step("median_filter", &["blurred"], &["out"], Params::new())
        .output("out")
        .validate(&reg, &[input.desc().clone()])
        .unwrap_err();

    assert_eq!(err, PipelineError::UnknownOperation { name: "median_filter".into(), step: Some(1) });
    assert_eq!(ctx.live_buffers(), 1);
    assert_eq!(ctx.bytes_in_use(), bytes);
    assert_eq!(ctx.peak_bytes(), peak);
}

// ===== Failure and cancellation =====

#[test]
fn failing_step_leaves_live_count_unchanged() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = registry_with_failing_op();
    let input = to_device(&ctx, &HostImage::from_vec([4, 2], vec![1.0f32; 8]).unwrap()).unwrap();
    let mut p = Pipeline::new()
        .input("a")
        .step("add_constant", &["a"], &["b"], Params::new().with("value", 1.0))
        .step("copy", &["b"], &["c"], Params::new())
        .step("fail_at", &["c"], &["d"], Params::new())
        .output("b")
        .output("d")
        .validate(&reg, &[f32_desc(&[4, 2])])
        .unwrap();

    let before = ctx.live_buffers();
    let err = p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PipelineError::KernelExecution { ref op, code: KernelError::DEVICE, .. } if op == "fail_at"));
    assert_eq!(ctx.live_buffers(), before);
    assert_eq!(p.state(), PipelineState::Failed);
    assert_eq!(p.last_error(), Some(&err));
    // Input untouched.
    assert_eq!(input.pull().unwrap().as_slice::<f32>().unwrap(), &[1.0; 8]);
}

#[test]
fn threshold_over_nan_fails_and_rolls_back() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let input = to_device(&ctx, &HostImage::from_vec([3], vec![1.0f32, f32::NAN, 3.0]).unwrap()).unwrap();
    let mut p = Pipeline::new()
        .input("a")
        .step("add_constant", &["a"], &["b"], Params::new().with("value", 2.0))
        .step("automatic_threshold", &["b"], &["mask"], Params::new())
        .output("mask")
        .validate(&reg, &[f32_desc(&[3])])
        .unwrap();
    let err = p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap_err();
    assert!(matches!(err, PipelineError::KernelExecution { code: KernelError::BAD_INPUT, .. }));
    assert_eq!(ctx.live_buffers(), 1);
}

#[test]
fn cancellation_token_shared_across_threads() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let input = Buffer::allocate(&ctx, [8], ElementType::F32).unwrap();
    let mut p = Pipeline::new()
        .input("a")
        .step("copy", &["a"], &["b"], Params::new())
        .output("b")
        .validate(&reg, &[f32_desc(&[8])])
        .unwrap();

    let cancel = CancellationToken::new();
    let remote = cancel.clone();
    std::thread::spawn(move || remote.cancel()).join().unwrap();

    assert_eq!(p.execute(&ctx, &[&input], &cancel).unwrap_err(), PipelineError::Cancelled { step: 0 });
    assert_eq!(ctx.live_buffers(), 1);

    // A fresh token runs to completion on the same validated pipeline.
    let mut outputs = p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap();
    assert_eq!(p.state(), PipelineState::Completed);
    assert_eq!(p.last_error(), None);
    outputs.release_all();
    assert_eq!(ctx.live_buffers(), 1);
}

#[test]
fn cancelling_mid_run_releases_intermediates() {
    let ctx = DeviceContext::open_host().unwrap();
    let cancel = CancellationToken::new();
    let mut reg = OperationRegistry::with_builtins();
    let trigger = cancel.clone();
    reg.register(
        "cancel_here",
        Operation::new(
            Arity::new(1, 1),
            |inputs: &[TensorDesc], _: &Params| Ok(vec![inputs[0].clone()]),
            Kernel::reference(move |_, _, _| {
                trigger.cancel();
                Ok(())
            }),
        ),
    )
    .unwrap();

    let input = to_device(&ctx, &HostImage::from_vec([4, 4], vec![2.0f32; 16]).unwrap()).unwrap();
    let mut p = Pipeline::new()
        .input("a")
        .step("copy", &["a"], &["b"], Params::new())
        .step("cancel_here", &["b"], &["c"], Params::new())
        .step("add_constant", &["c"], &["d"], Params::new().with("value", 1.0))
        .output("b")
        .output("d")
        .validate(&reg, &[f32_desc(&[4, 4])])
        .unwrap();

    assert_eq!(p.execute(&ctx, &[&input], &cancel).unwrap_err(), PipelineError::Cancelled { step: 2 });
    assert!(cancel.is_cancelled());
    assert_eq!(ctx.live_buffers(), 1);
    assert_eq!(ctx.bytes_in_use(), 64);
    assert_eq!(p.state(), PipelineState::Failed);
    assert_eq!(input.pull().unwrap().as_slice::<f32>().unwrap(), &[2.0; 16]);
}

#[test]
fn out_of_memory_mid_run_rolls_back() {
    let ctx = DeviceContext::open(&DeviceConfig::host().with_memory_budget(1024)).unwrap();
    let reg = OperationRegistry::with_builtins();
    let input = Buffer::allocate(&ctx, [16, 16], ElementType::F32).unwrap();
    let mut p = Pipeline::new()
        .input("a")
        .step("copy", &["a"], &["b"], Params::new())
        .output("b")
        .validate(&reg, &[f32_desc(&[16, 16])])
        .unwrap();
    assert_eq!(
        p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap_err(),
        PipelineError::OutOfDeviceMemory { requested: 1024, available: 0 }
    );
    assert_eq!(ctx.live_buffers(), 1);
}

#[test]
fn vector_field_past_the_edge_of_a_very_wide_image() {
    // Width 16_777_220: the last column index is not exact in f32.
    let w = 16_777_220;
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let mut pixels = vec![0.0f32; w];
    pixels[w - 1] = 5.0;
    let mut dx = vec![0.0f32; w];
    dx[0] = 1e9;
    let image = to_device(&ctx, &HostImage::from_vec([w, 1], pixels).unwrap()).unwrap();
    let shift_x = to_device(&ctx, &HostImage::from_vec([w, 1], dx).unwrap()).unwrap();
    let shift_y = Buffer::allocate(&ctx, [w, 1], ElementType::F32).unwrap();
    let mut p = Pipeline::new()
        .input("img")
        .input("dx")
        .input("dy")
        .step("apply_vector_field_2d", &["img", "dx", "dy"], &["warped"], Params::new())
        .output("warped")
        .validate(&reg, &[f32_desc(&[w, 1]), f32_desc(&[w, 1]), f32_desc(&[w, 1])])
        .unwrap();

    let mut outputs = p.execute(&ctx, &[&image, &shift_x, &shift_y], &CancellationToken::new()).unwrap();
    let warped = outputs.take("warped").unwrap();
    let result = from_device(&warped).unwrap();
    let values = result.as_slice::<f32>().unwrap();
    assert_eq!(values[0], 5.0);
    assert_eq!(values[1], 0.0);
    assert_eq!(values[w - 1], 5.0);
}

// ===== Multi-step chains =====

#[test]
fn stack_roundtrip_through_slices() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let stack = HostImage::from_planes(vec![
        vec![vec![1u8, 2], vec![3, 4]],
        vec![vec![5u8, 6], vec![7, 8]],
        vec![vec![9u8, 10], vec![11, 12]],
    ])
    .unwrap();
    let input = to_device(&ctx, &stack).unwrap();

    // Pull plane 1, brighten it and put it back in plane 2.
    let mut p = Pipeline::new()
        .input("stack")
        .step("extract_slice", &["stack"], &["plane"], Params::new().with("slice", 1))
        .step("add_constant", &["plane"], &["bright"], Params::new().with("value", 100.0))
        .step("copy_slice", &["stack", "bright"], &["out"], Params::new().with("slice", 2))
        .output("out")
        .validate(&reg, &[input.desc().clone()])
        .unwrap();
    assert_eq!(p.inferred("plane"), Some(&TensorDesc::new([2, 2], ElementType::U8)));

    let mut outputs = p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap();
    let out = outputs.take("out").unwrap();
    assert_eq!(
        out.pull().unwrap().as_slice::<u8>().unwrap(),
        &[1, 2, 3, 4, 5, 6, 7, 8, 105, 106, 107, 108]
    );
    out.release();
    input.release();
    assert_eq!(ctx.live_buffers(), 0);
}

#[test]
fn threshold_then_convert_to_u8_mask() {
    let ctx = DeviceContext::open_host().unwrap();
    let reg = OperationRegistry::with_builtins();
    let mut values = vec![10.0f32; 32];
    values[5..12].fill(200.0);
    let input = to_device(&ctx, &HostImage::from_vec([8, 4], values.clone()).unwrap()).unwrap();

    let mut p = Pipeline::new()
        .input("img")
        .step("automatic_threshold", &["img"], &["mask"], Params::new().with("method", "Otsu"))
        .step("multiply_constant", &["mask"], &["scaled"], Params::new().with("value", 255.0))
        .step("convert", &["scaled"], &["mask8"], Params::new().with("type", "uint8"))
        .output("mask8")
        .validate(&reg, &[f32_desc(&[8, 4])])
        .unwrap();
    let mut outputs = p.execute(&ctx, &[&input], &CancellationToken::new()).unwrap();
    let mask = outputs.take("mask8").unwrap();
    assert_eq!(mask.element_type(), ElementType::U8);
    let expected: Vec<u8> = values.iter().map(|&v| if v > 100.0 { 255 } else { 0 }).collect();
    assert_eq!(mask.pull().unwrap().as_slice::<u8>().unwrap(), expected.as_slice());
    mask.release();
}

// ===== Validated pipelines never hit a shape error at run time =====

/// Ops the generator draws from: (name, input count, params builder).
fn random_step(kind: u8, k: u8) -> (&'static str, usize, Params) {
    match kind % 9 {
        0 => ("copy", 1, Params::new()),
        1 => ("add_constant", 1, Params::new().with("value", k as f64)),
        2 => ("multiply_constant", 1, Params::new().with("value", 0.5)),
        3 => ("add_images", 2, Params::new()),
        4 => ("convert", 1, Params::new().with("type", ["uint8", "uint16", "float32"][k as usize % 3])),
        5 => ("gaussian_blur_2d", 1, Params::new().with("sigma_x", 0.8).with("sigma_y", 0.0)),
        6 => ("extract_slice", 1, Params::new().with("slice", (k % 3) as i64)),
        7 => ("automatic_threshold", 1, Params::new()),
        _ => ("affine_transform_2d", 1, Params::new().with("matrix", [1.0, 0.0, 0.5, 0.0, 1.0, 0.0])),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn validated_pipelines_never_shape_mismatch(
        dims in prop::collection::vec(1usize..5, 1..4),
        dtype in prop::sample::select(ElementType::ALL.to_vec()),
        steps in prop::collection::vec((any::<u8>(), any::<u8>(), any::<usize>(), any::<usize>()), 1..6),
    ) {
        let ctx = DeviceContext::open_host().unwrap();
        let reg = OperationRegistry::with_builtins();
        let desc = TensorDesc::new(dims.clone(), dtype);

        let mut names = vec!["in".to_string()];
        let mut p = Pipeline::new().input("in");
        for (i, (kind, k, a, b)) in steps.iter().enumerate() {
            let (op, arity, params) = random_step(*kind, *k);
            let inputs: Vec<&str> = [a, b][..arity].iter().map(|&&c| names[c % names.len()].as_str()).collect();
            let out = format!("s{i}");
            p = p.step(op, &inputs, &[out.as_str()], params);
            names.push(out);
        }
        let last = names.last().cloned().unwrap();
        p = p.output(&last);

        if let Ok(mut v) = p.validate(&reg, &[desc.clone()]) {
            let input = Buffer::allocate_desc(&ctx, &desc).unwrap();
            let result = v.execute(&ctx, &[&input], &CancellationToken::new());
            prop_assert!(
                !matches!(result, Err(PipelineError::ShapeMismatch { .. })),
                "validated pipeline failed with {:?}", result.err()
            );
            if let Ok(mut outputs) = result {
                let out = outputs.take(&last).unwrap();
                prop_assert_eq!(out.desc(), v.inferred(&last).unwrap());
                out.release();
            }
            input.release();
            prop_assert_eq!(ctx.live_buffers(), 0);
        }
    }

    #[test]
    fn failed_runs_restore_live_count(fail_at in 0usize..4, len in 1usize..6) {
        let ctx = DeviceContext::open_host().unwrap();
        let reg = registry_with_failing_op();
        let input = Buffer::allocate(&ctx, [len, 2], ElementType::F32).unwrap();

        let mut p = Pipeline::new().input("s0");
        for i in 0..4 {
            let op = if i == fail_at { "fail_at" } else { "copy" };
            p = p.step(op, &[format!("s{i}").as_str()], &[format!("s{}", i + 1).as_str()], Params::new());
        }
        let mut v = p.output("s4").validate(&reg, &[f32_desc(&[len, 2])]).unwrap();

        let before = ctx.live_buffers();
        let result = v.execute(&ctx, &[&input], &CancellationToken::new());
        let failed = matches!(result, Err(PipelineError::KernelExecution { .. }));
        prop_assert!(failed);
        prop_assert_eq!(ctx.live_buffers(), before);
    }
}
