// tests/test_bridge.rs — Host ↔ device transfers through the public API.
//
// Round trips every element type through the host reference device, plus
// the strided-image and nested-row constructors.

use gpupipe::bridge::{image_from_device, image_to_device};
use gpupipe::image::Image;
use gpupipe::tensor::TensorData;
use gpupipe::{from_device, to_device, Buffer, DeviceContext, ElementType, HostImage, PipelineError};

use proptest::prelude::*;

fn shape_strategy() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..7, 1..4)
}

fn count(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn round_trip(host: &HostImage) -> HostImage {
    let ctx = DeviceContext::open_host().unwrap();
    let buf = to_device(&ctx, host).unwrap();
    assert_eq!(buf.desc(), &host.desc());
    let back = from_device(&buf).unwrap();
    buf.release();
    assert_eq!(ctx.live_buffers(), 0);
    back
}

proptest! {
    #[test]
    fn round_trip_u8(shape in shape_strategy(), seed in any::<u8>()) {
        let data: Vec<u8> = (0..count(&shape)).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
        let host = HostImage::from_vec(shape, data).unwrap();
        prop_assert_eq!(round_trip(&host), host);
    }

    #[test]
    fn round_trip_u16(shape in shape_strategy(), seed in any::<u16>()) {
        let data: Vec<u16> = (0..count(&shape)).map(|i| (i as u16).wrapping_mul(4099).wrapping_add(seed)).collect();
        let host = HostImage::from_vec(shape, data).unwrap();
        prop_assert_eq!(round_trip(&host), host);
    }

    #[test]
    fn round_trip_u32(shape in shape_strategy(), seed in any::<u32>()) {
        let data: Vec<u32> = (0..count(&shape)).map(|i| (i as u32).wrapping_mul(2_654_435_761).wrapping_add(seed)).collect();
        let host = HostImage::from_vec(shape, data).unwrap();
        prop_assert_eq!(round_trip(&host), host);
    }

    #[test]
    fn round_trip_f32(shape in shape_strategy(), values in prop::collection::vec(-1.0e6f32..1.0e6, 216)) {
        let data = values[..count(&shape)].to_vec();
        let host = HostImage::from_vec(shape, data).unwrap();
        prop_assert_eq!(round_trip(&host), host);
    }
}

#[test]
fn round_trip_f32_special_values() {
    let data = vec![0.0f32, -0.0, f32::MIN_POSITIVE, f32::MAX, f32::MIN, f32::INFINITY, f32::NEG_INFINITY, 1.5e-42];
    let host = HostImage::from_vec([8], data.clone()).unwrap();
    let back = round_trip(&host);
    let back = back.as_slice::<f32>().unwrap();
    for (a, b) in back.iter().zip(&data) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn every_type_zero_initialized() {
    let ctx = DeviceContext::open_host().unwrap();
    for dtype in ElementType::ALL {
        let buf = Buffer::allocate(&ctx, [3, 2, 2], dtype).unwrap();
        assert_eq!(from_device(&buf).unwrap(), HostImage::zeros([3, 2, 2], dtype).unwrap());
        buf.release();
    }
}

#[test]
fn strided_image_is_compacted() {
    let ctx = DeviceContext::open_host().unwrap();
    let mut img: Image<u16> = Image::new_with_stride(3, 2, 8);
    for y in 0..2 {
        for x in 0..3 {
            img.set(x, y, (y * 10 + x) as u16);
        }
    }
    let buf = image_to_device(&ctx, &img).unwrap();
    assert_eq!(buf.shape().dims(), &[3, 2]);
    assert_eq!(buf.pull().unwrap().data(), &TensorData::U16(vec![0, 1, 2, 10, 11, 12]));

    let back: Image<u16> = image_from_device(&buf).unwrap();
    assert_eq!(back.width(), 3);
    assert_eq!(back.stride(), 3);
    for (x, y, v) in back.pixels() {
        assert_eq!(v, img.get(x, y));
    }
}

#[test]
fn image_from_device_checks_type() {
    let ctx = DeviceContext::open_host().unwrap();
    let buf = Buffer::allocate(&ctx, [4, 4], ElementType::U8).unwrap();
    assert!(image_from_device::<f32>(&buf).is_err());
    let stack = Buffer::allocate(&ctx, [4, 4, 2], ElementType::U8).unwrap();
    assert!(matches!(image_from_device::<u8>(&stack), Err(PipelineError::ShapeMismatch { .. })));
}

#[test]
fn ragged_rows_rejected() {
    let err = HostImage::from_rows(vec![vec![1.0f32, 2.0], vec![3.0]]).unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch { step: None, .. }));
    let err = HostImage::from_planes(vec![vec![vec![1u8, 2]], vec![vec![3u8, 4], vec![5, 6]]]).unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
}

#[test]
fn push_rejects_shape_change_on_write() {
    let ctx = DeviceContext::open_host().unwrap();
    let buf = to_device(&ctx, &HostImage::from_rows(vec![vec![1u8, 2], vec![3, 4]]).unwrap()).unwrap();
    let other = HostImage::from_vec([4], vec![1u8, 2, 3, 4]).unwrap();
    assert!(matches!(buf.write(&other), Err(PipelineError::ShapeMismatch { .. })));
    let same = HostImage::from_rows(vec![vec![9u8, 8], vec![7, 6]]).unwrap();
    buf.write(&same).unwrap();
    assert_eq!(from_device(&buf).unwrap(), same);
}
