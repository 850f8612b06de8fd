// bridge.rs — Host ↔ device transfers.
//
// Device layout is dense, x-fastest, little-endian. Host arrays are
// `HostImage` (dense, any rank) or the strided 2D `Image<T>` the rest of
// an image-processing program usually works with; row padding of the
// latter is compacted on the way in.

use crate::buffer::Buffer;
use crate::device::DeviceContext;
use crate::error::Result;
use crate::image::{Element, HostImage, Image};

/// Copy a host array into a new device buffer.
pub fn to_device(ctx: &DeviceContext, host: &HostImage) -> Result<Buffer> {
    Buffer::push(ctx, host)
}

/// Copy a device buffer back to the host.
pub fn from_device(buffer: &Buffer) -> Result<HostImage> {
    buffer.pull()
}

/// Upload a strided 2D image.
pub fn image_to_device<T: Element>(ctx: &DeviceContext, img: &Image<T>) -> Result<Buffer> {
    to_device(ctx, &HostImage::from_image(img)?)
}

/// Download a 2D buffer as an `Image<T>`. Fails with `ShapeMismatch` if
/// the buffer is not a single plane of element type `T`.
pub fn image_from_device<T: Element>(buffer: &Buffer) -> Result<Image<T>> {
    from_device(buffer)?.to_image()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::tensor::{ElementType, TensorData};

    #[test]
    fn test_round_trip_every_type() {
        let ctx = DeviceContext::open_host().unwrap();
        let samples = [
            HostImage::from_vec([3, 2], vec![0u8, 1, 2, 127, 254, 255]).unwrap(),
            HostImage::from_vec([3, 2], vec![0u16, 1, 300, 4096, 65534, 65535]).unwrap(),
            HostImage::from_vec([3, 2], vec![0u32, 1, 70000, 1 << 24, u32::MAX - 1, u32::MAX]).unwrap(),
            HostImage::from_vec([3, 2], vec![0.0f32, -1.5, 3.25, f32::MAX, f32::MIN_POSITIVE, 1e-30]).unwrap(),
        ];
        for host in &samples {
            let buf = to_device(&ctx, host).unwrap();
            assert_eq!(buf.element_type(), host.dtype());
            assert_eq!(&from_device(&buf).unwrap(), host);
            buf.release();
        }
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_strided_image_is_compacted() {
        let ctx = DeviceContext::open_host().unwrap();
        let mut img: Image<u8> = Image::new_with_stride(3, 2, 8);
        for y in 0..2 {
            for x in 0..3 {
                img.set(x, y, (y * 3 + x) as u8);
            }
        }
        let buf = image_to_device(&ctx, &img).unwrap();
        assert_eq!(buf.size_bytes(), 6);
        let host = from_device(&buf).unwrap();
        assert_eq!(host.data(), &TensorData::U8(vec![0, 1, 2, 3, 4, 5]));
        let back: Image<u8> = image_from_device(&buf).unwrap();
        assert_eq!(back.stride(), 3);
        assert_eq!(back.get(2, 1), 5);
    }

    #[test]
    fn test_image_from_device_checks_type() {
        let ctx = DeviceContext::open_host().unwrap();
        let buf = to_device(&ctx, &HostImage::zeros([4, 4], ElementType::U16).unwrap()).unwrap();
        let err = image_from_device::<f32>(&buf).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_ragged_rows_rejected_before_upload() {
        let ctx = DeviceContext::open_host().unwrap();
        let err = HostImage::from_rows(vec![vec![1u8, 2, 3], vec![4, 5]]).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert_eq!(ctx.live_buffers(), 0);
    }
}
