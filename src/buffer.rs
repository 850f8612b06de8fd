// buffer.rs — Handle to one allocation of device memory.
//
// A `Buffer` is `(id, descriptor, weak context reference)`. It never owns
// the memory itself; the context's allocation table does. That gives the
// handle three properties:
//
//   - release() is idempotent: freeing an id that is no longer in the
//     table is a no-op.
//   - Every use after release, or after the context was closed or dropped,
//     reports `StaleHandle` (ids are never reused, see device.rs).
//   - The descriptor stays readable after release; only the memory goes.
//
// Dropping a live handle releases it too, with a warning: a forgotten
// intermediate should not hold device memory until the context closes.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::{BufferId, ContextRef, ContextShared, DeviceContext};
use crate::error::{PipelineError, Result};
use crate::image::HostImage;
use crate::tensor::{ElementType, Shape, TensorData, TensorDesc};

/// A handle to device memory holding one tensor.
pub struct Buffer {
    id: BufferId,
    desc: TensorDesc,
    ctx: ContextRef,
}

impl Buffer {
    /// Reserve zero-filled device memory.
    ///
    /// # Errors
    /// `ShapeMismatch` for an invalid shape, `OutOfDeviceMemory` if the
    /// budget or the single-buffer limit cannot satisfy the request,
    /// `StaleHandle` if the context is closed.
    pub fn allocate(ctx: &DeviceContext, shape: impl Into<Shape>, dtype: ElementType) -> Result<Buffer> {
        Self::allocate_desc(ctx, &TensorDesc::new(shape, dtype))
    }

    pub fn allocate_desc(ctx: &DeviceContext, desc: &TensorDesc) -> Result<Buffer> {
        let id = ctx.shared().allocate(desc)?;
        Ok(Buffer {
            id,
            desc: desc.clone(),
            ctx: Arc::downgrade(ctx.shared()),
        })
    }

    /// Allocate a buffer with the same shape and element type as `other`.
    pub fn allocate_like(ctx: &DeviceContext, other: &Buffer) -> Result<Buffer> {
        Self::allocate_desc(ctx, &other.desc)
    }

    /// Copy a host array into a newly allocated buffer. Shape and element
    /// type come from the host array.
    pub fn push(ctx: &DeviceContext, host: &HostImage) -> Result<Buffer> {
        let buffer = Self::allocate_desc(ctx, &host.desc())?;
        // On failure the new buffer drops here and frees its memory.
        buffer.write(host)?;
        Ok(buffer)
    }

    /// Overwrite this buffer's contents. The host array must have the
    /// buffer's exact shape and element type.
    pub fn write(&self, host: &HostImage) -> Result<()> {
        let shared = self.context()?;
        if host.desc() != self.desc {
            return Err(PipelineError::shape(
                self.desc.shape.clone(),
                host.shape().clone(),
                format!("writing {} into {}", host.desc(), self.desc),
            ));
        }
        shared.write(self.id, &host.data().to_le_bytes())
    }

    /// Copy the buffer's contents back into a new host array.
    ///
    /// # Errors
    /// `StaleHandle` if the buffer was released or its context closed.
    pub fn pull(&self) -> Result<HostImage> {
        let shared = self.context()?;
        let bytes = shared.read(self.id)?;
        let data = TensorData::from_le_bytes(self.desc.dtype, &bytes, self.desc.element_count()).ok_or_else(|| {
            PipelineError::shape(
                self.desc.shape.clone(),
                Shape::new([bytes.len() / self.desc.dtype.size_bytes()]),
                format!("device returned {} bytes for {}", bytes.len(), self.desc),
            )
        })?;
        HostImage::new(self.desc.shape.clone(), data)
    }

    /// Free the device memory now. Calling it again is a no-op.
    pub fn release(&self) {
        if let Some(shared) = self.ctx.upgrade() {
            shared.free(self.id);
        }
    }

    /// Whether the memory is still allocated.
    pub fn is_live(&self) -> bool {
        self.ctx.upgrade().is_some_and(|s| s.is_live(self.id))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn shape(&self) -> &Shape {
        &self.desc.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.desc.dtype
    }

    /// Size of the tensor in bytes (dense layout).
    pub fn size_bytes(&self) -> u64 {
        self.desc.size_bytes()
    }

    /// Whether this buffer was allocated from `ctx`.
    pub fn belongs_to(&self, ctx: &DeviceContext) -> bool {
        Weak::ptr_eq(&self.ctx, &Arc::downgrade(ctx.shared()))
    }

    /// The owning context, if the buffer is still live.
    fn context(&self) -> Result<Arc<ContextShared>> {
        let shared = self.ctx.upgrade().ok_or(PipelineError::StaleHandle { id: self.id.0 })?;
        if !shared.is_live(self.id) {
            return Err(PipelineError::StaleHandle { id: self.id.0 });
        }
        Ok(shared)
    }

    /// Id of this buffer for a launch on `ctx`. Buffers from another
    /// context are as unusable as released ones.
    pub(crate) fn live_id(&self, ctx: &DeviceContext) -> Result<BufferId> {
        if !self.belongs_to(ctx) || !self.is_live() {
            return Err(PipelineError::StaleHandle { id: self.id.0 });
        }
        Ok(self.id)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(shared) = self.ctx.upgrade() {
            if shared.free(self.id) {
                log::warn!("buffer {} {} dropped without release()", self.id, self.desc);
            }
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("desc", &self.desc)
            .field("live", &self.is_live())
            .finish()
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer {} {}", self.id, self.desc)
    }
}
