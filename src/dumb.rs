//! A render surface backed by kernel dumb buffers.
//!
//! Only solid fills are supported. This is enough to light up outputs without a gpu renderer,
//! which is what the `run` subcommand does.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use smithay::{
    reexports::drm::buffer::{self, DrmFourcc},
    utils::{Logical, Size},
};
use tracing::{trace, warn};

use crate::{
    device::{DeviceId, DumbAllocation, KmsDevice},
    framebuffer::{BufferId, DestroyHook, ScanoutBuffer},
    surface::{RenderSurface, SurfaceFactory},
};

const BUFFER_COUNT: usize = 3;

/// A cpu-mapped buffer allocated by the kernel.
pub struct DumbBuffer {
    id: BufferId,
    device: Arc<dyn KmsDevice>,
    allocation: DumbAllocation,
    destroy_hooks: Mutex<Vec<DestroyHook>>,
}

impl fmt::Debug for DumbBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbBuffer")
            .field("id", &self.id)
            .field("allocation", &self.allocation)
            .finish()
    }
}

impl DumbBuffer {
    pub fn new(device: Arc<dyn KmsDevice>, size: (u32, u32)) -> anyhow::Result<Self> {
        let allocation = device
            .create_dumb_buffer(size, DrmFourcc::Xrgb8888)
            .context("failed to create dumb buffer")?;

        Ok(Self {
            id: BufferId::next(),
            device,
            allocation,
            destroy_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Fills the whole buffer with `color`, given as RGBA in `0.0..=1.0`.
    pub fn fill(&self, color: [f32; 4]) -> anyhow::Result<()> {
        let pixel = pack_xrgb(color);
        let (w, h) = self.allocation.size;
        let row_pixels = (self.allocation.pitch / 4).max(w) as usize;

        let data = vec![pixel; row_pixels * h as usize];
        self.device
            .write_dumb_buffer(self.allocation.handle, bytemuck::cast_slice(&data))
            .context("failed to write dumb buffer")
    }
}

impl ScanoutBuffer for DumbBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn device_id(&self) -> DeviceId {
        self.device.id()
    }

    fn size(&self) -> (u32, u32) {
        self.allocation.size
    }

    fn stride(&self) -> u32 {
        self.allocation.pitch
    }

    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn handle(&self) -> buffer::Handle {
        self.allocation.handle
    }

    fn on_destroy(&self, hook: DestroyHook) {
        self.destroy_hooks.lock().unwrap().push(hook);
    }
}

impl Drop for DumbBuffer {
    fn drop(&mut self) {
        for hook in self.destroy_hooks.get_mut().unwrap().drain(..) {
            hook();
        }

        if let Err(err) = self.device.destroy_dumb_buffer(self.allocation.handle) {
            warn!(buffer = self.id.0, "Failed to destroy dumb buffer: {err}");
        }
    }
}

/// A ring of dumb buffers presented in order.
pub struct DumbSurface {
    size: Size<i32, Logical>,
    buffers: Vec<Arc<DumbBuffer>>,
    back: usize,
    front: Option<usize>,
}

impl fmt::Debug for DumbSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DumbSurface")
            .field("size", &self.size)
            .field("back", &self.back)
            .field("front", &self.front)
            .finish()
    }
}

impl DumbSurface {
    pub fn new(device: &Arc<dyn KmsDevice>, size: Size<i32, Logical>) -> anyhow::Result<Self> {
        if size.w <= 0 || size.h <= 0 {
            anyhow::bail!("cannot create a {}x{} surface", size.w, size.h);
        }

        let buffers = (0..BUFFER_COUNT)
            .map(|_| DumbBuffer::new(device.clone(), (size.w as u32, size.h as u32)).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            size,
            buffers,
            back: 0,
            front: None,
        })
    }
}

impl RenderSurface for DumbSurface {
    fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    fn make_current(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release_current(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn bind(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn clear(&mut self, color: [f32; 4]) -> anyhow::Result<()> {
        self.buffers[self.back].fill(color)
    }

    fn swap_buffers(&mut self) -> anyhow::Result<()> {
        trace!(front = self.back, "Swapping dumb buffers");
        self.front = Some(self.back);
        self.back = (self.back + 1) % self.buffers.len();
        Ok(())
    }

    fn lock_front(&mut self) -> anyhow::Result<Arc<dyn ScanoutBuffer>> {
        let front = self.front.context("no buffer has been swapped to the front yet")?;
        Ok(self.buffers[front].clone())
    }
}

/// Creates [`DumbSurface`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct DumbSurfaceFactory;

impl SurfaceFactory for DumbSurfaceFactory {
    fn create_surface(
        &self,
        device: &Arc<dyn KmsDevice>,
        size: Size<i32, Logical>,
        _shared: bool,
    ) -> anyhow::Result<Box<dyn RenderSurface>> {
        Ok(Box::new(DumbSurface::new(device, size)?))
    }
}

fn pack_xrgb([r, g, b, _]: [f32; 4]) -> u32 {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
    0xff00_0000 | channel(r) << 16 | channel(g) << 8 | channel(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_colors_as_xrgb() {
        assert_eq!(pack_xrgb([0.0, 0.0, 0.0, 1.0]), 0xff00_0000);
        assert_eq!(pack_xrgb([1.0, 0.0, 0.0, 1.0]), 0xffff_0000);
        assert_eq!(pack_xrgb([0.0, 1.0, 0.0, 0.5]), 0xff00_ff00);
        assert_eq!(pack_xrgb([0.0, 0.0, 2.0, 1.0]), 0xff00_00ff);
    }
}
