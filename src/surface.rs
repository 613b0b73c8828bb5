//! Contracts with the renderer that produces pixel content.

use std::sync::Arc;

use smithay::utils::{Logical, Rectangle, Size, Transform};

use crate::{device::KmsDevice, framebuffer::ScanoutBuffer};

/// A swapchain the renderer draws into, whose front buffer is scanned out.
pub trait RenderSurface: Send {
    fn size(&self) -> Size<i32, Logical>;

    fn make_current(&mut self) -> anyhow::Result<()>;
    fn release_current(&mut self) -> anyhow::Result<()>;
    /// Binds the back buffer as the render target.
    fn bind(&mut self) -> anyhow::Result<()>;
    /// Fills the back buffer with a solid colour.
    fn clear(&mut self, color: [f32; 4]) -> anyhow::Result<()>;
    /// Makes the back buffer the new front buffer.
    fn swap_buffers(&mut self) -> anyhow::Result<()>;
    /// Returns the front buffer, which stays valid as long as the returned reference is held.
    fn lock_front(&mut self) -> anyhow::Result<Arc<dyn ScanoutBuffer>>;
}

pub trait SurfaceFactory: Send + Sync {
    /// Creates a render surface whose buffers can be scanned out on `device`.
    ///
    /// `shared` is set when the surface backs more than one output.
    fn create_surface(
        &self,
        device: &Arc<dyn KmsDevice>,
        size: Size<i32, Logical>,
        shared: bool,
    ) -> anyhow::Result<Box<dyn RenderSurface>>;
}

/// A client surface placed in the shared coordinate space.
pub trait Renderable {
    /// Where the buffer is shown, in the shared coordinate space.
    fn screen_position(&self) -> Rectangle<i32, Logical>;
    fn buffer(&self) -> Arc<dyn ScanoutBuffer>;
    fn transform(&self) -> Transform {
        Transform::Normal
    }
    fn alpha(&self) -> f32 {
        1.0
    }
    /// Whether the buffer has no translucent pixels.
    fn is_opaque(&self) -> bool {
        true
    }
}

/// Whether `renderable` exactly covers `area` on its own, unscaled and untransformed.
pub fn covers_exactly(renderable: &dyn Renderable, area: Rectangle<i32, Logical>) -> bool {
    let position = renderable.screen_position();
    let (w, h) = renderable.buffer().size();

    position == area
        && position.size == Size::from((w as i32, h as i32))
        && renderable.transform() == Transform::Normal
        && renderable.alpha() >= 1.0
        && renderable.is_opaque()
}
