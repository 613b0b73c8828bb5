use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use smithay::reexports::drm::{
    buffer::{self, DrmFourcc},
    control::framebuffer,
};
use tracing::{trace, warn};

use crate::{
    device::{DeviceId, FramebufferDesc, KmsDevice},
    error::KmsError,
};

/// A stable identity for a gpu buffer, independent of its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    /// A fresh, process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A hook run when a buffer is destroyed. May run on any thread.
pub type DestroyHook = Box<dyn FnOnce() + Send>;

/// An externally owned gpu buffer that may be scanned out.
pub trait ScanoutBuffer: Send + Sync {
    fn id(&self) -> BufferId;
    /// The device whose memory this buffer lives in.
    fn device_id(&self) -> DeviceId;
    fn size(&self) -> (u32, u32);
    fn stride(&self) -> u32;
    fn format(&self) -> DrmFourcc;
    fn handle(&self) -> buffer::Handle;

    /// Whether the buffer was allocated with scanout usage.
    fn can_scanout(&self) -> bool {
        true
    }

    /// Registers `hook` to run once when this buffer is destroyed.
    fn on_destroy(&self, hook: DestroyHook);
}

/// A kernel framebuffer registered for one buffer.
///
/// The kernel id is released when this is dropped.
pub struct Framebuffer {
    device: Arc<dyn KmsDevice>,
    handle: framebuffer::Handle,
}

impl Framebuffer {
    pub fn id(&self) -> framebuffer::Handle {
        self.handle
    }
}

impl fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Framebuffer")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        trace!(fb = ?self.handle, "Destroying framebuffer");
        if let Err(err) = self.device.destroy_framebuffer(self.handle) {
            warn!(fb = ?self.handle, "Failed to destroy framebuffer: {err}");
        }
    }
}

type FramebufferTable = Mutex<HashMap<BufferId, Arc<Framebuffer>>>;

/// Maps buffers to their kernel framebuffers.
///
/// Entries are keyed by buffer identity and removed by the buffer's destroy hook, which may fire
/// on a different thread than the one scanning out.
pub struct FramebufferRegistry {
    device: Arc<dyn KmsDevice>,
    table: Arc<FramebufferTable>,
}

impl fmt::Debug for FramebufferRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramebufferRegistry")
            .field("device", &self.device.id())
            .field("len", &self.table.lock().unwrap().len())
            .finish()
    }
}

impl FramebufferRegistry {
    pub fn new(device: Arc<dyn KmsDevice>) -> Self {
        Self {
            device,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the framebuffer already registered for `buffer`, or registers one.
    pub fn lookup_or_create(
        &self,
        buffer: &dyn ScanoutBuffer,
    ) -> Result<Arc<Framebuffer>, KmsError> {
        let id = buffer.id();
        let mut table = self.table.lock().unwrap();

        if let Some(fb) = table.get(&id) {
            return Ok(fb.clone());
        }

        let desc = FramebufferDesc {
            size: buffer.size(),
            format: buffer.format(),
            stride: buffer.stride(),
            handle: buffer.handle(),
        };
        let handle = self
            .device
            .add_framebuffer(&desc)
            .map_err(|err| KmsError::from_io("add framebuffer", err))?;

        trace!(buffer = id.0, fb = ?handle, "Registered framebuffer");

        let fb = Arc::new(Framebuffer {
            device: self.device.clone(),
            handle,
        });
        table.insert(id, fb.clone());
        drop(table);

        let table: Weak<FramebufferTable> = Arc::downgrade(&self.table);
        buffer.on_destroy(Box::new(move || {
            let Some(table) = table.upgrade() else {
                return;
            };
            // Drop outside the lock; the last reference destroys the kernel id
            let fb = table.lock().unwrap().remove(&id);
            drop(fb);
        }));

        Ok(fb)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
