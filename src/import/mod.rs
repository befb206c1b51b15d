//! # Pixmap import strategies
//!
//! Window contents reach the GPU one of two ways, depending on what
//! the server and driver offer:
//!
//! * `dri3` - the pixmap's backing storage is exported as a dma-buf
//!   file descriptor and imported directly as device memory. Zero
//!   copies, but requires DRI3 plus the external-memory device
//!   extensions.
//! * `shm` - pixel data is pulled through a SysV shared memory segment
//!   the server writes into, then copied GPU-side from a host-pointer
//!   staging buffer into a device-local image every compose.
//!
//! The strategy is picked once when the device is created and stored
//! on the context; per-frame code dispatches through this trait and
//! never looks at the transport again.

pub mod dri3;
pub mod shm;

use ash::vk;

use crate::device::Device;
use crate::image::BoundImage;
use crate::platform::BindPixmapStrategy;
use crate::region::Rect;
use crate::session::Session;
use crate::Result;

use std::os::raw::c_void;

/// GPU resources produced by importing one pixmap.
pub struct ImportedPixmap {
    pub ip_width: u16,
    pub ip_height: u16,
    pub ip_image: vk::Image,
    pub ip_memory: vk::DeviceMemory,
    pub ip_state: ImportState,
}

/// Per-image transport state, torn down with the image.
pub enum ImportState {
    /// dma-buf imports need nothing beyond the image + memory pair
    Dri3,
    Shm(ShmState),
}

/// The shared memory plumbing backing one shm-imported image.
pub struct ShmState {
    /// SysV segment id, -1 once removed
    pub ss_shm_id: i32,
    /// our local attachment of the segment
    pub ss_shm_address: *mut c_void,
    /// the server-side attachment, 0 if none
    pub ss_shm_segment: u32,
    /// staging buffer whose memory is the imported segment
    pub ss_staging_buffer: vk::Buffer,
    pub ss_staging_memory: vk::DeviceMemory,
}

/// One pixmap import strategy.
///
/// Implementations must release any partially-created resources
/// themselves when `import_pixmap` fails; the caller only ever sees a
/// complete `ImportedPixmap` or an error.
pub trait PixmapImport {
    /// Turn a windowing-system pixmap into a sampled GPU image.
    fn import_pixmap(
        &self,
        dev: &Device,
        session: &Session,
        pixmap: u32,
    ) -> Result<ImportedPixmap>;

    /// Record whatever transfer work this strategy needs before the
    /// image is sampled this frame. `extents` is the bounding box of
    /// the repaint region in screen space, `origin` the image's
    /// on-screen position. Failures are logged and the frame carries
    /// on with stale contents.
    fn record_upload(
        &self,
        dev: &Device,
        session: &Session,
        cbuf: vk::CommandBuffer,
        image: &BoundImage,
        extents: &Rect,
        origin: (i32, i32),
    );
}

/// The importer the context will dispatch through, fixed at device
/// creation.
pub fn importer_for(strategy: BindPixmapStrategy) -> Box<dyn PixmapImport> {
    match strategy {
        BindPixmapStrategy::Dri3 => Box::new(dri3::Dri3Import),
        BindPixmapStrategy::Shm => Box::new(shm::ShmImport),
    }
}
