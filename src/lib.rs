//! # Squall
//!
//! Squall is a Vulkan presentation backend for X11 compositors. It
//! turns window pixmaps into GPU-sampled images, composites them (and
//! solid fills) into a swapchain image, and hands frame-timing and
//! partial-repaint metadata back to the compositor driving it.
//!
//! ## Drawing API
//!
//! The general flow of a squall client is as follows:
//! * Connect a [`Session`] and create the backend over a target
//!   window (`Squall::new`)
//! * Bind a window's pixmap (`bind_pixmap`) to get an [`ImageHandle`]
//! * Each frame: `prepare`, any number of `compose`/`fill` calls,
//!   then `present`
//! * Ask `buffer_age` how stale the current swapchain image is to
//!   compute a minimal repaint region
//! * Release images with `release_image` when the window goes away
//!
//! Pixmaps are imported over DRI3 (zero copy) when the server and
//! device support it, and through SysV shared memory otherwise; the
//! choice is made once at startup and is invisible to callers.
//!
//! Every entry point is synchronous and must be called from one
//! thread. The only concurrency is CPU/GPU overlap, paced by two
//! fences and a semaphore; frames are fully serialized on the GPU.

mod descpool;
mod device;
mod display;
mod frame;
mod image;
mod import;
mod instance;
mod pipelines;
mod platform;
mod region;
mod session;

pub use crate::image::ImageHandle;
pub use platform::BindPixmapStrategy;
pub use region::{Color, Rect, Region};
pub use session::Session;

use crate::descpool::DescriptorSystem;
use crate::device::Device;
use crate::display::{Display, DisplaySurface};
use crate::frame::FrameCtl;
use crate::image::BoundImage;
use crate::import::PixmapImport;
use crate::instance::Instance;
use crate::pipelines::Pipelines;

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use log;

/// The declared maximum buffer age callers may rely on; anything
/// older must be treated as fully dirty.
pub const MAX_BUFFER_AGE: i32 = 5;

/// Reasons the backend can fail to initialize or to bind a pixmap.
///
/// Mid-frame failures never surface here; those are logged and the
/// affected operation is dropped, since a skipped frame beats a dead
/// compositor.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SquallError {
    #[error("Could not connect to the X server")]
    CONNECT_FAILED,
    #[error("Could not create a Vulkan instance")]
    INSTANCE_CREATE_FAILED,
    #[error("A required Vulkan extension or entry point is missing")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Could not create a presentation surface")]
    SURFACE_CREATE_FAILED,
    #[error("No physical device supports a pixmap import strategy")]
    NO_SUITABLE_DEVICE,
    #[error("No queue family can draw and present to the surface")]
    COULD_NOT_FIND_QUEUE_FAMILY,
    #[error("Could not create a logical device")]
    DEVICE_CREATE_FAILED,
    #[error("No memory type satisfies the allocation")]
    NO_SUITABLE_MEMORY_TYPE,
    #[error("A Vulkan object could not be allocated")]
    VK_ALLOC_FAILED,
    #[error("Could not create the swapchain")]
    SWAPCHAIN_CREATE_FAILED,
    #[error("The surface does not offer the required format")]
    NO_SUITABLE_SURFACE_FORMAT,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Shader compilation failed")]
    SHADER_COMPILE_FAILED,
    #[error("Pipeline creation failed")]
    PIPELINE_CREATE_FAILED,
    #[error("The pixmap export is not a single descriptor")]
    INVALID_PIXMAP_EXPORT,
    #[error("A file descriptor could not be duplicated")]
    INVALID_FD,
    #[error("An X protocol request failed")]
    PROTOCOL_ERROR,
    #[error("Could not allocate a shared memory segment")]
    SHM_ALLOC_FAILED,
    #[error("The X server could not attach the shared memory segment")]
    SHM_ATTACH_FAILED,
    #[error("Importing external memory failed")]
    IMPORT_FAILED,
    #[error("Binding the pixmap failed")]
    BIND_FAILED,
}

pub type Result<T> = std::result::Result<T, SquallError>;

/// The visual the bound pixmap was created for. Only the presence of
/// an alpha channel matters to this backend.
#[derive(Debug, Copy, Clone)]
pub struct VisualInfo {
    pub vi_has_alpha: bool,
}

/// One rendering backend instance for one output surface.
///
/// Owns every GPU object it creates. Bound images are owned by the
/// caller through opaque handles; the backend manages the GPU-side
/// resources reachable through them.
pub struct Squall {
    /// bound pixmaps, keyed by handle
    sq_images: HashMap<u64, BoundImage>,
    sq_next_image_id: u64,
    sq_frame: FrameCtl,
    sq_pipes: Pipelines,
    sq_descpool: DescriptorSystem,
    sq_display: Display,
    sq_importer: Box<dyn PixmapImport>,
    sq_dev: Arc<Device>,
    sq_session: Session,
}

impl Squall {
    /// Initialize the backend over `window`.
    ///
    /// Brings up the instance, picks a device for the session's import
    /// capabilities, builds the swapchain and both pipelines, and
    /// acquires the first image. On any failure everything created so
    /// far is torn back down and the error is returned; there is no
    /// partially usable context.
    pub fn new(session: Session, window: u32) -> Result<Self> {
        let inst = Arc::new(Instance::new()?);

        let surface = DisplaySurface::new(inst.clone(), window)?;

        let dev = Arc::new(Device::new(
            inst.clone(),
            &session,
            surface.xcb_loader(),
            surface.loader(),
            surface.surface(),
        )?);

        // fences and the semaphore must exist before the swapchain:
        // its constructor performs the first synchronous acquire
        let frame = FrameCtl::new(dev.clone())?;

        let display = Display::new(
            dev.clone(),
            surface,
            session.vsync(),
            frame.semaphore(),
            frame.acquire_fence(),
        )?;

        let descpool = DescriptorSystem::new(dev.clone())?;

        let pipes = Pipelines::new(dev.clone(), display.d_resolution, descpool.layout())?;

        let importer = import::importer_for(dev.strategy);

        Ok(Self {
            sq_images: HashMap::new(),
            sq_next_image_id: 1,
            sq_frame: frame,
            sq_pipes: pipes,
            sq_descpool: descpool,
            sq_display: display,
            sq_importer: importer,
            sq_dev: dev,
            sq_session: session,
        })
    }

    /// Which import strategy this context was built for.
    pub fn strategy(&self) -> BindPixmapStrategy {
        self.sq_dev.strategy
    }

    /// Begin a new frame.
    ///
    /// Blocks until the previous frame's commands have retired, then
    /// starts recording against the already-acquired current swapchain
    /// image. The repaint region is decided by the caller (using
    /// `buffer_age`); this backend re-records the full command stream
    /// each frame so it only needs the draws, not the region.
    pub fn prepare(&mut self, _repaint: &Region) {
        self.sq_frame.prepare(&mut self.sq_display);
    }

    /// Record draws sampling a bound image over each rectangle of
    /// `paint`. Masking is not supported by this backend; the mask
    /// arguments are accepted for interface compatibility and ignored.
    ///
    /// An empty paint region records nothing at all.
    pub fn compose(
        &mut self,
        image: ImageHandle,
        image_origin: (i32, i32),
        _mask: Option<ImageHandle>,
        _mask_origin: (i32, i32),
        paint: &Region,
        _visible: &Region,
    ) {
        if paint.is_empty() {
            return;
        }

        let img = match self.sq_images.get(&image.0) {
            Some(i) => i,
            None => {
                log::error!("compose called with an unknown image handle");
                return;
            }
        };

        let extents = paint.extents().unwrap();

        // SHM pulls fresh pixels into the sampled image first; DRI3
        // samples the window's storage directly and records nothing
        self.sq_importer.record_upload(
            &self.sq_dev,
            &self.sq_session,
            self.sq_frame.cbuf(),
            img,
            &extents,
            image_origin,
        );

        self.sq_pipes.record_compose(
            self.sq_frame.cbuf(),
            self.sq_display.current_view(),
            self.sq_display.d_resolution,
            img.desc_set(),
            image_origin,
            &extents,
            paint.rects(),
        );
    }

    /// Record solid-color draws over each rectangle of `region`.
    /// The color is premultiplied. An empty region records nothing.
    pub fn fill(&mut self, color: Color, region: &Region) {
        if region.is_empty() {
            return;
        }

        let extents = region.extents().unwrap();

        self.sq_pipes.record_fill(
            self.sq_frame.cbuf(),
            self.sq_display.current_view(),
            self.sq_display.d_resolution,
            &color,
            &extents,
            region.rects(),
        );
    }

    /// Submit and present the recorded frame, then eagerly acquire the
    /// next swapchain image so the following `prepare` finds it ready.
    pub fn present(&mut self, _region: &Region) {
        self.sq_frame.present(&mut self.sq_display);
    }

    /// Bind a window pixmap for sampling.
    ///
    /// On success the image starts with a reference count of one and
    /// stays alive until `release_image` drops the count to zero. On
    /// failure every partially created GPU and transport resource is
    /// released and the pixmap is untouched.
    pub fn bind_pixmap(
        &mut self,
        pixmap: u32,
        visual: VisualInfo,
        owned: bool,
    ) -> Result<ImageHandle> {
        log::debug!("Binding pixmap {:#08x}", pixmap);

        let imported = self
            .sq_importer
            .import_pixmap(&self.sq_dev, &self.sq_session, pixmap)?;

        // From here on, dropping `img` unwinds whatever has been
        // attached to it so far
        let mut img = BoundImage::new(
            self.sq_dev.clone(),
            self.sq_session.clone_conn(),
            imported,
            pixmap,
            visual.vi_has_alpha,
            owned,
        );

        img.create_view()?;

        let desc = self.sq_descpool.alloc_descriptor()?;
        self.sq_descpool.write_image(&desc, img.view());
        img.bi_desc = Some(desc);

        // The image is in UNDEFINED layout; move it to shader-read
        // before anything samples it
        self.sq_frame.init_image_layout(img.bi_image)?;

        let id = self.sq_next_image_id;
        self.sq_next_image_id += 1;
        self.sq_images.insert(id, img);

        Ok(ImageHandle(id))
    }

    /// Add a reference to a bound image so another compositor-side
    /// user can hold the same handle.
    pub fn ref_image(&mut self, handle: ImageHandle) {
        match self.sq_images.get_mut(&handle.0) {
            Some(img) => img.bi_refcount += 1,
            None => log::error!("ref_image called with an unknown image handle"),
        }
    }

    /// Drop a reference to a bound image.
    ///
    /// When the count reaches zero the device is drained and every
    /// GPU, transport, and (if owned) pixmap resource is freed exactly
    /// once. With references remaining, nothing is destroyed and the
    /// handle stays valid.
    pub fn release_image(&mut self, handle: ImageHandle) {
        let remaining = match self.sq_images.get_mut(&handle.0) {
            Some(img) => {
                img.bi_refcount -= 1;
                img.bi_refcount
            }
            None => {
                log::error!("release_image called with an unknown image handle");
                return;
            }
        };

        if remaining <= 0 {
            // BoundImage::drop waits for device idle and tears down
            self.sq_images.remove(&handle.0);
        }
    }

    /// Age of the current swapchain image in presents, or -1 when its
    /// contents are unknown and a full repaint is required.
    pub fn buffer_age(&self) -> i32 {
        self.sq_display.buffer_age()
    }

    /// Pixel dimensions of a bound image.
    pub fn image_size(&self, handle: ImageHandle) -> Option<(u16, u16)> {
        self.sq_images
            .get(&handle.0)
            .map(|img| (img.bi_width, img.bi_height))
    }

    /// Mask images are unsupported by this backend.
    pub fn make_mask(&mut self, _size: (u16, u16), _region: &Region) -> Option<ImageHandle> {
        None
    }
}

impl Drop for Squall {
    fn drop(&mut self) {
        // Drain outstanding work before any field teardown runs; the
        // members then destroy their own objects in field order, the
        // device last since everything holds an Arc to it
        self.sq_dev.wait_idle();
        self.sq_images.clear();
    }
}
