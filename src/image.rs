// Bound pixmap images
//
// A BoundImage is one windowing-system pixmap made sampleable: the
// imported (or copied-into) VkImage, the swizzled view, the sampler
// descriptor, and whatever transport state the import strategy left
// behind. Lifetime is reference counted by the caller through
// ref_image/release_image; the GPU resources die exactly once, when
// the count hits zero.

use ash::vk;

use crate::descpool::Descriptor;
use crate::device::Device;
use crate::import::{ImportState, ImportedPixmap};
use crate::{Result, SquallError};

use std::sync::Arc;

use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::xcb_ffi::XCBConnection;

use log;

/// Opaque handle the compositor holds for a bound pixmap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

pub struct BoundImage {
    bi_dev: Arc<Device>,
    /// the session connection, needed to detach segments and free the
    /// pixmap at teardown
    bi_conn: Arc<XCBConnection>,
    /// how many compositor-side users share this bind
    pub(crate) bi_refcount: i32,
    pub(crate) bi_has_alpha: bool,
    pub(crate) bi_pixmap: u32,
    /// may we free the source pixmap when the image dies
    bi_owned: bool,
    pub(crate) bi_width: u16,
    pub(crate) bi_height: u16,
    /// image containing (or importing) the contents of the window
    pub(crate) bi_image: vk::Image,
    bi_memory: vk::DeviceMemory,
    /// strategy-specific transport state
    pub(crate) bi_state: ImportState,
    bi_view: vk::ImageView,
    /// sampler descriptor handed to the compose pipeline
    pub(crate) bi_desc: Option<Descriptor>,
}

impl BoundImage {
    /// Wrap a completed import. The view and descriptor are attached
    /// by the subsequent bind steps; if any of them fails, dropping
    /// this tears down everything the import created.
    pub(crate) fn new(
        dev: Arc<Device>,
        conn: Arc<XCBConnection>,
        imported: ImportedPixmap,
        pixmap: u32,
        has_alpha: bool,
        owned: bool,
    ) -> Self {
        Self {
            bi_dev: dev,
            bi_conn: conn,
            bi_refcount: 1,
            bi_has_alpha: has_alpha,
            bi_pixmap: pixmap,
            bi_owned: owned,
            bi_width: imported.ip_width,
            bi_height: imported.ip_height,
            bi_image: imported.ip_image,
            bi_memory: imported.ip_memory,
            bi_state: imported.ip_state,
            bi_view: vk::ImageView::null(),
            bi_desc: None,
        }
    }

    /// Create the sampled view over the imported image.
    ///
    /// X pixmaps are BGRA in memory while the image was created RGBA,
    /// so the view swaps the R and B channels back. Visuals without an
    /// alpha channel have undefined alpha bytes, those get forced to
    /// fully opaque.
    pub(crate) fn create_view(&mut self) -> Result<()> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(self.bi_image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::B,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::R,
                a: match self.bi_has_alpha {
                    true => vk::ComponentSwizzle::A,
                    false => vk::ComponentSwizzle::ONE,
                },
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.bi_view = unsafe {
            self.bi_dev.dev.create_image_view(&info, None).map_err(|_| {
                log::error!("Failed to create image view");
                SquallError::VK_ALLOC_FAILED
            })?
        };

        Ok(())
    }

    pub(crate) fn view(&self) -> vk::ImageView {
        self.bi_view
    }

    pub(crate) fn desc_set(&self) -> vk::DescriptorSet {
        self.bi_desc.as_ref().unwrap().d_set
    }
}

impl Drop for BoundImage {
    /// Tear down in dependency order, destroying only what was
    /// actually created. No per-resource fence exists, so the device
    /// is drained first; correctness over throughput, releases are
    /// rare next to frames.
    fn drop(&mut self) {
        self.bi_dev.wait_idle();

        // returns the set to its pool
        self.bi_desc.take();

        unsafe {
            if self.bi_view != vk::ImageView::null() {
                self.bi_dev.dev.destroy_image_view(self.bi_view, None);
            }

            if let ImportState::Shm(state) = &self.bi_state {
                if state.ss_staging_buffer != vk::Buffer::null() {
                    self.bi_dev.dev.destroy_buffer(state.ss_staging_buffer, None);
                }
                if state.ss_staging_memory != vk::DeviceMemory::null() {
                    self.bi_dev.dev.free_memory(state.ss_staging_memory, None);
                }
                if state.ss_shm_segment != 0 {
                    use x11rb::protocol::shm::ConnectionExt as _;
                    let _ = self.bi_conn.shm_detach(state.ss_shm_segment);
                }
                if state.ss_shm_address != usize::MAX as *mut std::os::raw::c_void {
                    libc::shmdt(state.ss_shm_address);
                }
                if state.ss_shm_id != -1 {
                    libc::shmctl(state.ss_shm_id, libc::IPC_RMID, std::ptr::null_mut());
                }
            }

            if self.bi_image != vk::Image::null() {
                self.bi_dev.dev.destroy_image(self.bi_image, None);
            }
            if self.bi_memory != vk::DeviceMemory::null() {
                self.bi_dev.dev.free_memory(self.bi_memory, None);
            }
        }

        if self.bi_owned && self.bi_pixmap != 0 {
            let _ = self.bi_conn.free_pixmap(self.bi_pixmap);
        }
    }
}
