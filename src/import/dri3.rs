// DRI3 dma-buf pixmap import
//
// The server exports the pixmap's backing buffer as a file descriptor
// plus a DRM format modifier describing its layout. We build a
// VkImage around that exact layout and import the descriptor as the
// image's device memory, so sampling reads the window's real storage
// with no copies.

use ash::vk;

use super::{ImportState, ImportedPixmap, PixmapImport};
use crate::device::Device;
use crate::image::BoundImage;
use crate::region::Rect;
use crate::session::Session;
use crate::{Result, SquallError};

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use x11rb::protocol::dri3::{self, ConnectionExt as _};

use log;

/// The parameters of one exported pixmap buffer.
///
/// Multi-plane and multi-descriptor exports are a documented
/// limitation: anything but exactly one descriptor is rejected as a
/// controlled bind failure rather than imported wrong.
#[derive(Debug)]
pub(crate) struct BufferExport {
    be_width: u16,
    be_height: u16,
    be_modifier: u64,
    be_offset: u32,
    be_stride: u32,
    be_fd: OwnedFd,
}

impl BufferExport {
    pub(crate) fn new(
        width: u16,
        height: u16,
        modifier: u64,
        offsets: Vec<u32>,
        strides: Vec<u32>,
        mut fds: Vec<OwnedFd>,
    ) -> Result<Self> {
        if fds.len() != 1 || offsets.is_empty() || strides.is_empty() {
            log::error!(
                "Pixmap exported {} buffers, only single-descriptor exports are supported",
                fds.len()
            );
            return Err(SquallError::INVALID_PIXMAP_EXPORT);
        }

        Ok(Self {
            be_width: width,
            be_height: height,
            be_modifier: modifier,
            be_offset: offsets[0],
            be_stride: strides[0],
            be_fd: fds.remove(0),
        })
    }

    fn from_reply(reply: dri3::BuffersFromPixmapReply) -> Result<Self> {
        Self::new(
            reply.width,
            reply.height,
            reply.modifier,
            reply.offsets,
            reply.strides,
            reply.buffers,
        )
    }
}

pub struct Dri3Import;

impl PixmapImport for Dri3Import {
    fn import_pixmap(
        &self,
        dev: &Device,
        session: &Session,
        pixmap: u32,
    ) -> Result<ImportedPixmap> {
        let reply = session
            .conn()
            .dri3_buffers_from_pixmap(pixmap)
            .map_err(|_| SquallError::PROTOCOL_ERROR)?
            .reply()
            .map_err(|_| {
                log::error!("Failed to get buffers from pixmap");
                SquallError::PROTOCOL_ERROR
            })?;

        let export = BufferExport::from_reply(reply)?;

        // Describe the exported layout exactly: offset, row stride and
        // the DRM modifier the buffer was allocated with
        let layouts = [vk::SubresourceLayout::builder()
            .offset(export.be_offset as u64)
            .row_pitch(export.be_stride as u64)
            .size(0)
            .build()];
        let mut drm_create_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(export.be_modifier)
            .plane_layouts(&layouts);

        let mut ext_mem_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let image_info = vk::ImageCreateInfo::builder()
            .push_next(&mut ext_mem_info)
            .push_next(&mut drm_create_info)
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width: export.be_width as u32,
                height: export.be_height as u32,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            dev.dev.create_image(&image_info, None).map_err(|_| {
                log::error!("Failed to create image");
                SquallError::VK_ALLOC_FAILED
            })?
        };

        // Which memory types can hold this descriptor
        let fd_props = unsafe {
            dev.external_mem_fd_loader
                .as_ref()
                .unwrap()
                .get_memory_fd_properties(
                    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                    export.be_fd.as_raw_fd(),
                )
                .map_err(|_| {
                    log::error!("Failed to get memory FD properties");
                    unsafe { dev.dev.destroy_image(image, None) };
                    SquallError::IMPORT_FAILED
                })?
        };

        let reqs = unsafe { dev.dev.get_image_memory_requirements(image) };
        let memtype_index = match dev.find_memory_type_index(
            reqs.memory_type_bits & fd_props.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(i) => i,
            Err(e) => {
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        // The driver consumes the descriptor it is handed, so give it
        // its own duplicate and let ours close with the reply
        let import_fd = match export.be_fd.try_clone() {
            Ok(fd) => fd,
            Err(_) => {
                log::error!("Could not dup pixmap buffer fd");
                unsafe { dev.dev.destroy_image(image, None) };
                return Err(SquallError::INVALID_FD);
            }
        };
        let raw_import_fd = import_fd.into_raw_fd();

        let mut import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(raw_import_fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .push_next(&mut import_fd_info)
            .push_next(&mut dedicated_info)
            .allocation_size(reqs.size)
            .memory_type_index(memtype_index);

        let memory = unsafe {
            match dev.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    log::error!("Failed to import pixmap buffer memory");
                    dev.dev.destroy_image(image, None);
                    // the import never happened, the dup is still ours
                    drop(OwnedFd::from_raw_fd(raw_import_fd));
                    return Err(SquallError::IMPORT_FAILED);
                }
            }
        };

        unsafe {
            if dev.dev.bind_image_memory(image, memory, 0).is_err() {
                log::error!("Failed to bind image memory");
                dev.dev.destroy_image(image, None);
                dev.dev.free_memory(memory, None);
                return Err(SquallError::IMPORT_FAILED);
            }
        }

        Ok(ImportedPixmap {
            ip_width: export.be_width,
            ip_height: export.be_height,
            ip_image: image,
            ip_memory: memory,
            ip_state: ImportState::Dri3,
        })
    }

    /// The sampled image is the window's storage, nothing to copy.
    fn record_upload(
        &self,
        _dev: &Device,
        _session: &Session,
        _cbuf: vk::CommandBuffer,
        _image: &BoundImage,
        _extents: &Rect,
        _origin: (i32, i32),
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn stub_fd() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn single_descriptor_export_is_accepted() {
        let export =
            BufferExport::new(64, 32, 0, vec![0], vec![256], vec![stub_fd()]).unwrap();
        assert_eq!(export.be_width, 64);
        assert_eq!(export.be_height, 32);
        assert_eq!(export.be_stride, 256);
    }

    #[test]
    fn multi_descriptor_export_is_a_controlled_failure() {
        let err = BufferExport::new(
            64,
            32,
            0,
            vec![0, 4096],
            vec![256, 256],
            vec![stub_fd(), stub_fd()],
        )
        .unwrap_err();
        assert_eq!(err, SquallError::INVALID_PIXMAP_EXPORT);
    }

    #[test]
    fn empty_export_is_a_controlled_failure() {
        let err = BufferExport::new(64, 32, 0, vec![], vec![], vec![]).unwrap_err();
        assert_eq!(err, SquallError::INVALID_PIXMAP_EXPORT);
    }
}
