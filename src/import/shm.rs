// Shared-memory pixmap import
//
// Without DRI3 we cannot touch the pixmap's real storage, so pixels
// take the long way: the server writes them into a SysV shared memory
// segment, a host-pointer staging buffer imports that same segment,
// and every compose records a buffer-to-image copy into a device-local
// sampled image.

use ash::vk;

use super::{ImportState, ImportedPixmap, PixmapImport, ShmState};
use crate::device::Device;
use crate::image::BoundImage;
use crate::region::Rect;
use crate::session::Session;
use crate::{Result, SquallError};

use std::os::raw::c_void;

use x11rb::connection::Connection;
use x11rb::protocol::shm::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};

use log;

/// Round `size` up to the next multiple of `alignment`.
///
/// Imported host pointers must be aligned to the device's
/// minImportedHostPointerAlignment, so the segment is sized to the
/// rounded value even though the pixels need less.
pub(crate) fn align_up(size: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        return size;
    }

    (size - 1) + alignment - (size - 1) % alignment
}

/// Everything built so far for one shm import.
///
/// Each construction step parks its result here; if a later step
/// fails, dropping the guard unwinds exactly what exists, in reverse
/// order. `finish` defuses it and hands the state out.
struct ShmBuild<'a> {
    sb_dev: &'a Device,
    sb_session: &'a Session,
    sb_image: vk::Image,
    sb_memory: vk::DeviceMemory,
    sb_shm_id: i32,
    sb_shm_address: *mut c_void,
    sb_shm_segment: u32,
    sb_staging_buffer: vk::Buffer,
    sb_staging_memory: vk::DeviceMemory,
    sb_armed: bool,
}

impl<'a> ShmBuild<'a> {
    fn new(dev: &'a Device, session: &'a Session) -> Self {
        Self {
            sb_dev: dev,
            sb_session: session,
            sb_image: vk::Image::null(),
            sb_memory: vk::DeviceMemory::null(),
            sb_shm_id: -1,
            sb_shm_address: usize::MAX as *mut c_void,
            sb_shm_segment: 0,
            sb_staging_buffer: vk::Buffer::null(),
            sb_staging_memory: vk::DeviceMemory::null(),
            sb_armed: true,
        }
    }

    fn finish(mut self, width: u16, height: u16) -> ImportedPixmap {
        self.sb_armed = false;

        ImportedPixmap {
            ip_width: width,
            ip_height: height,
            ip_image: self.sb_image,
            ip_memory: self.sb_memory,
            ip_state: ImportState::Shm(ShmState {
                ss_shm_id: self.sb_shm_id,
                ss_shm_address: self.sb_shm_address,
                ss_shm_segment: self.sb_shm_segment,
                ss_staging_buffer: self.sb_staging_buffer,
                ss_staging_memory: self.sb_staging_memory,
            }),
        }
    }
}

impl<'a> Drop for ShmBuild<'a> {
    fn drop(&mut self) {
        if !self.sb_armed {
            return;
        }

        unsafe {
            if self.sb_staging_buffer != vk::Buffer::null() {
                self.sb_dev.dev.destroy_buffer(self.sb_staging_buffer, None);
            }
            if self.sb_staging_memory != vk::DeviceMemory::null() {
                self.sb_dev.dev.free_memory(self.sb_staging_memory, None);
            }
            if self.sb_shm_segment != 0 {
                let _ = self.sb_session.conn().shm_detach(self.sb_shm_segment);
            }
            if self.sb_shm_address != usize::MAX as *mut c_void {
                libc::shmdt(self.sb_shm_address);
            }
            if self.sb_shm_id != -1 {
                libc::shmctl(self.sb_shm_id, libc::IPC_RMID, std::ptr::null_mut());
            }
            if self.sb_image != vk::Image::null() {
                self.sb_dev.dev.destroy_image(self.sb_image, None);
            }
            if self.sb_memory != vk::DeviceMemory::null() {
                self.sb_dev.dev.free_memory(self.sb_memory, None);
            }
        }
    }
}

pub struct ShmImport;

impl PixmapImport for ShmImport {
    fn import_pixmap(
        &self,
        dev: &Device,
        session: &Session,
        pixmap: u32,
    ) -> Result<ImportedPixmap> {
        let geometry = session
            .conn()
            .get_geometry(pixmap)
            .map_err(|_| SquallError::PROTOCOL_ERROR)?
            .reply()
            .map_err(|_| {
                log::error!("Failed to get geometry");
                SquallError::PROTOCOL_ERROR
            })?;

        let (width, height) = (geometry.width, geometry.height);
        let mut build = ShmBuild::new(dev, session);

        // The sampled image is a normal device-local allocation, the
        // shared segment only ever feeds the copy
        let (image, memory) = dev.create_image(
            vk::Extent2D {
                width: width as u32,
                height: height as u32,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageTiling::OPTIMAL,
        )?;
        build.sb_image = image;
        build.sb_memory = memory;

        let size = align_up(
            width as usize * height as usize * 4,
            dev.min_host_pointer_alignment as usize,
        );

        build.sb_shm_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if build.sb_shm_id == -1 {
            log::error!("Failed to allocate shared memory segment");
            return Err(SquallError::SHM_ALLOC_FAILED);
        }

        build.sb_shm_address = unsafe { libc::shmat(build.sb_shm_id, std::ptr::null(), 0) };
        if build.sb_shm_address == usize::MAX as *mut c_void {
            log::error!("Failed to attach shared memory segment");
            return Err(SquallError::SHM_ALLOC_FAILED);
        }

        let segment = session
            .conn()
            .generate_id()
            .map_err(|_| SquallError::PROTOCOL_ERROR)?;
        match session
            .conn()
            .shm_attach(segment, build.sb_shm_id as u32, false)
        {
            Ok(cookie) => {
                if cookie.check().is_err() {
                    log::error!("Failed to attach to shared memory segment");
                    return Err(SquallError::SHM_ATTACH_FAILED);
                }
            }
            Err(_) => {
                log::error!("Failed to attach to shared memory segment");
                return Err(SquallError::SHM_ATTACH_FAILED);
            }
        }
        build.sb_shm_segment = segment;

        // Staging buffer whose backing memory is the segment itself,
        // imported as an external host allocation
        let mut ext_buf_info = vk::ExternalMemoryBufferCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT);
        let buffer_info = vk::BufferCreateInfo::builder()
            .push_next(&mut ext_buf_info)
            .size(size as u64)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        build.sb_staging_buffer = unsafe {
            dev.dev.create_buffer(&buffer_info, None).map_err(|_| {
                log::error!("Failed to create buffer");
                SquallError::VK_ALLOC_FAILED
            })?
        };

        let host_fns = dev.external_mem_host_fn.as_ref().unwrap();
        let mut host_props = vk::MemoryHostPointerPropertiesEXT::default();
        let res = unsafe {
            (host_fns.get_memory_host_pointer_properties_ext)(
                dev.dev.handle(),
                vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT,
                build.sb_shm_address,
                &mut host_props,
            )
        };
        if res != vk::Result::SUCCESS {
            log::error!("Failed to get memory host pointer properties");
            return Err(SquallError::IMPORT_FAILED);
        }

        let reqs = unsafe { dev.dev.get_buffer_memory_requirements(build.sb_staging_buffer) };
        let memtype_index = dev.find_memory_type_index(
            reqs.memory_type_bits & host_props.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        let mut import_info = vk::ImportMemoryHostPointerInfoEXT::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::HOST_ALLOCATION_EXT)
            .host_pointer(build.sb_shm_address);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .push_next(&mut import_info)
            .allocation_size(reqs.size)
            .memory_type_index(memtype_index);

        build.sb_staging_memory = unsafe {
            dev.dev.allocate_memory(&alloc_info, None).map_err(|_| {
                log::error!("Failed to import shared memory segment");
                SquallError::IMPORT_FAILED
            })?
        };

        unsafe {
            if dev
                .dev
                .bind_buffer_memory(build.sb_staging_buffer, build.sb_staging_memory, 0)
                .is_err()
            {
                log::error!("Failed to bind buffer memory");
                return Err(SquallError::IMPORT_FAILED);
            }
        }

        Ok(build.finish(width, height))
    }

    /// Pull the repainted part of the pixmap into the segment and
    /// record the copy into the sampled image, bracketed by layout
    /// transitions so the shader only ever sees complete pixels.
    fn record_upload(
        &self,
        dev: &Device,
        session: &Session,
        cbuf: vk::CommandBuffer,
        image: &BoundImage,
        extents: &Rect,
        origin: (i32, i32),
    ) {
        let state = match &image.bi_state {
            ImportState::Shm(s) => s,
            ImportState::Dri3 => return,
        };

        let x = (extents.r_x1 - origin.0) as i16;
        let y = (extents.r_y1 - origin.1) as i16;
        let width = extents.width() as u16;
        let height = extents.height() as u16;

        // Ask the server to write the pixels straight into our segment
        let fetched = session
            .conn()
            .shm_get_image(
                image.bi_pixmap,
                x,
                y,
                width,
                height,
                u32::MAX,
                ImageFormat::Z_PIXMAP.into(),
                state.ss_shm_segment,
                0,
            )
            .ok()
            .and_then(|cookie| cookie.reply().ok());
        if fetched.is_none() {
            log::error!("Failed to read image data into shared memory image");
        }

        let subresource_range = vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1)
            .build();

        unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.bi_image)
                .subresource_range(subresource_range)
                .build();
            dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let copy = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                // 0 means tightly packed
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::builder()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1)
                        .build(),
                )
                .image_offset(vk::Offset3D {
                    x: x as i32,
                    y: y as i32,
                    z: 0,
                })
                .image_extent(vk::Extent3D {
                    width: width as u32,
                    height: height as u32,
                    depth: 1,
                })
                .build();
            dev.dev.cmd_copy_buffer_to_image(
                cbuf,
                state.ss_staging_buffer,
                image.bi_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );

            let to_sampled = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.bi_image)
                .subresource_range(subresource_range)
                .build();
            dev.dev.cmd_pipeline_barrier(
                cbuf,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::align_up;

    #[test]
    fn staging_size_rounds_up_to_import_alignment() {
        // a 13x13 image needs 676 bytes, which lands in one 4096 page
        assert_eq!(align_up(13 * 13 * 4, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn degenerate_alignments_leave_size_alone() {
        assert_eq!(align_up(676, 1), 676);
        assert_eq!(align_up(676, 0), 676);
    }
}
