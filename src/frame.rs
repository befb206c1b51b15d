// Per-frame CPU/GPU synchronization
//
// Frames are fully serialized: one command buffer, one submit fence
// that gates its reuse, one acquire fence that makes image acquisition
// synchronous, and one semaphore pacing the GPU-side
// acquire -> render -> present chain. prepare() cannot start recording
// frame N+1 until frame N's submission has retired, and present()
// eagerly acquires the next image before returning so prepare() always
// finds one waiting.
//
// Everything mid-frame here is deliberately lossy on failure: a GPU or
// protocol error drops the frame, logs, and the compositor lives on.

use ash::vk;

use crate::device::Device;
use crate::display::Display;
use crate::{Result, SquallError};

use std::sync::Arc;

use log;

pub struct FrameCtl {
    f_dev: Arc<Device>,
    /// signaled by acquire, waited on synchronously right after
    f_acquire_fence: vk::Fence,
    /// signaled when the frame's submission retires; starts signaled
    /// so the first prepare() sails through
    f_submit_fence: vk::Fence,
    /// paces acquire -> submit -> present on the GPU timeline
    f_semaphore: vk::Semaphore,
    f_pool: vk::CommandPool,
    f_cbuf: vk::CommandBuffer,
}

impl FrameCtl {
    pub fn new(dev: Arc<Device>) -> Result<Self> {
        let mut ret = Self {
            f_dev: dev,
            f_acquire_fence: vk::Fence::null(),
            f_submit_fence: vk::Fence::null(),
            f_semaphore: vk::Semaphore::null(),
            f_pool: vk::CommandPool::null(),
            f_cbuf: vk::CommandBuffer::null(),
        };

        unsafe {
            ret.f_acquire_fence = ret
                .f_dev
                .dev
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .map_err(|_| {
                    log::error!("Failed to create fence");
                    SquallError::VK_ALLOC_FAILED
                })?;

            ret.f_submit_fence = ret
                .f_dev
                .dev
                .create_fence(
                    &vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )
                .map_err(|_| {
                    log::error!("Failed to create fence");
                    SquallError::VK_ALLOC_FAILED
                })?;

            ret.f_semaphore = ret
                .f_dev
                .dev
                .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                .map_err(|_| {
                    log::error!("Failed to create semaphore");
                    SquallError::VK_ALLOC_FAILED
                })?;
        }

        ret.f_pool = ret.f_dev.create_command_pool()?;
        ret.f_cbuf = ret.f_dev.create_command_buffer(ret.f_pool)?;

        Ok(ret)
    }

    pub(crate) fn cbuf(&self) -> vk::CommandBuffer {
        self.f_cbuf
    }

    pub(crate) fn semaphore(&self) -> vk::Semaphore {
        self.f_semaphore
    }

    pub(crate) fn acquire_fence(&self) -> vk::Fence {
        self.f_acquire_fence
    }

    /// Wait for the previous frame's commands to retire, then reset
    /// the command buffer for reuse.
    fn wait_and_reset_submission(&self) {
        unsafe {
            if self
                .f_dev
                .dev
                .wait_for_fences(&[self.f_submit_fence], true, u64::MAX)
                .is_err()
            {
                log::error!("Failed to wait for fences");
            }
            if self.f_dev.dev.reset_fences(&[self.f_submit_fence]).is_err() {
                log::error!("Failed to reset fences");
            }
            if self
                .f_dev
                .dev
                .reset_command_buffer(self.f_cbuf, vk::CommandBufferResetFlags::empty())
                .is_err()
            {
                log::error!("Failed to reset command buffer");
            }
        }
    }

    fn begin_cbuf(&self) {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            if self.f_dev.dev.begin_command_buffer(self.f_cbuf, &info).is_err() {
                log::error!("Failed to begin command buffer");
            }
        }
    }

    fn subresource_range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::builder()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1)
            .build()
    }

    /// Start recording a new frame against the already-acquired
    /// current swapchain image and move it into color-attachment
    /// layout from wherever it was left.
    pub fn prepare(&self, display: &mut Display) {
        self.wait_and_reset_submission();
        self.begin_cbuf();

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .old_layout(display.current_layout())
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(display.current_image())
            .subresource_range(Self::subresource_range())
            .build();

        unsafe {
            self.f_dev.dev.cmd_pipeline_barrier(
                self.f_cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        display.set_current_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    /// Finish the frame: transition to present layout, submit, queue
    /// the present, roll the buffer ages, and eagerly acquire the next
    /// image so the following prepare() finds it ready.
    pub fn present(&self, display: &mut Display) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(display.current_image())
            .subresource_range(Self::subresource_range())
            .build();

        unsafe {
            self.f_dev.dev.cmd_pipeline_barrier(
                self.f_cbuf,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }

        display.set_current_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        unsafe {
            if self.f_dev.dev.end_command_buffer(self.f_cbuf).is_err() {
                log::error!("Failed to end command buffer");
            }

            // One semaphore paces the whole chain: the acquire signaled
            // it, the submit consumes and re-signals it, the present
            // consumes it again
            let wait_semas = [self.f_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let cbufs = [self.f_cbuf];
            let signal_semas = [self.f_semaphore];
            let submit_info = vk::SubmitInfo::builder()
                .wait_semaphores(&wait_semas)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&cbufs)
                .signal_semaphores(&signal_semas)
                .build();

            if self
                .f_dev
                .dev
                .queue_submit(self.f_dev.queue, &[submit_info], self.f_submit_fence)
                .is_err()
            {
                log::error!("Failed to queue submit");
            }

            let swapchains = [display.swapchain()];
            let indices = [display.current_index()];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&wait_semas)
                .swapchains(&swapchains)
                .image_indices(&indices);

            if display
                .swapchain_loader()
                .queue_present(self.f_dev.queue, &present_info)
                .is_err()
            {
                log::error!("Failed to queue present");
            }
        }

        display.note_presented();

        // Acquisition of the next frame's image is part of this
        // frame's present latency by design
        let _ = display.acquire_next(self.f_semaphore, self.f_acquire_fence);
    }

    /// One-shot submission that moves a freshly bound image into
    /// shader-read layout before its first use. Reuses the frame
    /// command buffer and submit fence, so it must not run between
    /// prepare() and present().
    pub fn init_image_layout(&self, image: vk::Image) -> Result<()> {
        self.wait_and_reset_submission();
        self.begin_cbuf();

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(Self::subresource_range())
            .build();

        unsafe {
            self.f_dev.dev.cmd_pipeline_barrier(
                self.f_cbuf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );

            if self.f_dev.dev.end_command_buffer(self.f_cbuf).is_err() {
                log::error!("Failed to end command buffer");
                return Err(SquallError::BIND_FAILED);
            }

            let cbufs = [self.f_cbuf];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cbufs).build();

            self.f_dev
                .dev
                .queue_submit(self.f_dev.queue, &[submit_info], self.f_submit_fence)
                .map_err(|_| {
                    log::error!("Failed to queue submit");
                    SquallError::BIND_FAILED
                })?;
        }

        Ok(())
    }
}

impl Drop for FrameCtl {
    fn drop(&mut self) {
        unsafe {
            let dev = &self.f_dev.dev;

            if self.f_pool != vk::CommandPool::null() {
                // command buffers go with their pool
                dev.destroy_command_pool(self.f_pool, None);
            }
            if self.f_semaphore != vk::Semaphore::null() {
                dev.destroy_semaphore(self.f_semaphore, None);
            }
            if self.f_submit_fence != vk::Fence::null() {
                dev.destroy_fence(self.f_submit_fence, None);
            }
            if self.f_acquire_fence != vk::Fence::null() {
                dev.destroy_fence(self.f_acquire_fence, None);
            }
        }
    }
}
