// The presentable surface and its swapchain
//
// This owns the backend's output: a VkSurfaceKHR created over a
// dedicated X connection, the swapchain built on it, and the per-image
// layout and buffer age tracking the frame controller reads. Ages are
// what the compositor uses to decide how much of the screen it can get
// away with not repainting.

use ash::extensions::khr;
use ash::vk;

use crate::device::Device;
use crate::instance::Instance;
use crate::{Result, SquallError};

use std::sync::Arc;

use x11rb::xcb_ffi::XCBConnection;

use log;

/// The swapchain is forced to this format; initialization fails if the
/// surface cannot do it.
pub(crate) const SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// The window surface, before any swapchain exists.
///
/// This is split from `Display` because the device initializer needs
/// the surface (and the xcb presentation loader) to pick a queue
/// family, and the device obviously has to exist before the swapchain
/// can.
pub struct DisplaySurface {
    /// The instance has to outlive the surface created from it
    #[allow(dead_code)]
    su_inst: Arc<Instance>,
    /// Private connection for presentation, separate from the
    /// session's pixmap traffic; the surface is created over it and
    /// it has to stay open as long as the surface lives
    #[allow(dead_code)]
    su_conn: Arc<XCBConnection>,
    su_loader: khr::Surface,
    su_xcb_loader: khr::XcbSurface,
    su_surface: vk::SurfaceKHR,
}

impl DisplaySurface {
    /// Open a presentation connection and create a surface over the
    /// target window.
    pub fn new(inst: Arc<Instance>, window: u32) -> Result<Self> {
        let (conn, _screen) = XCBConnection::connect(None).map_err(|_| {
            log::error!("Failed to connect to the X server");
            SquallError::CONNECT_FAILED
        })?;

        let surface_loader = khr::Surface::new(&inst.loader, &inst.inst);
        let xcb_loader = khr::XcbSurface::new(&inst.loader, &inst.inst);

        let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
            .connection(conn.get_raw_xcb_connection())
            .window(window);

        let surface = unsafe {
            xcb_loader.create_xcb_surface(&create_info, None).map_err(|_| {
                log::error!("Failed to create surface");
                SquallError::SURFACE_CREATE_FAILED
            })?
        };

        Ok(Self {
            su_inst: inst,
            su_conn: Arc::new(conn),
            su_loader: surface_loader,
            su_xcb_loader: xcb_loader,
            su_surface: surface,
        })
    }

    pub(crate) fn loader(&self) -> &khr::Surface {
        &self.su_loader
    }

    pub(crate) fn xcb_loader(&self) -> &khr::XcbSurface {
        &self.su_xcb_loader
    }

    pub(crate) fn surface(&self) -> vk::SurfaceKHR {
        self.su_surface
    }
}

impl Drop for DisplaySurface {
    fn drop(&mut self) {
        unsafe {
            if self.su_surface != vk::SurfaceKHR::null() {
                self.su_loader.destroy_surface(self.su_surface, None);
            }
        }
    }
}

/// Increment every previously-presented image's age and mark the image
/// just presented as age 1. Images that have never been presented stay
/// at -1 and must be treated as fully dirty when they come up.
fn bump_ages(ages: &mut [i32], presented: usize) {
    for (i, age) in ages.iter_mut().enumerate() {
        if i != presented && *age != -1 {
            *age += 1;
        }
    }
    ages[presented] = 1;
}

/// The swapchain and its per-image bookkeeping.
///
/// The three parallel vectors are always the same length as the
/// swapchain image list. `d_current` is the image the next frame will
/// record into; thanks to the eager re-acquire in present there is
/// always a valid current image once construction finishes.
pub struct Display {
    d_dev: Arc<Device>,
    d_surface: DisplaySurface,
    d_swapchain_loader: khr::Swapchain,
    d_swapchain: vk::SwapchainKHR,
    pub(crate) d_resolution: vk::Extent2D,
    d_images: Vec<vk::Image>,
    d_views: Vec<vk::ImageView>,
    /// last known layout of each image, UNDEFINED until first use
    d_layouts: Vec<vk::ImageLayout>,
    /// frames since each image last held up-to-date contents, -1 for
    /// never presented
    d_ages: Vec<i32>,
    d_current: usize,
}

impl Display {
    /// Build the swapchain over an existing surface and synchronously
    /// acquire the first image.
    ///
    /// `semaphore` and `acquire_fence` are the frame controller's
    /// pacing primitives; the initial acquire uses them so the first
    /// prepare() finds the exact same state every later prepare() does.
    pub fn new(
        dev: Arc<Device>,
        surface: DisplaySurface,
        vsync: bool,
        semaphore: vk::Semaphore,
        acquire_fence: vk::Fence,
    ) -> Result<Self> {
        let caps = unsafe {
            surface
                .loader()
                .get_physical_device_surface_capabilities(dev.pdev, surface.surface())
                .map_err(|_| {
                    log::error!("Failed to get physical device surface capabilities");
                    SquallError::SWAPCHAIN_CREATE_FAILED
                })?
        };

        let resolution = caps.current_extent;

        let formats = unsafe {
            surface
                .loader()
                .get_physical_device_surface_formats(dev.pdev, surface.surface())
                .map_err(|_| {
                    log::error!("Failed to get physical device surface formats");
                    SquallError::SWAPCHAIN_CREATE_FAILED
                })?
        };

        let surface_format = match formats.iter().find(|f| f.format == SURFACE_FORMAT) {
            Some(f) => *f,
            None => {
                log::error!("Failed to find suitable surface format");
                return Err(SquallError::NO_SUITABLE_SURFACE_FORMAT);
            }
        };

        let present_mode = match vsync {
            true => vk::PresentModeKHR::FIFO,
            false => vk::PresentModeKHR::IMMEDIATE,
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface())
            .min_image_count(caps.min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(resolution)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain_loader = khr::Swapchain::new(&dev.inst.inst, &dev.dev);
        let swapchain = unsafe {
            swapchain_loader.create_swapchain(&create_info, None).map_err(|_| {
                log::error!("Failed to create swapchain");
                SquallError::SWAPCHAIN_CREATE_FAILED
            })?
        };

        let mut ret = Self {
            d_dev: dev,
            d_surface: surface,
            d_swapchain_loader: swapchain_loader,
            d_swapchain: swapchain,
            d_resolution: resolution,
            d_images: Vec::new(),
            d_views: Vec::new(),
            d_layouts: Vec::new(),
            d_ages: Vec::new(),
            d_current: 0,
        };

        ret.d_images = unsafe {
            ret.d_swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|_| {
                    log::error!("Failed to get swapchain images");
                    SquallError::SWAPCHAIN_CREATE_FAILED
                })?
        };

        for image in ret.d_images.iter() {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(SURFACE_FORMAT)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::R,
                    g: vk::ComponentSwizzle::G,
                    b: vk::ComponentSwizzle::B,
                    a: vk::ComponentSwizzle::A,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe {
                ret.d_dev.dev.create_image_view(&view_info, None).map_err(|_| {
                    log::error!("Failed to create image view");
                    // Drop tears down the views created so far
                    SquallError::SWAPCHAIN_CREATE_FAILED
                })?
            };
            ret.d_views.push(view);
        }

        ret.d_layouts = vec![vk::ImageLayout::UNDEFINED; ret.d_images.len()];
        ret.d_ages = vec![-1; ret.d_images.len()];

        // Acquire the first image now so prepare() always finds one
        ret.acquire_next(semaphore, acquire_fence)?;

        Ok(ret)
    }

    /// Acquire the next swapchain image and wait for it to actually be
    /// available.
    ///
    /// All waits here are unbounded, a wedged driver wedges us. The
    /// fence is reset afterwards so the next acquire can reuse it.
    pub(crate) fn acquire_next(
        &mut self,
        semaphore: vk::Semaphore,
        acquire_fence: vk::Fence,
    ) -> Result<()> {
        unsafe {
            let (index, _suboptimal) = self
                .d_swapchain_loader
                .acquire_next_image(self.d_swapchain, u64::MAX, semaphore, acquire_fence)
                .map_err(|_| {
                    log::error!("Failed to acquire next image");
                    SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE
                })?;

            self.d_dev
                .dev
                .wait_for_fences(&[acquire_fence], true, u64::MAX)
                .map_err(|_| {
                    log::error!("Failed to wait for fences");
                    SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE
                })?;
            self.d_dev.dev.reset_fences(&[acquire_fence]).map_err(|_| {
                log::error!("Failed to reset fences");
                SquallError::COULD_NOT_ACQUIRE_NEXT_IMAGE
            })?;

            self.d_current = index as usize;
        }

        Ok(())
    }

    pub(crate) fn swapchain_loader(&self) -> &khr::Swapchain {
        &self.d_swapchain_loader
    }

    pub(crate) fn swapchain(&self) -> vk::SwapchainKHR {
        self.d_swapchain
    }

    pub(crate) fn current_index(&self) -> u32 {
        self.d_current as u32
    }

    pub(crate) fn current_image(&self) -> vk::Image {
        self.d_images[self.d_current]
    }

    pub(crate) fn current_view(&self) -> vk::ImageView {
        self.d_views[self.d_current]
    }

    pub(crate) fn current_layout(&self) -> vk::ImageLayout {
        self.d_layouts[self.d_current]
    }

    pub(crate) fn set_current_layout(&mut self, layout: vk::ImageLayout) {
        self.d_layouts[self.d_current] = layout;
    }

    /// Update the age bookkeeping after the current image was handed to
    /// the presentation engine.
    pub(crate) fn note_presented(&mut self) {
        bump_ages(self.d_ages.as_mut_slice(), self.d_current);
    }

    /// Age of the current image, or -1 if its contents are unknown and
    /// the caller must repaint everything.
    pub fn buffer_age(&self) -> i32 {
        self.d_ages[self.d_current]
    }
}

impl Drop for Display {
    fn drop(&mut self) {
        unsafe {
            for view in self.d_views.drain(..) {
                self.d_dev.dev.destroy_image_view(view, None);
            }

            // the images themselves belong to the swapchain
            if self.d_swapchain != vk::SwapchainKHR::null() {
                self.d_swapchain_loader.destroy_swapchain(self.d_swapchain, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::bump_ages;

    #[test]
    fn presented_image_is_age_one() {
        let mut ages = vec![-1, -1, -1];
        bump_ages(&mut ages, 0);
        assert_eq!(ages, vec![1, -1, -1]);
    }

    #[test]
    fn ages_roll_forward_across_presents() {
        // presents in order image0, image1, image2, image0
        let mut ages = vec![-1, -1, -1];
        bump_ages(&mut ages, 0);
        assert_eq!(ages, vec![1, -1, -1]);
        bump_ages(&mut ages, 1);
        assert_eq!(ages, vec![2, 1, -1]);
        bump_ages(&mut ages, 2);
        assert_eq!(ages, vec![3, 2, 1]);
        // the image just shown is age 1, every other previously
        // presented image aged by exactly one
        bump_ages(&mut ages, 0);
        assert_eq!(ages, vec![1, 3, 2]);
    }

    #[test]
    fn never_presented_images_stay_unknown() {
        let mut ages = vec![-1, -1, -1, -1];
        bump_ages(&mut ages, 1);
        bump_ages(&mut ages, 2);
        bump_ages(&mut ages, 1);
        assert_eq!(ages, vec![-1, 1, 2, -1]);
    }
}
