// Vulkan device representation
//
// This stores the GPU state for one backend context: the physical
// device picked to match the pixmap import strategy, the logical
// device, the single graphics+present queue, and the per-context
// extension function tables the import paths dispatch through.

use ash::extensions::khr;
use ash::vk;

use crate::instance::Instance;
use crate::platform::{self, BindPixmapStrategy};
use crate::session::Session;
use crate::{Result, SquallError};

use std::ffi::CStr;
use std::sync::Arc;

use x11rb::xcb_ffi::XCBConnection;

use log;

fn physical_device_type_to_string(ty: vk::PhysicalDeviceType) -> &'static str {
    match ty {
        vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated gpu",
        vk::PhysicalDeviceType::DISCRETE_GPU => "discrete gpu",
        vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual gpu",
        vk::PhysicalDeviceType::CPU => "cpu",
        _ => "other",
    }
}

/// One GPU, opened for one output surface.
///
/// The strategy tag is decided here, at creation, and never changes for
/// the lifetime of the context. The extension loaders below are the
/// per-context replacement for global function pointers: two contexts
/// on different devices get independent tables.
pub struct Device {
    pub(crate) inst: Arc<Instance>,
    /// the physical device selected to display to
    pub(crate) pdev: vk::PhysicalDevice,
    /// the logical device we are using
    pub(crate) dev: ash::Device,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,
    /// the one queue family that is graphics-capable and can present
    /// to our surface
    pub(crate) queue_family_index: u32,
    pub(crate) queue: vk::Queue,
    /// which pixmap import strategy this device was created for
    pub(crate) strategy: BindPixmapStrategy,
    /// SHM strategy only: device minimum alignment for imported host
    /// pointer allocations
    pub(crate) min_host_pointer_alignment: vk::DeviceSize,
    /// needed for vkGetMemoryFdPropertiesKHR (DRI3 strategy)
    pub(crate) external_mem_fd_loader: Option<khr::ExternalMemoryFd>,
    /// needed for vkGetMemoryHostPointerPropertiesEXT (SHM strategy)
    pub(crate) external_mem_host_fn: Option<vk::ExtExternalMemoryHostFn>,
}

impl Device {
    /// Find the first physical device that is 1.3-capable and carries
    /// every extension the strategy needs. No scoring, first hit wins.
    fn select_physical_device(
        inst: &ash::Instance,
        pdevices: &[vk::PhysicalDevice],
        extensions: &[&CStr],
    ) -> Option<vk::PhysicalDevice> {
        for (i, pdev) in pdevices.iter().enumerate() {
            let props = unsafe { inst.get_physical_device_properties(*pdev) };

            if props.api_version < vk::API_VERSION_1_3 {
                continue;
            }

            let exts = match unsafe { inst.enumerate_device_extension_properties(*pdev) } {
                Ok(e) => e,
                Err(_) => {
                    log::error!("Failed to enumerate device extension properties");
                    continue;
                }
            };

            if !platform::contains_extensions(exts.as_slice(), extensions) {
                continue;
            }

            let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
            log::info!(
                "Selected physical device {}: {:?} ({})",
                i,
                name,
                physical_device_type_to_string(props.device_type)
            );

            return Some(*pdev);
        }

        None
    }

    /// Choose a queue family
    ///
    /// The family has to satisfy all three of: the graphics bit, xcb
    /// presentation support for our connection/root visual, and surface
    /// support for the specific surface we will present to. The first
    /// family matching all of them wins.
    fn select_queue_family(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        xcb_loader: &khr::XcbSurface,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        conn: &XCBConnection,
        root_visual: u32,
    ) -> Result<u32> {
        let family_props =
            unsafe { inst.get_physical_device_queue_family_properties(pdev) };

        for (i, props) in family_props.iter().enumerate() {
            let has_graphics = props.queue_flags.contains(vk::QueueFlags::GRAPHICS);

            let supports_xcb = unsafe {
                let raw_conn = conn.get_raw_xcb_connection() as *mut vk::xcb_connection_t;
                xcb_loader.get_physical_device_xcb_presentation_support(
                    pdev,
                    i as u32,
                    &mut *raw_conn,
                    root_visual,
                )
            };

            let supports_surface = unsafe {
                surface_loader
                    .get_physical_device_surface_support(pdev, i as u32, surface)
                    .map_err(|_| SquallError::COULD_NOT_FIND_QUEUE_FAMILY)?
            };

            if has_graphics && supports_xcb && supports_surface {
                return Ok(i as u32);
            }
        }

        log::error!("Failed to find suitable queue family");
        Err(SquallError::COULD_NOT_FIND_QUEUE_FAMILY)
    }

    /// The device-reported minimum alignment for imported host pointer
    /// memory. Only meaningful for the SHM strategy, where staging
    /// allocations have to be rounded up to it.
    fn get_min_host_pointer_alignment(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
    ) -> vk::DeviceSize {
        let mut host_props = vk::PhysicalDeviceExternalMemoryHostPropertiesEXT::default();
        {
            let mut props = vk::PhysicalDeviceProperties2::builder().push_next(&mut host_props);
            unsafe { inst.get_physical_device_properties2(pdev, &mut props) };
        }

        host_props.min_imported_host_pointer_alignment
    }

    /// Resolve one device entry point, failing initialization if the
    /// driver does not provide it even though the extension was listed.
    fn require_device_proc(
        inst: &ash::Instance,
        dev: &ash::Device,
        name: &CStr,
    ) -> Result<()> {
        let addr = unsafe { inst.get_device_proc_addr(dev.handle(), name.as_ptr()) };
        if addr.is_none() {
            log::error!("Failed to get {:?} device procedure address", name);
            return Err(SquallError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }

        Ok(())
    }

    /// Create a new Device for this session's import capabilities.
    ///
    /// Tries the DRI3 extension set first if the server has DRI3, and
    /// only falls back to the SHM set when no physical device
    /// qualified. The surface already exists at this point so queue
    /// family selection can test presentation support against it.
    pub fn new(
        instance: Arc<Instance>,
        session: &Session,
        xcb_loader: &khr::XcbSurface,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let inst = &instance.inst;

        let pdevices = unsafe {
            inst.enumerate_physical_devices()
                .map_err(|_| SquallError::NO_SUITABLE_DEVICE)?
        };

        let mut selected = None;
        for strategy in platform::preferred_strategies(session.has_dri3(), session.has_shm()) {
            let extensions = platform::strategy_extensions(strategy);
            if let Some(pdev) =
                Self::select_physical_device(inst, pdevices.as_slice(), extensions.as_slice())
            {
                selected = Some((strategy, pdev, extensions));
                break;
            }
        }

        let (strategy, pdev, extensions) = match selected {
            Some(s) => s,
            None => {
                log::error!("Failed to find suitable physical device");
                return Err(SquallError::NO_SUITABLE_DEVICE);
            }
        };

        log::info!(
            "Binding pixmaps using the X {} extension",
            match strategy {
                BindPixmapStrategy::Dri3 => "DRI3",
                BindPixmapStrategy::Shm => "SHM",
            }
        );

        let min_host_pointer_alignment = match strategy {
            BindPixmapStrategy::Shm => Self::get_min_host_pointer_alignment(inst, pdev),
            BindPixmapStrategy::Dri3 => 0,
        };

        let queue_family_index = Self::select_queue_family(
            inst,
            pdev,
            xcb_loader,
            surface_loader,
            surface,
            session.conn(),
            session.root_visual(),
        )?;

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family_index)
            .queue_priorities(&priorities)
            .build()];

        let extension_ptrs: Vec<*const i8> = extensions.iter().map(|e| e.as_ptr()).collect();

        // Dynamic rendering lets us skip render pass and framebuffer
        // objects entirely, see the pipelines module
        let mut dynamic_rendering =
            vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

        let dev_create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(extension_ptrs.as_slice())
            .push_next(&mut dynamic_rendering);

        let dev = unsafe {
            inst.create_device(pdev, &dev_create_info, None).map_err(|_| {
                log::error!("Failed to create device");
                SquallError::DEVICE_CREATE_FAILED
            })?
        };

        // Build the strategy's function table, verifying the entry
        // points actually resolved
        let mut external_mem_fd_loader = None;
        let mut external_mem_host_fn = None;
        match strategy {
            BindPixmapStrategy::Dri3 => {
                let name =
                    unsafe { CStr::from_bytes_with_nul_unchecked(b"vkGetMemoryFdPropertiesKHR\0") };
                if let Err(e) = Self::require_device_proc(inst, &dev, name) {
                    unsafe { dev.destroy_device(None) };
                    return Err(e);
                }
                external_mem_fd_loader = Some(khr::ExternalMemoryFd::new(inst, &dev));
            }
            BindPixmapStrategy::Shm => {
                let name = unsafe {
                    CStr::from_bytes_with_nul_unchecked(b"vkGetMemoryHostPointerPropertiesEXT\0")
                };
                if let Err(e) = Self::require_device_proc(inst, &dev, name) {
                    unsafe { dev.destroy_device(None) };
                    return Err(e);
                }
                external_mem_host_fn = Some(vk::ExtExternalMemoryHostFn::load(|name| unsafe {
                    std::mem::transmute(inst.get_device_proc_addr(dev.handle(), name.as_ptr()))
                }));
            }
        }

        let queue = unsafe { dev.get_device_queue(queue_family_index, 0) };
        let mem_props = unsafe { inst.get_physical_device_memory_properties(pdev) };

        Ok(Self {
            inst: instance,
            pdev: pdev,
            dev: dev,
            mem_props: mem_props,
            queue_family_index: queue_family_index,
            queue: queue,
            strategy: strategy,
            min_host_pointer_alignment: min_host_pointer_alignment,
            external_mem_fd_loader: external_mem_fd_loader,
            external_mem_host_fn: external_mem_host_fn,
        })
    }

    /// Returns an index into the array of memory types for the memory
    /// properties
    ///
    /// `type_bits` is the supported-type mask of the resource being
    /// backed, already intersected with any external handle's mask by
    /// the caller. The returned type additionally carries `flags`.
    pub(crate) fn find_memory_type_index(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        for (i, mem_type) in self.mem_props.memory_types.iter().enumerate() {
            // Bit i of type_bits is set if the resource supports the
            // ith memory type in mem_props
            if (type_bits >> i) & 1 == 1 && mem_type.property_flags.contains(flags) {
                return Ok(i as u32);
            }
        }

        log::error!("Failed to find suitable memory type");
        Err(SquallError::NO_SUITABLE_MEMORY_TYPE)
    }

    /// returns a new vkCommandPool on our queue family
    pub(crate) fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family_index);

        unsafe {
            self.dev
                .create_command_pool(&info, None)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)
        }
    }

    /// Allocate the one primary command buffer this backend records
    /// every frame into.
    pub(crate) fn create_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_buffer_count(1)
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY);

        unsafe {
            Ok(self
                .dev
                .allocate_command_buffers(&info)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)?[0])
        }
    }

    /// Create the image sampler shared by every bound pixmap
    ///
    /// Window contents are sampled at 1:1 scale, so nearest filtering
    /// is exact and cheap. Repeat addressing matches what the X render
    /// path does with out-of-bounds coordinates.
    pub(crate) fn create_sampler(&self) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .mip_lod_bias(0.0)
            .anisotropy_enable(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false);

        unsafe {
            self.dev
                .create_sampler(&info, None)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)
        }
    }

    /// Create a device-local vkImage and bind fresh memory to it.
    ///
    /// This is the plain allocation path used by the SHM import
    /// strategy; the DRI3 strategy builds its images around imported
    /// external memory instead.
    pub(crate) fn create_image(
        &self,
        resolution: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        tiling: vk::ImageTiling,
    ) -> Result<(vk::Image, vk::DeviceMemory)> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: resolution.width,
                height: resolution.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            self.dev
                .create_image(&create_info, None)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)?
        };

        let reqs = unsafe { self.dev.get_image_memory_requirements(image) };
        let memtype_index = match self
            .find_memory_type_index(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        {
            Ok(i) => i,
            Err(e) => {
                unsafe { self.dev.destroy_image(image, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(memtype_index);

        unsafe {
            let memory = match self.dev.allocate_memory(&alloc_info, None) {
                Ok(m) => m,
                Err(_) => {
                    self.dev.destroy_image(image, None);
                    return Err(SquallError::VK_ALLOC_FAILED);
                }
            };

            if self.dev.bind_image_memory(image, memory, 0).is_err() {
                self.dev.destroy_image(image, None);
                self.dev.free_memory(memory, None);
                return Err(SquallError::VK_ALLOC_FAILED);
            }

            Ok((image, memory))
        }
    }

    /// Block until the GPU has fully drained.
    ///
    /// Resource release has no per-resource fence, so this is the only
    /// way to know nothing references an image anymore.
    pub(crate) fn wait_idle(&self) {
        unsafe {
            if self.dev.device_wait_idle().is_err() {
                log::error!("Failed to wait for device idle");
            }
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();
            self.dev.destroy_device(None);
        }
    }
}
