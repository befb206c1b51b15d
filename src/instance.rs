// Vulkan rendering instance
//
// This holds the entry loader and the VkInstance everything else is
// created from. The instance only ever needs the surface extensions,
// the interesting extension work all happens at device scope.

use ash::extensions::{ext, khr};
use ash::{vk, Entry};

use crate::platform;
use crate::{Result, SquallError};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use log;

// this happy little debug callback prints any errors/warnings the
// driver reports through VK_EXT_debug_utils
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. The entry just loads
/// function pointers from the dynamic library, the instance is what we
/// use to enumerate devices and create surfaces.
pub struct Instance {
    pub(crate) loader: Entry,
    pub(crate) inst: ash::Instance,
    /// Debug reporting, if VK_EXT_debug_utils was available
    debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl Instance {
    /// Register our callback for driver debug messages so they show up
    /// in the compositor log.
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .ok()?
        };

        Some((dr_loader, callback))
    }

    /// Create a vkInstance
    ///
    /// The only hard requirements at this scope are the surface
    /// extensions: without VK_KHR_surface and VK_KHR_xcb_surface there
    /// is nothing to present to and initialization fails.
    pub fn new() -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("squall").unwrap();

        let required_extensions = [khr::Surface::name(), khr::XcbSurface::name()];

        let instance_extensions = entry
            .enumerate_instance_extension_properties(None)
            .map_err(|_| SquallError::INSTANCE_CREATE_FAILED)?;

        if !platform::contains_extensions(instance_extensions.as_slice(), &required_extensions) {
            log::error!("Missing VK_KHR_surface or VK_KHR_xcb_surface instance extension");
            return Err(SquallError::VK_NOT_ALL_EXTENSIONS_AVAILABLE);
        }

        let mut extension_names_raw: Vec<*const i8> = required_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let has_debug = platform::contains_extensions(
            instance_extensions.as_slice(),
            &[ext::DebugUtils::name()],
        );
        if has_debug {
            extension_names_raw.push(ext::DebugUtils::name().as_ptr());
        }

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_3);

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_extension_names(&extension_names_raw);

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(|_| SquallError::INSTANCE_CREATE_FAILED)?
        };

        let debug = match has_debug {
            true => Self::setup_debug(&entry, &instance),
            false => None,
        };

        Ok(Self {
            loader: entry,
            inst: instance,
            debug: debug,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, callback)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(callback, None);
            }
            self.inst.destroy_instance(None);
        }
    }
}
