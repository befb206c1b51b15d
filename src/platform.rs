// This module handles flagging the available behaviors supported by
// the windowing system and the device. The big decision made here is
// which pixmap import strategy the context will be built around, and
// which device extensions that strategy needs.

use ash::extensions::khr;
use ash::vk;

use std::ffi::CStr;

/// How window pixmaps get turned into sampled Vulkan images.
///
/// Chosen once at device creation and stored on the context. Per-frame
/// code only ever dispatches through the importer built from this tag,
/// it never re-branches on transport type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindPixmapStrategy {
    /// Import the pixmap's backing dma-buf directly (zero copy).
    Dri3,
    /// Pull pixels through a SysV shared memory segment and copy them
    /// into a device-local image.
    Shm,
}

/// The order in which strategies should be attempted, given what the
/// server advertised. DRI3 always wins when present; SHM is the
/// fallback for drivers or servers without buffer export.
pub fn preferred_strategies(has_dri3: bool, has_shm: bool) -> Vec<BindPixmapStrategy> {
    let mut ret = Vec::with_capacity(2);

    if has_dri3 {
        ret.push(BindPixmapStrategy::Dri3);
    }
    if has_shm {
        ret.push(BindPixmapStrategy::Shm);
    }

    return ret;
}

/// The device extension set one strategy needs, swapchain included.
pub fn strategy_extensions(strategy: BindPixmapStrategy) -> Vec<&'static CStr> {
    let mut ret = vec![khr::Swapchain::name()];

    match strategy {
        BindPixmapStrategy::Dri3 => {
            ret.push(vk::ExtExternalMemoryDmaBufFn::name());
            ret.push(vk::ExtImageDrmFormatModifierFn::name());
            ret.push(vk::KhrExternalMemoryFdFn::name());
        }
        BindPixmapStrategy::Shm => {
            ret.push(vk::ExtExternalMemoryHostFn::name());
        }
    }

    return ret;
}

/// Check that every extension in `req` shows up in the reported
/// extension properties.
pub fn contains_extensions(exts: &[vk::ExtensionProperties], req: &[&CStr]) -> bool {
    let mut count = 0;

    for r in req.iter() {
        for e in exts {
            let estr =
                unsafe { CStr::from_ptr(&e.extension_name as *const std::os::raw::c_char) };
            if *r == estr {
                // increment our count, once we have verified all extensions
                // are present then return true
                count += 1;
                if count == req.len() {
                    return true;
                }
                break;
            }
        }
    }

    return false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dri3_is_preferred_over_shm() {
        assert_eq!(
            preferred_strategies(true, true),
            vec![BindPixmapStrategy::Dri3, BindPixmapStrategy::Shm]
        );
    }

    #[test]
    fn shm_only_server_gets_shm() {
        assert_eq!(preferred_strategies(false, true), vec![BindPixmapStrategy::Shm]);
        assert_eq!(preferred_strategies(true, false), vec![BindPixmapStrategy::Dri3]);
        assert!(preferred_strategies(false, false).is_empty());
    }

    #[test]
    fn strategy_extension_sets_share_swapchain() {
        let dri3 = strategy_extensions(BindPixmapStrategy::Dri3);
        let shm = strategy_extensions(BindPixmapStrategy::Shm);

        assert!(dri3.contains(&khr::Swapchain::name()));
        assert!(shm.contains(&khr::Swapchain::name()));
        assert!(dri3.contains(&vk::KhrExternalMemoryFdFn::name()));
        assert!(shm.contains(&vk::ExtExternalMemoryHostFn::name()));
    }
}
