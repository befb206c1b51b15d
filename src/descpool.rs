/*
 * An allocator for descriptor sets, targeted for creating the one
 * image-sampler set every bound pixmap carries. Pools are chained so
 * binding more windows than one pool holds just allocates another
 * chunk instead of failing.
 */

use ash::vk;

use crate::device::Device;
use crate::{Result, SquallError};

use std::sync::{Arc, Mutex};

use log;

/// The number of sets in each pool chunk
static POOL_SIZE: u32 = 32;

/// Single descriptor
///
/// This tracks the lifetime of one sampled-image descriptor. When this
/// is dropped the set is freed and returned to its pool.
pub struct Descriptor {
    /// The owning pool
    d_pool: Arc<Mutex<DescPool>>,
    /// The descriptor set itself
    pub(crate) d_set: vk::DescriptorSet,
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        self.d_pool.lock().unwrap().free_set(self.d_set);
    }
}

/// One fixed-size descriptor pool chunk.
struct DescPool {
    dp_dev: Arc<Device>,
    dp_pool: vk::DescriptorPool,
    /// number of sets handed out from this pool, 0 to POOL_SIZE
    dp_outstanding: u32,
}

impl Drop for DescPool {
    fn drop(&mut self) {
        unsafe {
            self.dp_dev.dev.destroy_descriptor_pool(self.dp_pool, None);
        }
    }
}

impl DescPool {
    /// Allocate one set from this pool, or None if it is full.
    fn alloc_set(&mut self, layout: vk::DescriptorSetLayout) -> Option<vk::DescriptorSet> {
        if self.dp_outstanding >= POOL_SIZE {
            return None;
        }

        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.dp_pool)
            .set_layouts(&layouts);

        let set = unsafe { self.dp_dev.dev.allocate_descriptor_sets(&info).ok()?[0] };

        self.dp_outstanding += 1;

        Some(set)
    }

    /// Free one set in this pool
    fn free_set(&mut self, set: vk::DescriptorSet) {
        unsafe {
            if self.dp_dev.dev.free_descriptor_sets(self.dp_pool, &[set]).is_err() {
                log::error!("Failed to free descriptor set");
            }
        }
        self.dp_outstanding -= 1;
    }
}

/// The overall descriptor tracker
///
/// This owns the combined-image-sampler layout shared by the compose
/// pipeline and every bound image, the fixed sampler, and the list of
/// pool chunks allocation requests are serviced from.
pub struct DescriptorSystem {
    ds_dev: Arc<Device>,
    /// the layout for the one-sampler set bound during compose
    ds_layout: vk::DescriptorSetLayout,
    /// nearest-filter, repeat-addressing sampler shared by all images
    ds_sampler: vk::Sampler,
    ds_pools: Vec<Arc<Mutex<DescPool>>>,
}

impl DescriptorSystem {
    pub fn new(dev: Arc<Device>) -> Result<Self> {
        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .descriptor_count(1)
            .build()];
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let layout = unsafe {
            dev.dev
                .create_descriptor_set_layout(&info, None)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)?
        };

        let sampler = match dev.create_sampler() {
            Ok(s) => s,
            Err(e) => {
                unsafe { dev.dev.destroy_descriptor_set_layout(layout, None) };
                return Err(e);
            }
        };

        Ok(Self {
            ds_dev: dev,
            ds_layout: layout,
            ds_sampler: sampler,
            ds_pools: Vec::new(),
        })
    }

    pub(crate) fn layout(&self) -> vk::DescriptorSetLayout {
        self.ds_layout
    }

    /// Allocate one Descriptor from the first available pool
    ///
    /// This may add a new pool chunk to the system if needed.
    pub fn alloc_descriptor(&mut self) -> Result<Descriptor> {
        for pool in self.ds_pools.iter() {
            if let Some(set) = pool.lock().unwrap().alloc_set(self.ds_layout) {
                return Ok(Descriptor {
                    d_pool: pool.clone(),
                    d_set: set,
                });
            }
        }

        // If we couldn't find a pool then add a new one
        let pool = self.add_pool()?;
        let set = pool
            .lock()
            .unwrap()
            .alloc_set(self.ds_layout)
            .ok_or(SquallError::VK_ALLOC_FAILED)?;

        Ok(Descriptor {
            d_pool: pool,
            d_set: set,
        })
    }

    /// Point `desc` at a bound image's view, paired with the shared
    /// sampler. This is what the compose fragment shader samples.
    pub fn write_image(&self, desc: &Descriptor, view: vk::ImageView) {
        let info = [vk::DescriptorImageInfo::builder()
            .sampler(self.ds_sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .build()];
        let write_info = [vk::WriteDescriptorSet::builder()
            .dst_set(desc.d_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info)
            .build()];

        unsafe {
            self.ds_dev.dev.update_descriptor_sets(&write_info, &[]);
        }
    }

    /// Adds and returns a new DescPool chunk
    fn add_pool(&mut self) -> Result<Arc<Mutex<DescPool>>> {
        let sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(POOL_SIZE)
            .build()];

        let info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            // we want to be able to free descriptor sets individually
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(POOL_SIZE);

        let pool = unsafe {
            self.ds_dev
                .dev
                .create_descriptor_pool(&info, None)
                .map_err(|_| SquallError::VK_ALLOC_FAILED)?
        };

        let ret = Arc::new(Mutex::new(DescPool {
            dp_dev: self.ds_dev.clone(),
            dp_pool: pool,
            dp_outstanding: 0,
        }));

        self.ds_pools.push(ret.clone());

        Ok(ret)
    }
}

impl Drop for DescriptorSystem {
    fn drop(&mut self) {
        unsafe {
            self.ds_dev.dev.destroy_sampler(self.ds_sampler, None);
            self.ds_dev
                .dev
                .destroy_descriptor_set_layout(self.ds_layout, None);
        }
    }
}
