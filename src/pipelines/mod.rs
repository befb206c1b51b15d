//! # The compose and fill render pipelines
//!
//! The backend draws with exactly two graphics pipelines, both built
//! once at startup and immutable until teardown:
//!
//! * `compose` - samples a bound window image into the swapchain
//! * `fill` - writes a solid premultiplied color
//!
//! Both are dynamic-rendering pipelines (no render pass or framebuffer
//! objects), draw a 4-vertex triangle strip per clip rectangle with
//! positions derived entirely from push constants, and blend
//! premultiplied alpha over whatever is already in the target. There
//! is no batching across rectangles, one rectangle is one draw.

mod shaders;

use ash::vk;
use serde::Serialize;

use crate::device::Device;
use crate::display::SURFACE_FORMAT;
use crate::region::{Color, Rect};
use crate::{Result, SquallError};

use std::ffi::CString;
use std::sync::Arc;

use log;

/// Viewport dimensions, pushed once per compose/fill call.
#[repr(C)]
#[derive(Clone, Copy, Serialize)]
struct PushViewport {
    width: u32,
    height: u32,
}

/// One clip rectangle, pushed before every draw.
#[repr(C)]
#[derive(Clone, Copy, Serialize)]
struct PushRect {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

/// Where the source image sits on screen, pushed once per compose.
#[repr(C)]
#[derive(Clone, Copy, Serialize)]
struct PushOrigin {
    x: i32,
    y: i32,
}

/// Premultiplied fill color, pushed once per fill.
#[repr(C)]
#[derive(Clone, Copy, Serialize)]
struct PushColor {
    r: f32,
    g: f32,
    b: f32,
    a: f32,
}

/// Push constant block offsets shared with the GLSL sources.
const PUSH_VIEWPORT_OFFSET: u32 = 0;
const PUSH_RECT_OFFSET: u32 = 8;
const PUSH_ORIGIN_OFFSET: u32 = 24;
const PUSH_COLOR_OFFSET: u32 = 32;

pub struct Pipelines {
    p_dev: Arc<Device>,
    p_compose_layout: vk::PipelineLayout,
    p_compose: vk::Pipeline,
    p_fill_layout: vk::PipelineLayout,
    p_fill: vk::Pipeline,
}

/// Compile one GLSL source and wrap it in a shader module.
fn create_shader_module(
    dev: &Device,
    compiler: &mut shaderc::Compiler,
    source: &str,
    kind: shaderc::ShaderKind,
    name: &str,
) -> Result<vk::ShaderModule> {
    let artifact = compiler
        .compile_into_spirv(source, kind, name, "main", None)
        .map_err(|e| {
            log::error!("Failed to compile {} into SPIR-V: {}", name, e);
            SquallError::SHADER_COMPILE_FAILED
        })?;

    let info = vk::ShaderModuleCreateInfo::builder().code(artifact.as_binary());

    unsafe {
        dev.dev.create_shader_module(&info, None).map_err(|_| {
            log::error!("Failed to create shader module for {}", name);
            SquallError::PIPELINE_CREATE_FAILED
        })
    }
}

/// vertex + fragment modules for one pipeline, destroyed as soon as
/// the pipeline has been created from them
struct ShaderPair {
    sp_dev: Arc<Device>,
    sp_vert: vk::ShaderModule,
    sp_frag: vk::ShaderModule,
}

impl ShaderPair {
    fn new(
        dev: Arc<Device>,
        compiler: &mut shaderc::Compiler,
        vert_src: &str,
        vert_name: &str,
        frag_src: &str,
        frag_name: &str,
    ) -> Result<Self> {
        let vert =
            create_shader_module(&dev, compiler, vert_src, shaderc::ShaderKind::Vertex, vert_name)?;
        let frag = match create_shader_module(
            &dev,
            compiler,
            frag_src,
            shaderc::ShaderKind::Fragment,
            frag_name,
        ) {
            Ok(f) => f,
            Err(e) => {
                unsafe { dev.dev.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        Ok(Self {
            sp_dev: dev,
            sp_vert: vert,
            sp_frag: frag,
        })
    }

    fn stages(&self, entrypoint: &CString) -> [vk::PipelineShaderStageCreateInfo; 2] {
        [
            vk::PipelineShaderStageCreateInfo {
                module: self.sp_vert,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::VERTEX,
                ..Default::default()
            },
            vk::PipelineShaderStageCreateInfo {
                module: self.sp_frag,
                p_name: entrypoint.as_ptr(),
                stage: vk::ShaderStageFlags::FRAGMENT,
                ..Default::default()
            },
        ]
    }
}

impl Drop for ShaderPair {
    fn drop(&mut self) {
        unsafe {
            self.sp_dev.dev.destroy_shader_module(self.sp_vert, None);
            self.sp_dev.dev.destroy_shader_module(self.sp_frag, None);
        }
    }
}

impl Pipelines {
    /// Build both pipelines from the embedded shader sources.
    ///
    /// `image_set_layout` is the descriptor layout every bound image's
    /// sampler set is allocated with; it is the compose pipeline's only
    /// set. The fill pipeline has no sets at all.
    pub fn new(
        dev: Arc<Device>,
        resolution: vk::Extent2D,
        image_set_layout: vk::DescriptorSetLayout,
    ) -> Result<Self> {
        let mut compiler = shaderc::Compiler::new().ok_or_else(|| {
            log::error!("Failed to initialize shader compiler");
            SquallError::SHADER_COMPILE_FAILED
        })?;

        let compose_shaders = ShaderPair::new(
            dev.clone(),
            &mut compiler,
            shaders::COMPOSE_VERTEX_SHADER,
            "compose_vertex_shader",
            shaders::COMPOSE_FRAGMENT_SHADER,
            "compose_fragment_shader",
        )?;
        let fill_shaders = ShaderPair::new(
            dev.clone(),
            &mut compiler,
            shaders::FILL_VERTEX_SHADER,
            "fill_vertex_shader",
            shaders::FILL_FRAGMENT_SHADER,
            "fill_fragment_shader",
        )?;

        // If the CString is created inline and turned into a pointer
        // the backing storage is freed before vkCreateGraphicsPipelines
        // reads it, so it has to outlive the stage infos.
        let entrypoint = CString::new("main").unwrap();

        // ----- state shared by both pipelines -----

        // positions come from push constants, there is no vertex input
        let vertex_info = vk::PipelineVertexInputStateCreateInfo::builder().build();

        let assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
            .primitive_restart_enable(false)
            .build();

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: resolution.width as f32,
            height: resolution.height as f32,
            min_depth: 0.0,
            max_depth: 0.0,
        }];
        let viewport_info = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            p_viewports: viewports.as_ptr(),
            // the scissor is dynamic, set per draw loop
            scissor_count: 1,
            p_scissors: std::ptr::null(),
            ..Default::default()
        };

        let raster_info = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0)
            .build();

        let multisample_info = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .build();

        // premultiplied alpha: src*1 + dst*(1-srcAlpha), same formula
        // for the color and alpha channels
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::ONE)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .build()];
        let blend_info = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments)
            .build();

        let dynamic_states = [vk::DynamicState::SCISSOR];
        let dynamic_info = vk::PipelineDynamicStateCreateInfo::builder()
            .dynamic_states(&dynamic_states)
            .build();

        let color_formats = [SURFACE_FORMAT];

        // ----- compose pipeline -----

        let compose_set_layouts = [image_set_layout];
        let compose_push_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(32)
            .build()];
        let compose_layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&compose_set_layouts)
            .push_constant_ranges(&compose_push_ranges);

        let compose_layout = unsafe {
            dev.dev
                .create_pipeline_layout(&compose_layout_info, None)
                .map_err(|_| {
                    log::error!("Failed to create pipeline layout");
                    SquallError::PIPELINE_CREATE_FAILED
                })?
        };

        let mut ret = Self {
            p_dev: dev.clone(),
            p_compose_layout: compose_layout,
            p_compose: vk::Pipeline::null(),
            p_fill_layout: vk::PipelineLayout::null(),
            p_fill: vk::Pipeline::null(),
        };

        let mut compose_rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats);
        let compose_stages = compose_shaders.stages(&entrypoint);
        let compose_pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .push_next(&mut compose_rendering_info)
            .stages(&compose_stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(compose_layout)
            .build();

        ret.p_compose = unsafe {
            dev.dev
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    &[compose_pipeline_info],
                    None,
                )
                .map_err(|_| {
                    log::error!("Failed to create graphics pipelines");
                    SquallError::PIPELINE_CREATE_FAILED
                })?[0]
        };

        // ----- fill pipeline -----

        let fill_push_ranges = [
            vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .offset(0)
                .size(24)
                .build(),
            vk::PushConstantRange::builder()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(PUSH_COLOR_OFFSET)
                .size(16)
                .build(),
        ];
        let fill_layout_info =
            vk::PipelineLayoutCreateInfo::builder().push_constant_ranges(&fill_push_ranges);

        ret.p_fill_layout = unsafe {
            dev.dev
                .create_pipeline_layout(&fill_layout_info, None)
                .map_err(|_| {
                    log::error!("Failed to create pipeline layout");
                    SquallError::PIPELINE_CREATE_FAILED
                })?
        };

        let mut fill_rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&color_formats);
        let fill_stages = fill_shaders.stages(&entrypoint);
        let fill_pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .push_next(&mut fill_rendering_info)
            .stages(&fill_stages)
            .vertex_input_state(&vertex_info)
            .input_assembly_state(&assembly)
            .viewport_state(&viewport_info)
            .rasterization_state(&raster_info)
            .multisample_state(&multisample_info)
            .color_blend_state(&blend_info)
            .dynamic_state(&dynamic_info)
            .layout(ret.p_fill_layout)
            .build();

        ret.p_fill = unsafe {
            dev.dev
                .create_graphics_pipelines(vk::PipelineCache::null(), &[fill_pipeline_info], None)
                .map_err(|_| {
                    log::error!("Failed to create graphics pipelines");
                    SquallError::PIPELINE_CREATE_FAILED
                })?[0]
        };

        Ok(ret)
    }

    /// One dynamic-rendering block over the region extents, load- and
    /// store-preserving so multiple compose/fill calls accumulate into
    /// the same frame.
    fn begin_rendering(&self, cbuf: vk::CommandBuffer, target: vk::ImageView, extents: &Rect) {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D {
                x: extents.r_x1,
                y: extents.r_y1,
            },
            extent: vk::Extent2D {
                width: extents.width() as u32,
                height: extents.height() as u32,
            },
        };

        let attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(target)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .build()];

        let rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            self.p_dev.dev.cmd_begin_rendering(cbuf, &rendering_info);
            self.p_dev.dev.cmd_set_scissor(cbuf, 0, &[render_area]);
        }
    }

    /// Record the draws that sample a bound image into the target.
    ///
    /// The viewport size and the image's on-screen origin are pushed
    /// once; each clip rectangle then gets its own push + draw. The
    /// caller guarantees `rects` is non-empty.
    pub fn record_compose(
        &self,
        cbuf: vk::CommandBuffer,
        target: vk::ImageView,
        resolution: vk::Extent2D,
        desc_set: vk::DescriptorSet,
        origin: (i32, i32),
        extents: &Rect,
        rects: &[Rect],
    ) {
        self.begin_rendering(cbuf, target, extents);

        unsafe {
            let dev = &self.p_dev.dev;

            dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, self.p_compose);
            dev.cmd_bind_descriptor_sets(
                cbuf,
                vk::PipelineBindPoint::GRAPHICS,
                self.p_compose_layout,
                0,
                &[desc_set],
                &[],
            );

            let viewport = PushViewport {
                width: resolution.width,
                height: resolution.height,
            };
            dev.cmd_push_constants(
                cbuf,
                self.p_compose_layout,
                vk::ShaderStageFlags::VERTEX,
                PUSH_VIEWPORT_OFFSET,
                bincode::serialize(&viewport).unwrap().as_slice(),
            );

            let push_origin = PushOrigin {
                x: origin.0,
                y: origin.1,
            };
            dev.cmd_push_constants(
                cbuf,
                self.p_compose_layout,
                vk::ShaderStageFlags::VERTEX,
                PUSH_ORIGIN_OFFSET,
                bincode::serialize(&push_origin).unwrap().as_slice(),
            );

            for rect in rects.iter() {
                let push_rect = PushRect {
                    x1: rect.r_x1,
                    y1: rect.r_y1,
                    x2: rect.r_x2,
                    y2: rect.r_y2,
                };
                dev.cmd_push_constants(
                    cbuf,
                    self.p_compose_layout,
                    vk::ShaderStageFlags::VERTEX,
                    PUSH_RECT_OFFSET,
                    bincode::serialize(&push_rect).unwrap().as_slice(),
                );
                dev.cmd_draw(cbuf, 4, 1, 0, 0);
            }

            dev.cmd_end_rendering(cbuf);
        }
    }

    /// Record solid-color draws over each clip rectangle.
    pub fn record_fill(
        &self,
        cbuf: vk::CommandBuffer,
        target: vk::ImageView,
        resolution: vk::Extent2D,
        color: &Color,
        extents: &Rect,
        rects: &[Rect],
    ) {
        self.begin_rendering(cbuf, target, extents);

        unsafe {
            let dev = &self.p_dev.dev;

            dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, self.p_fill);

            let viewport = PushViewport {
                width: resolution.width,
                height: resolution.height,
            };
            dev.cmd_push_constants(
                cbuf,
                self.p_fill_layout,
                vk::ShaderStageFlags::VERTEX,
                PUSH_VIEWPORT_OFFSET,
                bincode::serialize(&viewport).unwrap().as_slice(),
            );

            let push_color = PushColor {
                r: color.c_r,
                g: color.c_g,
                b: color.c_b,
                a: color.c_a,
            };
            dev.cmd_push_constants(
                cbuf,
                self.p_fill_layout,
                vk::ShaderStageFlags::FRAGMENT,
                PUSH_COLOR_OFFSET,
                bincode::serialize(&push_color).unwrap().as_slice(),
            );

            for rect in rects.iter() {
                let push_rect = PushRect {
                    x1: rect.r_x1,
                    y1: rect.r_y1,
                    x2: rect.r_x2,
                    y2: rect.r_y2,
                };
                dev.cmd_push_constants(
                    cbuf,
                    self.p_fill_layout,
                    vk::ShaderStageFlags::VERTEX,
                    PUSH_RECT_OFFSET,
                    bincode::serialize(&push_rect).unwrap().as_slice(),
                );
                dev.cmd_draw(cbuf, 4, 1, 0, 0);
            }

            dev.cmd_end_rendering(cbuf);
        }
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        unsafe {
            let dev = &self.p_dev.dev;

            if self.p_fill != vk::Pipeline::null() {
                dev.destroy_pipeline(self.p_fill, None);
            }
            if self.p_fill_layout != vk::PipelineLayout::null() {
                dev.destroy_pipeline_layout(self.p_fill_layout, None);
            }
            if self.p_compose != vk::Pipeline::null() {
                dev.destroy_pipeline(self.p_compose, None);
            }
            if self.p_compose_layout != vk::PipelineLayout::null() {
                dev.destroy_pipeline_layout(self.p_compose_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_constant_blocks_serialize_to_their_declared_sizes() {
        // the vertex ranges are 32 (compose) and 24 (fill) bytes total
        assert_eq!(bincode::serialize(&PushViewport { width: 1, height: 1 }).unwrap().len(), 8);
        assert_eq!(
            bincode::serialize(&PushRect {
                x1: 0,
                y1: 0,
                x2: 1,
                y2: 1
            })
            .unwrap()
            .len(),
            16
        );
        assert_eq!(bincode::serialize(&PushOrigin { x: 0, y: 0 }).unwrap().len(), 8);
        assert_eq!(
            bincode::serialize(&PushColor {
                r: 0.0,
                g: 0.0,
                b: 0.0,
                a: 1.0
            })
            .unwrap()
            .len(),
            16
        );
    }
}
