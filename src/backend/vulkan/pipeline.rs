//! Pipeline, pipeline layout and descriptor set layout creation.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;

use super::conversion::{
    convert_blend_state, convert_compare_function, convert_cull_mode, convert_descriptor_type,
    convert_front_face, convert_polygon_mode, convert_samples, convert_step_mode,
    convert_texture_format, convert_topology, convert_vertex_format,
};
use crate::backend::{ComputePipelineDesc, GraphicsPipelineDesc};
use crate::error::{GraphicsError, GraphicsResult};
use crate::pipeline::PipelineLayoutInfo;
use crate::shader::ShaderBinary;

/// A pipeline layout and the set layouts it was built from, indexed by set.
#[derive(Debug, Clone)]
pub struct LayoutEntry {
    pub layout: vk::PipelineLayout,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
}

/// Pipeline and set layouts shared by every pipeline with the same bindings.
#[derive(Debug, Default)]
pub struct LayoutCache {
    set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    layouts: HashMap<u64, LayoutEntry>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        device: &ash::Device,
        info: &PipelineLayoutInfo,
    ) -> GraphicsResult<LayoutEntry> {
        if let Some(entry) = self.layouts.get(&info.layout_key) {
            return Ok(entry.clone());
        }

        let mut set_layouts = Vec::with_capacity(info.set_layout_keys.len());
        for (set, key) in info.set_layout_keys.iter().enumerate() {
            let set_layout = match self.set_layouts.get(key) {
                Some(layout) => *layout,
                None => {
                    let bindings: Vec<vk::DescriptorSetLayoutBinding> = info
                        .bindings
                        .iter()
                        .filter(|b| b.set as usize == set)
                        .map(|b| {
                            vk::DescriptorSetLayoutBinding::default()
                                .binding(b.binding)
                                .descriptor_type(convert_descriptor_type(b.kind))
                                .descriptor_count(1)
                                .stage_flags(vk::ShaderStageFlags::ALL)
                        })
                        .collect();
                    let create_info =
                        vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
                    let layout = unsafe { device.create_descriptor_set_layout(&create_info, None) }
                        .map_err(|e| pipeline_error("create descriptor set layout", e))?;
                    self.set_layouts.insert(*key, layout);
                    layout
                }
            };
            set_layouts.push(set_layout);
        }

        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = unsafe { device.create_pipeline_layout(&create_info, None) }
            .map_err(|e| pipeline_error("create pipeline layout", e))?;
        let entry = LayoutEntry {
            layout,
            set_layouts,
        };
        self.layouts.insert(info.layout_key, entry.clone());
        Ok(entry)
    }

    /// # Safety
    /// No pipeline using these layouts may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            for (_, entry) in self.layouts.drain() {
                device.destroy_pipeline_layout(entry.layout, None);
            }
            for (_, layout) in self.set_layouts.drain() {
                device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

fn pipeline_error(what: &str, e: vk::Result) -> GraphicsError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            GraphicsError::OutOfMemory
        }
        _ => GraphicsError::PipelineCreation(format!("Failed to {what}: {e:?}")),
    }
}

/// Shader module that is destroyed when dropped.
struct ShaderModule<'d> {
    device: &'d ash::Device,
    module: vk::ShaderModule,
    entry_point: CString,
}

impl<'d> ShaderModule<'d> {
    fn new(device: &'d ash::Device, binary: &ShaderBinary) -> GraphicsResult<Self> {
        let entry_point = CString::new(binary.entry_point.as_str()).map_err(|e| {
            GraphicsError::InvalidParameter(format!("Invalid shader entry point name: {e}"))
        })?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&binary.spirv);
        let module = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(|e| pipeline_error("create shader module", e))?;
        Ok(Self {
            device,
            module,
            entry_point,
        })
    }

    fn stage(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

/// Pipeline cache seeded with data from a previous run, if any.
fn create_pipeline_cache(
    device: &ash::Device,
    initial_data: Option<&[u8]>,
) -> GraphicsResult<vk::PipelineCache> {
    let seeded = vk::PipelineCacheCreateInfo::default().initial_data(initial_data.unwrap_or(&[]));
    match unsafe { device.create_pipeline_cache(&seeded, None) } {
        Ok(cache) => Ok(cache),
        Err(e) if initial_data.is_some() => {
            log::warn!("Driver rejected stored pipeline cache data ({e:?}), starting empty");
            unsafe { device.create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None) }
                .map_err(|e| pipeline_error("create pipeline cache", e))
        }
        Err(e) => Err(pipeline_error("create pipeline cache", e)),
    }
}

/// Build a graphics pipeline for dynamic rendering.
///
/// Returns the pipeline and the cache it was compiled through.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> GraphicsResult<(vk::Pipeline, vk::PipelineCache)> {
    let vertex = ShaderModule::new(device, desc.vertex)?;
    let fragment = desc
        .fragment
        .map(|binary| ShaderModule::new(device, binary))
        .transpose()?;

    let mut stages = vec![vertex.stage(vk::ShaderStageFlags::VERTEX)];
    if let Some(fragment) = &fragment {
        stages.push(fragment.stage(vk::ShaderStageFlags::FRAGMENT));
    }

    let state = desc.state;
    let binding_descriptions: Vec<vk::VertexInputBindingDescription> = state
        .vertex_layouts
        .iter()
        .map(|layout| {
            vk::VertexInputBindingDescription::default()
                .binding(layout.binding)
                .stride(layout.stride)
                .input_rate(convert_step_mode(layout.step_mode))
        })
        .collect();
    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = state
        .vertex_layouts
        .iter()
        .flat_map(|layout| {
            layout.attributes.iter().map(move |attribute| {
                vk::VertexInputAttributeDescription::default()
                    .location(attribute.location)
                    .binding(layout.binding)
                    .format(convert_vertex_format(attribute.format))
                    .offset(attribute.offset)
            })
        })
        .collect();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_topology(state.rasterization.topology))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(convert_polygon_mode(state.rasterization.polygon_mode))
        .cull_mode(convert_cull_mode(state.rasterization.cull_mode))
        .front_face(convert_front_face(state.rasterization.front_face))
        .line_width(1.0);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(convert_samples(desc.compat.samples));

    let has_depth = desc.compat.depth_format.is_some();
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(has_depth && state.depth.test_enabled)
        .depth_write_enable(has_depth && state.depth.write_enabled)
        .depth_compare_op(convert_compare_function(state.depth.compare));

    let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
        .compat
        .color_formats
        .iter()
        .map(|_| convert_blend_state(state.blend))
        .collect();
    let color_blend_state =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_formats: Vec<vk::Format> = desc
        .compat
        .color_formats
        .iter()
        .map(|format| convert_texture_format(*format))
        .collect();
    let depth_format = desc
        .compat
        .depth_format
        .map_or(vk::Format::UNDEFINED, convert_texture_format);
    let stencil_format = desc
        .compat
        .depth_format
        .filter(|format| format.has_stencil())
        .map_or(vk::Format::UNDEFINED, convert_texture_format);
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format)
        .stencil_attachment_format(stencil_format);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let cache = create_pipeline_cache(device, desc.cache_data)?;
    match unsafe { device.create_graphics_pipelines(cache, &[create_info], None) } {
        Ok(pipelines) => Ok((pipelines[0], cache)),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_cache(cache, None) };
            Err(pipeline_error(&format!("create graphics pipeline '{}'", desc.label), e))
        }
    }
}

pub fn create_compute_pipeline(
    device: &ash::Device,
    desc: &ComputePipelineDesc<'_>,
    layout: vk::PipelineLayout,
) -> GraphicsResult<(vk::Pipeline, vk::PipelineCache)> {
    let shader = ShaderModule::new(device, desc.shader)?;
    let create_info = vk::ComputePipelineCreateInfo::default()
        .stage(shader.stage(vk::ShaderStageFlags::COMPUTE))
        .layout(layout);

    let cache = create_pipeline_cache(device, desc.cache_data)?;
    match unsafe { device.create_compute_pipelines(cache, &[create_info], None) } {
        Ok(pipelines) => Ok((pipelines[0], cache)),
        Err((_, e)) => {
            unsafe { device.destroy_pipeline_cache(cache, None) };
            Err(pipeline_error(&format!("create compute pipeline '{}'", desc.label), e))
        }
    }
}
