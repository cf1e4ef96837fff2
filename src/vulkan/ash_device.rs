//! Vulkan 1.3 implementation of [`GpuDevice`] on top of `ash` and `vk-mem`.
//!
//! Uses dynamic rendering (no render pass objects), `synchronization2` image barriers and
//! multiview. The host owns the instance and the window surface; this type owns the logical
//! device, the allocator and the swapchain built on the surface.

use ash::khr::{surface, swapchain};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use vk_mem::Alloc;

use super::device::{
    AcquiredImage, BlendMode, BufferDesc, DescriptorResource, DescriptorWrite,
    GpuDevice, GraphicsPipelineDesc, ImageBarrier, ImageDesc, ImageViewDesc, LoadOp,
    MemoryLocation, RenderingDesc, SamplerDesc, SubmitDesc,
};
use crate::{RenderError, Result};

const ENTRY_POINT: &CStr = c"main";

/// Window surface handed over by the host.
pub struct PresentSurface {
    pub loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
}

struct BufferAllocation {
    allocation: vk_mem::Allocation,
    size: u64,
}

struct SwapchainState {
    surface: PresentSurface,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    format: vk::Format,
    extent: vk::Extent2D,
}

pub struct AshDevice {
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    device_name: String,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    buffers: Mutex<HashMap<u64, BufferAllocation>>,
    images: Mutex<HashMap<u64, vk_mem::Allocation>>,
    swapchain_loader: swapchain::Device,
    swapchain: Mutex<Option<SwapchainState>>,
    // vkQueueSubmit and vkQueuePresentKHR require external synchronization.
    queue_lock: Mutex<()>,
}

impl AshDevice {
    /// Selects a GPU, creates the logical device and the memory allocator, and builds a
    /// swapchain when a surface is provided.
    ///
    /// # Safety
    ///
    /// `instance` must outlive the returned device, and `present.surface` must have been
    /// created from it.
    pub unsafe fn new(instance: &ash::Instance, present: Option<PresentSurface>) -> Result<Self> {
        let physical_devices = instance.enumerate_physical_devices().map_err(|e| {
            RenderError::DeviceInitFailed(format!("Failed to enumerate devices: {e:?}"))
        })?;

        let (physical_device, queue_family) = physical_devices
            .iter()
            .find_map(|&candidate| {
                Self::find_queue_family(instance, candidate, present.as_ref())
                    .map(|family| (candidate, family))
            })
            .ok_or_else(|| {
                RenderError::DeviceInitFailed("No GPU found with graphics+present support".into())
            })?;

        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();
        log::info!("[Device] Selected GPU: {device_name}");

        let queue_priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let extension_names = [swapchain::NAME.as_ptr()];
        let device_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .depth_clamp(true);
        let mut features11 = vk::PhysicalDeviceVulkan11Features::default().multiview(true);
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_variable_descriptor_count(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut features11)
            .push_next(&mut features12)
            .push_next(&mut features13);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);

        let device = instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| RenderError::DeviceInitFailed(format!("Failed to create device: {e:?}")))?;
        let queue = device.get_device_queue(queue_family, 0);

        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            instance,
            &device,
            physical_device,
        ))
        .map_err(|e| RenderError::DeviceInitFailed(format!("VMA init failed: {e:?}")))?;
        log::info!("[Device] VMA allocator created");

        let ash_device = Self {
            swapchain_loader: swapchain::Device::new(instance, &device),
            device,
            physical_device,
            queue,
            queue_family,
            device_name,
            allocator: ManuallyDrop::new(allocator),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            swapchain: Mutex::new(None),
            queue_lock: Mutex::new(()),
        };

        if let Some(present) = present {
            let state = ash_device.build_swapchain(present, vk::SwapchainKHR::null())?;
            *ash_device.swapchain.lock() = Some(state);
        }

        Ok(ash_device)
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Format of the swap images, if a surface is attached.
    pub fn present_format(&self) -> Option<vk::Format> {
        self.swapchain.lock().as_ref().map(|state| state.format)
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        present: Option<&PresentSurface>,
    ) -> Option<u32> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        families.iter().enumerate().find_map(|(index, family)| {
            let index = index as u32;
            if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                return None;
            }
            let presentable = match present {
                Some(present) => unsafe {
                    present
                        .loader
                        .get_physical_device_surface_support(physical_device, index, present.surface)
                        .unwrap_or(false)
                },
                None => true,
            };
            presentable.then_some(index)
        })
    }

    fn build_swapchain(
        &self,
        present: PresentSurface,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainState> {
        let to_err = |e: vk::Result| RenderError::vulkan("create_swapchain", e);

        let (capabilities, formats) = unsafe {
            (
                present
                    .loader
                    .get_physical_device_surface_capabilities(self.physical_device, present.surface)
                    .map_err(to_err)?,
                present
                    .loader
                    .get_physical_device_surface_formats(self.physical_device, present.surface)
                    .map_err(to_err)?,
            )
        };

        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .copied()
            .ok_or_else(|| to_err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;

        let image_count = if capabilities.max_image_count > 0 {
            capabilities
                .min_image_count
                .max(2)
                .min(capabilities.max_image_count)
        } else {
            capabilities.min_image_count.max(2)
        };

        // u32::MAX means the surface size is set by the swapchain extent.
        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: present.extent.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: present.extent.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(present.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let (swapchain, images) = unsafe {
            let swapchain = self
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(to_err)?;
            let images = self
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(to_err)?;
            (swapchain, images)
        };

        log::info!(
            "[Device] Swapchain created with {} images ({}x{})",
            images.len(),
            extent.width,
            extent.height
        );

        Ok(SwapchainState {
            surface: present,
            swapchain,
            images,
            format: surface_format.format,
            extent,
        })
    }

    fn blend_attachment(blend: BlendMode) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(
            vk::ColorComponentFlags::R
                | vk::ColorComponentFlags::G
                | vk::ColorComponentFlags::B
                | vk::ColorComponentFlags::A,
        );
        match blend {
            BlendMode::Opaque => state.blend_enable(false),
            BlendMode::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
            BlendMode::Alpha => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

impl GpuDevice for AshDevice {
    fn name(&self) -> &str {
        &self.device_name
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_info = match desc.location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                required_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                    | vk::MemoryPropertyFlags::HOST_COHERENT,
                ..Default::default()
            },
        };

        let (buffer, allocation) = unsafe { self.allocator.create_buffer(&buffer_info, &alloc_info) }
            .map_err(|e| RenderError::vulkan("create_buffer", e))?;
        let memory = self.allocator.get_allocation_info(&allocation).device_memory;
        log::trace!("[Device] Buffer '{}' created ({} bytes)", desc.name, desc.size);

        self.buffers.lock().insert(
            buffer.as_raw(),
            BufferAllocation {
                allocation,
                size: desc.size,
            },
        );
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _memory: vk::DeviceMemory) {
        match self.buffers.lock().remove(&buffer.as_raw()) {
            Some(mut entry) => unsafe {
                self.allocator.destroy_buffer(buffer, &mut entry.allocation)
            },
            None => unsafe { self.device.destroy_buffer(buffer, None) },
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock();
        let entry = buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RenderError::vulkan("write_buffer", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if offset + data.len() as u64 > entry.size {
            return Err(RenderError::vulkan(
                "write_buffer",
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ));
        }
        unsafe {
            let ptr = self
                .allocator
                .map_memory(&mut entry.allocation)
                .map_err(|e| RenderError::vulkan("map_memory", e))?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
            self.allocator.unmap_memory(&mut entry.allocation);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffers = self.buffers.lock();
        let entry = buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RenderError::vulkan("read_buffer", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if offset + len as u64 > entry.size {
            return Err(RenderError::vulkan(
                "read_buffer",
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ));
        }
        let mut out = vec![0u8; len];
        unsafe {
            let ptr = self
                .allocator
                .map_memory(&mut entry.allocation)
                .map_err(|e| RenderError::vulkan("map_memory", e))?;
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
            self.allocator.unmap_memory(&mut entry.allocation);
        }
        Ok(out)
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, vk::DeviceMemory)> {
        let flags = if desc.cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { self.allocator.create_image(&image_info, &alloc_info) }
            .map_err(|e| RenderError::vulkan("create_image", e))?;
        let memory = self.allocator.get_allocation_info(&allocation).device_memory;
        log::trace!(
            "[Device] Image '{}' created ({}x{}, {} layers)",
            desc.name,
            desc.extent.width,
            desc.extent.height,
            desc.array_layers
        );

        self.images.lock().insert(image.as_raw(), allocation);
        Ok((image, memory))
    }

    fn destroy_image(&self, image: vk::Image, _memory: vk::DeviceMemory) {
        match self.images.lock().remove(&image.as_raw()) {
            Some(mut allocation) => unsafe { self.allocator.destroy_image(image, &mut allocation) },
            None => unsafe { self.device.destroy_image(image, None) },
        }
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: desc.base_layer,
                layer_count: desc.layer_count,
            });
        unsafe { self.device.create_image_view(&info, None) }
            .map_err(|e| RenderError::vulkan("create_image_view", e))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .border_color(desc.border_color)
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(0.0)
            .max_lod(desc.max_lod);
        unsafe { self.device.create_sampler(&info, None) }
            .map_err(|e| RenderError::vulkan("create_sampler", e))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| RenderError::vulkan("create_shader_module", e))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout> {
        let update_after_bind = binding_flags
            .iter()
            .any(|flags| flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND));
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(binding_flags);
        let mut info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        if update_after_bind {
            info = info.flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        }
        if !binding_flags.is_empty() {
            info = info.push_next(&mut flags_info);
        }
        unsafe { self.device.create_descriptor_set_layout(&info, None) }
            .map_err(|e| RenderError::vulkan("create_descriptor_set_layout", e))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<vk::DescriptorPool> {
        let mut flags = vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET;
        if update_after_bind {
            flags |= vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND;
        }
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(flags)
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }
            .map_err(|e| RenderError::vulkan("create_descriptor_pool", e))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let counts = [variable_count.unwrap_or(0)];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let mut info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        if variable_count.is_some() {
            info = info.push_next(&mut variable_info);
        }
        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }
            .map_err(|e| RenderError::vulkan("allocate_descriptor_sets", e))?;
        sets.into_iter().next().ok_or_else(|| {
            RenderError::vulkan("allocate_descriptor_sets", vk::Result::ERROR_OUT_OF_POOL_MEMORY)
        })
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match write.resource {
                DescriptorResource::Buffer(info) => buffer_infos.push(info),
                DescriptorResource::Image(info) => image_infos.push(info),
            }
        }

        let (mut next_buffer, mut next_image) = (0, 0);
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|write| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.descriptor_type);
                match write.resource {
                    DescriptorResource::Buffer(_) => {
                        let info = std::slice::from_ref(&buffer_infos[next_buffer]);
                        next_buffer += 1;
                        base.buffer_info(info)
                    }
                    DescriptorResource::Image(_) => {
                        let info = std::slice::from_ref(&image_infos[next_image]);
                        next_image += 1;
                        base.image_info(info)
                    }
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        unsafe { self.device.create_pipeline_layout(&info, None) }
            .map_err(|e| RenderError::vulkan("create_pipeline_layout", e))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        layout: vk::PipelineLayout,
        stages: &[(vk::ShaderStageFlags, vk::ShaderModule)],
    ) -> Result<vk::Pipeline> {
        let stage_infos: Vec<_> = stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect();

        // Vertices are pulled from storage buffers, so there is no fixed-function input.
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(desc.depth_bias)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0)
            .depth_bias_enable(desc.depth_bias);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);
        let blend_attachments: Vec<_> = desc
            .color_formats
            .iter()
            .map(|_| Self::blend_attachment(desc.blend))
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let mut dynamic_states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if desc.depth_bias {
            dynamic_states.push(vk::DynamicState::DEPTH_BIAS);
        }
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .view_mask(desc.view_mask)
            .color_attachment_formats(&desc.color_formats)
            .depth_attachment_format(desc.depth_format);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| RenderError::vulkan("create_graphics_pipelines", e))?;
        pipelines.into_iter().next().ok_or_else(|| {
            RenderError::vulkan("create_graphics_pipelines", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn create_compute_pipeline(
        &self,
        layout: vk::PipelineLayout,
        module: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(ENTRY_POINT);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| RenderError::vulkan("create_compute_pipelines", e))?;
        pipelines.into_iter().next().ok_or_else(|| {
            RenderError::vulkan("create_compute_pipelines", vk::Result::ERROR_UNKNOWN)
        })
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| RenderError::vulkan("create_fence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(RenderError::vulkan("wait_for_fences", e)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| RenderError::vulkan("reset_fences", e))
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| RenderError::vulkan("create_semaphore", e))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family);
        unsafe { self.device.create_command_pool(&info, None) }
            .map_err(|e| RenderError::vulkan("create_command_pool", e))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }
            .map_err(|e| RenderError::vulkan("allocate_command_buffers", e))?;
        buffers.into_iter().next().ok_or_else(|| {
            RenderError::vulkan("allocate_command_buffers", vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        })
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| RenderError::vulkan("reset_command_buffer", e))?;
            let info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &info)
                .map_err(|e| RenderError::vulkan("begin_command_buffer", e))
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| RenderError::vulkan("end_command_buffer", e))
    }

    fn submit(&self, submit: &SubmitDesc) -> Result<()> {
        let command_buffers = [submit.command_buffer];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = submit.wait.into_iter().unzip();
        let signal_semaphores: Vec<_> = submit.signal.into_iter().collect();
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let _queue = self.queue_lock.lock();
        unsafe { self.device.queue_submit(self.queue, &[info], submit.fence) }
            .map_err(|e| RenderError::vulkan("queue_submit", e))
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| RenderError::vulkan("device_wait_idle", e))
    }

    fn acquire_next_image(&self, signal: vk::Semaphore) -> Result<AcquiredImage> {
        let guard = self.swapchain.lock();
        let state = guard.as_ref().ok_or(RenderError::NoPresentTarget)?;
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                state.swapchain,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage {
                index,
                image: state.images[index as usize],
                extent: state.extent,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(e) => Err(RenderError::vulkan("acquire_next_image", e)),
        }
    }

    fn present(&self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        let guard = self.swapchain.lock();
        let state = guard.as_ref().ok_or(RenderError::NoPresentTarget)?;
        let swapchains = [state.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let _queue = self.queue_lock.lock();
        match unsafe { self.swapchain_loader.queue_present(self.queue, &info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(RenderError::SwapchainOutOfDate),
            Err(e) => Err(RenderError::vulkan("queue_present", e)),
        }
    }

    fn resize_present_target(&self, extent: vk::Extent2D) -> Result<()> {
        let mut guard = self.swapchain.lock();
        let Some(old) = guard.take() else {
            return Err(RenderError::NoPresentTarget);
        };
        let old_swapchain = old.swapchain;
        let surface = PresentSurface {
            extent,
            ..old.surface
        };
        let rebuilt = self.build_swapchain(surface, old_swapchain);
        unsafe { self.swapchain_loader.destroy_swapchain(old_swapchain, None) };
        *guard = Some(rebuilt?);
        Ok(())
    }

    fn cmd_image_barriers(&self, cmd: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        if barriers.is_empty() {
            return;
        }
        let image_barriers: Vec<_> = barriers
            .iter()
            .map(|barrier| {
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(barrier.src.stage)
                    .src_access_mask(barrier.src.access)
                    .dst_stage_mask(barrier.dst.stage)
                    .dst_access_mask(barrier.dst.access)
                    .old_layout(barrier.src.layout)
                    .new_layout(barrier.dst.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(barrier.image)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: barrier.aspect,
                        base_mip_level: 0,
                        level_count: barrier.mip_levels,
                        base_array_layer: 0,
                        layer_count: barrier.layer_count,
                    })
            })
            .collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&image_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency) }
    }

    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        let color: Vec<_> = desc
            .color
            .iter()
            .map(|target| {
                let (load_op, clear_value) = match target.load {
                    LoadOp::Clear(color) => (
                        vk::AttachmentLoadOp::CLEAR,
                        vk::ClearValue {
                            color: vk::ClearColorValue { float32: color },
                        },
                    ),
                    LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                    LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
                };
                vk::RenderingAttachmentInfo::default()
                    .image_view(target.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op)
                    .store_op(if target.store {
                        vk::AttachmentStoreOp::STORE
                    } else {
                        vk::AttachmentStoreOp::DONT_CARE
                    })
                    .clear_value(clear_value)
            })
            .collect();

        let depth = desc.depth.map(|target| {
            let (load_op, clear_value) = match target.load {
                LoadOp::Clear(depth) => (
                    vk::AttachmentLoadOp::CLEAR,
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                    },
                ),
                LoadOp::Load => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
                LoadOp::DontCare => (vk::AttachmentLoadOp::DONT_CARE, vk::ClearValue::default()),
            };
            let layout = if target.read_only {
                vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
            };
            vk::RenderingAttachmentInfo::default()
                .image_view(target.view)
                .image_layout(layout)
                .load_op(load_op)
                .store_op(if target.store {
                    vk::AttachmentStoreOp::STORE
                } else {
                    vk::AttachmentStoreOp::DONT_CARE
                })
                .clear_value(clear_value)
        });

        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: desc.extent,
            })
            .layer_count(desc.layer_count)
            .view_mask(desc.view_mask)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(cmd, &info) }
    }

    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cmd) }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) }
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cmd, bind_point, layout, first_set, sets, &[])
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        unsafe { self.device.cmd_push_constants(cmd, layout, stages, 0, data) }
    }

    fn cmd_set_viewport_scissor(
        &self,
        cmd: vk::CommandBuffer,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
    ) {
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn cmd_set_depth_bias(&self, cmd: vk::CommandBuffer, constant: f32, clamp: f32, slope: f32) {
        unsafe { self.device.cmd_set_depth_bias(cmd, constant, clamp, slope) }
    }

    fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn cmd_dispatch(&self, cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cmd, x, y, z) }
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
    ) {
        let color_layer = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: vk::Extent2D| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: color_layer,
            src_offsets: [vk::Offset3D::default(), corner(src_extent)],
            dst_subresource: color_layer,
            dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
        };
        unsafe {
            self.device.cmd_blit_image(
                cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        }
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            if let Some(state) = self.swapchain.get_mut().take() {
                self.swapchain_loader.destroy_swapchain(state.swapchain, None);
            }

            let leaked = self.buffers.get_mut().len() + self.images.get_mut().len();
            if leaked > 0 {
                log::warn!("[Device] {leaked} allocations still live at device teardown");
            }
            for (raw, mut entry) in self.buffers.get_mut().drain() {
                self.allocator
                    .destroy_buffer(vk::Buffer::from_raw(raw), &mut entry.allocation);
            }
            for (raw, mut allocation) in self.images.get_mut().drain() {
                self.allocator
                    .destroy_image(vk::Image::from_raw(raw), &mut allocation);
            }

            ManuallyDrop::drop(&mut self.allocator);
            log::info!("[Device] VMA allocator destroyed");
            self.device.destroy_device(None);
        }
        log::info!("[Device] Vulkan device destroyed");
    }
}
