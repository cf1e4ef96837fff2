use ash::vk;

use crate::renderer::{DescriptorSetLayoutRecord, DeviceContext, Handle};
use crate::{RenderError, Result};

/// One declared binding of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

/// Accumulates bindings and pool-size tallies until [`create`](Self::create) finalizes them.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<LayoutBinding>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.push(LayoutBinding {
            binding,
            descriptor_type,
            count,
            stages,
            flags: vk::DescriptorBindingFlags::empty(),
        });
        self
    }

    pub fn add_uniform_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stages, 1)
    }

    pub fn add_storage_buffer(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_BUFFER, stages, 1)
    }

    pub fn add_combined_image_sampler(
        self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        self.add_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages, count)
    }

    pub fn add_storage_image(self, binding: u32, stages: vk::ShaderStageFlags) -> Self {
        self.add_binding(binding, vk::DescriptorType::STORAGE_IMAGE, stages, 1)
    }

    /// Large partially-bound image array with a variable descriptor count; updated after bind.
    pub fn add_bindless_images(
        mut self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        capacity: u32,
    ) -> Self {
        self.push(LayoutBinding {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: capacity,
            stages,
            flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT,
        });
        self
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn pool_sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.pool_sizes
    }

    fn push(&mut self, binding: LayoutBinding) {
        match self
            .pool_sizes
            .iter_mut()
            .find(|size| size.ty == binding.descriptor_type)
        {
            Some(size) => size.descriptor_count += binding.count,
            None => self.pool_sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: binding.count,
            }),
        }
        self.bindings.push(binding);
    }

    /// Creates the native layout and registers it. The result is immutable.
    pub fn create(self, ctx: &mut DeviceContext, name: &str) -> Result<DescriptorSetLayout> {
        for (i, binding) in self.bindings.iter().enumerate() {
            if self.bindings[..i]
                .iter()
                .any(|other| other.binding == binding.binding)
            {
                return Err(RenderError::DuplicateBinding {
                    binding: binding.binding,
                    layout: name.to_string(),
                });
            }
        }
        // A variable-count binding must be the highest-numbered one.
        let max_binding = self.bindings.iter().map(|b| b.binding).max().unwrap_or(0);
        if let Some(variable) = self.bindings.iter().find(|b| {
            b.flags
                .contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
        }) {
            if variable.binding != max_binding {
                return Err(RenderError::InvalidPipeline(format!(
                    "layout '{name}': variable-count binding {} must be the last binding",
                    variable.binding
                )));
            }
        }

        let native: Vec<vk::DescriptorSetLayoutBinding<'static>> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let flags: Vec<_> = self.bindings.iter().map(|b| b.flags).collect();
        let has_flags = flags.iter().any(|f| !f.is_empty());

        let raw = ctx
            .device()
            .create_descriptor_set_layout(&native, if has_flags { &flags } else { &[] })?;
        let handle = ctx.registry_mut().add_descriptor_set_layout(raw);
        log::debug!(
            "[Descriptors] Layout '{name}' created with {} bindings",
            self.bindings.len()
        );

        Ok(DescriptorSetLayout {
            name: name.to_string(),
            handle,
            raw,
            bindings: self.bindings,
            pool_sizes: self.pool_sizes,
        })
    }
}

/// A finalized descriptor set layout.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayout {
    name: String,
    handle: Handle<DescriptorSetLayoutRecord>,
    raw: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl DescriptorSetLayout {
    pub fn builder() -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Handle<DescriptorSetLayoutRecord> {
        self.handle
    }

    pub fn raw(&self) -> vk::DescriptorSetLayout {
        self.raw
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, index: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == index)
    }

    /// Pool sizes needed for one set of this layout.
    pub fn pool_sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.pool_sizes
    }

    pub fn is_update_after_bind(&self) -> bool {
        self.bindings
            .iter()
            .any(|b| b.flags.contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND))
    }

    /// Capacity of the variable-count binding, if the layout has one.
    pub fn variable_count(&self) -> Option<u32> {
        self.bindings
            .iter()
            .find(|b| {
                b.flags
                    .contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
            })
            .map(|b| b.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::HeadlessDevice;
    use std::sync::Arc;

    #[test]
    fn tallies_pool_sizes_per_kind() {
        let builder = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT, 3)
            .add_combined_image_sampler(2, vk::ShaderStageFlags::FRAGMENT, 1)
            .add_storage_buffer(3, vk::ShaderStageFlags::VERTEX);

        let sizes = builder.pool_sizes();
        let samplers = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .unwrap();
        assert_eq!(samplers.descriptor_count, 4);
        assert_eq!(sizes.len(), 3);
    }

    #[test]
    fn rejects_duplicate_binding() {
        let mut ctx = DeviceContext::new(Arc::new(HeadlessDevice::default()));
        let result = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .create(&mut ctx, "dup");
        assert!(matches!(result, Err(RenderError::DuplicateBinding { binding: 0, .. })));
    }

    #[test]
    fn created_layout_is_registered() {
        let mut ctx = DeviceContext::new(Arc::new(HeadlessDevice::default()));
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_bindless_images(1, vk::ShaderStageFlags::FRAGMENT, 64)
            .create(&mut ctx, "material")
            .unwrap();
        assert!(ctx.registry().contains(layout.handle()));
        assert!(layout.is_update_after_bind());
        assert_eq!(layout.variable_count(), Some(64));
    }
}
