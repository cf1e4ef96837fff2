use ash::vk;

use super::descriptor_layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use super::descriptor_set::{DescriptorPool, DescriptorSet};
use super::device::GpuDevice;
use crate::renderer::DeviceContext;
use crate::{RenderError, Result};

const BINDLESS_BINDING: u32 = 0;

/// Bindless texture array. Indices are handed out monotonically and never reused.
pub struct BindlessTextureTable {
    layout: DescriptorSetLayout,
    set: DescriptorSet,
    capacity: u32,
    next_index: u32,
}

impl BindlessTextureTable {
    pub fn new(ctx: &mut DeviceContext, capacity: u32) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_bindless_images(
                BINDLESS_BINDING,
                vk::ShaderStageFlags::ALL_GRAPHICS | vk::ShaderStageFlags::COMPUTE,
                capacity,
            )
            .create(ctx, "bindless_textures")?;

        // Bindless descriptors must be allocated from a pool with UPDATE_AFTER_BIND.
        let pool = DescriptorPool::for_layout(ctx, &layout, 1)?;
        let set = DescriptorSet::create(ctx.device(), &pool, &layout, "bindless_textures")?;
        log::info!("[Descriptors] Bindless table created (capacity {capacity})");

        Ok(Self {
            layout,
            set,
            capacity,
            next_index: 0,
        })
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn set(&self) -> &DescriptorSet {
        &self.set
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> u32 {
        self.next_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Appends a sampled texture and returns its shader-visible index.
    pub fn register(
        &mut self,
        device: &dyn GpuDevice,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<u32> {
        if self.next_index >= self.capacity {
            return Err(RenderError::BindlessCapacity(format!(
                "{} of {} slots used",
                self.next_index, self.capacity
            )));
        }
        let index = self.next_index;
        self.set.write_combined_image_sampler_at(
            device,
            BINDLESS_BINDING,
            index,
            view,
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;
        self.next_index += 1;
        Ok(index)
    }

    /// Rewrites an already-registered slot, e.g. after a texture reload.
    pub fn replace(
        &self,
        device: &dyn GpuDevice,
        index: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> Result<()> {
        if index >= self.next_index {
            return Err(RenderError::BindingIndexOutOfRange {
                binding: BINDLESS_BINDING,
                layout: self.layout.name().to_string(),
                index,
                count: self.next_index,
            });
        }
        self.set.write_combined_image_sampler_at(
            device,
            BINDLESS_BINDING,
            index,
            view,
            sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::HeadlessDevice;
    use ash::vk::Handle as _;
    use std::sync::Arc;

    #[test]
    fn indices_are_monotonic_until_full() {
        let mut ctx = DeviceContext::new(Arc::new(HeadlessDevice::default()));
        let mut table = BindlessTextureTable::new(&mut ctx, 3).unwrap();
        let view = vk::ImageView::from_raw(9);
        let sampler = vk::Sampler::from_raw(10);

        let indices: Vec<u32> = (0..3)
            .map(|_| table.register(ctx.device(), view, sampler).unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(matches!(
            table.register(ctx.device(), view, sampler),
            Err(RenderError::BindlessCapacity(_))
        ));
        assert!(table.replace(ctx.device(), 1, view, sampler).is_ok());
        assert!(table.replace(ctx.device(), 3, view, sampler).is_err());
    }
}
