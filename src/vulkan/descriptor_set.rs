use ash::vk;

use super::descriptor_layout::{DescriptorSetLayout, LayoutBinding};
use super::device::{DescriptorResource, DescriptorWrite, GpuDevice};
use crate::renderer::{DescriptorPoolRecord, DeviceContext, Handle};
use crate::{RenderError, Result};

/// Registered descriptor pool sized for a fixed number of sets.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorPool {
    handle: Handle<DescriptorPoolRecord>,
    raw: vk::DescriptorPool,
    update_after_bind: bool,
}

impl DescriptorPool {
    pub fn new(
        ctx: &mut DeviceContext,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        update_after_bind: bool,
    ) -> Result<Self> {
        let raw = ctx
            .device()
            .create_descriptor_pool(max_sets, pool_sizes, update_after_bind)?;
        let handle = ctx.registry_mut().add_descriptor_pool(raw);
        Ok(Self {
            handle,
            raw,
            update_after_bind,
        })
    }

    /// Pool holding `sets` sets of `layout`.
    pub fn for_layout(ctx: &mut DeviceContext, layout: &DescriptorSetLayout, sets: u32) -> Result<Self> {
        let sizes: Vec<_> = layout
            .pool_sizes()
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: size.ty,
                descriptor_count: size.descriptor_count * sets,
            })
            .collect();
        Self::new(ctx, sets, &sizes, layout.is_update_after_bind())
    }

    /// Pool holding `sets` sets of each layout.
    pub fn for_layouts(
        ctx: &mut DeviceContext,
        layouts: &[&DescriptorSetLayout],
        sets: u32,
    ) -> Result<Self> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for size in layouts.iter().flat_map(|layout| layout.pool_sizes()) {
            match sizes.iter_mut().find(|s| s.ty == size.ty) {
                Some(existing) => existing.descriptor_count += size.descriptor_count * sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: size.ty,
                    descriptor_count: size.descriptor_count * sets,
                }),
            }
        }
        let update_after_bind = layouts.iter().any(|layout| layout.is_update_after_bind());
        Self::new(ctx, sets * layouts.len() as u32, &sizes, update_after_bind)
    }

    pub fn handle(&self) -> Handle<DescriptorPoolRecord> {
        self.handle
    }

    pub fn raw(&self) -> vk::DescriptorPool {
        self.raw
    }

    pub fn is_update_after_bind(&self) -> bool {
        self.update_after_bind
    }
}

/// A layout paired with a concrete allocation. Writes are validated against the layout.
#[derive(Debug, Clone)]
pub struct DescriptorSet {
    name: String,
    raw: vk::DescriptorSet,
    layout_name: String,
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSet {
    /// Allocates a set of `layout` from `pool`.
    pub fn create(
        device: &dyn GpuDevice,
        pool: &DescriptorPool,
        layout: &DescriptorSetLayout,
        name: &str,
    ) -> Result<Self> {
        let raw = device.allocate_descriptor_set(pool.raw(), layout.raw(), layout.variable_count())?;
        log::trace!("[Descriptors] Set '{name}' allocated from layout '{}'", layout.name());
        Ok(Self {
            name: name.to_string(),
            raw,
            layout_name: layout.name().to_string(),
            bindings: layout.bindings().to_vec(),
        })
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_uniform_buffer(
        &self,
        device: &dyn GpuDevice,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        let write = self.buffer_write(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer, offset, range)?;
        device.update_descriptor_sets(&[write]);
        Ok(())
    }

    pub fn write_storage_buffer(
        &self,
        device: &dyn GpuDevice,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        let write = self.buffer_write(binding, vk::DescriptorType::STORAGE_BUFFER, buffer, offset, range)?;
        device.update_descriptor_sets(&[write]);
        Ok(())
    }

    pub fn write_combined_image_sampler(
        &self,
        device: &dyn GpuDevice,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        self.write_combined_image_sampler_at(device, binding, 0, view, sampler, layout)
    }

    pub fn write_combined_image_sampler_at(
        &self,
        device: &dyn GpuDevice,
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        let write = self.image_write(
            binding,
            array_element,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        )?;
        device.update_descriptor_sets(&[write]);
        Ok(())
    }

    pub fn write_storage_image(&self, device: &dyn GpuDevice, binding: u32, view: vk::ImageView) -> Result<()> {
        let write = self.image_write(
            binding,
            0,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: vk::ImageLayout::GENERAL,
            },
        )?;
        device.update_descriptor_sets(&[write]);
        Ok(())
    }

    /// Starts a multi-slot update that is issued as one device call.
    pub fn batch(&self) -> DescriptorWriteBatch<'_> {
        DescriptorWriteBatch {
            set: self,
            writes: Vec::new(),
        }
    }

    fn validate(&self, binding: u32, array_element: u32, ty: vk::DescriptorType) -> Result<()> {
        let declared = self
            .bindings
            .iter()
            .find(|b| b.binding == binding)
            .ok_or_else(|| RenderError::UndeclaredBinding {
                binding,
                layout: self.layout_name.clone(),
            })?;
        if declared.descriptor_type != ty {
            return Err(RenderError::BindingKindMismatch {
                binding,
                layout: self.layout_name.clone(),
                expected: declared.descriptor_type,
                actual: ty,
            });
        }
        if array_element >= declared.count {
            return Err(RenderError::BindingIndexOutOfRange {
                binding,
                layout: self.layout_name.clone(),
                index: array_element,
                count: declared.count,
            });
        }
        Ok(())
    }

    fn buffer_write(
        &self,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<DescriptorWrite> {
        self.validate(binding, 0, ty)?;
        Ok(DescriptorWrite {
            set: self.raw,
            binding,
            array_element: 0,
            descriptor_type: ty,
            resource: DescriptorResource::Buffer(vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            }),
        })
    }

    fn image_write(
        &self,
        binding: u32,
        array_element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) -> Result<DescriptorWrite> {
        self.validate(binding, array_element, ty)?;
        Ok(DescriptorWrite {
            set: self.raw,
            binding,
            array_element,
            descriptor_type: ty,
            resource: DescriptorResource::Image(info),
        })
    }
}

/// Validated writes collected for one set and flushed in a single update.
pub struct DescriptorWriteBatch<'a> {
    set: &'a DescriptorSet,
    writes: Vec<DescriptorWrite>,
}

impl<'a> DescriptorWriteBatch<'a> {
    pub fn uniform_buffer(mut self, binding: u32, buffer: vk::Buffer, range: u64) -> Result<Self> {
        let write = self
            .set
            .buffer_write(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer, 0, range)?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn storage_buffer(mut self, binding: u32, buffer: vk::Buffer, range: u64) -> Result<Self> {
        let write = self
            .set
            .buffer_write(binding, vk::DescriptorType::STORAGE_BUFFER, buffer, 0, range)?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn sampled_image(
        mut self,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Result<Self> {
        let write = self.set.image_write(
            binding,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            },
        )?;
        self.writes.push(write);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Issues every collected write. Returns how many slots were updated.
    pub fn submit(self, device: &dyn GpuDevice) -> usize {
        if !self.writes.is_empty() {
            device.update_descriptor_sets(&self.writes);
        }
        self.writes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{DescriptorSetLayoutBuilder, DeviceCall, HeadlessDevice};
    use ash::vk::Handle as _;
    use std::sync::Arc;

    fn fixture() -> (Arc<HeadlessDevice>, DeviceContext, DescriptorSet) {
        let device = Arc::new(HeadlessDevice::default());
        let mut ctx = DeviceContext::new(device.clone());
        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .add_combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT, 2)
            .create(&mut ctx, "test")
            .unwrap();
        let pool = DescriptorPool::for_layout(&mut ctx, &layout, 1).unwrap();
        let set = DescriptorSet::create(ctx.device(), &pool, &layout, "test_set").unwrap();
        (device, ctx, set)
    }

    #[test]
    fn undeclared_binding_is_rejected() {
        let (_device, ctx, set) = fixture();
        let err = set
            .write_uniform_buffer(ctx.device(), 7, vk::Buffer::from_raw(1), 0, 64)
            .unwrap_err();
        assert!(matches!(err, RenderError::UndeclaredBinding { binding: 7, .. }));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let (_device, ctx, set) = fixture();
        let err = set
            .write_storage_buffer(ctx.device(), 0, vk::Buffer::from_raw(1), 0, 64)
            .unwrap_err();
        assert!(matches!(err, RenderError::BindingKindMismatch { binding: 0, .. }));
    }

    #[test]
    fn array_index_is_bounds_checked() {
        let (_device, ctx, set) = fixture();
        let view = vk::ImageView::from_raw(3);
        let sampler = vk::Sampler::from_raw(4);
        let layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        assert!(set
            .write_combined_image_sampler_at(ctx.device(), 1, 1, view, sampler, layout)
            .is_ok());
        assert!(matches!(
            set.write_combined_image_sampler_at(ctx.device(), 1, 2, view, sampler, layout),
            Err(RenderError::BindingIndexOutOfRange { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn batch_issues_one_update() {
        let (device, ctx, set) = fixture();
        device.clear_calls();
        let count = set
            .batch()
            .uniform_buffer(0, vk::Buffer::from_raw(1), 64)
            .unwrap()
            .sampled_image(
                1,
                vk::ImageView::from_raw(2),
                vk::Sampler::from_raw(3),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .unwrap()
            .submit(ctx.device());
        assert_eq!(count, 2);
        assert_eq!(device.calls(), vec![DeviceCall::UpdateDescriptors { writes: 2 }]);
    }
}
