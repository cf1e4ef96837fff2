//! Sole owner and destroyer of low-level GPU objects.
//!
//! Every category lives in its own generational arena. Callers hold typed [`Handle`]s; a
//! handle whose resource was destroyed fails its generation check instead of resolving to a
//! freed native object. A structural hash of the native handle(s) deduplicates re-registration
//! of the same object.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk::{self, Handle as _};
use log::{debug, info, trace, warn};

use crate::utils::{Arena, GenerationalId};
use crate::vulkan::{GpuDevice, ObjectKind};
use crate::{RenderError, Result};

/// Typed, generation-checked reference to a registry entry.
pub struct Handle<T> {
    id: GenerationalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(id: GenerationalId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> GenerationalId {
        self.id
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.id.index, self.id.generation)
    }
}

/// A registry entry type.
pub trait RegistryResource: Sized {
    const KIND: ObjectKind;

    /// Hash of the native handle value(s), combined for paired handles.
    fn structural_hash(&self) -> u64;

    /// Nulls the stored handle(s) and frees them natively.
    fn destroy(&mut self, device: &dyn GpuDevice);

    fn category(registry: &ResourceRegistry) -> &Category<Self>;
    fn category_mut(registry: &mut ResourceRegistry) -> &mut Category<Self>;
}

fn hash_raw(handles: &[u64]) -> u64 {
    let mut hasher = DefaultHasher::new();
    handles.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
pub struct BufferRecord {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub name: String,
}

#[derive(Debug)]
pub struct ImageRecord {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub array_layers: u32,
    pub mip_levels: u32,
    pub name: String,
}

#[derive(Debug)]
pub struct ImageViewRecord {
    pub view: vk::ImageView,
}

#[derive(Debug)]
pub struct ShaderModuleRecord {
    pub module: vk::ShaderModule,
}

#[derive(Debug)]
pub struct PipelineRecord {
    pub pipeline: vk::Pipeline,
    pub bind_point: vk::PipelineBindPoint,
}

#[derive(Debug)]
pub struct PipelineLayoutRecord {
    pub layout: vk::PipelineLayout,
}

#[derive(Debug)]
pub struct DescriptorPoolRecord {
    pub pool: vk::DescriptorPool,
}

#[derive(Debug)]
pub struct DescriptorSetLayoutRecord {
    pub layout: vk::DescriptorSetLayout,
}

#[derive(Debug)]
pub struct SamplerRecord {
    pub sampler: vk::Sampler,
}

macro_rules! registry_resource {
    ($record:ty, $kind:ident, $field:ident, [$($handle:ident),+], |$this:ident, $device:ident| $destroy:expr) => {
        impl RegistryResource for $record {
            const KIND: ObjectKind = ObjectKind::$kind;

            fn structural_hash(&self) -> u64 {
                hash_raw(&[$(self.$handle.as_raw()),+])
            }

            fn destroy(&mut self, device: &dyn GpuDevice) {
                let $device = device;
                let $this = self;
                $destroy
            }

            fn category(registry: &ResourceRegistry) -> &Category<Self> {
                &registry.$field
            }

            fn category_mut(registry: &mut ResourceRegistry) -> &mut Category<Self> {
                &mut registry.$field
            }
        }
    };
}

registry_resource!(BufferRecord, Buffer, buffers, [buffer, memory], |this, device| {
    let buffer = std::mem::take(&mut this.buffer);
    let memory = std::mem::take(&mut this.memory);
    if buffer != vk::Buffer::null() {
        device.destroy_buffer(buffer, memory);
    }
});
registry_resource!(ImageRecord, Image, images, [image, memory], |this, device| {
    let image = std::mem::take(&mut this.image);
    let memory = std::mem::take(&mut this.memory);
    if image != vk::Image::null() {
        device.destroy_image(image, memory);
    }
});
registry_resource!(ImageViewRecord, ImageView, image_views, [view], |this, device| {
    let view = std::mem::take(&mut this.view);
    if view != vk::ImageView::null() {
        device.destroy_image_view(view);
    }
});
registry_resource!(ShaderModuleRecord, ShaderModule, shader_modules, [module], |this, device| {
    let module = std::mem::take(&mut this.module);
    if module != vk::ShaderModule::null() {
        device.destroy_shader_module(module);
    }
});
registry_resource!(PipelineRecord, Pipeline, pipelines, [pipeline], |this, device| {
    let pipeline = std::mem::take(&mut this.pipeline);
    if pipeline != vk::Pipeline::null() {
        device.destroy_pipeline(pipeline);
    }
});
registry_resource!(PipelineLayoutRecord, PipelineLayout, pipeline_layouts, [layout], |this, device| {
    let layout = std::mem::take(&mut this.layout);
    if layout != vk::PipelineLayout::null() {
        device.destroy_pipeline_layout(layout);
    }
});
registry_resource!(DescriptorPoolRecord, DescriptorPool, descriptor_pools, [pool], |this, device| {
    let pool = std::mem::take(&mut this.pool);
    if pool != vk::DescriptorPool::null() {
        device.destroy_descriptor_pool(pool);
    }
});
registry_resource!(DescriptorSetLayoutRecord, DescriptorSetLayout, descriptor_set_layouts, [layout], |this, device| {
    let layout = std::mem::take(&mut this.layout);
    if layout != vk::DescriptorSetLayout::null() {
        device.destroy_descriptor_set_layout(layout);
    }
});
registry_resource!(SamplerRecord, Sampler, samplers, [sampler], |this, device| {
    let sampler = std::mem::take(&mut this.sampler);
    if sampler != vk::Sampler::null() {
        device.destroy_sampler(sampler);
    }
});

/// One resource category: the arena plus the structural-hash index.
pub struct Category<T> {
    arena: Arena<T>,
    by_hash: HashMap<u64, GenerationalId>,
}

impl<T> Default for Category<T> {
    fn default() -> Self {
        Self {
            arena: Arena::new(),
            by_hash: HashMap::new(),
        }
    }
}

impl<T> Category<T> {
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

/// Registry of every live GPU object created through a [`DeviceContext`](super::DeviceContext).
///
/// Not reference counted: callers must not destroy a resource a pending command buffer still
/// uses. Retire it through a [`DeletionQueue`](crate::vulkan::DeletionQueue) instead.
pub struct ResourceRegistry {
    device: Arc<dyn GpuDevice>,
    buffers: Category<BufferRecord>,
    images: Category<ImageRecord>,
    image_views: Category<ImageViewRecord>,
    shader_modules: Category<ShaderModuleRecord>,
    pipelines: Category<PipelineRecord>,
    pipeline_layouts: Category<PipelineLayoutRecord>,
    descriptor_pools: Category<DescriptorPoolRecord>,
    descriptor_set_layouts: Category<DescriptorSetLayoutRecord>,
    samplers: Category<SamplerRecord>,
}

impl ResourceRegistry {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            buffers: Category::default(),
            images: Category::default(),
            image_views: Category::default(),
            shader_modules: Category::default(),
            pipelines: Category::default(),
            pipeline_layouts: Category::default(),
            descriptor_pools: Category::default(),
            descriptor_set_layouts: Category::default(),
            samplers: Category::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    /// Registers a record. Re-registering the same native handle(s) overwrites the entry and
    /// returns the existing handle.
    pub fn add<T: RegistryResource>(&mut self, record: T) -> Handle<T> {
        let hash = record.structural_hash();
        let category = T::category_mut(self);

        if let Some(&id) = category.by_hash.get(&hash) {
            if let Some(existing) = category.arena.get_mut(id) {
                trace!("[Registry] {:?} re-registered, overwriting entry {}", T::KIND, id.index);
                *existing = record;
                return Handle::new(id);
            }
        }

        let id = category.arena.insert(record);
        category.by_hash.insert(hash, id);
        trace!("[Registry] {:?} added as {}v{}", T::KIND, id.index, id.generation);
        Handle::new(id)
    }

    pub fn get<T: RegistryResource>(&self, handle: Handle<T>) -> Result<&T> {
        T::category(self)
            .arena
            .get(handle.id)
            .ok_or_else(|| stale::<T>(handle))
    }

    pub fn contains<T: RegistryResource>(&self, handle: Handle<T>) -> bool {
        T::category(self).arena.is_valid(handle.id)
    }

    /// Removes the entry, nulls its handles and frees them natively.
    ///
    /// A stale or unknown handle is reported as [`RenderError::StaleHandle`]; the registry
    /// is unchanged in that case, so repeating a destroy never double-frees.
    pub fn destroy<T: RegistryResource>(&mut self, handle: Handle<T>) -> Result<()> {
        let device = Arc::clone(&self.device);
        let category = T::category_mut(self);
        let Some(mut record) = category.arena.remove(handle.id) else {
            debug!("[Registry] Ignoring destroy of stale {:?} {handle:?}", T::KIND);
            return Err(stale::<T>(handle));
        };
        category.by_hash.remove(&record.structural_hash());
        record.destroy(device.as_ref());
        Ok(())
    }

    /// Destroys every live entry of one category. Returns how many were destroyed.
    pub fn destroy_all<T: RegistryResource>(&mut self) -> usize {
        let device = Arc::clone(&self.device);
        let category = T::category_mut(self);
        category.by_hash.clear();
        let drained = category.arena.drain();
        let count = drained.len();
        for (_, mut record) in drained {
            record.destroy(device.as_ref());
        }
        if count > 0 {
            debug!("[Registry] Destroyed {count} {:?} entries", T::KIND);
        }
        count
    }

    pub fn len<T: RegistryResource>(&self) -> usize {
        T::category(self).len()
    }

    /// Live entries of a category, by kind. Kinds the registry does not own report zero.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Buffer => self.buffers.len(),
            ObjectKind::Image => self.images.len(),
            ObjectKind::ImageView => self.image_views.len(),
            ObjectKind::ShaderModule => self.shader_modules.len(),
            ObjectKind::Pipeline => self.pipelines.len(),
            ObjectKind::PipelineLayout => self.pipeline_layouts.len(),
            ObjectKind::DescriptorPool => self.descriptor_pools.len(),
            ObjectKind::DescriptorSetLayout => self.descriptor_set_layouts.len(),
            ObjectKind::Sampler => self.samplers.len(),
            ObjectKind::Fence | ObjectKind::Semaphore | ObjectKind::CommandPool => 0,
        }
    }

    pub fn total_live(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.image_views.len()
            + self.shader_modules.len()
            + self.pipelines.len()
            + self.pipeline_layouts.len()
            + self.descriptor_pools.len()
            + self.descriptor_set_layouts.len()
            + self.samplers.len()
    }

    pub fn add_buffer(
        &mut self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        size: u64,
        name: impl Into<String>,
    ) -> Handle<BufferRecord> {
        self.add(BufferRecord {
            buffer,
            memory,
            size,
            name: name.into(),
        })
    }

    pub fn add_image(&mut self, record: ImageRecord) -> Handle<ImageRecord> {
        self.add(record)
    }

    pub fn add_image_view(&mut self, view: vk::ImageView) -> Handle<ImageViewRecord> {
        self.add(ImageViewRecord { view })
    }

    pub fn add_shader_module(&mut self, module: vk::ShaderModule) -> Handle<ShaderModuleRecord> {
        self.add(ShaderModuleRecord { module })
    }

    pub fn add_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        bind_point: vk::PipelineBindPoint,
    ) -> Handle<PipelineRecord> {
        self.add(PipelineRecord {
            pipeline,
            bind_point,
        })
    }

    pub fn add_pipeline_layout(&mut self, layout: vk::PipelineLayout) -> Handle<PipelineLayoutRecord> {
        self.add(PipelineLayoutRecord { layout })
    }

    pub fn add_descriptor_pool(&mut self, pool: vk::DescriptorPool) -> Handle<DescriptorPoolRecord> {
        self.add(DescriptorPoolRecord { pool })
    }

    pub fn add_descriptor_set_layout(
        &mut self,
        layout: vk::DescriptorSetLayout,
    ) -> Handle<DescriptorSetLayoutRecord> {
        self.add(DescriptorSetLayoutRecord { layout })
    }

    pub fn add_sampler(&mut self, sampler: vk::Sampler) -> Handle<SamplerRecord> {
        self.add(SamplerRecord { sampler })
    }

    pub fn destroy_buffer(&mut self, handle: Handle<BufferRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_image(&mut self, handle: Handle<ImageRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_image_view(&mut self, handle: Handle<ImageViewRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_shader_module(&mut self, handle: Handle<ShaderModuleRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_pipeline(&mut self, handle: Handle<PipelineRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_pipeline_layout(&mut self, handle: Handle<PipelineLayoutRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_descriptor_pool(&mut self, handle: Handle<DescriptorPoolRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_descriptor_set_layout(
        &mut self,
        handle: Handle<DescriptorSetLayoutRecord>,
    ) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_sampler(&mut self, handle: Handle<SamplerRecord>) -> Result<()> {
        self.destroy(handle)
    }

    pub fn destroy_all_buffers(&mut self) -> usize {
        self.destroy_all::<BufferRecord>()
    }

    pub fn destroy_all_images(&mut self) -> usize {
        self.destroy_all::<ImageRecord>()
    }

    pub fn destroy_all_image_views(&mut self) -> usize {
        self.destroy_all::<ImageViewRecord>()
    }

    pub fn destroy_all_shader_modules(&mut self) -> usize {
        self.destroy_all::<ShaderModuleRecord>()
    }

    pub fn destroy_all_pipelines(&mut self) -> usize {
        self.destroy_all::<PipelineRecord>()
    }

    pub fn destroy_all_pipeline_layouts(&mut self) -> usize {
        self.destroy_all::<PipelineLayoutRecord>()
    }

    pub fn destroy_all_descriptor_pools(&mut self) -> usize {
        self.destroy_all::<DescriptorPoolRecord>()
    }

    pub fn destroy_all_descriptor_set_layouts(&mut self) -> usize {
        self.destroy_all::<DescriptorSetLayoutRecord>()
    }

    pub fn destroy_all_samplers(&mut self) -> usize {
        self.destroy_all::<SamplerRecord>()
    }

    /// Bulk teardown of every category in a fixed order: buffers, images, image views,
    /// shader modules, pipelines, pipeline layouts, descriptor pools, descriptor set layouts,
    /// samplers.
    pub fn destroy_all_resources(&mut self) -> usize {
        let total = self.destroy_all_buffers()
            + self.destroy_all_images()
            + self.destroy_all_image_views()
            + self.destroy_all_shader_modules()
            + self.destroy_all_pipelines()
            + self.destroy_all_pipeline_layouts()
            + self.destroy_all_descriptor_pools()
            + self.destroy_all_descriptor_set_layouts()
            + self.destroy_all_samplers();
        if total > 0 {
            info!("[Registry] Destroyed {total} resources");
        }
        total
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        let live = self.total_live();
        if live > 0 {
            warn!("[Registry] Dropped with {live} live resources; destroying them now");
            self.destroy_all_resources();
        }
    }
}

fn stale<T: RegistryResource>(handle: Handle<T>) -> RenderError {
    RenderError::StaleHandle {
        kind: T::KIND,
        index: handle.id.index,
        generation: handle.id.generation,
    }
}
