//! Explicitly constructed device context passed to every component.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::resource_registry::{
    BufferRecord, Handle, ImageRecord, ImageViewRecord, ResourceRegistry, SamplerRecord,
};
use crate::vulkan::{BufferDesc, GpuDevice, ImageDesc, ImageViewDesc, SamplerDesc};
use crate::Result;

/// A device plus the registry that owns every object created on it.
pub struct DeviceContext {
    device: Arc<dyn GpuDevice>,
    registry: ResourceRegistry,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        log::info!("[Context] Created on device '{}'", device.name());
        Self {
            registry: ResourceRegistry::new(Arc::clone(&device)),
            device,
        }
    }

    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }

    pub fn device_arc(&self) -> Arc<dyn GpuDevice> {
        Arc::clone(&self.device)
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Handle<BufferRecord>> {
        let (buffer, memory) = self.device.create_buffer(desc)?;
        Ok(self
            .registry
            .add_buffer(buffer, memory, desc.size, desc.name.clone()))
    }

    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<Handle<ImageRecord>> {
        let (image, memory) = self.device.create_image(desc)?;
        Ok(self.registry.add_image(ImageRecord {
            image,
            memory,
            format: desc.format,
            extent: desc.extent,
            array_layers: desc.array_layers,
            mip_levels: desc.mip_levels,
            name: desc.name.clone(),
        }))
    }

    pub fn create_image_view(&mut self, desc: &ImageViewDesc) -> Result<Handle<ImageViewRecord>> {
        let view = self.device.create_image_view(desc)?;
        Ok(self.registry.add_image_view(view))
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> Result<Handle<SamplerRecord>> {
        let sampler = self.device.create_sampler(desc)?;
        Ok(self.registry.add_sampler(sampler))
    }

    pub fn buffer(&self, handle: Handle<BufferRecord>) -> Result<vk::Buffer> {
        Ok(self.registry.get(handle)?.buffer)
    }

    pub fn buffer_size(&self, handle: Handle<BufferRecord>) -> Result<u64> {
        Ok(self.registry.get(handle)?.size)
    }

    pub fn image(&self, handle: Handle<ImageRecord>) -> Result<&ImageRecord> {
        self.registry.get(handle)
    }

    pub fn image_view(&self, handle: Handle<ImageViewRecord>) -> Result<vk::ImageView> {
        Ok(self.registry.get(handle)?.view)
    }

    pub fn sampler(&self, handle: Handle<SamplerRecord>) -> Result<vk::Sampler> {
        Ok(self.registry.get(handle)?.sampler)
    }

    /// Writes raw bytes into a host-visible buffer.
    pub fn write_buffer(&self, handle: Handle<BufferRecord>, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffer(handle)?;
        self.device.write_buffer(buffer, offset, data)
    }

    /// Uploads a plain-data value at offset zero.
    pub fn upload<T: Pod>(&self, handle: Handle<BufferRecord>, value: &T) -> Result<()> {
        self.write_buffer(handle, 0, bytemuck::bytes_of(value))
    }

    pub fn upload_slice<T: Pod>(&self, handle: Handle<BufferRecord>, values: &[T]) -> Result<()> {
        self.write_buffer(handle, 0, bytemuck::cast_slice(values))
    }

    pub fn read_buffer(&self, handle: Handle<BufferRecord>, offset: u64, len: usize) -> Result<Vec<u8>> {
        let buffer = self.buffer(handle)?;
        self.device.read_buffer(buffer, offset, len)
    }

    /// Waits for the device to go idle and destroys every registered resource.
    pub fn shutdown(&mut self) -> Result<()> {
        let idle = self.device.wait_idle();
        self.registry.destroy_all_resources();
        idle
    }
}
