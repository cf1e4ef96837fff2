//! GPU-less device backend.
//!
//! Hands out fabricated handles, emulates host-visible buffer memory and fences, and keeps a
//! log of every call so callers can assert on ordering (fence waits before reuse, barriers
//! before sampling, exactly-once destruction).

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::device::{
    AcquiredImage, BufferDesc, DescriptorWrite, GpuDevice, GraphicsPipelineDesc, ImageBarrier,
    ImageDesc, ImageViewDesc, LoadOp, ObjectKind, RenderingDesc, SamplerDesc, SubmitDesc,
};
use crate::{RenderError, Result};

const SWAP_IMAGE_COUNT: usize = 3;

/// A recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Create { kind: ObjectKind, raw: u64 },
    Destroy { kind: ObjectKind, raw: u64 },
    WriteBuffer { buffer: u64, offset: u64, len: usize },
    UpdateDescriptors { writes: usize },
    WaitFence { fence: u64, signaled: bool },
    ResetFence { fence: u64 },
    BeginCommandBuffer { cmd: u64 },
    EndCommandBuffer { cmd: u64 },
    Submit { cmd: u64, fence: u64 },
    Acquire { index: u32 },
    Present { index: u32 },
    WaitIdle,
    Barrier {
        image: u64,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BeginRendering {
        color: Vec<u64>,
        depth: Option<u64>,
        cleared: bool,
        view_mask: u32,
        layer_count: u32,
    },
    EndRendering,
    BindPipeline { pipeline: u64 },
    BindDescriptorSets { first_set: u32, sets: Vec<u64> },
    PushConstants { size: usize },
    SetViewportScissor,
    SetDepthBias,
    Draw { vertex_count: u32, instance_count: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    Blit { src: u64, dst: u64 },
}

/// Device backend with no GPU behind it.
pub struct HeadlessDevice {
    next_raw: AtomicU64,
    calls: Mutex<Vec<DeviceCall>>,
    live: Mutex<HashMap<u64, ObjectKind>>,
    fences: Mutex<HashMap<u64, bool>>,
    pending_fences: Mutex<Vec<u64>>,
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    deferred_completion: AtomicBool,
    device_lost: AtomicBool,
    fail_submit: AtomicBool,
    swap_images: Vec<vk::Image>,
    next_swap: AtomicU32,
    extent: Mutex<vk::Extent2D>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(vk::Extent2D {
            width: 1280,
            height: 720,
        })
    }
}

impl HeadlessDevice {
    pub fn new(extent: vk::Extent2D) -> Self {
        let next_raw = AtomicU64::new(0x1000);
        let swap_images = (0..SWAP_IMAGE_COUNT)
            .map(|_| vk::Image::from_raw(next_raw.fetch_add(1, Ordering::Relaxed)))
            .collect();
        Self {
            next_raw,
            calls: Mutex::new(Vec::new()),
            live: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            pending_fences: Mutex::new(Vec::new()),
            memory: Mutex::new(HashMap::new()),
            deferred_completion: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            swap_images,
            next_swap: AtomicU32::new(0),
            extent: Mutex::new(extent),
        }
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// How many times `raw` was destroyed as `kind`.
    pub fn destroy_count(&self, kind: ObjectKind, raw: u64) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, DeviceCall::Destroy { kind: k, raw: r } if *k == kind && *r == raw))
            .count()
    }

    /// Number of objects of `kind` created and not yet destroyed.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.live.lock().values().filter(|k| **k == kind).count()
    }

    pub fn swap_images(&self) -> &[vk::Image] {
        &self.swap_images
    }

    /// When enabled, submissions leave their fence unsignaled until
    /// [`complete_submissions`](Self::complete_submissions) is called.
    pub fn set_deferred_completion(&self, deferred: bool) {
        self.deferred_completion.store(deferred, Ordering::SeqCst);
    }

    /// Signals every fence whose submission is still pending.
    pub fn complete_submissions(&self) {
        let pending: Vec<u64> = self.pending_fences.lock().drain(..).collect();
        let mut fences = self.fences.lock();
        for fence in pending {
            fences.insert(fence, true);
        }
    }

    /// Makes every subsequent wait and submit report a lost device.
    pub fn lose_device(&self) {
        self.device_lost.store(true, Ordering::SeqCst);
    }

    /// Makes the next submit fail with `ERROR_OUT_OF_DEVICE_MEMORY` without executing.
    pub fn fail_next_submit(&self) {
        self.fail_submit.store(true, Ordering::SeqCst);
    }

    pub fn set_extent(&self, extent: vk::Extent2D) {
        *self.extent.lock() = extent;
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.memory.lock().get(&buffer.as_raw()).cloned()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().push(call);
    }

    fn create_raw(&self, kind: ObjectKind) -> u64 {
        let raw = self.next_raw.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(raw, kind);
        self.record(DeviceCall::Create { kind, raw });
        raw
    }

    fn destroy_raw(&self, kind: ObjectKind, raw: u64) {
        if raw == 0 {
            return;
        }
        self.live.lock().remove(&raw);
        self.record(DeviceCall::Destroy { kind, raw });
    }

    fn fabricate_memory(&self) -> vk::DeviceMemory {
        vk::DeviceMemory::from_raw(self.next_raw.fetch_add(1, Ordering::Relaxed))
    }

    fn check_device(&self) -> Result<()> {
        if self.device_lost.load(Ordering::SeqCst) {
            return Err(RenderError::DeviceLost);
        }
        Ok(())
    }
}

impl GpuDevice for HeadlessDevice {
    fn name(&self) -> &str {
        "headless"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(vk::Buffer, vk::DeviceMemory)> {
        if desc.size == 0 {
            return Err(RenderError::vulkan(
                "create_buffer",
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        let raw = self.create_raw(ObjectKind::Buffer);
        self.memory.lock().insert(raw, vec![0; desc.size as usize]);
        Ok((vk::Buffer::from_raw(raw), self.fabricate_memory()))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _memory: vk::DeviceMemory) {
        self.memory.lock().remove(&buffer.as_raw());
        self.destroy_raw(ObjectKind::Buffer, buffer.as_raw());
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut memory = self.memory.lock();
        let bytes = memory
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RenderError::vulkan("write_buffer", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > bytes.len() {
            return Err(RenderError::vulkan(
                "write_buffer",
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ));
        }
        bytes[start..end].copy_from_slice(data);
        drop(memory);
        self.record(DeviceCall::WriteBuffer {
            buffer: buffer.as_raw(),
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Result<Vec<u8>> {
        let memory = self.memory.lock();
        let bytes = memory
            .get(&buffer.as_raw())
            .ok_or_else(|| RenderError::vulkan("read_buffer", vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let start = offset as usize;
        bytes
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| RenderError::vulkan("read_buffer", vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<(vk::Image, vk::DeviceMemory)> {
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(RenderError::vulkan(
                "create_image",
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        let raw = self.create_raw(ObjectKind::Image);
        Ok((vk::Image::from_raw(raw), self.fabricate_memory()))
    }

    fn destroy_image(&self, image: vk::Image, _memory: vk::DeviceMemory) {
        self.destroy_raw(ObjectKind::Image, image.as_raw());
    }

    fn create_image_view(&self, _desc: &ImageViewDesc) -> Result<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.create_raw(ObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy_raw(ObjectKind::ImageView, view.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.create_raw(ObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy_raw(ObjectKind::Sampler, sampler.as_raw());
    }

    fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RenderError::vulkan(
                "create_shader_module",
                vk::Result::ERROR_INVALID_SHADER_NV,
            ));
        }
        Ok(vk::ShaderModule::from_raw(
            self.create_raw(ObjectKind::ShaderModule),
        ))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.destroy_raw(ObjectKind::ShaderModule, module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding<'static>],
        _binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.create_raw(ObjectKind::DescriptorSetLayout),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.destroy_raw(ObjectKind::DescriptorSetLayout, layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
        _update_after_bind: bool,
    ) -> Result<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(
            self.create_raw(ObjectKind::DescriptorPool),
        ))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.destroy_raw(ObjectKind::DescriptorPool, pool.as_raw());
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
        _variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet> {
        // Sets are freed with their pool, so they are not tracked as live objects.
        Ok(vk::DescriptorSet::from_raw(
            self.next_raw.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.record(DeviceCall::UpdateDescriptors {
            writes: writes.len(),
        });
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(
            self.create_raw(ObjectKind::PipelineLayout),
        ))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.destroy_raw(ObjectKind::PipelineLayout, layout.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        _layout: vk::PipelineLayout,
        stages: &[(vk::ShaderStageFlags, vk::ShaderModule)],
    ) -> Result<vk::Pipeline> {
        if stages.is_empty() || (desc.color_formats.is_empty() && desc.depth_format == vk::Format::UNDEFINED) {
            return Err(RenderError::vulkan(
                "create_graphics_pipelines",
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        Ok(vk::Pipeline::from_raw(self.create_raw(ObjectKind::Pipeline)))
    }

    fn create_compute_pipeline(
        &self,
        _layout: vk::PipelineLayout,
        _module: vk::ShaderModule,
    ) -> Result<vk::Pipeline> {
        Ok(vk::Pipeline::from_raw(self.create_raw(ObjectKind::Pipeline)))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.destroy_raw(ObjectKind::Pipeline, pipeline.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let raw = self.create_raw(ObjectKind::Fence);
        self.fences.lock().insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.lock().remove(&fence.as_raw());
        self.destroy_raw(ObjectKind::Fence, fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<bool> {
        self.check_device()?;
        let signaled = self
            .fences
            .lock()
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false);
        self.record(DeviceCall::WaitFence {
            fence: fence.as_raw(),
            signaled,
        });
        Ok(signaled)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.fences.lock().insert(fence.as_raw(), false);
        self.record(DeviceCall::ResetFence {
            fence: fence.as_raw(),
        });
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.create_raw(ObjectKind::Semaphore)))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy_raw(ObjectKind::Semaphore, semaphore.as_raw());
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(
            self.create_raw(ObjectKind::CommandPool),
        ))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy_raw(ObjectKind::CommandPool, pool.as_raw());
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        Ok(vk::CommandBuffer::from_raw(
            self.next_raw.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(DeviceCall::BeginCommandBuffer { cmd: cmd.as_raw() });
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(DeviceCall::EndCommandBuffer { cmd: cmd.as_raw() });
        Ok(())
    }

    fn submit(&self, submit: &SubmitDesc) -> Result<()> {
        self.check_device()?;
        if self.fail_submit.swap(false, Ordering::SeqCst) {
            return Err(RenderError::vulkan(
                "queue_submit",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        let fence = submit.fence.as_raw();
        self.record(DeviceCall::Submit {
            cmd: submit.command_buffer.as_raw(),
            fence,
        });
        if fence != 0 {
            if self.deferred_completion.load(Ordering::SeqCst) {
                self.pending_fences.lock().push(fence);
            } else {
                self.fences.lock().insert(fence, true);
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.check_device()?;
        self.record(DeviceCall::WaitIdle);
        if !self.deferred_completion.load(Ordering::SeqCst) {
            self.complete_submissions();
        }
        Ok(())
    }

    fn acquire_next_image(&self, _signal: vk::Semaphore) -> Result<AcquiredImage> {
        self.check_device()?;
        let index = self.next_swap.fetch_add(1, Ordering::Relaxed) % SWAP_IMAGE_COUNT as u32;
        self.record(DeviceCall::Acquire { index });
        Ok(AcquiredImage {
            index,
            image: self.swap_images[index as usize],
            extent: *self.extent.lock(),
            suboptimal: false,
        })
    }

    fn present(&self, image_index: u32, _wait: vk::Semaphore) -> Result<bool> {
        self.check_device()?;
        self.record(DeviceCall::Present { index: image_index });
        Ok(false)
    }

    fn resize_present_target(&self, extent: vk::Extent2D) -> Result<()> {
        self.set_extent(extent);
        Ok(())
    }

    fn cmd_image_barriers(&self, _cmd: vk::CommandBuffer, barriers: &[ImageBarrier]) {
        let mut calls = self.calls.lock();
        for barrier in barriers {
            calls.push(DeviceCall::Barrier {
                image: barrier.image.as_raw(),
                old_layout: barrier.src.layout,
                new_layout: barrier.dst.layout,
            });
        }
    }

    fn cmd_begin_rendering(&self, _cmd: vk::CommandBuffer, desc: &RenderingDesc) {
        let cleared = desc
            .color
            .iter()
            .any(|target| matches!(target.load, LoadOp::Clear(_)))
            || desc
                .depth
                .map(|depth| matches!(depth.load, LoadOp::Clear(_)))
                .unwrap_or(false);
        self.record(DeviceCall::BeginRendering {
            color: desc.color.iter().map(|target| target.view.as_raw()).collect(),
            depth: desc.depth.map(|depth| depth.view.as_raw()),
            cleared,
            view_mask: desc.view_mask,
            layer_count: desc.layer_count,
        });
    }

    fn cmd_end_rendering(&self, _cmd: vk::CommandBuffer) {
        self.record(DeviceCall::EndRendering);
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(DeviceCall::BindPipeline {
            pipeline: pipeline.as_raw(),
        });
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(DeviceCall::BindDescriptorSets {
            first_set,
            sets: sets.iter().map(|set| set.as_raw()).collect(),
        });
    }

    fn cmd_push_constants(
        &self,
        _cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        data: &[u8],
    ) {
        self.record(DeviceCall::PushConstants { size: data.len() });
    }

    fn cmd_set_viewport_scissor(
        &self,
        _cmd: vk::CommandBuffer,
        _viewport: vk::Viewport,
        _scissor: vk::Rect2D,
    ) {
        self.record(DeviceCall::SetViewportScissor);
    }

    fn cmd_set_depth_bias(&self, _cmd: vk::CommandBuffer, _constant: f32, _clamp: f32, _slope: f32) {
        self.record(DeviceCall::SetDepthBias);
    }

    fn cmd_draw(
        &self,
        _cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(DeviceCall::Draw {
            vertex_count,
            instance_count,
        });
    }

    fn cmd_dispatch(&self, _cmd: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(DeviceCall::Dispatch { x, y, z });
    }

    fn cmd_blit_image(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Image,
        _src_extent: vk::Extent2D,
        dst: vk::Image,
        _dst_extent: vk::Extent2D,
    ) {
        self.record(DeviceCall::Blit {
            src: src.as_raw(),
            dst: dst.as_raw(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::MemoryLocation;

    fn host_buffer(device: &HeadlessDevice, size: u64) -> vk::Buffer {
        device
            .create_buffer(&BufferDesc {
                size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: "test".into(),
            })
            .unwrap()
            .0
    }

    #[test]
    fn buffer_writes_round_trip() {
        let device = HeadlessDevice::default();
        let buffer = host_buffer(&device, 16);
        device.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(device.read_buffer(buffer, 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(device.write_buffer(buffer, 14, &[0; 4]).is_err());
    }

    #[test]
    fn deferred_completion_holds_fences() {
        let device = HeadlessDevice::default();
        let fence = device.create_fence(false).unwrap();
        device.set_deferred_completion(true);
        device
            .submit(&SubmitDesc {
                command_buffer: vk::CommandBuffer::from_raw(1),
                wait: None,
                signal: None,
                fence,
            })
            .unwrap();
        assert!(!device.wait_for_fence(fence, 1).unwrap());
        device.complete_submissions();
        assert!(device.wait_for_fence(fence, 1).unwrap());
    }

    #[test]
    fn lost_device_fails_waits() {
        let device = HeadlessDevice::default();
        let fence = device.create_fence(true).unwrap();
        device.lose_device();
        assert!(matches!(
            device.wait_for_fence(fence, 1),
            Err(RenderError::DeviceLost)
        ));
    }

    #[test]
    fn tracks_live_objects() {
        let device = HeadlessDevice::default();
        let sampler = device.create_sampler(&SamplerDesc::linear_clamp()).unwrap();
        assert_eq!(device.live_count(ObjectKind::Sampler), 1);
        device.destroy_sampler(sampler);
        assert_eq!(device.live_count(ObjectKind::Sampler), 0);
        assert_eq!(device.destroy_count(ObjectKind::Sampler, sampler.as_raw()), 1);
    }
}
