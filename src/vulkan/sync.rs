//! Double-buffered frame slots and their CPU/GPU synchronization.
//!
//! Each slot moves through [`SlotState::Retired`] → [`SlotState::Recording`] →
//! [`SlotState::Submitted`] and back. A slot is only re-recorded after its previous
//! submission's fence has signaled; both fences start signaled so the first
//! [`FRAMES_IN_FLIGHT`] frames never stall.

use ash::vk;
use std::sync::Arc;

use super::deletion_queue::DeletionQueue;
use super::device::{AcquiredImage, GpuDevice, SubmitDesc};
use crate::config::FRAMES_IN_FLIGHT;
use crate::renderer::ResourceRegistry;
use crate::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The CPU is building this slot's command buffer.
    Recording,
    /// Submitted; the GPU may still be executing it.
    Submitted,
    /// Fence signaled, eligible for reuse.
    Retired,
}

/// Recording resources and completion signals of one in-flight frame.
pub struct FrameSlot {
    index: usize,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
    state: SlotState,
    /// Recording began and the command buffer has not been ended yet.
    commands_open: bool,
    /// The fence was reset but no submission will ever signal it.
    fence_orphaned: bool,
    deletion_queue: DeletionQueue,
}

impl FrameSlot {
    fn new(device: &dyn GpuDevice, index: usize) -> Result<Self> {
        let command_pool = device.create_command_pool()?;
        let command_buffer = device.allocate_command_buffer(command_pool)?;
        Ok(Self {
            index,
            command_pool,
            command_buffer,
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
            state: SlotState::Retired,
            commands_open: false,
            fence_orphaned: false,
            deletion_queue: DeletionQueue::new(format!("frame_slot_{index}")),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn deletion_queue(&self) -> &DeletionQueue {
        &self.deletion_queue
    }

    fn destroy(&mut self, device: &dyn GpuDevice) {
        device.destroy_semaphore(std::mem::take(&mut self.image_available));
        device.destroy_semaphore(std::mem::take(&mut self.render_finished));
        device.destroy_fence(std::mem::take(&mut self.in_flight));
        device.destroy_command_pool(std::mem::take(&mut self.command_pool));
        self.command_buffer = vk::CommandBuffer::null();
    }
}

/// The frame slots plus the running frame counter. The active slot is always
/// `frame_count % FRAMES_IN_FLIGHT`.
pub struct FrameContext {
    device: Arc<dyn GpuDevice>,
    slots: Vec<FrameSlot>,
    frame_count: u64,
    timeout_ns: u64,
}

impl FrameContext {
    pub fn new(device: Arc<dyn GpuDevice>, timeout_ns: u64) -> Result<Self> {
        let slots = (0..FRAMES_IN_FLIGHT)
            .map(|index| FrameSlot::new(device.as_ref(), index))
            .collect::<Result<Vec<_>>>()?;
        log::info!("[FrameSync] {} frame slots created", slots.len());
        Ok(Self {
            device,
            slots,
            frame_count: 0,
            timeout_ns,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn current_index(&self) -> usize {
        (self.frame_count % FRAMES_IN_FLIGHT as u64) as usize
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current_index()]
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn current_deletion_queue(&self) -> &DeletionQueue {
        &self.current_slot().deletion_queue
    }

    /// Blocks on the current slot's fence, flushes the slot's retired resources and begins
    /// recording. Returns the slot's command buffer.
    pub fn begin_frame(&mut self, registry: &mut ResourceRegistry) -> Result<vk::CommandBuffer> {
        let index = self.current_index();
        let timeout_ns = self.timeout_ns;
        let device = Arc::clone(&self.device);
        let slot = &mut self.slots[index];

        if slot.state != SlotState::Recording {
            let signaled = device.wait_for_fence(slot.in_flight, timeout_ns)?;
            if !signaled {
                log::error!("[FrameSync] Slot {index} fence timed out after {timeout_ns} ns");
                return Err(RenderError::FenceTimeout {
                    slot: index,
                    timeout_ns,
                });
            }
            slot.state = SlotState::Retired;
            slot.deletion_queue.flush(registry);
        }

        device.begin_command_buffer(slot.command_buffer)?;
        slot.state = SlotState::Recording;
        slot.commands_open = true;
        log::trace!("[FrameSync] Frame {} recording in slot {index}", self.frame_count);
        Ok(slot.command_buffer)
    }

    /// Acquires the next presentation image, signaling the slot's `image_available`.
    pub fn acquire_image(&self) -> Result<AcquiredImage> {
        self.device
            .acquire_next_image(self.current_slot().image_available)
    }

    /// Ends recording, resets the slot fence and submits. `waits_on_image` makes the
    /// submission wait for [`acquire_image`](Self::acquire_image)'s signal.
    ///
    /// On failure the slot stays `Recording`; call [`abandon_frame`](Self::abandon_frame)
    /// to make it reusable.
    pub fn submit(&mut self, waits_on_image: bool) -> Result<()> {
        let index = self.current_index();
        let device = Arc::clone(&self.device);
        let slot = &mut self.slots[index];
        if slot.state != SlotState::Recording {
            return Err(RenderError::PassOrder(format!(
                "slot {index} submitted while {:?}",
                slot.state
            )));
        }

        slot.commands_open = false;
        device.end_command_buffer(slot.command_buffer)?;
        slot.fence_orphaned = true;
        device.reset_fence(slot.in_flight)?;
        device.submit(&SubmitDesc {
            command_buffer: slot.command_buffer,
            wait: waits_on_image.then_some((
                slot.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )),
            signal: waits_on_image.then_some(slot.render_finished),
            fence: slot.in_flight,
        })?;
        slot.fence_orphaned = false;
        slot.state = SlotState::Submitted;
        Ok(())
    }

    /// Presents `image_index` once the current slot's rendering has finished.
    pub fn present(&self, image_index: u32) -> Result<bool> {
        self.device
            .present(image_index, self.current_slot().render_finished)
    }

    /// Drops an in-progress recording without submitting so the slot is immediately
    /// reusable. A fence reset by a failed [`submit`](Self::submit) is replaced with a
    /// signaled one; otherwise the next wait on it could never complete.
    pub fn abandon_frame(&mut self) -> Result<()> {
        let index = self.current_index();
        let device = Arc::clone(&self.device);
        let slot = &mut self.slots[index];
        if slot.state != SlotState::Recording {
            return Ok(());
        }
        if slot.commands_open {
            slot.commands_open = false;
            device.end_command_buffer(slot.command_buffer)?;
        }
        if slot.fence_orphaned {
            device.destroy_fence(std::mem::take(&mut slot.in_flight));
            slot.in_flight = device.create_fence(true)?;
            slot.fence_orphaned = false;
            log::warn!("[FrameSync] Slot {index} fence replaced after a failed submit");
        }
        slot.state = SlotState::Retired;
        log::debug!("[FrameSync] Frame {} abandoned in slot {index}", self.frame_count);
        Ok(())
    }

    /// Moves to the next slot.
    pub fn advance(&mut self) {
        self.frame_count += 1;
    }

    /// Waits for the device to go idle and runs every slot's pending deletions.
    pub fn wait_all(&mut self, registry: &mut ResourceRegistry) -> Result<()> {
        self.device.wait_idle()?;
        for slot in &mut self.slots {
            if slot.state == SlotState::Submitted {
                slot.state = SlotState::Retired;
            }
            slot.deletion_queue.flush(registry);
        }
        Ok(())
    }

    /// Flushes pending deletions and destroys every slot's sync objects.
    pub fn shutdown(&mut self, registry: &mut ResourceRegistry) -> Result<()> {
        let idle = self.wait_all(registry);
        for slot in &mut self.slots {
            slot.destroy(self.device.as_ref());
        }
        self.slots.clear();
        log::info!("[FrameSync] Shut down after {} frames", self.frame_count);
        idle
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        if let Err(err) = self.device.wait_idle() {
            log::error!("[FrameSync] wait_idle failed during drop: {err}");
        }
        for slot in &mut self.slots {
            slot.destroy(self.device.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{DeviceCall, HeadlessDevice, ObjectKind};

    fn setup() -> (Arc<HeadlessDevice>, ResourceRegistry, FrameContext) {
        let device = Arc::new(HeadlessDevice::default());
        let registry = ResourceRegistry::new(device.clone());
        let frames = FrameContext::new(device.clone(), 1_000).unwrap();
        (device, registry, frames)
    }

    #[test]
    fn slots_start_retired_and_cycle() {
        let (_device, mut registry, mut frames) = setup();
        assert!(frames
            .slots
            .iter()
            .all(|slot| slot.state() == SlotState::Retired));

        for frame in 0..5u64 {
            assert_eq!(frames.current_index() as u64, frame % FRAMES_IN_FLIGHT as u64);
            frames.begin_frame(&mut registry).unwrap();
            assert_eq!(frames.current_slot().state(), SlotState::Recording);
            frames.submit(false).unwrap();
            assert_eq!(frames.current_slot().state(), SlotState::Submitted);
            frames.advance();
        }
    }

    #[test]
    fn unsignaled_fence_times_out() {
        let (device, mut registry, mut frames) = setup();
        device.set_deferred_completion(true);
        for _ in 0..FRAMES_IN_FLIGHT {
            frames.begin_frame(&mut registry).unwrap();
            frames.submit(false).unwrap();
            frames.advance();
        }
        assert!(matches!(
            frames.begin_frame(&mut registry),
            Err(RenderError::FenceTimeout { slot: 0, .. })
        ));
        device.complete_submissions();
        assert!(frames.begin_frame(&mut registry).is_ok());
    }

    #[test]
    fn failed_submit_leaves_slot_reusable() {
        let (device, mut registry, mut frames) = setup();
        frames.begin_frame(&mut registry).unwrap();
        let old_fence = frames.current_slot().in_flight;
        device.fail_next_submit();
        assert!(frames.submit(false).is_err());
        frames.abandon_frame().unwrap();

        let ends = device
            .calls()
            .iter()
            .filter(|call| matches!(call, DeviceCall::EndCommandBuffer { .. }))
            .count();
        assert_eq!(ends, 1);
        assert_ne!(frames.current_slot().in_flight, old_fence);
        assert_eq!(device.live_count(ObjectKind::Fence), FRAMES_IN_FLIGHT);

        frames.begin_frame(&mut registry).unwrap();
        frames.submit(false).unwrap();
    }

    #[test]
    fn submit_requires_recording() {
        let (_device, _registry, mut frames) = setup();
        assert!(matches!(frames.submit(false), Err(RenderError::PassOrder(_))));
    }

    #[test]
    fn shutdown_destroys_sync_objects() {
        let (device, mut registry, mut frames) = setup();
        frames.shutdown(&mut registry).unwrap();
        assert_eq!(device.live_count(ObjectKind::Fence), 0);
        assert_eq!(device.live_count(ObjectKind::Semaphore), 0);
        assert_eq!(device.live_count(ObjectKind::CommandPool), 0);
    }
}
