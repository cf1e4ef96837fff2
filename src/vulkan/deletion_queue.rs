//! LIFO deletion queue for registry resources that may still be referenced by in-flight work.
//!
//! Each frame slot owns one queue, flushed right after that slot's fence is next waited on.
//! The renderer retires into the queue of the most recently submitted slot: that slot's
//! next fence wait covers the last frame that could have used the resource, and every frame
//! recorded after the retirement no longer references it.
//!
//! # Example
//! ```ignore
//! // Between frames; the previous slot submitted the last frame that drew the mesh.
//! frames.slot(previous).unwrap().deletion_queue().retire(old_buffer);
//! // ...next frame on that slot, after its fence wait:
//! // FrameContext::begin_frame flushes the queue into the registry.
//! ```

use parking_lot::Mutex;

use crate::renderer::{Handle, RegistryResource, ResourceRegistry};

type Deletor = Box<dyn FnOnce(&mut ResourceRegistry) + Send>;

/// A queue of deferred registry destroys, run in reverse order of addition.
pub struct DeletionQueue {
    deletors: Mutex<Vec<Deletor>>,
    name: String,
}

impl std::fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("name", &self.name)
            .field("count", &self.len())
            .finish()
    }
}

impl DeletionQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            deletors: Mutex::new(Vec::new()),
            name: name.into(),
        }
    }

    /// Adds a cleanup function, run on the next [`flush`](Self::flush).
    pub fn push<F>(&self, f: F)
    where
        F: FnOnce(&mut ResourceRegistry) + Send + 'static,
    {
        let mut deletors = self.deletors.lock();
        deletors.push(Box::new(f));
        log::trace!(
            "[DeletionQueue] Added to '{}' (now has {} items)",
            self.name,
            deletors.len()
        );
    }

    /// Queues destruction of a registry handle. A handle that is already gone by flush time
    /// is logged and skipped.
    pub fn retire<T>(&self, handle: Handle<T>)
    where
        T: RegistryResource + 'static,
    {
        self.push(move |registry| {
            if let Err(err) = registry.destroy(handle) {
                log::warn!("[DeletionQueue] Retired resource already gone: {err}");
            }
        });
    }

    /// Runs every queued cleanup in LIFO order. Returns how many ran.
    pub fn flush(&self, registry: &mut ResourceRegistry) -> usize {
        let deletors: Vec<Deletor> = std::mem::take(&mut *self.deletors.lock());
        let count = deletors.len();
        if count == 0 {
            return 0;
        }

        log::debug!("[DeletionQueue] Flushing '{}' ({} items)", self.name, count);
        for deletor in deletors.into_iter().rev() {
            deletor(registry);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.deletors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.deletors.lock().is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        let count = self.deletors.get_mut().len();
        if count > 0 {
            // Without registry access the closures cannot run; the registry destroys the
            // underlying objects itself at teardown.
            log::warn!(
                "[DeletionQueue] Dropping '{}' with {} pending operations",
                self.name,
                count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{HeadlessDevice, ObjectKind};
    use ash::vk::{self, Handle as _};
    use std::sync::Arc;

    #[test]
    fn flush_runs_in_lifo_order() {
        let device = Arc::new(HeadlessDevice::default());
        let mut registry = ResourceRegistry::new(device.clone());
        let order = Arc::new(Mutex::new(Vec::new()));
        let queue = DeletionQueue::new("test");

        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.push(move |_| order.lock().push(i));
        }
        assert_eq!(queue.flush(&mut registry), 3);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn retire_destroys_through_registry() {
        let device = Arc::new(HeadlessDevice::default());
        let mut registry = ResourceRegistry::new(device.clone());
        let handle = registry.add_pipeline(vk::Pipeline::from_raw(0x55), vk::PipelineBindPoint::GRAPHICS);

        let queue = DeletionQueue::new("slot0");
        queue.retire(handle);
        assert_eq!(device.destroy_count(ObjectKind::Pipeline, 0x55), 0);
        queue.flush(&mut registry);
        assert_eq!(device.destroy_count(ObjectKind::Pipeline, 0x55), 1);
        assert!(!registry.contains(handle));

        // Retiring twice is harmless.
        queue.retire(handle);
        queue.flush(&mut registry);
        assert_eq!(device.destroy_count(ObjectKind::Pipeline, 0x55), 1);
    }
}
