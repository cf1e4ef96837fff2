//! Error types for the deferred renderer.
//!
//! This module provides a unified error type [`RenderError`] and a convenient [`Result`] alias.

use ash::vk;
use thiserror::Error;

use crate::vulkan::ObjectKind;

/// Main error type for the renderer.
///
/// Device-level failures are returned as values so the host decides how to
/// terminate; [`RenderError::is_fatal`] tells the two classes apart.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A Vulkan API call failed.
    #[error("Vulkan error: {context}: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },
    /// Device or allocator initialization failed.
    #[error("Device init failed: {0}")]
    DeviceInitFailed(String),
    /// The logical device was lost while waiting on or submitting work.
    #[error("GPU device lost")]
    DeviceLost,
    /// A frame slot fence did not signal within the configured timeout.
    #[error("Fence for frame slot {slot} not signaled within {timeout_ns} ns")]
    FenceTimeout { slot: usize, timeout_ns: u64 },
    /// The presentation target is out of date (window resized).
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,
    /// No presentation target has been attached to the device.
    #[error("No presentation target attached")]
    NoPresentTarget,
    /// A registry handle refers to a resource that was already destroyed or never existed.
    #[error("Stale {kind:?} handle (index {index}, generation {generation})")]
    StaleHandle {
        kind: ObjectKind,
        index: usize,
        generation: u32,
    },
    /// A descriptor write targeted a binding the layout never declared.
    #[error("Binding {binding} is not declared in descriptor layout '{layout}'")]
    UndeclaredBinding { binding: u32, layout: String },
    /// A descriptor write used a resource kind that does not match the declared binding.
    #[error("Binding {binding} of layout '{layout}' expects {expected:?}, got {actual:?}")]
    BindingKindMismatch {
        binding: u32,
        layout: String,
        expected: vk::DescriptorType,
        actual: vk::DescriptorType,
    },
    /// A descriptor write addressed an array element past the declared count.
    #[error("Binding {binding} of layout '{layout}' has {count} elements, index {index} is out of range")]
    BindingIndexOutOfRange {
        binding: u32,
        layout: String,
        index: u32,
        count: u32,
    },
    /// A layout declared the same binding index twice.
    #[error("Descriptor layout '{layout}' declares binding {binding} more than once")]
    DuplicateBinding { binding: u32, layout: String },
    /// The bindless texture table is full.
    #[error("Bindless table '{0}' exhausted")]
    BindlessCapacity(String),
    /// A shader binary failed validation before reaching the driver.
    #[error("Invalid shader binary: {0}")]
    InvalidShaderBinary(String),
    /// The external shader compiler reported a failure.
    #[error("Shader compilation failed: {0}")]
    ShaderCompile(String),
    /// A pipeline description was incomplete or inconsistent.
    #[error("Invalid pipeline description: {0}")]
    InvalidPipeline(String),
    /// The pass sequence violates an ordering constraint.
    #[error("Invalid pass order: {0}")]
    PassOrder(String),
    /// Two passes claim to produce the same attachment, or a read has no producer.
    #[error("Attachment conflict: {0}")]
    AttachmentConflict(String),
    /// Invalid renderer configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// An I/O operation failed (shader files, compiler output).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Wraps a raw Vulkan result with the call that produced it.
    pub fn vulkan(context: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            return Self::DeviceLost;
        }
        Self::Vulkan { context, result }
    }

    /// Whether the error leaves the device unusable.
    ///
    /// Fatal errors should be logged and the process terminated; the renderer
    /// never tries to recover from them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Vulkan { .. } | Self::DeviceInitFailed(_) | Self::DeviceLost
        )
    }
}

/// Convenient Result type alias for renderer operations.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::vulkan("create_buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(err.to_string().contains("Vulkan error"));
        assert!(err.to_string().contains("create_buffer"));
    }

    #[test]
    fn device_lost_is_mapped_and_fatal() {
        let err = RenderError::vulkan("wait_for_fences", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, RenderError::DeviceLost));
        assert!(err.is_fatal());
    }

    #[test]
    fn recoverable_errors_are_not_fatal() {
        assert!(!RenderError::ShaderCompile("syntax".into()).is_fatal());
        assert!(!RenderError::FenceTimeout {
            slot: 0,
            timeout_ns: 1
        }
        .is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RenderError = io_err.into();
        assert!(matches!(err, RenderError::Io(_)));
    }
}
