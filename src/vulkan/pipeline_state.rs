use ash::vk;

use super::device::{full_scissor, full_viewport, GpuDevice};

/// Constant, clamp and slope factors for rasterizer depth bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub clamp: f32,
    pub slope: f32,
}

impl DepthBias {
    /// Values used for the cascade depth pass.
    pub fn shadow() -> Self {
        Self {
            constant: 1.25,
            clamp: 0.0,
            slope: 1.75,
        }
    }
}

/// Dynamic state applied alongside a graphics pipeline each time it is bound.
///
/// Viewport and scissor default to the full render extent when not overridden.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    depth_bias: Option<DepthBias>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_viewport(mut self, viewport: vk::Viewport) -> Self {
        self.viewport = Some(viewport);
        self
    }

    pub fn with_scissor(mut self, scissor: vk::Rect2D) -> Self {
        self.scissor = Some(scissor);
        self
    }

    pub fn with_depth_bias(mut self, bias: DepthBias) -> Self {
        self.depth_bias = Some(bias);
        self
    }

    pub fn set_depth_bias(&mut self, bias: Option<DepthBias>) {
        self.depth_bias = bias;
    }

    pub fn depth_bias(&self) -> Option<DepthBias> {
        self.depth_bias
    }

    pub fn apply(&self, device: &dyn GpuDevice, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        device.cmd_set_viewport_scissor(
            cmd,
            self.viewport.unwrap_or_else(|| full_viewport(extent)),
            self.scissor.unwrap_or_else(|| full_scissor(extent)),
        );
        if let Some(bias) = self.depth_bias {
            device.cmd_set_depth_bias(cmd, bias.constant, bias.clamp, bias.slope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{DeviceCall, HeadlessDevice};

    #[test]
    fn depth_bias_is_only_set_when_configured() {
        let device = HeadlessDevice::default();
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        PipelineState::new().apply(&device, vk::CommandBuffer::null(), extent);
        assert_eq!(device.calls(), vec![DeviceCall::SetViewportScissor]);

        device.clear_calls();
        let state = PipelineState::new().with_depth_bias(DepthBias::shadow());
        assert_eq!(state.depth_bias(), Some(DepthBias::shadow()));
        state.apply(&device, vk::CommandBuffer::null(), extent);
        assert_eq!(
            device.calls(),
            vec![DeviceCall::SetViewportScissor, DeviceCall::SetDepthBias]
        );
    }

    #[test]
    fn cloned_state_keeps_overrides() {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 4, y: 4 },
            extent: vk::Extent2D {
                width: 8,
                height: 8,
            },
        };
        let mut state = PipelineState::new().with_scissor(scissor);
        state.set_depth_bias(Some(DepthBias::shadow()));
        let copy = state.clone();
        assert_eq!(copy.scissor, Some(scissor));
        assert_eq!(copy.depth_bias(), state.depth_bias());
    }
}
