//! Overlay UI composited onto the final image.
//!
//! The host hands over a triangle list with clipped draw commands each frame. Vertices and
//! indices are streamed into the slot's host-visible buffer and pulled by the vertex shader,
//! so no vertex input state is needed.

use ash::vk;
use std::sync::Arc;

use super::{
    color_pass, shader_path, PassRecorder, SharedResources, SET_PASS,
};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT, STORAGE_BUFFER_ALIGNMENT};
use crate::renderer::attachments::AttachmentId;
use crate::renderer::context::DeviceContext;
use crate::renderer::resource_registry::{BufferRecord, Handle};
use crate::renderer::resources::align_up;
use crate::vulkan::{
    full_viewport, BlendMode, BufferDesc, DescriptorPool, DescriptorSet,
    DescriptorSetLayoutBuilder, GraphicsPipelineDesc, LoadOp, MemoryLocation, Pipeline,
    PipelineParams, ShaderCompiler, ShaderSource,
};
use crate::Result;

/// Per-slot streaming buffer size.
pub const UI_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

/// One UI vertex in screen pixels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UiVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

/// A run of indices drawn with one clip rectangle and texture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UiDrawCmd {
    /// min x, min y, max x, max y in pixels
    pub clip_rect: [f32; 4],
    pub index_offset: u32,
    pub index_count: u32,
    /// Bindless texture index; untextured when `None`
    pub texture: Option<u32>,
}

/// One frame of UI geometry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiDrawList {
    pub vertices: Vec<UiVertex>,
    pub indices: Vec<u32>,
    pub commands: Vec<UiDrawCmd>,
}

impl UiDrawList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.commands.clear();
    }

    /// Appends an axis-aligned rectangle clipped to itself.
    pub fn add_rect(&mut self, rect: [f32; 4], color: [f32; 4], texture: Option<u32>) {
        let [x0, y0, x1, y1] = rect;
        let base = self.vertices.len() as u32;
        let corners = [
            ([x0, y0], [0.0, 0.0]),
            ([x1, y0], [1.0, 0.0]),
            ([x1, y1], [1.0, 1.0]),
            ([x0, y1], [0.0, 1.0]),
        ];
        self.vertices
            .extend(corners.iter().map(|&(pos, uv)| UiVertex { pos, uv, color }));
        let index_offset = self.indices.len() as u32;
        self.indices
            .extend([0, 1, 2, 2, 3, 0].iter().map(|i| base + i));
        self.commands.push(UiDrawCmd {
            clip_rect: rect,
            index_offset,
            index_count: 6,
            texture,
        });
    }

    /// Byte offset of the index block inside the streaming buffer.
    pub fn index_block_offset(&self) -> u64 {
        align_up(
            std::mem::size_of_val(self.vertices.as_slice()) as u64,
            STORAGE_BUFFER_ALIGNMENT,
        )
    }

    /// Bytes the list occupies in the streaming buffer.
    pub fn byte_size(&self) -> u64 {
        self.index_block_offset() + std::mem::size_of_val(self.indices.as_slice()) as u64
    }
}

/// Clip rectangle clamped to the target. `None` when nothing is left to draw.
pub fn clip_scissor(clip: [f32; 4], extent: vk::Extent2D) -> Option<vk::Rect2D> {
    let x0 = clip[0].max(0.0).floor() as u32;
    let y0 = clip[1].max(0.0).floor() as u32;
    let x1 = (clip[2].max(0.0).ceil() as u32).min(extent.width);
    let y1 = (clip[3].max(0.0).ceil() as u32).min(extent.height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: x0 as i32,
            y: y0 as i32,
        },
        extent: vk::Extent2D {
            width: x1 - x0,
            height: y1 - y0,
        },
    })
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UiPush {
    pub screen_size: [f32; 2],
    /// Bindless index, `u32::MAX` for untextured
    pub texture: u32,
    /// First index of the command, in 32-bit words from the buffer start
    pub index_base: u32,
}

struct SlotBuffer {
    buffer: Handle<BufferRecord>,
    raw: vk::Buffer,
    set: DescriptorSet,
}

pub struct UiPass {
    pipeline: Pipeline,
    slots: Vec<SlotBuffer>,
}

impl UiPass {
    pub fn new(
        ctx: &mut DeviceContext,
        compiler: &Arc<dyn ShaderCompiler>,
        config: &RendererConfig,
        shared: &SharedResources,
    ) -> Result<Self> {
        let layout = DescriptorSetLayoutBuilder::new()
            .add_storage_buffer(0, vk::ShaderStageFlags::VERTEX)
            .create(ctx, "ui")?;
        let pool = DescriptorPool::for_layout(ctx, &layout, FRAMES_IN_FLIGHT as u32)?;
        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let buffer = ctx.create_buffer(&BufferDesc {
                size: UI_BUFFER_SIZE,
                usage: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::CpuToGpu,
                name: format!("ui_{slot}"),
            })?;
            let raw = ctx.buffer(buffer)?;
            let set = DescriptorSet::create(ctx.device(), &pool, &layout, &format!("ui_{slot}"))?;
            set.write_storage_buffer(ctx.device(), 0, raw, 0, UI_BUFFER_SIZE)?;
            slots.push(SlotBuffer { buffer, raw, set });
        }

        let output = if config.passes.post_fx {
            AttachmentId::FinalColor
        } else {
            AttachmentId::LightAccum
        };
        let desc = GraphicsPipelineDesc {
            color_formats: vec![output.format()],
            blend: BlendMode::Alpha,
            cull_mode: vk::CullModeFlags::NONE,
            ..Default::default()
        };
        let params = PipelineParams::graphics("ui", desc)
            .with_shader(ShaderSource::vertex(shader_path(&config.shader_dir, "ui.vert")))
            .with_shader(ShaderSource::fragment(shader_path(&config.shader_dir, "ui.frag")))
            .with_set_layouts(&[
                shared.empty_layout.raw(),
                layout.raw(),
                shared.frame_layout.raw(),
                shared.bindless.layout().raw(),
            ])
            .with_push_constants(
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                std::mem::size_of::<UiPush>() as u32,
            );
        let pipeline = Pipeline::create_graphics(ctx, Arc::clone(compiler), params)?;
        Ok(Self { pipeline, slots })
    }

    pub fn record(
        &self,
        rec: &mut PassRecorder<'_>,
        shared: &SharedResources,
        list: Option<&UiDrawList>,
        output: AttachmentId,
    ) -> Result<()> {
        let Some(list) = list.filter(|list| !list.is_empty()) else {
            return Ok(());
        };
        if list.byte_size() > UI_BUFFER_SIZE {
            log::warn!(
                "[Pipeline] UI draw list of {} bytes exceeds the {UI_BUFFER_SIZE} byte buffer; skipped",
                list.byte_size()
            );
            return Ok(());
        }

        let slot = &self.slots[rec.slot];
        let index_block = list.index_block_offset();
        rec.device
            .write_buffer(slot.raw, 0, bytemuck::cast_slice(&list.vertices))?;
        rec.device
            .write_buffer(slot.raw, index_block, bytemuck::cast_slice(&list.indices))?;

        let extent = rec.extent();
        let desc = color_pass(extent, rec.color_target(output, LoadOp::Load)?);
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        let index_base = (index_block / 4) as u32;

        rec.begin_rendering(&desc);
        self.pipeline.bind(rec.device, rec.cmd, extent);
        self.pipeline.bind_descriptor_sets(
            rec.device,
            rec.cmd,
            SET_PASS,
            &[
                slot.set.raw(),
                shared.frame_set(rec.slot),
                shared.bindless.set().raw(),
            ],
        );
        for command in &list.commands {
            if command.index_count == 0 {
                continue;
            }
            let Some(scissor) = clip_scissor(command.clip_rect, extent) else {
                continue;
            };
            rec.device
                .cmd_set_viewport_scissor(rec.cmd, full_viewport(extent), scissor);
            let push = UiPush {
                screen_size: [extent.width as f32, extent.height as f32],
                texture: command.texture.unwrap_or(u32::MAX),
                index_base: index_base + command.index_offset,
            };
            self.pipeline.push_constants(rec.device, rec.cmd, stages, &push);
            rec.draw(command.index_count, 1, 0, 0);
        }
        rec.end_rendering();
        Ok(())
    }

    pub fn buffer(&self, slot: usize) -> Option<Handle<BufferRecord>> {
        self.slots.get(slot).map(|slot| slot.buffer)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_emits_two_triangles() {
        let mut list = UiDrawList::new();
        list.add_rect([0.0, 0.0, 10.0, 10.0], [1.0; 4], None);
        list.add_rect([20.0, 0.0, 30.0, 10.0], [1.0; 4], Some(3));
        assert_eq!(list.vertices.len(), 8);
        assert_eq!(&list.indices[6..], &[4, 5, 6, 6, 7, 4]);
        assert_eq!(list.commands[1].index_offset, 6);
        assert_eq!(list.index_block_offset() % STORAGE_BUFFER_ALIGNMENT, 0);
    }

    #[test]
    fn scissor_is_clamped_and_empty_rects_skipped() {
        let extent = vk::Extent2D {
            width: 100,
            height: 50,
        };
        let scissor = clip_scissor([-5.0, 10.0, 500.0, 20.5], extent).unwrap();
        assert_eq!(scissor.offset.x, 0);
        assert_eq!(scissor.extent.width, 100);
        assert_eq!(scissor.extent.height, 11);
        assert!(clip_scissor([10.0, 10.0, 10.0, 40.0], extent).is_none());
        assert!(clip_scissor([200.0, 0.0, 300.0, 10.0], extent).is_none());
    }
}
