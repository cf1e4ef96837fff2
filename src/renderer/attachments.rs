//! Render targets shared between passes, with their tracked layout state.
//!
//! Every frame slot has its own [`AttachmentSet`]; the prefiltered environment cube is
//! persistent and shared by all slots.

use ash::vk;
use std::collections::HashMap;

use super::context::DeviceContext;
use super::resource_registry::{Handle, ImageRecord, ImageViewRecord};
use crate::config::{RendererConfig, FRAMES_IN_FLIGHT};
use crate::vulkan::{aspect_for, is_depth_format, ImageDesc, ImageState, ImageViewDesc};
use crate::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentId {
    /// G-buffer base color
    Albedo,
    /// G-buffer world normal
    Normal,
    /// G-buffer metalness / roughness / occlusion
    Material,
    Depth,
    /// Layered cascade depth, one layer per cascade
    ShadowCascades,
    /// HDR lighting accumulation
    LightAccum,
    Volumetric,
    VolumetricBlur,
    /// Tonemapped output the UI composites onto
    FinalColor,
    /// Prefiltered environment cube
    Environment,
}

impl AttachmentId {
    pub const ALL: [AttachmentId; 10] = [
        Self::Albedo,
        Self::Normal,
        Self::Material,
        Self::Depth,
        Self::ShadowCascades,
        Self::LightAccum,
        Self::Volumetric,
        Self::VolumetricBlur,
        Self::FinalColor,
        Self::Environment,
    ];

    pub fn format(self) -> vk::Format {
        match self {
            Self::Albedo | Self::Material | Self::FinalColor => vk::Format::R8G8B8A8_UNORM,
            Self::Normal
            | Self::LightAccum
            | Self::Volumetric
            | Self::VolumetricBlur
            | Self::Environment => vk::Format::R16G16B16A16_SFLOAT,
            Self::Depth | Self::ShadowCascades => vk::Format::D32_SFLOAT,
        }
    }

    pub fn is_depth(self) -> bool {
        is_depth_format(self.format())
    }

    /// Written once and kept across frames instead of being rebuilt every frame.
    pub fn is_persistent(self) -> bool {
        self == Self::Environment
    }

    /// Follows the output resolution.
    pub fn is_size_dependent(self) -> bool {
        !matches!(self, Self::ShadowCascades | Self::Environment)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Albedo => "gbuffer_albedo",
            Self::Normal => "gbuffer_normal",
            Self::Material => "gbuffer_material",
            Self::Depth => "gbuffer_depth",
            Self::ShadowCascades => "shadow_cascades",
            Self::LightAccum => "light_accum",
            Self::Volumetric => "volumetric",
            Self::VolumetricBlur => "volumetric_blur",
            Self::FinalColor => "final_color",
            Self::Environment => "environment",
        }
    }
}

/// One image plus its views and current state.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: AttachmentId,
    pub image: Handle<ImageRecord>,
    pub raw_image: vk::Image,
    /// View used for sampling (2D, 2D array or cube)
    pub view: Handle<ImageViewRecord>,
    pub raw_view: vk::ImageView,
    /// View used as a render target; a 2D array for layered targets
    pub target_view: vk::ImageView,
    target_view_handle: Option<Handle<ImageViewRecord>>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub state: ImageState,
}

impl Attachment {
    pub fn create(
        ctx: &mut DeviceContext,
        id: AttachmentId,
        extent: vk::Extent2D,
        layers: u32,
        slot: Option<usize>,
    ) -> Result<Self> {
        let format = id.format();
        let usage = if id.is_depth() {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        } else {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        };
        let cube = id == AttachmentId::Environment;
        let name = match slot {
            Some(slot) => format!("{}_{slot}", id.name()),
            None => id.name().to_string(),
        };

        let image = ctx.create_image(&ImageDesc {
            format,
            extent,
            array_layers: layers,
            mip_levels: 1,
            usage,
            cube_compatible: cube,
            name,
        })?;
        let raw_image = ctx.image(image)?.image;
        let aspect = aspect_for(format);

        let sample_type = if cube {
            vk::ImageViewType::CUBE
        } else if layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view = ctx.create_image_view(&ImageViewDesc {
            image: raw_image,
            view_type: sample_type,
            format,
            aspect,
            base_layer: 0,
            layer_count: layers,
        })?;
        let raw_view = ctx.image_view(view)?;

        // Multiview rendering into a cube needs a plain array view of its faces.
        let (target_view, target_view_handle) = if cube {
            let handle = ctx.create_image_view(&ImageViewDesc {
                image: raw_image,
                view_type: vk::ImageViewType::TYPE_2D_ARRAY,
                format,
                aspect,
                base_layer: 0,
                layer_count: layers,
            })?;
            (ctx.image_view(handle)?, Some(handle))
        } else {
            (raw_view, None)
        };

        Ok(Self {
            id,
            image,
            raw_image,
            view,
            raw_view,
            target_view,
            target_view_handle,
            format,
            extent,
            layers,
            state: ImageState::UNDEFINED,
        })
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for(self.format)
    }

    /// Destroys the image and its views through the registry.
    pub fn destroy(self, ctx: &mut DeviceContext) -> Result<()> {
        let registry = ctx.registry_mut();
        if let Some(handle) = self.target_view_handle {
            registry.destroy_image_view(handle)?;
        }
        registry.destroy_image_view(self.view)?;
        registry.destroy_image(self.image)
    }
}

/// The attachments of one frame slot.
#[derive(Debug, Default)]
pub struct AttachmentSet {
    attachments: HashMap<AttachmentId, Attachment>,
}

impl AttachmentSet {
    pub fn get(&self, id: AttachmentId) -> Result<&Attachment> {
        self.attachments
            .get(&id)
            .ok_or_else(|| missing(id))
    }

    pub fn get_mut(&mut self, id: AttachmentId) -> Result<&mut Attachment> {
        self.attachments
            .get_mut(&id)
            .ok_or_else(|| missing(id))
    }

    pub fn contains(&self, id: AttachmentId) -> bool {
        self.attachments.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = AttachmentId> + '_ {
        self.attachments.keys().copied()
    }

    fn insert(&mut self, attachment: Attachment) {
        self.attachments.insert(attachment.id, attachment);
    }

    fn take(&mut self, id: AttachmentId) -> Option<Attachment> {
        self.attachments.remove(&id)
    }
}

fn missing(id: AttachmentId) -> RenderError {
    RenderError::AttachmentConflict(format!("attachment '{}' is not allocated", id.name()))
}

/// All render targets: one set per frame slot plus the shared persistent ones.
#[derive(Debug)]
pub struct Attachments {
    slots: Vec<AttachmentSet>,
    shared: AttachmentSet,
    extent: vk::Extent2D,
}

impl Attachments {
    /// Allocates every attachment the enabled passes need.
    pub fn new(ctx: &mut DeviceContext, config: &RendererConfig) -> Result<Self> {
        let extent = vk::Extent2D {
            width: config.width,
            height: config.height,
        };
        let wanted = wanted_attachments(config);

        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for slot in 0..FRAMES_IN_FLIGHT {
            let mut set = AttachmentSet::default();
            for &id in wanted.iter().filter(|id| !id.is_persistent()) {
                let (size, layers) = dimensions(id, config, extent);
                set.insert(Attachment::create(ctx, id, size, layers, Some(slot))?);
            }
            slots.push(set);
        }

        let mut shared = AttachmentSet::default();
        for &id in wanted.iter().filter(|id| id.is_persistent()) {
            let (size, layers) = dimensions(id, config, extent);
            shared.insert(Attachment::create(ctx, id, size, layers, None)?);
        }

        log::info!(
            "[Attachments] Allocated {} per-slot and {} shared attachments at {}x{}",
            slots[0].attachments.len(),
            shared.attachments.len(),
            extent.width,
            extent.height
        );
        Ok(Self {
            slots,
            shared,
            extent,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn get(&self, slot: usize, id: AttachmentId) -> Result<&Attachment> {
        if id.is_persistent() {
            return self.shared.get(id);
        }
        self.slot_set(slot)?.get(id)
    }

    pub fn get_mut(&mut self, slot: usize, id: AttachmentId) -> Result<&mut Attachment> {
        if id.is_persistent() {
            return self.shared.get_mut(id);
        }
        self.slots
            .get_mut(slot)
            .ok_or_else(|| RenderError::AttachmentConflict(format!("no frame slot {slot}")))?
            .get_mut(id)
    }

    pub fn contains(&self, id: AttachmentId) -> bool {
        if id.is_persistent() {
            self.shared.contains(id)
        } else {
            self.slots[0].contains(id)
        }
    }

    pub fn view(&self, slot: usize, id: AttachmentId) -> Result<vk::ImageView> {
        Ok(self.get(slot, id)?.raw_view)
    }

    pub fn state(&self, slot: usize, id: AttachmentId) -> Result<ImageState> {
        Ok(self.get(slot, id)?.state)
    }

    fn slot_set(&self, slot: usize) -> Result<&AttachmentSet> {
        self.slots
            .get(slot)
            .ok_or_else(|| RenderError::AttachmentConflict(format!("no frame slot {slot}")))
    }

    /// Recreates every size-dependent attachment at `extent`. The device must be idle.
    pub fn resize(&mut self, ctx: &mut DeviceContext, config: &RendererConfig, extent: vk::Extent2D) -> Result<()> {
        for (slot, set) in self.slots.iter_mut().enumerate() {
            let ids: Vec<_> = set.ids().filter(|id| id.is_size_dependent()).collect();
            for id in ids {
                if let Some(old) = set.take(id) {
                    old.destroy(ctx)?;
                }
                let (size, layers) = dimensions(id, config, extent);
                set.insert(Attachment::create(ctx, id, size, layers, Some(slot))?);
            }
        }
        self.extent = extent;
        log::info!("[Attachments] Resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Destroys every attachment through the registry.
    pub fn destroy(&mut self, ctx: &mut DeviceContext) -> Result<()> {
        for set in self.slots.iter_mut().chain(std::iter::once(&mut self.shared)) {
            let ids: Vec<_> = set.ids().collect();
            for id in ids {
                if let Some(attachment) = set.take(id) {
                    attachment.destroy(ctx)?;
                }
            }
        }
        Ok(())
    }
}

fn wanted_attachments(config: &RendererConfig) -> Vec<AttachmentId> {
    let passes = &config.passes;
    AttachmentId::ALL
        .into_iter()
        .filter(|id| match id {
            AttachmentId::Volumetric | AttachmentId::VolumetricBlur => passes.volumetric,
            AttachmentId::FinalColor => passes.post_fx,
            AttachmentId::Environment => passes.ibl || passes.skybox,
            _ => true,
        })
        .collect()
}

fn dimensions(id: AttachmentId, config: &RendererConfig, extent: vk::Extent2D) -> (vk::Extent2D, u32) {
    match id {
        AttachmentId::ShadowCascades => (
            vk::Extent2D {
                width: config.cascades.resolution,
                height: config.cascades.resolution,
            },
            config.cascades.cascade_count,
        ),
        AttachmentId::Environment => (
            vk::Extent2D {
                width: config.environment_size,
                height: config.environment_size,
            },
            6,
        ),
        _ => (extent, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::{HeadlessDevice, ObjectKind};
    use std::sync::Arc;

    #[test]
    fn allocates_per_slot_and_shared() {
        let device = Arc::new(HeadlessDevice::default());
        let mut ctx = DeviceContext::new(device.clone());
        let config = RendererConfig::default();
        let attachments = Attachments::new(&mut ctx, &config).unwrap();

        let albedo0 = attachments.get(0, AttachmentId::Albedo).unwrap().raw_image;
        let albedo1 = attachments.get(1, AttachmentId::Albedo).unwrap().raw_image;
        assert_ne!(albedo0, albedo1);

        let env0 = attachments.get(0, AttachmentId::Environment).unwrap();
        let env1 = attachments.get(1, AttachmentId::Environment).unwrap();
        assert_eq!(env0.raw_image, env1.raw_image);
        assert_eq!(env0.layers, 6);
        assert_ne!(env0.raw_view, env0.target_view);

        assert_eq!(
            attachments.get(0, AttachmentId::ShadowCascades).unwrap().layers,
            config.cascades.cascade_count
        );
        // Volumetric is off by default
        assert!(attachments.get(0, AttachmentId::Volumetric).is_err());
    }

    #[test]
    fn resize_replaces_only_size_dependent_targets() {
        let device = Arc::new(HeadlessDevice::default());
        let mut ctx = DeviceContext::new(device.clone());
        let config = RendererConfig::default();
        let mut attachments = Attachments::new(&mut ctx, &config).unwrap();
        let images_before = device.live_count(ObjectKind::Image);
        let shadow = attachments.get(0, AttachmentId::ShadowCascades).unwrap().raw_image;
        let depth = attachments.get(0, AttachmentId::Depth).unwrap().raw_image;

        let extent = vk::Extent2D {
            width: 640,
            height: 360,
        };
        attachments.resize(&mut ctx, &config, extent).unwrap();

        assert_eq!(device.live_count(ObjectKind::Image), images_before);
        assert_eq!(attachments.get(0, AttachmentId::ShadowCascades).unwrap().raw_image, shadow);
        let new_depth = attachments.get(0, AttachmentId::Depth).unwrap();
        assert_ne!(new_depth.raw_image, depth);
        assert_eq!(new_depth.extent, extent);

        attachments.destroy(&mut ctx).unwrap();
        assert_eq!(device.live_count(ObjectKind::Image), 0);
        assert_eq!(device.live_count(ObjectKind::ImageView), 0);
    }
}
