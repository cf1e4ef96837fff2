//! Ordered pass list with declared attachment usage.
//!
//! Each pass states which attachments it samples, depth-tests against, produces (clears or
//! discards) and composites onto. [`RenderGraph::new`] rejects orderings that would read an
//! attachment before anything wrote it, and [`RenderGraph::plan`] derives every layout
//! transition from those declarations and the attachments' tracked states.

use ash::vk;
use std::collections::HashMap;

use super::attachments::AttachmentId;
use crate::config::PassToggles;
use crate::vulkan::ImageState;
use crate::{RenderError, Result};

/// Every pass the renderer knows how to record, in their default order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassKind {
    /// Renders the environment source into the prefiltered cube. Only scheduled when the
    /// environment changed.
    IblPrefilter,
    Geometry,
    Shadow,
    Lighting,
    Skybox,
    Volumetric,
    PostFx,
    Ui,
}

impl PassKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::IblPrefilter => "ibl_prefilter",
            Self::Geometry => "geometry",
            Self::Shadow => "shadow",
            Self::Lighting => "lighting",
            Self::Skybox => "skybox",
            Self::Volumetric => "volumetric",
            Self::PostFx => "post_fx",
            Self::Ui => "ui",
        }
    }
}

/// How a pass touches an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentUse {
    /// Read through a sampler in fragment shaders
    Sampled,
    /// Depth-tested without writing
    DepthRead,
    /// Render target whose previous contents are discarded
    Produce,
    /// Render target loaded and blended onto
    Composite,
}

impl AttachmentUse {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Produce | Self::Composite)
    }

    /// The state `id` must be in while the pass uses it this way.
    pub fn target_state(self, id: AttachmentId) -> ImageState {
        match (self, id.is_depth()) {
            (Self::Sampled, _) => sampled_state(),
            (Self::DepthRead, _) => ImageState {
                layout: vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL,
                stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
            },
            (_, true) => ImageState {
                layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
            (_, false) => ImageState {
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            },
        }
    }
}

/// Shader-read state shared by every sampled attachment.
pub fn sampled_state() -> ImageState {
    ImageState {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    }
}

/// Source state of the final copy to the presentation image.
pub fn transfer_src_state() -> ImageState {
    ImageState {
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_READ,
    }
}

/// One pass and the attachments it touches, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct PassDecl {
    pub kind: PassKind,
    pub uses: Vec<(AttachmentId, AttachmentUse)>,
}

impl PassDecl {
    pub fn new(kind: PassKind) -> Self {
        Self {
            kind,
            uses: Vec::new(),
        }
    }

    pub fn samples(mut self, id: AttachmentId) -> Self {
        self.uses.push((id, AttachmentUse::Sampled));
        self
    }

    pub fn depth_reads(mut self, id: AttachmentId) -> Self {
        self.uses.push((id, AttachmentUse::DepthRead));
        self
    }

    pub fn produces(mut self, id: AttachmentId) -> Self {
        self.uses.push((id, AttachmentUse::Produce));
        self
    }

    pub fn composites(mut self, id: AttachmentId) -> Self {
        self.uses.push((id, AttachmentUse::Composite));
        self
    }

    pub fn writes(&self) -> impl Iterator<Item = (AttachmentId, AttachmentUse)> + '_ {
        self.uses.iter().copied().filter(|(_, usage)| usage.is_write())
    }

    pub fn reads(&self) -> impl Iterator<Item = (AttachmentId, AttachmentUse)> + '_ {
        self.uses.iter().copied().filter(|(_, usage)| !usage.is_write())
    }

    /// The declaration the built-in pass of `kind` records against.
    pub fn standard(kind: PassKind, toggles: &PassToggles, output: AttachmentId) -> Self {
        use AttachmentId::*;
        match kind {
            PassKind::IblPrefilter => Self::new(kind).produces(Environment),
            PassKind::Geometry => Self::new(kind)
                .produces(Albedo)
                .produces(Normal)
                .produces(Material)
                .produces(Depth),
            PassKind::Shadow => Self::new(kind).produces(ShadowCascades),
            PassKind::Lighting => {
                let decl = Self::new(kind)
                    .samples(Albedo)
                    .samples(Normal)
                    .samples(Material)
                    .samples(Depth)
                    .samples(ShadowCascades);
                let decl = if toggles.ibl {
                    decl.samples(Environment)
                } else {
                    decl
                };
                decl.produces(LightAccum)
            }
            PassKind::Skybox => Self::new(kind)
                .samples(Environment)
                .depth_reads(Depth)
                .composites(LightAccum),
            PassKind::Volumetric => Self::new(kind)
                .samples(Depth)
                .samples(ShadowCascades)
                .produces(Volumetric)
                .produces(VolumetricBlur)
                .composites(LightAccum),
            PassKind::PostFx => Self::new(kind).samples(LightAccum).produces(FinalColor),
            PassKind::Ui => Self::new(kind).composites(output),
        }
    }
}

/// A transition the graph wants before or after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBarrier {
    pub attachment: AttachmentId,
    pub src: ImageState,
    pub dst: ImageState,
}

impl PlannedBarrier {
    /// Previous contents are not needed.
    pub fn discards(&self) -> bool {
        self.src.layout == vk::ImageLayout::UNDEFINED
    }
}

/// Transitions bracketing one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassPlan {
    pub kind: PassKind,
    pub before: Vec<PlannedBarrier>,
    pub after: Vec<PlannedBarrier>,
}

/// A validated pass order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderGraph {
    passes: Vec<PassDecl>,
    output: AttachmentId,
}

impl RenderGraph {
    /// Validates `passes` in the given order.
    pub fn new(passes: Vec<PassDecl>) -> Result<Self> {
        validate(&passes)?;
        let produces_final = passes
            .iter()
            .any(|pass| pass.writes().any(|(id, _)| id == AttachmentId::FinalColor));
        let output = if produces_final {
            AttachmentId::FinalColor
        } else {
            AttachmentId::LightAccum
        };
        Ok(Self { passes, output })
    }

    /// The built-in order for the enabled passes. `prefilter_environment` schedules the IBL
    /// prefilter ahead of everything else.
    pub fn standard(toggles: &PassToggles, prefilter_environment: bool) -> Result<Self> {
        let output = if toggles.post_fx {
            AttachmentId::FinalColor
        } else {
            AttachmentId::LightAccum
        };
        let wants_environment = toggles.ibl || toggles.skybox;

        let mut kinds = Vec::with_capacity(8);
        if prefilter_environment && wants_environment {
            kinds.push(PassKind::IblPrefilter);
        }
        kinds.extend([PassKind::Geometry, PassKind::Shadow, PassKind::Lighting]);
        if toggles.skybox {
            kinds.push(PassKind::Skybox);
        }
        if toggles.volumetric {
            kinds.push(PassKind::Volumetric);
        }
        if toggles.post_fx {
            kinds.push(PassKind::PostFx);
        }
        if toggles.ui {
            kinds.push(PassKind::Ui);
        }

        Self::new(
            kinds
                .into_iter()
                .map(|kind| PassDecl::standard(kind, toggles, output))
                .collect(),
        )
    }

    pub fn passes(&self) -> &[PassDecl] {
        &self.passes
    }

    pub fn kinds(&self) -> impl Iterator<Item = PassKind> + '_ {
        self.passes.iter().map(|pass| pass.kind)
    }

    pub fn contains(&self, kind: PassKind) -> bool {
        self.kinds().any(|k| k == kind)
    }

    /// Attachment holding the finished image once every pass has run.
    pub fn output(&self) -> AttachmentId {
        self.output
    }

    /// Derives the transitions for one frame, starting from each attachment's current
    /// state as reported by `current`. `None` means the attachment was never allocated.
    ///
    /// Before a pass every declared attachment is moved into the state its usage needs
    /// (writes discard unless they composite). After a pass, each attachment it wrote is
    /// moved to the sampled state right away if a later pass samples it next.
    pub fn plan<F>(&self, current: F) -> Result<Vec<PassPlan>>
    where
        F: Fn(AttachmentId) -> Option<ImageState>,
    {
        let mut states: HashMap<AttachmentId, ImageState> = HashMap::new();
        let mut plans = Vec::with_capacity(self.passes.len());

        for (index, pass) in self.passes.iter().enumerate() {
            let mut before = Vec::new();
            for &(id, usage) in &pass.uses {
                let state = match states.get(&id) {
                    Some(state) => *state,
                    None => current(id).ok_or_else(|| {
                        RenderError::AttachmentConflict(format!(
                            "pass '{}' uses '{}' which is not allocated",
                            pass.kind.name(),
                            id.name()
                        ))
                    })?,
                };
                if !usage.is_write() && id.is_persistent() && state.layout == vk::ImageLayout::UNDEFINED {
                    return Err(RenderError::AttachmentConflict(format!(
                        "pass '{}' samples '{}' before it was ever written",
                        pass.kind.name(),
                        id.name()
                    )));
                }

                let dst = usage.target_state(id);
                let needs_barrier = state != dst || (usage.is_write() && state.access != vk::AccessFlags2::NONE);
                if needs_barrier {
                    let src = if usage == AttachmentUse::Produce {
                        ImageState {
                            layout: vk::ImageLayout::UNDEFINED,
                            ..state
                        }
                    } else {
                        state
                    };
                    before.push(PlannedBarrier {
                        attachment: id,
                        src,
                        dst,
                    });
                }
                states.insert(id, dst);
            }

            let mut after = Vec::new();
            for (id, _) in pass.writes() {
                if self.next_use(index + 1, id) == Some(AttachmentUse::Sampled) {
                    let src = states[&id];
                    let dst = sampled_state();
                    after.push(PlannedBarrier {
                        attachment: id,
                        src,
                        dst,
                    });
                    states.insert(id, dst);
                }
            }

            plans.push(PassPlan {
                kind: pass.kind,
                before,
                after,
            });
        }
        Ok(plans)
    }

    fn next_use(&self, from: usize, id: AttachmentId) -> Option<AttachmentUse> {
        self.passes[from..]
            .iter()
            .flat_map(|pass| pass.uses.iter())
            .find(|(used, _)| *used == id)
            .map(|(_, usage)| *usage)
    }
}

fn validate(passes: &[PassDecl]) -> Result<()> {
    let position = |kind: PassKind| passes.iter().position(|pass| pass.kind == kind);

    for (index, pass) in passes.iter().enumerate() {
        if position(pass.kind) != Some(index) {
            return Err(RenderError::PassOrder(format!(
                "pass '{}' appears more than once",
                pass.kind.name()
            )));
        }
    }

    let lighting = position(PassKind::Lighting);
    for kind in [PassKind::Volumetric, PassKind::PostFx] {
        if let Some(at) = position(kind) {
            match lighting {
                Some(lit) if lit < at => {}
                _ => {
                    return Err(RenderError::PassOrder(format!(
                        "pass '{}' must run after 'lighting'",
                        kind.name()
                    )))
                }
            }
        }
    }
    if let Some(ui) = position(PassKind::Ui) {
        if ui != passes.len() - 1 {
            return Err(RenderError::PassOrder("pass 'ui' must run last".into()));
        }
    }

    let mut producers: HashMap<AttachmentId, PassKind> = HashMap::new();
    for pass in passes {
        for (id, _) in pass.reads() {
            if pass.writes().any(|(written, _)| written == id) {
                return Err(RenderError::AttachmentConflict(format!(
                    "pass '{}' both reads and writes '{}'",
                    pass.kind.name(),
                    id.name()
                )));
            }
            if !producers.contains_key(&id) && !id.is_persistent() {
                return Err(RenderError::AttachmentConflict(format!(
                    "pass '{}' reads '{}' before any pass writes it",
                    pass.kind.name(),
                    id.name()
                )));
            }
        }
        for (id, usage) in pass.writes() {
            match (usage, producers.get(&id)) {
                (AttachmentUse::Produce, Some(first)) => {
                    return Err(RenderError::AttachmentConflict(format!(
                        "'{}' is produced by both '{}' and '{}'",
                        id.name(),
                        first.name(),
                        pass.kind.name()
                    )));
                }
                (AttachmentUse::Produce, None) => {
                    producers.insert(id, pass.kind);
                }
                (_, None) if !id.is_persistent() => {
                    return Err(RenderError::AttachmentConflict(format!(
                        "pass '{}' composites onto '{}' before it is produced",
                        pass.kind.name(),
                        id.name()
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_graph_orders_passes() {
        let graph = RenderGraph::standard(&PassToggles::default(), true).unwrap();
        let kinds: Vec<_> = graph.kinds().collect();
        assert_eq!(
            kinds,
            vec![
                PassKind::IblPrefilter,
                PassKind::Geometry,
                PassKind::Shadow,
                PassKind::Lighting,
                PassKind::Skybox,
                PassKind::PostFx,
                PassKind::Ui,
            ]
        );
        assert_eq!(graph.output(), AttachmentId::FinalColor);
    }

    #[test]
    fn output_falls_back_to_light_accum() {
        let toggles = PassToggles {
            post_fx: false,
            ..PassToggles::default()
        };
        let graph = RenderGraph::standard(&toggles, false).unwrap();
        assert_eq!(graph.output(), AttachmentId::LightAccum);
        assert!(!graph.contains(PassKind::IblPrefilter));
    }

    #[test]
    fn geometry_outputs_become_sampled_after_the_pass() {
        let graph = RenderGraph::standard(&PassToggles::default(), true).unwrap();
        let plans = graph.plan(|_| Some(ImageState::UNDEFINED)).unwrap();
        let geometry = plans.iter().find(|p| p.kind == PassKind::Geometry).unwrap();
        assert_eq!(geometry.before.len(), 4);
        assert!(geometry.before.iter().all(PlannedBarrier::discards));
        assert!(geometry
            .after
            .iter()
            .any(|b| b.attachment == AttachmentId::Albedo && b.dst == sampled_state()));
    }
}
