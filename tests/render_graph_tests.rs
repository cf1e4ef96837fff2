use deferred_renderer::config::PassToggles;
use deferred_renderer::renderer::frame_graph::sampled_state;
use deferred_renderer::renderer::{AttachmentId, PassDecl, PassKind, PassPlan, RenderGraph};
use deferred_renderer::vulkan::ImageState;
use deferred_renderer::RenderError;

fn all_passes() -> PassToggles {
    PassToggles {
        ibl: true,
        skybox: true,
        volumetric: true,
        post_fx: true,
        ui: true,
    }
}

fn fresh(_: AttachmentId) -> Option<ImageState> {
    Some(ImageState::UNDEFINED)
}

fn plan_for(plans: &[PassPlan], kind: PassKind) -> &PassPlan {
    plans.iter().find(|plan| plan.kind == kind).expect("pass planned")
}

#[test]
fn every_optional_pass_lands_in_order() {
    let graph = RenderGraph::standard(&all_passes(), true).unwrap();
    let kinds: Vec<_> = graph.kinds().collect();
    assert_eq!(
        kinds,
        vec![
            PassKind::IblPrefilter,
            PassKind::Geometry,
            PassKind::Shadow,
            PassKind::Lighting,
            PassKind::Skybox,
            PassKind::Volumetric,
            PassKind::PostFx,
            PassKind::Ui,
        ]
    );
}

#[test]
fn minimal_graph_is_the_deferred_core() {
    let toggles = PassToggles {
        ibl: false,
        skybox: false,
        volumetric: false,
        post_fx: false,
        ui: false,
    };
    let graph = RenderGraph::standard(&toggles, true).unwrap();
    let kinds: Vec<_> = graph.kinds().collect();
    assert_eq!(kinds, vec![PassKind::Geometry, PassKind::Shadow, PassKind::Lighting]);
    assert_eq!(graph.output(), AttachmentId::LightAccum);
    graph.plan(fresh).unwrap();
}

#[test]
fn post_processing_before_lighting_is_rejected() {
    let toggles = all_passes();
    let order = [PassKind::Geometry, PassKind::Shadow, PassKind::PostFx, PassKind::Lighting];
    let decls = order
        .iter()
        .map(|&kind| PassDecl::standard(kind, &toggles, AttachmentId::FinalColor))
        .collect();
    assert!(matches!(RenderGraph::new(decls), Err(RenderError::PassOrder(_))));
}

#[test]
fn ui_must_be_last() {
    let toggles = all_passes();
    let order = [
        PassKind::Geometry,
        PassKind::Shadow,
        PassKind::Lighting,
        PassKind::Ui,
        PassKind::PostFx,
    ];
    let decls = order
        .iter()
        .map(|&kind| PassDecl::standard(kind, &toggles, AttachmentId::LightAccum))
        .collect();
    assert!(matches!(RenderGraph::new(decls), Err(RenderError::PassOrder(_))));
}

#[test]
fn reading_before_any_write_is_rejected() {
    let decls = vec![
        PassDecl::new(PassKind::Lighting)
            .samples(AttachmentId::Albedo)
            .produces(AttachmentId::LightAccum),
        PassDecl::new(PassKind::Geometry).produces(AttachmentId::Albedo),
    ];
    assert!(matches!(RenderGraph::new(decls), Err(RenderError::AttachmentConflict(_))));
}

#[test]
fn two_producers_of_one_attachment_conflict() {
    let decls = vec![
        PassDecl::new(PassKind::Geometry).produces(AttachmentId::Depth),
        PassDecl::new(PassKind::Shadow).produces(AttachmentId::Depth),
    ];
    assert!(matches!(RenderGraph::new(decls), Err(RenderError::AttachmentConflict(_))));
}

#[test]
fn duplicate_pass_is_rejected() {
    let decls = vec![
        PassDecl::new(PassKind::Geometry).produces(AttachmentId::Albedo),
        PassDecl::new(PassKind::Geometry).produces(AttachmentId::Normal),
    ];
    assert!(matches!(RenderGraph::new(decls), Err(RenderError::PassOrder(_))));
}

#[test]
fn environment_must_be_prefiltered_before_first_use() {
    let graph = RenderGraph::standard(&all_passes(), false).unwrap();
    let result = graph.plan(fresh);
    assert!(matches!(result, Err(RenderError::AttachmentConflict(_))));
}

#[test]
fn prefiltered_environment_is_reused_without_transitions() {
    let graph = RenderGraph::standard(&all_passes(), false).unwrap();
    let plans = graph
        .plan(|id| {
            Some(if id == AttachmentId::Environment {
                sampled_state()
            } else {
                ImageState::UNDEFINED
            })
        })
        .unwrap();
    let lighting = plan_for(&plans, PassKind::Lighting);
    assert!(lighting
        .before
        .iter()
        .all(|barrier| barrier.attachment != AttachmentId::Environment));
}

#[test]
fn sampled_inputs_are_ready_before_lighting() {
    let graph = RenderGraph::standard(&all_passes(), true).unwrap();
    let plans = graph.plan(fresh).unwrap();

    // Geometry and shadow outputs move to the sampled state right after their pass.
    let lighting = plan_for(&plans, PassKind::Lighting);
    for input in [AttachmentId::Albedo, AttachmentId::Depth, AttachmentId::ShadowCascades] {
        assert!(lighting.before.iter().all(|barrier| barrier.attachment != input));
    }
    let light_accum = lighting
        .before
        .iter()
        .find(|barrier| barrier.attachment == AttachmentId::LightAccum)
        .expect("light accumulation prepared");
    assert!(light_accum.discards());
}

#[test]
fn composite_passes_keep_previous_contents() {
    let graph = RenderGraph::standard(&all_passes(), true).unwrap();
    let plans = graph.plan(fresh).unwrap();
    for kind in [PassKind::Skybox, PassKind::Volumetric] {
        let plan = plan_for(&plans, kind);
        let barrier = plan
            .before
            .iter()
            .find(|barrier| barrier.attachment == AttachmentId::LightAccum)
            .expect("light accumulation barrier");
        assert!(!barrier.discards(), "{kind:?} would discard the lit scene");
    }
}

#[test]
fn unallocated_attachment_fails_planning() {
    let toggles = PassToggles {
        volumetric: true,
        ..PassToggles::default()
    };
    let graph = RenderGraph::standard(&toggles, true).unwrap();
    let result = graph.plan(|id| match id {
        AttachmentId::Volumetric | AttachmentId::VolumetricBlur => None,
        _ => Some(ImageState::UNDEFINED),
    });
    assert!(matches!(result, Err(RenderError::AttachmentConflict(_))));
}
