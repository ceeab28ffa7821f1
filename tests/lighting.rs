mod common;

use deferred_frame_pipeline::backend::headless::CLEAR_DEPTH;
use deferred_frame_pipeline::backend::{
    AttachmentSlot, CullMode, DrawRecord, FramebufferHandle, ImageHandle, UniformValue,
};
use deferred_frame_pipeline::resources::TextureData;
use deferred_frame_pipeline::scene::{
    create_shadow_caster, PointLight, ShadowCasterDesc, ShadowLight, Transform,
};
use deferred_frame_pipeline::{Entity, LightingConfig, Renderer, World};
use glam::{UVec2, Vec3};
use rstest::rstest;
use std::collections::BTreeSet;

struct LitScene {
    renderer: Renderer,
    world: World,
    casters: Vec<Entity>,
}

fn lit_scene(shadow_casters: usize, point_lights: usize) -> LitScene {
    let mut renderer = common::renderer(64, 64, common::no_post());
    let mut world = World::new();
    common::spawn_cube(&mut renderer, &mut world);

    let casters = (0..shadow_casters)
        .map(|i| {
            let angle = i as f32 * 2.0;
            create_shadow_caster(
                &mut world,
                renderer.backend_mut(),
                ShadowCasterDesc {
                    distance: 10.0,
                    fov_degrees: 60.0,
                    buffer_size: UVec2::new(32, 32),
                    name: Some(format!("Caster{}", i)),
                    ..ShadowCasterDesc::new(
                        Vec3::new(angle.cos() * 5.0, 5.0, angle.sin() * 5.0),
                        Vec3::ZERO,
                    )
                },
            )
            .unwrap()
        })
        .collect();
    for i in 0..point_lights {
        world.spawn((
            PointLight::new(Vec3::ONE, 0.5),
            Transform::from_position(Vec3::new(i as f32, 2.0, 0.0)),
        ));
    }
    common::spawn_main_camera(&mut renderer, &mut world, Vec3::new(0.0, 3.0, 8.0));

    LitScene {
        renderer,
        world,
        casters,
    }
}

/// Depth image and framebuffer of a caster's shadow target
fn shadow_image(scene: &LitScene, caster: Entity) -> (ImageHandle, FramebufferHandle) {
    let light = scene.world.get::<ShadowLight>(caster).unwrap();
    let buffer = light.shadow_buffer.read();
    (
        buffer.get_attachment(AttachmentSlot::Depth).unwrap(),
        buffer.framebuffer(),
    )
}

fn draws(scene: &LitScene) -> Vec<DrawRecord> {
    common::headless(&scene.renderer).draws().cloned().collect()
}

#[rstest]
#[case(1)]
#[case(2)]
fn test_shadow_maps_drawn_before_accumulation(#[case] casters: usize) {
    let mut scene = lit_scene(casters, 1);
    scene.renderer.render_frame(&mut scene.world);

    let draws = draws(&scene);
    let accumulation = scene
        .renderer
        .lighting_layer()
        .accumulation()
        .read()
        .framebuffer();
    let first_accumulation = draws
        .iter()
        .position(|draw| draw.framebuffer == Some(accumulation))
        .unwrap();

    for caster in scene.casters.clone() {
        let (image, framebuffer) = shadow_image(&scene, caster);
        let shadow_draws: Vec<_> = draws
            .iter()
            .enumerate()
            .filter(|(_, draw)| draw.framebuffer == Some(framebuffer))
            .collect();
        // One cube
        assert_eq!(shadow_draws.len(), 1);
        assert!(shadow_draws.iter().all(|(index, draw)| {
            *index < first_accumulation && draw.cull_mode == CullMode::Front
        }));

        let texels = common::headless(&scene.renderer).read_image(image).unwrap();
        assert_eq!(texels.len(), 32 * 32);
        assert!(texels.iter().all(|texel| texel.x == CLEAR_DEPTH));
    }
}

#[test]
fn test_shadow_composites_precede_point_composites() {
    let mut scene = lit_scene(2, 2);
    scene.renderer.render_frame(&mut scene.world);

    let layer = scene.renderer.lighting_layer();
    let accumulation = layer.accumulation().read().framebuffer();
    let shadow_shader = layer.shadow_composite_shader().handle();
    let point_shader = layer.point_composite_shader().handle();
    let composites: Vec<_> = draws(&scene)
        .into_iter()
        .filter(|draw| draw.framebuffer == Some(accumulation))
        .collect();

    let shaders: Vec<_> = composites.iter().map(|draw| draw.shader).collect();
    assert_eq!(
        shaders,
        vec![
            Some(shadow_shader),
            Some(shadow_shader),
            Some(point_shader),
            Some(point_shader)
        ]
    );
    assert!(composites.iter().all(|draw| draw.blend.is_some() && !draw.depth_test));

    let sampled: BTreeSet<_> = composites[..2]
        .iter()
        .map(|draw| draw.images.get(&2).copied().unwrap())
        .collect();
    let expected: BTreeSet<_> = scene
        .casters
        .iter()
        .map(|caster| shadow_image(&scene, *caster).0)
        .collect();
    assert_eq!(sampled, expected);
}

#[test]
fn test_accumulation_cleared_to_ambient() {
    let mut scene = lit_scene(2, 1);
    scene.renderer.render_frame(&mut scene.world);

    let ambient = LightingConfig::default().ambient.extend(1.0);
    let image = scene
        .renderer
        .lighting_layer()
        .accumulation()
        .read()
        .get_attachment(AttachmentSlot::Color0)
        .unwrap();
    let texels = common::headless(&scene.renderer).read_image(image).unwrap();
    assert!(texels.iter().all(|texel| *texel == ambient));
}

#[test]
fn test_final_composite_reads_albedo_and_accumulation() {
    let mut scene = lit_scene(1, 1);
    scene.renderer.render_frame(&mut scene.world);

    let layer = scene.renderer.lighting_layer();
    let final_shader = layer.final_composite_shader().handle();
    let accumulation = layer
        .accumulation()
        .read()
        .get_attachment(AttachmentSlot::Color0)
        .unwrap();
    let main = scene.renderer.frame_state().current().output.clone().unwrap();
    let (main_fb, albedo) = {
        let main = main.read();
        (main.framebuffer(), main.get_attachment(AttachmentSlot::Color0).unwrap())
    };

    let draws = draws(&scene);
    let composite = draws
        .iter()
        .find(|draw| draw.shader == Some(final_shader))
        .unwrap();
    assert_eq!(composite.framebuffer, Some(main_fb));
    assert_eq!(composite.images.get(&1), Some(&albedo));
    assert_eq!(composite.images.get(&2), Some(&accumulation));
}

fn decorate_caster(
    scene: &mut LitScene,
    caster: Entity,
    decorate: impl FnOnce(ShadowLight) -> ShadowLight,
) {
    let light = scene.world.get::<ShadowLight>(caster).unwrap().clone();
    *scene.world.get_mut::<ShadowLight>(caster).unwrap() = decorate(light);
}

#[test]
fn test_masked_shadow_pass_samples_mask() {
    let mut scene = lit_scene(1, 0);
    let mask = TextureData::white()
        .upload(scene.renderer.backend_mut())
        .unwrap();
    let caster = scene.casters[0];
    decorate_caster(&mut scene, caster, |light| light.with_mask(mask));

    scene.renderer.render_frame(&mut scene.world);

    let (_, framebuffer) = shadow_image(&scene, caster);
    let draws = draws(&scene);
    let shadow_draw = draws
        .iter()
        .find(|draw| draw.framebuffer == Some(framebuffer))
        .unwrap();
    assert_eq!(shadow_draw.images.get(&0), Some(&mask));
    // The mask is released before the camera draws
    assert!(draws
        .iter()
        .filter(|draw| draw.framebuffer != Some(framebuffer))
        .all(|draw| draw.images.get(&0) != Some(&mask)));
}

#[rstest]
#[case::projector(true)]
#[case::plain(false)]
fn test_projector_image_bound_for_composite(#[case] with_projector: bool) {
    let mut scene = lit_scene(1, 0);
    let picture = TextureData::solid_color([255, 128, 0, 255], "picture")
        .upload(scene.renderer.backend_mut())
        .unwrap();
    let caster = scene.casters[0];
    if with_projector {
        decorate_caster(&mut scene, caster, |light| light.with_projector(picture, 0.5));
    }

    scene.renderer.render_frame(&mut scene.world);

    let shader = scene.renderer.lighting_layer().shadow_composite_shader().handle();
    let backend = common::headless(&scene.renderer);
    let composite = backend
        .draws()
        .find(|draw| draw.shader == Some(shader))
        .unwrap();
    assert_eq!(
        backend.uniform(shader, "b_IsProjector"),
        Some(UniformValue::from(with_projector))
    );
    if with_projector {
        assert_eq!(composite.images.get(&4), Some(&picture));
        assert_eq!(
            backend.uniform(shader, "a_ProjectorIntensity"),
            Some(UniformValue::Float(0.5))
        );
    } else {
        assert_eq!(composite.images.get(&4), None);
    }
}
