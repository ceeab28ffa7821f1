//! Deferred lighting demo
//!
//! Run with:
//!   cargo run --example demo
//!   cargo run --example demo -- --samples 4 --no-vsync
//!   cargo run --example demo -- --projector picture.png
//!
//! Controls:
//!   B        - Toggle bloom
//!   M        - Toggle motion blur
//!   T        - Toggle depth of field
//!   Space    - Pause the camera orbit
//!   Escape   - Exit

use clap::Parser;
use deferred_frame_pipeline::{
    init_logging,
    resources::{load_image, Material, Mesh, MeshData, Shader},
    scene::{
        create_gbuffer_target, create_shadow_caster, Camera, PointLight, Projection, Renderable,
        ShadowCasterDesc, ShadowLight, Transform,
    },
    shaders, BackendType, EguiOverlay, EngineConfig, Entity, PostConfig, Renderer, WgpuBackend,
    Window, World,
};
use glam::{Mat4, UVec2, Vec3, Vec4};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    keyboard::KeyCode,
};

#[derive(Parser, Debug)]
#[command(about = "Shadowed deferred lighting with a post-processing chain")]
struct Args {
    /// Initial window width
    #[arg(long, default_value_t = 1280)]
    width: u32,
    /// Initial window height
    #[arg(long, default_value_t = 720)]
    height: u32,
    /// Samples per pixel of the main camera's G-buffer
    #[arg(long, default_value_t = 1)]
    samples: u32,
    /// Present without waiting for vertical sync
    #[arg(long)]
    no_vsync: bool,
    /// Start with the post-processing chain disabled
    #[arg(long)]
    no_post: bool,
    /// Picture projected by the key light
    #[arg(long)]
    projector: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> EngineConfig {
        let enabled = !self.no_post;
        EngineConfig {
            width: self.width,
            height: self.height,
            backend: BackendType::Wgpu,
            vsync: !self.no_vsync,
            samples: self.samples,
            post: PostConfig {
                bloom: enabled,
                motion_blur: enabled,
                depth_of_field: enabled,
                ..PostConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

struct DemoState {
    camera: Entity,
    orbit_angle: f32,
    paused: bool,
    last_frame: Instant,
    fps: f32,
}

fn camera_projection(width: u32, height: u32) -> Mat4 {
    let aspect = width.max(1) as f32 / height.max(1) as f32;
    Projection::perspective(60.0, aspect, 0.1, 100.0).matrix()
}

fn orbit_transform(angle: f32) -> Transform {
    let position = Vec3::new(angle.cos() * 12.0, 5.0, angle.sin() * 12.0);
    Transform::looking_at(position, Vec3::new(0.0, 1.0, 0.0), Vec3::Y)
}

fn setup_scene(
    world: &mut World,
    renderer: &mut Renderer,
    config: &EngineConfig,
    projector: Option<&Path>,
) -> Result<Entity, Box<dyn Error>> {
    let backend = renderer.backend_mut();
    let shader = Shader::new(backend, "SceneGBuffer", shaders::SCENE_GBUFFER)?;
    let material = |name: &str, albedo: Vec3| {
        Arc::new(Material::new(name, shader.clone()).with_uniform("a_Albedo", albedo))
    };

    let cube = Mesh::upload(backend, &MeshData::cube())?;
    let sphere = Mesh::upload(backend, &MeshData::sphere(32, 16))?;
    let plane = Mesh::upload(backend, &MeshData::plane(30.0, 30.0, 1))?;

    world.spawn((
        Renderable::new(plane, material("Ground", Vec3::splat(0.6))).without_shadows(),
        Transform::new(),
    ));
    let colors = [
        Vec3::new(0.9, 0.2, 0.2),
        Vec3::new(0.2, 0.8, 0.3),
        Vec3::new(0.2, 0.4, 0.9),
        Vec3::new(0.9, 0.8, 0.2),
    ];
    for (i, color) in colors.iter().enumerate() {
        let angle = i as f32 * std::f32::consts::FRAC_PI_2;
        world.spawn((
            Renderable::new(cube.clone(), material(&format!("Cube{}", i), *color)),
            Transform::from_position(Vec3::new(angle.cos() * 4.0, 0.5, angle.sin() * 4.0)),
        ));
    }
    world.spawn((
        Renderable::new(sphere, material("Sphere", Vec3::splat(0.95))),
        Transform::from_position_scale(Vec3::new(0.0, 1.5, 0.0), Vec3::splat(1.5)),
    ));

    let key_light = create_shadow_caster(
        world,
        backend,
        ShadowCasterDesc {
            distance: 30.0,
            buffer_size: UVec2::new(2048, 2048),
            name: Some("KeyLight".into()),
            ..ShadowCasterDesc::new(Vec3::new(8.0, 12.0, 6.0), Vec3::ZERO)
        },
    )?;
    if let Some(path) = projector {
        let picture = load_image(backend, path)?;
        if let Some(mut light) = world.get_mut::<ShadowLight>(key_light) {
            *light = light.clone().with_projector(picture, 0.5);
        }
    }
    create_shadow_caster(
        world,
        backend,
        ShadowCasterDesc {
            distance: 25.0,
            fov_degrees: 45.0,
            name: Some("FillLight".into()),
            ..ShadowCasterDesc::new(Vec3::new(-10.0, 8.0, -4.0), Vec3::ZERO)
        },
    )?;

    for (position, color) in [
        (Vec3::new(3.0, 1.0, 3.0), Vec3::new(1.0, 0.5, 0.2)),
        (Vec3::new(-3.0, 1.0, -3.0), Vec3::new(0.2, 0.5, 1.0)),
    ] {
        world.spawn((PointLight::new(color * 4.0, 0.25), Transform::from_position(position)));
    }

    let (width, height) = backend.surface_size();
    let target = create_gbuffer_target(backend, width, height, config.samples)?.shared();
    let camera = Camera::main(target, camera_projection(width, height))
        .with_clear_color(Vec4::new(0.05, 0.05, 0.08, 1.0))
        .double_buffered(backend)?;
    Ok(world.spawn((camera, orbit_transform(0.0))).id())
}

fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let args = Args::parse();
    let config = args.config();

    let event_loop = EventLoop::new()?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;
    let backend = WgpuBackend::new(window.window_arc(), config.vsync)?;
    let mut overlay = EguiOverlay::new(&backend, window.window());
    let mut renderer = Renderer::new(Box::new(backend), config.clone())?;

    let mut world = World::new();
    let camera = setup_scene(
        &mut world,
        &mut renderer,
        &config,
        args.projector.as_deref(),
    )?;
    let mut state = DemoState {
        camera,
        orbit_angle: 0.0,
        paused: false,
        last_frame: Instant::now(),
        fps: 0.0,
    };
    log::info!("Press B, M or T to toggle bloom, motion blur and depth of field");

    event_loop.run(move |event, elwt| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => {
                let consumed = overlay.on_window_event(window.window(), &event);
                if !consumed || !matches!(event, WindowEvent::KeyboardInput { .. }) {
                    window.handle_event(&event);
                }
                if window.should_close() {
                    elwt.exit();
                    return;
                }

                if window.was_resized() {
                    window.clear_resize_flag();
                    let (width, height) = window.dimensions();
                    renderer.resize(&mut world, width, height);
                    if let Some(backend) = renderer.backend_as::<WgpuBackend>() {
                        overlay.on_resize(backend, width, height);
                    }
                    if let Some(mut camera) = world.get_mut::<Camera>(state.camera) {
                        camera.projection = camera_projection(width, height);
                    }
                }

                if let WindowEvent::RedrawRequested = event {
                    render(&mut renderer, &mut world, &mut overlay, &window, &mut state);
                }
            }
            Event::AboutToWait => {
                let input = window.take_input();
                if input.was_pressed(KeyCode::Escape) {
                    elwt.exit();
                    return;
                }
                if input.was_pressed(KeyCode::Space) {
                    state.paused = !state.paused;
                }
                if !overlay.wants_keyboard_input() {
                    renderer.update(&input);
                }
                window.request_redraw();
            }
            Event::LoopExiting => renderer.destroy(),
            _ => {}
        }
    })?;
    Ok(())
}

fn render(
    renderer: &mut Renderer,
    world: &mut World,
    overlay: &mut EguiOverlay,
    window: &Window,
    state: &mut DemoState,
) {
    let now = Instant::now();
    let dt = (now - state.last_frame).as_secs_f32();
    state.last_frame = now;
    if dt > 0.0 {
        state.fps = state.fps * 0.9 + (1.0 / dt) * 0.1;
    }
    if !state.paused {
        state.orbit_angle += dt * 0.3;
        if let Some(mut transform) = world.get_mut::<Transform>(state.camera) {
            *transform = orbit_transform(state.orbit_angle);
        }
    }

    if !renderer.render_scene(world) {
        return;
    }

    let fps = state.fps;
    overlay.run(window.window(), |ctx| {
        egui::Window::new("Stats")
            .default_pos([10.0, 10.0])
            .show(ctx, |ui| {
                ui.label(format!("FPS: {:.1}", fps));
                ui.label("B / M / T toggle post effects");
                ui.label("Space pauses the camera");
            });
        renderer.show_ui(ctx);
    });
    if let Some(backend) = renderer.backend_as_mut::<WgpuBackend>() {
        overlay.render(backend);
    }
    renderer.end_frame();
}
