mod common;

use deferred_frame_pipeline::backend::{
    AttachmentSlot, BindMode, BufferFlags, CompletenessError, FilterMode, GraphicsBackend,
    HeadlessBackend, TextureFormat,
};
use deferred_frame_pipeline::{RenderBufferDesc, RenderTarget};
use glam::Vec4;
use rstest::rstest;

fn gbuffer_descs() -> [RenderBufferDesc; 4] {
    [
        RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true),
        RenderBufferDesc::new(AttachmentSlot::Color1, TextureFormat::Rgb10, true),
        RenderBufferDesc::new(AttachmentSlot::Color2, TextureFormat::Rgba8, false),
        RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, true),
    ]
}

fn target_with(backend: &mut HeadlessBackend, samples: u32, descs: &[RenderBufferDesc]) -> RenderTarget {
    let mut target = RenderTarget::new(backend, 64, 32, samples).unwrap();
    for desc in descs {
        target.add_attachment(backend, *desc).unwrap();
    }
    target
}

#[rstest]
#[case::color(&[RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgba8, true)])]
#[case::depth_only(&[RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, true)])]
#[case::renderbuffers(&[
    RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, false),
    RenderBufferDesc::new(AttachmentSlot::DepthStencil, TextureFormat::Depth24Stencil8, false),
])]
fn test_validate_with_attachments(#[case] descs: &[RenderBufferDesc]) {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, 1, descs);

    assert!(!target.is_valid());
    assert!(target.validate(&mut backend));
    assert!(target.is_valid());
    assert_eq!(target.completeness_error(), None);
}

#[test]
fn test_validate_without_attachments() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = RenderTarget::new(&mut backend, 64, 32, 1).unwrap();

    assert!(!target.validate(&mut backend));
    assert!(!target.is_valid());
    assert_eq!(
        target.completeness_error(),
        Some(CompletenessError::MissingAttachment)
    );
}

#[rstest]
#[case(1)]
#[case(4)]
fn test_resize_to_same_size_keeps_stores(#[case] samples: u32) {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, samples, &gbuffer_descs());
    target.validate(&mut backend);

    target.resize(&mut backend, 128, 64).unwrap();
    let after_first = backend.counters();
    target.resize(&mut backend, 128, 64).unwrap();

    assert_eq!(backend.counters(), after_first);
    assert!(target.is_valid());
    assert_eq!(target.size(), (128, 64));
}

#[test]
fn test_resize_recreates_every_store() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, 1, &gbuffer_descs());
    let before = backend.counters();

    target.resize(&mut backend, 32, 16).unwrap();

    let after = backend.counters();
    assert_eq!(after.backing_stores_created() - before.backing_stores_created(), 4);
    assert_eq!(after.backing_stores_destroyed() - before.backing_stores_destroyed(), 4);
    let image = target.get_attachment(AttachmentSlot::Color0).unwrap();
    let desc = backend.image_descriptor(image).unwrap();
    assert_eq!((desc.width, desc.height), (32, 16));
}

#[rstest]
#[case::image(true)]
#[case::renderbuffer(false)]
fn test_overwriting_slot_releases_previous_store(#[case] readable: bool) {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(
        &mut backend,
        1,
        &[RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, readable)],
    );
    let before = backend.counters();

    target
        .add_attachment(
            &mut backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgba8, readable),
        )
        .unwrap();

    let after = backend.counters();
    assert_eq!(after.backing_stores_destroyed() - before.backing_stores_destroyed(), 1);
    assert_eq!(after.live_images() + after.live_renderbuffers(), 1);
    assert_eq!(target.draw_slots(), &[AttachmentSlot::Color0]);
    assert_eq!(
        target.attachment_desc(AttachmentSlot::Color0).map(|desc| desc.format),
        Some(TextureFormat::Rgba8)
    );
}

#[test]
fn test_overwriting_multisampled_slot_replaces_resolve_mirror() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(
        &mut backend,
        4,
        &[RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true)],
    );
    let old_image = target.get_attachment(AttachmentSlot::Color0).unwrap();
    let before = backend.counters();

    target
        .add_attachment(
            &mut backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgba8, true),
        )
        .unwrap();

    let after = backend.counters();
    // The multisampled store and its single-sample mirror
    assert_eq!(after.backing_stores_destroyed() - before.backing_stores_destroyed(), 2);
    assert_eq!(after.live_images(), 2);

    let resolve = target.resolve_target().unwrap();
    assert_eq!(resolve.draw_slots(), &[AttachmentSlot::Color0]);
    assert_eq!(
        resolve.attachment_desc(AttachmentSlot::Color0).map(|desc| desc.format),
        Some(TextureFormat::Rgba8)
    );
    let new_image = target.get_attachment(AttachmentSlot::Color0).unwrap();
    assert_ne!(new_image, old_image);
    assert_eq!(backend.image_descriptor(new_image).unwrap().samples, 1);
    assert!(target.validate(&mut backend));
}

#[test]
fn test_non_readable_overwrite_keeps_resolve_mirror() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(
        &mut backend,
        4,
        &[RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true)],
    );
    let mirror = target.get_attachment(AttachmentSlot::Color0).unwrap();

    target
        .add_attachment(
            &mut backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgba8, false),
        )
        .unwrap();

    assert_eq!(target.get_attachment(AttachmentSlot::Color0), Some(mirror));
    assert_eq!(
        target
            .resolve_target()
            .and_then(|resolve| resolve.attachment_desc(AttachmentSlot::Color0))
            .map(|desc| desc.format),
        Some(TextureFormat::Rgb8)
    );
}

#[rstest]
#[case(2)]
#[case(4)]
#[case(8)]
fn test_multisampled_unbind_resolves_readable_slots(#[case] samples: u32) {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, samples, &gbuffer_descs());
    target.validate(&mut backend);
    assert_eq!(target.samples(), samples);

    target.bind(&mut backend, BindMode::Draw);
    backend.clear_commands();
    target.unbind(&mut backend);

    let blits: Vec<_> = backend.blits().map(|(_, _, desc)| *desc).collect();
    let depth: Vec<_> = blits
        .iter()
        .filter(|desc| desc.buffers == (BufferFlags::DEPTH | BufferFlags::STENCIL))
        .collect();
    let color: Vec<_> = blits
        .iter()
        .filter(|desc| desc.buffers == BufferFlags::COLOR)
        .collect();

    assert_eq!(depth.len(), 1);
    assert_eq!(depth[0].filter, FilterMode::Nearest);
    // Color2 is a renderbuffer and has no resolve counterpart
    assert_eq!(
        color.iter().map(|desc| desc.color_slot).collect::<Vec<_>>(),
        vec![AttachmentSlot::Color0, AttachmentSlot::Color1]
    );
    assert!(color.iter().all(|desc| desc.filter == FilterMode::Linear));
    assert_eq!(blits.len(), 3);
}

#[test]
fn test_single_sample_unbind_has_no_blits() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, 1, &gbuffer_descs());
    target.validate(&mut backend);

    target.bind(&mut backend, BindMode::Both);
    backend.clear_commands();
    target.unbind(&mut backend);

    assert_eq!(backend.blits().count(), 0);
}

#[test]
fn test_resolved_contents_are_sampled() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, 4, &gbuffer_descs());
    target.validate(&mut backend);
    let color = Vec4::new(0.25, 0.5, 0.75, 1.0);

    target.bind(&mut backend, BindMode::Draw);
    backend.set_clear_color(color);
    backend.clear(BufferFlags::COLOR | BufferFlags::DEPTH);
    target.unbind(&mut backend);

    let resolved = target.get_attachment(AttachmentSlot::Color0).unwrap();
    assert_eq!(backend.image_descriptor(resolved).unwrap().samples, 1);
    assert!(backend.read_image(resolved).unwrap().iter().all(|t| *t == color));
    let depth = target.get_attachment(AttachmentSlot::Depth).unwrap();
    assert!(backend
        .read_image(depth)
        .unwrap()
        .iter()
        .all(|t| t.x == 1.0));
}

#[test]
fn test_resize_then_revalidate() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(512, 512);
    let mut target = RenderTarget::new(&mut backend, 256, 256, 1).unwrap();
    target
        .add_attachment(
            &mut backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true),
        )
        .unwrap();
    assert!(target.validate(&mut backend));

    target.resize(&mut backend, 512, 512).unwrap();
    assert!(target.validate(&mut backend));

    let image = target.get_attachment(AttachmentSlot::Color0).unwrap();
    let desc = backend.image_descriptor(image).unwrap();
    assert_eq!((desc.width, desc.height), (512, 512));
    assert_eq!(backend.read_image(image).unwrap().len(), 512 * 512);
}

#[test]
fn test_destroy_releases_resolve_target() {
    common::init_logging();
    let mut backend = HeadlessBackend::new(64, 32);
    let mut target = target_with(&mut backend, 4, &gbuffer_descs());
    target.validate(&mut backend);

    target.destroy(&mut backend);

    let counters = backend.counters();
    assert_eq!(counters.live_images(), 0);
    assert_eq!(counters.live_renderbuffers(), 0);
    assert_eq!(counters.live_framebuffers(), 0);
}
