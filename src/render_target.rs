//! Off-screen render targets
//!
//! A [`RenderTarget`] owns a backend framebuffer and the backing stores attached to its
//! slots. Multisampled targets carry a single-sample resolve target that mirrors every
//! shader-readable attachment and is filled on [`RenderTarget::unbind`].

use crate::backend::{
    AttachmentHandle, AttachmentSlot, BackendError, BackendResult, BindMode, BlitDescriptor,
    BufferFlags, CompletenessError, FilterMode, FramebufferHandle, GraphicsBackend, IRect,
    ImageDescriptor, ImageHandle, TextureFormat,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Render target shared between cameras, lights and passes
pub type SharedRenderTarget = Arc<RwLock<RenderTarget>>;

/// Description of one attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderBufferDesc {
    pub slot: AttachmentSlot,
    pub format: TextureFormat,
    /// Backed by an image that shaders can sample, instead of an opaque renderbuffer
    pub shader_readable: bool,
}

impl RenderBufferDesc {
    pub fn new(slot: AttachmentSlot, format: TextureFormat, shader_readable: bool) -> Self {
        Self {
            slot,
            format,
            shader_readable,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Attachment {
    store: AttachmentHandle,
    desc: RenderBufferDesc,
}

/// Off-screen drawing destination made of attachments
pub struct RenderTarget {
    framebuffer: FramebufferHandle,
    width: u32,
    height: u32,
    samples: u32,
    valid: bool,
    binding: BindMode,
    attachments: BTreeMap<AttachmentSlot, Attachment>,
    draw_slots: Vec<AttachmentSlot>,
    resolve: Option<Box<RenderTarget>>,
    completeness_error: Option<CompletenessError>,
    debug_name: Option<String>,
    destroyed: bool,
}

impl RenderTarget {
    /// Create an empty target
    ///
    /// The sample count is clamped into `1..=backend.max_samples()`. A multisampled target
    /// also creates its single-sample resolve target.
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
        samples: u32,
    ) -> BackendResult<Self> {
        if width == 0 || height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "render target size must be non-zero, got {}x{}",
                width, height
            )));
        }
        let samples = samples.clamp(1, backend.max_samples().max(1));
        let framebuffer = backend.create_framebuffer(None)?;
        log::info!(
            "Created render target {:?} ({}x{}, {} samples)",
            framebuffer,
            width,
            height,
            samples
        );

        let resolve = if samples > 1 {
            Some(Box::new(RenderTarget::new(backend, width, height, 1)?))
        } else {
            None
        };

        Ok(Self {
            framebuffer,
            width,
            height,
            samples,
            valid: false,
            binding: BindMode::None,
            attachments: BTreeMap::new(),
            draw_slots: Vec::new(),
            resolve,
            completeness_error: None,
            debug_name: None,
            destroyed: false,
        })
    }

    /// Wrap into the shared ownership model
    pub fn shared(self) -> SharedRenderTarget {
        Arc::new(RwLock::new(self))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn binding(&self) -> BindMode {
        self.binding
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    /// Color slots written simultaneously, in first-attach order
    pub fn draw_slots(&self) -> &[AttachmentSlot] {
        &self.draw_slots
    }

    pub fn has_attachment(&self, slot: AttachmentSlot) -> bool {
        self.attachments.contains_key(&slot)
    }

    pub fn attachment_desc(&self, slot: AttachmentSlot) -> Option<RenderBufferDesc> {
        self.attachments.get(&slot).map(|attachment| attachment.desc)
    }

    /// Backing store currently attached to a slot
    pub fn attachment_store(&self, slot: AttachmentSlot) -> Option<AttachmentHandle> {
        self.attachments.get(&slot).map(|attachment| attachment.store)
    }

    /// Reason of the last failed validation
    pub fn completeness_error(&self) -> Option<CompletenessError> {
        self.completeness_error
    }

    /// Single-sample target multisampled contents are resolved into
    pub fn resolve_target(&self) -> Option<&RenderTarget> {
        self.resolve.as_deref()
    }

    pub fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }

    /// Attach a new backing store to `desc.slot`
    ///
    /// An occupied slot loses its previous store. Shader-readable attachments of a
    /// multisampled target are mirrored onto the resolve target. Re-adding a slot as
    /// non-readable leaves the resolve target's earlier mirror of that slot in place.
    pub fn add_attachment(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        desc: RenderBufferDesc,
    ) -> BackendResult<()> {
        if self.attachments.contains_key(&desc.slot) {
            log::warn!(
                "A target is already bound to slot {} of {:?}, deleting existing target",
                desc.slot,
                self.framebuffer
            );
        } else if desc.slot.is_color() {
            self.draw_slots.push(desc.slot);
            backend.set_draw_slots(self.framebuffer, &self.draw_slots);
        }

        self.create_store(backend, desc)?;

        if desc.shader_readable {
            if let Some(resolve) = self.resolve.as_mut() {
                resolve.add_attachment(backend, desc)?;
            }
        }

        self.valid = false;
        Ok(())
    }

    /// Replace the store of `desc.slot` without the overwrite warning
    fn create_store(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        desc: RenderBufferDesc,
    ) -> BackendResult<()> {
        if let Some(previous) = self.attachments.remove(&desc.slot) {
            backend.attach(self.framebuffer, desc.slot, None);
            release_store(backend, previous.store);
        }

        let image_desc = ImageDescriptor {
            label: self
                .debug_name
                .as_ref()
                .map(|name| format!("{}_{}", name, desc.slot)),
            width: self.width,
            height: self.height,
            format: desc.format,
            samples: self.samples,
        };
        let store = if desc.shader_readable {
            AttachmentHandle::Image(backend.create_image(&image_desc)?)
        } else {
            AttachmentHandle::Renderbuffer(backend.create_renderbuffer(&image_desc)?)
        };

        backend.attach(self.framebuffer, desc.slot, Some(store));
        self.attachments.insert(desc.slot, Attachment { store, desc });
        Ok(())
    }

    /// Recreate every attachment at a new size
    ///
    /// Image handles retrieved before a resize no longer refer to this target's stores.
    pub fn resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "render target size must be non-zero, got {}x{}",
                width, height
            )));
        }

        if width != self.width || height != self.height {
            log::debug!(
                "Resizing render target {:?} from {}x{} to {}x{}",
                self.framebuffer,
                self.width,
                self.height,
                width,
                height
            );
            self.width = width;
            self.height = height;
            let descs: Vec<_> = self.attachments.values().map(|a| a.desc).collect();
            for desc in descs {
                self.create_store(backend, desc)?;
            }
            self.valid = false;
            self.validate(backend);
        }

        if let Some(resolve) = self.resolve.as_mut() {
            resolve.resize(backend, width, height)?;
        }
        Ok(())
    }

    /// Ask the backend whether the attachments form a drawable target
    ///
    /// Failures are logged and leave the target marked invalid.
    pub fn validate(&mut self, backend: &mut dyn GraphicsBackend) -> bool {
        if let Some(resolve) = self.resolve.as_mut() {
            resolve.validate(backend);
        }

        match backend.check_completeness(self.framebuffer) {
            Ok(()) => {
                self.valid = true;
                self.completeness_error = None;
            }
            Err(err) => {
                log::error!(
                    "Render target {} failed to validate: {}",
                    self.display_name(),
                    err
                );
                self.valid = false;
                self.completeness_error = Some(err);
            }
        }
        self.valid
    }

    pub fn bind(&mut self, backend: &mut dyn GraphicsBackend, mode: BindMode) {
        self.binding = mode;
        backend.bind_framebuffer(mode, Some(self.framebuffer));
    }

    /// Release the binding, resolving multisampled contents first
    pub fn unbind(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.binding == BindMode::None {
            return;
        }

        if let Some(resolve) = self.resolve.as_ref() {
            let full = IRect::from_size(self.width, self.height);
            backend.bind_framebuffer(BindMode::Read, Some(self.framebuffer));
            backend.bind_framebuffer(BindMode::Draw, Some(resolve.framebuffer));
            backend.blit(&BlitDescriptor {
                src: full,
                dst: full,
                buffers: BufferFlags::DEPTH | BufferFlags::STENCIL,
                filter: FilterMode::Nearest,
                color_slot: AttachmentSlot::Color0,
            });
            for slot in self
                .draw_slots
                .iter()
                .filter(|slot| resolve.attachments.contains_key(slot))
            {
                backend.blit(&BlitDescriptor {
                    src: full,
                    dst: full,
                    buffers: BufferFlags::COLOR,
                    filter: FilterMode::Linear,
                    color_slot: *slot,
                });
            }
            backend.bind_framebuffer(BindMode::Both, None);
        }

        backend.bind_framebuffer(self.binding, None);
        self.binding = BindMode::None;
    }

    /// Copy between the currently bound read and draw targets
    ///
    /// Regions of different sizes scale the copy.
    pub fn blit(
        backend: &mut dyn GraphicsBackend,
        src: IRect,
        dst: IRect,
        buffers: BufferFlags,
        filter: FilterMode,
    ) {
        backend.blit(&BlitDescriptor {
            src,
            dst,
            buffers,
            filter,
            color_slot: AttachmentSlot::Color0,
        });
    }

    /// Sampleable image behind a slot
    pub fn get_attachment(&self, slot: AttachmentSlot) -> Option<ImageHandle> {
        if let Some(resolve) = self.resolve.as_ref() {
            return resolve.get_attachment(slot);
        }
        match self.attachments.get(&slot)?.store {
            AttachmentHandle::Image(image) => Some(image),
            AttachmentHandle::Renderbuffer(_) => None,
        }
    }

    /// Bind a slot's image to a texture slot; a slot without an image binds nothing
    pub fn bind_attachment(
        &self,
        backend: &mut dyn GraphicsBackend,
        texture_slot: u32,
        slot: AttachmentSlot,
    ) -> Option<ImageHandle> {
        let image = self.get_attachment(slot)?;
        backend.bind_image(texture_slot, Some(image));
        Some(image)
    }

    /// Bind the first color attachment to a texture slot
    pub fn bind_color(
        &self,
        backend: &mut dyn GraphicsBackend,
        texture_slot: u32,
    ) -> Option<ImageHandle> {
        self.bind_attachment(backend, texture_slot, AttachmentSlot::Color0)
    }

    /// New target with the same size, samples and attachment descriptions
    ///
    /// Contents are not copied.
    pub fn clone_target(&self, backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let mut result = RenderTarget::new(backend, self.width, self.height, self.samples)?;
        for attachment in self.attachments.values() {
            result.add_attachment(backend, attachment.desc)?;
        }
        result.validate(backend);
        Ok(result)
    }

    /// Label the framebuffer and every attachment as `name_Slot`
    pub fn set_debug_name(&mut self, backend: &mut dyn GraphicsBackend, name: &str) {
        backend.set_framebuffer_label(self.framebuffer, name);
        for (slot, attachment) in &self.attachments {
            backend.set_attachment_label(attachment.store, &format!("{}_{}", name, slot));
        }
        if let Some(resolve) = self.resolve.as_mut() {
            resolve.set_debug_name(backend, &format!("{}_Resolve", name));
        }
        self.debug_name = Some(name.to_string());
    }

    /// Release the framebuffer and every backing store, resolve target included
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.destroyed {
            return;
        }
        log::info!("Deleting render target {}", self.display_name());
        for (_, attachment) in std::mem::take(&mut self.attachments) {
            release_store(backend, attachment.store);
        }
        self.draw_slots.clear();
        backend.destroy_framebuffer(self.framebuffer);
        if let Some(resolve) = self.resolve.as_mut() {
            resolve.destroy(backend);
        }
        self.valid = false;
        self.destroyed = true;
    }

    fn display_name(&self) -> String {
        match &self.debug_name {
            Some(name) => format!("'{}'", name),
            None => format!("{:?}", self.framebuffer),
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        if !self.destroyed && !self.attachments.is_empty() {
            log::warn!(
                "Render target {} dropped without destroy, leaking {} attachments",
                self.display_name(),
                self.attachments.len()
            );
        }
    }
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("framebuffer", &self.framebuffer)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("samples", &self.samples)
            .field("valid", &self.valid)
            .field("draw_slots", &self.draw_slots)
            .finish()
    }
}

fn release_store(backend: &mut dyn GraphicsBackend, store: AttachmentHandle) {
    match store {
        AttachmentHandle::Image(image) => backend.destroy_image(image),
        AttachmentHandle::Renderbuffer(rb) => backend.destroy_renderbuffer(rb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{Command, HeadlessBackend};

    fn color(slot: AttachmentSlot) -> RenderBufferDesc {
        RenderBufferDesc::new(slot, TextureFormat::Rgb8, true)
    }

    #[test]
    fn test_samples_are_clamped() {
        let mut backend = HeadlessBackend::new(64, 64).with_max_samples(4);
        let mut target = RenderTarget::new(&mut backend, 32, 32, 16).unwrap();
        assert_eq!(target.samples(), 4);
        assert!(target.resolve_target().is_some());
        target.destroy(&mut backend);

        let mut target = RenderTarget::new(&mut backend, 32, 32, 0).unwrap();
        assert_eq!(target.samples(), 1);
        assert!(target.resolve_target().is_none());
        target.destroy(&mut backend);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut backend = HeadlessBackend::default();
        assert!(RenderTarget::new(&mut backend, 0, 16, 1).is_err());
    }

    #[test]
    fn test_draw_slots_follow_first_attach_order() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 1).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color2)).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target
            .add_attachment(
                &mut backend,
                RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, false),
            )
            .unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color2)).unwrap();

        assert_eq!(
            target.draw_slots(),
            &[AttachmentSlot::Color2, AttachmentSlot::Color0]
        );
        assert_eq!(
            backend.draw_slots(target.framebuffer()).unwrap(),
            &[AttachmentSlot::Color2, AttachmentSlot::Color0]
        );
        target.destroy(&mut backend);
    }

    #[test]
    fn test_add_attachment_invalidates() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 1).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        assert!(target.validate(&mut backend));
        target.add_attachment(&mut backend, color(AttachmentSlot::Color1)).unwrap();
        assert!(!target.is_valid());
        target.destroy(&mut backend);
    }

    #[test]
    fn test_renderbuffer_is_not_sampleable() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 1).unwrap();
        target
            .add_attachment(
                &mut backend,
                RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth24, false),
            )
            .unwrap();
        assert_eq!(target.get_attachment(AttachmentSlot::Depth), None);
        assert_eq!(target.get_attachment(AttachmentSlot::Color0), None);
        assert_eq!(
            target.bind_attachment(&mut backend, 0, AttachmentSlot::Color0),
            None
        );
        assert!(backend.bound_images().is_empty());
        target.destroy(&mut backend);
    }

    #[test]
    fn test_multisampled_attachment_reads_from_resolve() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 4).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        let resolved = target
            .resolve_target()
            .and_then(|resolve| resolve.get_attachment(AttachmentSlot::Color0));
        assert!(resolved.is_some());
        assert_eq!(target.get_attachment(AttachmentSlot::Color0), resolved);
        assert_eq!(
            backend.image_descriptor(resolved.unwrap()).unwrap().samples,
            1
        );
        target.destroy(&mut backend);
    }

    #[test]
    fn test_unbind_single_sample_does_not_blit() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 1).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target.bind(&mut backend, BindMode::Draw);
        target.unbind(&mut backend);
        assert_eq!(backend.blits().count(), 0);
        assert_eq!(target.binding(), BindMode::None);
        assert_eq!(backend.bound_draw_target(), None);
        target.destroy(&mut backend);
    }

    #[test]
    fn test_unbind_without_bind_is_noop() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 4).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        backend.clear_commands();
        target.unbind(&mut backend);
        assert!(backend.commands().is_empty());
        target.destroy(&mut backend);
    }

    #[test]
    fn test_debug_name_labels_attachments() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 1).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target.set_debug_name(&mut backend, "Scene");
        let image = target.get_attachment(AttachmentSlot::Color0).unwrap();
        assert_eq!(backend.image_label(image), Some("Scene_Color0"));
        assert_eq!(backend.framebuffer_label(target.framebuffer()), Some("Scene"));
        target.destroy(&mut backend);
    }

    #[test]
    fn test_clone_matches_layout() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 24, 12, 4).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target
            .add_attachment(
                &mut backend,
                RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, true),
            )
            .unwrap();
        let mut copy = target.clone_target(&mut backend).unwrap();
        assert_eq!(copy.size(), (24, 12));
        assert_eq!(copy.samples(), 4);
        assert!(copy.is_valid());
        assert_ne!(copy.framebuffer(), target.framebuffer());
        assert_eq!(copy.draw_slots(), target.draw_slots());
        assert_ne!(
            copy.get_attachment(AttachmentSlot::Color0),
            target.get_attachment(AttachmentSlot::Color0)
        );
        copy.destroy(&mut backend);
        target.destroy(&mut backend);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut backend = HeadlessBackend::default();
        let mut target = RenderTarget::new(&mut backend, 16, 16, 4).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target
            .add_attachment(
                &mut backend,
                RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, false),
            )
            .unwrap();
        target.destroy(&mut backend);
        target.destroy(&mut backend);

        let counters = backend.counters();
        assert_eq!(counters.live_images(), 0);
        assert_eq!(counters.live_renderbuffers(), 0);
        assert_eq!(counters.live_framebuffers(), 0);
    }

    #[test]
    fn test_static_blit_uses_bound_targets() {
        let mut backend = HeadlessBackend::new(8, 8);
        let mut target = RenderTarget::new(&mut backend, 8, 8, 1).unwrap();
        target.add_attachment(&mut backend, color(AttachmentSlot::Color0)).unwrap();
        target.bind(&mut backend, BindMode::Read);
        backend.bind_framebuffer(BindMode::Draw, None);
        RenderTarget::blit(
            &mut backend,
            IRect::from_size(8, 8),
            IRect::from_size(8, 8),
            BufferFlags::COLOR,
            FilterMode::Nearest,
        );
        let (read, draw, _) = backend.blits().next().unwrap();
        assert_eq!(*read, Some(target.framebuffer()));
        assert_eq!(*draw, None);
        assert!(matches!(
            backend.commands().last(),
            Some(Command::Blit { .. })
        ));
        target.unbind(&mut backend);
        target.destroy(&mut backend);
    }
}
