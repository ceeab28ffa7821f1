//! Materials: a shader plus the raster state and values it is drawn with

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::Shader;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    shader: Arc<Shader>,
    pub blend: Option<BlendState>,
    pub cull_mode: CullMode,
    pub depth_test: bool,
    uniforms: BTreeMap<String, UniformValue>,
    textures: BTreeMap<u32, ImageHandle>,
}

impl Material {
    pub fn new(name: &str, shader: Arc<Shader>) -> Self {
        Self {
            name: name.to_string(),
            shader,
            blend: None,
            cull_mode: CullMode::Back,
            depth_test: true,
            uniforms: BTreeMap::new(),
            textures: BTreeMap::new(),
        }
    }

    pub fn with_blend(mut self, blend: BlendState) -> Self {
        self.blend = Some(blend);
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }

    pub fn with_uniform(mut self, name: &str, value: impl Into<UniformValue>) -> Self {
        self.set_uniform(name, value);
        self
    }

    pub fn with_texture(mut self, slot: u32, image: ImageHandle) -> Self {
        self.textures.insert(slot, image);
        self
    }

    pub fn set_uniform(&mut self, name: &str, value: impl Into<UniformValue>) {
        self.uniforms.insert(name.to_string(), value.into());
    }

    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name).copied()
    }

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    pub fn is_blended(&self) -> bool {
        self.blend.is_some()
    }

    /// Upload raster state, uniform values and textures
    ///
    /// The material's shader must already be bound.
    pub fn apply(&self, backend: &mut dyn GraphicsBackend) {
        backend.set_blend_state(self.blend);
        backend.set_cull_mode(self.cull_mode);
        backend.set_depth_test(self.depth_test);
        for (name, value) in &self.uniforms {
            backend.set_uniform(self.shader.handle(), name, *value);
        }
        for (slot, image) in &self.textures {
            backend.bind_image(*slot, Some(*image));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use glam::Vec3;

    #[test]
    fn test_apply_uploads_state_and_uniforms() {
        let mut backend = HeadlessBackend::default();
        let shader = Shader::new(&mut backend, "unlit", "fn vs_main() {}").unwrap();
        let material = Material::new("red", shader.clone())
            .with_blend(BlendState::alpha_blending())
            .with_cull_mode(CullMode::None)
            .with_uniform("a_Albedo", Vec3::new(1.0, 0.0, 0.0));

        shader.bind(&mut backend);
        material.apply(&mut backend);

        assert_eq!(
            backend.uniform(shader.handle(), "a_Albedo"),
            Some(UniformValue::Vec3(Vec3::new(1.0, 0.0, 0.0)))
        );
        assert!(material.is_blended());
        let draw_state: Vec<_> = backend
            .commands()
            .iter()
            .filter(|cmd| {
                matches!(
                    cmd,
                    crate::backend::headless::Command::SetCullMode(CullMode::None)
                )
            })
            .collect();
        assert_eq!(draw_state.len(), 1);
    }
}
