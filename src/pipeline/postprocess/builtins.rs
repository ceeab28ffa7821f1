//! Built-in post-processing chain: bloom, motion blur and depth of field

use super::{PassInput, PostProcessGraph};
use crate::backend::{AttachmentSlot, BackendResult, GraphicsBackend};
use crate::shaders;
use crate::PostConfig;
use winit::keyboard::KeyCode;

impl PostProcessGraph {
    /// Graph with the built-in passes selected by `config`, in order bloom, motion blur,
    /// depth of field
    pub fn with_builtins(
        backend: &mut dyn GraphicsBackend,
        config: &PostConfig,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let mut graph = Self::new(backend, width, height)?;
        if config.bloom {
            graph.add_bloom(backend, config.blur_iterations)?;
        }
        if config.motion_blur {
            graph.add_motion_blur(backend)?;
        }
        if config.depth_of_field {
            graph.add_depth_of_field(backend)?;
        }
        Ok(graph)
    }

    fn add_bloom(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        blur_iterations: u32,
    ) -> BackendResult<()> {
        let highlight = self.add_pass(backend, "BloomHighlight", shaders::BLOOM_HIGHLIGHT, 1.0)?;
        self.add_parameter(backend, highlight, "a_BloomThreshold", 1.0, 0.0, 2.0);

        let horizontal = self.add_pass(backend, "HorizontalBuffer", shaders::BLOOM_BLUR, 1.0)?;
        if let Some(pass) = self.pass(horizontal) {
            pass.shader().set_uniform(backend, "isHorizontal", 1i32);
        }
        let vertical = self.add_pass(backend, "VerticalBuffer", shaders::BLOOM_BLUR, 1.0)?;
        if let Some(pass) = self.pass(vertical) {
            pass.shader().set_uniform(backend, "isHorizontal", 0i32);
        }

        let additive = self.add_pass(backend, "BloomAdditive", shaders::BLOOM_ADDITIVE, 1.0)?;
        self.add_input(additive, PassInput::main(AttachmentSlot::Color0));
        self.add_input(additive, PassInput::pass(vertical, AttachmentSlot::Color0));

        self.push(highlight);
        for _ in 0..blur_iterations {
            self.push(horizontal);
            self.push(vertical);
        }
        self.push(additive);

        self.add_toggle_group(
            "bloom",
            Some(KeyCode::KeyB),
            [additive, horizontal, vertical, highlight],
        );
        Ok(())
    }

    fn add_motion_blur(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        let pass = self.add_pass(backend, "MotionBlur", shaders::MOTION_BLUR, 1.0)?;
        self.add_input(pass, PassInput::main(AttachmentSlot::Depth));
        self.push(pass);
        self.add_toggle_group("motion_blur", Some(KeyCode::KeyM), [pass]);
        Ok(())
    }

    fn add_depth_of_field(&mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<()> {
        let pass = self.add_pass(backend, "DepthOfField", shaders::DEPTH_OF_FIELD, 1.0)?;
        self.add_input(pass, PassInput::main(AttachmentSlot::Depth));
        self.add_parameter(backend, pass, "a_FocalDepth", 3.0, 0.1, 100.0);
        self.add_parameter(backend, pass, "a_LenseDistance", 1.0, 0.001, 5.0);
        self.add_parameter(backend, pass, "a_Aperture", 20.0, 0.1, 60.0);
        self.push(pass);
        self.add_toggle_group("depth_of_field", Some(KeyCode::KeyT), [pass]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, UniformValue};
    use crate::pipeline::PassId;

    #[test]
    fn test_default_chain_layout() {
        let mut backend = HeadlessBackend::new(64, 64);
        let graph = PostProcessGraph::with_builtins(&mut backend, &PostConfig::default(), 64, 64)
            .unwrap();

        // highlight + 10 blur pairs + additive + motion blur + depth of field
        assert_eq!(graph.sequence().len(), 1 + 20 + 1 + 1 + 1);
        assert_eq!(graph.passes().count(), 6);
        assert_eq!(graph.group("bloom").unwrap().len(), 4);
        assert_eq!(graph.key_binding(KeyCode::KeyB), Some("bloom"));
        assert_eq!(graph.key_binding(KeyCode::KeyM), Some("motion_blur"));
        assert_eq!(graph.key_binding(KeyCode::KeyT), Some("depth_of_field"));

        let horizontal = graph.pass(PassId(1)).unwrap();
        assert_eq!(horizontal.name(), "HorizontalBuffer");
        assert_eq!(
            backend.uniform(horizontal.shader().handle(), "isHorizontal"),
            Some(UniformValue::Int(1))
        );
        let additive = graph.pass(PassId(3)).unwrap();
        assert_eq!(additive.inputs()[1], PassInput::pass(PassId(2), AttachmentSlot::Color0));
    }

    #[test]
    fn test_depth_of_field_defaults_uploaded() {
        let mut backend = HeadlessBackend::new(32, 32);
        let config = PostConfig {
            bloom: false,
            motion_blur: false,
            ..PostConfig::default()
        };
        let graph = PostProcessGraph::with_builtins(&mut backend, &config, 32, 32).unwrap();
        let (_, pass) = graph.passes().next().unwrap();
        assert_eq!(pass.name(), "DepthOfField");
        assert_eq!(pass.parameters().len(), 3);
        assert_eq!(
            backend.uniform(pass.shader().handle(), "a_Aperture"),
            Some(UniformValue::Float(20.0))
        );
    }
}
