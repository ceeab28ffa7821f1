//! Shader programs

use crate::backend::traits::*;
use crate::backend::types::*;
use std::sync::Arc;

/// A linked shader program accepting named uniform uploads
#[derive(Debug)]
pub struct Shader {
    label: String,
    handle: ShaderHandle,
}

impl Shader {
    /// Compile a WGSL program
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        source: &str,
    ) -> BackendResult<Arc<Self>> {
        let handle = backend.create_shader(&ShaderDescriptor { label, source })?;
        log::info!("Created shader '{}'", label);
        Ok(Arc::new(Self {
            label: label.to_string(),
            handle,
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handle(&self) -> ShaderHandle {
        self.handle
    }

    /// Make this the program used by subsequent draws
    pub fn bind(&self, backend: &mut dyn GraphicsBackend) {
        backend.use_shader(Some(self.handle));
    }

    pub fn set_uniform(
        &self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        value: impl Into<UniformValue>,
    ) {
        backend.set_uniform(self.handle, name, value.into());
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        log::info!("Deleting shader '{}'", self.label);
        backend.destroy_shader(self.handle);
    }
}
