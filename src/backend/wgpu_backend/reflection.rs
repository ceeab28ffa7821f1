//! WGSL interface reflection
//!
//! Named uniforms map onto members of the block at `@group(0) @binding(0)`. Texture slot
//! `n` is `@group(1) @binding(2n)` with its sampler at `2n + 1`.

use crate::backend::traits::BackendError;
use std::collections::{BTreeMap, HashMap};

/// Byte range of one uniform block member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformMember {
    pub offset: u32,
    pub size: u32,
}

/// What a texture slot expects to be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// `texture_2d<f32>`, filterable
    Color,
    /// `texture_depth_2d`
    Depth,
}

#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    /// Size of the uniform block, zero when the program has none
    pub uniform_size: u32,
    pub members: HashMap<String, UniformMember>,
    /// Texture slots by index
    pub slots: BTreeMap<u32, SlotKind>,
    /// Fragment output locations; empty for depth-only programs
    pub outputs: Vec<u32>,
    pub has_fragment: bool,
}

impl ShaderReflection {
    pub fn parse(label: &str, source: &str) -> Result<Self, BackendError> {
        let module = naga::front::wgsl::parse_str(source).map_err(|err| {
            BackendError::ShaderCreationFailed {
                label: label.to_string(),
                message: err.emit_to_string(source),
            }
        })?;
        Ok(Self::from_module(&module))
    }

    fn from_module(module: &naga::Module) -> Self {
        let mut reflection = Self::default();
        let ctx = module.to_ctx();

        for (_, global) in module.global_variables.iter() {
            let Some(binding) = global.binding.as_ref() else {
                continue;
            };
            let inner = &module.types[global.ty].inner;
            match (binding.group, inner) {
                (0, naga::TypeInner::Struct { members, span })
                    if binding.binding == 0
                        && matches!(global.space, naga::AddressSpace::Uniform) =>
                {
                    reflection.uniform_size = *span;
                    for member in members {
                        let Some(name) = member.name.clone() else {
                            continue;
                        };
                        let size = module.types[member.ty].inner.size(ctx);
                        reflection.members.insert(
                            name,
                            UniformMember {
                                offset: member.offset,
                                size,
                            },
                        );
                    }
                }
                (1, naga::TypeInner::Image { class, .. }) if binding.binding % 2 == 0 => {
                    let kind = match class {
                        naga::ImageClass::Depth { .. } => SlotKind::Depth,
                        _ => SlotKind::Color,
                    };
                    reflection.slots.insert(binding.binding / 2, kind);
                }
                _ => {}
            }
        }

        if let Some(entry) = module
            .entry_points
            .iter()
            .find(|entry| entry.stage == naga::ShaderStage::Fragment)
        {
            reflection.has_fragment = true;
            if let Some(result) = entry.function.result.as_ref() {
                match (&result.binding, &module.types[result.ty].inner) {
                    (Some(naga::Binding::Location { location, .. }), _) => {
                        reflection.outputs.push(*location);
                    }
                    (None, naga::TypeInner::Struct { members, .. }) => {
                        reflection.outputs.extend(members.iter().filter_map(|member| {
                            match member.binding {
                                Some(naga::Binding::Location { location, .. }) => Some(location),
                                _ => None,
                            }
                        }));
                    }
                    _ => {}
                }
            }
            reflection.outputs.sort_unstable();
        }

        reflection
    }

    pub fn member(&self, name: &str) -> Option<UniformMember> {
        self.members.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders;

    #[test]
    fn test_gbuffer_program() {
        let reflection = ShaderReflection::parse("gbuffer", shaders::SCENE_GBUFFER).unwrap();
        assert_eq!(reflection.outputs, vec![0, 1]);
        assert!(reflection.slots.is_empty());
        let mvp = reflection.member("a_ModelViewProjection").unwrap();
        assert_eq!(mvp, UniformMember { offset: 0, size: 64 });
        let normal = reflection.member("a_NormalMatrix").unwrap();
        assert_eq!(normal.size, 48);
        assert_eq!(reflection.uniform_size % 16, 0);
    }

    #[test]
    fn test_depth_only_program() {
        let reflection = ShaderReflection::parse("shadow", shaders::SHADOW_DEPTH).unwrap();
        assert!(!reflection.has_fragment);
        assert!(reflection.outputs.is_empty());
    }

    #[test]
    fn test_texture_slots() {
        let reflection = ShaderReflection::parse("dof", shaders::DEPTH_OF_FIELD).unwrap();
        assert_eq!(reflection.slots.get(&0), Some(&SlotKind::Color));
        assert_eq!(reflection.slots.get(&1), Some(&SlotKind::Depth));

        let additive = ShaderReflection::parse("additive", shaders::BLOOM_ADDITIVE).unwrap();
        assert_eq!(additive.uniform_size, 0);
        assert_eq!(additive.slots.len(), 3);
    }

    #[test]
    fn test_parse_error_reported() {
        let err = ShaderReflection::parse("broken", "fn (").unwrap_err();
        assert!(matches!(err, BackendError::ShaderCreationFailed { .. }));
    }
}
