//! WGSL programs used by the pipeline stages
//!
//! Named uniforms live in one block at `@group(0) @binding(0)`; member names are the names
//! stages upload. Texture slot `n` is `@group(1) @binding(2n)` with its sampler at `2n + 1`.
//! Full-screen programs share the quad vertex stage, which flips V so that image row 0 is
//! the top of the previous pass's output.

macro_rules! fullscreen {
    ($fragment:literal) => {
        concat!(
            r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) ndc: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.uv = vec2<f32>(in.uv.x, 1.0 - in.uv.y);
    out.ndc = in.position;
    return out;
}
"#,
            $fragment
        )
    };
}

/// Lit G-buffer material: albedo to Color0, encoded normal to Color1
pub const SCENE_GBUFFER: &str = r#"
struct Uniforms {
    a_ModelViewProjection: mat4x4<f32>,
    a_Model: mat4x4<f32>,
    a_NormalMatrix: mat3x3<f32>,
    a_CameraPos: vec3<f32>,
    a_Time: f32,
    a_Albedo: vec3<f32>,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

struct GBufferOutput {
    @location(0) albedo: vec4<f32>,
    @location(1) normal: vec4<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = u.a_ModelViewProjection * vec4<f32>(in.position, 1.0);
    out.normal = u.a_NormalMatrix * in.normal;
    out.uv = in.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> GBufferOutput {
    var out: GBufferOutput;
    out.albedo = vec4<f32>(u.a_Albedo, 1.0);
    out.normal = vec4<f32>(normalize(in.normal) * 0.5 + 0.5, 1.0);
    return out;
}
"#;

/// Depth-only shadow pass
pub const SHADOW_DEPTH: &str = r#"
struct Uniforms {
    a_ModelViewProjection: mat4x4<f32>,
    a_OutputResolution: vec2<f32>,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return u.a_ModelViewProjection * vec4<f32>(position, 1.0);
}
"#;

/// Shadow pass discarding fragments where the light's mask (slot 0) is dark
pub const SHADOW_MASKED: &str = r#"
struct Uniforms {
    a_ModelViewProjection: mat4x4<f32>,
    a_OutputResolution: vec2<f32>,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var s_Mask: texture_2d<f32>;
@group(1) @binding(1)
var s_MaskSampler: sampler;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return u.a_ModelViewProjection * vec4<f32>(position, 1.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) {
    let uv = frag.xy / u.a_OutputResolution;
    if textureSampleLevel(s_Mask, s_MaskSampler, uv, 0.0).r < 0.5 {
        discard;
    }
}
"#;

/// Adds one shadow-casting light to the accumulation buffer
///
/// Slots: 0 albedo, 1 scene depth, 2 light depth, 3 normals, 4 projector image.
pub const SHADOW_COMPOSITE: &str = fullscreen!(
    r#"
struct Uniforms {
    a_View: mat4x4<f32>,
    a_ViewInv: mat4x4<f32>,
    a_ProjectionInv: mat4x4<f32>,
    a_ViewProjectionInv: mat4x4<f32>,
    a_LightView: mat4x4<f32>,
    a_CameraPos: vec3<f32>,
    a_NearPlane: f32,
    a_LightPos: vec3<f32>,
    a_FarPlane: f32,
    a_LightDir: vec3<f32>,
    a_Bias: f32,
    a_LightColor: vec3<f32>,
    a_LightAttenuation: f32,
    a_MatShininess: f32,
    a_ProjectorIntensity: f32,
    b_IsProjector: i32,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var s_Albedo: texture_2d<f32>;
@group(1) @binding(1)
var s_AlbedoSampler: sampler;
@group(1) @binding(2)
var s_Depth: texture_depth_2d;
@group(1) @binding(3)
var s_DepthSampler: sampler;
@group(1) @binding(4)
var s_ShadowDepth: texture_depth_2d;
@group(1) @binding(5)
var s_ShadowSampler: sampler;
@group(1) @binding(6)
var s_Normals: texture_2d<f32>;
@group(1) @binding(7)
var s_NormalsSampler: sampler;
@group(1) @binding(8)
var s_Projector: texture_2d<f32>;
@group(1) @binding(9)
var s_ProjectorSampler: sampler;

fn load_depth(tex: texture_depth_2d, uv: vec2<f32>) -> f32 {
    let size = vec2<f32>(textureDimensions(tex));
    let coords = clamp(vec2<i32>(uv * size), vec2<i32>(0), vec2<i32>(size) - 1);
    return textureLoad(tex, coords, 0);
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let depth = load_depth(s_Depth, in.uv);
    if depth >= 1.0 {
        return vec4<f32>(0.0);
    }
    let world_h = u.a_ViewProjectionInv * vec4<f32>(in.ndc, depth, 1.0);
    let world = world_h.xyz / world_h.w;
    let normal = normalize(textureSampleLevel(s_Normals, s_NormalsSampler, in.uv, 0.0).xyz * 2.0 - 1.0);
    let albedo = textureSampleLevel(s_Albedo, s_AlbedoSampler, in.uv, 0.0).rgb;

    let light_clip = u.a_LightView * vec4<f32>(world, 1.0);
    let light_ndc = light_clip.xyz / light_clip.w;
    let light_uv = vec2<f32>(light_ndc.x * 0.5 + 0.5, 0.5 - light_ndc.y * 0.5);
    if light_clip.w <= 0.0 || any(light_uv < vec2<f32>(0.0)) || any(light_uv > vec2<f32>(1.0)) {
        return vec4<f32>(0.0);
    }
    let occluder = load_depth(s_ShadowDepth, light_uv);
    let lit = select(0.0, 1.0, light_ndc.z - u.a_Bias <= occluder);

    let to_light = u.a_LightPos - world;
    let dist = length(to_light);
    let l = to_light / dist;
    let v = normalize(u.a_CameraPos - world);
    let h = normalize(l + v);
    let diffuse = max(dot(normal, l), 0.0);
    let specular = pow(max(dot(normal, h), 0.0), max(u.a_MatShininess * 128.0, 1.0));
    let attenuation = 1.0 / (1.0 + u.a_LightAttenuation * dist * dist);

    var color = u.a_LightColor;
    if u.b_IsProjector != 0 {
        let projected = textureSampleLevel(s_Projector, s_ProjectorSampler, light_uv, 0.0).rgb;
        color = mix(color, color * projected, u.a_ProjectorIntensity);
    }
    let contribution = (diffuse * albedo + specular) * color * attenuation * lit;
    return vec4<f32>(contribution, 1.0);
}
"#
);

/// Adds one unshadowed point light to the accumulation buffer
///
/// Slots: 0 albedo, 1 scene depth, 2 normals.
pub const POINT_LIGHT_COMPOSITE: &str = fullscreen!(
    r#"
struct Uniforms {
    a_View: mat4x4<f32>,
    a_ViewProjectionInv: mat4x4<f32>,
    a_CameraPos: vec3<f32>,
    a_MatShininess: f32,
    a_LightPos: vec3<f32>,
    a_LightAttenuation: f32,
    a_LightColor: vec3<f32>,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var s_Albedo: texture_2d<f32>;
@group(1) @binding(1)
var s_AlbedoSampler: sampler;
@group(1) @binding(2)
var s_Depth: texture_depth_2d;
@group(1) @binding(3)
var s_DepthSampler: sampler;
@group(1) @binding(4)
var s_Normals: texture_2d<f32>;
@group(1) @binding(5)
var s_NormalsSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let size = vec2<f32>(textureDimensions(s_Depth));
    let coords = clamp(vec2<i32>(in.uv * size), vec2<i32>(0), vec2<i32>(size) - 1);
    let depth = textureLoad(s_Depth, coords, 0);
    if depth >= 1.0 {
        return vec4<f32>(0.0);
    }
    let world_h = u.a_ViewProjectionInv * vec4<f32>(in.ndc, depth, 1.0);
    let world = world_h.xyz / world_h.w;
    let normal = normalize(textureSampleLevel(s_Normals, s_NormalsSampler, in.uv, 0.0).xyz * 2.0 - 1.0);
    let albedo = textureSampleLevel(s_Albedo, s_AlbedoSampler, in.uv, 0.0).rgb;

    let to_light = u.a_LightPos - world;
    let dist = length(to_light);
    let l = to_light / dist;
    let h = normalize(l + normalize(u.a_CameraPos - world));
    let diffuse = max(dot(normal, l), 0.0);
    let specular = pow(max(dot(normal, h), 0.0), max(u.a_MatShininess * 128.0, 1.0));
    let attenuation = 1.0 / (1.0 + u.a_LightAttenuation * dist * dist);
    return vec4<f32>((diffuse * albedo + specular) * u.a_LightColor * attenuation, 1.0);
}
"#
);

/// Combines scene color (slot 1) with accumulated light (slot 2) under an exposure curve
pub const FINAL_COMPOSITE: &str = fullscreen!(
    r#"
struct Uniforms {
    a_Exposure: f32,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(2)
var s_Albedo: texture_2d<f32>;
@group(1) @binding(3)
var s_AlbedoSampler: sampler;
@group(1) @binding(4)
var s_Lighting: texture_2d<f32>;
@group(1) @binding(5)
var s_LightingSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSampleLevel(s_Albedo, s_AlbedoSampler, in.uv, 0.0).rgb;
    let light = textureSampleLevel(s_Lighting, s_LightingSampler, in.uv, 0.0).rgb;
    let hdr = albedo * light;
    return vec4<f32>(vec3<f32>(1.0) - exp(-hdr * u.a_Exposure), 1.0);
}
"#
);

/// Keeps pixels brighter than the threshold
pub const BLOOM_HIGHLIGHT: &str = fullscreen!(
    r#"
struct Uniforms {
    xImage: i32,
    a_BloomThreshold: f32,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var xImage: texture_2d<f32>;
@group(1) @binding(1)
var xSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSampleLevel(xImage, xSampler, in.uv, 0.0).rgb;
    let luminance = dot(color, vec3<f32>(0.2126, 0.7152, 0.0722));
    return vec4<f32>(select(vec3<f32>(0.0), color, luminance > u.a_BloomThreshold), 1.0);
}
"#
);

/// Separable gaussian blur, direction chosen by `isHorizontal`
pub const BLOOM_BLUR: &str = fullscreen!(
    r#"
struct Uniforms {
    xScreenRes: vec2<i32>,
    xImage: i32,
    isHorizontal: i32,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var xImage: texture_2d<f32>;
@group(1) @binding(1)
var xSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    var weights = array<f32, 5>(0.227027, 0.1945946, 0.1216216, 0.054054, 0.016216);
    let texel = 1.0 / vec2<f32>(max(u.xScreenRes, vec2<i32>(1)));
    let direction = select(vec2<f32>(0.0, texel.y), vec2<f32>(texel.x, 0.0), u.isHorizontal != 0);
    var result = textureSampleLevel(xImage, xSampler, in.uv, 0.0).rgb * weights[0];
    for (var i = 1; i < 5; i++) {
        let offset = direction * f32(i);
        result += textureSampleLevel(xImage, xSampler, in.uv + offset, 0.0).rgb * weights[i];
        result += textureSampleLevel(xImage, xSampler, in.uv - offset, 0.0).rgb * weights[i];
    }
    return vec4<f32>(result, 1.0);
}
"#
);

/// Adds the blurred highlights (slot 2) onto the scene image (slot 1)
pub const BLOOM_ADDITIVE: &str = fullscreen!(
    r#"
@group(1) @binding(0)
var xImage: texture_2d<f32>;
@group(1) @binding(1)
var xSampler: sampler;
@group(1) @binding(2)
var s_Scene: texture_2d<f32>;
@group(1) @binding(3)
var s_SceneSampler: sampler;
@group(1) @binding(4)
var s_Bloom: texture_2d<f32>;
@group(1) @binding(5)
var s_BloomSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let scene = textureSampleLevel(s_Scene, s_SceneSampler, in.uv, 0.0).rgb;
    let bloom = textureSampleLevel(s_Bloom, s_BloomSampler, in.uv, 0.0).rgb;
    return vec4<f32>(scene + bloom, 1.0);
}
"#
);

/// Camera motion blur from reprojected scene depth (slot 1)
pub const MOTION_BLUR: &str = fullscreen!(
    r#"
struct Uniforms {
    a_ViewProjectionInv: mat4x4<f32>,
    a_PrevViewProjection: mat4x4<f32>,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var xImage: texture_2d<f32>;
@group(1) @binding(1)
var xSampler: sampler;
@group(1) @binding(2)
var s_Depth: texture_depth_2d;
@group(1) @binding(3)
var s_DepthSampler: sampler;

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let size = vec2<f32>(textureDimensions(s_Depth));
    let coords = clamp(vec2<i32>(in.uv * size), vec2<i32>(0), vec2<i32>(size) - 1);
    let depth = textureLoad(s_Depth, coords, 0);
    let world_h = u.a_ViewProjectionInv * vec4<f32>(in.ndc, depth, 1.0);
    let previous = u.a_PrevViewProjection * (world_h / world_h.w);
    let velocity = (in.ndc - previous.xy / previous.w) * vec2<f32>(0.5, -0.5) / 8.0;

    var color = vec3<f32>(0.0);
    for (var i = 0; i < 8; i++) {
        color += textureSampleLevel(xImage, xSampler, in.uv + velocity * f32(i), 0.0).rgb;
    }
    return vec4<f32>(color / 8.0, 1.0);
}
"#
);

/// Thin-lens depth of field driven by scene depth (slot 1)
pub const DEPTH_OF_FIELD: &str = fullscreen!(
    r#"
struct Uniforms {
    xScreenRes: vec2<i32>,
    a_NearPlane: f32,
    a_FarPlane: f32,
    a_FocalDepth: f32,
    a_LenseDistance: f32,
    a_Aperture: f32,
}

@group(0) @binding(0)
var<uniform> u: Uniforms;

@group(1) @binding(0)
var xImage: texture_2d<f32>;
@group(1) @binding(1)
var xSampler: sampler;
@group(1) @binding(2)
var s_Depth: texture_depth_2d;
@group(1) @binding(3)
var s_DepthSampler: sampler;

fn linear_depth(depth: f32) -> f32 {
    return (u.a_NearPlane * u.a_FarPlane) / (u.a_FarPlane - depth * (u.a_FarPlane - u.a_NearPlane));
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let size = vec2<f32>(textureDimensions(s_Depth));
    let coords = clamp(vec2<i32>(in.uv * size), vec2<i32>(0), vec2<i32>(size) - 1);
    let view_depth = linear_depth(textureLoad(s_Depth, coords, 0));

    let focal = max(u.a_FocalDepth, u.a_LenseDistance + 0.001);
    let coc = abs(u.a_LenseDistance * (view_depth - focal) / (view_depth * (focal - u.a_LenseDistance)));
    let radius = clamp(coc * u.a_Aperture, 0.0, 8.0);
    let texel = 1.0 / vec2<f32>(max(u.xScreenRes, vec2<i32>(1)));

    var color = vec3<f32>(0.0);
    var count = 0.0;
    for (var x = -2; x <= 2; x++) {
        for (var y = -2; y <= 2; y++) {
            let offset = vec2<f32>(f32(x), f32(y)) * texel * radius * 0.5;
            color += textureSampleLevel(xImage, xSampler, in.uv + offset, 0.0).rgb;
            count += 1.0;
        }
    }
    return vec4<f32>(color / count, 1.0);
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fullscreen_programs_share_vertex_stage() {
        for source in [FINAL_COMPOSITE, BLOOM_BLUR, DEPTH_OF_FIELD, SHADOW_COMPOSITE] {
            assert!(source.contains("fn vs_main(in: VertexInput)"));
            assert!(source.contains("fn fs_main"));
        }
    }

    #[test]
    fn test_programs_parse() {
        for source in [
            SCENE_GBUFFER,
            SHADOW_DEPTH,
            SHADOW_MASKED,
            SHADOW_COMPOSITE,
            POINT_LIGHT_COMPOSITE,
            FINAL_COMPOSITE,
            BLOOM_HIGHLIGHT,
            BLOOM_BLUR,
            BLOOM_ADDITIVE,
            MOTION_BLUR,
            DEPTH_OF_FIELD,
        ] {
            let module = naga::front::wgsl::parse_str(source);
            assert!(module.is_ok(), "{:?}", module.err());
        }
    }
}
