//! Synthetic scene: a grid of lit cubes spread over a handful of materials.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use tessera_render::types::{
    CullMode, IndexFormat, PipelineState, ShaderStages, TextureFormat, VertexBufferLayout,
    VertexFormat,
};
use tessera_render::{
    BindingResource, Bindings, Buffer, BufferKey, BufferKind, ColorAttachment, DepthAttachment,
    DrawItem, Geometry, GeometryKey, Material, MaterialKey, RenderPass, RenderTarget, Scene,
    Shader, Texture,
};

const SHADER: &str = r#"
struct Globals {
    view_proj: mat4x4<f32>,
};

struct Surface {
    color: vec4<f32>,
};

struct Object {
    model: mat4x4<f32>,
};

@group(0) @binding(0) var<uniform> globals: Globals;
@group(1) @binding(0) var<uniform> surface: Surface;
@group(2) @binding(0) var<uniform> object: Object;

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) normal: vec3<f32>,
};

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) normal: vec3<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.clip = globals.view_proj * object.model * vec4<f32>(position, 1.0);
    out.normal = (object.model * vec4<f32>(normal, 0.0)).xyz;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let light = normalize(vec3<f32>(0.4, 1.0, 0.6));
    let diffuse = max(dot(normalize(in.normal), light), 0.15);
    return vec4<f32>(surface.color.rgb * diffuse, surface.color.a);
}
"#;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct Surface {
    color: [f32; 4],
}

struct Cube {
    material: MaterialKey,
    position: Vec3,
    spin: f32,
}

pub struct Demo {
    pub scene: Scene,
    pub pass: RenderPass,
    globals: BufferKey,
    geometry: GeometryKey,
    cubes: Vec<Cube>,
    aspect: f32,
    extent: f32,
}

impl Demo {
    pub fn new(mut scene: Scene, width: u32, height: u32, draws: usize, materials: usize) -> Self {
        let color = scene.add_texture(Texture::attachment(
            "color",
            width,
            height,
            TextureFormat::Rgba8UnormSrgb,
        ));
        let depth = scene.add_texture(Texture::attachment(
            "depth",
            width,
            height,
            TextureFormat::Depth32Float,
        ));
        let globals = scene.add_buffer(Buffer::uniform(
            "globals",
            &Mat4::IDENTITY.to_cols_array_2d(),
        ));
        let pass_bindings = scene.add_bindings(Bindings::new("pass").with(
            0,
            "globals",
            ShaderStages::VERTEX,
            BindingResource::Uniform(globals),
        ));
        let pass = RenderPass {
            label: "cubes".into(),
            bindings: pass_bindings,
            target: RenderTarget {
                color: vec![ColorAttachment::clear(color, [0.05, 0.05, 0.08, 1.0])],
                depth: Some(DepthAttachment::clear(depth, 1.0)),
            },
        };

        let geometry = add_cube(&mut scene);
        let materials: Vec<MaterialKey> = (0..materials.max(1))
            .map(|i| add_material(&mut scene, i))
            .collect();

        let side = (draws as f32).sqrt().ceil().max(1.0) as usize;
        let half = side as f32 * 0.5;
        let cubes = (0..draws)
            .map(|i| Cube {
                material: materials[i % materials.len()],
                position: Vec3::new(
                    ((i % side) as f32 - half) * 1.5,
                    0.0,
                    ((i / side) as f32 - half) * 1.5,
                ),
                spin: 0.5 + (i % 7) as f32 * 0.1,
            })
            .collect();

        Self {
            scene,
            pass,
            globals,
            geometry,
            cubes,
            aspect: width as f32 / height.max(1) as f32,
            extent: side as f32 * 1.5,
        }
    }

    /// Orbit the camera and return this frame's render list.
    pub fn frame(&mut self, frame: u64) -> Vec<DrawItem> {
        let t = frame as f32 / 60.0;
        let eye = Vec3::new(t.cos() * self.extent, self.extent * 0.75, t.sin() * self.extent);
        let view_proj = Mat4::perspective_rh(60f32.to_radians(), self.aspect, 0.1, 1000.0)
            * Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        if let Some(globals) = self.scene.buffer_mut(self.globals) {
            globals.write_pod(0, &view_proj.to_cols_array_2d());
        }

        self.cubes
            .iter()
            .map(|cube| {
                let model = Mat4::from_translation(cube.position)
                    * Mat4::from_rotation_y(cube.spin * t);
                DrawItem::new(self.geometry, cube.material)
                    .with_uniforms(&model.to_cols_array_2d())
            })
            .collect()
    }
}

fn add_material(scene: &mut Scene, index: usize) -> MaterialKey {
    let hue = index as f32 * 0.618;
    let surface = Surface {
        color: [
            0.5 + 0.5 * (hue * 6.283).cos(),
            0.5 + 0.5 * ((hue + 0.33) * 6.283).cos(),
            0.5 + 0.5 * ((hue + 0.67) * 6.283).cos(),
            1.0,
        ],
    };
    let label = format!("surface_{index}");
    let buffer = scene.add_buffer(Buffer::uniform(label.clone(), &surface));
    let bindings = scene.add_bindings(Bindings::new(label.clone()).with(
        0,
        "surface",
        ShaderStages::FRAGMENT,
        BindingResource::Uniform(buffer),
    ));
    // Every fourth material is double-sided, which needs its own pipeline.
    let state = if index % 4 == 3 {
        PipelineState {
            cull: CullMode::None,
            ..PipelineState::default()
        }
    } else {
        PipelineState::default()
    };
    scene.add_material(Material::new(label, Shader::new("lit", SHADER), bindings).with_state(state))
}

fn add_cube(scene: &mut Scene) -> GeometryKey {
    let p = 0.5f32;
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
    ];
    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (face, (normal, u, v)) in faces.iter().enumerate() {
        let (n, u, v) = (Vec3::from(*normal), Vec3::from(*u), Vec3::from(*v));
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            positions.push(((n + u * su + v * sv) * p).to_array());
            normals.push(*normal);
        }
        let base = face as u16 * 4;
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    let positions = scene.add_buffer(Buffer::from_pod(
        "cube_positions",
        BufferKind::Attribute,
        &positions,
    ));
    let normals = scene.add_buffer(Buffer::from_pod(
        "cube_normals",
        BufferKind::Attribute,
        &normals,
    ));
    let indices = scene.add_buffer(Buffer::from_pod(
        "cube_indices",
        BufferKind::Index(IndexFormat::Uint16),
        &indices,
    ));
    scene.add_geometry(
        Geometry::new("cube")
            .with_stream(positions, VertexBufferLayout::single(VertexFormat::Float32x3, 0))
            .with_stream(normals, VertexBufferLayout::single(VertexFormat::Float32x3, 1))
            .with_index(indices),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_cube_gets_a_draw() {
        let mut demo = Demo::new(Scene::new(), 64, 64, 10, 3);
        let items = demo.frame(0);
        assert_eq!(items.len(), 10);
        assert!(items.iter().all(|item| item.uniforms.len() == 64));
    }
}
