//! glTF scene import
//!
//! Walks the node tree of a `.glb` container, composing parent x local
//! transforms (local = T * R * S, missing components default to identity),
//! and converts everything into the engine's axis convention at read time:
//! translations, quaternion components, scales, positions, normals and
//! tangents all go through the same (X, Y, Z) -> (-Z, X, Y) shuffle.
//!
//! Only the static subset is consumed: no skins, no animations.

use thiserror::Error;

use crate::foundation::math::{
    gltf_quat_to_world, gltf_to_world, Mat4, Quat, Quaternion, Transform, Unit, Vec3,
};
use crate::scene::material::Material;
use crate::scene::mesh::{MeshData, Surface, Vertex};

/// Scene import errors
#[derive(Error, Debug)]
pub enum SceneError {
    /// The container could not be read or parsed
    #[error("glTF import failed: {0}")]
    Gltf(#[from] gltf::Error),

    /// A mesh primitive lacks a required attribute
    #[error("mesh primitive is missing {0}")]
    MissingAttribute(&'static str),

    /// An embedded image could not be converted to RGBA8
    #[error("unsupported image format in texture {0}")]
    UnsupportedImage(usize),
}

/// A decoded RGBA8 texture ready for upload
pub struct TextureData {
    /// Pixel data, tightly packed RGBA8
    pub pixels: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Everything the scene manager needs to build GPU state
pub struct LoadedScene {
    /// Interleaved vertices of every surface
    pub vertices: Vec<Vertex>,
    /// Widened u32 indices of every surface
    pub indices: Vec<u32>,
    /// Meshes with composed world transforms
    pub meshes: Vec<MeshData>,
    /// Material table
    pub materials: Vec<Material>,
    /// Texture table, parallel to the glTF image list
    pub textures: Vec<TextureData>,
}

impl LoadedScene {
    /// Axis-aligned bounding box over all vertices, for camera framing
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        let first = self.vertices.first()?;
        let mut min = Vec3::from(first.position);
        let mut max = min;
        for vertex in &self.vertices {
            let p = Vec3::from(vertex.position);
            min = min.inf(&p);
            max = max.sup(&p);
        }
        Some((min, max))
    }
}

/// Convert a decomposed glTF node transform into the engine convention
pub fn converted_node_transform(
    translation: [f32; 3],
    rotation: [f32; 4],
    scale: [f32; 3],
) -> Transform {
    let rotation_q: Quat = Unit::new_normalize(Quaternion::new(
        rotation[3],
        rotation[0],
        rotation[1],
        rotation[2],
    ));
    // Scale components permute with the axes but keep their sign.
    let scale_v = Vec3::new(scale[2], scale[0], scale[1]);

    Transform {
        position: gltf_to_world(Vec3::from(translation)),
        rotation: gltf_quat_to_world(rotation_q),
        scale: scale_v,
    }
}

/// Import a `.glb` container
pub fn load_glb(path: &str) -> Result<LoadedScene, SceneError> {
    let (document, buffers, images) = gltf::import(path)?;
    log::info!(
        "Importing '{}': {} meshes, {} materials, {} images",
        path,
        document.meshes().count(),
        document.materials().count(),
        images.len()
    );

    let mut scene = LoadedScene {
        vertices: Vec::new(),
        indices: Vec::new(),
        meshes: Vec::new(),
        materials: document.materials().map(convert_material).collect(),
        textures: Vec::with_capacity(images.len()),
    };
    if scene.materials.is_empty() {
        scene.materials.push(Material::default());
    }

    for (index, image) in images.iter().enumerate() {
        scene.textures.push(convert_image(index, image)?);
    }

    if let Some(gltf_scene) = document.default_scene().or_else(|| document.scenes().next()) {
        for node in gltf_scene.nodes() {
            walk_node(&node, &buffers, Mat4::identity(), &mut scene)?;
        }
    }

    log::info!(
        "Imported {} vertices, {} indices, {} mesh nodes",
        scene.vertices.len(),
        scene.indices.len(),
        scene.meshes.len()
    );
    Ok(scene)
}

fn walk_node(
    node: &gltf::Node,
    buffers: &[gltf::buffer::Data],
    parent: Mat4,
    scene: &mut LoadedScene,
) -> Result<(), SceneError> {
    let (translation, rotation, scale) = node.transform().decomposed();
    let local = converted_node_transform(translation, rotation, scale).to_matrix();
    let world = parent * local;

    if let Some(mesh) = node.mesh() {
        let mut surfaces = Vec::new();
        for primitive in mesh.primitives() {
            surfaces.push(read_primitive(&primitive, buffers, scene)?);
        }
        scene.meshes.push(MeshData {
            name: node
                .name()
                .or_else(|| mesh.name())
                .unwrap_or("unnamed")
                .to_string(),
            model_matrix: world,
            surfaces,
        });
    }

    for child in node.children() {
        walk_node(&child, buffers, world, scene)?;
    }
    Ok(())
}

fn read_primitive(
    primitive: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
    scene: &mut LoadedScene,
) -> Result<Surface, SceneError> {
    let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or(SceneError::MissingAttribute("POSITION"))?
        .collect();

    let normals: Vec<[f32; 3]> = reader
        .read_normals()
        .map(|iter| iter.collect())
        .unwrap_or_else(|| vec![[0.0, 1.0, 0.0]; positions.len()]);

    let tangents: Vec<[f32; 4]> = reader
        .read_tangents()
        .map(|iter| iter.collect())
        .unwrap_or_else(|| vec![[1.0, 0.0, 0.0, 1.0]; positions.len()]);

    let tex_coords: Vec<[f32; 2]> = reader
        .read_tex_coords(0)
        .map(|iter| iter.into_f32().collect())
        .unwrap_or_else(|| vec![[0.0, 0.0]; positions.len()]);

    let vertex_start = scene.vertices.len() as u32;
    let index_start = scene.indices.len() as u32;

    for i in 0..positions.len() {
        let position = gltf_to_world(Vec3::from(positions[i]));
        let normal = gltf_to_world(Vec3::from(normals[i]));
        let tangent_xyz = gltf_to_world(Vec3::new(tangents[i][0], tangents[i][1], tangents[i][2]));
        scene.vertices.push(Vertex {
            position: position.into(),
            normal: normal.into(),
            tangent: [tangent_xyz.x, tangent_xyz.y, tangent_xyz.z, tangents[i][3]],
            tex_coord: tex_coords[i],
        });
    }

    // U8/U16/U32 index streams all widen to u32 here.
    let index_count = match reader.read_indices() {
        Some(indices) => {
            let mut count = 0;
            for index in indices.into_u32() {
                scene.indices.push(index);
                count += 1;
            }
            count
        }
        None => {
            for i in 0..positions.len() as u32 {
                scene.indices.push(i);
            }
            positions.len() as u32
        }
    };

    let material_index = primitive
        .material()
        .index()
        .map(|i| i as u32)
        .unwrap_or(0)
        .min(scene.materials.len().saturating_sub(1) as u32);

    Ok(Surface {
        vertex_start,
        vertex_count: positions.len() as u32,
        index_start,
        index_count,
        material_index,
    })
}

fn convert_material(material: gltf::Material) -> Material {
    let pbr = material.pbr_metallic_roughness();
    Material {
        name: material.name().unwrap_or("unnamed").to_string(),
        emissive: material.emissive_factor(),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        base_color_texture: pbr
            .base_color_texture()
            .map(|t| t.texture().source().index() as u32),
        metal_rough_texture: pbr
            .metallic_roughness_texture()
            .map(|t| t.texture().source().index() as u32),
        normal_texture: material
            .normal_texture()
            .map(|t| t.texture().source().index() as u32),
        emissive_texture: material
            .emissive_texture()
            .map(|t| t.texture().source().index() as u32),
    }
}

fn convert_image(index: usize, image: &gltf::image::Data) -> Result<TextureData, SceneError> {
    use gltf::image::Format;
    let pixels = match image.format {
        Format::R8G8B8A8 => image.pixels.clone(),
        Format::R8G8B8 => {
            let mut rgba = Vec::with_capacity(image.pixels.len() / 3 * 4);
            for chunk in image.pixels.chunks_exact(3) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            rgba
        }
        Format::R8 => {
            let mut rgba = Vec::with_capacity(image.pixels.len() * 4);
            for &value in &image.pixels {
                rgba.extend_from_slice(&[value, value, value, 255]);
            }
            rgba
        }
        _ => return Err(SceneError::UnsupportedImage(index)),
    };

    Ok(TextureData {
        pixels,
        width: image.width,
        height: image.height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const EPSILON: f32 = 1e-5;

    #[test]
    fn identity_node_transform_converts_to_identity() {
        let transform =
            converted_node_transform([0.0; 3], [0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0]);
        assert_relative_eq!(transform.to_matrix(), Mat4::identity(), epsilon = EPSILON);
    }

    #[test]
    fn translation_goes_through_the_axis_shuffle() {
        let transform =
            converted_node_transform([1.0, 2.0, 3.0], [0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0]);
        assert_relative_eq!(
            transform.position,
            Vec3::new(-3.0, 1.0, 2.0),
            epsilon = EPSILON
        );
    }

    #[test]
    fn scale_components_permute_with_the_axes() {
        let transform =
            converted_node_transform([0.0; 3], [0.0, 0.0, 0.0, 1.0], [2.0, 3.0, 4.0]);
        assert_relative_eq!(transform.scale, Vec3::new(4.0, 2.0, 3.0), epsilon = EPSILON);
    }

    #[test]
    fn bounding_box_spans_all_vertices() {
        let mut scene = LoadedScene {
            vertices: Vec::new(),
            indices: Vec::new(),
            meshes: Vec::new(),
            materials: Vec::new(),
            textures: Vec::new(),
        };
        assert!(scene.bounding_box().is_none());

        for p in [[-1.0, 0.0, 2.0], [3.0, -4.0, 0.5], [0.0, 1.0, -2.0]] {
            scene.vertices.push(Vertex {
                position: p,
                normal: [0.0, 0.0, 1.0],
                tangent: [1.0, 0.0, 0.0, 1.0],
                tex_coord: [0.0, 0.0],
            });
        }

        let (min, max) = scene.bounding_box().unwrap();
        assert_relative_eq!(min, Vec3::new(-1.0, -4.0, -2.0), epsilon = EPSILON);
        assert_relative_eq!(max, Vec3::new(3.0, 1.0, 2.0), epsilon = EPSILON);
    }
}
