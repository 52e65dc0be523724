//! Materials
//!
//! A material is a small PBR record: emissive color, metallic and roughness
//! factors, and up to four indices into the scene's texture table. Indices
//! are stable after import; missing textures point at the scene's
//! solid-color fallbacks so every sampler binding is always valid.

use bytemuck::{Pod, Zeroable};

/// PBR material record with texture-table indices
#[derive(Debug, Clone)]
pub struct Material {
    /// Material name from the source asset
    pub name: String,
    /// Emissive color factor
    pub emissive: [f32; 3],
    /// Metallic factor in [0, 1]
    pub metallic: f32,
    /// Roughness factor in [0, 1]
    pub roughness: f32,
    /// Base-color texture index, if the asset provides one
    pub base_color_texture: Option<u32>,
    /// Metallic-roughness texture index
    pub metal_rough_texture: Option<u32>,
    /// Normal-map texture index
    pub normal_texture: Option<u32>,
    /// Emissive texture index
    pub emissive_texture: Option<u32>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            emissive: [0.0; 3],
            metallic: 0.0,
            roughness: 1.0,
            base_color_texture: None,
            metal_rough_texture: None,
            normal_texture: None,
            emissive_texture: None,
        }
    }
}

/// GPU-side material block, std140-compatible
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialParams {
    /// Emissive RGB, w unused
    pub emissive: [f32; 4],
    /// x = metallic, y = roughness, zw unused
    pub factors: [f32; 4],
}

impl From<&Material> for MaterialParams {
    fn from(material: &Material) -> Self {
        Self {
            emissive: [
                material.emissive[0],
                material.emissive[1],
                material.emissive[2],
                0.0,
            ],
            factors: [material.metallic, material.roughness, 0.0, 0.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_dielectric_and_rough() {
        let material = Material::default();
        assert_eq!(material.metallic, 0.0);
        assert_eq!(material.roughness, 1.0);
        assert!(material.base_color_texture.is_none());
    }

    #[test]
    fn gpu_block_packs_factors() {
        let material = Material {
            emissive: [0.1, 0.2, 0.3],
            metallic: 0.5,
            roughness: 0.25,
            ..Default::default()
        };
        let params = MaterialParams::from(&material);
        assert_eq!(params.emissive[..3], [0.1, 0.2, 0.3]);
        assert_eq!(params.factors[0], 0.5);
        assert_eq!(params.factors[1], 0.25);
        assert_eq!(std::mem::size_of::<MaterialParams>(), 32);
    }
}
