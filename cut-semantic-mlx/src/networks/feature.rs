//! PatchSampleF: samples spatial positions of encoder feature maps and
//! projects them into the PatchNCE embedding space.

use mlx_rs::{
    builder::Builder, error::Exception, macros::ModuleParameters, module::Module, nn,
    ops::indexing::take_axis, Array,
};
use rand::{rngs::StdRng, seq::index};

use super::{l2_normalize, ResnetGenerator};
use crate::config::SemanticConfig;
use crate::error::Result;

/// Two-layer MLP for one encoder layer
#[derive(Debug, ModuleParameters)]
pub struct ProjectionHead {
    #[param]
    pub fc1: nn::Linear,
    #[param]
    pub fc2: nn::Linear,
}

impl ProjectionHead {
    pub fn new(in_channels: i32, out_channels: i32) -> Result<Self> {
        let fc1 = nn::LinearBuilder::new(in_channels, out_channels)
            .bias(true)
            .build()?;
        let fc2 = nn::LinearBuilder::new(out_channels, out_channels)
            .bias(true)
            .build()?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module<&Array> for ProjectionHead {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let h = nn::relu(self.fc1.forward(x)?)?;
        self.fc2.forward(&h)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

#[derive(Debug, ModuleParameters)]
pub struct PatchSampleF {
    /// One head per entry of `nce_layers`, in the same order
    #[param]
    pub heads: Vec<ProjectionHead>,
    num_patches: usize,
}

impl PatchSampleF {
    pub fn new(config: &SemanticConfig) -> Result<Self> {
        let heads = config
            .nce_layers
            .iter()
            .map(|&layer| {
                ProjectionHead::new(ResnetGenerator::layer_channels(config, layer), config.netf_nc)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            heads,
            num_patches: config.num_patches,
        })
    }

    /// Random positions for each feature map, without replacement within a
    /// map. Capped at the number of positions the map has.
    pub fn draw_patch_ids(&self, feats: &[Array], rng: &mut StdRng) -> Vec<Array> {
        feats
            .iter()
            .map(|feat| {
                let shape = feat.shape();
                let positions = (shape[1] * shape[2]) as usize;
                let amount = self.num_patches.min(positions);
                let ids: Vec<i32> = index::sample(rng, positions, amount)
                    .into_iter()
                    .map(|i| i as i32)
                    .collect();
                Array::from_slice(&ids, &[amount as i32])
            })
            .collect()
    }

    /// Project the positions `ids` of each feature map.
    ///
    /// Each `[B, H, W, C]` map becomes `[B * P, netf_nc]` with unit-norm rows.
    pub fn project(
        &mut self,
        feats: &[Array],
        ids: &[Array],
    ) -> std::result::Result<Vec<Array>, Exception> {
        if feats.len() != self.heads.len() || ids.len() != feats.len() {
            return Err(Exception::custom(format!(
                "PatchSampleF has {} heads, got {} feature maps and {} id sets",
                self.heads.len(),
                feats.len(),
                ids.len()
            )));
        }

        let mut projected = Vec::with_capacity(feats.len());
        for ((head, feat), ids) in self.heads.iter_mut().zip(feats).zip(ids) {
            let shape = feat.shape();
            let (b, c) = (shape[0], shape[3]);
            let flat = feat.reshape(&[b, shape[1] * shape[2], c])?;
            let sampled = take_axis(&flat, ids, 1)?;
            let patches = ids.shape()[0];
            let sampled = sampled.reshape(&[b * patches, c])?;
            let h = head.forward(&sampled)?;
            projected.push(l2_normalize(&h, 1e-7)?);
        }
        Ok(projected)
    }
}
