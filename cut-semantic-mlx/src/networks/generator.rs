//! ResNet-style translation generator.
//!
//! Layout (NHWC):
//! - stem: 7x7 conv, instance norm, ReLU
//! - down: 3x3 stride-2 conv, instance norm, ReLU
//! - `n_blocks` residual blocks at twice the base width
//! - up: 2x nearest upsampling, 3x3 conv, instance norm, ReLU
//! - head: 7x7 conv, tanh
//!
//! The encoder layers visible to PatchNCE are numbered 0 (input image),
//! 1 (stem), 2 (down), and 3.. (one per residual block).

use mlx_rs::{
    builder::Builder, error::Exception, macros::ModuleParameters, module::Module, nn, ops, Array,
};

use super::{instance_norm, upsample_nearest, ResidualBlock};
use crate::config::SemanticConfig;
use crate::error::Result;

#[derive(Debug, ModuleParameters)]
pub struct ResnetGenerator {
    #[param]
    pub stem: nn::Conv2d,
    #[param]
    pub down: nn::Conv2d,
    #[param]
    pub blocks: Vec<ResidualBlock>,
    #[param]
    pub up: nn::Conv2d,
    #[param]
    pub head: nn::Conv2d,
}

impl ResnetGenerator {
    pub fn new(config: &SemanticConfig) -> Result<Self> {
        let ngf = config.ngf;
        let stem = nn::Conv2dBuilder::new(config.input_nc, ngf, (7, 7))
            .padding((3, 3))
            .build()?;
        let down = nn::Conv2dBuilder::new(ngf, ngf * 2, (3, 3))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let blocks = (0..config.n_blocks)
            .map(|_| ResidualBlock::new(ngf * 2))
            .collect::<Result<Vec<_>>>()?;
        let up = nn::Conv2dBuilder::new(ngf * 2, ngf, (3, 3))
            .padding((1, 1))
            .build()?;
        let head = nn::Conv2dBuilder::new(ngf, config.output_nc, (7, 7))
            .padding((3, 3))
            .build()?;

        Ok(Self {
            stem,
            down,
            blocks,
            up,
            head,
        })
    }

    /// Channel count of encoder layer `layer`
    pub fn layer_channels(config: &SemanticConfig, layer: usize) -> i32 {
        match layer {
            0 => config.input_nc,
            1 => config.ngf,
            _ => config.ngf * 2,
        }
    }

    /// Feature maps of the requested encoder layers, in the order given.
    pub fn encode(&mut self, x: &Array, layers: &[usize]) -> std::result::Result<Vec<Array>, Exception> {
        let deepest = match layers.iter().max() {
            Some(&deepest) => deepest,
            None => return Ok(Vec::new()),
        };
        if deepest >= 3 + self.blocks.len() {
            return Err(Exception::custom(format!(
                "encoder layer {deepest} out of range ({} layers)",
                3 + self.blocks.len()
            )));
        }

        let mut feats = Vec::with_capacity(deepest + 1);
        feats.push(x.clone());
        let mut h = nn::relu(instance_norm(&self.stem.forward(x)?)?)?;
        feats.push(h.clone());
        if deepest >= 2 {
            h = nn::relu(instance_norm(&self.down.forward(&h)?)?)?;
            feats.push(h.clone());
        }
        for block in self.blocks.iter_mut().take(deepest.saturating_sub(2)) {
            h = block.forward(&h)?;
            feats.push(h.clone());
        }

        Ok(layers.iter().map(|&layer| feats[layer].clone()).collect())
    }
}

impl Module<&Array> for ResnetGenerator {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let mut h = nn::relu(instance_norm(&self.stem.forward(x)?)?)?;
        h = nn::relu(instance_norm(&self.down.forward(&h)?)?)?;
        for block in self.blocks.iter_mut() {
            h = block.forward(&h)?;
        }
        h = upsample_nearest(&h)?;
        h = nn::relu(instance_norm(&self.up.forward(&h)?)?)?;
        ops::tanh(&self.head.forward(&h)?)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::random;

    fn small_config() -> SemanticConfig {
        let mut config = SemanticConfig::default().with_crop_size(16);
        config.ngf = 8;
        config
    }

    #[test]
    fn test_output_shape_and_range() {
        let config = small_config();
        let mut generator = ResnetGenerator::new(&config).unwrap();
        let x = random::normal::<f32>(&[2, 16, 16, 3], None, None, None).unwrap();

        let y = generator.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 16, 16, 3]);
        y.eval().unwrap();
        assert!(y.as_slice::<f32>().iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn test_encode_layers() {
        let config = small_config();
        let mut generator = ResnetGenerator::new(&config).unwrap();
        let x = random::normal::<f32>(&[1, 16, 16, 3], None, None, None).unwrap();

        let feats = generator.encode(&x, &[0, 1, 2, 4]).unwrap();
        assert_eq!(feats[0].shape(), &[1, 16, 16, 3]);
        assert_eq!(feats[1].shape(), &[1, 16, 16, 8]);
        assert_eq!(feats[2].shape(), &[1, 8, 8, 16]);
        assert_eq!(feats[3].shape(), &[1, 8, 8, 16]);
        assert_eq!(ResnetGenerator::layer_channels(&config, 4), 16);
    }

    #[test]
    fn test_encode_rejects_unknown_layer() {
        let config = small_config();
        let mut generator = ResnetGenerator::new(&config).unwrap();
        let x = random::normal::<f32>(&[1, 16, 16, 3], None, None, None).unwrap();
        assert!(generator.encode(&x, &[5]).is_err());
    }
}
