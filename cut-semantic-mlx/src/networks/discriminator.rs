//! PatchGAN discriminator producing one realness score per image patch.

use mlx_rs::{
    builder::Builder, error::Exception, macros::ModuleParameters, module::Module, nn, Array,
};

use super::{instance_norm, leaky_relu};
use crate::config::SemanticConfig;
use crate::error::Result;

#[derive(Debug, ModuleParameters)]
pub struct PatchDiscriminator {
    #[param]
    pub conv1: nn::Conv2d,
    #[param]
    pub conv2: nn::Conv2d,
    #[param]
    pub out: nn::Conv2d,
}

impl PatchDiscriminator {
    pub fn new(config: &SemanticConfig) -> Result<Self> {
        let ndf = config.ndf;
        // 4x4 stride-2 convs halve the resolution twice
        let conv1 = nn::Conv2dBuilder::new(config.output_nc, ndf, (4, 4))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let conv2 = nn::Conv2dBuilder::new(ndf, ndf * 2, (4, 4))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let out = nn::Conv2dBuilder::new(ndf * 2, 1, (3, 3))
            .padding((1, 1))
            .build()?;
        Ok(Self { conv1, conv2, out })
    }
}

impl Module<&Array> for PatchDiscriminator {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let h = leaky_relu(&self.conv1.forward(x)?)?;
        let h = leaky_relu(&instance_norm(&self.conv2.forward(&h)?)?)?;
        self.out.forward(&h)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::random;

    #[test]
    fn test_patch_map_shape() {
        let config = SemanticConfig::default().with_crop_size(16);
        let mut discriminator = PatchDiscriminator::new(&config).unwrap();
        let x = random::normal::<f32>(&[3, 16, 16, 3], None, None, None).unwrap();

        let pred = discriminator.forward(&x).unwrap();
        assert_eq!(pred.shape(), &[3, 4, 4, 1]);
    }
}
