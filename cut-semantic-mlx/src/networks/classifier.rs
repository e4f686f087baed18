//! Semantic classifier templates.

use mlx_rs::{
    builder::Builder,
    error::Exception,
    macros::ModuleParameters,
    module::{Module, ModuleParamMut, ModuleParamRef, ModuleParameters as ModuleParametersTrait},
    nn, ops, Array,
};

use super::ResidualBlock;
use crate::config::{ClassifierTemplate, SemanticConfig};
use crate::error::Result;

/// Global average pool over H and W: `[B, H, W, C] -> [B, C]`
fn global_pool(x: &Array) -> std::result::Result<Array, Exception> {
    ops::mean_axis(&ops::mean_axis(x, 1, false)?, 1, false)
}

/// Two strided conv blocks, pooling and a linear head
#[derive(Debug, ModuleParameters)]
pub struct BasicClassifier {
    #[param]
    pub conv1: nn::Conv2d,
    #[param]
    pub conv2: nn::Conv2d,
    #[param]
    pub fc: nn::Linear,
}

impl BasicClassifier {
    pub fn new(in_channels: i32, ndf: i32, output_dim: i32) -> Result<Self> {
        let conv1 = nn::Conv2dBuilder::new(in_channels, ndf, (3, 3))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let conv2 = nn::Conv2dBuilder::new(ndf, ndf * 2, (3, 3))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let fc = nn::LinearBuilder::new(ndf * 2, output_dim)
            .bias(true)
            .build()?;
        Ok(Self { conv1, conv2, fc })
    }
}

impl Module<&Array> for BasicClassifier {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let h = nn::relu(self.conv1.forward(x)?)?;
        let h = nn::relu(self.conv2.forward(&h)?)?;
        self.fc.forward(&global_pool(&h)?)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

/// Conv stem, residual blocks, strided reduction, pooling and a linear head
#[derive(Debug, ModuleParameters)]
pub struct ResidualClassifier {
    #[param]
    pub stem: nn::Conv2d,
    #[param]
    pub blocks: Vec<ResidualBlock>,
    #[param]
    pub reduce: nn::Conv2d,
    #[param]
    pub fc: nn::Linear,
}

impl ResidualClassifier {
    pub fn new(in_channels: i32, ndf: i32, output_dim: i32) -> Result<Self> {
        let stem = nn::Conv2dBuilder::new(in_channels, ndf, (3, 3))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let blocks = vec![ResidualBlock::new(ndf)?, ResidualBlock::new(ndf)?];
        let reduce = nn::Conv2dBuilder::new(ndf, ndf * 2, (3, 3))
            .stride((2, 2))
            .padding((1, 1))
            .build()?;
        let fc = nn::LinearBuilder::new(ndf * 2, output_dim)
            .bias(true)
            .build()?;
        Ok(Self {
            stem,
            blocks,
            reduce,
            fc,
        })
    }
}

impl Module<&Array> for ResidualClassifier {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let mut h = nn::relu(self.stem.forward(x)?)?;
        for block in self.blocks.iter_mut() {
            h = block.forward(&h)?;
        }
        let h = nn::relu(self.reduce.forward(&h)?)?;
        self.fc.forward(&global_pool(&h)?)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

/// Classifier selected by `cls_template`.
///
/// Outputs `[B, nclasses]` logits, or `[B, 1]` in regression mode.
#[derive(Debug)]
pub enum ClassifierNet {
    Basic(BasicClassifier),
    Residual(ResidualClassifier),
}

impl ClassifierNet {
    pub fn new(config: &SemanticConfig) -> Result<Self> {
        let output_dim = config.task().output_dim();
        let net = match config.template()? {
            ClassifierTemplate::Basic => ClassifierNet::Basic(BasicClassifier::new(
                config.output_nc,
                config.ndf,
                output_dim,
            )?),
            ClassifierTemplate::Residual => ClassifierNet::Residual(ResidualClassifier::new(
                config.output_nc,
                config.ndf,
                output_dim,
            )?),
        };
        Ok(net)
    }

    pub fn template(&self) -> ClassifierTemplate {
        match self {
            ClassifierNet::Basic(_) => ClassifierTemplate::Basic,
            ClassifierNet::Residual(_) => ClassifierTemplate::Residual,
        }
    }
}

impl Module<&Array> for ClassifierNet {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        match self {
            ClassifierNet::Basic(net) => net.forward(x),
            ClassifierNet::Residual(net) => net.forward(x),
        }
    }

    fn training_mode(&mut self, mode: bool) {
        match self {
            ClassifierNet::Basic(net) => net.training_mode(mode),
            ClassifierNet::Residual(net) => net.training_mode(mode),
        }
    }
}

// Manual ModuleParameters impl for enum dispatch
impl ModuleParametersTrait for ClassifierNet {
    fn num_parameters(&self) -> usize {
        match self {
            ClassifierNet::Basic(n) => n.num_parameters(),
            ClassifierNet::Residual(n) => n.num_parameters(),
        }
    }

    fn parameters(&self) -> ModuleParamRef<'_> {
        match self {
            ClassifierNet::Basic(n) => n.parameters(),
            ClassifierNet::Residual(n) => n.parameters(),
        }
    }

    fn parameters_mut(&mut self) -> ModuleParamMut<'_> {
        match self {
            ClassifierNet::Basic(n) => n.parameters_mut(),
            ClassifierNet::Residual(n) => n.parameters_mut(),
        }
    }

    fn trainable_parameters(&self) -> ModuleParamRef<'_> {
        match self {
            ClassifierNet::Basic(n) => n.trainable_parameters(),
            ClassifierNet::Residual(n) => n.trainable_parameters(),
        }
    }

    fn freeze_parameters(&mut self, recursive: bool) {
        match self {
            ClassifierNet::Basic(n) => n.freeze_parameters(recursive),
            ClassifierNet::Residual(n) => n.freeze_parameters(recursive),
        }
    }

    fn unfreeze_parameters(&mut self, recursive: bool) {
        match self {
            ClassifierNet::Basic(n) => n.unfreeze_parameters(recursive),
            ClassifierNet::Residual(n) => n.unfreeze_parameters(recursive),
        }
    }

    fn all_frozen(&self) -> Option<bool> {
        match self {
            ClassifierNet::Basic(n) => n.all_frozen(),
            ClassifierNet::Residual(n) => n.all_frozen(),
        }
    }

    fn any_frozen(&self) -> Option<bool> {
        match self {
            ClassifierNet::Basic(n) => n.any_frozen(),
            ClassifierNet::Residual(n) => n.any_frozen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::random;

    #[test]
    fn test_basic_logits_shape() {
        let config = SemanticConfig::default()
            .with_crop_size(16)
            .with_semantic_nclasses(3);
        let mut net = ClassifierNet::new(&config).unwrap();
        assert_eq!(net.template(), ClassifierTemplate::Basic);

        let x = random::normal::<f32>(&[4, 16, 16, 3], None, None, None).unwrap();
        assert_eq!(net.forward(&x).unwrap().shape(), &[4, 3]);
    }

    #[test]
    fn test_residual_regression_shape() {
        let config = SemanticConfig::default()
            .with_crop_size(16)
            .with_cls_template("residual")
            .with_regression();
        let mut net = ClassifierNet::new(&config).unwrap();
        assert_eq!(net.template(), ClassifierTemplate::Residual);

        let x = random::normal::<f32>(&[2, 16, 16, 3], None, None, None).unwrap();
        assert_eq!(net.forward(&x).unwrap().shape(), &[2, 1]);
    }

    #[test]
    fn test_enum_freeze_dispatch() {
        let config = SemanticConfig::default().with_cls_template("residual");
        let mut net = ClassifierNet::new(&config).unwrap();
        net.freeze_parameters(true);
        assert_eq!(net.all_frozen(), Some(true));
        assert!(net.trainable_parameters().flatten().is_empty());
        net.unfreeze_parameters(true);
        assert_eq!(net.any_frozen(), Some(false));
    }
}
