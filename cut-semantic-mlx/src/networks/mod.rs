//! The four trained networks and the layers they share.

pub mod classifier;
pub mod discriminator;
pub mod feature;
pub mod generator;

pub use classifier::ClassifierNet;
pub use discriminator::PatchDiscriminator;
pub use feature::PatchSampleF;
pub use generator::ResnetGenerator;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use mlx_rs::{
    array,
    builder::Builder,
    error::Exception,
    macros::ModuleParameters,
    module::{Module, ModuleParameters as _},
    nn, ops,
    transforms::eval,
    Array,
};

use crate::config::SemanticConfig;
use crate::error::{Error, Result};

/// Handle of one trained network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkId {
    Generator,
    Feature,
    Discriminator,
    Classifier,
}

impl NetworkId {
    pub const ALL: [NetworkId; 4] = [
        NetworkId::Generator,
        NetworkId::Feature,
        NetworkId::Discriminator,
        NetworkId::Classifier,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NetworkId::Generator => "netG",
            NetworkId::Feature => "netF",
            NetworkId::Discriminator => "netD",
            NetworkId::Classifier => "netCLS",
        }
    }

    /// Leading component of this network's flattened parameter keys
    pub fn prefix(&self) -> &'static str {
        match self {
            NetworkId::Generator => "generator",
            NetworkId::Feature => "feature",
            NetworkId::Discriminator => "discriminator",
            NetworkId::Classifier => "classifier",
        }
    }

    /// Whether a flattened parameter key belongs to this network
    pub fn owns(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NetworkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NetworkId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| Error::config(format!("unknown network `{s}`")))
    }
}

/// Generator, feature projector, discriminator and semantic classifier.
///
/// Differentiation always runs over the whole struct; freezing decides
/// which networks contribute trainable parameters.
#[derive(Debug, ModuleParameters)]
pub struct SemanticNetworks {
    #[param]
    pub generator: ResnetGenerator,
    #[param]
    pub feature: PatchSampleF,
    #[param]
    pub discriminator: PatchDiscriminator,
    #[param]
    pub classifier: ClassifierNet,
}

impl SemanticNetworks {
    pub fn new(config: &SemanticConfig, classifier: ClassifierNet) -> Result<Self> {
        Ok(Self {
            generator: ResnetGenerator::new(config)?,
            feature: PatchSampleF::new(config)?,
            discriminator: PatchDiscriminator::new(config)?,
            classifier,
        })
    }

    pub fn set_frozen(&mut self, id: NetworkId, frozen: bool) {
        match (id, frozen) {
            (NetworkId::Generator, true) => self.generator.freeze_parameters(true),
            (NetworkId::Generator, false) => self.generator.unfreeze_parameters(true),
            (NetworkId::Feature, true) => self.feature.freeze_parameters(true),
            (NetworkId::Feature, false) => self.feature.unfreeze_parameters(true),
            (NetworkId::Discriminator, true) => self.discriminator.freeze_parameters(true),
            (NetworkId::Discriminator, false) => self.discriminator.unfreeze_parameters(true),
            (NetworkId::Classifier, true) => self.classifier.freeze_parameters(true),
            (NetworkId::Classifier, false) => self.classifier.unfreeze_parameters(true),
        }
    }

    pub fn is_frozen(&self, id: NetworkId) -> bool {
        let all_frozen = match id {
            NetworkId::Generator => self.generator.all_frozen(),
            NetworkId::Feature => self.feature.all_frozen(),
            NetworkId::Discriminator => self.discriminator.all_frozen(),
            NetworkId::Classifier => self.classifier.all_frozen(),
        };
        all_frozen.unwrap_or(false)
    }

    pub fn unfreeze_all(&mut self) {
        for id in NetworkId::ALL {
            self.set_frozen(id, false);
        }
    }

    pub fn num_parameters_of(&self, id: NetworkId) -> usize {
        match id {
            NetworkId::Generator => self.generator.num_parameters(),
            NetworkId::Feature => self.feature.num_parameters(),
            NetworkId::Discriminator => self.discriminator.num_parameters(),
            NetworkId::Classifier => self.classifier.num_parameters(),
        }
    }

    /// Evaluated copy of one network's parameters, keyed by flattened name
    pub fn snapshot(&self, id: NetworkId) -> Result<BTreeMap<String, Vec<f32>>> {
        let params: Vec<(String, Array)> = self
            .parameters()
            .flatten()
            .into_iter()
            .filter(|(key, _)| id.owns(key))
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        eval(params.iter().map(|(_, v)| v))?;
        Ok(params
            .into_iter()
            .map(|(key, value)| (key, value.as_slice::<f32>().to_vec()))
            .collect())
    }

    /// Force evaluation of every parameter
    pub fn eval_all(&self) -> Result<()> {
        let params: Vec<Array> = self
            .parameters()
            .flatten()
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect();
        eval(params.iter())?;
        Ok(())
    }
}

/// Conv, instance norm, ReLU, conv, instance norm, plus the skip connection
#[derive(Debug, ModuleParameters)]
pub struct ResidualBlock {
    #[param]
    pub conv1: nn::Conv2d,
    #[param]
    pub conv2: nn::Conv2d,
}

impl ResidualBlock {
    pub fn new(channels: i32) -> Result<Self> {
        let conv1 = nn::Conv2dBuilder::new(channels, channels, (3, 3))
            .padding((1, 1))
            .build()?;
        let conv2 = nn::Conv2dBuilder::new(channels, channels, (3, 3))
            .padding((1, 1))
            .build()?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module<&Array> for ResidualBlock {
    type Output = Array;
    type Error = Exception;

    fn forward(&mut self, x: &Array) -> std::result::Result<Array, Exception> {
        let h = nn::relu(instance_norm(&self.conv1.forward(x)?)?)?;
        let h = instance_norm(&self.conv2.forward(&h)?)?;
        x.add(&h)
    }

    fn training_mode(&mut self, _mode: bool) {}
}

/// Per-image, per-channel normalization over H and W of an NHWC tensor
pub fn instance_norm(x: &Array) -> std::result::Result<Array, Exception> {
    let mean = ops::mean_axis(&ops::mean_axis(x, 1, true)?, 2, true)?;
    let centered = x.subtract(&mean)?;
    let var = ops::mean_axis(&ops::mean_axis(&centered.square()?, 1, true)?, 2, true)?;
    centered.divide(&var.add(array!(1e-5f32))?.sqrt()?)
}

pub fn leaky_relu(x: &Array) -> std::result::Result<Array, Exception> {
    ops::maximum(x, &x.multiply(array!(0.2f32))?)
}

/// 2x nearest-neighbour upsampling of an NHWC tensor
pub fn upsample_nearest(x: &Array) -> std::result::Result<Array, Exception> {
    let shape = x.shape();
    let (b, h, w, c) = (shape[0], shape[1], shape[2], shape[3]);
    let x = x.reshape(&[b, h, 1, w, 1, c])?;
    let x = ops::broadcast_to(&x, &[b, h, 2, w, 2, c])?;
    x.reshape(&[b, h * 2, w * 2, c])
}

/// L2 normalize the last dimension of an array.
pub fn l2_normalize(x: &Array, eps: f32) -> std::result::Result<Array, Exception> {
    let norm_sq = x.square()?.sum_axis(-1, true)?;
    let norm = norm_sq.sqrt()?.add(array!(eps))?;
    x.divide(&norm)
}
