//! Model and training configuration

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Classifier architecture family selected by `cls_template`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierTemplate {
    /// Two strided conv blocks, global pooling, linear head
    Basic,
    /// Conv stem with residual blocks; accepts pretrained weights
    Residual,
}

impl FromStr for ClassifierTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "basic" => Ok(Self::Basic),
            "residual" => Ok(Self::Residual),
            other => Err(Error::config(format!(
                "unknown cls_template `{other}` (expected `basic` or `residual`)"
            ))),
        }
    }
}

/// What the semantic network predicts, fixed for the model's lifetime
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SemanticTask {
    /// Class logits, integer labels, cross-entropy
    Classification { nclasses: i32 },
    /// One scalar per image, float targets, L1 or squared error
    Regression { l1: bool },
}

impl SemanticTask {
    pub fn is_regression(&self) -> bool {
        matches!(self, Self::Regression { .. })
    }

    /// Width of the network's prediction head
    pub fn output_dim(&self) -> i32 {
        match self {
            Self::Classification { nclasses } => *nclasses,
            Self::Regression { .. } => 1,
        }
    }
}

/// Configuration for the CUT model with semantic consistency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    // === Images ===
    /// Channels of domain A images (default: 3)
    pub input_nc: i32,

    /// Channels of domain B images (default: 3)
    pub output_nc: i32,

    /// Square crop size of training images (default: 32)
    pub crop_size: i32,

    // === Networks ===
    /// Generator base width (default: 16)
    pub ngf: i32,

    /// Discriminator and classifier base width (default: 16)
    pub ndf: i32,

    /// Residual blocks in the generator (default: 2)
    pub n_blocks: usize,

    /// Width of the PatchSampleF projection heads (default: 64)
    pub netf_nc: i32,

    // === Optimization ===
    /// Generator, feature and discriminator learning rate (default: 2e-4)
    pub lr: f32,

    /// Adam beta1 for every optimizer (default: 0.5)
    pub beta1: f32,

    /// Adam beta2 for every optimizer (default: 0.999)
    pub beta2: f32,

    /// Micro-batches per logical step (default: 1)
    pub iter_size: usize,

    // === Base losses ===
    /// Weight of the adversarial generator loss (default: 1.0)
    pub lambda_gan: f32,

    /// Weight of the PatchNCE loss (default: 1.0)
    pub lambda_nce: f32,

    /// Also apply PatchNCE between real_B and G(real_B) (default: true)
    pub nce_idt: bool,

    /// Generator layers used for PatchNCE (default: [0, 1, 2])
    pub nce_layers: Vec<usize>,

    /// Patches sampled per layer (default: 64)
    pub num_patches: usize,

    /// PatchNCE temperature (default: 0.07)
    pub nce_t: f32,

    // === Semantic classifier ===
    /// Also train the classifier on domain B (default: false)
    pub train_cls_b: bool,

    /// Classifier architecture family (default: "basic")
    pub cls_template: String,

    /// Load pretrained classifier weights, non-basic templates only (default: false)
    pub cls_pretrained: bool,

    /// Safetensors file with pretrained classifier weights
    pub cls_weights: Option<PathBuf>,

    /// Classifier learning rate (default: 2e-4)
    pub lr_f_s: f32,

    /// Number of semantic classes (default: 10)
    pub semantic_nclasses: i32,

    /// Regress a scalar instead of classifying (default: false)
    pub regression: bool,

    /// Use L1 instead of squared error for regression (default: false)
    pub l1_regression: bool,

    /// Weight of the classifier and semantic losses (default: 1.0)
    pub lambda_sem: f32,

    /// Semantic loss is zeroed while the classifier loss is above this (default: 1.0)
    pub semantic_threshold: f32,

    // === Runtime ===
    /// Devices the batch is split across (default: 1)
    pub num_devices: usize,

    /// Seed for patch sampling (default: 42)
    pub seed: u64,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            // Images
            input_nc: 3,
            output_nc: 3,
            crop_size: 32,

            // Networks
            ngf: 16,
            ndf: 16,
            n_blocks: 2,
            netf_nc: 64,

            // Optimization
            lr: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            iter_size: 1,

            // Base losses
            lambda_gan: 1.0,
            lambda_nce: 1.0,
            nce_idt: true,
            nce_layers: vec![0, 1, 2],
            num_patches: 64,
            nce_t: 0.07,

            // Semantic classifier
            train_cls_b: false,
            cls_template: "basic".to_string(),
            cls_pretrained: false,
            cls_weights: None,
            lr_f_s: 2e-4,
            semantic_nclasses: 10,
            regression: false,
            l1_regression: false,
            lambda_sem: 1.0,
            semantic_threshold: 1.0,

            // Runtime
            num_devices: 1,
            seed: 42,
        }
    }
}

impl SemanticConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_crop_size(mut self, crop_size: i32) -> Self {
        self.crop_size = crop_size;
        self
    }

    pub fn with_semantic_nclasses(mut self, nclasses: i32) -> Self {
        self.semantic_nclasses = nclasses;
        self
    }

    pub fn with_iter_size(mut self, iter_size: usize) -> Self {
        self.iter_size = iter_size;
        self
    }

    /// Regression on one scalar per image, trained with squared error
    pub fn with_regression(mut self) -> Self {
        self.regression = true;
        self.l1_regression = false;
        self
    }

    /// Regression trained with mean absolute error
    pub fn with_l1_regression(mut self) -> Self {
        self.regression = true;
        self.l1_regression = true;
        self
    }

    pub fn with_train_cls_b(mut self, enabled: bool) -> Self {
        self.train_cls_b = enabled;
        self
    }

    pub fn with_cls_template(mut self, template: impl Into<String>) -> Self {
        self.cls_template = template.into();
        self
    }

    pub fn with_pretrained_classifier(mut self, weights: impl Into<PathBuf>) -> Self {
        self.cls_pretrained = true;
        self.cls_weights = Some(weights.into());
        self
    }

    pub fn with_semantic_threshold(mut self, threshold: f32) -> Self {
        self.semantic_threshold = threshold;
        self
    }

    pub fn with_lambda_sem(mut self, lambda_sem: f32) -> Self {
        self.lambda_sem = lambda_sem;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Load config from YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to YAML file
    pub fn to_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load config from JSON file
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Parsed classifier template
    pub fn template(&self) -> Result<ClassifierTemplate> {
        self.cls_template.parse()
    }

    /// Classification or regression, as selected by `regression` / `l1_regression`
    pub fn task(&self) -> SemanticTask {
        if self.regression {
            SemanticTask::Regression { l1: self.l1_regression }
        } else {
            SemanticTask::Classification {
                nclasses: self.semantic_nclasses,
            }
        }
    }

    /// Number of encoder layers `nce_layers` may index: the input, the stem,
    /// the downsampling conv and one per residual block.
    pub fn encoder_layers(&self) -> usize {
        3 + self.n_blocks
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_nc <= 0 || self.output_nc <= 0 {
            return Err(Error::config("input_nc and output_nc must be positive"));
        }
        // The classifier scores real_A, real_B and fake_B alike
        if self.input_nc != self.output_nc {
            return Err(Error::config(format!(
                "input_nc ({}) and output_nc ({}) must match",
                self.input_nc, self.output_nc
            )));
        }
        if self.crop_size < 8 || self.crop_size % 4 != 0 {
            return Err(Error::config(format!(
                "crop_size must be a multiple of 4 and at least 8, got {}",
                self.crop_size
            )));
        }
        if self.ngf <= 0 || self.ndf <= 0 || self.netf_nc <= 0 {
            return Err(Error::config("ngf, ndf and netf_nc must be positive"));
        }
        if self.lr <= 0.0 || self.lr_f_s <= 0.0 {
            return Err(Error::config("lr and lr_f_s must be positive"));
        }
        if self.iter_size == 0 {
            return Err(Error::config("iter_size must be at least 1"));
        }
        if self.l1_regression && !self.regression {
            return Err(Error::config("l1_regression requires regression"));
        }
        if !self.regression && self.semantic_nclasses < 2 {
            return Err(Error::config(format!(
                "classification needs at least 2 semantic classes, got {}",
                self.semantic_nclasses
            )));
        }
        let template = self.template()?;
        if self.cls_pretrained {
            if template == ClassifierTemplate::Basic {
                return Err(Error::config(
                    "cls_pretrained is only available for non-basic templates",
                ));
            }
            if self.cls_weights.is_none() {
                return Err(Error::config("cls_pretrained requires cls_weights"));
            }
        }
        if !self.semantic_threshold.is_finite() {
            return Err(Error::config("semantic_threshold must be finite"));
        }
        if self.lambda_sem < 0.0 || self.lambda_nce < 0.0 || self.lambda_gan < 0.0 {
            return Err(Error::config("loss weights must be non-negative"));
        }
        if self.nce_t <= 0.0 {
            return Err(Error::config("nce_t must be positive"));
        }
        if self.lambda_nce > 0.0 {
            if self.nce_layers.is_empty() {
                return Err(Error::config("nce_layers must not be empty when lambda_nce > 0"));
            }
            if let Some(layer) = self
                .nce_layers
                .iter()
                .find(|&&layer| layer >= self.encoder_layers())
            {
                return Err(Error::config(format!(
                    "nce layer {layer} out of range (encoder has {} layers)",
                    self.encoder_layers()
                )));
            }
            if self.num_patches < 2 {
                return Err(Error::config("num_patches must be at least 2"));
            }
        }
        Ok(())
    }
}
