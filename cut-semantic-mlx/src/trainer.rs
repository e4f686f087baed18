//! Training loop around [`CutSemanticModel`]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SemanticConfig;
use crate::error::{Error, Result};
use crate::model::{CutSemanticModel, DomainBatch};

/// Loop settings, separate from the model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Calls to `optimize_parameters` before stopping
    pub max_steps: usize,
    pub log_every: usize,
    /// Where checkpoints go; none disables saving
    pub checkpoint_dir: Option<PathBuf>,
    /// Checkpoint interval in steps (0 = only the final checkpoint)
    pub save_every: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            log_every: 10,
            checkpoint_dir: None,
            save_every: 0,
        }
    }
}

/// Training state that can be inspected between runs
#[derive(Debug, Default, Clone)]
pub struct TrainingState {
    pub step: usize,
    pub total_time_secs: f64,
    /// Losses reported after the last step
    pub last_losses: BTreeMap<String, f32>,
}

pub struct SemanticTrainer {
    config: TrainerConfig,
    model: CutSemanticModel,
    state: TrainingState,
}

impl SemanticTrainer {
    pub fn new(model_config: SemanticConfig, config: TrainerConfig) -> Result<Self> {
        if config.log_every == 0 {
            return Err(Error::config("log_every must be at least 1"));
        }
        let model = CutSemanticModel::new(model_config)?;
        Ok(Self {
            config,
            model,
            state: TrainingState::default(),
        })
    }

    /// One step on `batch`; the first batch ever seen initializes the model
    pub fn train_step(&mut self, batch: DomainBatch) -> Result<&BTreeMap<String, f32>> {
        if !self.model.is_initialized() {
            self.model.data_dependent_initialize(batch.clone())?;
        }
        self.model.set_input(batch)?;
        self.model.optimize_parameters()?;
        self.state.step += 1;
        self.state.last_losses = self.model.current_losses();
        Ok(&self.state.last_losses)
    }

    /// Train until `max_steps` or until `batches` runs out
    pub fn train<I>(&mut self, batches: I) -> Result<()>
    where
        I: IntoIterator<Item = DomainBatch>,
    {
        info!(
            max_steps = self.config.max_steps,
            iter_size = self.model.config().iter_size,
            "starting training"
        );
        if let Some(dir) = &self.config.checkpoint_dir {
            std::fs::create_dir_all(dir)?;
        }

        let start = Instant::now();
        for batch in batches {
            if self.state.step >= self.config.max_steps {
                break;
            }
            self.train_step(batch)?;
            let step = self.state.step;

            if step % self.config.log_every == 0 {
                let losses = self
                    .state
                    .last_losses
                    .iter()
                    .map(|(name, value)| format!("{name}={value:.4}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                info!(
                    step,
                    max_steps = self.config.max_steps,
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    "{losses}"
                );
            }

            if self.config.save_every > 0 && step % self.config.save_every == 0 {
                if let Some(dir) = &self.config.checkpoint_dir {
                    let path = dir.join(format!("checkpoint-{step}.safetensors"));
                    self.save(&path)?;
                    info!(path = %path.display(), "saved checkpoint");
                }
            }
        }

        if let Some(dir) = &self.config.checkpoint_dir {
            let path = dir.join("final.safetensors");
            self.save(&path)?;
            info!(path = %path.display(), "saved final weights");
        }
        self.state.total_time_secs += start.elapsed().as_secs_f64();
        info!(
            steps = self.state.step,
            secs = self.state.total_time_secs,
            "training done"
        );
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.model.save_weights(path)
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.model.load_weights(path)
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &CutSemanticModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut CutSemanticModel {
        &mut self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticDomains;

    fn tiny_config() -> SemanticConfig {
        let mut config = SemanticConfig::default()
            .with_crop_size(8)
            .with_semantic_nclasses(3);
        config.ngf = 4;
        config.ndf = 4;
        config.n_blocks = 1;
        config.netf_nc = 8;
        config.num_patches = 8;
        config
    }

    #[test]
    fn test_trainer_config_default() {
        let config = TrainerConfig::default();
        assert_eq!(config.max_steps, 100);
        assert!(config.checkpoint_dir.is_none());
    }

    #[test]
    fn test_zero_log_interval_rejected() {
        let config = TrainerConfig {
            log_every: 0,
            ..Default::default()
        };
        assert!(matches!(
            SemanticTrainer::new(tiny_config(), config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_train_stops_at_max_steps() {
        let model_config = tiny_config();
        let data = SyntheticDomains::new(&model_config, 2);
        let dir = tempfile::tempdir().unwrap();
        let config = TrainerConfig {
            max_steps: 2,
            log_every: 1,
            checkpoint_dir: Some(dir.path().to_path_buf()),
            save_every: 1,
        };
        let mut trainer = SemanticTrainer::new(model_config, config).unwrap();
        trainer.train(data).unwrap();

        assert_eq!(trainer.state().step, 2);
        assert_eq!(trainer.model().iteration(), 2);
        assert!(trainer.state().last_losses.contains_key("CLS"));
        assert!(dir.path().join("checkpoint-1.safetensors").exists());
        assert!(dir.path().join("final.safetensors").exists());
    }
}
