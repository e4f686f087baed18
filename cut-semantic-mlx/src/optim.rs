//! Adam optimizers bound to a single network, with gradient accumulation.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use mlx_rs::{
    array,
    module::{FlattenedModuleParam, ModuleParameters},
    optimizers::{Adam, Optimizer},
    transforms::eval,
    Array,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::networks::{NetworkId, SemanticNetworks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptimizerId {
    G,
    F,
    D,
    Cls,
}

impl OptimizerId {
    pub const ALL: [OptimizerId; 4] = [OptimizerId::G, OptimizerId::F, OptimizerId::D, OptimizerId::Cls];

    pub fn name(&self) -> &'static str {
        match self {
            OptimizerId::G => "optimizer_G",
            OptimizerId::F => "optimizer_F",
            OptimizerId::D => "optimizer_D",
            OptimizerId::Cls => "optimizer_CLS",
        }
    }
}

impl fmt::Display for OptimizerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OptimizerId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| Error::config(format!("unknown optimizer `{s}`")))
    }
}

/// Adam over one network's parameters.
///
/// Gradients for other networks are ignored, so stepping never touches
/// parameters outside `network`.
pub struct BoundOptimizer {
    id: OptimizerId,
    network: NetworkId,
    adam: Adam,
    pending: FlattenedModuleParam,
    micro_batches: usize,
}

impl fmt::Debug for BoundOptimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundOptimizer")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("pending", &self.pending.len())
            .field("micro_batches", &self.micro_batches)
            .finish()
    }
}

impl BoundOptimizer {
    pub fn new(id: OptimizerId, network: NetworkId, lr: f32, beta1: f32, beta2: f32) -> Self {
        let mut adam = Adam::new(lr);
        adam.betas = (array!(beta1), array!(beta2));
        Self {
            id,
            network,
            adam,
            pending: HashMap::new(),
            micro_batches: 0,
        }
    }

    pub fn id(&self) -> OptimizerId {
        self.id
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn learning_rate(&self) -> f32 {
        self.adam.lr.item::<f32>()
    }

    /// Micro-batches accumulated since the last step or zero_grad
    pub fn pending_micro_batches(&self) -> usize {
        self.micro_batches
    }

    /// Add `scale * grad` for every gradient of the bound network.
    pub fn accumulate(&mut self, grads: &FlattenedModuleParam, scale: f32) -> Result<()> {
        for (key, grad) in grads.iter().filter(|(key, _)| self.network.owns(key)) {
            let scaled = if scale == 1.0 {
                grad.clone()
            } else {
                grad.multiply(array!(scale))?
            };
            let summed = match self.pending.get(key) {
                Some(previous) => previous.add(&scaled)?,
                None => scaled,
            };
            self.pending.insert(Rc::clone(key), summed);
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// Apply the accumulated gradients, then clear them.
    pub fn step(&mut self, networks: &mut SemanticNetworks) -> Result<()> {
        if self.pending.is_empty() {
            debug!(optimizer = self.id.name(), "no gradients accumulated, skipping step");
            self.micro_batches = 0;
            return Ok(());
        }

        self.adam.update(networks, &self.pending)?;

        let network = self.network;
        let updated: Vec<Array> = networks
            .parameters()
            .flatten()
            .into_iter()
            .filter(|(key, _)| network.owns(key))
            .map(|(_, value)| value.clone())
            .collect();
        eval(updated.iter())?;

        debug!(
            optimizer = self.id.name(),
            tensors = self.pending.len(),
            micro_batches = self.micro_batches,
            "optimizer step"
        );
        self.zero_grad();
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.pending.clear();
        self.micro_batches = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grads(entries: &[(&str, f32)]) -> FlattenedModuleParam {
        entries
            .iter()
            .map(|(k, v)| (Rc::from(*k), Array::from_slice(&[*v], &[1])))
            .collect()
    }

    #[test]
    fn test_optimizer_names_roundtrip() {
        for id in OptimizerId::ALL {
            assert_eq!(id.name().parse::<OptimizerId>().unwrap(), id);
        }
        assert!("optimizer_X".parse::<OptimizerId>().is_err());
    }

    #[test]
    fn test_accumulate_filters_and_scales() {
        let mut opt = BoundOptimizer::new(OptimizerId::D, NetworkId::Discriminator, 2e-4, 0.5, 0.999);
        let g = grads(&[("discriminator.out.bias", 2.0), ("generator.head.bias", 5.0)]);

        opt.accumulate(&g, 0.5).unwrap();
        opt.accumulate(&g, 0.5).unwrap();

        assert_eq!(opt.pending_micro_batches(), 2);
        assert_eq!(opt.pending.len(), 1);
        let summed = opt.pending.get("discriminator.out.bias").unwrap();
        assert_eq!(summed.item::<f32>(), 2.0);

        opt.zero_grad();
        assert!(opt.pending.is_empty());
        assert_eq!(opt.pending_micro_batches(), 0);
    }

    #[test]
    fn test_learning_rate() {
        let opt = BoundOptimizer::new(OptimizerId::Cls, NetworkId::Classifier, 1e-3, 0.5, 0.999);
        assert!((opt.learning_rate() - 1e-3).abs() < 1e-9);
        assert_eq!(opt.network(), NetworkId::Classifier);
    }
}
