//! Semantic classifier wrapper: network, criterion and optimizer.
//!
//! In classification mode the classifier emits logits and is trained with
//! cross-entropy against integer labels. In regression mode it emits one
//! value per image; the singleton prediction dimension is squeezed before
//! the L1 or squared-error criterion is applied.

use mlx_rs::{
    argmax_axis, array, error::Exception, module::{Module, ModuleParametersExt}, nn, ops, Array,
};
use tracing::info;

use crate::config::{ClassifierTemplate, SemanticConfig, SemanticTask};
use crate::error::{Error, Result};
use crate::networks::{ClassifierNet, NetworkId};
use crate::optim::{BoundOptimizer, OptimizerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticCriterion {
    CrossEntropy,
    L1,
    Mse,
}

impl SemanticCriterion {
    pub fn for_task(task: SemanticTask) -> Self {
        match task {
            SemanticTask::Classification { .. } => SemanticCriterion::CrossEntropy,
            SemanticTask::Regression { l1: true } => SemanticCriterion::L1,
            SemanticTask::Regression { l1: false } => SemanticCriterion::Mse,
        }
    }

    /// Mean loss of `pred` against `target`.
    ///
    /// Cross-entropy takes `[B, C]` logits and `[B]` class ids. The
    /// regression criteria take `[B, 1]` predictions and `[B]` targets.
    pub fn apply(&self, pred: &Array, target: &Array) -> std::result::Result<Array, Exception> {
        match self {
            SemanticCriterion::CrossEntropy => {
                let batch = pred.shape()[0];
                let log_probs = nn::log_softmax(pred, Some(-1))?;
                let targets = target.as_type::<i32>()?.reshape(&[batch, 1])?;
                let picked = log_probs.take_along_axis(&targets, -1)?;
                ops::mean(&picked.negative()?, false)
            }
            SemanticCriterion::L1 | SemanticCriterion::Mse => {
                let squeezed = pred.squeeze_axes(&[1])?;
                if squeezed.shape() != target.shape() {
                    return Err(Exception::custom(format!(
                        "regression prediction {:?} does not match target {:?}",
                        squeezed.shape(),
                        target.shape()
                    )));
                }
                let diff = squeezed.subtract(target)?;
                let per_item = match self {
                    SemanticCriterion::L1 => ops::abs(&diff)?,
                    _ => diff.square()?,
                };
                ops::mean(&per_item, false)
            }
        }
    }
}

/// Owns everything about the classifier except its parameters, which live
/// in [`crate::networks::SemanticNetworks`].
#[derive(Debug, Clone)]
pub struct SemanticClassifier {
    pub task: SemanticTask,
    pub criterion: SemanticCriterion,
    pub lambda_sem: f32,
    pub train_cls_b: bool,
}

impl SemanticClassifier {
    /// Build the network, the loss wrapper and the classifier's own Adam
    /// (`lr_f_s`, `beta1`, `beta2`).
    pub fn define(config: &SemanticConfig) -> Result<(ClassifierNet, Self, BoundOptimizer)> {
        let mut net = ClassifierNet::new(config)?;

        if config.cls_pretrained {
            if net.template() == ClassifierTemplate::Basic {
                return Err(Error::config(
                    "cls_pretrained is only available for non-basic templates",
                ));
            }
            let path = config
                .cls_weights
                .as_ref()
                .ok_or_else(|| Error::config("cls_pretrained requires cls_weights"))?;
            if !path.exists() {
                return Err(Error::WeightFileNotFound { path: path.clone() });
            }
            net.load_safetensors(path)?;
            info!(path = %path.display(), "loaded pretrained classifier weights");
        }

        let task = config.task();
        let wrapper = Self {
            task,
            criterion: SemanticCriterion::for_task(task),
            lambda_sem: config.lambda_sem,
            train_cls_b: config.train_cls_b,
        };
        let optimizer = BoundOptimizer::new(
            OptimizerId::Cls,
            NetworkId::Classifier,
            config.lr_f_s,
            config.beta1,
            config.beta2,
        );
        Ok((net, wrapper, optimizer))
    }

    /// Classifier loss on real_A and, with `train_cls_b`, on real_B.
    /// Each domain's criterion is scaled by `lambda_sem` before summing.
    pub fn compute_cls_loss(
        &self,
        net: &mut ClassifierNet,
        real_a: &Array,
        label_a: &Array,
        domain_b: Option<(&Array, &Array)>,
    ) -> std::result::Result<Array, Exception> {
        let pred_a = net.forward(real_a)?;
        let mut loss = self
            .criterion
            .apply(&pred_a, label_a)?
            .multiply(array!(self.lambda_sem))?;

        if self.train_cls_b {
            let (real_b, label_b) = domain_b
                .ok_or_else(|| Exception::custom("train_cls_b is set but no domain B label was given"))?;
            let pred_b = net.forward(real_b)?;
            let loss_b = self
                .criterion
                .apply(&pred_b, label_b)?
                .multiply(array!(self.lambda_sem))?;
            loss = loss.add(&loss_b)?;
        }
        Ok(loss)
    }

    /// Criterion of the classifier's prediction on fake_B against A's label
    pub fn semantic_loss(
        &self,
        pred_fake_b: &Array,
        label_a: &Array,
    ) -> std::result::Result<Array, Exception> {
        self.criterion.apply(pred_fake_b, label_a)
    }

    /// Predicted class ids, or squeezed predicted values in regression mode
    pub fn predicted_labels(&self, pred: &Array) -> std::result::Result<Array, Exception> {
        if self.task.is_regression() {
            pred.squeeze_axes(&[1])
        } else {
            argmax_axis!(pred, 1)
        }
    }
}
