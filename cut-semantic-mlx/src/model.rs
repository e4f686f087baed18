//! CUT with a semantic consistency classifier.
//!
//! One call to [`CutSemanticModel::optimize_parameters`] runs the ordered
//! network groups (generator, discriminator, classifier by default). Each
//! group differentiates its own back-propagated loss with every other
//! network frozen, so classifier gradients only reach the generator through
//! the semantic loss computed with the classifier frozen.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use mlx_rs::{
    array,
    error::Exception,
    module::{Module, ModuleParametersExt},
    ops::indexing::IndexOp,
    random,
    transforms::eval,
    Array, Dtype,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::base::{lsgan_loss, patch_nce_loss};
use crate::classifier::SemanticClassifier;
use crate::config::{SemanticConfig, SemanticTask};
use crate::error::{Error, Result};
use crate::gate::{ClassifierQuality, GateDecision, SemanticGate};
use crate::group::{BackwardRoutine, ForwardRoutine, NetworkGroup, RoutineCatalog, StepTensor};
use crate::losses::{LossName, LossRegistry};
use crate::networks::{NetworkId, SemanticNetworks};
use crate::optim::{BoundOptimizer, OptimizerId};
use crate::orchestrator::{
    DomainImages, GroupReport, GroupRoutines, RoutineLosses, StepPlan, TrainingOrchestrator,
};

/// One unpaired training batch. Images are NHWC float tensors.
#[derive(Debug, Clone)]
pub struct DomainBatch {
    pub real_a: Array,
    pub real_b: Array,
    /// Class ids (classification) or targets (regression) of `real_a`
    pub a_label: Option<Array>,
    pub b_label: Option<Array>,
}

impl DomainBatch {
    pub fn new(real_a: Array, real_b: Array) -> Self {
        Self {
            real_a,
            real_b,
            a_label: None,
            b_label: None,
        }
    }

    pub fn with_a_label(mut self, label: Array) -> Self {
        self.a_label = Some(label);
        self
    }

    pub fn with_b_label(mut self, label: Array) -> Self {
        self.b_label = Some(label);
        self
    }
}

/// Tensors produced once per step and read by later routines
#[derive(Debug, Clone, Default)]
pub struct SharedTensors {
    pub fake_b: Option<Array>,
    pub idt_b: Option<Array>,
    pub pred_real_a: Option<Array>,
    pub pred_fake_b: Option<Array>,
    /// Predicted class of real_A (squeezed prediction in regression mode)
    pub gt_pred_a: Option<Array>,
    pub pred_fake_b_class: Option<Array>,
}

impl SharedTensors {
    pub fn get(&self, tensor: StepTensor) -> Option<&Array> {
        match tensor {
            StepTensor::FakeB => self.fake_b.as_ref(),
            StepTensor::IdtB => self.idt_b.as_ref(),
            StepTensor::PredRealA => self.pred_real_a.as_ref(),
            StepTensor::PredFakeB => self.pred_fake_b.as_ref(),
        }
    }

    fn require(&self, tensor: StepTensor) -> std::result::Result<Array, Exception> {
        self.get(tensor).cloned().ok_or_else(|| {
            Exception::custom(format!("`{}` was not produced this step", tensor.name()))
        })
    }

    pub fn clear(&mut self) {
        *self = SharedTensors::default();
    }

    fn eval(&self) -> Result<()> {
        let present: Vec<&Array> = [
            &self.fake_b,
            &self.idt_b,
            &self.pred_real_a,
            &self.pred_fake_b,
            &self.gt_pred_a,
            &self.pred_fake_b_class,
        ]
        .into_iter()
        .flatten()
        .collect();
        eval(present)?;
        Ok(())
    }
}

/// PatchNCE keys, computed before the generator trace so they act as constants
#[derive(Debug, Clone)]
struct NceKeys {
    ids_a: Vec<Array>,
    keys_a: Vec<Array>,
    ids_b: Vec<Array>,
    keys_b: Vec<Array>,
}

/// Per-step state and the routines the network groups name
pub struct StepContext {
    classifier: SemanticClassifier,
    gate: SemanticGate,
    quality: ClassifierQuality,
    gate_decision: GateDecision,
    gate_closed: bool,
    lambda_gan: f32,
    lambda_nce: f32,
    nce_idt: bool,
    nce_layers: Vec<usize>,
    nce_t: f32,
    a_label: Option<Array>,
    b_label: Option<Array>,
    shared: SharedTensors,
    nce_keys: Option<NceKeys>,
    rng: StdRng,
}

impl StepContext {
    fn new(config: &SemanticConfig, classifier: SemanticClassifier) -> Self {
        Self {
            classifier,
            gate: SemanticGate::new(config.semantic_threshold),
            quality: ClassifierQuality::Unknown,
            gate_decision: GateDecision::Open,
            gate_closed: false,
            lambda_gan: config.lambda_gan,
            lambda_nce: config.lambda_nce,
            nce_idt: config.nce_idt,
            nce_layers: config.nce_layers.clone(),
            nce_t: config.nce_t,
            a_label: None,
            b_label: None,
            shared: SharedTensors::default(),
            nce_keys: None,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    fn require_label(
        label: &Option<Array>,
        domain: &'static str,
        required_by: &'static str,
    ) -> Result<()> {
        match label {
            Some(_) => Ok(()),
            None => Err(Error::MissingLabel {
                domain,
                required_by,
            }),
        }
    }

    fn decide_gate(&mut self) {
        let decision = self.gate.decide(self.quality);
        match decision {
            GateDecision::Closed { quality } => {
                if !self.gate_closed {
                    warn!(
                        quality,
                        threshold = self.gate.threshold,
                        "classifier loss above threshold, semantic loss zeroed"
                    );
                } else {
                    debug!(quality, "semantic gate closed");
                }
                self.gate_closed = true;
            }
            GateDecision::Open => {
                debug!(quality = ?self.quality.value(), "semantic gate open");
                self.gate_closed = false;
            }
        }
        self.gate_decision = decision;
    }

    fn prepare_nce_keys(
        &mut self,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> Result<()> {
        if self.lambda_nce <= 0.0 {
            self.nce_keys = None;
            return Ok(());
        }

        let feats_a = networks.generator.encode(images.real_a, &self.nce_layers)?;
        let ids_a = networks.feature.draw_patch_ids(&feats_a, &mut self.rng);
        let keys_a = networks.feature.project(&feats_a, &ids_a)?;

        let (ids_b, keys_b) = if self.nce_idt {
            let feats_b = networks.generator.encode(images.real_b, &self.nce_layers)?;
            let ids_b = networks.feature.draw_patch_ids(&feats_b, &mut self.rng);
            let keys_b = networks.feature.project(&feats_b, &ids_b)?;
            (ids_b, keys_b)
        } else {
            (Vec::new(), Vec::new())
        };

        eval(keys_a.iter().chain(keys_b.iter()))?;
        self.nce_keys = Some(NceKeys {
            ids_a,
            keys_a,
            ids_b,
            keys_b,
        });
        Ok(())
    }

    fn generator_loss(
        &mut self,
        networks: &mut SemanticNetworks,
    ) -> std::result::Result<RoutineLosses, Exception> {
        let fake_b = self.shared.require(StepTensor::FakeB)?;
        let pred_fake_b = self.shared.require(StepTensor::PredFakeB)?;

        let pred_fake = networks.discriminator.forward(&fake_b)?;
        let g_gan = lsgan_loss(&pred_fake, true)?.multiply(array!(self.lambda_gan))?;

        let (nce, nce_y) = match (&self.nce_keys, self.lambda_nce > 0.0) {
            (Some(keys), true) => {
                let nce = nce_over_layers(
                    networks,
                    &self.nce_layers,
                    &fake_b,
                    &keys.ids_a,
                    &keys.keys_a,
                    self.nce_t,
                    self.lambda_nce,
                )?;
                let nce_y = if self.nce_idt {
                    let idt_b = self.shared.require(StepTensor::IdtB)?;
                    nce_over_layers(
                        networks,
                        &self.nce_layers,
                        &idt_b,
                        &keys.ids_b,
                        &keys.keys_b,
                        self.nce_t,
                        self.lambda_nce,
                    )?
                } else {
                    array!(0.0f32)
                };
                (nce, nce_y)
            }
            (None, true) => return Err(Exception::custom("PatchNCE keys were not prepared")),
            (_, false) => (array!(0.0f32), array!(0.0f32)),
        };
        let nce_both = if self.nce_idt && self.lambda_nce > 0.0 {
            nce.add(&nce_y)?.multiply(array!(0.5f32))?
        } else {
            nce.clone()
        };

        let label_a = self
            .a_label
            .as_ref()
            .ok_or_else(|| Exception::custom("domain A label missing"))?;
        let sem = self.classifier.semantic_loss(&pred_fake_b, label_a)?;
        let sem = self.gate.apply(&sem, self.gate_decision)?;

        let g = g_gan.add(&nce_both)?.add(&sem)?;
        Ok(RoutineLosses {
            total: g.clone(),
            losses: vec![
                (LossName::GGan, g_gan),
                (LossName::Nce, nce),
                (LossName::NceY, nce_y),
                (LossName::Sem, sem),
                (LossName::G, g),
            ],
        })
    }

    fn discriminator_loss(
        &mut self,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<RoutineLosses, Exception> {
        // fake_B was produced by an earlier group and is a constant here
        let fake_b = self.shared.require(StepTensor::FakeB)?;
        let d_fake = lsgan_loss(&networks.discriminator.forward(&fake_b)?, false)?;
        let d_real = lsgan_loss(&networks.discriminator.forward(images.real_b)?, true)?;
        let d = d_fake.add(&d_real)?.multiply(array!(0.5f32))?;
        Ok(RoutineLosses {
            total: d.clone(),
            losses: vec![
                (LossName::DFake, d_fake),
                (LossName::DReal, d_real),
                (LossName::D, d),
            ],
        })
    }

    fn classifier_loss(
        &mut self,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<RoutineLosses, Exception> {
        let label_a = self
            .a_label
            .as_ref()
            .ok_or_else(|| Exception::custom("domain A label missing"))?;
        let domain_b = match (&self.b_label, self.classifier.train_cls_b) {
            (Some(label_b), true) => Some((images.real_b, label_b)),
            _ => None,
        };
        let cls = self.classifier.compute_cls_loss(
            &mut networks.classifier,
            images.real_a,
            label_a,
            domain_b,
        )?;
        Ok(RoutineLosses {
            total: cls.clone(),
            losses: vec![(LossName::Cls, cls)],
        })
    }
}

/// Mean over NCE layers of `lambda_nce * PatchNCE(G(target) patches, keys)`
fn nce_over_layers(
    networks: &mut SemanticNetworks,
    layers: &[usize],
    target: &Array,
    ids: &[Array],
    keys: &[Array],
    nce_t: f32,
    lambda_nce: f32,
) -> std::result::Result<Array, Exception> {
    let batch = target.shape()[0];
    let feats = networks.generator.encode(target, layers)?;
    let queries = networks.feature.project(&feats, ids)?;

    let mut total = array!(0.0f32);
    for (q, k) in queries.iter().zip(keys) {
        let layer_loss = patch_nce_loss(q, k, batch, nce_t)?.multiply(array!(lambda_nce))?;
        total = total.add(&layer_loss)?;
    }
    total.divide(array!(layers.len().max(1) as f32))
}

impl GroupRoutines for StepContext {
    fn prepare(
        &mut self,
        group: &NetworkGroup,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> Result<()> {
        let produced = group.produced_tensors();
        for &routine in group.backward_fns() {
            if let Some(missing) = routine
                .requires()
                .iter()
                .find(|t| !produced.contains(*t) && self.shared.get(**t).is_none())
            {
                return Err(Error::MissingStepTensor(missing.name()));
            }

            match routine {
                BackwardRoutine::GeneratorLoss => {
                    Self::require_label(&self.a_label, "A", routine.name())?;
                    self.decide_gate();
                    self.prepare_nce_keys(networks, images)?;
                }
                BackwardRoutine::ClassifierLoss => {
                    Self::require_label(&self.a_label, "A", routine.name())?;
                    if self.classifier.train_cls_b {
                        Self::require_label(&self.b_label, "B", routine.name())?;
                    }
                }
                BackwardRoutine::DiscriminatorLoss => {}
            }
        }
        Ok(())
    }

    fn forward(
        &mut self,
        routine: ForwardRoutine,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<(), Exception> {
        match routine {
            ForwardRoutine::Translate => {
                let fake_b = networks.generator.forward(images.real_a)?;
                let idt_b = if self.nce_idt {
                    Some(networks.generator.forward(images.real_b)?)
                } else {
                    None
                };
                let pred_real_a = networks.classifier.forward(images.real_a)?;
                let pred_fake_b = networks.classifier.forward(&fake_b)?;

                self.shared = SharedTensors {
                    gt_pred_a: Some(self.classifier.predicted_labels(&pred_real_a)?),
                    pred_fake_b_class: Some(self.classifier.predicted_labels(&pred_fake_b)?),
                    fake_b: Some(fake_b),
                    idt_b,
                    pred_real_a: Some(pred_real_a),
                    pred_fake_b: Some(pred_fake_b),
                };
                Ok(())
            }
        }
    }

    fn backward(
        &mut self,
        routine: BackwardRoutine,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<RoutineLosses, Exception> {
        match routine {
            BackwardRoutine::GeneratorLoss => self.generator_loss(networks),
            BackwardRoutine::DiscriminatorLoss => self.discriminator_loss(networks, images),
            BackwardRoutine::ClassifierLoss => self.classifier_loss(networks, images),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Regular step: losses are reported and the classifier quality observed
    Train,
    /// Data-dependent initialization: gradients only
    Warmup,
}

/// The semantic CUT model
pub struct CutSemanticModel {
    config: SemanticConfig,
    networks: SemanticNetworks,
    orchestrator: TrainingOrchestrator,
    ctx: StepContext,
    registry: LossRegistry,
    last_reports: Vec<GroupReport>,
    batch: Option<DomainBatch>,
    niter: usize,
    initialized: bool,
}

impl CutSemanticModel {
    /// Model with the generator, discriminator and classifier groups
    pub fn new(config: SemanticConfig) -> Result<Self> {
        let groups = NetworkGroup::standard(config.nce_idt)?;
        Self::with_groups(config, groups)
    }

    /// Model driven by custom network groups, validated here
    pub fn with_groups(config: SemanticConfig, groups: Vec<NetworkGroup>) -> Result<Self> {
        config.validate()?;
        random::seed(config.seed)?;

        let (classifier_net, classifier, cls_optimizer) = SemanticClassifier::define(&config)?;
        let networks = SemanticNetworks::new(&config, classifier_net)?;

        let optimizers = vec![
            BoundOptimizer::new(OptimizerId::G, NetworkId::Generator, config.lr, config.beta1, config.beta2),
            BoundOptimizer::new(OptimizerId::F, NetworkId::Feature, config.lr, config.beta1, config.beta2),
            BoundOptimizer::new(OptimizerId::D, NetworkId::Discriminator, config.lr, config.beta1, config.beta2),
            cls_optimizer,
        ];
        let orchestrator = TrainingOrchestrator::new(groups, optimizers, RoutineCatalog::standard())?;

        let names: Vec<LossName> = orchestrator
            .groups()
            .iter()
            .flat_map(|g| g.loss_names().iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let registry = LossRegistry::new(config.iter_size, &names);

        info!(
            template = %config.cls_template,
            task = ?config.task(),
            groups = orchestrator.groups().len(),
            iter_size = config.iter_size,
            generator_params = networks.num_parameters_of(NetworkId::Generator),
            classifier_params = networks.num_parameters_of(NetworkId::Classifier),
            "semantic CUT model created"
        );

        let ctx = StepContext::new(&config, classifier);
        Ok(Self {
            config,
            networks,
            orchestrator,
            ctx,
            registry,
            last_reports: Vec::new(),
            batch: None,
            niter: 0,
            initialized: false,
        })
    }

    /// Unpack a batch: check shapes, cast labels to the task's dtype, and
    /// drop the previous step's shared tensors.
    pub fn set_input(&mut self, batch: DomainBatch) -> Result<()> {
        let crop = self.config.crop_size;
        let real_a = batch.real_a.as_dtype(Dtype::Float32)?;
        let real_b = batch.real_b.as_dtype(Dtype::Float32)?;
        check_images("real_A", &real_a, crop, self.config.input_nc)?;
        check_images("real_B", &real_b, crop, self.config.output_nc)?;

        let task = self.config.task();
        let a_label = batch
            .a_label
            .map(|label| cast_label("A_label", &label, task, real_a.shape()[0]))
            .transpose()?;
        let b_label = match (batch.b_label, self.config.train_cls_b) {
            (Some(label), true) => Some(cast_label("B_label", &label, task, real_b.shape()[0])?),
            _ => None,
        };

        self.ctx.a_label = a_label;
        self.ctx.b_label = b_label;
        self.ctx.shared.clear();
        self.ctx.nce_keys = None;
        self.batch = Some(DomainBatch {
            real_a,
            real_b,
            a_label: None,
            b_label: None,
        });
        Ok(())
    }

    /// First-batch setup: one forward pass and one classifier-loss gradient
    /// computation to materialize every network, then clear all gradients.
    pub fn data_dependent_initialize(&mut self, batch: DomainBatch) -> Result<()> {
        self.set_input(batch)?;

        let per_device = {
            let current = self.batch.as_ref().ok_or(Error::MissingStepTensor("real_A"))?;
            current.real_a.shape()[0] / self.config.num_devices.max(1) as i32
        };
        if per_device == 0 {
            return Err(Error::config(format!(
                "batch too small for {} devices",
                self.config.num_devices
            )));
        }
        if let Some(current) = self.batch.as_mut() {
            current.real_a = current.real_a.index(..per_device);
            current.real_b = current.real_b.index(..per_device);
        }
        self.ctx.a_label = self.ctx.a_label.as_ref().map(|l| l.index(..per_device));
        self.ctx.b_label = self.ctx.b_label.as_ref().map(|l| l.index(..per_device));

        self.forward()?;

        let warmup = StepPlan {
            iteration: self.niter,
            apply_step: false,
            grad_scale: 1.0,
        };
        if let Some(index) = self
            .orchestrator
            .groups()
            .iter()
            .position(|g| g.runs_backward(BackwardRoutine::ClassifierLoss))
        {
            self.run_group_at(index, warmup, RunMode::Warmup)?;
        }
        self.orchestrator.zero_grad_all();
        self.initialized = true;

        info!(batch_per_device = per_device, "data-dependent initialization done");
        Ok(())
    }

    /// Translate the current batch outside any gradient computation
    pub fn forward(&mut self) -> Result<()> {
        let batch = self.batch.as_ref().ok_or(Error::MissingStepTensor("real_A"))?;
        let images = DomainImages {
            real_a: &batch.real_a,
            real_b: &batch.real_b,
        };
        self.ctx
            .forward(ForwardRoutine::Translate, &mut self.networks, images)?;
        self.ctx.shared.eval()
    }

    /// One training iteration over every group.
    ///
    /// With `iter_size > 1` gradients accumulate across calls and the
    /// optimizers step on every `iter_size`-th call; the loss registry
    /// restarts its averages on the call after each step.
    pub fn optimize_parameters(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let iter_size = self.config.iter_size;
        if self.niter % iter_size == 0 {
            self.registry.reset();
        }
        let plan = StepPlan {
            iteration: self.niter,
            apply_step: (self.niter + 1) % iter_size == 0,
            grad_scale: 1.0 / iter_size as f32,
        };

        let mut reports = Vec::with_capacity(self.orchestrator.groups().len());
        for index in 0..self.orchestrator.groups().len() {
            reports.push(self.run_group_at(index, plan, RunMode::Train)?);
        }
        self.last_reports = reports;
        self.niter += 1;
        Ok(())
    }

    /// Run a single group by name and step its optimizers immediately,
    /// outside the accumulation schedule. Rejected while any of the group's
    /// optimizers holds gradients of an unfinished accumulation window.
    pub fn optimize_group(&mut self, name: &str) -> Result<GroupReport> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let index = self
            .orchestrator
            .group_index(name)
            .ok_or_else(|| Error::config(format!("unknown network group `{name}`")))?;
        for &id in self.orchestrator.groups()[index].optimizers() {
            let pending = self
                .orchestrator
                .optimizer(id)
                .map_or(0, |optimizer| optimizer.pending_micro_batches());
            if pending > 0 {
                return Err(Error::config(format!(
                    "group `{name}` cannot step on its own: `{id}` holds {pending} accumulated micro-batch(es)"
                )));
            }
        }
        let plan = StepPlan {
            iteration: self.niter,
            apply_step: true,
            grad_scale: 1.0,
        };
        self.run_group_at(index, plan, RunMode::Train)
    }

    fn run_group_at(&mut self, index: usize, plan: StepPlan, mode: RunMode) -> Result<GroupReport> {
        let batch = self.batch.as_ref().ok_or(Error::MissingStepTensor("real_A"))?;
        let images = DomainImages {
            real_a: &batch.real_a,
            real_b: &batch.real_b,
        };
        let report = self
            .orchestrator
            .run_group(index, &mut self.networks, &mut self.ctx, images, plan)?;
        self.ctx.shared.eval()?;

        if mode == RunMode::Train {
            if let Some(cls) = report.get(LossName::Cls) {
                self.ctx.quality.observe(cls);
            }
            for &name in self.orchestrator.groups()[index].loss_names() {
                if let Some(value) = report.get(name) {
                    self.registry.record(name, value);
                }
            }
        }
        Ok(report)
    }

    /// Reported losses: bare names with `iter_size == 1`, `_avg` otherwise
    pub fn current_losses(&self) -> BTreeMap<String, f32> {
        self.registry.report()
    }

    pub fn registry(&self) -> &LossRegistry {
        &self.registry
    }

    /// Per-group reports of the last `optimize_parameters` call, in group order
    pub fn last_reports(&self) -> &[GroupReport] {
        &self.last_reports
    }

    pub fn classifier_quality(&self) -> ClassifierQuality {
        self.ctx.quality
    }

    pub fn gate_decision(&self) -> GateDecision {
        self.ctx.gate_decision
    }

    pub fn shared(&self) -> &SharedTensors {
        &self.ctx.shared
    }

    pub fn config(&self) -> &SemanticConfig {
        &self.config
    }

    pub fn networks(&self) -> &SemanticNetworks {
        &self.networks
    }

    pub fn groups(&self) -> &[NetworkGroup] {
        self.orchestrator.groups()
    }

    pub fn optimizer(&self, id: OptimizerId) -> Option<&BoundOptimizer> {
        self.orchestrator.optimizer(id)
    }

    /// Completed calls to `optimize_parameters`
    pub fn iteration(&self) -> usize {
        self.niter
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Save all four networks to one safetensors file
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        self.networks.save_safetensors(path)?;
        Ok(())
    }

    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::WeightFileNotFound {
                path: path.to_path_buf(),
            });
        }
        self.networks.load_safetensors(path)?;
        self.networks.eval_all()?;
        info!(path = %path.display(), "loaded model weights");
        Ok(())
    }
}

fn check_images(component: &'static str, images: &Array, crop: i32, channels: i32) -> Result<()> {
    let shape = images.shape();
    if shape.len() != 4 || shape[1] != crop || shape[2] != crop || shape[3] != channels {
        let batch = shape.first().copied().unwrap_or(0);
        return Err(Error::shape_mismatch(component, &[batch, crop, crop, channels], shape));
    }
    Ok(())
}

/// Cast a label to the task's dtype. Class ids must lie in `0..nclasses`.
fn cast_label(component: &'static str, label: &Array, task: SemanticTask, batch: i32) -> Result<Array> {
    let dtype = match task {
        SemanticTask::Classification { .. } => Dtype::Int32,
        SemanticTask::Regression { .. } => Dtype::Float32,
    };
    let label = label.as_dtype(dtype)?;
    if label.shape() != [batch].as_slice() {
        return Err(Error::shape_mismatch(component, &[batch], label.shape()));
    }
    if let SemanticTask::Classification { nclasses } = task {
        label.eval()?;
        if let Some(&class) = label
            .as_slice::<i32>()
            .iter()
            .find(|&&c| c < 0 || c >= nclasses)
        {
            return Err(Error::LabelOutOfRange {
                component,
                class,
                nclasses,
            });
        }
    }
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn batch(n: i32) -> DomainBatch {
        let a = random::normal::<f32>(&[n, 8, 8, 3], None, None, None).unwrap();
        let b = random::normal::<f32>(&[n, 8, 8, 3], None, None, None).unwrap();
        let labels: Vec<i32> = (0..n).map(|i| i % 3).collect();
        DomainBatch::new(a, b).with_a_label(Array::from_slice(&labels, &[n]))
    }

    #[test]
    fn test_optimize_before_initialize() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        model.set_input(batch(2)).unwrap();
        assert!(matches!(model.optimize_parameters(), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_set_input_rejects_wrong_crop() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        let a = random::normal::<f32>(&[2, 16, 16, 3], None, None, None).unwrap();
        let err = model.set_input(DomainBatch::new(a.clone(), a)).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { component: "real_A", .. }));
    }

    #[test]
    fn test_set_input_rejects_label_length() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        let input = batch(2).with_a_label(Array::from_slice(&[0i32, 1, 2], &[3]));
        let err = model.set_input(input).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { component: "A_label", .. }));
    }

    #[test]
    fn test_set_input_rejects_class_out_of_range() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        let input = batch(2).with_a_label(Array::from_slice(&[7i32, 0], &[2]));
        let err = model.set_input(input).unwrap_err();
        assert!(matches!(
            err,
            Error::LabelOutOfRange { component: "A_label", class: 7, nclasses: 3 }
        ));

        let input = batch(2).with_a_label(Array::from_slice(&[0i32, -1], &[2]));
        let err = model.set_input(input).unwrap_err();
        assert!(matches!(err, Error::LabelOutOfRange { class: -1, .. }));
    }

    #[test]
    fn test_b_label_range_checked_with_train_cls_b() {
        let config = tiny_config().with_train_cls_b(true);
        let mut model = CutSemanticModel::new(config).unwrap();
        let input = batch(2).with_b_label(Array::from_slice(&[1i32, 3], &[2]));
        let err = model.set_input(input).unwrap_err();
        assert!(matches!(err, Error::LabelOutOfRange { component: "B_label", class: 3, .. }));
    }

    #[test]
    fn test_labels_cast_for_regression() {
        let config = tiny_config().with_regression();
        let mut model = CutSemanticModel::new(config).unwrap();
        model.set_input(batch(2)).unwrap();
        assert_eq!(model.ctx.a_label.as_ref().unwrap().dtype(), Dtype::Float32);
    }

    #[test]
    fn test_b_label_dropped_without_train_cls_b() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        let input = batch(2).with_b_label(Array::from_slice(&[1i32, 1], &[2]));
        model.set_input(input).unwrap();
        assert!(model.ctx.b_label.is_none());
    }

    #[test]
    fn test_initialize_truncates_per_device() {
        let mut config = tiny_config();
        config.num_devices = 2;
        let mut model = CutSemanticModel::new(config).unwrap();
        model.data_dependent_initialize(batch(4)).unwrap();

        assert_eq!(model.batch.as_ref().unwrap().real_a.shape()[0], 2);
        assert_eq!(model.ctx.a_label.as_ref().unwrap().shape(), &[2]);
        assert_eq!(model.shared().fake_b.as_ref().unwrap().shape(), &[2, 8, 8, 3]);
        assert_eq!(model.classifier_quality(), ClassifierQuality::Unknown);
        for id in OptimizerId::ALL {
            assert_eq!(model.optimizer(id).unwrap().pending_micro_batches(), 0);
        }
    }

    #[test]
    fn test_missing_a_label_is_fatal() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        let a = random::normal::<f32>(&[2, 8, 8, 3], None, None, None).unwrap();
        let err = model
            .data_dependent_initialize(DomainBatch::new(a.clone(), a))
            .unwrap_err();
        assert!(matches!(err, Error::MissingLabel { domain: "A", .. }));
    }

    #[test]
    fn test_single_group_rejected_mid_window() {
        let config = tiny_config().with_iter_size(2);
        let mut model = CutSemanticModel::new(config).unwrap();
        model.data_dependent_initialize(batch(2)).unwrap();
        model.set_input(batch(2)).unwrap();
        model.optimize_parameters().unwrap();

        assert!(matches!(model.optimize_group("D"), Err(Error::Config(_))));
        assert_eq!(model.optimizer(OptimizerId::D).unwrap().pending_micro_batches(), 1);

        model.set_input(batch(2)).unwrap();
        model.optimize_parameters().unwrap();
        assert!(model.optimize_group("D").unwrap().stepped);
    }

    #[test]
    fn test_unknown_group_name() {
        let mut model = CutSemanticModel::new(tiny_config()).unwrap();
        model.data_dependent_initialize(batch(2)).unwrap();
        assert!(matches!(model.optimize_group("E"), Err(Error::Config(_))));
    }
}
