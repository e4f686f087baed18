//! Network groups: declarative descriptions of one optimization phase.
//!
//! Groups are written with the string names used in training logs
//! (`netG`, `compute_G_loss`, `optimizer_G`, ...), resolved into typed
//! handles by [`NetworkGroupBuilder::build`], and checked as a whole by
//! [`validate_groups`] before training starts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::losses::LossName;
use crate::networks::NetworkId;
use crate::optim::OptimizerId;

/// Tensors produced by forward routines and shared with later routines of
/// the same step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepTensor {
    FakeB,
    IdtB,
    PredRealA,
    PredFakeB,
}

impl StepTensor {
    pub fn name(&self) -> &'static str {
        match self {
            StepTensor::FakeB => "fake_B",
            StepTensor::IdtB => "idt_B",
            StepTensor::PredRealA => "pred_real_A",
            StepTensor::PredFakeB => "pred_fake_B",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForwardRoutine {
    /// G(real_A), G(real_B) and the classifier's predictions on real_A and fake_B
    Translate,
}

impl ForwardRoutine {
    pub const ALL: [ForwardRoutine; 1] = [ForwardRoutine::Translate];

    pub fn name(&self) -> &'static str {
        match self {
            ForwardRoutine::Translate => "forward",
        }
    }

    pub fn produces(&self) -> &'static [StepTensor] {
        match self {
            ForwardRoutine::Translate => &[
                StepTensor::FakeB,
                StepTensor::IdtB,
                StepTensor::PredRealA,
                StepTensor::PredFakeB,
            ],
        }
    }
}

impl FromStr for ForwardRoutine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ForwardRoutine::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| Error::config(format!("unknown forward routine `{s}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackwardRoutine {
    GeneratorLoss,
    DiscriminatorLoss,
    ClassifierLoss,
}

impl BackwardRoutine {
    pub const ALL: [BackwardRoutine; 3] = [
        BackwardRoutine::GeneratorLoss,
        BackwardRoutine::DiscriminatorLoss,
        BackwardRoutine::ClassifierLoss,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackwardRoutine::GeneratorLoss => "compute_G_loss",
            BackwardRoutine::DiscriminatorLoss => "compute_D_loss",
            BackwardRoutine::ClassifierLoss => "compute_CLS_loss",
        }
    }

    /// Named losses this routine reports, its total last
    pub fn produces(&self) -> &'static [LossName] {
        match self {
            BackwardRoutine::GeneratorLoss => &[
                LossName::GGan,
                LossName::Nce,
                LossName::NceY,
                LossName::Sem,
                LossName::G,
            ],
            BackwardRoutine::DiscriminatorLoss => &[LossName::DFake, LossName::DReal, LossName::D],
            BackwardRoutine::ClassifierLoss => &[LossName::Cls],
        }
    }

    /// Step tensors that must exist before this routine runs
    pub fn requires(&self) -> &'static [StepTensor] {
        match self {
            BackwardRoutine::GeneratorLoss => &[StepTensor::FakeB, StepTensor::PredFakeB],
            BackwardRoutine::DiscriminatorLoss => &[StepTensor::FakeB],
            BackwardRoutine::ClassifierLoss => &[],
        }
    }
}

impl FromStr for BackwardRoutine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackwardRoutine::ALL
            .into_iter()
            .find(|r| r.name() == s)
            .ok_or_else(|| Error::config(format!("unknown backward routine `{s}`")))
    }
}

/// What a model has registered: networks, routines and optimizer bindings.
#[derive(Debug, Clone, Default)]
pub struct RoutineCatalog {
    networks: BTreeSet<NetworkId>,
    forwards: BTreeSet<ForwardRoutine>,
    backwards: BTreeSet<BackwardRoutine>,
    optimizers: BTreeMap<OptimizerId, NetworkId>,
}

impl RoutineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every network and routine of the semantic CUT model. Optimizers are
    /// registered by the orchestrator from the optimizers it owns.
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        for id in NetworkId::ALL {
            catalog = catalog.with_network(id);
        }
        for routine in ForwardRoutine::ALL {
            catalog = catalog.with_forward(routine);
        }
        for routine in BackwardRoutine::ALL {
            catalog = catalog.with_backward(routine);
        }
        catalog
    }

    pub fn with_network(mut self, id: NetworkId) -> Self {
        self.networks.insert(id);
        self
    }

    pub fn with_forward(mut self, routine: ForwardRoutine) -> Self {
        self.forwards.insert(routine);
        self
    }

    pub fn with_backward(mut self, routine: BackwardRoutine) -> Self {
        self.backwards.insert(routine);
        self
    }

    pub fn with_optimizer(mut self, id: OptimizerId, network: NetworkId) -> Self {
        self.optimizers.insert(id, network);
        self
    }

    pub fn networks(&self) -> &BTreeSet<NetworkId> {
        &self.networks
    }

    pub fn optimizer_network(&self, id: OptimizerId) -> Option<NetworkId> {
        self.optimizers.get(&id).copied()
    }
}

/// One optimization phase. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGroup {
    name: String,
    to_optimize: Vec<NetworkId>,
    frozen: Vec<NetworkId>,
    forward_fns: Vec<ForwardRoutine>,
    backward_fns: Vec<BackwardRoutine>,
    loss_names: Vec<LossName>,
    optimizers: Vec<OptimizerId>,
    loss_backward: LossName,
}

impl NetworkGroup {
    pub fn builder(name: impl Into<String>) -> NetworkGroupBuilder {
        NetworkGroupBuilder::new(name)
    }

    /// Generator, discriminator and classifier groups, in that order.
    pub fn standard(nce_idt: bool) -> Result<Vec<NetworkGroup>> {
        let mut g_losses = vec!["G_GAN", "G", "NCE"];
        if nce_idt {
            g_losses.push("NCE_Y");
        }
        g_losses.push("sem");

        let group_g = NetworkGroup::builder("G")
            .optimize(["netG", "netF"])
            .freeze(["netD", "netCLS"])
            .forward(["forward"])
            .backward(["compute_G_loss"])
            .report(g_losses)
            .optimizers(["optimizer_G", "optimizer_F"])
            .backward_loss("G")
            .build()?;

        let group_d = NetworkGroup::builder("D")
            .optimize(["netD"])
            .freeze(["netG", "netF", "netCLS"])
            .backward(["compute_D_loss"])
            .report(["D_real", "D_fake", "D"])
            .optimizers(["optimizer_D"])
            .backward_loss("D")
            .build()?;

        let group_cls = NetworkGroup::builder("CLS")
            .optimize(["netCLS"])
            .freeze(["netD", "netG", "netF"])
            .backward(["compute_CLS_loss"])
            .report(["CLS"])
            .optimizers(["optimizer_CLS"])
            .backward_loss("CLS")
            .build()?;

        Ok(vec![group_g, group_d, group_cls])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn to_optimize(&self) -> &[NetworkId] {
        &self.to_optimize
    }

    pub fn frozen(&self) -> &[NetworkId] {
        &self.frozen
    }

    pub fn forward_fns(&self) -> &[ForwardRoutine] {
        &self.forward_fns
    }

    pub fn backward_fns(&self) -> &[BackwardRoutine] {
        &self.backward_fns
    }

    pub fn loss_names(&self) -> &[LossName] {
        &self.loss_names
    }

    pub fn optimizers(&self) -> &[OptimizerId] {
        &self.optimizers
    }

    pub fn loss_backward(&self) -> LossName {
        self.loss_backward
    }

    pub fn runs_backward(&self, routine: BackwardRoutine) -> bool {
        self.backward_fns.contains(&routine)
    }

    /// Step tensors this group's forward routines produce
    pub fn produced_tensors(&self) -> BTreeSet<StepTensor> {
        self.forward_fns
            .iter()
            .flat_map(|r| r.produces().iter().copied())
            .collect()
    }
}

impl fmt::Display for NetworkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group `{}`", self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkGroupBuilder {
    name: String,
    optimize: Vec<String>,
    freeze: Vec<String>,
    forward: Vec<String>,
    backward: Vec<String>,
    report: Vec<String>,
    optimizers: Vec<String>,
    loss_backward: Option<String>,
}

fn owned<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

fn resolve<T: FromStr<Err = Error> + PartialEq>(group: &str, field: &str, names: &[String]) -> Result<Vec<T>> {
    let mut resolved: Vec<T> = Vec::with_capacity(names.len());
    for name in names {
        let value: T = name.parse()?;
        if resolved.contains(&value) {
            return Err(Error::config(format!(
                "group `{group}` lists `{name}` twice in {field}"
            )));
        }
        resolved.push(value);
    }
    Ok(resolved)
}

impl NetworkGroupBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn optimize<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optimize = owned(networks);
        self
    }

    pub fn freeze<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.freeze = owned(networks);
        self
    }

    pub fn forward<I, S>(mut self, routines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forward = owned(routines);
        self
    }

    pub fn backward<I, S>(mut self, routines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backward = owned(routines);
        self
    }

    pub fn report<I, S>(mut self, losses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.report = owned(losses);
        self
    }

    pub fn optimizers<I, S>(mut self, optimizers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optimizers = owned(optimizers);
        self
    }

    pub fn backward_loss(mut self, loss: impl Into<String>) -> Self {
        self.loss_backward = Some(loss.into());
        self
    }

    /// Resolve names and check the group on its own.
    pub fn build(self) -> Result<NetworkGroup> {
        let name = self.name;
        let to_optimize: Vec<NetworkId> = resolve(&name, "to_optimize", &self.optimize)?;
        let frozen: Vec<NetworkId> = resolve(&name, "frozen", &self.freeze)?;
        let forward_fns: Vec<ForwardRoutine> = resolve(&name, "forward_fns", &self.forward)?;
        let backward_fns: Vec<BackwardRoutine> = resolve(&name, "backward_fns", &self.backward)?;
        let loss_names: Vec<LossName> = resolve(&name, "loss_names", &self.report)?;
        let optimizers: Vec<OptimizerId> = resolve(&name, "optimizers", &self.optimizers)?;
        let loss_backward: LossName = self
            .loss_backward
            .ok_or_else(|| Error::config(format!("group `{name}` has no loss_backward")))?
            .parse()?;

        if to_optimize.is_empty() {
            return Err(Error::config(format!("group `{name}` optimizes no network")));
        }
        if let Some(both) = to_optimize.iter().find(|id| frozen.contains(*id)) {
            return Err(Error::config(format!(
                "group `{name}` both optimizes and freezes `{both}`"
            )));
        }
        if backward_fns.is_empty() {
            return Err(Error::config(format!("group `{name}` has no backward routine")));
        }
        if optimizers.is_empty() {
            return Err(Error::config(format!("group `{name}` steps no optimizer")));
        }

        let produced: BTreeSet<LossName> = backward_fns
            .iter()
            .flat_map(|r| r.produces().iter().copied())
            .collect();
        if !produced.contains(&loss_backward) {
            return Err(Error::config(format!(
                "group `{name}` back-propagates `{loss_backward}` which none of its backward routines produce"
            )));
        }
        if let Some(missing) = loss_names.iter().find(|n| !produced.contains(*n)) {
            return Err(Error::config(format!(
                "group `{name}` reports `{missing}` which none of its backward routines produce"
            )));
        }

        Ok(NetworkGroup {
            name,
            to_optimize,
            frozen,
            forward_fns,
            backward_fns,
            loss_names,
            optimizers,
            loss_backward,
        })
    }
}

/// Check an ordered group list against a catalog.
pub fn validate_groups(groups: &[NetworkGroup], catalog: &RoutineCatalog) -> Result<()> {
    if groups.is_empty() {
        return Err(Error::config("no network groups defined"));
    }

    let mut names = BTreeSet::new();
    let mut available: BTreeSet<StepTensor> = BTreeSet::new();

    for group in groups {
        if !names.insert(group.name()) {
            return Err(Error::config(format!("duplicate group name `{}`", group.name())));
        }

        for id in group.to_optimize().iter().chain(group.frozen()) {
            if !catalog.networks.contains(id) {
                return Err(Error::config(format!("{group} references unregistered network `{id}`")));
            }
        }
        let covered: BTreeSet<NetworkId> = group
            .to_optimize()
            .iter()
            .chain(group.frozen())
            .copied()
            .collect();
        if let Some(uncovered) = catalog.networks.iter().find(|id| !covered.contains(*id)) {
            return Err(Error::config(format!(
                "{group} neither optimizes nor freezes `{uncovered}`"
            )));
        }

        for routine in group.forward_fns() {
            if !catalog.forwards.contains(routine) {
                return Err(Error::config(format!(
                    "{group} references unregistered forward routine `{}`",
                    routine.name()
                )));
            }
        }
        for routine in group.backward_fns() {
            if !catalog.backwards.contains(routine) {
                return Err(Error::config(format!(
                    "{group} references unregistered backward routine `{}`",
                    routine.name()
                )));
            }
        }

        let mut stepped = BTreeSet::new();
        for &id in group.optimizers() {
            let network = catalog.optimizer_network(id).ok_or_else(|| {
                Error::config(format!("{group} references unregistered optimizer `{id}`"))
            })?;
            if !group.to_optimize().contains(&network) {
                return Err(Error::config(format!(
                    "{group} steps `{id}` but does not optimize its network `{network}`"
                )));
            }
            stepped.insert(network);
        }
        if let Some(idle) = group.to_optimize().iter().find(|id| !stepped.contains(*id)) {
            return Err(Error::config(format!(
                "{group} optimizes `{idle}` but steps no optimizer bound to it"
            )));
        }

        available.extend(group.produced_tensors());
        for routine in group.backward_fns() {
            if let Some(missing) = routine.requires().iter().find(|t| !available.contains(*t)) {
                return Err(Error::config(format!(
                    "{group}: `{}` needs `{}` but no forward routine up to this group produces it",
                    routine.name(),
                    missing.name()
                )));
            }
        }
    }
    Ok(())
}
