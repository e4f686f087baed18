//! Runs network groups one at a time: freeze, forward, loss, gradient,
//! optimizer step, report.

use std::collections::BTreeMap;

use mlx_rs::{error::Exception, nn, transforms::eval, Array};
use tracing::debug;

use crate::error::{Error, Result};
use crate::group::{validate_groups, BackwardRoutine, ForwardRoutine, NetworkGroup, RoutineCatalog};
use crate::losses::LossName;
use crate::networks::SemanticNetworks;
use crate::optim::{BoundOptimizer, OptimizerId};

/// The two domain batches of the current step
#[derive(Debug, Clone, Copy)]
pub struct DomainImages<'a> {
    pub real_a: &'a Array,
    pub real_b: &'a Array,
}

/// Output of one backward routine
#[derive(Debug, Clone)]
pub struct RoutineLosses {
    /// Scalar added into the group's back-propagated loss
    pub total: Array,
    pub losses: Vec<(LossName, Array)>,
}

/// Model-side implementation of the routines a group names.
///
/// `forward` and `backward` run inside the gradient trace, with only the
/// active group's networks unfrozen. `prepare` runs before the trace and is
/// the place for typed validation and for constant operands that must not
/// receive gradients.
pub trait GroupRoutines {
    fn prepare(
        &mut self,
        group: &NetworkGroup,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> Result<()>;

    fn forward(
        &mut self,
        routine: ForwardRoutine,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<(), Exception>;

    fn backward(
        &mut self,
        routine: BackwardRoutine,
        networks: &mut SemanticNetworks,
        images: DomainImages<'_>,
    ) -> std::result::Result<RoutineLosses, Exception>;
}

/// How a group run treats its gradients
#[derive(Debug, Clone, Copy)]
pub struct StepPlan {
    pub iteration: usize,
    /// Step the group's optimizers after accumulating
    pub apply_step: bool,
    /// Factor applied to gradients before accumulation
    pub grad_scale: f32,
}

#[derive(Debug, Clone)]
pub struct GroupReport {
    pub group: String,
    /// Value of the back-propagated loss
    pub backward_value: f32,
    /// Every loss the group's routines produced, evaluated
    pub losses: BTreeMap<LossName, f32>,
    pub stepped: bool,
}

impl GroupReport {
    pub fn get(&self, name: LossName) -> Option<f32> {
        self.losses.get(&name).copied()
    }
}

pub struct TrainingOrchestrator {
    groups: Vec<NetworkGroup>,
    optimizers: BTreeMap<OptimizerId, BoundOptimizer>,
}

impl TrainingOrchestrator {
    /// Validate `groups` against `catalog` plus the given optimizers.
    pub fn new(
        groups: Vec<NetworkGroup>,
        optimizers: Vec<BoundOptimizer>,
        catalog: RoutineCatalog,
    ) -> Result<Self> {
        let mut catalog = catalog;
        let mut owned = BTreeMap::new();
        for optimizer in optimizers {
            catalog = catalog.with_optimizer(optimizer.id(), optimizer.network());
            if owned.insert(optimizer.id(), optimizer).is_some() {
                return Err(Error::config("optimizer registered twice"));
            }
        }
        validate_groups(&groups, &catalog)?;
        Ok(Self {
            groups,
            optimizers: owned,
        })
    }

    pub fn groups(&self) -> &[NetworkGroup] {
        &self.groups
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name() == name)
    }

    pub fn optimizer(&self, id: OptimizerId) -> Option<&BoundOptimizer> {
        self.optimizers.get(&id)
    }

    /// Drop every accumulated gradient
    pub fn zero_grad_all(&mut self) {
        for optimizer in self.optimizers.values_mut() {
            optimizer.zero_grad();
        }
    }

    /// Run group `index` end to end.
    pub fn run_group<R: GroupRoutines>(
        &mut self,
        index: usize,
        networks: &mut SemanticNetworks,
        routines: &mut R,
        images: DomainImages<'_>,
        plan: StepPlan,
    ) -> Result<GroupReport> {
        let group = self
            .groups
            .get(index)
            .ok_or_else(|| Error::config(format!("no network group at index {index}")))?;

        // Only this group's networks stay trainable
        for &id in group.frozen() {
            networks.set_frozen(id, true);
        }
        for &id in group.to_optimize() {
            networks.set_frozen(id, false);
        }

        routines.prepare(group, networks, images)?;

        let mut recorded: Vec<(LossName, Array)> = Vec::new();
        let (total, grads) = {
            let loss_fn = |nets: &mut SemanticNetworks,
                           (real_a, real_b): (&Array, &Array)|
             -> std::result::Result<Array, Exception> {
                recorded.clear();
                let images = DomainImages { real_a, real_b };
                for &routine in group.forward_fns() {
                    routines.forward(routine, nets, images)?;
                }
                let mut total: Option<Array> = None;
                for &routine in group.backward_fns() {
                    let out = routines.backward(routine, nets, images)?;
                    total = Some(match total {
                        Some(sum) => sum.add(&out.total)?,
                        None => out.total,
                    });
                    recorded.extend(out.losses);
                }
                total.ok_or_else(|| Exception::custom("group has no backward routine"))
            };

            let mut value_and_grad = nn::value_and_grad(loss_fn);
            value_and_grad(networks, (images.real_a, images.real_b))?
        };

        eval(std::iter::once(&total).chain(recorded.iter().map(|(_, v)| v)))?;
        let backward_value = total.item::<f32>();
        if !backward_value.is_finite() {
            return Err(Error::Divergence {
                loss: group.loss_backward().as_str(),
                value: backward_value,
                iteration: plan.iteration,
            });
        }

        let mut losses = BTreeMap::new();
        for (name, value) in &recorded {
            let value = value.item::<f32>();
            if !value.is_finite() {
                return Err(Error::Divergence {
                    loss: name.as_str(),
                    value,
                    iteration: plan.iteration,
                });
            }
            losses.insert(*name, value);
        }

        for id in group.optimizers() {
            let optimizer = self
                .optimizers
                .get_mut(id)
                .ok_or_else(|| Error::config(format!("optimizer `{id}` is not registered")))?;
            optimizer.accumulate(&grads, plan.grad_scale)?;
            if plan.apply_step {
                optimizer.step(networks)?;
            }
        }

        debug!(
            group = group.name(),
            loss = group.loss_backward().as_str(),
            value = backward_value,
            stepped = plan.apply_step,
            "group done"
        );

        Ok(GroupReport {
            group: group.name().to_string(),
            backward_value,
            losses,
            stepped: plan.apply_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::lsgan_loss;
    use crate::config::SemanticConfig;
    use crate::networks::{ClassifierNet, NetworkId};
    use mlx_rs::{module::Module, random};

    /// Scores real_B with the discriminator under the classifier routine's name
    struct RealOnly;

    impl GroupRoutines for RealOnly {
        fn prepare(
            &mut self,
            _group: &NetworkGroup,
            _networks: &mut SemanticNetworks,
            _images: DomainImages<'_>,
        ) -> Result<()> {
            Ok(())
        }

        fn forward(
            &mut self,
            _routine: ForwardRoutine,
            _networks: &mut SemanticNetworks,
            _images: DomainImages<'_>,
        ) -> std::result::Result<(), Exception> {
            Ok(())
        }

        fn backward(
            &mut self,
            _routine: BackwardRoutine,
            networks: &mut SemanticNetworks,
            images: DomainImages<'_>,
        ) -> std::result::Result<RoutineLosses, Exception> {
            let pred = networks.discriminator.forward(images.real_b)?;
            let d = lsgan_loss(&pred, true)?;
            Ok(RoutineLosses {
                total: d.clone(),
                losses: vec![(LossName::Cls, d)],
            })
        }
    }

    fn setup() -> (TrainingOrchestrator, SemanticNetworks, Array) {
        let config = SemanticConfig::default().with_crop_size(16);
        let classifier = ClassifierNet::new(&config).unwrap();
        let networks = SemanticNetworks::new(&config, classifier).unwrap();
        let group = NetworkGroup::builder("D")
            .optimize(["netD"])
            .freeze(["netG", "netF", "netCLS"])
            .backward(["compute_CLS_loss"])
            .report(["CLS"])
            .optimizers(["optimizer_D"])
            .backward_loss("CLS")
            .build()
            .unwrap();
        let optimizer = BoundOptimizer::new(OptimizerId::D, NetworkId::Discriminator, 1e-2, 0.5, 0.999);
        let orchestrator =
            TrainingOrchestrator::new(vec![group], vec![optimizer], RoutineCatalog::standard()).unwrap();
        let images = random::normal::<f32>(&[2, 16, 16, 3], None, None, None).unwrap();
        (orchestrator, networks, images)
    }

    #[test]
    fn test_accumulate_then_step() {
        let (mut orchestrator, mut networks, images) = setup();
        let domains = DomainImages {
            real_a: &images,
            real_b: &images,
        };
        let before_d = networks.snapshot(NetworkId::Discriminator).unwrap();
        let before_g = networks.snapshot(NetworkId::Generator).unwrap();

        let plan = StepPlan {
            iteration: 0,
            apply_step: false,
            grad_scale: 0.5,
        };
        let report = orchestrator
            .run_group(0, &mut networks, &mut RealOnly, domains, plan)
            .unwrap();
        assert!(!report.stepped);
        assert!(report.get(LossName::Cls).unwrap() >= 0.0);
        assert_eq!(networks.snapshot(NetworkId::Discriminator).unwrap(), before_d);
        assert_eq!(
            orchestrator.optimizer(OptimizerId::D).unwrap().pending_micro_batches(),
            1
        );

        let plan = StepPlan {
            iteration: 1,
            apply_step: true,
            grad_scale: 0.5,
        };
        orchestrator
            .run_group(0, &mut networks, &mut RealOnly, domains, plan)
            .unwrap();
        assert_ne!(networks.snapshot(NetworkId::Discriminator).unwrap(), before_d);
        assert_eq!(networks.snapshot(NetworkId::Generator).unwrap(), before_g);
        assert_eq!(
            orchestrator.optimizer(OptimizerId::D).unwrap().pending_micro_batches(),
            0
        );
        assert!(networks.is_frozen(NetworkId::Generator));
        assert!(!networks.is_frozen(NetworkId::Discriminator));
    }

    #[test]
    fn test_duplicate_optimizer_rejected() {
        let groups = NetworkGroup::standard(true).unwrap();
        let optimizers = vec![
            BoundOptimizer::new(OptimizerId::D, NetworkId::Discriminator, 1e-3, 0.5, 0.999),
            BoundOptimizer::new(OptimizerId::D, NetworkId::Discriminator, 1e-3, 0.5, 0.999),
        ];
        assert!(matches!(
            TrainingOrchestrator::new(groups, optimizers, RoutineCatalog::standard()),
            Err(Error::Config(_))
        ));
    }
}
