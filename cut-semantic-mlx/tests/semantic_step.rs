//! End-to-end training steps on tiny configurations

use cut_semantic_mlx::{
    ClassifierQuality, CutSemanticModel, DomainBatch, Error, GateDecision, LossName,
    NetworkGroup, NetworkId, OptimizerId, SemanticConfig, SyntheticDomains,
};
use mlx_rs::{random, Array};

fn tiny_config() -> SemanticConfig {
    let mut config = SemanticConfig::default()
        .with_crop_size(8)
        .with_semantic_nclasses(3)
        .with_seed(7);
    config.ngf = 4;
    config.ndf = 4;
    config.n_blocks = 1;
    config.netf_nc = 8;
    config.num_patches = 8;
    config
}

fn ready_model(config: SemanticConfig, batch_size: usize) -> (CutSemanticModel, SyntheticDomains) {
    let mut data = SyntheticDomains::new(&config, batch_size);
    let mut model = CutSemanticModel::new(config).unwrap();
    model.data_dependent_initialize(data.next_batch()).unwrap();
    (model, data)
}

#[test]
fn test_full_step_reports_every_loss() {
    let (mut model, mut data) = ready_model(tiny_config(), 4);
    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();

    let losses = model.current_losses();
    let cls = losses["CLS"];
    let sem = losses["sem"];
    assert!(cls.is_finite() && cls >= 0.0);
    assert!(sem.is_finite() && sem > 0.0);
    for name in ["D_real", "D_fake", "D", "G_GAN", "NCE", "NCE_Y", "G"] {
        assert!(losses[name].is_finite(), "{name} not finite");
    }
    assert_eq!(model.iteration(), 1);
    assert!(matches!(model.classifier_quality(), ClassifierQuality::Observed(_)));
}

#[test]
fn test_groups_update_only_their_networks() {
    let (mut model, _) = ready_model(tiny_config(), 2);

    for (group, changed) in [
        ("D", vec![NetworkId::Discriminator]),
        ("CLS", vec![NetworkId::Classifier]),
        ("G", vec![NetworkId::Generator, NetworkId::Feature]),
    ] {
        let before: Vec<_> = NetworkId::ALL
            .iter()
            .map(|&id| model.networks().snapshot(id).unwrap())
            .collect();
        let report = model.optimize_group(group).unwrap();
        assert!(report.stepped);
        assert!(report.backward_value.is_finite());

        for (id, before) in NetworkId::ALL.iter().zip(before) {
            let after = model.networks().snapshot(*id).unwrap();
            if changed.contains(id) {
                assert_ne!(after, before, "group {group} left {id} unchanged");
            } else {
                assert_eq!(after, before, "group {group} modified {id}");
            }
        }
    }
}

#[test]
fn test_accumulation_steps_on_boundary() {
    let config = tiny_config().with_iter_size(2);
    let (mut model, mut data) = ready_model(config, 2);

    let before = model.networks().snapshot(NetworkId::Discriminator).unwrap();
    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();

    assert_eq!(model.networks().snapshot(NetworkId::Discriminator).unwrap(), before);
    assert_eq!(model.optimizer(OptimizerId::D).unwrap().pending_micro_batches(), 1);
    let losses = model.current_losses();
    assert!(losses.contains_key("CLS_avg"));
    assert!(losses.contains_key("sem_avg"));
    assert!(!losses.contains_key("CLS"));

    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    assert_ne!(model.networks().snapshot(NetworkId::Discriminator).unwrap(), before);
    for id in OptimizerId::ALL {
        assert_eq!(model.optimizer(id).unwrap().pending_micro_batches(), 0);
    }
}

/// Classifier loss the CLS group produced in the last step
fn step_cls(model: &CutSemanticModel) -> f32 {
    model
        .last_reports()
        .iter()
        .find_map(|report| report.get(LossName::Cls))
        .unwrap()
}

#[test]
fn test_averages_follow_the_step_window() {
    let config = tiny_config().with_iter_size(2);
    let (mut model, mut data) = ready_model(config, 2);

    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    let first = step_cls(&model);
    assert!((model.current_losses()["CLS_avg"] - first).abs() < 1e-6);

    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    let second = step_cls(&model);
    let window_mean = (first + second) / 2.0;
    assert!((model.current_losses()["CLS_avg"] - window_mean).abs() < 1e-6);
    assert_eq!(model.optimizer(OptimizerId::Cls).unwrap().pending_micro_batches(), 0);

    // A new window reports only its own value
    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    let third = step_cls(&model);
    assert!((model.current_losses()["CLS_avg"] - third).abs() < 1e-6);
    assert_eq!(model.optimizer(OptimizerId::Cls).unwrap().pending_micro_batches(), 1);
}

#[test]
fn test_gate_closes_after_classifier_observed() {
    // Any classifier loss exceeds a negative threshold
    let config = tiny_config().with_semantic_threshold(-1.0);
    let (mut model, mut data) = ready_model(config, 2);

    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    assert!(model.gate_decision().is_open());
    assert!(model.current_losses()["sem"] > 0.0);

    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();
    assert!(matches!(model.gate_decision(), GateDecision::Closed { .. }));
    assert_eq!(model.current_losses()["sem"], 0.0);
}

#[test]
fn test_regression_step() {
    let config = tiny_config().with_l1_regression();
    let (mut model, mut data) = ready_model(config, 2);
    model.set_input(data.next_batch()).unwrap();
    model.optimize_parameters().unwrap();

    let losses = model.current_losses();
    assert!(losses["CLS"].is_finite() && losses["CLS"] >= 0.0);
    assert!(losses["sem"].is_finite());
    assert_eq!(model.shared().gt_pred_a.as_ref().unwrap().shape(), &[2]);
}

#[test]
fn test_train_cls_b_requires_b_label() {
    let config = tiny_config().with_train_cls_b(true);
    let mut model = CutSemanticModel::new(config).unwrap();
    let images = random::normal::<f32>(&[2, 8, 8, 3], None, None, None).unwrap();
    let batch = DomainBatch::new(images.clone(), images)
        .with_a_label(Array::from_slice(&[0i32, 1], &[2]));

    let err = model.data_dependent_initialize(batch).unwrap_err();
    assert!(matches!(err, Error::MissingLabel { domain: "B", .. }));
}

#[test]
fn test_group_list_must_cover_every_network() {
    let groups = vec![NetworkGroup::builder("D")
        .optimize(["netD"])
        .freeze(["netG", "netF"])
        .backward(["compute_D_loss"])
        .report(["D"])
        .optimizers(["optimizer_D"])
        .backward_loss("D")
        .build()
        .unwrap()];
    assert!(matches!(
        CutSemanticModel::with_groups(tiny_config(), groups),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_invalid_configs_rejected() {
    let pretrained_basic = tiny_config().with_pretrained_classifier("cls.safetensors");
    assert!(matches!(
        CutSemanticModel::new(pretrained_basic),
        Err(Error::Config(_))
    ));

    let missing_weights = tiny_config()
        .with_cls_template("residual")
        .with_pretrained_classifier("/nonexistent/cls.safetensors");
    assert!(matches!(
        CutSemanticModel::new(missing_weights),
        Err(Error::WeightFileNotFound { .. })
    ));

    let mut l1_without_regression = tiny_config();
    l1_without_regression.l1_regression = true;
    assert!(matches!(
        CutSemanticModel::new(l1_without_regression),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_weights_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");

    let (mut trained, mut data) = ready_model(tiny_config(), 2);
    trained.set_input(data.next_batch()).unwrap();
    trained.optimize_parameters().unwrap();
    trained.save_weights(&path).unwrap();

    let mut fresh = CutSemanticModel::new(tiny_config().with_seed(99)).unwrap();
    fresh.load_weights(&path).unwrap();
    for id in NetworkId::ALL {
        assert_eq!(
            fresh.networks().snapshot(id).unwrap(),
            trained.networks().snapshot(id).unwrap()
        );
    }
}
