//! CUT-Semantic on MLX
//!
//! Contrastive unpaired image translation (CUT) trained with a semantic
//! consistency classifier. The classifier is trained on labelled source
//! images and penalizes translations that change the predicted class.
//!
//! # Features
//!
//! - **Network groups**: each training step runs an ordered list of groups
//!   (generator, discriminator, classifier); each group updates only its own
//!   networks and back-propagates one named loss
//! - **Quality gate**: the semantic loss is zeroed while the classifier's
//!   own loss exceeds `semantic_threshold`
//! - **Gradient accumulation**: `iter_size` micro-batches per optimizer step,
//!   with averaged loss reporting
//! - **Classification or regression**: cross-entropy, L1 or squared error
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cut_semantic_mlx::{CutSemanticModel, SemanticConfig, SyntheticDomains};
//!
//! let config = SemanticConfig::default().with_semantic_nclasses(4);
//! let mut data = SyntheticDomains::new(&config, 4);
//! let mut model = CutSemanticModel::new(config)?;
//!
//! model.data_dependent_initialize(data.next_batch())?;
//! for batch in data.take(10) {
//!     model.set_input(batch)?;
//!     model.optimize_parameters()?;
//! }
//! println!("{:?}", model.current_losses());
//! # Ok::<(), cut_semantic_mlx::Error>(())
//! ```

pub mod base;
pub mod classifier;
pub mod config;
pub mod data;
pub mod error;
pub mod gate;
pub mod group;
pub mod losses;
pub mod model;
pub mod networks;
pub mod optim;
pub mod orchestrator;
pub mod trainer;

// Re-export main types
pub use classifier::{SemanticClassifier, SemanticCriterion};
pub use config::{ClassifierTemplate, SemanticConfig, SemanticTask};
pub use data::SyntheticDomains;
pub use error::{Error, Result};
pub use gate::{ClassifierQuality, GateDecision, SemanticGate};
pub use group::{NetworkGroup, RoutineCatalog};
pub use losses::{LossName, LossRegistry};
pub use model::{CutSemanticModel, DomainBatch};
pub use networks::NetworkId;
pub use optim::OptimizerId;
pub use orchestrator::GroupReport;
pub use trainer::{SemanticTrainer, TrainerConfig, TrainingState};
