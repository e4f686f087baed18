//! Error types for cut-semantic-mlx.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // =================== MLX Errors ===================
    /// MLX framework exception (computation errors, shape mismatches inside a trace, etc.)
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// Safetensors load/save error
    #[error("weights error: {0}")]
    Weights(#[from] mlx_rs::error::IoError),

    // =================== IO Errors ===================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Weight file not found: {path}")]
    WeightFileNotFound { path: PathBuf },

    // =================== Setup Errors ===================
    /// Invalid option combination or malformed network group
    #[error("Configuration error: {0}")]
    Config(String),

    /// `optimize_parameters` called before `data_dependent_initialize`
    #[error("model not initialized: call data_dependent_initialize first")]
    NotInitialized,

    // =================== Step Errors ===================
    #[error("Missing domain {domain} label (required by {required_by})")]
    MissingLabel {
        domain: &'static str,
        required_by: &'static str,
    },

    #[error("Shape mismatch in {component}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        component: &'static str,
        expected: Vec<i32>,
        actual: Vec<i32>,
    },

    #[error("Class id {class} in {component} is outside 0..{nclasses}")]
    LabelOutOfRange {
        component: &'static str,
        class: i32,
        nclasses: i32,
    },

    #[error("Step tensor `{0}` read before a forward routine produced it")]
    MissingStepTensor(&'static str),

    #[error("Training diverged: loss {loss} is {value} at iteration {iteration}")]
    Divergence {
        loss: &'static str,
        value: f32,
        iteration: usize,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn shape_mismatch(component: &'static str, expected: &[i32], actual: &[i32]) -> Self {
        Self::ShapeMismatch {
            component,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
