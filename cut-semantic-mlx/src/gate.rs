//! Semantic consistency gate.
//!
//! The generator's semantic loss is only trusted once the classifier is
//! good enough. The classifier loss observed on the last classifier update
//! is kept in a [`ClassifierQuality`] slot; while it is above the threshold
//! the semantic loss is multiplied by zero.

use mlx_rs::{array, error::Exception, Array};

/// Last observed classifier loss
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ClassifierQuality {
    /// No classifier update has been observed yet
    #[default]
    Unknown,
    Observed(f32),
}

impl ClassifierQuality {
    pub fn observe(&mut self, loss: f32) {
        *self = ClassifierQuality::Observed(loss);
    }

    pub fn value(&self) -> Option<f32> {
        match self {
            ClassifierQuality::Unknown => None,
            ClassifierQuality::Observed(v) => Some(*v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Open,
    /// Classifier loss `quality` exceeded the threshold
    Closed { quality: f32 },
}

impl GateDecision {
    pub fn is_open(&self) -> bool {
        matches!(self, GateDecision::Open)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SemanticGate {
    pub threshold: f32,
}

impl SemanticGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Closed iff a quality was observed and it is strictly above the threshold.
    pub fn decide(&self, quality: ClassifierQuality) -> GateDecision {
        match quality {
            ClassifierQuality::Observed(v) if v > self.threshold => {
                GateDecision::Closed { quality: v }
            }
            _ => GateDecision::Open,
        }
    }

    /// The loss is still part of the graph when closed, scaled by zero.
    pub fn apply(&self, loss: &Array, decision: GateDecision) -> Result<Array, Exception> {
        match decision {
            GateDecision::Open => Ok(loss.clone()),
            GateDecision::Closed { .. } => loss.multiply(array!(0.0f32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_quality_is_open() {
        let gate = SemanticGate::new(-1.0);
        assert_eq!(gate.decide(ClassifierQuality::Unknown), GateDecision::Open);

        let loss = array!(2.5f32);
        let gated = gate.apply(&loss, gate.decide(ClassifierQuality::Unknown)).unwrap();
        assert_eq!(gated.item::<f32>(), 2.5);
    }

    #[test]
    fn test_closed_above_threshold() {
        let gate = SemanticGate::new(0.5);
        let decision = gate.decide(ClassifierQuality::Observed(0.7));
        assert_eq!(decision, GateDecision::Closed { quality: 0.7 });

        let gated = gate.apply(&array!(3.0f32), decision).unwrap();
        assert_eq!(gated.item::<f32>(), 0.0);
    }

    #[test]
    fn test_open_at_or_below_threshold() {
        let gate = SemanticGate::new(0.5);
        let loss = array!(1.25f32);
        for quality in [0.5, 0.1] {
            let decision = gate.decide(ClassifierQuality::Observed(quality));
            assert!(decision.is_open());
            assert_eq!(gate.apply(&loss, decision).unwrap().item::<f32>(), 1.25);
        }
    }

    #[test]
    fn test_observe_replaces_value() {
        let mut quality = ClassifierQuality::default();
        assert_eq!(quality.value(), None);
        quality.observe(0.3);
        quality.observe(0.2);
        assert_eq!(quality.value(), Some(0.2));
    }
}
