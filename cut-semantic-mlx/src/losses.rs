//! Named scalar losses and their reporting registry.
//!
//! With `iter_size == 1` every recorded value replaces the previous one and
//! is reported under its bare name. With `iter_size > 1` values are averaged
//! over the micro-batches of one logical iteration and reported with an
//! `_avg` suffix.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Every loss the model can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LossName {
    /// Adversarial term of the generator loss
    GGan,
    /// PatchNCE between real_A and fake_B
    Nce,
    /// PatchNCE identity term between real_B and idt_B
    NceY,
    /// Total generator loss, semantic term included
    G,
    /// Semantic consistency loss on fake_B (possibly gated to zero)
    Sem,
    DReal,
    DFake,
    /// Total discriminator loss
    D,
    /// Classifier loss on the real domains
    Cls,
}

impl LossName {
    pub const ALL: [LossName; 9] = [
        LossName::GGan,
        LossName::Nce,
        LossName::NceY,
        LossName::G,
        LossName::Sem,
        LossName::DReal,
        LossName::DFake,
        LossName::D,
        LossName::Cls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LossName::GGan => "G_GAN",
            LossName::Nce => "NCE",
            LossName::NceY => "NCE_Y",
            LossName::G => "G",
            LossName::Sem => "sem",
            LossName::DReal => "D_real",
            LossName::DFake => "D_fake",
            LossName::D => "D",
            LossName::Cls => "CLS",
        }
    }
}

impl fmt::Display for LossName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LossName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| Error::config(format!("unknown loss `{s}`")))
    }
}

/// How recorded values turn into reported values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    Instant,
    Averaged,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    latest: f32,
    sum: f32,
    count: usize,
}

/// Loss name to value map, created once per model
#[derive(Debug, Clone)]
pub struct LossRegistry {
    mode: ReportMode,
    slots: BTreeMap<LossName, Slot>,
}

impl LossRegistry {
    /// Registry for `names`. Averaged mode (`iter_size > 1`) pre-registers
    /// every name with `0.0` so reports are complete before the first step.
    pub fn new(iter_size: usize, names: &[LossName]) -> Self {
        let mode = if iter_size > 1 {
            ReportMode::Averaged
        } else {
            ReportMode::Instant
        };
        let slots = match mode {
            ReportMode::Averaged => names.iter().map(|&n| (n, Slot::default())).collect(),
            ReportMode::Instant => BTreeMap::new(),
        };
        Self { mode, slots }
    }

    pub fn mode(&self) -> ReportMode {
        self.mode
    }

    /// Start a new logical iteration. Running sums restart; the latest
    /// values stay readable until overwritten.
    pub fn reset(&mut self) {
        for slot in self.slots.values_mut() {
            slot.sum = 0.0;
            slot.count = 0;
        }
    }

    pub fn record(&mut self, name: LossName, value: f32) {
        let slot = self.slots.entry(name).or_default();
        slot.latest = value;
        slot.sum += value;
        slot.count += 1;
    }

    /// Latest recorded value
    pub fn value(&self, name: LossName) -> Option<f32> {
        self.slots.get(&name).map(|slot| slot.latest)
    }

    /// Mean of the values recorded since the last reset
    pub fn average(&self, name: LossName) -> Option<f32> {
        let slot = self.slots.get(&name)?;
        if slot.count == 0 {
            return match self.mode {
                ReportMode::Averaged => Some(0.0),
                ReportMode::Instant => None,
            };
        }
        Some(slot.sum / slot.count as f32)
    }

    /// Reported value for `name` under the key it is exposed with
    pub fn reported(&self, name: LossName) -> Option<(String, f32)> {
        match self.mode {
            ReportMode::Instant => self.value(name).map(|v| (name.to_string(), v)),
            ReportMode::Averaged => self
                .average(name)
                .map(|v| (format!("{}_avg", name.as_str()), v)),
        }
    }

    /// Snapshot of every reported loss
    pub fn report(&self) -> BTreeMap<String, f32> {
        self.slots
            .keys()
            .filter_map(|&name| self.reported(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_reports_latest() {
        let mut registry = LossRegistry::new(1, &LossName::ALL);
        assert!(registry.report().is_empty());

        registry.record(LossName::Cls, 0.9);
        registry.record(LossName::Cls, 0.4);

        assert_eq!(registry.mode(), ReportMode::Instant);
        assert_eq!(registry.report().get("CLS"), Some(&0.4));
        assert_eq!(registry.value(LossName::Sem), None);
    }

    #[test]
    fn test_averaged_preregisters_names() {
        let registry = LossRegistry::new(3, &LossName::ALL);
        let report = registry.report();

        assert_eq!(report.len(), LossName::ALL.len());
        assert_eq!(report.get("sem_avg"), Some(&0.0));
        assert_eq!(report.get("D_real_avg"), Some(&0.0));
        assert!(!report.contains_key("sem"));
    }

    #[test]
    fn test_averaged_mean_and_reset() {
        let mut registry = LossRegistry::new(3, &LossName::ALL);
        for v in [1.0, 2.0, 6.0] {
            registry.record(LossName::G, v);
        }
        assert_eq!(registry.report().get("G_avg"), Some(&3.0));

        registry.reset();
        registry.record(LossName::G, 5.0);
        assert_eq!(registry.average(LossName::G), Some(5.0));
        assert_eq!(registry.value(LossName::G), Some(5.0));
    }

    #[test]
    fn test_loss_names_are_distinct() {
        let mut names: Vec<_> = LossName::ALL.iter().map(|n| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), LossName::ALL.len());
    }
}
