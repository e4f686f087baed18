//! Synthetic labelled two-domain image source

use mlx_rs::Array;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::{SemanticConfig, SemanticTask};
use crate::model::DomainBatch;

/// Generates unpaired batches whose class is visible in the image.
///
/// Class `c` draws stripes with period `c + 2` pixels. Domain A has
/// horizontal dark-on-light stripes, domain B vertical light-on-dark stripes
/// with a colour shift, so translating A to B must keep the period to keep
/// the class. In regression mode the target is the stripe brightness.
#[derive(Debug)]
pub struct SyntheticDomains {
    batch_size: usize,
    crop: usize,
    channels: usize,
    task: SemanticTask,
    nclasses: usize,
    noise: f32,
    rng: StdRng,
}

impl SyntheticDomains {
    pub fn new(config: &SemanticConfig, batch_size: usize) -> Self {
        let nclasses = match config.task() {
            SemanticTask::Classification { nclasses } => nclasses.max(2) as usize,
            SemanticTask::Regression { .. } => 4,
        };
        Self {
            batch_size: batch_size.max(1),
            crop: config.crop_size.max(1) as usize,
            channels: config.input_nc.max(1) as usize,
            task: config.task(),
            nclasses,
            noise: 0.05,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn with_noise(mut self, noise: f32) -> Self {
        self.noise = noise;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Draw one batch of labelled images from both domains
    pub fn next_batch(&mut self) -> DomainBatch {
        let n = self.batch_size;
        let pixels = self.crop * self.crop * self.channels;
        let mut a = Vec::with_capacity(n * pixels);
        let mut b = Vec::with_capacity(n * pixels);
        let mut a_class = Vec::with_capacity(n);
        let mut b_class = Vec::with_capacity(n);
        let mut a_level = Vec::with_capacity(n);
        let mut b_level = Vec::with_capacity(n);

        for _ in 0..n {
            let class = self.rng.gen_range(0..self.nclasses);
            let level = self.rng.gen_range(0.25f32..1.0);
            self.draw(&mut a, class, level, false);
            a_class.push(class as i32);
            a_level.push(level);

            let class = self.rng.gen_range(0..self.nclasses);
            let level = self.rng.gen_range(0.25f32..1.0);
            self.draw(&mut b, class, level, true);
            b_class.push(class as i32);
            b_level.push(level);
        }

        let shape = [n as i32, self.crop as i32, self.crop as i32, self.channels as i32];
        let batch = DomainBatch::new(Array::from_slice(&a, &shape), Array::from_slice(&b, &shape));
        match self.task {
            SemanticTask::Classification { .. } => batch
                .with_a_label(Array::from_slice(&a_class, &[n as i32]))
                .with_b_label(Array::from_slice(&b_class, &[n as i32])),
            SemanticTask::Regression { .. } => batch
                .with_a_label(Array::from_slice(&a_level, &[n as i32]))
                .with_b_label(Array::from_slice(&b_level, &[n as i32])),
        }
    }

    fn draw(&mut self, out: &mut Vec<f32>, class: usize, level: f32, domain_b: bool) {
        let period = class + 2;
        for y in 0..self.crop {
            for x in 0..self.crop {
                let coord = if domain_b { x } else { y };
                let on = coord % period < period / 2 + period % 2;
                let base = match (on, domain_b) {
                    (true, false) => -level,
                    (false, false) => level,
                    (true, true) => level,
                    (false, true) => -level,
                };
                for c in 0..self.channels {
                    let shift = if domain_b { 0.1 * c as f32 } else { 0.0 };
                    let jitter = self.noise * self.rng.gen_range(-1.0f32..1.0);
                    out.push((base + shift + jitter).clamp(-1.0, 1.0));
                }
            }
        }
    }
}

impl Iterator for SyntheticDomains {
    type Item = DomainBatch;

    fn next(&mut self) -> Option<DomainBatch> {
        Some(self.next_batch())
    }
}
