//! Adversarial and contrastive criteria of the underlying CUT model.

use mlx_rs::{array, error::Exception, nn, ops, Array};

/// Least-squares GAN loss: `mean((pred - target)^2)` with target 1 for
/// real and 0 for fake.
pub fn lsgan_loss(pred: &Array, target_is_real: bool) -> Result<Array, Exception> {
    let target = if target_is_real { 1.0f32 } else { 0.0f32 };
    ops::mean(&pred.subtract(array!(target))?.square()?, false)
}

/// PatchNCE loss between query and key patch embeddings.
///
/// `q` and `k` are `[B * P, D]` unit-norm rows where row `i` of `q` and row
/// `i` of `k` come from the same spatial position. Negatives for a query
/// are the other `P - 1` keys of the same image.
pub fn patch_nce_loss(q: &Array, k: &Array, batch: i32, nce_t: f32) -> Result<Array, Exception> {
    let rows = q.shape()[0];
    let dim = q.shape()[1];
    if rows % batch != 0 || k.shape() != q.shape() {
        return Err(Exception::custom(format!(
            "PatchNCE expects matching [B * P, D] inputs, got {:?} and {:?} for batch {batch}",
            q.shape(),
            k.shape()
        )));
    }
    let patches = rows / batch;

    // positives: [B * P, 1]
    let l_pos = q.multiply(k)?.sum_axis(-1, true)?;

    // negatives: [B, P, P], self-similarity masked out
    let q = q.reshape(&[batch, patches, dim])?;
    let k = k.reshape(&[batch, patches, dim])?;
    let l_neg = q.matmul(&k.transpose_axes(&[0, 2, 1])?)?;
    let eye = ops::eye::<f32>(patches, None, None)?;
    let keep = array!(1.0f32).subtract(&eye)?;
    let l_neg = l_neg
        .multiply(&keep)?
        .add(&eye.multiply(array!(-10.0f32))?)?
        .reshape(&[rows, patches])?;

    let logits = ops::concatenate_axis(&[&l_pos, &l_neg], 1)?.divide(array!(nce_t))?;

    // cross-entropy against the positive at column 0
    let log_probs = nn::log_softmax(&logits, Some(-1))?;
    let zeros = ops::zeros::<i32>(&[rows, 1])?;
    let picked = log_probs.take_along_axis(&zeros, -1)?;
    ops::mean(&picked.negative()?, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsgan_targets() {
        let pred = Array::from_slice(&[1.0f32, 0.0, 0.5, 1.5], &[1, 2, 2, 1]);
        let real = lsgan_loss(&pred, true).unwrap().item::<f32>();
        let fake = lsgan_loss(&pred, false).unwrap().item::<f32>();
        // (0 + 1 + 0.25 + 0.25) / 4 and (1 + 0 + 0.25 + 2.25) / 4
        assert!((real - 0.375).abs() < 1e-6);
        assert!((fake - 0.875).abs() < 1e-6);
    }

    #[test]
    fn test_patch_nce_prefers_aligned_keys() {
        // Two orthogonal patches per image; aligned keys vs swapped keys
        let q = Array::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[2, 2]);
        let aligned = patch_nce_loss(&q, &q, 1, 0.07).unwrap().item::<f32>();
        let swapped = Array::from_slice(&[0.0f32, 1.0, 1.0, 0.0], &[2, 2]);
        let mismatched = patch_nce_loss(&q, &swapped, 1, 0.07).unwrap().item::<f32>();

        assert!(aligned >= 0.0);
        assert!(aligned < mismatched);
    }

    #[test]
    fn test_patch_nce_rejects_bad_batch() {
        let q = Array::from_slice(&[1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        assert!(patch_nce_loss(&q, &q, 2, 0.07).is_err());
    }
}
