use candle_core::{DType, Device, Tensor, D};

use crate::{shape_bail, Result};

/// Added to every softmax denominator so a fully masked row yields zeros, not NaN.
pub const SOFTMAX_EPS: f32 = 1e-9;

/// Build an additive `[q_len, kv_len]` mask of `0.0` (visible) and `-inf` (masked).
///
/// Query rows are aligned to the end of the key sequence: query `i` sits at absolute
/// position `i + kv_len - q_len`. With `causal`, keys after that position are masked;
/// with `sliding_window = w`, keys before `position - w` are masked too, so query `i`
/// sees `[max(0, pos - w), pos]`. Returns `None` when nothing is masked.
pub fn attention_mask(
    q_len: usize,
    kv_len: usize,
    causal: bool,
    sliding_window: Option<usize>,
    device: &Device,
) -> Result<Option<Tensor>> {
    if !causal && sliding_window.is_none() {
        return Ok(None);
    }
    let offset = kv_len as isize - q_len as isize;
    let mut mask_data = vec![0.0f32; q_len * kv_len];
    for q in 0..q_len {
        let q_pos = q as isize + offset;
        let row = &mut mask_data[q * kv_len..(q + 1) * kv_len];
        for (kv, m) in row.iter_mut().enumerate() {
            let kv = kv as isize;
            let future = causal && kv > q_pos;
            let outside_window = sliding_window.is_some_and(|w| kv < q_pos - w as isize);
            if future || outside_window {
                *m = f32::NEG_INFINITY;
            }
        }
    }
    Ok(Some(Tensor::from_vec(mask_data, (q_len, kv_len), device)?))
}

/// Row-wise softmax over the last dim with max subtraction and an epsilon-guarded
/// denominator.
pub(crate) fn guarded_softmax_last_dim(scores: &Tensor) -> Result<Tensor> {
    // A fully masked row has max -inf; flooring it keeps exp() at exactly 0.
    let floor = Tensor::new(f32::MIN, scores.device())?;
    let max = scores.max_keepdim(D::Minus1)?.broadcast_maximum(&floor)?;
    let exp = scores.broadcast_sub(&max)?.exp()?;
    let denom = (exp.sum_keepdim(D::Minus1)? + SOFTMAX_EPS as f64)?;
    Ok(exp.broadcast_div(&denom)?)
}

/// Dense reference attention, `softmax(QK^T * scale + mask) V`.
///
/// - query: `[b, heads, q_len, head_size]`
/// - key, value: `[b, heads, kv_len, head_size]`
///
/// Computed in f32; the result has the query's dtype.
pub fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    scale: f32,
    causal: bool,
    sliding_window: Option<usize>,
) -> Result<Tensor> {
    let (b_sz, n_heads, q_len, head_size) = query.dims4()?;
    let (k_b, k_heads, kv_len, k_head_size) = key.dims4()?;
    if key.dims() != value.dims() {
        shape_bail!(
            "key and value shapes disagree: {:?} vs {:?}",
            key.dims(),
            value.dims()
        );
    }
    if (k_b, k_heads, k_head_size) != (b_sz, n_heads, head_size) {
        shape_bail!(
            "query {:?} is incompatible with key {:?}",
            query.dims(),
            key.dims()
        );
    }
    let out_dtype = query.dtype();
    if kv_len == 0 {
        return Ok(Tensor::zeros(
            (b_sz, n_heads, q_len, head_size),
            out_dtype,
            query.device(),
        )?);
    }

    let q = query.to_dtype(DType::F32)?.contiguous()?;
    let k = key.to_dtype(DType::F32)?;
    let v = value.to_dtype(DType::F32)?.contiguous()?;

    let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale as f64)?;
    if let Some(mask) = attention_mask(q_len, kv_len, causal, sliding_window, query.device())? {
        scores = scores.broadcast_add(&mask)?;
    }
    let probs = guarded_softmax_last_dim(&scores)?;
    Ok(probs.matmul(&v)?.to_dtype(out_dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?)
    }

    /// Plain-loop `softmax(QK^T * scale) V` for a single `[q_len, d]` x `[kv_len, d]` head.
    fn reference_head(q: &[Vec<f32>], k: &[Vec<f32>], v: &[Vec<f32>], scale: f32) -> Vec<Vec<f32>> {
        q.iter()
            .map(|q_row| {
                let scores: Vec<f32> = k
                    .iter()
                    .map(|k_row| q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>() * scale)
                    .collect();
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let sum: f32 = exps.iter().sum();
                let mut out = vec![0f32; v[0].len()];
                for (e, v_row) in exps.iter().zip(v) {
                    for (o, x) in out.iter_mut().zip(v_row) {
                        *o += e / sum * x;
                    }
                }
                out
            })
            .collect()
    }

    #[test]
    fn matches_reference_softmax() -> Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 3, 5, 8), &dev)?;
        let k = Tensor::randn(0f32, 1.0, (2, 3, 7, 8), &dev)?;
        let v = Tensor::randn(0f32, 1.0, (2, 3, 7, 8), &dev)?;
        let scale = 0.3;
        let out = scaled_dot_product_attention(&q, &k, &v, scale, false, None)?;
        assert_eq!(out.dims(), &[2, 3, 5, 8]);

        for b in 0..2 {
            for h in 0..3 {
                let qh = q.get(b)?.get(h)?.to_vec2::<f32>()?;
                let kh = k.get(b)?.get(h)?.to_vec2::<f32>()?;
                let vh = v.get(b)?.get(h)?.to_vec2::<f32>()?;
                let expected = reference_head(&qh, &kh, &vh, scale);
                let got = out.get(b)?.get(h)?.to_vec2::<f32>()?;
                for (e_row, g_row) in expected.iter().zip(&got) {
                    for (e, g) in e_row.iter().zip(g_row) {
                        assert!((e - g).abs() < 1e-5, "expected {e}, got {g}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn causal_ignores_future_keys() -> Result<()> {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 6, 4), &dev)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 6, 4), &dev)?;
        let v = Tensor::randn(0f32, 1.0, (1, 2, 6, 4), &dev)?;
        let base = scaled_dot_product_attention(&q, &k, &v, 0.5, true, None)?;

        // Perturb key/value 4 and 5: rows 0..=3 must not move.
        let noise = Tensor::randn(0f32, 10.0, (1, 2, 2, 4), &dev)?;
        let k2 = Tensor::cat(&[&k.narrow(2, 0, 4)?, &noise], 2)?;
        let v2 = Tensor::cat(&[&v.narrow(2, 0, 4)?, &noise], 2)?;
        let perturbed = scaled_dot_product_attention(&q, &k2, &v2, 0.5, true, None)?;

        let diff = max_abs_diff(&base.narrow(2, 0, 4)?, &perturbed.narrow(2, 0, 4)?)?;
        assert!(diff < 1e-6, "{diff}");
        let changed = max_abs_diff(&base.narrow(2, 4, 2)?, &perturbed.narrow(2, 4, 2)?)?;
        assert!(changed > 1e-4);
        Ok(())
    }

    #[test]
    fn sliding_window_ignores_old_keys() -> Result<()> {
        let dev = Device::Cpu;
        let window = 2;
        let q = Tensor::randn(0f32, 1.0, (1, 1, 6, 4), &dev)?;
        let k = Tensor::randn(0f32, 1.0, (1, 1, 6, 4), &dev)?;
        let v = Tensor::randn(0f32, 1.0, (1, 1, 6, 4), &dev)?;
        let base = scaled_dot_product_attention(&q, &k, &v, 0.5, true, Some(window))?;

        // Query 5 sees [3, 5]; perturbing keys 0..=2 must not change it.
        let noise = Tensor::randn(0f32, 10.0, (1, 1, 3, 4), &dev)?;
        let k2 = Tensor::cat(&[&noise, &k.narrow(2, 3, 3)?], 2)?;
        let perturbed = scaled_dot_product_attention(&q, &k2, &v, 0.5, true, Some(window))?;
        let diff = max_abs_diff(&base.narrow(2, 5, 1)?, &perturbed.narrow(2, 5, 1)?)?;
        assert!(diff < 1e-6, "{diff}");
        Ok(())
    }

    #[test]
    fn mask_layout() -> Result<()> {
        let mask = attention_mask(2, 6, true, Some(3), &Device::Cpu)?.unwrap();
        let data = mask.to_vec2::<f32>()?;
        // Row 0 sits at position 4: window [1, 4], key 5 is in the future.
        assert!(data[0][0].is_infinite());
        assert_eq!(&data[0][1..5], &[0.0, 0.0, 0.0, 0.0]);
        assert!(data[0][5].is_infinite());
        // Row 1 sits at position 5: window [2, 5].
        assert!(data[1][1].is_infinite());
        assert_eq!(&data[1][2..], &[0.0, 0.0, 0.0, 0.0]);

        assert!(attention_mask(3, 3, false, None, &Device::Cpu)?.is_none());
        Ok(())
    }

    #[test]
    fn fully_masked_row_is_zero() -> Result<()> {
        let scores = Tensor::new(
            &[[f32::NEG_INFINITY, f32::NEG_INFINITY], [0.0, 0.0]],
            &Device::Cpu,
        )?;
        let probs = guarded_softmax_last_dim(&scores)?.to_vec2::<f32>()?;
        assert_eq!(probs[0], vec![0.0, 0.0]);
        assert!((probs[1][0] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_shapes() {
        let dev = Device::Cpu;
        let q = Tensor::zeros((1, 2, 1, 4), DType::F32, &dev).unwrap();
        let k = Tensor::zeros((1, 3, 5, 4), DType::F32, &dev).unwrap();
        assert!(scaled_dot_product_attention(&q, &k, &k, 1.0, true, None).is_err());
    }
}
