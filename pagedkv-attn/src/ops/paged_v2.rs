#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use tracing::{instrument, trace};

use super::{validate_decode_inputs, SOFTMAX_EPS};
use crate::{config_bail, AttentionConfig, BlockTable, PagedKVCache, Result};

/// Tokens per partition when the caller does not choose one.
pub const DEFAULT_PARTITION_SIZE: usize = 512;

const DOT_CHUNK: usize = 4;

/// Unrolled f32 dot product.
#[inline]
fn vec_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0f32;
    let chunks = a.len() / DOT_CHUNK;
    for i in 0..chunks {
        let i_chunk = i * DOT_CHUNK;
        sum += a[i_chunk] * b[i_chunk]
            + a[i_chunk + 1] * b[i_chunk + 1]
            + a[i_chunk + 2] * b[i_chunk + 2]
            + a[i_chunk + 3] * b[i_chunk + 3];
    }
    for i in (chunks * DOT_CHUNK)..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// Running softmax statistics of one head over some prefix of partitions:
/// the running max `max`, normalizer `sum` and unnormalized output `acc`.
///
/// Two states over disjoint token ranges combine with [`PartitionState::merge`], which
/// is associative and has [`PartitionState::new`] as its identity.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionState {
    pub max: f32,
    pub sum: f32,
    pub acc: Vec<f32>,
}

impl PartitionState {
    pub fn new(head_size: usize) -> Self {
        Self {
            max: f32::NEG_INFINITY,
            sum: 0.0,
            acc: vec![0.0; head_size],
        }
    }

    /// True while no unmasked token has been folded in.
    pub fn is_empty(&self) -> bool {
        self.max == f32::NEG_INFINITY
    }

    /// Fold one partition of already-scaled scores and their value rows.
    ///
    /// The running `sum` and `acc` are rescaled to the new max before the partition's
    /// terms are added. Masked tokens carry a score of `-inf`; a partition with no
    /// unmasked token leaves the state untouched.
    pub fn fold<'a>(&mut self, scores: &[f32], value_rows: impl IntoIterator<Item = &'a [f32]>) {
        let part_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let new_max = self.max.max(part_max);
        if new_max == f32::NEG_INFINITY {
            return;
        }

        let rescale = (self.max - new_max).exp();
        self.sum *= rescale;
        for o in self.acc.iter_mut() {
            *o *= rescale;
        }

        for (&score, v_row) in scores.iter().zip(value_rows) {
            if score == f32::NEG_INFINITY {
                continue;
            }
            let e = (score - new_max).exp();
            self.sum += e;
            for (o, v) in self.acc.iter_mut().zip(v_row) {
                *o += e * v;
            }
        }
        self.max = new_max;
    }

    /// Combine the states of two adjacent token ranges.
    pub fn merge(self, other: Self) -> Self {
        if other.is_empty() {
            return self;
        }
        if self.is_empty() {
            return other;
        }
        let max = self.max.max(other.max);
        let a = (self.max - max).exp();
        let b = (other.max - max).exp();
        let acc = self
            .acc
            .iter()
            .zip(&other.acc)
            .map(|(x, y)| x * a + y * b)
            .collect();
        Self {
            max,
            sum: self.sum * a + other.sum * b,
            acc,
        }
    }

    /// Write the normalized output `acc / (sum + eps)`.
    pub fn write_output(&self, out: &mut [f32]) {
        let inv = 1.0 / (self.sum + SOFTMAX_EPS);
        for (o, a) in out.iter_mut().zip(&self.acc) {
            *o = a * inv;
        }
    }
}

/// Dense f32 view of one sequence's gathered keys/values, `[seq_len, num_kv_heads, head_size]`.
struct SeqKv<'a> {
    keys: &'a [f32],
    values: &'a [f32],
    num_kv_heads: usize,
    head_size: usize,
}

impl SeqKv<'_> {
    #[inline]
    fn row<'b>(&self, data: &'b [f32], token: usize, kv_head: usize) -> &'b [f32] {
        let base = (token * self.num_kv_heads + kv_head) * self.head_size;
        &data[base..base + self.head_size]
    }
}

/// State of one head after folding tokens `[start, end)` that lie at or after
/// `window_start`.
fn partition_state(
    q_row: &[f32],
    kv: &SeqKv<'_>,
    kv_head: usize,
    start: usize,
    end: usize,
    window_start: usize,
    scale: f32,
) -> PartitionState {
    let mut state = PartitionState::new(kv.head_size);
    if end <= window_start {
        return state;
    }
    let scores: Vec<f32> = (start..end)
        .map(|t| {
            if t < window_start {
                f32::NEG_INFINITY
            } else {
                vec_dot_f32(q_row, kv.row(kv.keys, t, kv_head)) * scale
            }
        })
        .collect();
    state.fold(&scores, (start..end).map(|t| kv.row(kv.values, t, kv_head)));
    state
}

/// Decode attention that streams each sequence's keys/values in `partition_size`-token
/// partitions, keeping only the running softmax state per head.
///
/// Sequences run as parallel tasks, and within a sequence the heads and partitions do
/// too. Partitions are computed independently and combined with
/// [`PartitionState::merge`], so the result does not depend on `partition_size` beyond
/// float rounding and matches [`super::paged_attention_v1`].
///
/// - query: `[num_seqs, num_heads, head_size]`
///
/// Returns `[num_seqs, num_heads, head_size]`.
#[instrument(skip_all, fields(num_seqs = seq_lens.len(), partition_size = partition_size))]
pub fn paged_attention_v2(
    query: &Tensor,
    kv_cache: &PagedKVCache,
    block_tables: &[BlockTable],
    seq_lens: &[usize],
    config: &AttentionConfig,
    partition_size: usize,
) -> Result<Tensor> {
    if partition_size == 0 {
        config_bail!("partition_size must be positive");
    }
    let (num_seqs, num_heads, head_size) =
        validate_decode_inputs(query, kv_cache, block_tables, seq_lens, config)?;
    let scale = config.scale();

    let mut out = vec![0f32; num_seqs * num_heads * head_size];
    out.par_chunks_mut(num_heads * head_size)
        .zip(block_tables.par_iter())
        .zip(seq_lens.par_iter())
        .enumerate()
        .try_for_each(|(seq_idx, ((out_seq, table), &seq_len))| -> Result<()> {
            if seq_len == 0 {
                return kv_cache.check_blocks(table.valid_blocks());
            }
            let num_partitions = seq_len.div_ceil(partition_size);
            trace!(seq_idx, seq_len, num_partitions, "v2 sequence");

            let (k, v) = kv_cache.read_blocks(table.valid_blocks(), seq_len)?;
            let keys = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let values = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let q_seq = query
                .get(seq_idx)?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let kv = SeqKv {
                keys: &keys,
                values: &values,
                num_kv_heads: config.num_kv_heads(),
                head_size,
            };

            // The single query sits at position seq_len - 1, so causality masks nothing and
            // the window keeps [seq_len - 1 - w, seq_len - 1].
            let window_start = config
                .sliding_window()
                .map(|w| (seq_len - 1).saturating_sub(w))
                .unwrap_or(0);

            out_seq
                .par_chunks_mut(head_size)
                .enumerate()
                .for_each(|(head, out_row)| {
                    let q_row = &q_seq[head * head_size..(head + 1) * head_size];
                    let kv_head = config.kv_head_for(head);
                    let state = (0..num_partitions)
                        .into_par_iter()
                        .map(|p| {
                            let start = p * partition_size;
                            let end = (start + partition_size).min(seq_len);
                            partition_state(q_row, &kv, kv_head, start, end, window_start, scale)
                        })
                        .reduce(|| PartitionState::new(head_size), PartitionState::merge);
                    state.write_output(out_row);
                });
            Ok(())
        })?;

    Ok(
        Tensor::from_vec(out, (num_seqs, num_heads, head_size), query.device())?
            .to_dtype(query.dtype())?,
    )
}
