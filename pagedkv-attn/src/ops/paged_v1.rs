use candle_core::Tensor;
use rayon::prelude::*;
use tracing::{instrument, trace};

use super::{expand_kv_for_gqa, scaled_dot_product_attention, validate_decode_inputs};
use crate::{AttentionConfig, BlockTable, PagedKVCache, Result};

/// Decode attention that gathers each sequence's cached keys/values into dense tensors
/// and runs the reference softmax over them.
///
/// - query: `[num_seqs, num_heads, head_size]`, one new token per sequence
/// - block_tables: one table per sequence, sentinels skipped
/// - seq_lens: cached tokens per sequence
///
/// Sequences run as parallel tasks. Returns `[num_seqs, num_heads, head_size]`;
/// sequences of length 0 produce a zero row.
#[instrument(skip_all, fields(num_seqs = seq_lens.len()))]
pub fn paged_attention_v1(
    query: &Tensor,
    kv_cache: &PagedKVCache,
    block_tables: &[BlockTable],
    seq_lens: &[usize],
    config: &AttentionConfig,
) -> Result<Tensor> {
    let (num_seqs, num_heads, head_size) =
        validate_decode_inputs(query, kv_cache, block_tables, seq_lens, config)?;
    if num_seqs == 0 {
        return Ok(Tensor::zeros(
            (0, num_heads, head_size),
            query.dtype(),
            query.device(),
        )?);
    }

    let rows = block_tables
        .par_iter()
        .zip(seq_lens.par_iter())
        .enumerate()
        .map(|(seq_idx, (table, &seq_len))| -> Result<Tensor> {
            if seq_len == 0 {
                kv_cache.check_blocks(table.valid_blocks())?;
                return Ok(Tensor::zeros(
                    (num_heads, head_size),
                    query.dtype(),
                    query.device(),
                )?);
            }
            trace!(seq_idx, seq_len, "v1 sequence");

            let (k, v) = kv_cache.read_blocks(table.valid_blocks(), seq_len)?;
            let k = expand_kv_for_gqa(&k, config.num_queries_per_kv())?;
            let v = expand_kv_for_gqa(&v, config.num_queries_per_kv())?;

            // [seq_len, num_heads, head_size] -> [1, num_heads, seq_len, head_size]
            let k = k.transpose(0, 1)?.unsqueeze(0)?;
            let v = v.transpose(0, 1)?.unsqueeze(0)?;
            // [num_heads, head_size] -> [1, num_heads, 1, head_size]
            let q = query.get(seq_idx)?.unsqueeze(1)?.unsqueeze(0)?;

            let out = scaled_dot_product_attention(
                &q,
                &k,
                &v,
                config.scale(),
                true,
                config.sliding_window(),
            )?;
            Ok(out.squeeze(2)?.squeeze(0)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}
