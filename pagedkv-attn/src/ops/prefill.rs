use candle_core::Tensor;
use rayon::prelude::*;
use tracing::{instrument, trace};

use super::{expand_kv_for_gqa, scaled_dot_product_attention};
use crate::{shape_bail, AttentionConfig, AttentionMetadata, PagedKVCache, Result};

/// Multi-token attention over the paged cache, for prefill and chunked prefill.
///
/// Sequence `s` contributes `query_lens[s]` consecutive query rows which are the last
/// `query_lens[s]` of its `seq_lens[s]` cached tokens; the cache writer must already
/// have stored their keys/values. Causality follows `metadata.attention_type`.
///
/// - query: `[sum(query_lens), num_heads, head_size]`
///
/// Returns `[sum(query_lens), num_heads, head_size]`.
#[instrument(skip_all, fields(num_seqs = metadata.num_seqs()))]
pub fn paged_prefill_attention(
    query: &Tensor,
    kv_cache: &PagedKVCache,
    metadata: &AttentionMetadata,
    config: &AttentionConfig,
) -> Result<Tensor> {
    let Some(query_lens) = metadata.query_lens.as_deref() else {
        shape_bail!("prefill attention needs per-sequence query lengths");
    };
    let (num_tokens, num_heads, head_size) = query.dims3()?;
    if (num_heads, head_size) != (config.num_heads(), config.head_size()) {
        shape_bail!(
            "query {:?} does not match config (num_heads={}, head_size={})",
            query.dims(),
            config.num_heads(),
            config.head_size()
        );
    }
    if query_lens.len() != metadata.num_seqs() || metadata.block_tables.len() != metadata.num_seqs()
    {
        shape_bail!(
            "metadata lists {} sequence lengths, {} query lengths and {} block tables",
            metadata.num_seqs(),
            query_lens.len(),
            metadata.block_tables.len()
        );
    }
    let total: usize = query_lens.iter().sum();
    if total != num_tokens {
        shape_bail!("query has {num_tokens} tokens but query_lens sum to {total}");
    }
    kv_cache.validate_against(config)?;

    let causal = metadata.attention_type.is_causal();
    let q_offsets: Vec<usize> = query_lens
        .iter()
        .scan(0usize, |offset, &q_len| {
            let start = *offset;
            *offset += q_len;
            Some(start)
        })
        .collect();
    let outputs = metadata
        .block_tables
        .par_iter()
        .zip(metadata.seq_lens.par_iter())
        .zip(query_lens.par_iter().zip(q_offsets.par_iter()))
        .enumerate()
        .map(
            |(seq_idx, ((table, &seq_len), (&q_len, &q_offset)))| -> Result<Option<Tensor>> {
                if q_len == 0 {
                    kv_cache.check_blocks(table.valid_blocks())?;
                    return Ok(None);
                }
                if q_len > seq_len {
                    shape_bail!(
                        "sequence {seq_idx} has {q_len} query tokens but only {seq_len} cached tokens"
                    );
                }
                trace!(seq_idx, seq_len, q_len, "prefill sequence");

                let (k, v) = kv_cache.read_blocks(table.valid_blocks(), seq_len)?;
                let k = expand_kv_for_gqa(&k, config.num_queries_per_kv())?;
                let v = expand_kv_for_gqa(&v, config.num_queries_per_kv())?;
                let k = k.transpose(0, 1)?.unsqueeze(0)?;
                let v = v.transpose(0, 1)?.unsqueeze(0)?;

                // [q_len, num_heads, head_size] -> [1, num_heads, q_len, head_size]
                let q = query
                    .narrow(0, q_offset, q_len)?
                    .transpose(0, 1)?
                    .unsqueeze(0)?;
                let out = scaled_dot_product_attention(
                    &q,
                    &k,
                    &v,
                    config.scale(),
                    causal,
                    config.sliding_window(),
                )?;
                Ok(Some(out.squeeze(0)?.transpose(0, 1)?))
            },
        )
        .collect::<Result<Vec<_>>>()?;
    let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();

    if outputs.is_empty() {
        return Ok(Tensor::zeros(
            (0, num_heads, head_size),
            query.dtype(),
            query.device(),
        )?);
    }
    Ok(Tensor::cat(&outputs, 0)?.contiguous()?)
}
