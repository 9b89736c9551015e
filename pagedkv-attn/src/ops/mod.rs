//! Attention computation over the paged cache.

use std::{fmt::Display, time::Instant};

use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{
    metrics::{record_paged_attention_call, record_paged_attention_duration, PagedAttentionMetrics},
    shape_bail, AttentionConfig, AttentionMetadata, BlockTable, PagedKVCache, Result,
};

mod gqa;
mod paged_v1;
mod paged_v2;
mod prefill;
mod sdpa;

pub use gqa::expand_kv_for_gqa;
pub use paged_v1::paged_attention_v1;
pub use paged_v2::{paged_attention_v2, PartitionState, DEFAULT_PARTITION_SIZE};
pub use prefill::paged_prefill_attention;
pub use sdpa::{attention_mask, scaled_dot_product_attention, SOFTMAX_EPS};

/// Above this many (sequence, head) pairs the batch alone saturates the workers and
/// decode skips partitioning.
const V1_PARALLELISM_THRESHOLD: usize = 512;

/// Which computation path served a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKernel {
    V1,
    V2,
    Prefill,
}

impl Display for AttentionKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::Prefill => "prefill",
        };
        write!(f, "{name}")
    }
}

/// Pick the decode path: V1 when every sequence fits one partition or the batch already
/// offers enough parallelism, V2 otherwise.
pub fn select_decode_kernel(
    num_seqs: usize,
    num_heads: usize,
    max_seq_len: usize,
    partition_size: usize,
) -> AttentionKernel {
    let max_num_partitions = max_seq_len.div_ceil(partition_size.max(1));
    if max_num_partitions <= 1 || num_seqs * num_heads > V1_PARALLELISM_THRESHOLD {
        AttentionKernel::V1
    } else {
        AttentionKernel::V2
    }
}

/// Check decode inputs against the config before touching the cache.
/// Returns `(num_seqs, num_heads, head_size)`.
fn validate_decode_inputs(
    query: &Tensor,
    kv_cache: &PagedKVCache,
    block_tables: &[BlockTable],
    seq_lens: &[usize],
    config: &AttentionConfig,
) -> Result<(usize, usize, usize)> {
    let (num_seqs, num_heads, head_size) = query.dims3()?;
    if (num_heads, head_size) != (config.num_heads(), config.head_size()) {
        shape_bail!(
            "query {:?} does not match config (num_heads={}, head_size={})",
            query.dims(),
            config.num_heads(),
            config.head_size()
        );
    }
    if block_tables.len() != num_seqs || seq_lens.len() != num_seqs {
        shape_bail!(
            "query has {num_seqs} sequences but got {} block tables and {} sequence lengths",
            block_tables.len(),
            seq_lens.len()
        );
    }
    kv_cache.validate_against(config)?;
    Ok((num_seqs, num_heads, head_size))
}

/// Run attention for one forward call, choosing the path from the metadata.
///
/// Prefill metadata goes to [`paged_prefill_attention`]; decode goes to V1 or V2 as
/// decided by [`select_decode_kernel`] with [`DEFAULT_PARTITION_SIZE`].
#[instrument(skip_all, fields(num_seqs = metadata.num_seqs(), prefill = metadata.is_prefill()))]
pub fn paged_attention(
    query: &Tensor,
    kv_cache: &PagedKVCache,
    metadata: &AttentionMetadata,
    config: &AttentionConfig,
) -> Result<Tensor> {
    let start = Instant::now();
    let kernel = if metadata.is_prefill() {
        AttentionKernel::Prefill
    } else {
        select_decode_kernel(
            metadata.num_seqs(),
            config.num_heads(),
            metadata.max_seq_len(),
            DEFAULT_PARTITION_SIZE,
        )
    };
    debug!(%kernel, max_seq_len = metadata.max_seq_len(), "dispatching paged attention");

    let out = match kernel {
        AttentionKernel::Prefill => paged_prefill_attention(query, kv_cache, metadata, config)?,
        AttentionKernel::V1 => paged_attention_v1(
            query,
            kv_cache,
            &metadata.block_tables,
            &metadata.seq_lens,
            config,
        )?,
        AttentionKernel::V2 => paged_attention_v2(
            query,
            kv_cache,
            &metadata.block_tables,
            &metadata.seq_lens,
            config,
            DEFAULT_PARTITION_SIZE,
        )?,
    };

    record_paged_attention_call(&PagedAttentionMetrics {
        num_sequences: metadata.num_seqs(),
        num_query_tokens: metadata.num_query_tokens(),
        num_heads: config.num_heads(),
        num_kv_heads: config.num_kv_heads(),
        head_size: config.head_size(),
        num_blocks: kv_cache.num_blocks(),
        block_size: kv_cache.block_size(),
        max_context_len: metadata.max_seq_len(),
        softmax_scale: config.scale(),
        sliding_window: config.sliding_window(),
        kernel,
    });
    record_paged_attention_duration(start.elapsed().as_secs_f64() * 1000.0, kernel);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_selection() {
        // Everything fits a single partition.
        assert_eq!(select_decode_kernel(1, 8, 512, 512), AttentionKernel::V1);
        assert_eq!(select_decode_kernel(1, 8, 0, 512), AttentionKernel::V1);
        // Long context, small batch: partition.
        assert_eq!(select_decode_kernel(2, 8, 513, 512), AttentionKernel::V2);
        // Long context but the batch is wide enough already.
        assert_eq!(select_decode_kernel(128, 8, 4096, 512), AttentionKernel::V1);
        assert_eq!(AttentionKernel::Prefill.to_string(), "prefill");
    }
}
