use candle_core::Tensor;

use crate::{config_bail, Result};

/// Expand `[seq_len, num_kv_heads, head_size]` keys or values to
/// `[seq_len, num_kv_heads * num_queries_per_kv, head_size]`.
///
/// Each kv head is repeated contiguously, so output head `h` is input head
/// `h / num_queries_per_kv`. With a ratio of 1 the input is returned as is.
pub fn expand_kv_for_gqa(kv: &Tensor, num_queries_per_kv: usize) -> Result<Tensor> {
    match num_queries_per_kv {
        0 => config_bail!("num_queries_per_kv must be positive"),
        1 => Ok(kv.clone()),
        n_rep => {
            let (seq_len, num_kv_heads, head_size) = kv.dims3()?;
            Ok(kv
                .unsqueeze(2)?
                .expand((seq_len, num_kv_heads, n_rep, head_size))?
                .reshape((seq_len, num_kv_heads * n_rep, head_size))?)
        }
    }
}
