use serde::Serialize;
use tracing::{debug, enabled, Level};

use crate::ops::AttentionKernel;

#[derive(Serialize, Debug)]
pub struct PagedAttentionMetrics {
    pub num_sequences: usize,
    pub num_query_tokens: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub num_blocks: usize,
    pub block_size: usize,
    pub max_context_len: usize,
    pub softmax_scale: f32,
    pub sliding_window: Option<usize>,
    pub kernel: AttentionKernel,
}

pub fn record_paged_attention_call(metrics: &PagedAttentionMetrics) {
    if !enabled!(target: "paged_attention_metrics", Level::DEBUG) {
        return;
    }
    // Log as structured JSON for analysis
    debug!(
        target: "paged_attention_metrics",
        "{}",
        serde_json::to_string(metrics).unwrap_or_default()
    );
}

pub fn record_paged_attention_duration(duration_ms: f64, kernel: AttentionKernel) {
    debug!(
        target: "paged_attention_metrics",
        duration_ms,
        %kernel,
        "paged attention call finished"
    );
}

pub fn record_tensor_size(name: &str, size_bytes: u64) {
    debug!(
        target: "tensor_metrics",
        "{}",
        serde_json::json!({
            "tensor_name": name,
            "size_bytes": size_bytes
        })
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_serialize_as_flat_json() {
        let metrics = PagedAttentionMetrics {
            num_sequences: 2,
            num_query_tokens: 2,
            num_heads: 8,
            num_kv_heads: 2,
            head_size: 64,
            num_blocks: 16,
            block_size: 16,
            max_context_len: 37,
            softmax_scale: 0.125,
            sliding_window: None,
            kernel: AttentionKernel::V2,
        };
        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["kernel"], "v2");
        assert_eq!(value["max_context_len"], 37);
        assert!(value["sliding_window"].is_null());
        record_paged_attention_call(&metrics);
        record_paged_attention_duration(0.5, metrics.kernel);
        record_tensor_size("key_cache", 1024);
    }
}
