//! Paged key/value-cache attention.
//!
//! Keys and values of every sequence live in fixed-size blocks of a shared
//! [`PagedKVCache`], addressed through per-sequence [`BlockTable`]s. The [`ops`] module
//! computes decode attention either directly ([`paged_attention_v1`]) or with a
//! partitioned online softmax ([`paged_attention_v2`]), plus multi-token prefill
//! attention over the same cache.

mod block_table;
mod cache;
mod config;
mod error;
mod logging;
mod metadata;
pub mod metrics;
pub mod ops;

pub use block_table::{slot_for, slot_mapping, BlockTable, BLOCK_SENTINEL, PAD_SLOT_ID};
pub use cache::PagedKVCache;
pub use config::AttentionConfig;
pub use error::{PagedAttnError, Result};
pub use logging::{initialize_logging, DEBUG_ENV_VAR};
pub use metadata::{AttentionMetadata, AttentionType};
pub use ops::{
    expand_kv_for_gqa, paged_attention, paged_attention_v1, paged_attention_v2,
    paged_prefill_attention, scaled_dot_product_attention, AttentionKernel,
    DEFAULT_PARTITION_SIZE,
};
