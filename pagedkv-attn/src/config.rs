use serde::{Deserialize, Serialize};

use crate::{config_bail, PagedAttnError, Result};

/// Immutable per-model attention parameters.
///
/// Construction validates the head grouping, so a live `AttentionConfig` always has
/// `num_heads % num_kv_heads == 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAttentionConfig", into = "RawAttentionConfig")]
pub struct AttentionConfig {
    num_heads: usize,
    num_kv_heads: usize,
    head_size: usize,
    block_size: usize,
    scale: f32,
    sliding_window: Option<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawAttentionConfig {
    num_heads: usize,
    num_kv_heads: usize,
    head_size: usize,
    block_size: usize,
    #[serde(default)]
    scale: Option<f32>,
    #[serde(default)]
    sliding_window: Option<usize>,
}

impl TryFrom<RawAttentionConfig> for AttentionConfig {
    type Error = PagedAttnError;

    fn try_from(raw: RawAttentionConfig) -> Result<Self> {
        Self::new(
            raw.num_heads,
            raw.num_kv_heads,
            raw.head_size,
            raw.block_size,
            raw.scale,
            raw.sliding_window,
        )
    }
}

impl From<AttentionConfig> for RawAttentionConfig {
    fn from(cfg: AttentionConfig) -> Self {
        Self {
            num_heads: cfg.num_heads,
            num_kv_heads: cfg.num_kv_heads,
            head_size: cfg.head_size,
            block_size: cfg.block_size,
            scale: Some(cfg.scale),
            sliding_window: cfg.sliding_window,
        }
    }
}

impl AttentionConfig {
    /// Build a validated config. `scale` defaults to `1 / sqrt(head_size)`.
    pub fn new(
        num_heads: usize,
        num_kv_heads: usize,
        head_size: usize,
        block_size: usize,
        scale: Option<f32>,
        sliding_window: Option<usize>,
    ) -> Result<Self> {
        if num_heads == 0 || num_kv_heads == 0 {
            config_bail!(
                "head counts must be positive (num_heads={num_heads}, num_kv_heads={num_kv_heads})"
            );
        }
        if num_heads % num_kv_heads != 0 {
            config_bail!(
                "num_heads ({num_heads}) must be a multiple of num_kv_heads ({num_kv_heads})"
            );
        }
        if head_size == 0 {
            config_bail!("head_size must be positive");
        }
        if block_size == 0 {
            config_bail!("block_size must be positive");
        }
        let scale = scale.unwrap_or_else(|| 1.0 / (head_size as f32).sqrt());
        if !scale.is_finite() || scale <= 0.0 {
            config_bail!("scale must be a positive finite number, got {scale}");
        }
        if sliding_window == Some(0) {
            config_bail!("sliding_window must be positive when set");
        }
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_size,
            block_size,
            scale,
            sliding_window,
        })
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PagedAttnError::Config(e.to_string()))
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn sliding_window(&self) -> Option<usize> {
        self.sliding_window
    }

    /// Number of query heads sharing each key/value head.
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn is_gqa(&self) -> bool {
        self.num_queries_per_kv() > 1
    }

    /// The key/value head read by query head `head`. Heads are grouped contiguously:
    /// query heads `[g * r, (g + 1) * r)` share kv head `g`.
    pub fn kv_head_for(&self, head: usize) -> usize {
        head / self.num_queries_per_kv()
    }
}
