use candle_core::{DType, Device, Tensor};
use tracing::trace;

use crate::{shape_bail, AttentionConfig, PagedAttnError, Result};

/// Block-addressed key/value storage for one attention layer.
///
/// Keys and values are both laid out as `[num_blocks, block_size, num_kv_heads, head_size]`.
/// The engine only reads the cache; an external writer populates it and must finish a
/// block before its id is published in any block table.
#[derive(Clone, Debug)]
pub struct PagedKVCache {
    key_cache: Tensor,
    value_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_size: usize,
}

impl PagedKVCache {
    /// key_cache: `[num_blocks, block_size, num_kv_heads, head_size]`
    /// value_cache: same shape and dtype as `key_cache`
    pub fn new(key_cache: Tensor, value_cache: Tensor) -> Result<Self> {
        let (num_blocks, block_size, num_kv_heads, head_size) = key_cache.dims4()?;
        if key_cache.shape() != value_cache.shape() {
            shape_bail!(
                "key and value caches have different shapes, got {:?} and {:?}",
                key_cache.shape(),
                value_cache.shape()
            );
        }
        if key_cache.dtype() != value_cache.dtype() {
            shape_bail!(
                "key and value caches have different dtypes, got {:?} and {:?}",
                key_cache.dtype(),
                value_cache.dtype()
            );
        }
        if block_size == 0 {
            shape_bail!("cache block_size must be positive");
        }
        Ok(Self {
            key_cache: key_cache.contiguous()?,
            value_cache: value_cache.contiguous()?,
            num_blocks,
            block_size,
            num_kv_heads,
            head_size,
        })
    }

    /// Allocate a zero-filled cache shaped for `config`.
    pub fn zeros(
        config: &AttentionConfig,
        num_blocks: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (
            num_blocks,
            config.block_size(),
            config.num_kv_heads(),
            config.head_size(),
        );
        Self::new(
            Tensor::zeros(shape, dtype, device)?,
            Tensor::zeros(shape, dtype, device)?,
        )
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn dtype(&self) -> DType {
        self.key_cache.dtype()
    }

    pub fn device(&self) -> &Device {
        self.key_cache.device()
    }

    pub fn key_cache(&self) -> &Tensor {
        &self.key_cache
    }

    pub fn value_cache(&self) -> &Tensor {
        &self.value_cache
    }

    /// Size in bytes of the key and value storage together.
    pub fn size_in_bytes(&self) -> usize {
        2 * self.key_cache.elem_count() * self.dtype().size_in_bytes()
    }

    /// Check that this cache was laid out for `config`.
    pub fn validate_against(&self, config: &AttentionConfig) -> Result<()> {
        if self.block_size != config.block_size()
            || self.num_kv_heads != config.num_kv_heads()
            || self.head_size != config.head_size()
        {
            shape_bail!(
                "cache layout (block_size={}, num_kv_heads={}, head_size={}) does not match \
                config (block_size={}, num_kv_heads={}, head_size={})",
                self.block_size,
                self.num_kv_heads,
                self.head_size,
                config.block_size(),
                config.num_kv_heads(),
                config.head_size()
            );
        }
        Ok(())
    }

    /// Check that every id in `block_ids` addresses a block of this cache.
    pub fn check_blocks<I>(&self, block_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = usize>,
    {
        match block_ids.into_iter().find(|&id| id >= self.num_blocks) {
            Some(block_id) => Err(PagedAttnError::BlockOutOfBounds {
                block_id: block_id as i64,
                num_blocks: self.num_blocks,
            }),
            None => Ok(()),
        }
    }

    /// Gather the first `seq_len` tokens addressed by `block_ids`.
    ///
    /// Blocks are concatenated in order and the last block only contributes its leading
    /// tokens. Returns `(keys, values)`, each `[seq_len, num_kv_heads, head_size]`.
    /// Every id is checked against the cache capacity, including ids past the ones
    /// `seq_len` needs. Out-of-range ids and block lists too short for `seq_len` are
    /// errors, never truncated.
    pub fn read_blocks<I>(&self, block_ids: I, seq_len: usize) -> Result<(Tensor, Tensor)>
    where
        I: IntoIterator<Item = usize>,
    {
        let needed = seq_len.div_ceil(self.block_size);
        let mut slot_indices = Vec::with_capacity(seq_len);
        let mut blocks_read = 0usize;
        for block_id in block_ids {
            if block_id >= self.num_blocks {
                return Err(PagedAttnError::BlockOutOfBounds {
                    block_id: block_id as i64,
                    num_blocks: self.num_blocks,
                });
            }
            if blocks_read == needed {
                continue;
            }
            let start = blocks_read * self.block_size;
            let n = self.block_size.min(seq_len - start);
            slot_indices.extend(block_slots(block_id, self.block_size, n));
            blocks_read += 1;
        }
        if blocks_read < needed {
            return Err(PagedAttnError::InsufficientBlocks {
                seq_len,
                available: blocks_read,
                block_size: self.block_size,
            });
        }
        trace!(seq_len, blocks_read, "gathering paged kv blocks");

        if seq_len == 0 {
            let empty = Tensor::zeros(
                (0, self.num_kv_heads, self.head_size),
                self.dtype(),
                self.device(),
            )?;
            return Ok((empty.clone(), empty));
        }

        let total_slots = self.num_blocks * self.block_size;
        let flat_kc = self
            .key_cache
            .reshape((total_slots, self.num_kv_heads, self.head_size))?;
        let flat_vc = self
            .value_cache
            .reshape((total_slots, self.num_kv_heads, self.head_size))?;
        let slots = Tensor::new(slot_indices.as_slice(), self.device())?;
        Ok((
            flat_kc.index_select(&slots, 0)?,
            flat_vc.index_select(&slots, 0)?,
        ))
    }
}

/// Flat slot indices of the first `n` tokens of `block_id`.
fn block_slots(block_id: usize, block_size: usize, n: usize) -> impl Iterator<Item = i64> {
    let base = (block_id * block_size) as i64;
    (0..n as i64).map(move |offset| base + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cache where every element of block `b`, token `t` equals `b * 10 + t`.
    fn indexed_cache(num_blocks: usize, block_size: usize) -> Result<PagedKVCache> {
        let data: Vec<f32> = (0..num_blocks)
            .flat_map(|b| (0..block_size).flat_map(move |t| [(b * 10 + t) as f32; 2 * 3]))
            .collect();
        let k = Tensor::from_vec(data, (num_blocks, block_size, 2, 3), &Device::Cpu)?;
        let v = (k.clone() * -1.0)?;
        PagedKVCache::new(k, v)
    }

    #[test]
    fn reads_blocks_in_order_and_truncates_last() -> Result<()> {
        let cache = indexed_cache(4, 2)?;
        let (k, v) = cache.read_blocks([3, 1], 3)?;
        assert_eq!(k.dims(), &[3, 2, 3]);
        let firsts: Vec<f32> = k.narrow(2, 0, 1)?.narrow(1, 0, 1)?.flatten_all()?.to_vec1()?;
        assert_eq!(firsts, vec![30., 31., 10.]);
        let vfirsts: Vec<f32> = v.narrow(2, 0, 1)?.narrow(1, 0, 1)?.flatten_all()?.to_vec1()?;
        assert_eq!(vfirsts, vec![-30., -31., -10.]);
        Ok(())
    }

    #[test]
    fn unneeded_blocks_are_still_bounds_checked() -> Result<()> {
        let cache = indexed_cache(2, 2)?;
        // 2 tokens only need block 1, but 99 is still outside the cache.
        let err = cache.read_blocks([1, 99], 2).unwrap_err();
        assert!(matches!(
            err,
            PagedAttnError::BlockOutOfBounds {
                block_id: 99,
                num_blocks: 2
            }
        ));

        // In-range extra blocks are fine and not gathered.
        let (k, _) = cache.read_blocks([1, 0], 2)?;
        let firsts: Vec<f32> = k.narrow(2, 0, 1)?.narrow(1, 0, 1)?.flatten_all()?.to_vec1()?;
        assert_eq!(firsts, vec![10., 11.]);
        Ok(())
    }

    #[test]
    fn check_blocks_reports_first_bad_id() -> Result<()> {
        let cache = indexed_cache(3, 2)?;
        cache.check_blocks([2, 0, 1])?;
        cache.check_blocks(std::iter::empty())?;
        assert!(matches!(
            cache.check_blocks([0, 7, 9]),
            Err(PagedAttnError::BlockOutOfBounds { block_id: 7, .. })
        ));
        Ok(())
    }

    #[test]
    fn slots_past_u32_range_are_exact() {
        let block_id = 300_000_000usize;
        let slots: Vec<i64> = block_slots(block_id, 16, 3).collect();
        let base = 4_800_000_000i64;
        assert!(base > u32::MAX as i64);
        assert_eq!(slots, vec![base, base + 1, base + 2]);
    }

    #[test]
    fn zeros_matches_config() -> Result<()> {
        let cfg = AttentionConfig::new(4, 2, 8, 4, None, None)?;
        let cache = PagedKVCache::zeros(&cfg, 3, DType::F16, &Device::Cpu)?;
        assert_eq!(cache.key_cache().dims(), &[3, 4, 2, 8]);
        assert_eq!(cache.dtype(), DType::F16);
        assert_eq!(cache.size_in_bytes(), 2 * 3 * 4 * 2 * 8 * 2);
        cache.validate_against(&cfg)?;
        let (k, _) = cache.read_blocks([2], 3)?;
        assert_eq!(k.to_dtype(DType::F32)?.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn out_of_bounds_block_is_an_error() -> Result<()> {
        let cache = indexed_cache(2, 2)?;
        let err = cache.read_blocks([0, 2], 4).unwrap_err();
        assert!(matches!(
            err,
            PagedAttnError::BlockOutOfBounds {
                block_id: 2,
                num_blocks: 2
            }
        ));
        Ok(())
    }

    #[test]
    fn too_few_blocks_is_an_error() -> Result<()> {
        let cache = indexed_cache(4, 2)?;
        let err = cache.read_blocks([0], 3).unwrap_err();
        assert!(matches!(
            err,
            PagedAttnError::InsufficientBlocks {
                seq_len: 3,
                available: 1,
                block_size: 2
            }
        ));
        Ok(())
    }

    #[test]
    fn empty_read() -> Result<()> {
        let cache = indexed_cache(1, 2)?;
        let (k, v) = cache.read_blocks(std::iter::empty(), 0)?;
        assert_eq!(k.dims(), &[0, 2, 3]);
        assert_eq!(v.dims(), &[0, 2, 3]);
        Ok(())
    }

    #[test]
    fn mismatched_caches_are_rejected() {
        let k = Tensor::zeros((2, 2, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::zeros((2, 2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            PagedKVCache::new(k, v),
            Err(PagedAttnError::Shape(_))
        ));
    }
}
