use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{shape_bail, BlockTable, Result};

/// Kind of attention a forward call computes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    /// Causal self-attention of a decoder.
    #[default]
    Decoder,
    /// Bidirectional self-attention of an encoder in an encoder/decoder model.
    Encoder,
    /// Bidirectional self-attention of an encoder-only model.
    EncoderOnly,
    /// Decoder queries attending to encoder keys/values.
    EncoderDecoder,
}

impl AttentionType {
    pub fn is_causal(&self) -> bool {
        matches!(self, Self::Decoder)
    }
}

/// Per-call batch description, built fresh by the scheduler for each forward pass.
#[derive(Clone, Debug)]
pub struct AttentionMetadata {
    /// Seq id -> list of physical blocks.
    pub block_tables: Vec<BlockTable>,
    /// Number of cached tokens each sequence attends over.
    pub seq_lens: Vec<usize>,
    pub attention_type: AttentionType,
    /// New query tokens per sequence for a prefill call; `None` for decode, where every
    /// sequence contributes exactly one query.
    pub query_lens: Option<Vec<usize>>,
}

impl AttentionMetadata {
    /// Decode metadata: one query token per sequence.
    pub fn new(
        block_tables: Vec<BlockTable>,
        seq_lens: Vec<usize>,
        attention_type: AttentionType,
    ) -> Result<Self> {
        if block_tables.len() != seq_lens.len() {
            shape_bail!(
                "got {} block tables but {} sequence lengths",
                block_tables.len(),
                seq_lens.len()
            );
        }
        Ok(Self {
            block_tables,
            seq_lens,
            attention_type,
            query_lens: None,
        })
    }

    /// Prefill metadata: sequence `s` contributes the last `query_lens[s]` of its
    /// `seq_lens[s]` tokens as queries.
    pub fn prefill(
        block_tables: Vec<BlockTable>,
        seq_lens: Vec<usize>,
        query_lens: Vec<usize>,
        attention_type: AttentionType,
    ) -> Result<Self> {
        let mut this = Self::new(block_tables, seq_lens, attention_type)?;
        if query_lens.len() != this.seq_lens.len() {
            shape_bail!(
                "got {} query lengths for {} sequences",
                query_lens.len(),
                this.seq_lens.len()
            );
        }
        for (seq_idx, (&q_len, &seq_len)) in query_lens.iter().zip(&this.seq_lens).enumerate() {
            if q_len > seq_len {
                shape_bail!(
                    "sequence {seq_idx} has {q_len} query tokens but only {seq_len} cached tokens"
                );
            }
        }
        this.query_lens = Some(query_lens);
        Ok(this)
    }

    /// block_tables: `[num_seqs, max_blocks]` integer tensor, negative entries unused.
    /// seq_lens: `[num_seqs]` u32 or i64 tensor.
    pub fn from_tensors(
        block_tables: &Tensor,
        seq_lens: &Tensor,
        attention_type: AttentionType,
    ) -> Result<Self> {
        let seq_lens: Vec<usize> = match seq_lens.dtype() {
            DType::U32 => seq_lens
                .to_vec1::<u32>()?
                .into_iter()
                .map(|l| l as usize)
                .collect(),
            DType::I64 => {
                let lens = seq_lens.to_vec1::<i64>()?;
                if let Some(l) = lens.iter().find(|&&l| l < 0) {
                    shape_bail!("sequence lengths must be non-negative, got {l}");
                }
                lens.into_iter().map(|l| l as usize).collect()
            }
            dtype => shape_bail!("seq_lens must be a u32 or i64 tensor, got {dtype:?}"),
        };
        Self::new(BlockTable::from_tensor(block_tables)?, seq_lens, attention_type)
    }

    pub fn num_seqs(&self) -> usize {
        self.seq_lens.len()
    }

    pub fn max_seq_len(&self) -> usize {
        self.seq_lens.iter().copied().max().unwrap_or(0)
    }

    pub fn is_prefill(&self) -> bool {
        self.query_lens.is_some()
    }

    /// Total query rows this call produces.
    pub fn num_query_tokens(&self) -> usize {
        match &self.query_lens {
            Some(q) => q.iter().sum(),
            None => self.num_seqs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn decode_metadata() -> Result<()> {
        let tables = Tensor::new(&[[0i64, 1], [-1, -1]], &Device::Cpu)?;
        let lens = Tensor::new(&[3u32, 0], &Device::Cpu)?;
        let md = AttentionMetadata::from_tensors(&tables, &lens, AttentionType::Decoder)?;
        assert_eq!(md.num_seqs(), 2);
        assert_eq!(md.max_seq_len(), 3);
        assert_eq!(md.num_query_tokens(), 2);
        assert!(!md.is_prefill());
        Ok(())
    }

    #[test]
    fn mismatched_lengths() {
        let res = AttentionMetadata::new(vec![BlockTable::empty(1)], vec![], AttentionType::Decoder);
        assert!(res.is_err());
    }

    #[test]
    fn prefill_query_lens_are_checked() {
        let tables = vec![BlockTable::new(vec![0]), BlockTable::new(vec![1])];
        let ok = AttentionMetadata::prefill(
            tables.clone(),
            vec![2, 1],
            vec![2, 1],
            AttentionType::Decoder,
        )
        .unwrap();
        assert_eq!(ok.num_query_tokens(), 3);
        assert!(ok.is_prefill());

        let too_many =
            AttentionMetadata::prefill(tables, vec![2, 1], vec![2, 2], AttentionType::Decoder);
        assert!(too_many.is_err());
    }

    #[test]
    fn only_decoder_is_causal() {
        assert!(AttentionType::Decoder.is_causal());
        assert!(!AttentionType::Encoder.is_causal());
        assert!(!AttentionType::EncoderOnly.is_causal());
        assert!(!AttentionType::EncoderDecoder.is_causal());
    }
}
