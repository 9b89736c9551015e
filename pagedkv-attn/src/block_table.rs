//! Logical token offset -> physical block / cache slot indirection.

use candle_core::{DType, Tensor};

use crate::{shape_bail, Result};

/// Canonical marker for an unused block table entry. Every negative id is treated
/// as a sentinel and skipped.
pub const BLOCK_SENTINEL: i64 = -1;

/// Slot id for positions that have no backing block.
pub const PAD_SLOT_ID: i64 = -1;

/// Ordered physical block ids of one sequence, possibly padded with sentinels.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockTable {
    ids: Vec<i64>,
}

impl BlockTable {
    pub fn new(ids: Vec<i64>) -> Self {
        Self { ids }
    }

    /// A table with no valid entries.
    pub fn empty(max_blocks: usize) -> Self {
        Self {
            ids: vec![BLOCK_SENTINEL; max_blocks],
        }
    }

    /// Raw entries, sentinels included.
    pub fn as_slice(&self) -> &[i64] {
        &self.ids
    }

    /// The non-sentinel block ids, in table order.
    pub fn valid_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.ids.iter().filter(|&&id| id >= 0).map(|&id| id as usize)
    }

    pub fn num_valid_blocks(&self) -> usize {
        self.valid_blocks().count()
    }

    /// Pad (or keep) this table to `max_blocks` entries using [`BLOCK_SENTINEL`].
    pub fn padded(&self, max_blocks: usize) -> Result<Self> {
        if self.ids.len() > max_blocks {
            shape_bail!(
                "block table has {} entries, more than the padded width {max_blocks}",
                self.ids.len()
            );
        }
        let mut ids = self.ids.clone();
        ids.resize(max_blocks, BLOCK_SENTINEL);
        Ok(Self { ids })
    }

    /// Split a rank-2 integer tensor `[num_seqs, max_blocks]` into per-sequence tables.
    pub fn from_tensor(block_tables: &Tensor) -> Result<Vec<Self>> {
        let (_num_seqs, _max_blocks) = block_tables.dims2()?;
        let rows: Vec<Vec<i64>> = match block_tables.dtype() {
            DType::I64 => block_tables.to_vec2::<i64>()?,
            DType::U32 => block_tables
                .to_vec2::<u32>()?
                .into_iter()
                .map(|row| row.into_iter().map(i64::from).collect())
                .collect(),
            DType::U8 => block_tables
                .to_vec2::<u8>()?
                .into_iter()
                .map(|row| row.into_iter().map(i64::from).collect())
                .collect(),
            dtype => shape_bail!("block tables must be an integer tensor, got {dtype:?}"),
        };
        Ok(rows.into_iter().map(Self::new).collect())
    }
}

impl From<Vec<i64>> for BlockTable {
    fn from(ids: Vec<i64>) -> Self {
        Self::new(ids)
    }
}

/// Absolute cache slot of `token_position` when it lives in physical block `block_id`.
pub fn slot_for(block_id: usize, block_size: usize, token_position: usize) -> usize {
    block_id * block_size + token_position % block_size
}

/// Slot ids for `positions` of one sequence. The block for position `p` is the
/// `p / block_size`-th valid entry of `table`; positions past the table's capacity
/// map to [`PAD_SLOT_ID`].
///
/// Only the external cache writer consumes these.
pub fn slot_mapping(
    table: &BlockTable,
    positions: impl IntoIterator<Item = usize>,
    block_size: usize,
) -> Vec<i64> {
    let blocks: Vec<usize> = table.valid_blocks().collect();
    positions
        .into_iter()
        .map(|pos| match blocks.get(pos / block_size) {
            Some(&block_id) => slot_for(block_id, block_size, pos) as i64,
            None => PAD_SLOT_ID,
        })
        .collect()
}
