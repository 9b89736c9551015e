//! Error types for the paged attention engine.

use thiserror::Error;

/// Errors raised by the paged attention engine.
///
/// A zero-length sequence is not an error: it produces an all-zero output row.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PagedAttnError {
    /// The attention configuration is invalid (bad GQA ratio, zero sizes, ...).
    #[error("invalid attention config: {0}")]
    Config(String),

    /// Tensor or metadata dimensions disagree with the config or with each other.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A block table references a block the cache does not hold.
    #[error("block id {block_id} is out of bounds for a cache of {num_blocks} blocks")]
    BlockOutOfBounds { block_id: i64, num_blocks: usize },

    /// The valid blocks of a block table cannot supply the requested tokens.
    #[error(
        "sequence of {seq_len} tokens needs more than the {available} valid blocks \
        of size {block_size} in its block table"
    )]
    InsufficientBlocks {
        seq_len: usize,
        available: usize,
        block_size: usize,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Convenience type alias for `std::result::Result<T, PagedAttnError>`.
pub type Result<T> = std::result::Result<T, PagedAttnError>;

/// Return early with a [`PagedAttnError::Shape`].
#[macro_export]
macro_rules! shape_bail {
    ($($arg:tt)*) => {
        return Err($crate::PagedAttnError::Shape(format!($($arg)*)))
    };
}

/// Return early with a [`PagedAttnError::Config`].
#[macro_export]
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::PagedAttnError::Config(format!($($arg)*)))
    };
}
