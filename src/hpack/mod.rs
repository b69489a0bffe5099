//! HPACK header compression (RFC 7541): integer and string primitives,
//! Huffman coding, the combined static/dynamic indexing table, and the
//! encoder/decoder pair whose dynamic tables must evolve in lockstep with
//! the peer's.

mod decoder;
mod encoder;
mod huffman;
mod integer;
mod table;

pub use decoder::Decoder;
pub use encoder::Encoder;

/// Everything that can go wrong while coding a header block. At the
/// connection level any of these is fatal (COMPRESSION_ERROR).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpackError {
    #[error("integer exceeds the decoder limit")]
    IntegerOverflow,
    #[error("truncated integer")]
    IntegerTruncated,
    #[error("string literal extends past the block")]
    StringTruncated,
    #[error("huffman padding longer than seven bits")]
    PaddingTooLarge,
    #[error("huffman padding is not an EOS prefix")]
    InvalidPadding,
    #[error("EOS symbol inside a huffman string")]
    EosInString,
    #[error("header index {0} is not in the table")]
    IndexOutOfBounds(usize),
    #[error("table size update after the first header field of a block")]
    LateSizeUpdate,
    #[error("table size update without a pending settings change")]
    UnexpectedSizeUpdate,
    #[error("table size update above the settings allowance")]
    SizeUpdateTooLarge,
}
