//! HPACK decoder: consumes one contiguous header block at a time (the
//! connection has already coalesced HEADERS + CONTINUATION) and hands each
//! decoded field to a sink. No semantic checks are applied to names or
//! values; they are opaque octets here.

use super::{huffman::Huffman, integer, table::Table, HpackError};
use crate::frame::HeaderField;
use bytes::Bytes;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Representation {
    Indexed,
    Incremental,
    SizeUpdate,
    NeverIndexed,
    WithoutIndexing,
}

impl Representation {
    /// Classifies a representation from the leading bits of its first octet.
    fn from_octet(octet: u8) -> Self {
        if octet & 0b1000_0000 != 0 {
            Self::Indexed
        } else if octet & 0b0100_0000 != 0 {
            Self::Incremental
        } else if octet & 0b0010_0000 != 0 {
            Self::SizeUpdate
        } else if octet & 0b0001_0000 != 0 {
            Self::NeverIndexed
        } else {
            Self::WithoutIndexing
        }
    }
}

pub struct Decoder {
    table: Table,
    huffman: Huffman,
    /// Allowance signaled by a local SETTINGS_HEADER_TABLE_SIZE change; a
    /// size-update instruction is only legal while one is outstanding.
    allowance: Option<usize>,
    resized: bool,
    fields_seen: bool,
}

impl Decoder {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            table: Table::new(max_size),
            huffman: Huffman::new(),
            allowance: None,
            resized: false,
            fields_seen: false,
        }
    }

    /// Notes that we advertised a new SETTINGS_HEADER_TABLE_SIZE; the peer's
    /// encoder must confirm with a size update no larger than `max_size`.
    /// Until then the table keeps its current maximum.
    pub fn allow_resize(&mut self, max_size: usize) {
        self.allowance = Some(max_size);
        self.table.raise_capacity(max_size);
    }

    /// Clears per-block state. Call between header blocks; the dynamic
    /// table carries over.
    pub fn reset(&mut self) {
        self.fields_seen = false;
    }

    /// Decodes a whole header block, invoking `sink` once per field in
    /// order. Any error is fatal to the compression context.
    pub fn decode<F>(&mut self, mut buf: &[u8], mut sink: F) -> Result<(), HpackError>
    where
        F: FnMut(HeaderField),
    {
        while !buf.is_empty() {
            let consumed = match Representation::from_octet(buf[0]) {
                Representation::Indexed => {
                    let (index, consumed) = integer::decode(buf, 7)?;
                    let entry = self.table.get(index)?;
                    self.field_decoded(&mut sink, entry.name.clone(), entry.value.clone(), false);
                    consumed
                }
                Representation::Incremental => {
                    let ((name, value), consumed) = self.decode_literal(buf, 6)?;
                    self.table.insert(name.clone(), value.clone());
                    self.field_decoded(&mut sink, name, value, false);
                    consumed
                }
                Representation::WithoutIndexing => {
                    let ((name, value), consumed) = self.decode_literal(buf, 4)?;
                    self.field_decoded(&mut sink, name, value, false);
                    consumed
                }
                Representation::NeverIndexed => {
                    let ((name, value), consumed) = self.decode_literal(buf, 4)?;
                    self.field_decoded(&mut sink, name, value, true);
                    consumed
                }
                Representation::SizeUpdate => self.apply_size_update(buf)?,
            };
            buf = &buf[consumed..];
        }
        Ok(())
    }

    fn field_decoded<F>(&mut self, sink: &mut F, name: Bytes, value: Bytes, sensitive: bool)
    where
        F: FnMut(HeaderField),
    {
        if self.resized {
            // the outstanding settings change has been confirmed
            self.allowance = None;
            self.resized = false;
        }
        self.fields_seen = true;
        sink(HeaderField {
            name,
            value,
            sensitive,
        });
    }

    /// Literal representations: a name index (or a literal name when the
    /// index is zero) followed by a literal value.
    fn decode_literal(
        &mut self,
        buf: &[u8],
        prefix_bits: u8,
    ) -> Result<((Bytes, Bytes), usize), HpackError> {
        let (name_index, mut consumed) = integer::decode(buf, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, used) = self.decode_string(&buf[consumed..])?;
            consumed += used;
            name
        } else {
            self.table.get(name_index)?.name.clone()
        };
        let (value, used) = self.decode_string(&buf[consumed..])?;
        consumed += used;
        Ok(((name, value), consumed))
    }

    fn decode_string(&self, buf: &[u8]) -> Result<(Bytes, usize), HpackError> {
        let (length, consumed) = integer::decode(buf, 7)?;
        let end = consumed
            .checked_add(length)
            .filter(|&end| end <= buf.len())
            .ok_or(HpackError::StringTruncated)?;
        let raw = &buf[consumed..end];
        let string = if buf[0] & 0x80 != 0 {
            Bytes::from(self.huffman.decode(raw)?)
        } else {
            Bytes::copy_from_slice(raw)
        };
        Ok((string, end))
    }

    /// https://httpwg.org/specs/rfc7541.html#maximum.table.size — only
    /// legal at the start of a block, and only while a size change we
    /// announced via SETTINGS is waiting to be confirmed.
    fn apply_size_update(&mut self, buf: &[u8]) -> Result<usize, HpackError> {
        if self.fields_seen {
            return Err(HpackError::LateSizeUpdate);
        }
        let allowance = self.allowance.ok_or(HpackError::UnexpectedSizeUpdate)?;
        let (max_size, consumed) = integer::decode(buf, 5)?;
        if max_size > allowance {
            return Err(HpackError::SizeUpdateTooLarge);
        }
        trace!("decoder table resize to {}", max_size);
        self.table.set_max_size(max_size);
        self.resized = true;
        Ok(consumed)
    }

    /// Current size of the dynamic table in octets.
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.table.size()
    }

    /// Dynamic table contents, newest first.
    #[must_use]
    pub fn table_entries(&self) -> Vec<(Bytes, Bytes)> {
        self.table.dynamic_entries()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("table", &self.table)
            .field("allowance", &self.allowance)
            .finish_non_exhaustive()
    }
}
