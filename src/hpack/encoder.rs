//! HPACK encoder: chooses among the four header-field representations and
//! keeps its dynamic table in lockstep with the bytes it emits.

use super::{
    huffman, integer,
    table::{Search, Table},
};
use crate::frame::HeaderField;
use bytes::{BufMut, Bytes, BytesMut};
use log::trace;

const INDEXED: u8 = 0b1000_0000;
const INCREMENTAL: u8 = 0b0100_0000;
const SIZE_UPDATE: u8 = 0b0010_0000;
const NEVER_INDEXED: u8 = 0b0001_0000;
const WITHOUT_INDEXING: u8 = 0b0000_0000;

#[derive(Debug, Clone, Copy)]
struct PendingResize {
    smallest: usize,
    last: usize,
}

#[derive(Debug)]
pub struct Encoder {
    table: Table,
    /// Huffman-code every string literal.
    pub huffman: bool,
    /// Index non-sensitive fields into the dynamic table.
    pub index: bool,
    pending_resize: Option<PendingResize>,
}

impl Encoder {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            table: Table::new(max_size),
            huffman: true,
            index: true,
            pending_resize: None,
        }
    }

    /// Adopts the table size the peer advertised via
    /// SETTINGS_HEADER_TABLE_SIZE. The change applies to our table at once;
    /// the matching size-update instructions go out in front of the next
    /// header block.
    pub fn set_max_size(&mut self, max_size: usize) {
        if max_size == self.table.max_size() && self.pending_resize.is_none() {
            return;
        }
        trace!("encoder table resize to {}", max_size);
        match &mut self.pending_resize {
            Some(pending) => {
                pending.smallest = pending.smallest.min(max_size);
                pending.last = max_size;
            }
            None => {
                self.pending_resize = Some(PendingResize {
                    smallest: max_size,
                    last: max_size,
                });
            }
        }
        self.table.set_capacity(max_size);
    }

    /// Encodes one whole header block.
    pub fn encode_block(&mut self, fields: &[HeaderField], out: &mut BytesMut) {
        for field in fields {
            self.encode_field(field, out);
        }
    }

    /// Encodes a single field, flushing any pending table-size updates
    /// first so they precede every representation of the block.
    pub fn encode_field(&mut self, field: &HeaderField, out: &mut BytesMut) {
        if let Some(pending) = self.pending_resize.take() {
            if pending.smallest < pending.last {
                integer::encode(pending.smallest, 5, SIZE_UPDATE, out);
            }
            integer::encode(pending.last, 5, SIZE_UPDATE, out);
        }

        let found = self.table.search(&field.name, &field.value);
        if let Search::Exact(index) = found {
            if !field.sensitive && self.index {
                integer::encode(index, 7, INDEXED, out);
                return;
            }
        }
        let name_index = match found {
            Search::Exact(index) | Search::Name(index) => Some(index),
            Search::Miss => None,
        };
        if field.sensitive {
            self.encode_literal(NEVER_INDEXED, 4, name_index, field, out);
        } else if self.index {
            self.encode_literal(INCREMENTAL, 6, name_index, field, out);
            self.table.insert(field.name.clone(), field.value.clone());
        } else {
            self.encode_literal(WITHOUT_INDEXING, 4, name_index, field, out);
        }
    }

    fn encode_literal(
        &mut self,
        pattern: u8,
        prefix_bits: u8,
        name_index: Option<usize>,
        field: &HeaderField,
        out: &mut BytesMut,
    ) {
        match name_index {
            Some(index) => integer::encode(index, prefix_bits, pattern, out),
            None => {
                out.put_u8(pattern);
                self.encode_string(&field.name, out);
            }
        }
        self.encode_string(&field.value, out);
    }

    fn encode_string(&self, raw: &[u8], out: &mut BytesMut) {
        if self.huffman {
            integer::encode(huffman::encoded_len(raw), 7, 0x80, out);
            huffman::encode(raw, out);
        } else {
            integer::encode(raw.len(), 7, 0x00, out);
            out.put_slice(raw);
        }
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

impl Default for Encoder {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_HEADER_TABLE_SIZE as usize)
    }
}
