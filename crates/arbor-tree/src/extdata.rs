//! Ext_data blocks: value lists too large for the leaf body.
//!
//! Each spilled entry owns one block inside the leaf's ext_data region:
//!
//! ```text
//! +----------------+----------------+----------------+-----------+---------+
//! | block len (4)  | free len (4)   | reserved (4)   | values... | padding |
//! +----------------+----------------+----------------+-----------+---------+
//! ```
//!
//! The value count lives in the leaf entry, not the block. New values
//! append at `block_len - free`; removal and replacement rewrite the value
//! bytes wholesale. Callers hold the leaf lock across the header load and
//! the subsequent write.

use crate::layout::{ExtRegionSpec, LayoutContext, ValueList, EXT_BLOCK_HEADER_SIZE};
use crate::node::{LeafEntry, LeafRecord};
use arbor_common::{ArborError, EntryValue, RecordPointer, Result};
use arbor_io::{BlockReader, BlockWriter};
use tracing::debug;

/// A loaded ext_data block header.
#[derive(Debug, Clone, Copy)]
pub struct ExtBlock {
    /// Absolute offset of the block.
    pub start: u64,
    /// Total block length, header and padding included.
    pub length: u32,
    /// Free bytes at the block's end.
    pub free: u32,
}

impl ExtBlock {
    /// Bytes of value data currently in the block.
    pub fn used(&self) -> u32 {
        self.length - EXT_BLOCK_HEADER_SIZE as u32 - self.free
    }

    /// Absolute offset of the first value byte.
    pub fn data_start(&self) -> u64 {
        self.start + EXT_BLOCK_HEADER_SIZE as u64
    }

    /// Absolute offset where the next value would be appended.
    pub fn append_pos(&self) -> u64 {
        self.start + u64::from(self.length) - u64::from(self.free)
    }
}

fn ext_ref(entry: &LeafEntry) -> Result<(u32, u32)> {
    match entry.values {
        ValueList::Ext { count, ptr } => Ok((count, ptr)),
        ValueList::Inline(_) => Err(ArborError::Internal(
            "entry does not reference ext_data".to_string(),
        )),
    }
}

/// Loads the block header referenced by a leaf entry.
pub fn load_block(reader: &mut BlockReader, leaf: &LeafRecord, ptr: u32) -> Result<ExtBlock> {
    let ext = leaf.ext.ok_or_else(|| ArborError::Corrupted {
        offset: leaf.offset,
        reason: "ext_data reference in a leaf without an ext region".to_string(),
    })?;
    let start = leaf.ext_region_start() + u64::from(ptr);
    reader.seek(start);
    let length = reader.get_u32()?;
    let free = reader.get_u32()?;
    let _reserved = reader.get_u32()?;

    if u64::from(ptr) + u64::from(length) > u64::from(ext.length)
        || u64::from(free) + EXT_BLOCK_HEADER_SIZE as u64 > u64::from(length)
    {
        return Err(ArborError::Corrupted {
            offset: start,
            reason: format!("ext_data block ({length} bytes, {free} free) exceeds its region"),
        });
    }
    Ok(ExtBlock { start, length, free })
}

/// Materializes the value list of an ext_data entry.
pub fn load_values(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
    entry: &LeafEntry,
) -> Result<Vec<EntryValue>> {
    let (count, ptr) = ext_ref(entry)?;
    let block = load_block(reader, leaf, ptr)?;
    reader.seek(block.data_start());
    let raw = reader.get(block.used() as usize)?;
    ctx.parse_values_raw(&raw, count as usize)
}

/// Appends a value to an ext_data entry's block.
///
/// Verifies the block has room, writes the value at `length - free`,
/// decrements the block's free length, and bumps the leaf entry's value
/// count. Fails with `NoSpace` when the block is full; the mutator then
/// rebuilds the leaf with a grown ext_data region.
pub fn add_value(
    reader: &mut BlockReader,
    writer: &mut BlockWriter,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
    entry: &LeafEntry,
    value: &EntryValue,
) -> Result<()> {
    let (count, ptr) = ext_ref(entry)?;
    let block = load_block(reader, leaf, ptr)?;

    let mut encoded = Vec::new();
    value.serialize(ctx.metadata_count, &mut encoded)?;
    if u64::from(block.free) < encoded.len() as u64 {
        return Err(ArborError::NoSpace {
            requested: encoded.len() as u64,
            available: u64::from(block.free),
        });
    }

    writer.write_at(&encoded, block.append_pos())?;
    let new_free = block.free - encoded.len() as u32;
    writer.write_at(&new_free.to_be_bytes(), block.start + 4)?;
    writer.write_at(
        &(count + 1).to_be_bytes(),
        entry.ext_count_field_pos(ctx.small_leaves),
    )?;
    debug!(key = %entry.key, count = count + 1, "ext_data value appended");
    Ok(())
}

/// Removes the value matching `record_pointer` from an ext_data entry,
/// rewriting the block and decrementing the leaf entry's value count.
pub fn remove_value(
    reader: &mut BlockReader,
    writer: &mut BlockWriter,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
    entry: &LeafEntry,
    record_pointer: &RecordPointer,
) -> Result<()> {
    let (count, ptr) = ext_ref(entry)?;
    let block = load_block(reader, leaf, ptr)?;
    let mut values = load_values(reader, ctx, leaf, entry)?;

    let at = values
        .iter()
        .position(|v| v.record_pointer == *record_pointer)
        .ok_or(ArborError::ValueNotFound)?;
    values.remove(at);

    let raw = ctx.serialize_values_raw(&values)?;
    writer.write_at(&raw, block.data_start())?;
    let new_free = block.length - EXT_BLOCK_HEADER_SIZE as u32 - raw.len() as u32;
    writer.write_at(&new_free.to_be_bytes(), block.start + 4)?;
    writer.write_at(
        &(count - 1).to_be_bytes(),
        entry.ext_count_field_pos(ctx.small_leaves),
    )?;
    debug!(key = %entry.key, count = count - 1, "ext_data value removed");
    Ok(())
}

/// Replaces the value matching `current` with `replacement` in place.
/// Fails with `NoSpace` when the rewritten list outgrows the block.
pub fn replace_value(
    reader: &mut BlockReader,
    writer: &mut BlockWriter,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
    entry: &LeafEntry,
    current: &RecordPointer,
    replacement: EntryValue,
) -> Result<()> {
    let (_, ptr) = ext_ref(entry)?;
    let block = load_block(reader, leaf, ptr)?;
    let mut values = load_values(reader, ctx, leaf, entry)?;

    let at = values
        .iter()
        .position(|v| v.record_pointer == *current)
        .ok_or(ArborError::ValueNotFound)?;
    values[at] = replacement;

    let raw = ctx.serialize_values_raw(&values)?;
    let capacity = u64::from(block.length) - EXT_BLOCK_HEADER_SIZE as u64;
    if raw.len() as u64 > capacity {
        return Err(ArborError::NoSpace {
            requested: raw.len() as u64,
            available: capacity,
        });
    }

    writer.write_at(&raw, block.data_start())?;
    let new_free = block.length - EXT_BLOCK_HEADER_SIZE as u32 - raw.len() as u32;
    writer.write_at(&new_free.to_be_bytes(), block.start + 4)?;
    Ok(())
}

/// Writes a fresh block into the leaf's ext free tail for a newly spilled
/// entry. Returns the new block's pointer and the region's updated spec.
/// Fails with `NoSpace` when the tail cannot hold the block.
pub fn append_block(
    writer: &mut BlockWriter,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
    values: &[EntryValue],
) -> Result<(u32, ExtRegionSpec)> {
    let ext = leaf.ext.ok_or_else(|| ArborError::Internal(
        "append_block on a leaf without an ext region".to_string(),
    ))?;
    let raw = ctx.serialize_values_raw(values)?;

    // Reserve the usual half-again growth slack when the tail allows it.
    let need = EXT_BLOCK_HEADER_SIZE as u32 + raw.len() as u32;
    let want = need + (raw.len() / 2) as u32;
    let available = ext.free;
    let block_len = if want <= available {
        want
    } else if need <= available {
        need
    } else {
        return Err(ArborError::NoSpace {
            requested: u64::from(need),
            available: u64::from(available),
        });
    };

    let ptr = ext.length - ext.free;
    let block = crate::layout::build_ext_block(&raw, block_len - need);
    writer.write_at(&block, leaf.ext_region_start() + u64::from(ptr))?;

    Ok((
        ptr,
        ExtRegionSpec {
            length: ext.length,
            free: ext.free - block_len,
        },
    ))
}
