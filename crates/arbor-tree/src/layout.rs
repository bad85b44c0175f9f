//! On-disk record layout.
//!
//! A tree is one contiguous byte region:
//!
//! ```text
//! +-------------+
//! | Tree header |
//! +-------------+
//! | Node records|  root first, then level by level
//! +-------------+
//! | Leaf records|  each optionally followed by its ext_data region
//! +-------------+
//! | Free tail   |  tracked by the header's free-byte length
//! +-------------+
//! ```
//!
//! Node record:
//! ```text
//! +--------------+-------+--------------+-------+----------------------+--------+------+
//! | byte_len (4) | flags | free_len (4) | n (1) | n * (key, lt_off[6]) | gt_off | free |
//! +--------------+-------+--------------+-------+----------------------+--------+------+
//! ```
//!
//! Leaf record:
//! ```text
//! +--------------+-------+--------------+----------+----------+------------------+-------+---------+------+
//! | byte_len (4) | flags | free_len (4) | prev [6] | next [6] | [ext_len ext_free] | n (1) | entries | free |
//! +--------------+-------+--------------+----------+----------+------------------+-------+---------+------+
//! ```
//!
//! A leaf's `byte_len` covers the record through its free padding and
//! excludes the ext_data region, which begins at `record_start + byte_len`
//! and spans `ext_len` bytes. All integers are big-endian; child and
//! neighbor offsets are signed relative offsets (sign bit in the top bit of
//! the first byte).

use arbor_common::offset::{self, LARGE_OFFSET_SIZE};
use arbor_common::{ArborError, EntryValue, Key, Result, TreeOptions};

/// Tree header flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeFlags(pub u8);

impl TreeFlags {
    /// Each key has exactly one entry value.
    pub const UNIQUE: u8 = 0b0000_0001;
    /// Entry values carry a metadata tuple.
    pub const METADATA: u8 = 0b0000_0010;
    /// Header carries a free-byte length field.
    pub const FREE_SPACE: u8 = 0b0000_0100;
    /// Header carries a fill-factor field.
    pub const FILL_FACTOR: u8 = 0b0000_1000;
    /// Leaves use 1-byte value-length fields.
    pub const SMALL_LEAFS: u8 = 0b0001_0000;
    /// Child/neighbor offsets are 48-bit.
    pub const LARGE_PTRS: u8 = 0b0010_0000;

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true when the given mask bit is set.
    pub fn has(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    /// Sets or clears the given mask bit.
    pub fn set(&mut self, mask: u8, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// Leaf/node record flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafFlags(pub u8);

impl LeafFlags {
    /// Record is a leaf.
    pub const IS_LEAF: u8 = 0b0000_0001;
    /// Leaf has an ext_data region.
    pub const HAS_EXT_DATA: u8 = 0b0000_0010;

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true when the given mask bit is set.
    pub fn has(&self, mask: u8) -> bool {
        self.0 & mask != 0
    }

    /// Sets or clears the given mask bit.
    pub fn set(&mut self, mask: u8, on: bool) {
        if on {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// Offset of a record's flags byte from the record start.
pub const RECORD_FLAGS_OFFSET: u64 = 4;
/// Offset of a record's free-byte-length field from the record start.
pub const RECORD_FREE_LEN_OFFSET: u64 = 5;
/// Offset of a record's body (entry count for nodes, prev pointer for
/// leaves) from the record start.
pub const RECORD_BODY_OFFSET: u64 = 9;
/// Offset of a leaf's prev-neighbor field from the record start.
pub const LEAF_PREV_OFFSET: u64 = RECORD_BODY_OFFSET;
/// Offset of a leaf's next-neighbor field from the record start.
pub const LEAF_NEXT_OFFSET: u64 = LEAF_PREV_OFFSET + LARGE_OFFSET_SIZE as u64;

/// Inline value-section budget in small-leaf mode; the eighth bit of the
/// 1-byte length flags an ext_data pointer instead.
pub const SMALL_LEAF_MAX_SECTION: usize = 127;

/// Inline value-section budget in large (4-byte length) mode.
pub const LARGE_LEAF_MAX_SECTION: usize = 0xFFFF;

/// Marker bit for "ext_data pointer follows" in small-leaf mode.
pub const EXT_DATA_MARKER: u8 = 0x80;

/// Byte size of an ext_data block header (length + free + reserved
/// forward pointer).
pub const EXT_BLOCK_HEADER_SIZE: usize = 12;

/// Growth headroom multiplier for free-space padding.
const PADDING_FACTOR: f64 = 1.1;

/// Assumed entry size when padding a record that has no entries yet.
const ASSUMED_ENTRY_SIZE: usize = 32;

/// The self-describing tree header at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHeader {
    /// Total byte length of the tree region, free tail included.
    pub byte_length: u32,
    /// Flag mask.
    pub flags: TreeFlags,
    /// Maximum entries per node and per leaf.
    pub max_entries: u8,
    /// Fill factor used at build time, when recorded.
    pub fill_factor: Option<u8>,
    /// Current free tail length, when tracked.
    pub free_bytes: Option<u32>,
    /// Declared metadata key names, in schema order.
    pub metadata_keys: Vec<String>,
}

impl TreeHeader {
    /// Builds a header from creation options. The byte length and free
    /// bytes are patched in after the tree body is written.
    pub fn from_options(options: &TreeOptions) -> Self {
        let mut flags = TreeFlags::empty();
        flags.set(TreeFlags::UNIQUE, options.unique);
        flags.set(TreeFlags::METADATA, options.has_metadata());
        flags.set(TreeFlags::FREE_SPACE, true);
        flags.set(TreeFlags::FILL_FACTOR, true);
        flags.set(TreeFlags::SMALL_LEAFS, options.small_leaves);
        flags.set(TreeFlags::LARGE_PTRS, true);
        Self {
            byte_length: 0,
            flags,
            max_entries: options.max_entries,
            fill_factor: Some(options.fill_factor),
            free_bytes: Some(0),
            metadata_keys: options.metadata_keys.clone(),
        }
    }

    /// Returns true for unique-keys trees.
    pub fn unique(&self) -> bool {
        self.flags.has(TreeFlags::UNIQUE)
    }

    /// Returns true for small-leaf trees.
    pub fn small_leaves(&self) -> bool {
        self.flags.has(TreeFlags::SMALL_LEAFS)
    }

    /// Number of metadata values per entry value.
    pub fn metadata_count(&self) -> usize {
        self.metadata_keys.len()
    }

    /// Serialized header length in bytes.
    pub fn serialized_len(&self) -> usize {
        let mut len = 4 + 1 + 1;
        if self.flags.has(TreeFlags::FILL_FACTOR) {
            len += 1;
        }
        if self.flags.has(TreeFlags::FREE_SPACE) {
            len += 4;
        }
        if self.flags.has(TreeFlags::METADATA) {
            len += 4 + 1;
            for name in &self.metadata_keys {
                len += 1 + name.len();
            }
        }
        len
    }

    /// Absolute offset of the root record (immediately after the header).
    pub fn root_offset(&self) -> u64 {
        self.serialized_len() as u64
    }

    /// Absolute offset of the free-byte-length field, when present. The
    /// allocator patches this field in place.
    pub fn free_bytes_field_offset(&self) -> Option<u64> {
        if !self.flags.has(TreeFlags::FREE_SPACE) {
            return None;
        }
        let mut at = 6u64;
        if self.flags.has(TreeFlags::FILL_FACTOR) {
            at += 1;
        }
        Some(at)
    }

    /// Serializes the header.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.serialized_len());
        out.extend_from_slice(&self.byte_length.to_be_bytes());
        out.push(self.flags.0);
        out.push(self.max_entries);
        if self.flags.has(TreeFlags::FILL_FACTOR) {
            out.push(self.fill_factor.unwrap_or(100));
        }
        if self.flags.has(TreeFlags::FREE_SPACE) {
            out.extend_from_slice(&self.free_bytes.unwrap_or(0).to_be_bytes());
        }
        if self.flags.has(TreeFlags::METADATA) {
            let mut block = Vec::new();
            if self.metadata_keys.len() > 255 {
                return Err(ArborError::Encoding(format!(
                    "{} metadata keys exceeds 255",
                    self.metadata_keys.len()
                )));
            }
            block.push(self.metadata_keys.len() as u8);
            for name in &self.metadata_keys {
                if name.len() > 255 {
                    return Err(ArborError::Encoding(format!(
                        "metadata key name '{name}' exceeds 255 bytes"
                    )));
                }
                block.push(name.len() as u8);
                block.extend_from_slice(name.as_bytes());
            }
            out.extend_from_slice(&(block.len() as u32).to_be_bytes());
            out.extend_from_slice(&block);
        }
        Ok(out)
    }

    /// Parses a header from the start of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(ArborError::Eof { offset: buf.len() as u64 });
        }
        let byte_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let flags = TreeFlags(buf[4]);
        let max_entries = buf[5];
        let mut at = 6usize;

        let fill_factor = if flags.has(TreeFlags::FILL_FACTOR) {
            let v = *buf.get(at).ok_or(ArborError::Eof { offset: at as u64 })?;
            at += 1;
            Some(v)
        } else {
            None
        };

        let free_bytes = if flags.has(TreeFlags::FREE_SPACE) {
            if buf.len() < at + 4 {
                return Err(ArborError::Eof { offset: buf.len() as u64 });
            }
            let v = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
            at += 4;
            Some(v)
        } else {
            None
        };

        let mut metadata_keys = Vec::new();
        if flags.has(TreeFlags::METADATA) {
            if buf.len() < at + 5 {
                return Err(ArborError::Eof { offset: buf.len() as u64 });
            }
            at += 4; // block length, recomputable from the names
            let count = buf[at] as usize;
            at += 1;
            for _ in 0..count {
                let name_len = *buf.get(at).ok_or(ArborError::Eof { offset: at as u64 })? as usize;
                at += 1;
                if buf.len() < at + name_len {
                    return Err(ArborError::Eof { offset: buf.len() as u64 });
                }
                let name = std::str::from_utf8(&buf[at..at + name_len])
                    .map_err(|e| ArborError::Corrupted {
                        offset: at as u64,
                        reason: format!("metadata key name not UTF-8: {e}"),
                    })?
                    .to_string();
                metadata_keys.push(name);
                at += name_len;
            }
        }

        Ok(Self {
            byte_length,
            flags,
            max_entries,
            fill_factor,
            free_bytes,
            metadata_keys,
        })
    }
}

/// Sizing strategy for a record image.
#[derive(Debug, Clone, Copy)]
pub enum Sizing {
    /// Pad with the fill-headroom policy:
    /// `ceil((max_entries - n) * avg_entry_size * 1.1)` free bytes.
    Padded,
    /// Produce exactly this record length (rewrites in place). Fails with
    /// `NoSpace` when the body does not fit.
    Exact(u32),
    /// No free bytes at all.
    Compact,
}

/// Per-tree encoding parameters shared by the record builders.
#[derive(Debug, Clone)]
pub struct LayoutContext {
    /// Unique-keys tree: value sections hold a single value, no count.
    pub unique: bool,
    /// 1-byte value-length fields.
    pub small_leaves: bool,
    /// Declared metadata tuple width.
    pub metadata_count: usize,
    /// Maximum entries per node/leaf.
    pub max_entries: u8,
}

impl LayoutContext {
    /// Derives the context from a parsed header.
    pub fn from_header(header: &TreeHeader) -> Self {
        Self {
            unique: header.unique(),
            small_leaves: header.small_leaves(),
            metadata_count: header.metadata_count(),
            max_entries: header.max_entries,
        }
    }

    /// Inline value-section budget for this tree.
    pub fn max_inline_section(&self) -> usize {
        if self.small_leaves {
            SMALL_LEAF_MAX_SECTION
        } else {
            LARGE_LEAF_MAX_SECTION
        }
    }

    /// Serializes a value list as a section (count-prefixed unless unique).
    pub fn serialize_value_section(&self, values: &[EntryValue]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        if self.unique {
            let value = values.first().ok_or_else(|| {
                ArborError::Internal("unique entry with no value".to_string())
            })?;
            value.serialize(self.metadata_count, &mut out)?;
        } else {
            out.extend_from_slice(&(values.len() as u32).to_be_bytes());
            for value in values {
                value.serialize(self.metadata_count, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Parses a value section produced by [`Self::serialize_value_section`].
    pub fn parse_value_section(&self, buf: &[u8]) -> Result<Vec<EntryValue>> {
        let mut values = Vec::new();
        if self.unique {
            let (value, _) = EntryValue::deserialize(buf, self.metadata_count)?;
            values.push(value);
        } else {
            if buf.len() < 4 {
                return Err(ArborError::Eof { offset: buf.len() as u64 });
            }
            let count = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            let mut at = 4;
            for _ in 0..count {
                let (value, n) = EntryValue::deserialize(&buf[at..], self.metadata_count)?;
                values.push(value);
                at += n;
            }
        }
        Ok(values)
    }

    /// Serializes a bare value list without any count prefix (the ext_data
    /// block body format; the count lives in the leaf entry).
    pub fn serialize_values_raw(&self, values: &[EntryValue]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for value in values {
            value.serialize(self.metadata_count, &mut out)?;
        }
        Ok(out)
    }

    /// Parses `count` values from an ext_data block body.
    pub fn parse_values_raw(&self, buf: &[u8], count: usize) -> Result<Vec<EntryValue>> {
        let mut values = Vec::with_capacity(count);
        let mut at = 0;
        for _ in 0..count {
            let (value, n) = EntryValue::deserialize(&buf[at..], self.metadata_count)?;
            values.push(value);
            at += n;
        }
        Ok(values)
    }
}

/// Value storage of one leaf entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueList {
    /// Values stored inline in the leaf body.
    Inline(Vec<EntryValue>),
    /// Values spilled into an ext_data block.
    Ext {
        /// Total number of values in the block.
        count: u32,
        /// Unsigned block offset from the end of the leaf record.
        ptr: u32,
    },
}

impl ValueList {
    /// Total number of values, regardless of storage.
    pub fn total(&self) -> u64 {
        match self {
            ValueList::Inline(values) => values.len() as u64,
            ValueList::Ext { count, .. } => u64::from(*count),
        }
    }
}

/// One entry of a leaf under construction.
#[derive(Debug, Clone)]
pub struct LeafEntryData {
    /// The entry key.
    pub key: Key,
    /// Its value list.
    pub values: ValueList,
}

/// A serialized leaf: the record image plus its ext_data region.
#[derive(Debug)]
pub struct LeafImage {
    /// Record bytes, free padding included.
    pub record: Vec<u8>,
    /// Ext_data region bytes (empty when no entry spilled).
    pub ext_region: Vec<u8>,
}

impl LeafImage {
    /// Combined on-disk footprint.
    pub fn total_len(&self) -> usize {
        self.record.len() + self.ext_region.len()
    }
}

/// Builds a node record image.
///
/// `node_offset` is the absolute position the record will occupy; child
/// positions are absolute and re-encoded as relative offsets based at the
/// first byte after each offset field.
pub fn build_node(
    node_offset: u64,
    pivots: &[(Key, u64)],
    gt_child: u64,
    sizing: Sizing,
    max_entries: u8,
) -> Result<Vec<u8>> {
    if pivots.is_empty() {
        return Err(ArborError::Internal("node must carry at least one pivot".to_string()));
    }
    if pivots.len() > 255 {
        return Err(ArborError::Internal(format!(
            "node with {} pivots exceeds 255",
            pivots.len()
        )));
    }

    let mut body = Vec::new();
    body.push(pivots.len() as u8);
    for (key, child) in pivots {
        key.serialize(&mut body)?;
        // Base is the first byte after the 6-byte offset field.
        let field_end = node_offset + RECORD_BODY_OFFSET + body.len() as u64 + LARGE_OFFSET_SIZE as u64;
        let rel = offset::relative_to(field_end, *child);
        body.extend_from_slice(&offset::encode_large(rel)?);
    }
    let field_end = node_offset + RECORD_BODY_OFFSET + body.len() as u64 + LARGE_OFFSET_SIZE as u64;
    let rel = offset::relative_to(field_end, gt_child);
    body.extend_from_slice(&offset::encode_large(rel)?);

    finish_record(LeafFlags::empty(), body, sizing, max_entries, pivots.len())
}

/// Sizing strategy for a leaf's ext_data region.
#[derive(Debug, Clone, Copy)]
pub enum ExtSizing {
    /// Fresh spills only; pad the region with 10% of its used length.
    Auto,
    /// Fresh spills only; pad the region to exactly this length. Fails
    /// with `NoSpace` when the blocks alone exceed it.
    PadTo(u32),
    /// Entries reference an existing region that stays untouched; fresh
    /// spills are an error.
    Keep(ExtRegionSpec),
}

/// Builds a leaf record image plus its ext_data region.
///
/// Entries whose inline section exceeds the tree's inline budget spill into
/// ext_data blocks laid out sequentially in the ext region; entries already
/// referencing an ext block keep their pointer untouched.
pub fn build_leaf(
    ctx: &LayoutContext,
    leaf_offset: u64,
    prev: Option<u64>,
    next: Option<u64>,
    entries: &[LeafEntryData],
    sizing: Sizing,
    ext_sizing: ExtSizing,
) -> Result<LeafImage> {
    if entries.len() > 255 {
        return Err(ArborError::Internal(format!(
            "leaf with {} entries exceeds 255",
            entries.len()
        )));
    }

    // First pass: encode sections and assign ext pointers for fresh spills.
    let mut ext_region = Vec::new();
    let mut encoded: Vec<EncodedEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        let key_bytes = entry.key.to_vec()?;
        match &entry.values {
            ValueList::Ext { count, ptr } => {
                encoded.push(EncodedEntry::Ext {
                    key_bytes,
                    count: *count,
                    ptr: *ptr,
                });
            }
            ValueList::Inline(values) => {
                let section = ctx.serialize_value_section(values)?;
                if section.len() > ctx.max_inline_section() {
                    let raw = ctx.serialize_values_raw(values)?;
                    let ptr = append_ext_block(&mut ext_region, &raw)?;
                    encoded.push(EncodedEntry::Ext {
                        key_bytes,
                        count: values.len() as u32,
                        ptr,
                    });
                } else {
                    encoded.push(EncodedEntry::Inline { key_bytes, section });
                }
            }
        }
    }

    let fresh_ext = !ext_region.is_empty();

    let (has_ext, ext_len, ext_free) = match ext_sizing {
        ExtSizing::Keep(spec) => {
            if fresh_ext {
                return Err(ArborError::Internal(
                    "cannot mix fresh spills with a preserved ext region".to_string(),
                ));
            }
            (true, spec.length, spec.free)
        }
        ExtSizing::Auto => {
            if fresh_ext {
                // Pad the fresh ext region for later growth.
                let used = ext_region.len() as u32;
                let free = used / 10;
                ext_region.resize((used + free) as usize, 0);
                (true, used + free, free)
            } else {
                (false, 0, 0)
            }
        }
        ExtSizing::PadTo(target) => {
            let used = ext_region.len() as u32;
            if used > target {
                return Err(ArborError::NoSpace {
                    requested: u64::from(used),
                    available: u64::from(target),
                });
            }
            let free = target - used;
            ext_region.resize(target as usize, 0);
            (true, target, free)
        }
    };

    // Second pass: serialize the body.
    let mut body = Vec::new();
    // prev/next go in after sizing; reserve their slots with the ext fields.
    if has_ext {
        body.extend_from_slice(&ext_len.to_be_bytes());
        body.extend_from_slice(&ext_free.to_be_bytes());
    }
    body.push(encoded.len() as u8);
    for entry in &encoded {
        match entry {
            EncodedEntry::Inline { key_bytes, section } => {
                body.extend_from_slice(key_bytes);
                if ctx.small_leaves {
                    body.push(section.len() as u8);
                } else {
                    body.push(0);
                    body.extend_from_slice(&(section.len() as u32).to_be_bytes());
                }
                body.extend_from_slice(section);
            }
            EncodedEntry::Ext { key_bytes, count, ptr } => {
                body.extend_from_slice(key_bytes);
                if ctx.small_leaves {
                    body.push(EXT_DATA_MARKER);
                } else {
                    body.push(1);
                    body.extend_from_slice(&8u32.to_be_bytes());
                }
                body.extend_from_slice(&count.to_be_bytes());
                body.extend_from_slice(&ptr.to_be_bytes());
            }
        }
    }

    // Neighbor pointers precede the (optional) ext fields and the body.
    let mut full_body = Vec::with_capacity(2 * LARGE_OFFSET_SIZE + body.len());
    let prev_base = leaf_offset + LEAF_PREV_OFFSET;
    let next_base = leaf_offset + LEAF_NEXT_OFFSET;
    full_body.extend_from_slice(&offset::encode_large(
        prev.map_or(0, |abs| offset::relative_to(prev_base, abs)),
    )?);
    full_body.extend_from_slice(&offset::encode_large(
        next.map_or(0, |abs| offset::relative_to(next_base, abs)),
    )?);
    full_body.extend_from_slice(&body);

    let mut flags = LeafFlags::empty();
    flags.set(LeafFlags::IS_LEAF, true);
    flags.set(LeafFlags::HAS_EXT_DATA, has_ext);

    let record = finish_record(flags, full_body, sizing, ctx.max_entries, entries.len())?;
    Ok(LeafImage { record, ext_region })
}

/// Size and free-tail of a leaf's preserved ext region.
#[derive(Debug, Clone, Copy)]
pub struct ExtRegionSpec {
    /// Total region length.
    pub length: u32,
    /// Free bytes at the end of the region.
    pub free: u32,
}

enum EncodedEntry {
    Inline { key_bytes: Vec<u8>, section: Vec<u8> },
    Ext { key_bytes: Vec<u8>, count: u32, ptr: u32 },
}

/// Appends an ext_data block for `raw` value bytes, returning its offset
/// within the region. Blocks reserve half their data length again as free
/// space for later `add_value` appends.
fn append_ext_block(region: &mut Vec<u8>, raw: &[u8]) -> Result<u32> {
    let ptr = region.len() as u32;
    let free = (raw.len() / 2) as u32;
    let block_len = EXT_BLOCK_HEADER_SIZE as u32 + raw.len() as u32 + free;
    region.extend_from_slice(&block_len.to_be_bytes());
    region.extend_from_slice(&free.to_be_bytes());
    region.extend_from_slice(&0u32.to_be_bytes()); // reserved forward pointer
    region.extend_from_slice(raw);
    region.resize(region.len() + free as usize, 0);
    Ok(ptr)
}

/// Builds a standalone ext_data block image.
pub fn build_ext_block(raw: &[u8], free: u32) -> Vec<u8> {
    let block_len = EXT_BLOCK_HEADER_SIZE as u32 + raw.len() as u32 + free;
    let mut out = Vec::with_capacity(block_len as usize);
    out.extend_from_slice(&block_len.to_be_bytes());
    out.extend_from_slice(&free.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(raw);
    out.resize(block_len as usize, 0);
    out
}

/// Completes a record: length field, flags, free length, body, padding.
fn finish_record(
    flags: LeafFlags,
    body: Vec<u8>,
    sizing: Sizing,
    max_entries: u8,
    entry_count: usize,
) -> Result<Vec<u8>> {
    let head_len = RECORD_BODY_OFFSET as usize; // length + flags + free length
    let base_len = head_len + body.len();

    let free = match sizing {
        Sizing::Compact => 0usize,
        Sizing::Padded => {
            let remaining = (max_entries as usize).saturating_sub(entry_count);
            if remaining == 0 {
                0
            } else if entry_count == 0 {
                // Nothing to average over; assume modest entries.
                remaining * ASSUMED_ENTRY_SIZE
            } else {
                let avg = body.len() as f64 / entry_count as f64;
                (remaining as f64 * avg * PADDING_FACTOR).ceil() as usize
            }
        }
        Sizing::Exact(target) => {
            let target = target as usize;
            if base_len > target {
                return Err(ArborError::NoSpace {
                    requested: base_len as u64,
                    available: target as u64,
                });
            }
            target - base_len
        }
    };

    let total = base_len + free;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.push(flags.0);
    out.extend_from_slice(&(free as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out.resize(total, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_common::offset::decode_large;

    fn ctx() -> LayoutContext {
        LayoutContext {
            unique: true,
            small_leaves: true,
            metadata_count: 0,
            max_entries: 4,
        }
    }

    #[test]
    fn test_tree_flags_bits() {
        let mut flags = TreeFlags::empty();
        assert!(!flags.has(TreeFlags::UNIQUE));
        flags.set(TreeFlags::UNIQUE, true);
        flags.set(TreeFlags::SMALL_LEAFS, true);
        assert!(flags.has(TreeFlags::UNIQUE));
        assert!(flags.has(TreeFlags::SMALL_LEAFS));
        assert!(!flags.has(TreeFlags::METADATA));
        flags.set(TreeFlags::UNIQUE, false);
        assert!(!flags.has(TreeFlags::UNIQUE));
    }

    #[test]
    fn test_header_roundtrip_minimal() {
        let header = TreeHeader {
            byte_length: 4096,
            flags: TreeFlags(TreeFlags::UNIQUE | TreeFlags::SMALL_LEAFS | TreeFlags::LARGE_PTRS),
            max_entries: 255,
            fill_factor: None,
            free_bytes: None,
            metadata_keys: Vec::new(),
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), header.serialized_len());
        let parsed = TreeHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_roundtrip_full() {
        let header = TreeHeader {
            byte_length: 1 << 20,
            flags: TreeFlags(
                TreeFlags::UNIQUE
                    | TreeFlags::METADATA
                    | TreeFlags::FREE_SPACE
                    | TreeFlags::FILL_FACTOR
                    | TreeFlags::SMALL_LEAFS
                    | TreeFlags::LARGE_PTRS,
            ),
            max_entries: 100,
            fill_factor: Some(95),
            free_bytes: Some(2048),
            metadata_keys: vec!["created".to_string(), "rev".to_string()],
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), header.serialized_len());
        let parsed = TreeHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_free_bytes_field_offset() {
        let options = TreeOptions::default();
        let header = TreeHeader::from_options(&options);
        // length(4) + flags(1) + max(1) + fill(1) = 7
        assert_eq!(header.free_bytes_field_offset(), Some(7));
    }

    #[test]
    fn test_node_record_offsets_resolve() {
        let node_offset = 100u64;
        let pivots = vec![(Key::from("m"), 500u64)];
        let record = build_node(node_offset, &pivots, 900, Sizing::Compact, 4).unwrap();

        // Parse by hand: skip length(4) + flags(1) + free(4) + count(1).
        let flags = LeafFlags(record[4]);
        assert!(!flags.has(LeafFlags::IS_LEAF));
        assert_eq!(record[9], 1);

        let mut at = 10usize;
        let (key, n) = Key::deserialize(&record[at..]).unwrap();
        assert_eq!(key, Key::from("m"));
        at += n;

        let mut lt = [0u8; 6];
        lt.copy_from_slice(&record[at..at + 6]);
        let base = node_offset + at as u64 + 6;
        assert_eq!(base as i64 + decode_large(&lt), 500);
        at += 6;

        let mut gt = [0u8; 6];
        gt.copy_from_slice(&record[at..at + 6]);
        let base = node_offset + at as u64 + 6;
        assert_eq!(base as i64 + decode_large(&gt), 900);
    }

    #[test]
    fn test_record_length_field_covers_padding() {
        let pivots = vec![(Key::from(1.0), 200u64)];
        let record = build_node(0, &pivots, 300, Sizing::Padded, 10).unwrap();
        let total = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        assert_eq!(total as usize, record.len());
        let free = u32::from_be_bytes([record[5], record[6], record[7], record[8]]);
        assert!(free > 0, "padded record should carry free bytes");
    }

    #[test]
    fn test_exact_sizing_no_space() {
        let pivots = vec![(Key::from("a-long-enough-key"), 200u64)];
        let err = build_node(0, &pivots, 300, Sizing::Exact(10), 4).unwrap_err();
        assert!(err.is_no_space());
    }

    #[test]
    fn test_leaf_neighbor_pointers() {
        let leaf_offset = 1000u64;
        let entries = vec![LeafEntryData {
            key: Key::from("a"),
            values: ValueList::Inline(vec![EntryValue::new(vec![1])]),
        }];
        let image = build_leaf(
            &ctx(),
            leaf_offset,
            Some(400),
            Some(2000),
            &entries,
            Sizing::Compact,
            ExtSizing::Auto,
        )
        .unwrap();
        assert!(image.ext_region.is_empty());

        let flags = LeafFlags(image.record[4]);
        assert!(flags.has(LeafFlags::IS_LEAF));
        assert!(!flags.has(LeafFlags::HAS_EXT_DATA));

        let mut prev = [0u8; 6];
        prev.copy_from_slice(&image.record[9..15]);
        assert_eq!((leaf_offset + 9) as i64 + decode_large(&prev), 400);

        let mut next = [0u8; 6];
        next.copy_from_slice(&image.record[15..21]);
        assert_eq!((leaf_offset + 15) as i64 + decode_large(&next), 2000);
    }

    #[test]
    fn test_leaf_zero_pointers_mean_none() {
        let entries = vec![LeafEntryData {
            key: Key::from("a"),
            values: ValueList::Inline(vec![EntryValue::new(vec![1])]),
        }];
        let image = build_leaf(&ctx(), 0, None, None, &entries, Sizing::Compact, ExtSizing::Auto).unwrap();
        assert_eq!(&image.record[9..15], &[0u8; 6]);
        assert_eq!(&image.record[15..21], &[0u8; 6]);
    }

    #[test]
    fn test_leaf_spills_oversized_section() {
        // Non-unique, 150-byte record pointers blow the 127-byte budget.
        let ctx = LayoutContext {
            unique: false,
            small_leaves: true,
            metadata_count: 0,
            max_entries: 4,
        };
        let entries = vec![LeafEntryData {
            key: Key::from("big"),
            values: ValueList::Inline(vec![EntryValue::new(vec![7u8; 150])]),
        }];
        let image = build_leaf(&ctx, 0, None, None, &entries, Sizing::Compact, ExtSizing::Auto).unwrap();

        let flags = LeafFlags(image.record[4]);
        assert!(flags.has(LeafFlags::HAS_EXT_DATA));
        assert!(!image.ext_region.is_empty());

        // Block header at region start: length, free, reserved.
        let block_len = u32::from_be_bytes([
            image.ext_region[0],
            image.ext_region[1],
            image.ext_region[2],
            image.ext_region[3],
        ]);
        let free = u32::from_be_bytes([
            image.ext_region[4],
            image.ext_region[5],
            image.ext_region[6],
            image.ext_region[7],
        ]);
        // raw = 1 len byte + 150 pointer bytes = 151; free = 75.
        assert_eq!(block_len, 12 + 151 + 75);
        assert_eq!(free, 75);
    }

    #[test]
    fn test_value_section_unique_vs_multi() {
        let unique_ctx = ctx();
        let section = unique_ctx
            .serialize_value_section(&[EntryValue::new(vec![9])])
            .unwrap();
        // rp_len(1) + rp(1), no count prefix.
        assert_eq!(section.len(), 2);
        let parsed = unique_ctx.parse_value_section(&section).unwrap();
        assert_eq!(parsed.len(), 1);

        let multi_ctx = LayoutContext {
            unique: false,
            ..ctx()
        };
        let section = multi_ctx
            .serialize_value_section(&[EntryValue::new(vec![1]), EntryValue::new(vec![2])])
            .unwrap();
        // count(4) + 2 * (rp_len + rp).
        assert_eq!(section.len(), 8);
        let parsed = multi_ctx.parse_value_section(&section).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].record_pointer.as_ref(), &[2]);
    }

    #[test]
    fn test_ext_block_image() {
        let block = build_ext_block(&[1, 2, 3], 5);
        assert_eq!(block.len(), 12 + 3 + 5);
        let len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        assert_eq!(len as usize, block.len());
        assert_eq!(&block[12..15], &[1, 2, 3]);
    }
}
