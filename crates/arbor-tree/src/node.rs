//! Record parsing and tree navigation.
//!
//! Nodes are referenced by their byte offset in the backing region, never
//! by owning pointers; a parsed record borrows nothing and carries the
//! absolute positions needed to patch it later (child-pointer fields,
//! neighbor fields). The is-leaf flag bit selects the record variant.

use crate::layout::{
    LayoutContext, LeafFlags, ValueList, EXT_DATA_MARKER, LEAF_NEXT_OFFSET, LEAF_PREV_OFFSET,
    RECORD_BODY_OFFSET,
};
use arbor_common::offset::{self, LARGE_OFFSET_SIZE};
use arbor_common::{ArborError, Key, Result};
use arbor_io::BlockReader;

/// Upper bound on descent depth; a deeper walk means a pointer cycle.
const MAX_DEPTH: usize = 64;

/// One pivot of an internal node.
#[derive(Debug, Clone)]
pub struct Pivot {
    /// The pivot key; the lt child holds keys strictly below it.
    pub key: Key,
    /// Absolute offset of the lt child record.
    pub child: u64,
    /// Absolute position of this pivot's 6-byte child-offset field.
    pub child_field_pos: u64,
}

/// A parsed internal node.
#[derive(Debug, Clone)]
pub struct InternalNode {
    /// Absolute record offset.
    pub offset: u64,
    /// Record length, free padding included.
    pub byte_length: u32,
    /// Trailing free bytes inside the record.
    pub free_bytes: u32,
    /// Pivots in strictly increasing key order.
    pub pivots: Vec<Pivot>,
    /// Absolute offset of the greater-than-or-equal child record.
    pub gt_child: u64,
    /// Absolute position of the gt-child offset field.
    pub gt_field_pos: u64,
}

impl InternalNode {
    /// Picks the child covering `key`: the lt child of the first pivot
    /// whose key is greater than `key`, else the gt child. Returns the
    /// child offset, the field position pointing at it, and the pivot
    /// index (`None` for the gt child).
    pub fn child_for(&self, key: &Key) -> (u64, u64, Option<usize>) {
        for (i, pivot) in self.pivots.iter().enumerate() {
            if pivot.key > *key {
                return (pivot.child, pivot.child_field_pos, Some(i));
            }
        }
        (self.gt_child, self.gt_field_pos, None)
    }
}

/// One entry of a parsed leaf.
#[derive(Debug, Clone)]
pub struct LeafEntry {
    /// The entry key.
    pub key: Key,
    /// Inline values or an ext_data reference.
    pub values: ValueList,
    /// Absolute position of the entry's value-length byte.
    pub val_pos: u64,
}

impl LeafEntry {
    /// Total number of values, ext_data included.
    pub fn total_values(&self) -> u64 {
        self.values.total()
    }

    /// Absolute position of the 4-byte value count of an ext_data entry.
    /// Only meaningful for `ValueList::Ext` entries.
    pub fn ext_count_field_pos(&self, small_leaves: bool) -> u64 {
        if small_leaves {
            self.val_pos + 1
        } else {
            self.val_pos + 5
        }
    }

    /// Absolute position of the 4-byte ext_data pointer of an ext_data
    /// entry. Only meaningful for `ValueList::Ext` entries.
    pub fn ext_ptr_field_pos(&self, small_leaves: bool) -> u64 {
        self.ext_count_field_pos(small_leaves) + 4
    }
}

/// Size bookkeeping of a leaf's ext_data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtRegionInfo {
    /// Region length in bytes.
    pub length: u32,
    /// Free bytes at the region's end, available for new blocks.
    pub free: u32,
}

/// A parsed leaf record.
#[derive(Debug, Clone)]
pub struct LeafRecord {
    /// Absolute record offset.
    pub offset: u64,
    /// Record length, free padding included, ext region excluded.
    pub byte_length: u32,
    /// Trailing free bytes inside the record.
    pub free_bytes: u32,
    /// Absolute offset of the previous leaf, if any.
    pub prev: Option<u64>,
    /// Absolute offset of the next leaf, if any.
    pub next: Option<u64>,
    /// Ext_data region bookkeeping, when present.
    pub ext: Option<ExtRegionInfo>,
    /// Entries in strictly increasing key order.
    pub entries: Vec<LeafEntry>,
}

impl LeafRecord {
    /// Start of the ext_data region (first byte after the record).
    pub fn ext_region_start(&self) -> u64 {
        self.offset + u64::from(self.byte_length)
    }

    /// Total on-disk footprint: record plus ext region.
    pub fn total_length(&self) -> u64 {
        u64::from(self.byte_length) + self.ext.map_or(0, |e| u64::from(e.length))
    }

    /// Absolute position of this leaf's prev-pointer field.
    pub fn prev_field_pos(&self) -> u64 {
        self.offset + LEAF_PREV_OFFSET
    }

    /// Absolute position of this leaf's next-pointer field.
    pub fn next_field_pos(&self) -> u64 {
        self.offset + LEAF_NEXT_OFFSET
    }

    /// Binary-searches for `key`. `Ok(i)` when present, `Err(i)` with the
    /// insertion index otherwise.
    pub fn find_entry(&self, key: &Key) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.compare(key))
    }
}

/// A record parsed at some offset, discriminated by the is-leaf flag.
#[derive(Debug, Clone)]
pub enum NodeRecord {
    /// Internal node with pivots.
    Internal(InternalNode),
    /// Leaf with entries.
    Leaf(LeafRecord),
}

/// One step of a root-to-leaf descent.
#[derive(Debug, Clone)]
pub struct PathItem {
    /// The traversed internal node.
    pub node: InternalNode,
    /// Absolute position of the child-offset field descended through.
    pub child_field_pos: u64,
    /// Pivot index descended through; `None` means the gt child.
    pub pivot_index: Option<usize>,
}

/// Parses the record at `offset`.
pub fn parse_record(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    record_offset: u64,
) -> Result<NodeRecord> {
    reader.seek(record_offset);
    let byte_length = reader.get_u32()?;
    let flags = LeafFlags(reader.get_u8()?);
    let free_bytes = reader.get_u32()?;

    if byte_length < RECORD_BODY_OFFSET as u32 {
        return Err(ArborError::Corrupted {
            offset: record_offset,
            reason: format!("record length {byte_length} below header size"),
        });
    }

    if flags.has(LeafFlags::IS_LEAF) {
        parse_leaf_body(reader, ctx, record_offset, byte_length, free_bytes, flags)
            .map(NodeRecord::Leaf)
    } else {
        parse_node_body(reader, record_offset, byte_length, free_bytes).map(NodeRecord::Internal)
    }
}

fn parse_node_body(
    reader: &mut BlockReader,
    record_offset: u64,
    byte_length: u32,
    free_bytes: u32,
) -> Result<InternalNode> {
    let entry_count = reader.get_u8()? as usize;
    if entry_count == 0 {
        return Err(ArborError::Corrupted {
            offset: record_offset,
            reason: "internal node with zero pivots".to_string(),
        });
    }

    let mut pivots = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let key = reader.get_value()?;
        let field_pos = reader.position();
        let raw = reader.get(LARGE_OFFSET_SIZE)?;
        let rel = offset::decode(&raw)?;
        let child = offset::resolve(field_pos + LARGE_OFFSET_SIZE as u64, rel).ok_or(
            ArborError::Corrupted {
                offset: field_pos,
                reason: "pivot with zero child offset".to_string(),
            },
        )?;
        pivots.push(Pivot {
            key,
            child,
            child_field_pos: field_pos,
        });
    }

    let gt_field_pos = reader.position();
    let raw = reader.get(LARGE_OFFSET_SIZE)?;
    let rel = offset::decode(&raw)?;
    let gt_child = offset::resolve(gt_field_pos + LARGE_OFFSET_SIZE as u64, rel).ok_or(
        ArborError::Corrupted {
            offset: gt_field_pos,
            reason: "node with zero gt-child offset".to_string(),
        },
    )?;

    Ok(InternalNode {
        offset: record_offset,
        byte_length,
        free_bytes,
        pivots,
        gt_child,
        gt_field_pos,
    })
}

fn parse_leaf_body(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    record_offset: u64,
    byte_length: u32,
    free_bytes: u32,
    flags: LeafFlags,
) -> Result<LeafRecord> {
    let prev_field = reader.position();
    let raw = reader.get(LARGE_OFFSET_SIZE)?;
    let prev = offset::resolve(prev_field, offset::decode(&raw)?);

    let next_field = reader.position();
    let raw = reader.get(LARGE_OFFSET_SIZE)?;
    let next = offset::resolve(next_field, offset::decode(&raw)?);

    let ext = if flags.has(LeafFlags::HAS_EXT_DATA) {
        let length = reader.get_u32()?;
        let free = reader.get_u32()?;
        Some(ExtRegionInfo { length, free })
    } else {
        None
    };

    let entry_count = reader.get_u8()? as usize;
    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let key = reader.get_value()?;
        let val_pos = reader.position();
        let values = if ctx.small_leaves {
            let val_info = reader.get_u8()?;
            if val_info & EXT_DATA_MARKER != 0 {
                let count = reader.get_u32()?;
                let ptr = reader.get_u32()?;
                ValueList::Ext { count, ptr }
            } else {
                let section = reader.get(val_info as usize)?;
                ValueList::Inline(ctx.parse_value_section(&section)?)
            }
        } else {
            let marker = reader.get_u8()?;
            let val_length = reader.get_u32()? as usize;
            if marker != 0 {
                let count = reader.get_u32()?;
                let ptr = reader.get_u32()?;
                ValueList::Ext { count, ptr }
            } else {
                let section = reader.get(val_length)?;
                ValueList::Inline(ctx.parse_value_section(&section)?)
            }
        };
        entries.push(LeafEntry { key, values, val_pos });
    }

    Ok(LeafRecord {
        offset: record_offset,
        byte_length,
        free_bytes,
        prev,
        next,
        ext,
        entries,
    })
}

/// Parses the record at `offset`, requiring a leaf.
pub fn parse_leaf(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    record_offset: u64,
) -> Result<LeafRecord> {
    match parse_record(reader, ctx, record_offset)? {
        NodeRecord::Leaf(leaf) => Ok(leaf),
        NodeRecord::Internal(_) => Err(ArborError::Corrupted {
            offset: record_offset,
            reason: "expected a leaf record".to_string(),
        }),
    }
}

/// Descends from the root to the leaf covering `key`, recording the path.
pub fn find_leaf(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    root: u64,
    key: &Key,
) -> Result<(LeafRecord, Vec<PathItem>)> {
    let mut path = Vec::new();
    let mut current = root;
    for _ in 0..MAX_DEPTH {
        match parse_record(reader, ctx, current)? {
            NodeRecord::Leaf(leaf) => return Ok((leaf, path)),
            NodeRecord::Internal(node) => {
                let (child, child_field_pos, pivot_index) = node.child_for(key);
                path.push(PathItem {
                    node,
                    child_field_pos,
                    pivot_index,
                });
                current = child;
            }
        }
    }
    Err(ArborError::Corrupted {
        offset: current,
        reason: format!("descent exceeded {MAX_DEPTH} levels"),
    })
}

/// Descends to the leftmost leaf.
pub fn first_leaf(reader: &mut BlockReader, ctx: &LayoutContext, root: u64) -> Result<LeafRecord> {
    let mut current = root;
    for _ in 0..MAX_DEPTH {
        match parse_record(reader, ctx, current)? {
            NodeRecord::Leaf(leaf) => return Ok(leaf),
            NodeRecord::Internal(node) => current = node.pivots[0].child,
        }
    }
    Err(ArborError::Corrupted {
        offset: current,
        reason: format!("descent exceeded {MAX_DEPTH} levels"),
    })
}

/// Descends to the rightmost leaf.
pub fn last_leaf(reader: &mut BlockReader, ctx: &LayoutContext, root: u64) -> Result<LeafRecord> {
    let mut current = root;
    for _ in 0..MAX_DEPTH {
        match parse_record(reader, ctx, current)? {
            NodeRecord::Leaf(leaf) => return Ok(leaf),
            NodeRecord::Internal(node) => current = node.gt_child,
        }
    }
    Err(ArborError::Corrupted {
        offset: current,
        reason: format!("descent exceeded {MAX_DEPTH} levels"),
    })
}

/// Follows the linked list to the next leaf, if any.
pub fn next_leaf(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
) -> Result<Option<LeafRecord>> {
    match leaf.next {
        Some(at) => parse_leaf(reader, ctx, at).map(Some),
        None => Ok(None),
    }
}

/// Follows the linked list to the previous leaf, if any.
pub fn prev_leaf(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    leaf: &LeafRecord,
) -> Result<Option<LeafRecord>> {
    match leaf.prev {
        Some(at) => parse_leaf(reader, ctx, at).map(Some),
        None => Ok(None),
    }
}
