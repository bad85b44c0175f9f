//! In-place mutation: add, remove, update, leaf rebuild, leaf split.
//!
//! The fast path rewrites the located leaf inside its reserved byte range.
//! When the new image no longer fits, the leaf is rebuilt into a freshly
//! allocated, grown region and every incoming pointer (neighbors, parent
//! child offset) is patched transactionally. When the entry count exceeds
//! the node maximum, the leaf splits: the upper half moves to a new
//! sibling and the parent gains a pivot. Parent nodes never split; a full
//! parent surfaces `RebuildRequired` and the caller rebuilds the tree.

use crate::alloc::{FreeSpaceTable, Region};
use crate::extdata;
use crate::layout::{
    build_leaf, build_node, ExtRegionSpec, ExtSizing, LayoutContext, LeafEntryData, Sizing,
    ValueList,
};
use crate::node::{self, LeafRecord, PathItem};
use crate::txn::Transaction;
use arbor_common::offset::{self, LARGE_OFFSET_SIZE};
use arbor_common::{ArborError, EntryValue, Key, RecordPointer, Result};
use arbor_io::{BlockReader, BlockWriter};
use tracing::debug;

/// Growth factor applied when a leaf is rebuilt because it ran out of room.
const GROW_FACTOR: f64 = 1.1;

/// Everything a mutation needs, bundled for the transaction engine.
pub struct TreeAccess<'t> {
    /// Reader over the tree region.
    pub reader: &'t mut BlockReader,
    /// Writer over the same region.
    pub writer: &'t mut BlockWriter,
    /// Encoding parameters.
    pub ctx: LayoutContext,
    /// Root record offset.
    pub root: u64,
    /// The tree's allocator.
    pub alloc: &'t mut FreeSpaceTable,
}

impl<'t> TreeAccess<'t> {
    fn max_entries(&self) -> usize {
        self.ctx.max_entries as usize
    }
}

/// Adds a value under `key`.
pub fn add(access: &mut TreeAccess<'_>, key: &Key, value: EntryValue) -> Result<()> {
    let (leaf, path) = node::find_leaf(access.reader, &access.ctx, access.root, key)?;

    match leaf.find_entry(key) {
        Ok(at) => {
            if access.ctx.unique {
                return Err(ArborError::DuplicateKey);
            }
            add_to_existing(access, leaf, path, at, value)
        }
        Err(at) => {
            let mut entries = to_entry_data(&leaf);
            entries.insert(
                at,
                LeafEntryData {
                    key: key.clone(),
                    values: ValueList::Inline(vec![value]),
                },
            );
            if entries.len() <= access.max_entries() {
                write_back(access, &leaf, &path, entries)
            } else {
                debug!(key = %key, leaf = leaf.offset, "leaf over capacity, splitting");
                let materialized = materialize(access, &leaf, entries)?;
                split_leaf(access, &leaf, &path, materialized)
            }
        }
    }
}

/// Appends a value to an already-present key of a non-unique tree.
fn add_to_existing(
    access: &mut TreeAccess<'_>,
    leaf: LeafRecord,
    path: Vec<PathItem>,
    at: usize,
    value: EntryValue,
) -> Result<()> {
    match leaf.entries[at].values.clone() {
        ValueList::Ext { .. } => {
            let entry = leaf.entries[at].clone();
            match extdata::add_value(access.reader, access.writer, &access.ctx, &leaf, &entry, &value)
            {
                Ok(()) => Ok(()),
                Err(err) if err.is_no_space() => {
                    debug!(leaf = leaf.offset, "ext_data block full, rebuilding leaf");
                    let mut entries = materialize(access, &leaf, to_entry_data(&leaf))?;
                    push_value(&mut entries[at], value);
                    rebuild_leaf(access, &leaf, &path, entries, false, true)
                }
                Err(err) => Err(err),
            }
        }
        ValueList::Inline(mut values) => {
            values.push(value);
            let section_len = access.ctx.serialize_value_section(&values)?.len();
            let mut entries = to_entry_data(&leaf);

            if section_len <= access.ctx.max_inline_section() {
                entries[at].values = ValueList::Inline(values);
                return write_back(access, &leaf, &path, entries);
            }

            // The grown list no longer fits inline and must spill.
            if leaf.ext.is_some() {
                match extdata::append_block(access.writer, &access.ctx, &leaf, &values) {
                    Ok((ptr, spec)) => {
                        entries[at].values = ValueList::Ext {
                            count: values.len() as u32,
                            ptr,
                        };
                        return rewrite_in_place(access, &leaf, &entries, Some(spec));
                    }
                    Err(err) if err.is_no_space() => {}
                    Err(err) => return Err(err),
                }
            }
            debug!(leaf = leaf.offset, "value list spilling, rebuilding leaf");
            let mut materialized = materialize(access, &leaf, entries)?;
            materialized[at].values = ValueList::Inline(values);
            rebuild_leaf(access, &leaf, &path, materialized, false, true)
        }
    }
}

/// Removes an entry, or a single value of a non-unique entry.
pub fn remove(
    access: &mut TreeAccess<'_>,
    key: &Key,
    record_pointer: Option<&RecordPointer>,
) -> Result<()> {
    let (leaf, path) = node::find_leaf(access.reader, &access.ctx, access.root, key)?;
    let at = leaf.find_entry(key).map_err(|_| ArborError::KeyNotFound)?;
    let entry = leaf.entries[at].clone();

    let remove_whole = access.ctx.unique || record_pointer.is_none() || entry.total_values() == 1;
    if remove_whole {
        if let Some(rp) = record_pointer {
            // A pointer was named; it must actually be there.
            let values = entry_values(access, &leaf, &entry)?;
            if !values.iter().any(|v| v.record_pointer == *rp) {
                return Err(ArborError::ValueNotFound);
            }
        }
        let mut entries = to_entry_data(&leaf);
        entries.remove(at);
        return write_back(access, &leaf, &path, entries);
    }

    let rp = record_pointer.ok_or(ArborError::ValueNotFound)?;
    match entry.values.clone() {
        ValueList::Ext { .. } => {
            extdata::remove_value(access.reader, access.writer, &access.ctx, &leaf, &entry, rp)
        }
        ValueList::Inline(mut values) => {
            let pos = values
                .iter()
                .position(|v| v.record_pointer == *rp)
                .ok_or(ArborError::ValueNotFound)?;
            values.remove(pos);
            let mut entries = to_entry_data(&leaf);
            entries[at].values = ValueList::Inline(values);
            write_back(access, &leaf, &path, entries)
        }
    }
}

/// Replaces a value under `key`. For non-unique trees the value to replace
/// is selected by `current_pointer` (or inferred when only one exists).
pub fn update(
    access: &mut TreeAccess<'_>,
    key: &Key,
    replacement: EntryValue,
    current_pointer: Option<&RecordPointer>,
) -> Result<()> {
    let (leaf, path) = node::find_leaf(access.reader, &access.ctx, access.root, key)?;
    let at = leaf.find_entry(key).map_err(|_| ArborError::KeyNotFound)?;
    let entry = leaf.entries[at].clone();

    // Resolve which record pointer is being replaced.
    let current = match current_pointer {
        Some(rp) => rp.clone(),
        None => {
            if entry.total_values() != 1 {
                return Err(ArborError::ValueNotFound);
            }
            entry_values(access, &leaf, &entry)?[0].record_pointer.clone()
        }
    };

    match entry.values.clone() {
        ValueList::Ext { .. } => {
            match extdata::replace_value(
                access.reader,
                access.writer,
                &access.ctx,
                &leaf,
                &entry,
                &current,
                replacement.clone(),
            ) {
                Ok(()) => Ok(()),
                Err(err) if err.is_no_space() => {
                    let mut entries = materialize(access, &leaf, to_entry_data(&leaf))?;
                    replace_in(&mut entries[at], &current, replacement)?;
                    rebuild_leaf(access, &leaf, &path, entries, false, true)
                }
                Err(err) => Err(err),
            }
        }
        ValueList::Inline(mut values) => {
            let pos = values
                .iter()
                .position(|v| v.record_pointer == current)
                .ok_or(ArborError::ValueNotFound)?;
            values[pos] = replacement;
            let mut entries = to_entry_data(&leaf);
            entries[at].values = ValueList::Inline(values);
            write_back(access, &leaf, &path, entries)
        }
    }
}

/// Converts parsed leaf entries to build input, keeping ext references.
fn to_entry_data(leaf: &LeafRecord) -> Vec<LeafEntryData> {
    leaf.entries
        .iter()
        .map(|e| LeafEntryData {
            key: e.key.clone(),
            values: e.values.clone(),
        })
        .collect()
}

/// Loads the full value list of one parsed entry.
fn entry_values(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    entry: &node::LeafEntry,
) -> Result<Vec<EntryValue>> {
    match &entry.values {
        ValueList::Inline(values) => Ok(values.clone()),
        ValueList::Ext { .. } => extdata::load_values(access.reader, &access.ctx, leaf, entry),
    }
}

/// Resolves every ext reference in `entries` into inline values.
fn materialize(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    entries: Vec<LeafEntryData>,
) -> Result<Vec<LeafEntryData>> {
    entries
        .into_iter()
        .map(|entry| match entry.values {
            ValueList::Inline(_) => Ok(entry),
            ValueList::Ext { ptr, count } => {
                let parsed = leaf
                    .entries
                    .iter()
                    .find(|e| matches!(e.values, ValueList::Ext { ptr: p, .. } if p == ptr))
                    .ok_or_else(|| ArborError::Corrupted {
                        offset: leaf.offset,
                        reason: format!("dangling ext_data pointer {ptr} ({count} values)"),
                    })?;
                let values = extdata::load_values(access.reader, &access.ctx, leaf, parsed)?;
                Ok(LeafEntryData {
                    key: entry.key,
                    values: ValueList::Inline(values),
                })
            }
        })
        .collect()
}

fn push_value(entry: &mut LeafEntryData, value: EntryValue) {
    if let ValueList::Inline(values) = &mut entry.values {
        values.push(value);
    }
}

fn replace_in(entry: &mut LeafEntryData, current: &RecordPointer, replacement: EntryValue) -> Result<()> {
    if let ValueList::Inline(values) = &mut entry.values {
        let pos = values
            .iter()
            .position(|v| v.record_pointer == *current)
            .ok_or(ArborError::ValueNotFound)?;
        values[pos] = replacement;
    }
    Ok(())
}

/// Writes modified entries back into the leaf's reserved range, falling
/// back to a grown rebuild when they no longer fit.
fn write_back(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    path: &[PathItem],
    entries: Vec<LeafEntryData>,
) -> Result<()> {
    match rewrite_in_place(access, leaf, &entries, None) {
        Ok(()) => Ok(()),
        Err(err) if err.is_no_space() => {
            debug!(leaf = leaf.offset, "leaf body full, rebuilding into grown region");
            let materialized = materialize(access, leaf, entries)?;
            rebuild_leaf(access, leaf, path, materialized, true, false)
        }
        Err(err) => Err(err),
    }
}

/// Rewrites the leaf record at its current offset. The ext_data region, if
/// any, is preserved untouched (or updated to `ext_override` after a block
/// append). Fails with `NoSpace` when the body outgrows the record.
fn rewrite_in_place(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    entries: &[LeafEntryData],
    ext_override: Option<ExtRegionSpec>,
) -> Result<()> {
    let ext_sizing = match (ext_override, leaf.ext) {
        (Some(spec), _) => ExtSizing::Keep(spec),
        (None, Some(info)) => ExtSizing::Keep(ExtRegionSpec {
            length: info.length,
            free: info.free,
        }),
        (None, None) => ExtSizing::Auto,
    };
    let image = build_leaf(
        &access.ctx,
        leaf.offset,
        leaf.prev,
        leaf.next,
        entries,
        Sizing::Exact(leaf.byte_length),
        ext_sizing,
    )?;
    if leaf.ext.is_none() && !image.ext_region.is_empty() {
        // A fresh spill cannot be placed behind an in-place rewrite.
        return Err(ArborError::NoSpace {
            requested: image.ext_region.len() as u64,
            available: 0,
        });
    }

    let old = access
        .writer
        .source()
        .read_exact_at(leaf.offset, leaf.byte_length as usize)?;
    let record = image.record;
    let offset = leaf.offset;

    let mut tx: Transaction<TreeAccess<'_>> = Transaction::new();
    tx.step(
        "rewrite leaf record",
        move |a| a.writer.write_at(&record, offset),
        move |a| a.writer.write_at(&old, offset),
    );
    tx.run_sequential(access)
}

/// Encodes a pointer patch: 6 bytes based at `base` pointing at `target`.
fn pointer_patch(base: u64, target: u64) -> Result<[u8; LARGE_OFFSET_SIZE]> {
    offset::encode_large(offset::relative_to(base, target))
}

/// Rebuilds a leaf into a freshly allocated region, growing the record
/// and/or ext_data space, then patches neighbors and the parent. A root
/// leaf is relocated too: the root record is rewritten in place as a
/// single-pivot node whose both children reference the relocated leaf.
pub fn rebuild_leaf(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    path: &[PathItem],
    entries: Vec<LeafEntryData>,
    grow_data: bool,
    grow_ext: bool,
) -> Result<()> {
    // Measure the compact image to size the new region.
    let probe = build_leaf(
        &access.ctx,
        0,
        None,
        None,
        &entries,
        Sizing::Compact,
        ExtSizing::Auto,
    )?;
    let mut record_len = (probe.record.len() as u64).max(u64::from(leaf.byte_length));
    if grow_data {
        record_len = (record_len as f64 * GROW_FACTOR).ceil() as u64;
    }
    let old_ext_len = leaf.ext.map_or(0, |e| u64::from(e.length));
    let mut ext_len = (probe.ext_region.len() as u64).max(old_ext_len);
    if grow_ext {
        ext_len = (ext_len as f64 * GROW_FACTOR).ceil() as u64;
    }

    let region_len = record_len + ext_len;
    let new_offset = access.alloc.request(region_len, access.writer)?;
    debug!(
        from = leaf.offset,
        to = new_offset,
        record_len,
        ext_len,
        "rebuilding leaf"
    );

    let image = build_leaf(
        &access.ctx,
        new_offset,
        leaf.prev,
        leaf.next,
        &entries,
        Sizing::Exact(record_len as u32),
        if ext_len > 0 {
            ExtSizing::PadTo(ext_len as u32)
        } else {
            ExtSizing::Auto
        },
    )?;

    // A root leaf has no parent record to patch; its old footprint is
    // rewritten as a node instead of being released.
    let root_replacement = if path.is_empty() {
        let pivot_key = entries.first().map_or(Key::Undefined, |e| e.key.clone());
        match build_node(
            leaf.offset,
            &[(pivot_key, new_offset)],
            new_offset,
            Sizing::Exact(leaf.total_length() as u32),
            access.ctx.max_entries,
        ) {
            Ok(image) => Some(image),
            Err(err) if err.is_no_space() => {
                let region = Region {
                    offset: new_offset,
                    length: region_len,
                };
                access.alloc.release(region, access.writer)?;
                return Err(ArborError::RebuildRequired(
                    "root record too small to become an internal node".to_string(),
                ));
            }
            Err(err) => return Err(err),
        }
    } else {
        None
    };

    let mut tx: Transaction<TreeAccess<'_>> = Transaction::new();

    // 1. The new leaf image lands in the fresh region.
    let record = image.record;
    let ext_region = image.ext_region;
    let new_region = Region {
        offset: new_offset,
        length: region_len,
    };
    let record_end = new_offset + record.len() as u64;
    tx.step(
        "write relocated leaf",
        move |a| {
            a.writer.write_at(&record, new_offset)?;
            if !ext_region.is_empty() {
                a.writer.write_at(&ext_region, record_end)?;
            }
            Ok(())
        },
        move |a| a.alloc.release(new_region, a.writer),
    );

    // 2./3. Neighbors point at the relocated leaf.
    queue_neighbor_patches(access, &mut tx, leaf.prev, leaf.next, new_offset)?;

    match (root_replacement, path.last()) {
        (Some(root_image), _) => {
            // 4. The root record becomes a node referencing the new leaf.
            let old_root = access
                .writer
                .source()
                .read_exact_at(leaf.offset, leaf.total_length() as usize)?;
            let root_offset = leaf.offset;
            tx.step(
                "replace root leaf with node",
                move |a| a.writer.write_at(&root_image, root_offset),
                move |a| a.writer.write_at(&old_root, root_offset),
            );
        }
        (None, Some(parent)) => {
            // 4. Every parent field referencing the old leaf follows it. A
            // degenerate single-child parent (left behind by a root-leaf
            // rebuild) references it from both the pivot and the gt slot.
            let mut fields: Vec<u64> = parent
                .node
                .pivots
                .iter()
                .filter(|p| p.child == leaf.offset)
                .map(|p| p.child_field_pos)
                .collect();
            if parent.node.gt_child == leaf.offset {
                fields.push(parent.node.gt_field_pos);
            }
            for field_pos in fields {
                let patch = pointer_patch(field_pos + LARGE_OFFSET_SIZE as u64, new_offset)?;
                let old_field = access
                    .writer
                    .source()
                    .read_exact_at(field_pos, LARGE_OFFSET_SIZE)?;
                tx.step(
                    "patch parent child offset",
                    move |a| a.writer.write_at(&patch, field_pos),
                    move |a| a.writer.write_at(&old_field, field_pos),
                );
            }
        }
        (None, None) => unreachable!("root replacement exists when the path is empty"),
    }

    // 5. The old region returns to the allocator (unless the root record
    // was repurposed in place).
    if !path.is_empty() {
        let old_region = Region {
            offset: leaf.offset,
            length: leaf.total_length(),
        };
        tx.step_no_rollback("release old leaf region", move |a| {
            a.alloc.release(old_region, a.writer)
        });
    }

    tx.run_sequential(access)
}

/// Queues prev/next neighbor pointer patches toward `target`.
fn queue_neighbor_patches(
    access: &mut TreeAccess<'_>,
    tx: &mut Transaction<TreeAccess<'_>>,
    prev: Option<u64>,
    next: Option<u64>,
    target: u64,
) -> Result<()> {
    if let Some(prev_offset) = prev {
        let field_pos = prev_offset + crate::layout::LEAF_NEXT_OFFSET;
        let patch = pointer_patch(field_pos, target)?;
        let old = access
            .writer
            .source()
            .read_exact_at(field_pos, LARGE_OFFSET_SIZE)?;
        tx.step(
            "patch previous leaf next pointer",
            move |a| a.writer.write_at(&patch, field_pos),
            move |a| a.writer.write_at(&old, field_pos),
        );
    }
    if let Some(next_offset) = next {
        let field_pos = next_offset + crate::layout::LEAF_PREV_OFFSET;
        let patch = pointer_patch(field_pos, target)?;
        let old = access
            .writer
            .source()
            .read_exact_at(field_pos, LARGE_OFFSET_SIZE)?;
        tx.step(
            "patch next leaf prev pointer",
            move |a| a.writer.write_at(&patch, field_pos),
            move |a| a.writer.write_at(&old, field_pos),
        );
    }
    Ok(())
}

/// Splits an over-capacity leaf: the upper half moves to a new sibling and
/// the parent gains a pivot. Fails fast with `RebuildRequired` when the
/// parent cannot take another pivot (parent splitting is not implemented;
/// the caller must rebuild the tree).
pub fn split_leaf(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    path: &[PathItem],
    entries: Vec<LeafEntryData>,
) -> Result<()> {
    let mid = entries.len() / 2;
    let right_entries: Vec<LeafEntryData> = entries[mid..].to_vec();
    let left_entries: Vec<LeafEntryData> = entries[..mid].to_vec();
    let split_key = right_entries[0].key.clone();

    match path.last() {
        None => split_root(access, leaf, left_entries, right_entries, split_key),
        Some(parent_item) => {
            let parent = &parent_item.node;
            if parent.pivots.len() >= access.max_entries() {
                return Err(ArborError::RebuildRequired(
                    "parent node is full; leaf split needs a tree rebuild".to_string(),
                ));
            }

            // Size and allocate the right sibling.
            let probe = build_leaf(
                &access.ctx,
                0,
                None,
                None,
                &right_entries,
                Sizing::Padded,
                ExtSizing::Auto,
            )?;
            let right_len = probe.record.len() as u64 + probe.ext_region.len() as u64;
            let right_offset = access.alloc.request(right_len, access.writer)?;
            let right = build_leaf(
                &access.ctx,
                right_offset,
                Some(leaf.offset),
                leaf.next,
                &right_entries,
                Sizing::Exact(probe.record.len() as u32),
                if probe.ext_region.is_empty() {
                    ExtSizing::Auto
                } else {
                    ExtSizing::PadTo(probe.ext_region.len() as u32)
                },
            )?;

            // The left half tries to stay in place.
            let left_build = build_leaf(
                &access.ctx,
                leaf.offset,
                leaf.prev,
                Some(right_offset),
                &left_entries,
                Sizing::Exact(leaf.byte_length),
                match leaf.ext {
                    Some(info) => ExtSizing::PadTo(info.length),
                    None => ExtSizing::Auto,
                },
            );
            let left = match left_build {
                Ok(image) if leaf.ext.is_some() || image.ext_region.is_empty() => image,
                other => {
                    // The allocated sibling region must not leak.
                    let region = Region {
                        offset: right_offset,
                        length: right_len,
                    };
                    access.alloc.release(region, access.writer)?;
                    return match other {
                        Ok(_) => Err(ArborError::RebuildRequired(
                            "left half spills ext_data but the leaf has no ext region".to_string(),
                        )),
                        Err(err) => Err(err),
                    };
                }
            };

            // New pivot before the parent's old reference; the old
            // reference moves to the right sibling. A degenerate
            // single-child parent (both slots referencing this leaf, left
            // behind by a root-leaf rebuild) is rewritten wholesale.
            let degenerate = parent.gt_child == leaf.offset
                && parent.pivots.iter().all(|p| p.child == leaf.offset);
            let mut pivots: Vec<(Key, u64)>;
            let mut gt_child = parent.gt_child;
            if degenerate {
                pivots = vec![(split_key.clone(), leaf.offset)];
                gt_child = right_offset;
            } else {
                pivots = parent
                    .pivots
                    .iter()
                    .map(|p| (p.key.clone(), p.child))
                    .collect();
                match parent_item.pivot_index {
                    Some(i) => {
                        pivots[i].1 = right_offset;
                        pivots.insert(i, (split_key.clone(), leaf.offset));
                    }
                    None => {
                        pivots.push((split_key.clone(), leaf.offset));
                        gt_child = right_offset;
                    }
                }
            }
            let parent_image = match build_node(
                parent.offset,
                &pivots,
                gt_child,
                Sizing::Exact(parent.byte_length),
                access.ctx.max_entries,
            ) {
                Ok(image) => image,
                Err(err) if err.is_no_space() => {
                    // Release the sibling region before surfacing.
                    let region = Region {
                        offset: right_offset,
                        length: right_len,
                    };
                    access.alloc.release(region, access.writer)?;
                    return Err(ArborError::RebuildRequired(
                        "parent node has no room for another pivot".to_string(),
                    ));
                }
                Err(err) => return Err(err),
            };
            debug!(
                leaf = leaf.offset,
                sibling = right_offset,
                pivot = %split_key,
                "splitting leaf"
            );

            let mut tx: Transaction<TreeAccess<'_>> = Transaction::new();

            let right_record = right.record;
            let right_ext = right.ext_region;
            let right_record_end = right_offset + right_record.len() as u64;
            let right_region = Region {
                offset: right_offset,
                length: right_len,
            };
            tx.step(
                "write right sibling",
                move |a| {
                    a.writer.write_at(&right_record, right_offset)?;
                    if !right_ext.is_empty() {
                        a.writer.write_at(&right_ext, right_record_end)?;
                    }
                    Ok(())
                },
                move |a| a.alloc.release(right_region, a.writer),
            );

            let old_left = access
                .writer
                .source()
                .read_exact_at(leaf.offset, leaf.total_length() as usize)?;
            let left_record = left.record;
            let left_ext = left.ext_region;
            let left_offset = leaf.offset;
            let left_ext_at = leaf.offset + u64::from(leaf.byte_length);
            tx.step(
                "rewrite left half",
                move |a| {
                    a.writer.write_at(&left_record, left_offset)?;
                    if !left_ext.is_empty() {
                        a.writer.write_at(&left_ext, left_ext_at)?;
                    }
                    Ok(())
                },
                move |a| a.writer.write_at(&old_left, left_offset),
            );

            // The old next leaf now follows the right sibling.
            if let Some(next_offset) = leaf.next {
                let field_pos = next_offset + crate::layout::LEAF_PREV_OFFSET;
                let patch = pointer_patch(field_pos, right_offset)?;
                let old = access
                    .writer
                    .source()
                    .read_exact_at(field_pos, LARGE_OFFSET_SIZE)?;
                tx.step(
                    "patch next leaf prev pointer",
                    move |a| a.writer.write_at(&patch, field_pos),
                    move |a| a.writer.write_at(&old, field_pos),
                );
            }

            let old_parent = access
                .writer
                .source()
                .read_exact_at(parent.offset, parent.byte_length as usize)?;
            let parent_offset = parent.offset;
            tx.step(
                "insert parent pivot",
                move |a| a.writer.write_at(&parent_image, parent_offset),
                move |a| a.writer.write_at(&old_parent, parent_offset),
            );

            tx.run_parallel(access)
        }
    }
}

/// Splits the root leaf: both halves move to fresh regions and the root
/// record is rewritten in place as an internal node with one pivot.
fn split_root(
    access: &mut TreeAccess<'_>,
    leaf: &LeafRecord,
    left_entries: Vec<LeafEntryData>,
    right_entries: Vec<LeafEntryData>,
    split_key: Key,
) -> Result<()> {
    let left_probe = build_leaf(
        &access.ctx,
        0,
        None,
        None,
        &left_entries,
        Sizing::Padded,
        ExtSizing::Auto,
    )?;
    let right_probe = build_leaf(
        &access.ctx,
        0,
        None,
        None,
        &right_entries,
        Sizing::Padded,
        ExtSizing::Auto,
    )?;
    let left_len = left_probe.record.len() as u64 + left_probe.ext_region.len() as u64;
    let right_len = right_probe.record.len() as u64 + right_probe.ext_region.len() as u64;

    let left_offset = access.alloc.request(left_len, access.writer)?;
    let right_offset = match access.alloc.request(right_len, access.writer) {
        Ok(offset) => offset,
        Err(err) => {
            let region = Region {
                offset: left_offset,
                length: left_len,
            };
            access.alloc.release(region, access.writer)?;
            return Err(err);
        }
    };

    let left = build_leaf(
        &access.ctx,
        left_offset,
        None,
        Some(right_offset),
        &left_entries,
        Sizing::Exact(left_probe.record.len() as u32),
        if left_probe.ext_region.is_empty() {
            ExtSizing::Auto
        } else {
            ExtSizing::PadTo(left_probe.ext_region.len() as u32)
        },
    )?;
    let right = build_leaf(
        &access.ctx,
        right_offset,
        Some(left_offset),
        None,
        &right_entries,
        Sizing::Exact(right_probe.record.len() as u32),
        if right_probe.ext_region.is_empty() {
            ExtSizing::Auto
        } else {
            ExtSizing::PadTo(right_probe.ext_region.len() as u32)
        },
    )?;

    // The root node reuses the old leaf's entire footprint.
    let root_image = match build_node(
        leaf.offset,
        &[(split_key.clone(), left_offset)],
        right_offset,
        Sizing::Exact(leaf.total_length() as u32),
        access.ctx.max_entries,
    ) {
        Ok(image) => image,
        Err(err) if err.is_no_space() => {
            for (offset, length) in [(left_offset, left_len), (right_offset, right_len)] {
                access.alloc.release(Region { offset, length }, access.writer)?;
            }
            return Err(ArborError::RebuildRequired(
                "root record too small to become an internal node".to_string(),
            ));
        }
        Err(err) => return Err(err),
    };
    debug!(pivot = %split_key, left = left_offset, right = right_offset, "splitting root leaf");

    let mut tx: Transaction<TreeAccess<'_>> = Transaction::new();

    let left_record = left.record;
    let left_ext = left.ext_region;
    let left_record_end = left_offset + left_record.len() as u64;
    let left_region = Region {
        offset: left_offset,
        length: left_len,
    };
    tx.step(
        "write left leaf",
        move |a| {
            a.writer.write_at(&left_record, left_offset)?;
            if !left_ext.is_empty() {
                a.writer.write_at(&left_ext, left_record_end)?;
            }
            Ok(())
        },
        move |a| a.alloc.release(left_region, a.writer),
    );

    let right_record = right.record;
    let right_ext = right.ext_region;
    let right_record_end = right_offset + right_record.len() as u64;
    let right_region = Region {
        offset: right_offset,
        length: right_len,
    };
    tx.step(
        "write right leaf",
        move |a| {
            a.writer.write_at(&right_record, right_offset)?;
            if !right_ext.is_empty() {
                a.writer.write_at(&right_ext, right_record_end)?;
            }
            Ok(())
        },
        move |a| a.alloc.release(right_region, a.writer),
    );

    let old_root = access
        .writer
        .source()
        .read_exact_at(leaf.offset, leaf.total_length() as usize)?;
    let root_offset = leaf.offset;
    tx.step(
        "replace root with node",
        move |a| a.writer.write_at(&root_image, root_offset),
        move |a| a.writer.write_at(&old_root, root_offset),
    );

    tx.run_parallel(access)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;
    use crate::layout::TreeHeader;
    use arbor_common::{ReaderConfig, TreeOptions};
    use arbor_io::{BlockWriter, ByteSource};
    use std::sync::Arc;

    struct Tree {
        source: Arc<ByteSource>,
        header: TreeHeader,
        alloc: FreeSpaceTable,
    }

    impl Tree {
        fn build(options: TreeOptions, pairs: &[(&str, u8)]) -> Self {
            let mut builder = TreeBuilder::new(options);
            for (key, rp) in pairs {
                builder
                    .add(Key::from(*key), EntryValue::new(vec![*rp]))
                    .unwrap();
            }
            let source = Arc::new(ByteSource::memory());
            let mut writer = BlockWriter::new(Arc::clone(&source));
            let header = builder.create(&mut writer).unwrap();
            let alloc = FreeSpaceTable::new(
                u64::from(header.byte_length),
                u64::from(header.free_bytes.unwrap_or(0)),
                true,
                header.free_bytes_field_offset(),
            );
            Self {
                source,
                header,
                alloc,
            }
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut TreeAccess<'_>) -> R) -> R {
            let mut reader = BlockReader::new(Arc::clone(&self.source), &ReaderConfig::default());
            let mut writer = BlockWriter::new(Arc::clone(&self.source));
            let mut access = TreeAccess {
                reader: &mut reader,
                writer: &mut writer,
                ctx: LayoutContext::from_header(&self.header),
                root: self.header.root_offset(),
                alloc: &mut self.alloc,
            };
            f(&mut access)
        }

        fn find_values(&mut self, key: &str) -> Option<Vec<u8>> {
            self.with(|a| {
                let key = Key::from(key);
                let (leaf, _) = node::find_leaf(a.reader, &a.ctx, a.root, &key).unwrap();
                leaf.find_entry(&key).ok().map(|at| {
                    let entry = leaf.entries[at].clone();
                    match &entry.values {
                        ValueList::Inline(values) => {
                            values.iter().map(|v| v.record_pointer[0]).collect()
                        }
                        ValueList::Ext { .. } => {
                            extdata::load_values(a.reader, &a.ctx, &leaf, &entry)
                                .unwrap()
                                .iter()
                                .map(|v| v.record_pointer[0])
                                .collect()
                        }
                    }
                })
            })
        }

        fn all_keys(&mut self) -> Vec<Key> {
            self.with(|a| {
                let mut keys = Vec::new();
                let mut leaf = Some(node::first_leaf(a.reader, &a.ctx, a.root).unwrap());
                while let Some(current) = leaf {
                    keys.extend(current.entries.iter().map(|e| e.key.clone()));
                    leaf = node::next_leaf(a.reader, &a.ctx, &current).unwrap();
                }
                keys
            })
        }
    }

    #[test]
    fn test_add_then_find() {
        let mut tree = Tree::build(
            TreeOptions {
                max_entries: 10,
                ..Default::default()
            },
            &[("b", 1), ("d", 2)],
        );
        tree.with(|a| add(a, &Key::from("c"), EntryValue::new(vec![9]))).unwrap();

        assert_eq!(tree.find_values("c"), Some(vec![9]));
        assert_eq!(
            tree.all_keys(),
            vec![Key::from("b"), Key::from("c"), Key::from("d")]
        );
    }

    #[test]
    fn test_add_duplicate_unique_fails() {
        let mut tree = Tree::build(TreeOptions::default(), &[("a", 1)]);
        let err = tree
            .with(|a| add(a, &Key::from("a"), EntryValue::new(vec![2])))
            .unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey));
        assert_eq!(tree.find_values("a"), Some(vec![1]));
    }

    #[test]
    fn test_add_appends_value_non_unique() {
        let mut tree = Tree::build(
            TreeOptions {
                unique: false,
                max_entries: 10,
                ..Default::default()
            },
            &[("k", 1)],
        );
        tree.with(|a| add(a, &Key::from("k"), EntryValue::new(vec![2]))).unwrap();
        tree.with(|a| add(a, &Key::from("k"), EntryValue::new(vec![3]))).unwrap();
        assert_eq!(tree.find_values("k"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_remove_entry() {
        let mut tree = Tree::build(
            TreeOptions {
                max_entries: 10,
                ..Default::default()
            },
            &[("a", 1), ("b", 2), ("c", 3)],
        );
        tree.with(|a| remove(a, &Key::from("b"), None)).unwrap();
        assert_eq!(tree.find_values("b"), None);
        assert_eq!(tree.all_keys(), vec![Key::from("a"), Key::from("c")]);
    }

    #[test]
    fn test_remove_missing_key() {
        let mut tree = Tree::build(TreeOptions::default(), &[("a", 1)]);
        let err = tree.with(|a| remove(a, &Key::from("zz"), None)).unwrap_err();
        assert!(matches!(err, ArborError::KeyNotFound));
    }

    #[test]
    fn test_remove_single_value_non_unique() {
        let mut tree = Tree::build(
            TreeOptions {
                unique: false,
                max_entries: 10,
                ..Default::default()
            },
            &[("k", 1)],
        );
        tree.with(|a| add(a, &Key::from("k"), EntryValue::new(vec![2]))).unwrap();

        let rp = RecordPointer::from(vec![1u8]);
        tree.with(|a| remove(a, &Key::from("k"), Some(&rp))).unwrap();
        assert_eq!(tree.find_values("k"), Some(vec![2]));

        // Removing the last value drops the whole entry.
        let rp = RecordPointer::from(vec![2u8]);
        tree.with(|a| remove(a, &Key::from("k"), Some(&rp))).unwrap();
        assert_eq!(tree.find_values("k"), None);
    }

    #[test]
    fn test_update_unique() {
        let mut tree = Tree::build(TreeOptions::default(), &[("a", 1)]);
        tree.with(|a| update(a, &Key::from("a"), EntryValue::new(vec![42]), None))
            .unwrap();
        assert_eq!(tree.find_values("a"), Some(vec![42]));
    }

    #[test]
    fn test_update_missing_key() {
        let mut tree = Tree::build(TreeOptions::default(), &[("a", 1)]);
        let err = tree
            .with(|a| update(a, &Key::from("b"), EntryValue::new(vec![2]), None))
            .unwrap_err();
        assert!(matches!(err, ArborError::KeyNotFound));
    }

    #[test]
    fn test_update_by_pointer_non_unique() {
        let mut tree = Tree::build(
            TreeOptions {
                unique: false,
                max_entries: 10,
                ..Default::default()
            },
            &[("k", 1)],
        );
        tree.with(|a| add(a, &Key::from("k"), EntryValue::new(vec![2]))).unwrap();

        let rp = RecordPointer::from(vec![2u8]);
        tree.with(|a| update(a, &Key::from("k"), EntryValue::new(vec![9]), Some(&rp)))
            .unwrap();
        assert_eq!(tree.find_values("k"), Some(vec![1, 9]));

        let missing = RecordPointer::from(vec![77u8]);
        let err = tree
            .with(|a| update(a, &Key::from("k"), EntryValue::new(vec![0]), Some(&missing)))
            .unwrap_err();
        assert!(matches!(err, ArborError::ValueNotFound));
    }

    #[test]
    fn test_split_on_overflow() {
        // max_entries 4, five inserts: root leaf splits into two leaves.
        let mut tree = Tree::build(
            TreeOptions {
                max_entries: 4,
                ..Default::default()
            },
            &[],
        );
        for (i, key) in ["1", "2", "3", "4", "5"].iter().enumerate() {
            tree.with(|a| add(a, &Key::from(*key), EntryValue::new(vec![i as u8 + 1])))
                .unwrap();
        }

        // Root became an internal node with one pivot at "3".
        tree.with(|a| {
            match node::parse_record(a.reader, &a.ctx, a.root).unwrap() {
                node::NodeRecord::Internal(root) => {
                    assert_eq!(root.pivots.len(), 1);
                    assert_eq!(root.pivots[0].key, Key::from("3"));
                }
                node::NodeRecord::Leaf(_) => panic!("root should have split"),
            }
        });

        // Both halves linked, all five keys present in order.
        assert_eq!(
            tree.all_keys(),
            ["1", "2", "3", "4", "5"].map(Key::from).to_vec()
        );
        tree.with(|a| {
            let first = node::first_leaf(a.reader, &a.ctx, a.root).unwrap();
            assert_eq!(first.entries.len(), 2);
            let second = node::next_leaf(a.reader, &a.ctx, &first).unwrap().unwrap();
            assert_eq!(second.entries.len(), 3);
            assert_eq!(second.prev, Some(first.offset));
            assert!(node::next_leaf(a.reader, &a.ctx, &second).unwrap().is_none());
        });
    }

    #[test]
    fn test_many_inserts_through_splits() {
        let mut tree = Tree::build(
            TreeOptions {
                max_entries: 4,
                ..Default::default()
            },
            &[],
        );
        // Fill until the parent itself would need to split.
        let mut inserted = Vec::new();
        for i in 0..40 {
            let key = format!("key{i:03}");
            let outcome = tree.with(|a| add(a, &Key::from(key.as_str()), EntryValue::new(vec![i as u8])));
            match outcome {
                Ok(()) => inserted.push(Key::from(key.as_str())),
                Err(ArborError::RebuildRequired(_)) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(inserted.len() >= 10, "several splits should fit first");
        assert_eq!(tree.all_keys(), inserted);
    }

    #[test]
    fn test_rebuild_leaf_relocates_and_relinks() {
        // Tiny fill factor leaves little slack, forcing relocation.
        let mut tree = Tree::build(
            TreeOptions {
                max_entries: 16,
                fill_factor: 100,
                add_free_space: false,
                ..Default::default()
            },
            &[("a", 1), ("b", 2), ("c", 3), ("d", 4)],
        );
        // No free space at all: the in-place write fails and the leaf is
        // rebuilt into a grown region carved from an auto-grown tail.
        tree.with(|a| add(a, &Key::from("bb"), EntryValue::new(vec![9])))
            .unwrap();

        assert_eq!(
            tree.all_keys(),
            vec![
                Key::from("a"),
                Key::from("b"),
                Key::from("bb"),
                Key::from("c"),
                Key::from("d")
            ]
        );
        assert_eq!(tree.find_values("bb"), Some(vec![9]));
    }

    #[test]
    fn test_ext_data_spill_on_growth() {
        let mut tree = Tree::build(
            TreeOptions {
                unique: false,
                max_entries: 4,
                ..Default::default()
            },
            &[],
        );
        // 40-byte pointers: four values exceed the 127-byte inline budget.
        let key = Key::from("spill");
        for i in 0..4u8 {
            tree.with(|a| add(a, &key, EntryValue::new(vec![i; 40]))).unwrap();
        }

        tree.with(|a| {
            let (leaf, _) = node::find_leaf(a.reader, &a.ctx, a.root, &key).unwrap();
            let at = leaf.find_entry(&key).unwrap();
            assert!(
                matches!(leaf.entries[at].values, ValueList::Ext { count: 4, .. }),
                "value list should have spilled"
            );
        });
    }
}
