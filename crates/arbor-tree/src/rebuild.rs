//! Full-tree rebuild and construction from a sorted entry stream.
//!
//! Both entry points stream entries through a fixed-size window instead of
//! loading the whole tree: a first pass collects the future leaf-start
//! keys and totals, the node levels are written top-down with placeholder
//! child offsets, the leaves stream in behind them, and a final patch pass
//! rewrites every node with the then-known child offsets.
//!
//! Serialized entry stream format, one record per key:
//!
//! ```text
//! +--------------+-----+------------------+----------------------------+
//! | body len (4) | key | value count (4)  | count * (len (4) + value)  |
//! +--------------+-----+------------------+----------------------------+
//! ```

use crate::builder::{node_first_keys, node_pivots, plan_levels};
use crate::extdata;
use crate::layout::{
    build_leaf, build_node, ExtSizing, LayoutContext, LeafEntryData, Sizing, TreeHeader, ValueList,
};
use crate::node::{self, LeafRecord};
use arbor_common::config::REBUILD_FILL_FACTOR;
use arbor_common::{ArborError, EntryValue, Key, Result, TreeOptions};
use arbor_io::{BlockReader, BlockWriter};
use tracing::{debug, info};

/// Share of the body length reserved as the free tail.
const FREE_TAIL_SHARE: f64 = 0.1;

/// Options for a full rebuild.
#[derive(Debug, Clone)]
pub struct RebuildOptions {
    /// Target fill factor.
    pub fill_factor: u8,
    /// Grow max entries per node by 10% (capped at 255).
    pub increase_max_entries: bool,
    /// Explicit free-tail size; 10% of the body when absent.
    pub reserve_space: Option<u64>,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            fill_factor: REBUILD_FILL_FACTOR,
            increase_max_entries: true,
            reserve_space: None,
        }
    }
}

/// A source of key-ordered entries that can be walked twice.
trait EntrySource {
    /// Rewinds to the first entry.
    fn reset(&mut self) -> Result<()>;
    /// Yields the next entry, values materialized.
    fn next_entry(&mut self) -> Result<Option<(Key, Vec<EntryValue>)>>;
    /// Yields the next key only, skipping value payloads where possible.
    fn next_key(&mut self) -> Result<Option<Key>> {
        Ok(self.next_entry()?.map(|(key, _)| key))
    }
}

/// Walks an existing tree's leaves in key order.
struct TreeEntrySource<'a> {
    reader: &'a mut BlockReader,
    ctx: LayoutContext,
    root: u64,
    current: Option<(LeafRecord, usize)>,
    started: bool,
}

impl<'a> TreeEntrySource<'a> {
    fn new(reader: &'a mut BlockReader, ctx: LayoutContext, root: u64) -> Self {
        Self {
            reader,
            ctx,
            root,
            current: None,
            started: false,
        }
    }
}

impl EntrySource for TreeEntrySource<'_> {
    fn reset(&mut self) -> Result<()> {
        self.current = None;
        self.started = false;
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(Key, Vec<EntryValue>)>> {
        loop {
            if !self.started {
                self.started = true;
                let first = node::first_leaf(self.reader, &self.ctx, self.root)?;
                self.current = Some((first, 0));
            }
            let Some((leaf, at)) = self.current.take() else {
                return Ok(None);
            };
            if at >= leaf.entries.len() {
                match node::next_leaf(self.reader, &self.ctx, &leaf)? {
                    Some(next) => {
                        self.current = Some((next, 0));
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            let entry = leaf.entries[at].clone();
            let values = match &entry.values {
                ValueList::Inline(values) => values.clone(),
                ValueList::Ext { .. } => {
                    extdata::load_values(self.reader, &self.ctx, &leaf, &entry)?
                }
            };
            self.current = Some((leaf, at + 1));
            return Ok(Some((entry.key, values)));
        }
    }
}

/// Walks a serialized entry stream.
struct StreamEntrySource<'a> {
    reader: &'a mut BlockReader,
    metadata_count: usize,
    start: u64,
    end: u64,
}

impl<'a> StreamEntrySource<'a> {
    fn new(reader: &'a mut BlockReader, metadata_count: usize, start: u64, end: u64) -> Self {
        Self {
            reader,
            metadata_count,
            start,
            end,
        }
    }
}

impl EntrySource for StreamEntrySource<'_> {
    fn reset(&mut self) -> Result<()> {
        self.reader.seek(self.start);
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(Key, Vec<EntryValue>)>> {
        if self.reader.position() >= self.end {
            return Ok(None);
        }
        let _body_len = self.reader.get_u32()?;
        let key = self.reader.get_value()?;
        let count = self.reader.get_u32()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.reader.get_u32()? as usize;
            let raw = self.reader.get(len)?;
            let (value, consumed) = EntryValue::deserialize(&raw, self.metadata_count)?;
            if consumed != raw.len() {
                return Err(ArborError::Corrupted {
                    offset: self.reader.position(),
                    reason: "trailing bytes in stream value record".to_string(),
                });
            }
            values.push(value);
        }
        Ok(Some((key, values)))
    }

    fn next_key(&mut self) -> Result<Option<Key>> {
        if self.reader.position() >= self.end {
            return Ok(None);
        }
        let body_len = self.reader.get_u32()?;
        let at = self.reader.position();
        let key = self.reader.get_value()?;
        self.reader.seek(at + u64::from(body_len));
        Ok(Some(key))
    }
}

/// Serializes entries in the stream format understood by
/// [`create_from_entry_stream`].
pub fn write_entry_stream(
    writer: &mut BlockWriter,
    entries: &[(Key, Vec<EntryValue>)],
    metadata_count: usize,
) -> Result<()> {
    for (key, values) in entries {
        let mut body = key.to_vec()?;
        body.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for value in values {
            let mut encoded = Vec::new();
            value.serialize(metadata_count, &mut encoded)?;
            body.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            body.extend_from_slice(&encoded);
        }
        writer.append(&(body.len() as u32).to_be_bytes())?;
        writer.append(&body)?;
    }
    writer.end()?;
    Ok(())
}

/// Rebuilds an existing tree into `writer`, restoring fill factors and
/// reclaiming wasted space.
pub fn rebuild_tree(
    reader: &mut BlockReader,
    src_header: &TreeHeader,
    writer: &mut BlockWriter,
    options: &RebuildOptions,
) -> Result<TreeHeader> {
    let max_entries = if options.increase_max_entries {
        ((f64::from(src_header.max_entries) * 1.1).ceil() as u16).min(255) as u8
    } else {
        src_header.max_entries
    };
    let target = TreeOptions {
        unique: src_header.unique(),
        max_entries,
        fill_factor: options.fill_factor,
        metadata_keys: src_header.metadata_keys.clone(),
        small_leaves: src_header.small_leaves(),
        auto_grow: true,
        add_free_space: true,
    };

    let src_ctx = LayoutContext::from_header(src_header);
    let root = src_header.root_offset();
    let mut source = TreeEntrySource::new(reader, src_ctx, root);
    build_streamed(&mut source, writer, &target, options.reserve_space)
}

/// Builds a tree from a serialized, key-ordered entry stream. The stream
/// is walked twice: once for leaf-start keys, once for the data.
pub fn create_from_entry_stream(
    reader: &mut BlockReader,
    writer: &mut BlockWriter,
    options: &TreeOptions,
) -> Result<TreeHeader> {
    let end = reader.source().len();
    let start = reader.position();
    let mut source = StreamEntrySource::new(reader, options.metadata_keys.len(), start, end);
    build_streamed(&mut source, writer, options, None)
}

/// The shared two-pass streaming build.
fn build_streamed(
    source: &mut dyn EntrySource,
    writer: &mut BlockWriter,
    options: &TreeOptions,
    reserve_space: Option<u64>,
) -> Result<TreeHeader> {
    let mut header = TreeHeader::from_options(options);
    let ctx = LayoutContext::from_header(&header);
    let sizing = if options.add_free_space {
        Sizing::Padded
    } else {
        Sizing::Compact
    };
    let max_entries = options.max_entries as usize;
    let entries_per_leaf =
        (max_entries * options.fill_factor as usize / 100).clamp(1, max_entries);

    // Pass 1: every future leaf's first key, plus totals.
    source.reset()?;
    let mut leaf_first_keys: Vec<Key> = Vec::new();
    let mut total_entries = 0u64;
    while let Some(key) = source.next_key()? {
        if total_entries % entries_per_leaf as u64 == 0 {
            leaf_first_keys.push(key);
        }
        total_entries += 1;
    }
    if leaf_first_keys.is_empty() {
        leaf_first_keys.push(Key::Undefined);
    }
    let leaf_count = leaf_first_keys.len();
    debug!(total_entries, leaf_count, "rebuild pass 1 complete");

    let plan = plan_levels(leaf_count, options.max_entries);
    let node_keys = node_first_keys(&plan, &leaf_first_keys);

    // Nodes go out top-down with placeholder child offsets; the records
    // are rewritten once the leaf offsets are known.
    writer.append(&header.to_bytes()?)?;
    let mut node_offsets: Vec<Vec<u64>> = Vec::with_capacity(plan.depth());
    let mut node_lengths: Vec<Vec<u32>> = Vec::with_capacity(plan.depth());
    let mut cursor = header.root_offset();
    for level in 0..plan.depth() {
        let mut offsets = Vec::new();
        let mut lengths = Vec::new();
        for node_index in 0..plan.levels[level].len() {
            let (pivots, _) = node_pivots(&plan, &node_keys, &leaf_first_keys, level, node_index);
            let placeholder: Vec<(Key, u64)> =
                pivots.iter().map(|(k, _)| (k.clone(), cursor)).collect();
            let record = build_node(cursor, &placeholder, cursor, sizing, options.max_entries)?;
            offsets.push(cursor);
            lengths.push(record.len() as u32);
            cursor += record.len() as u64;
            writer.append(&record)?;
        }
        node_offsets.push(offsets);
        node_lengths.push(lengths);
    }

    // Pass 2: stream the leaves. Each leaf's next pointer is resolved to
    // the position immediately after its own record and ext region.
    source.reset()?;
    let mut leaf_offsets: Vec<u64> = Vec::with_capacity(leaf_count);
    let mut prev_offset: Option<u64> = None;
    for leaf_index in 0..leaf_count {
        let mut entries: Vec<LeafEntryData> = Vec::with_capacity(entries_per_leaf);
        while entries.len() < entries_per_leaf {
            match source.next_entry()? {
                Some((key, values)) => entries.push(LeafEntryData {
                    key,
                    values: ValueList::Inline(values),
                }),
                None => break,
            }
        }

        // Lengths do not depend on pointer values, so a probe build
        // resolves the "adjacent" next pointer before the real build.
        let probe = build_leaf(&ctx, cursor, None, None, &entries, sizing, ExtSizing::Auto)?;
        let leaf_end = cursor + probe.total_len() as u64;
        let next = if leaf_index + 1 < leaf_count {
            Some(leaf_end)
        } else {
            None
        };
        let image = build_leaf(&ctx, cursor, prev_offset, next, &entries, sizing, ExtSizing::Auto)?;
        debug_assert_eq!(image.total_len(), probe.total_len());

        writer.append(&image.record)?;
        writer.append(&image.ext_region)?;
        leaf_offsets.push(cursor);
        prev_offset = Some(cursor);
        cursor = leaf_end;
    }

    // Free tail, then drain everything before the patch pass.
    let body_len = cursor;
    let free_tail = reserve_space.unwrap_or_else(|| {
        if options.add_free_space {
            (body_len as f64 * FREE_TAIL_SHARE).ceil() as u64
        } else {
            0
        }
    });
    let total = body_len + free_tail;
    if total > u64::from(u32::MAX) {
        return Err(ArborError::NoSpace {
            requested: total,
            available: u64::from(u32::MAX),
        });
    }
    if free_tail > 0 {
        writer.append(&vec![0u8; free_tail as usize])?;
    }
    writer.end()?;

    // Patch pass: every node record again, now with real child offsets.
    for level in 0..plan.depth() {
        let child_offset = |child: usize| -> u64 {
            if level == plan.depth() - 1 {
                leaf_offsets[child]
            } else {
                node_offsets[level + 1][child]
            }
        };
        for node_index in 0..plan.levels[level].len() {
            let (pivots, gt_child) =
                node_pivots(&plan, &node_keys, &leaf_first_keys, level, node_index);
            let resolved: Vec<(Key, u64)> = pivots
                .into_iter()
                .map(|(key, child)| (key, child_offset(child)))
                .collect();
            let record = build_node(
                node_offsets[level][node_index],
                &resolved,
                child_offset(gt_child),
                Sizing::Exact(node_lengths[level][node_index]),
                options.max_entries,
            )?;
            writer.write_at(&record, node_offsets[level][node_index])?;
        }
    }

    // Final header with the real totals.
    header.byte_length = total as u32;
    header.free_bytes = Some(free_tail as u32);
    writer.write_at(&header.to_bytes()?, 0)?;
    writer.end()?;

    info!(
        entries = total_entries,
        leaves = leaf_count,
        depth = plan.depth() + 1,
        byte_length = header.byte_length,
        "tree rebuilt"
    );
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TreeBuilder;
    use arbor_common::ReaderConfig;
    use arbor_io::ByteSource;
    use std::sync::Arc;

    fn reader_for(source: &Arc<ByteSource>) -> BlockReader {
        BlockReader::new(Arc::clone(source), &ReaderConfig::default())
    }

    fn build_source_tree(n: usize, options: TreeOptions) -> (Arc<ByteSource>, TreeHeader) {
        let mut builder = TreeBuilder::new(options);
        for i in 0..n {
            builder
                .add(
                    Key::from(format!("key{i:05}").as_str()),
                    EntryValue::new(vec![(i % 256) as u8]),
                )
                .unwrap();
        }
        let source = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&source));
        let header = builder.create(&mut writer).unwrap();
        (source, header)
    }

    fn iterate_all(source: &Arc<ByteSource>, header: &TreeHeader) -> Vec<(Key, Vec<u8>)> {
        let ctx = LayoutContext::from_header(header);
        let mut reader = reader_for(source);
        let mut out = Vec::new();
        let mut leaf = Some(node::first_leaf(&mut reader, &ctx, header.root_offset()).unwrap());
        while let Some(current) = leaf {
            for entry in &current.entries {
                let values = match &entry.values {
                    ValueList::Inline(values) => values.clone(),
                    ValueList::Ext { .. } => {
                        extdata::load_values(&mut reader, &ctx, &current, entry).unwrap()
                    }
                };
                out.push((
                    entry.key.clone(),
                    values.iter().map(|v| v.record_pointer[0]).collect(),
                ));
            }
            leaf = node::next_leaf(&mut reader, &ctx, &current).unwrap();
        }
        out
    }

    #[test]
    fn test_rebuild_preserves_entries() {
        let (source, header) = build_source_tree(500, TreeOptions::default());
        let before = iterate_all(&source, &header);

        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&source);
        let new_header =
            rebuild_tree(&mut reader, &header, &mut writer, &RebuildOptions::default()).unwrap();

        let after = iterate_all(&target, &new_header);
        assert_eq!(before, after);
    }

    #[test]
    fn test_rebuild_fill_factor_bounds() {
        let (source, header) = build_source_tree(
            2000,
            TreeOptions {
                max_entries: 100,
                ..Default::default()
            },
        );

        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&source);
        let options = RebuildOptions {
            fill_factor: 80,
            increase_max_entries: false,
            reserve_space: None,
        };
        let new_header = rebuild_tree(&mut reader, &header, &mut writer, &options).unwrap();
        assert_eq!(new_header.max_entries, 100);

        // Every non-terminal leaf holds exactly the windowed 80%.
        let ctx = LayoutContext::from_header(&new_header);
        let mut reader = reader_for(&target);
        let mut leaf =
            Some(node::first_leaf(&mut reader, &ctx, new_header.root_offset()).unwrap());
        let mut counts = Vec::new();
        while let Some(current) = leaf {
            counts.push(current.entries.len());
            leaf = node::next_leaf(&mut reader, &ctx, &current).unwrap();
        }
        let last = counts.pop().unwrap();
        assert!(counts.iter().all(|&c| c == 80), "fill factor 80 of 100");
        assert!(last <= 80);
        assert_eq!(counts.iter().sum::<usize>() + last, 2000);
    }

    #[test]
    fn test_rebuild_grows_max_entries() {
        let (source, header) = build_source_tree(
            100,
            TreeOptions {
                max_entries: 200,
                ..Default::default()
            },
        );
        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&source);
        let new_header =
            rebuild_tree(&mut reader, &header, &mut writer, &RebuildOptions::default()).unwrap();
        assert_eq!(new_header.max_entries, 220);

        // 255 is the ceiling.
        let (source, header) = build_source_tree(
            10,
            TreeOptions {
                max_entries: 250,
                ..Default::default()
            },
        );
        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&source);
        let new_header =
            rebuild_tree(&mut reader, &header, &mut writer, &RebuildOptions::default()).unwrap();
        assert_eq!(new_header.max_entries, 255);
    }

    #[test]
    fn test_entry_stream_roundtrip() {
        let entries: Vec<(Key, Vec<EntryValue>)> = (0..300)
            .map(|i| {
                (
                    Key::from(format!("stream{i:04}").as_str()),
                    vec![EntryValue::new(vec![(i % 256) as u8])],
                )
            })
            .collect();

        // Serialize the stream.
        let stream = Arc::new(ByteSource::memory());
        let mut stream_writer = BlockWriter::new(Arc::clone(&stream));
        write_entry_stream(&mut stream_writer, &entries, 0).unwrap();

        // Build a tree from it.
        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&stream);
        let options = TreeOptions {
            max_entries: 50,
            ..Default::default()
        };
        let header = create_from_entry_stream(&mut reader, &mut writer, &options).unwrap();

        let built = iterate_all(&target, &header);
        assert_eq!(built.len(), 300);
        for (i, (key, values)) in built.iter().enumerate() {
            assert_eq!(key, &entries[i].0);
            assert_eq!(values[0], entries[i].1[0].record_pointer[0]);
        }
    }

    #[test]
    fn test_streamed_tree_is_navigable() {
        let entries: Vec<(Key, Vec<EntryValue>)> = (0..300)
            .map(|i| {
                (
                    Key::from(i as i64),
                    vec![EntryValue::new(vec![(i % 256) as u8])],
                )
            })
            .collect();
        let stream = Arc::new(ByteSource::memory());
        let mut stream_writer = BlockWriter::new(Arc::clone(&stream));
        write_entry_stream(&mut stream_writer, &entries, 0).unwrap();

        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&stream);
        let options = TreeOptions {
            max_entries: 25,
            ..Default::default()
        };
        let header = create_from_entry_stream(&mut reader, &mut writer, &options).unwrap();

        // Point lookups work through the patched node levels.
        let ctx = LayoutContext::from_header(&header);
        let mut reader = reader_for(&target);
        for i in (0..300).step_by(23) {
            let key = Key::from(i as i64);
            let (leaf, _) =
                node::find_leaf(&mut reader, &ctx, header.root_offset(), &key).unwrap();
            assert!(leaf.find_entry(&key).is_ok(), "missing {key}");
        }
    }

    #[test]
    fn test_rebuild_empty_tree() {
        let (source, header) = build_source_tree(0, TreeOptions::default());
        let target = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        let mut reader = reader_for(&source);
        let new_header =
            rebuild_tree(&mut reader, &header, &mut writer, &RebuildOptions::default()).unwrap();
        assert!(iterate_all(&target, &new_header).is_empty());
    }
}
