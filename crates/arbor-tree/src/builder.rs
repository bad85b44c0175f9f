//! In-memory tree builder.
//!
//! Accumulates entries in a sorted map and emits a balanced tree in one
//! pass: leaves are consecutive windows over the sorted entries, parent
//! levels group children bottom-up, and a terminal parent that would
//! underflow steals children from its previous sibling. Because every
//! record's length is known before anything is written, all offsets are
//! resolved up front and no patch pass is needed.

use crate::layout::{
    build_leaf, build_node, ExtSizing, LayoutContext, LeafEntryData, Sizing, TreeHeader, ValueList,
};
use arbor_common::{ArborError, EntryValue, Key, Result, TreeOptions};
use arbor_io::BlockWriter;
use std::collections::BTreeMap;
use tracing::debug;

/// Share of the body length reserved as the free tail at build time.
const FREE_TAIL_SHARE: f64 = 0.1;

/// Top-down node level plan. Each node is a list of child indices into the
/// level below; the last level's children are leaf indices.
#[derive(Debug)]
pub(crate) struct LevelPlan {
    pub levels: Vec<Vec<Vec<usize>>>,
}

impl LevelPlan {
    /// Number of node levels (0 means the root is a leaf).
    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Plans parent levels over `leaf_count` leaves.
pub(crate) fn plan_levels(leaf_count: usize, max_entries: u8) -> LevelPlan {
    let mut bottom_up: Vec<Vec<Vec<usize>>> = Vec::new();
    if leaf_count > 1 {
        let fan_out = max_entries as usize + 1;
        let min_pivots = (max_entries as usize / 2).max(1);
        let mut count = leaf_count;
        loop {
            let groups = group_children(count, fan_out, min_pivots + 1);
            count = groups.len();
            bottom_up.push(groups);
            if count == 1 {
                break;
            }
        }
    }
    bottom_up.reverse();
    LevelPlan { levels: bottom_up }
}

/// Windows `0..n` into groups of up to `fan_out` children, stealing from
/// the previous sibling when the terminal group underflows.
fn group_children(n: usize, fan_out: usize, min_children: usize) -> Vec<Vec<usize>> {
    let indices: Vec<usize> = (0..n).collect();
    let mut groups: Vec<Vec<usize>> = indices.chunks(fan_out).map(<[usize]>::to_vec).collect();

    if groups.len() >= 2 {
        let mut last = groups.pop().expect("len checked");
        {
            let prev = groups.last_mut().expect("len checked");
            while last.len() < min_children && prev.len() > min_children {
                let moved = prev.pop().expect("prev is non-empty");
                last.insert(0, moved);
            }
        }
        groups.push(last);
    }
    groups
}

/// Computes each planned node's subtree-first key, top-down per level.
pub(crate) fn node_first_keys(plan: &LevelPlan, leaf_first_keys: &[Key]) -> Vec<Vec<Key>> {
    let mut keys: Vec<Vec<Key>> = vec![Vec::new(); plan.levels.len()];
    for level in (0..plan.levels.len()).rev() {
        let is_last = level == plan.levels.len() - 1;
        keys[level] = plan.levels[level]
            .iter()
            .map(|children| {
                let first_child = children[0];
                if is_last {
                    leaf_first_keys[first_child].clone()
                } else {
                    keys[level + 1][first_child].clone()
                }
            })
            .collect();
    }
    keys
}

/// Derives a planned node's pivots: `(pivot key, child index)` pairs plus
/// the gt-child index. The pivot key for each child is the first key of
/// the next child's subtree.
pub(crate) fn node_pivots(
    plan: &LevelPlan,
    node_keys: &[Vec<Key>],
    leaf_first_keys: &[Key],
    level: usize,
    node_index: usize,
) -> (Vec<(Key, usize)>, usize) {
    let children = &plan.levels[level][node_index];
    let is_last = level == plan.levels.len() - 1;
    let first_key_of = |child: usize| -> Key {
        if is_last {
            leaf_first_keys[child].clone()
        } else {
            node_keys[level + 1][child].clone()
        }
    };

    let mut pivots = Vec::with_capacity(children.len() - 1);
    for window in children.windows(2) {
        pivots.push((first_key_of(window[1]), window[0]));
    }
    let gt_child = *children.last().expect("groups are never empty");
    (pivots, gt_child)
}

/// Accumulates entries and emits a balanced on-disk tree.
pub struct TreeBuilder {
    options: TreeOptions,
    entries: BTreeMap<Key, Vec<EntryValue>>,
}

impl TreeBuilder {
    /// Creates an empty builder.
    pub fn new(options: TreeOptions) -> Self {
        Self {
            options,
            entries: BTreeMap::new(),
        }
    }

    /// The creation options.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Number of distinct keys accumulated.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Adds a value under `key`. Fails with `DuplicateKey` on a unique
    /// tree when the key is already present.
    pub fn add(&mut self, key: Key, value: EntryValue) -> Result<()> {
        let values = self.entries.entry(key).or_default();
        if self.options.unique && !values.is_empty() {
            return Err(ArborError::DuplicateKey);
        }
        values.push(value);
        Ok(())
    }

    /// Serializes the accumulated entries as a complete tree through
    /// `writer` and returns the final header.
    pub fn create(&self, writer: &mut BlockWriter) -> Result<TreeHeader> {
        let mut header = TreeHeader::from_options(&self.options);
        let ctx = LayoutContext::from_header(&header);
        let sizing = if self.options.add_free_space {
            Sizing::Padded
        } else {
            Sizing::Compact
        };

        // Window the sorted entries into leaves at the fill factor.
        let max_entries = self.options.max_entries as usize;
        let entries_per_leaf = (max_entries * self.options.fill_factor as usize / 100)
            .clamp(1, max_entries);

        let all: Vec<LeafEntryData> = self
            .entries
            .iter()
            .map(|(key, values)| LeafEntryData {
                key: key.clone(),
                values: ValueList::Inline(values.clone()),
            })
            .collect();
        let mut leaves: Vec<Vec<LeafEntryData>> = all
            .chunks(entries_per_leaf)
            .map(<[LeafEntryData]>::to_vec)
            .collect();
        if leaves.is_empty() {
            leaves.push(Vec::new());
        }

        let leaf_first_keys: Vec<Key> = leaves
            .iter()
            .map(|leaf| leaf.first().map_or(Key::Undefined, |e| e.key.clone()))
            .collect();
        let plan = plan_levels(leaves.len(), self.options.max_entries);
        let node_keys = node_first_keys(&plan, &leaf_first_keys);

        // Measure every record; lengths do not depend on placement.
        let mut leaf_sizes = Vec::with_capacity(leaves.len());
        for leaf in &leaves {
            let image = build_leaf(&ctx, 0, None, None, leaf, sizing, ExtSizing::Auto)?;
            leaf_sizes.push((image.record.len() as u64, image.ext_region.len() as u64));
        }
        let mut node_sizes: Vec<Vec<u64>> = Vec::with_capacity(plan.depth());
        for level in 0..plan.depth() {
            let mut sizes = Vec::with_capacity(plan.levels[level].len());
            for node_index in 0..plan.levels[level].len() {
                let (pivots, _) = node_pivots(&plan, &node_keys, &leaf_first_keys, level, node_index);
                let dummy: Vec<(Key, u64)> = pivots.iter().map(|(k, _)| (k.clone(), 1)).collect();
                let record = build_node(0, &dummy, 1, sizing, self.options.max_entries)?;
                sizes.push(record.len() as u64);
            }
            node_sizes.push(sizes);
        }

        // Resolve every offset.
        let mut cursor = header.root_offset();
        let mut node_offsets: Vec<Vec<u64>> = Vec::with_capacity(plan.depth());
        for sizes in &node_sizes {
            let mut offsets = Vec::with_capacity(sizes.len());
            for size in sizes {
                offsets.push(cursor);
                cursor += size;
            }
            node_offsets.push(offsets);
        }
        let mut leaf_offsets = Vec::with_capacity(leaves.len());
        for (record_len, ext_len) in &leaf_sizes {
            leaf_offsets.push(cursor);
            cursor += record_len + ext_len;
        }

        let body_len = cursor;
        let free_tail = if self.options.add_free_space {
            (body_len as f64 * FREE_TAIL_SHARE).ceil() as u64
        } else {
            0
        };
        let total = body_len + free_tail;
        if total > u64::from(u32::MAX) {
            return Err(ArborError::NoSpace {
                requested: total,
                available: u64::from(u32::MAX),
            });
        }
        header.byte_length = total as u32;
        header.free_bytes = Some(free_tail as u32);

        // Emit everything with resolved offsets.
        writer.append(&header.to_bytes()?)?;
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
                    sizing,
                    self.options.max_entries,
                )?;
                debug_assert_eq!(record.len() as u64, node_sizes[level][node_index]);
                writer.append(&record)?;
            }
        }
        for (i, leaf) in leaves.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| leaf_offsets[p]);
            let next = leaf_offsets.get(i + 1).copied();
            let image = build_leaf(&ctx, leaf_offsets[i], prev, next, leaf, sizing, ExtSizing::Auto)?;
            debug_assert_eq!(image.record.len() as u64, leaf_sizes[i].0);
            writer.append(&image.record)?;
            writer.append(&image.ext_region)?;
        }
        if free_tail > 0 {
            writer.append(&vec![0u8; free_tail as usize])?;
        }
        writer.end()?;

        debug!(
            entries = self.entries.len(),
            leaves = leaves.len(),
            depth = plan.depth() + 1,
            byte_length = header.byte_length,
            "tree built"
        );
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{find_leaf, first_leaf, next_leaf, parse_record, NodeRecord};
    use arbor_common::ReaderConfig;
    use arbor_io::{BlockReader, ByteSource};
    use std::sync::Arc;

    fn build(options: TreeOptions, n: usize) -> (Arc<ByteSource>, TreeHeader) {
        let mut builder = TreeBuilder::new(options);
        for i in 0..n {
            builder
                .add(Key::from(i as i64), EntryValue::new(vec![(i % 256) as u8]))
                .unwrap();
        }
        let source = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&source));
        let header = builder.create(&mut writer).unwrap();
        (source, header)
    }

    fn reader(source: &Arc<ByteSource>) -> BlockReader {
        BlockReader::new(Arc::clone(source), &ReaderConfig::default())
    }

    #[test]
    fn test_group_children_no_underflow() {
        // 6 children, fan-out 5, min 3: terminal group steals one.
        let groups = group_children(6, 5, 3);
        assert_eq!(groups, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[test]
    fn test_group_children_exact_fit() {
        let groups = group_children(10, 5, 3);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 5);
        assert_eq!(groups[1].len(), 5);
    }

    #[test]
    fn test_plan_levels_single_leaf() {
        let plan = plan_levels(1, 255);
        assert_eq!(plan.depth(), 0);
    }

    #[test]
    fn test_plan_levels_two_tier() {
        let plan = plan_levels(10, 4);
        assert_eq!(plan.depth(), 1);
        assert_eq!(plan.levels[0].len(), 2);
    }

    #[test]
    fn test_duplicate_key_rejected_on_unique() {
        let mut builder = TreeBuilder::new(TreeOptions::default());
        builder.add(Key::from("a"), EntryValue::new(vec![1])).unwrap();
        let err = builder.add(Key::from("a"), EntryValue::new(vec![2])).unwrap_err();
        assert!(matches!(err, ArborError::DuplicateKey));
    }

    #[test]
    fn test_non_unique_accumulates() {
        let mut builder = TreeBuilder::new(TreeOptions {
            unique: false,
            ..Default::default()
        });
        builder.add(Key::from("a"), EntryValue::new(vec![1])).unwrap();
        builder.add(Key::from("a"), EntryValue::new(vec![2])).unwrap();
        assert_eq!(builder.entry_count(), 1);
    }

    #[test]
    fn test_small_build_single_leaf_root() {
        let options = TreeOptions {
            max_entries: 3,
            ..Default::default()
        };
        let mut builder = TreeBuilder::new(options);
        for (key, rp) in [("apple", 1u8), ("banana", 2), ("cherry", 3)] {
            builder.add(Key::from(key), EntryValue::new(vec![rp])).unwrap();
        }
        let source = Arc::new(ByteSource::memory());
        let mut writer = BlockWriter::new(Arc::clone(&source));
        let header = builder.create(&mut writer).unwrap();

        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);
        match parse_record(&mut r, &ctx, header.root_offset()).unwrap() {
            NodeRecord::Leaf(leaf) => {
                assert_eq!(leaf.entries.len(), 3);
                assert_eq!(leaf.entries[1].key, Key::from("banana"));
                assert!(leaf.prev.is_none());
                assert!(leaf.next.is_none());
            }
            NodeRecord::Internal(_) => panic!("three entries should fit one leaf"),
        }
    }

    #[test]
    fn test_thousand_entries_depth_two() {
        let (source, header) = build(TreeOptions::default(), 1000);
        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);

        // Root is a node, its children are leaves: depth exactly 2.
        match parse_record(&mut r, &ctx, header.root_offset()).unwrap() {
            NodeRecord::Internal(node) => {
                let child = node.pivots[0].child;
                match parse_record(&mut r, &ctx, child).unwrap() {
                    NodeRecord::Leaf(_) => {}
                    NodeRecord::Internal(_) => panic!("expected depth 2"),
                }
            }
            NodeRecord::Leaf(_) => panic!("1000 entries cannot fit one leaf"),
        }
    }

    #[test]
    fn test_iteration_yields_sorted_pairs() {
        let (source, header) = build(TreeOptions::default(), 1000);
        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);

        let mut seen = 0u64;
        let mut last: Option<Key> = None;
        let mut leaf = Some(first_leaf(&mut r, &ctx, header.root_offset()).unwrap());
        while let Some(current) = leaf {
            for entry in &current.entries {
                if let Some(prev) = &last {
                    assert!(prev < &entry.key, "iteration out of order");
                }
                last = Some(entry.key.clone());
                seen += 1;
            }
            leaf = next_leaf(&mut r, &ctx, &current).unwrap();
        }
        assert_eq!(seen, 1000);
    }

    #[test]
    fn test_find_leaf_locates_every_key() {
        let (source, header) = build(TreeOptions::default(), 500);
        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);

        for i in (0..500).step_by(37) {
            let key = Key::from(i as i64);
            let (leaf, _) = find_leaf(&mut r, &ctx, header.root_offset(), &key).unwrap();
            assert!(leaf.find_entry(&key).is_ok(), "key {key} not in its leaf");
        }
    }

    #[test]
    fn test_fill_factor_leaves_room() {
        let options = TreeOptions {
            max_entries: 10,
            fill_factor: 50,
            ..Default::default()
        };
        let (source, header) = build(options, 20);
        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);

        let mut leaf = Some(first_leaf(&mut r, &ctx, header.root_offset()).unwrap());
        while let Some(current) = leaf {
            assert!(current.entries.len() <= 5, "fill factor 50 of 10");
            leaf = next_leaf(&mut r, &ctx, &current).unwrap();
        }
    }

    #[test]
    fn test_empty_tree_has_empty_root_leaf() {
        let (source, header) = build(TreeOptions::default(), 0);
        let mut r = reader(&source);
        let ctx = LayoutContext::from_header(&header);
        match parse_record(&mut r, &ctx, header.root_offset()).unwrap() {
            NodeRecord::Leaf(leaf) => {
                assert!(leaf.entries.is_empty());
                assert!(leaf.free_bytes > 0, "empty root leaf should have room");
            }
            NodeRecord::Internal(_) => panic!("empty tree root must be a leaf"),
        }
    }

    #[test]
    fn test_header_matches_written_length() {
        let (source, header) = build(TreeOptions::default(), 100);
        assert_eq!(source.len(), u64::from(header.byte_length));
        assert!(header.free_bytes.unwrap() > 0);
    }
}
