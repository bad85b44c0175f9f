//! Typed comparison operators over the index.
//!
//! Each operator picks the cheapest leaf-walk it can: point lookups seek
//! through the node levels, range operators seek to one bound and walk the
//! leaf linked list, negated and pattern operators scan every leaf. `in`
//! jump-seeks needle by needle but drains all needles covered by the leaf
//! it just loaded before seeking again.
//!
//! Execution is two-phase: [`collect`] walks leaves and gathers raw
//! matches without touching ext_data; entries whose values live in
//! ext_data are left as references so the caller can load them under the
//! leaf-level lock before [`shape`] produces the requested result facets.

use crate::extdata;
use crate::layout::{LayoutContext, ValueList};
use crate::node::{self, LeafRecord};
use arbor_common::{ArborError, EntryValue, Key, RecordPointer, Result};
use arbor_io::BlockReader;
use regex::Regex;
use std::collections::HashSet;

/// A search operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    /// `==`
    Eq,
    /// `!=` (full scan)
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `in` (jump-seek per needle)
    In,
    /// `!in` (full scan, hashed needles)
    NotIn,
    /// `between` (bounds inclusive)
    Between,
    /// `!between` (full scan)
    NotBetween,
    /// `like` (glob with `*` and `?`)
    Like,
    /// `!like` (full scan)
    NotLike,
    /// `matches` (regex, full scan)
    Matches,
    /// `!matches` (full scan)
    NotMatches,
    /// key is defined
    Exists,
    /// key is the undefined sentinel
    NotExists,
}

impl SearchOp {
    /// Parses the operator's conventional string form.
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "==" => Self::Eq,
            "!=" => Self::NotEq,
            "<" => Self::Lt,
            "<=" => Self::LtEq,
            ">" => Self::Gt,
            ">=" => Self::GtEq,
            "in" => Self::In,
            "!in" => Self::NotIn,
            "between" => Self::Between,
            "!between" => Self::NotBetween,
            "like" => Self::Like,
            "!like" => Self::NotLike,
            "matches" => Self::Matches,
            "!matches" => Self::NotMatches,
            "exists" => Self::Exists,
            "!exists" => Self::NotExists,
            _ => return None,
        })
    }
}

/// Operator parameter.
#[derive(Debug, Clone)]
pub enum SearchParam {
    /// No parameter (`exists` / `!exists`).
    None,
    /// A single key.
    Key(Key),
    /// A needle set (`in` / `!in`).
    Keys(Vec<Key>),
    /// An inclusive range (`between` / `!between`).
    Range(Key, Key),
    /// A glob or regex pattern (`like` / `matches` families).
    Pattern(String),
}

/// Which result facets to produce.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Collect full entries with materialized values.
    pub entries: bool,
    /// Collect matching keys.
    pub keys: bool,
    /// Collect matching values flattened across entries.
    pub values: bool,
    /// Record-pointer filter: only values whose pointer is in this set
    /// count, and entries with no surviving value are skipped.
    pub filter: Option<Vec<RecordPointer>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            entries: true,
            keys: false,
            values: false,
            filter: None,
        }
    }
}

impl SearchOptions {
    /// Options that only tally counts.
    pub fn count_only() -> Self {
        Self {
            entries: false,
            keys: false,
            values: false,
            filter: None,
        }
    }
}

/// A matched entry with materialized values.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// The entry key.
    pub key: Key,
    /// Materialized values (ext_data loaded, filter applied).
    pub values: Vec<EntryValue>,
    /// Total values before filtering.
    pub total_values: u64,
}

/// Accumulated search output.
#[derive(Debug, Default)]
pub struct SearchResult {
    /// Matched entries, when requested.
    pub entries: Vec<IndexEntry>,
    /// Matched keys, when requested.
    pub keys: Vec<Key>,
    /// Matched values, when requested.
    pub values: Vec<EntryValue>,
    /// Number of matched values (after filtering).
    pub count: u64,
}

/// One matched leaf entry before value materialization and shaping.
#[derive(Debug, Clone)]
pub(crate) struct RawMatch {
    /// The entry key.
    pub key: Key,
    /// Offset of the leaf the entry was found in, for the leaf-level lock
    /// and a fast re-read.
    pub leaf_offset: u64,
    /// Inline values, or an ext_data reference awaiting a locked load.
    pub values: ValueList,
    /// Total values as recorded in the leaf entry.
    pub total_values: u64,
}

impl RawMatch {
    fn new(leaf: &LeafRecord, entry: &node::LeafEntry) -> Self {
        Self {
            key: entry.key.clone(),
            leaf_offset: leaf.offset,
            values: entry.values.clone(),
            total_values: entry.total_values(),
        }
    }

    /// Returns true when the values still live in ext_data.
    pub fn is_pending(&self) -> bool {
        matches!(self.values, ValueList::Ext { .. })
    }
}

/// Returns true when these options require materialized values (and thus
/// leaf-locked ext_data loads for spilled entries).
pub(crate) fn needs_values(opts: &SearchOptions) -> bool {
    opts.entries || opts.values || opts.filter.is_some()
}

fn param_key(param: &SearchParam) -> Result<&Key> {
    match param {
        SearchParam::Key(key) => Ok(key),
        other => Err(ArborError::Internal(format!(
            "operator expects a single key, got {other:?}"
        ))),
    }
}

fn param_range(param: &SearchParam) -> Result<(&Key, &Key)> {
    match param {
        SearchParam::Range(lower, upper) => {
            if lower <= upper {
                Ok((lower, upper))
            } else {
                Ok((upper, lower))
            }
        }
        other => Err(ArborError::Internal(format!(
            "operator expects a range, got {other:?}"
        ))),
    }
}

fn param_keys(param: &SearchParam) -> Result<&[Key]> {
    match param {
        SearchParam::Keys(keys) => Ok(keys),
        other => Err(ArborError::Internal(format!(
            "operator expects a key set, got {other:?}"
        ))),
    }
}

fn param_pattern(param: &SearchParam) -> Result<&str> {
    match param {
        SearchParam::Pattern(p) => Ok(p),
        other => Err(ArborError::Internal(format!(
            "operator expects a pattern, got {other:?}"
        ))),
    }
}

/// Compiles a glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| ArborError::Encoding(format!("bad glob pattern: {e}")))
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ArborError::Encoding(format!("bad regex pattern: {e}")))
}

/// Literal prefix of a glob before its first wildcard.
fn glob_prefix(pattern: &str) -> &str {
    match pattern.find(['*', '?']) {
        Some(at) => &pattern[..at],
        None => pattern,
    }
}

/// Executes one operator's leaf walk, gathering raw matches. Ext_data is
/// never read here; spilled value lists stay as references.
pub(crate) fn collect(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    root: u64,
    op: SearchOp,
    param: &SearchParam,
) -> Result<Vec<RawMatch>> {
    let mut matches = Vec::new();
    match op {
        SearchOp::Eq => {
            let key = param_key(param)?;
            let (leaf, _) = node::find_leaf(reader, ctx, root, key)?;
            if let Ok(at) = leaf.find_entry(key) {
                matches.push(RawMatch::new(&leaf, &leaf.entries[at]));
            }
        }
        SearchOp::NotEq => {
            let key = param_key(param)?.clone();
            scan_all(reader, ctx, root, &mut matches, |k| *k != key)?;
        }
        SearchOp::Lt | SearchOp::LtEq => {
            let key = param_key(param)?.clone();
            let inclusive = op == SearchOp::LtEq;
            let (located, _) = node::find_leaf(reader, ctx, root, &key)?;

            // Walk backward collecting leaves, then emit in key order.
            let mut chain = vec![located];
            loop {
                match node::prev_leaf(reader, ctx, &chain[chain.len() - 1])? {
                    Some(prev) => chain.push(prev),
                    None => break,
                }
            }
            for leaf in chain.into_iter().rev() {
                for entry in &leaf.entries {
                    let keep = match entry.key.compare(&key) {
                        std::cmp::Ordering::Less => true,
                        std::cmp::Ordering::Equal => inclusive,
                        std::cmp::Ordering::Greater => false,
                    };
                    if keep {
                        matches.push(RawMatch::new(&leaf, entry));
                    }
                }
            }
        }
        SearchOp::Gt | SearchOp::GtEq => {
            let key = param_key(param)?.clone();
            let inclusive = op == SearchOp::GtEq;
            let (located, _) = node::find_leaf(reader, ctx, root, &key)?;
            let mut leaf = Some(located);
            while let Some(current) = leaf {
                for entry in &current.entries {
                    let keep = match entry.key.compare(&key) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Equal => inclusive,
                        std::cmp::Ordering::Less => false,
                    };
                    if keep {
                        matches.push(RawMatch::new(&current, entry));
                    }
                }
                leaf = node::next_leaf(reader, ctx, &current)?;
            }
        }
        SearchOp::Between => {
            let (lower, upper) = param_range(param)?;
            let (lower, upper) = (lower.clone(), upper.clone());
            let (located, _) = node::find_leaf(reader, ctx, root, &lower)?;
            let mut leaf = Some(located);
            'walk: while let Some(current) = leaf {
                for entry in &current.entries {
                    if entry.key < lower {
                        continue;
                    }
                    if entry.key > upper {
                        break 'walk;
                    }
                    matches.push(RawMatch::new(&current, entry));
                }
                leaf = node::next_leaf(reader, ctx, &current)?;
            }
        }
        SearchOp::NotBetween => {
            let (lower, upper) = param_range(param)?;
            let (lower, upper) = (lower.clone(), upper.clone());
            scan_all(reader, ctx, root, &mut matches, |k| *k < lower || *k > upper)?;
        }
        SearchOp::In => {
            let mut needles: Vec<Key> = param_keys(param)?.to_vec();
            needles.sort();
            needles.dedup();

            let mut pending = needles.into_iter().peekable();
            while let Some(needle) = pending.next() {
                let (leaf, _) = node::find_leaf(reader, ctx, root, &needle)?;
                if let Ok(at) = leaf.find_entry(&needle) {
                    matches.push(RawMatch::new(&leaf, &leaf.entries[at]));
                }
                // Drain every further needle this leaf already covers.
                while let Some(next) = pending
                    .next_if(|n| leaf.entries.last().is_some_and(|last| *n <= last.key))
                {
                    if let Ok(at) = leaf.find_entry(&next) {
                        matches.push(RawMatch::new(&leaf, &leaf.entries[at]));
                    }
                }
            }
        }
        SearchOp::NotIn => {
            let mut hashed = HashSet::new();
            for needle in param_keys(param)? {
                hashed.insert(needle.to_vec()?);
            }
            scan_all(reader, ctx, root, &mut matches, move |k| {
                k.to_vec().map(|bytes| !hashed.contains(&bytes)).unwrap_or(true)
            })?;
        }
        SearchOp::Like => {
            let pattern = param_pattern(param)?;
            let regex = glob_to_regex(pattern)?;
            let prefix = glob_prefix(pattern).to_string();
            let is_match = move |k: &Key| match k {
                Key::String(s) => regex.is_match(s),
                _ => false,
            };

            if prefix.is_empty() {
                scan_all(reader, ctx, root, &mut matches, is_match)?;
            } else {
                let (located, _) =
                    node::find_leaf(reader, ctx, root, &Key::String(prefix.clone()))?;
                let mut leaf = Some(located);
                while let Some(current) = leaf {
                    for entry in &current.entries {
                        if is_match(&entry.key) {
                            matches.push(RawMatch::new(&current, entry));
                        }
                    }
                    // Stop once this leaf's last key has left the prefix range.
                    let past_prefix = current.entries.last().is_some_and(|last| match &last.key {
                        Key::String(s) => !s.starts_with(&prefix) && s.as_str() > prefix.as_str(),
                        _ => false,
                    });
                    if past_prefix {
                        break;
                    }
                    leaf = node::next_leaf(reader, ctx, &current)?;
                }
            }
        }
        SearchOp::NotLike => {
            let regex = glob_to_regex(param_pattern(param)?)?;
            scan_all(reader, ctx, root, &mut matches, move |k| match k {
                Key::String(s) => !regex.is_match(s),
                _ => true,
            })?;
        }
        SearchOp::Matches => {
            let regex = compile_regex(param_pattern(param)?)?;
            scan_all(reader, ctx, root, &mut matches, move |k| match k {
                Key::String(s) => regex.is_match(s),
                _ => false,
            })?;
        }
        SearchOp::NotMatches => {
            let regex = compile_regex(param_pattern(param)?)?;
            scan_all(reader, ctx, root, &mut matches, move |k| match k {
                Key::String(s) => !regex.is_match(s),
                _ => true,
            })?;
        }
        SearchOp::Exists => {
            scan_all(reader, ctx, root, &mut matches, |k| *k != Key::Undefined)?;
        }
        SearchOp::NotExists => {
            let key = Key::Undefined;
            let (leaf, _) = node::find_leaf(reader, ctx, root, &key)?;
            if let Ok(at) = leaf.find_entry(&key) {
                matches.push(RawMatch::new(&leaf, &leaf.entries[at]));
            }
        }
    }
    Ok(matches)
}

/// Walks every leaf from the first, collecting entries whose key passes
/// the predicate.
fn scan_all(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    root: u64,
    matches: &mut Vec<RawMatch>,
    predicate: impl Fn(&Key) -> bool,
) -> Result<()> {
    let mut leaf = Some(node::first_leaf(reader, ctx, root)?);
    while let Some(current) = leaf {
        for entry in &current.entries {
            if predicate(&entry.key) {
                matches.push(RawMatch::new(&current, entry));
            }
        }
        leaf = node::next_leaf(reader, ctx, &current)?;
    }
    Ok(())
}

/// Loads a pending match's value list from its ext_data block. The caller
/// holds the leaf-level lock. Returns false when the entry no longer
/// exists (it was removed, or its leaf was rebuilt away, between the walk
/// and the locked load); such matches are dropped.
pub(crate) fn materialize_match(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    root: u64,
    m: &mut RawMatch,
) -> Result<bool> {
    // The recorded leaf offset is a hint; a concurrent rebuild may have
    // relocated the leaf, in which case the descent from the root finds it.
    let mut leaf = match node::parse_leaf(reader, ctx, m.leaf_offset) {
        Ok(leaf) => leaf,
        Err(_) => node::find_leaf(reader, ctx, root, &m.key)?.0,
    };
    let at = match leaf.find_entry(&m.key) {
        Ok(at) => at,
        Err(_) => {
            leaf = node::find_leaf(reader, ctx, root, &m.key)?.0;
            match leaf.find_entry(&m.key) {
                Ok(at) => at,
                Err(_) => return Ok(false),
            }
        }
    };

    let entry = leaf.entries[at].clone();
    let values = match &entry.values {
        ValueList::Inline(values) => values.clone(),
        ValueList::Ext { .. } => extdata::load_values(reader, ctx, &leaf, &entry)?,
    };
    m.total_values = values.len() as u64;
    m.values = ValueList::Inline(values);
    Ok(true)
}

/// Shapes materialized matches into the requested result facets. Matches
/// still carrying an ext_data reference contribute their counts and keys
/// only (the caller did not ask for values).
pub(crate) fn shape(matches: Vec<RawMatch>, opts: &SearchOptions) -> SearchResult {
    let filter: Option<HashSet<Vec<u8>>> = opts
        .filter
        .as_ref()
        .map(|rps| rps.iter().map(|rp| rp.to_vec()).collect());

    let mut result = SearchResult::default();
    for m in matches {
        match m.values {
            ValueList::Inline(mut values) => {
                if let Some(allowed) = &filter {
                    values.retain(|v| allowed.contains(v.record_pointer.as_ref()));
                    if values.is_empty() {
                        continue;
                    }
                }
                result.count += values.len() as u64;
                if opts.keys {
                    result.keys.push(m.key.clone());
                }
                if opts.values {
                    result.values.extend(values.iter().cloned());
                }
                if opts.entries {
                    result.entries.push(IndexEntry {
                        key: m.key,
                        values,
                        total_values: m.total_values,
                    });
                }
            }
            ValueList::Ext { .. } => {
                result.count += m.total_values;
                if opts.keys {
                    result.keys.push(m.key);
                }
            }
        }
    }
    result
}

/// Single-threaded search without leaf locking: collect, materialize
/// pending ext_data loads inline, shape. Only for paths that never read
/// ext_data (count-only queries) or that cannot race a mutator (tests).
pub(crate) fn search_unlocked(
    reader: &mut BlockReader,
    ctx: &LayoutContext,
    root: u64,
    op: SearchOp,
    param: &SearchParam,
    opts: &SearchOptions,
) -> Result<SearchResult> {
    let mut matches = collect(reader, ctx, root, op, param)?;
    if needs_values(opts) {
        let mut kept = Vec::with_capacity(matches.len());
        for mut m in matches {
            if m.is_pending() && !materialize_match(reader, ctx, root, &mut m)? {
                continue;
            }
            kept.push(m);
        }
        matches = kept;
    }
    Ok(shape(matches, opts))
}
