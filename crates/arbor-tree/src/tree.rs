//! The public tree API.
//!
//! A [`BTree`] wraps a byte source and exposes asynchronous lookups,
//! searches, mutations, transactions, and rebuilds. Mutations serialize on
//! a process-wide lock named by the tree id; the leaf being mutated is
//! additionally locked by its offset so ext_data header loads and the
//! writes that follow them stay paired. Reads take no tree lock, but any
//! ext_data value load on the read side acquires the same leaf-level lock
//! first, so a reader never observes a half-applied block mutation.

use crate::alloc::FreeSpaceTable;
use crate::layout::{LayoutContext, TreeHeader};
use crate::mutate::{self, TreeAccess};
use crate::node::{self, LeafRecord};
use crate::rebuild::{self, RebuildOptions};
use crate::search::{self, IndexEntry, SearchOp, SearchOptions, SearchParam, SearchResult};
use crate::builder::TreeBuilder;
use arbor_common::{ArborError, EntryValue, Key, ReaderConfig, RecordPointer, Result, TreeOptions};
use arbor_io::{lock, BlockReader, BlockWriter, ByteSource};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A tagged mutation for [`BTree::transaction`].
#[derive(Debug, Clone)]
pub enum TreeOp {
    /// Add a value under a key.
    Add {
        /// The key.
        key: Key,
        /// The record pointer.
        record_pointer: RecordPointer,
        /// Metadata tuple, in schema order.
        metadata: Vec<Key>,
    },
    /// Remove an entry or one of its values.
    Remove {
        /// The key.
        key: Key,
        /// Specific value to remove; the whole entry when absent.
        record_pointer: Option<RecordPointer>,
    },
    /// Replace a value.
    Update {
        /// The key.
        key: Key,
        /// The new record pointer.
        new_pointer: RecordPointer,
        /// The pointer being replaced; inferred when the entry has one value.
        current_pointer: Option<RecordPointer>,
        /// Metadata for the new value.
        metadata: Vec<Key>,
    },
}

/// A rejected transaction: the failed operation is back at the front of
/// the remaining list.
#[derive(Debug)]
pub struct FailedTransaction {
    /// Why processing stopped.
    pub error: ArborError,
    /// The failed operation followed by every unprocessed one.
    pub remaining: Vec<TreeOp>,
}

/// A persistent, self-describing B+tree over a byte source.
pub struct BTree {
    id: String,
    source: Arc<ByteSource>,
    header: TreeHeader,
    ctx: LayoutContext,
    alloc: Mutex<FreeSpaceTable>,
    reader_config: ReaderConfig,
    lock_timeout: Duration,
}

impl BTree {
    /// Opens an existing tree.
    pub fn open(source: Arc<ByteSource>, id: impl Into<String>) -> Result<Self> {
        // Large enough for any header, including a full metadata key list.
        let head = source.read_at(0, 64 * 1024)?;
        let header = TreeHeader::from_bytes(&head)?;
        let ctx = LayoutContext::from_header(&header);
        let alloc = FreeSpaceTable::new(
            u64::from(header.byte_length),
            u64::from(header.free_bytes.unwrap_or(0)),
            true,
            header.free_bytes_field_offset(),
        );
        Ok(Self {
            id: id.into(),
            source,
            header,
            ctx,
            alloc: Mutex::new(alloc),
            reader_config: ReaderConfig::default(),
            lock_timeout: lock::DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Creates a tree from entries and opens it.
    pub async fn create(
        source: Arc<ByteSource>,
        id: impl Into<String>,
        entries: impl IntoIterator<Item = (Key, EntryValue)>,
        options: TreeOptions,
    ) -> Result<Self> {
        let mut builder = TreeBuilder::new(options);
        for (key, value) in entries {
            builder.add(key, value)?;
        }
        let mut writer = BlockWriter::new(Arc::clone(&source));
        builder.create(&mut writer)?;
        Self::open(source, id)
    }

    /// Builds a tree from a serialized, key-ordered entry stream and opens
    /// it. The stream is read twice.
    pub async fn create_from_entry_stream(
        stream: Arc<ByteSource>,
        target: Arc<ByteSource>,
        id: impl Into<String>,
        options: TreeOptions,
    ) -> Result<Self> {
        let mut reader = BlockReader::new(stream, &ReaderConfig::default());
        let mut writer = BlockWriter::new(Arc::clone(&target));
        rebuild::create_from_entry_stream(&mut reader, &mut writer, &options)?;
        Self::open(target, id)
    }

    /// The tree id (also its lock name).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The parsed tree header.
    pub fn header(&self) -> &TreeHeader {
        &self.header
    }

    /// Changes the lock acquisition timeout.
    pub fn set_lock_timeout(&mut self, timeout: Duration) {
        self.lock_timeout = timeout;
    }

    fn reader(&self) -> BlockReader {
        BlockReader::new(Arc::clone(&self.source), &self.reader_config)
    }

    fn root(&self) -> u64 {
        self.header.root_offset()
    }

    fn leaf_lock_name(&self, leaf_offset: u64) -> String {
        format!("{}:leaf@{leaf_offset}", self.id)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point lookup: the entry stored under `key`, values materialized.
    pub async fn find(&self, key: &Key) -> Result<Option<IndexEntry>> {
        let mut result = self
            .search(
                SearchOp::Eq,
                SearchParam::Key(key.clone()),
                SearchOptions::default(),
            )
            .await?;
        Ok(result.entries.pop())
    }

    /// Executes a search operator.
    ///
    /// The leaf walk itself is lock-free; matches whose values live in
    /// ext_data are loaded afterwards, each under its leaf's lock, before
    /// the result is shaped.
    pub async fn search(
        &self,
        op: SearchOp,
        param: SearchParam,
        options: SearchOptions,
    ) -> Result<SearchResult> {
        let mut reader = self.reader();
        let mut matches = search::collect(&mut reader, &self.ctx, self.root(), op, &param)?;

        if search::needs_values(&options) {
            let mut kept = Vec::with_capacity(matches.len());
            for mut m in matches {
                if m.is_pending() {
                    let _leaf_guard =
                        lock::lock(&self.leaf_lock_name(m.leaf_offset), self.lock_timeout).await?;
                    if !search::materialize_match(&mut reader, &self.ctx, self.root(), &mut m)? {
                        // The entry disappeared between the walk and the
                        // locked load.
                        continue;
                    }
                }
                kept.push(m);
            }
            matches = kept;
        }
        Ok(search::shape(matches, &options))
    }

    /// Counts the values matched by an operator without materializing
    /// them. Counts come from the leaf entries alone, so no ext_data is
    /// read and no leaf lock is needed.
    pub async fn count(&self, op: SearchOp, param: SearchParam) -> Result<u64> {
        let mut reader = self.reader();
        let result = search::search_unlocked(
            &mut reader,
            &self.ctx,
            self.root(),
            op,
            &param,
            &SearchOptions::count_only(),
        )?;
        Ok(result.count)
    }

    /// The leaf covering `key`.
    pub async fn find_leaf(&self, key: &Key) -> Result<LeafRecord> {
        let mut reader = self.reader();
        let (leaf, _) = node::find_leaf(&mut reader, &self.ctx, self.root(), key)?;
        Ok(leaf)
    }

    /// The first leaf in key order.
    pub async fn first_leaf(&self) -> Result<LeafRecord> {
        let mut reader = self.reader();
        node::first_leaf(&mut reader, &self.ctx, self.root())
    }

    /// The last leaf in key order.
    pub async fn last_leaf(&self) -> Result<LeafRecord> {
        let mut reader = self.reader();
        node::last_leaf(&mut reader, &self.ctx, self.root())
    }

    /// The next leaf after `leaf`, if any.
    pub async fn next_leaf(&self, leaf: &LeafRecord) -> Result<Option<LeafRecord>> {
        let mut reader = self.reader();
        node::next_leaf(&mut reader, &self.ctx, leaf)
    }

    /// The leaf before `leaf`, if any.
    pub async fn prev_leaf(&self, leaf: &LeafRecord) -> Result<Option<LeafRecord>> {
        let mut reader = self.reader();
        node::prev_leaf(&mut reader, &self.ctx, leaf)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Adds a value under `key`.
    pub async fn add(&self, key: Key, record_pointer: RecordPointer, metadata: Vec<Key>) -> Result<()> {
        let _guard = lock::lock(&self.id, self.lock_timeout).await?;
        self.add_locked(key, record_pointer, metadata).await
    }

    /// Removes the entry under `key`, or just the value matching
    /// `record_pointer` on a non-unique tree.
    pub async fn remove(&self, key: Key, record_pointer: Option<RecordPointer>) -> Result<()> {
        let _guard = lock::lock(&self.id, self.lock_timeout).await?;
        self.remove_locked(key, record_pointer).await
    }

    /// Replaces the value under `key` (selected by `current_pointer` on
    /// non-unique trees) with a new pointer and metadata.
    pub async fn update(
        &self,
        key: Key,
        new_pointer: RecordPointer,
        current_pointer: Option<RecordPointer>,
        metadata: Vec<Key>,
    ) -> Result<()> {
        let _guard = lock::lock(&self.id, self.lock_timeout).await?;
        self.update_locked(key, new_pointer, current_pointer, metadata).await
    }

    /// Processes tagged operations in order under one tree lock. On the
    /// first failure the failed operation is pushed back to the front of
    /// the unprocessed list and the whole batch rejects.
    pub async fn transaction(&self, ops: Vec<TreeOp>) -> std::result::Result<(), FailedTransaction> {
        let _guard = match lock::lock(&self.id, self.lock_timeout).await {
            Ok(guard) => guard,
            Err(error) => {
                return Err(FailedTransaction {
                    error,
                    remaining: ops,
                })
            }
        };

        let mut pending = ops.into_iter();
        while let Some(op) = pending.next() {
            let outcome = match op.clone() {
                TreeOp::Add {
                    key,
                    record_pointer,
                    metadata,
                } => self.add_locked(key, record_pointer, metadata).await,
                TreeOp::Remove {
                    key,
                    record_pointer,
                } => self.remove_locked(key, record_pointer).await,
                TreeOp::Update {
                    key,
                    new_pointer,
                    current_pointer,
                    metadata,
                } => {
                    self.update_locked(key, new_pointer, current_pointer, metadata)
                        .await
                }
            };
            if let Err(error) = outcome {
                debug!(tree = %self.id, %error, "transaction rejected");
                let mut remaining = vec![op];
                remaining.extend(pending);
                return Err(FailedTransaction { error, remaining });
            }
        }
        Ok(())
    }

    /// Rebuilds this tree into a fresh byte source with restored fill
    /// factors, returning the rebuilt tree.
    pub async fn rebuild(
        &self,
        target: Arc<ByteSource>,
        options: RebuildOptions,
    ) -> Result<BTree> {
        let _guard = lock::lock(&self.id, self.lock_timeout).await?;
        let mut reader = self.reader();
        let mut writer = BlockWriter::new(Arc::clone(&target));
        rebuild::rebuild_tree(&mut reader, &self.header, &mut writer, &options)?;
        BTree::open(target, self.id.clone())
    }

    /// Drops this tree's lock registry entries.
    pub fn close(self) {
        lock::forget(&self.id);
    }

    async fn add_locked(
        &self,
        key: Key,
        record_pointer: RecordPointer,
        metadata: Vec<Key>,
    ) -> Result<()> {
        let value = EntryValue::with_metadata(record_pointer, metadata);
        let leaf_lock = self.lock_target_leaf(&key).await?;
        let result = self.with_access(|access| mutate::add(access, &key, value.clone()));
        drop(leaf_lock);
        result
    }

    async fn remove_locked(&self, key: Key, record_pointer: Option<RecordPointer>) -> Result<()> {
        let leaf_lock = self.lock_target_leaf(&key).await?;
        let result =
            self.with_access(|access| mutate::remove(access, &key, record_pointer.as_ref()));
        drop(leaf_lock);
        result
    }

    async fn update_locked(
        &self,
        key: Key,
        new_pointer: RecordPointer,
        current_pointer: Option<RecordPointer>,
        metadata: Vec<Key>,
    ) -> Result<()> {
        let replacement = EntryValue::with_metadata(new_pointer, metadata);
        let leaf_lock = self.lock_target_leaf(&key).await?;
        let result = self.with_access(|access| {
            mutate::update(access, &key, replacement.clone(), current_pointer.as_ref())
        });
        drop(leaf_lock);
        result
    }

    /// Locks the leaf currently covering `key` so ext_data header loads
    /// and their writes stay paired.
    async fn lock_target_leaf(&self, key: &Key) -> Result<lock::NamedLock> {
        let mut reader = self.reader();
        let (leaf, _) = node::find_leaf(&mut reader, &self.ctx, self.root(), key)?;
        lock::lock(&self.leaf_lock_name(leaf.offset), self.lock_timeout).await
    }

    fn with_access<R>(&self, f: impl FnOnce(&mut TreeAccess<'_>) -> R) -> R {
        let mut reader = self.reader();
        let mut writer = BlockWriter::new(Arc::clone(&self.source));
        let mut alloc = self.alloc.lock();
        let mut access = TreeAccess {
            reader: &mut reader,
            writer: &mut writer,
            ctx: self.ctx.clone(),
            root: self.root(),
            alloc: &mut *alloc,
        };
        f(&mut access)
    }
}
