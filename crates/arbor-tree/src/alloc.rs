//! Free-space allocation within the tree's byte region.
//!
//! New leaf and ext_data regions come from two pools: reclaimed regions
//! released by earlier rebuilds, and the preallocated free tail at the end
//! of the region. The tail length is persisted in the tree header so a
//! reopened tree resumes with the same bookkeeping; the reclaimed list is
//! in-memory only and rebuilt as regions are released.

use arbor_common::{ArborError, Result};
use arbor_io::BlockWriter;
use tracing::{debug, warn};

/// A contiguous reusable byte region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Absolute start offset.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
}

/// Allocation statistics, surfaced for rebuild decisions and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceStats {
    /// Total tree byte length.
    pub byte_length: u64,
    /// Free tail length.
    pub free_tail: u64,
    /// Sum of reclaimed region lengths.
    pub reclaimed: u64,
}

/// Tracks and satisfies space requests for one tree.
pub struct FreeSpaceTable {
    /// Total tree byte length, free tail included.
    byte_length: u64,
    /// Free bytes at the end of the region.
    free_tail: u64,
    /// Byte length when the table was created; the waste threshold is
    /// measured against this.
    original_length: u64,
    /// Regions released by leaf rebuilds, newest last.
    reclaimed: Vec<Region>,
    /// Extend the backing region when the tail runs out.
    auto_grow: bool,
    /// Absolute offset of the header's free-byte-length field.
    header_free_field: Option<u64>,
}

impl FreeSpaceTable {
    /// Reclaimed bytes beyond this share of the original length demand a
    /// full rebuild instead of further allocation.
    pub const WASTE_THRESHOLD: f64 = 0.5;

    /// Below this many reclaimed bytes the waste check stays quiet; small
    /// trees churn through proportionally large regions while growing.
    pub const WASTE_FLOOR: u64 = 128 * 1024;

    /// Creates a table from header state.
    pub fn new(
        byte_length: u64,
        free_tail: u64,
        auto_grow: bool,
        header_free_field: Option<u64>,
    ) -> Self {
        Self {
            byte_length,
            free_tail,
            original_length: byte_length,
            reclaimed: Vec::new(),
            auto_grow,
            header_free_field,
        }
    }

    /// Total tree byte length.
    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Current free tail length.
    pub fn free_tail(&self) -> u64 {
        self.free_tail
    }

    /// Absolute offset where the free tail begins.
    pub fn tail_start(&self) -> u64 {
        self.byte_length - self.free_tail
    }

    /// Current statistics.
    pub fn stats(&self) -> FreeSpaceStats {
        FreeSpaceStats {
            byte_length: self.byte_length,
            free_tail: self.free_tail,
            reclaimed: self.reclaimed.iter().map(|r| r.length).sum(),
        }
    }

    /// Reserves `length` bytes, best-fit over reclaimed regions first, then
    /// the free tail, then (when enabled) by growing the backing region.
    /// Header bookkeeping is persisted through `writer`.
    pub fn request(&mut self, length: u64, writer: &mut BlockWriter) -> Result<u64> {
        if length == 0 {
            return Err(ArborError::Internal("zero-length allocation".to_string()));
        }

        let stats = self.stats();
        if stats.reclaimed > Self::WASTE_FLOOR
            && stats.reclaimed as f64 > self.original_length as f64 * Self::WASTE_THRESHOLD
        {
            warn!(
                reclaimed = stats.reclaimed,
                original = self.original_length,
                "reclaimed space past threshold"
            );
            return Err(ArborError::RebuildRequired(format!(
                "{} reclaimed bytes exceed 50% of the original {} byte region",
                stats.reclaimed, self.original_length
            )));
        }

        // Best fit: the smallest reclaimed region that satisfies the request.
        let best = self
            .reclaimed
            .iter()
            .enumerate()
            .filter(|(_, r)| r.length >= length)
            .min_by_key(|(_, r)| r.length)
            .map(|(i, _)| i);
        if let Some(i) = best {
            let region = self.reclaimed[i];
            if region.length == length {
                self.reclaimed.remove(i);
            } else {
                // Keep the remainder reclaimed.
                self.reclaimed[i] = Region {
                    offset: region.offset + length,
                    length: region.length - length,
                };
            }
            debug!(offset = region.offset, length, "allocation from reclaimed region");
            return Ok(region.offset);
        }

        if self.free_tail < length {
            if !self.auto_grow {
                return Err(ArborError::NoSpace {
                    requested: length,
                    available: self.free_tail,
                });
            }
            let grow = length - self.free_tail;
            writer.source().extend(grow)?;
            self.byte_length += grow;
            self.free_tail += grow;
            debug!(grow, new_length = self.byte_length, "tree region grown");
        }

        let offset = self.tail_start();
        self.free_tail -= length;
        self.persist(writer)?;
        debug!(offset, length, "allocation from free tail");
        Ok(offset)
    }

    /// Returns a region to the pool. Regions touching the free tail extend
    /// it; everything else joins the reclaimed list.
    pub fn release(&mut self, region: Region, writer: &mut BlockWriter) -> Result<()> {
        if region.length == 0 {
            return Ok(());
        }
        if region.offset + region.length == self.tail_start() {
            self.free_tail += region.length;
            // A reclaimed region may now touch the tail as well.
            while let Some(i) = self
                .reclaimed
                .iter()
                .position(|r| r.offset + r.length == self.tail_start())
            {
                self.free_tail += self.reclaimed[i].length;
                self.reclaimed.remove(i);
            }
            self.persist(writer)?;
        } else {
            self.merge_reclaimed(region);
        }
        debug!(offset = region.offset, length = region.length, "region released");
        Ok(())
    }

    /// Inserts a region into the reclaimed list, merging neighbors.
    fn merge_reclaimed(&mut self, mut region: Region) {
        loop {
            let adjacent = self.reclaimed.iter().position(|r| {
                r.offset + r.length == region.offset || region.offset + region.length == r.offset
            });
            match adjacent {
                Some(i) => {
                    let other = self.reclaimed.remove(i);
                    let offset = region.offset.min(other.offset);
                    region = Region {
                        offset,
                        length: region.length + other.length,
                    };
                }
                None => break,
            }
        }
        self.reclaimed.push(region);
    }

    /// Writes the current byte length and free tail into the header.
    fn persist(&self, writer: &mut BlockWriter) -> Result<()> {
        writer.write_at(&(self.byte_length as u32).to_be_bytes(), 0)?;
        if let Some(at) = self.header_free_field {
            writer.write_at(&(self.free_tail as u32).to_be_bytes(), at)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_io::ByteSource;
    use std::sync::Arc;

    fn setup(byte_length: u64, free_tail: u64, auto_grow: bool) -> (FreeSpaceTable, BlockWriter) {
        let source = Arc::new(ByteSource::memory_from(vec![0u8; byte_length as usize]));
        let writer = BlockWriter::new(source);
        let table = FreeSpaceTable::new(byte_length, free_tail, auto_grow, Some(7));
        (table, writer)
    }

    #[test]
    fn test_tail_allocation() {
        let (mut table, mut writer) = setup(1000, 300, false);
        assert_eq!(table.tail_start(), 700);

        let at = table.request(100, &mut writer).unwrap();
        assert_eq!(at, 700);
        assert_eq!(table.free_tail(), 200);

        let at = table.request(200, &mut writer).unwrap();
        assert_eq!(at, 800);
        assert_eq!(table.free_tail(), 0);
    }

    #[test]
    fn test_tail_exhausted_no_grow() {
        let (mut table, mut writer) = setup(1000, 50, false);
        let err = table.request(100, &mut writer).unwrap_err();
        match err {
            ArborError::NoSpace { requested, available } => {
                assert_eq!(requested, 100);
                assert_eq!(available, 50);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_auto_grow() {
        let (mut table, mut writer) = setup(1000, 50, true);
        let at = table.request(100, &mut writer).unwrap();
        assert_eq!(at, 950);
        assert_eq!(table.byte_length(), 1050);
        assert_eq!(table.free_tail(), 0);
        // The backing region actually grew.
        assert_eq!(writer.source().len(), 1050);
    }

    #[test]
    fn test_best_fit_over_reclaimed() {
        let (mut table, mut writer) = setup(1000, 100, false);
        table.release(Region { offset: 100, length: 80 }, &mut writer).unwrap();
        table.release(Region { offset: 300, length: 40 }, &mut writer).unwrap();
        table.release(Region { offset: 500, length: 60 }, &mut writer).unwrap();

        // 40 is the tightest fit for 30.
        let at = table.request(30, &mut writer).unwrap();
        assert_eq!(at, 300);
        // Remainder stays reclaimed.
        assert_eq!(table.stats().reclaimed, 80 + 10 + 60);
    }

    #[test]
    fn test_release_merges_into_tail() {
        let (mut table, mut writer) = setup(1000, 100, false);
        assert_eq!(table.tail_start(), 900);

        table.release(Region { offset: 850, length: 50 }, &mut writer).unwrap();
        assert_eq!(table.free_tail(), 150);
        assert_eq!(table.stats().reclaimed, 0);
    }

    #[test]
    fn test_release_chain_merges_into_tail() {
        let (mut table, mut writer) = setup(1000, 100, false);
        // Not tail-adjacent yet.
        table.release(Region { offset: 800, length: 50 }, &mut writer).unwrap();
        assert_eq!(table.stats().reclaimed, 50);
        // This one touches the tail, and then the first one does too.
        table.release(Region { offset: 850, length: 50 }, &mut writer).unwrap();
        assert_eq!(table.free_tail(), 200);
        assert_eq!(table.stats().reclaimed, 0);
    }

    #[test]
    fn test_adjacent_reclaimed_regions_merge() {
        let (mut table, mut writer) = setup(1000, 0, false);
        table.release(Region { offset: 100, length: 50 }, &mut writer).unwrap();
        table.release(Region { offset: 150, length: 50 }, &mut writer).unwrap();

        // One merged region of 100 satisfies a 100-byte request.
        let at = table.request(100, &mut writer).unwrap();
        assert_eq!(at, 100);
    }

    #[test]
    fn test_waste_threshold_rejects() {
        let (mut table, mut writer) = setup(280_000, 100, false);
        table
            .release(Region { offset: 100, length: 150_000 }, &mut writer)
            .unwrap();

        let err = table.request(10, &mut writer).unwrap_err();
        assert!(matches!(err, ArborError::RebuildRequired(_)));
    }

    #[test]
    fn test_waste_floor_tolerates_small_churn() {
        // Over half the region reclaimed, but under the absolute floor.
        let (mut table, mut writer) = setup(1000, 100, false);
        table.release(Region { offset: 100, length: 600 }, &mut writer).unwrap();
        assert!(table.request(10, &mut writer).is_ok());
    }

    #[test]
    fn test_header_persistence() {
        let (mut table, mut writer) = setup(1000, 300, false);
        table.request(100, &mut writer).unwrap();

        // byte_length at offset 0, free tail at offset 7.
        let head = writer.source().read_at(0, 11).unwrap();
        let byte_length = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        let free = u32::from_be_bytes([head[7], head[8], head[9], head[10]]);
        assert_eq!(byte_length, 1000);
        assert_eq!(free, 200);
    }
}
