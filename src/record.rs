use log::trace;

use crate::alloc::SectorAllocator;
use crate::error::{FsError, Result};
use crate::io::{BlockNumber, BlockStorage};
use crate::{BLOCK_SIZE, MAX_FILE_SIZE, NUM_DIRECT};

/// Bytes taken by the three header fields of a serialized segment.
const SEGMENT_HEADER_BYTES: usize = 12;
/// On-disk sentinel for "no continuation".
const NO_NEXT: i32 = -1;

/// One fixed-capacity span of a file's metadata: up to [`NUM_DIRECT`] data
/// blocks covering up to [`MAX_FILE_SIZE`] bytes, plus the block hosting the
/// next segment's record, if the file needs one.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    num_bytes: usize,
    sectors: Vec<BlockNumber>,
    next: Option<BlockNumber>,
}

/// The on-disk metadata describing a file's size and physical block
/// placement (the inode analog).
///
/// A file longer than one record can cover is described by a chain of
/// records, each serialized into its own block. In memory the chain is an
/// explicit sequence of segments rather than a recursive owning pointer, so
/// cleanup touches every claimed block exactly once and a corrupted chain
/// cannot recurse without bound. Segment 0 lives at whatever block the
/// record is written to; segment `i + 1` lives at segment `i`'s continuation
/// block.
///
/// Serialized layout per block, big-endian 4-byte signed fields:
/// `num_sectors`, `num_bytes`, continuation block (−1 = none), then
/// `num_sectors` data-block indices. The remainder of the block is zero.
///
/// Instances are built per operation, via [`allocate`](FileRecord::allocate)
/// for new files or [`fetch_from`](FileRecord::fetch_from) for existing
/// ones, and either written back or discarded before the operation returns. A
/// record that was allocated or fetched must be passed to
/// [`deallocate`](FileRecord::deallocate) exactly once before it is dropped
/// for good, or its blocks leak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    segments: Vec<Segment>,
}

impl FileRecord {
    /// Claims blocks for a fresh file of `size` bytes, lowest index first.
    ///
    /// Each segment covers `min(remaining, MAX_FILE_SIZE)` bytes; while
    /// bytes remain, one more block is claimed to host the next segment's
    /// record. Fails with `OutOfSpace` without claiming anything for a
    /// segment whose data blocks cannot all be satisfied. The caller is
    /// expected to discard its in-memory allocator copy on failure, so a
    /// failed call never results in durable claims.
    pub fn allocate(allocator: &mut SectorAllocator, size: usize) -> Result<Self> {
        let mut segments = Vec::new();
        let mut remaining = size;
        loop {
            let num_bytes = remaining.min(MAX_FILE_SIZE);
            let num_sectors = (num_bytes + BLOCK_SIZE - 1) / BLOCK_SIZE;
            if allocator.num_clear() < num_sectors {
                return Err(FsError::OutOfSpace);
            }
            let mut sectors = Vec::with_capacity(num_sectors);
            for _ in 0..num_sectors {
                sectors.push(allocator.find_and_set().ok_or(FsError::OutOfSpace)?);
            }
            remaining -= num_bytes;
            if remaining == 0 {
                segments.push(Segment {
                    num_bytes,
                    sectors,
                    next: None,
                });
                break;
            }
            let next = allocator.find_and_set().ok_or(FsError::OutOfSpace)?;
            segments.push(Segment {
                num_bytes,
                sectors,
                next: Some(next),
            });
        }
        trace!(
            "allocated {} bytes across {} record segment(s)",
            size,
            segments.len()
        );
        Ok(Self { segments })
    }

    /// Releases every data block of every segment and every continuation
    /// block. The record's own primary metadata block is released by the
    /// caller, which knows where the record was fetched from.
    pub fn deallocate(&self, allocator: &mut SectorAllocator) {
        for segment in &self.segments {
            for &sector in &segment.sectors {
                allocator.clear(sector);
            }
            if let Some(next) = segment.next {
                allocator.clear(next);
            }
        }
    }

    /// Reads the record chain starting at `location` back off the disk.
    ///
    /// The walk is iterative and refuses chains longer than the device has
    /// blocks, so cyclic or garbage continuation fields surface as
    /// `Corrupted` instead of looping forever.
    pub fn fetch_from(dev: &dyn BlockStorage, location: BlockNumber) -> Result<Self> {
        let block_count = dev.block_count();
        let mut segments = Vec::new();
        let mut cursor = Some(location);
        let mut buf = [0u8; BLOCK_SIZE];
        while let Some(block) = cursor {
            if segments.len() >= block_count {
                return Err(FsError::Corrupted(format!(
                    "record chain at block {} exceeds device size",
                    location
                )));
            }
            dev.read_block(block, &mut buf)?;

            let num_sectors = read_i32(&buf, 0);
            let num_bytes = read_i32(&buf, 4);
            let next = read_i32(&buf, 8);
            if num_sectors < 0 || num_sectors as usize > NUM_DIRECT {
                return Err(FsError::Corrupted(format!(
                    "record at block {} claims {} sectors",
                    block, num_sectors
                )));
            }
            if num_bytes < 0
                || num_bytes as usize > MAX_FILE_SIZE
                || (num_bytes as usize + BLOCK_SIZE - 1) / BLOCK_SIZE != num_sectors as usize
            {
                return Err(FsError::Corrupted(format!(
                    "record at block {} has inconsistent length {}",
                    block, num_bytes
                )));
            }
            if next != NO_NEXT && (next < 0 || next as usize >= block_count) {
                return Err(FsError::Corrupted(format!(
                    "record at block {} points past the device",
                    block
                )));
            }

            let mut sectors = Vec::with_capacity(num_sectors as usize);
            for i in 0..num_sectors as usize {
                let sector = read_i32(&buf, SEGMENT_HEADER_BYTES + 4 * i);
                if sector < 0 || sector as usize >= block_count {
                    return Err(FsError::Corrupted(format!(
                        "record at block {} lists data block {}",
                        block, sector
                    )));
                }
                sectors.push(sector as BlockNumber);
            }

            cursor = if next == NO_NEXT {
                None
            } else {
                Some(next as BlockNumber)
            };
            segments.push(Segment {
                num_bytes: num_bytes as usize,
                sectors,
                next: cursor,
            });
        }
        Ok(Self { segments })
    }

    /// Serializes the chain, segment 0 at `location`, every later segment at
    /// its predecessor's continuation block.
    pub fn write_back(&self, dev: &dyn BlockStorage, location: BlockNumber) -> Result<()> {
        let mut block = location;
        for segment in &self.segments {
            let mut buf = [0u8; BLOCK_SIZE];
            write_i32(&mut buf, 0, segment.sectors.len() as i32);
            write_i32(&mut buf, 4, segment.num_bytes as i32);
            write_i32(
                &mut buf,
                8,
                segment.next.map(|n| n as i32).unwrap_or(NO_NEXT),
            );
            for (i, &sector) in segment.sectors.iter().enumerate() {
                write_i32(&mut buf, SEGMENT_HEADER_BYTES + 4 * i, sector as i32);
            }
            dev.write_block(block, &buf)?;
            if let Some(next) = segment.next {
                block = next;
            }
        }
        Ok(())
    }

    /// Translates a byte offset within the file to the block storing it.
    /// The caller must guarantee `offset` is within the file's total length;
    /// anything else is a bookkeeping bug and panics.
    pub fn byte_to_sector(&self, offset: usize) -> BlockNumber {
        let index = offset / MAX_FILE_SIZE;
        assert!(
            index < self.segments.len(),
            "offset {} beyond record chain",
            offset
        );
        let segment = &self.segments[index];
        let within = offset % MAX_FILE_SIZE;
        assert!(
            within < segment.num_bytes,
            "offset {} beyond file length",
            offset
        );
        segment.sectors[within / BLOCK_SIZE]
    }

    /// Bytes covered by the first record alone.
    pub fn file_length(&self) -> usize {
        self.segments[0].num_bytes
    }

    /// Bytes covered by the whole chain: the file's logical length.
    pub fn total_length(&self) -> usize {
        self.segments.iter().map(|s| s.num_bytes).sum()
    }

    /// Number of chained records describing this file.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    /// Every data block claimed for file content, in file order. Does not
    /// include the blocks hosting the records themselves.
    pub fn data_blocks(&self) -> Vec<BlockNumber> {
        self.segments
            .iter()
            .flat_map(|s| s.sectors.iter().copied())
            .collect()
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    i32::from_be_bytes(raw)
}

fn write_i32(buf: &mut [u8], at: usize, value: i32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}
