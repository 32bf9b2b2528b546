use log::trace;

use crate::error::{FsError, Result};
use crate::file::OpenFile;
use crate::io::BlockNumber;

const BITS_PER_BYTE: usize = 8;

/// Persisted bitmap of free and used blocks, one bit per block, bit set
/// meaning in use.
///
/// The bit vector is itself the byte content of an ordinary file whose
/// metadata record lives at a well-known block, so the allocator can also be
/// built directly over an in-memory buffer during format-time bootstrap,
/// before any file abstraction exists.
///
/// A bit is set iff that block is currently claimed by a live
/// [`FileRecord`](crate::FileRecord) (as metadata block, direct data block,
/// or continuation block) or by one of the bootstrap blocks. Marking a bit
/// that is already set, or clearing one that is already clear, is a bug in
/// the caller's bookkeeping and panics rather than returning an error.
pub struct SectorAllocator {
    bits: Vec<u8>,
    num_blocks: usize,
}

impl SectorAllocator {
    /// An allocator with every block free, for a freshly formatted device.
    pub fn new(num_blocks: usize) -> Self {
        Self {
            bits: vec![0; (num_blocks + BITS_PER_BYTE - 1) / BITS_PER_BYTE],
            num_blocks,
        }
    }

    /// Reads the bit vector back out of the allocator's own file.
    pub fn fetch_from(file: &OpenFile, num_blocks: usize) -> Result<Self> {
        let mut bits = vec![0u8; (num_blocks + BITS_PER_BYTE - 1) / BITS_PER_BYTE];
        let read = file.read_at(&mut bits, 0)?;
        if read != bits.len() {
            return Err(FsError::Corrupted(format!(
                "allocator file holds {} bytes, device needs {}",
                read,
                bits.len()
            )));
        }
        Ok(Self { bits, num_blocks })
    }

    /// Persists the bit vector as the file's byte content.
    pub fn write_back(&self, file: &mut OpenFile) -> Result<()> {
        let written = file.write_at(&self.bits, 0)?;
        if written != self.bits.len() {
            return Err(FsError::Corrupted(format!(
                "allocator file truncated to {} of {} bytes",
                written,
                self.bits.len()
            )));
        }
        Ok(())
    }

    /// Claims the lowest-indexed free block, or `None` if every block is in
    /// use.
    pub fn find_and_set(&mut self) -> Option<BlockNumber> {
        for block in 0..self.num_blocks {
            if !self.test(block) {
                self.bits[block / BITS_PER_BYTE] |= 1 << (block % BITS_PER_BYTE);
                trace!("claimed block {}", block);
                return Some(block);
            }
        }
        None
    }

    /// Whether `block` is currently in use.
    pub fn test(&self, block: BlockNumber) -> bool {
        assert!(block < self.num_blocks, "block {} out of range", block);
        self.bits[block / BITS_PER_BYTE] & (1 << (block % BITS_PER_BYTE)) != 0
    }

    /// Marks `block` used. The block must currently be free.
    pub fn mark(&mut self, block: BlockNumber) {
        assert!(!self.test(block), "marking block {} twice", block);
        self.bits[block / BITS_PER_BYTE] |= 1 << (block % BITS_PER_BYTE);
    }

    /// Releases `block`. The block must currently be in use.
    pub fn clear(&mut self, block: BlockNumber) {
        assert!(self.test(block), "clearing block {} which is not in use", block);
        self.bits[block / BITS_PER_BYTE] &= !(1 << (block % BITS_PER_BYTE));
    }

    /// Free-block count. Advisory pre-check before multi-block claims.
    pub fn num_clear(&self) -> usize {
        (0..self.num_blocks).filter(|&b| !self.test(b)).count()
    }

    /// Number of blocks this allocator tracks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Size of the persisted bit vector in bytes.
    pub fn byte_len(&self) -> usize {
        self.bits.len()
    }
}
