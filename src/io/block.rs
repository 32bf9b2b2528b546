use std::io;

/// The block number to access ranging from 0 (the first block) to n - 1 (the
/// last block) where n is the number of blocks available.
pub type BlockNumber = usize;

/// The raw block-transport primitive: serialized, blocking reads and writes
/// of fixed-size blocks.
///
/// Methods take `&self` because the transport is expected to serialize
/// concurrent block requests itself, the way a device-access service queues
/// requests and wakes callers in order. A caller may block inside any of
/// these methods; it never observes a torn block.
pub trait BlockStorage: Send + Sync {
    /// Reads disk block number into the provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> io::Result<()>;

    /// Writes the provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> io::Result<()>;

    /// Flush any buffered disk IO from memory. This is useful if it must be
    /// guaranteed the disk writes actually occurred, for instance, if being
    /// re-read from disk.
    fn sync_disk(&self) -> io::Result<()>;

    /// Total number of blocks the device exposes, fixed for its lifetime.
    fn block_count(&self) -> usize;
}
