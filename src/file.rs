use std::sync::Arc;

use crate::error::Result;
use crate::io::{BlockNumber, BlockStorage};
use crate::record::FileRecord;
use crate::BLOCK_SIZE;

/// A byte-stream handle bound to one file's metadata record.
///
/// The handle fetches its own copy of the record when opened and resolves
/// every access through it. Files have a fixed size, so reads and writes are
/// clamped to the length set at creation and never grow the block table.
///
/// A handle is *not* invalidated when its file is removed: later I/O through
/// a stale handle operates on blocks that have been freed and possibly
/// reused, returning whatever they now contain. That hazard is inherited
/// from the design and deliberately left undefended; callers close handles
/// before removing files.
pub struct OpenFile {
    dev: Arc<dyn BlockStorage>,
    record: FileRecord,
    location: BlockNumber,
    pos: usize,
}

impl OpenFile {
    /// Binds a handle over the record stored at `location`, which must
    /// already be valid on disk.
    pub fn open(dev: Arc<dyn BlockStorage>, location: BlockNumber) -> Result<Self> {
        let record = FileRecord::fetch_from(dev.as_ref(), location)?;
        Ok(Self {
            dev,
            record,
            location,
            pos: 0,
        })
    }

    /// The file's logical length across its whole record chain.
    pub fn length(&self) -> usize {
        self.record.total_length()
    }

    /// Block holding the file's primary metadata record.
    pub fn location(&self) -> BlockNumber {
        self.location
    }

    /// Moves the seek position used by [`read`](OpenFile::read) and
    /// [`write`](OpenFile::write).
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning how
    /// many were read. Returns 0 at or past end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let length = self.length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(length - offset);
        let mut block_buf = [0u8; BLOCK_SIZE];
        let mut copied = 0;
        while copied < n {
            let at = offset + copied;
            let within = at % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(n - copied);
            self.dev
                .read_block(self.record.byte_to_sector(at), &mut block_buf)?;
            buf[copied..copied + chunk].copy_from_slice(&block_buf[within..within + chunk]);
            copied += chunk;
        }
        Ok(n)
    }

    /// Writes up to `buf.len()` bytes starting at `offset`, returning how
    /// many were written. Partial blocks are read, patched, and written
    /// back; writes past the fixed length are clamped.
    pub fn write_at(&mut self, buf: &[u8], offset: usize) -> Result<usize> {
        let length = self.length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(length - offset);
        let mut block_buf = [0u8; BLOCK_SIZE];
        let mut copied = 0;
        while copied < n {
            let at = offset + copied;
            let within = at % BLOCK_SIZE;
            let chunk = (BLOCK_SIZE - within).min(n - copied);
            let sector = self.record.byte_to_sector(at);
            if chunk < BLOCK_SIZE {
                self.dev.read_block(sector, &mut block_buf)?;
            }
            block_buf[within..within + chunk].copy_from_slice(&buf[copied..copied + chunk]);
            self.dev.write_block(sector, &block_buf)?;
            copied += chunk;
        }
        Ok(n)
    }

    /// Reads from the seek position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }

    /// Writes at the seek position, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.write_at(buf, self.pos)?;
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SectorAllocator;
    use crate::io::FileBlockEmulatorBuilder;

    fn file_of_size(blocks: usize, size: usize) -> OpenFile {
        let fd = tempfile::tempfile().unwrap();
        let dev: Arc<dyn BlockStorage> = Arc::new(
            FileBlockEmulatorBuilder::from(fd)
                .with_block_count(blocks)
                .build()
                .expect("could not initialize disk emulator"),
        );
        let mut map = SectorAllocator::new(blocks);
        map.mark(0);
        let record = FileRecord::allocate(&mut map, size).unwrap();
        record.write_back(dev.as_ref(), 0).unwrap();
        OpenFile::open(dev, 0).unwrap()
    }

    #[test]
    fn writes_read_back_across_block_boundaries() {
        let mut file = file_of_size(16, 300);
        let data: Vec<u8> = (0..100u8).collect();
        assert_eq!(file.write_at(&data, 90).unwrap(), 100);

        let mut buf = vec![0u8; 100];
        assert_eq!(file.read_at(&mut buf, 90).unwrap(), 100);
        assert_eq!(buf, data);

        // Bytes around the span are untouched.
        let mut edge = vec![0xFFu8; 1];
        file.read_at(&mut edge, 89).unwrap();
        assert_eq!(edge, vec![0]);
    }

    #[test]
    fn io_is_clamped_to_file_length() {
        let mut file = file_of_size(16, 100);
        let data = vec![0x5A; 64];
        assert_eq!(file.write_at(&data, 80).unwrap(), 20);
        assert_eq!(file.write_at(&data, 100).unwrap(), 0);

        let mut buf = vec![0u8; 64];
        assert_eq!(file.read_at(&mut buf, 80).unwrap(), 20);
        assert_eq!(&buf[..20], &data[..20]);
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);
        assert_eq!(file.read_at(&mut buf, 4000).unwrap(), 0);
    }

    #[test]
    fn sequential_reads_advance_the_seek_position() {
        let mut file = file_of_size(16, 64);
        let data: Vec<u8> = (0..64u8).collect();
        file.write_at(&data, 0).unwrap();

        let mut chunk = [0u8; 10];
        let mut collected = Vec::new();
        loop {
            let n = file.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn io_spans_the_record_chain() {
        use crate::MAX_FILE_SIZE;

        let mut file = file_of_size(64, MAX_FILE_SIZE + 40);
        let data = vec![0xC3; 60];
        assert_eq!(file.write_at(&data, MAX_FILE_SIZE - 20).unwrap(), 60);

        let mut buf = vec![0u8; 60];
        assert_eq!(file.read_at(&mut buf, MAX_FILE_SIZE - 20).unwrap(), 60);
        assert_eq!(buf, data);
    }
}
