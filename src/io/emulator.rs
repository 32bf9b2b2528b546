use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::sync::Mutex;

use crate::io::block::{BlockNumber, BlockStorage};
use crate::BLOCK_SIZE;

/// Emulates block disk/flash storage in userspace using a file as block
/// storage. This is only meant to be used for file system development and
/// testing.
///
/// The file is guarded by a mutex so that any number of handles can share
/// one device; block requests are serialized in arrival order, which is the
/// discipline the storage layer assumes of its transport.
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of
    /// a block.
    fd: Mutex<File>,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn read_block(&self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }

        let mut fd = self.fd.lock().unwrap_or_else(|e| e.into_inner());
        fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        fd.read_exact(&mut buf[0..BLOCK_SIZE])?;
        Ok(())
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }

        let max = if BLOCK_SIZE < buf.len() {
            BLOCK_SIZE
        } else {
            buf.len()
        };
        let mut fd = self.fd.lock().unwrap_or_else(|e| e.into_inner());
        fd.seek(SeekFrom::Start((blocknr * BLOCK_SIZE) as u64))?;
        fd.write_all(&buf[0..max])?;
        Ok(())
    }

    fn sync_disk(&self) -> std::io::Result<()> {
        let fd = self.fd.lock().unwrap_or_else(|e| e.into_inner());
        fd.sync_all()?;
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.block_count
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of blocks exposed by the emulated device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether to zero the backing medium on build. Pass `false` to reopen
    /// a previously formatted disk image without wiping it.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally,
    /// ownership of the file is transferred to the emulator meaning this
    /// builder can only be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        debug_assert!(self.block_count > 0);
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: Mutex::new(self.fd),
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        let mut bfd = BufWriter::new(&self.fd);
        bfd.seek(SeekFrom::Start(0))?;
        // Zero out the "disk" blocks, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.block_count {
            bfd.write_all(&[0u8; BLOCK_SIZE])?;
        }
        bfd.flush()?;
        Ok(())
    }
}
