use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use log::debug;

use crate::alloc::SectorAllocator;
use crate::dir::{Directory, DirectoryEntry, DIR_ENTRY_SIZE};
use crate::error::{FsError, Result};
use crate::file::OpenFile;
use crate::io::{BlockNumber, BlockStorage};
use crate::record::FileRecord;

/// Blocks holding the metadata records for the free-space bitmap and the
/// root directory. They are fixed so both structures can be found at boot,
/// before any lookup is otherwise possible.
pub const FREE_MAP_BLOCK: BlockNumber = 0;
pub const ROOT_DIR_BLOCK: BlockNumber = 1;

/// Format-time knobs. The directory capacity applies to the root table and
/// every table created afterwards; it sets the upper bound on entries per
/// directory and never changes once the disk is formatted.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub dir_capacity: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self { dir_capacity: 64 }
    }
}

/// One row of a recursive listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub depth: usize,
    pub is_dir: bool,
}

/// The storage façade: maps textual paths to files on the block device.
///
/// Holds the device and exactly two long-lived open handles, one over the
/// allocator's file and one over the root directory's file, for its entire
/// lifetime. Every operation constructs its working copies of the allocator,
/// tables, and records in memory, and persists them only once the whole
/// operation has succeeded; a failed operation leaves the disk untouched.
/// There is no crash-safe commit protocol: a process dying in the middle of
/// a write-back sequence can corrupt the disk, and that limitation is
/// intentional.
///
/// No internal locking is performed. Callers are expected to serialize
/// mutating operations externally; the block transport underneath serializes
/// individual block requests on its own.
pub struct StorageManager {
    dev: Arc<dyn BlockStorage>,
    free_map_file: OpenFile,
    root_dir_file: OpenFile,
    dir_capacity: usize,
}

impl StorageManager {
    /// Formats the device and brings the subsystem up over it.
    ///
    /// Bootstrap order matters: both metadata records are written to their
    /// well-known blocks before either file is opened, because a handle
    /// wraps the record it reads off the disk. Only then are the bitmap and
    /// the empty root table flushed through the fresh handles.
    pub fn format(dev: Arc<dyn BlockStorage>, opts: FormatOptions) -> Result<Self> {
        debug!(
            "formatting device: {} blocks, {} directory slots",
            dev.block_count(),
            opts.dir_capacity
        );
        let mut free_map = SectorAllocator::new(dev.block_count());
        let root_dir = Directory::new(opts.dir_capacity);

        // The two bootstrap blocks hold the records themselves.
        free_map.mark(FREE_MAP_BLOCK);
        free_map.mark(ROOT_DIR_BLOCK);

        let map_bytes = free_map.byte_len();
        let map_record = FileRecord::allocate(&mut free_map, map_bytes)?;
        let dir_record =
            FileRecord::allocate(&mut free_map, opts.dir_capacity * DIR_ENTRY_SIZE)?;

        map_record.write_back(dev.as_ref(), FREE_MAP_BLOCK)?;
        dir_record.write_back(dev.as_ref(), ROOT_DIR_BLOCK)?;

        let mut free_map_file = OpenFile::open(Arc::clone(&dev), FREE_MAP_BLOCK)?;
        let mut root_dir_file = OpenFile::open(Arc::clone(&dev), ROOT_DIR_BLOCK)?;

        free_map.write_back(&mut free_map_file)?;
        root_dir.write_back(&mut root_dir_file)?;
        dev.sync_disk()?;

        Ok(Self {
            dev,
            free_map_file,
            root_dir_file,
            dir_capacity: opts.dir_capacity,
        })
    }

    /// Brings the subsystem up over an already formatted device. The
    /// directory capacity is rediscovered from the root table's file length.
    pub fn mount(dev: Arc<dyn BlockStorage>) -> Result<Self> {
        let free_map_file = OpenFile::open(Arc::clone(&dev), FREE_MAP_BLOCK)?;
        let root_dir_file = OpenFile::open(Arc::clone(&dev), ROOT_DIR_BLOCK)?;
        let dir_capacity = root_dir_file.length() / DIR_ENTRY_SIZE;
        if dir_capacity == 0 {
            return Err(FsError::Corrupted(
                "root directory file is empty".to_string(),
            ));
        }
        debug!(
            "mounted device: {} blocks, {} directory slots",
            dev.block_count(),
            dir_capacity
        );
        Ok(Self {
            dev,
            free_map_file,
            root_dir_file,
            dir_capacity,
        })
    }

    /// Creates a file of exactly `size` bytes. Files cannot grow afterwards.
    pub fn create(&mut self, path: &str, size: usize) -> Result<()> {
        debug!("creating file {:?}, {} bytes", path, size);
        self.create_object(path, size, false)
    }

    /// Creates an empty directory.
    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        debug!("creating directory {:?}", path);
        self.create_object(path, self.dir_capacity * DIR_ENTRY_SIZE, true)
    }

    fn create_object(&mut self, path: &str, size: usize, is_dir: bool) -> Result<()> {
        let (parent, leaf) = split_path(path);
        if leaf.is_empty() {
            // The root itself.
            return Err(FsError::NameCollision);
        }
        let dir_block = self.resolve_dir(parent)?;

        let mut transient;
        let parent_file: &mut OpenFile = if dir_block == ROOT_DIR_BLOCK {
            &mut self.root_dir_file
        } else {
            transient = OpenFile::open(Arc::clone(&self.dev), dir_block)?;
            &mut transient
        };

        let mut table = Directory::fetch_from(parent_file)?;
        if table.entry(leaf).is_some() {
            return Err(FsError::NameCollision);
        }

        let mut free_map =
            SectorAllocator::fetch_from(&self.free_map_file, self.dev.block_count())?;
        let header = free_map.find_and_set().ok_or(FsError::OutOfSpace)?;
        let record = FileRecord::allocate(&mut free_map, size)?;
        table.add(leaf, header, is_dir)?;

        // Everything worked on the in-memory copies; only now touch the
        // disk, record first so the content handle below has something to
        // wrap.
        record.write_back(self.dev.as_ref(), header)?;
        if is_dir {
            let mut table_file = OpenFile::open(Arc::clone(&self.dev), header)?;
            Directory::new(self.dir_capacity).write_back(&mut table_file)?;
        }
        table.write_back(parent_file)?;
        free_map.write_back(&mut self.free_map_file)?;
        Ok(())
    }

    /// Resolves a path to its file's record and binds a byte-stream handle
    /// over it. A path naming a directory opens the table's own file.
    pub fn open(&self, path: &str) -> Result<OpenFile> {
        debug!("opening {:?}", path);
        let (parent, leaf) = split_path(path);
        if leaf.is_empty() {
            let block = self.resolve_dir(path)?;
            return OpenFile::open(Arc::clone(&self.dev), block);
        }
        let dir_block = self.resolve_dir(parent)?;
        let table = self.load_dir_at(dir_block)?;
        let entry = table.entry(leaf).ok_or(FsError::NotFound)?;
        OpenFile::open(Arc::clone(&self.dev), entry.location)
    }

    /// Removes a file, releasing its data blocks, its metadata blocks, and
    /// its directory slot. A directory must be empty to be removed.
    ///
    /// Handles opened before the removal are not invalidated; see
    /// [`OpenFile`].
    pub fn remove(&mut self, path: &str) -> Result<()> {
        debug!("removing {:?}", path);
        let (parent, leaf) = split_path(path);
        if leaf.is_empty() {
            return Err(FsError::NotFound);
        }
        let dir_block = self.resolve_dir(parent)?;

        let mut transient;
        let parent_file: &mut OpenFile = if dir_block == ROOT_DIR_BLOCK {
            &mut self.root_dir_file
        } else {
            transient = OpenFile::open(Arc::clone(&self.dev), dir_block)?;
            &mut transient
        };

        let mut table = Directory::fetch_from(parent_file)?;
        let entry = table.entry(leaf).ok_or(FsError::NotFound)?;
        if entry.is_dir {
            let table_file = OpenFile::open(Arc::clone(&self.dev), entry.location)?;
            if !Directory::fetch_from(&table_file)?.is_empty() {
                return Err(FsError::DirectoryNotEmpty);
            }
        }

        let record = FileRecord::fetch_from(self.dev.as_ref(), entry.location)?;
        let mut free_map =
            SectorAllocator::fetch_from(&self.free_map_file, self.dev.block_count())?;
        record.deallocate(&mut free_map);
        free_map.clear(entry.location);
        table.remove(leaf)?;

        table.write_back(parent_file)?;
        free_map.write_back(&mut self.free_map_file)?;
        Ok(())
    }

    /// Names in the directory at `path`, in slot order.
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let block = self.resolve_dir(path)?;
        Ok(self.load_dir_at(block)?.names())
    }

    /// Recursive listing rooted at the directory at `path`, depth first in
    /// slot order. The walk keeps a visited set so a corrupted, cyclic tree
    /// terminates instead of looping.
    pub fn list_tree(&self, path: &str) -> Result<Vec<TreeEntry>> {
        let root = self.resolve_dir(path)?;
        let mut visited: HashSet<BlockNumber> = HashSet::new();
        visited.insert(root);

        let mut stack: Vec<(DirectoryEntry, usize)> = Vec::new();
        for entry in self.load_dir_at(root)?.entries().into_iter().rev() {
            stack.push((entry, 0));
        }

        let mut out = Vec::new();
        while let Some((entry, depth)) = stack.pop() {
            let expand = entry.is_dir && visited.insert(entry.location);
            let location = entry.location;
            out.push(TreeEntry {
                name: entry.name,
                depth,
                is_dir: entry.is_dir,
            });
            if expand {
                for child in self.load_dir_at(location)?.entries().into_iter().rev() {
                    stack.push((child, depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// Read-only diagnostic report: allocator occupancy plus the tree with
    /// each file's record layout.
    pub fn dump(&self) -> Result<String> {
        let free_map =
            SectorAllocator::fetch_from(&self.free_map_file, self.dev.block_count())?;
        let used: Vec<BlockNumber> =
            (0..free_map.num_blocks()).filter(|&b| free_map.test(b)).collect();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} blocks, {} free, used: {:?}",
            free_map.num_blocks(),
            free_map.num_clear(),
            used
        );

        let mut visited: HashSet<BlockNumber> = HashSet::new();
        visited.insert(ROOT_DIR_BLOCK);
        let mut stack: Vec<(DirectoryEntry, usize)> = Vec::new();
        for entry in self.load_dir_at(ROOT_DIR_BLOCK)?.entries().into_iter().rev() {
            stack.push((entry, 0));
        }
        while let Some((entry, depth)) = stack.pop() {
            let record = FileRecord::fetch_from(self.dev.as_ref(), entry.location)?;
            let _ = writeln!(
                out,
                "{:indent$}{}{} @ block {}: {} bytes in blocks {:?}",
                "",
                entry.name,
                if entry.is_dir { "/" } else { "" },
                entry.location,
                record.total_length(),
                record.data_blocks(),
                indent = depth * 2
            );
            if entry.is_dir && visited.insert(entry.location) {
                for child in self.load_dir_at(entry.location)?.entries().into_iter().rev() {
                    stack.push((child, depth + 1));
                }
            }
        }
        Ok(out)
    }

    /// Free blocks remaining on the device.
    pub fn free_blocks(&self) -> Result<usize> {
        let free_map =
            SectorAllocator::fetch_from(&self.free_map_file, self.dev.block_count())?;
        Ok(free_map.num_clear())
    }

    fn load_dir_at(&self, block: BlockNumber) -> Result<Directory> {
        if block == ROOT_DIR_BLOCK {
            Directory::fetch_from(&self.root_dir_file)
        } else {
            let file = OpenFile::open(Arc::clone(&self.dev), block)?;
            Directory::fetch_from(&file)
        }
    }

    /// Walks `path` one component at a time from the root, requiring every
    /// component to be an in-use directory entry. The walk is iterative; its
    /// depth is bounded by the number of components in the path.
    fn resolve_dir(&self, path: &str) -> Result<BlockNumber> {
        let mut current = ROOT_DIR_BLOCK;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let table = self.load_dir_at(current)?;
            match table.entry(component) {
                Some(entry) if entry.is_dir => current = entry.location,
                _ => return Err(FsError::PathNotFound),
            }
        }
        Ok(current)
    }
}

/// Splits a path into `(parent, leaf)` at the last separator. A name with
/// no separator resolves against the root; trailing separators are ignored.
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    }
}
