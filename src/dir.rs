use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{FsError, Result};
use crate::file::OpenFile;
use crate::io::BlockNumber;

/// Longest name a directory entry stores; longer names are truncated at
/// insertion, as they always were.
pub const FILE_NAME_MAX: usize = 26;

/// Size of one serialized directory entry.
pub const DIR_ENTRY_SIZE: usize = 32;

/// On-disk shape of one table slot: flag bytes, the block of the target's
/// metadata record, and the zero-padded name.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
struct RawEntry {
    in_use: u8,
    is_dir: u8,
    location: [u8; 4],
    name: [u8; FILE_NAME_MAX],
}

impl RawEntry {
    fn free() -> Self {
        Self {
            in_use: 0,
            is_dir: 0,
            location: [0; 4],
            name: [0; FILE_NAME_MAX],
        }
    }

    fn location(&self) -> BlockNumber {
        u32::from_be_bytes(self.location) as BlockNumber
    }
}

/// One in-use directory entry, as handed out to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub location: BlockNumber,
    pub is_dir: bool,
}

/// A fixed-capacity table mapping names to the blocks holding their
/// metadata records.
///
/// The table is serialized as the byte content of an ordinary file, so a
/// directory *is* a file; entries flagged as directories point at the record
/// of another table's file, which builds the tree. Capacity is the file
/// length over the entry size, fixed at creation; the table never grows.
/// Removal only clears a slot's in-use flag; the slot is reused by a later
/// add and the table is never compacted.
pub struct Directory {
    entries: Vec<RawEntry>,
}

impl Directory {
    /// An empty table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![RawEntry::free(); capacity],
        }
    }

    /// Reads a table out of the file holding it.
    pub fn fetch_from(file: &OpenFile) -> Result<Self> {
        let capacity = file.length() / DIR_ENTRY_SIZE;
        let mut buf = vec![0u8; capacity * DIR_ENTRY_SIZE];
        let read = file.read_at(&mut buf, 0)?;
        if read != buf.len() {
            return Err(FsError::Corrupted(format!(
                "directory file holds {} of {} bytes",
                read,
                buf.len()
            )));
        }
        let mut entries = Vec::with_capacity(capacity);
        for chunk in buf.chunks_exact(DIR_ENTRY_SIZE) {
            let entry = LayoutVerified::<_, RawEntry>::new_unaligned(chunk)
                .ok_or_else(|| FsError::Corrupted("malformed directory entry".to_string()))?;
            entries.push(*entry);
        }
        Ok(Self { entries })
    }

    /// Serializes the full table back into its file.
    pub fn write_back(&self, file: &mut OpenFile) -> Result<()> {
        let mut buf = Vec::with_capacity(self.entries.len() * DIR_ENTRY_SIZE);
        for entry in &self.entries {
            buf.extend_from_slice(entry.as_bytes());
        }
        let written = file.write_at(&buf, 0)?;
        if written != buf.len() {
            return Err(FsError::Corrupted(format!(
                "directory file truncated to {} of {} bytes",
                written,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Looks a name up, returning the block of its metadata record.
    pub fn find(&self, name: &str) -> Option<BlockNumber> {
        self.entry(name).map(|e| e.location)
    }

    /// Linear scan of in-use entries for an exact (truncated) name match.
    pub fn entry(&self, name: &str) -> Option<DirectoryEntry> {
        let wanted = bounded_name(name);
        self.entries
            .iter()
            .find(|e| e.in_use != 0 && e.name == wanted)
            .map(|e| DirectoryEntry {
                name: stored_name(&e.name),
                location: e.location(),
                is_dir: e.is_dir != 0,
            })
    }

    /// Adds a name to the first free slot.
    pub fn add(&mut self, name: &str, location: BlockNumber, is_dir: bool) -> Result<()> {
        if self.entry(name).is_some() {
            return Err(FsError::NameCollision);
        }
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.in_use == 0)
            .ok_or(FsError::DirectoryFull)?;
        *slot = RawEntry {
            in_use: 1,
            is_dir: is_dir as u8,
            location: (location as u32).to_be_bytes(),
            name: bounded_name(name),
        };
        Ok(())
    }

    /// Clears the matching entry's in-use flag. The slot keeps its stale
    /// bytes until something reuses it.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let wanted = bounded_name(name);
        let slot = self
            .entries
            .iter_mut()
            .find(|e| e.in_use != 0 && e.name == wanted)
            .ok_or(FsError::NotFound)?;
        slot.in_use = 0;
        Ok(())
    }

    /// In-use names, in slot order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.in_use != 0)
            .map(|e| stored_name(&e.name))
            .collect()
    }

    /// In-use entries, in slot order.
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.entries
            .iter()
            .filter(|e| e.in_use != 0)
            .map(|e| DirectoryEntry {
                name: stored_name(&e.name),
                location: e.location(),
                is_dir: e.is_dir != 0,
            })
            .collect()
    }

    /// Whether no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.in_use == 0)
    }

    /// Total slots, free or not.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

/// Name bytes as stored: truncated to the slot width, zero padded.
fn bounded_name(name: &str) -> [u8; FILE_NAME_MAX] {
    let bytes = name.as_bytes();
    let len = bytes.len().min(FILE_NAME_MAX);
    let mut out = [0u8; FILE_NAME_MAX];
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

fn stored_name(raw: &[u8; FILE_NAME_MAX]) -> String {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_MAX);
    String::from_utf8_lossy(&raw[..len]).into_owned()
}
