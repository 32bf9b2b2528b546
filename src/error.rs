use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;

/// Every failure the storage layer surfaces to its callers.
///
/// Mutating operations build their result on in-memory copies of the disk
/// structures and persist nothing until every step has succeeded, so any of
/// these errors means the disk was left exactly as it was found.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("name already present in directory")]
    NameCollision,
    #[error("directory has no free entry slot")]
    DirectoryFull,
    #[error("not enough free blocks on device")]
    OutOfSpace,
    #[error("path component missing or not a directory")]
    PathNotFound,
    #[error("no such file or directory")]
    NotFound,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("on-disk structure corrupted: {0}")]
    Corrupted(String),
    #[error("device error: {0}")]
    Io(#[from] std::io::Error),
}
