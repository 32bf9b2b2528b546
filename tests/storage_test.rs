use std::sync::Arc;

use chalkfs::{
    BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, FileRecord, FormatOptions,
    FsError, StorageManager, BLOCK_SIZE, MAX_FILE_SIZE,
};

fn test_device(blocks: usize) -> Arc<FileBlockEmulator> {
    let fd = tempfile::tempfile().unwrap();
    Arc::new(
        FileBlockEmulatorBuilder::from(fd)
            .with_block_count(blocks)
            .build()
            .expect("could not initialize disk emulator"),
    )
}

fn format_fs(dev: &Arc<FileBlockEmulator>, dir_capacity: usize) -> StorageManager {
    StorageManager::format(Arc::clone(dev) as Arc<dyn BlockStorage>, FormatOptions { dir_capacity })
        .expect("format failed")
}

fn raw_blocks(dev: &FileBlockEmulator) -> Vec<Vec<u8>> {
    (0..dev.block_count())
        .map(|b| {
            let mut buf = vec![0u8; BLOCK_SIZE];
            dev.read_block(b, &mut buf).unwrap();
            buf
        })
        .collect()
}

#[test]
fn create_open_remove_round_trip() {
    let dev = test_device(32);
    let mut fs = format_fs(&dev, 4);

    fs.create("/a.txt", 50).unwrap();
    let mut file = fs.open("/a.txt").unwrap();
    assert_eq!(file.length(), 50);

    let payload = b"a modest payload that fits the file";
    assert_eq!(file.write_at(payload, 0).unwrap(), payload.len());
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), payload.len());
    assert_eq!(&buf, payload);

    fs.remove("/a.txt").unwrap();
    assert!(matches!(fs.open("/a.txt"), Err(FsError::NotFound)));
    assert!(matches!(fs.remove("/a.txt"), Err(FsError::NotFound)));
}

#[test]
fn oversized_create_builds_a_record_chain() {
    // Format claims 4 blocks (two bootstrap records, one bitmap block, one
    // root-table block). The chained file needs 32 more: its record, 29
    // direct blocks, the continuation record's block, and one more data
    // block. 36 total is exactly enough.
    let dev = test_device(36);
    let mut fs = format_fs(&dev, 4);
    assert_eq!(fs.free_blocks().unwrap(), 32);

    fs.create("/big.bin", MAX_FILE_SIZE + 10).unwrap();
    assert_eq!(fs.free_blocks().unwrap(), 0);

    let file = fs.open("/big.bin").unwrap();
    assert_eq!(file.length(), MAX_FILE_SIZE + 10);
    let record = FileRecord::fetch_from(dev.as_ref(), file.location()).unwrap();
    assert_eq!(record.num_segments(), 2);
    assert_eq!(record.data_blocks().len(), (MAX_FILE_SIZE + 10 + BLOCK_SIZE - 1) / BLOCK_SIZE);
}

#[test]
fn failed_create_leaves_the_disk_untouched() {
    // One block short of what the chained file needs.
    let dev = test_device(35);
    let mut fs = format_fs(&dev, 4);
    assert_eq!(fs.free_blocks().unwrap(), 31);

    let before = raw_blocks(dev.as_ref());
    assert!(matches!(
        fs.create("/big.bin", MAX_FILE_SIZE + 10),
        Err(FsError::OutOfSpace)
    ));
    let after = raw_blocks(dev.as_ref());

    assert_eq!(before, after);
    assert_eq!(fs.free_blocks().unwrap(), 31);
    assert!(fs.list("/").unwrap().is_empty());
}

#[test]
fn subdirectories_resolve_through_the_tree() {
    let dev = test_device(32);
    let mut fs = format_fs(&dev, 4);

    fs.create_dir("/sub").unwrap();
    fs.create("/sub/f.txt", 10).unwrap();

    assert_eq!(fs.list("/sub").unwrap(), vec!["f.txt".to_string()]);
    assert_eq!(fs.list("/").unwrap(), vec!["sub".to_string()]);
    assert!(matches!(
        fs.create("/nope/f.txt", 10),
        Err(FsError::PathNotFound)
    ));
    // A plain file is not a directory either.
    assert!(matches!(
        fs.create("/sub/f.txt/g", 10),
        Err(FsError::PathNotFound)
    ));
    assert!(matches!(fs.list("/sub/f.txt"), Err(FsError::PathNotFound)));
}

#[test]
fn name_collisions_leave_the_first_file_alone() {
    let dev = test_device(32);
    let mut fs = format_fs(&dev, 4);

    fs.create("/x", 10).unwrap();
    let mut file = fs.open("/x").unwrap();
    file.write_at(b"0123456789", 0).unwrap();

    assert!(matches!(fs.create("/x", 20), Err(FsError::NameCollision)));

    let mut file = fs.open("/x").unwrap();
    assert_eq!(file.length(), 10);
    let mut buf = [0u8; 10];
    file.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"0123456789");
}

#[test]
fn directory_capacity_is_fixed() {
    let dev = test_device(32);
    let mut fs = format_fs(&dev, 4);

    for name in &["/a", "/b", "/c", "/d"] {
        fs.create(name, 0).unwrap();
    }
    assert!(matches!(fs.create("/e", 0), Err(FsError::DirectoryFull)));

    // Removal frees a slot for reuse.
    fs.remove("/b").unwrap();
    fs.create("/e", 0).unwrap();
    assert_eq!(
        fs.list("/").unwrap(),
        vec!["a".to_string(), "e".to_string(), "c".to_string(), "d".to_string()]
    );
}

#[test]
fn removal_returns_every_block_to_the_allocator() {
    let dev = test_device(64);
    let mut fs = format_fs(&dev, 4);
    let baseline = fs.free_blocks().unwrap();

    fs.create_dir("/a").unwrap();
    fs.create_dir("/a/b").unwrap();
    fs.create("/a/b/c.txt", 300).unwrap();
    fs.create("/big", MAX_FILE_SIZE + 10).unwrap();
    assert!(fs.free_blocks().unwrap() < baseline);

    assert!(matches!(fs.remove("/a"), Err(FsError::DirectoryNotEmpty)));

    fs.remove("/a/b/c.txt").unwrap();
    fs.remove("/a/b").unwrap();
    fs.remove("/a").unwrap();
    fs.remove("/big").unwrap();
    assert_eq!(fs.free_blocks().unwrap(), baseline);
}

#[test]
fn tree_listing_reports_depth_and_kind() {
    let dev = test_device(64);
    let mut fs = format_fs(&dev, 4);

    fs.create_dir("/a").unwrap();
    fs.create_dir("/a/b").unwrap();
    fs.create("/a/b/c.txt", 5).unwrap();
    fs.create("/top.txt", 5).unwrap();

    let tree = fs.list_tree("/").unwrap();
    let summary: Vec<(String, usize, bool)> = tree
        .into_iter()
        .map(|e| (e.name, e.depth, e.is_dir))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("a".to_string(), 0, true),
            ("b".to_string(), 1, true),
            ("c.txt".to_string(), 2, false),
            ("top.txt".to_string(), 0, false),
        ]
    );

    let report = fs.dump().unwrap();
    assert!(report.contains("c.txt"));
    assert!(report.contains("top.txt"));
}

#[test]
fn formatted_disk_survives_a_remount() {
    let disk = tempfile::NamedTempFile::new().unwrap();
    let dev: Arc<FileBlockEmulator> = Arc::new(
        FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(32)
            .build()
            .unwrap(),
    );
    {
        let mut fs = format_fs(&dev, 4);
        fs.create("/keep.txt", 12).unwrap();
        let mut file = fs.open("/keep.txt").unwrap();
        file.write_at(b"persisted ok", 0).unwrap();
    }

    // Reopen the same image without wiping it.
    let dev: Arc<FileBlockEmulator> = Arc::new(
        FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(32)
            .clear_medium(false)
            .build()
            .unwrap(),
    );
    let fs = StorageManager::mount(Arc::clone(&dev) as Arc<dyn BlockStorage>).unwrap();
    assert_eq!(fs.list("/").unwrap(), vec!["keep.txt".to_string()]);
    let mut file = fs.open("/keep.txt").unwrap();
    let mut buf = [0u8; 12];
    file.read_at(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"persisted ok");
}

#[test]
fn mounting_an_unformatted_disk_fails() {
    let dev = test_device(8);
    assert!(matches!(
        StorageManager::mount(Arc::clone(&dev) as Arc<dyn BlockStorage>),
        Err(FsError::Corrupted(_))
    ));
}

#[test]
fn bare_names_resolve_against_the_root() {
    let dev = test_device(32);
    let mut fs = format_fs(&dev, 4);

    fs.create("noslash.txt", 8).unwrap();
    assert!(fs.open("/noslash.txt").is_ok());
    assert!(fs.open("noslash.txt").is_ok());
    fs.remove("noslash.txt").unwrap();
    assert!(fs.list("/").unwrap().is_empty());
}
