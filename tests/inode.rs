//! File-layer scenarios: growth, holes, deny-write, concurrency, erase.

use erebos::dev::MemDisk;
use erebos::fs::inode::{InodeType, MAX_LENGTH};
use erebos::fs::FileSys;
use std::sync::Arc;

fn fresh_fs(sectors: u32) -> Arc<FileSys> {
    FileSys::format(Arc::new(MemDisk::new(sectors)))
}

#[test]
fn write_then_read_back() {
    let fs = fresh_fs(1024);
    let f = fs.create(InodeType::File).unwrap();

    let data = vec![b'A'; 5000];
    assert_eq!(f.write_at(&data, 0), 5000);
    assert_eq!(f.length(), 5000);

    let mut out = vec![0u8; 5000];
    assert_eq!(f.read_at(&mut out, 0), 5000);
    assert_eq!(out, data);
}

#[test]
fn sparse_write_leaves_holes() {
    let fs = fresh_fs(1024);
    let f = fs.create(InodeType::File).unwrap();

    assert_eq!(f.write_at(&[0x42], 1_000_000), 1);
    assert_eq!(f.length(), 1_000_001);

    // The untouched start of the file reads as zeros.
    let mut head = [0xffu8; 512];
    assert_eq!(f.read_at(&mut head, 0), 512);
    assert_eq!(head, [0u8; 512]);

    let mut byte = [0u8; 1];
    assert_eq!(f.read_at(&mut byte, 1_000_000), 1);
    assert_eq!(byte[0], 0x42);
}

#[test]
fn read_stops_at_length() {
    let fs = fresh_fs(256);
    let f = fs.create(InodeType::File).unwrap();
    f.write_at(b"hello", 0);

    let mut out = [0u8; 64];
    assert_eq!(f.read_at(&mut out, 0), 5);
    assert_eq!(f.read_at(&mut out, 5), 0);
    assert_eq!(f.read_at(&mut out, 4096), 0);
}

#[test]
fn write_at_exact_end_extends() {
    let fs = fresh_fs(256);
    let f = fs.create(InodeType::File).unwrap();
    assert_eq!(f.write_at(b"abc", 0), 3);
    assert_eq!(f.write_at(b"def", 3), 3);
    assert_eq!(f.length(), 6);

    let mut out = [0u8; 6];
    f.read_at(&mut out, 0);
    assert_eq!(&out, b"abcdef");
}

#[test]
fn max_file_size_is_a_hard_edge() {
    let fs = fresh_fs(1024);
    let f = fs.create(InodeType::File).unwrap();

    // The last addressable byte is writable...
    assert_eq!(f.write_at(&[0x7f], MAX_LENGTH - 1), 1);
    assert_eq!(f.length(), MAX_LENGTH);
    let mut byte = [0u8; 1];
    assert_eq!(f.read_at(&mut byte, MAX_LENGTH - 1), 1);
    assert_eq!(byte[0], 0x7f);

    // ...and one byte past the index maximum fails cleanly.
    assert_eq!(f.write_at(&[0x00], MAX_LENGTH), 0);
    assert_eq!(f.length(), MAX_LENGTH);
}

#[test]
fn deny_write_gates_every_handle() {
    let fs = fresh_fs(256);
    let a = fs.create(InodeType::File).unwrap();
    let b = fs.open(a.sector()).unwrap();

    a.deny_write();
    assert_eq!(b.write_at(b"nope", 0), 0);
    assert_eq!(b.length(), 0);

    a.allow_write();
    assert_eq!(b.write_at(b"yes", 0), 3);
    assert_eq!(b.length(), 3);
}

#[test]
fn deny_write_drains_active_writers() {
    let fs = fresh_fs(2048);
    let f = fs.create(InodeType::File).unwrap();

    let writer = {
        let f = f.clone();
        std::thread::spawn(move || {
            let data = vec![0x5au8; 400_000];
            f.write_at(&data, 0)
        })
    };

    // Whether we land before, during, or after the write, deny_write
    // returns only once no writer is active: the concurrent write is
    // all (it beat the deny) or nothing (it was refused), never a torn
    // middle, and the length is final by the time deny_write returns.
    std::thread::sleep(std::time::Duration::from_millis(5));
    f.deny_write();
    let settled = f.length();
    let written = writer.join().unwrap();
    assert!(written == 400_000 || written == 0);
    assert_eq!(settled, written);
    assert_eq!(f.length(), written);
    assert_eq!(f.write_at(b"late", written), 0);
    f.allow_write();
}

#[test]
fn open_deduplicates_per_sector() {
    let fs = fresh_fs(256);
    let a = fs.create(InodeType::File).unwrap();
    let b = fs.open(a.sector()).unwrap();

    a.write_at(b"shared", 0);
    let mut out = [0u8; 6];
    assert_eq!(b.read_at(&mut out, 0), 6);
    assert_eq!(&out, b"shared");
    assert_eq!(a.sector(), b.sector());
}

#[test]
fn reopen_after_close_sees_persisted_data() {
    let fs = fresh_fs(1024);
    let sector = {
        let f = fs.create(InodeType::File).unwrap();
        f.write_at(b"persistent", 100_000);
        f.sector()
    };

    let f = fs.open(sector).unwrap();
    assert_eq!(f.length(), 100_010);
    let mut out = [0u8; 10];
    assert_eq!(f.read_at(&mut out, 100_000), 10);
    assert_eq!(&out, b"persistent");
}

#[test]
fn inode_type_is_persisted() {
    let fs = fresh_fs(256);
    let d = fs.create(InodeType::Directory).unwrap();
    let f = fs.create(InodeType::File).unwrap();
    assert_eq!(d.itype(), InodeType::Directory);
    assert_eq!(f.itype(), InodeType::File);
}

#[test]
fn opening_garbage_is_rejected() {
    let fs = fresh_fs(256);
    assert!(fs.open(erebos::dev::Sector(17)).is_err());
}

#[test]
fn removed_inode_frees_its_sectors_on_last_close() {
    // The device fits one ~200 KiB file but not two, so the second
    // create only succeeds if erase returned the first file's sectors.
    let fs = fresh_fs(512);
    let data = vec![0xa5u8; 200_000];

    for round in 0..2 {
        let f = fs.create(InodeType::File).unwrap();
        assert_eq!(f.write_at(&data, 0), 200_000, "round {round} ran short");
        f.remove();
    }
}

#[test]
fn concurrent_writers_fill_disjoint_halves() {
    let fs = fresh_fs(4096);
    let f = fs.create(InodeType::File).unwrap();

    let first = {
        let f = f.clone();
        std::thread::spawn(move || {
            let data = vec![0x11u8; 50_000];
            f.write_at(&data, 0)
        })
    };
    let second = {
        let f = f.clone();
        std::thread::spawn(move || {
            let data = vec![0x22u8; 50_000];
            f.write_at(&data, 50_000)
        })
    };
    assert_eq!(first.join().unwrap(), 50_000);
    assert_eq!(second.join().unwrap(), 50_000);

    assert_eq!(f.length(), 100_000);
    let mut out = vec![0u8; 100_000];
    assert_eq!(f.read_at(&mut out, 0), 100_000);
    assert!(out[..50_000].iter().all(|&b| b == 0x11));
    assert!(out[50_000..].iter().all(|&b| b == 0x22));
}

#[test]
fn concurrent_readers_see_consistent_data() {
    let fs = fresh_fs(2048);
    let f = fs.create(InodeType::File).unwrap();
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(f.write_at(&data, 0), data.len());

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let f = f.clone();
            let expect = data.clone();
            std::thread::spawn(move || {
                let mut out = vec![0u8; expect.len()];
                assert_eq!(f.read_at(&mut out, 0), expect.len());
                assert_eq!(out, expect);
            })
        })
        .collect();
    for r in readers {
        r.join().unwrap();
    }
}

#[test]
fn doubly_indirect_reaches_past_the_singly_region() {
    let fs = fresh_fs(2048);
    let f = fs.create(InodeType::File).unwrap();

    // One byte in each tier of the index.
    let direct_off = 0;
    let singly_off = 123 * 512 + 7;
    let doubly_off = (123 + 128) * 512 + 11;
    f.write_at(&[1], direct_off);
    f.write_at(&[2], singly_off);
    f.write_at(&[3], doubly_off);

    let mut byte = [0u8; 1];
    f.read_at(&mut byte, direct_off);
    assert_eq!(byte[0], 1);
    f.read_at(&mut byte, singly_off);
    assert_eq!(byte[0], 2);
    f.read_at(&mut byte, doubly_off);
    assert_eq!(byte[0], 3);
}

#[test]
fn device_exhaustion_yields_a_short_write() {
    let fs = fresh_fs(64);
    let f = fs.create(InodeType::File).unwrap();
    // 64 sectors minus reserved and metadata cannot hold 64 KiB.
    let data = vec![0x33u8; 65_536];
    let written = f.write_at(&data, 0);
    assert!(written < data.len());
    assert_eq!(f.length(), written);
}
