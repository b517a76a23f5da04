//! # truncate 测试
//!
//! 直接块、一级/二级/三级间接块的释放，跨多个事务的长 truncate，
//! 以及与并发写入的交互

mod common;

use common::*;
use rsext3::*;

#[test]
fn test_truncate_300_blocks_to_5_at_4k() {
    let (_disk, _layout, fs) = new_fs(4096, 4096);
    let inode = fs.create_inode(12).unwrap();
    write_at(&fs, &inode, 0, &tagged(0, 300, 4096)).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![301]);
    let free = fs.allocator().free_count();

    fs.truncate(&inode, 5 * 4096).unwrap();

    assert_eq!(fs.allocator().free_count(), free + 296);
    let map = inode.block_map();
    assert!(map[..5].iter().all(|nr| *nr != 0));
    assert!(map[5..EXT3_N_BLOCKS].iter().all(|nr| *nr == 0));
    assert_eq!(inode.size(), 5 * 4096);
    assert_eq!(inode.disksize(), 5 * 4096);
    assert_eq!(inode.blocks(), 5 * 8);
    assert_eq!(check_consistency(&fs, &[12]), vec![5]);
    for b in 0..5 {
        assert_eq!(block_tag(&fs, &inode, b), Some(b));
    }
    assert!(!fs.orphans().contains(12));
}

#[test]
fn test_truncate_is_idempotent() {
    let (_disk, _layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    write_at(&fs, &inode, 0, &tagged(0, 400, 1024)).unwrap();

    fs.truncate(&inode, 100 * 1024 + 17).unwrap();
    let free = fs.allocator().free_count();
    let map = inode.block_map();
    let blocks = inode.blocks();

    fs.truncate(&inode, 100 * 1024 + 17).unwrap();
    assert_eq!(fs.allocator().free_count(), free);
    assert_eq!(inode.block_map(), map);
    assert_eq!(inode.blocks(), blocks);
    // 101 个数据块 + 一个一级间接块
    assert_eq!(check_consistency(&fs, &[12]), vec![102]);
}

#[test]
fn test_monotonic_shrink_keeps_prefix() {
    let (disk, layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    write_at(&fs, &inode, 0, &tagged(0, 3000, 1024)).unwrap();

    let sizes = [
        2500 * 1024 + 3,
        2500 * 1024,
        1000 * 1024,
        268 * 1024 + 1,
        268 * 1024,
        267 * 1024,
        13 * 1024,
        12 * 1024,
        511,
        0,
    ];
    let mut prev = u32::MAX;
    for size in sizes {
        fs.truncate(&inode, size).unwrap();
        let counts = check_consistency(&fs, &[12]);
        let keep = size.div_ceil(1024) as i64;
        for b in [0, keep / 2, keep - 1] {
            if b >= 0 && b < keep {
                assert_eq!(block_tag(&fs, &inode, b), Some(b), "size {size}: block {b}");
            }
        }
        for b in [keep, keep + 1, keep + 300] {
            assert_eq!(fs.bmap(&inode, b).unwrap(), 0, "size {size}: block {b}");
        }
        let free = fs.allocator().free_count();
        assert!(free >= prev || prev == u32::MAX);
        prev = free;
        assert_eq!(inode.size(), size);
        if size == 0 {
            assert_eq!(counts, vec![0]);
            assert_eq!(inode.block_map(), [0; EXT3_N_BLOCKS]);
        }
    }
    fs_umount(fs).unwrap();

    let fs = remount(&disk, layout);
    let inode = fs.iget(12).unwrap();
    assert_eq!(inode.size(), 0);
    assert_eq!(check_consistency(&fs, &[12]), vec![0]);
}

#[test]
fn test_triple_indirect_subtrees() {
    let (_disk, _layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    let tind = 12 + 256 + 65536;
    let blocks = [0, 100, 300, tind, tind + 300, tind + 70000];
    fill_blocks(&fs, &inode, blocks);
    // 6 个数据块；IND；DIND + 1 IND；TIND + 2 DIND + 3 IND
    assert_eq!(check_consistency(&fs, &[12]), vec![6 + 1 + 2 + 6]);

    // 末尾落在三级间接树中间：只有最后一个块连同它的 DIND/IND 被释放
    fs.truncate(&inode, (tind as u64 + 400) * 1024).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![5 + 1 + 2 + 4]);
    assert_eq!(block_tag(&fs, &inode, tind + 300), Some(tind + 300));
    assert_eq!(fs.bmap(&inode, tind + 70000).unwrap(), 0);

    // 末尾回到一级间接范围：二级、三级间接树整体释放
    fs.truncate(&inode, 200 * 1024).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![2 + 1]);
    let map = inode.block_map();
    assert_eq!(map[EXT3_DIND_BLOCK], 0);
    assert_eq!(map[EXT3_TIND_BLOCK], 0);
    assert_eq!(block_tag(&fs, &inode, 100), Some(100));
    assert_eq!(fs.bmap(&inode, 300).unwrap(), 0);
}

#[test]
fn test_double_indirect_shared_boundary() {
    let (_disk, _layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    // DIND 下前三个 IND 各写满一部分
    write_at(&fs, &inode, 268 * 1024, &tagged(268, 600, 1024)).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![600 + 1 + 3]);

    // 末尾在第二个 IND 中间
    let end = 268 + 256 + 10;
    fs.truncate(&inode, end as u64 * 1024).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![(256 + 10) + 1 + 2]);
    assert_eq!(block_tag(&fs, &inode, end - 1), Some(end - 1));
    assert_eq!(fs.bmap(&inode, end).unwrap(), 0);

    // 末尾正好在第二个 IND 的开头：这个 IND 整个释放
    fs.truncate(&inode, (268 + 256) * 1024).unwrap();
    assert_eq!(check_consistency(&fs, &[12]), vec![256 + 1 + 1]);
}

#[test]
fn test_long_truncate_spans_transactions() {
    let layout = FsLayout::new(1024, 4096)
        .unwrap()
        .with_journal_len(300)
        .unwrap();
    let (disk, layout, fs) = new_fs_with(layout, MountOptions::default());
    let inode = fs.create_inode(12).unwrap();
    // 每个一级间接块只挂一个数据块，释放时每个间接块都要消耗 credit
    let blocks: Vec<i64> = (0..70).map(|i| 268 + i * 256).collect();
    fill_blocks(&fs, &inode, blocks.iter().copied());
    assert_eq!(check_consistency(&fs, &[12]), vec![70 + 70 + 1]);
    fs.sync().unwrap();
    let tid = fs.journal().committed_tid();

    fs.truncate(&inode, 0).unwrap();

    assert!(fs.journal().committed_tid() > tid, "truncate never restarted");
    assert_eq!(inode.blocks(), 0);
    assert_eq!(check_consistency(&fs, &[12]), vec![0]);
    assert!(fs.orphans().list().unwrap().is_empty());
    fs_umount(fs).unwrap();

    let fs = remount(&disk, layout);
    let inode = fs.iget(12).unwrap();
    assert_eq!(inode.blocks(), 0);
    assert_eq!(check_consistency(&fs, &[12]), vec![0]);
}

#[test]
fn test_append_only_and_immutable_refused() {
    let (_disk, _layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    write_at(&fs, &inode, 0, &tagged(0, 20, 1024)).unwrap();
    let free = fs.allocator().free_count();

    for flag in [InodeFlags::APPEND, InodeFlags::IMMUTABLE] {
        inode.set_flags(flag);
        assert_eq!(fs.truncate(&inode, 0), Err(Ext3Error::NotPermitted));
        assert_eq!(Ext3Error::NotPermitted.to_errno(), EPERM);
        assert_eq!(inode.size(), 20 * 1024);
        assert_eq!(fs.allocator().free_count(), free);
    }
    inode.set_flags(InodeFlags::empty());
    fs.truncate(&inode, 0).unwrap();
    assert_eq!(fs.allocator().free_count(), free + 21);
}

#[test]
fn test_partial_block_tail_is_zeroed() {
    for mode in [JournalMode::Ordered, JournalMode::Journal] {
        let layout = FsLayout::new(1024, 16384).unwrap();
        let opts = MountOptions {
            journal_mode: mode,
            ..Default::default()
        };
        let (disk, layout, fs) = new_fs_with(layout, opts);
        let inode = fs.create_inode(12).unwrap();
        write_at(&fs, &inode, 0, &[0xABu8; 3 * 1024]).unwrap();

        fs.truncate(&inode, 1500).unwrap();
        assert_eq!(fs.bmap(&inode, 2).unwrap(), 0);
        // 变大只改大小，空出来的部分读出 0
        fs.truncate(&inode, 3000).unwrap();
        assert_eq!(inode.disksize(), 3000);

        let mut buf = vec![0xFFu8; 3000];
        assert_eq!(read_at(&fs, &inode, 0, &mut buf).unwrap(), 3000);
        assert!(buf[..1500].iter().all(|b| *b == 0xAB));
        assert!(buf[1500..].iter().all(|b| *b == 0));
        fs_umount(fs).unwrap();

        let fs = remount(&disk, layout);
        let inode = fs.iget(12).unwrap();
        let mut buf = vec![0xFFu8; 3000];
        read_at(&fs, &inode, 0, &mut buf).unwrap();
        assert!(buf[..1500].iter().all(|b| *b == 0xAB));
        assert!(buf[1500..].iter().all(|b| *b == 0));
    }
}

#[test]
fn test_delete_inode_frees_everything() {
    let (disk, layout, fs) = new_fs(1024, 16384);
    let inode = fs.create_inode(12).unwrap();
    let free = fs.allocator().free_count();
    write_at(&fs, &inode, 0, &tagged(0, 500, 1024)).unwrap();

    assert_eq!(fs.delete_inode(&inode), Err(Ext3Error::InvalidArgument));
    inode.set_links_count(0);
    fs.delete_inode(&inode).unwrap();
    assert_eq!(fs.allocator().free_count(), free);
    assert!(!fs.orphans().contains(12));
    fs_umount(fs).unwrap();

    let fs = remount(&disk, layout);
    let inode = fs.iget(12).unwrap();
    assert_eq!(inode.state().mode, 0);
    assert_eq!(check_consistency(&fs, &[12]), vec![0]);
}

#[test]
fn test_truncate_races_with_writer_on_same_inode() {
    // 小日志：truncate 必须多次 restart，写入方持有 handle 等 truncate_sem
    let layout = FsLayout::new(1024, 8192)
        .unwrap()
        .with_journal_len(300)
        .unwrap();
    let (_disk, _layout, fs) = new_fs_with(layout, MountOptions::default());
    let inode = fs.create_inode(12).unwrap();
    write_at(&fs, &inode, 0, &tagged(0, 100, 1024)).unwrap();
    let sparse: Vec<i64> = (0..60).map(|i| 268 + i * 256).collect();
    fill_blocks(&fs, &inode, sparse.iter().copied());

    std::thread::scope(|s| {
        let fs = &fs;
        let inode = &inode;
        s.spawn(move || fs.truncate(inode, 100 * 1024).unwrap());
        s.spawn(move || {
            for _ in 0..3 {
                fill_blocks(fs, inode, 0..100);
            }
        });
    });

    assert_eq!(inode.size(), 100 * 1024);
    assert_eq!(check_consistency(&fs, &[12]), vec![100 + 1]);
    for b in 0..100 {
        assert_eq!(block_tag(&fs, &inode, b), Some(b));
    }
}
