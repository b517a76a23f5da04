//! 集成测试共用的模拟设备和检查工具
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use rsext3::*;

/// 故障注入控制
#[derive(Debug, Default)]
pub struct Faults {
    /// 成功写入这么多次之后，所有写入都失败（模拟掉电）
    pub fail_after_writes: Option<usize>,
    /// 读这个块时失败
    pub fail_on_read_block: Option<u32>,
    pub writes: usize,
}

/// 可控错误的模拟块设备
///
/// 存储与内层 [`RamDisk`] 共享，文件系统对象丢掉之后，
/// 可以直接用那个 RamDisk 重新挂载，看到的就是“掉电”时盘上的内容。
pub struct ErrorMockDevice {
    disk: RamDisk,
    faults: Arc<Mutex<Faults>>,
}

impl ErrorMockDevice {
    pub fn new(disk: RamDisk) -> (Self, Arc<Mutex<Faults>>) {
        let faults = Arc::new(Mutex::new(Faults::default()));
        (
            Self {
                disk,
                faults: faults.clone(),
            },
            faults,
        )
    }
}

impl BlockDevice for ErrorMockDevice {
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        {
            let mut f = self.faults.lock().unwrap();
            if let Some(limit) = f.fail_after_writes
                && f.writes >= limit
            {
                return Err(BlockDevError::WriteError);
            }
            f.writes += 1;
        }
        self.disk.write(buffer, block_id, count)
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        if self.faults.lock().unwrap().fail_on_read_block == Some(block_id) {
            return Err(BlockDevError::ReadError);
        }
        self.disk.read(buffer, block_id, count)
    }

    fn total_blocks(&self) -> u64 {
        self.disk.total_blocks()
    }

    fn block_size(&self) -> u32 {
        self.disk.block_size()
    }
}

pub fn new_fs(block_size: usize, blocks: u32) -> (RamDisk, FsLayout, Ext3Fs) {
    let layout = FsLayout::new(block_size, blocks).expect("layout");
    new_fs_with(layout, MountOptions::default())
}

pub fn new_fs_with(layout: FsLayout, opts: MountOptions) -> (RamDisk, FsLayout, Ext3Fs) {
    let disk = RamDisk::new(layout.block_size as u32, layout.blocks_count as u64);
    fs_format(disk.clone(), layout).expect("format failed");
    let fs = fs_mount(disk.clone(), layout, opts).expect("mount failed");
    (disk, layout, fs)
}

pub fn remount(disk: &RamDisk, layout: FsLayout) -> Ext3Fs {
    fs_mount(disk.clone(), layout, MountOptions::default()).expect("remount failed")
}

/// 每个逻辑块开头写入它自己的块号，便于事后校验
pub fn fill_blocks(fs: &Ext3Fs, inode: &Inode, blocks: impl IntoIterator<Item = i64>) {
    for iblock in blocks {
        write_block(fs, inode, iblock, &iblock.to_le_bytes()).expect("write_block failed");
    }
}

/// `count` 个块的数据，每块开头是它的逻辑块号
pub fn tagged(first: i64, count: i64, bs: usize) -> Vec<u8> {
    let mut data = vec![0xA5u8; count as usize * bs];
    for i in 0..count {
        let off = i as usize * bs;
        data[off..off + 8].copy_from_slice(&(first + i).to_le_bytes());
    }
    data
}

pub fn block_tag(fs: &Ext3Fs, inode: &Inode, iblock: i64) -> Option<i64> {
    let mut buf = vec![0u8; fs.geometry().block_size()];
    read_block(fs, inode, iblock, &mut buf)
        .expect("read_block failed")
        .map(|_| i64::from_le_bytes(buf[..8].try_into().unwrap()))
}

fn walk(fs: &Ext3Fs, nr: u32, depth: usize, seen: &mut BTreeSet<u32>) -> u64 {
    if nr == 0 {
        return 0;
    }
    assert!(seen.insert(nr), "block {nr} referenced twice");
    assert!(
        fs.allocator().is_allocated(nr).unwrap(),
        "block {nr} is referenced but free in the bitmap"
    );
    let mut count = 1;
    if depth > 0 {
        let bh = fs.cache().get_block_buffer(nr).expect("read indirect block");
        for i in 0..fs.geometry().addr_per_block() {
            count += walk(fs, bh.get_le32(i), depth - 1, seen);
        }
    }
    count
}

/// 检查块树和位图是否一致
///
/// - 每个被引用的块在位图中都已占用，且只被引用一次；
/// - i_blocks 等于树中块数；
/// - 数据区里每个已占用的块都被某个 inode 引用（没有泄漏）。
///
/// 返回每个 inode 占用的块数。
pub fn check_consistency(fs: &Ext3Fs, inos: &[u32]) -> Vec<u64> {
    let mut seen = BTreeSet::new();
    let mut counts = Vec::new();
    for ino in inos {
        let inode = fs.iget(*ino).expect("iget");
        let map = inode.block_map();
        let mut count = 0;
        for (i, nr) in map.iter().enumerate() {
            let depth = i.saturating_sub(EXT3_NDIR_BLOCKS - 1);
            count += walk(fs, *nr, depth, &mut seen);
        }
        assert_eq!(
            inode.blocks(),
            count * fs.geometry().sectors_per_block(),
            "inode {ino}: i_blocks does not match the block tree"
        );
        counts.push(count);
    }

    let layout = fs.layout();
    for blk in layout.first_data_block()..layout.blocks_count {
        if fs.allocator().is_allocated(blk).unwrap() {
            assert!(seen.contains(&blk), "block {blk} allocated but unreferenced");
        }
    }
    counts
}
