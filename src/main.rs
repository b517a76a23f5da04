//! # rsext3 演示程序
//!
//! 在宿主机镜像文件上跑一遍写入 / truncate / 重新挂载，
//! 再在内存盘上模拟一次 truncate 中途掉电，挂载时重放日志并补完 truncate。

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::*;
use rsext3::*;

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let (level_str, color) = match record.level() {
            Level::Error => ("ERROR", "\x1b[31m"), // 红
            Level::Warn => ("WARN ", "\x1b[33m"),  // 黄
            Level::Info => ("INFO ", "\x1b[32m"),  // 绿
            Level::Debug => ("DEBUG", "\x1b[34m"), // 蓝
            Level::Trace => ("TRACE", "\x1b[90m"), // 灰
        };

        let reset = "\x1b[0m";

        println!(
            "{}[{}]{} {}: {}",
            color,
            level_str,
            reset,
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

const DEMO_BLOCK_SIZE: usize = 1024;
const DEMO_BLOCKS: u32 = 16384;

/// 基于宿主机文件的块设备
struct FileBlockDev {
    file: File,
    total_blocks: u64,
}

impl FileBlockDev {
    fn open_or_create<P: AsRef<Path>>(path: P, total_blocks: u64) -> std::io::Result<Self> {
        let size_bytes = total_blocks * DEMO_BLOCK_SIZE as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() < size_bytes {
            file.set_len(size_bytes)?;
        }
        Ok(Self { file, total_blocks })
    }

    fn check(&self, len: usize, block_id: u32, count: u32) -> BlockDevResult<usize> {
        let required = DEMO_BLOCK_SIZE * count as usize;
        if len < required {
            return Err(BlockDevError::BufferTooSmall {
                provided: len,
                required,
            });
        }
        if block_id as u64 + count as u64 > self.total_blocks {
            return Err(BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks: self.total_blocks,
            });
        }
        Ok(required)
    }
}

impl BlockDevice for FileBlockDev {
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let required = self.check(buffer.len(), block_id, count)?;
        self.file
            .seek(SeekFrom::Start(block_id as u64 * DEMO_BLOCK_SIZE as u64))
            .map_err(|_| BlockDevError::IoError)?;
        self.file
            .write_all(&buffer[..required])
            .map_err(|_| BlockDevError::WriteError)
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let required = self.check(buffer.len(), block_id, count)?;
        self.file
            .seek(SeekFrom::Start(block_id as u64 * DEMO_BLOCK_SIZE as u64))
            .map_err(|_| BlockDevError::IoError)?;
        self.file
            .read_exact(&mut buffer[..required])
            .map_err(|_| BlockDevError::ReadError)
    }

    fn flush(&mut self) -> BlockDevResult<()> {
        self.file.sync_data().map_err(|_| BlockDevError::IoError)
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn block_size(&self) -> u32 {
        DEMO_BLOCK_SIZE as u32
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn test_image_file(img_path: &str) -> Ext3Result<()> {
    let dev = FileBlockDev::open_or_create(img_path, DEMO_BLOCKS as u64)
        .map_err(|_| Ext3Error::Io(BlockDevError::IoError))?;
    let layout = FsLayout::new(DEMO_BLOCK_SIZE, DEMO_BLOCKS)?;
    fs_format(dev, layout)?;

    let dev = FileBlockDev::open_or_create(img_path, DEMO_BLOCKS as u64)
        .map_err(|_| Ext3Error::Io(BlockDevError::IoError))?;
    let fs = fs_mount(dev, layout, MountOptions::default())?;
    let inode = fs.create_inode(12)?;

    // 300 个块：直接块、一级间接、二级间接都会用到
    let data = pattern(300 * DEMO_BLOCK_SIZE, 7);
    write_at(&fs, &inode, 0, &data)?;
    info!(
        "wrote {} bytes, i_blocks={} free={}",
        inode.size(),
        inode.blocks(),
        fs.allocator().free_count()
    );

    fs.truncate(&inode, 10_000)?;
    info!(
        "truncated to {} bytes, i_blocks={} free={}",
        inode.size(),
        inode.blocks(),
        fs.allocator().free_count()
    );

    let mut buf = vec![0u8; 10_000];
    read_at(&fs, &inode, 0, &mut buf)?;
    if buf != data[..10_000] {
        error!("data mismatch after truncate");
        return Err(Ext3Error::Corrupted { block: 0 });
    }
    fs_umount(fs)?;

    let dev = FileBlockDev::open_or_create(img_path, DEMO_BLOCKS as u64)
        .map_err(|_| Ext3Error::Io(BlockDevError::IoError))?;
    let fs = fs_mount(dev, layout, MountOptions::default())?;
    let inode = fs.iget(12)?;
    info!(
        "remounted: size={} i_blocks={} block 5 -> {}",
        inode.size(),
        inode.blocks(),
        fs.bmap(&inode, 5)?
    );
    fs_umount(fs)
}

/// truncate 已经把 inode 记入 orphan 表并提交，释放块之前掉电
fn test_powerfail_truncate() -> Ext3Result<()> {
    let disk = RamDisk::new(DEMO_BLOCK_SIZE as u32, DEMO_BLOCKS as u64);
    let layout = FsLayout::new(DEMO_BLOCK_SIZE, DEMO_BLOCKS)?;
    fs_format(disk.clone(), layout)?;

    let fs = fs_mount(disk.clone(), layout, MountOptions::default())?;
    let inode = fs.create_inode(13)?;
    write_at(&fs, &inode, 0, &pattern(200 * DEMO_BLOCK_SIZE, 3))?;
    fs.sync()?;
    let free_before = fs.allocator().free_count();
    info!("before crash: i_blocks={} free={free_before}", inode.blocks());

    let mut handle = fs.journal().start(EXT3_ORPHAN_TRANS_BLOCKS + 1)?;
    fs.orphans().orphan_add(&mut handle, &inode)?;
    {
        let mut st = inode.state();
        st.i_size = 20 * DEMO_BLOCK_SIZE as u64;
        st.i_disksize = st.i_size;
    }
    fs.mark_inode_dirty(&mut handle, &inode)?;
    fs.journal().stop(handle)?;
    fs.journal().force_commit()?;

    let image = disk.snapshot();
    drop(fs);
    warn!("power failure: {} bytes of disk image kept", image.len());
    disk.restore(&image);

    let fs = fs_mount(disk, layout, MountOptions::default())?;
    let info = fs.recovery_info();
    info!(
        "recovery: {} transactions, {} blocks replayed, {} revoked",
        info.transactions, info.replayed_blocks, info.revoked_blocks
    );
    let inode = fs.iget(13)?;
    info!(
        "after orphan cleanup: size={} i_blocks={} free={} (+{})",
        inode.size(),
        inode.blocks(),
        fs.allocator().free_count(),
        fs.allocator().free_count() - free_before
    );
    fs_umount(fs)
}

fn main() {
    if let Err(e) = log::set_logger(&LOGGER) {
        eprintln!("failed to install logger: {e}");
        return;
    }
    let level = match std::env::var("LOG").as_deref() {
        Ok("trace") => LevelFilter::Trace,
        Ok("debug") => LevelFilter::Debug,
        Ok("info") => LevelFilter::Info,
        Ok("warn") => LevelFilter::Warn,
        Ok("error") => LevelFilter::Error,
        _ => LevelFilter::Off,
    };
    log::set_max_level(level);

    let img_path = "ext3.img";
    info!("=== 镜像文件测试: {img_path} ===");
    if let Err(e) = test_image_file(img_path) {
        eprintln!("image test failed: {e}");
        return;
    }

    info!("=== truncate 断电恢复测试 ===");
    if let Err(e) = test_powerfail_truncate() {
        eprintln!("power failure test failed: {e}");
        return;
    }

    info!("=== 测试完成 ===");
}
