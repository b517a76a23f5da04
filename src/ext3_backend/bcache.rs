//! 块缓冲区缓存
//!
//! 引擎只依赖 [`BufferCache`] trait；[`Ext3BufferCache`] 是基于 [`BlockDevice`] 的默认实现。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{trace, warn};
use spin::Mutex;

use crate::ext3_backend::blockdev::*;
use crate::ext3_backend::buffer::*;
use crate::ext3_backend::error::*;

/// 缓冲区缓存协作者
pub trait BufferCache: Send + Sync {
    /// 块大小（字节）
    fn block_size(&self) -> usize;

    /// 设备总块数
    fn total_blocks(&self) -> u64;

    /// 读穿透：缓存未命中时从设备读取
    fn get_block_buffer(&self, blocknr: u32) -> Ext3Result<BufferRef>;

    /// getblk：返回缓冲区但不读盘，新建时内容全零
    fn get_or_create_buffer(&self, blocknr: u32) -> Ext3Result<BufferRef>;

    /// 只查缓存，不做 I/O
    fn find_buffer(&self, blocknr: u32) -> Option<BufferRef>;

    /// 把缓冲区写回原位置
    fn write_buffer(&self, bh: &BufferRef) -> Ext3Result<()>;

    /// 写回所有脏的非日志缓冲区（ordered 模式下提交前调用）
    fn sync_data(&self) -> Ext3Result<()>;

    /// 丢弃缓冲区，不写回（bforget）
    fn forget(&self, blocknr: u32);

    /// 绕过缓存直接读设备（日志区使用）
    fn read_raw(&self, blocknr: u32, buf: &mut [u8]) -> Ext3Result<()>;

    /// 绕过缓存直接写设备（日志区、checkpoint 使用）
    fn write_raw(&self, blocknr: u32, buf: &[u8]) -> Ext3Result<()>;

    /// 刷新设备写缓存
    fn flush_device(&self) -> Ext3Result<()>;
}

/// 基于块设备的缓冲区缓存
pub struct Ext3BufferCache<B: BlockDevice> {
    dev: Mutex<B>,
    block_size: usize,
    total_blocks: u64,
    buffers: Mutex<BTreeMap<u32, BufferRef>>,
}

impl<B: BlockDevice> Ext3BufferCache<B> {
    pub fn new(dev: B, block_size: usize) -> Ext3Result<Self> {
        if dev.block_size() as usize != block_size {
            return Err(Ext3Error::Io(BlockDevError::InvalidBlockSize {
                size: dev.block_size() as usize,
                expected: block_size,
            }));
        }
        let total_blocks = dev.total_blocks();
        Ok(Self {
            dev: Mutex::new(dev),
            block_size,
            total_blocks,
            buffers: Mutex::new(BTreeMap::new()),
        })
    }

    fn check_range(&self, blocknr: u32) -> Ext3Result<()> {
        if blocknr as u64 >= self.total_blocks {
            return Err(Ext3Error::Io(BlockDevError::BlockOutOfRange {
                block_id: blocknr,
                max_blocks: self.total_blocks,
            }));
        }
        Ok(())
    }

    fn lookup_or_insert(&self, blocknr: u32) -> BufferRef {
        let mut map = self.buffers.lock();
        map.entry(blocknr)
            .or_insert_with(|| Arc::new(Buffer::new(blocknr, self.block_size)))
            .clone()
    }

    /// 缓存中的缓冲区数量
    pub fn cached_count(&self) -> usize {
        self.buffers.lock().len()
    }

    /// 丢掉没有其他引用、也不需要写回的缓冲区
    pub fn shrink(&self) {
        let mut map = self.buffers.lock();
        map.retain(|_, bh| {
            Arc::strong_count(bh) > 1 || bh.test(BufferState::DIRTY) || bh.test(BufferState::JBD)
        });
    }
}

impl<B: BlockDevice + Send> BufferCache for Ext3BufferCache<B> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn get_block_buffer(&self, blocknr: u32) -> Ext3Result<BufferRef> {
        self.check_range(blocknr)?;
        let bh = self.lookup_or_insert(blocknr);
        if bh.test(BufferState::UPTODATE) {
            return Ok(bh);
        }
        // 在数据写锁内再判断一次，避免并发读盘覆盖他人已做的修改
        {
            let mut data = bh.write();
            if !bh.test(BufferState::UPTODATE) {
                trace!("[bcache] read block {blocknr}");
                self.dev.lock().read(&mut data, blocknr, 1)?;
                bh.set(BufferState::UPTODATE);
            }
        }
        Ok(bh)
    }

    fn get_or_create_buffer(&self, blocknr: u32) -> Ext3Result<BufferRef> {
        self.check_range(blocknr)?;
        let bh = self.lookup_or_insert(blocknr);
        if !bh.test(BufferState::UPTODATE) {
            let mut data = bh.write();
            if !bh.test(BufferState::UPTODATE) {
                data.fill(0);
                bh.set(BufferState::UPTODATE | BufferState::NEW);
            }
        }
        Ok(bh)
    }

    fn find_buffer(&self, blocknr: u32) -> Option<BufferRef> {
        self.buffers.lock().get(&blocknr).cloned()
    }

    fn write_buffer(&self, bh: &BufferRef) -> Ext3Result<()> {
        let data = bh.read();
        self.dev.lock().write(&data, bh.blocknr(), 1)?;
        bh.clear(BufferState::DIRTY | BufferState::NEW);
        Ok(())
    }

    fn sync_data(&self) -> Ext3Result<()> {
        let dirty: Vec<BufferRef> = self
            .buffers
            .lock()
            .values()
            .filter(|bh| bh.test(BufferState::DIRTY) && !bh.test(BufferState::JBD))
            .cloned()
            .collect();
        for bh in dirty.iter() {
            self.write_buffer(bh)?;
        }
        if !dirty.is_empty() {
            self.flush_device()?;
        }
        Ok(())
    }

    fn forget(&self, blocknr: u32) {
        if let Some(bh) = self.buffers.lock().remove(&blocknr) {
            if bh.test(BufferState::DIRTY) {
                warn!("[bcache] forgetting dirty block {blocknr}");
            }
            bh.clear(BufferState::DIRTY | BufferState::JBD);
        }
    }

    fn read_raw(&self, blocknr: u32, buf: &mut [u8]) -> Ext3Result<()> {
        self.check_range(blocknr)?;
        self.dev.lock().read(buf, blocknr, 1)?;
        Ok(())
    }

    fn write_raw(&self, blocknr: u32, buf: &[u8]) -> Ext3Result<()> {
        self.check_range(blocknr)?;
        let mut dev = self.dev.lock();
        if dev.is_readonly() {
            return Err(Ext3Error::Io(BlockDevError::ReadOnly));
        }
        dev.write(buf, blocknr, 1)?;
        Ok(())
    }

    fn flush_device(&self) -> Ext3Result<()> {
        self.dev.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (RamDisk, Ext3BufferCache<RamDisk>) {
        let disk = RamDisk::new(1024, 16);
        let cache = Ext3BufferCache::new(disk.clone(), 1024).unwrap();
        (disk, cache)
    }

    #[test]
    fn test_read_through_and_hit() {
        let (mut disk, cache) = cache();
        let mut data = [0u8; 1024];
        data[0] = 0x5A;
        disk.write(&data, 3, 1).unwrap();

        let bh = cache.get_block_buffer(3).unwrap();
        assert_eq!(bh.read()[0], 0x5A);
        let again = cache.get_block_buffer(3).unwrap();
        assert!(Arc::ptr_eq(&bh, &again));
    }

    #[test]
    fn test_getblk_zero_filled() {
        let (mut disk, cache) = cache();
        disk.write(&[0xFFu8; 1024], 5, 1).unwrap();
        let bh = cache.get_or_create_buffer(5).unwrap();
        assert!(bh.read().iter().all(|b| *b == 0));
        assert!(bh.test(BufferState::NEW));
    }

    #[test]
    fn test_sync_data_skips_journaled() {
        let (disk, cache) = cache();
        let data_bh = cache.get_or_create_buffer(6).unwrap();
        data_bh.write()[0] = 1;
        data_bh.set(BufferState::DIRTY);
        let meta_bh = cache.get_or_create_buffer(7).unwrap();
        meta_bh.write()[0] = 2;
        meta_bh.set(BufferState::DIRTY | BufferState::JBD);

        cache.sync_data().unwrap();
        let image = disk.snapshot();
        assert_eq!(image[6 * 1024], 1);
        assert_eq!(image[7 * 1024], 0);
        assert!(!data_bh.test(BufferState::DIRTY));
        assert!(meta_bh.test(BufferState::DIRTY));
    }

    #[test]
    fn test_out_of_range() {
        let (_, cache) = cache();
        assert!(matches!(
            cache.get_block_buffer(16),
            Err(Ext3Error::Io(BlockDevError::BlockOutOfRange { .. }))
        ));
    }
}
