//! orphan 表
//!
//! 记录正在 truncate / 删除的 inode，崩溃后在挂载时补完。
//! 磁盘格式：一个块，[count: LE32][ino: LE32; count]。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};
use spin::Mutex;

use crate::ext3_backend::bcache::BufferCache;
use crate::ext3_backend::endian::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::inode::Inode;
use crate::ext3_backend::jbd::{Handle, Journal};

/// orphan 链表协作者；add / del 都是幂等的
pub trait OrphanList: Send + Sync {
    fn orphan_add(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()>;

    fn orphan_del(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()>;

    fn contains(&self, ino: u32) -> bool;

    /// 当前表中的全部 inode 号
    fn list(&self) -> Ext3Result<Vec<u32>>;
}

/// 单块 orphan 表
pub struct OrphanTable {
    cache: Arc<dyn BufferCache>,
    journal: Arc<dyn Journal>,
    block: u32,
    /// 串行化对表块的读改写
    lock: Mutex<()>,
}

impl OrphanTable {
    pub fn format(cache: &dyn BufferCache, block: u32) -> Ext3Result<()> {
        let zero = vec![0u8; cache.block_size()];
        cache.write_raw(block, &zero)
    }

    pub fn new(cache: Arc<dyn BufferCache>, journal: Arc<dyn Journal>, block: u32) -> Self {
        Self {
            cache,
            journal,
            block,
            lock: Mutex::new(()),
        }
    }

    fn capacity(&self) -> usize {
        self.cache.block_size() / 4 - 1
    }

    fn entries(data: &[u8]) -> Vec<u32> {
        let count = (read_le32(data, 0) as usize).min(data.len() / 4 - 1);
        (0..count).map(|i| read_le32(data, 4 + i * 4)).collect()
    }

    fn store(data: &mut [u8], inos: &[u32]) {
        data.fill(0);
        write_le32(data, 0, inos.len() as u32);
        for (i, ino) in inos.iter().enumerate() {
            write_le32(data, 4 + i * 4, *ino);
        }
    }
}

impl OrphanList for OrphanTable {
    fn orphan_add(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()> {
        let _guard = self.lock.lock();
        let bh = self.cache.get_block_buffer(self.block)?;
        let mut inos = Self::entries(&bh.read());
        if inos.contains(&inode.ino()) {
            return Ok(());
        }
        if inos.len() >= self.capacity() {
            warn!("[orphan] table full, cannot add inode {}", inode.ino());
            return Err(Ext3Error::NoSpace);
        }
        self.journal.get_write_access(handle, &bh)?;
        inos.push(inode.ino());
        Self::store(&mut bh.write(), &inos);
        self.journal.dirty_metadata(handle, &bh)?;
        trace!("[orphan] add inode {} (tid={})", inode.ino(), handle.tid());
        Ok(())
    }

    fn orphan_del(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()> {
        let _guard = self.lock.lock();
        let bh = self.cache.get_block_buffer(self.block)?;
        let mut inos = Self::entries(&bh.read());
        let Some(pos) = inos.iter().position(|i| *i == inode.ino()) else {
            return Ok(());
        };
        self.journal.get_write_access(handle, &bh)?;
        inos.remove(pos);
        Self::store(&mut bh.write(), &inos);
        self.journal.dirty_metadata(handle, &bh)?;
        debug!("[orphan] del inode {} (tid={})", inode.ino(), handle.tid());
        Ok(())
    }

    fn contains(&self, ino: u32) -> bool {
        let _guard = self.lock.lock();
        match self.cache.get_block_buffer(self.block) {
            Ok(bh) => Self::entries(&bh.read()).contains(&ino),
            Err(_) => false,
        }
    }

    fn list(&self) -> Ext3Result<Vec<u32>> {
        let _guard = self.lock.lock();
        let bh = self.cache.get_block_buffer(self.block)?;
        let inos = Self::entries(&bh.read());
        Ok(inos)
    }
}
