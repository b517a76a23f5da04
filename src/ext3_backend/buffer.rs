//! 块缓冲区（buffer head）
//!
//! 每个缓冲区对应一个物理块，引用计数共享。数据区由读写锁保护：
//! 校验链时短暂持有读锁，修改指针时持有写锁。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ext3_backend::endian::{read_le32, write_le32};

bitflags! {
    /// 缓冲区状态位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferState: u32 {
        /// 内容与磁盘一致或已被完整初始化
        const UPTODATE = 1 << 0;
        /// 数据已修改，等待写回原位置
        const DIRTY = 1 << 1;
        /// 受日志管理的元数据，只能经由 checkpoint 写回
        const JBD = 1 << 2;
        /// 刚由 getblk 创建，内容是全零
        const NEW = 1 << 3;
    }
}

pub struct Buffer {
    blocknr: u32,
    state: AtomicU32,
    data: RwLock<Vec<u8>>,
}

/// 缓冲区共享句柄
pub type BufferRef = Arc<Buffer>;

impl Buffer {
    pub fn new(blocknr: u32, size: usize) -> Self {
        Self {
            blocknr,
            state: AtomicU32::new(0),
            data: RwLock::new(vec![0u8; size]),
        }
    }

    pub fn blocknr(&self) -> u32 {
        self.blocknr
    }

    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub fn test(&self, flags: BufferState) -> bool {
        self.state().contains(flags)
    }

    pub fn set(&self, flags: BufferState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn clear(&self, flags: BufferState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// 持有读锁访问数据
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// 持有写锁访问数据（lock_buffer）
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    /// 读取第 idx 个块号槽位
    pub fn get_le32(&self, idx: usize) -> u32 {
        read_le32(&self.data.read(), idx * 4)
    }

    /// 写入第 idx 个块号槽位
    pub fn set_le32(&self, idx: usize, v: u32) {
        write_le32(&mut self.data.write(), idx * 4, v);
    }

    /// 数据区全部清零
    pub fn zero(&self) {
        self.data.write().fill(0);
    }

    pub fn copy_data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn fill_from(&self, src: &[u8]) {
        let mut data = self.data.write();
        let n = data.len().min(src.len());
        data[..n].copy_from_slice(&src[..n]);
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("blocknr", &self.blocknr)
            .field("state", &self.state())
            .finish()
    }
}

/// 检查 [first, last) 范围内的块号是否全为 0
pub fn all_zeroes(data: &[u8], first: usize, last: usize) -> bool {
    (first..last).all(|i| read_le32(data, i * 4) == 0)
}
