//! 内存 inode
//!
//! 锁的顺序：truncate_sem -> i_data / 间接块缓冲区 -> state。
//! 映射操作持有 truncate_sem 的读锁，truncate 持有写锁。

use alloc::sync::Arc;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard, RwLock};

use crate::ext3_backend::config::*;
use crate::ext3_backend::disknode::*;

bitflags! {
    /// inode 标志（与磁盘 i_flags 位一致）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u32 {
        const SYNC = EXT3_SYNC_FL;
        const IMMUTABLE = EXT3_IMMUTABLE_FL;
        const APPEND = EXT3_APPEND_FL;
        const JOURNAL_DATA = EXT3_JOURNAL_DATA_FL;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InodeState {
    /// 内存中的文件大小（写路径先扩展它）
    pub i_size: u64,
    /// 已写入磁盘 inode 的大小
    pub i_disksize: u64,
    /// 占用的 512 字节扇区数
    pub i_blocks: u64,
    pub flags: InodeFlags,
    /// 不认识的 i_flags 位，原样写回
    pub other_flags: u32,
    pub links_count: u16,
    pub mode: u16,
    /// 顺序写启发：下一次期望映射的逻辑块，以及对应的物理块目标
    pub next_alloc_block: u64,
    pub next_alloc_goal: u32,
}

pub struct Inode {
    ino: u32,
    block_group: u32,
    /// 块指针数组；直接挂到 inode 上的 splice 需要它的写锁
    i_data: RwLock<BlockMap>,
    truncate_sem: RwLock<()>,
    state: Mutex<InodeState>,
}

pub type InodeRef = Arc<Inode>;

impl Inode {
    pub fn new(ino: u32, block_group: u32) -> Self {
        Self {
            ino,
            block_group,
            i_data: RwLock::new([0; EXT3_N_BLOCKS]),
            truncate_sem: RwLock::new(()),
            state: Mutex::new(InodeState {
                mode: S_IFREG | 0o644,
                links_count: 1,
                ..Default::default()
            }),
        }
    }

    pub fn from_raw(ino: u32, block_group: u32, raw: &RawInode) -> Self {
        let flags = InodeFlags::from_bits_truncate(raw.i_flags);
        Self {
            ino,
            block_group,
            i_data: RwLock::new(raw.i_block),
            truncate_sem: RwLock::new(()),
            state: Mutex::new(InodeState {
                i_size: raw.i_size,
                i_disksize: raw.i_size,
                i_blocks: raw.i_blocks as u64,
                flags,
                other_flags: raw.i_flags & !flags.bits(),
                links_count: raw.i_links_count,
                mode: raw.i_mode,
                next_alloc_block: 0,
                next_alloc_goal: 0,
            }),
        }
    }

    /// 生成要写回磁盘的记录，大小取 i_disksize
    pub fn to_raw(&self) -> RawInode {
        let i_block = *self.i_data.read();
        let st = self.state.lock();
        RawInode {
            i_mode: st.mode,
            i_size: st.i_disksize,
            i_links_count: st.links_count,
            i_blocks: st.i_blocks as u32,
            i_flags: st.flags.bits() | st.other_flags,
            i_block,
        }
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn block_group(&self) -> u32 {
        self.block_group
    }

    pub fn i_data(&self) -> &RwLock<BlockMap> {
        &self.i_data
    }

    pub fn truncate_sem(&self) -> &RwLock<()> {
        &self.truncate_sem
    }

    pub fn state(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    /// 块指针数组的快照
    pub fn block_map(&self) -> BlockMap {
        *self.i_data.read()
    }

    pub fn size(&self) -> u64 {
        self.state.lock().i_size
    }

    pub fn disksize(&self) -> u64 {
        self.state.lock().i_disksize
    }

    pub fn blocks(&self) -> u64 {
        self.state.lock().i_blocks
    }

    pub fn flags(&self) -> InodeFlags {
        self.state.lock().flags
    }

    pub fn set_flags(&self, flags: InodeFlags) {
        self.state.lock().flags = flags;
    }

    pub fn links_count(&self) -> u16 {
        self.state.lock().links_count
    }

    pub fn set_links_count(&self, n: u16) {
        self.state.lock().links_count = n;
    }

    /// 只扩展内存大小，不会缩小
    pub fn extend_size(&self, size: u64) {
        let mut st = self.state.lock();
        if size > st.i_size {
            st.i_size = size;
        }
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Inode")
            .field("ino", &self.ino)
            .field("i_size", &st.i_size)
            .field("i_disksize", &st.i_disksize)
            .field("i_blocks", &st.i_blocks)
            .field("flags", &st.flags)
            .finish()
    }
}
