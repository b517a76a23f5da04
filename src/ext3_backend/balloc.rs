//! 块分配器
//!
//! 每个块组一个位图块，位图修改都通过日志。事务中释放的块在该事务提交之前
//! 不会被重新分配。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::ext3_backend::bcache::BufferCache;
use crate::ext3_backend::config::FsLayout;
use crate::ext3_backend::error::*;
use crate::ext3_backend::jbd::{Handle, Journal};

/// 块分配协作者
pub trait BlockAllocator: Send + Sync {
    /// 分配一个块，尽量靠近 goal
    fn alloc_block(&self, handle: &mut Handle, goal: u32) -> Ext3Result<u32>;

    /// 释放 [start, start + count) 的连续块
    fn free_blocks(&self, handle: &mut Handle, start: u32, count: u32) -> Ext3Result<()>;

    /// 位图中该块是否已占用
    fn is_allocated(&self, blocknr: u32) -> Ext3Result<bool>;

    /// 空闲块数
    fn free_count(&self) -> u32;
}

#[inline]
fn test_bit(bitmap: &[u8], bit: u32) -> bool {
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

#[inline]
fn set_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
}

#[inline]
fn clear_bit(bitmap: &mut [u8], bit: u32) {
    bitmap[(bit / 8) as usize] &= !(1 << (bit % 8));
}

struct AllocState {
    free_count: u32,
    /// 块号 -> 释放它的事务号
    deferred: BTreeMap<u32, u32>,
}

/// 基于块位图的分配器
pub struct BitmapAllocator {
    cache: Arc<dyn BufferCache>,
    journal: Arc<dyn Journal>,
    layout: FsLayout,
    state: Mutex<AllocState>,
}

impl BitmapAllocator {
    /// 写入初始位图：元数据区和超出设备末尾的位都标记为已用
    pub fn format(cache: &dyn BufferCache, layout: &FsLayout) -> Ext3Result<()> {
        let first_data = layout.first_data_block();
        for g in 0..layout.groups_count() {
            let mut bitmap = vec![0u8; layout.block_size];
            let group_start = g * layout.blocks_per_group;
            for bit in 0..(layout.block_size * 8) as u32 {
                let blk = group_start as u64 + bit as u64;
                if blk < first_data as u64
                    || blk >= layout.blocks_count as u64
                    || bit >= layout.blocks_per_group
                {
                    set_bit(&mut bitmap, bit);
                }
            }
            cache.write_raw(layout.bitmap_start + g, &bitmap)?;
        }
        cache.flush_device()?;
        debug!(
            "[balloc] formatted {} group bitmaps, first data block {first_data}",
            layout.groups_count()
        );
        Ok(())
    }

    pub fn load(
        cache: Arc<dyn BufferCache>,
        journal: Arc<dyn Journal>,
        layout: FsLayout,
    ) -> Ext3Result<Self> {
        let mut free = 0u32;
        for g in 0..layout.groups_count() {
            let bh = cache.get_block_buffer(layout.bitmap_start + g)?;
            let data = bh.read();
            for bit in 0..Self::group_bits(&layout, g) {
                if !test_bit(&data, bit) {
                    free += 1;
                }
            }
        }
        debug!("[balloc] loaded, {free} free blocks");
        Ok(Self {
            cache,
            journal,
            layout,
            state: Mutex::new(AllocState {
                free_count: free,
                deferred: BTreeMap::new(),
            }),
        })
    }

    /// 组内有效位数（最后一个组可能不满）
    fn group_bits(layout: &FsLayout, group: u32) -> u32 {
        let group_start = group * layout.blocks_per_group;
        (layout.blocks_count - group_start).min(layout.blocks_per_group)
    }

    /// 在组内从 start_bit 开始找一个可用位，到末尾后回绕
    fn search_group(
        &self,
        bitmap: &[u8],
        group: u32,
        start_bit: u32,
        deferred: &BTreeMap<u32, u32>,
    ) -> Option<u32> {
        let bits = Self::group_bits(&self.layout, group);
        let group_start = group * self.layout.blocks_per_group;
        (start_bit..bits)
            .chain(0..start_bit.min(bits))
            .find(|bit| {
                !test_bit(bitmap, *bit) && !deferred.contains_key(&(group_start + *bit))
            })
    }

    /// 已释放但所在事务尚未提交的块数
    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }
}

impl BlockAllocator for BitmapAllocator {
    fn alloc_block(&self, handle: &mut Handle, goal: u32) -> Ext3Result<u32> {
        let layout = &self.layout;
        let mut st = self.state.lock();
        let committed = self.journal.committed_tid();
        st.deferred.retain(|_, tid| *tid > committed);
        if st.free_count == 0 {
            return Err(Ext3Error::NoSpace);
        }

        let goal = if goal < layout.first_data_block() || goal >= layout.blocks_count {
            layout.first_data_block()
        } else {
            goal
        };
        let groups = layout.groups_count();
        let goal_group = goal / layout.blocks_per_group;

        for i in 0..groups {
            let g = (goal_group + i) % groups;
            let start_bit = if i == 0 {
                goal % layout.blocks_per_group
            } else {
                0
            };
            let bh = self.cache.get_block_buffer(layout.bitmap_start + g)?;
            let found = {
                let data = bh.read();
                self.search_group(&data, g, start_bit, &st.deferred)
            };
            let Some(bit) = found else {
                continue;
            };

            self.journal.get_write_access(handle, &bh)?;
            set_bit(&mut bh.write(), bit);
            self.journal.dirty_metadata(handle, &bh)?;
            st.free_count -= 1;

            let blocknr = g * layout.blocks_per_group + bit;
            trace!("[balloc] goal={goal} -> block {blocknr} (group {g})");
            return Ok(blocknr);
        }
        Err(Ext3Error::NoSpace)
    }

    fn free_blocks(&self, handle: &mut Handle, start: u32, count: u32) -> Ext3Result<()> {
        if count == 0 {
            return Ok(());
        }
        let layout = &self.layout;
        let end = start as u64 + count as u64;
        if start < layout.first_data_block() || end > layout.blocks_count as u64 {
            error!("[balloc] freeing blocks not in datazone: block={start} count={count}");
            return Err(Ext3Error::Corrupted { block: start });
        }
        let end = end as u32;
        let tid = handle.tid();

        let mut st = self.state.lock();
        let mut blk = start;
        while blk < end {
            let g = blk / layout.blocks_per_group;
            let group_start = g * layout.blocks_per_group;
            let group_end = end.min(group_start + layout.blocks_per_group);
            let bh = self.cache.get_block_buffer(layout.bitmap_start + g)?;
            self.journal.get_write_access(handle, &bh)?;
            {
                let mut data = bh.write();
                for b in blk..group_end {
                    let bit = b - group_start;
                    if !test_bit(&data, bit) {
                        warn!("[balloc] bit already cleared for block {b}");
                        continue;
                    }
                    clear_bit(&mut data, bit);
                    st.free_count += 1;
                    st.deferred.insert(b, tid);
                }
            }
            self.journal.dirty_metadata(handle, &bh)?;
            blk = group_end;
        }
        trace!("[balloc] freed [{start}, {end}) in tid={tid}");
        Ok(())
    }

    fn is_allocated(&self, blocknr: u32) -> Ext3Result<bool> {
        if blocknr >= self.layout.blocks_count {
            return Err(Ext3Error::InvalidArgument);
        }
        let g = blocknr / self.layout.blocks_per_group;
        let bh = self.cache.get_block_buffer(self.layout.bitmap_start + g)?;
        let data = bh.read();
        Ok(test_bit(&data, blocknr - g * self.layout.blocks_per_group))
    }

    fn free_count(&self) -> u32 {
        self.state.lock().free_count
    }
}
