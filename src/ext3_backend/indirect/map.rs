//! 逻辑块 -> 物理块映射
//!
//! 解析链；遇到空洞且允许分配时，选目标、建分支、挂接。链在任意一步被并发
//! 修改都会以 `Changed` 结束，整个过程从解析重新开始。
//! 整个过程持有 truncate_sem 读锁，和 truncate 互斥，多个映射之间并发。

use log::trace;

use crate::ext3_backend::buffer::*;
use crate::ext3_backend::config::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::get_branch;
use crate::ext3_backend::indirect::path::block_to_path;
use crate::ext3_backend::inode::Inode;
use crate::ext3_backend::jbd::{Handle, Journal};

/// 映射结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapping {
    /// 已映射；`new` 表示这次调用刚分配
    Mapped { pblk: u32, new: bool },
    /// 空洞
    Hole,
}

impl BlockMapping {
    /// 物理块号，空洞返回 None
    pub fn pblk(&self) -> Option<u32> {
        match self {
            BlockMapping::Mapped { pblk, .. } => Some(*pblk),
            BlockMapping::Hole => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, BlockMapping::Mapped { new: true, .. })
    }
}

impl Ext3Fs {
    /// 映射逻辑块 `iblock`
    ///
    /// `create` 为 false 时只查找，空洞返回 [`BlockMapping::Hole`]，不需要 handle。
    /// `create` 为 true 时必须提供 handle，所有修改都记在它的事务里；
    /// credit 不够时先 extend，extend 不成再 restart 这个 handle。
    /// 新分配的块在文件末尾之后时，文件大小（含磁盘上的大小）扩展到覆盖这个块。
    pub fn map_block(
        &self,
        mut handle: Option<&mut Handle>,
        inode: &Inode,
        iblock: i64,
        create: bool,
    ) -> Ext3Result<BlockMapping> {
        let path = block_to_path(&self.geo, inode.ino(), iblock);
        if !path.is_valid() {
            return Err(Ext3Error::OutOfRange { block: iblock });
        }
        if create {
            self.check_writable()?;
            if handle.is_none() {
                return Err(Ext3Error::InvalidArgument);
            }
        }

        loop {
            let guard = self.lock_with_handle(handle.as_deref_mut(), || {
                inode.truncate_sem().try_read()
            })?;
            let res =
                self.map_block_locked(handle.as_deref_mut(), inode, iblock, path.offsets(), create);
            drop(guard);

            match res {
                Err(Ext3Error::Changed) => {
                    trace!(
                        "[map] inode {} block {iblock}: chain changed, retrying",
                        inode.ino()
                    );
                }
                Err(Ext3Error::NoCredits) => {
                    let Some(h) = handle.as_deref_mut() else {
                        return Err(Ext3Error::NoCredits);
                    };
                    self.ensure_credits(h, EXT3_DATA_TRANS_BLOCKS)?;
                }
                res => return res,
            }
        }
    }

    fn map_block_locked(
        &self,
        handle: Option<&mut Handle>,
        inode: &Inode,
        iblock: i64,
        offsets: &[usize],
        create: bool,
    ) -> Ext3Result<BlockMapping> {
        let branch = get_branch(self.cache.as_ref(), inode, offsets)?;
        let Some(partial) = branch.partial else {
            let pblk = branch.chain[branch.chain.len() - 1].key;
            trace!("[map] inode {} block {iblock} -> {pblk}", inode.ino());
            return Ok(BlockMapping::Mapped { pblk, new: false });
        };
        if !create {
            return Ok(BlockMapping::Hole);
        }
        let Some(handle) = handle else {
            return Err(Ext3Error::InvalidArgument);
        };

        let goal = self.find_goal(inode, iblock, &branch.chain, partial)?;
        let left = offsets.len() - partial;
        let new = self.alloc_branch(
            handle,
            inode,
            left,
            goal,
            &offsets[partial..],
            branch.chain[partial].slot.clone(),
        )?;
        self.splice_branch(handle, inode, iblock, &branch.chain, partial, &new)?;

        let pblk = new[new.len() - 1].key;
        trace!(
            "[map] inode {} block {iblock} -> {pblk} (new, {left} blocks, goal {goal})",
            inode.ino()
        );
        Ok(BlockMapping::Mapped { pblk, new: true })
    }

    /// 只读映射，空洞返回 0
    pub fn bmap(&self, inode: &Inode, iblock: i64) -> Ext3Result<u32> {
        Ok(self.map_block(None, inode, iblock, false)?.pblk().unwrap_or(0))
    }

    /// 保证 handle 至少还有 `needed` 个 credit
    pub(crate) fn ensure_credits(&self, handle: &mut Handle, needed: u32) -> Ext3Result<()> {
        if handle.credits() >= needed {
            return Ok(());
        }
        if !self.journal.extend(handle, needed)? {
            self.journal.restart(handle, needed)?;
        }
        Ok(())
    }

    /// 映射并返回数据块的缓冲区，空洞且不分配时返回 None
    ///
    /// 新分配的块不读盘，缓冲区直接清零；数据日志模式下清零本身也记入日志，
    /// 否则把缓冲区标脏，随数据写回。
    pub fn getblk(
        &self,
        mut handle: Option<&mut Handle>,
        inode: &Inode,
        iblock: i64,
        create: bool,
    ) -> Ext3Result<Option<BufferRef>> {
        let mapping = self.map_block(handle.as_deref_mut(), inode, iblock, create)?;
        let BlockMapping::Mapped { pblk, new } = mapping else {
            return Ok(None);
        };
        if !new {
            return Ok(Some(self.cache.get_block_buffer(pblk)?));
        }

        let bh = self.cache.get_or_create_buffer(pblk)?;
        let Some(handle) = handle else {
            return Err(Ext3Error::InvalidArgument);
        };
        if self.should_journal_data(inode) {
            self.ensure_credits(handle, 1)?;
            self.journal.get_create_access(handle, &bh)?;
            bh.zero();
            bh.set(BufferState::UPTODATE);
            self.journal.dirty_metadata(handle, &bh)?;
        } else {
            bh.zero();
            bh.set(BufferState::UPTODATE | BufferState::DIRTY);
        }
        Ok(Some(bh))
    }

    /// 同 [`getblk`](Self::getblk)，但保证返回的缓冲区内容有效
    pub fn bread(
        &self,
        handle: Option<&mut Handle>,
        inode: &Inode,
        iblock: i64,
        create: bool,
    ) -> Ext3Result<Option<BufferRef>> {
        let Some(bh) = self.getblk(handle, inode, iblock, create)? else {
            return Ok(None);
        };
        if bh.test(BufferState::UPTODATE) {
            return Ok(Some(bh));
        }
        Ok(Some(self.cache.get_block_buffer(bh.blocknr())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext3_backend::balloc::BlockAllocator;
    use crate::ext3_backend::blockdev::RamDisk;

    fn fs() -> Ext3Fs {
        let disk = RamDisk::new(1024, 16384);
        let layout = FsLayout::new(1024, 16384).unwrap();
        Ext3Fs::format(disk.clone(), layout).unwrap();
        Ext3Fs::mount(disk, layout, MountOptions::default()).unwrap()
    }

    #[test]
    fn test_lookup_hole_without_handle() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        assert_eq!(fs.map_block(None, &inode, 7, false).unwrap(), BlockMapping::Hole);
        assert_eq!(fs.bmap(&inode, 300).unwrap(), 0);
    }

    #[test]
    fn test_create_requires_handle() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        assert_eq!(
            fs.map_block(None, &inode, 0, true),
            Err(Ext3Error::InvalidArgument)
        );
    }

    #[test]
    fn test_direct_block_allocation() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let free = fs.allocator().free_count();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let m = fs.map_block(Some(&mut handle), &inode, 5, true).unwrap();
        fs.journal().stop(handle).unwrap();

        assert!(m.is_new());
        let pblk = m.pblk().unwrap();
        assert_eq!(inode.block_map()[5], pblk);
        assert_eq!(fs.allocator().free_count(), free - 1);
        assert_eq!(inode.blocks(), 2);
        assert_eq!(fs.bmap(&inode, 5).unwrap(), pblk);
    }

    #[test]
    fn test_allocation_past_eof_extends_size() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        fs.map_block(Some(&mut handle), &inode, 20, true).unwrap();
        assert_eq!(inode.size(), 21 * 1024);
        assert_eq!(inode.disksize(), 21 * 1024);

        // 填洞不改变大小
        fs.map_block(Some(&mut handle), &inode, 3, true).unwrap();
        fs.journal().stop(handle).unwrap();
        assert_eq!(inode.size(), 21 * 1024);
    }

    #[test]
    fn test_sequential_blocks_are_contiguous() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let a = fs.map_block(Some(&mut handle), &inode, 0, true).unwrap().pblk().unwrap();
        let b = fs.map_block(Some(&mut handle), &inode, 1, true).unwrap().pblk().unwrap();
        let c = fs.map_block(Some(&mut handle), &inode, 2, true).unwrap().pblk().unwrap();
        fs.journal().stop(handle).unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn test_runs_out_of_credits_and_continues() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let mut handle = fs.journal().start(2).unwrap();
        for iblock in 0..40 {
            fs.map_block(Some(&mut handle), &inode, iblock, true).unwrap();
        }
        fs.journal().stop(handle).unwrap();
        for iblock in 0..40 {
            assert_ne!(fs.bmap(&inode, iblock).unwrap(), 0);
        }
    }

    #[test]
    fn test_getblk_zeroes_new_block() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let bh = fs.getblk(Some(&mut handle), &inode, 3, true).unwrap().unwrap();
        fs.journal().stop(handle).unwrap();
        assert!(bh.read().iter().all(|b| *b == 0));
        assert!(bh.test(BufferState::DIRTY));
        assert!(fs.getblk(None, &inode, 4, false).unwrap().is_none());
        let again = fs.bread(None, &inode, 3, false).unwrap().unwrap();
        assert_eq!(again.blocknr(), bh.blocknr());
    }
}
