//! truncate：释放新文件末尾之后的所有块
//!
//! 整个过程持有 truncate_sem 写锁。释放按块树自底向上进行，每个间接块在它
//! 下面的块全部释放之后才释放；每一步之前检查事务 credit，
//! 不足时 extend，extend 失败就提交当前事务再开一个新的。
//! inode 在开始时加入 orphan 表，横跨所有事务，崩溃后由挂载时的 orphan
//! 清理按磁盘上的大小重新执行。

use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};

use crate::ext3_backend::buffer::*;
use crate::ext3_backend::config::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::SlotRef;
use crate::ext3_backend::indirect::path::block_to_path;
use crate::ext3_backend::inode::*;
use crate::ext3_backend::jbd::{Handle, Journal};

/// 一组待释放指针所在的位置
#[derive(Debug, Clone)]
enum Parent {
    /// inode 的 i_block
    Inode,
    /// 间接块
    Buffer(BufferRef),
    /// 已经从树上摘下来的单个指针，槽位由调用者清零
    Detached(u32),
}

impl Parent {
    fn load(&self, inode: &Inode, idx: usize) -> u32 {
        match self {
            Parent::Inode => inode.i_data().read()[idx],
            Parent::Buffer(bh) => bh.get_le32(idx),
            Parent::Detached(nr) => *nr,
        }
    }

    /// 清零槽位；间接块的写权限由调用者负责
    fn clear(&self, inode: &Inode, idx: usize) {
        match self {
            Parent::Inode => inode.i_data().write()[idx] = 0,
            Parent::Buffer(bh) => bh.set_le32(idx, 0),
            Parent::Detached(_) => {}
        }
    }

    fn bh(&self) -> Option<&BufferRef> {
        match self {
            Parent::Buffer(bh) => Some(bh),
            _ => None,
        }
    }
}

/// free_branches 工作栈中的一帧：正在从后往前扫描的一组指针
struct Frame {
    parent: Parent,
    first: usize,
    /// 下一个要看的槽位是 cursor - 1
    cursor: usize,
    /// parent 中的指针距离数据块还有几层
    depth: usize,
    /// 已经压栈、等待释放的子块：(槽位, 块号, 缓冲区)
    pending: Option<(usize, u32, BufferRef)>,
}

impl Frame {
    fn new(parent: Parent, first: usize, last: usize, depth: usize) -> Self {
        Self {
            parent,
            first,
            cursor: last,
            depth,
            pending: None,
        }
    }
}

impl Ext3Fs {
    /// truncate 一个事务需要的 credit
    pub fn blocks_for_truncate(&self, inode: &Inode) -> u32 {
        let needed = (inode.blocks() >> (self.geo.block_size_bits() - 9))
            .clamp(2, EXT3_MAX_TRANS_DATA as u64) as u32;
        EXT3_DATA_TRANS_BLOCKS + needed
    }

    /// 把文件大小改为 `new_size`
    ///
    /// 变大只修改大小；变小或不变时释放新末尾之后的所有块，
    /// 并把最后一个不完整块的尾部清零。
    pub fn truncate(&self, inode: &Inode, new_size: u64) -> Ext3Result<()> {
        if inode
            .flags()
            .intersects(InodeFlags::APPEND | InodeFlags::IMMUTABLE)
        {
            return Err(Ext3Error::NotPermitted);
        }
        self.check_writable()?;
        let bs = self.geo.block_size() as u64;
        if new_size.div_ceil(bs) > self.geo.max_blocks() {
            return Err(Ext3Error::OutOfRange {
                block: new_size.div_ceil(bs) as i64,
            });
        }

        {
            let mut st = inode.state();
            if new_size <= st.i_size {
                st.i_size = new_size;
            } else {
                st.i_size = new_size;
                st.i_disksize = new_size;
                drop(st);
                let mut handle = self.journal.start(1)?;
                let res = self.mark_inode_dirty(&mut handle, inode);
                self.journal.stop(handle)?;
                return res;
            }
        }
        debug!("[truncate] inode {} -> {new_size} bytes", inode.ino());
        self.truncate_blocks(inode)
    }

    /// 按内存中的 i_size 释放多余的块
    pub(crate) fn truncate_blocks(&self, inode: &Inode) -> Ext3Result<()> {
        let mut handle = self.journal.start(self.blocks_for_truncate(inode))?;
        let res = self.truncate_locked(&mut handle, inode);
        if let Err(e) = &res {
            warn!(
                "[truncate] inode {}: {e}, leaving it on the orphan list",
                inode.ino()
            );
        }
        let stopped = self.journal.stop(handle);
        res?;
        stopped
    }

    fn truncate_locked(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()> {
        let size = inode.size();
        let last_block = size.div_ceil(self.geo.block_size() as u64) as i64;

        self.block_truncate_page(handle, inode, size)?;

        let path = block_to_path(&self.geo, inode.ino(), last_block);
        if !path.is_valid() {
            if inode.links_count() > 0 {
                self.orphans.orphan_del(handle, inode)?;
            }
            return Ok(());
        }

        self.orphans.orphan_add(handle, inode)?;
        inode.state().i_disksize = size;
        self.mark_inode_dirty(handle, inode)?;

        let guard = self.lock_with_handle(Some(&mut *handle), || inode.truncate_sem().try_write())?;

        let offsets = path.offsets();
        let n = path.depth();
        if n == 1 {
            self.free_data(handle, inode, &Parent::Inode, offsets[0], EXT3_NDIR_BLOCKS)?;
        } else {
            self.free_shared_branch(handle, inode, n, offsets)?;
        }
        self.free_whole_subtrees(handle, inode, offsets[0])?;
        drop(guard);

        self.mark_inode_dirty(handle, inode)?;
        if inode.flags().contains(InodeFlags::SYNC) {
            handle.set_sync();
        }
        if inode.links_count() > 0 {
            self.orphans.orphan_del(handle, inode)?;
        }
        debug!(
            "[truncate] inode {} done: {} bytes, {} sectors",
            inode.ino(),
            size,
            inode.blocks()
        );
        Ok(())
    }

    /// 新末尾落在某个间接分支中间
    fn free_shared_branch(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        n: usize,
        offsets: &[usize],
    ) -> Ext3Result<()> {
        let shared = self.find_shared(inode, n, offsets)?;
        let p = shared.partial;

        // 分离出来的子树
        if shared.top != 0 {
            let depth = n - 1 - p;
            match shared.chain[p].slot.clone() {
                SlotRef::Inode(idx) => {
                    self.free_branches(handle, inode, Parent::Detached(shared.top), 0, 1, depth)?;
                    inode.i_data().write()[idx] = 0;
                }
                SlotRef::Buffer(bh, idx) => {
                    self.free_branches(handle, inode, Parent::Buffer(bh), idx, idx + 1, depth)?;
                }
            }
        }

        // 共享分支上每个间接块的尾部
        let apb = self.geo.addr_per_block();
        for q in (1..=p).rev() {
            if let SlotRef::Buffer(bh, idx) = &shared.chain[q].slot {
                self.free_branches(
                    handle,
                    inode,
                    Parent::Buffer(bh.clone()),
                    idx + 1,
                    apb,
                    n - 1 - q,
                )?;
            }
        }
        Ok(())
    }

    /// 新末尾之后的整棵一级/二级/三级间接树
    fn free_whole_subtrees(&self, handle: &mut Handle, inode: &Inode, first: usize) -> Ext3Result<()> {
        let from = if first < EXT3_IND_BLOCK {
            EXT3_IND_BLOCK
        } else {
            first + 1
        };
        for (slot, depth) in [(EXT3_IND_BLOCK, 1), (EXT3_DIND_BLOCK, 2), (EXT3_TIND_BLOCK, 3)] {
            if slot < from {
                continue;
            }
            let nr = inode.i_data().read()[slot];
            if nr == 0 {
                continue;
            }
            self.free_branches(handle, inode, Parent::Detached(nr), 0, 1, depth)?;
            inode.i_data().write()[slot] = 0;
        }
        Ok(())
    }

    /// credit 不足时 extend，extend 失败则 restart
    ///
    /// restart 之前把 inode 和正在修改的间接块记入当前事务，使提交的每个事务
    /// 都对应一棵一致的树；restart 之后确认 inode 仍在 orphan 表中，
    /// 并重新取得间接块的写权限。
    fn try_to_extend(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        bh: Option<&BufferRef>,
    ) -> Ext3Result<()> {
        if handle.credits() > EXT3_RESERVE_TRANS_BLOCKS {
            return Ok(());
        }
        let needed = self.blocks_for_truncate(inode);
        if self.journal.extend(handle, needed)? {
            return Ok(());
        }

        debug!(
            "[truncate] inode {}: restarting transaction tid={}",
            inode.ino(),
            handle.tid()
        );
        if let Some(bh) = bh {
            self.journal.dirty_metadata(handle, bh)?;
        }
        self.mark_inode_dirty(handle, inode)?;
        self.journal.restart(handle, needed)?;
        if !self.orphans.contains(inode.ino()) {
            warn!(
                "[truncate] inode {} fell off the orphan list across restart, re-adding",
                inode.ino()
            );
            self.orphans.orphan_add(handle, inode)?;
        }
        if let Some(bh) = bh {
            self.journal.get_write_access(handle, bh)?;
        }
        Ok(())
    }

    /// 释放 parent[first..last) 指向的数据块
    ///
    /// 物理上连续的块合成一段，一次交给分配器。
    fn free_data(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        parent: &Parent,
        first: usize,
        last: usize,
    ) -> Ext3Result<()> {
        // 拿不到间接块的写权限就不能清指针，也就不能释放
        if let Some(bh) = parent.bh() {
            self.journal.get_write_access(handle, bh)?;
        }

        // (起始块号, 块数, 起始槽位)
        let mut run: Option<(u32, u32, usize)> = None;
        for idx in first..last {
            let nr = parent.load(inode, idx);
            if nr == 0 {
                continue;
            }
            run = match run {
                Some((start, count, from)) if nr == start + count => Some((start, count + 1, from)),
                Some((start, count, from)) => {
                    self.clear_blocks(handle, inode, parent, start, count, from, idx)?;
                    Some((nr, 1, idx))
                }
                None => Some((nr, 1, idx)),
            };
        }
        if let Some((start, count, from)) = run {
            self.clear_blocks(handle, inode, parent, start, count, from, last)?;
        }

        if let Some(bh) = parent.bh() {
            self.journal.dirty_metadata(handle, bh)?;
        }
        Ok(())
    }

    /// 清零 parent[first..last) 中的指针并释放 [start, start + count)
    fn clear_blocks(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        parent: &Parent,
        start: u32,
        count: u32,
        first: usize,
        last: usize,
    ) -> Ext3Result<()> {
        self.try_to_extend(handle, inode, parent.bh())?;
        for idx in first..last {
            let nr = parent.load(inode, idx);
            if nr == 0 {
                continue;
            }
            parent.clear(inode, idx);
            let bh = self.cache.find_buffer(nr);
            self.forget(handle, false, inode, nr, bh.as_ref())?;
        }
        trace!(
            "[truncate] inode {}: free data blocks {start}..{}",
            inode.ino(),
            start + count
        );
        self.free_blocks(handle, inode, start, count)
    }

    /// 释放 parent[first..last) 指向的子树，`depth` 为这些指针到数据块的层数
    ///
    /// 从后往前处理；每个间接块先释放它下面的所有块，再撤销、释放它自己，
    /// 最后清零父块中的指针。
    fn free_branches(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        parent: Parent,
        first: usize,
        last: usize,
        depth: usize,
    ) -> Ext3Result<()> {
        if depth == 0 {
            return self.free_data(handle, inode, &parent, first, last);
        }

        let apb = self.geo.addr_per_block();
        let mut stack: Vec<Frame> = vec![Frame::new(parent, first, last, depth)];
        while let Some(frame) = stack.last_mut() {
            if frame.cursor == frame.first {
                stack.pop();
                if let Some(up) = stack.last_mut()
                    && let Some((idx, nr, bh)) = up.pending.take()
                {
                    self.release_branch(handle, inode, &up.parent, idx, nr, &bh)?;
                }
                continue;
            }

            frame.cursor -= 1;
            let idx = frame.cursor;
            let nr = frame.parent.load(inode, idx);
            if nr == 0 {
                continue;
            }
            let bh = match self.cache.get_block_buffer(nr) {
                Ok(bh) => bh,
                Err(e) => {
                    warn!(
                        "[truncate] read failure, inode={}, block={nr}: {e}",
                        inode.ino()
                    );
                    continue;
                }
            };

            if frame.depth == 1 {
                self.free_data(handle, inode, &Parent::Buffer(bh.clone()), 0, apb)?;
                self.release_branch(handle, inode, &frame.parent, idx, nr, &bh)?;
            } else {
                let child_depth = frame.depth - 1;
                frame.pending = Some((idx, nr, bh.clone()));
                stack.push(Frame::new(Parent::Buffer(bh), 0, apb, child_depth));
            }
        }
        Ok(())
    }

    /// 释放一个已经清空的间接块并清零指向它的指针
    fn release_branch(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        parent: &Parent,
        idx: usize,
        nr: u32,
        bh: &BufferRef,
    ) -> Ext3Result<()> {
        // 撤销记录必须先于位图中的释放
        self.forget(handle, true, inode, nr, Some(bh))?;
        self.try_to_extend(handle, inode, None)?;
        trace!("[truncate] inode {}: free indirect block {nr}", inode.ino());
        self.free_blocks(handle, inode, nr, 1)?;

        if let Some(pbh) = parent.bh() {
            self.journal.get_write_access(handle, pbh)?;
            parent.clear(inode, idx);
            self.journal.dirty_metadata(handle, pbh)?;
        } else {
            parent.clear(inode, idx);
        }
        Ok(())
    }

    /// 把最后一个不完整块中 `size` 之后的部分清零
    pub(crate) fn block_truncate_page(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        size: u64,
    ) -> Ext3Result<()> {
        let bs = self.geo.block_size() as u64;
        let offset = (size % bs) as usize;
        if offset == 0 {
            return Ok(());
        }
        let iblock = (size / bs) as i64;
        let Some(pblk) = self.map_block(Some(&mut *handle), inode, iblock, false)?.pblk() else {
            return Ok(());
        };
        let bh = self.cache.get_block_buffer(pblk)?;
        if self.should_journal_data(inode) {
            self.journal.get_write_access(handle, &bh)?;
            bh.write()[offset..].fill(0);
            self.journal.dirty_metadata(handle, &bh)?;
        } else {
            bh.write()[offset..].fill(0);
            bh.set(BufferState::DIRTY);
        }
        trace!(
            "[truncate] inode {}: zeroed block {pblk} from byte {offset}",
            inode.ino()
        );
        Ok(())
    }

    /// 释放一个链接数为 0 的 inode 的全部块，并把它移出 orphan 表
    pub fn delete_inode(&self, inode: &Inode) -> Ext3Result<()> {
        if inode.links_count() != 0 {
            return Err(Ext3Error::InvalidArgument);
        }
        self.check_writable()?;
        inode.state().i_size = 0;
        self.truncate_blocks(inode)?;

        let mut handle = self.journal.start(EXT3_ORPHAN_TRANS_BLOCKS)?;
        let res = self.orphans.orphan_del(&mut handle, inode).and_then(|_| {
            inode.state().mode = 0;
            self.mark_inode_dirty(&mut handle, inode)
        });
        self.journal.stop(handle)?;
        res?;
        self.drop_inode(inode.ino());
        debug!("[ext3] deleted inode {}", inode.ino());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext3_backend::balloc::BlockAllocator;
    use crate::ext3_backend::blockdev::RamDisk;
    use crate::ext3_backend::orphan::OrphanList;

    fn fs(block_size: usize) -> Ext3Fs {
        let blocks = 16384;
        let disk = RamDisk::new(block_size as u32, blocks as u64);
        let layout = FsLayout::new(block_size, blocks).unwrap();
        Ext3Fs::format(disk.clone(), layout).unwrap();
        Ext3Fs::mount(disk, layout, MountOptions::default()).unwrap()
    }

    fn fill(fs: &Ext3Fs, inode: &Inode, blocks: i64) {
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        for iblock in 0..blocks {
            fs.map_block(Some(&mut handle), inode, iblock, true).unwrap();
        }
        fs.journal().stop(handle).unwrap();
        inode.extend_size(blocks as u64 * fs.geometry().block_size() as u64);
    }

    #[test]
    fn test_blocks_for_truncate_is_clamped() {
        let fs = fs(1024);
        let inode = Inode::new(12, 0);
        assert_eq!(fs.blocks_for_truncate(&inode), EXT3_DATA_TRANS_BLOCKS + 2);
        inode.state().i_blocks = 2 * 40;
        assert_eq!(fs.blocks_for_truncate(&inode), EXT3_DATA_TRANS_BLOCKS + 40);
        inode.state().i_blocks = 2 * 1000;
        assert_eq!(
            fs.blocks_for_truncate(&inode),
            EXT3_DATA_TRANS_BLOCKS + EXT3_MAX_TRANS_DATA
        );
    }

    #[test]
    fn test_truncate_direct_blocks() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        fill(&fs, &inode, 10);
        let free = fs.allocator().free_count();
        fs.truncate(&inode, 4 * 1024).unwrap();
        let map = inode.block_map();
        assert!(map[..4].iter().all(|b| *b != 0));
        assert!(map[4..].iter().all(|b| *b == 0));
        assert_eq!(fs.allocator().free_count(), free + 6);
        assert_eq!(inode.blocks(), 4 * 2);
        assert!(!fs.orphans().contains(12));
    }

    #[test]
    fn test_grow_only_sets_size() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        fill(&fs, &inode, 3);
        let before = inode.block_map();
        fs.truncate(&inode, 1 << 20).unwrap();
        assert_eq!(inode.size(), 1 << 20);
        assert_eq!(inode.disksize(), 1 << 20);
        assert_eq!(inode.block_map(), before);
    }

    #[test]
    fn test_truncate_into_single_indirect() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        fill(&fs, &inode, 40);
        let ind = inode.block_map()[EXT3_IND_BLOCK];
        let free = fs.allocator().free_count();

        fs.truncate(&inode, 20 * 1024).unwrap();
        assert_eq!(inode.block_map()[EXT3_IND_BLOCK], ind);
        let bh = fs.cache().get_block_buffer(ind).unwrap();
        assert!((0..8).all(|i| bh.get_le32(i) != 0));
        assert!((8..256).all(|i| bh.get_le32(i) == 0));
        assert_eq!(fs.allocator().free_count(), free + 20);
        assert_ne!(fs.bmap(&inode, 19).unwrap(), 0);
        assert_eq!(fs.bmap(&inode, 20).unwrap(), 0);
    }

    #[test]
    fn test_truncate_to_indirect_boundary_frees_indirect_block() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        fill(&fs, &inode, 30);
        let free = fs.allocator().free_count();
        fs.truncate(&inode, 12 * 1024).unwrap();
        assert_eq!(inode.block_map()[EXT3_IND_BLOCK], 0);
        assert_eq!(fs.allocator().free_count(), free + 18 + 1);
    }

    #[test]
    fn test_append_only_refused() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        fill(&fs, &inode, 2);
        inode.set_flags(InodeFlags::APPEND);
        assert_eq!(fs.truncate(&inode, 0), Err(Ext3Error::NotPermitted));
        inode.set_flags(InodeFlags::IMMUTABLE);
        assert_eq!(fs.truncate(&inode, 0), Err(Ext3Error::NotPermitted));
        assert_ne!(inode.block_map()[1], 0);
    }

    #[test]
    fn test_partial_block_tail_zeroed() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let bh = fs.getblk(Some(&mut handle), &inode, 0, true).unwrap().unwrap();
        fs.journal().stop(handle).unwrap();
        bh.write().fill(0xab);
        inode.extend_size(1024);

        fs.truncate(&inode, 100).unwrap();
        let data = bh.read();
        assert!(data[..100].iter().all(|b| *b == 0xab));
        assert!(data[100..].iter().all(|b| *b == 0));
        assert_ne!(inode.block_map()[0], 0);
    }

    #[test]
    fn test_delete_inode_frees_everything() {
        let fs = fs(1024);
        let inode = fs.create_inode(12).unwrap();
        let free = fs.allocator().free_count();
        fill(&fs, &inode, 300);
        inode.set_links_count(0);
        fs.delete_inode(&inode).unwrap();
        assert_eq!(inode.block_map(), [0; EXT3_N_BLOCKS]);
        assert_eq!(inode.blocks(), 0);
        assert_eq!(fs.allocator().free_count(), free);
        assert!(!fs.orphans().contains(12));
    }
}
