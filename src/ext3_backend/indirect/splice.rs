//! 把新分支挂接到块树上

use log::{error, trace};

use crate::ext3_backend::endian::{read_le32, write_le32};
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::*;
use crate::ext3_backend::inode::Inode;
use crate::ext3_backend::jbd::{Handle, Journal};

impl Ext3Fs {
    /// 把 `branch` 写入 chain[partial] 的槽位
    ///
    /// 持有槽位所在容器（inode 的 i_data 或间接块）的写锁，确认上层链未变、
    /// 槽位仍为 0 之后才写入。检查失败时丢弃新分支并返回 `Changed`。
    pub(crate) fn splice_branch(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        iblock: i64,
        chain: &[Link],
        partial: usize,
        branch: &[Link],
    ) -> Ext3Result<()> {
        let Some(first) = branch.first() else {
            return Err(Ext3Error::InvalidArgument);
        };
        let prefix = &chain[..partial];

        // 挂接之后不能再因为 credit 不足而失败，所以先把要改的块都加入事务
        let access = match first.slot.buffer() {
            Some(bh) => self.journal.get_write_access(handle, bh),
            None => Ok(()),
        }
        .and_then(|_| self.reserve_inode_write(handle, inode));
        if let Err(e) = access {
            self.discard_branch(handle, inode, branch);
            return Err(e);
        }

        let spliced = match &first.slot {
            SlotRef::Inode(idx) => {
                let mut i_data = inode.i_data().write();
                if verify_chain(inode, prefix) && i_data[*idx] == 0 {
                    i_data[*idx] = first.key;
                    true
                } else {
                    false
                }
            }
            SlotRef::Buffer(bh, idx) => {
                let mut data = bh.write();
                if verify_chain(inode, prefix) && read_le32(&data, idx * 4) == 0 {
                    write_le32(&mut data, idx * 4, first.key);
                    true
                } else {
                    false
                }
            }
        };
        if !spliced {
            trace!(
                "[splice] inode {} block {iblock}: slot taken, dropping {} new blocks",
                inode.ino(),
                branch.len()
            );
            self.discard_branch(handle, inode, branch);
            return Err(Ext3Error::Changed);
        }

        {
            let mut st = inode.state();
            st.next_alloc_block = iblock as u64;
            st.next_alloc_goal = branch[branch.len() - 1].key;
            // 新块完全在文件末尾之后：文件大小至少要覆盖到这个块
            let block_start = iblock as u64 * self.geo.block_size() as u64;
            if st.i_size <= block_start {
                st.i_size = block_start + self.geo.block_size() as u64;
            }
            if st.i_disksize < st.i_size {
                st.i_disksize = st.i_size;
            }
        }
        trace!(
            "[splice] inode {} block {iblock}: {} -> slot {} ({})",
            inode.ino(),
            first.key,
            first.slot.index(),
            if first.slot.buffer().is_some() { "indirect" } else { "inode" }
        );

        self.mark_inode_dirty(handle, inode)?;
        if let Some(bh) = first.slot.buffer() {
            self.journal.dirty_metadata(handle, bh)?;
        }
        Ok(())
    }

    /// 撤掉未挂接的分支：forget 新间接块，块还给分配器
    ///
    /// 某一步失败只记录错误，其余的块照常释放。
    pub(crate) fn discard_branch(&self, handle: &mut Handle, inode: &Inode, branch: &[Link]) {
        for link in branch.iter().skip(1) {
            if let Some(bh) = link.slot.buffer()
                && let Err(e) = self.journal.forget(handle, bh)
            {
                error!(
                    "[splice] inode {}: error {e} when forgetting new block {}",
                    inode.ino(),
                    bh.blocknr()
                );
            }
        }
        for link in branch.iter() {
            if let Err(e) = self.free_blocks(handle, inode, link.key, 1) {
                error!(
                    "[splice] inode {}: error {e} when freeing new block {}, block leaked",
                    inode.ino(),
                    link.key
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use crate::ext3_backend::balloc::BlockAllocator;
    use crate::ext3_backend::blockdev::RamDisk;
    use crate::ext3_backend::config::*;

    fn fs() -> Ext3Fs {
        let disk = RamDisk::new(1024, 16384);
        let layout = FsLayout::new(1024, 16384).unwrap();
        Ext3Fs::format(disk.clone(), layout).unwrap();
        Ext3Fs::mount(disk, layout, MountOptions::default()).unwrap()
    }

    #[test]
    fn test_discard_branch_frees_past_a_failure() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        let free = fs.allocator().free_count();
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let a = fs.alloc_block(&mut handle, &inode, 0).unwrap();
        let b = fs.alloc_block(&mut handle, &inode, a).unwrap();

        // 中间那个块号不在数据区，释放会失败
        let branch = vec![
            Link::new(SlotRef::Inode(EXT3_IND_BLOCK), a),
            Link::new(SlotRef::Inode(EXT3_IND_BLOCK), 1),
            Link::new(SlotRef::Inode(EXT3_IND_BLOCK), b),
        ];
        fs.discard_branch(&mut handle, &inode, &branch);
        fs.journal().stop(handle).unwrap();

        assert!(!fs.allocator().is_allocated(a).unwrap());
        assert!(!fs.allocator().is_allocated(b).unwrap());
        assert_eq!(fs.allocator().free_count(), free);
        assert_eq!(inode.blocks(), 0);
    }

    #[test]
    fn test_splice_past_eof_grows_disksize() {
        let fs = fs();
        let inode = fs.create_inode(12).unwrap();
        inode.extend_size(100);
        let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS).unwrap();
        let nr = fs.alloc_block(&mut handle, &inode, 0).unwrap();
        let branch = vec![Link::new(SlotRef::Inode(7), nr)];
        fs.splice_branch(&mut handle, &inode, 7, &[], 0, &branch).unwrap();
        fs.journal().stop(handle).unwrap();

        assert_eq!(inode.block_map()[7], nr);
        assert_eq!(inode.size(), 8 * 1024);
        assert_eq!(inode.disksize(), 8 * 1024);
    }
}
