//! 为缺失的链尾分配一个尚未挂接的新分支

use alloc::vec::Vec;
use log::{error, trace};

use crate::ext3_backend::buffer::BufferState;
use crate::ext3_backend::endian::write_le32;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::*;
use crate::ext3_backend::inode::Inode;
use crate::ext3_backend::jbd::{Handle, Journal};

impl Ext3Fs {
    /// 分配 `num` 个块组成一条新分支
    ///
    /// 第一个块挂到 `attach`（此处尚未写入），之后每个块都由前一个块指向：
    /// 前 num-1 个块是新的间接块，清零后在 `offsets[n]` 处写入下一层块号。
    /// 每次分配都以上一个块作为目标，使整条分支在物理上相邻。
    ///
    /// 任何一步失败都会回滚：已建好的间接块从事务中 forget，
    /// 已分配的块全部还给分配器。
    pub(crate) fn alloc_branch(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        num: usize,
        goal: u32,
        offsets: &[usize],
        attach: SlotRef,
    ) -> Ext3Result<Vec<Link>> {
        let mut branch: Vec<Link> = Vec::with_capacity(num);
        let parent = self.alloc_block(handle, inode, goal)?;
        branch.push(Link::new(attach, parent));

        let mut parent = parent;
        let mut err = None;
        for n in 1..num {
            let nr = match self.alloc_block(handle, inode, parent) {
                Ok(nr) => nr,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            };
            let bh = match self.cache.get_or_create_buffer(parent) {
                Ok(bh) => bh,
                Err(e) => {
                    if let Err(free_err) = self.free_blocks(handle, inode, nr, 1) {
                        error!(
                            "[branch] inode {}: error {free_err} when freeing new block {nr}, block leaked",
                            inode.ino()
                        );
                    }
                    err = Some(e);
                    break;
                }
            };
            branch.push(Link::new(SlotRef::Buffer(bh.clone(), offsets[n]), nr));
            if let Err(e) = self.journal.get_create_access(handle, &bh) {
                err = Some(e);
                break;
            }
            {
                let mut data = bh.write();
                data.fill(0);
                write_le32(&mut data, offsets[n] * 4, nr);
            }
            bh.set(BufferState::UPTODATE);
            if let Err(e) = self.journal.dirty_metadata(handle, &bh) {
                err = Some(e);
                break;
            }
            parent = nr;
        }

        let Some(err) = err else {
            trace!(
                "[branch] inode {}: allocated {} blocks {:?}",
                inode.ino(),
                num,
                branch.iter().map(|l| l.key).collect::<Vec<_>>()
            );
            return Ok(branch);
        };

        // 回滚：branch[1..] 的缓冲区属于 branch[0..n-1] 这些间接块
        trace!(
            "[branch] inode {}: allocation failed after {} blocks: {err}",
            inode.ino(),
            branch.len()
        );
        self.discard_branch(handle, inode, &branch);
        Err(err)
    }
}
