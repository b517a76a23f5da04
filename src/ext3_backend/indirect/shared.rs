//! truncate 边界上的共享分支

use log::trace;

use crate::ext3_backend::buffer::all_zeroes;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::*;
use crate::ext3_backend::inode::Inode;

/// find_shared 的结果
#[derive(Debug)]
pub(crate) struct SharedBranch {
    /// 从 inode 到最后一个必须保留的环
    pub chain: Chain,
    /// chain 的最后一个下标
    pub partial: usize,
    /// 已与树分离、需要整体释放的子树根；0 表示没有
    pub top: u32,
}

impl Ext3Fs {
    /// 找到新文件末尾所在的分支中仍被保留的部分
    ///
    /// 从最深的非零偏移开始解析，然后向上找第一个在边界左侧还有别的指针的
    /// 间接块：它之下的整条分支都只属于被截掉的部分。
    ///
    /// 如果这条分支完全属于我们且不直接挂在 inode 上，就不分离它，而是把
    /// 最后一环的槽位下标减一，让调用者在清理块尾时从原槽位开始一并释放；
    /// 否则把槽位里的值作为 `top` 返回，槽位本身保持不变，
    /// 由调用者在释放之后清零。
    pub(crate) fn find_shared(
        &self,
        inode: &Inode,
        depth: usize,
        offsets: &[usize],
    ) -> Ext3Result<SharedBranch> {
        let mut k = depth;
        while k > 1 && offsets[k - 1] == 0 {
            k -= 1;
        }
        let branch = get_branch(self.cache.as_ref(), inode, &offsets[..k])?;
        let mut chain = branch.chain;
        let partial = branch.partial.unwrap_or(k - 1);

        // 解析之后分支又长出来了：新的部分全部保留
        if chain[partial].key == 0 && chain[partial].slot.load(inode) != 0 {
            chain.truncate(partial + 1);
            return Ok(SharedBranch {
                chain,
                partial,
                top: 0,
            });
        }

        let mut p = partial;
        while p > 0 {
            let Some(bh) = chain[p].slot.buffer() else {
                break;
            };
            if !all_zeroes(&bh.read(), 0, chain[p].slot.index()) {
                break;
            }
            p -= 1;
        }

        let top = if p == k - 1 && p > 0 {
            chain[p].slot.step_back();
            0
        } else {
            chain[p].slot.load(inode)
        };
        chain.truncate(p + 1);
        trace!(
            "[truncate] inode {}: shared branch ends at level {p}, top {top}",
            inode.ino()
        );
        Ok(SharedBranch {
            chain,
            partial: p,
            top,
        })
    }
}
