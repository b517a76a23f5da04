//! 分配目标（goal）选择

use crate::ext3_backend::endian::read_le32;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::indirect::chain::*;
use crate::ext3_backend::inode::Inode;

impl Ext3Fs {
    /// 在待填槽位附近找一个目标块
    ///
    /// 1. 同一个块里它左边最近的非零指针，取其后一块；
    /// 2. 否则取持有该槽位的间接块本身；
    /// 3. 槽位在 inode 里时，取 inode 所在块组内按 inode 号错开的位置。
    pub(crate) fn find_near(&self, inode: &Inode, ind: &Link) -> u32 {
        match &ind.slot {
            SlotRef::Buffer(bh, idx) => {
                let data = bh.read();
                for i in (0..*idx).rev() {
                    let nr = read_le32(&data, i * 4);
                    if nr != 0 {
                        return nr + 1;
                    }
                }
                bh.blocknr()
            }
            SlotRef::Inode(idx) => {
                let i_data = inode.i_data().read();
                if let Some(nr) = i_data[..*idx].iter().rev().find(|nr| **nr != 0) {
                    return *nr + 1;
                }
                drop(i_data);
                let bpg = self.layout.blocks_per_group;
                let bg_start = inode.block_group() * bpg;
                let colour = (inode.ino() % 16) * (bpg / 16);
                bg_start + colour
            }
        }
    }

    /// 为 chain[partial] 处的空洞挑选目标块
    ///
    /// 先校验链，失效时返回 `Changed`。顺序写时沿用上一次的分配位置。
    pub(crate) fn find_goal(
        &self,
        inode: &Inode,
        iblock: i64,
        chain: &[Link],
        partial: usize,
    ) -> Ext3Result<u32> {
        {
            let mut st = inode.state();
            if iblock as u64 == st.next_alloc_block.wrapping_add(1) && st.next_alloc_goal != 0 {
                st.next_alloc_block += 1;
                st.next_alloc_goal += 1;
            }
        }
        if !verify_chain(inode, &chain[..=partial]) {
            return Err(Ext3Error::Changed);
        }
        let hint = {
            let st = inode.state();
            if iblock as u64 == st.next_alloc_block {
                st.next_alloc_goal
            } else {
                0
            }
        };
        if hint != 0 {
            return Ok(hint);
        }
        Ok(self.find_near(inode, &chain[partial]))
    }
}
