//! 块指针链
//!
//! 链上每一环记录"指针所在的位置"和"读取时看到的值"。写之前重新比较这两者，
//! 值不一致就说明链被并发修改过，整条链需要重新解析。

use alloc::vec::Vec;
use log::trace;

use crate::ext3_backend::bcache::BufferCache;
use crate::ext3_backend::buffer::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::inode::Inode;

/// 指针槽位：在 inode 的 i_block 中，或者在某个间接块里
#[derive(Debug, Clone)]
pub enum SlotRef {
    Inode(usize),
    Buffer(BufferRef, usize),
}

impl SlotRef {
    pub fn index(&self) -> usize {
        match self {
            SlotRef::Inode(idx) => *idx,
            SlotRef::Buffer(_, idx) => *idx,
        }
    }

    pub fn buffer(&self) -> Option<&BufferRef> {
        match self {
            SlotRef::Inode(_) => None,
            SlotRef::Buffer(bh, _) => Some(bh),
        }
    }

    /// 读取槽位当前的值
    pub fn load(&self, inode: &Inode) -> u32 {
        match self {
            SlotRef::Inode(idx) => inode.i_data().read()[*idx],
            SlotRef::Buffer(bh, idx) => bh.get_le32(*idx),
        }
    }

    /// 写槽位；调用者负责事务
    pub fn store(&self, inode: &Inode, v: u32) {
        match self {
            SlotRef::Inode(idx) => inode.i_data().write()[*idx] = v,
            SlotRef::Buffer(bh, idx) => bh.set_le32(*idx, v),
        }
    }

    /// 槽位前移一格（只用于 find_shared）
    pub(crate) fn step_back(&mut self) {
        match self {
            SlotRef::Inode(idx) | SlotRef::Buffer(_, idx) => *idx -= 1,
        }
    }
}

/// 链中的一环
#[derive(Debug, Clone)]
pub struct Link {
    /// 读取时看到的块号
    pub key: u32,
    pub slot: SlotRef,
}

impl Link {
    pub fn new(slot: SlotRef, key: u32) -> Self {
        Self { key, slot }
    }

    /// 槽位的值是否仍等于读取时的值
    pub fn is_unchanged(&self, inode: &Inode) -> bool {
        self.slot.load(inode) == self.key
    }
}

pub type Chain = Vec<Link>;

/// get_branch 的结果
#[derive(Debug)]
pub struct Branch {
    pub chain: Chain,
    /// 第一个空洞所在的下标；None 表示整条链都已映射
    pub partial: Option<usize>,
}

/// 检查 links 中每一环是否仍然有效
pub fn verify_chain(inode: &Inode, links: &[Link]) -> bool {
    links.iter().all(|l| l.is_unchanged(inode))
}

/// 沿 offsets 从 inode 向下读取，直到目标块或第一个空洞
///
/// 每读入一个间接块之后都重新校验已经走过的部分；如果上层指针已经变化，
/// 读到的块可能已经被释放，返回 `Changed` 让调用者从头再来。
pub fn get_branch(cache: &dyn BufferCache, inode: &Inode, offsets: &[usize]) -> Ext3Result<Branch> {
    let mut chain = Chain::with_capacity(offsets.len());
    let first = inode.i_data().read()[offsets[0]];
    chain.push(Link::new(SlotRef::Inode(offsets[0]), first));
    if first == 0 {
        return Ok(Branch {
            chain,
            partial: Some(0),
        });
    }

    for (level, off) in offsets.iter().enumerate().skip(1) {
        let parent = chain[level - 1].key;
        let bh = cache.get_block_buffer(parent)?;
        if !verify_chain(inode, &chain) {
            trace!(
                "[chain] inode {} level {level}: chain changed while reading block {parent}",
                inode.ino()
            );
            return Err(Ext3Error::Changed);
        }
        let key = bh.get_le32(*off);
        chain.push(Link::new(SlotRef::Buffer(bh, *off), key));
        if key == 0 {
            return Ok(Branch {
                chain,
                partial: Some(level),
            });
        }
    }
    Ok(Branch {
        chain,
        partial: None,
    })
}
