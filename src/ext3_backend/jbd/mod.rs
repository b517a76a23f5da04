//! # jbd
//!
//! 日志（事务）协作者。引擎只通过 [`Journal`] trait 使用日志：
//! 所有元数据修改都必须在一个 [`Handle`] 内完成，handle 持有的 credit
//! 就是它还能触碰的缓冲区个数。
//!
//! [`LogJournal`] 是默认实现：JBD 格式的预写日志，撤销记录，
//! 挂载时三遍扫描恢复。

pub mod jbdstruct;
pub mod journal;
pub mod recovery;

pub use journal::LogJournal;

use crate::ext3_backend::buffer::BufferRef;
use crate::ext3_backend::error::*;

/// 事务 handle
///
/// 不在线程间共享；`credits` 是这个 handle 还能新加入事务的缓冲区数量。
#[derive(Debug)]
pub struct Handle {
    tid: u32,
    credits: u32,
    sync: bool,
}

impl Handle {
    pub fn new(tid: u32, credits: u32) -> Self {
        Self {
            tid,
            credits,
            sync: false,
        }
    }

    /// 所属事务号
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// 剩余 credit
    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// 要求 stop 时同步提交
    pub fn set_sync(&mut self) {
        self.sync = true;
    }

    /// 消耗一个 credit
    pub fn consume(&mut self) -> Ext3Result<()> {
        if self.credits == 0 {
            return Err(Ext3Error::NoCredits);
        }
        self.credits -= 1;
        Ok(())
    }

    pub fn add_credits(&mut self, n: u32) {
        self.credits = self.credits.saturating_add(n);
    }

    /// restart 之后切换到新事务
    pub fn rebind(&mut self, tid: u32, credits: u32) {
        self.tid = tid;
        self.credits = credits;
    }
}

/// 事务 / 日志管理协作者
pub trait Journal: Send + Sync {
    /// 开启一个 handle，预留 `credits` 个缓冲区
    fn start(&self, credits: u32) -> Ext3Result<Handle>;

    /// 尝试在当前事务内追加 credit；返回 false 表示需要 restart
    fn extend(&self, handle: &mut Handle, credits: u32) -> Ext3Result<bool>;

    /// 结束当前事务中的 handle（促使其提交），再在新事务中重新开启
    fn restart(&self, handle: &mut Handle, credits: u32) -> Ext3Result<()>;

    /// 修改已有元数据块之前调用
    fn get_write_access(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()>;

    /// 初始化新分配的元数据块之前调用
    fn get_create_access(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()>;

    /// 标记元数据块已修改，随事务提交
    fn dirty_metadata(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()>;

    /// 把缓冲区从当前事务中移除并丢弃（不写撤销记录）
    fn forget(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()>;

    /// 写撤销记录：恢复时忽略该块更早的日志副本
    fn revoke(&self, handle: &mut Handle, blocknr: u32, bh: Option<&BufferRef>)
    -> Ext3Result<()>;

    /// 结束 handle
    fn stop(&self, handle: Handle) -> Ext3Result<()>;

    /// 锁住运行中的事务，没有活动 handle 时立即提交
    fn force_commit(&self) -> Ext3Result<()>;

    /// 把已提交事务写回原位置并清空日志
    fn checkpoint(&self) -> Ext3Result<()>;

    /// handle 所在事务是否已被锁住、正在等待其余 handle 退出后提交
    ///
    /// 持有 handle 的线程在等待其它锁之前应当检查它：事务被锁住时先 restart，
    /// 否则锁的持有者在 restart 中等待这个事务提交，双方互相等待。
    fn is_locked(&self, handle: &Handle) -> bool;

    /// 最近一个已提交事务号
    fn committed_tid(&self) -> u32;

    fn is_aborted(&self) -> bool;
}
