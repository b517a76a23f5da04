//! 块映射引擎错误类型

use crate::ext3_backend::blockdev::BlockDevError;
use crate::ext3_backend::errno::*;

/// 引擎错误
///
/// `Changed` 和 `NoCredits` 只在引擎内部流转：前者触发整条链重新解析，
/// 后者触发事务 extend/restart，二者都不会穿过公开接口。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext3Error {
    /// 底层块设备读写失败
    Io(BlockDevError),

    /// 没有空闲块可分配
    NoSpace,

    /// 逻辑块号为负或超出三级间接的寻址范围
    OutOfRange { block: i64 },

    /// 链在读取后被并发修改，需要从头重新解析
    Changed,

    /// 事务 credit 用尽
    NoCredits,

    /// 元数据损坏（块号越界等）
    Corrupted { block: u32 },

    /// 日志已中止，文件系统只能只读
    Aborted,

    /// 以只读方式挂载
    ReadOnly,

    /// 参数错误
    InvalidArgument,

    /// inode 带有 append-only / immutable 标志
    NotPermitted,
}

impl core::fmt::Display for Ext3Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Ext3Error::Io(e) => write!(f, "I/O error: {e}"),
            Ext3Error::NoSpace => write!(f, "no space left on device"),
            Ext3Error::OutOfRange { block } => {
                write!(f, "logical block {block} out of mappable range")
            }
            Ext3Error::Changed => write!(f, "block chain changed under us"),
            Ext3Error::NoCredits => write!(f, "transaction ran out of buffer credits"),
            Ext3Error::Corrupted { block } => write!(f, "corrupted metadata at block {block}"),
            Ext3Error::Aborted => write!(f, "journal aborted"),
            Ext3Error::ReadOnly => write!(f, "filesystem is read-only"),
            Ext3Error::InvalidArgument => write!(f, "invalid argument"),
            Ext3Error::NotPermitted => write!(f, "operation not permitted"),
        }
    }
}

impl From<BlockDevError> for Ext3Error {
    fn from(e: BlockDevError) -> Self {
        Ext3Error::Io(e)
    }
}

impl Ext3Error {
    /// 映射到 POSIX errno
    pub const fn to_errno(&self) -> i32 {
        match self {
            Ext3Error::Io(BlockDevError::NoSpace) => ENOSPC,
            Ext3Error::Io(BlockDevError::ReadOnly) => EROFS,
            Ext3Error::Io(_) => EIO,
            Ext3Error::NoSpace => ENOSPC,
            Ext3Error::OutOfRange { block } => {
                if *block < 0 {
                    EINVAL
                } else {
                    EFBIG
                }
            }
            Ext3Error::Changed => EAGAIN,
            Ext3Error::NoCredits => ENOSPC,
            Ext3Error::Corrupted { .. } => EIO,
            Ext3Error::Aborted => EROFS,
            Ext3Error::ReadOnly => EROFS,
            Ext3Error::InvalidArgument => EINVAL,
            Ext3Error::NotPermitted => EPERM,
        }
    }
}

/// 引擎操作结果类型
pub type Ext3Result<T> = Result<T, Ext3Error>;
