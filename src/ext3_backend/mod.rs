//! # ext3_backend
//!
//! ext3 间接块映射与 truncate 引擎的实现。
//!
//! - 块设备与缓存（blockdev, buffer, bcache）
//! - 块分配（balloc）
//! - 日志（jbd）与 orphan 表（orphan）
//! - inode（disknode, inode）
//! - 文件系统实例（fs）与映射/truncate 引擎（indirect）
//! - 配置、错误与辅助（config, error, errno, endian）

pub mod api;
pub mod balloc;
pub mod bcache;
pub mod blockdev;
pub mod buffer;
pub mod config;
pub mod disknode;
pub mod endian;
pub mod errno;
pub mod error;
pub mod fs;
pub mod indirect;
pub mod inode;
pub mod jbd;
pub mod orphan;
