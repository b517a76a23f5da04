//! # rsext3
//!
//! ext3 风格的间接块映射与 truncate 引擎，带 JBD 格式日志。
//!
//! ## 功能特点
//!
//! - 逻辑块到物理块的映射，按需分配间接块，并发映射之间无全局锁
//! - truncate 自底向上释放块，长 truncate 拆成多个事务，崩溃后由 orphan 表补完
//! - 释放元数据块之前写撤销记录，日志重放不会覆盖已重新分配的块
//!
//! ## 基本使用
//!
//! ```rust
//! use rsext3::*;
//!
//! let disk = RamDisk::new(1024, 16384);
//! let layout = FsLayout::new(1024, 16384)?;
//! fs_format(disk.clone(), layout)?;
//! let fs = fs_mount(disk, layout, MountOptions::default())?;
//!
//! let inode = fs.create_inode(12)?;
//! write_at(&fs, &inode, 0, b"hello")?;
//! fs.truncate(&inode, 0)?;
//!
//! fs_umount(fs)?;
//! # Ok::<(), Ext3Error>(())
//! ```

#![no_std]

extern crate alloc;

pub mod ext3_backend;
pub use ext3_backend::api::*;
pub use ext3_backend::balloc::*;
pub use ext3_backend::bcache::*;
pub use ext3_backend::blockdev::*;
pub use ext3_backend::buffer::*;
pub use ext3_backend::config::*;
pub use ext3_backend::errno::*;
pub use ext3_backend::error::*;
pub use ext3_backend::fs::*;
pub use ext3_backend::indirect::*;
pub use ext3_backend::inode::*;
pub use ext3_backend::jbd::recovery::RecoveryInfo;
pub use ext3_backend::jbd::{Handle, Journal, LogJournal};
pub use ext3_backend::orphan::*;
