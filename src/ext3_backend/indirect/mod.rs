//! # indirect
//!
//! 间接块映射引擎。每个文件的块号存在 inode 的 15 个槽位里：
//! 12 个直接块，随后是一级、二级、三级间接块。
//!
//! - 路径解析（path）：逻辑块号 -> 每层的槽位下标
//! - 链读取（chain）：沿路径读出每层指针并记录读到的值
//! - 目标选择（goal）：为新块挑一个靠近的位置
//! - 建分支（branch）/ 挂接（splice）：分配缺失的块并原子地挂到树上
//! - 映射（map）：以上几步组成的 `map_block`
//! - 共享分支（shared）/ truncate：自底向上释放新末尾之后的块

pub mod branch;
pub mod chain;
pub mod goal;
pub mod map;
pub mod path;
pub mod shared;
pub mod splice;
pub mod truncate;

pub use chain::{Branch, Chain, Link, SlotRef, get_branch, verify_chain};
pub use map::BlockMapping;
pub use path::{BlockPath, block_to_path};
