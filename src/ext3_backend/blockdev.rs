use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// 块设备错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDevError {
    /// 读取错误
    ReadError,

    /// 写入错误
    WriteError,

    /// 块号超出范围
    BlockOutOfRange { block_id: u32, max_blocks: u64 },

    /// 无效的块大小
    InvalidBlockSize { size: usize, expected: usize },

    /// 缓冲区太小
    BufferTooSmall { provided: usize, required: usize },

    /// I/O错误
    IoError,

    /// 设备只读
    ReadOnly,

    /// 空间不足
    NoSpace,

    /// 设备损坏或数据损坏
    Corrupted,
}

impl core::fmt::Display for BlockDevError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BlockDevError::ReadError => write!(f, "failed to read from block device"),
            BlockDevError::WriteError => write!(f, "failed to write to block device"),
            BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks,
            } => {
                write!(f, "block id {block_id} out of range (max {max_blocks})")
            }
            BlockDevError::InvalidBlockSize { size, expected } => {
                write!(f, "invalid block size {size} (expected {expected})")
            }
            BlockDevError::BufferTooSmall { provided, required } => {
                write!(
                    f,
                    "buffer too small: provided {provided} bytes, required {required} bytes"
                )
            }
            BlockDevError::IoError => write!(f, "I/O error"),
            BlockDevError::ReadOnly => write!(f, "device is read-only"),
            BlockDevError::NoSpace => write!(f, "no space left on device"),
            BlockDevError::Corrupted => write!(f, "device or data is corrupted"),
        }
    }
}

/// 块设备操作结果类型
pub type BlockDevResult<T> = Result<T, BlockDevError>;

/// 外部需要实现的块设备trait
pub trait BlockDevice {
    /// 写入数据到块设备
    /// * `buffer` - 要写入的数据
    /// * `block_id` - 起始块号
    /// * `count` - 块数量
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()>;

    /// 从块设备读取数据
    /// * `buffer` - 读取数据的目标缓冲区
    /// * `block_id` - 起始块号
    /// * `count` - 块数量
    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()>;

    /// 获取块设备的总块数
    fn total_blocks(&self) -> u64;

    /// 获取块大小（字节）
    fn block_size(&self) -> u32;

    /// 刷新缓存到磁盘
    fn flush(&mut self) -> BlockDevResult<()> {
        Ok(()) // 默认实现为空操作
    }

    /// 检查设备是否只读
    fn is_readonly(&self) -> bool {
        false // 默认为可读写
    }
}

/// 内存块设备
///
/// clone 出来的句柄共享同一份存储，丢掉文件系统对象后数据仍然保留，
/// 可以用来模拟掉电后重新挂载。
#[derive(Clone)]
pub struct RamDisk {
    data: Arc<Mutex<Vec<u8>>>,
    block_size: u32,
    total_blocks: u64,
}

impl RamDisk {
    pub fn new(block_size: u32, total_blocks: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![
                0u8;
                block_size as usize * total_blocks as usize
            ])),
            block_size,
            total_blocks,
        }
    }

    /// 整盘快照
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// 用快照覆盖整盘
    pub fn restore(&self, image: &[u8]) {
        let mut data = self.data.lock();
        let n = data.len().min(image.len());
        data[..n].copy_from_slice(&image[..n]);
    }

    fn range(&self, block_id: u32, count: u32, len: usize) -> BlockDevResult<(usize, usize)> {
        let required = self.block_size as usize * count as usize;
        if len < required {
            return Err(BlockDevError::BufferTooSmall {
                provided: len,
                required,
            });
        }
        if block_id as u64 + count as u64 > self.total_blocks {
            return Err(BlockDevError::BlockOutOfRange {
                block_id,
                max_blocks: self.total_blocks,
            });
        }
        let start = block_id as usize * self.block_size as usize;
        Ok((start, start + required))
    }
}

impl BlockDevice for RamDisk {
    fn write(&mut self, buffer: &[u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let (start, end) = self.range(block_id, count, buffer.len())?;
        self.data.lock()[start..end].copy_from_slice(&buffer[..end - start]);
        Ok(())
    }

    fn read(&mut self, buffer: &mut [u8], block_id: u32, count: u32) -> BlockDevResult<()> {
        let (start, end) = self.range(block_id, count, buffer.len())?;
        buffer[..end - start].copy_from_slice(&self.data.lock()[start..end]);
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}
