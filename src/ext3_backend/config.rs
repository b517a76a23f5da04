/// Ext3 间接块映射引擎配置
use crate::ext3_backend::error::{Ext3Error, Ext3Result};

// ============================================================================
// 块映射（i_block）布局
// ============================================================================

/// 直接块指针个数
pub const EXT3_NDIR_BLOCKS: usize = 12;
/// 一级间接块指针在 i_block 中的下标
pub const EXT3_IND_BLOCK: usize = EXT3_NDIR_BLOCKS;
/// 二级间接块指针在 i_block 中的下标
pub const EXT3_DIND_BLOCK: usize = EXT3_IND_BLOCK + 1;
/// 三级间接块指针在 i_block 中的下标
pub const EXT3_TIND_BLOCK: usize = EXT3_DIND_BLOCK + 1;
/// i_block 总槽位数
pub const EXT3_N_BLOCKS: usize = EXT3_TIND_BLOCK + 1;
/// 块树最大深度（inode -> 三级间接 -> 二级 -> 一级 -> 数据）
pub const EXT3_MAX_DEPTH: usize = 4;

// ============================================================================
// 块相关配置
// ============================================================================

/// 默认块大小（字节）
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// 允许的最小块大小
pub const MIN_BLOCK_SIZE: usize = 1024;
/// 允许的最大块大小
pub const MAX_BLOCK_SIZE: usize = 4096;
/// i_blocks 以 512 字节扇区计数
pub const SECTOR_SIZE: u64 = 512;

// ============================================================================
// Inode 相关配置
// ============================================================================

/// 磁盘 inode 记录大小（ext2/ext3 good old inode）
pub const EXT3_INODE_SIZE: usize = 128;
/// 第一个可用 inode 号（inode 号从 1 开始）
pub const EXT3_ROOT_INO: u32 = 2;

// ============================================================================
// 日志 credit 估算
// ============================================================================

/// 修改单个数据块最多触碰的元数据块数：
/// inode、位图、组描述符、超级块以及最多三个间接块
pub const EXT3_SINGLEDATA_TRANS_BLOCKS: u32 = 8;
/// 数据写事务的 credit
pub const EXT3_DATA_TRANS_BLOCKS: u32 = EXT3_SINGLEDATA_TRANS_BLOCKS;
/// truncate 中剩余 credit 低于该值时需要 extend 或 restart
pub const EXT3_RESERVE_TRANS_BLOCKS: u32 = 12;
/// 单次 truncate 事务中为释放预留的最大 credit
pub const EXT3_MAX_TRANS_DATA: u32 = 64;
/// orphan 表修改需要的 credit（orphan 块 + inode）
pub const EXT3_ORPHAN_TRANS_BLOCKS: u32 = 2;

// ============================================================================
// 几何参数
// ============================================================================

/// 由块大小推导出的块树几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    addr_per_block: usize,
    addr_bits: u32,
}

impl Geometry {
    pub fn new(block_size: usize) -> Ext3Result<Self> {
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(Ext3Error::InvalidArgument);
        }
        let addr_per_block = block_size / 4;
        Ok(Self {
            block_size,
            addr_per_block,
            addr_bits: addr_per_block.trailing_zeros(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_size_bits(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    /// 每个间接块能存多少个 u32 块号
    pub fn addr_per_block(&self) -> usize {
        self.addr_per_block
    }

    pub fn addr_per_block_bits(&self) -> u32 {
        self.addr_bits
    }

    /// 三级间接能寻址的逻辑块总数
    pub fn max_blocks(&self) -> u64 {
        let ptrs = self.addr_per_block as u64;
        EXT3_NDIR_BLOCKS as u64 + ptrs + ptrs * ptrs + ptrs * ptrs * ptrs
    }

    /// 每个块包含的 512 字节扇区数
    pub fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / SECTOR_SIZE
    }
}

// ============================================================================
// 文件系统布局
// ============================================================================

/// 设备上的区域划分。超级块格式不在本库范围内，所以由调用者在 format/mount 时传入
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsLayout {
    pub block_size: usize,
    /// 设备总块数
    pub blocks_count: u32,
    /// 每个块组的块数，不能超过一个位图块能描述的位数
    pub blocks_per_group: u32,
    /// 第一个块组位图所在块，第 g 组位图位于 bitmap_start + g
    pub bitmap_start: u32,
    /// inode 表起始块
    pub inode_table_start: u32,
    /// inode 总数
    pub inodes_count: u32,
    /// orphan 表所在块
    pub orphan_block: u32,
    /// 日志区起始块（日志超级块）
    pub journal_start: u32,
    /// 日志区块数
    pub journal_len: u32,
}

impl FsLayout {
    /// 按块大小和块数生成一个默认布局：
    /// [0 保留][1 orphan][位图...][inode 表...][日志...][数据...]
    pub fn new(block_size: usize, blocks_count: u32) -> Ext3Result<Self> {
        let geo = Geometry::new(block_size)?;
        let blocks_per_group = (block_size * 8) as u32;
        let groups = blocks_count.div_ceil(blocks_per_group);
        let inodes_count = 64;
        let inode_blocks =
            (inodes_count as usize * EXT3_INODE_SIZE).div_ceil(geo.block_size()) as u32;
        let bitmap_start = 2;
        let inode_table_start = bitmap_start + groups;
        let journal_start = inode_table_start + inode_blocks;
        let journal_len = 1024;
        let layout = Self {
            block_size,
            blocks_count,
            blocks_per_group,
            bitmap_start,
            inode_table_start,
            inodes_count,
            orphan_block: 1,
            journal_start,
            journal_len,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn with_journal_len(mut self, journal_len: u32) -> Ext3Result<Self> {
        self.journal_len = journal_len;
        self.validate()?;
        Ok(self)
    }

    pub fn groups_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group)
    }

    pub fn inode_blocks(&self) -> u32 {
        (self.inodes_count as usize * EXT3_INODE_SIZE).div_ceil(self.block_size) as u32
    }

    /// 第一个可分配给文件的数据块
    pub fn first_data_block(&self) -> u32 {
        self.journal_start + self.journal_len
    }

    /// inode 号 -> (inode 表块号, 块内偏移)
    pub fn inode_location(&self, ino: u32) -> Ext3Result<(u32, usize)> {
        if ino == 0 || ino > self.inodes_count {
            return Err(Ext3Error::InvalidArgument);
        }
        let per_block = (self.block_size / EXT3_INODE_SIZE) as u32;
        let index = ino - 1;
        let block = self.inode_table_start + index / per_block;
        let offset = (index % per_block) as usize * EXT3_INODE_SIZE;
        Ok((block, offset))
    }

    /// inode 所属块组：按 inode 号在各组之间平均分布
    pub fn inode_group(&self, ino: u32) -> u32 {
        let groups = self.groups_count().max(1);
        let per_group = self.inodes_count.div_ceil(groups).max(1);
        (ino.saturating_sub(1) / per_group).min(groups - 1)
    }

    pub fn validate(&self) -> Ext3Result<()> {
        Geometry::new(self.block_size)?;
        if self.blocks_per_group == 0 || self.blocks_per_group as usize > self.block_size * 8 {
            return Err(Ext3Error::InvalidArgument);
        }
        // 日志至少要能放下超级块、一个描述符块、一个数据块和一个提交块
        if self.journal_len < 8 {
            return Err(Ext3Error::InvalidArgument);
        }
        if self.first_data_block() >= self.blocks_count {
            return Err(Ext3Error::InvalidArgument);
        }
        if self.orphan_block == 0 || self.orphan_block >= self.bitmap_start {
            return Err(Ext3Error::InvalidArgument);
        }
        Ok(())
    }
}

// ============================================================================
// 挂载选项
// ============================================================================

/// 数据日志模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// 数据块在元数据提交前落盘
    #[default]
    Ordered,
    /// 数据块不受日志约束
    Writeback,
    /// 数据块与元数据一起写入日志
    Journal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountOptions {
    pub journal_mode: JournalMode,
    pub read_only: bool,
}
