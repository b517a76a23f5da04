//! JBD 日志磁盘结构（全部大端）

use crate::ext3_backend::endian::*;

/// 日志魔数
pub const JBD_MAGIC: u32 = 0xC03B_3998;

/// 块类型
pub const JBD_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD_COMMIT_BLOCK: u32 = 2;
pub const JBD_SUPERBLOCK_V1: u32 = 3;
pub const JBD_SUPERBLOCK_V2: u32 = 4;
pub const JBD_REVOKE_BLOCK: u32 = 5;

/// tag 标志
pub const JBD_FLAG_ESCAPE: u32 = 1;
pub const JBD_FLAG_SAME_UUID: u32 = 2;
pub const JBD_FLAG_DELETED: u32 = 4;
pub const JBD_FLAG_LAST_TAG: u32 = 8;

/// 日志块公共头
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalHeader {
    pub h_magic: u32,
    pub h_blocktype: u32,
    pub h_sequence: u32,
}

impl JournalHeader {
    pub fn new(blocktype: u32, sequence: u32) -> Self {
        Self {
            h_magic: JBD_MAGIC,
            h_blocktype: blocktype,
            h_sequence: sequence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.h_magic == JBD_MAGIC
    }
}

impl DiskFormat for JournalHeader {
    fn from_disk_bytes(bytes: &[u8]) -> Self {
        Self {
            h_magic: read_be32(bytes, 0),
            h_blocktype: read_be32(bytes, 4),
            h_sequence: read_be32(bytes, 8),
        }
    }

    fn to_disk_bytes(&self, bytes: &mut [u8]) {
        write_be32(bytes, 0, self.h_magic);
        write_be32(bytes, 4, self.h_blocktype);
        write_be32(bytes, 8, self.h_sequence);
    }

    fn disk_size() -> usize {
        12
    }
}

/// 描述符块中的 tag：目标块号 + 标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalBlockTag {
    pub t_blocknr: u32,
    pub t_flags: u32,
}

impl DiskFormat for JournalBlockTag {
    fn from_disk_bytes(bytes: &[u8]) -> Self {
        Self {
            t_blocknr: read_be32(bytes, 0),
            t_flags: read_be32(bytes, 4),
        }
    }

    fn to_disk_bytes(&self, bytes: &mut [u8]) {
        write_be32(bytes, 0, self.t_blocknr);
        write_be32(bytes, 4, self.t_flags);
    }

    fn disk_size() -> usize {
        8
    }
}

/// 撤销块头：r_count 是本块已用字节数（含头）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevokeHeader {
    pub r_header: JournalHeader,
    pub r_count: u32,
}

impl DiskFormat for RevokeHeader {
    fn from_disk_bytes(bytes: &[u8]) -> Self {
        Self {
            r_header: JournalHeader::from_disk_bytes(&bytes[0..12]),
            r_count: read_be32(bytes, 12),
        }
    }

    fn to_disk_bytes(&self, bytes: &mut [u8]) {
        self.r_header.to_disk_bytes(&mut bytes[0..12]);
        write_be32(bytes, 12, self.r_count);
    }

    fn disk_size() -> usize {
        16
    }
}

/// 日志超级块
///
/// s_first/s_start 都是日志区内的相对块号；s_start 为 0 表示日志为空，不需要恢复。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalSuperblock {
    pub s_header: JournalHeader,
    pub s_blocksize: u32,
    pub s_maxlen: u32,
    pub s_first: u32,
    pub s_sequence: u32,
    pub s_start: u32,
    pub s_errno: u32,
}

impl JournalSuperblock {
    pub fn new(block_size: u32, maxlen: u32) -> Self {
        Self {
            s_header: JournalHeader::new(JBD_SUPERBLOCK_V2, 0),
            s_blocksize: block_size,
            s_maxlen: maxlen,
            s_first: 1,
            s_sequence: 1,
            s_start: 0,
            s_errno: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.s_header.is_valid()
            && matches!(
                self.s_header.h_blocktype,
                JBD_SUPERBLOCK_V1 | JBD_SUPERBLOCK_V2
            )
            && self.s_first >= 1
            && self.s_first < self.s_maxlen
    }

    pub fn needs_recovery(&self) -> bool {
        self.s_start != 0
    }
}

impl DiskFormat for JournalSuperblock {
    fn from_disk_bytes(bytes: &[u8]) -> Self {
        Self {
            s_header: JournalHeader::from_disk_bytes(&bytes[0..12]),
            s_blocksize: read_be32(bytes, 12),
            s_maxlen: read_be32(bytes, 16),
            s_first: read_be32(bytes, 20),
            s_sequence: read_be32(bytes, 24),
            s_start: read_be32(bytes, 28),
            s_errno: read_be32(bytes, 32),
        }
    }

    fn to_disk_bytes(&self, bytes: &mut [u8]) {
        self.s_header.to_disk_bytes(&mut bytes[0..12]);
        write_be32(bytes, 12, self.s_blocksize);
        write_be32(bytes, 16, self.s_maxlen);
        write_be32(bytes, 20, self.s_first);
        write_be32(bytes, 24, self.s_sequence);
        write_be32(bytes, 28, self.s_start);
        write_be32(bytes, 32, self.s_errno);
    }

    fn disk_size() -> usize {
        36
    }
}

/// 一个描述符块能放多少个 tag
pub fn tags_per_descriptor(block_size: usize) -> usize {
    (block_size - JournalHeader::disk_size()) / JournalBlockTag::disk_size()
}

/// 一个撤销块能放多少条记录
pub fn revokes_per_block(block_size: usize) -> usize {
    (block_size - RevokeHeader::disk_size()) / 4
}
