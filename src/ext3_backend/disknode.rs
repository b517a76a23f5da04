//! 磁盘 inode 记录（ext2/ext3 128 字节格式，小端）

use crate::ext3_backend::config::*;
use crate::ext3_backend::endian::*;

/// inode 的块指针数组：12 个直接块 + 一级/二级/三级间接块
pub type BlockMap = [u32; EXT3_N_BLOCKS];

/// i_flags 中本引擎关心的位
pub const EXT3_SYNC_FL: u32 = 0x0000_0008;
pub const EXT3_IMMUTABLE_FL: u32 = 0x0000_0010;
pub const EXT3_APPEND_FL: u32 = 0x0000_0020;
pub const EXT3_JOURNAL_DATA_FL: u32 = 0x0000_4000;

/// 普通文件
pub const S_IFREG: u16 = 0o100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawInode {
    pub i_mode: u16,
    /// i_size 与 i_size_high 合并后的 64 位文件大小
    pub i_size: u64,
    pub i_links_count: u16,
    /// 以 512 字节扇区计
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_block: BlockMap,
}

impl DiskFormat for RawInode {
    fn from_disk_bytes(bytes: &[u8]) -> Self {
        let mut i_block = [0u32; EXT3_N_BLOCKS];
        for (i, slot) in i_block.iter_mut().enumerate() {
            *slot = read_le32(bytes, 40 + i * 4);
        }
        let size_lo = read_le32(bytes, 4) as u64;
        let size_hi = read_le32(bytes, 108) as u64;
        Self {
            i_mode: read_le16(bytes, 0),
            i_size: size_lo | (size_hi << 32),
            i_links_count: read_le16(bytes, 26),
            i_blocks: read_le32(bytes, 28),
            i_flags: read_le32(bytes, 32),
            i_block,
        }
    }

    fn to_disk_bytes(&self, bytes: &mut [u8]) {
        write_le16(bytes, 0, self.i_mode);
        write_le32(bytes, 4, self.i_size as u32);
        write_le16(bytes, 26, self.i_links_count);
        write_le32(bytes, 28, self.i_blocks);
        write_le32(bytes, 32, self.i_flags);
        for (i, v) in self.i_block.iter().enumerate() {
            write_le32(bytes, 40 + i * 4, *v);
        }
        write_le32(bytes, 108, (self.i_size >> 32) as u32);
    }

    fn disk_size() -> usize {
        EXT3_INODE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_offsets() {
        let mut raw = RawInode {
            i_mode: S_IFREG | 0o644,
            i_size: 0x1_0000_0400,
            i_links_count: 1,
            i_blocks: 6,
            i_flags: EXT3_APPEND_FL,
            ..Default::default()
        };
        raw.i_block[EXT3_IND_BLOCK] = 0xABCD;
        let mut buf = [0u8; EXT3_INODE_SIZE];
        raw.to_disk_bytes(&mut buf);

        assert_eq!(read_le32(&buf, 4), 0x400);
        assert_eq!(read_le32(&buf, 108), 1);
        assert_eq!(read_le16(&buf, 26), 1);
        assert_eq!(read_le32(&buf, 28), 6);
        assert_eq!(read_le32(&buf, 32), EXT3_APPEND_FL);
        assert_eq!(read_le32(&buf, 40 + 12 * 4), 0xABCD);
        assert_eq!(RawInode::from_disk_bytes(&buf), raw);
    }
}
