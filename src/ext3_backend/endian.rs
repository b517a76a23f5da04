//! 磁盘字节序辅助
//!
//! ext3 的 inode、位图和间接块都是小端，JBD 日志结构是大端。

/// 可以和磁盘字节互相转换的结构
pub trait DiskFormat: Sized {
    /// 从磁盘字节解析
    fn from_disk_bytes(bytes: &[u8]) -> Self;

    /// 序列化到磁盘字节
    fn to_disk_bytes(&self, bytes: &mut [u8]);

    /// 磁盘上占用的字节数
    fn disk_size() -> usize;
}

#[inline]
pub fn read_le16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

#[inline]
pub fn write_le16(bytes: &mut [u8], off: usize, v: u16) {
    bytes[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn read_le32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

#[inline]
pub fn write_le32(bytes: &mut [u8], off: usize, v: u32) {
    bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn read_be32(bytes: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

#[inline]
pub fn write_be32(bytes: &mut [u8], off: usize, v: u32) {
    bytes[off..off + 4].copy_from_slice(&v.to_be_bytes());
}
