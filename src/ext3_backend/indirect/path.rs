//! 逻辑块号 -> 块树路径

use log::warn;

use crate::ext3_backend::config::*;

/// 从 inode 到目标块每一层的槽位下标
///
/// `depth` 为 0 表示逻辑块号越界（负数或超出三级间接范围）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockPath {
    offsets: [usize; EXT3_MAX_DEPTH],
    depth: usize,
}

impl BlockPath {
    pub fn offsets(&self) -> &[usize] {
        &self.offsets[..self.depth]
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_valid(&self) -> bool {
        self.depth != 0
    }

    fn push(&mut self, off: usize) {
        self.offsets[self.depth] = off;
        self.depth += 1;
    }
}

/// 把逻辑块号拆成各级偏移
///
/// 第一个偏移是 i_block 中的下标：0..12 为直接块，12/13/14 分别是
/// 一级、二级、三级间接块。越界时打印警告并返回深度 0。
pub fn block_to_path(geo: &Geometry, ino: u32, iblock: i64) -> BlockPath {
    let ptrs = geo.addr_per_block() as i64;
    let ptrs_bits = geo.addr_per_block_bits();
    let direct_blocks = EXT3_NDIR_BLOCKS as i64;
    let indirect_blocks = ptrs;
    let double_blocks = 1i64 << (ptrs_bits * 2);

    let mut path = BlockPath::default();
    let mut i_block = iblock;
    if i_block < 0 {
        warn!("ext3_block_to_path: inode {ino}: block {iblock} < 0");
        return path;
    }
    if i_block < direct_blocks {
        path.push(i_block as usize);
        return path;
    }
    i_block -= direct_blocks;
    if i_block < indirect_blocks {
        path.push(EXT3_IND_BLOCK);
        path.push(i_block as usize);
        return path;
    }
    i_block -= indirect_blocks;
    if i_block < double_blocks {
        path.push(EXT3_DIND_BLOCK);
        path.push((i_block >> ptrs_bits) as usize);
        path.push((i_block & (ptrs - 1)) as usize);
        return path;
    }
    i_block -= double_blocks;
    if (i_block >> (ptrs_bits * 2)) < ptrs {
        path.push(EXT3_TIND_BLOCK);
        path.push((i_block >> (ptrs_bits * 2)) as usize);
        path.push(((i_block >> ptrs_bits) & (ptrs - 1)) as usize);
        path.push((i_block & (ptrs - 1)) as usize);
        return path;
    }
    warn!("ext3_block_to_path: inode {ino}: block {iblock} > big");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(1024).unwrap()
    }

    #[test]
    fn test_direct() {
        let p = block_to_path(&geo(), 12, 5);
        assert_eq!(p.offsets(), &[5]);
        let p = block_to_path(&geo(), 12, 11);
        assert_eq!(p.offsets(), &[11]);
    }

    #[test]
    fn test_single_indirect() {
        let p = block_to_path(&geo(), 12, 12);
        assert_eq!(p.offsets(), &[EXT3_IND_BLOCK, 0]);
        let p = block_to_path(&geo(), 12, 12 + 255);
        assert_eq!(p.offsets(), &[EXT3_IND_BLOCK, 255]);
    }

    #[test]
    fn test_double_indirect() {
        let base = 12 + 256;
        let p = block_to_path(&geo(), 12, base);
        assert_eq!(p.offsets(), &[EXT3_DIND_BLOCK, 0, 0]);
        let p = block_to_path(&geo(), 12, base + 256 * 3 + 7);
        assert_eq!(p.offsets(), &[EXT3_DIND_BLOCK, 3, 7]);
        let p = block_to_path(&geo(), 12, base + 256 * 256 - 1);
        assert_eq!(p.offsets(), &[EXT3_DIND_BLOCK, 255, 255]);
    }

    #[test]
    fn test_triple_indirect() {
        let base = 12 + 256 + 256 * 256;
        let p = block_to_path(&geo(), 12, base);
        assert_eq!(p.offsets(), &[EXT3_TIND_BLOCK, 0, 0, 0]);
        let p = block_to_path(&geo(), 12, base + 65536 * 2 + 256 * 5 + 9);
        assert_eq!(p.offsets(), &[EXT3_TIND_BLOCK, 2, 5, 9]);
        let last = geo().max_blocks() as i64 - 1;
        assert_eq!(block_to_path(&geo(), 12, last).depth(), 4);
    }

    #[test]
    fn test_out_of_range() {
        assert!(!block_to_path(&geo(), 12, -1).is_valid());
        let max = geo().max_blocks() as i64;
        assert_eq!(block_to_path(&geo(), 12, max).depth(), 0);
    }

    #[test]
    fn test_4k_blocks() {
        let geo = Geometry::new(4096).unwrap();
        let p = block_to_path(&geo, 12, 12 + 1023);
        assert_eq!(p.offsets(), &[EXT3_IND_BLOCK, 1023]);
        let p = block_to_path(&geo, 12, 12 + 1024);
        assert_eq!(p.offsets(), &[EXT3_DIND_BLOCK, 0, 0]);
    }
}
