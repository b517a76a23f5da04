//! # rsext3 API
//!
//! 建立在块映射引擎之上的简单接口：格式化、挂载，以及按字节偏移或逻辑块
//! 读写普通文件。写操作在一个事务里完成映射、写数据和更新 inode。

use crate::ext3_backend::blockdev::*;
use crate::ext3_backend::buffer::*;
use crate::ext3_backend::config::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::fs::Ext3Fs;
use crate::ext3_backend::inode::Inode;
use crate::ext3_backend::jbd::{Handle, Journal};

/// 在设备上建立空的文件系统
///
/// # 示例
///
/// ```rust
/// use rsext3::*;
/// let disk = RamDisk::new(1024, 4096);
/// fs_format(disk, FsLayout::new(1024, 4096)?)?;
/// # Ok::<(), Ext3Error>(())
/// ```
pub fn fs_format<B: BlockDevice + Send + 'static>(dev: B, layout: FsLayout) -> Ext3Result<()> {
    Ext3Fs::format(dev, layout)
}

/// 挂载：重放日志并补完 orphan 表中未完成的 truncate
pub fn fs_mount<B: BlockDevice + Send + 'static>(
    dev: B,
    layout: FsLayout,
    opts: MountOptions,
) -> Ext3Result<Ext3Fs> {
    Ext3Fs::mount(dev, layout, opts)
}

/// 卸载：提交所有事务并写回
pub fn fs_umount(fs: Ext3Fs) -> Ext3Result<()> {
    fs.unmount()
}

/// 从 `offset` 开始写入 `data`，需要时分配块并扩展文件大小
///
/// # 返回值
///
/// 写入的字节数
pub fn write_at(fs: &Ext3Fs, inode: &Inode, offset: u64, data: &[u8]) -> Ext3Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    fs.check_writable()?;
    let mut handle = fs.journal().start(EXT3_DATA_TRANS_BLOCKS)?;
    let res = write_in(fs, &mut handle, inode, offset, data);
    let stopped = fs.journal().stop(handle);
    res?;
    stopped?;
    Ok(data.len())
}

fn write_in(
    fs: &Ext3Fs,
    handle: &mut Handle,
    inode: &Inode,
    offset: u64,
    data: &[u8],
) -> Ext3Result<()> {
    let bs = fs.geometry().block_size();
    let mut done = 0usize;
    while done < data.len() {
        let pos = offset + done as u64;
        let iblock = (pos / bs as u64) as i64;
        let in_block = (pos % bs as u64) as usize;
        let n = (bs - in_block).min(data.len() - done);

        // 先扩展大小，挂接新块时文件已经覆盖到写入的末尾
        let end = pos + n as u64;
        let prev = inode.size();
        inode.extend_size(end);
        let bh = match fs.getblk(Some(&mut *handle), inode, iblock, true) {
            Ok(Some(bh)) => bh,
            res => {
                let mut st = inode.state();
                if st.i_size == end && prev < end {
                    st.i_size = prev;
                }
                return Err(res.err().unwrap_or(Ext3Error::InvalidArgument));
            }
        };
        if fs.should_journal_data(inode) {
            fs.ensure_credits(handle, 1)?;
            fs.journal().get_write_access(handle, &bh)?;
            bh.write()[in_block..in_block + n].copy_from_slice(&data[done..done + n]);
            fs.journal().dirty_metadata(handle, &bh)?;
        } else {
            bh.write()[in_block..in_block + n].copy_from_slice(&data[done..done + n]);
            bh.set(BufferState::DIRTY);
        }
        done += n;
    }

    {
        let mut st = inode.state();
        if st.i_disksize < st.i_size {
            st.i_disksize = st.i_size;
        }
    }
    fs.ensure_credits(handle, 1)?;
    fs.mark_inode_dirty(handle, inode)
}

/// 从 `offset` 开始读，最多读到文件末尾；空洞读出 0
///
/// # 返回值
///
/// 读到的字节数
pub fn read_at(fs: &Ext3Fs, inode: &Inode, offset: u64, buf: &mut [u8]) -> Ext3Result<usize> {
    let size = inode.size();
    if offset >= size {
        return Ok(0);
    }
    let len = buf.len().min((size - offset) as usize);
    let bs = fs.geometry().block_size();
    let mut done = 0usize;
    while done < len {
        let pos = offset + done as u64;
        let iblock = (pos / bs as u64) as i64;
        let in_block = (pos % bs as u64) as usize;
        let n = (bs - in_block).min(len - done);
        match fs.bread(None, inode, iblock, false)? {
            Some(bh) => buf[done..done + n].copy_from_slice(&bh.read()[in_block..in_block + n]),
            None => buf[done..done + n].fill(0),
        }
        done += n;
    }
    Ok(len)
}

/// 写一个逻辑块的开头部分，返回它的物理块号
pub fn write_block(fs: &Ext3Fs, inode: &Inode, iblock: i64, data: &[u8]) -> Ext3Result<u32> {
    let bs = fs.geometry().block_size();
    if iblock < 0 {
        return Err(Ext3Error::OutOfRange { block: iblock });
    }
    if data.len() > bs {
        return Err(Ext3Error::InvalidArgument);
    }
    write_at(fs, inode, iblock as u64 * bs as u64, data)?;
    fs.bmap(inode, iblock)
}

/// 读一个完整的逻辑块，不受文件大小限制
///
/// # 返回值
///
/// 物理块号；空洞时返回 None，`buf` 被清零
pub fn read_block(fs: &Ext3Fs, inode: &Inode, iblock: i64, buf: &mut [u8]) -> Ext3Result<Option<u32>> {
    let bs = fs.geometry().block_size();
    if buf.len() < bs {
        return Err(Ext3Error::InvalidArgument);
    }
    match fs.bread(None, inode, iblock, false)? {
        Some(bh) => {
            buf[..bs].copy_from_slice(&bh.read());
            Ok(Some(bh.blocknr()))
        }
        None => {
            buf[..bs].fill(0);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn fs(mode: JournalMode) -> (RamDisk, FsLayout, Ext3Fs) {
        let disk = RamDisk::new(1024, 16384);
        let layout = FsLayout::new(1024, 16384).unwrap();
        fs_format(disk.clone(), layout).unwrap();
        let opts = MountOptions {
            journal_mode: mode,
            read_only: false,
        };
        let fs = fs_mount(disk.clone(), layout, opts).unwrap();
        (disk, layout, fs)
    }

    #[test]
    fn test_write_read_across_blocks() {
        let (_disk, _layout, fs) = fs(JournalMode::Ordered);
        let inode = fs.create_inode(12).unwrap();
        let data: alloc::vec::Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(write_at(&fs, &inode, 500, &data).unwrap(), 3000);
        assert_eq!(inode.size(), 3500);
        assert_eq!(inode.disksize(), 3500);

        let mut buf = vec![0xffu8; 4000];
        assert_eq!(read_at(&fs, &inode, 0, &mut buf).unwrap(), 3500);
        assert!(buf[..500].iter().all(|b| *b == 0));
        assert_eq!(&buf[500..3500], &data[..]);
    }

    #[test]
    fn test_hole_reads_zero() {
        let (_disk, _layout, fs) = fs(JournalMode::Ordered);
        let inode = fs.create_inode(12).unwrap();
        write_block(&fs, &inode, 20, b"tail").unwrap();
        let mut buf = vec![0xffu8; 1024];
        assert_eq!(read_block(&fs, &inode, 3, &mut buf).unwrap(), None);
        assert!(buf.iter().all(|b| *b == 0));
        assert!(read_block(&fs, &inode, 20, &mut buf).unwrap().is_some());
        assert_eq!(&buf[..4], b"tail");
    }

    #[test]
    fn test_data_survives_remount() {
        for mode in [JournalMode::Ordered, JournalMode::Writeback, JournalMode::Journal] {
            let (disk, layout, fs) = fs(mode);
            let inode = fs.create_inode(12).unwrap();
            let pblk = write_block(&fs, &inode, 300, b"persist").unwrap();
            fs_umount(fs).unwrap();

            let fs = fs_mount(disk, layout, MountOptions::default()).unwrap();
            let inode = fs.iget(12).unwrap();
            assert_eq!(inode.size(), 300 * 1024 + 7);
            let mut buf = vec![0u8; 1024];
            assert_eq!(read_block(&fs, &inode, 300, &mut buf).unwrap(), Some(pblk));
            assert_eq!(&buf[..7], b"persist");
        }
    }

    #[test]
    fn test_negative_block_rejected() {
        let (_disk, _layout, fs) = fs(JournalMode::Ordered);
        let inode = fs.create_inode(12).unwrap();
        assert_eq!(
            write_block(&fs, &inode, -1, b"x"),
            Err(Ext3Error::OutOfRange { block: -1 })
        );
    }
}
