//! 文件系统实例：把缓存、分配器、日志和 orphan 表组装在一起
//!
//! 块映射和 truncate 引擎都实现为 [`Ext3Fs`] 的方法（见 `indirect` 模块）。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use log::{debug, error, info, warn};
use spin::Mutex;

use crate::ext3_backend::balloc::*;
use crate::ext3_backend::bcache::*;
use crate::ext3_backend::blockdev::*;
use crate::ext3_backend::buffer::*;
use crate::ext3_backend::config::*;
use crate::ext3_backend::disknode::*;
use crate::ext3_backend::endian::DiskFormat;
use crate::ext3_backend::error::*;
use crate::ext3_backend::inode::*;
use crate::ext3_backend::jbd::recovery::RecoveryInfo;
use crate::ext3_backend::jbd::*;
use crate::ext3_backend::orphan::*;

pub struct Ext3Fs {
    pub(crate) cache: Arc<dyn BufferCache>,
    pub(crate) allocator: Arc<dyn BlockAllocator>,
    pub(crate) journal: Arc<dyn Journal>,
    pub(crate) orphans: Arc<dyn OrphanList>,
    pub(crate) geo: Geometry,
    pub(crate) layout: FsLayout,
    pub(crate) opts: MountOptions,
    inodes: Mutex<BTreeMap<u32, InodeRef>>,
    recovery: RecoveryInfo,
}

impl Ext3Fs {
    /// 在设备上建立空的文件系统：inode 表、orphan 表、位图、日志
    pub fn format<B: BlockDevice + Send + 'static>(dev: B, layout: FsLayout) -> Ext3Result<()> {
        layout.validate()?;
        if dev.total_blocks() < layout.blocks_count as u64 {
            return Err(Ext3Error::InvalidArgument);
        }
        let cache = Ext3BufferCache::new(dev, layout.block_size)?;
        let zero = vec![0u8; layout.block_size];
        cache.write_raw(0, &zero)?;
        for i in 0..layout.inode_blocks() {
            cache.write_raw(layout.inode_table_start + i, &zero)?;
        }
        OrphanTable::format(&cache, layout.orphan_block)?;
        BitmapAllocator::format(&cache, &layout)?;
        LogJournal::format(&cache, layout.journal_start, layout.journal_len)?;
        info!(
            "[ext3] formatted {} blocks of {} bytes, {} groups, data from block {}",
            layout.blocks_count,
            layout.block_size,
            layout.groups_count(),
            layout.first_data_block()
        );
        Ok(())
    }

    /// 挂载：重放日志、加载位图、补完 orphan 表中的 truncate
    pub fn mount<B: BlockDevice + Send + 'static>(
        dev: B,
        layout: FsLayout,
        opts: MountOptions,
    ) -> Ext3Result<Self> {
        layout.validate()?;
        let cache: Arc<dyn BufferCache> =
            Arc::new(Ext3BufferCache::new(dev, layout.block_size)?);
        let ordered = opts.journal_mode == JournalMode::Ordered;
        let (journal, recovery) = LogJournal::load(cache.clone(), layout.journal_start, ordered)?;
        let journal: Arc<dyn Journal> = Arc::new(journal);
        let allocator: Arc<dyn BlockAllocator> = Arc::new(BitmapAllocator::load(
            cache.clone(),
            journal.clone(),
            layout,
        )?);
        let orphans: Arc<dyn OrphanList> = Arc::new(OrphanTable::new(
            cache.clone(),
            journal.clone(),
            layout.orphan_block,
        ));
        let mut fs = Self::with_components(cache, allocator, journal, orphans, layout, opts)?;
        fs.recovery = recovery;
        if !opts.read_only {
            fs.recover_orphans()?;
        }
        Ok(fs)
    }

    /// 用外部提供的协作者组装实例
    pub fn with_components(
        cache: Arc<dyn BufferCache>,
        allocator: Arc<dyn BlockAllocator>,
        journal: Arc<dyn Journal>,
        orphans: Arc<dyn OrphanList>,
        layout: FsLayout,
        opts: MountOptions,
    ) -> Ext3Result<Self> {
        let geo = Geometry::new(layout.block_size)?;
        if cache.block_size() != layout.block_size {
            return Err(Ext3Error::InvalidArgument);
        }
        Ok(Self {
            cache,
            allocator,
            journal,
            orphans,
            geo,
            layout,
            opts,
            inodes: Mutex::new(BTreeMap::new()),
            recovery: RecoveryInfo::default(),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    pub fn options(&self) -> &MountOptions {
        &self.opts
    }

    pub fn cache(&self) -> &Arc<dyn BufferCache> {
        &self.cache
    }

    pub fn allocator(&self) -> &Arc<dyn BlockAllocator> {
        &self.allocator
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn orphans(&self) -> &Arc<dyn OrphanList> {
        &self.orphans
    }

    /// 挂载时日志恢复的统计
    pub fn recovery_info(&self) -> RecoveryInfo {
        self.recovery
    }

    pub(crate) fn check_writable(&self) -> Ext3Result<()> {
        if self.opts.read_only {
            return Err(Ext3Error::ReadOnly);
        }
        if self.journal.is_aborted() {
            return Err(Ext3Error::Aborted);
        }
        Ok(())
    }

    /// 数据块是否也要写日志
    pub fn should_journal_data(&self, inode: &Inode) -> bool {
        self.opts.journal_mode == JournalMode::Journal
            || inode.flags().contains(InodeFlags::JOURNAL_DATA)
    }

    // ------------------------------------------------------------------
    // inode
    // ------------------------------------------------------------------

    /// 从 inode 表读取磁盘 inode
    pub fn load_inode(&self, ino: u32) -> Ext3Result<Inode> {
        let (block, offset) = self.layout.inode_location(ino)?;
        let bh = self.cache.get_block_buffer(block)?;
        let raw = RawInode::from_disk_bytes(&bh.read()[offset..offset + EXT3_INODE_SIZE]);
        Ok(Inode::from_raw(ino, self.layout.inode_group(ino), &raw))
    }

    /// 取得共享的内存 inode，首次访问时从磁盘加载
    pub fn iget(&self, ino: u32) -> Ext3Result<InodeRef> {
        let mut inodes = self.inodes.lock();
        if let Some(inode) = inodes.get(&ino) {
            return Ok(inode.clone());
        }
        let inode = Arc::new(self.load_inode(ino)?);
        inodes.insert(ino, inode.clone());
        Ok(inode)
    }

    /// 建立一个空的普通文件 inode 并写入 inode 表
    pub fn create_inode(&self, ino: u32) -> Ext3Result<InodeRef> {
        self.check_writable()?;
        self.layout.inode_location(ino)?;
        let inode = Arc::new(Inode::new(ino, self.layout.inode_group(ino)));
        let mut handle = self.journal.start(EXT3_ORPHAN_TRANS_BLOCKS)?;
        let res = self.mark_inode_dirty(&mut handle, &inode);
        self.journal.stop(handle)?;
        res?;
        self.inodes.lock().insert(ino, inode.clone());
        debug!("[ext3] created inode {ino}");
        Ok(inode)
    }

    /// 从内存 inode 表中去掉已删除的 inode
    pub(crate) fn drop_inode(&self, ino: u32) {
        self.inodes.lock().remove(&ino);
    }

    /// 把内存 inode 写回 inode 表（经由日志）
    pub fn mark_inode_dirty(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()> {
        let (block, offset) = self.layout.inode_location(inode.ino())?;
        let bh = self.cache.get_block_buffer(block)?;
        self.journal.get_write_access(handle, &bh)?;
        let raw = inode.to_raw();
        raw.to_disk_bytes(&mut bh.write()[offset..offset + EXT3_INODE_SIZE]);
        self.journal.dirty_metadata(handle, &bh)
    }

    /// 预先把 inode 所在的 inode 表块加入事务
    pub(crate) fn reserve_inode_write(&self, handle: &mut Handle, inode: &Inode) -> Ext3Result<()> {
        let (block, _) = self.layout.inode_location(inode.ino())?;
        let bh = self.cache.get_block_buffer(block)?;
        self.journal.get_write_access(handle, &bh)
    }

    /// 持有 handle 时等待一把锁
    ///
    /// 如果 handle 所在的事务已被锁住，锁的持有者可能正在 restart 中等它提交，
    /// 这时先 restart 自己的 handle 再继续等。
    pub(crate) fn lock_with_handle<G>(
        &self,
        mut handle: Option<&mut Handle>,
        mut try_lock: impl FnMut() -> Option<G>,
    ) -> Ext3Result<G> {
        loop {
            if let Some(guard) = try_lock() {
                return Ok(guard);
            }
            if let Some(h) = handle.as_deref_mut()
                && self.journal.is_locked(h)
            {
                debug!("[ext3] tid={} is locked, restarting handle before waiting", h.tid());
                let credits = h.credits().max(EXT3_DATA_TRANS_BLOCKS);
                self.journal.restart(h, credits)?;
            }
            core::hint::spin_loop();
        }
    }

    // ------------------------------------------------------------------
    // 块分配
    // ------------------------------------------------------------------

    /// 分配一个块并计入 i_blocks
    pub(crate) fn alloc_block(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        goal: u32,
    ) -> Ext3Result<u32> {
        let nr = self.allocator.alloc_block(handle, goal)?;
        inode.state().i_blocks += self.geo.sectors_per_block();
        Ok(nr)
    }

    /// 释放连续块并从 i_blocks 中扣除
    pub(crate) fn free_blocks(
        &self,
        handle: &mut Handle,
        inode: &Inode,
        start: u32,
        count: u32,
    ) -> Ext3Result<()> {
        self.allocator.free_blocks(handle, start, count)?;
        let mut st = inode.state();
        st.i_blocks = st
            .i_blocks
            .saturating_sub(count as u64 * self.geo.sectors_per_block());
        Ok(())
    }

    /// 释放块之前把它从日志中去掉
    ///
    /// 完整数据日志模式下，或者是不写日志的数据块，只需要 forget；
    /// 其余情况写撤销记录，防止恢复时旧副本覆盖重新分配后的内容。
    pub(crate) fn forget(
        &self,
        handle: &mut Handle,
        is_metadata: bool,
        inode: &Inode,
        blocknr: u32,
        bh: Option<&BufferRef>,
    ) -> Ext3Result<()> {
        if self.opts.journal_mode == JournalMode::Journal
            || (!is_metadata && !self.should_journal_data(inode))
        {
            return match bh {
                Some(bh) => self.journal.forget(handle, bh),
                None => {
                    self.cache.forget(blocknr);
                    Ok(())
                }
            };
        }
        self.journal.revoke(handle, blocknr, bh).inspect_err(|e| {
            error!("[ext3] error {e} when attempting revoke of block {blocknr}");
        })
    }

    // ------------------------------------------------------------------
    // 挂载 / 卸载
    // ------------------------------------------------------------------

    /// 补完崩溃前没有完成的 truncate / 删除
    pub fn recover_orphans(&self) -> Ext3Result<()> {
        let inos = self.orphans.list()?;
        if inos.is_empty() {
            return Ok(());
        }
        info!("[ext3] orphan cleanup: {} inodes", inos.len());
        for ino in inos {
            let inode = self.iget(ino)?;
            if inode.links_count() == 0 {
                debug!("[ext3] orphan cleanup: deleting unreferenced inode {ino}");
                self.delete_inode(&inode)?;
            } else {
                debug!(
                    "[ext3] orphan cleanup: truncating inode {ino} to {} bytes",
                    inode.disksize()
                );
                self.truncate_blocks(&inode)?;
            }
        }
        Ok(())
    }

    /// 写回数据、提交运行中的事务并 checkpoint
    pub fn sync(&self) -> Ext3Result<()> {
        self.cache.sync_data()?;
        self.journal.force_commit()?;
        self.journal.checkpoint()?;
        self.cache.flush_device()
    }

    pub fn unmount(self) -> Ext3Result<()> {
        if self.opts.read_only {
            return Ok(());
        }
        if self.journal.is_aborted() {
            warn!("[ext3] unmounting with aborted journal, skipping sync");
            return Err(Ext3Error::Aborted);
        }
        self.sync()?;
        info!("[ext3] unmounted");
        Ok(())
    }
}
