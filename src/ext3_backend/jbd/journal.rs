use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::ext3_backend::bcache::BufferCache;
use crate::ext3_backend::buffer::*;
use crate::ext3_backend::endian::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::jbd::jbdstruct::*;
use crate::ext3_backend::jbd::recovery::{self, RecoveryInfo};
use crate::ext3_backend::jbd::{Handle, Journal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    /// 可以接纳新 handle
    Running,
    /// 不再接纳新 handle，最后一个 handle 退出时提交
    Locked,
}

struct Transaction {
    tid: u32,
    state: TxnState,
    handles: usize,
    /// 所有 handle 预留但尚未归还的 credit
    reserved: u32,
    buffers: BTreeMap<u32, BufferRef>,
    revoked: BTreeSet<u32>,
}

impl Transaction {
    fn new(tid: u32) -> Self {
        Self {
            tid,
            state: TxnState::Running,
            handles: 0,
            reserved: 0,
            buffers: BTreeMap::new(),
            revoked: BTreeSet::new(),
        }
    }
}

struct JournalState {
    running: Option<Transaction>,
    next_tid: u32,
    committed_tid: u32,
    /// 下一个日志块的相对块号，0 表示日志为空
    head: u32,
    sb: JournalSuperblock,
    /// 已提交、尚未写回原位置的块副本
    checkpoint: BTreeMap<u32, Vec<u8>>,
    aborted: bool,
}

enum StartAction {
    Create,
    Joined(u32),
    CommitNow,
    Wait,
}

/// JBD 格式的预写日志
///
/// 同一时刻只有一个运行中的事务，并发 handle 共享它。事务在被锁住且最后一个
/// handle 退出时提交：先写描述符块和元数据副本，再写撤销块，最后写提交块。
/// 提交后的副本留在内存里等待 checkpoint 写回原位置。
pub struct LogJournal {
    cache: Arc<dyn BufferCache>,
    start_block: u32,
    max_len: u32,
    max_txn_credits: u32,
    ordered: bool,
    state: Mutex<JournalState>,
}

impl LogJournal {
    /// 初始化日志区：清零后写入日志超级块
    pub fn format(cache: &dyn BufferCache, start_block: u32, len: u32) -> Ext3Result<()> {
        let bs = cache.block_size();
        let zero = vec![0u8; bs];
        for rel in 1..len {
            cache.write_raw(start_block + rel, &zero)?;
        }
        let sb = JournalSuperblock::new(bs as u32, len);
        let mut buf = vec![0u8; bs];
        sb.to_disk_bytes(&mut buf);
        cache.write_raw(start_block, &buf)?;
        cache.flush_device()?;
        debug!("[JBD] formatted journal at block {start_block}, {len} blocks");
        Ok(())
    }

    /// 读取日志超级块，必要时重放日志
    pub fn load(
        cache: Arc<dyn BufferCache>,
        start_block: u32,
        ordered: bool,
    ) -> Ext3Result<(Self, RecoveryInfo)> {
        let bs = cache.block_size();
        let mut buf = vec![0u8; bs];
        cache.read_raw(start_block, &mut buf)?;
        let mut sb = JournalSuperblock::from_disk_bytes(&buf);
        if !sb.is_valid() || sb.s_blocksize as usize != bs {
            error!("[JBD] invalid journal superblock at block {start_block}: {sb:?}");
            return Err(Ext3Error::Corrupted { block: start_block });
        }

        let info = if sb.needs_recovery() {
            recovery::recover(cache.as_ref(), start_block, &mut sb)?
        } else {
            RecoveryInfo::clean(sb.s_sequence)
        };

        let max_len = sb.s_maxlen;
        let journal = Self {
            cache,
            start_block,
            max_len,
            max_txn_credits: (max_len / 4).max(1),
            ordered,
            state: Mutex::new(JournalState {
                running: None,
                next_tid: sb.s_sequence,
                committed_tid: sb.s_sequence.wrapping_sub(1),
                head: 0,
                sb,
                checkpoint: BTreeMap::new(),
                aborted: false,
            }),
        };
        Ok((journal, info))
    }

    /// 单个事务最多可预留的 credit
    pub fn max_transaction_credits(&self) -> u32 {
        self.max_txn_credits
    }

    /// 提交并 checkpoint
    pub fn sync(&self) -> Ext3Result<()> {
        self.force_commit()?;
        self.checkpoint()
    }

    /// 中止日志，之后所有操作都返回 Aborted
    pub fn abort(&self) {
        let mut st = self.state.lock();
        if !st.aborted {
            error!("[JBD] journal aborted");
        }
        st.aborted = true;
    }

    /// 等待 checkpoint 的块数
    pub fn pending_checkpoint(&self) -> usize {
        self.state.lock().checkpoint.len()
    }

    /// 运行中事务号
    pub fn running_tid(&self) -> Option<u32> {
        self.state.lock().running.as_ref().map(|t| t.tid)
    }

    fn running_for<'a>(
        st: &'a mut JournalState,
        handle: &Handle,
    ) -> Ext3Result<&'a mut Transaction> {
        if st.aborted {
            return Err(Ext3Error::Aborted);
        }
        match st.running.as_mut() {
            Some(t) if t.tid == handle.tid() => Ok(t),
            _ => {
                warn!("[JBD] handle tid={} is not running", handle.tid());
                Err(Ext3Error::InvalidArgument)
            }
        }
    }

    /// 把缓冲区加入 handle 所在事务，新加入时扣一个 credit
    fn join_buffer(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()> {
        let mut st = self.state.lock();
        let t = Self::running_for(&mut st, handle)?;
        let blocknr = bh.blocknr();
        if !t.buffers.contains_key(&blocknr) {
            handle.consume()?;
            t.buffers.insert(blocknr, bh.clone());
        }
        if t.revoked.remove(&blocknr) {
            trace!("[JBD] tid={} cancel revoke of block {blocknr}", t.tid);
        }
        bh.set(BufferState::JBD);
        Ok(())
    }

    fn next_log_block(&self, st: &mut JournalState) -> u32 {
        let rel = st.head;
        st.head += 1;
        self.start_block + rel
    }

    fn write_superblock(&self, sb: &JournalSuperblock) -> Ext3Result<()> {
        let mut buf = vec![0u8; self.cache.block_size()];
        sb.to_disk_bytes(&mut buf);
        self.cache.write_raw(self.start_block, &buf)?;
        self.cache.flush_device()
    }

    fn commit_locked(&self, st: &mut JournalState, txn: Transaction) -> Ext3Result<()> {
        let tid = txn.tid;
        let r = self.write_transaction(st, txn);
        match r {
            Ok(()) => st.committed_tid = tid,
            Err(e) => {
                error!("[JBD commit] tid={tid} failed: {e}");
                st.aborted = true;
            }
        }
        r
    }

    fn write_transaction(&self, st: &mut JournalState, txn: Transaction) -> Ext3Result<()> {
        let tid = txn.tid;
        trace!(
            "[JBD commit] begin: tid={} buffers={} revokes={} head={}",
            tid,
            txn.buffers.len(),
            txn.revoked.len(),
            st.head
        );
        if txn.buffers.is_empty() && txn.revoked.is_empty() {
            return Ok(());
        }

        // ordered 模式：数据块先于引用它们的元数据落盘
        if self.ordered {
            self.cache.sync_data()?;
        }

        let bs = self.cache.block_size();
        let updates: Vec<(u32, Vec<u8>)> = txn
            .buffers
            .values()
            .map(|bh| (bh.blocknr(), bh.copy_data()))
            .collect();
        let revokes: Vec<u32> = txn.revoked.iter().copied().collect();

        let tpd = tags_per_descriptor(bs);
        let rpb = revokes_per_block(bs);
        let needed = updates.len().div_ceil(tpd) + updates.len() + revokes.len().div_ceil(rpb) + 1;
        if needed > (self.max_len - 1) as usize {
            error!(
                "[JBD commit] tid={tid} needs {needed} log blocks, journal holds {}",
                self.max_len - 1
            );
            return Err(Ext3Error::NoSpace);
        }
        if st.head != 0 && st.head as usize + needed > self.max_len as usize {
            trace!("[JBD commit] log full at head={}, checkpointing", st.head);
            self.checkpoint_locked(st)?;
        }
        if st.head == 0 {
            st.head = st.sb.s_first;
            st.sb.s_start = st.sb.s_first;
            st.sb.s_sequence = tid;
            self.write_superblock(&st.sb)?;
        }

        for chunk in updates.chunks(tpd) {
            let mut desc = vec![0u8; bs];
            JournalHeader::new(JBD_DESCRIPTOR_BLOCK, tid).to_disk_bytes(&mut desc[0..12]);
            let mut off = JournalHeader::disk_size();
            for (idx, (blocknr, data)) in chunk.iter().enumerate() {
                let mut tag = JournalBlockTag {
                    t_blocknr: *blocknr,
                    t_flags: 0,
                };
                if read_be32(data, 0) == JBD_MAGIC {
                    tag.t_flags |= JBD_FLAG_ESCAPE;
                }
                if idx == chunk.len() - 1 {
                    tag.t_flags |= JBD_FLAG_LAST_TAG;
                }
                tag.to_disk_bytes(&mut desc[off..off + JournalBlockTag::disk_size()]);
                off += JournalBlockTag::disk_size();
            }
            let desc_block = self.next_log_block(st);
            trace!("[JBD commit] tid={tid} descriptor at block {desc_block}");
            self.cache.write_raw(desc_block, &desc)?;

            for (blocknr, data) in chunk.iter() {
                let log_block = self.next_log_block(st);
                trace!("[JBD commit] tid={tid} block {blocknr} -> log block {log_block}");
                if read_be32(data, 0) == JBD_MAGIC {
                    let mut escaped = data.clone();
                    escaped[0..4].fill(0);
                    self.cache.write_raw(log_block, &escaped)?;
                } else {
                    self.cache.write_raw(log_block, data)?;
                }
            }
        }

        for chunk in revokes.chunks(rpb) {
            let mut blk = vec![0u8; bs];
            let hdr = RevokeHeader {
                r_header: JournalHeader::new(JBD_REVOKE_BLOCK, tid),
                r_count: (RevokeHeader::disk_size() + chunk.len() * 4) as u32,
            };
            hdr.to_disk_bytes(&mut blk);
            for (i, blocknr) in chunk.iter().enumerate() {
                write_be32(&mut blk, RevokeHeader::disk_size() + i * 4, *blocknr);
            }
            let revoke_block = self.next_log_block(st);
            trace!(
                "[JBD commit] tid={tid} {} revoke records at block {revoke_block}",
                chunk.len()
            );
            self.cache.write_raw(revoke_block, &blk)?;
        }
        self.cache.flush_device()?;

        // 提交块落盘之后事务才算完整
        let mut commit = vec![0u8; bs];
        JournalHeader::new(JBD_COMMIT_BLOCK, tid).to_disk_bytes(&mut commit[0..12]);
        let commit_block = self.next_log_block(st);
        self.cache.write_raw(commit_block, &commit)?;
        self.cache.flush_device()?;

        for (blocknr, data) in updates {
            st.checkpoint.insert(blocknr, data);
        }
        for blocknr in revokes.iter() {
            st.checkpoint.remove(blocknr);
        }
        debug!(
            "[JBD commit] end: tid={tid} commit_block={commit_block} revokes={}",
            revokes.len()
        );
        Ok(())
    }

    fn checkpoint_locked(&self, st: &mut JournalState) -> Ext3Result<()> {
        if st.aborted {
            return Err(Ext3Error::Aborted);
        }
        for (blocknr, data) in st.checkpoint.iter() {
            self.cache.write_raw(*blocknr, data)?;
        }
        self.cache.flush_device()?;
        let written = st.checkpoint.len();
        st.checkpoint.clear();
        st.head = 0;
        st.sb.s_start = 0;
        st.sb.s_sequence = st.committed_tid.wrapping_add(1);
        self.write_superblock(&st.sb)?;
        debug!(
            "[JBD] checkpoint wrote {written} blocks, next sequence {}",
            st.sb.s_sequence
        );
        Ok(())
    }
}

impl Journal for LogJournal {
    fn start(&self, credits: u32) -> Ext3Result<Handle> {
        if credits > self.max_txn_credits {
            warn!(
                "[JBD] handle wants {credits} credits, max per transaction is {}",
                self.max_txn_credits
            );
            return Err(Ext3Error::NoSpace);
        }
        loop {
            let mut st = self.state.lock();
            if st.aborted {
                return Err(Ext3Error::Aborted);
            }
            let action = match st.running.as_mut() {
                None => StartAction::Create,
                Some(t)
                    if t.state == TxnState::Running
                        && t.reserved + credits <= self.max_txn_credits =>
                {
                    t.handles += 1;
                    t.reserved += credits;
                    StartAction::Joined(t.tid)
                }
                Some(t) => {
                    t.state = TxnState::Locked;
                    if t.handles == 0 {
                        StartAction::CommitNow
                    } else {
                        StartAction::Wait
                    }
                }
            };
            match action {
                StartAction::Create => {
                    let tid = st.next_tid;
                    st.next_tid = tid.wrapping_add(1);
                    let mut t = Transaction::new(tid);
                    t.handles = 1;
                    t.reserved = credits;
                    st.running = Some(t);
                    trace!("[JBD] tid={tid} started");
                    return Ok(Handle::new(tid, credits));
                }
                StartAction::Joined(tid) => return Ok(Handle::new(tid, credits)),
                StartAction::CommitNow => {
                    if let Some(t) = st.running.take() {
                        self.commit_locked(&mut st, t)?;
                    }
                }
                StartAction::Wait => {
                    drop(st);
                    core::hint::spin_loop();
                }
            }
        }
    }

    fn extend(&self, handle: &mut Handle, credits: u32) -> Ext3Result<bool> {
        let mut st = self.state.lock();
        if st.aborted {
            return Err(Ext3Error::Aborted);
        }
        match st.running.as_mut() {
            Some(t)
                if t.tid == handle.tid()
                    && t.state == TxnState::Running
                    && t.reserved + credits <= self.max_txn_credits =>
            {
                t.reserved += credits;
                handle.add_credits(credits);
                trace!("[JBD] tid={} extended by {credits}", t.tid);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn restart(&self, handle: &mut Handle, credits: u32) -> Ext3Result<()> {
        debug!("[JBD] restarting handle in tid={}", handle.tid());
        {
            let mut st = self.state.lock();
            if let Some(t) = st.running.as_mut()
                && t.tid == handle.tid()
            {
                t.state = TxnState::Locked;
            }
        }
        let sync = handle.is_sync();
        self.stop(Handle::new(handle.tid(), handle.credits()))?;
        let fresh = self.start(credits)?;
        handle.rebind(fresh.tid(), fresh.credits());
        if sync {
            handle.set_sync();
        }
        Ok(())
    }

    fn get_write_access(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()> {
        self.join_buffer(handle, bh)
    }

    fn get_create_access(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()> {
        self.join_buffer(handle, bh)?;
        bh.clear(BufferState::NEW);
        Ok(())
    }

    fn dirty_metadata(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()> {
        self.join_buffer(handle, bh)
    }

    fn forget(&self, handle: &mut Handle, bh: &BufferRef) -> Ext3Result<()> {
        let blocknr = bh.blocknr();
        {
            let mut st = self.state.lock();
            let t = Self::running_for(&mut st, handle)?;
            t.buffers.remove(&blocknr);
        }
        self.cache.forget(blocknr);
        Ok(())
    }

    fn revoke(
        &self,
        handle: &mut Handle,
        blocknr: u32,
        _bh: Option<&BufferRef>,
    ) -> Ext3Result<()> {
        {
            let mut st = self.state.lock();
            let t = Self::running_for(&mut st, handle)?;
            t.buffers.remove(&blocknr);
            t.revoked.insert(blocknr);
            trace!("[JBD] tid={} revoke block {blocknr}", t.tid);
        }
        self.cache.forget(blocknr);
        Ok(())
    }

    fn stop(&self, handle: Handle) -> Ext3Result<()> {
        let mut st = self.state.lock();
        let commit = match st.running.as_mut() {
            Some(t) if t.tid == handle.tid() => {
                t.handles = t.handles.saturating_sub(1);
                t.reserved = t.reserved.saturating_sub(handle.credits());
                if handle.is_sync() {
                    t.state = TxnState::Locked;
                }
                t.state == TxnState::Locked && t.handles == 0
            }
            _ => {
                warn!("[JBD] stop on handle of unknown tid={}", handle.tid());
                return Err(Ext3Error::InvalidArgument);
            }
        };
        if commit && let Some(t) = st.running.take() {
            self.commit_locked(&mut st, t)?;
        }
        if st.aborted {
            return Err(Ext3Error::Aborted);
        }
        Ok(())
    }

    fn force_commit(&self) -> Ext3Result<()> {
        let mut st = self.state.lock();
        let now = match st.running.as_mut() {
            Some(t) => {
                t.state = TxnState::Locked;
                t.handles == 0
            }
            None => false,
        };
        if now && let Some(t) = st.running.take() {
            self.commit_locked(&mut st, t)?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Ext3Result<()> {
        let mut st = self.state.lock();
        self.checkpoint_locked(&mut st)
    }

    fn is_locked(&self, handle: &Handle) -> bool {
        let st = self.state.lock();
        matches!(
            st.running.as_ref(),
            Some(t) if t.tid == handle.tid() && t.state == TxnState::Locked
        )
    }

    fn committed_tid(&self) -> u32 {
        self.state.lock().committed_tid
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}
