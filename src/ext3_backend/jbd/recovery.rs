//! 挂载时的日志恢复
//!
//! 三遍扫描：
//! 1. SCAN：从 s_start 开始按序列号读取，只收集以提交块结尾的完整事务；
//! 2. REVOKE：建立 块号 -> 最大撤销事务号 的撤销表；
//! 3. REPLAY：把未被撤销的日志副本写回原位置。

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, info, trace, warn};

use crate::ext3_backend::bcache::BufferCache;
use crate::ext3_backend::endian::*;
use crate::ext3_backend::error::*;
use crate::ext3_backend::jbd::jbdstruct::*;

/// 恢复结果统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryInfo {
    /// 重放的完整事务数
    pub transactions: u32,
    pub replayed_blocks: u32,
    /// 因撤销记录而跳过的日志副本数
    pub revoked_blocks: u32,
    /// 恢复后下一个事务号
    pub end_sequence: u32,
}

impl RecoveryInfo {
    pub fn clean(sequence: u32) -> Self {
        Self {
            end_sequence: sequence,
            ..Default::default()
        }
    }
}

struct LoggedBlock {
    target: u32,
    /// 日志区内的相对块号
    log_rel: u32,
    flags: u32,
}

#[derive(Default)]
struct ScannedTxn {
    tid: u32,
    blocks: Vec<LoggedBlock>,
    revokes: Vec<u32>,
}

fn scan(
    cache: &dyn BufferCache,
    start_block: u32,
    sb: &JournalSuperblock,
) -> Ext3Result<(Vec<ScannedTxn>, u32)> {
    let bs = cache.block_size();
    let mut buf = vec![0u8; bs];
    let mut cur_rel = sb.s_start;
    let mut expect_seq = sb.s_sequence;
    let mut pending = ScannedTxn {
        tid: expect_seq,
        ..Default::default()
    };
    let mut done = Vec::new();

    while cur_rel < sb.s_maxlen {
        cache.read_raw(start_block + cur_rel, &mut buf)?;
        let hdr = JournalHeader::from_disk_bytes(&buf[0..12]);
        trace!(
            "[JBD recovery] scan rel_block={} magic=0x{:x} type={} seq={} expect_seq={}",
            cur_rel, hdr.h_magic, hdr.h_blocktype, hdr.h_sequence, expect_seq
        );
        if !hdr.is_valid() || hdr.h_sequence != expect_seq {
            break;
        }
        match hdr.h_blocktype {
            JBD_DESCRIPTOR_BLOCK => {
                let mut off = JournalHeader::disk_size();
                while off + JournalBlockTag::disk_size() <= bs {
                    let tag = JournalBlockTag::from_disk_bytes(&buf[off..]);
                    off += JournalBlockTag::disk_size();
                    cur_rel += 1;
                    pending.blocks.push(LoggedBlock {
                        target: tag.t_blocknr,
                        log_rel: cur_rel,
                        flags: tag.t_flags,
                    });
                    if tag.t_flags & JBD_FLAG_LAST_TAG != 0 {
                        break;
                    }
                }
            }
            JBD_REVOKE_BLOCK => {
                let rh = RevokeHeader::from_disk_bytes(&buf);
                let end = (rh.r_count as usize).min(bs);
                let mut off = RevokeHeader::disk_size();
                while off + 4 <= end {
                    pending.revokes.push(read_be32(&buf, off));
                    off += 4;
                }
            }
            JBD_COMMIT_BLOCK => {
                trace!(
                    "[JBD recovery] tid={} complete: {} blocks, {} revokes",
                    expect_seq,
                    pending.blocks.len(),
                    pending.revokes.len()
                );
                expect_seq = expect_seq.wrapping_add(1);
                let next = ScannedTxn {
                    tid: expect_seq,
                    ..Default::default()
                };
                done.push(core::mem::replace(&mut pending, next));
            }
            other => {
                warn!("[JBD recovery] unexpected block type {other} at rel_block {cur_rel}");
                break;
            }
        }
        cur_rel += 1;
    }

    if !pending.blocks.is_empty() || !pending.revokes.is_empty() {
        debug!(
            "[JBD recovery] dropping incomplete tid={} ({} blocks)",
            pending.tid,
            pending.blocks.len()
        );
    }
    Ok((done, expect_seq))
}

/// 重放日志并把日志超级块标记为干净
pub fn recover(
    cache: &dyn BufferCache,
    start_block: u32,
    sb: &mut JournalSuperblock,
) -> Ext3Result<RecoveryInfo> {
    info!(
        "[JBD recovery] begin: s_start={} s_sequence={}",
        sb.s_start, sb.s_sequence
    );

    // PASS_SCAN
    let (txns, end_sequence) = scan(cache, start_block, sb)?;

    // PASS_REVOKE
    let mut revoke_table: BTreeMap<u32, u32> = BTreeMap::new();
    for txn in txns.iter() {
        for blocknr in txn.revokes.iter() {
            let e = revoke_table.entry(*blocknr).or_insert(txn.tid);
            if *e < txn.tid {
                *e = txn.tid;
            }
        }
    }

    // PASS_REPLAY
    let mut info = RecoveryInfo {
        transactions: txns.len() as u32,
        end_sequence,
        ..Default::default()
    };
    let mut data = vec![0u8; cache.block_size()];
    for txn in txns.iter() {
        for lb in txn.blocks.iter() {
            if let Some(revoked_tid) = revoke_table.get(&lb.target)
                && *revoked_tid >= txn.tid
            {
                trace!(
                    "[JBD recovery] tid={} block {} revoked by tid={}",
                    txn.tid, lb.target, revoked_tid
                );
                info.revoked_blocks += 1;
                continue;
            }
            cache.read_raw(start_block + lb.log_rel, &mut data)?;
            if lb.flags & JBD_FLAG_ESCAPE != 0 {
                write_be32(&mut data, 0, JBD_MAGIC);
            }
            trace!(
                "[JBD recovery] tid={} replay rel_block={} -> block {}",
                txn.tid, lb.log_rel, lb.target
            );
            cache.write_raw(lb.target, &data)?;
            info.replayed_blocks += 1;
        }
    }
    cache.flush_device()?;

    sb.s_start = 0;
    sb.s_sequence = end_sequence;
    let mut buf = vec![0u8; cache.block_size()];
    sb.to_disk_bytes(&mut buf);
    cache.write_raw(start_block, &buf)?;
    cache.flush_device()?;

    info!(
        "[JBD recovery] done: {} transactions, {} blocks replayed, {} revoked, next sequence {}",
        info.transactions, info.replayed_blocks, info.revoked_blocks, end_sequence
    );
    Ok(info)
}
