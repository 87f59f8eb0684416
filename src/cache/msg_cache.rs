//! The message cache: a lock-striped map from question tuple to cached reply,
//! with per-stripe LRU lists and a total byte cap.
//!
//! Unlike the RRset cache there is no admission policy: a newer reply for the
//! same question simply overwrites. Eviction drops the reply-info only; the
//! record sets it references are shared with the RRset cache and live on.
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::reply::{QueryInfo, ReplyInfo};

/// A cached reply behind its per-entry lock, keyed by the question it
/// answers.
pub struct MsgEntry {
    pub qinfo: QueryInfo,
    /// Canonical query hash, precomputed for shard selection
    pub hash: u64,
    reply: RwLock<ReplyInfo>,
}

impl MsgEntry {
    pub fn reply(&self) -> RwLockReadGuard<'_, ReplyInfo> {
        self.reply.read()
    }

    fn sizeof(&self) -> usize {
        self.qinfo.sizeof() + self.reply.read().sizeof()
    }
}

struct Shard {
    lru: LruCache<QueryInfo, Arc<MsgEntry>>,
    bytes: usize,
}

impl Shard {
    fn evict_over(&mut self, max_bytes: usize) {
        while self.bytes > max_bytes {
            match self.lru.pop_lru() {
                Some((_, e)) => self.bytes = self.bytes.saturating_sub(e.sizeof()),
                None => break,
            }
        }
    }
}

pub struct MsgCache {
    shards: Box<[Mutex<Shard>]>,
    shard_mask: u64,
    shard_bytes_max: usize,
}

impl MsgCache {
    pub fn new(total_bytes: usize, stripes: usize) -> Self {
        let n = stripes.max(1).next_power_of_two();
        let shards = (0..n)
            .map(|_| {
                Mutex::new(Shard {
                    lru: LruCache::unbounded(),
                    bytes: 0,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        MsgCache {
            shards,
            shard_mask: (n - 1) as u64,
            shard_bytes_max: total_bytes / n,
        }
    }

    fn shard_for(&self, hash: u64) -> &Mutex<Shard> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Store a reply under its precomputed query hash, overwriting any
    /// previous reply for the same question.
    pub fn insert(&self, qinfo: QueryInfo, hash: u64, rep: ReplyInfo) {
        let e = Arc::new(MsgEntry {
            qinfo: qinfo.clone(),
            hash,
            reply: RwLock::new(rep),
        });
        let size = e.sizeof();
        let mut shard = self.shard_for(hash).lock();
        if let Some(old) = shard.lru.put(qinfo, e) {
            shard.bytes = shard.bytes.saturating_sub(old.sizeof());
        }
        shard.bytes += size;
        shard.evict_over(self.shard_bytes_max);
    }

    /// Probe for a cached reply; a hit warms the LRU. Freshness and reference
    /// validity are the reader's problem, under the entry lock.
    pub fn lookup(&self, qinfo: &QueryInfo, hash: u64) -> Option<Arc<MsgEntry>> {
        self.shard_for(hash).lock().lru.get(qinfo).cloned()
    }

    /// Number of cached replies, across all shards.
    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().lru.len()).sum()
    }
}
