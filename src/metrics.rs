//! Lightweight global metrics for the paprika store.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - страницы: аллокации, переиспользование, CoW-копии, abandoned
//! - коммиты батчей и msync-диапазоны
//! - slotted-карты: компактации
//! - Merkle: мемо-попадания и пересчитанные узлы
//! - кэш merkle-записей батча
//! - blockchain: закоммиченные и сброшенные блоки
//!
//! Рендеринг метрик (HTTP и т.п.) вне скоупа; снимок сериализуется в JSON
//! на стороне CLI.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Pages -----
static PAGES_ALLOCATED: AtomicU64 = AtomicU64::new(0);
static PAGES_REUSED: AtomicU64 = AtomicU64::new(0);
static PAGES_ABANDONED: AtomicU64 = AtomicU64::new(0);
static COW_COPIES: AtomicU64 = AtomicU64::new(0);

// ----- Commits -----
static BATCH_COMMITS: AtomicU64 = AtomicU64::new(0);
static BATCH_PAGES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static FLUSH_RANGES: AtomicU64 = AtomicU64::new(0);

// ----- Slotted maps -----
static SLOTTED_COMPACTIONS: AtomicU64 = AtomicU64::new(0);

// ----- Merkle -----
static MERKLE_MEMO_HITS: AtomicU64 = AtomicU64::new(0);
static MERKLE_NODES_HASHED: AtomicU64 = AtomicU64::new(0);

// ----- Batch record cache -----
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static CACHE_MISSES: AtomicU64 = AtomicU64::new(0);

// ----- Blockchain -----
static BLOCKS_COMMITTED: AtomicU64 = AtomicU64::new(0);
static BLOCKS_FLUSHED: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn record_page_allocated() {
    PAGES_ALLOCATED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_page_reused() {
    PAGES_REUSED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_pages_abandoned(n: u64) {
    PAGES_ABANDONED.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub fn record_cow_copy() {
    COW_COPIES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_batch_commit(pages_written: u64) {
    BATCH_COMMITS.fetch_add(1, Ordering::Relaxed);
    BATCH_PAGES_WRITTEN.fetch_add(pages_written, Ordering::Relaxed);
}

#[inline]
pub fn record_flush_range() {
    FLUSH_RANGES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_slotted_compaction() {
    SLOTTED_COMPACTIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_merkle_memo_hit() {
    MERKLE_MEMO_HITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_merkle_node_hashed() {
    MERKLE_NODES_HASHED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_cache_hit() {
    CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_cache_miss() {
    CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_block_committed() {
    BLOCKS_COMMITTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_blocks_flushed(n: u64) {
    BLOCKS_FLUSHED.fetch_add(n, Ordering::Relaxed);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub pages_allocated: u64,
    pub pages_reused: u64,
    pub pages_abandoned: u64,
    pub cow_copies: u64,

    pub batch_commits: u64,
    pub batch_pages_written: u64,
    pub flush_ranges: u64,

    pub slotted_compactions: u64,

    pub merkle_memo_hits: u64,
    pub merkle_nodes_hashed: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,

    pub blocks_committed: u64,
    pub blocks_flushed: u64,
}

/// Снять текущий снимок всех счётчиков.
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        pages_allocated: PAGES_ALLOCATED.load(Ordering::Relaxed),
        pages_reused: PAGES_REUSED.load(Ordering::Relaxed),
        pages_abandoned: PAGES_ABANDONED.load(Ordering::Relaxed),
        cow_copies: COW_COPIES.load(Ordering::Relaxed),
        batch_commits: BATCH_COMMITS.load(Ordering::Relaxed),
        batch_pages_written: BATCH_PAGES_WRITTEN.load(Ordering::Relaxed),
        flush_ranges: FLUSH_RANGES.load(Ordering::Relaxed),
        slotted_compactions: SLOTTED_COMPACTIONS.load(Ordering::Relaxed),
        merkle_memo_hits: MERKLE_MEMO_HITS.load(Ordering::Relaxed),
        merkle_nodes_hashed: MERKLE_NODES_HASHED.load(Ordering::Relaxed),
        cache_hits: CACHE_HITS.load(Ordering::Relaxed),
        cache_misses: CACHE_MISSES.load(Ordering::Relaxed),
        blocks_committed: BLOCKS_COMMITTED.load(Ordering::Relaxed),
        blocks_flushed: BLOCKS_FLUSHED.load(Ordering::Relaxed),
    }
}
