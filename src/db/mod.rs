//! db — PagedDb: кольцо корней, одиночный writer, RO-снапшоты.
//!
//! Арена: первые history_depth страниц — кольцо корневых страниц; слот
//! корня батча N — N mod history_depth. Текущий корень — самый свежий
//! валидный (максимальный batch_id при сходящемся crc32c): crash между
//! msync данных и корня автоматически откатывает к предыдущему
//! долговечному корню.
//!
//! Параллелизм: не более одного активного write-батча (ConcurrentWriter),
//! любое число RO-батчей. Живые читатели опускают min_reusable_batch_id,
//! чтобы их снапшоты не увидели переиспользование страниц.

pub mod batch;
pub mod read;

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::PaprikaConfig;
use crate::consts::*;
use crate::data::Keccak;
use crate::error::StoreError;
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::page::root::RootPage;
use crate::page::{DbAddress, Page};
use crate::pager::PageManager;

pub use crate::pager::CommitOptions;
pub use batch::Batch;
pub use read::{ArenaSource, PageSource, PageView, ReadOnlyBatch};

pub(crate) struct DbInner {
    pub(crate) pm: RwLock<PageManager>,
    pub(crate) cfg: PaprikaConfig,
    pub(crate) history_depth: u32,
    writer_active: AtomicBool,
    // reader_id -> batch_id корня, который держит читатель
    readers: Mutex<HashMap<u64, u32>>,
    next_reader_id: AtomicU64,
    // копия самой свежей корневой страницы
    current: Mutex<Page>,
    _lock: Option<LockGuard>,
}

impl DbInner {
    pub(crate) fn lock_pm(&self) -> Result<std::sync::RwLockReadGuard<'_, PageManager>> {
        self.pm.read().map_err(|_| anyhow!("page manager lock poisoned"))
    }

    pub(crate) fn lock_pm_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, PageManager>> {
        self.pm.write().map_err(|_| anyhow!("page manager lock poisoned"))
    }

    pub(crate) fn current_root(&self) -> Result<RootPage> {
        let guard = self.current.lock().map_err(|_| anyhow!("current root lock poisoned"))?;
        Ok(RootPage::wrap(guard.clone()))
    }

    pub(crate) fn set_current_root(&self, page: Page) -> Result<()> {
        let mut guard = self.current.lock().map_err(|_| anyhow!("current root lock poisoned"))?;
        *guard = page;
        Ok(())
    }

    /// Копия произвольной страницы арены (для CoW write-батча).
    pub(crate) fn read_page_copy(&self, addr: DbAddress) -> Result<Page> {
        let pm = self.lock_pm()?;
        Page::from_bytes(pm.page(addr)?)
    }

    pub(crate) fn register_reader(&self, root_batch_id: u32) -> Result<u64> {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.readers
            .lock()
            .map_err(|_| anyhow!("readers lock poisoned"))?
            .insert(id, root_batch_id);
        Ok(id)
    }

    pub(crate) fn unregister_reader(&self, id: u64) {
        if let Ok(mut readers) = self.readers.lock() {
            readers.remove(&id);
        }
    }

    fn oldest_reader(&self) -> Result<Option<u32>> {
        let readers = self.readers.lock().map_err(|_| anyhow!("readers lock poisoned"))?;
        Ok(readers.values().copied().min())
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }
}

pub struct PagedDb {
    pub(crate) inner: Arc<DbInner>,
}

/// Поиск самого свежего валидного корня в кольце.
fn load_current_root(pm: &PageManager) -> Result<RootPage> {
    let scan = MAX_HISTORY_DEPTH.min(pm.max_page());
    let mut best: Option<RootPage> = None;
    for i in 0..scan {
        let raw = pm.page(DbAddress::new(i))?;
        if raw[OFF_TYPE] != PAGE_TYPE_ROOT {
            continue;
        }
        let candidate = RootPage::wrap(Page::from_bytes(raw)?);
        if !candidate.crc_valid() {
            log::warn!("root ring slot {} has an invalid checksum, skipping", i);
            continue;
        }
        let newer = match &best {
            None => true,
            Some(b) => candidate.batch_id() > b.batch_id(),
        };
        if newer {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| anyhow!("no valid root page found in the ring"))
}

impl PagedDb {
    /// Арена в анонимной памяти (тесты, бенчи, эфемерные прогоны).
    pub fn in_memory(cfg: PaprikaConfig) -> Result<PagedDb> {
        let cfg = cfg.normalize();
        let mut pm = PageManager::anon(cfg.arena_bytes as usize)?;
        let root = RootPage::new_initial(cfg.history_depth);
        pm.write_page(DbAddress::new(0), root.page().as_bytes())?;
        Self::finish_open(pm, cfg, None)
    }

    /// Открыть или создать файловую арену. Процесс держит эксклюзивный
    /// lock на всё время жизни PagedDb (мультипроцессный доступ вне скоупа).
    pub fn open(path: &Path, cfg: PaprikaConfig) -> Result<PagedDb> {
        let cfg = cfg.normalize();
        let lock = try_acquire_exclusive_lock(path)
            .with_context(|| format!("paprika arena {} is already in use", path.display()))?;
        let (mut pm, created) = PageManager::open_file(path, cfg.arena_bytes)?;
        if created {
            let root = RootPage::new_initial(cfg.history_depth);
            pm.write_root_page(DbAddress::new(0), root.page().as_bytes(), true)?;
            log::info!(
                "initialized arena {} ({} pages, history depth {})",
                path.display(),
                pm.max_page(),
                cfg.history_depth
            );
        }
        Self::finish_open(pm, cfg, Some(lock))
    }

    fn finish_open(pm: PageManager, mut cfg: PaprikaConfig, lock: Option<LockGuard>) -> Result<PagedDb> {
        let current = load_current_root(&pm)?;
        let history_depth = current.history_depth();
        if !(MIN_HISTORY_DEPTH..=MAX_HISTORY_DEPTH).contains(&history_depth) {
            return Err(anyhow!("arena reports invalid history depth {}", history_depth));
        }
        cfg.history_depth = history_depth;
        let inner = DbInner {
            pm: RwLock::new(pm),
            cfg,
            history_depth,
            writer_active: AtomicBool::new(false),
            readers: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(1),
            current: Mutex::new(current.into_page()),
            _lock: lock,
        };
        Ok(PagedDb { inner: Arc::new(inner) })
    }

    pub fn history_depth(&self) -> u32 {
        self.inner.history_depth
    }

    pub fn state_root(&self) -> Result<Keccak> {
        Ok(self.inner.current_root()?.state_root())
    }

    pub fn block_number(&self) -> Result<u32> {
        Ok(self.inner.current_root()?.block_number())
    }

    pub fn batch_id(&self) -> Result<u32> {
        Ok(self.inner.current_root()?.batch_id())
    }

    /// Явный fsync арены.
    pub fn flush(&self) -> Result<()> {
        self.inner.lock_pm()?.flush()
    }

    /// Начать батч записи от самого свежего корня.
    pub fn begin_batch(&self) -> Result<Batch> {
        self.begin_batch_from(None)
    }

    /// Начать батч от исторического корня с данным state root.
    /// Батчи свежее него становятся недостижимыми после коммита.
    pub fn reorganize_back_to(&self, state_root: &Keccak) -> Result<Batch> {
        self.begin_batch_from(Some(*state_root))
    }

    fn begin_batch_from(&self, reorg_target: Option<Keccak>) -> Result<Batch> {
        let inner = &self.inner;
        if inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::ConcurrentWriter.into());
        }

        let result = (|| {
            let newest = inner.current_root()?;
            let batch_id = newest
                .batch_id()
                .checked_add(1)
                .ok_or_else(|| anyhow!("batch id overflow"))?;

            let mut root = match reorg_target {
                None => RootPage::wrap(newest.page().clone()),
                Some(target) => {
                    let found = self.find_root_by_state_root(&target)?;
                    let mut root = found.ok_or(StoreError::SnapshotMissing)?;
                    // пространство батчей, отрезанных реоргом, не возвращаем
                    // сразу: их страницы утекают и дозревают вне окна истории
                    root.set_next_free_page(root.next_free_page().max(newest.next_free_page()));
                    log::info!(
                        "reorganizing back to block {} (state root {:x})",
                        root.block_number(),
                        target
                    );
                    root
                }
            };
            root.set_batch_id(batch_id);

            let min_reusable = {
                let window = batch_id.saturating_sub(inner.history_depth);
                match inner.oldest_reader()? {
                    Some(r) => window.min(r),
                    None => window,
                }
            };

            let pool = self.harvest_reusable(&mut root, min_reusable)?;
            Ok(Batch::new_internal(Arc::clone(inner), batch_id, root, pool))
        })();

        if result.is_err() {
            inner.release_writer();
        }
        result
    }

    fn find_root_by_state_root(&self, target: &Keccak) -> Result<Option<RootPage>> {
        let pm = self.inner.lock_pm()?;
        let scan = self.inner.history_depth.min(pm.max_page());
        for i in 0..scan {
            let raw = pm.page(DbAddress::new(i))?;
            if raw[OFF_TYPE] != PAGE_TYPE_ROOT {
                continue;
            }
            let candidate = RootPage::wrap(Page::from_bytes(raw)?);
            if candidate.crc_valid() && candidate.state_root() == *target {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Собрать пул переиспользования из цепочек, вышедших из карантина.
    /// Кандидаты упорядочены по (abandoned_at, адрес головы) — детерминизм
    /// разрешения возрастных ничьих.
    fn harvest_reusable(
        &self,
        root: &mut RootPage,
        min_reusable: u32,
    ) -> Result<std::collections::VecDeque<DbAddress>> {
        use crate::page::abandoned;

        let mut pool = std::collections::VecDeque::new();
        let pm = self.inner.lock_pm()?;

        let mut candidates: Vec<(u32, u32, usize)> = Vec::new();
        for slot in 0..ROOT_ABANDONED_SLOTS {
            let head = root.abandoned_slot(slot);
            if head.is_null() {
                continue;
            }
            let raw = pm.page(head)?;
            let at = abandoned::abandoned_at(raw);
            if at < min_reusable {
                candidates.push((at, head.raw(), slot));
            }
        }
        candidates.sort_unstable();

        for (_, head_raw, slot) in candidates {
            let mut cursor = DbAddress::new(head_raw);
            while !cursor.is_null() {
                let raw = pm.page(cursor)?;
                if raw[OFF_TYPE] != PAGE_TYPE_ABANDONED {
                    return Err(anyhow!(
                        "abandoned chain at {} points to a page of type {}",
                        cursor,
                        raw[OFF_TYPE]
                    ));
                }
                for entry in abandoned::entries(raw) {
                    pool.push_back(entry);
                }
                // сама страница цепочки тоже возвращается в оборот
                let next = abandoned::next_page(raw);
                pool.push_back(cursor);
                cursor = next;
            }
            root.set_abandoned_slot(slot, DbAddress::NULL);
        }
        Ok(pool)
    }

    /// RO-батч: стабильный снапшот самого свежего корня.
    pub fn begin_read_only_batch(&self, name: &str) -> Result<ReadOnlyBatch> {
        let root = self.inner.current_root()?;
        let reader_id = self.inner.register_reader(root.batch_id())?;
        Ok(ReadOnlyBatch::new_internal(Arc::clone(&self.inner), root, reader_id, name.to_string()))
    }

    /// Прогрев: подсказать ОС страницы, достижимые из текущего корня.
    pub fn prefetch(&self, addrs: &[DbAddress]) -> Result<()> {
        let pm = self.inner.lock_pm()?;
        pm.prefetch(addrs);
        Ok(())
    }

    /// Статистика по живому графу страниц текущего корня.
    pub fn stats(&self) -> Result<crate::stats::DbStats> {
        let root = self.inner.current_root()?;
        let pm = self.inner.lock_pm()?;
        crate::stats::collect_stats(&*pm, &root)
    }
}
