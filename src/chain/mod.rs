//! chain — конвейер блоков поверх PagedDb.
//!
//! Block — мутируемый in-memory оверлей мира поверх последнего сброшенного
//! снапшота и ещё не сброшенных блоков-предков. commit(n) вычисляет корень
//! состояния в памяти (merkle-слой пишет узловые записи прямо в write-set
//! блока) и ставит блок в очередь. finalize(hash) помечает цепочку
//! канонической; единственный фоновый flusher сливает финализированные
//! блоки старше reorg-окна в батчи PagedDb, коалесцируя несколько блоков
//! в один батч.
//!
//! Один producer-барьер: start_new блокируется, когда очередь
//! незаписанных блоков достигает max_pending_blocks (backpressure).
//! "Событие flushed" — водяной знак flushed_watermark / wait_flushed.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::config::PaprikaConfig;
use crate::data::{u256_from_trimmed_be, u256_to_trimmed_be, Account, Keccak, U256};
use crate::db::{CommitOptions, PagedDb, ReadOnlyBatch};
use crate::key;
use crate::merkle::{self, Touched, TrieStore};
use crate::metrics::{record_block_committed, record_blocks_flushed};

/// Запечатанный блок: корень, родитель и полный write-set (включая
/// merkle-записи, вычисленные на commit).
pub struct BlockData {
    pub number: u32,
    pub parent_root: Keccak,
    pub root: Keccak,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared: HashSet<Keccak>,
}

struct ChainState {
    by_root: HashMap<Keccak, Arc<BlockData>>,
    /// финализированные, не сброшенные блоки, старшие первыми
    canonical: VecDeque<Arc<BlockData>>,
    pending_count: usize,
    finalized_number: u32,
    flushed_number: u32,
    flushed_root: Keccak,
    shutdown: bool,
    failed: bool,
}

struct ChainShared {
    db: PagedDb,
    cfg: PaprikaConfig,
    state: Mutex<ChainState>,
    work: Condvar,
    room: Condvar,
    flushed: Condvar,
}

impl ChainShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, ChainState>> {
        self.state.lock().map_err(|_| anyhow!("blockchain state lock poisoned"))
    }
}

pub struct Blockchain {
    shared: Arc<ChainShared>,
    flusher: Option<JoinHandle<()>>,
}

impl Blockchain {
    pub fn new(db: PagedDb, cfg: PaprikaConfig) -> Result<Blockchain> {
        let cfg = cfg.normalize();
        let flushed_root = db.state_root()?;
        let flushed_number = db.block_number()?;
        let shared = Arc::new(ChainShared {
            db,
            cfg,
            state: Mutex::new(ChainState {
                by_root: HashMap::new(),
                canonical: VecDeque::new(),
                pending_count: 0,
                finalized_number: flushed_number,
                flushed_number,
                flushed_root,
                shutdown: false,
                failed: false,
            }),
            work: Condvar::new(),
            room: Condvar::new(),
            flushed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let flusher = std::thread::Builder::new()
            .name("paprika-flusher".to_string())
            .spawn(move || flusher_loop(worker))?;
        Ok(Blockchain { shared, flusher: Some(flusher) })
    }

    pub fn db(&self) -> &PagedDb {
        &self.shared.db
    }

    /// Новый блок поверх указанного родителя. Блокируется (backpressure),
    /// пока очередь незаписанных блоков заполнена.
    pub fn start_new(&self, parent_root: &Keccak) -> Result<Block> {
        let ancestors = {
            let mut st = self.shared.lock_state()?;
            while st.pending_count >= self.shared.cfg.max_pending_blocks
                && !st.shutdown
                && !st.failed
            {
                st = self
                    .shared
                    .room
                    .wait(st)
                    .map_err(|_| anyhow!("blockchain state lock poisoned"))?;
            }
            if st.shutdown {
                return Err(anyhow!("blockchain is shutting down"));
            }
            if st.failed {
                return Err(anyhow!("background flusher failed; writes are disabled"));
            }
            let mut ancestors = Vec::new();
            let mut cursor = *parent_root;
            while cursor != st.flushed_root {
                match st.by_root.get(&cursor) {
                    Some(block) => {
                        cursor = block.parent_root;
                        ancestors.push(Arc::clone(block));
                    }
                    None => {
                        return Err(anyhow!(
                            "unknown parent block (state root {:x})",
                            parent_root
                        ))
                    }
                }
            }
            ancestors
        };
        let base = self.shared.db.begin_read_only_batch("block-base")?;
        Ok(Block {
            shared: Arc::clone(&self.shared),
            parent_root: *parent_root,
            ancestors,
            base,
            writes: BTreeMap::new(),
            cleared: HashSet::new(),
            touched: Touched::default(),
        })
    }

    /// Пометить блок каноническим. Его предки финализируются вместе с ним.
    pub fn finalize(&self, root: &Keccak) -> Result<()> {
        let mut st = self.shared.lock_state()?;
        let target = st
            .by_root
            .get(root)
            .cloned()
            .ok_or_else(|| anyhow!("finalize: unknown block (state root {:x})", root))?;

        // дособрать канонический хвост от target вниз до уже известного
        let mut fresh: Vec<Arc<BlockData>> = Vec::new();
        let mut cursor = Arc::clone(&target);
        loop {
            let already = cursor.root == st.flushed_root
                || st.canonical.iter().any(|b| b.root == cursor.root);
            if already {
                break;
            }
            fresh.push(Arc::clone(&cursor));
            if cursor.parent_root == st.flushed_root {
                break;
            }
            cursor = st
                .by_root
                .get(&cursor.parent_root)
                .cloned()
                .ok_or_else(|| anyhow!("finalize: broken parent chain"))?;
        }
        for block in fresh.into_iter().rev() {
            st.canonical.push_back(block);
        }
        st.finalized_number = st.finalized_number.max(target.number);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Водяной знак записи: (номер, корень) последнего сброшенного блока.
    pub fn flushed_watermark(&self) -> Result<(u32, Keccak)> {
        let st = self.shared.lock_state()?;
        Ok((st.flushed_number, st.flushed_root))
    }

    /// Дождаться, пока flusher запишет блок с данным номером.
    pub fn wait_flushed(&self, number: u32) -> Result<()> {
        let mut st = self.shared.lock_state()?;
        while st.flushed_number < number && !st.failed && !st.shutdown {
            st = self
                .shared
                .flushed
                .wait(st)
                .map_err(|_| anyhow!("blockchain state lock poisoned"))?;
        }
        if st.flushed_number >= number {
            Ok(())
        } else {
            Err(anyhow!("flusher stopped before reaching block {}", number))
        }
    }
}

impl Drop for Blockchain {
    fn drop(&mut self) {
        if let Ok(mut st) = self.shared.state.lock() {
            st.shutdown = true;
        }
        self.shared.work.notify_all();
        self.shared.room.notify_all();
        self.shared.flushed.notify_all();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
    }
}

/// Цикл фонового flusher'а: забирает созревшие канонические блоки и
/// сливает их одним батчем PagedDb.
fn flusher_loop(shared: Arc<ChainShared>) {
    loop {
        let blocks: Vec<Arc<BlockData>> = {
            let mut st = match shared.lock_state() {
                Ok(g) => g,
                Err(_) => return,
            };
            loop {
                if st.shutdown {
                    return;
                }
                let ripe = st
                    .canonical
                    .front()
                    .map(|b| b.number + shared.cfg.reorg_window <= st.finalized_number)
                    .unwrap_or(false);
                if ripe {
                    break;
                }
                st = match shared.work.wait(st) {
                    Ok(g) => g,
                    Err(_) => return,
                };
            }
            let mut out = Vec::new();
            while let Some(front) = st.canonical.front() {
                if front.number + shared.cfg.reorg_window <= st.finalized_number {
                    out.push(st.canonical.pop_front().unwrap());
                } else {
                    break;
                }
            }
            out
        };

        if blocks.is_empty() {
            continue;
        }

        match flush_blocks(&shared, &blocks) {
            Ok(()) => {
                let last = blocks.last().unwrap();
                if let Ok(mut st) = shared.lock_state() {
                    st.flushed_number = last.number;
                    st.flushed_root = last.root;
                    let before = st.by_root.len();
                    let watermark = st.flushed_number;
                    st.by_root.retain(|_, b| b.number > watermark);
                    let removed = before - st.by_root.len();
                    st.pending_count = st.pending_count.saturating_sub(removed);
                }
                record_blocks_flushed(blocks.len() as u64);
                shared.flushed.notify_all();
                shared.room.notify_all();
            }
            Err(e) => {
                log::error!("flusher failed, stopping writes: {:#}", e);
                if let Ok(mut st) = shared.lock_state() {
                    st.failed = true;
                }
                shared.flushed.notify_all();
                shared.room.notify_all();
                return;
            }
        }
    }
}

fn flush_blocks(shared: &ChainShared, blocks: &[Arc<BlockData>]) -> Result<()> {
    let mut batch = shared.db.begin_batch()?;
    for block in blocks {
        for account in &block.cleared {
            batch.clear_storage_raw(account)?;
        }
        for (k, v) in &block.writes {
            batch.apply_raw(k, v.as_deref())?;
        }
    }
    let last = blocks.last().unwrap();
    batch.set_block_number(last.number);
    let committed = batch.commit_prehashed(last.root, CommitOptions::FlushDataThenRoot)?;
    log::info!(
        "flushed {} block(s) up to #{} (root {:x})",
        blocks.len(),
        last.number,
        committed
    );
    Ok(())
}

// ---------------- Block ----------------

/// Ключи, теневым образом гасящиеся очисткой storage аккаунта:
/// [2]a... (ячейки), [4]a (корень storage-трие), [5]a... (узлы).
fn cleared_covers(key: &[u8], cleared: &HashSet<Keccak>) -> bool {
    if cleared.is_empty() || key.len() < 65 {
        return false;
    }
    if !matches!(key[0], 2 | 4 | 5) {
        return false;
    }
    cleared.contains(&key::keccak_from_nibbles(&key[1..65]))
}

pub struct Block {
    shared: Arc<ChainShared>,
    parent_root: Keccak,
    /// незаписанные предки, новейший первым
    ancestors: Vec<Arc<BlockData>>,
    base: ReadOnlyBatch,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared: HashSet<Keccak>,
    touched: Touched,
}

impl Block {
    pub fn parent_root(&self) -> Keccak {
        self.parent_root
    }

    fn lookup_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.writes.get(key) {
            return Ok(v.clone());
        }
        if cleared_covers(key, &self.cleared) {
            return Ok(None);
        }
        for ancestor in &self.ancestors {
            if let Some(v) = ancestor.writes.get(key) {
                return Ok(v.clone());
            }
            if cleared_covers(key, &ancestor.cleared) {
                return Ok(None);
            }
        }
        self.base.get_raw(key)
    }

    pub fn get_account(&self, account: &Keccak) -> Result<Account> {
        match self.lookup_raw(&key::account_key(account))? {
            Some(raw) => Account::read_from(&raw),
            None => Ok(Account::EMPTY),
        }
    }

    pub fn set_account(&mut self, account: &Keccak, value: &Account) -> Result<()> {
        if value.is_empty() {
            return self.delete_account(account);
        }
        self.writes.insert(key::account_key(account), Some(value.encode()));
        self.touched.accounts.insert(*account);
        Ok(())
    }

    pub fn delete_account(&mut self, account: &Keccak) -> Result<()> {
        self.clear_storage(account)?;
        self.writes.insert(key::account_key(account), None);
        self.touched.accounts.insert(*account);
        Ok(())
    }

    /// Стереть storage аккаунта в пределах оверлея блока.
    pub fn clear_storage(&mut self, account: &Keccak) -> Result<()> {
        // записи до очистки перекрываются ей и выбрасываются
        let acc = *account;
        self.writes.retain(|k, _| !cleared_covers(k, &HashSet::from([acc])));
        self.cleared.insert(acc);
        self.touched.cleared_storage.insert(acc);
        self.touched.storage.remove(&acc);
        Ok(())
    }

    pub fn get_storage(&self, account: &Keccak, slot: &Keccak) -> Result<U256> {
        match self.lookup_raw(&key::storage_cell_key(account, slot))? {
            Some(raw) => u256_from_trimmed_be(&raw),
            None => Ok(U256::zero()),
        }
    }

    /// Пустое (нулевое) значение удаляет ячейку.
    pub fn set_storage(&mut self, account: &Keccak, slot: &Keccak, value: &U256) -> Result<()> {
        let cell = key::storage_cell_key(account, slot);
        if value.is_zero() {
            self.writes.insert(cell, None);
        } else {
            self.writes.insert(cell, Some(u256_to_trimmed_be(value)));
        }
        self.touched.storage.entry(*account).or_default().insert(*slot);
        Ok(())
    }

    /// Visitor-контракт импортёра: порядок визитов роли не играет.
    pub fn visit_leaf_account(&mut self, account: &Keccak, value: &Account) -> Result<()> {
        self.set_account(account, value)
    }

    pub fn visit_leaf_storage(
        &mut self,
        account: &Keccak,
        slot: &Keccak,
        value: &U256,
    ) -> Result<()> {
        self.set_storage(account, slot, value)
    }

    /// Запечатать блок: вычислить корень состояния, поставить в очередь
    /// на финализацию/сброс. Возвращает корень.
    pub fn commit(mut self, number: u32) -> Result<Keccak> {
        let touched = std::mem::take(&mut self.touched);
        let root = {
            let mut overlay = OverlayStore {
                writes: &mut self.writes,
                cleared: &self.cleared,
                ancestors: &self.ancestors,
                base: &self.base,
            };
            merkle::pre_commit(&mut overlay, &touched)?
        };

        let data = Arc::new(BlockData {
            number,
            parent_root: self.parent_root,
            root,
            writes: std::mem::take(&mut self.writes),
            cleared: std::mem::take(&mut self.cleared),
        });

        let mut st = self.shared.lock_state()?;
        if st.shutdown || st.failed {
            return Err(anyhow!("blockchain no longer accepts blocks"));
        }
        st.by_root.insert(root, data);
        st.pending_count += 1;
        drop(st);

        record_block_committed();
        Ok(root)
    }
}

/// TrieStore поверх оверлея блока: merkle-записи pre-commit'а ложатся в
/// write-set, чтение падает сквозь предков до базового снапшота.
struct OverlayStore<'a> {
    writes: &'a mut BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared: &'a HashSet<Keccak>,
    ancestors: &'a [Arc<BlockData>],
    base: &'a ReadOnlyBatch,
}

impl TrieStore for OverlayStore<'_> {
    fn get_raw(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.writes.get(key) {
            return Ok(v.clone());
        }
        if cleared_covers(key, self.cleared) {
            return Ok(None);
        }
        for ancestor in self.ancestors {
            if let Some(v) = ancestor.writes.get(key) {
                return Ok(v.clone());
            }
            if cleared_covers(key, &ancestor.cleared) {
                return Ok(None);
            }
        }
        self.base.get_raw(key)
    }

    fn set_raw(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete_raw(&mut self, key: &[u8]) -> Result<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }
}
