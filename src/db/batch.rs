//! db/batch — транзакция записи поверх PagedDb.
//!
//! BatchContext: выдаёт новые страницы (пул переиспользования, затем bump
//! next_free_page), делает CoW при мутации чужих страниц, копит очередь
//! abandoned-адресов. Грязные страницы живут в собственной таблице
//! addr → Page и попадают в арену только на коммите — читатели никогда не
//! видят промежуточное состояние батча.
//!
//! Инварианты:
//! - страница с batch_id текущего батча не регистрируется на
//!   переиспользование внутри него (release_page возвращает её в пул);
//! - каждая мутированная страница несёт batch_id текущего батча;
//! - адреса новых страниц не пересекаются с прочитанными.
//!
//! commit(): merkle pre-commit → abandoned-цепочки → запись страниц
//! (сортированные msync-диапазоны) → корень в слот кольца batch_id mod
//! history_depth → публикация нового текущего корня.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::cache::CacheBudget;
use crate::data::{u256_from_trimmed_be, u256_to_trimmed_be, Account, Keccak, U256};
use crate::error::StoreError;
use crate::key;
use crate::merkle::{self, Touched, TrieStore};
use crate::metrics::{
    record_batch_commit, record_cow_copy, record_page_allocated, record_page_reused,
    record_pages_abandoned,
};
use crate::nibble::{pack_nibbles, NibblePath};
use crate::page::root::RootPage;
use crate::page::{abandoned, data, merkle as merkle_pages, DbAddress, Page, PageType};
use crate::pager::CommitOptions;

use super::read::{PageSource, PageView, ReadOnlyBatch};
use super::DbInner;

pub struct Batch {
    inner: Arc<DbInner>,
    batch_id: u32,
    root: RootPage,
    dirty: HashMap<u32, Page>,
    reuse_pool: VecDeque<DbAddress>,
    abandoned: Vec<DbAddress>,
    touched: Touched,
    cache: CacheBudget,
    block_number: Option<u32>,
    finished: bool,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("batch_id", &self.batch_id)
            .field("block_number", &self.block_number)
            .field("finished", &self.finished)
            .finish()
    }
}

impl PageSource for Batch {
    fn view(&self, addr: DbAddress) -> Result<PageView<'_>> {
        if let Some(page) = self.dirty.get(&addr.raw()) {
            return Ok(PageView::Borrowed(page.as_bytes()));
        }
        Ok(PageView::Owned(self.inner.read_page_copy(addr)?))
    }
}

impl Batch {
    pub(crate) fn new_internal(
        inner: Arc<DbInner>,
        batch_id: u32,
        root: RootPage,
        reuse_pool: VecDeque<DbAddress>,
    ) -> Batch {
        let cache_budget = inner.cfg.cache_budget_bytes;
        Batch {
            inner,
            batch_id,
            root,
            dirty: HashMap::new(),
            reuse_pool,
            abandoned: Vec::new(),
            touched: Touched::default(),
            cache: CacheBudget::new(cache_budget),
            block_number: None,
            finished: false,
        }
    }

    #[inline]
    pub fn batch_id(&self) -> u32 {
        self.batch_id
    }

    // ---------------- BatchContext: страницы ----------------

    fn allocate_addr(&mut self) -> Result<DbAddress> {
        if let Some(addr) = self.reuse_pool.pop_front() {
            record_page_reused();
            return Ok(addr);
        }
        let next = self.root.next_free_page();
        let max = self.inner.lock_pm()?.max_page();
        if next >= max {
            return Err(StoreError::OutOfSpace.into());
        }
        self.root.set_next_free_page(next + 1);
        record_page_allocated();
        Ok(DbAddress::new(next))
    }

    /// Новая чистая страница данного типа, сразу в dirty-таблице.
    pub(crate) fn get_new_page(&mut self, ty: PageType, level: u8) -> Result<DbAddress> {
        let addr = self.allocate_addr()?;
        let mut page = Page::zeroed();
        crate::page::init_typed(&mut page, ty, level, self.batch_id);
        self.dirty.insert(addr.raw(), page);
        Ok(addr)
    }

    /// CoW: страница этого батча возвращается как есть; чужая копируется
    /// под новый адрес, старый уходит в abandoned-очередь.
    pub(crate) fn ensure_writable(&mut self, addr: DbAddress) -> Result<DbAddress> {
        if addr.is_null() {
            return Err(anyhow!("ensure_writable on a NULL address"));
        }
        if self.dirty.contains_key(&addr.raw()) {
            return Ok(addr);
        }
        let mut page = self.inner.read_page_copy(addr)?;
        let new_addr = self.allocate_addr()?;
        page.set_batch_id(self.batch_id);
        self.dirty.insert(new_addr.raw(), page);
        self.register_for_future_reuse(addr);
        record_cow_copy();
        Ok(new_addr)
    }

    /// NULL — выделить и инициализировать; иначе — CoW.
    pub(crate) fn ensure_writable_exists(
        &mut self,
        addr: &mut DbAddress,
        ty: PageType,
        level: u8,
    ) -> Result<()> {
        *addr = if addr.is_null() {
            self.get_new_page(ty, level)?
        } else {
            self.ensure_writable(*addr)?
        };
        Ok(())
    }

    /// Забрать страницу на мутацию (обязана быть writable в этом батче).
    pub(crate) fn take_writable(&mut self, addr: DbAddress) -> Result<Page> {
        self.dirty
            .remove(&addr.raw())
            .ok_or_else(|| anyhow!("page {} is not writable in this batch", addr))
    }

    pub(crate) fn put_page(&mut self, addr: DbAddress, page: Page) {
        self.dirty.insert(addr.raw(), page);
    }

    pub(crate) fn register_for_future_reuse(&mut self, addr: DbAddress) {
        self.abandoned.push(addr);
    }

    #[allow(dead_code)]
    pub(crate) fn was_written(&self, addr: DbAddress) -> bool {
        self.dirty.contains_key(&addr.raw())
    }

    /// Освободить страницу: своя (dirty) сразу возвращается в пул,
    /// чужая — в abandoned-очередь с карантином истории.
    pub(crate) fn release_page(&mut self, addr: DbAddress) {
        if self.dirty.remove(&addr.raw()).is_some() {
            self.reuse_pool.push_back(addr);
        } else {
            self.register_for_future_reuse(addr);
        }
    }

    /// Рекурсивно освободить поддерево страниц.
    pub(crate) fn free_subtree(&mut self, addr: DbAddress) -> Result<()> {
        let children = {
            let view = self.view(addr)?;
            crate::page::child_addresses(view.as_ref())?
        };
        for child in children {
            self.free_subtree(child)?;
        }
        self.release_page(addr);
        Ok(())
    }

    // ---------------- сырые KV-операции ----------------

    fn raw_get(&mut self, key_nibbles: &[u8]) -> Result<Option<Vec<u8>>> {
        let is_merkle = key_nibbles.first().map_or(false, |&n| n >= 3);
        if is_merkle {
            if let Some(cached) = self.cache.get(key_nibbles) {
                return Ok(cached);
            }
        }
        let packed = pack_nibbles(key_nibbles);
        let path = NibblePath::new(&packed, 0, key_nibbles.len());
        let root_addr = if is_merkle { self.root.merkle_page() } else { self.root.data_page() };
        let found = if root_addr.is_null() {
            None
        } else if is_merkle {
            merkle_pages::merkle_get(&*self, root_addr, &path)?
        } else {
            data::data_get(&*self, root_addr, &path)?
        };
        if is_merkle {
            self.cache.put(key_nibbles, found.as_deref());
        }
        Ok(found)
    }

    fn raw_set(&mut self, key_nibbles: &[u8], value: &[u8]) -> Result<()> {
        let packed = pack_nibbles(key_nibbles);
        let path = NibblePath::new(&packed, 0, key_nibbles.len());
        let is_merkle = key_nibbles.first().map_or(false, |&n| n >= 3);
        if is_merkle {
            let root_addr = self.root.merkle_page();
            let new_root = merkle_pages::merkle_root_set(self, root_addr, &path, value)?;
            self.root.set_merkle_page(new_root);
            self.cache.put(key_nibbles, Some(value));
        } else {
            let root_addr = self.root.data_page();
            let new_root = data::data_set(self, root_addr, 0, &path, value)?;
            self.root.set_data_page(new_root);
        }
        Ok(())
    }

    fn raw_delete(&mut self, key_nibbles: &[u8]) -> Result<()> {
        let is_merkle = key_nibbles.first().map_or(false, |&n| n >= 3);
        if is_merkle {
            let packed = pack_nibbles(key_nibbles);
            let path = NibblePath::new(&packed, 0, key_nibbles.len());
            let root_addr = self.root.merkle_page();
            let new_root = merkle_pages::merkle_root_set(self, root_addr, &path, b"")?;
            self.root.set_merkle_page(new_root);
            self.cache.put(key_nibbles, None);
            return Ok(());
        }
        // data-плоскость: CoW-спуск только при реально существующем ключе
        if self.raw_get(key_nibbles)?.is_none() {
            return Ok(());
        }
        let packed = pack_nibbles(key_nibbles);
        let path = NibblePath::new(&packed, 0, key_nibbles.len());
        let root_addr = self.root.data_page();
        let new_root = data::data_delete(self, root_addr, &path)?;
        self.root.set_data_page(new_root);
        Ok(())
    }

    // ---------------- публичный IBatch API ----------------

    pub fn get_account(&mut self, account: &Keccak) -> Result<Account> {
        match self.raw_get(&key::account_key(account))? {
            Some(raw) => Account::read_from(&raw),
            None => Ok(Account::EMPTY),
        }
    }

    pub fn set_account(&mut self, account: &Keccak, value: &Account) -> Result<()> {
        if value.is_empty() {
            return self.delete_account(account);
        }
        self.raw_set(&key::account_key(account), &value.encode())?;
        self.touched.accounts.insert(*account);
        Ok(())
    }

    pub fn delete_account(&mut self, account: &Keccak) -> Result<()> {
        self.delete_storage_by_prefix(account)?;
        self.raw_delete(&key::account_key(account))?;
        self.touched.accounts.insert(*account);
        Ok(())
    }

    pub fn get_storage(&mut self, account: &Keccak, slot: &Keccak) -> Result<U256> {
        match self.raw_get(&key::storage_cell_key(account, slot))? {
            Some(raw) => u256_from_trimmed_be(&raw),
            None => Ok(U256::zero()),
        }
    }

    /// Нулевое значение удаляет ячейку.
    pub fn set_storage(&mut self, account: &Keccak, slot: &Keccak, value: &U256) -> Result<()> {
        let cell_key = key::storage_cell_key(account, slot);
        if value.is_zero() {
            self.raw_delete(&cell_key)?;
        } else {
            self.raw_set(&cell_key, &u256_to_trimmed_be(value))?;
        }
        self.touched.storage.entry(*account).or_default().insert(*slot);
        Ok(())
    }

    /// Стереть весь storage аккаунта: ячейки, узлы storage-трие и его корень.
    pub fn delete_storage_by_prefix(&mut self, account: &Keccak) -> Result<()> {
        self.clear_storage_raw(account)?;
        self.touched.cleared_storage.insert(*account);
        Ok(())
    }

    /// Физическая очистка storage без пометки touched (для flusher'а).
    pub(crate) fn clear_storage_raw(&mut self, account: &Keccak) -> Result<()> {
        let cells = key::storage_cell_prefix(account);
        let packed = pack_nibbles(&cells);
        let path = NibblePath::new(&packed, 0, cells.len());
        let data_root = self.root.data_page();
        let new_data = data::data_delete_by_prefix(self, data_root, &path)?;
        self.root.set_data_page(new_data);

        let nodes = key::storage_node_prefix(account);
        let packed = pack_nibbles(&nodes);
        let path = NibblePath::new(&packed, 0, nodes.len());
        let merkle_root = self.root.merkle_page();
        let new_merkle = merkle_pages::merkle_root_delete_by_prefix(self, merkle_root, &path)?;
        self.root.set_merkle_page(new_merkle);
        self.cache.invalidate_prefix(&nodes);

        let root_key = key::storage_tree_root_key(account);
        let packed = pack_nibbles(&root_key);
        let path = NibblePath::new(&packed, 0, root_key.len());
        let merkle_root = self.root.merkle_page();
        let new_merkle = merkle_pages::merkle_root_set(self, merkle_root, &path, b"")?;
        self.root.set_merkle_page(new_merkle);
        self.cache.put(&root_key, None);
        Ok(())
    }

    /// Применить запись из чужого write-set'а (flusher), без touched.
    pub(crate) fn apply_raw(&mut self, key_nibbles: &[u8], value: Option<&[u8]>) -> Result<()> {
        match value {
            Some(v) => self.raw_set(key_nibbles, v),
            None => self.raw_delete(key_nibbles),
        }
    }

    pub fn set_block_number(&mut self, n: u32) {
        self.block_number = Some(n);
    }

    /// RO-снапшот базы, от которой начат этот батч.
    pub fn register_reader(&self, name: &str) -> Result<ReadOnlyBatch> {
        let base = self.inner.current_root()?;
        let reader_id = self.inner.register_reader(base.batch_id())?;
        Ok(ReadOnlyBatch::new_internal(
            Arc::clone(&self.inner),
            base,
            reader_id,
            name.to_string(),
        ))
    }

    // ---------------- коммит ----------------

    /// Merkle pre-commit + запись. Возвращает корень состояния.
    pub fn commit(mut self, opts: CommitOptions) -> Result<Keccak> {
        let touched = std::mem::take(&mut self.touched);
        let root_hash = merkle::pre_commit(&mut self, &touched)?;
        self.finish_commit(root_hash, opts)
    }

    /// Коммит с заранее вычисленным корнем (write-set блока уже содержит
    /// все merkle-записи; повторное хеширование не выполняется).
    pub(crate) fn commit_prehashed(self, root_hash: Keccak, opts: CommitOptions) -> Result<Keccak> {
        self.finish_commit(root_hash, opts)
    }

    fn finish_commit(mut self, root_hash: Keccak, opts: CommitOptions) -> Result<Keccak> {
        self.root.set_state_root(&root_hash);
        if let Some(n) = self.block_number {
            self.root.set_block_number(n);
        }

        self.store_abandoned()?;
        self.root.set_batch_id(self.batch_id);
        self.root.update_crc();

        let pages_written = self.dirty.len() as u64;
        if opts.writes() {
            let mut pm = self.inner.lock_pm_mut()?;
            let mut pages: Vec<(DbAddress, &[u8])> = self
                .dirty
                .iter()
                .map(|(addr, page)| (DbAddress::new(*addr), page.as_bytes()))
                .collect();
            let flush_data = opts.flush_data() && self.inner.cfg.data_fsync;
            pm.write_pages(&mut pages, flush_data)?;

            let slot = DbAddress::new(self.batch_id % self.inner.history_depth);
            pm.write_root_page(slot, self.root.page().as_bytes(), opts.flush_root())?;
            drop(pm);

            self.inner.set_current_root(self.root.page().clone())?;
            log::debug!(
                "committed batch {} (block {}, {} pages, root {:x})",
                self.batch_id,
                self.root.block_number(),
                pages_written,
                root_hash
            );
        } else {
            log::warn!("batch {} committed with DangerNoWrite: effects discarded", self.batch_id);
        }

        record_batch_commit(pages_written);
        self.finished = true;
        self.inner.release_writer();
        Ok(root_hash)
    }

    /// Выложить abandoned-очередь батча в цепочку AbandonedPage и
    /// закрепить голову в свободном слоте корня.
    fn store_abandoned(&mut self) -> Result<()> {
        let mut queue = std::mem::take(&mut self.abandoned);
        // непотраченный остаток пула уже отцеплен от слотов корня —
        // возвращается в оборот новой цепочкой, иначе страницы утекут
        queue.extend(self.reuse_pool.drain(..));
        if queue.is_empty() {
            return Ok(());
        }
        record_pages_abandoned(queue.len() as u64);

        let mut head = DbAddress::NULL;
        let mut tail = DbAddress::NULL;
        for chunk in queue.chunks(crate::consts::ABANDONED_CAPACITY) {
            let addr = self.allocate_addr()?;
            let mut page = Page::zeroed();
            abandoned::abandoned_init(&mut page, self.batch_id, self.batch_id);
            for entry in chunk {
                if !abandoned::try_enqueue(&mut page, *entry) {
                    return Err(anyhow!("abandoned page chunk exceeded its capacity"));
                }
            }
            abandoned::set_next_page(&mut page, head);
            self.dirty.insert(addr.raw(), page);
            if tail.is_null() {
                tail = addr;
            }
            head = addr;
        }

        match self.root.free_abandoned_slot() {
            Some(slot) => self.root.set_abandoned_slot(slot, head),
            None => {
                // слоты исчерпаны долгоживущим читателем: самая старая
                // цепочка подцепляется под хвост новой
                let mut oldest: Option<(u32, usize)> = None;
                for slot in 0..crate::consts::ROOT_ABANDONED_SLOTS {
                    let chain = self.root.abandoned_slot(slot);
                    if chain.is_null() {
                        continue;
                    }
                    let at = {
                        let view = self.view(chain)?;
                        abandoned::abandoned_at(view.as_ref())
                    };
                    if oldest.map_or(true, |(best, _)| at < best) {
                        oldest = Some((at, slot));
                    }
                }
                let (_, slot) =
                    oldest.ok_or_else(|| anyhow!("no abandoned slot available in root page"))?;
                let old_head = self.root.abandoned_slot(slot);
                let mut tail_page = self.take_writable(tail)?;
                abandoned::set_next_page(&mut tail_page, old_head);
                self.put_page(tail, tail_page);
                self.root.set_abandoned_slot(slot, head);
            }
        }
        Ok(())
    }
}

impl TrieStore for Batch {
    fn get_raw(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.raw_get(key)
    }

    fn set_raw(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.raw_set(key, value)
    }

    fn delete_raw(&mut self, key: &[u8]) -> Result<()> {
        self.raw_delete(key)
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if !self.finished {
            // брошенный батч: грязные страницы и bump next_free_page
            // жили только в scratch-копии корня, откат не нужен
            self.inner.release_writer();
        }
    }
}
