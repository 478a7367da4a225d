//! db/read — RO-батчи и источники страниц для read-path.
//!
//! ReadOnlyBatch держит копию корневой страницы, снятую в момент открытия:
//! снапшот стабилен до Drop независимо от активности writer'а. Пока
//! читатель жив, его batch_id опускает min_reusable_batch_id write-батчей,
//! и ни одна видимая ему страница не будет переиспользована.

use anyhow::Result;
use std::sync::Arc;

use crate::data::{u256_from_trimmed_be, Account, Keccak, U256};
use crate::error::StoreError;
use crate::key;
use crate::nibble::{pack_nibbles, NibblePath};
use crate::page::root::RootPage;
use crate::page::{data, merkle, DbAddress, Page};
use crate::pager::PageManager;

use super::DbInner;

/// Страница для чтения: срез арены или собственная копия.
pub enum PageView<'a> {
    Borrowed(&'a [u8]),
    Owned(Page),
}

impl PageView<'_> {
    #[inline]
    pub fn as_ref(&self) -> &[u8] {
        match self {
            PageView::Borrowed(raw) => raw,
            PageView::Owned(page) => page.as_bytes(),
        }
    }
}

/// Абстракция источника страниц: арена напрямую либо write-батч
/// (dirty-страницы поверх арены).
pub trait PageSource {
    fn view(&self, addr: DbAddress) -> Result<PageView<'_>>;
}

pub struct ArenaSource<'a> {
    pm: &'a PageManager,
}

impl<'a> ArenaSource<'a> {
    pub fn new(pm: &'a PageManager) -> Self {
        ArenaSource { pm }
    }
}

impl PageSource for ArenaSource<'_> {
    fn view(&self, addr: DbAddress) -> Result<PageView<'_>> {
        Ok(PageView::Borrowed(self.pm.page(addr)?))
    }
}

pub struct ReadOnlyBatch {
    inner: Arc<DbInner>,
    root: RootPage,
    reader_id: u64,
    name: String,
    disposed: bool,
}

impl ReadOnlyBatch {
    pub(crate) fn new_internal(
        inner: Arc<DbInner>,
        root: RootPage,
        reader_id: u64,
        name: String,
    ) -> ReadOnlyBatch {
        ReadOnlyBatch { inner, root, reader_id, name, disposed: false }
    }

    #[inline]
    fn check_alive(&self) -> Result<()> {
        if self.disposed {
            return Err(StoreError::UseAfterDispose.into());
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_id(&self) -> u32 {
        self.root.batch_id()
    }

    pub fn block_number(&self) -> u32 {
        self.root.block_number()
    }

    pub fn state_root(&self) -> Keccak {
        self.root.state_root()
    }

    /// Сырой lookup по нибловому ключу (с типовым ниблом, см. key.rs).
    pub(crate) fn get_raw(&self, key_nibbles: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_alive()?;
        let packed = pack_nibbles(key_nibbles);
        let path = NibblePath::new(&packed, 0, key_nibbles.len());
        let pm = self.inner.lock_pm()?;
        let src = ArenaSource::new(&pm);
        let is_merkle = key_nibbles.first().map_or(false, |&n| n >= 3);
        let root_addr = if is_merkle { self.root.merkle_page() } else { self.root.data_page() };
        if root_addr.is_null() {
            return Ok(None);
        }
        if is_merkle {
            merkle::merkle_get(&src, root_addr, &path)
        } else {
            data::data_get(&src, root_addr, &path)
        }
    }

    pub fn get_account(&self, account: &Keccak) -> Result<Account> {
        match self.get_raw(&key::account_key(account))? {
            Some(raw) => Account::read_from(&raw),
            None => Ok(Account::EMPTY),
        }
    }

    pub fn get_storage(&self, account: &Keccak, slot: &Keccak) -> Result<U256> {
        match self.get_raw(&key::storage_cell_key(account, slot))? {
            Some(raw) => u256_from_trimmed_be(&raw),
            None => Ok(U256::zero()),
        }
    }

    /// Снять защиту снапшота явно (идемпотентно; Drop делает то же).
    pub fn dispose(&mut self) {
        if !self.disposed {
            self.inner.unregister_reader(self.reader_id);
            self.disposed = true;
        }
    }
}

impl Drop for ReadOnlyBatch {
    fn drop(&mut self) {
        self.dispose();
    }
}
