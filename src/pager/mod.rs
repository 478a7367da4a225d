//! pager — менеджер арены страниц поверх mmap.
//!
//! Арена — непрерывная область из N страниц по 4 KiB: анонимная память
//! или read-write отображение файла фиксированной длины. Адреса стабильны
//! на всё время жизни процесса.
//!
//! Запись данных батча идёт одним проходом: адреса сортируются и
//! сливаются в msync-диапазоны до WRITE_COALESCE_PAGES подряд — меньше
//! системных вызовов на коммит. Корневая страница пишется отдельным
//! вызовом с опциональным полным fsync.

use anyhow::{anyhow, Context, Result};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;

use crate::consts::{PAGE_SIZE, WRITE_COALESCE_PAGES};
use crate::error::StoreError;
use crate::page::DbAddress;

/// Варианты долговечности коммита.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOptions {
    /// msync страниц данных; корень остаётся без явного fsync.
    FlushDataOnly,
    /// msync данных, затем корня — безопасный вариант по умолчанию.
    FlushDataThenRoot,
    /// Записать страницы без fsync. Потеря долговечности осознанная.
    DangerNoFlush,
    /// Не писать вообще (только для тестов пропускной способности).
    DangerNoWrite,
}

impl CommitOptions {
    #[inline]
    pub fn writes(self) -> bool {
        !matches!(self, CommitOptions::DangerNoWrite)
    }

    #[inline]
    pub fn flush_data(self) -> bool {
        matches!(self, CommitOptions::FlushDataOnly | CommitOptions::FlushDataThenRoot)
    }

    #[inline]
    pub fn flush_root(self) -> bool {
        matches!(self, CommitOptions::FlushDataThenRoot)
    }
}

enum Backing {
    Anon(MmapMut),
    File { _file: std::fs::File, map: MmapMut },
}

impl Backing {
    #[inline]
    fn map(&self) -> &MmapMut {
        match self {
            Backing::Anon(m) => m,
            Backing::File { map, .. } => map,
        }
    }

    #[inline]
    fn map_mut(&mut self) -> &mut MmapMut {
        match self {
            Backing::Anon(m) => m,
            Backing::File { map, .. } => map,
        }
    }

    #[inline]
    fn is_file(&self) -> bool {
        matches!(self, Backing::File { .. })
    }
}

pub struct PageManager {
    backing: Backing,
    max_page: u32,
}

impl PageManager {
    /// Анонимная арена на size_bytes (округляется вниз до целых страниц).
    pub fn anon(size_bytes: usize) -> Result<PageManager> {
        let pages = (size_bytes / PAGE_SIZE).max(2);
        let map = MmapMut::map_anon(pages * PAGE_SIZE).context("map anonymous page arena")?;
        Ok(PageManager { backing: Backing::Anon(map), max_page: pages as u32 })
    }

    /// Файловая арена. Новый файл растягивается до size_bytes; у
    /// существующего длина файла задаёт размер арены. Возвращает
    /// (manager, created).
    pub fn open_file(path: &Path, size_bytes: u64) -> Result<(PageManager, bool)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open arena file {}", path.display()))?;
        let len = file.metadata()?.len();
        let created = len == 0;
        if created {
            let pages = (size_bytes / PAGE_SIZE as u64).max(2);
            file.set_len(pages * PAGE_SIZE as u64)
                .with_context(|| format!("size arena file {}", path.display()))?;
        }
        let len = file.metadata()?.len();
        let pages = (len / PAGE_SIZE as u64) as usize;
        if pages < 2 {
            return Err(anyhow!("arena file {} too small: {} bytes", path.display(), len));
        }
        let map = unsafe { memmap2::MmapOptions::new().len(pages * PAGE_SIZE).map_mut(&file) }
            .with_context(|| format!("mmap arena file {}", path.display()))?;
        Ok((PageManager { backing: Backing::File { _file: file, map }, max_page: pages as u32 }, created))
    }

    #[inline]
    pub fn max_page(&self) -> u32 {
        self.max_page
    }

    #[inline]
    fn check(&self, addr: DbAddress) -> Result<()> {
        if addr.raw() >= self.max_page {
            return Err(StoreError::InvalidAddress(addr.raw()).into());
        }
        Ok(())
    }

    /// Срез страницы по адресу. O(1), без копий.
    pub fn page(&self, addr: DbAddress) -> Result<&[u8]> {
        self.check(addr)?;
        let off = addr.file_offset();
        Ok(&self.backing.map()[off..off + PAGE_SIZE])
    }

    /// Адрес страницы по её смещению в арене (обратная операция к page()).
    pub fn address_of_offset(&self, byte_offset: usize) -> Result<DbAddress> {
        if byte_offset % PAGE_SIZE != 0 {
            return Err(anyhow!("offset {} is not page-aligned", byte_offset));
        }
        let addr = DbAddress::new((byte_offset / PAGE_SIZE) as u32);
        self.check(addr)?;
        Ok(addr)
    }

    /// Скопировать содержимое страницы в арену (без fsync).
    pub fn write_page(&mut self, addr: DbAddress, bytes: &[u8]) -> Result<()> {
        self.check(addr)?;
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let off = addr.file_offset();
        self.backing.map_mut()[off..off + PAGE_SIZE].copy_from_slice(bytes);
        Ok(())
    }

    /// Записать набор страниц; при flush — msync слитыми диапазонами.
    pub fn write_pages(&mut self, pages: &mut Vec<(DbAddress, &[u8])>, flush: bool) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        pages.sort_unstable_by_key(|(a, _)| a.raw());
        for (addr, bytes) in pages.iter() {
            self.write_page(*addr, bytes)?;
        }
        if flush && self.backing.is_file() {
            let addrs: Vec<DbAddress> = pages.iter().map(|(a, _)| *a).collect();
            self.flush_addresses(&addrs)?;
        }
        Ok(())
    }

    /// msync отсортированного списка адресов, сливая подряд идущие
    /// страницы в диапазоны до WRITE_COALESCE_PAGES.
    fn flush_addresses(&self, addrs: &[DbAddress]) -> Result<()> {
        let map = self.backing.map();
        let mut i = 0usize;
        while i < addrs.len() {
            let start = addrs[i].raw();
            let mut end = start + 1;
            let mut j = i + 1;
            while j < addrs.len() && addrs[j].raw() == end && end - start < WRITE_COALESCE_PAGES {
                end += 1;
                j += 1;
            }
            map.flush_range(start as usize * PAGE_SIZE, (end - start) as usize * PAGE_SIZE)
                .context("msync data pages")?;
            crate::metrics::record_flush_range();
            i = j;
        }
        Ok(())
    }

    /// Записать корневую страницу; sync — полный flush отображения после неё.
    pub fn write_root_page(&mut self, addr: DbAddress, bytes: &[u8], sync: bool) -> Result<()> {
        self.write_page(addr, bytes)?;
        if self.backing.is_file() {
            let map = self.backing.map();
            map.flush_range(addr.file_offset(), PAGE_SIZE).context("msync root page")?;
            if sync {
                map.flush().context("fsync arena after root write")?;
            }
        }
        Ok(())
    }

    /// Полный fsync арены; no-op для анонимной памяти.
    pub fn flush(&self) -> Result<()> {
        if self.backing.is_file() {
            self.backing.map().flush().context("fsync arena")?;
        }
        Ok(())
    }

    /// Подсказать ОС подгрузить страницы. Ошибки молча игнорируются.
    pub fn prefetch(&self, addrs: &[DbAddress]) {
        #[cfg(unix)]
        {
            for addr in addrs {
                if addr.raw() >= self.max_page {
                    continue;
                }
                let _ = self
                    .backing
                    .map()
                    .advise_range(memmap2::Advice::WillNeed, addr.file_offset(), PAGE_SIZE);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = addrs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_roundtrip() {
        let mut pm = PageManager::anon(16 * PAGE_SIZE).unwrap();
        assert_eq!(pm.max_page(), 16);

        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        let addr = DbAddress::new(3);
        pm.write_page(addr, &page).unwrap();
        let got = pm.page(addr).unwrap();
        assert_eq!(got[0], 0xAB);
        assert_eq!(got[PAGE_SIZE - 1], 0xCD);
        assert_eq!(pm.address_of_offset(3 * PAGE_SIZE).unwrap(), addr);
    }

    #[test]
    fn out_of_range_is_invalid_address() {
        let pm = PageManager::anon(4 * PAGE_SIZE).unwrap();
        let err = pm.page(DbAddress::new(100)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::InvalidAddress(100))
        ));
    }
}
