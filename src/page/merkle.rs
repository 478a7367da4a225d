//! merkle — merkle-плоскость: StateRootPage, FanOutPage, LeafPage.
//!
//! StateRootPage фан-аутится на 256 по двум первым ниблам пути; записи
//! короче двух ниблов живут во встроенной карте. FanOutPage несёт 16
//! бакетов и slotted-кэш, поглощающий записи без немедленной аллокации
//! детей: при переполнении сначала try_flush_down_to_existing (слив в уже
//! существующих детей), затем flush_down_to_the_biggest_new_child
//! (материализация самого частого нибла новой LeafPage). LeafPage —
//! плоская карта остатка поддерева, повышается до FanOutPage при
//! переполнении.
//!
//! Удаления сквозные (write-through): кэш чистится, существующий ребёнок
//! получает удаление сразу, поэтому пустые значения в кэше не живут.

use anyhow::{anyhow, Result};

use crate::consts::*;
use crate::db::batch::Batch;
use crate::db::{PageSource, PageView};
use crate::nibble::NibblePath;
use crate::page::{self, DbAddress, Page, PageType};
use crate::slotted::*;

#[inline]
fn cache(page: &Page) -> &[u8] {
    &page.as_bytes()[FAN_OUT_OFF_MAP..]
}

#[inline]
fn cache_mut(page: &mut Page) -> &mut [u8] {
    &mut page.as_bytes_mut()[FAN_OUT_OFF_MAP..]
}

#[inline]
fn fan_bucket(page: &Page, i: usize) -> DbAddress {
    page::read_address(page.as_bytes(), FAN_OUT_OFF_BUCKETS + i * 4)
}

#[inline]
fn set_fan_bucket(page: &mut Page, i: usize, addr: DbAddress) {
    page::write_address(page.as_bytes_mut(), FAN_OUT_OFF_BUCKETS + i * 4, addr);
}

#[inline]
fn root_slot(page: &Page, idx: usize) -> DbAddress {
    page::read_address(page.as_bytes(), STATE_ROOT_OFF_FANOUT + idx * 4)
}

#[inline]
fn set_root_slot(page: &mut Page, idx: usize, addr: DbAddress) {
    page::write_address(page.as_bytes_mut(), STATE_ROOT_OFF_FANOUT + idx * 4, addr);
}

/// Чтение из merkle-плоскости. addr не должен быть NULL.
pub fn merkle_get<S: PageSource>(
    src: &S,
    addr: DbAddress,
    path: &NibblePath<'_>,
) -> Result<Option<Vec<u8>>> {
    let view: PageView<'_> = src.view(addr)?;
    let raw = view.as_ref();
    match page::page_type_of(raw)? {
        PageType::StateRoot => {
            if path.len() >= 2 {
                let idx = path.get_at(0) as usize * 16 + path.get_at(1) as usize;
                let child = page::read_address(raw, STATE_ROOT_OFF_FANOUT + idx * 4);
                if child.is_null() {
                    return Ok(None);
                }
                let rest = path.slice_from(2);
                return merkle_get(src, child, &rest);
            }
            Ok(slotted_get(&raw[STATE_ROOT_OFF_MAP..], &path.encode()).map(|v| v.to_vec()))
        }
        PageType::FanOut => {
            if let Some(v) = slotted_get(&raw[FAN_OUT_OFF_MAP..], &path.encode()) {
                return Ok(Some(v.to_vec()));
            }
            if !path.is_empty() {
                let child =
                    page::read_address(raw, FAN_OUT_OFF_BUCKETS + path.first_nibble() as usize * 4);
                if !child.is_null() {
                    let rest = path.slice_from(1);
                    return merkle_get(src, child, &rest);
                }
            }
            Ok(None)
        }
        PageType::Leaf => {
            Ok(slotted_get(&raw[LEAF_OFF_MAP..], &path.encode()).map(|v| v.to_vec()))
        }
        other => Err(anyhow!("merkle plane read hit a {:?} page at {}", other, addr)),
    }
}

/// Запись в merkle-плоскость от корня. Пустое значение = удаление.
/// NULL-корень создаёт StateRootPage.
pub fn merkle_root_set(
    batch: &mut Batch,
    addr: DbAddress,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<DbAddress> {
    if addr.is_null() && value.is_empty() {
        return Ok(addr);
    }
    let mut addr = addr;
    batch.ensure_writable_exists(&mut addr, PageType::StateRoot, 0)?;
    let mut page = batch.take_writable(addr)?;
    let res = (|| -> Result<()> {
        if path.len() >= 2 {
            let idx = path.get_at(0) as usize * 16 + path.get_at(1) as usize;
            let child = root_slot(&page, idx);
            let rest = path.slice_from(2);
            let new_child = child_set(batch, child, 2, &rest, value)?;
            set_root_slot(&mut page, idx, new_child);
            return Ok(());
        }
        let key = path.encode();
        let region = &mut page.as_bytes_mut()[STATE_ROOT_OFF_MAP..];
        if value.is_empty() {
            slotted_delete(region, &key);
            return Ok(());
        }
        if slotted_set(region, &key, value) {
            return Ok(());
        }
        Err(anyhow!("state root page: short-path map overflow"))
    })();
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

/// Запись/удаление внутри поддерева (FanOut/Leaf). NULL-адрес при записи
/// создаёт LeafPage; удаление в NULL — no-op.
fn child_set(
    batch: &mut Batch,
    addr: DbAddress,
    level: u8,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<DbAddress> {
    if addr.is_null() {
        if value.is_empty() {
            return Ok(DbAddress::NULL);
        }
        let addr = batch.get_new_page(PageType::Leaf, level)?;
        let mut page = batch.take_writable(addr)?;
        let ok = slotted_set(&mut page.as_bytes_mut()[LEAF_OFF_MAP..], &path.encode(), value);
        batch.put_page(addr, page);
        if !ok {
            return Err(anyhow!("fresh leaf page cannot hold a single entry"));
        }
        return Ok(addr);
    }

    let addr = batch.ensure_writable(addr)?;
    let mut page = batch.take_writable(addr)?;
    let res = match page.page_type()? {
        PageType::Leaf => leaf_set(batch, &mut page, path, value),
        PageType::FanOut => fan_out_set(batch, &mut page, path, value),
        other => Err(anyhow!("merkle plane write hit a {:?} page at {}", other, addr)),
    };
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

fn leaf_set(batch: &mut Batch, page: &mut Page, path: &NibblePath<'_>, value: &[u8]) -> Result<()> {
    let key = path.encode();
    let region = &mut page.as_bytes_mut()[LEAF_OFF_MAP..];
    if value.is_empty() {
        slotted_delete(region, &key);
        return Ok(());
    }
    if slotted_set(region, &key, value) {
        return Ok(());
    }
    promote_leaf(batch, page)?;
    fan_out_set(batch, page, path, value)
}

/// Повышение LeafPage до FanOutPage на месте: записи уходят в кэш и при
/// необходимости сразу стекают в новых детей.
fn promote_leaf(batch: &mut Batch, page: &mut Page) -> Result<()> {
    let level = page.level();
    let entries = slotted_enumerate(&page.as_bytes()[LEAF_OFF_MAP..]);
    page::init_typed(page, PageType::FanOut, level, batch.batch_id());
    for (k, v) in entries {
        let path = NibblePath::from_encoded(&k)?;
        fan_out_set(batch, page, &path, &v)?;
    }
    Ok(())
}

fn fan_out_set(
    batch: &mut Batch,
    page: &mut Page,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<()> {
    let key = path.encode();

    if value.is_empty() {
        slotted_delete(cache_mut(page), &key);
        if !path.is_empty() {
            let nib = path.first_nibble() as usize;
            let child = fan_bucket(page, nib);
            if !child.is_null() {
                let level = page.level();
                let rest = path.slice_from(1);
                let new_child = child_set(batch, child, level + 1, &rest, b"")?;
                set_fan_bucket(page, nib, new_child);
            }
        }
        return Ok(());
    }

    let mut spills = 0usize;
    loop {
        if slotted_set(cache_mut(page), &key, value) {
            return Ok(());
        }
        if try_flush_down_to_existing(batch, page)? {
            spills += 1;
        } else {
            flush_down_to_the_biggest_new_child(batch, page)?;
            spills += 1;
        }
        if spills > FAN_OUT_BUCKETS * 2 {
            return Err(anyhow!("fan-out page overflow: entry does not fit after flush-down"));
        }
    }
}

/// Слить вниз записи кэша, чей нибл уже имеет дочернюю страницу.
fn try_flush_down_to_existing(batch: &mut Batch, page: &mut Page) -> Result<bool> {
    let entries = slotted_enumerate(cache(page));
    let mut moved = false;
    for (k, v) in entries {
        let path = NibblePath::from_encoded(&k)?;
        if path.is_empty() {
            continue;
        }
        let nib = path.first_nibble() as usize;
        let child = fan_bucket(page, nib);
        if child.is_null() {
            continue;
        }
        let level = page.level();
        let rest = path.slice_from(1);
        let new_child = child_set(batch, child, level + 1, &rest, &v)?;
        set_fan_bucket(page, nib, new_child);
        slotted_delete(cache_mut(page), &k);
        moved = true;
    }
    if moved {
        slotted_compact(cache_mut(page));
    }
    Ok(moved)
}

/// Материализовать самый тяжёлый из не-материализованных ниблов кэша
/// новой LeafPage и слить его записи вниз.
fn flush_down_to_the_biggest_new_child(batch: &mut Batch, page: &mut Page) -> Result<()> {
    let sizes = slotted_bucket_sizes(cache(page));
    let mut best: Option<(usize, usize)> = None;
    for (i, size) in sizes.iter().enumerate() {
        if *size == 0 || !fan_bucket(page, i).is_null() {
            continue;
        }
        let better = match best {
            None => true,
            Some((_, bs)) => *size > bs,
        };
        if better {
            best = Some((i, *size));
        }
    }
    let (nib, _) = best.ok_or_else(|| anyhow!("fan-out page cannot spill: no movable bucket"))?;

    let level = page.level();
    let child_addr = batch.get_new_page(PageType::Leaf, level + 1)?;
    let mut child = batch.take_writable(child_addr)?;
    let res = (|| -> Result<()> {
        for (k, v) in slotted_enumerate(cache(page)) {
            let path = NibblePath::from_encoded(&k)?;
            if path.is_empty() || path.first_nibble() as usize != nib {
                continue;
            }
            let short = path.slice_from(1).encode();
            if !slotted_set(&mut child.as_bytes_mut()[LEAF_OFF_MAP..], &short, &v) {
                return Err(anyhow!("flush down: fresh leaf overflow"));
            }
            slotted_delete(cache_mut(page), &k);
        }
        Ok(())
    })();
    batch.put_page(child_addr, child);
    res?;
    set_fan_bucket(page, nib, child_addr);
    slotted_compact(cache_mut(page));
    Ok(())
}

/// Удаление по префиксу (очистка storage-трие аккаунта).
pub fn merkle_root_delete_by_prefix(
    batch: &mut Batch,
    addr: DbAddress,
    prefix: &NibblePath<'_>,
) -> Result<DbAddress> {
    if addr.is_null() {
        return Ok(addr);
    }
    let addr = batch.ensure_writable(addr)?;
    let mut page = batch.take_writable(addr)?;
    let res = (|| -> Result<()> {
        if prefix.len() >= 2 {
            let idx = prefix.get_at(0) as usize * 16 + prefix.get_at(1) as usize;
            let child = root_slot(&page, idx);
            if !child.is_null() {
                let rest = prefix.slice_from(2);
                let new_child = child_delete_by_prefix(batch, child, &rest)?;
                set_root_slot(&mut page, idx, new_child);
            }
            return Ok(());
        }
        // короткий префикс: встроенная карта + все подпадающие слоты фан-аута
        slotted_delete_by_prefix(&mut page.as_bytes_mut()[STATE_ROOT_OFF_MAP..], prefix);
        let (lo, hi) = if prefix.is_empty() {
            (0usize, STATE_ROOT_FANOUT)
        } else {
            let n = prefix.first_nibble() as usize;
            (n * 16, (n + 1) * 16)
        };
        for idx in lo..hi {
            let child = root_slot(&page, idx);
            if !child.is_null() {
                batch.free_subtree(child)?;
                set_root_slot(&mut page, idx, DbAddress::NULL);
            }
        }
        Ok(())
    })();
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

fn child_delete_by_prefix(
    batch: &mut Batch,
    addr: DbAddress,
    prefix: &NibblePath<'_>,
) -> Result<DbAddress> {
    let addr = batch.ensure_writable(addr)?;
    let mut page = batch.take_writable(addr)?;
    let res = (|| -> Result<()> {
        match page.page_type()? {
            PageType::Leaf => {
                slotted_delete_by_prefix(&mut page.as_bytes_mut()[LEAF_OFF_MAP..], prefix);
                Ok(())
            }
            PageType::FanOut => {
                slotted_delete_by_prefix(cache_mut(&mut page), prefix);
                if prefix.is_empty() {
                    for i in 0..FAN_OUT_BUCKETS {
                        let child = fan_bucket(&page, i);
                        if !child.is_null() {
                            batch.free_subtree(child)?;
                            set_fan_bucket(&mut page, i, DbAddress::NULL);
                        }
                    }
                    return Ok(());
                }
                let nib = prefix.first_nibble() as usize;
                let child = fan_bucket(&page, nib);
                if !child.is_null() {
                    let rest = prefix.slice_from(1);
                    let new_child = child_delete_by_prefix(batch, child, &rest)?;
                    set_fan_bucket(&mut page, nib, new_child);
                }
                Ok(())
            }
            other => Err(anyhow!("merkle plane prefix delete hit a {:?} page at {}", other, addr)),
        }
    })();
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}
